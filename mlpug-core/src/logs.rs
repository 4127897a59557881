//! Nested metrics log — the hierarchical store shared by all callbacks of a run.
//!
//! Values are addressed with dot-separated key paths such as
//! `current.validation.dataset.loss`. Lookups never fail loudly: a missing
//! segment yields the supplied default. Writes create missing intermediate
//! nodes and only fail when the path runs through a value that is not a node.

use crate::error::{MlpugError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key of the `LogsBase` subtree.
pub const CURRENT: &str = "current";
/// Key of the training parameter subtree inside `current`.
pub const TRAINING_PARAMS: &str = "training_params";
/// Keys that hold side information and are never reported as metrics.
pub const NON_METRIC_KEYS: [&str; 2] = ["auxiliary_results", "duration"];

/// A single value in the log tree.
///
/// `Pair` holds a display value plus opaque auxiliary data. Only the first
/// element takes part in comparisons and checkpoint decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogValue {
    Scalar(f64),
    Pair(f64, serde_json::Value),
    Node(LogTree),
}

impl LogValue {
    /// The numeric value, using the first element of a pair.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) | Self::Pair(v, _) => Some(*v),
            Self::Node(_) => None,
        }
    }

    /// The value as a non-negative counter.
    pub fn as_count(&self) -> Option<u64> {
        self.as_f64()
            .filter(|v| *v >= 0.0 && v.fract() == 0.0)
            .map(|v| v as u64)
    }

    pub fn as_node(&self) -> Option<&LogTree> {
        match self {
            Self::Node(tree) => Some(tree),
            _ => None,
        }
    }

    pub fn as_node_mut(&mut self) -> Option<&mut LogTree> {
        match self {
            Self::Node(tree) => Some(tree),
            _ => None,
        }
    }

    /// Short name of the variant, used when describing the log structure.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::Pair(..) => "pair",
            Self::Node(_) => "node",
        }
    }
}

impl From<f64> for LogValue {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

impl From<usize> for LogValue {
    fn from(value: usize) -> Self {
        Self::Scalar(value as f64)
    }
}

impl From<u64> for LogValue {
    fn from(value: u64) -> Self {
        Self::Scalar(value as f64)
    }
}

impl From<LogTree> for LogValue {
    fn from(tree: LogTree) -> Self {
        Self::Node(tree)
    }
}

/// Mapping from stable string keys to log values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogTree(BTreeMap<String, LogValue>);

impl LogTree {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Create the log tree for a new run, with an initialised `current` subtree.
    pub fn for_run(final_epoch: usize, final_batch_step: usize) -> Self {
        let mut training_params = LogTree::new();
        for level in [MetricLevel::Batch, MetricLevel::WindowAverage, MetricLevel::Epoch] {
            training_params.insert(level.key(), LogTree::new());
        }

        let mut current = LogTree::new();
        current.insert("epoch", 0usize);
        current.insert("batch_step", 0usize);
        current.insert("global_iter", 0u64);
        current.insert(TRAINING_PARAMS, training_params);

        let mut logs = LogTree::new();
        logs.insert(CURRENT, current);
        logs.insert("final_epoch", final_epoch);
        logs.insert("final_batch_step", final_batch_step);
        logs
    }

    pub fn get(&self, key: &str) -> Option<&LogValue> {
        self.0.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut LogValue> {
        self.0.get_mut(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<LogValue>) -> Option<LogValue> {
        self.0.insert(key.into(), value.into())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LogValue)> {
        self.0.iter()
    }

    /// Resolve a dotted key path without logging on failure.
    pub fn lookup(&self, key_path: &str) -> Option<&LogValue> {
        let mut segments = key_path.split('.');
        let first = segments.next()?;
        let mut value = self.0.get(first)?;
        for key in segments {
            value = value.as_node()?.0.get(key)?;
        }
        Some(value)
    }

    /// Numeric value at `key_path`, if present.
    pub fn number_at(&self, key_path: &str) -> Option<f64> {
        self.lookup(key_path).and_then(LogValue::as_f64)
    }

    /// Subtree at `key_path`, if present and a node.
    pub fn node_at(&self, key_path: &str) -> Option<&LogTree> {
        self.lookup(key_path).and_then(LogValue::as_node)
    }

    /// Assign `value` at `key_path`, creating intermediate nodes as needed.
    pub fn set_path(&mut self, key_path: &str, value: impl Into<LogValue>) -> Result<()> {
        set_in_tree(self, key_path, value.into(), false)
    }

    /// The `current` subtree (LogsBase).
    pub fn current(&self) -> Option<&LogTree> {
        self.node_at(CURRENT)
    }

    /// Flatten all numeric leaves into `(path, value)` pairs, skipping side information.
    pub fn scalars(&self) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        collect_scalars(self, None, &mut out);
        out
    }

    /// Every key path in the tree together with its value kind.
    pub fn describe(&self) -> Vec<(String, &'static str)> {
        let mut out = Vec::new();
        collect_structure(self, None, &mut out);
        out
    }
}

fn join_path(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(p) => format!("{p}.{key}"),
        None => key.to_string(),
    }
}

fn collect_scalars(tree: &LogTree, prefix: Option<&str>, out: &mut Vec<(String, f64)>) {
    for (key, value) in tree.iter() {
        if key == "auxiliary_results" {
            continue;
        }
        let path = join_path(prefix, key);
        match value {
            LogValue::Node(child) => collect_scalars(child, Some(&path), out),
            other => {
                if let Some(v) = other.as_f64() {
                    out.push((path, v));
                }
            }
        }
    }
}

fn collect_structure(tree: &LogTree, prefix: Option<&str>, out: &mut Vec<(String, &'static str)>) {
    for (key, value) in tree.iter() {
        let path = join_path(prefix, key);
        out.push((path.clone(), value.kind()));
        if let LogValue::Node(child) = value {
            collect_structure(child, Some(&path), out);
        }
    }
}

/// Granularity of a logged metric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricLevel {
    Batch,
    WindowAverage,
    Dataset,
    Epoch,
}

impl MetricLevel {
    pub const ALL: [MetricLevel; 4] = [
        MetricLevel::Batch,
        MetricLevel::WindowAverage,
        MetricLevel::Dataset,
        MetricLevel::Epoch,
    ];

    /// Key of this level inside a dataset subtree.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::WindowAverage => "window_average",
            Self::Dataset => "dataset",
            Self::Epoch => "epoch",
        }
    }

    /// Human-readable label used in progress output.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Batch => "Batch",
            Self::WindowAverage => "Moving average",
            Self::Dataset => "Computed over dataset",
            Self::Epoch => "Epoch",
        }
    }
}

/// Safe lookup of a value in nested log data by key path.
///
/// Returns `default` when any segment is missing or the path runs into a
/// non-node value. Never fails.
pub fn get_value_at<'a>(
    key_path: &str,
    nested: &'a LogValue,
    default: Option<&'a LogValue>,
    warn_on_failure: bool,
) -> Option<&'a LogValue> {
    let mut value = nested;
    for key in key_path.split('.') {
        match value.as_node().and_then(|tree| tree.get(key)) {
            Some(next) => value = next,
            None => {
                if warn_on_failure {
                    tracing::warn!(key_path, "Key path not found in given data");
                }
                return default;
            }
        }
    }
    Some(value)
}

/// Safe assignment of a value in nested log data by key path.
///
/// Missing intermediate nodes are created (optionally with a warning). Fails
/// with [`MlpugError::InvalidPath`] when the root, or a value along the path,
/// is not a node.
pub fn set_value_at(
    key_path: &str,
    nested: &mut LogValue,
    value: LogValue,
    warn_on_path_unavailable: bool,
) -> Result<()> {
    match nested {
        LogValue::Node(tree) => set_in_tree(tree, key_path, value, warn_on_path_unavailable),
        other => Err(MlpugError::invalid_path(
            key_path,
            format!("can't get or set keys on a {} value", other.kind()),
        )),
    }
}

fn set_in_tree(
    root: &mut LogTree,
    key_path: &str,
    value: LogValue,
    warn_on_path_unavailable: bool,
) -> Result<()> {
    let (parents, last) = match key_path.rsplit_once('.') {
        Some((parents, last)) => (Some(parents), last),
        None => (None, key_path),
    };

    let mut tree = root;
    let mut base_path = String::new();
    for key in parents.into_iter().flat_map(|p| p.split('.')) {
        if !base_path.is_empty() {
            base_path.push('.');
        }
        base_path.push_str(key);

        let entry = tree.0.entry(key.to_string()).or_insert_with(|| {
            if warn_on_path_unavailable {
                tracing::warn!(path = %base_path, "Key path not available, creating path");
            }
            LogValue::Node(LogTree::new())
        });
        tree = match entry {
            LogValue::Node(child) => child,
            other => {
                return Err(MlpugError::invalid_path(
                    base_path.clone(),
                    format!("can't get or set keys on a {} value", other.kind()),
                ));
            }
        };
    }

    tree.0.insert(last.to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn empty_root() -> LogValue {
        LogValue::Node(LogTree::new())
    }

    #[test]
    fn test_set_then_get_creates_intermediate_nodes() {
        let mut root = empty_root();
        set_value_at("current.validation.dataset.loss", &mut root, 0.25.into(), false).unwrap();

        let value = get_value_at("current.validation.dataset.loss", &root, None, false);
        assert_eq!(value, Some(&LogValue::Scalar(0.25)));
        assert!(get_value_at("current.validation", &root, None, false)
            .and_then(LogValue::as_node)
            .is_some());
    }

    #[test]
    fn test_get_missing_path_returns_default() {
        let root = empty_root();
        let default = LogValue::Scalar(-1.0);
        let value = get_value_at("a.b.c", &root, Some(&default), true);
        assert_eq!(value, Some(&default));
        assert_eq!(get_value_at("a.b.c", &root, None, false), None);
    }

    #[test]
    fn test_get_through_scalar_returns_default() {
        let mut root = empty_root();
        set_value_at("a.b", &mut root, 1.0.into(), false).unwrap();
        assert_eq!(get_value_at("a.b.c", &root, None, false), None);
    }

    #[test]
    fn test_set_on_scalar_root_is_invalid() {
        let mut root = LogValue::Scalar(3.0);
        let err = set_value_at("a", &mut root, 1.0.into(), false).unwrap_err();
        assert!(matches!(err, MlpugError::InvalidPath { .. }));
    }

    #[test]
    fn test_set_through_scalar_is_invalid() {
        let mut root = empty_root();
        set_value_at("a.b", &mut root, 1.0.into(), false).unwrap();
        let err = set_value_at("a.b.c", &mut root, 2.0.into(), true).unwrap_err();
        match err {
            MlpugError::InvalidPath { path, .. } => assert_eq!(path, "a.b"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_overwrite_keeps_siblings() {
        let mut tree = LogTree::new();
        tree.set_path("training.batch.loss", 1.0).unwrap();
        tree.set_path("training.batch.accuracy", 0.5).unwrap();
        tree.set_path("training.batch.loss", 0.8).unwrap();
        assert_eq!(tree.number_at("training.batch.loss"), Some(0.8));
        assert_eq!(tree.number_at("training.batch.accuracy"), Some(0.5));
    }

    #[test]
    fn test_pair_uses_first_element() {
        let value = LogValue::Pair(0.7, serde_json::json!({"extra": [1, 2]}));
        assert_eq!(value.as_f64(), Some(0.7));
    }

    #[test]
    fn test_for_run_layout() {
        let logs = LogTree::for_run(9, 99);
        assert_eq!(logs.number_at("final_epoch"), Some(9.0));
        assert_eq!(logs.number_at("current.batch_step"), Some(0.0));
        assert!(logs.node_at("current.training_params.window_average").is_some());
    }

    #[test]
    fn test_scalars_skip_auxiliary_results() {
        let mut tree = LogTree::new();
        tree.set_path("batch.loss", LogValue::Pair(0.3, serde_json::Value::Null))
            .unwrap();
        tree.set_path("batch.auxiliary_results.logits", 4.0).unwrap();
        tree.set_path("batch.classification.accuracy", 0.9).unwrap();
        assert_eq!(
            tree.scalars(),
            vec![
                ("batch.classification.accuracy".to_string(), 0.9),
                ("batch.loss".to_string(), 0.3),
            ]
        );
    }

    #[test]
    fn test_log_tree_json_shape() {
        let mut tree = LogTree::new();
        tree.set_path("a.loss", 1.5).unwrap();
        tree.set_path("a.pair", LogValue::Pair(2.0, serde_json::json!("aux")))
            .unwrap();
        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json, serde_json::json!({"a": {"loss": 1.5, "pair": [2.0, "aux"]}}));
        let back: LogTree = serde_json::from_value(json).unwrap();
        assert_eq!(back, tree);
    }
}
