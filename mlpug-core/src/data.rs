//! Dynamic values that flow through metric gathering.
//!
//! The trainer reports its outputs as [`MetricData`]; gather functions pick
//! the parts a metric needs, and the evaluator combines them across devices
//! and batches. Values are serialisable so sliding windows of gathered inputs
//! can be snapshotted into checkpoints.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A value that may be a scalar, a flat vector, a tuple-like sequence, or
/// one component per replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MetricData {
    Scalar(#[serde(with = "non_finite::scalar")] f64),
    Vector(#[serde(with = "non_finite::vector")] Vec<f64>),
    Sequence(Vec<MetricData>),
    PerReplica(PerReplica),
}

impl MetricData {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f64]> {
        match self {
            Self::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[MetricData]> {
        match self {
            Self::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_per_replica(&self) -> Option<&PerReplica> {
        match self {
            Self::PerReplica(values) => Some(values),
            _ => None,
        }
    }

    /// Number of scalar elements, used for batch-size and memory diagnostics.
    pub fn element_count(&self) -> usize {
        match self {
            Self::Scalar(_) => 1,
            Self::Vector(v) => v.len(),
            Self::Sequence(items) => items.iter().map(MetricData::element_count).sum(),
            Self::PerReplica(values) => values.iter().map(MetricData::element_count).sum(),
        }
    }
}

impl From<f64> for MetricData {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

impl From<Vec<f64>> for MetricData {
    fn from(values: Vec<f64>) -> Self {
        Self::Vector(values)
    }
}

/// JSON has no NaN or infinity, so non-finite floats are written as the
/// strings `"NaN"`, `"inf"` and `"-inf"`.
mod non_finite {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    impl From<f64> for Repr {
        fn from(value: f64) -> Self {
            if value.is_nan() {
                Self::Text("NaN".to_string())
            } else if value == f64::INFINITY {
                Self::Text("inf".to_string())
            } else if value == f64::NEG_INFINITY {
                Self::Text("-inf".to_string())
            } else {
                Self::Number(value)
            }
        }
    }

    impl Repr {
        fn into_f64<E: Error>(self) -> Result<f64, E> {
            match self {
                Self::Number(value) => Ok(value),
                Self::Text(text) => match text.as_str() {
                    "NaN" => Ok(f64::NAN),
                    "inf" => Ok(f64::INFINITY),
                    "-inf" => Ok(f64::NEG_INFINITY),
                    other => Err(E::custom(format!("expected a number, \"NaN\", \"inf\" or \"-inf\", got \"{other}\""))),
                },
            }
        }
    }

    pub mod scalar {
        use super::*;

        pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
            Repr::from(*value).serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
            Repr::deserialize(deserializer)?.into_f64()
        }
    }

    pub mod vector {
        use super::*;

        pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_seq(values.iter().map(|v| Repr::from(*v)))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
            Vec::<Repr>::deserialize(deserializer)?
                .into_iter()
                .map(Repr::into_f64)
                .collect()
        }
    }
}

/// One value per replica, in replica order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PerReplica(Vec<MetricData>);

impl PerReplica {
    pub fn new(values: Vec<MetricData>) -> Self {
        Self(values)
    }

    pub fn num_replicas(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, replica_id: usize) -> Option<&MetricData> {
        self.0.get(replica_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricData> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Vec<MetricData> {
        self.0
    }
}

/// What the trainer reports for one batch: the loss, the number of samples it
/// was computed over, and any auxiliary outputs (logits, labels, ...).
///
/// In a multi-device run `loss` and `num_samples` are `PerReplica` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEvaluation {
    pub loss: MetricData,
    pub num_samples: MetricData,
    #[serde(default)]
    pub auxiliary_results: BTreeMap<String, MetricData>,
}

impl BatchEvaluation {
    pub fn new(loss: f64, num_samples: usize) -> Self {
        Self {
            loss: MetricData::Scalar(loss),
            num_samples: MetricData::Scalar(num_samples as f64),
            auxiliary_results: BTreeMap::new(),
        }
    }

    pub fn with_auxiliary(mut self, name: impl Into<String>, value: MetricData) -> Self {
        self.auxiliary_results.insert(name.into(), value);
        self
    }

    pub fn auxiliary(&self, name: &str) -> Option<&MetricData> {
        self.auxiliary_results.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_finite_values_survive_json() {
        let data = MetricData::Sequence(vec![
            MetricData::Scalar(f64::NAN),
            MetricData::Vector(vec![f64::INFINITY, 2.5, f64::NEG_INFINITY]),
        ]);
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["value"][0]["value"], "NaN");
        assert_eq!(json["value"][1]["value"][0], "inf");

        let restored: MetricData = serde_json::from_value(json).unwrap();
        let items = restored.as_sequence().unwrap();
        assert!(items[0].as_scalar().unwrap().is_nan());
        assert_eq!(items[1].as_vector().unwrap(), &[f64::INFINITY, 2.5, f64::NEG_INFINITY]);
    }

    #[test]
    fn test_unknown_float_text_is_rejected() {
        let json = serde_json::json!({ "kind": "scalar", "value": "lots" });
        assert!(serde_json::from_value::<MetricData>(json).is_err());
    }

    #[test]
    fn test_element_count_recurses() {
        let data = MetricData::Sequence(vec![
            MetricData::Vector(vec![1.0, 2.0, 3.0]),
            MetricData::PerReplica(PerReplica::new(vec![1.0.into(), 2.0.into()])),
        ]);
        assert_eq!(data.element_count(), 5);
    }

    #[test]
    fn test_metric_data_serde_is_tagged() {
        let data = MetricData::Vector(vec![0.5]);
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "vector", "value": [0.5]}));
    }

    #[test]
    fn test_batch_evaluation_auxiliary() {
        let eval = BatchEvaluation::new(0.4, 32).with_auxiliary("labels", vec![1.0, 0.0].into());
        assert_eq!(eval.auxiliary("labels"), Some(&MetricData::Vector(vec![1.0, 0.0])));
        assert_eq!(eval.num_samples.as_scalar(), Some(32.0));
    }
}
