//! Metric specifications and the built-in metric functions.

use crate::data::{BatchEvaluation, MetricData, PerReplica};
use crate::distributed::DistributedValueGateway;
use crate::error::{MlpugError, Result};
use crate::logs::{LogTree, LogValue};
use std::fmt;
use std::sync::Arc;

/// Name of the implicit default metric.
pub const LOSS: &str = "loss";

/// Picks the inputs a metric needs from a batch evaluation. `None` means unavailable.
pub type GatherFn = Arc<dyn Fn(&BatchEvaluation) -> Result<Option<MetricData>> + Send + Sync>;
/// Reduces inputs gathered on every device into one per-batch value.
pub type GatherDistributedFn =
    Arc<dyn Fn(&MetricData, &DistributedValueGateway) -> Result<MetricData> + Send + Sync>;
/// Merges per-batch inputs of a window or dataset.
pub type CombineFn = Arc<dyn Fn(Vec<MetricData>) -> Result<MetricData> + Send + Sync>;
/// Turns (combined) inputs into the logged metric value.
pub type ComputeFn = Arc<dyn Fn(&MetricData) -> Result<Option<LogValue>> + Send + Sync>;
/// Releases batch data that is no longer needed after gathering.
pub type CleanUpFn = Arc<dyn Fn(&mut BatchEvaluation) + Send + Sync>;

/// A named metric with its optional pipeline functions.
///
/// Missing functions of the `loss` metric fall back to the built-in loss
/// functions. Other metrics must provide a gather and a compute function, and
/// a gather-distributed function when evaluated on multiple devices. Combine
/// defaults to [`concat_structural`].
#[derive(Clone)]
pub struct MetricSpec {
    pub(crate) name: String,
    pub(crate) gather: Option<GatherFn>,
    pub(crate) gather_distributed: Option<GatherDistributedFn>,
    pub(crate) combine: Option<CombineFn>,
    pub(crate) compute: Option<ComputeFn>,
}

impl fmt::Debug for MetricSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricSpec")
            .field("name", &self.name)
            .field("gather", &self.gather.is_some())
            .field("gather_distributed", &self.gather_distributed.is_some())
            .field("combine", &self.combine.is_some())
            .field("compute", &self.compute.is_some())
            .finish()
    }
}

impl MetricSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gather: None,
            gather_distributed: None,
            combine: None,
            compute: None,
        }
    }

    /// The default loss metric.
    pub fn loss() -> Self {
        Self::new(LOSS)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gather<F>(mut self, func: F) -> Self
    where
        F: Fn(&BatchEvaluation) -> Result<Option<MetricData>> + Send + Sync + 'static,
    {
        self.gather = Some(Arc::new(func));
        self
    }

    pub fn gather_distributed<F>(mut self, func: F) -> Self
    where
        F: Fn(&MetricData, &DistributedValueGateway) -> Result<MetricData> + Send + Sync + 'static,
    {
        self.gather_distributed = Some(Arc::new(func));
        self
    }

    pub fn combine<F>(mut self, func: F) -> Self
    where
        F: Fn(Vec<MetricData>) -> Result<MetricData> + Send + Sync + 'static,
    {
        self.combine = Some(Arc::new(func));
        self
    }

    pub fn compute<F>(mut self, func: F) -> Self
    where
        F: Fn(&MetricData) -> Result<Option<LogValue>> + Send + Sync + 'static,
    {
        self.compute = Some(Arc::new(func));
        self
    }

    /// Fill in defaults and check that every required function is present.
    pub(crate) fn resolve(self, distributed: bool) -> Result<ResolvedMetric> {
        let is_loss = self.name == LOSS;
        let missing = |what: &str| {
            MlpugError::config(format!(
                "metric '{}' has no {what} function and no default is available",
                self.name
            ))
        };

        let gather = match (self.gather.clone(), is_loss) {
            (Some(f), _) => f,
            (None, true) => Arc::new(gather_loss) as GatherFn,
            (None, false) => return Err(missing("gather-inputs")),
        };
        let gather_distributed = match (self.gather_distributed.clone(), is_loss) {
            (Some(f), _) => Some(f),
            (None, true) => Some(Arc::new(gather_distributed_loss) as GatherDistributedFn),
            (None, false) if distributed => return Err(missing("gather-distributed-inputs")),
            (None, false) => None,
        };
        let combine = match (self.combine.clone(), is_loss) {
            (Some(f), _) => f,
            (None, true) => Arc::new(stack) as CombineFn,
            (None, false) => Arc::new(concat_structural) as CombineFn,
        };
        let compute = match (self.compute.clone(), is_loss) {
            (Some(f), _) => f,
            (None, true) => Arc::new(compute_loss) as ComputeFn,
            (None, false) => return Err(missing("compute")),
        };

        Ok(ResolvedMetric {
            name: self.name,
            gather,
            gather_distributed,
            combine,
            compute,
        })
    }
}

/// A metric whose pipeline is complete.
#[derive(Clone)]
pub(crate) struct ResolvedMetric {
    pub(crate) name: String,
    pub(crate) gather: GatherFn,
    pub(crate) gather_distributed: Option<GatherDistributedFn>,
    pub(crate) combine: CombineFn,
    pub(crate) compute: ComputeFn,
}

/// Default loss gathering: `[loss, num_samples]`, per replica when distributed.
pub fn gather_loss(evaluation: &BatchEvaluation) -> Result<Option<MetricData>> {
    let pair = |loss: f64, n: f64| MetricData::Vector(vec![loss, n]);
    let gathered = match (&evaluation.loss, &evaluation.num_samples) {
        (MetricData::Scalar(loss), MetricData::Scalar(n)) => pair(*loss, *n),
        (MetricData::PerReplica(losses), num_samples) => {
            let mut values = Vec::with_capacity(losses.num_replicas());
            for (replica_id, loss) in losses.iter().enumerate() {
                let loss = loss.as_scalar().ok_or_else(|| {
                    MlpugError::compute(LOSS, format!("replica {replica_id} loss is not a scalar"))
                })?;
                let n = match num_samples {
                    MetricData::Scalar(n) => Some(*n),
                    MetricData::PerReplica(ns) => ns.get(replica_id).and_then(MetricData::as_scalar),
                    _ => None,
                }
                .ok_or_else(|| {
                    MlpugError::compute(LOSS, format!("no sample count for replica {replica_id}"))
                })?;
                values.push(pair(loss, n));
            }
            MetricData::PerReplica(PerReplica::new(values))
        }
        _ => {
            return Err(MlpugError::compute(
                LOSS,
                "loss must be a scalar or a per-replica scalar value",
            ));
        }
    };
    Ok(Some(gathered))
}

fn loss_pair(data: &MetricData) -> Result<(f64, f64)> {
    match data.as_vector() {
        Some([loss, n]) => Ok((*loss, *n)),
        _ => Err(MlpugError::compute(LOSS, "expected a [loss, num_samples] pair")),
    }
}

/// Sample-weighted mean of `(loss, num_samples)` pairs, as `[loss, total_samples]`.
fn weighted_loss(pairs: &[(f64, f64)]) -> Option<MetricData> {
    if pairs.is_empty() {
        return None;
    }
    let total: f64 = pairs.iter().map(|(_, n)| n).sum();
    let loss = if total > 0.0 {
        pairs.iter().map(|(l, n)| l * n).sum::<f64>() / total
    } else {
        pairs.iter().map(|(l, _)| l).sum::<f64>() / pairs.len() as f64
    };
    Some(MetricData::Vector(vec![loss, total]))
}

/// Default distributed loss reduction: sample-weighted mean over replicas.
pub fn gather_distributed_loss(
    gathered: &MetricData,
    gateway: &DistributedValueGateway,
) -> Result<MetricData> {
    let pairs = gateway
        .unpack_and_map(
            |parts| parts.first().map(loss_pair).transpose(),
            gathered,
        )?
        .into_iter()
        .filter_map(Result::transpose)
        .collect::<Result<Vec<_>>>()?;
    weighted_loss(&pairs).ok_or_else(|| MlpugError::compute(LOSS, "no replica reported a loss"))
}

/// Stack per-batch inputs into a sequence, keeping every batch separate.
pub fn stack(items: Vec<MetricData>) -> Result<MetricData> {
    Ok(MetricData::Sequence(items))
}

/// Default loss compute: a single pair yields its loss, a stack of pairs
/// yields the sample-weighted mean.
pub fn compute_loss(inputs: &MetricData) -> Result<Option<LogValue>> {
    let pairs = match inputs {
        MetricData::Vector(_) => vec![loss_pair(inputs)?],
        MetricData::Sequence(items) => items.iter().map(loss_pair).collect::<Result<Vec<_>>>()?,
        _ => return Err(MlpugError::compute(LOSS, "unsupported loss inputs")),
    };
    Ok(weighted_loss(&pairs)
        .and_then(|combined| combined.as_vector().map(|v| v[0]))
        .map(LogValue::Scalar))
}

/// Structural concatenation of per-batch (or per-replica) inputs.
///
/// Scalars stack into a vector, vectors are concatenated, and sequences of
/// equal arity are concatenated component-wise.
pub fn concat_structural(items: Vec<MetricData>) -> Result<MetricData> {
    enum Shape {
        Numeric,
        Tuple(usize),
        Replicated,
    }

    let shape = match items.first() {
        None => return Ok(MetricData::Sequence(Vec::new())),
        Some(MetricData::Scalar(_) | MetricData::Vector(_)) => Shape::Numeric,
        Some(MetricData::Sequence(components)) => Shape::Tuple(components.len()),
        Some(MetricData::PerReplica(_)) => Shape::Replicated,
    };

    match shape {
        Shape::Numeric => {
            let mut out = Vec::new();
            for item in &items {
                match item {
                    MetricData::Scalar(v) => out.push(*v),
                    MetricData::Vector(v) => out.extend_from_slice(v),
                    other => {
                        return Err(MlpugError::compute(
                            "combine",
                            format!("can't concatenate a numeric value with {other:?}"),
                        ));
                    }
                }
            }
            Ok(MetricData::Vector(out))
        }
        Shape::Tuple(arity) => {
            let mut columns: Vec<Vec<MetricData>> = vec![Vec::with_capacity(items.len()); arity];
            for item in items {
                match item {
                    MetricData::Sequence(parts) if parts.len() == arity => {
                        for (column, part) in columns.iter_mut().zip(parts) {
                            column.push(part);
                        }
                    }
                    _ => {
                        return Err(MlpugError::compute(
                            "combine",
                            format!("all items must be sequences of {arity} components"),
                        ));
                    }
                }
            }
            Ok(MetricData::Sequence(
                columns.into_iter().map(concat_structural).collect::<Result<_>>()?,
            ))
        }
        Shape::Replicated => Err(MlpugError::compute(
            "combine",
            "per-replica values must be reduced before they are combined",
        )),
    }
}

/// Gather-distributed helper for custom metrics: concatenates the inputs of all replicas.
pub fn concat_replicas(gathered: &MetricData, gateway: &DistributedValueGateway) -> Result<MetricData> {
    let is_tuple = matches!(gathered, MetricData::Sequence(_));
    let per_replica = gateway.unpack_and_map(
        |parts| {
            if is_tuple {
                MetricData::Sequence(parts)
            } else {
                parts.into_iter().next().unwrap_or(MetricData::Sequence(Vec::new()))
            }
        },
        gathered,
    )?;
    concat_structural(per_replica)
}

/// Classification quality from `[labels, predictions]`: accuracy and sample count.
pub fn classification_quality(inputs: &MetricData) -> Result<Option<LogValue>> {
    let (labels, predictions) = match inputs.as_sequence() {
        Some([MetricData::Vector(labels), MetricData::Vector(predictions)]) => (labels, predictions),
        _ => {
            return Err(MlpugError::compute(
                "classification",
                "expected [labels, predictions] vectors",
            ));
        }
    };
    if labels.len() != predictions.len() {
        return Err(MlpugError::compute(
            "classification",
            format!("{} labels but {} predictions", labels.len(), predictions.len()),
        ));
    }
    if labels.is_empty() {
        return Ok(None);
    }

    let correct = labels.iter().zip(predictions).filter(|(l, p)| l == p).count();
    let mut quality = LogTree::new();
    quality.insert("accuracy", correct as f64 / labels.len() as f64);
    quality.insert("num_samples", labels.len());
    Ok(Some(LogValue::Node(quality)))
}

/// Gather function for classification data stored as `labels` and
/// `predictions` auxiliary results.
pub fn gather_classification_data(evaluation: &BatchEvaluation) -> Result<Option<MetricData>> {
    match (evaluation.auxiliary("labels"), evaluation.auxiliary("predictions")) {
        (Some(MetricData::PerReplica(labels)), Some(MetricData::PerReplica(predictions))) => {
            let values = labels
                .iter()
                .zip(predictions.iter())
                .map(|(l, p)| MetricData::Sequence(vec![l.clone(), p.clone()]))
                .collect();
            Ok(Some(MetricData::PerReplica(PerReplica::new(values))))
        }
        (Some(labels), Some(predictions)) => Ok(Some(MetricData::Sequence(vec![
            labels.clone(),
            predictions.clone(),
        ]))),
        _ => Ok(None),
    }
}
