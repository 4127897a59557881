//! Metric evaluator — gathers metric inputs per batch, reduces them across
//! devices, combines them across batches and computes the final values.

use super::metric::{CleanUpFn, LOSS, MetricSpec, ResolvedMetric};
use crate::data::{BatchEvaluation, MetricData};
use crate::distributed::DistributedValueGateway;
use crate::error::{MlpugError, Result};
use crate::logs::LogTree;
use crate::trainer::{BatchSource, Trainer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Gathered inputs of one batch (or of a combined window/dataset), per metric.
pub type GatheredInputs = BTreeMap<String, MetricData>;

/// What to evaluate.
pub enum EvaluationSource<'a, B> {
    /// Outputs the trainer already produced for a batch.
    Batch(&'a BatchEvaluation),
    /// Every batch of a dataset, evaluated with the trainer.
    Dataset(&'a dyn BatchSource<B>),
}

/// Computes named metrics for a batch or a dataset.
#[derive(Clone)]
pub struct MetricEvaluator {
    name: String,
    metrics: Vec<ResolvedMetric>,
    gateway: DistributedValueGateway,
    clean_up: Option<CleanUpFn>,
    show_progress: bool,
}

impl fmt::Debug for MetricEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricEvaluator")
            .field("name", &self.name)
            .field("metrics", &self.metric_names().collect::<Vec<_>>())
            .field("num_replicas", &self.gateway.num_replicas())
            .finish()
    }
}

/// Builder for [`MetricEvaluator`]; metric validation happens in [`build`](Self::build).
pub struct MetricEvaluatorBuilder {
    name: String,
    specs: Vec<MetricSpec>,
    gateway: DistributedValueGateway,
    clean_up: Option<CleanUpFn>,
    show_progress: bool,
}

impl MetricEvaluatorBuilder {
    pub fn metric(mut self, spec: MetricSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn gateway(mut self, gateway: DistributedValueGateway) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn clean_up_batch_data<F>(mut self, func: F) -> Self
    where
        F: Fn(&mut BatchEvaluation) + Send + Sync + 'static,
    {
        self.clean_up = Some(Arc::new(func));
        self
    }

    pub fn show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Resolve every metric. Fails on a metric that lacks a required function.
    pub fn build(self) -> Result<MetricEvaluator> {
        let distributed = self.gateway.num_replicas() > 1;

        let mut specs = self.specs;
        if !specs.iter().any(|s| s.name() == LOSS) {
            specs.insert(0, MetricSpec::loss());
        }

        let metrics = specs
            .into_iter()
            .map(|spec| spec.resolve(distributed))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            evaluator = %self.name,
            metrics = ?metrics.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            "Metric evaluator configured"
        );

        Ok(MetricEvaluator {
            name: self.name,
            metrics,
            gateway: self.gateway,
            clean_up: self.clean_up,
            show_progress: self.show_progress,
        })
    }
}

impl MetricEvaluator {
    pub fn builder(name: impl Into<String>) -> MetricEvaluatorBuilder {
        MetricEvaluatorBuilder {
            name: name.into(),
            specs: Vec::new(),
            gateway: DistributedValueGateway::default(),
            clean_up: None,
            show_progress: false,
        }
    }

    /// An evaluator with only the default loss metric.
    pub fn loss_only(name: impl Into<String>, gateway: DistributedValueGateway) -> Result<Self> {
        Self::builder(name).gateway(gateway).build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(|m| m.name.as_str())
    }

    /// Gather the inputs of every metric for one batch, reducing per-device
    /// values when they are distributed.
    ///
    /// A metric whose gathering fails is logged and left out.
    pub fn gather(&self, evaluation: &BatchEvaluation) -> GatheredInputs {
        let mut gathered = GatheredInputs::new();
        for metric in &self.metrics {
            match self.gather_metric(metric, evaluation) {
                Ok(Some(inputs)) => {
                    gathered.insert(metric.name.clone(), inputs);
                }
                Ok(None) => {
                    tracing::debug!(evaluator = %self.name, metric = %metric.name, "No inputs available for metric");
                }
                Err(e) => {
                    tracing::warn!(evaluator = %self.name, metric = %metric.name, error = %e, "Unable to gather metric inputs");
                }
            }
        }
        gathered
    }

    fn gather_metric(&self, metric: &ResolvedMetric, evaluation: &BatchEvaluation) -> Result<Option<MetricData>> {
        let Some(inputs) = (metric.gather)(evaluation)? else {
            return Ok(None);
        };
        if !self.gateway.is_distributed(&inputs) {
            return Ok(Some(inputs));
        }
        match &metric.gather_distributed {
            Some(reduce) => reduce(&inputs, &self.gateway).map(Some),
            None => Err(MlpugError::compute(
                metric.name.clone(),
                "inputs are distributed but no gather-distributed function is configured",
            )),
        }
    }

    /// Gather from an evaluation this evaluator owns, then release its batch data.
    pub fn gather_owned(&self, mut evaluation: BatchEvaluation) -> GatheredInputs {
        let gathered = self.gather(&evaluation);
        if let Some(clean_up) = &self.clean_up {
            clean_up(&mut evaluation);
        }
        gathered
    }

    /// Combine the inputs gathered over several batches, per metric.
    pub fn combine<'a>(&self, batches: impl IntoIterator<Item = &'a GatheredInputs>) -> GatheredInputs {
        let batches: Vec<&GatheredInputs> = batches.into_iter().collect();
        let mut combined = GatheredInputs::new();
        for metric in &self.metrics {
            let items: Vec<MetricData> = batches
                .iter()
                .filter_map(|inputs| inputs.get(&metric.name).cloned())
                .collect();
            if items.is_empty() {
                continue;
            }
            match (metric.combine)(items) {
                Ok(inputs) => {
                    combined.insert(metric.name.clone(), inputs);
                }
                Err(e) => {
                    tracing::warn!(evaluator = %self.name, metric = %metric.name, error = %e, "Unable to combine metric inputs");
                }
            }
        }
        combined
    }

    /// Compute the metric values. A metric that fails to compute is logged and omitted.
    pub fn compute(&self, inputs: &GatheredInputs) -> LogTree {
        let mut metrics = LogTree::new();
        for metric in &self.metrics {
            let Some(metric_inputs) = inputs.get(&metric.name) else {
                continue;
            };
            match (metric.compute)(metric_inputs) {
                Ok(Some(value)) => {
                    metrics.insert(metric.name.clone(), value);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(evaluator = %self.name, metric = %metric.name, error = %e, "Metric computation failed, omitting metric");
                }
            }
        }
        metrics
    }

    /// Metrics over a window or dataset of already gathered batches.
    pub fn compute_over<'a>(&self, batches: impl IntoIterator<Item = &'a GatheredInputs>) -> LogTree {
        self.compute(&self.combine(batches))
    }

    /// Metrics of a single, already evaluated batch.
    pub fn evaluate_batch(&self, evaluation: &BatchEvaluation) -> LogTree {
        self.compute(&self.gather(evaluation))
    }

    /// Evaluate every batch of `dataset` with the trainer, then combine and compute.
    pub fn evaluate_dataset<B>(&self, trainer: &mut dyn Trainer<B>, dataset: &dyn BatchSource<B>) -> Result<LogTree> {
        let num_batches = dataset.num_batches();
        let mut gathered = Vec::with_capacity(num_batches);
        for batch_idx in 0..num_batches {
            let Some(batch) = dataset.batch_at(batch_idx) else {
                break;
            };
            let evaluation = trainer.evaluate_loss(batch)?;
            gathered.push(self.gather_owned(evaluation));
            if self.show_progress {
                tracing::debug!(evaluator = %self.name, batch = batch_idx + 1, num_batches, "Evaluated batch");
            }
        }
        Ok(self.compute_over(&gathered))
    }

    /// Evaluate a single batch or a whole dataset.
    pub fn evaluate<B>(&self, trainer: &mut dyn Trainer<B>, source: EvaluationSource<'_, B>) -> Result<LogTree> {
        match source {
            EvaluationSource::Batch(evaluation) => Ok(self.evaluate_batch(evaluation)),
            EvaluationSource::Dataset(dataset) => self.evaluate_dataset(trainer, dataset),
        }
    }
}
