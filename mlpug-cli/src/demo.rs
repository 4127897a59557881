//! Synthetic two-class dataset and a logistic regression trainer used by
//! `mlpug train`.
//!
//! Every training step runs as a distributed function: each replica
//! computes loss and gradients on its own shard of the batch and the
//! gradients are averaged, weighted by shard size, before the update.

use mlpug_core::callbacks::BatchShape;
use mlpug_core::distributed::{DistributedFunc, ReplicaContext};
use mlpug_core::evaluation::metric::{classification_quality, concat_replicas, gather_classification_data};
use mlpug_core::{
    BatchEvaluation, DistributedValueGateway, MetricData, MetricSpec, MlpugError, PerReplica, Result, Trainer,
};
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const NUM_FEATURES: usize = 2;

/// Row-major batch: one feature row and one 0/1 label per sample.
#[derive(Debug, Clone, PartialEq)]
pub struct DemoBatch {
    pub features: Vec<[f64; NUM_FEATURES]>,
    pub labels: Vec<f64>,
}

impl BatchShape for DemoBatch {
    fn num_samples(&self) -> Option<usize> {
        Some(self.labels.len())
    }

    fn dim_size(&self, dim: usize) -> Option<usize> {
        match dim {
            0 => Some(self.features.len()),
            1 => Some(NUM_FEATURES),
            _ => None,
        }
    }
}

/// Two noisy blobs centred on (-1, -1) and (1, 1).
pub fn generate_batches(num_batches: usize, batch_size: usize, rng: &mut StdRng) -> Vec<DemoBatch> {
    (0..num_batches)
        .map(|_| {
            let mut batch = DemoBatch {
                features: Vec::with_capacity(batch_size),
                labels: Vec::with_capacity(batch_size),
            };
            for _ in 0..batch_size {
                let label: bool = rng.gen_bool(0.5);
                let centre = if label { 1.0 } else { -1.0 };
                batch.features.push([
                    centre + rng.gen_range(-1.5..1.5),
                    centre + rng.gen_range(-1.5..1.5),
                ]);
                batch.labels.push(if label { 1.0 } else { 0.0 });
            }
            batch
        })
        .collect()
}

/// Accuracy over `labels` and `predictions` auxiliary results, concatenated
/// over replicas when distributed.
pub fn classification_metric() -> MetricSpec {
    MetricSpec::new("classification")
        .gather(gather_classification_data)
        .gather_distributed(concat_replicas)
        .compute(classification_quality)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Params {
    weights: [f64; NUM_FEATURES],
    bias: f64,
}

struct StepInput {
    params: Params,
    batch: DemoBatch,
}

type StepFn = fn(&ReplicaContext, &StepInput) -> Result<MetricData>;

/// What one replica computed on its shard.
#[derive(Debug, Clone)]
struct ShardOutput {
    loss: f64,
    num_samples: f64,
    gradient: [f64; NUM_FEATURES + 1],
    labels: Vec<f64>,
    predictions: Vec<f64>,
}

impl ShardOutput {
    fn into_parts(self) -> MetricData {
        let mut stats = vec![self.loss, self.num_samples];
        stats.extend_from_slice(&self.gradient);
        MetricData::Sequence(vec![
            MetricData::Vector(stats),
            MetricData::Vector(self.labels),
            MetricData::Vector(self.predictions),
        ])
    }

    fn from_parts(parts: Vec<MetricData>) -> Result<Self> {
        let malformed = || MlpugError::trainer("malformed replica step output");
        // A step output arrives whole from a replica, or split into its components on one device.
        let components = match parts.as_slice() {
            [MetricData::Sequence(components)] => components.as_slice(),
            components => components,
        };
        let [MetricData::Vector(stats), MetricData::Vector(labels), MetricData::Vector(predictions)] = components
        else {
            return Err(malformed());
        };
        let [loss, num_samples, g0, g1, gb] = stats.as_slice() else {
            return Err(malformed());
        };
        Ok(Self {
            loss: *loss,
            num_samples: *num_samples,
            gradient: [*g0, *g1, *gb],
            labels: labels.clone(),
            predictions: predictions.clone(),
        })
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Binary cross-entropy and its gradient over one contiguous shard of the batch.
fn replica_step(ctx: &ReplicaContext, input: &StepInput) -> Result<MetricData> {
    let n = input.batch.labels.len();
    let shard_size = n.div_ceil(ctx.num_replicas.max(1));
    let start = (ctx.replica_id * shard_size).min(n);
    let end = (start + shard_size).min(n);

    let mut output = ShardOutput {
        loss: 0.0,
        num_samples: (end - start) as f64,
        gradient: [0.0; NUM_FEATURES + 1],
        labels: input.batch.labels[start..end].to_vec(),
        predictions: Vec::with_capacity(end - start),
    };
    if start == end {
        return Ok(output.into_parts());
    }

    let params = &input.params;
    for (x, &y) in input.batch.features[start..end].iter().zip(&input.batch.labels[start..end]) {
        let z = params.weights[0] * x[0] + params.weights[1] * x[1] + params.bias;
        let p = sigmoid(z).clamp(1e-12, 1.0 - 1e-12);
        output.loss -= y * p.ln() + (1.0 - y) * (1.0 - p).ln();
        let err = p - y;
        output.gradient[0] += err * x[0];
        output.gradient[1] += err * x[1];
        output.gradient[2] += err;
        output.predictions.push(if p >= 0.5 { 1.0 } else { 0.0 });
    }
    let m = output.num_samples;
    output.loss /= m;
    output.gradient.iter_mut().for_each(|g| *g /= m);
    Ok(output.into_parts())
}

/// Logistic regression trained with plain SGD.
pub struct LogisticTrainer {
    params: Params,
    learning_rate: f64,
    steps: u64,
    gateway: DistributedValueGateway,
    step: DistributedFunc<StepInput, StepFn>,
}

impl LogisticTrainer {
    pub fn new(rng: &mut StdRng, learning_rate: f64, gateway: DistributedValueGateway) -> Self {
        let params = Params {
            weights: [rng.gen_range(-0.1..0.1), rng.gen_range(-0.1..0.1)],
            bias: 0.0,
        };
        let step = gateway
            .create_distributed_func("logistic_step", replica_step as StepFn)
            .with_tracing_monitor(true);
        Self {
            params,
            learning_rate,
            steps: 0,
            gateway,
            step,
        }
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn run_shards(&self, batch: &DemoBatch) -> Result<Vec<ShardOutput>> {
        let input = StepInput {
            params: self.params.clone(),
            batch: batch.clone(),
        };
        let packed = self.step.call(&input)?;
        self.gateway
            .unpack_and_map(ShardOutput::from_parts, &packed)?
            .into_iter()
            .collect()
    }

    fn evaluation(&self, shards: Vec<ShardOutput>) -> BatchEvaluation {
        if self.gateway.num_replicas() == 1 {
            if let Some(shard) = shards.into_iter().next() {
                return BatchEvaluation::new(shard.loss, shard.num_samples as usize)
                    .with_auxiliary("labels", MetricData::Vector(shard.labels))
                    .with_auxiliary("predictions", MetricData::Vector(shard.predictions));
            }
            return BatchEvaluation::new(0.0, 0);
        }

        let per_replica = |f: &dyn Fn(&ShardOutput) -> MetricData| {
            MetricData::PerReplica(PerReplica::new(shards.iter().map(f).collect()))
        };
        BatchEvaluation {
            loss: per_replica(&|s: &ShardOutput| MetricData::Scalar(s.loss)),
            num_samples: per_replica(&|s: &ShardOutput| MetricData::Scalar(s.num_samples)),
            auxiliary_results: Default::default(),
        }
        .with_auxiliary("labels", per_replica(&|s: &ShardOutput| MetricData::Vector(s.labels.clone())))
        .with_auxiliary("predictions", per_replica(&|s: &ShardOutput| MetricData::Vector(s.predictions.clone())))
    }
}

impl Trainer<DemoBatch> for LogisticTrainer {
    fn train_on(&mut self, batch: &DemoBatch) -> Result<BatchEvaluation> {
        let shards = self.run_shards(batch)?;

        let total: f64 = shards.iter().map(|s| s.num_samples).sum();
        if total > 0.0 {
            let mut gradient = [0.0; NUM_FEATURES + 1];
            for shard in &shards {
                for (g, sg) in gradient.iter_mut().zip(shard.gradient) {
                    *g += sg * shard.num_samples / total;
                }
            }
            self.params.weights[0] -= self.learning_rate * gradient[0];
            self.params.weights[1] -= self.learning_rate * gradient[1];
            self.params.bias -= self.learning_rate * gradient[2];
        }
        self.steps += 1;
        Ok(self.evaluation(shards))
    }

    fn evaluate_loss(&mut self, batch: &DemoBatch) -> Result<BatchEvaluation> {
        let shards = self.run_shards(batch)?;
        Ok(self.evaluation(shards))
    }

    fn model_state(&self) -> Result<serde_json::Value> {
        Ok(json!({ "params": self.params, "steps": self.steps }))
    }

    fn optimizer_state(&self) -> Result<serde_json::Value> {
        Ok(json!({ "learning_rate": self.learning_rate }))
    }

    fn set_model_state(&mut self, state: serde_json::Value) -> Result<()> {
        self.params = serde_json::from_value(state["params"].clone())?;
        self.steps = state["steps"].as_u64().unwrap_or(0);
        Ok(())
    }

    fn set_optimizer_state(&mut self, state: serde_json::Value) -> Result<()> {
        if let Some(lr) = state["learning_rate"].as_f64() {
            self.learning_rate = lr;
        }
        Ok(())
    }

    fn set_learning_rate(&mut self, learning_rate: f64) -> Result<bool> {
        self.learning_rate = learning_rate;
        Ok(true)
    }
}
