//! End-to-end training runs: manager, metric loggers, checkpointing and resume.

use mlpug_core::callbacks::{
    BatchSizeLogger, CheckpointManager, CheckpointManagerConfig, Hook, TestMetricsLogger, TrainingMetricsLogger,
};
use mlpug_core::checkpoint::{CheckpointBackend, CheckpointKind, CheckpointRecord, InMemoryCheckpointBackend};
use mlpug_core::distributed::is_distributed;
use mlpug_core::{
    BatchEvaluation, BatchSource, Callback, CallbackResult, DistributedValueGateway, FailurePolicy,
    FileCheckpointBackend, HookContext, MetricData, MetricEvaluator, MirroredStrategy, MlpugError, PerReplica,
    Result, Trainer, TrainingManager, TrainingStatus, load_model_checkpoint, load_training_checkpoint,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::{Arc, Mutex};

type Batch = Vec<f64>;

/// Loss is `scale * mean(batch)`; every training step multiplies `scale` by `decay`.
struct DecayingTrainer {
    scale: f64,
    decay: f64,
    steps: u64,
}

impl DecayingTrainer {
    fn new(decay: f64) -> Self {
        Self {
            scale: 1.0,
            decay,
            steps: 0,
        }
    }

    fn loss(&self, batch: &Batch) -> f64 {
        self.scale * batch.iter().sum::<f64>() / batch.len().max(1) as f64
    }
}

impl Trainer<Batch> for DecayingTrainer {
    fn train_on(&mut self, batch: &Batch) -> Result<BatchEvaluation> {
        let loss = self.loss(batch);
        self.scale *= self.decay;
        self.steps += 1;
        Ok(BatchEvaluation::new(loss, batch.len()))
    }

    fn evaluate_loss(&mut self, batch: &Batch) -> Result<BatchEvaluation> {
        Ok(BatchEvaluation::new(self.loss(batch), batch.len()))
    }

    fn model_state(&self) -> Result<serde_json::Value> {
        Ok(json!({ "scale": self.scale, "steps": self.steps }))
    }

    fn optimizer_state(&self) -> Result<serde_json::Value> {
        Ok(json!({ "decay": self.decay }))
    }

    fn set_model_state(&mut self, state: serde_json::Value) -> Result<()> {
        self.scale = state["scale"]
            .as_f64()
            .ok_or_else(|| MlpugError::trainer("model state has no scale"))?;
        self.steps = state["steps"].as_u64().unwrap_or(0);
        Ok(())
    }

    fn set_optimizer_state(&mut self, state: serde_json::Value) -> Result<()> {
        if let Some(decay) = state["decay"].as_f64() {
            self.decay = decay;
        }
        Ok(())
    }
}

/// Reports failure once the run reaches the given position.
struct StopAt {
    epoch: usize,
    batch_step: usize,
}

impl Callback<Batch> for StopAt {
    fn name(&self) -> &str {
        "StopAt"
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Abort
    }

    fn on_batch_training_completed(&mut self, _batch: &Batch, ctx: &mut HookContext<'_, Batch>) -> CallbackResult {
        Ok(!(ctx.epoch() == self.epoch && ctx.batch_step() == self.batch_step))
    }
}

fn dataset(num_batches: usize, value: f64) -> Arc<dyn BatchSource<Batch>> {
    Arc::new(vec![vec![value, value]; num_batches])
}

fn loss_evaluator(name: &str) -> MetricEvaluator {
    MetricEvaluator::loss_only(name, DistributedValueGateway::default()).unwrap()
}

#[test]
fn test_full_run_logs_batch_and_window_metrics() {
    let mut manager = TrainingManager::new(DecayingTrainer::new(1.0), dataset(5, 2.0), 2)
        .callback(BatchSizeLogger::new())
        .callback(TrainingMetricsLogger::new(loss_evaluator("training")).sliding_window_length(2));
    manager.start_training().unwrap();

    assert_eq!(manager.status(), TrainingStatus::Completed);
    assert!(manager.failures().is_empty());
    let logs = manager.logs();
    assert_eq!(logs.number_at("current.training.batch.loss"), Some(2.0));
    assert_eq!(logs.number_at("current.training.window_average.loss"), Some(2.0));
    assert_eq!(logs.number_at("current.training_params.batch.batch_size"), Some(2.0));
    assert_eq!(manager.trainer().steps, 10);
}

#[test]
fn test_best_model_follows_validation_loss() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FileCheckpointBackend::new(dir.path()));
    let validation = TestMetricsLogger::new(dataset(3, 1.0), "validation", loss_evaluator("validation")).batch_level(false);
    let checkpoints = CheckpointManager::new(CheckpointManagerConfig::default(), backend.clone()).unwrap();

    let mut manager = TrainingManager::new(DecayingTrainer::new(0.9), dataset(4, 1.0), 3)
        .callback(TrainingMetricsLogger::new(loss_evaluator("training")))
        .callback(validation)
        .callback(checkpoints);
    manager.start_training().unwrap();
    assert!(manager.failures().is_empty());

    let final_loss = manager.logs().number_at("current.validation.dataset.loss").unwrap();
    let best = load_model_checkpoint(backend.as_ref(), "mlpug-model-best-model-checkpoint")
        .unwrap()
        .unwrap();
    assert_eq!(best.epoch, 2);
    let monitored = best.monitored.unwrap();
    assert_eq!(monitored.metric, "validation.dataset.loss");
    assert!((monitored.value - final_loss).abs() < 1e-12);

    assert!(backend.exists("mlpug-model-latest-model-checkpoint").unwrap());
    assert!(backend.exists("mlpug-model-best-model-checkpoint-backup").unwrap());
    let training = load_training_checkpoint(backend.as_ref(), "mlpug-model-training-checkpoint")
        .unwrap()
        .unwrap();
    assert_eq!(training.manager_state.epoch, 2);
    assert!(training.manager_state.epoch_completed);
    assert_eq!(training.manager_state.global_iter, 12);
}

#[test]
fn test_resume_mid_epoch_from_training_checkpoint() {
    let backend = Arc::new(InMemoryCheckpointBackend::new());
    let config = CheckpointManagerConfig {
        batch_level: true,
        metric_to_monitor: None,
        backup_before_override: false,
        ..CheckpointManagerConfig::default()
    };

    let mut first = TrainingManager::new(DecayingTrainer::new(1.0), dataset(50, 2.0), 5)
        .callback(TrainingMetricsLogger::new(loss_evaluator("training")).sliding_window_length(3))
        .callback(CheckpointManager::new(config.clone(), backend.clone()).unwrap())
        .callback(StopAt {
            epoch: 3,
            batch_step: 40,
        });
    let err = first.start_training().unwrap_err();
    assert!(matches!(err, MlpugError::CallbackFailed { .. }));
    assert_eq!(first.status(), TrainingStatus::Failed);

    let checkpoint = load_training_checkpoint(backend.as_ref(), "mlpug-model-training-checkpoint")
        .unwrap()
        .unwrap();
    let saved = &checkpoint.manager_state;
    assert_eq!((saved.epoch, saved.batch_step, saved.global_iter), (3, 40, 190));
    assert!(!saved.epoch_completed);
    let saved_window = saved.callbacks[0].state.clone();
    assert!(saved_window.is_some());

    let mut resumed = TrainingManager::new(DecayingTrainer::new(1.0), dataset(50, 2.0), 5)
        .callback(TrainingMetricsLogger::new(loss_evaluator("training")).sliding_window_length(3))
        .callback(CheckpointManager::new(config, backend.clone()).unwrap());
    resumed.restore_from_checkpoint(checkpoint.clone()).unwrap();

    let restored = resumed.get_state().unwrap();
    assert_eq!((restored.epoch, restored.batch_step, restored.global_iter), (3, 40, 190));
    assert_eq!(restored.run_id, checkpoint.manager_state.run_id);
    assert_eq!(restored.callbacks[0].state, saved_window);
    assert_eq!(resumed.trainer().steps, 191);

    resumed.start_training().unwrap();
    assert_eq!(resumed.trainer().steps, 250);
    assert_eq!(resumed.logs().number_at("current.global_iter"), Some(249.0));
    assert_eq!(resumed.logs().number_at("current.training.window_average.loss"), Some(2.0));
}

/// Trainer whose two replicas see losses 1.0 (two samples) and 4.0 (one sample).
struct MirroredTrainer;

impl Trainer<Batch> for MirroredTrainer {
    fn train_on(&mut self, batch: &Batch) -> Result<BatchEvaluation> {
        self.evaluate_loss(batch)
    }

    fn evaluate_loss(&mut self, _batch: &Batch) -> Result<BatchEvaluation> {
        Ok(BatchEvaluation {
            loss: MetricData::PerReplica(PerReplica::new(vec![1.0.into(), 4.0.into()])),
            num_samples: MetricData::PerReplica(PerReplica::new(vec![2.0.into(), 1.0.into()])),
            auxiliary_results: Default::default(),
        })
    }

    fn model_state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    fn optimizer_state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    fn set_model_state(&mut self, _state: serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn set_optimizer_state(&mut self, _state: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_mirrored_run_reduces_replica_losses() {
    let gateway = DistributedValueGateway::new(Arc::new(MirroredStrategy::new(2).unwrap()));
    let evaluator = MetricEvaluator::loss_only("training", gateway.clone()).unwrap();

    let evaluation = MirroredTrainer.train_on(&vec![0.0]).unwrap();
    assert!(is_distributed(&evaluation.loss));
    assert!(!is_distributed(&MetricData::Scalar(1.0)));
    assert_eq!(evaluator.evaluate_batch(&evaluation).number_at("loss"), Some(2.0));

    let replica_ids = gateway
        .create_distributed_func("replica_id", |ctx, _args: &()| Ok(MetricData::Scalar(ctx.replica_id as f64)))
        .call(&())
        .unwrap();
    assert_eq!(
        replica_ids,
        MetricData::PerReplica(PerReplica::new(vec![0.0.into(), 1.0.into()]))
    );

    let mut manager = TrainingManager::new(MirroredTrainer, dataset(3, 0.0), 1)
        .callback(TrainingMetricsLogger::new(evaluator).sliding_window_length(3));
    manager.start_training().unwrap();
    assert_eq!(manager.logs().number_at("current.training.window_average.loss"), Some(2.0));
}

/// In-memory backend whose n-th `save` calls (1-based) fail.
struct FailingBackend {
    inner: InMemoryCheckpointBackend,
    fail_on: Vec<usize>,
    saves: Mutex<usize>,
}

impl FailingBackend {
    fn new(fail_on: Vec<usize>) -> Self {
        Self {
            inner: InMemoryCheckpointBackend::new(),
            fail_on,
            saves: Mutex::new(0),
        }
    }
}

impl CheckpointBackend for FailingBackend {
    fn exists(&self, name: &str) -> Result<bool> {
        self.inner.exists(name)
    }

    fn save(&self, name: &str, kind: CheckpointKind, payload: &serde_json::Value) -> Result<CheckpointRecord> {
        let save = {
            let mut saves = self.saves.lock().unwrap();
            *saves += 1;
            *saves
        };
        if self.fail_on.contains(&save) {
            return Err(MlpugError::checkpoint_io(format!("write of '{name}' failed")));
        }
        self.inner.save(name, kind, payload)
    }

    fn load(&self, name: &str) -> Result<Option<serde_json::Value>> {
        self.inner.load(name)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.inner.rename(from, to)
    }

    fn copy(&self, from: &str, to: &str) -> Result<()> {
        self.inner.copy(from, to)
    }

    fn records(&self) -> Result<Vec<CheckpointRecord>> {
        self.inner.records()
    }
}

#[test]
fn test_failed_final_epoch_checkpoint_is_written_at_completion() {
    // Saves 1 and 2 are epoch 0's latest and training checkpoints; save 3 is epoch 1's latest.
    let backend = Arc::new(FailingBackend::new(vec![3]));
    let config = CheckpointManagerConfig {
        metric_to_monitor: None,
        backup_before_override: false,
        ..CheckpointManagerConfig::default()
    };
    let mut manager = TrainingManager::new(DecayingTrainer::new(1.0), dataset(4, 1.0), 2)
        .callback(CheckpointManager::new(config, backend.clone()).unwrap());
    manager.start_training().unwrap();

    assert_eq!(manager.status(), TrainingStatus::Completed);
    assert_eq!(manager.failures().len(), 1);
    assert_eq!(manager.failures()[0].hook, Hook::EpochCompleted);
    assert_eq!(manager.failures()[0].epoch, 1);

    let training = load_training_checkpoint(backend.as_ref(), "mlpug-model-training-checkpoint")
        .unwrap()
        .unwrap();
    let saved = &training.manager_state;
    assert_eq!((saved.epoch, saved.global_iter), (1, 8));
    assert!(saved.epoch_completed);
    assert_eq!(saved.callbacks[0].state.as_ref().unwrap()["latest_written"], 2);
    assert_eq!(training.model_state["steps"], 8);
}

#[test]
fn test_resume_after_nan_loss_in_window() {
    let diverging = || -> Arc<dyn BatchSource<Batch>> {
        let mut batches = vec![vec![2.0, 2.0]; 10];
        batches[0] = vec![f64::NAN, 2.0];
        Arc::new(batches)
    };
    let backend = Arc::new(InMemoryCheckpointBackend::new());
    let config = CheckpointManagerConfig {
        batch_level: true,
        metric_to_monitor: None,
        backup_before_override: false,
        ..CheckpointManagerConfig::default()
    };

    let mut first = TrainingManager::new(DecayingTrainer::new(1.0), diverging(), 2)
        .callback(TrainingMetricsLogger::new(loss_evaluator("training")).sliding_window_length(3))
        .callback(CheckpointManager::new(config.clone(), backend.clone()).unwrap())
        .callback(StopAt {
            epoch: 0,
            batch_step: 1,
        });
    assert!(first.start_training().is_err());
    assert!(
        first
            .logs()
            .number_at("current.training.batch.loss")
            .is_some_and(|loss| loss == 2.0)
    );

    let payload = backend.load("mlpug-model-training-checkpoint").unwrap().unwrap();
    let text = serde_json::to_string(&payload).unwrap();
    let checkpoint: mlpug_core::TrainingCheckpoint = serde_json::from_str(&text).unwrap();
    let saved_window = checkpoint.manager_state.callbacks[0].state.clone();

    let mut resumed = TrainingManager::new(DecayingTrainer::new(1.0), diverging(), 2)
        .callback(TrainingMetricsLogger::new(loss_evaluator("training")).sliding_window_length(3))
        .callback(CheckpointManager::new(config, backend.clone()).unwrap());
    resumed.restore_from_checkpoint(checkpoint).unwrap();
    assert_eq!(resumed.get_state().unwrap().callbacks[0].state, saved_window);

    resumed.start_training().unwrap();
    assert_eq!(resumed.trainer().steps, 20);
    assert_eq!(resumed.logs().number_at("current.training.window_average.loss"), Some(2.0));
}

