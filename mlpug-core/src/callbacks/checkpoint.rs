//! Best-model and latest-model checkpointing.

use super::{Callback, CallbackResult, FailurePolicy, HookContext, decode_state};
use crate::checkpoint::{CheckpointBackend, CheckpointKind, ModelCheckpoint, MonitoredValue, TrainingCheckpoint};
use crate::error::{MlpugError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Whether a lower or a higher monitored value is an improvement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    #[default]
    Lower,
    Higher,
}

impl MonitorMode {
    pub fn is_improvement(&self, value: f64, best: f64) -> bool {
        match self {
            Self::Lower => value < best,
            Self::Higher => value > best,
        }
    }
}

fn default_base_filename() -> String {
    "mlpug-model".to_string()
}

fn default_metric_to_monitor() -> Option<String> {
    Some("validation.dataset.loss".to_string())
}

fn default_period() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// What to checkpoint and how often.
///
/// Periods count epochs, or global iterations when `batch_level` is set.
/// A period of 0 disables the corresponding checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManagerConfig {
    #[serde(default = "default_base_filename")]
    pub base_checkpoint_filename: String,
    #[serde(default)]
    pub batch_level: bool,
    /// Key path relative to `current`; `None` disables best-model checkpoints.
    #[serde(default = "default_metric_to_monitor")]
    pub metric_to_monitor: Option<String>,
    #[serde(default = "default_period")]
    pub metric_monitor_period: usize,
    #[serde(default)]
    pub monitor_mode: MonitorMode,
    #[serde(default = "default_period")]
    pub create_checkpoint_every: usize,
    #[serde(default)]
    pub archive_last_model_checkpoint_every: usize,
    #[serde(default = "default_true")]
    pub backup_before_override: bool,
    #[serde(default)]
    pub model_hyper_parameters: serde_json::Value,
}

impl Default for CheckpointManagerConfig {
    fn default() -> Self {
        Self {
            base_checkpoint_filename: default_base_filename(),
            batch_level: false,
            metric_to_monitor: default_metric_to_monitor(),
            metric_monitor_period: default_period(),
            monitor_mode: MonitorMode::default(),
            create_checkpoint_every: default_period(),
            archive_last_model_checkpoint_every: 0,
            backup_before_override: true,
            model_hyper_parameters: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BestModel {
    value: f64,
    epoch: usize,
    global_iter: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ManagerState {
    best: Option<BestModel>,
    latest_written: usize,
    last_written_at: Option<u64>,
}

fn is_due(period: usize, counter: u64) -> bool {
    period > 0 && (counter + 1) % period as u64 == 0
}

/// Persists a best-model checkpoint whenever the monitored metric improves,
/// and latest-model plus training checkpoints at a fixed period.
pub struct CheckpointManager {
    name: String,
    config: CheckpointManagerConfig,
    backend: Arc<dyn CheckpointBackend>,
    state: ManagerState,
    policy: FailurePolicy,
}

impl CheckpointManager {
    pub fn new(config: CheckpointManagerConfig, backend: Arc<dyn CheckpointBackend>) -> Result<Self> {
        if config.base_checkpoint_filename.trim().is_empty() {
            return Err(MlpugError::config("base_checkpoint_filename must not be empty"));
        }
        if config.metric_to_monitor.is_some() && config.metric_monitor_period == 0 {
            return Err(MlpugError::config(
                "metric_monitor_period must be at least 1 when a metric is monitored",
            ));
        }
        Ok(Self {
            name: "CheckpointManager".to_string(),
            config,
            backend,
            state: ManagerState::default(),
            policy: FailurePolicy::Tolerate,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn best_model_name(&self) -> String {
        format!("{}-best-model-checkpoint", self.config.base_checkpoint_filename)
    }

    pub fn latest_model_name(&self) -> String {
        format!("{}-latest-model-checkpoint", self.config.base_checkpoint_filename)
    }

    pub fn training_checkpoint_name(&self) -> String {
        format!("{}-training-checkpoint", self.config.base_checkpoint_filename)
    }

    fn archive_name(&self, counter: u64) -> String {
        let unit = if self.config.batch_level { "iter" } else { "epoch" };
        format!("{}-{unit}-{counter}-model-checkpoint", self.config.base_checkpoint_filename)
    }

    /// Best monitored value seen so far.
    pub fn best_value(&self) -> Option<f64> {
        self.state.best.as_ref().map(|b| b.value)
    }

    fn period_counter<B>(&self, ctx: &HookContext<'_, B>) -> u64 {
        if self.config.batch_level {
            ctx.global_iter()
        } else {
            ctx.epoch() as u64
        }
    }

    /// Iterations completed at this hook.
    fn iterations_done<B>(&self, ctx: &HookContext<'_, B>) -> u64 {
        if self.config.batch_level {
            ctx.global_iter() + 1
        } else {
            ctx.global_iter()
        }
    }

    fn store(&self, name: &str, kind: CheckpointKind, payload: &serde_json::Value) -> Result<()> {
        if self.backend.exists(name)? {
            if self.config.backup_before_override {
                let backup = format!("{name}-backup");
                self.backend.rename(name, &backup)?;
                info!(checkpoint = name, backup = %backup, "Backed up existing checkpoint");
            } else {
                info!(checkpoint = name, "Overwriting existing checkpoint");
            }
        }
        let record = self.backend.save(name, kind, payload)?;
        info!(checkpoint = name, location = %record.location, "Checkpoint saved");
        Ok(())
    }

    fn model_checkpoint<B>(&self, ctx: &HookContext<'_, B>, monitored: Option<MonitoredValue>) -> Result<serde_json::Value> {
        let checkpoint = ModelCheckpoint {
            hyper_parameters: self.config.model_hyper_parameters.clone(),
            model_state: ctx.trainer.model_state()?,
            epoch: ctx.epoch(),
            batch_step: ctx.batch_step(),
            global_iter: ctx.global_iter(),
            monitored,
            created_at: Utc::now(),
        };
        Ok(serde_json::to_value(checkpoint)?)
    }

    /// Compare the monitored metric with the best so far; write a best-model
    /// checkpoint on improvement.
    fn check_improvement<B>(&mut self, metric: &str, ctx: &HookContext<'_, B>) -> CallbackResult {
        let Some(value) = ctx.logs.current().and_then(|current| current.number_at(metric)) else {
            warn!(callback = %self.name, metric, "Monitored metric not available, best model not evaluated");
            return Ok(false);
        };
        if value.is_nan() {
            warn!(callback = %self.name, metric, "Monitored metric is NaN, best model not evaluated");
            return Ok(false);
        }

        let improved = match &self.state.best {
            None => true,
            Some(best) => self.config.monitor_mode.is_improvement(value, best.value),
        };
        if !improved {
            return Ok(true);
        }

        let previous = self.state.best.replace(BestModel {
            value,
            epoch: ctx.epoch(),
            global_iter: ctx.global_iter(),
        });
        let monitored = MonitoredValue {
            metric: metric.to_string(),
            value,
        };
        let written = self
            .model_checkpoint(ctx, Some(monitored))
            .and_then(|payload| self.store(&self.best_model_name(), CheckpointKind::Model, &payload));
        match written {
            Ok(()) => {
                info!(callback = %self.name, metric, value, "Monitored metric improved, best model saved");
                Ok(true)
            }
            Err(e) => {
                self.state.best = previous;
                Err(e)
            }
        }
    }

    /// Write latest-model and training checkpoints. The counters are part of the
    /// training checkpoint, so they advance first and are restored when any write fails.
    fn write_latest<B>(&mut self, ctx: &HookContext<'_, B>, counter: u64) -> Result<()> {
        let latest_written = self.state.latest_written;
        let last_written_at = self.state.last_written_at;
        self.state.latest_written += 1;
        self.state.last_written_at = Some(self.iterations_done(ctx));

        let written = self.store_latest(ctx, counter);
        if written.is_err() {
            self.state.latest_written = latest_written;
            self.state.last_written_at = last_written_at;
        }
        written
    }

    fn store_latest<B>(&self, ctx: &HookContext<'_, B>, counter: u64) -> Result<()> {
        let model = self.model_checkpoint(ctx, None)?;
        let training = TrainingCheckpoint {
            hyper_parameters: self.config.model_hyper_parameters.clone(),
            model_state: model["model_state"].clone(),
            optimizer_state: ctx.trainer.optimizer_state()?,
            manager_state: ctx.training_state(self)?,
            created_at: Utc::now(),
        };

        let latest = self.latest_model_name();
        self.store(&latest, CheckpointKind::Model, &model)?;
        self.store(&self.training_checkpoint_name(), CheckpointKind::Training, &serde_json::to_value(training)?)?;

        let archive_every = self.config.archive_last_model_checkpoint_every;
        if archive_every > 0 && self.state.latest_written % archive_every == 0 {
            let archive = self.archive_name(counter);
            self.backend.copy(&latest, &archive)?;
            info!(checkpoint = %archive, "Archived latest model checkpoint");
        }
        Ok(())
    }

    fn on_period<B>(&mut self, ctx: &HookContext<'_, B>) -> CallbackResult {
        let counter = self.period_counter(ctx);
        let mut success = true;
        let mut failure: Option<MlpugError> = None;

        if let Some(metric) = self.config.metric_to_monitor.clone() {
            if is_due(self.config.metric_monitor_period, counter) {
                match self.check_improvement(&metric, ctx) {
                    Ok(ok) => success &= ok,
                    Err(e) => {
                        error!(callback = %self.name, error = %e, "Failed to write best model checkpoint");
                        failure = Some(e);
                    }
                }
            }
        }

        if is_due(self.config.create_checkpoint_every, counter) {
            if let Err(e) = self.write_latest(ctx, counter) {
                error!(callback = %self.name, error = %e, "Failed to write latest checkpoints");
                failure.get_or_insert(e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(success),
        }
    }
}

impl<B> Callback<B> for CheckpointManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.policy
    }

    fn get_state(&self) -> Result<Option<serde_json::Value>> {
        Ok(Some(serde_json::to_value(&self.state)?))
    }

    fn set_state(&mut self, state: serde_json::Value) -> Result<()> {
        self.state = decode_state(&self.name, state)?;
        Ok(())
    }

    fn on_batch_training_completed(&mut self, _batch: &B, ctx: &mut HookContext<'_, B>) -> CallbackResult {
        if !self.config.batch_level {
            return Ok(true);
        }
        self.on_period(ctx)
    }

    fn on_epoch_completed(&mut self, ctx: &mut HookContext<'_, B>) -> CallbackResult {
        if self.config.batch_level {
            return Ok(true);
        }
        self.on_period(ctx)
    }

    fn on_training_completed(&mut self, ctx: &mut HookContext<'_, B>) -> CallbackResult {
        if self.config.create_checkpoint_every == 0 {
            return Ok(true);
        }
        if self.state.last_written_at == Some(ctx.global_iter()) {
            return Ok(true);
        }
        let counter = self.period_counter(ctx);
        match self.write_latest(ctx, counter) {
            Ok(()) => Ok(true),
            Err(e) => {
                error!(callback = %self.name, error = %e, "Failed to write final checkpoints");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::test_support::Harness;
    use crate::checkpoint::{InMemoryCheckpointBackend, load_training_checkpoint};
    use pretty_assertions::assert_eq;

    fn manager(config: CheckpointManagerConfig) -> (CheckpointManager, Arc<InMemoryCheckpointBackend>) {
        let backend = Arc::new(InMemoryCheckpointBackend::new());
        let manager = CheckpointManager::new(config, backend.clone()).unwrap();
        (manager, backend)
    }

    fn epoch_end(manager: &mut CheckpointManager, harness: &mut Harness, epoch: usize, loss: f64) -> CallbackResult {
        harness.at(epoch, 9, (epoch as u64 + 1) * 10);
        harness.logs.set_path("current.validation.dataset.loss", loss).unwrap();
        let mut ctx = harness.ctx(None);
        Callback::<usize>::on_epoch_completed(manager, &mut ctx)
    }

    #[test]
    fn test_best_written_only_on_improvement() {
        let config = CheckpointManagerConfig {
            create_checkpoint_every: 0,
            ..Default::default()
        };
        let (mut manager, backend) = manager(config);
        let mut harness = Harness::new();

        let mut best_writes = Vec::new();
        for (epoch, loss) in [0.9, 0.95, 0.7].into_iter().enumerate() {
            let before = backend.writes().len();
            assert!(epoch_end(&mut manager, &mut harness, epoch, loss).unwrap());
            if backend.writes().len() > before {
                best_writes.push(epoch + 1);
            }
        }
        assert_eq!(best_writes, vec![1, 3]);
        assert_eq!(manager.best_value(), Some(0.7));
    }

    #[test]
    fn test_higher_is_better() {
        let config = CheckpointManagerConfig {
            create_checkpoint_every: 0,
            metric_to_monitor: Some("validation.dataset.accuracy".to_string()),
            monitor_mode: MonitorMode::Higher,
            ..Default::default()
        };
        let (mut manager, _backend) = manager(config);
        let mut harness = Harness::new();
        for (epoch, acc) in [0.5, 0.8, 0.6].into_iter().enumerate() {
            harness.logs.set_path("current.validation.dataset.accuracy", acc).unwrap();
            epoch_end(&mut manager, &mut harness, epoch, 1.0).unwrap();
        }
        assert_eq!(manager.best_value(), Some(0.8));
    }

    #[test]
    fn test_missing_metric_is_tolerated_failure() {
        let (mut manager, backend) = manager(CheckpointManagerConfig {
            create_checkpoint_every: 0,
            metric_to_monitor: Some("validation.dataset.f1".to_string()),
            ..Default::default()
        });
        let mut harness = Harness::new();
        assert!(!epoch_end(&mut manager, &mut harness, 0, 0.5).unwrap());
        assert!(backend.writes().is_empty());
    }

    #[test]
    fn test_latest_checkpoint_backs_up_previous() {
        let (mut manager, backend) = manager(CheckpointManagerConfig {
            metric_to_monitor: None,
            ..Default::default()
        });
        let mut harness = Harness::new();
        epoch_end(&mut manager, &mut harness, 0, 0.5).unwrap();
        epoch_end(&mut manager, &mut harness, 1, 0.5).unwrap();

        assert!(backend.exists("mlpug-model-latest-model-checkpoint").unwrap());
        assert!(backend.exists("mlpug-model-latest-model-checkpoint-backup").unwrap());
        let training = load_training_checkpoint(backend.as_ref(), "mlpug-model-training-checkpoint")
            .unwrap()
            .unwrap();
        assert_eq!(training.manager_state.epoch, 1);
        assert_eq!(training.manager_state.callbacks.len(), 1);
        assert_eq!(training.manager_state.callbacks[0].name, "CheckpointManager");
    }

    #[test]
    fn test_archive_every_second_latest() {
        let (mut manager, backend) = manager(CheckpointManagerConfig {
            metric_to_monitor: None,
            archive_last_model_checkpoint_every: 2,
            backup_before_override: false,
            ..Default::default()
        });
        let mut harness = Harness::new();
        for epoch in 0..4 {
            epoch_end(&mut manager, &mut harness, epoch, 0.5).unwrap();
        }
        assert!(!backend.exists("mlpug-model-epoch-0-model-checkpoint").unwrap());
        assert!(backend.exists("mlpug-model-epoch-1-model-checkpoint").unwrap());
        assert!(backend.exists("mlpug-model-epoch-3-model-checkpoint").unwrap());
        assert!(!backend.exists("mlpug-model-latest-model-checkpoint-backup").unwrap());
    }

    #[test]
    fn test_training_completed_skips_duplicate_write() {
        let (mut manager, backend) = manager(CheckpointManagerConfig {
            metric_to_monitor: None,
            ..Default::default()
        });
        let mut harness = Harness::new();
        epoch_end(&mut manager, &mut harness, 1, 0.5).unwrap();
        let writes = backend.writes().len();
        let mut ctx = harness.ctx(None);
        assert!(Callback::<usize>::on_training_completed(&mut manager, &mut ctx).unwrap());
        assert_eq!(backend.writes().len(), writes);
    }

    /// Fails the next `failures` saves, then behaves like the in-memory backend.
    struct FailingSaves {
        inner: InMemoryCheckpointBackend,
        failures: std::sync::Mutex<usize>,
    }

    impl FailingSaves {
        fn new(failures: usize) -> Self {
            Self {
                inner: InMemoryCheckpointBackend::new(),
                failures: std::sync::Mutex::new(failures),
            }
        }
    }

    impl CheckpointBackend for FailingSaves {
        fn exists(&self, name: &str) -> Result<bool> {
            self.inner.exists(name)
        }

        fn save(
            &self,
            name: &str,
            kind: CheckpointKind,
            payload: &serde_json::Value,
        ) -> Result<crate::checkpoint::CheckpointRecord> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(MlpugError::checkpoint_io("disk full"));
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

        fn records(&self) -> Result<Vec<crate::checkpoint::CheckpointRecord>> {
            self.inner.records()
        }
    }

    #[test]
    fn test_failed_latest_write_is_retried_at_completion() {
        let backend = Arc::new(FailingSaves::new(1));
        let config = CheckpointManagerConfig {
            metric_to_monitor: None,
            archive_last_model_checkpoint_every: 1,
            ..Default::default()
        };
        let mut manager = CheckpointManager::new(config, backend.clone()).unwrap();
        let mut harness = Harness::new();

        let err = epoch_end(&mut manager, &mut harness, 1, 0.5).unwrap_err();
        assert!(matches!(err, MlpugError::CheckpointIo(_)));
        assert_eq!(manager.state.latest_written, 0);
        assert_eq!(manager.state.last_written_at, None);
        assert!(!backend.exists("mlpug-model-latest-model-checkpoint").unwrap());

        let mut ctx = harness.ctx(None);
        assert!(Callback::<usize>::on_training_completed(&mut manager, &mut ctx).unwrap());
        assert!(backend.exists("mlpug-model-latest-model-checkpoint").unwrap());
        assert!(backend.exists("mlpug-model-training-checkpoint").unwrap());
        assert!(backend.exists("mlpug-model-epoch-1-model-checkpoint").unwrap());
        assert_eq!(manager.state.latest_written, 1);
        assert_eq!(manager.state.last_written_at, Some(20));
    }

    #[test]
    fn test_zero_monitor_period_rejected() {
        let backend = Arc::new(InMemoryCheckpointBackend::new());
        let config = CheckpointManagerConfig {
            metric_monitor_period: 0,
            ..Default::default()
        };
        assert!(matches!(CheckpointManager::new(config, backend), Err(MlpugError::Config(_))));
    }

    #[test]
    fn test_state_roundtrip_keeps_best() {
        let (mut manager, _backend) = manager(CheckpointManagerConfig {
            create_checkpoint_every: 0,
            ..Default::default()
        });
        let mut harness = Harness::new();
        epoch_end(&mut manager, &mut harness, 0, 0.4).unwrap();
        let state = Callback::<usize>::get_state(&manager).unwrap().unwrap();

        let (mut restored, backend) = self::manager(CheckpointManagerConfig {
            create_checkpoint_every: 0,
            ..Default::default()
        });
        Callback::<usize>::set_state(&mut restored, state).unwrap();
        epoch_end(&mut restored, &mut harness, 1, 0.5).unwrap();
        assert!(backend.writes().is_empty());
    }
}
