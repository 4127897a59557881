//! Training lifecycle callbacks.
//!
//! The manager fires hooks in a fixed order:
//! `on_training_start → {on_epoch_start → {on_batch_training_start →
//! on_batch_training_completed}* → on_epoch_completed}* → on_training_completed`.
//! At every hook, callbacks run one after another in registration order and
//! share the run's [`LogTree`] without locking.
//!
//! Hooks return `Ok(true)` on success and `Ok(false)` on a failure that the
//! callback has already logged. Whether such a failure stops the run is
//! decided by the callback's [`FailurePolicy`]. Errors for which
//! [`MlpugError::is_fatal`] holds always terminate the run.

pub mod batch_size;
pub mod checkpoint;
pub mod describe;
pub mod lr_scheduler;
pub mod progress;
pub mod tensorboard;
pub mod test_metrics;
pub mod training_metrics;
pub mod window;

#[cfg(test)]
pub(crate) mod test_support;

pub use batch_size::{BatchShape, BatchSizeLogger};
pub use checkpoint::{CheckpointManager, CheckpointManagerConfig, MonitorMode};
pub use describe::DescribeLogsObject;
pub use lr_scheduler::{LrSchedulerCallback, LrWarmupSchedule};
pub use progress::LogProgress;
pub use tensorboard::{AutoTensorboard, JsonLinesSink, MemorySink, MetricsSink, ScalarRecord, TfEventsSink, read_tf_events};
pub use test_metrics::TestMetricsLogger;
pub use training_metrics::TrainingMetricsLogger;
pub use window::SlidingWindow;

use crate::data::BatchEvaluation;
use crate::error::{MlpugError, Result};
use crate::logs::{CURRENT, LogTree, MetricLevel};
use crate::manager::{CallbackState, RunInfo, TrainingManagerState};
use crate::trainer::Trainer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Outcome of a hook: `Ok(true)` success, `Ok(false)` tolerated-or-aborting failure.
pub type CallbackResult = Result<bool>;

/// Decides whether a logged hook failure stops the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure and continue with the next callback.
    #[default]
    Tolerate,
    /// Record the failure and terminate the run.
    Abort,
}

/// Lifecycle hooks, used to report where a callback failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    TrainingStart,
    EpochStart,
    BatchTrainingStart,
    BatchTrainingCompleted,
    EpochCompleted,
    TrainingCompleted,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TrainingStart => "on_training_start",
            Self::EpochStart => "on_epoch_start",
            Self::BatchTrainingStart => "on_batch_training_start",
            Self::BatchTrainingCompleted => "on_batch_training_completed",
            Self::EpochCompleted => "on_epoch_completed",
            Self::TrainingCompleted => "on_training_completed",
        };
        f.write_str(name)
    }
}

/// Predicate over the run's logs deciding whether a logger acts at this batch.
pub type LogCondition = Arc<dyn Fn(&LogTree) -> bool + Send + Sync>;

/// Condition that always holds.
pub fn always() -> LogCondition {
    Arc::new(|_: &LogTree| true)
}

/// Condition that holds every `period` batch steps, starting at step 0.
pub fn every_n_batches(period: usize) -> LogCondition {
    let period = period.max(1) as u64;
    Arc::new(move |logs: &LogTree| {
        logs.lookup("current.batch_step")
            .and_then(|v| v.as_count())
            .is_some_and(|step| step % period == 0)
    })
}

/// Key path of a metric level of a dataset inside `current`.
pub(crate) fn level_path(dataset_name: &str, level: MetricLevel) -> String {
    format!("{CURRENT}.{dataset_name}.{}", level.key())
}

/// Everything a callback can see and touch while a hook runs.
pub struct HookContext<'a, B> {
    /// The run's shared log tree.
    pub logs: &'a mut LogTree,
    /// The trainer, borrowed for the duration of the hook.
    pub trainer: &'a mut dyn Trainer<B>,
    pub(crate) training_evaluation: Option<&'a BatchEvaluation>,
    pub(crate) run: &'a RunInfo,
    pub(crate) before: &'a [Box<dyn Callback<B>>],
    pub(crate) after: &'a [Box<dyn Callback<B>>],
}

impl<B> HookContext<'_, B> {
    pub fn epoch(&self) -> usize {
        self.run.epoch
    }

    pub fn batch_step(&self) -> usize {
        self.run.batch_step
    }

    pub fn global_iter(&self) -> u64 {
        self.run.global_iter
    }

    pub fn num_epochs(&self) -> usize {
        self.run.num_epochs
    }

    pub fn num_batches(&self) -> usize {
        self.run.num_batches
    }

    /// What the trainer computed for the batch that was just trained on.
    pub fn training_evaluation(&self) -> Option<&BatchEvaluation> {
        self.training_evaluation
    }

    /// Snapshot of the complete manager state, with `own` providing the state
    /// of the callback the hook is running for.
    pub fn training_state(&self, own: &dyn Callback<B>) -> Result<TrainingManagerState> {
        let mut callbacks = Vec::with_capacity(self.before.len() + self.after.len() + 1);
        for callback in self.before {
            callbacks.push(CallbackState::of(callback.as_ref())?);
        }
        callbacks.push(CallbackState::of(own)?);
        for callback in self.after {
            callbacks.push(CallbackState::of(callback.as_ref())?);
        }
        Ok(self.run.snapshot(callbacks))
    }

    /// Write a metrics subtree under `current.<dataset>.<level>`, replacing what was there.
    pub fn write_metrics(&mut self, dataset_name: &str, level: MetricLevel, metrics: LogTree) -> Result<()> {
        self.logs.set_path(&level_path(dataset_name, level), metrics)
    }
}

/// Observer of the training lifecycle. Every hook defaults to a successful no-op.
pub trait Callback<B>: Send {
    fn name(&self) -> &str;

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Tolerate
    }

    /// Serialisable private state, included in training checkpoints.
    fn get_state(&self) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }

    fn set_state(&mut self, _state: serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn on_training_start(&mut self, _ctx: &mut HookContext<'_, B>) -> CallbackResult {
        Ok(true)
    }

    fn on_epoch_start(&mut self, _ctx: &mut HookContext<'_, B>) -> CallbackResult {
        Ok(true)
    }

    fn on_batch_training_start(&mut self, _batch: &B, _ctx: &mut HookContext<'_, B>) -> CallbackResult {
        Ok(true)
    }

    fn on_batch_training_completed(&mut self, _batch: &B, _ctx: &mut HookContext<'_, B>) -> CallbackResult {
        Ok(true)
    }

    fn on_epoch_completed(&mut self, _ctx: &mut HookContext<'_, B>) -> CallbackResult {
        Ok(true)
    }

    fn on_training_completed(&mut self, _ctx: &mut HookContext<'_, B>) -> CallbackResult {
        Ok(true)
    }
}

/// Deserialize a callback state blob, reporting the callback on failure.
pub(crate) fn decode_state<T: serde::de::DeserializeOwned>(callback: &str, state: serde_json::Value) -> Result<T> {
    serde_json::from_value(state)
        .map_err(|e| MlpugError::config(format!("invalid state for callback '{callback}': {e}")))
}
