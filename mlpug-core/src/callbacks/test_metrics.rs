//! Metrics over a held-out dataset, either a batch at a time or a full pass per epoch.

use super::window::SlidingWindow;
use super::{Callback, CallbackResult, FailurePolicy, HookContext, LogCondition, decode_state, every_n_batches};
use crate::error::Result;
use crate::evaluation::{GatheredInputs, MetricEvaluator};
use crate::logs::MetricLevel;
use crate::trainer::BatchSource;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Evaluates a dataset that is not trained on, typically the validation set.
///
/// In batch-level mode, every time the log condition holds it evaluates the
/// next batch of the dataset (cycling) and logs `batch` and `window_average`
/// metrics. Otherwise it evaluates the whole dataset once per epoch and logs
/// `dataset` metrics.
pub struct TestMetricsLogger<B> {
    name: String,
    dataset: Arc<dyn BatchSource<B>>,
    dataset_name: String,
    evaluator: MetricEvaluator,
    batch_level: bool,
    log_condition: LogCondition,
    window: SlidingWindow<GatheredInputs>,
    cursor: usize,
    inspect_sliding_windows: bool,
    policy: FailurePolicy,
}

#[derive(Serialize, Deserialize)]
struct LoggerState {
    window: SlidingWindow<GatheredInputs>,
    cursor: usize,
}

impl<B> TestMetricsLogger<B> {
    pub fn new(dataset: Arc<dyn BatchSource<B>>, dataset_name: impl Into<String>, evaluator: MetricEvaluator) -> Self {
        let dataset_name = dataset_name.into();
        Self {
            name: format!("TestMetricsLogger[{dataset_name}]"),
            dataset,
            dataset_name,
            evaluator,
            batch_level: true,
            log_condition: every_n_batches(1),
            window: SlidingWindow::new(1),
            cursor: 0,
            inspect_sliding_windows: false,
            policy: FailurePolicy::Tolerate,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// `false` switches to one full-dataset evaluation per epoch.
    pub fn batch_level(mut self, batch_level: bool) -> Self {
        self.batch_level = batch_level;
        self
    }

    pub fn log_condition(mut self, condition: LogCondition) -> Self {
        self.log_condition = condition;
        self
    }

    pub fn sliding_window_length(mut self, length: usize) -> Self {
        self.window = SlidingWindow::new(length);
        self
    }

    pub fn inspect_sliding_windows(mut self, inspect: bool) -> Self {
        self.inspect_sliding_windows = inspect;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn window(&self) -> &SlidingWindow<GatheredInputs> {
        &self.window
    }

    fn evaluate_next_batch(&mut self, ctx: &mut HookContext<'_, B>) -> CallbackResult {
        let num_batches = self.dataset.num_batches();
        if num_batches == 0 {
            warn!(callback = %self.name, dataset = %self.dataset_name, "Dataset is empty, nothing to evaluate");
            return Ok(false);
        }

        let index = self.cursor % num_batches;
        self.cursor = (index + 1) % num_batches;
        let Some(batch) = self.dataset.batch_at(index) else {
            warn!(callback = %self.name, index, "Dataset batch unavailable");
            return Ok(false);
        };

        let evaluation = ctx.trainer.evaluate_loss(batch)?;
        let gathered = self.evaluator.gather_owned(evaluation);
        let batch_metrics = self.evaluator.compute(&gathered);
        self.window.push(gathered);
        let window_metrics = self.evaluator.compute_over(&self.window);
        if self.inspect_sliding_windows {
            debug!(
                callback = %self.name,
                window_len = self.window.len(),
                window_length = self.window.length(),
                "Sliding window inspected"
            );
        }

        let success = !batch_metrics.is_empty() && !window_metrics.is_empty();
        ctx.write_metrics(&self.dataset_name, MetricLevel::Batch, batch_metrics)?;
        ctx.write_metrics(&self.dataset_name, MetricLevel::WindowAverage, window_metrics)?;
        Ok(success)
    }
}

impl<B> Callback<B> for TestMetricsLogger<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.policy
    }

    fn get_state(&self) -> Result<Option<serde_json::Value>> {
        if !self.batch_level {
            return Ok(None);
        }
        let state = LoggerState {
            window: self.window.clone(),
            cursor: self.cursor,
        };
        Ok(Some(serde_json::to_value(state)?))
    }

    fn set_state(&mut self, state: serde_json::Value) -> Result<()> {
        let state: LoggerState = decode_state(&self.name, state)?;
        self.window = state.window.with_length(self.window.length());
        self.cursor = state.cursor;
        Ok(())
    }

    fn on_batch_training_completed(&mut self, _batch: &B, ctx: &mut HookContext<'_, B>) -> CallbackResult {
        if !self.batch_level || !(self.log_condition)(&*ctx.logs) {
            return Ok(true);
        }
        self.evaluate_next_batch(ctx)
    }

    fn on_epoch_completed(&mut self, ctx: &mut HookContext<'_, B>) -> CallbackResult {
        if self.batch_level {
            return Ok(true);
        }
        if self.dataset.num_batches() == 0 {
            warn!(callback = %self.name, dataset = %self.dataset_name, "Dataset is empty, nothing to evaluate");
            return Ok(false);
        }

        let metrics = self.evaluator.evaluate_dataset(&mut *ctx.trainer, self.dataset.as_ref())?;
        let success = !metrics.is_empty();
        ctx.write_metrics(&self.dataset_name, MetricLevel::Dataset, metrics)?;
        Ok(success)
    }
}
