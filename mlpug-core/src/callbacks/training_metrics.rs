//! Metrics over the batches the model is trained on.

use super::window::SlidingWindow;
use super::{Callback, CallbackResult, FailurePolicy, HookContext, LogCondition, decode_state, every_n_batches};
use crate::error::Result;
use crate::evaluation::{GatheredInputs, MetricEvaluator};
use crate::logs::MetricLevel;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Logs batch-level and sliding-window-averaged metrics for the training set.
///
/// Metric inputs are gathered from the training evaluation of every batch, so
/// the window is complete even for batches where the log condition does not hold.
pub struct TrainingMetricsLogger {
    name: String,
    dataset_name: String,
    evaluator: MetricEvaluator,
    log_condition: LogCondition,
    window: SlidingWindow<GatheredInputs>,
    inspect_sliding_windows: bool,
    policy: FailurePolicy,
}

#[derive(Serialize, Deserialize)]
struct LoggerState {
    window: SlidingWindow<GatheredInputs>,
}

impl TrainingMetricsLogger {
    pub fn new(evaluator: MetricEvaluator) -> Self {
        Self {
            name: "TrainingMetricsLogger".to_string(),
            dataset_name: "training".to_string(),
            evaluator,
            log_condition: every_n_batches(1),
            window: SlidingWindow::new(1),
            inspect_sliding_windows: false,
            policy: FailurePolicy::Tolerate,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn dataset_name(mut self, dataset_name: impl Into<String>) -> Self {
        self.dataset_name = dataset_name.into();
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

    /// Log the size of the window every time window averages are computed.
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
}

impl<B> Callback<B> for TrainingMetricsLogger {
    fn name(&self) -> &str {
        &self.name
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.policy
    }

    fn get_state(&self) -> Result<Option<serde_json::Value>> {
        let state = LoggerState {
            window: self.window.clone(),
        };
        Ok(Some(serde_json::to_value(state)?))
    }

    fn set_state(&mut self, state: serde_json::Value) -> Result<()> {
        let state: LoggerState = decode_state(&self.name, state)?;
        self.window = state.window.with_length(self.window.length());
        Ok(())
    }

    fn on_batch_training_completed(&mut self, _batch: &B, ctx: &mut HookContext<'_, B>) -> CallbackResult {
        let Some(evaluation) = ctx.training_evaluation() else {
            warn!(callback = %self.name, "No training evaluation available for this batch");
            return Ok(false);
        };

        let gathered = self.evaluator.gather(evaluation);
        self.window.push(gathered.clone());

        if !(self.log_condition)(&*ctx.logs) {
            return Ok(true);
        }

        let batch_metrics = self.evaluator.compute(&gathered);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::test_support::Harness;
    use crate::data::BatchEvaluation;
    use crate::distributed::DistributedValueGateway;

    fn logger(window: usize) -> TrainingMetricsLogger {
        let evaluator = MetricEvaluator::loss_only("training", DistributedValueGateway::default()).unwrap();
        TrainingMetricsLogger::new(evaluator).sliding_window_length(window)
    }

    fn run_batch(logger: &mut TrainingMetricsLogger, harness: &mut Harness, loss: f64) -> bool {
        let evaluation = BatchEvaluation::new(loss, 4);
        let mut ctx = harness.ctx(Some(&evaluation));
        Callback::<usize>::on_batch_training_completed(logger, &0, &mut ctx).unwrap()
    }

    #[test]
    fn test_window_average_of_constant_loss() {
        let mut logger = logger(2);
        let mut harness = Harness::new();
        for _ in 0..3 {
            assert!(run_batch(&mut logger, &mut harness, 2.0));
            let avg = harness.logs.number_at("current.training.window_average.loss").unwrap();
            assert!((avg - 2.0).abs() < 1e-12);
        }
        assert_eq!(logger.window().len(), 2);
    }

    #[test]
    fn test_window_average_mixes_batches() {
        let mut logger = logger(2);
        let mut harness = Harness::new();
        run_batch(&mut logger, &mut harness, 1.0);
        run_batch(&mut logger, &mut harness, 3.0);
        assert_eq!(harness.logs.number_at("current.training.batch.loss"), Some(3.0));
        assert_eq!(harness.logs.number_at("current.training.window_average.loss"), Some(2.0));
    }

    #[test]
    fn test_condition_false_still_fills_window() {
        let mut logger = logger(3).log_condition(std::sync::Arc::new(|_: &crate::logs::LogTree| false));
        let mut harness = Harness::new();
        assert!(run_batch(&mut logger, &mut harness, 1.0));
        assert_eq!(logger.window().len(), 1);
        assert!(harness.logs.lookup("current.training.batch").is_none());
    }

    #[test]
    fn test_missing_evaluation_is_failure() {
        let mut logger = logger(2);
        let mut harness = Harness::new();
        let mut ctx = harness.ctx(None);
        assert!(!Callback::<usize>::on_batch_training_completed(&mut logger, &0, &mut ctx).unwrap());
    }

    #[test]
    fn test_state_roundtrip() {
        let mut logger = logger(2);
        let mut harness = Harness::new();
        run_batch(&mut logger, &mut harness, 1.0);
        let state = Callback::<usize>::get_state(&logger).unwrap().unwrap();

        let mut restored = self::logger(2);
        Callback::<usize>::set_state(&mut restored, state).unwrap();
        assert_eq!(restored.window(), logger.window());
    }

    #[test]
    fn test_restore_clamps_to_configured_length() {
        let mut logger = logger(3);
        let mut harness = Harness::new();
        for loss in [1.0, 2.0, 3.0] {
            run_batch(&mut logger, &mut harness, loss);
        }
        let state = Callback::<usize>::get_state(&logger).unwrap().unwrap();

        let mut restored = self::logger(2);
        Callback::<usize>::set_state(&mut restored, state).unwrap();
        assert_eq!(restored.window().length(), 2);
        assert_eq!(restored.window().len(), 2);

        run_batch(&mut restored, &mut harness, 4.0);
        assert_eq!(harness.logs.number_at("current.training.window_average.loss"), Some(3.5));
    }

    #[test]
    fn test_state_with_nan_loss_restores() {
        let mut logger = logger(2);
        let mut harness = Harness::new();
        run_batch(&mut logger, &mut harness, f64::NAN);
        run_batch(&mut logger, &mut harness, 1.0);
        let state = Callback::<usize>::get_state(&logger).unwrap().unwrap();
        let state: serde_json::Value = serde_json::from_str(&serde_json::to_string(&state).unwrap()).unwrap();

        let mut restored = self::logger(2);
        Callback::<usize>::set_state(&mut restored, state).unwrap();
        let losses: Vec<f64> = restored
            .window()
            .iter()
            .map(|inputs| inputs["loss"].as_vector().unwrap()[0])
            .collect();
        assert!(losses[0].is_nan());
        assert_eq!(losses[1], 1.0);
    }
}
