//! Learning rate scheduling driven by the global iteration.

use super::{Callback, CallbackResult, HookContext, decode_state};
use crate::error::{MlpugError, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Linear warm-up to the base rate over `num_warmup_iters`, then linear decay
/// to zero at `total_iters`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrWarmupSchedule {
    num_warmup_iters: u64,
    total_iters: u64,
}

impl LrWarmupSchedule {
    pub fn new(num_warmup_iters: u64, total_iters: u64) -> Result<Self> {
        if total_iters == 0 || num_warmup_iters > total_iters {
            return Err(MlpugError::config(format!(
                "invalid warm-up schedule: {num_warmup_iters} warm-up iterations for {total_iters} total"
            )));
        }
        Ok(Self {
            num_warmup_iters,
            total_iters,
        })
    }

    /// Multiplier applied to the base learning rate at `iter`.
    pub fn factor(&self, iter: u64) -> f64 {
        if iter < self.num_warmup_iters {
            return (iter + 1) as f64 / self.num_warmup_iters as f64;
        }
        let decay_iters = self.total_iters - self.num_warmup_iters;
        if decay_iters == 0 {
            return 0.0;
        }
        let remaining = self.total_iters.saturating_sub(iter);
        remaining as f64 / decay_iters as f64
    }
}

/// Sets the trainer's learning rate before every training step and logs it
/// as `current.training_params.batch.lr`.
///
/// Only the iteration last scheduled is checkpointed; a resumed run keeps the
/// schedule it was configured with.
pub struct LrSchedulerCallback {
    name: String,
    base_lr: f64,
    schedule: LrWarmupSchedule,
    last_iter: Option<u64>,
    warned_unsupported: bool,
}

#[derive(Serialize, Deserialize)]
struct SchedulerState {
    last_iter: Option<u64>,
}

impl LrSchedulerCallback {
    pub fn new(base_lr: f64, schedule: LrWarmupSchedule) -> Self {
        Self {
            name: "LrSchedulerCallback".to_string(),
            base_lr,
            schedule,
            last_iter: None,
            warned_unsupported: false,
        }
    }

    pub fn learning_rate_at(&self, iter: u64) -> f64 {
        self.base_lr * self.schedule.factor(iter)
    }

    /// Global iteration the learning rate was last set for.
    pub fn last_iter(&self) -> Option<u64> {
        self.last_iter
    }
}

impl<B> Callback<B> for LrSchedulerCallback {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_state(&self) -> Result<Option<serde_json::Value>> {
        let state = SchedulerState {
            last_iter: self.last_iter,
        };
        Ok(Some(serde_json::to_value(state)?))
    }

    fn set_state(&mut self, state: serde_json::Value) -> Result<()> {
        let state: SchedulerState = decode_state(&self.name, state)?;
        self.last_iter = state.last_iter;
        Ok(())
    }

    fn on_batch_training_start(&mut self, _batch: &B, ctx: &mut HookContext<'_, B>) -> CallbackResult {
        let iter = ctx.global_iter();
        let lr = self.learning_rate_at(iter);
        if !ctx.trainer.set_learning_rate(lr)? {
            if !self.warned_unsupported {
                warn!(callback = %self.name, "Trainer does not support setting the learning rate");
                self.warned_unsupported = true;
            }
            return Ok(false);
        }
        ctx.logs.set_path("current.training_params.batch.lr", lr)?;
        self.last_iter = Some(iter);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::test_support::Harness;

    #[test]
    fn test_warmup_then_decay() {
        let schedule = LrWarmupSchedule::new(4, 12).unwrap();
        assert_eq!(schedule.factor(0), 0.25);
        assert_eq!(schedule.factor(3), 1.0);
        assert_eq!(schedule.factor(4), 1.0);
        assert_eq!(schedule.factor(8), 0.5);
        assert_eq!(schedule.factor(12), 0.0);
        assert_eq!(schedule.factor(20), 0.0);
    }

    #[test]
    fn test_invalid_schedule() {
        assert!(LrWarmupSchedule::new(10, 5).is_err());
        assert!(LrWarmupSchedule::new(0, 0).is_err());
    }

    #[test]
    fn test_sets_trainer_rate_and_logs_it() {
        let mut callback = LrSchedulerCallback::new(0.1, LrWarmupSchedule::new(2, 10).unwrap());
        let mut harness = Harness::new();
        harness.at(0, 0, 0);

        let mut ctx = harness.ctx(None);
        assert!(Callback::<usize>::on_batch_training_start(&mut callback, &0, &mut ctx).unwrap());
        assert_eq!(harness.trainer.learning_rate, Some(0.05));
        assert_eq!(harness.logs.number_at("current.training_params.batch.lr"), Some(0.05));
    }

    #[test]
    fn test_restore_keeps_configured_schedule() {
        let mut callback = LrSchedulerCallback::new(0.1, LrWarmupSchedule::new(2, 10).unwrap());
        let mut harness = Harness::new();
        harness.at(1, 3, 7);
        let mut ctx = harness.ctx(None);
        Callback::<usize>::on_batch_training_start(&mut callback, &0, &mut ctx).unwrap();
        let state = Callback::<usize>::get_state(&callback).unwrap().unwrap();

        let mut resumed = LrSchedulerCallback::new(0.2, LrWarmupSchedule::new(2, 20).unwrap());
        Callback::<usize>::set_state(&mut resumed, state).unwrap();
        assert_eq!(resumed.last_iter(), Some(7));
        assert_eq!(resumed.learning_rate_at(10), 0.2 * (10.0 / 18.0));
    }
}
