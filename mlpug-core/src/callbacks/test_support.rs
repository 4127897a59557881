//! Shared fixtures for callback unit tests.

use super::HookContext;
use crate::data::BatchEvaluation;
use crate::error::{MlpugError, Result};
use crate::logs::LogTree;
use crate::manager::RunInfo;
use crate::trainer::Trainer;
use serde_json::json;

/// Trainer over `usize` batches whose loss is `losses[batch % losses.len()]`.
pub(crate) struct ScriptedTrainer {
    pub losses: Vec<f64>,
    pub steps: u64,
    pub learning_rate: Option<f64>,
}

impl ScriptedTrainer {
    pub fn new(losses: Vec<f64>) -> Self {
        Self {
            losses,
            steps: 0,
            learning_rate: None,
        }
    }

    fn loss_for(&self, batch: usize) -> Result<f64> {
        if self.losses.is_empty() {
            return Err(MlpugError::trainer("no losses scripted"));
        }
        Ok(self.losses[batch % self.losses.len()])
    }
}

impl Trainer<usize> for ScriptedTrainer {
    fn train_on(&mut self, batch: &usize) -> Result<BatchEvaluation> {
        self.steps += 1;
        Ok(BatchEvaluation::new(self.loss_for(*batch)?, 4))
    }

    fn evaluate_loss(&mut self, batch: &usize) -> Result<BatchEvaluation> {
        Ok(BatchEvaluation::new(self.loss_for(*batch)?, 4))
    }

    fn model_state(&self) -> Result<serde_json::Value> {
        Ok(json!({ "steps": self.steps }))
    }

    fn optimizer_state(&self) -> Result<serde_json::Value> {
        Ok(json!({ "lr": self.learning_rate }))
    }

    fn set_model_state(&mut self, state: serde_json::Value) -> Result<()> {
        self.steps = state["steps"].as_u64().unwrap_or(0);
        Ok(())
    }

    fn set_optimizer_state(&mut self, state: serde_json::Value) -> Result<()> {
        self.learning_rate = state["lr"].as_f64();
        Ok(())
    }

    fn set_learning_rate(&mut self, learning_rate: f64) -> Result<bool> {
        self.learning_rate = Some(learning_rate);
        Ok(true)
    }
}

/// Owns what a [`HookContext`] borrows, so a callback can be driven in isolation.
pub(crate) struct Harness {
    pub logs: LogTree,
    pub trainer: ScriptedTrainer,
    pub run: RunInfo,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_trainer(ScriptedTrainer::new(vec![1.0]))
    }

    pub fn with_trainer(trainer: ScriptedTrainer) -> Self {
        Self {
            logs: LogTree::for_run(1, 9),
            trainer,
            run: RunInfo::new(2, 10, serde_json::Value::Null),
        }
    }

    /// Move the run (and `current`) to the given position.
    pub fn at(&mut self, epoch: usize, batch_step: usize, global_iter: u64) {
        self.run.epoch = epoch;
        self.run.batch_step = batch_step;
        self.run.global_iter = global_iter;
        self.logs.set_path("current.epoch", epoch).unwrap();
        self.logs.set_path("current.batch_step", batch_step).unwrap();
        self.logs.set_path("current.global_iter", global_iter).unwrap();
    }

    pub fn ctx<'a>(&'a mut self, evaluation: Option<&'a BatchEvaluation>) -> HookContext<'a, usize> {
        HookContext {
            logs: &mut self.logs,
            trainer: &mut self.trainer,
            training_evaluation: evaluation,
            run: &self.run,
            before: &[],
            after: &[],
        }
    }
}
