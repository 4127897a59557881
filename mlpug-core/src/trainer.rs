//! Trainer contract consumed by the orchestration core.
//!
//! The trainer owns the model, the optimizer and the backend that executes
//! the tensor math. The core only asks it to train on, or evaluate, a batch
//! and to hand over opaque state blobs for checkpointing.

use crate::data::BatchEvaluation;
use crate::error::Result;

/// Performs the forward/backward/optimizer step for batches of type `B`.
pub trait Trainer<B> {
    /// Train on one batch and report what was computed in the forward pass.
    fn train_on(&mut self, batch: &B) -> Result<BatchEvaluation>;

    /// Evaluate one batch without updating the model.
    fn evaluate_loss(&mut self, batch: &B) -> Result<BatchEvaluation>;

    /// Opaque model parameters, stored in checkpoints.
    fn model_state(&self) -> Result<serde_json::Value>;

    /// Opaque optimizer state, stored in training checkpoints.
    fn optimizer_state(&self) -> Result<serde_json::Value>;

    fn set_model_state(&mut self, state: serde_json::Value) -> Result<()>;

    fn set_optimizer_state(&mut self, state: serde_json::Value) -> Result<()>;

    /// Apply a learning rate. Returns `false` when the trainer has no adjustable rate.
    fn set_learning_rate(&mut self, _learning_rate: f64) -> Result<bool> {
        Ok(false)
    }
}

/// A trainer that is bound to a concrete training model before the run starts.
pub trait ModelTrainer<B>: Trainer<B> {
    type Model;

    fn set_training_model(&mut self, model: Self::Model) -> Result<()>;
}

/// Random access to the batches of a dataset.
pub trait BatchSource<B>: Send + Sync {
    fn num_batches(&self) -> usize;

    fn batch_at(&self, index: usize) -> Option<&B>;
}

impl<B: Send + Sync> BatchSource<B> for Vec<B> {
    fn num_batches(&self) -> usize {
        self.len()
    }

    fn batch_at(&self, index: usize) -> Option<&B> {
        self.get(index)
    }
}
