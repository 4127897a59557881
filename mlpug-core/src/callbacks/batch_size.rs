//! Records how many samples each training batch holds.

use super::{Callback, CallbackResult, HookContext};
use tracing::warn;

/// How a batch reports its size.
pub trait BatchShape {
    /// Number of samples, for batches that are a sequence of samples.
    fn num_samples(&self) -> Option<usize>;

    /// Size of dimension `dim` of the batch's leading tensor.
    fn dim_size(&self, _dim: usize) -> Option<usize> {
        None
    }
}

impl<T> BatchShape for Vec<T> {
    fn num_samples(&self) -> Option<usize> {
        Some(self.len())
    }
}

/// Writes `current.training_params.batch.batch_size` before every training step.
pub struct BatchSizeLogger {
    name: String,
    batch_dimension: usize,
}

impl BatchSizeLogger {
    pub fn new() -> Self {
        Self {
            name: "BatchSizeLogger".to_string(),
            batch_dimension: 1,
        }
    }

    /// Tensor dimension holding the samples, used when the batch has no sample
    /// count. Defaults to 1, the batch axis of sequence-first tensors.
    pub fn batch_dimension(mut self, dim: usize) -> Self {
        self.batch_dimension = dim;
        self
    }

    fn batch_size(&self, batch: &impl BatchShape) -> Option<usize> {
        batch.num_samples().or_else(|| batch.dim_size(self.batch_dimension))
    }
}

impl Default for BatchSizeLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: BatchShape> Callback<B> for BatchSizeLogger {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_batch_training_start(&mut self, batch: &B, ctx: &mut HookContext<'_, B>) -> CallbackResult {
        let Some(size) = self.batch_size(batch) else {
            warn!(callback = %self.name, dim = self.batch_dimension, "Unable to determine batch size");
            return Ok(false);
        };
        ctx.logs.set_path("current.training_params.batch.batch_size", size)?;
        Ok(true)
    }
}
