//! Traces the structure of the log tree, for debugging callback chains.

use super::{Callback, CallbackResult, HookContext, LogCondition, every_n_batches};
use crate::logs::LogTree;
use tracing::info;

pub struct DescribeLogsObject {
    name: String,
    log_condition: LogCondition,
    describe_at_epoch_end: bool,
}

impl DescribeLogsObject {
    pub fn new() -> Self {
        Self {
            name: "DescribeLogsObject".to_string(),
            log_condition: every_n_batches(1),
            describe_at_epoch_end: false,
        }
    }

    pub fn log_condition(mut self, condition: LogCondition) -> Self {
        self.log_condition = condition;
        self
    }

    pub fn describe_at_epoch_end(mut self, enabled: bool) -> Self {
        self.describe_at_epoch_end = enabled;
        self
    }

    fn describe(&self, logs: &LogTree) -> usize {
        let structure = logs.describe();
        for (path, kind) in &structure {
            info!(callback = %self.name, path = %path, kind, "Log tree entry");
        }
        structure.len()
    }
}

impl Default for DescribeLogsObject {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> Callback<B> for DescribeLogsObject {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_batch_training_completed(&mut self, _batch: &B, ctx: &mut HookContext<'_, B>) -> CallbackResult {
        if (self.log_condition)(&*ctx.logs) {
            self.describe(ctx.logs);
        }
        Ok(true)
    }

    fn on_epoch_completed(&mut self, ctx: &mut HookContext<'_, B>) -> CallbackResult {
        if self.describe_at_epoch_end {
            self.describe(ctx.logs);
        }
        Ok(true)
    }
}
