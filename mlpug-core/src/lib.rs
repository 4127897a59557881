//! # mlpug-core — training orchestration
//!
//! Runs the epoch/batch loop around a user supplied [`Trainer`], computes
//! metrics with a [`MetricEvaluator`], and lets a chain of [`Callback`]s log,
//! report and checkpoint through a shared nested [`LogTree`].
//!
//! Multi-device values pass through the [`DistributedValueGateway`], so the
//! same metric definitions work on one device or many.

pub mod callbacks;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod evaluation;
pub mod logs;
pub mod manager;
pub mod persistence;
pub mod trainer;

pub use callbacks::{Callback, CallbackResult, FailurePolicy, HookContext, LogCondition, every_n_batches};
pub use checkpoint::{
    CheckpointBackend, FileCheckpointBackend, InMemoryCheckpointBackend, ModelCheckpoint, TrainingCheckpoint,
    load_model_checkpoint, load_training_checkpoint,
};
pub use config::{RunConfig, RunOverrides, load_config};
pub use data::{BatchEvaluation, MetricData, PerReplica};
pub use distributed::{DistributedValueGateway, DistributionStrategy, MirroredStrategy, SingleDevice};
pub use error::{MlpugError, Result};
pub use evaluation::{MetricEvaluator, MetricSpec};
pub use logs::{LogTree, LogValue, MetricLevel, get_value_at, set_value_at};
pub use manager::{TrainingManager, TrainingManagerState, TrainingStatus};
pub use trainer::{BatchSource, ModelTrainer, Trainer};
