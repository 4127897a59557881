//! Training manager — drives the epoch/batch loop and fires callback hooks.
//!
//! The manager owns the run's [`LogTree`]. Callbacks read and write it one
//! after another; nothing touches it concurrently.

use crate::callbacks::{Callback, CallbackResult, FailurePolicy, HookContext, Hook, SlidingWindow};
use crate::checkpoint::TrainingCheckpoint;
use crate::data::BatchEvaluation;
use crate::error::{MlpugError, Result};
use crate::logs::LogTree;
use crate::trainer::{BatchSource, ModelTrainer, Trainer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`TrainingManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Created,
    Configured,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for TrainingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Configured => write!(f, "Configured"),
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Private state of one callback, keyed by its name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackState {
    pub name: String,
    pub state: Option<serde_json::Value>,
}

impl CallbackState {
    pub(crate) fn of<B>(callback: &dyn Callback<B>) -> Result<Self> {
        Ok(Self {
            name: callback.name().to_string(),
            state: callback.get_state()?,
        })
    }
}

/// Serialisable snapshot of the manager and its callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingManagerState {
    pub run_id: String,
    pub epoch: usize,
    pub batch_step: usize,
    pub global_iter: u64,
    /// Taken after the epoch's last hook, so resuming starts the next epoch.
    pub epoch_completed: bool,
    #[serde(default)]
    pub experiment_data: serde_json::Value,
    pub callbacks: Vec<CallbackState>,
}

/// A callback hook that reported failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackFailure {
    pub callback: String,
    pub hook: Hook,
    pub epoch: usize,
    pub batch_step: usize,
    pub message: Option<String>,
}

/// Position of the run, shared with callbacks through [`HookContext`].
#[derive(Debug, Clone)]
pub(crate) struct RunInfo {
    pub run_id: String,
    pub epoch: usize,
    pub batch_step: usize,
    pub global_iter: u64,
    pub num_epochs: usize,
    pub num_batches: usize,
    pub epoch_completed: bool,
    pub experiment_data: serde_json::Value,
}

impl RunInfo {
    pub(crate) fn new(num_epochs: usize, num_batches: usize, experiment_data: serde_json::Value) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            epoch: 0,
            batch_step: 0,
            global_iter: 0,
            num_epochs,
            num_batches,
            epoch_completed: false,
            experiment_data,
        }
    }

    pub(crate) fn snapshot(&self, callbacks: Vec<CallbackState>) -> TrainingManagerState {
        TrainingManagerState {
            run_id: self.run_id.clone(),
            epoch: self.epoch,
            batch_step: self.batch_step,
            global_iter: self.global_iter,
            epoch_completed: self.epoch_completed,
            experiment_data: self.experiment_data.clone(),
            callbacks,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ResumePoint {
    epoch: usize,
    batch_step: usize,
    global_iter: u64,
}

/// Runs `num_epochs` passes over a dataset with a trainer, firing callback
/// hooks around every batch and epoch.
pub struct TrainingManager<B, T> {
    trainer: T,
    dataset: Arc<dyn BatchSource<B>>,
    callbacks: Vec<Box<dyn Callback<B>>>,
    num_epochs: usize,
    logs: LogTree,
    run: RunInfo,
    status: TrainingStatus,
    resume_from: Option<ResumePoint>,
    duration_window: SlidingWindow<f64>,
    policy_overrides: HashMap<String, FailurePolicy>,
    failures: Vec<CallbackFailure>,
}

impl<B: 'static, T: Trainer<B>> TrainingManager<B, T> {
    pub fn new(trainer: T, dataset: Arc<dyn BatchSource<B>>, num_epochs: usize) -> Self {
        let num_batches = dataset.num_batches();
        Self {
            trainer,
            dataset,
            callbacks: Vec::new(),
            num_epochs,
            logs: LogTree::new(),
            run: RunInfo::new(num_epochs, num_batches, serde_json::Value::Null),
            status: TrainingStatus::Created,
            resume_from: None,
            duration_window: SlidingWindow::new(1),
            policy_overrides: HashMap::new(),
            failures: Vec::new(),
        }
    }

    /// Append a callback; hooks fire in registration order.
    pub fn callback(mut self, callback: impl Callback<B> + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    pub fn callbacks(mut self, callbacks: Vec<Box<dyn Callback<B>>>) -> Self {
        self.callbacks.extend(callbacks);
        self
    }

    /// Arbitrary run metadata, stored in every state snapshot.
    pub fn experiment_data(mut self, data: serde_json::Value) -> Self {
        self.run.experiment_data = data;
        self
    }

    /// Number of recent batches over which the training step duration is averaged.
    pub fn duration_window_length(mut self, length: usize) -> Self {
        self.duration_window = SlidingWindow::new(length);
        self
    }

    /// Override the failure policy of the callback with the given name.
    pub fn failure_policy(mut self, callback: impl Into<String>, policy: FailurePolicy) -> Self {
        self.policy_overrides.insert(callback.into(), policy);
        self
    }

    pub fn status(&self) -> TrainingStatus {
        self.status
    }

    pub fn logs(&self) -> &LogTree {
        &self.logs
    }

    pub fn trainer(&self) -> &T {
        &self.trainer
    }

    pub fn trainer_mut(&mut self) -> &mut T {
        &mut self.trainer
    }

    pub fn run_id(&self) -> &str {
        &self.run.run_id
    }

    /// Failures recorded for tolerated (or aborting) callback hooks.
    pub fn failures(&self) -> &[CallbackFailure] {
        &self.failures
    }

    /// Validate the run and initialise the log tree.
    pub fn setup(&mut self) -> Result<()> {
        match self.status {
            TrainingStatus::Created => {}
            TrainingStatus::Configured => return Ok(()),
            other => return Err(MlpugError::config(format!("cannot set up a training manager that is {other}"))),
        }
        if self.num_epochs == 0 {
            return Err(MlpugError::config("num_epochs must be at least 1"));
        }
        let num_batches = self.dataset.num_batches();
        if num_batches == 0 {
            return Err(MlpugError::config("training dataset has no batches"));
        }

        let mut seen = std::collections::HashSet::new();
        for callback in &self.callbacks {
            if !seen.insert(callback.name().to_string()) {
                return Err(MlpugError::config(format!("duplicate callback name '{}'", callback.name())));
            }
        }

        self.run.num_epochs = self.num_epochs;
        self.run.num_batches = num_batches;
        self.logs = LogTree::for_run(self.num_epochs - 1, num_batches - 1);
        self.status = TrainingStatus::Configured;
        info!(
            run_id = %self.run.run_id,
            num_epochs = self.num_epochs,
            num_batches,
            callbacks = self.callbacks.len(),
            "Training manager configured"
        );
        Ok(())
    }

    /// Snapshot of the manager and all callback states.
    pub fn get_state(&self) -> Result<TrainingManagerState> {
        let callbacks = self
            .callbacks
            .iter()
            .map(|callback| CallbackState::of(callback.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.run.snapshot(callbacks))
    }

    /// Restore a snapshot; the next [`start_training`](Self::start_training)
    /// continues after the snapshot's batch, or with the next epoch when the
    /// snapshot was taken at the end of an epoch.
    pub fn set_state(&mut self, state: TrainingManagerState) -> Result<()> {
        self.setup()?;
        if self.status != TrainingStatus::Configured {
            return Err(MlpugError::config(format!("cannot restore state while {}", self.status)));
        }

        if state.callbacks.len() != self.callbacks.len() {
            warn!(
                expected = self.callbacks.len(),
                found = state.callbacks.len(),
                "Number of callback states differs from the number of callbacks"
            );
        }
        for (callback, saved) in self.callbacks.iter_mut().zip(state.callbacks) {
            if callback.name() != saved.name {
                warn!(callback = callback.name(), saved = %saved.name, "Callback state belongs to another callback, skipped");
                continue;
            }
            if let Some(s) = saved.state {
                callback.set_state(s)?;
            }
        }

        self.run.run_id = state.run_id;
        self.run.epoch = state.epoch;
        self.run.batch_step = state.batch_step;
        self.run.global_iter = state.global_iter;
        self.run.epoch_completed = state.epoch_completed;
        self.logs.set_path("current.epoch", state.epoch)?;
        self.logs.set_path("current.batch_step", state.batch_step)?;
        self.logs.set_path("current.global_iter", state.global_iter)?;

        self.resume_from = Some(if state.epoch_completed {
            ResumePoint {
                epoch: state.epoch + 1,
                batch_step: 0,
                global_iter: state.global_iter,
            }
        } else {
            ResumePoint {
                epoch: state.epoch,
                batch_step: state.batch_step + 1,
                global_iter: state.global_iter + 1,
            }
        });
        info!(run_id = %self.run.run_id, epoch = state.epoch, batch_step = state.batch_step, "Training state restored");
        Ok(())
    }

    /// Restore model, optimizer and manager state from a training checkpoint.
    pub fn restore_from_checkpoint(&mut self, checkpoint: TrainingCheckpoint) -> Result<()> {
        self.trainer.set_model_state(checkpoint.model_state)?;
        self.trainer.set_optimizer_state(checkpoint.optimizer_state)?;
        self.set_state(checkpoint.manager_state)
    }

    /// Run the training loop to completion.
    pub fn start_training(&mut self) -> Result<()> {
        self.setup()?;
        self.status = TrainingStatus::Running;
        let result = self.run_loop();
        match &result {
            Ok(()) => {
                self.status = TrainingStatus::Completed;
                info!(run_id = %self.run.run_id, failures = self.failures.len(), "Training completed");
            }
            Err(e) => {
                self.status = TrainingStatus::Failed;
                error!(run_id = %self.run.run_id, error = %e, "Training failed");
            }
        }
        result
    }

    fn run_loop(&mut self) -> Result<()> {
        let dataset = Arc::clone(&self.dataset);
        let num_batches = self.run.num_batches;
        let resume = self.resume_from.take();
        let start_epoch = resume.map_or(0, |r| r.epoch);
        if let Some(r) = resume {
            self.run.global_iter = r.global_iter;
            info!(epoch = r.epoch, batch_step = r.batch_step, "Resuming training");
        }

        self.fire(Hook::TrainingStart, None, None)?;

        for epoch in start_epoch..self.num_epochs {
            let first_batch = match resume {
                Some(r) if r.epoch == epoch => r.batch_step,
                _ => 0,
            };
            self.run.epoch = epoch;
            self.run.epoch_completed = false;
            self.logs.set_path("current.epoch", epoch)?;
            let epoch_started = Instant::now();

            self.fire(Hook::EpochStart, None, None)?;

            for batch_step in first_batch..num_batches {
                let Some(batch) = dataset.batch_at(batch_step) else {
                    warn!(batch_step, "Batch unavailable, ending epoch early");
                    break;
                };
                self.run.batch_step = batch_step;
                self.logs.set_path("current.batch_step", batch_step)?;
                self.logs.set_path("current.global_iter", self.run.global_iter)?;

                self.fire(Hook::BatchTrainingStart, Some(batch), None)?;

                let started = Instant::now();
                let evaluation = self.trainer.train_on(batch)?;
                let duration = started.elapsed().as_secs_f64();
                self.duration_window.push(duration);
                self.logs.set_path("current.training_params.batch.duration", duration)?;
                if let Some(mean) = self.duration_window.mean() {
                    self.logs.set_path("current.training_params.window_average.duration", mean)?;
                }
                debug!(epoch, batch_step, global_iter = self.run.global_iter, duration, "Batch trained");

                self.fire(Hook::BatchTrainingCompleted, Some(batch), Some(&evaluation))?;
                self.run.global_iter += 1;
            }

            self.logs
                .set_path("current.training_params.epoch.duration", epoch_started.elapsed().as_secs_f64())?;
            self.run.epoch_completed = true;
            self.fire(Hook::EpochCompleted, None, None)?;
        }

        self.fire(Hook::TrainingCompleted, None, None)
    }

    /// Run `hook` on every callback in registration order.
    fn fire(&mut self, hook: Hook, batch: Option<&B>, evaluation: Option<&BatchEvaluation>) -> Result<()> {
        for index in 0..self.callbacks.len() {
            let (before, rest) = self.callbacks.split_at_mut(index);
            let Some((callback, after)) = rest.split_first_mut() else {
                break;
            };
            let mut ctx = HookContext {
                logs: &mut self.logs,
                trainer: &mut self.trainer,
                training_evaluation: evaluation,
                run: &self.run,
                before: &*before,
                after: &*after,
            };
            let outcome: CallbackResult = match (hook, batch) {
                (Hook::TrainingStart, _) => callback.on_training_start(&mut ctx),
                (Hook::EpochStart, _) => callback.on_epoch_start(&mut ctx),
                (Hook::BatchTrainingStart, Some(b)) => callback.on_batch_training_start(b, &mut ctx),
                (Hook::BatchTrainingCompleted, Some(b)) => callback.on_batch_training_completed(b, &mut ctx),
                (Hook::EpochCompleted, _) => callback.on_epoch_completed(&mut ctx),
                (Hook::TrainingCompleted, _) => callback.on_training_completed(&mut ctx),
                (_, None) => Err(MlpugError::config(format!("{hook} fired without a batch"))),
            };
            let name = callback.name().to_string();
            let policy = self
                .policy_overrides
                .get(&name)
                .copied()
                .unwrap_or_else(|| callback.failure_policy());

            match outcome {
                Ok(true) => {}
                Ok(false) => self.record_failure(name, hook, None, policy)?,
                Err(e) if e.is_fatal() => {
                    error!(callback = %name, %hook, error = %e, "Callback raised a fatal error");
                    return Err(e);
                }
                Err(e) => self.record_failure(name, hook, Some(e), policy)?,
            }
        }
        Ok(())
    }

    fn record_failure(&mut self, callback: String, hook: Hook, err: Option<MlpugError>, policy: FailurePolicy) -> Result<()> {
        match &err {
            Some(e @ MlpugError::CheckpointIo(_)) => {
                error!(callback = %callback, %hook, error = %e, "Checkpoint I/O failed")
            }
            Some(e) => warn!(callback = %callback, %hook, error = %e, "Callback failed"),
            None => warn!(callback = %callback, %hook, "Callback reported failure"),
        }
        self.failures.push(CallbackFailure {
            callback: callback.clone(),
            hook,
            epoch: self.run.epoch,
            batch_step: self.run.batch_step,
            message: err.map(|e| e.to_string()),
        });
        match policy {
            FailurePolicy::Tolerate => Ok(()),
            FailurePolicy::Abort => Err(MlpugError::CallbackFailed {
                callback,
                hook: hook.to_string(),
            }),
        }
    }
}

impl<B: 'static, T: ModelTrainer<B>> TrainingManager<B, T> {
    /// Bind the model to train before the run starts.
    pub fn set_training_model(&mut self, model: T::Model) -> Result<()> {
        if self.status == TrainingStatus::Running {
            return Err(MlpugError::config("cannot replace the training model while training"));
        }
        self.trainer.set_training_model(model)
    }
}
