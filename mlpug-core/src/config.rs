//! Layered run configuration.
//!
//! Precedence, lowest to highest: built-in defaults, the user config
//! (`~/.config/mlpug/config.toml`), the workspace config
//! (`.mlpug/config.toml`), `MLPUG_` environment variables and explicit
//! overrides.

use crate::callbacks::{CheckpointManagerConfig, FailurePolicy, MonitorMode};
use crate::error::{MlpugError, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything needed to configure a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_experiment_name")]
    pub experiment_name: String,
    #[serde(default)]
    pub training: TrainingSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub lr_warmup: LrWarmupSection,
    /// Callbacks whose failures terminate the run; all others are tolerated.
    #[serde(default)]
    pub abort_on_failure: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            experiment_name: default_experiment_name(),
            training: TrainingSection::default(),
            logging: LoggingSection::default(),
            checkpoint: CheckpointSection::default(),
            lr_warmup: LrWarmupSection::default(),
            abort_on_failure: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSection {
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_num_batches")]
    pub num_batches: usize,
    #[serde(default = "default_num_validation_batches")]
    pub num_validation_batches: usize,
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
}

impl Default for TrainingSection {
    fn default() -> Self {
        Self {
            num_epochs: default_num_epochs(),
            batch_size: default_batch_size(),
            num_batches: default_num_batches(),
            num_validation_batches: default_num_validation_batches(),
            replicas: default_replicas(),
            seed: default_seed(),
            learning_rate: default_learning_rate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Batches between progress reports and batch-level validation.
    #[serde(default = "default_log_period")]
    pub progress_log_period: usize,
    #[serde(default = "default_window_length")]
    pub training_window_length: usize,
    #[serde(default = "default_window_length")]
    pub validation_window_length: usize,
    /// Directory of the TensorBoard event files; unset disables them.
    #[serde(default)]
    pub metrics_dir: Option<PathBuf>,
    #[serde(default)]
    pub describe_logs: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            progress_log_period: default_log_period(),
            training_window_length: default_window_length(),
            validation_window_length: default_window_length(),
            metrics_dir: None,
            describe_logs: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSection {
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_base_filename")]
    pub base_filename: String,
    #[serde(default)]
    pub batch_level: bool,
    /// Key path below `current`; empty disables best-model checkpoints.
    #[serde(default = "default_metric_to_monitor")]
    pub metric_to_monitor: String,
    #[serde(default)]
    pub monitor_mode: MonitorMode,
    #[serde(default = "default_period")]
    pub metric_monitor_period: usize,
    #[serde(default = "default_period")]
    pub create_checkpoint_every: usize,
    #[serde(default)]
    pub archive_last_model_checkpoint_every: usize,
    #[serde(default = "default_true")]
    pub backup_before_override: bool,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            base_filename: default_base_filename(),
            batch_level: false,
            metric_to_monitor: default_metric_to_monitor(),
            monitor_mode: MonitorMode::default(),
            metric_monitor_period: default_period(),
            create_checkpoint_every: default_period(),
            archive_last_model_checkpoint_every: 0,
            backup_before_override: true,
        }
    }
}

impl CheckpointSection {
    pub fn manager_config(&self, model_hyper_parameters: serde_json::Value) -> CheckpointManagerConfig {
        let metric = self.metric_to_monitor.trim();
        CheckpointManagerConfig {
            base_checkpoint_filename: self.base_filename.clone(),
            batch_level: self.batch_level,
            metric_to_monitor: (!metric.is_empty()).then(|| metric.to_string()),
            metric_monitor_period: self.metric_monitor_period,
            monitor_mode: self.monitor_mode,
            create_checkpoint_every: self.create_checkpoint_every,
            archive_last_model_checkpoint_every: self.archive_last_model_checkpoint_every,
            backup_before_override: self.backup_before_override,
            model_hyper_parameters,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LrWarmupSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub num_warmup_iters: u64,
}

fn default_experiment_name() -> String {
    "mlpug-experiment".to_string()
}
fn default_num_epochs() -> usize {
    10
}
fn default_batch_size() -> usize {
    32
}
fn default_num_batches() -> usize {
    100
}
fn default_num_validation_batches() -> usize {
    20
}
fn default_replicas() -> usize {
    1
}
fn default_seed() -> u64 {
    42
}
fn default_learning_rate() -> f64 {
    0.1
}
fn default_log_period() -> usize {
    20
}
fn default_window_length() -> usize {
    10
}
fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}
fn default_base_filename() -> String {
    "mlpug-model".to_string()
}
fn default_metric_to_monitor() -> String {
    "validation.dataset.loss".to_string()
}
fn default_period() -> usize {
    1
}
fn default_true() -> bool {
    true
}

impl RunConfig {
    /// Reject settings no run can be started with.
    pub fn validate(&self) -> Result<()> {
        let t = &self.training;
        let l = &self.logging;
        let positive = [
            ("training.num_epochs", t.num_epochs),
            ("training.batch_size", t.batch_size),
            ("training.num_batches", t.num_batches),
            ("training.replicas", t.replicas),
            ("logging.progress_log_period", l.progress_log_period),
            ("logging.training_window_length", l.training_window_length),
            ("logging.validation_window_length", l.validation_window_length),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(MlpugError::config(format!("{key} must be at least 1")));
            }
        }
        if !(t.learning_rate.is_finite() && t.learning_rate > 0.0) {
            return Err(MlpugError::config("training.learning_rate must be a positive number"));
        }
        if self.experiment_name.trim().is_empty() {
            return Err(MlpugError::config("experiment_name must not be empty"));
        }
        if self.lr_warmup.enabled && self.lr_warmup.num_warmup_iters > self.total_iters() {
            return Err(MlpugError::config(
                "lr_warmup.num_warmup_iters exceeds the total number of training iterations",
            ));
        }
        Ok(())
    }

    /// Number of training iterations of the complete run.
    pub fn total_iters(&self) -> u64 {
        (self.training.num_epochs * self.training.num_batches) as u64
    }

    /// Failure policy for the callback with the given name.
    pub fn failure_policy_for(&self, callback: &str) -> FailurePolicy {
        if self.abort_on_failure.iter().any(|name| name == callback) {
            FailurePolicy::Abort
        } else {
            FailurePolicy::Tolerate
        }
    }
}

/// Values set explicitly, typically from command line flags.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub experiment_name: Option<String>,
    pub num_epochs: Option<usize>,
    pub replicas: Option<usize>,
    pub seed: Option<u64>,
    pub checkpoint_dir: Option<PathBuf>,
    pub metrics_dir: Option<PathBuf>,
}

impl RunOverrides {
    fn merge_into(&self, mut figment: Figment) -> Figment {
        if let Some(name) = &self.experiment_name {
            figment = figment.merge(Serialized::default("experiment_name", name));
        }
        if let Some(epochs) = self.num_epochs {
            figment = figment.merge(Serialized::default("training.num_epochs", epochs));
        }
        if let Some(replicas) = self.replicas {
            figment = figment.merge(Serialized::default("training.replicas", replicas));
        }
        if let Some(seed) = self.seed {
            figment = figment.merge(Serialized::default("training.seed", seed));
        }
        if let Some(dir) = &self.checkpoint_dir {
            figment = figment.merge(Serialized::default("checkpoint.dir", dir));
        }
        if let Some(dir) = &self.metrics_dir {
            figment = figment.merge(Serialized::default("logging.metrics_dir", dir));
        }
        figment
    }
}

/// Location of the user-level config file.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "mlpug", "mlpug").map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load the run configuration with layered precedence.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&RunOverrides>,
) -> std::result::Result<RunConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(RunConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".mlpug").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // MLPUG_TRAINING__NUM_EPOCHS, MLPUG_CHECKPOINT__DIR, ...
    figment = figment.merge(Env::prefixed("MLPUG_").split("__"));

    if let Some(overrides) = overrides {
        figment = overrides.merge_into(figment);
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = RunConfig::default();
        config.validate().unwrap();
        assert_eq!(config.total_iters(), 1000);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let mlpug_dir = dir.path().join(".mlpug");
        std::fs::create_dir_all(&mlpug_dir).unwrap();
        std::fs::write(
            mlpug_dir.join("config.toml"),
            r#"
experiment_name = "fashion"

[training]
num_epochs = 3

[checkpoint]
monitor_mode = "higher"
metric_to_monitor = "validation.dataset.accuracy"
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.experiment_name, "fashion");
        assert_eq!(config.training.num_epochs, 3);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.checkpoint.monitor_mode, MonitorMode::Higher);
    }

    #[test]
    fn test_overrides_win_over_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let mlpug_dir = dir.path().join(".mlpug");
        std::fs::create_dir_all(&mlpug_dir).unwrap();
        std::fs::write(mlpug_dir.join("config.toml"), "[training]\nnum_epochs = 3\nseed = 7\n").unwrap();

        let overrides = RunOverrides {
            num_epochs: Some(5),
            ..Default::default()
        };
        let config = load_config(Some(dir.path()), Some(&overrides)).unwrap();
        assert_eq!(config.training.num_epochs, 5);
        assert_eq!(config.training.seed, 7);
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let mut config = RunConfig::default();
        config.logging.training_window_length = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("logging.training_window_length"));
    }

    #[test]
    fn test_validate_rejects_oversized_warmup() {
        let mut config = RunConfig::default();
        config.lr_warmup = LrWarmupSection {
            enabled: true,
            num_warmup_iters: 5_000,
        };
        assert!(matches!(config.validate(), Err(MlpugError::Config(_))));
    }

    #[test]
    fn test_manager_config_empty_metric_disables_monitoring() {
        let section = CheckpointSection {
            metric_to_monitor: String::new(),
            ..Default::default()
        };
        assert_eq!(section.manager_config(serde_json::Value::Null).metric_to_monitor, None);
    }

    #[test]
    fn test_failure_policy_for() {
        let config = RunConfig {
            abort_on_failure: vec!["CheckpointManager".to_string()],
            ..Default::default()
        };
        assert_eq!(config.failure_policy_for("CheckpointManager"), FailurePolicy::Abort);
        assert_eq!(config.failure_policy_for("LogProgress"), FailurePolicy::Tolerate);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = RunConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: RunConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
