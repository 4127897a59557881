//! CLI subcommand handlers.

use crate::demo::{DemoBatch, LogisticTrainer, classification_metric, generate_batches};
use crate::{Commands, ConfigAction, TrainArgs};
use anyhow::Context;
use mlpug_core::callbacks::{
    AutoTensorboard, BatchSizeLogger, CheckpointManager, DescribeLogsObject, LogProgress, LrSchedulerCallback,
    LrWarmupSchedule, TestMetricsLogger, TfEventsSink, TrainingMetricsLogger, read_tf_events,
};
use mlpug_core::persistence::sha256_hex;
use mlpug_core::{
    BatchSource, Callback, DistributedValueGateway, FailurePolicy, FileCheckpointBackend, MetricEvaluator,
    MirroredStrategy, ModelCheckpoint, RunConfig, RunOverrides, TrainingCheckpoint, TrainingManager,
    every_n_batches, load_config, load_training_checkpoint,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Train(args) => handle_train(args, workspace),
        Commands::Inspect { file } => handle_inspect(&file),
        Commands::Config { action } => handle_config(action, workspace),
    }
}

fn load(workspace: &Path, overrides: Option<&RunOverrides>) -> anyhow::Result<RunConfig> {
    let config = load_config(Some(workspace), overrides).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    config.validate()?;
    Ok(config)
}

/// Relative paths in the configuration are relative to the workspace.
fn in_workspace(workspace: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

fn evaluator(name: &str, gateway: &DistributedValueGateway) -> mlpug_core::Result<MetricEvaluator> {
    MetricEvaluator::builder(name)
        .gateway(gateway.clone())
        .metric(classification_metric())
        .build()
}

/// Metric loggers first, reporting next, checkpointing last so it sees every metric.
fn build_callbacks(
    config: &RunConfig,
    workspace: &Path,
    gateway: &DistributedValueGateway,
    validation_set: Arc<dyn BatchSource<DemoBatch>>,
    checkpoints: CheckpointManager,
) -> anyhow::Result<Vec<Box<dyn Callback<DemoBatch>>>> {
    let logging = &config.logging;
    let log_condition = every_n_batches(logging.progress_log_period);

    let mut callbacks: Vec<Box<dyn Callback<DemoBatch>>> = vec![Box::new(BatchSizeLogger::new())];

    if config.lr_warmup.enabled {
        let schedule = LrWarmupSchedule::new(config.lr_warmup.num_warmup_iters, config.total_iters())?;
        callbacks.push(Box::new(LrSchedulerCallback::new(config.training.learning_rate, schedule)));
    }

    callbacks.push(Box::new(
        TrainingMetricsLogger::new(evaluator("training", gateway)?)
            .sliding_window_length(logging.training_window_length),
    ));
    callbacks.push(Box::new(
        TestMetricsLogger::new(Arc::clone(&validation_set), "validation", evaluator("validation", gateway)?)
            .log_condition(log_condition.clone())
            .sliding_window_length(logging.validation_window_length),
    ));
    callbacks.push(Box::new(
        TestMetricsLogger::new(validation_set, "validation", evaluator("validation", gateway)?)
            .with_name("TestMetricsLogger[validation.dataset]")
            .batch_level(false),
    ));

    callbacks.push(Box::new(
        LogProgress::new(logging.progress_log_period).set_names(["training", "validation"]),
    ));

    if let Some(metrics_dir) = &logging.metrics_dir {
        let metrics_dir = in_workspace(workspace, metrics_dir);
        for dataset in ["training", "validation"] {
            let sink = TfEventsSink::for_dataset(&metrics_dir, &config.experiment_name, dataset)?;
            info!(path = %sink.path().display(), dataset, "Writing TensorBoard events");
            callbacks.push(Box::new(
                AutoTensorboard::new(dataset, Box::new(sink)).log_condition(log_condition.clone()),
            ));
        }
    }

    if logging.describe_logs {
        callbacks.push(Box::new(DescribeLogsObject::new().describe_at_epoch_end(true)));
    }

    callbacks.push(Box::new(checkpoints));
    Ok(callbacks)
}

fn handle_train(args: TrainArgs, workspace: &Path) -> anyhow::Result<()> {
    let overrides = RunOverrides {
        experiment_name: args.experiment,
        num_epochs: args.epochs,
        replicas: args.replicas,
        seed: args.seed,
        checkpoint_dir: args.checkpoint_dir,
        metrics_dir: args.metrics_dir,
    };
    let config = load(workspace, Some(&overrides))?;
    let training = &config.training;

    let mut rng = StdRng::seed_from_u64(training.seed);
    let training_set: Arc<dyn BatchSource<DemoBatch>> =
        Arc::new(generate_batches(training.num_batches, training.batch_size, &mut rng));
    let validation_set: Arc<dyn BatchSource<DemoBatch>> =
        Arc::new(generate_batches(training.num_validation_batches, training.batch_size, &mut rng));

    let gateway = if training.replicas > 1 {
        DistributedValueGateway::new(Arc::new(MirroredStrategy::new(training.replicas)?))
    } else {
        DistributedValueGateway::default()
    };
    let trainer = LogisticTrainer::new(&mut rng, training.learning_rate, gateway.clone());

    let checkpoint_dir = in_workspace(workspace, &config.checkpoint.dir);
    let backend = Arc::new(FileCheckpointBackend::new(&checkpoint_dir));
    let hyper_parameters = json!({
        "learning_rate": training.learning_rate,
        "batch_size": training.batch_size,
        "replicas": training.replicas,
        "seed": training.seed,
    });
    let checkpoints = CheckpointManager::new(config.checkpoint.manager_config(hyper_parameters), backend.clone())?;
    let training_checkpoint = checkpoints.training_checkpoint_name();

    let callbacks = build_callbacks(&config, workspace, &gateway, validation_set, checkpoints)?;
    let mut manager = TrainingManager::new(trainer, training_set, training.num_epochs)
        .callbacks(callbacks)
        .duration_window_length(config.logging.training_window_length)
        .experiment_data(json!({
            "experiment_name": config.experiment_name,
            "started_at": chrono::Utc::now().to_rfc3339(),
        }));
    for callback in &config.abort_on_failure {
        manager = manager.failure_policy(callback.clone(), FailurePolicy::Abort);
    }

    if args.resume {
        match load_training_checkpoint(backend.as_ref(), &training_checkpoint)? {
            Some(checkpoint) => {
                info!(checkpoint = %training_checkpoint, "Resuming from training checkpoint");
                manager.restore_from_checkpoint(checkpoint)?;
            }
            None => warn!(
                checkpoint = %training_checkpoint,
                dir = %checkpoint_dir.display(),
                "No training checkpoint found, starting a new run"
            ),
        }
    }

    manager.start_training()?;

    println!(
        "\nTraining completed: {} steps, {} callback failure(s)",
        manager.trainer().steps(),
        manager.failures().len()
    );
    if let Some(validation) = manager.logs().node_at("current.validation.dataset") {
        for (metric, value) in validation.scalars() {
            println!("  validation {metric:<28} {value:.4}");
        }
    }
    Ok(())
}

fn is_event_file(file: &Path) -> bool {
    file.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("events.out.tfevents."))
}

fn inspect_event_file(file: &Path) -> anyhow::Result<()> {
    let records = read_tf_events(file)?;
    println!("File:       {}", file.display());
    println!("Kind:       TensorBoard event file");
    println!("Scalars:    {}", records.len());

    let mut latest: std::collections::BTreeMap<&str, (u64, f64)> = std::collections::BTreeMap::new();
    for record in &records {
        latest.insert(record.tag.as_str(), (record.step, record.value));
    }
    for (tag, (step, value)) in latest {
        println!("  {tag:<40} step {step:<8} {value:.6}");
    }
    Ok(())
}

fn handle_inspect(file: &Path) -> anyhow::Result<()> {
    if is_event_file(file) {
        return inspect_event_file(file);
    }
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let value: serde_json::Value =
        serde_json::from_slice(&bytes).with_context(|| format!("{} is not a JSON checkpoint", file.display()))?;

    println!("File:       {}", file.display());
    println!("SHA-256:    {}", sha256_hex(&bytes));
    if value.get("manager_state").is_some() {
        let checkpoint: TrainingCheckpoint = serde_json::from_value(value)?;
        let state = &checkpoint.manager_state;
        println!("Kind:       training checkpoint");
        println!("Created:    {}", checkpoint.created_at.to_rfc3339());
        println!("Run:        {}", state.run_id);
        println!(
            "Position:   epoch {}, batch step {}, global iteration {}{}",
            state.epoch,
            state.batch_step,
            state.global_iter,
            if state.epoch_completed { " (epoch completed)" } else { "" }
        );
        println!("Callbacks:");
        for callback in &state.callbacks {
            let saved = if callback.state.is_some() { "state saved" } else { "stateless" };
            println!("  {:<40} {saved}", callback.name);
        }
    } else {
        let checkpoint: ModelCheckpoint = serde_json::from_value(value)?;
        println!("Kind:       model checkpoint");
        println!("Created:    {}", checkpoint.created_at.to_rfc3339());
        println!(
            "Position:   epoch {}, batch step {}, global iteration {}",
            checkpoint.epoch, checkpoint.batch_step, checkpoint.global_iter
        );
        if let Some(monitored) = &checkpoint.monitored {
            println!("Monitored:  {} = {:.6}", monitored.metric, monitored.value);
        }
    }
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load(workspace, None)?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Init => {
            let config_dir = workspace.join(".mlpug");
            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!("Configuration already exists at {}", config_path.display());
                return Ok(());
            }
            std::fs::create_dir_all(&config_dir)?;
            std::fs::write(&config_path, toml::to_string_pretty(&RunConfig::default())?)?;
            println!("Created {}", config_path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlpug_core::checkpoint::CheckpointBackend;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_relative_paths_resolve_against_workspace() {
        let workspace = Path::new("/tmp/ws");
        assert_eq!(in_workspace(workspace, Path::new("ckpt")), PathBuf::from("/tmp/ws/ckpt"));
        assert_eq!(in_workspace(workspace, Path::new("/abs")), PathBuf::from("/abs"));
    }

    #[test]
    fn test_train_then_resume_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let args = || TrainArgs {
            epochs: Some(2),
            seed: Some(3),
            ..TrainArgs::default()
        };
        handle_train(args(), dir.path()).unwrap();

        let backend = FileCheckpointBackend::new(dir.path().join("checkpoints"));
        assert!(backend.exists("mlpug-model-training-checkpoint").unwrap());
        assert!(backend.exists("mlpug-model-best-model-checkpoint").unwrap());

        let resumed = TrainArgs {
            epochs: Some(3),
            resume: true,
            ..args()
        };
        handle_train(resumed, dir.path()).unwrap();
        let checkpoint = load_training_checkpoint(&backend, "mlpug-model-training-checkpoint")
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.manager_state.epoch, 2);
        assert!(checkpoint.manager_state.epoch_completed);
    }

    #[test]
    fn test_train_writes_tensorboard_events() {
        let dir = tempfile::tempdir().unwrap();
        let args = TrainArgs {
            epochs: Some(1),
            seed: Some(5),
            experiment: Some("demo".to_string()),
            metrics_dir: Some(PathBuf::from("runs")),
            ..TrainArgs::default()
        };
        handle_train(args, dir.path()).unwrap();

        let run_dir = dir.path().join("runs").join("demo").join("validation");
        let event_file = std::fs::read_dir(&run_dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .find(|path| is_event_file(path))
            .unwrap();
        let records = read_tf_events(&event_file).unwrap();
        assert!(records.iter().any(|r| r.tag == "validation.dataset.loss" && r.step == 0));
        inspect_event_file(&event_file).unwrap();
    }

    #[test]
    fn test_config_init_writes_defaults_once() {
        let dir = tempfile::tempdir().unwrap();
        handle_config(ConfigAction::Init, dir.path()).unwrap();
        let text = std::fs::read_to_string(dir.path().join(".mlpug/config.toml")).unwrap();
        let parsed: RunConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, RunConfig::default());
        handle_config(ConfigAction::Init, dir.path()).unwrap();
    }
}
