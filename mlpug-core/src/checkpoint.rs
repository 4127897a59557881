//! Checkpoint payloads and the storage they are written to.

use crate::error::{MlpugError, Result};
use crate::manager::TrainingManagerState;
use crate::persistence::{atomic_write_json, load_json, sha256_hex};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

const MANIFEST_FILE: &str = "checkpoints.json";

/// Value of the monitored metric at the moment a best-model checkpoint was made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredValue {
    pub metric: String,
    pub value: f64,
}

/// Model parameters plus where in the run they were taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCheckpoint {
    pub hyper_parameters: serde_json::Value,
    pub model_state: serde_json::Value,
    pub epoch: usize,
    pub batch_step: usize,
    pub global_iter: u64,
    #[serde(default)]
    pub monitored: Option<MonitoredValue>,
    pub created_at: DateTime<Utc>,
}

/// Everything needed to resume a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingCheckpoint {
    pub hyper_parameters: serde_json::Value,
    pub model_state: serde_json::Value,
    pub optimizer_state: serde_json::Value,
    pub manager_state: TrainingManagerState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Model,
    Training,
}

/// Manifest entry of a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: String,
    pub name: String,
    pub kind: CheckpointKind,
    pub location: String,
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl CheckpointRecord {
    fn new(name: &str, kind: CheckpointKind, location: String, bytes: &[u8]) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            kind,
            location,
            hash: sha256_hex(bytes),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        }
    }
}

/// Named storage for checkpoint payloads.
pub trait CheckpointBackend: Send + Sync {
    fn exists(&self, name: &str) -> Result<bool>;

    /// Store `payload` under `name`, replacing what was there.
    fn save(&self, name: &str, kind: CheckpointKind, payload: &serde_json::Value) -> Result<CheckpointRecord>;

    fn load(&self, name: &str) -> Result<Option<serde_json::Value>>;

    fn rename(&self, from: &str, to: &str) -> Result<()>;

    fn copy(&self, from: &str, to: &str) -> Result<()>;

    /// Every stored checkpoint, oldest first.
    fn records(&self) -> Result<Vec<CheckpointRecord>>;
}

/// Stores each checkpoint as `<dir>/<name>.json` next to a `checkpoints.json` manifest.
#[derive(Debug, Clone)]
pub struct FileCheckpointBackend {
    dir: PathBuf,
}

impl FileCheckpointBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    fn update_manifest(&self, update: impl FnOnce(&mut Vec<CheckpointRecord>)) -> Result<()> {
        let path = self.manifest_path();
        let mut records: Vec<CheckpointRecord> = load_json(&path)?.unwrap_or_default();
        update(&mut records);
        atomic_write_json(&path, &records)?;
        Ok(())
    }
}

fn fs_error(action: &str, name: &str, err: std::io::Error) -> MlpugError {
    MlpugError::checkpoint_io(format!("failed to {action} checkpoint '{name}': {err}"))
}

impl CheckpointBackend for FileCheckpointBackend {
    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.path_of(name).exists())
    }

    fn save(&self, name: &str, kind: CheckpointKind, payload: &serde_json::Value) -> Result<CheckpointRecord> {
        let path = self.path_of(name);
        let bytes = atomic_write_json(&path, payload)?;
        let record = CheckpointRecord::new(name, kind, path.display().to_string(), &bytes);
        let entry = record.clone();
        self.update_manifest(|records| {
            records.retain(|r| r.name != entry.name);
            records.push(entry);
        })?;
        debug!(checkpoint = name, size_bytes = record.size_bytes, "Checkpoint written");
        Ok(record)
    }

    fn load(&self, name: &str) -> Result<Option<serde_json::Value>> {
        load_json(&self.path_of(name))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let target = self.path_of(to);
        std::fs::rename(self.path_of(from), &target).map_err(|e| fs_error("rename", from, e))?;
        let location = target.display().to_string();
        self.update_manifest(|records| {
            records.retain(|r| r.name != to);
            for record in records.iter_mut().filter(|r| r.name == from) {
                record.name = to.to_string();
                record.location = location.clone();
            }
        })
    }

    fn copy(&self, from: &str, to: &str) -> Result<()> {
        let target = self.path_of(to);
        std::fs::copy(self.path_of(from), &target).map_err(|e| fs_error("copy", from, e))?;
        let location = target.display().to_string();
        self.update_manifest(|records| {
            let source = records.iter().find(|r| r.name == from).cloned();
            records.retain(|r| r.name != to);
            if let Some(mut record) = source {
                record.id = uuid::Uuid::new_v4().to_string();
                record.name = to.to_string();
                record.location = location;
                record.created_at = Utc::now();
                records.push(record);
            }
        })
    }

    fn records(&self) -> Result<Vec<CheckpointRecord>> {
        Ok(load_json(&self.manifest_path())?.unwrap_or_default())
    }
}

/// Keeps checkpoints in memory; useful for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointBackend {
    entries: Mutex<BTreeMap<String, (CheckpointRecord, serde_json::Value)>>,
    writes: Mutex<Vec<String>>,
}

impl InMemoryCheckpointBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names passed to `save`, in call order.
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    fn poisoned() -> MlpugError {
        MlpugError::checkpoint_io("in-memory checkpoint store is poisoned")
    }
}

impl CheckpointBackend for InMemoryCheckpointBackend {
    fn exists(&self, name: &str) -> Result<bool> {
        let entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        Ok(entries.contains_key(name))
    }

    fn save(&self, name: &str, kind: CheckpointKind, payload: &serde_json::Value) -> Result<CheckpointRecord> {
        let bytes = serde_json::to_vec(payload)?;
        let record = CheckpointRecord::new(name, kind, format!("memory://{name}"), &bytes);
        self.entries
            .lock()
            .map_err(|_| Self::poisoned())?
            .insert(name.to_string(), (record.clone(), payload.clone()));
        self.writes.lock().map_err(|_| Self::poisoned())?.push(name.to_string());
        Ok(record)
    }

    fn load(&self, name: &str) -> Result<Option<serde_json::Value>> {
        let entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        Ok(entries.get(name).map(|(_, payload)| payload.clone()))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        let (mut record, payload) = entries
            .remove(from)
            .ok_or_else(|| MlpugError::checkpoint_io(format!("checkpoint '{from}' does not exist")))?;
        record.name = to.to_string();
        record.location = format!("memory://{to}");
        entries.insert(to.to_string(), (record, payload));
        Ok(())
    }

    fn copy(&self, from: &str, to: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        let (mut record, payload) = entries
            .get(from)
            .cloned()
            .ok_or_else(|| MlpugError::checkpoint_io(format!("checkpoint '{from}' does not exist")))?;
        record.id = uuid::Uuid::new_v4().to_string();
        record.name = to.to_string();
        record.location = format!("memory://{to}");
        entries.insert(to.to_string(), (record, payload));
        Ok(())
    }

    fn records(&self) -> Result<Vec<CheckpointRecord>> {
        let entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        let mut records: Vec<_> = entries.values().map(|(record, _)| record.clone()).collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

/// Read a training checkpoint, `Ok(None)` when it does not exist.
pub fn load_training_checkpoint(backend: &dyn CheckpointBackend, name: &str) -> Result<Option<TrainingCheckpoint>> {
    backend
        .load(name)?
        .map(|payload| {
            serde_json::from_value(payload)
                .map_err(|e| MlpugError::checkpoint_io(format!("checkpoint '{name}' is not a training checkpoint: {e}")))
        })
        .transpose()
}

/// Read a model checkpoint, `Ok(None)` when it does not exist.
pub fn load_model_checkpoint(backend: &dyn CheckpointBackend, name: &str) -> Result<Option<ModelCheckpoint>> {
    backend
        .load(name)?
        .map(|payload| {
            serde_json::from_value(payload)
                .map_err(|e| MlpugError::checkpoint_io(format!("checkpoint '{name}' is not a model checkpoint: {e}")))
        })
        .transpose()
}
