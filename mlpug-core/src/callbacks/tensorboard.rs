//! Streams logged metrics to an external visualization sink.

use super::{Callback, CallbackResult, HookContext, LogCondition, every_n_batches, level_path};
use crate::error::{MlpugError, Result};
use crate::logs::{LogTree, MetricLevel};
use crc32fast::Hasher as Crc32;
use prost::Message;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One value written to a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub tag: String,
    pub value: f64,
    pub step: u64,
    pub wall_time: f64,
}

/// Receives `(tag, value, step)` scalars.
pub trait MetricsSink: Send {
    fn write_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

fn wall_time() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Appends one JSON object per scalar to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    out: BufWriter<File>,
}

impl JsonLinesSink {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    /// `<log_dir>/<experiment>/<dataset>.jsonl`
    pub fn for_dataset(log_dir: &Path, experiment_name: &str, dataset_name: &str) -> Result<Self> {
        Self::create(log_dir.join(experiment_name).join(format!("{dataset_name}.jsonl")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonLinesSink {
    fn write_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        let record = ScalarRecord {
            tag: tag.to_string(),
            value,
            step,
            wall_time: wall_time(),
        };
        serde_json::to_writer(&mut self.out, &record)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Writes TensorBoard event files: length-prefixed `Event` protos with masked
/// CRC32 checksums, one file per sink.
pub struct TfEventsSink {
    path: PathBuf,
    out: BufWriter<File>,
}

const FILE_VERSION: &str = "brain.Event:2";

impl TfEventsSink {
    /// Start a new `events.out.tfevents.<timestamp>.<host>` file in `dir`.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let filename = format!("events.out.tfevents.{}.{}", chrono::Utc::now().timestamp(), hostname());
        let path = dir.join(filename);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut sink = Self {
            path,
            out: BufWriter::new(file),
        };
        sink.write_event(&Event {
            wall_time: wall_time(),
            step: 0,
            file_version: Some(FILE_VERSION.to_string()),
            summary: None,
        })?;
        debug!(path = %sink.path.display(), "Created TensorBoard event file");
        Ok(sink)
    }

    /// An event file in `<log_dir>/<experiment>/<dataset>/`, one TensorBoard run per dataset.
    pub fn for_dataset(log_dir: &Path, experiment_name: &str, dataset_name: &str) -> Result<Self> {
        Self::create(log_dir.join(experiment_name).join(dataset_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_event(&mut self, event: &Event) -> Result<()> {
        let data = event.encode_to_vec();
        let len = (data.len() as u64).to_le_bytes();
        self.out.write_all(&len)?;
        self.out.write_all(&masked_crc32(&len).to_le_bytes())?;
        self.out.write_all(&data)?;
        self.out.write_all(&masked_crc32(&data).to_le_bytes())?;
        Ok(())
    }
}

impl MetricsSink for TfEventsSink {
    fn write_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        self.write_event(&Event {
            wall_time: wall_time(),
            step: i64::try_from(step).unwrap_or(i64::MAX),
            file_version: None,
            summary: Some(Summary {
                value: vec![SummaryValue {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

impl Drop for TfEventsSink {
    fn drop(&mut self) {
        let _ = self.out.flush();
    }
}

/// Read the scalar summaries of an event file, checking every record's checksums.
pub fn read_tf_events(path: &Path) -> Result<Vec<ScalarRecord>> {
    let bytes = std::fs::read(path)?;
    let corrupt = |what: &str| MlpugError::Io(std::io::Error::new(ErrorKind::InvalidData, format!("{}: {what}", path.display())));

    let mut records = Vec::new();
    let mut rest = bytes.as_slice();
    while !rest.is_empty() {
        let (header, tail) = rest.split_at_checked(12).ok_or_else(|| corrupt("truncated record header"))?;
        let (len_bytes, len_crc) = header.split_at(8);
        if masked_crc32(len_bytes).to_le_bytes() != len_crc {
            return Err(corrupt("record length checksum mismatch"));
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(len_bytes);
        let len = usize::try_from(u64::from_le_bytes(len)).map_err(|_| corrupt("record too large"))?;

        let (data, tail) = tail.split_at_checked(len).ok_or_else(|| corrupt("truncated record"))?;
        let (data_crc, tail) = tail.split_at_checked(4).ok_or_else(|| corrupt("truncated record checksum"))?;
        if masked_crc32(data).to_le_bytes() != data_crc {
            return Err(corrupt("record data checksum mismatch"));
        }
        rest = tail;

        let event = Event::decode(data).map_err(|e| corrupt(&format!("undecodable event: {e}")))?;
        let Some(summary) = event.summary else {
            continue;
        };
        for value in summary.value {
            if let Some(simple_value) = value.simple_value {
                records.push(ScalarRecord {
                    tag: value.tag,
                    value: f64::from(simple_value),
                    step: u64::try_from(event.step).unwrap_or(0),
                    wall_time: event.wall_time,
                });
            }
        }
    }
    Ok(records)
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

/// `tensorflow.Event`, with the `what` oneof flattened to the two members written here.
#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<SummaryValue>,
}

#[derive(Clone, PartialEq, Message)]
struct SummaryValue {
    #[prost(string, tag = "1")]
    tag: String,
    #[prost(float, optional, tag = "2")]
    simple_value: Option<f32>,
}

/// Collects scalars in memory; clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<ScalarRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ScalarRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl MetricsSink for MemorySink {
    fn write_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| MlpugError::Io(std::io::Error::other("metrics sink lock poisoned")))?;
        records.push(ScalarRecord {
            tag: tag.to_string(),
            value,
            step,
            wall_time: wall_time(),
        });
        Ok(())
    }
}

/// Sends the metrics of one dataset to a [`MetricsSink`].
///
/// Batch and window-average metrics are written after batches for which the
/// log condition holds, stepped by global iteration. Dataset and epoch metrics
/// are written after each epoch, stepped by epoch. Tags are the key paths
/// below `current`, e.g. `validation.window_average.loss`.
pub struct AutoTensorboard {
    name: String,
    dataset_name: String,
    sink: Box<dyn MetricsSink>,
    log_condition: LogCondition,
}

impl AutoTensorboard {
    pub fn new(dataset_name: impl Into<String>, sink: Box<dyn MetricsSink>) -> Self {
        let dataset_name = dataset_name.into();
        Self {
            name: format!("AutoTensorboard[{dataset_name}]"),
            dataset_name,
            sink,
            log_condition: every_n_batches(1),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn log_condition(mut self, condition: LogCondition) -> Self {
        self.log_condition = condition;
        self
    }

    fn write_levels(&mut self, logs: &LogTree, levels: &[MetricLevel], step: u64) -> Result<usize> {
        let mut written = 0;
        for level in levels {
            let Some(metrics) = logs.node_at(&level_path(&self.dataset_name, *level)) else {
                continue;
            };
            for (metric, value) in metrics.scalars() {
                let tag = format!("{}.{}.{metric}", self.dataset_name, level.key());
                self.sink.write_scalar(&tag, value, step)?;
                written += 1;
            }
        }
        Ok(written)
    }
}

impl<B> Callback<B> for AutoTensorboard {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_batch_training_completed(&mut self, _batch: &B, ctx: &mut HookContext<'_, B>) -> CallbackResult {
        if !(self.log_condition)(&*ctx.logs) {
            return Ok(true);
        }
        let step = ctx.global_iter();
        self.write_levels(ctx.logs, &[MetricLevel::Batch, MetricLevel::WindowAverage], step)?;
        Ok(true)
    }

    fn on_epoch_completed(&mut self, ctx: &mut HookContext<'_, B>) -> CallbackResult {
        let step = ctx.epoch() as u64;
        self.write_levels(ctx.logs, &[MetricLevel::Dataset, MetricLevel::Epoch], step)?;
        self.sink.flush()?;
        Ok(true)
    }

    fn on_training_completed(&mut self, _ctx: &mut HookContext<'_, B>) -> CallbackResult {
        self.sink.flush()?;
        Ok(true)
    }
}
