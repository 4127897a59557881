//! Human-readable progress reports of the log tree.

use super::{Callback, CallbackResult, HookContext, LogCondition, every_n_batches};
use crate::logs::{CURRENT, LogTree, LogValue, MetricLevel, NON_METRIC_KEYS};
use std::io::{self, Write};

const UNKNOWN: &str = "[UNKNOWN]";
const EPOCH_SEPARATOR: &str = "###############################################################################";

/// Writes the metrics of the configured datasets at every metric level.
///
/// A report is written after each batch for which the log condition holds,
/// and a summary after each epoch.
pub struct LogProgress {
    name: String,
    set_names: Vec<String>,
    batch_level: bool,
    log_condition: LogCondition,
    out: Box<dyn Write + Send>,
}

impl LogProgress {
    /// Progress report every `log_period` batches, written to stdout.
    pub fn new(log_period: usize) -> Self {
        Self {
            name: "LogProgress".to_string(),
            set_names: vec!["training".to_string()],
            batch_level: true,
            log_condition: every_n_batches(log_period),
            out: Box::new(io::stdout()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn set_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// `false` limits reports to the end of each epoch.
    pub fn batch_level(mut self, batch_level: bool) -> Self {
        self.batch_level = batch_level;
        self
    }

    pub fn log_condition(mut self, condition: LogCondition) -> Self {
        self.log_condition = condition;
        self
    }

    pub fn writer(mut self, out: Box<dyn Write + Send>) -> Self {
        self.out = out;
        self
    }

    fn batch_report(&self, logs: &LogTree) -> String {
        let current = logs.current();
        let count = |path: &str| current.and_then(|c| c.lookup(path)).and_then(LogValue::as_count).unwrap_or(0);
        let final_count = |key: &str| logs.lookup(key).and_then(LogValue::as_count).unwrap_or(0);

        let mut report = format!(
            "\nEpoch {}/{} - ETA: {}\tBatch {}/{} Average batch training time {}\n",
            count("epoch"),
            final_count("final_epoch"),
            eta(logs),
            count("batch_step"),
            final_count("final_batch_step"),
            average_batch_duration(logs),
        );
        for level in MetricLevel::ALL {
            report.push_str(&self.level_report(logs, level));
            report.push('\n');
        }
        report.push('\n');
        report
    }

    fn epoch_report(&self, logs: &LogTree) -> String {
        let epoch = logs.lookup("current.epoch").and_then(LogValue::as_count).unwrap_or(0);
        let final_epoch = logs.lookup("final_epoch").and_then(LogValue::as_count).unwrap_or(0);
        let duration = logs
            .number_at("current.training_params.epoch.duration")
            .map(|d| format_duration(d.round() as u64))
            .unwrap_or_else(|| UNKNOWN.to_string());

        let mut report = format!("\n{EPOCH_SEPARATOR}\nEpoch {epoch}/{final_epoch}\tREADY - Duration {duration}\n");
        for level in [MetricLevel::WindowAverage, MetricLevel::Dataset, MetricLevel::Epoch] {
            report.push_str(&self.level_report(logs, level));
            report.push('\n');
        }
        report.push('\n');
        report
    }

    fn level_report(&self, logs: &LogTree, level: MetricLevel) -> String {
        let mut sets = String::new();
        for set_name in &self.set_names {
            let path = format!("{CURRENT}.{set_name}.{}", level.key());
            if let Some(line) = logs.node_at(&path).and_then(|metrics| metrics_line(metrics, None, 0)) {
                sets.push_str(&format!("{set_name:<15}: {line}.\n"));
            }
        }
        if sets.is_empty() {
            return sets;
        }
        format!("{}:\n{sets}", level.display_name())
    }

    fn emit(&mut self, text: &str) -> io::Result<()> {
        self.out.write_all(text.as_bytes())?;
        self.out.flush()
    }
}

impl<B> Callback<B> for LogProgress {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_batch_training_completed(&mut self, _batch: &B, ctx: &mut HookContext<'_, B>) -> CallbackResult {
        if !self.batch_level || !(self.log_condition)(&*ctx.logs) {
            return Ok(true);
        }
        let report = self.batch_report(ctx.logs);
        self.emit(&report)?;
        Ok(true)
    }

    fn on_epoch_completed(&mut self, ctx: &mut HookContext<'_, B>) -> CallbackResult {
        let report = self.epoch_report(ctx.logs);
        self.emit(&report)?;
        Ok(true)
    }
}

/// One line (with nested, indented lines for subtrees) for a set of metrics.
fn metrics_line(metrics: &LogTree, base_metric: Option<&str>, depth: usize) -> Option<String> {
    let has_metrics = metrics.iter().any(|(key, _)| !NON_METRIC_KEYS.contains(&key.as_str()));
    if !has_metrics {
        return None;
    }

    let mut line = String::new();
    if depth > 0 {
        line.push('\n');
    }
    line.push_str(&"\t".repeat(depth));
    if let Some(base) = base_metric {
        line.push_str(&format!("{base:<15}: "));
    }

    let mut parts = Vec::new();
    for (metric, value) in metrics.iter() {
        if NON_METRIC_KEYS.contains(&metric.as_str()) {
            continue;
        }
        match value {
            LogValue::Node(nested) => {
                if let Some(nested_line) = metrics_line(nested, Some(metric), depth + 1) {
                    parts.push(format!("\n{nested_line}"));
                }
            }
            other => match other.as_f64() {
                Some(v) => parts.push(format_metric(metric, v)),
                None => parts.push(UNKNOWN.to_string()),
            },
        }
    }
    line.push_str(&parts.join(", "));
    Some(line)
}

fn format_metric(name: &str, value: f64) -> String {
    if value.abs() < 0.1 {
        format!("{name:<9} {value:.3e}")
    } else {
        format!("{name:<9} {value:>9.3}")
    }
}

fn eta(logs: &LogTree) -> String {
    let average = logs.number_at("current.training_params.window_average.duration");
    let batch_step = logs.lookup("current.batch_step").and_then(LogValue::as_count);
    let final_batch_step = logs.lookup("final_batch_step").and_then(LogValue::as_count);
    match (average, batch_step, final_batch_step) {
        (Some(avg), Some(step), Some(last)) if avg > 0.0 => {
            let to_go = (last + 1).saturating_sub(step) as f64;
            format_duration((avg * to_go).round() as u64)
        }
        _ => UNKNOWN.to_string(),
    }
}

fn average_batch_duration(logs: &LogTree) -> String {
    match logs.number_at("current.training_params.window_average.duration") {
        Some(d) if d > 0.0 => format!("{}ms", (d * 1000.0) as u64),
        _ => UNKNOWN.to_string(),
    }
}

/// `H:MM:SS`, prefixed with the number of days when longer than a day.
pub(crate) fn format_duration(total_seconds: u64) -> String {
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;
    match days {
        0 => format!("{hours}:{minutes:02}:{seconds:02}"),
        1 => format!("1 day, {hours}:{minutes:02}:{seconds:02}"),
        n => format!("{n} days, {hours}:{minutes:02}:{seconds:02}"),
    }
}
