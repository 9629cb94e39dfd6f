//! Metrics reporting sinks
//!
//! Evaluation results are flattened to a `name -> value` mapping and handed
//! to a [`MetricsSink`]. The sink decides where they go: the log, memory, or
//! a JSON-lines file.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{CircuitError, Result};

/// Flat metric mapping, ordered by key
pub type Metrics = BTreeMap<String, f64>;

/// Destination for logged metrics
pub trait MetricsSink {
    /// Record one set of metrics
    fn log(&mut self, metrics: &Metrics) -> Result<()>;
}

impl<T: MetricsSink + ?Sized> MetricsSink for Box<T> {
    fn log(&mut self, metrics: &Metrics) -> Result<()> {
        (**self).log(metrics)
    }
}

/// Writes each metric as an `info!` event
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn log(&mut self, metrics: &Metrics) -> Result<()> {
        for (key, value) in metrics {
            info!("{key}: {value:.6}");
        }
        Ok(())
    }
}

/// Keeps every logged record in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<Metrics>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent value logged under `key`
    pub fn last(&self, key: &str) -> Option<f64> {
        self.records.iter().rev().find_map(|r| r.get(key).copied())
    }
}

impl MetricsSink for MemorySink {
    fn log(&mut self, metrics: &Metrics) -> Result<()> {
        self.records.push(metrics.clone());
        Ok(())
    }
}

/// Appends one JSON object per `log` call to a file.
///
/// NaN and infinite values have no JSON form; a record holding one is
/// rejected with `NonFiniteMetric` and nothing is written.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it if needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonLinesSink {
    fn log(&mut self, metrics: &Metrics) -> Result<()> {
        if let Some((key, &value)) = metrics.iter().find(|(_, v)| !v.is_finite()) {
            return Err(CircuitError::NonFiniteMetric {
                key: key.clone(),
                value,
            });
        }
        serde_json::to_writer(&mut self.writer, metrics)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
