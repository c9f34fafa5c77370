//! Metric sinks: where per-epoch (name, value) pairs are reported.
//!
//! Sinks are observers. A failing sink is logged and otherwise ignored.

use crate::error::{Result, SimsError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Receives (epoch, metric, value) tuples
pub trait MetricSink: Send + Sync {
    fn record(&self, epoch: usize, name: &str, value: f64) -> Result<()>;

    /// Called once training ends
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Record several values, logging sink failures instead of returning them
pub fn report(sink: &dyn MetricSink, epoch: usize, values: &[(&str, f64)]) {
    for (name, value) in values {
        if let Err(e) = sink.record(epoch, name, *value) {
            warn!("Metric sink rejected {}: {}", name, e);
        }
    }
}

/// Emits every metric as a tracing event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, epoch: usize, name: &str, value: f64) -> Result<()> {
        tracing::debug!(target: "scsims::metrics", epoch, metric = name, value);
        Ok(())
    }
}

/// One recorded metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
    pub epoch: usize,
    pub name: String,
    pub value: f64,
}

/// Keeps every point in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    points: Mutex<Vec<MetricPoint>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all points so far
    pub fn points(&self) -> Vec<MetricPoint> {
        self.points.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Values of one metric in epoch order
    pub fn series(&self, name: &str) -> Vec<f64> {
        self.points()
            .into_iter()
            .filter(|p| p.name == name)
            .map(|p| p.value)
            .collect()
    }
}

impl MetricSink for MemorySink {
    fn record(&self, epoch: usize, name: &str, value: f64) -> Result<()> {
        self.points
            .lock()
            .map_err(|_| SimsError::Storage("metric sink lock poisoned".to_string()))?
            .push(MetricPoint {
                epoch,
                name: name.to_string(),
                value,
            });
        Ok(())
    }
}

/// Keeps the history and rewrites a JSON file on every record
#[derive(Debug)]
pub struct JsonFileSink {
    path: PathBuf,
    history: MemorySink,
}

impl JsonFileSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            history: MemorySink::new(),
        }
    }

    fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.history.points())
            .map_err(|e| SimsError::Storage(format!("failed to serialize metrics: {e}")))?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

impl MetricSink for JsonFileSink {
    fn record(&self, epoch: usize, name: &str, value: f64) -> Result<()> {
        self.history.record(epoch, name, value)?;
        self.save()
    }

    fn flush(&self) -> Result<()> {
        self.save()
    }
}

/// Forwards to several sinks
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn MetricSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl MetricSink for FanoutSink {
    fn record(&self, epoch: usize, name: &str, value: f64) -> Result<()> {
        // every sink gets the value even if an earlier one fails
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(epoch, name, value) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn flush(&self) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.flush() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_sink_series() {
        let sink = MemorySink::new();
        report(&sink, 1, &[("val_loss", 0.9), ("train_loss", 1.2)]);
        report(&sink, 2, &[("val_loss", 0.7)]);
        assert_eq!(sink.series("val_loss"), vec![0.9, 0.7]);
        assert_eq!(sink.points().len(), 3);
    }

    #[test]
    fn test_json_sink_rewrites_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.json");
        let sink = JsonFileSink::new(&path);
        sink.record(1, "val_loss", 0.5).unwrap();
        sink.record(2, "val_loss", 0.25).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
        assert_eq!(parsed[1]["value"], 0.25);
    }

    #[test]
    fn test_fanout_continues_past_failure() {
        let dir = TempDir::new().unwrap();
        let broken = Arc::new(JsonFileSink::new(dir.path().join("missing").join("m.json")));
        let memory = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new().with(broken).with(memory.clone());

        assert!(fanout.record(1, "x", 1.0).is_err());
        assert_eq!(memory.series("x"), vec![1.0]);

        // report() swallows the failure
        report(&fanout, 2, &[("x", 2.0)]);
        assert_eq!(memory.series("x"), vec![1.0, 2.0]);
    }
}
