//! Write-only destinations for run configuration and epoch metrics.
//!
//! Sinks never fail the run: write errors are logged and dropped.

use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::EpochMetrics;

pub trait MetricsSink {
    /// Record the run configuration, once before the first epoch.
    fn log_config(&mut self, config: &Value);
    fn log_epoch(&mut self, metrics: &EpochMetrics);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn log_config(&mut self, _config: &Value) {}
    fn log_epoch(&mut self, _metrics: &EpochMetrics) {}
}

/// Appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    file: Option<File>,
}

impl JsonlSink {
    /// Open `path` for appending, creating parent directories. If the file
    /// cannot be opened the sink logs a warning and behaves like [`NullSink`].
    pub fn open(path: &Path) -> Self {
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "could not create metrics dir");
            }
        }
        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not open metrics file");
                None
            }
        };
        Self {
            path: path.to_path_buf(),
            file,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&mut self, line: serde_json::Result<String>) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let result = line
            .map_err(std::io::Error::from)
            .and_then(|json| writeln!(file, "{json}"));
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "could not write metrics");
        }
    }
}

impl MetricsSink for JsonlSink {
    fn log_config(&mut self, config: &Value) {
        self.write_line(serde_json::to_string(&serde_json::json!({ "config": config })));
    }

    fn log_epoch(&mut self, metrics: &EpochMetrics) {
        self.write_line(serde_json::to_string(metrics));
    }
}
