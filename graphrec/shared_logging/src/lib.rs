#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured JSON-lines logging for training and evaluation runs.

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Log severity level, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Per-batch and per-step detail.
    Debug,
    /// Stage boundaries and epoch summaries.
    Info,
    /// Recoverable anomalies (skipped users, rebuilt caches).
    Warn,
    /// Failed runs.
    Error,
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => bail!("unknown log level `{other}`"),
        }
    }
}

/// Structured log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Timestamp in ISO8601.
    pub timestamp: DateTime<Utc>,
    /// Component emitting the log (e.g. `lightgcn.trainer`).
    pub module: String,
    /// Severity.
    pub level: LogLevel,
    /// Short machine-friendly message.
    pub message: String,
    /// Metrics and other fields.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl LogRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(module: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            module: module.into(),
            level,
            message: message.into(),
            metadata: Map::new(),
        }
    }

    /// Adds one metadata field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Merges the fields of a JSON object; non-object values are stored under `data`.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        match metadata {
            Value::Object(map) => self.metadata.extend(map),
            Value::Null => {}
            other => {
                self.metadata.insert("data".into(), other);
            }
        }
        self
    }
}

/// Thread-safe append-only JSON-lines logger.
#[derive(Debug)]
pub struct JsonLogger {
    path: PathBuf,
    min_level: LogLevel,
    writer: Mutex<File>,
}

impl JsonLogger {
    /// Creates or opens a logger at the desired path, accepting every level.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_min_level(path, LogLevel::Debug)
    }

    /// Creates or opens a logger that drops records below `min_level`.
    pub fn with_min_level(path: impl AsRef<Path>, min_level: LogLevel) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            min_level,
            writer: Mutex::new(file),
        })
    }

    /// Returns whether a record at `level` would be written.
    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    /// Writes a record as one JSON line if its level passes the filter.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        if !self.enabled(record.level) {
            return Ok(());
        }
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Returns the underlying file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn writes_json_lines_with_fields() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::new(dir.path().join("runs/train.log")).unwrap();
        logger
            .log(
                &LogRecord::new("lightgcn.trainer", LogLevel::Info, "epoch_completed")
                    .with_field("epoch", 3)
                    .with_metadata(json!({ "loss": 0.25 })),
            )
            .unwrap();
        let content = fs::read_to_string(logger.path()).unwrap();
        let parsed: LogRecord = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed.message, "epoch_completed");
        assert_eq!(parsed.metadata["epoch"], json!(3));
        assert_eq!(parsed.metadata["loss"], json!(0.25));
    }

    #[test]
    fn drops_records_below_min_level() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::with_min_level(dir.path().join("a.log"), LogLevel::Info).unwrap();
        logger
            .log(&LogRecord::new("m", LogLevel::Debug, "batch"))
            .unwrap();
        logger
            .log(&LogRecord::new("m", LogLevel::Warn, "cache_rebuilt"))
            .unwrap();
        let content = fs::read_to_string(logger.path()).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("cache_rebuilt"));
    }

    #[test]
    fn parses_levels() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("verbose".parse::<LogLevel>().is_err());
        assert!(LogLevel::Error > LogLevel::Debug);
    }
}
