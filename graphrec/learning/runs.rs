use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metrics::RankingMetrics;

/// Lifecycle state of an experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum RunStatus {
    /// Recorded, not started.
    Queued,
    /// Training or evaluating.
    Running,
    /// Finished; carries the final test metrics.
    Completed {
        /// Metrics at the configured `top_k`.
        metrics: RankingMetrics,
    },
    /// Aborted with an error.
    Failed {
        /// Error description.
        error: String,
    },
}

impl RunStatus {
    /// Short label for listings.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// One entry of the run manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run identifier (`run-<uuid>`).
    pub run_id: String,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
    /// Experiment config used.
    pub config: PathBuf,
    /// Where the run's JSON log is written, if anywhere.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Current state.
    pub status: RunStatus,
}

impl RunRecord {
    /// Creates a queued record with a fresh id.
    #[must_use]
    pub fn queued(config: impl Into<PathBuf>, log_path: Option<PathBuf>) -> Self {
        Self {
            run_id: format!("run-{}", Uuid::new_v4()),
            submitted_at: Utc::now(),
            config: config.into(),
            log_path,
            status: RunStatus::Queued,
        }
    }
}

/// JSON-lines manifest of experiment runs.
#[derive(Debug)]
pub struct RunManifest {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RunManifest {
    /// Opens a manifest at `path`; the file is created on first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Manifest location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a record.
    pub fn append(&self, record: &RunRecord) -> Result<()> {
        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating manifest dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening manifest {}", self.path.display()))?;
        serde_json::to_writer(&mut file, record)?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }

    /// Every record in submission order.
    pub fn read_all(&self) -> Result<Vec<RunRecord>> {
        let _guard = self.lock.lock();
        self.read_unlocked()
    }

    /// The newest `limit` records, newest first.
    pub fn latest(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let records = self.read_all()?;
        Ok(records.into_iter().rev().take(limit).collect())
    }

    /// Record with the given id.
    pub fn find(&self, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .find(|record| record.run_id == run_id))
    }

    /// Rewrites the status of `run_id`; returns false when the id is unknown.
    pub fn set_status(&self, run_id: &str, status: RunStatus) -> Result<bool> {
        let _guard = self.lock.lock();
        let mut records = self.read_unlocked()?;
        let Some(record) = records.iter_mut().find(|r| r.run_id == run_id) else {
            return Ok(false);
        };
        record.status = status;
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("writing manifest {}", tmp.display()))?;
            for record in &records {
                serde_json::to_writer(&mut file, record)?;
                file.write_all(b"\n")?;
            }
            file.flush()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing manifest {}", self.path.display()))?;
        Ok(true)
    }

    fn read_unlocked(&self) -> Result<Vec<RunRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)
            .with_context(|| format!("opening manifest {}", self.path.display()))?;
        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line)
                .with_context(|| format!("decoding manifest line {}", idx + 1))?;
            records.push(record);
        }
        Ok(records)
    }
}
