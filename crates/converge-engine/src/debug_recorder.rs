//! Debug snapshots of every raw model response
//!
//! Files land in `debug_<base>/` (or `--debug-dir`):
//! - `<base>_iter_<n>.txt` per iteration, written before evaluation
//! - `<base>_summary.json` once the run ends
//!
//! All writes are fail-open: a full disk never stops refinement.

use crate::state_machine::StopReason;
use chrono::{DateTime, Utc};
use converge_agent::Usage;
use converge_core::fail_open::fail_open;
use converge_core::{ConvergeError, IterationSummary};
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Machine-readable record of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub session_id: Uuid,
    pub base: String,
    pub model: String,
    pub mode: String,
    pub threshold: f64,
    pub limit: Option<usize>,
    pub stop_reason: StopReason,
    pub iterations: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub usage: Usage,
    pub history: Vec<IterationSummary>,
    pub outputs: Vec<PathBuf>,
}

/// Writes per-iteration snapshots for one session
#[derive(Debug, Clone)]
pub struct DebugRecorder {
    dir: PathBuf,
    base: String,
}

impl DebugRecorder {
    pub fn new(dir: impl Into<PathBuf>, base: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base: base.into(),
        }
    }

    /// `debug_<base>`, relative to the working directory
    pub fn default_dir(base: &str) -> PathBuf {
        PathBuf::from(format!("debug_{}", base))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self, iteration: usize) -> PathBuf {
        self.dir.join(format!("{}_iter_{}.txt", self.base, iteration))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join(format!("{}_summary.json", self.base))
    }

    /// Save the raw response of `iteration`; `None` if the write failed
    pub async fn record(&self, iteration: usize, raw_output: &str) -> Option<PathBuf> {
        let path = self.snapshot_path(iteration);
        fail_open("debug_recorder::record", || async {
            tokio::fs::create_dir_all(&self.dir).await?;
            tokio::fs::write(&path, raw_output).await?;
            tracing::debug!("Saved snapshot {}", path.display());
            Ok::<_, ConvergeError>(path.clone())
        })
        .await
    }

    /// Save the run summary; `None` if the write failed
    pub async fn write_summary(&self, summary: &RunSummary) -> Option<PathBuf> {
        let path = self.summary_path();
        fail_open("debug_recorder::write_summary", || async {
            let json = serde_json::to_string_pretty(summary)?;
            tokio::fs::create_dir_all(&self.dir).await?;
            tokio::fs::write(&path, json).await?;
            Ok::<_, ConvergeError>(path.clone())
        })
        .await
    }
}
