//! Core type definitions for converge

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where a document's content came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentIdentity {
    /// One file given directly as the target
    SingleFile(PathBuf),
    /// Several source files: a directory's matching files, or several targets
    Directory(Vec<PathBuf>),
}

impl DocumentIdentity {
    /// All source paths, in aggregation order
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            Self::SingleFile(path) => vec![path.as_path()],
            Self::Directory(paths) => paths.iter().map(|p| p.as_path()).collect(),
        }
    }
}

/// How accepted outputs feed the next request
///
/// Chosen once per session from document metadata, never per iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccumulationPolicy {
    /// The next request sees only the latest output (source code)
    Replace,
    /// The next request sees everything so far, outputs appended (prose)
    Append,
}

impl AccumulationPolicy {
    /// Fold an accepted output into the running history
    pub fn apply(&self, history: &mut String, output: &str) {
        match self {
            Self::Replace => {
                history.clear();
                history.push_str(output);
            }
            Self::Append => {
                history.push_str("\n\n");
                history.push_str(output);
            }
        }
    }
}

impl std::fmt::Display for AccumulationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Replace => write!(f, "replace"),
            Self::Append => write!(f, "append"),
        }
    }
}

/// The aggregated input of a refinement session
///
/// Built once at startup and never mutated; the loop works on a copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Full text sent on the first iteration
    pub content: String,
    /// Source path(s)
    pub identity: DocumentIdentity,
    /// True when every source is an explicit file with a programming extension
    pub is_programming_file: bool,
    /// Stem used to name debug snapshots and fallback artifacts
    pub base: String,
}

impl Document {
    /// Source paths, in aggregation order
    pub fn paths(&self) -> Vec<&Path> {
        self.identity.paths()
    }

    pub fn is_single_file(&self) -> bool {
        matches!(self.identity, DocumentIdentity::SingleFile(_))
    }

    /// Several source files that are all code: the model must answer with
    /// one marked section per file
    pub fn spans_multiple_sources(&self) -> bool {
        self.is_programming_file && self.paths().len() > 1
    }

    /// History policy implied by this document
    pub fn accumulation_policy(&self) -> AccumulationPolicy {
        if self.is_programming_file {
            AccumulationPolicy::Replace
        } else {
            AccumulationPolicy::Append
        }
    }
}

/// One completed model call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based iteration number
    pub index: usize,
    /// Unmodified model response
    pub raw_output: String,
    /// Dissimilarity against the previous text
    pub diff_ratio: f64,
    pub timestamp: DateTime<Utc>,
}

/// Lightweight per-iteration entry kept for the whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationSummary {
    pub index: usize,
    pub diff_ratio: f64,
    pub timestamp: DateTime<Utc>,
    pub output_chars: usize,
    /// Debug snapshot path, if the write succeeded
    pub snapshot: Option<PathBuf>,
}

impl From<(&IterationRecord, Option<PathBuf>)> for IterationSummary {
    fn from((record, snapshot): (&IterationRecord, Option<PathBuf>)) -> Self {
        Self {
            index: record.index,
            diff_ratio: record.diff_ratio,
            timestamp: record.timestamp,
            output_chars: record.raw_output.chars().count(),
            snapshot,
        }
    }
}

/// A labeled slice of a multi-file model response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSection {
    /// Filename as written by the model after the marker
    pub label: String,
    /// Everything up to the next marker
    pub body: String,
}
