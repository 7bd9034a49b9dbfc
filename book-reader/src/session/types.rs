//! Checkpoint data types for a conversion run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// On-disk checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Identity of the source text a run was started from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIdentity {
    /// Path the source was read from
    pub path: PathBuf,
    /// SHA256 of the source file (first 16 hex chars)
    pub sha256: String,
}

/// Settings frozen into the checkpoint when a run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Voice identifier passed to the TTS backend
    pub voice: String,
    /// TTS backend name (edge-tts, openai)
    pub backend: String,
    /// Number of pages merged into each part
    pub pages_per_part: usize,
    /// Page size used by the chunker
    pub max_page_chars: usize,
    /// Part merger name (ffmpeg, concat)
    #[serde(default = "default_merger")]
    pub merger: String,
    /// Output directory the run was started in
    pub output_dir: PathBuf,
    /// Source file identity
    pub source: SourceIdentity,
}

/// Checkpoints written before the merger was recorded used ffmpeg.
fn default_merger() -> String {
    "ffmpeg".to_string()
}

/// Synthesis status of a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    Pending,
    Done,
    Failed,
}

/// Last recorded failure for a page that is not done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFailure {
    /// Error message from the last attempt
    pub error: String,
    /// Number of attempts made in the failing run
    pub attempts: u32,
}

/// Persisted state of one conversion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Format version
    pub version: u32,
    /// Configuration the run was started with
    pub config: RunConfig,
    /// Number of pages in the run
    pub total_pages: usize,
    /// SHA256 over the page texts in the manifest
    pub pages_digest: String,
    /// Indices of pages whose audio is durably written
    pub completed: BTreeSet<usize>,
    /// Pages whose last synthesis attempt failed
    #[serde(default)]
    pub failed: BTreeMap<usize, PageFailure>,
    /// When the run was started
    pub created_at: DateTime<Utc>,
    /// When the checkpoint was last written
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a checkpoint with every page pending.
    pub fn new(config: RunConfig, total_pages: usize, pages_digest: String) -> Self {
        let now = Utc::now();
        Self {
            version: CHECKPOINT_VERSION,
            config,
            total_pages,
            pages_digest,
            completed: BTreeSet::new(),
            failed: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Status of the page at `index`.
    pub fn status(&self, index: usize) -> PageStatus {
        if self.completed.contains(&index) {
            PageStatus::Done
        } else if self.failed.contains_key(&index) {
            PageStatus::Failed
        } else {
            PageStatus::Pending
        }
    }

    pub fn is_done(&self, index: usize) -> bool {
        self.completed.contains(&index)
    }

    /// Whether every page has been synthesized.
    pub fn is_complete(&self) -> bool {
        self.completed.len() == self.total_pages
    }

    /// First page that still needs synthesis.
    pub fn next_pending(&self) -> Option<usize> {
        (0..self.total_pages).find(|i| !self.completed.contains(i))
    }

    /// Indices not yet done, in order.
    pub fn remaining(&self) -> Vec<usize> {
        (0..self.total_pages)
            .filter(|i| !self.completed.contains(i))
            .collect()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Get progress as (completed, total, percentage).
    pub fn progress(&self) -> (usize, usize, f64) {
        let completed = self.completed_count();
        let total = self.total_pages;
        let percentage = if total > 0 {
            completed as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        (completed, total, percentage)
    }

    /// Record a page as done. Returns false if it already was.
    pub(super) fn record_done(&mut self, index: usize) -> bool {
        self.failed.remove(&index);
        self.completed.insert(index)
    }

    /// Record a failure for a page that is not done.
    pub(super) fn record_failure(&mut self, index: usize, error: String, attempts: u32) -> bool {
        if self.completed.contains(&index) {
            return false;
        }
        self.failed.insert(index, PageFailure { error, attempts });
        true
    }
}
