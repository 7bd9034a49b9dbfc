//! Error taxonomy for a conversion run.

use crate::tts::SynthesisError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("A conversion already exists in {0}. Use 'resume' to continue it.")]
    CheckpointExists(PathBuf),

    #[error("No checkpoint found in {0}")]
    CheckpointNotFound(PathBuf),

    #[error("Checkpoint {path} is corrupt: {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("Run configuration mismatch for {field}: checkpoint has '{stored}', requested '{requested}'")]
    ConfigMismatch {
        field: &'static str,
        stored: String,
        requested: String,
    },

    #[error("Page {page} failed after {attempts} attempt(s): {source}")]
    Synthesis {
        page: usize,
        attempts: u32,
        #[source]
        source: SynthesisError,
    },

    #[error("Pages failed synthesis: {}", format_indices(.pages))]
    PagesFailed { pages: Vec<usize> },

    #[error("Failed to merge {}", format_failures(.failures))]
    Merge { failures: Vec<MergeFailure> },

    #[error("Interrupted before page {next_page}")]
    Interrupted { next_page: usize },

    #[error("Invalid run configuration: {0}")]
    InvalidConfig(String),

    #[error("Part merger unavailable: {0}")]
    MergerUnavailable(String),

    #[error("Output directory is in use by process {pid} (lock file {path})")]
    Locked { path: PathBuf, pid: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConvertError {
    /// Whether the checkpoint is left in a state that `resume` can pick up.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::Synthesis { .. }
                | Self::PagesFailed { .. }
                | Self::Merge { .. }
                | Self::Interrupted { .. }
        )
    }
}

/// A single part that could not be merged.
#[derive(Debug, Clone)]
pub struct MergeFailure {
    pub part: usize,
    pub message: String,
}

fn format_indices(pages: &[usize]) -> String {
    pages
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_failures(failures: &[MergeFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("part {} ({})", f.part, f.message))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, ConvertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resumable_errors() {
        assert!(ConvertError::Interrupted { next_page: 4 }.is_resumable());
        assert!(
            ConvertError::Synthesis {
                page: 3,
                attempts: 3,
                source: SynthesisError::Transient("timeout".into()),
            }
            .is_resumable()
        );
        assert!(!ConvertError::CheckpointNotFound(PathBuf::from("/tmp/x")).is_resumable());
        assert!(
            !ConvertError::ConfigMismatch {
                field: "voice",
                stored: "a".into(),
                requested: "b".into(),
            }
            .is_resumable()
        );
    }

    #[test]
    fn test_merge_message_lists_parts() {
        let err = ConvertError::Merge {
            failures: vec![
                MergeFailure {
                    part: 0,
                    message: "missing input".into(),
                },
                MergeFailure {
                    part: 2,
                    message: "ffmpeg exited 1".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("part 0 (missing input)"));
        assert!(msg.contains("part 2 (ffmpeg exited 1)"));
    }

    #[test]
    fn test_pages_failed_message() {
        let err = ConvertError::PagesFailed { pages: vec![1, 5] };
        assert_eq!(err.to_string(), "Pages failed synthesis: 1, 5");
    }
}
