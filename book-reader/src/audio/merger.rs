//! Concatenation of per-page audio into part files.

use crate::config::ReaderConfig;
use async_trait::async_trait;
use log::debug;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("missing input file: {0}")]
    MissingInput(PathBuf),

    #[error("no input files")]
    NoInputs,

    #[error("merge tool unavailable: {0}")]
    Unavailable(String),

    #[error("merge tool failed: {0}")]
    Tool(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Joins ordered audio files into one output file.
///
/// Implementations write `output` directly; callers are responsible for
/// pointing it at a temporary path and renaming.
#[async_trait]
pub trait PartMerger: Send + Sync {
    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError>;

    /// Check the merge tool can run before any synthesis starts.
    async fn preflight(&self) -> Result<(), MergeError> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// Supported merger kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergerKind {
    Ffmpeg,
    ByteConcat,
}

impl MergerKind {
    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "ffmpeg" => Ok(Self::Ffmpeg),
            "concat" | "bytes" => Ok(Self::ByteConcat),
            _ => anyhow::bail!("Unknown merger: {}. Available: ffmpeg, concat", s),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ffmpeg => "ffmpeg",
            Self::ByteConcat => "concat",
        }
    }
}

/// Create a part merger by name.
pub fn create_merger(name: &str, config: &ReaderConfig) -> anyhow::Result<Arc<dyn PartMerger>> {
    match MergerKind::from_str(name)? {
        MergerKind::Ffmpeg => Ok(Arc::new(FfmpegMerger::new(config.ffmpeg_path.clone()))),
        MergerKind::ByteConcat => Ok(Arc::new(ByteConcatMerger)),
    }
}

/// Container-level concat through ffmpeg's concat demuxer, no re-encoding.
pub struct FfmpegMerger {
    program: PathBuf,
}

impl FfmpegMerger {
    pub fn new(ffmpeg_path: Option<PathBuf>) -> Self {
        Self {
            program: ffmpeg_path.unwrap_or_else(|| PathBuf::from("ffmpeg")),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.kill_on_drop(true);
        cmd
    }
}

/// Line for ffmpeg's concat list, with single quotes escaped.
fn concat_entry(path: &Path) -> String {
    let path_str = path.to_string_lossy().replace('\'', "'\\''");
    format!("file '{}'\n", path_str)
}

#[async_trait]
impl PartMerger for FfmpegMerger {
    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError> {
        if inputs.is_empty() {
            return Err(MergeError::NoInputs);
        }

        // Concat lists resolve relative entries against the list's own directory
        let mut list_content = String::new();
        for input in inputs {
            list_content.push_str(&concat_entry(&std::path::absolute(input)?));
        }

        let list_dir = output.parent().unwrap_or_else(|| Path::new("."));
        let list_file = tempfile::Builder::new()
            .prefix(".concat-")
            .suffix(".txt")
            .tempfile_in(list_dir)?;
        tokio::fs::write(list_file.path(), list_content).await?;

        let result = self
            .command()
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(list_file.path())
            .args(["-c", "copy", "-f", "mp3"])
            .arg(output)
            .output()
            .await;

        let output_status = match result {
            Ok(o) => o,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MergeError::Unavailable(format!(
                    "{} not found",
                    self.program.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if !output_status.status.success() {
            let stderr = String::from_utf8_lossy(&output_status.stderr);
            return Err(MergeError::Tool(format!("ffmpeg concat failed: {}", stderr.trim())));
        }

        debug!("ffmpeg merged {} files into {}", inputs.len(), output.display());
        Ok(())
    }

    async fn preflight(&self) -> Result<(), MergeError> {
        let output = self.command().arg("-version").output().await.map_err(|e| {
            MergeError::Unavailable(format!("cannot run {}: {}", self.program.display(), e))
        })?;
        if !output.status.success() {
            return Err(MergeError::Unavailable(format!(
                "{} -version exited with {}",
                self.program.display(),
                output.status
            )));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ffmpeg"
    }
}

/// Plain byte concatenation. Works for headerless MP3 frame streams.
pub struct ByteConcatMerger;

#[async_trait]
impl PartMerger for ByteConcatMerger {
    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError> {
        if inputs.is_empty() {
            return Err(MergeError::NoInputs);
        }

        let mut file = tokio::fs::File::create(output).await?;
        for input in inputs {
            let bytes = match tokio::fs::read(input).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(MergeError::MissingInput(input.clone()));
                }
                Err(e) => return Err(e.into()),
            };
            file.write_all(&bytes).await?;
        }
        file.sync_all().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "concat"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_concat_entry_escapes_quotes() {
        assert_eq!(
            concat_entry(Path::new("/books/it's here/page_0000.mp3")),
            "file '/books/it'\\''s here/page_0000.mp3'\n"
        );
    }

    #[test]
    fn test_merger_kind_parsing() {
        assert_eq!(MergerKind::from_str("ffmpeg").unwrap(), MergerKind::Ffmpeg);
        assert_eq!(MergerKind::from_str("Concat").unwrap(), MergerKind::ByteConcat);
        assert!(MergerKind::from_str("sox").is_err());
        assert_eq!(MergerKind::from_str("bytes").unwrap().name(), "concat");
    }

    #[tokio::test]
    async fn test_byte_concat_preserves_order() {
        let temp_dir = TempDir::new().unwrap();
        let a = temp_dir.path().join("a.mp3");
        let b = temp_dir.path().join("b.mp3");
        std::fs::write(&a, b"first-").unwrap();
        std::fs::write(&b, b"second").unwrap();

        let out = temp_dir.path().join("out.mp3");
        ByteConcatMerger.merge(&[b.clone(), a.clone()], &out).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"secondfirst-");
    }

    #[tokio::test]
    async fn test_byte_concat_missing_input() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope.mp3");
        let err = ByteConcatMerger
            .merge(&[missing.clone()], &temp_dir.path().join("out.mp3"))
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::MissingInput(p) if p == missing));
    }

    #[tokio::test]
    async fn test_empty_input_list_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let out = temp_dir.path().join("out.mp3");
        assert!(matches!(
            ByteConcatMerger.merge(&[], &out).await,
            Err(MergeError::NoInputs)
        ));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_ffmpeg_missing_binary_is_unavailable() {
        let merger = FfmpegMerger::new(Some(PathBuf::from("/nonexistent/ffmpeg")));
        assert!(matches!(
            merger.preflight().await,
            Err(MergeError::Unavailable(_))
        ));
    }
}
