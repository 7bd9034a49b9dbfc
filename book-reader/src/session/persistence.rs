//! Checkpoint persistence: creating, loading, and durably updating a run.

use super::layout::OutputLayout;
use super::types::{CHECKPOINT_VERSION, Checkpoint, RunConfig};
use crate::error::{ConvertError, Result};
use crate::text::Page;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Immutable list of pages written once when a run is created.
#[derive(Debug, Serialize, Deserialize)]
struct PageManifest {
    pages: Vec<Page>,
}

/// Compute a hash of the source file for run identification.
pub fn compute_source_hash(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    let result = hasher.finalize();

    // Return first 16 hex characters
    Ok(format!("{:x}", result)[..16].to_string())
}

/// SHA256 over page texts, used to detect a tampered manifest.
pub fn pages_digest(pages: &[Page]) -> String {
    let mut hasher = Sha256::new();
    for page in pages {
        hasher.update(page.text.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Write `bytes` to `path` via a temporary file in the same directory.
///
/// Readers see either the old content or the new content, never a torn file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    sync_dir(dir);
    Ok(())
}

/// Flush the directory entry after a rename. Not supported on every platform.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(d) = File::open(dir) {
            let _ = d.sync_all();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}

/// Durable store for one run's checkpoint and page manifest.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    layout: OutputLayout,
}

impl CheckpointStore {
    pub fn new(layout: OutputLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Whether a checkpoint file exists in the output directory.
    pub fn exists(&self) -> bool {
        self.layout.checkpoint_path().exists()
    }

    /// Start a new run. Refuses to overwrite an existing checkpoint.
    pub fn create(&self, config: RunConfig, pages: &[Page]) -> Result<Checkpoint> {
        if self.exists() {
            return Err(ConvertError::CheckpointExists(self.layout.root().to_path_buf()));
        }

        fs::create_dir_all(self.layout.pages_dir())?;

        let manifest = PageManifest {
            pages: pages.to_vec(),
        };
        write_atomic(
            &self.layout.manifest_path(),
            &serde_json::to_vec_pretty(&manifest)?,
        )?;

        // The checkpoint is written last: its presence marks the run as existing
        let checkpoint = Checkpoint::new(config, pages.len(), pages_digest(pages));
        self.write(&checkpoint)?;

        Ok(checkpoint)
    }

    /// Load and validate the checkpoint and its page manifest.
    pub fn load(&self) -> Result<(Checkpoint, Vec<Page>)> {
        let checkpoint = self.load_checkpoint()?;
        let pages = self.load_manifest(&checkpoint)?;
        Ok((checkpoint, pages))
    }

    /// Load and validate the checkpoint file alone.
    pub fn load_checkpoint(&self) -> Result<Checkpoint> {
        let path = self.layout.checkpoint_path();
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ConvertError::CheckpointNotFound(
                    self.layout.root().to_path_buf(),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let checkpoint: Checkpoint =
            serde_json::from_slice(&content).map_err(|e| self.corrupt(e.to_string()))?;
        self.validate(&checkpoint)?;
        Ok(checkpoint)
    }

    fn load_manifest(&self, checkpoint: &Checkpoint) -> Result<Vec<Page>> {
        let path = self.layout.manifest_path();
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(self.corrupt(format!("page manifest {} is missing", path.display())));
            }
            Err(e) => return Err(e.into()),
        };

        let manifest: PageManifest = serde_json::from_slice(&content)
            .map_err(|e| self.corrupt(format!("page manifest: {}", e)))?;

        if manifest.pages.len() != checkpoint.total_pages {
            return Err(self.corrupt(format!(
                "page manifest has {} pages, checkpoint expects {}",
                manifest.pages.len(),
                checkpoint.total_pages
            )));
        }

        if let Some(page) = manifest
            .pages
            .iter()
            .enumerate()
            .find(|(i, p)| p.index != *i)
            .map(|(_, p)| p)
        {
            return Err(self.corrupt(format!("page manifest out of order at index {}", page.index)));
        }

        if pages_digest(&manifest.pages) != checkpoint.pages_digest {
            return Err(self.corrupt("page manifest does not match checkpoint digest".into()));
        }

        Ok(manifest.pages)
    }

    fn validate(&self, checkpoint: &Checkpoint) -> Result<()> {
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(self.corrupt(format!(
                "unsupported checkpoint version {}",
                checkpoint.version
            )));
        }

        if checkpoint.config.pages_per_part == 0 {
            return Err(self.corrupt("pages_per_part is 0".into()));
        }

        if checkpoint.config.max_page_chars == 0 {
            return Err(self.corrupt("max_page_chars is 0".into()));
        }

        if let Some(&index) = checkpoint.completed.iter().next_back() {
            if index >= checkpoint.total_pages {
                return Err(self.corrupt(format!(
                    "completed page {} is outside 0..{}",
                    index, checkpoint.total_pages
                )));
            }
        }

        if let Some(&index) = checkpoint.failed.keys().next_back() {
            if index >= checkpoint.total_pages {
                return Err(self.corrupt(format!(
                    "failed page {} is outside 0..{}",
                    index, checkpoint.total_pages
                )));
            }
        }

        Ok(())
    }

    /// Mark a page as done and persist before returning.
    ///
    /// Marking an already-done page is a no-op and writes nothing.
    pub fn mark_page_done(&self, checkpoint: &mut Checkpoint, index: usize) -> Result<()> {
        self.check_index(checkpoint, index)?;
        if checkpoint.is_done(index) {
            return Ok(());
        }

        let mut next = checkpoint.clone();
        next.record_done(index);
        self.save(&mut next)?;
        *checkpoint = next;
        Ok(())
    }

    /// Record the last failure of a page that is not done.
    pub fn mark_page_failed(
        &self,
        checkpoint: &mut Checkpoint,
        index: usize,
        error: &str,
        attempts: u32,
    ) -> Result<()> {
        self.check_index(checkpoint, index)?;

        let mut next = checkpoint.clone();
        if !next.record_failure(index, error.to_string(), attempts) {
            return Ok(());
        }
        self.save(&mut next)?;
        *checkpoint = next;
        Ok(())
    }

    fn check_index(&self, checkpoint: &Checkpoint, index: usize) -> Result<()> {
        if index >= checkpoint.total_pages {
            return Err(ConvertError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("page {} is outside 0..{}", index, checkpoint.total_pages),
            )));
        }
        Ok(())
    }

    fn save(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        checkpoint.updated_at = Utc::now();
        self.write(checkpoint)
    }

    fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        write_atomic(&self.layout.checkpoint_path(), &bytes)?;
        Ok(())
    }

    fn corrupt(&self, reason: String) -> ConvertError {
        ConvertError::CheckpointCorrupt {
            path: self.layout.checkpoint_path(),
            reason,
        }
    }
}
