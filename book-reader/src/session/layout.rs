//! File naming inside a run's output directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Extension of per-page and part audio files.
pub const AUDIO_EXTENSION: &str = "mp3";

const CHECKPOINT_FILE: &str = "checkpoint.json";
const MANIFEST_FILE: &str = "pages.json";
const LOCK_FILE: &str = ".book-reader.lock";
const PAGES_DIR: &str = "pages";
const PAGE_PREFIX: &str = "page_";
const PART_PREFIX: &str = "part_";

/// Deterministic, sortable paths for everything a run writes.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.root.join(CHECKPOINT_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn pages_dir(&self) -> PathBuf {
        self.root.join(PAGES_DIR)
    }

    /// Audio file for a page, zero-padded so directory order is page order.
    pub fn page_audio_path(&self, index: usize, total_pages: usize) -> PathBuf {
        let width = pad_width(total_pages, 4);
        self.pages_dir()
            .join(format!("{}{:0width$}.{}", PAGE_PREFIX, index, AUDIO_EXTENSION, width = width))
    }

    /// Merged audio file for a part.
    pub fn part_path(&self, part: usize, total_parts: usize) -> PathBuf {
        let width = pad_width(total_parts, 2);
        self.root
            .join(format!("{}{:0width$}.{}", PART_PREFIX, part, AUDIO_EXTENSION, width = width))
    }

    /// Every page and part audio file currently on disk, temporaries included.
    pub fn audio_files(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = matching_files(&self.root, PART_PREFIX)?;
        files.extend(matching_files(&self.pages_dir(), PAGE_PREFIX)?);
        Ok(files)
    }
}

fn matching_files(dir: &Path, prefix: &str) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let matches = path.is_file()
            && path.extension().is_some_and(|ext| ext == AUDIO_EXTENSION)
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(prefix));
        if matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Digits needed for the largest index of `count` items, at least `min`.
fn pad_width(count: usize, min: usize) -> usize {
    let largest = count.saturating_sub(1);
    largest.to_string().len().max(min)
}
