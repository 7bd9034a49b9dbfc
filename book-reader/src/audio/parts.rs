//! Grouping of pages into parts and merging one part at a time.

use super::merger::{MergeError, PartMerger};
use crate::session::{Checkpoint, OutputLayout};
use log::{debug, info};
use std::ops::Range;
use std::path::PathBuf;

/// A contiguous range of pages merged into one part file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPlan {
    pub index: usize,
    pub pages: Range<usize>,
}

impl PartPlan {
    /// True once every page in the range is done.
    pub fn is_ready(&self, checkpoint: &Checkpoint) -> bool {
        self.pages.clone().all(|page| checkpoint.is_done(page))
    }
}

/// Split `total_pages` into parts of `pages_per_part`, the last one possibly shorter.
pub fn plan_parts(total_pages: usize, pages_per_part: usize) -> Vec<PartPlan> {
    let per_part = pages_per_part.max(1);
    (0..total_pages)
        .step_by(per_part)
        .enumerate()
        .map(|(index, start)| PartPlan {
            index,
            pages: start..(start + per_part).min(total_pages),
        })
        .collect()
}

/// Part holding `page`.
pub fn part_of(page: usize, pages_per_part: usize) -> usize {
    page / pages_per_part.max(1)
}

/// Result of a merge request for one part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartOutcome {
    Written(PathBuf),
    AlreadyExists(PathBuf),
}

impl PartOutcome {
    pub fn path(&self) -> &PathBuf {
        match self {
            Self::Written(path) | Self::AlreadyExists(path) => path,
        }
    }
}

/// Merge the page files of `plan` into its part file.
///
/// An existing part file is left untouched. The merger writes to a temporary
/// sibling that is renamed into place only on success, so a failed merge
/// never leaves a part file behind and never touches the page files.
pub async fn merge_part(
    merger: &dyn PartMerger,
    layout: &OutputLayout,
    plan: &PartPlan,
    total_pages: usize,
    total_parts: usize,
) -> Result<PartOutcome, MergeError> {
    let output = layout.part_path(plan.index, total_parts);
    if tokio::fs::try_exists(&output).await? {
        debug!("Part {} already exists, skipping", output.display());
        return Ok(PartOutcome::AlreadyExists(output));
    }

    let inputs: Vec<PathBuf> = plan
        .pages
        .clone()
        .map(|page| layout.page_audio_path(page, total_pages))
        .collect();
    if inputs.is_empty() {
        return Err(MergeError::NoInputs);
    }
    for input in &inputs {
        if !tokio::fs::try_exists(input).await? {
            return Err(MergeError::MissingInput(input.clone()));
        }
    }

    let temp = output.with_extension("tmp.mp3");
    remove_if_exists(&temp).await?;

    if let Err(e) = merger.merge(&inputs, &temp).await {
        let _ = remove_if_exists(&temp).await;
        return Err(e);
    }

    tokio::fs::File::open(&temp).await?.sync_all().await?;
    tokio::fs::rename(&temp, &output).await?;

    info!(
        "Wrote {} (pages {}-{})",
        output.display(),
        plan.pages.start,
        plan.pages.end - 1
    );
    Ok(PartOutcome::Written(output))
}

async fn remove_if_exists(path: &std::path::Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
