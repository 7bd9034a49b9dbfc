//! Part merging: grouping page audio into part files.

pub mod merger;
pub mod parts;

pub use merger::{MergeError, MergerKind, PartMerger, create_merger};
pub use parts::{PartOutcome, PartPlan, merge_part, part_of, plan_parts};
