//! Checkpoint store for a conversion run, with resume support.

mod layout;
mod lock;
mod persistence;
mod types;

pub use layout::OutputLayout;
pub use lock::RunLock;
pub use persistence::{CheckpointStore, compute_source_hash, write_atomic};
pub use types::{Checkpoint, PageStatus, RunConfig, SourceIdentity};

#[cfg(test)]
pub(crate) use types::tests::sample_config;
