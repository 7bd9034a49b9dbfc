//! Text processing for TTS: normalization and page splitting.

pub mod chunker;
mod cleaner;

pub use chunker::split_into_pages;
pub use cleaner::normalize;

use serde::{Deserialize, Serialize};

/// A page of text synthesized in one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Position of the page in the source text
    pub index: usize,
    /// The text content
    pub text: String,
}

impl Page {
    /// Create a new page.
    pub fn new(index: usize, text: String) -> Self {
        Self { index, text }
    }
}

/// Normalize raw source text and split it into pages.
pub fn paginate(raw: &str, max_page_chars: usize) -> Vec<Page> {
    split_into_pages(&normalize(raw), max_page_chars)
}
