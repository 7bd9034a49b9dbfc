//! TTS backend trait and types.

pub mod edge;
#[cfg(test)]
pub mod mock;
pub mod openai;
pub mod retry;

use crate::config::ReaderConfig;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub use retry::{RetryPolicy, RetryingSynthesizer};

/// Failure of a single synthesis call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    /// Network or service hiccup; the same request may succeed later.
    #[error("transient synthesis error: {0}")]
    Transient(String),

    /// Bad voice, bad credentials, missing tool; retrying cannot help.
    #[error("fatal synthesis error: {0}")]
    Fatal(String),
}

pub type SynthesisResult<T> = std::result::Result<T, SynthesisError>;

impl SynthesisError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Represents an available voice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voice {
    /// Voice identifier passed to `synthesize`
    pub id: String,
    /// Gender as reported by the service
    pub gender: Option<String>,
    /// Language/locale (e.g., "en-US")
    pub locale: Option<String>,
}

/// TTS backend trait - all TTS engines implement this.
#[async_trait]
pub trait TtsBackend: Send + Sync {
    /// Synthesize one page of text with the given voice, returning encoded audio.
    async fn synthesize(&self, text: &str, voice: &str) -> SynthesisResult<Vec<u8>>;

    /// List voices the backend accepts.
    async fn list_voices(&self) -> SynthesisResult<Vec<Voice>>;

    /// Backend name as stored in the run configuration.
    fn name(&self) -> &'static str;
}

/// Supported backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    EdgeTts,
    OpenAi,
}

impl BackendKind {
    /// Parse backend kind from string
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "edge-tts" | "edge_tts" | "edge" => Ok(Self::EdgeTts),
            "openai" => Ok(Self::OpenAi),
            _ => anyhow::bail!("Unknown TTS backend: {}. Available: edge-tts, openai", s),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::EdgeTts => edge::BACKEND_NAME,
            Self::OpenAi => openai::BACKEND_NAME,
        }
    }
}

/// Create a TTS backend by name.
pub fn create_backend(name: &str, config: &ReaderConfig) -> Result<Arc<dyn TtsBackend>> {
    match BackendKind::from_str(name)? {
        BackendKind::EdgeTts => Ok(Arc::new(edge::EdgeTtsBackend::new(
            config.edge_tts_path.clone(),
        )?)),
        BackendKind::OpenAi => Ok(Arc::new(openai::OpenAiBackend::from_config(config)?)),
    }
}
