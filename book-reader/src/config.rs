//! book-reader configuration management.

use crate::text::chunker::DEFAULT_MAX_PAGE_CHARS;
use crate::tts::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_VOICE: &str = "en-US-EmmaNeural";
const DEFAULT_BACKEND: &str = "edge-tts";
const DEFAULT_MERGER: &str = "ffmpeg";
const DEFAULT_PAGES_PER_PART: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Voice used for new runs
    #[serde(default = "default_voice")]
    pub voice: String,

    /// Synthesis backend (edge-tts, openai)
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Part merger (ffmpeg, concat)
    #[serde(default = "default_merger")]
    pub merger: String,

    /// Pages merged into each part file
    #[serde(default = "default_pages_per_part")]
    pub pages_per_part: usize,

    /// Upper bound for a page before the sentence overflow window
    #[serde(default = "default_max_page_chars")]
    pub max_page_chars: usize,

    /// Attempts per page, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, doubled on each further retry
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Upper bound for a single retry delay
    #[serde(default = "default_max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,

    /// Pages synthesized at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-request timeout for HTTP backends
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Explicit path to the edge-tts executable. None means look in PATH.
    #[serde(default)]
    pub edge_tts_path: Option<PathBuf>,

    /// Explicit path to ffmpeg. None means look in PATH.
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    #[serde(default)]
    pub openai: OpenAiConfig,
}

/// Settings for the OpenAI-compatible backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    #[serde(default = "default_openai_model")]
    pub model: String,

    /// Falls back to OPENAI_API_KEY when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_voice() -> String {
    DEFAULT_VOICE.to_string()
}

fn default_backend() -> String {
    DEFAULT_BACKEND.to_string()
}

fn default_merger() -> String {
    DEFAULT_MERGER.to_string()
}

fn default_pages_per_part() -> usize {
    DEFAULT_PAGES_PER_PART
}

fn default_max_page_chars() -> usize {
    DEFAULT_MAX_PAGE_CHARS
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_max_retry_delay_secs() -> u64 {
    60
}

fn default_concurrency() -> usize {
    1
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_model() -> String {
    "tts-1".to_string()
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            voice: default_voice(),
            backend: default_backend(),
            merger: default_merger(),
            pages_per_part: default_pages_per_part(),
            max_page_chars: default_max_page_chars(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            max_retry_delay_secs: default_max_retry_delay_secs(),
            concurrency: default_concurrency(),
            request_timeout_secs: default_request_timeout_secs(),
            edge_tts_path: None,
            ffmpeg_path: None,
            openai: OpenAiConfig::default(),
        }
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_openai_model(),
            api_key: None,
        }
    }
}

impl ReaderConfig {
    /// Get the config file path: <config_dir>/book-reader/config.toml
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(config_dir.join("book-reader").join("config.toml"))
    }

    /// Load config from file, returning default if file doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: ReaderConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_secs(self.retry_delay_secs),
            Duration::from_secs(self.max_retry_delay_secs),
        )
    }
}
