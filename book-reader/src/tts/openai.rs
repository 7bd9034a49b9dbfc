//! OpenAI-compatible speech endpoint (`POST /audio/speech`).

use super::{SynthesisError, SynthesisResult, TtsBackend, Voice};
use crate::config::ReaderConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const BACKEND_NAME: &str = "openai";

/// Environment variable consulted when the config has no API key.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Voices documented for the speech endpoint.
const VOICES: &[&str] = &["alloy", "echo", "fable", "onyx", "nova", "shimmer"];

/// Backend for OpenAI-compatible text-to-speech APIs
pub struct OpenAiBackend {
    model: String,
    base_url: String,
    api_key: String,
    client: Client,
}

impl OpenAiBackend {
    pub fn new(model: &str, base_url: &str, api_key: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    /// Build from the `[openai]` config section, falling back to `OPENAI_API_KEY`.
    pub fn from_config(config: &ReaderConfig) -> Result<Self> {
        let api_key = match &config.openai.api_key {
            Some(key) if !key.is_empty() => key.clone(),
            _ => std::env::var(API_KEY_ENV).with_context(|| {
                format!(
                    "No API key for the openai backend. Set {} or openai.api_key in {}",
                    API_KEY_ENV,
                    ReaderConfig::config_path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|_| "the config file".to_string())
                )
            })?,
        };

        Self::new(
            &config.openai.model,
            &config.openai.base_url,
            api_key,
            Duration::from_secs(config.request_timeout_secs),
        )
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[async_trait]
impl TtsBackend for OpenAiBackend {
    async fn synthesize(&self, text: &str, voice: &str) -> SynthesisResult<Vec<u8>> {
        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice,
            response_format: "mp3",
        };
        let url = format!("{}/audio/speech", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| SynthesisError::Transient(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let message =
                if let Ok(error_response) = serde_json::from_str::<ErrorResponse>(&error_text) {
                    error_response.error.message
                } else {
                    error_text
                };
            return Err(classify_status(status, message));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| SynthesisError::Transient(format!("Failed to read audio: {}", e)))?;
        if audio.is_empty() {
            return Err(SynthesisError::Transient("Empty audio response".into()));
        }

        debug!("{} returned {} bytes", url, audio.len());
        Ok(audio.to_vec())
    }

    async fn list_voices(&self) -> SynthesisResult<Vec<Voice>> {
        Ok(VOICES
            .iter()
            .map(|id| Voice {
                id: id.to_string(),
                gender: None,
                locale: None,
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }
}

/// Rate limits, timeouts and server errors may clear up; other client errors won't.
fn classify_status(status: StatusCode, message: String) -> SynthesisError {
    let message = format!("HTTP {}: {}", status.as_u16(), message.trim());
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        SynthesisError::Transient(message)
    } else {
        SynthesisError::Fatal(message)
    }
}
