//! Microsoft Edge neural voices through the `edge-tts` command line tool.

use super::{SynthesisError, SynthesisResult, TtsBackend, Voice};
use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use std::io;
use std::path::PathBuf;
use tokio::process::Command;

pub const BACKEND_NAME: &str = "edge-tts";

/// Backend that shells out to `edge-tts` once per page.
pub struct EdgeTtsBackend {
    cli_path: PathBuf,
}

impl EdgeTtsBackend {
    /// Create a new edge-tts backend.
    ///
    /// Returns an error if the `edge-tts` executable cannot be found.
    pub fn new(cli_path: Option<PathBuf>) -> Result<Self> {
        let cli_path = match cli_path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("edge-tts not found at specified path: {}", path.display());
                }
                path
            }
            None => which::which("edge-tts").map_err(|_| {
                anyhow::anyhow!("edge-tts not found in PATH. Install it with: pip install edge-tts")
            })?,
        };

        Ok(Self { cli_path })
    }

    /// The child is killed if the call is dropped, e.g. when a run stops mid-page.
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.cli_path);
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run(&self, command: &mut Command) -> SynthesisResult<std::process::Output> {
        command.output().await.map_err(|e| {
            let message = format!("failed to run {}: {}", self.cli_path.display(), e);
            match e.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                    SynthesisError::Fatal(message)
                }
                _ => SynthesisError::Transient(message),
            }
        })
    }
}

#[async_trait]
impl TtsBackend for EdgeTtsBackend {
    async fn synthesize(&self, text: &str, voice: &str) -> SynthesisResult<Vec<u8>> {
        let media = tempfile::Builder::new()
            .prefix("book-reader-")
            .suffix(".mp3")
            .tempfile()
            .map_err(|e| SynthesisError::Transient(format!("cannot create temp file: {}", e)))?;

        let mut command = self.command();
        command
            .arg("--voice")
            .arg(voice)
            .arg(format!("--text={}", text))
            .arg("--write-media")
            .arg(media.path());

        let output = self.run(&mut command).await?;
        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }

        let audio = tokio::fs::read(media.path())
            .await
            .map_err(|e| SynthesisError::Transient(format!("cannot read synthesized audio: {}", e)))?;
        if audio.is_empty() {
            return Err(SynthesisError::Transient("edge-tts produced no audio".into()));
        }

        debug!("edge-tts wrote {} bytes with voice {}", audio.len(), voice);
        Ok(audio)
    }

    async fn list_voices(&self) -> SynthesisResult<Vec<Voice>> {
        let output = self
            .run(self.command().arg("--list-voices"))
            .await?;
        if !output.status.success() {
            return Err(SynthesisError::Transient(format!(
                "edge-tts --list-voices failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut voices = parse_voice_list(&String::from_utf8_lossy(&output.stdout));
        voices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(voices)
    }

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }
}

/// Map an edge-tts error report to a retry class.
fn classify_failure(stderr: &str) -> SynthesisError {
    let message = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("edge-tts exited with an error")
        .to_string();

    if stderr.contains("Invalid voice") {
        SynthesisError::Fatal(message)
    } else {
        SynthesisError::Transient(message)
    }
}

/// Parse `edge-tts --list-voices` output.
///
/// Older releases print `Name:`/`ShortName:`/`Gender:` blocks, newer ones print a table
/// whose first columns are the short name and gender.
fn parse_voice_list(output: &str) -> Vec<Voice> {
    let mut voices = Vec::new();
    let mut pending: Option<Voice> = None;

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("---") {
            continue;
        }

        if let Some(name) = line.strip_prefix("Name:") {
            if let Some(voice) = pending.take() {
                voices.push(voice);
            }
            pending = Some(voice_from_name(name.trim(), None));
        } else if let Some(short_name) = line.strip_prefix("ShortName:") {
            if let Some(voice) = pending.as_mut() {
                let gender = voice.gender.take();
                *voice = voice_from_name(short_name.trim(), None);
                voice.gender = gender;
            }
        } else if let Some(gender) = line.strip_prefix("Gender:") {
            if let Some(voice) = pending.as_mut() {
                voice.gender = Some(gender.trim().to_string());
            }
        } else if let Some(locale) = line.strip_prefix("Locale:") {
            if let Some(voice) = pending.as_mut() {
                voice.locale = Some(locale.trim().to_string());
            }
        } else if line.contains(':') {
            // Other block fields (ContentCategories, VoicePersonalities)
            continue;
        } else {
            let mut columns = line.split_whitespace();
            let (Some(name), gender) = (columns.next(), columns.next()) else {
                continue;
            };
            if name == "Name" || !name.contains('-') {
                continue;
            }
            voices.push(voice_from_name(name, gender));
        }
    }

    if let Some(voice) = pending {
        voices.push(voice);
    }
    voices
}

/// Short names look like `en-US-EmmaNeural`; the locale is the first two parts.
fn voice_from_name(name: &str, gender: Option<&str>) -> Voice {
    let mut parts = name.splitn(3, '-');
    let locale = match (parts.next(), parts.next(), parts.next()) {
        (Some(lang), Some(region), Some(_)) => Some(format!("{}-{}", lang, region)),
        _ => None,
    };
    Voice {
        id: name.to_string(),
        gender: gender.map(str::to_string),
        locale,
    }
}
