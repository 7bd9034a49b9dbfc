//! Bounded retry with exponential backoff around a TTS backend.

use super::{SynthesisError, TtsBackend};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Default number of attempts per page.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// How many times to try a page and how long to wait between tries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_ATTEMPTS,
            Duration::from_secs(5),
            Duration::from_secs(60),
        )
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    /// Policy without any waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Delay to wait before `attempt` (1-based). Doubles each retry, capped.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Audio for a page and the number of attempts it took.
#[derive(Debug, Clone)]
pub struct Synthesized {
    pub audio: Vec<u8>,
    pub attempts: u32,
}

/// Final error for a page after the retry loop gave up.
#[derive(Debug, Clone)]
pub struct SynthesisFailure {
    pub error: SynthesisError,
    pub attempts: u32,
}

/// Wraps a backend with the retry policy.
#[derive(Clone)]
pub struct RetryingSynthesizer {
    backend: Arc<dyn TtsBackend>,
    policy: RetryPolicy,
}

impl RetryingSynthesizer {
    pub fn new(backend: Arc<dyn TtsBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    /// Synthesize a page, retrying transient failures.
    ///
    /// Fatal errors end the loop at once. After the last transient failure the
    /// transient error is returned so the page stays pending for a later resume.
    pub async fn synthesize(
        &self,
        page: usize,
        text: &str,
        voice: &str,
    ) -> Result<Synthesized, SynthesisFailure> {
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 1;

        loop {
            match self.backend.synthesize(text, voice).await {
                Ok(audio) => {
                    if attempt > 1 {
                        info!("Page {} synthesized after {} attempts", page, attempt);
                    } else {
                        debug!("Page {} synthesized ({} bytes)", page, audio.len());
                    }
                    return Ok(Synthesized {
                        audio,
                        attempts: attempt,
                    });
                }
                Err(error) if !error.is_retryable() => {
                    warn!("Page {} attempt {}/{}: {}", page, attempt, max_attempts, error);
                    return Err(SynthesisFailure {
                        error,
                        attempts: attempt,
                    });
                }
                Err(error) => {
                    warn!(
                        "Attempt {}/{} failed for page {}: {}",
                        attempt, max_attempts, page, error
                    );
                    if attempt >= max_attempts {
                        return Err(SynthesisFailure {
                            error,
                            attempts: attempt,
                        });
                    }
                }
            }

            attempt += 1;
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                debug!("Waiting {:?} before retrying page {}", delay, page);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
