//! Mock TTS backend for testing
//!
//! Returns deterministic audio derived from the voice and text, and can be
//! scripted to fail for particular pages.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{SynthesisError, SynthesisResult, TtsBackend, Voice};

type CallHook = Box<dyn Fn(usize, &str) + Send + Sync>;

struct FailurePlan {
    remaining: usize,
    error: SynthesisError,
}

/// A scripted backend for pipeline and retry tests
pub struct MockBackend {
    call_count: AtomicUsize,
    /// Texts in call order
    calls: Mutex<Vec<String>>,
    /// Failures keyed by exact page text
    failures: Mutex<HashMap<String, FailurePlan>>,
    /// Runs before every call with the call number and text
    hook: Option<CallHook>,
}

impl MockBackend {
    /// Create a backend that always succeeds
    pub fn new() -> Self {
        Self {
            call_count: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            hook: None,
        }
    }

    /// Fail `n` calls for `text` with `error`, then succeed
    pub fn fail_times(self, text: &str, n: usize, error: SynthesisError) -> Self {
        self.failures.lock().unwrap().insert(
            text.to_string(),
            FailurePlan {
                remaining: n,
                error,
            },
        );
        self
    }

    /// Fail every call for `text` with `error`
    pub fn always_fail(self, text: &str, error: SynthesisError) -> Self {
        self.fail_times(text, usize::MAX, error)
    }

    /// Run `hook` at the start of each call
    pub fn with_hook(mut self, hook: impl Fn(usize, &str) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Audio the mock produces for a voice and text
    pub fn audio_for(voice: &str, text: &str) -> Vec<u8> {
        format!("[{}:{}]", voice, text).into_bytes()
    }

    /// Get the number of times synthesize() was called
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Texts passed to synthesize(), in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TtsBackend for MockBackend {
    async fn synthesize(&self, text: &str, voice: &str) -> SynthesisResult<Vec<u8>> {
        let call_num = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(text.to_string());
        if let Some(hook) = &self.hook {
            hook(call_num, text);
        }

        if let Some(plan) = self.failures.lock().unwrap().get_mut(text) {
            if plan.remaining > 0 {
                plan.remaining = plan.remaining.saturating_sub(1);
                return Err(plan.error.clone());
            }
        }

        Ok(Self::audio_for(voice, text))
    }

    async fn list_voices(&self) -> SynthesisResult<Vec<Voice>> {
        Ok(vec![Voice {
            id: "mock-voice".to_string(),
            gender: None,
            locale: Some("en-US".to_string()),
        }])
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_failures_run_out() {
        let mock = MockBackend::new().fail_times("a", 1, SynthesisError::Transient("x".into()));
        assert!(mock.synthesize("a", "v").await.is_err());
        assert_eq!(mock.synthesize("a", "v").await.unwrap(), b"[v:a]".to_vec());
        assert_eq!(mock.synthesize("b", "v").await.unwrap(), b"[v:b]".to_vec());
        assert_eq!(mock.call_count(), 3);
        assert_eq!(mock.calls(), vec!["a", "a", "b"]);
    }
}
