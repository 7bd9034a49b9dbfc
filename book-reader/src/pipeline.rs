//! Conversion driver: page synthesis, checkpointing, and part merging.

use crate::audio::{PartMerger, PartOutcome, merge_part, part_of, plan_parts};
use crate::error::{ConvertError, MergeFailure, Result};
use crate::session::{Checkpoint, CheckpointStore, OutputLayout, RunConfig, RunLock, SourceIdentity, write_atomic};
use crate::text::{self, Page};
use crate::tts::{RetryingSynthesizer, SynthesisError};
use futures_util::{StreamExt, stream};
use indicatif::ProgressBar;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Synthesizing,
    Merging,
    Complete,
    Failed,
}

/// What to do with a page whose retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop the run and leave the checkpoint for a later resume
    #[default]
    Stop,
    /// Record the failure and continue with later pages
    Skip,
}

impl FailurePolicy {
    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "stop" | "abort" => Ok(Self::Stop),
            "skip" => Ok(Self::Skip),
            _ => anyhow::bail!("Unknown failure policy: {}. Available: stop, skip", s),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Pages synthesized at once
    pub concurrency: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            failure_policy: FailurePolicy::Stop,
        }
    }
}

/// Cooperative stop request, checked between pages.
#[derive(Debug, Clone)]
pub struct StopSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once a stop has been requested.
    pub async fn triggered(&self) {
        let mut receiver = self.sender.subscribe();
        let _ = receiver.wait_for(|stopped| *stopped).await;
    }
}

/// Values a resume may pin; each one given must match the checkpoint.
#[derive(Debug, Clone, Default)]
pub struct ResumeRequest {
    pub voice: Option<String>,
    pub backend: Option<String>,
    pub pages_per_part: Option<usize>,
    pub source: Option<SourceIdentity>,
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub total_pages: usize,
    /// Pages synthesized by this invocation
    pub synthesized: usize,
    /// Part files written by this invocation
    pub parts_written: usize,
    /// Every part file of the run, in order
    pub parts: Vec<PathBuf>,
}

struct SynthesisSummary {
    synthesized: usize,
    skipped: Vec<usize>,
    /// Parts merged eagerly while synthesizing
    parts_written: usize,
}

/// Drives one conversion run against an output directory.
pub struct Pipeline {
    store: CheckpointStore,
    synthesizer: RetryingSynthesizer,
    merger: Arc<dyn PartMerger>,
    options: PipelineOptions,
    stop: StopSignal,
    progress: ProgressBar,
    state: RunState,
}

impl Pipeline {
    pub fn new(
        layout: OutputLayout,
        synthesizer: RetryingSynthesizer,
        merger: Arc<dyn PartMerger>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store: CheckpointStore::new(layout),
            synthesizer,
            merger,
            options,
            stop: StopSignal::new(),
            progress: ProgressBar::hidden(),
            state: RunState::Starting,
        }
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Report page completion on `progress`.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Start a new run from raw source text.
    pub async fn start_new(&mut self, source_text: &str, config: RunConfig) -> Result<RunReport> {
        self.state = RunState::Starting;
        if config.pages_per_part == 0 {
            return Err(ConvertError::InvalidConfig("pages per part must be at least 1".into()));
        }
        if config.max_page_chars == 0 {
            return Err(ConvertError::InvalidConfig("page size must be at least 1".into()));
        }

        let lock = RunLock::acquire(self.store.layout())?;
        debug!("Holding {}", lock.path().display());
        if self.store.exists() {
            return Err(ConvertError::CheckpointExists(
                self.store.layout().root().to_path_buf(),
            ));
        }
        self.preflight().await?;
        self.remove_orphaned_audio()?;

        let pages = text::paginate(source_text, config.max_page_chars);
        if pages.is_empty() {
            warn!("Source contains no speakable text");
        }
        info!(
            "Split source into {} pages ({} per part, voice {})",
            pages.len(),
            config.pages_per_part,
            config.voice
        );

        let checkpoint = self.store.create(config, &pages)?;
        self.run(checkpoint, pages).await
    }

    /// Continue the run stored in the output directory.
    pub async fn resume(&mut self, request: &ResumeRequest) -> Result<RunReport> {
        self.state = RunState::Starting;
        let lock = RunLock::acquire(self.store.layout())?;
        debug!("Holding {}", lock.path().display());

        let (checkpoint, pages) = self.store.load()?;
        validate_resume(&checkpoint.config, request)?;
        if checkpoint.config.output_dir != self.store.layout().root() {
            warn!(
                "Run was started in {}, continuing in {}",
                checkpoint.config.output_dir.display(),
                self.store.layout().root().display()
            );
        }
        self.preflight().await?;

        let (done, total, pct) = checkpoint.progress();
        info!(
            "Resuming: {}/{} pages done ({:.1}%), {} to go",
            done,
            total,
            pct,
            checkpoint.remaining().len()
        );
        self.run(checkpoint, pages).await
    }

    /// Delete page and part audio that no checkpoint accounts for.
    ///
    /// Existing part files are skipped by the merge stage, so audio left by an
    /// earlier run would otherwise end up in the new book.
    fn remove_orphaned_audio(&self) -> Result<()> {
        let orphans = self.store.layout().audio_files()?;
        if orphans.is_empty() {
            return Ok(());
        }
        warn!(
            "Removing {} audio file(s) in {} left without a checkpoint",
            orphans.len(),
            self.store.layout().root().display()
        );
        for path in orphans {
            debug!("Removing {}", path.display());
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    async fn preflight(&self) -> Result<()> {
        self.merger
            .preflight()
            .await
            .map_err(|e| ConvertError::MergerUnavailable(e.to_string()))
    }

    async fn run(&mut self, mut checkpoint: Checkpoint, pages: Vec<Page>) -> Result<RunReport> {
        self.state = RunState::Synthesizing;
        info!("State: {:?}", self.state);

        let summary = match self.synthesize_pages(&mut checkpoint, &pages).await {
            Ok(summary) => summary,
            Err(e) => {
                self.state = RunState::Failed;
                self.progress.abandon();
                return Err(e);
            }
        };
        self.progress.finish();

        self.state = RunState::Merging;
        info!("State: {:?}", self.state);
        let (parts, parts_written, failures) = self.merge_ready_parts(&checkpoint).await;

        // Leftover work stays in Merging: the checkpoint is intact and resume finishes it
        if !summary.skipped.is_empty() {
            for failure in &failures {
                error!("Part {} not merged: {}", failure.part, failure.message);
            }
            return Err(ConvertError::PagesFailed {
                pages: summary.skipped,
            });
        }
        if !failures.is_empty() {
            return Err(ConvertError::Merge { failures });
        }

        self.state = RunState::Complete;
        info!(
            "State: {:?} ({} pages, {} parts)",
            self.state,
            checkpoint.total_pages,
            parts.len()
        );
        Ok(RunReport {
            total_pages: checkpoint.total_pages,
            synthesized: summary.synthesized,
            parts_written: summary.parts_written + parts_written,
            parts,
        })
    }

    /// Synthesize every page not yet done, in page order.
    ///
    /// Up to `concurrency` synthesis calls run at once, but results are written
    /// and checkpointed strictly in page order by this task alone.
    async fn synthesize_pages(
        &self,
        checkpoint: &mut Checkpoint,
        pages: &[Page],
    ) -> Result<SynthesisSummary> {
        let total = checkpoint.total_pages;
        let layout = self.store.layout();
        let voice = checkpoint.config.voice.clone();
        let pending: Vec<&Page> = pages.iter().filter(|p| !checkpoint.is_done(p.index)).collect();

        self.progress.set_length(total as u64);
        self.progress.set_position(checkpoint.completed_count() as u64);

        let synthesizer = &self.synthesizer;
        let voice = voice.as_str();
        let mut results = std::pin::pin!(
            stream::iter(pending)
                .map(|page| async move {
                    (page.index, synthesizer.synthesize(page.index, &page.text, voice).await)
                })
                .buffered(self.options.concurrency.max(1))
        );

        let mut summary = SynthesisSummary {
            synthesized: 0,
            skipped: Vec::new(),
            parts_written: 0,
        };

        loop {
            if self.stop.is_triggered() {
                return Err(self.interrupted(checkpoint));
            }

            let next = tokio::select! {
                biased;
                _ = self.stop.triggered() => return Err(self.interrupted(checkpoint)),
                next = results.next() => next,
            };
            let Some((index, outcome)) = next else {
                break;
            };

            match outcome {
                Ok(synthesized) => {
                    write_atomic(&layout.page_audio_path(index, total), &synthesized.audio)?;
                    self.store.mark_page_done(checkpoint, index)?;
                    summary.synthesized += 1;
                    self.progress.inc(1);
                    debug!("Page {} done ({} attempt(s))", index, synthesized.attempts);
                    if self.merge_part_if_ready(checkpoint, index).await {
                        summary.parts_written += 1;
                    }
                }
                Err(failure) => {
                    self.store.mark_page_failed(
                        checkpoint,
                        index,
                        &failure.error.to_string(),
                        failure.attempts,
                    )?;
                    let fatal = matches!(failure.error, SynthesisError::Fatal(_));
                    if fatal || self.options.failure_policy == FailurePolicy::Stop {
                        return Err(ConvertError::Synthesis {
                            page: index,
                            attempts: failure.attempts,
                            source: failure.error,
                        });
                    }
                    warn!(
                        "Skipping page {} after {} attempt(s): {}",
                        index, failure.attempts, failure.error
                    );
                    summary.skipped.push(index);
                }
            }
        }

        Ok(summary)
    }

    fn interrupted(&self, checkpoint: &Checkpoint) -> ConvertError {
        let next_page = checkpoint.next_pending().unwrap_or(checkpoint.total_pages);
        info!("Stop requested; next page to synthesize is {}", next_page);
        ConvertError::Interrupted { next_page }
    }

    /// Merge the part holding `page` once all of its pages are done.
    ///
    /// Failures here are only logged; the Merging stage retries the part.
    /// Returns true if a part file was written.
    async fn merge_part_if_ready(&self, checkpoint: &Checkpoint, page: usize) -> bool {
        let per_part = checkpoint.config.pages_per_part;
        let plans = plan_parts(checkpoint.total_pages, per_part);
        let Some(plan) = plans.get(part_of(page, per_part)) else {
            return false;
        };
        if !plan.is_ready(checkpoint) {
            return false;
        }

        match merge_part(
            self.merger.as_ref(),
            self.store.layout(),
            plan,
            checkpoint.total_pages,
            plans.len(),
        )
        .await
        {
            Ok(outcome) => matches!(outcome, PartOutcome::Written(_)),
            Err(e) => {
                warn!("Part {} merge failed, will retry: {}", plan.index, e);
                false
            }
        }
    }

    /// Merge every part whose pages are all done, skipping existing part files.
    async fn merge_ready_parts(
        &self,
        checkpoint: &Checkpoint,
    ) -> (Vec<PathBuf>, usize, Vec<MergeFailure>) {
        let plans = plan_parts(checkpoint.total_pages, checkpoint.config.pages_per_part);
        let mut parts = Vec::with_capacity(plans.len());
        let mut written = 0;
        let mut failures = Vec::new();

        for plan in &plans {
            if !plan.is_ready(checkpoint) {
                continue;
            }
            match merge_part(
                self.merger.as_ref(),
                self.store.layout(),
                plan,
                checkpoint.total_pages,
                plans.len(),
            )
            .await
            {
                Ok(outcome) => {
                    if matches!(outcome, PartOutcome::Written(_)) {
                        written += 1;
                    }
                    parts.push(outcome.path().clone());
                }
                Err(e) => {
                    error!("Failed to merge part {}: {}", plan.index, e);
                    failures.push(MergeFailure {
                        part: plan.index,
                        message: e.to_string(),
                    });
                }
            }
        }

        (parts, written, failures)
    }
}

/// Refuse a resume whose pinned values disagree with the stored run.
fn validate_resume(stored: &RunConfig, request: &ResumeRequest) -> Result<()> {
    fn check(field: &'static str, stored: String, requested: Option<String>) -> Result<()> {
        match requested {
            Some(requested) if requested != stored => Err(ConvertError::ConfigMismatch {
                field,
                stored,
                requested,
            }),
            _ => Ok(()),
        }
    }

    check("voice", stored.voice.clone(), request.voice.clone())?;
    check("backend", stored.backend.clone(), request.backend.clone())?;
    check(
        "pages_per_part",
        stored.pages_per_part.to_string(),
        request.pages_per_part.map(|n| n.to_string()),
    )?;
    check(
        "source",
        stored.source.sha256.clone(),
        request.source.as_ref().map(|s| s.sha256.clone()),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MergeError;
    use crate::audio::merger::ByteConcatMerger;
    use crate::session::PageStatus;
    use crate::session::sample_config;
    use crate::tts::RetryPolicy;
    use crate::tts::mock::MockBackend;
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;

    const SCENARIO: &str = "Hello world. This is page two! And a third?";
    const FIVE_PAGES: &str =
        "Hello world. This is page two! And a third? Then a fourth. And the end.";

    /// Fails every merge whose output file name starts with `prefix`.
    struct PickyMerger {
        prefix: &'static str,
    }

    #[async_trait]
    impl PartMerger for PickyMerger {
        async fn merge(&self, inputs: &[PathBuf], output: &Path) -> std::result::Result<(), MergeError> {
            let name = output.file_name().unwrap().to_string_lossy();
            if name.starts_with(self.prefix) {
                return Err(MergeError::Tool("disk full".into()));
            }
            ByteConcatMerger.merge(inputs, output).await
        }

        fn name(&self) -> &'static str {
            "picky"
        }
    }

    fn config_for(dir: &Path) -> RunConfig {
        RunConfig {
            max_page_chars: 15,
            output_dir: dir.to_path_buf(),
            ..sample_config()
        }
    }

    fn pipeline(dir: &Path, backend: &Arc<MockBackend>) -> Pipeline {
        pipeline_with(dir, backend, Arc::new(ByteConcatMerger), PipelineOptions::default())
    }

    fn pipeline_with(
        dir: &Path,
        backend: &Arc<MockBackend>,
        merger: Arc<dyn PartMerger>,
        options: PipelineOptions,
    ) -> Pipeline {
        let synthesizer = RetryingSynthesizer::new(backend.clone(), RetryPolicy::immediate(3));
        Pipeline::new(OutputLayout::new(dir), synthesizer, merger, options)
    }

    fn load_checkpoint(dir: &Path) -> Checkpoint {
        CheckpointStore::new(OutputLayout::new(dir))
            .load_checkpoint()
            .unwrap()
    }

    fn expected_pages(text: &str) -> Vec<String> {
        text::paginate(text, 15).into_iter().map(|p| p.text).collect()
    }

    fn read_parts(dir: &Path, total_parts: usize) -> Vec<Vec<u8>> {
        let layout = OutputLayout::new(dir);
        (0..total_parts)
            .map(|part| std::fs::read(layout.part_path(part, total_parts)).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_scenario_run_completes() {
        let temp_dir = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut pipeline = pipeline(temp_dir.path(), &backend);

        let report = pipeline
            .start_new(SCENARIO, config_for(temp_dir.path()))
            .await
            .unwrap();

        assert_eq!(pipeline.state(), RunState::Complete);
        assert_eq!(
            backend.calls(),
            vec!["Hello world.", "This is page two!", "And a third?"]
        );
        assert_eq!(report.total_pages, 3);
        assert_eq!(report.synthesized, 3);
        assert_eq!(report.parts.len(), 2);
        assert_eq!(report.parts_written, 2);

        let voice = "en-US-EmmaNeural";
        let mut first = MockBackend::audio_for(voice, "Hello world.");
        first.extend(MockBackend::audio_for(voice, "This is page two!"));
        assert_eq!(read_parts(temp_dir.path(), 2), vec![
            first,
            MockBackend::audio_for(voice, "And a third?"),
        ]);

        let checkpoint = load_checkpoint(temp_dir.path());
        assert!(checkpoint.is_complete());
        assert!(!OutputLayout::new(temp_dir.path()).lock_path().exists());
    }

    #[tokio::test]
    async fn test_transient_failures_on_page_three_recover() {
        let temp_dir = TempDir::new().unwrap();
        let pages = expected_pages(FIVE_PAGES);
        assert_eq!(pages.len(), 5);
        let backend = Arc::new(MockBackend::new().fail_times(
            &pages[3],
            2,
            SynthesisError::Transient("503".into()),
        ));
        let mut pipeline = pipeline(temp_dir.path(), &backend);

        pipeline
            .start_new(FIVE_PAGES, config_for(temp_dir.path()))
            .await
            .unwrap();

        let checkpoint = load_checkpoint(temp_dir.path());
        assert_eq!(checkpoint.status(3), PageStatus::Done);
        assert!(checkpoint.failed.is_empty());
        let page_three_calls = backend.calls().iter().filter(|t| **t == pages[3]).count();
        assert_eq!(page_three_calls, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_stop_the_run() {
        let temp_dir = TempDir::new().unwrap();
        let pages = expected_pages(FIVE_PAGES);
        let backend = Arc::new(
            MockBackend::new().always_fail(&pages[1], SynthesisError::Transient("timeout".into())),
        );
        let mut pipeline = pipeline(temp_dir.path(), &backend);

        let err = pipeline
            .start_new(FIVE_PAGES, config_for(temp_dir.path()))
            .await
            .unwrap_err();

        match &err {
            ConvertError::Synthesis { page, attempts, .. } => {
                assert_eq!(*page, 1);
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(err.is_resumable());
        assert_eq!(pipeline.state(), RunState::Failed);
        // Page 2 was never attempted
        assert_eq!(backend.call_count(), 4);

        let checkpoint = load_checkpoint(temp_dir.path());
        assert_eq!(checkpoint.completed.iter().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(checkpoint.status(1), PageStatus::Failed);
        assert_eq!(checkpoint.failed[&1].attempts, 3);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_even_when_skipping() {
        let temp_dir = TempDir::new().unwrap();
        let backend = Arc::new(
            MockBackend::new().always_fail("Hello world.", SynthesisError::Fatal("bad voice".into())),
        );
        let options = PipelineOptions {
            failure_policy: FailurePolicy::Skip,
            ..PipelineOptions::default()
        };
        let mut pipeline =
            pipeline_with(temp_dir.path(), &backend, Arc::new(ByteConcatMerger), options);

        let err = pipeline
            .start_new(SCENARIO, config_for(temp_dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::Synthesis { page: 0, attempts: 1, .. }));
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_resume_synthesizes_only_remaining_pages() {
        let temp_dir = TempDir::new().unwrap();
        let pages = expected_pages(FIVE_PAGES);
        let failing = Arc::new(
            MockBackend::new().always_fail(&pages[2], SynthesisError::Transient("reset".into())),
        );
        let mut first = pipeline(temp_dir.path(), &failing);
        assert!(first
            .start_new(FIVE_PAGES, config_for(temp_dir.path()))
            .await
            .is_err());

        let healthy = Arc::new(MockBackend::new());
        let mut second = pipeline(temp_dir.path(), &healthy);
        let report = second.resume(&ResumeRequest::default()).await.unwrap();

        assert_eq!(healthy.calls(), pages[2..].to_vec());
        assert_eq!(report.synthesized, 3);
        assert_eq!(second.state(), RunState::Complete);
    }

    #[tokio::test]
    async fn test_interrupted_and_resumed_output_is_identical() {
        let straight_dir = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut straight = pipeline(straight_dir.path(), &backend);
        straight
            .start_new(FIVE_PAGES, config_for(straight_dir.path()))
            .await
            .unwrap();

        let resumed_dir = TempDir::new().unwrap();
        let stop = StopSignal::new();
        let trigger = stop.clone();
        let backend = Arc::new(MockBackend::new().with_hook(move |call, _| {
            if call == 2 {
                trigger.trigger();
            }
        }));
        let mut interrupted = pipeline(resumed_dir.path(), &backend).with_stop_signal(stop);
        let err = interrupted
            .start_new(FIVE_PAGES, config_for(resumed_dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::Interrupted { next_page: 3 }));

        // Part 0 was merged as soon as its pages were done
        let layout = OutputLayout::new(resumed_dir.path());
        assert!(layout.part_path(0, 3).exists());
        assert!(!layout.part_path(1, 3).exists());

        let backend = Arc::new(MockBackend::new());
        let mut resumed = pipeline(resumed_dir.path(), &backend);
        resumed.resume(&ResumeRequest::default()).await.unwrap();
        assert_eq!(backend.call_count(), 2);

        assert_eq!(
            read_parts(straight_dir.path(), 3),
            read_parts(resumed_dir.path(), 3)
        );
    }

    #[tokio::test]
    async fn test_resume_with_different_voice_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        let backend = Arc::new(
            MockBackend::new().always_fail("This is page two!", SynthesisError::Transient("x".into())),
        );
        let mut first = pipeline(temp_dir.path(), &backend);
        assert!(first
            .start_new(SCENARIO, config_for(temp_dir.path()))
            .await
            .is_err());

        let backend = Arc::new(MockBackend::new());
        let mut second = pipeline(temp_dir.path(), &backend);
        let request = ResumeRequest {
            voice: Some("en-GB-RyanNeural".into()),
            ..ResumeRequest::default()
        };
        let err = second.resume(&request).await.unwrap_err();

        match err {
            ConvertError::ConfigMismatch {
                field,
                stored,
                requested,
            } => {
                assert_eq!(field, "voice");
                assert_eq!(stored, "en-US-EmmaNeural");
                assert_eq!(requested, "en-GB-RyanNeural");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_matching_resume_values_are_accepted() {
        let stored = sample_config();
        let request = ResumeRequest {
            voice: Some(stored.voice.clone()),
            backend: Some(stored.backend.clone()),
            pages_per_part: Some(stored.pages_per_part),
            source: Some(stored.source.clone()),
        };
        assert!(validate_resume(&stored, &request).is_ok());

        let request = ResumeRequest {
            pages_per_part: Some(7),
            ..ResumeRequest::default()
        };
        assert!(matches!(
            validate_resume(&stored, &request),
            Err(ConvertError::ConfigMismatch { field: "pages_per_part", .. })
        ));
    }

    #[tokio::test]
    async fn test_start_refuses_existing_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut pipeline = pipeline(temp_dir.path(), &backend);
        pipeline
            .start_new(SCENARIO, config_for(temp_dir.path()))
            .await
            .unwrap();

        let err = pipeline
            .start_new(SCENARIO, config_for(temp_dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::CheckpointExists(_)));
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn test_new_run_replaces_audio_left_without_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let layout = OutputLayout::new(temp_dir.path());
        std::fs::create_dir_all(layout.pages_dir()).unwrap();
        std::fs::write(layout.part_path(0, 2), "OLD BOOK AUDIO").unwrap();
        std::fs::write(layout.part_path(7, 10), "OLD BOOK AUDIO").unwrap();
        std::fs::write(layout.page_audio_path(0, 3), "OLD PAGE").unwrap();

        let backend = Arc::new(MockBackend::new());
        let mut pipeline = pipeline(temp_dir.path(), &backend);
        let report = pipeline
            .start_new(SCENARIO, config_for(temp_dir.path()))
            .await
            .unwrap();

        assert_eq!(backend.call_count(), 3);
        assert_eq!(report.parts_written, 2);
        let voice = "en-US-EmmaNeural";
        let mut first = MockBackend::audio_for(voice, "Hello world.");
        first.extend(MockBackend::audio_for(voice, "This is page two!"));
        assert_eq!(read_parts(temp_dir.path(), 2)[0], first);
        assert!(!layout.part_path(7, 10).exists());
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut pipeline = pipeline(temp_dir.path(), &backend);
        let err = pipeline.resume(&ResumeRequest::default()).await.unwrap_err();
        assert!(matches!(err, ConvertError::CheckpointNotFound(_)));
    }

    #[tokio::test]
    async fn test_merge_failure_is_isolated_and_retried_on_resume() {
        let temp_dir = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut pipeline = pipeline_with(
            temp_dir.path(),
            &backend,
            Arc::new(PickyMerger { prefix: "part_01" }),
            PipelineOptions::default(),
        );

        let err = pipeline
            .start_new(FIVE_PAGES, config_for(temp_dir.path()))
            .await
            .unwrap_err();
        match &err {
            ConvertError::Merge { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].part, 1);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(err.is_resumable());
        assert_eq!(pipeline.state(), RunState::Merging);

        let layout = OutputLayout::new(temp_dir.path());
        assert!(layout.part_path(0, 3).exists());
        assert!(!layout.part_path(1, 3).exists());
        assert!(layout.part_path(2, 3).exists());
        for page in 0..5 {
            assert!(layout.page_audio_path(page, 5).exists());
        }

        let backend = Arc::new(MockBackend::new());
        let mut resumed = pipeline_with(
            temp_dir.path(),
            &backend,
            Arc::new(ByteConcatMerger),
            PipelineOptions::default(),
        );
        let report = resumed.resume(&ResumeRequest::default()).await.unwrap();
        assert_eq!(backend.call_count(), 0);
        assert_eq!(report.parts_written, 1);
        assert_eq!(report.parts.len(), 3);
    }

    #[tokio::test]
    async fn test_skip_policy_continues_and_reports_gaps() {
        let temp_dir = TempDir::new().unwrap();
        let pages = expected_pages(FIVE_PAGES);
        let backend = Arc::new(
            MockBackend::new().always_fail(&pages[1], SynthesisError::Transient("timeout".into())),
        );
        let options = PipelineOptions {
            failure_policy: FailurePolicy::Skip,
            ..PipelineOptions::default()
        };
        let mut pipeline =
            pipeline_with(temp_dir.path(), &backend, Arc::new(ByteConcatMerger), options.clone());

        let err = pipeline
            .start_new(FIVE_PAGES, config_for(temp_dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(&err, ConvertError::PagesFailed { pages } if pages == &vec![1]));
        assert_eq!(pipeline.state(), RunState::Merging);

        let layout = OutputLayout::new(temp_dir.path());
        assert!(!layout.part_path(0, 3).exists());
        assert!(layout.part_path(1, 3).exists());
        assert!(layout.part_path(2, 3).exists());

        let backend = Arc::new(MockBackend::new());
        let mut resumed =
            pipeline_with(temp_dir.path(), &backend, Arc::new(ByteConcatMerger), options);
        resumed.resume(&ResumeRequest::default()).await.unwrap();
        assert_eq!(backend.calls(), vec![pages[1].clone()]);
        assert!(layout.part_path(0, 3).exists());
    }

    #[tokio::test]
    async fn test_parallel_synthesis_matches_sequential_output() {
        let sequential_dir = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        pipeline(sequential_dir.path(), &backend)
            .start_new(FIVE_PAGES, config_for(sequential_dir.path()))
            .await
            .unwrap();

        let parallel_dir = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let options = PipelineOptions {
            concurrency: 4,
            ..PipelineOptions::default()
        };
        let mut parallel =
            pipeline_with(parallel_dir.path(), &backend, Arc::new(ByteConcatMerger), options);
        parallel
            .start_new(FIVE_PAGES, config_for(parallel_dir.path()))
            .await
            .unwrap();

        assert_eq!(backend.call_count(), 5);
        assert_eq!(
            read_parts(sequential_dir.path(), 3),
            read_parts(parallel_dir.path(), 3)
        );
    }

    #[tokio::test]
    async fn test_locked_output_directory_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        let _lock = RunLock::acquire(&OutputLayout::new(temp_dir.path())).unwrap();

        let backend = Arc::new(MockBackend::new());
        let mut pipeline = pipeline(temp_dir.path(), &backend);
        let err = pipeline
            .start_new(SCENARIO, config_for(temp_dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::Locked { .. }));
        assert!(!OutputLayout::new(temp_dir.path()).checkpoint_path().exists());
    }

    #[tokio::test]
    async fn test_zero_pages_per_part_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut pipeline = pipeline(temp_dir.path(), &backend);
        let config = RunConfig {
            pages_per_part: 0,
            ..config_for(temp_dir.path())
        };
        assert!(matches!(
            pipeline.start_new(SCENARIO, config).await,
            Err(ConvertError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_failure_policy_parsing() {
        assert_eq!(FailurePolicy::from_str("stop").unwrap(), FailurePolicy::Stop);
        assert_eq!(FailurePolicy::from_str("SKIP").unwrap(), FailurePolicy::Skip);
        assert!(FailurePolicy::from_str("ignore").is_err());
        assert_eq!(FailurePolicy::default(), FailurePolicy::Stop);
    }

    #[tokio::test]
    async fn test_stop_signal() {
        let stop = StopSignal::new();
        assert!(!stop.is_triggered());
        let waiter = stop.clone();
        let handle = tokio::spawn(async move { waiter.triggered().await });
        stop.trigger();
        handle.await.unwrap();
        assert!(stop.is_triggered());
    }
}
