//! book-reader - Convert long text files into resumable, part-split audiobooks

mod audio;
mod config;
mod error;
mod pipeline;
mod session;
mod text;
mod tts;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::ReaderConfig;
use error::ConvertError;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use pipeline::{FailurePolicy, Pipeline, PipelineOptions, ResumeRequest, RunReport, StopSignal};
use session::{CheckpointStore, OutputLayout, PageStatus, RunConfig, SourceIdentity};
use std::path::{Path, PathBuf};
use audio::MergerKind;
use tts::{BackendKind, RetryingSynthesizer};

const DEFAULT_OUTPUT_DIR: &str = "audio_book";

#[derive(Parser, Debug)]
#[command(name = "book-reader")]
#[command(about = "Convert long text files into resumable, part-split audiobooks", long_about = None)]
#[command(version)]
struct Args {
    /// Enable debug output
    #[arg(short, long, global = true, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by convert and resume.
#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Part merger (ffmpeg, concat)
    #[arg(long)]
    merger: Option<String>,

    /// Pages synthesized at once
    #[arg(short = 'j', long)]
    jobs: Option<usize>,

    /// What to do when a page keeps failing (stop, skip)
    #[arg(long)]
    on_failure: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start converting a text file
    Convert {
        /// Path to the source text file
        source: PathBuf,

        /// Output directory for pages, parts, and the checkpoint
        #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
        output_dir: PathBuf,

        /// Voice to synthesize with
        #[arg(short, long)]
        voice: Option<String>,

        /// Pages merged into each part
        #[arg(short, long)]
        pages_per_part: Option<usize>,

        /// Page size in characters before the sentence overflow window
        #[arg(long)]
        max_page_chars: Option<usize>,

        /// TTS backend (edge-tts, openai)
        #[arg(long)]
        backend: Option<String>,

        #[command(flatten)]
        run: RunArgs,
    },
    /// Continue an interrupted or failed conversion
    Resume {
        /// Output directory holding the checkpoint
        #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
        output_dir: PathBuf,

        /// Require the stored voice to be this one
        #[arg(short, long)]
        voice: Option<String>,

        /// Require the stored pages-per-part to be this value
        #[arg(short, long)]
        pages_per_part: Option<usize>,

        /// Require the stored backend to be this one
        #[arg(long)]
        backend: Option<String>,

        /// Require the source file to be unchanged
        #[arg(long)]
        source: Option<PathBuf>,

        #[command(flatten)]
        run: RunArgs,
    },
    /// Show progress of a conversion
    Status {
        #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
        output_dir: PathBuf,
    },
    /// List voices offered by a backend
    Voices {
        /// TTS backend (edge-tts, openai)
        #[arg(long)]
        backend: Option<String>,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Set default voice
    SetVoice {
        /// Voice identifier (e.g., en-US-EmmaNeural)
        voice: String,
    },
    /// Set default TTS backend
    SetBackend {
        /// Backend name (edge-tts, openai)
        backend: String,
    },
    /// Set default pages per part
    SetPagesPerPart {
        /// Value (at least 1)
        value: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    match args.command {
        Commands::Convert {
            source,
            output_dir,
            voice,
            pages_per_part,
            max_page_chars,
            backend,
            run,
        } => {
            let config = ReaderConfig::load().context("Failed to load configuration")?;
            let text = std::fs::read_to_string(&source)
                .with_context(|| format!("Failed to read {}", source.display()))?;

            let backend_name = backend.unwrap_or_else(|| config.backend.clone());
            let merger_name = run.merger.as_deref().unwrap_or(&config.merger);
            let run_config = RunConfig {
                voice: voice.unwrap_or_else(|| config.voice.clone()),
                backend: BackendKind::from_str(&backend_name)?.name().to_string(),
                pages_per_part: pages_per_part.unwrap_or(config.pages_per_part),
                max_page_chars: max_page_chars.unwrap_or(config.max_page_chars),
                merger: MergerKind::from_str(merger_name)?.name().to_string(),
                output_dir: std::path::absolute(&output_dir)?,
                source: source_identity(&source)?,
            };

            if args.debug {
                eprintln!("Source: {}", source.display());
                eprintln!("Output: {}", output_dir.display());
                eprintln!("Voice: {}", run_config.voice);
                eprintln!("Backend: {}", run_config.backend);
            }

            let mut pipeline = build_pipeline(
                &config,
                &run_config.backend,
                &run_config.merger,
                &output_dir,
                &run,
                args.debug,
            )?;
            let result = pipeline.start_new(&text, run_config).await;
            debug!("Run ended in state {:?}", pipeline.state());
            finish(result, &output_dir, &run)
        }
        Commands::Resume {
            output_dir,
            voice,
            pages_per_part,
            backend,
            source,
            run,
        } => {
            let config = ReaderConfig::load().context("Failed to load configuration")?;
            let store = CheckpointStore::new(OutputLayout::new(&output_dir));
            let stored = store.load_checkpoint()?;

            let request = ResumeRequest {
                voice,
                backend: backend
                    .map(|b| BackendKind::from_str(&b).map(|k| k.name().to_string()))
                    .transpose()?,
                pages_per_part,
                source: source.as_deref().map(source_identity).transpose()?,
            };

            // The stored backend is used; a requested one only has to match it
            let merger = resume_merger(run.merger.as_deref(), &stored.config.merger)?;
            let mut pipeline = build_pipeline(
                &config,
                &stored.config.backend,
                &merger,
                &output_dir,
                &run,
                args.debug,
            )?;
            let result = pipeline.resume(&request).await;
            debug!("Run ended in state {:?}", pipeline.state());
            finish(result, &output_dir, &run)
        }
        Commands::Status { output_dir } => show_status(&output_dir),
        Commands::Voices { backend } => {
            let config = ReaderConfig::load().context("Failed to load configuration")?;
            let name = backend.unwrap_or_else(|| config.backend.clone());
            let backend = tts::create_backend(&name, &config)?;
            let voices = backend.list_voices().await?;

            println!("Available voices ({}):", backend.name());
            for voice in voices {
                println!(
                    "  - {:<32} {:<8} {}",
                    voice.id,
                    voice.gender.as_deref().unwrap_or(""),
                    voice.locale.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        Commands::Config { action } => handle_config_command(&action),
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_target(false)
        .init();
}

fn source_identity(path: &Path) -> Result<SourceIdentity> {
    let sha256 = session::compute_source_hash(path)
        .with_context(|| format!("Failed to hash {}", path.display()))?;
    Ok(SourceIdentity {
        path: std::path::absolute(path)?,
        sha256,
    })
}

/// Merger for a resumed run: the stored one unless overridden.
fn resume_merger(requested: Option<&str>, stored: &str) -> Result<String> {
    let Some(requested) = requested else {
        return Ok(stored.to_string());
    };
    let name = MergerKind::from_str(requested)?.name();
    if name != stored {
        warn!(
            "Run was started with the {} merger; merging with {} may change the output",
            stored, name
        );
    }
    Ok(name.to_string())
}

fn build_pipeline(
    config: &ReaderConfig,
    backend_name: &str,
    merger_name: &str,
    output_dir: &Path,
    run: &RunArgs,
    debug: bool,
) -> Result<Pipeline> {
    let backend = tts::create_backend(backend_name, config)?;
    let merger = audio::create_merger(merger_name, config)?;
    let failure_policy = match &run.on_failure {
        Some(policy) => FailurePolicy::from_str(policy)?,
        None => FailurePolicy::default(),
    };
    let options = PipelineOptions {
        concurrency: run.jobs.unwrap_or(config.concurrency).max(1),
        failure_policy,
    };

    let stop = StopSignal::new();
    spawn_stop_listener(stop.clone());

    let synthesizer = RetryingSynthesizer::new(backend, config.retry_policy());
    Ok(
        Pipeline::new(OutputLayout::new(output_dir), synthesizer, merger, options)
            .with_stop_signal(stop)
            .with_progress(progress_bar(debug)),
    )
}

fn progress_bar(debug: bool) -> ProgressBar {
    // Debug logging would tear the bar apart
    if debug {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} pages ({eta}) {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Trigger `stop` on ctrl-c or SIGTERM. A second ctrl-c exits at once.
fn spawn_stop_listener(stop: StopSignal) {
    tokio::spawn(async move {
        wait_for_termination().await;
        warn!("Stopping after the current page (press ctrl-c again to quit now)");
        stop.trigger();

        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Report the outcome, telling the user how to resume when that is possible.
fn finish(
    result: std::result::Result<RunReport, ConvertError>,
    output_dir: &Path,
    run: &RunArgs,
) -> Result<()> {
    match result {
        Ok(report) => {
            eprintln!(
                "\nComplete: {} pages ({} synthesized this run), {} part(s), {} written this run",
                report.total_pages,
                report.synthesized,
                report.parts.len(),
                report.parts_written
            );
            for part in &report.parts {
                println!("{}", part.display());
            }
            Ok(())
        }
        Err(e) => {
            if e.is_resumable() {
                eprintln!("\nProgress is saved. Resume with:");
                eprintln!("  {}", resume_command(output_dir, run));
            }
            Err(e.into())
        }
    }
}

/// Command line that continues the run with the same run options.
fn resume_command(output_dir: &Path, run: &RunArgs) -> String {
    let mut command = format!("book-reader resume --output-dir {}", shell_quote(output_dir));
    if let Some(merger) = &run.merger {
        command.push_str(&format!(" --merger {}", shell_quote(Path::new(merger))));
    }
    if let Some(jobs) = run.jobs {
        command.push_str(&format!(" -j {}", jobs));
    }
    if let Some(policy) = &run.on_failure {
        command.push_str(&format!(" --on-failure {}", shell_quote(Path::new(policy))));
    }
    command
}

fn shell_quote(path: &Path) -> String {
    let s = path.to_string_lossy();
    if s.chars().all(|c| c.is_ascii_alphanumeric() || "/._-~".contains(c)) {
        s.into_owned()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

fn show_status(output_dir: &Path) -> Result<()> {
    let store = CheckpointStore::new(OutputLayout::new(output_dir));
    let checkpoint = store.load_checkpoint()?;
    let layout = store.layout();
    let cfg = &checkpoint.config;

    println!("Output directory: {}", output_dir.display());
    println!("Source: {} ({})", cfg.source.path.display(), cfg.source.sha256);
    println!("Voice: {} via {}", cfg.voice, cfg.backend);
    println!("Pages per part: {} (merged with {})", cfg.pages_per_part, cfg.merger);
    println!("Started: {}", checkpoint.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Updated: {}", checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));

    let (completed, total, pct) = checkpoint.progress();
    println!();
    println!("Pages: {}/{} done ({:.1}%)", completed, total, pct);
    for (index, failure) in &checkpoint.failed {
        if checkpoint.status(*index) == PageStatus::Failed {
            println!(
                "  page {} failed after {} attempt(s): {}",
                index, failure.attempts, failure.error
            );
        }
    }
    if checkpoint.is_complete() {
        println!("All pages synthesized");
    } else if let Some(next) = checkpoint.next_pending() {
        println!("Next page: {}", next);
    }

    let plans = audio::plan_parts(checkpoint.total_pages, cfg.pages_per_part);
    let written: Vec<usize> = plans
        .iter()
        .filter(|plan| layout.part_path(plan.index, plans.len()).exists())
        .map(|plan| plan.index)
        .collect();
    println!("Parts: {}/{} written", written.len(), plans.len());
    for plan in &plans {
        let path = layout.part_path(plan.index, plans.len());
        let state = if written.contains(&plan.index) {
            "written"
        } else if plan.is_ready(&checkpoint) {
            "ready to merge"
        } else {
            "pending"
        };
        println!(
            "  {} (pages {}-{}): {}",
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
            plan.pages.start,
            plan.pages.end.saturating_sub(1),
            state
        );
    }

    if checkpoint.is_complete() && written.len() == plans.len() {
        println!("\nConversion complete.");
    } else {
        println!("\nResume with: book-reader resume --output-dir {}", shell_quote(output_dir));
    }
    Ok(())
}

fn handle_config_command(action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = ReaderConfig::load()?;
            println!("Configuration file: {:?}", ReaderConfig::config_path()?);
            println!();
            println!("voice = \"{}\"", config.voice);
            println!("backend = \"{}\"", config.backend);
            println!("merger = \"{}\"", config.merger);
            println!("pages_per_part = {}", config.pages_per_part);
            println!("max_page_chars = {}", config.max_page_chars);
            println!("max_attempts = {}", config.max_attempts);
            println!("retry_delay_secs = {}", config.retry_delay_secs);
            println!("max_retry_delay_secs = {}", config.max_retry_delay_secs);
            println!("concurrency = {}", config.concurrency);
            println!("request_timeout_secs = {}", config.request_timeout_secs);
            match &config.edge_tts_path {
                Some(path) => println!("edge_tts_path = \"{}\"", path.display()),
                None => println!("edge_tts_path = (PATH)"),
            }
            match &config.ffmpeg_path {
                Some(path) => println!("ffmpeg_path = \"{}\"", path.display()),
                None => println!("ffmpeg_path = (PATH)"),
            }
            println!("openai.base_url = \"{}\"", config.openai.base_url);
            println!("openai.model = \"{}\"", config.openai.model);
            let key_state = if config.openai.api_key.is_some() {
                "(set)"
            } else {
                "(from OPENAI_API_KEY)"
            };
            println!("openai.api_key = {}", key_state);
        }
        ConfigAction::SetVoice { voice } => {
            let mut config = ReaderConfig::load()?;
            config.voice = voice.clone();
            config.save()?;
            println!("Default voice set to: {}", config.voice);
        }
        ConfigAction::SetBackend { backend } => {
            let kind = BackendKind::from_str(backend)?;
            let mut config = ReaderConfig::load()?;
            config.backend = kind.name().to_string();
            config.save()?;
            println!("Default backend set to: {}", config.backend);
        }
        ConfigAction::SetPagesPerPart { value } => {
            if *value == 0 {
                anyhow::bail!("Pages per part must be at least 1");
            }
            let mut config = ReaderConfig::load()?;
            config.pages_per_part = *value;
            config.save()?;
            println!("Default pages per part set to: {}", config.pages_per_part);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_convert_defaults() {
        let args = Args::try_parse_from(["book-reader", "convert", "book.txt"]).unwrap();
        match args.command {
            Commands::Convert {
                source,
                output_dir,
                voice,
                run,
                ..
            } => {
                assert_eq!(source, PathBuf::from("book.txt"));
                assert_eq!(output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
                assert!(voice.is_none());
                assert!(run.jobs.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_resume_flags() {
        let args = Args::try_parse_from([
            "book-reader",
            "-d",
            "resume",
            "-o",
            "out",
            "-v",
            "en-GB-RyanNeural",
            "-j",
            "4",
            "--on-failure",
            "skip",
        ])
        .unwrap();
        assert!(args.debug);
        match args.command {
            Commands::Resume {
                output_dir,
                voice,
                run,
                ..
            } => {
                assert_eq!(output_dir, PathBuf::from("out"));
                assert_eq!(voice.as_deref(), Some("en-GB-RyanNeural"));
                assert_eq!(run.jobs, Some(4));
                assert_eq!(run.on_failure.as_deref(), Some("skip"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_resume_command_repeats_run_options() {
        let plain = RunArgs {
            merger: None,
            jobs: None,
            on_failure: None,
        };
        assert_eq!(
            resume_command(Path::new("my book"), &plain),
            "book-reader resume --output-dir 'my book'"
        );

        let tuned = RunArgs {
            merger: Some("concat".to_string()),
            jobs: Some(4),
            on_failure: Some("skip".to_string()),
        };
        assert_eq!(
            resume_command(Path::new("out"), &tuned),
            "book-reader resume --output-dir out --merger concat -j 4 --on-failure skip"
        );
    }

    #[test]
    fn test_resume_uses_stored_merger_by_default() {
        assert_eq!(resume_merger(None, "concat").unwrap(), "concat");
        assert_eq!(resume_merger(Some("bytes"), "concat").unwrap(), "concat");
        assert_eq!(resume_merger(Some("ffmpeg"), "concat").unwrap(), "ffmpeg");
        assert!(resume_merger(Some("sox"), "concat").is_err());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote(Path::new("/tmp/audio_book")), "/tmp/audio_book");
        assert_eq!(shell_quote(Path::new("my book")), "'my book'");
        assert_eq!(shell_quote(Path::new("it's")), "'it'\\''s'");
    }
}
