//! # Sidecar Player
//!
//! Headless driver for sidecar-core: side-loads one locator as a
//! single-sample track, pulls it through the read protocol and prints
//! (or saves) the sample.

use anyhow::Result;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sidecar_core::buffer::{DecoderInputBuffer, FormatHolder, ReadResult};
use sidecar_core::data_source::{parse_locator, DefaultDataSourceFactory};
use sidecar_core::events::{EventListener, QueuedEventHandler};
use sidecar_core::format::{Format, TrackSelection};
use sidecar_core::loader::LoadError;
use sidecar_core::source::{MediaPeriod, MediaSource, PeriodCallback, SampleStream, SourceInfoListener};
use sidecar_core::timeline::Timeline;
use sidecar_core::{SingleSampleMediaSource, SourceConfig, TIME_UNSET};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sidecar=info")),
        )
        .init();

    let options = parse_args(&args)?;
    run(&options)
}

// ============================================================================
// Arguments
// ============================================================================

struct Options {
    locator: String,
    mime_type: Option<String>,
    language: Option<String>,
    duration_us: i64,
    config: Option<PathBuf>,
    out: Option<PathBuf>,
    timeout: Duration,
}

fn parse_args(args: &[String]) -> Result<Options> {
    let mut locator: Option<String> = None;
    let mut mime_type: Option<String> = None;
    let mut language: Option<String> = None;
    let mut duration_us = TIME_UNSET;
    let mut config: Option<PathBuf> = None;
    let mut out: Option<PathBuf> = None;
    let mut timeout = Duration::from_secs(60);

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--input" | "-i" => {
                locator = Some(flag_value(args, i, "--input")?.to_string());
                i += 2;
            }
            "--mime" => {
                mime_type = Some(flag_value(args, i, "--mime")?.to_string());
                i += 2;
            }
            "--language" | "-l" => {
                language = Some(flag_value(args, i, "--language")?.to_string());
                i += 2;
            }
            "--duration-us" => {
                let value = flag_value(args, i, "--duration-us")?;
                duration_us = value
                    .parse::<i64>()
                    .map_err(|e| anyhow::anyhow!("Invalid duration {}: {}", value, e))?;
                i += 2;
            }
            "--config" | "-c" => {
                config = Some(PathBuf::from(flag_value(args, i, "--config")?));
                i += 2;
            }
            "--out" | "-o" => {
                out = Some(PathBuf::from(flag_value(args, i, "--out")?));
                i += 2;
            }
            "--timeout-secs" => {
                let value = flag_value(args, i, "--timeout-secs")?;
                let secs = value
                    .parse::<u64>()
                    .map_err(|e| anyhow::anyhow!("Invalid timeout {}: {}", value, e))?;
                timeout = Duration::from_secs(secs);
                i += 2;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                // A bare argument is taken as the locator.
                if locator.is_none() && !other.starts_with('-') {
                    locator = Some(other.to_string());
                } else {
                    tracing::warn!("Ignoring unknown argument {:?}", other);
                }
                i += 1;
            }
        }
    }

    let locator = locator.ok_or_else(|| {
        print_usage();
        anyhow::anyhow!("Missing required --input locator")
    })?;

    Ok(Options {
        locator,
        mime_type,
        language,
        duration_us,
        config,
        out,
        timeout,
    })
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(|s| s.as_str())
        .ok_or_else(|| anyhow::anyhow!("Missing value for {}", flag))
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  sidecar --input <file|url> [--mime <type>] [--language <tag>] \
         [--duration-us <n>] [--config <json>] [--out <file>] [--timeout-secs <n>]\n"
    );
}

// ============================================================================
// Listeners
// ============================================================================

/// Logs every failed attempt and remembers the most recent one
#[derive(Default)]
struct ErrorLog {
    last: Mutex<Option<String>>,
    attempts: Mutex<u32>,
}

impl EventListener for ErrorLog {
    fn on_load_error(&self, source_id: i32, error: &LoadError) {
        *self.attempts.lock() += 1;
        *self.last.lock() = Some(error.to_string());
        tracing::warn!("source {}: attempt failed: {}", source_id, error);
    }
}

struct TimelineLog;

impl SourceInfoListener for TimelineLog {
    fn on_source_info_refreshed(&mut self, timeline: &dyn Timeline) {
        let window = timeline.window(0);
        tracing::info!(
            "Timeline: {} period(s), duration={}us, seekable={}",
            timeline.period_count(),
            window.duration_us,
            window.is_seekable
        );
    }
}

struct PreparedFlag(bool);

impl PeriodCallback for PreparedFlag {
    fn on_period_prepared(&mut self) {
        self.0 = true;
    }
}

// ============================================================================
// Playback
// ============================================================================

fn run(options: &Options) -> Result<()> {
    let config = match &options.config {
        Some(path) => SourceConfig::from_json_file(path).map_err(|e| anyhow::anyhow!(e))?,
        None => SourceConfig::default(),
    };

    let uri = parse_locator(&options.locator)?;
    let mime_type = match &options.mime_type {
        Some(mime) => mime.clone(),
        None => guess_mime_type(uri.path()).to_string(),
    };
    let format = Format::text(None, &mime_type, options.language.as_deref());

    tracing::info!("Side-loading {} as {}", uri, mime_type);

    let events = Arc::new(QueuedEventHandler::new());
    let errors = Arc::new(ErrorLog::default());
    let mut source = SingleSampleMediaSource::with_config(
        uri,
        Arc::new(DefaultDataSourceFactory::default()),
        format,
        options.duration_us,
        &config,
    )
    .with_event_listener(events.clone(), errors.clone());

    source.prepare_source(&mut TimelineLog);

    let result = play(source.create_period(0), &events, options.timeout);
    source.create_period(0).release_period();
    source.release_source();

    let (format, sample) = result?;
    let attempts = *errors.attempts.lock();
    let last_error = errors.last.lock().clone();

    match &options.out {
        Some(path) => {
            std::fs::write(path, &sample)
                .map_err(|e| anyhow::anyhow!("Failed to write {}: {}", path.display(), e))?;
            tracing::info!("Wrote {} bytes to {}", sample.len(), path.display());
        }
        None => {
            let summary = serde_json::json!({
                "format": format,
                "size": sample.len(),
                "failed_attempts": attempts,
                "last_error": last_error,
                "text": String::from_utf8_lossy(&sample),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

fn play(
    period: &mut SingleSampleMediaSource,
    events: &QueuedEventHandler,
    timeout: Duration,
) -> Result<(Option<Format>, Vec<u8>)> {
    let mut prepared = PreparedFlag(false);
    period.prepare_period(&mut prepared, 0);
    if !prepared.0 {
        return Err(anyhow::anyhow!("Period did not report prepared"));
    }

    let group = period.track_groups().get(0).clone();
    let selections = [Some(TrackSelection::fixed(group, 0))];
    let mut streams = [None];
    let mut reset_flags = [false];
    period.select_tracks(&selections, &[false], &mut streams, &mut reset_flags, 0);
    let [Some(mut stream)] = streams else {
        return Err(anyhow::anyhow!("Track selection produced no stream"));
    };

    let started = Instant::now();
    let mut holder = FormatHolder::default();
    let mut buffer = DecoderInputBuffer::new();
    let mut sample = Vec::new();

    loop {
        period.continue_loading(0);
        events.run_pending();

        match stream.read_data(&mut holder, &mut buffer) {
            ReadResult::FormatRead => {
                if let Some(format) = &holder.format {
                    tracing::info!("Format: {}", format.sample_mime_type);
                }
            }
            ReadResult::BufferRead if buffer.is_end_of_stream() => break,
            ReadResult::BufferRead => {
                tracing::info!(
                    "Sample: {} bytes at {}us (key_frame={})",
                    buffer.data.len(),
                    buffer.time_us,
                    buffer.is_key_frame()
                );
                sample = buffer.data.to_vec();
                buffer.clear();
            }
            ReadResult::NothingRead => {
                stream.maybe_throw_error()?;
                if started.elapsed() > timeout {
                    return Err(anyhow::anyhow!("Timed out after {:?} waiting for the sample", timeout));
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    }

    events.run_pending();
    tracing::info!("Playback complete in {:?}", started.elapsed());
    Ok((holder.format, sample))
}

fn guess_mime_type(path: &str) -> &'static str {
    path.rsplit_once('.')
        .and_then(|(_, ext)| Format::mime_type_for_extension(ext))
        .unwrap_or("text/plain")
}
