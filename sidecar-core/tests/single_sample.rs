//! End-to-end playback of a side-loaded single-sample track.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use sidecar_core::buffer::{DecoderInputBuffer, FormatHolder, ReadResult};
use sidecar_core::data_source::{
    parse_locator, ByteArrayDataSource, ByteArrayDataSourceFactory, DataSourceError, DefaultDataSourceFactory,
};
use sidecar_core::events::{EventListener, QueuedEventHandler};
use sidecar_core::format::{Format, TrackSelection};
use sidecar_core::loader::{LoadError, LoaderConfig};
use sidecar_core::sample_loader::SourceLoadable;
use sidecar_core::source::{MediaPeriod, MediaSource, PeriodCallback, SampleStream, SourceInfoListener};
use sidecar_core::testing::{FlakyDataSourceFactory, ManualLoaderFactory, RunOutcome};
use sidecar_core::timeline::Timeline;
use sidecar_core::{BufferPosition, SingleSampleMediaSource, SourceConfig};

#[derive(Default)]
struct TimelineCapture {
    durations: Vec<(usize, i64, bool)>,
}

impl SourceInfoListener for TimelineCapture {
    fn on_source_info_refreshed(&mut self, timeline: &dyn Timeline) {
        let window = timeline.window(0);
        self.durations
            .push((timeline.period_count(), timeline.period(0).duration_us, window.is_seekable));
    }
}

struct Prepared(bool);

impl PeriodCallback for Prepared {
    fn on_period_prepared(&mut self) {
        self.0 = true;
    }
}

#[derive(Default)]
struct ErrorRecorder {
    events: Mutex<Vec<(i32, String)>>,
}

impl EventListener for ErrorRecorder {
    fn on_load_error(&self, source_id: i32, error: &LoadError) {
        self.events.lock().push((source_id, error.to_string()));
    }
}

fn uri() -> url::Url {
    url::Url::parse("https://example.com/subs.vtt").unwrap()
}

fn vtt() -> Format {
    Format::text(Some("sidecar"), "text/vtt", Some("en"))
}

fn select_one(period: &mut SingleSampleMediaSource) -> sidecar_core::sample_stream::SingleSampleStream {
    let group = period.track_groups().get(0).clone();
    let mut streams = [None];
    let mut reset = [false];
    period.select_tracks(&[Some(TrackSelection::fixed(group, 0))], &[true], &mut streams, &mut reset, 0);
    assert!(reset[0]);
    let [Some(stream)] = streams else {
        panic!("no stream created");
    };
    stream
}

#[test]
fn test_end_to_end_three_bytes() {
    let loaders = ManualLoaderFactory::<SourceLoadable>::new();
    let factory = Arc::new(ByteArrayDataSourceFactory::new(ByteArrayDataSource::new(vec![1u8, 2, 3])));
    let mut source = SingleSampleMediaSource::new(uri(), factory, vtt(), 5_000_000)
        .with_loader_factory(Arc::new(loaders.clone()));

    let mut timeline = TimelineCapture::default();
    source.prepare_source(&mut timeline);
    assert_eq!(timeline.durations, vec![(1, 5_000_000, true)]);

    let period = source.create_period(0);
    let mut prepared = Prepared(false);
    period.prepare_period(&mut prepared, 0);
    assert!(prepared.0);
    assert_eq!(period.duration_us(), 5_000_000);
    assert_eq!(period.track_groups().len(), 1);

    let mut stream = select_one(period);
    assert!(!stream.is_ready());
    assert_eq!(period.buffered_position_us(), BufferPosition::Us(0));

    assert!(period.continue_loading(0));
    assert!(!period.continue_loading(0));
    assert_eq!(loaders.loader().submissions(), 1);
    assert_eq!(period.next_load_position_us(), BufferPosition::EndOfSource);

    assert_eq!(loaders.loader().run_next(), RunOutcome::Completed);
    assert!(period.is_loading_finished());
    assert_eq!(period.loaded_sample().map(|s| s.size()), Some(3));
    assert_eq!(period.buffered_position_us(), BufferPosition::EndOfSource);
    assert!(!period.continue_loading(0));
    assert!(stream.is_ready());

    let mut holder = FormatHolder::default();
    let mut buffer = DecoderInputBuffer::new();
    assert_eq!(stream.read_data(&mut holder, &mut buffer), ReadResult::FormatRead);
    assert_eq!(holder.format.as_ref(), Some(&vtt()));

    assert_eq!(stream.read_data(&mut holder, &mut buffer), ReadResult::BufferRead);
    assert_eq!(&buffer.data[..], &[1, 2, 3]);
    assert!(buffer.is_key_frame());
    assert_eq!(buffer.time_us, 0);

    buffer.clear();
    assert_eq!(stream.read_data(&mut holder, &mut buffer), ReadResult::BufferRead);
    assert!(buffer.is_end_of_stream());
    assert!(stream.maybe_throw_error().is_ok());

    period.release_period();
    assert!(loaders.loader().is_released());
    source.release_source();
}

#[test]
fn test_listener_sees_each_failed_attempt() {
    let loaders = ManualLoaderFactory::<SourceLoadable>::new();
    let handler = Arc::new(QueuedEventHandler::new());
    let recorder = Arc::new(ErrorRecorder::default());
    let flaky = FlakyDataSourceFactory::new(&b"WEBVTT"[..], 2);
    let config = SourceConfig {
        event_source_id: 9,
        ..SourceConfig::default()
    };

    let mut source = SingleSampleMediaSource::with_config(uri(), Arc::new(flaky.clone()), vtt(), 1_000, &config)
        .with_event_listener(handler.clone(), recorder.clone())
        .with_loader_factory(Arc::new(loaders.clone()));

    let period = source.create_period(0);
    period.prepare_period(&mut Prepared(false), 0);
    let stream = select_one(period);
    assert!(period.continue_loading(0));

    assert_eq!(loaders.loader().run_until_idle(10), RunOutcome::Completed);
    assert_eq!(flaky.opens(), 3);

    // Nothing reaches the listener until the queue is drained.
    assert!(recorder.events.lock().is_empty());
    assert_eq!(handler.run_pending(), 2);

    let events = recorder.events.lock();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|(id, _)| *id == 9));
    assert!(stream.is_ready());
    assert!(stream.maybe_throw_error().is_ok());
}

#[test]
fn test_thread_loader_reads_local_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"1\n00:00:01,000 --> 00:00:02,000\nHello\n").unwrap();
    let locator = parse_locator(file.path().to_str().unwrap()).unwrap();

    let config = SourceConfig {
        loader: LoaderConfig {
            retry_delay_step_ms: 10,
            max_retry_delay_ms: 50,
        },
        ..SourceConfig::default()
    };
    let format = Format::text(None, "application/x-subrip", None);
    let mut source = SingleSampleMediaSource::with_config(
        locator,
        Arc::new(DefaultDataSourceFactory::default()),
        format,
        2_000_000,
        &config,
    );

    let period = source.create_period(0);
    period.prepare_period(&mut Prepared(false), 0);
    let mut stream = select_one(period);
    assert!(period.continue_loading(0));

    let mut holder = FormatHolder::default();
    let mut buffer = DecoderInputBuffer::new();
    assert_eq!(stream.read_data(&mut holder, &mut buffer), ReadResult::FormatRead);

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match stream.read_data(&mut holder, &mut buffer) {
            ReadResult::BufferRead => break,
            ReadResult::NothingRead => {
                stream.maybe_throw_error().unwrap();
                assert!(Instant::now() < deadline, "load did not finish");
                assert!(!period.continue_loading(0));
                std::thread::sleep(Duration::from_millis(5));
            }
            ReadResult::FormatRead => panic!("format delivered twice"),
        }
    }

    assert_eq!(&buffer.data[..], b"1\n00:00:01,000 --> 00:00:02,000\nHello\n");
    period.release_period();
}

#[test]
fn test_thread_loader_surfaces_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let locator = parse_locator(dir.path().join("missing.srt").to_str().unwrap()).unwrap();

    let config = SourceConfig {
        min_loadable_retry_count: 1,
        loader: LoaderConfig {
            retry_delay_step_ms: 1,
            max_retry_delay_ms: 5,
        },
        ..SourceConfig::default()
    };
    let mut source = SingleSampleMediaSource::with_config(
        locator,
        Arc::new(DefaultDataSourceFactory::default()),
        Format::text(None, "application/x-subrip", None),
        1_000,
        &config,
    );

    let period = source.create_period(0);
    period.prepare_period(&mut Prepared(false), 0);
    let stream = select_one(period);
    assert!(period.continue_loading(0));

    let deadline = Instant::now() + Duration::from_secs(10);
    let error = loop {
        if let Err(error) = stream.maybe_throw_error() {
            break error;
        }
        assert!(Instant::now() < deadline, "error never surfaced");
        std::thread::sleep(Duration::from_millis(2));
    };

    assert!(matches!(
        error.source_error(),
        Some(DataSourceError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound
    ));
    for _ in 0..3 {
        assert!(stream.maybe_throw_error().is_err());
        assert!(!period.continue_loading(0));
    }
    assert!(!stream.is_ready());
    period.release_period();
    assert!(stream.maybe_throw_error().is_ok());
}

#[test]
fn test_thread_loader_gives_up_after_ceiling() {
    let handler = Arc::new(QueuedEventHandler::new());
    let recorder = Arc::new(ErrorRecorder::default());
    let flaky = FlakyDataSourceFactory::new(&b"WEBVTT"[..], u32::MAX);
    let config = SourceConfig {
        min_loadable_retry_count: 2,
        loader: LoaderConfig {
            retry_delay_step_ms: 1,
            max_retry_delay_ms: 5,
        },
        ..SourceConfig::default()
    };
    let mut source = SingleSampleMediaSource::with_config(uri(), Arc::new(flaky.clone()), vtt(), 1_000, &config)
        .with_event_listener(handler.clone(), recorder.clone());

    let period = source.create_period(0);
    period.prepare_period(&mut Prepared(false), 0);
    let stream = select_one(period);
    assert!(period.continue_loading(0));

    let deadline = Instant::now() + Duration::from_secs(10);
    while stream.maybe_throw_error().is_ok() {
        assert!(Instant::now() < deadline, "error never surfaced");
        std::thread::sleep(Duration::from_millis(2));
    }

    // No attempt runs after the third failure, and the error never clears.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(flaky.opens(), 3);
    for _ in 0..3 {
        let error = stream.maybe_throw_error().unwrap_err();
        assert!(matches!(
            error.source_error(),
            Some(DataSourceError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused
        ));
        assert!(!period.continue_loading(0));
    }
    assert_eq!(flaky.opens(), 3);

    assert_eq!(handler.run_pending(), 3);
    assert_eq!(recorder.events.lock().len(), 3);
    period.release_period();
}
