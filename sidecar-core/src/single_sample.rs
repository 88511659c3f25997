//! # Single-Sample Media Source
//!
//! Side-loads one resource (typically an external subtitle file) as a track
//! with exactly one sample. The source is its own single period:
//!
//! ```text
//!  continue_loading ──► Loader ──► SourceLoadable ──► DataSource
//!                          │
//!                  on_load_completed
//!                          ▼
//!                 TrackShared { loading_finished, sample }
//!                          │
//!        ┌─────────────────┼─────────────────┐
//!        ▼                 ▼                 ▼
//!  SingleSampleStream SingleSampleStream   ...      (one per selected slot)
//! ```
//!
//! Only one fetch is ever in flight. Failed attempts are reported to the
//! optional event listener and retried by the loader; once the retry
//! ceiling is passed the failure surfaces through
//! `SampleStream::maybe_throw_error`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use url::Url;

use crate::config::SourceConfig;
use crate::data_source::{DataSourceFactory, DataSpec};
use crate::events::{EventDispatcher, EventHandler, EventListener};
use crate::format::{Format, TrackGroup, TrackGroupArray, TrackSelection};
use crate::loader::{LoadError, Loader, LoaderCallback, LoaderFactory, RetryAction, ThreadLoaderFactory};
use crate::sample_loader::{LoadedSample, SourceLoadable};
use crate::sample_stream::SingleSampleStream;
use crate::source::{MediaPeriod, MediaSource, PeriodCallback, SourceInfoListener};
use crate::timeline::{SinglePeriodTimeline, StartPosition, Timeline};
use crate::BufferPosition;

/// Name given to the loader (and its worker threads)
pub const LOADER_NAME: &str = "Loader:SingleSampleMediaSource";

// ============================================================================
// Shared Track State
// ============================================================================

/// Fetch result as seen by the streams
#[derive(Debug, Default)]
pub(crate) struct SampleState {
    /// Set once the fetch completes; the sample is readable iff this is true
    pub loading_finished: bool,
    pub sample: Option<LoadedSample>,
    /// Bumped on teardown so late callbacks from a released loader are dropped
    pub generation: u64,
}

/// State shared between the period, its streams and the load callback
pub(crate) struct TrackShared {
    pub format: Format,
    pub state: RwLock<SampleState>,
    pub loader: Mutex<Option<Box<dyn Loader<SourceLoadable>>>>,
}

impl TrackShared {
    pub(crate) fn new(format: Format) -> Self {
        Self {
            format,
            state: RwLock::new(SampleState::default()),
            loader: Mutex::new(None),
        }
    }
}

/// Load callback bound to one generation of the track
struct LoadTarget {
    track: Weak<TrackShared>,
    generation: u64,
    events: EventDispatcher,
}

impl LoadTarget {
    fn is_current(&self, track: &TrackShared) -> bool {
        track.state.read().generation == self.generation
    }
}

impl LoaderCallback<SourceLoadable> for LoadTarget {
    fn on_load_completed(&self, loadable: SourceLoadable, load_duration: Duration) {
        let Some(track) = self.track.upgrade() else {
            return;
        };
        let mut state = track.state.write();
        if state.generation != self.generation {
            tracing::debug!("dropping load result from a released period");
            return;
        }

        let uri = loadable.spec().uri.clone();
        let sample = loadable.into_sample();
        tracing::info!("loaded {} bytes from {} in {:?}", sample.size(), uri, load_duration);

        // Bytes first, then the flag that makes them readable.
        state.sample = Some(sample);
        state.loading_finished = true;
    }

    fn on_load_canceled(&self, _loadable: SourceLoadable, _load_duration: Duration, released: bool) {
        tracing::debug!("load canceled (released={})", released);
    }

    fn on_load_error(&self, loadable: &SourceLoadable, _load_duration: Duration, error: &LoadError) -> RetryAction {
        match self.track.upgrade() {
            Some(track) if self.is_current(&track) => {
                tracing::debug!("load of {} failed, retrying", loadable.spec().uri);
                self.events.load_error(error);
                RetryAction::Retry
            }
            _ => RetryAction::DontRetry,
        }
    }
}

// ============================================================================
// Single-Sample Media Source
// ============================================================================

/// Exposes the resource at one locator as a single track with a single sample
pub struct SingleSampleMediaSource {
    uri: Url,
    data_source_factory: Arc<dyn DataSourceFactory>,
    duration_us: i64,
    min_loadable_retry_count: u32,
    tracks: TrackGroupArray,
    events: EventDispatcher,
    loader_factory: Arc<dyn LoaderFactory<SourceLoadable>>,
    track: Arc<TrackShared>,
    sample_streams: Vec<SingleSampleStream>,
}

impl SingleSampleMediaSource {
    /// Source with the default configuration
    pub fn new(uri: Url, data_source_factory: Arc<dyn DataSourceFactory>, format: Format, duration_us: i64) -> Self {
        Self::with_config(uri, data_source_factory, format, duration_us, &SourceConfig::default())
    }

    pub fn with_config(
        uri: Url,
        data_source_factory: Arc<dyn DataSourceFactory>,
        format: Format,
        duration_us: i64,
        config: &SourceConfig,
    ) -> Self {
        Self {
            uri,
            data_source_factory,
            duration_us,
            min_loadable_retry_count: config.min_loadable_retry_count,
            tracks: TrackGroupArray::new(vec![TrackGroup::single(format.clone())]),
            events: EventDispatcher::silent(config.event_source_id),
            loader_factory: Arc::new(ThreadLoaderFactory::new(config.loader.clone())),
            track: Arc::new(TrackShared::new(format)),
            sample_streams: Vec::new(),
        }
    }

    /// Report load errors to `listener` through `handler`
    pub fn with_event_listener(mut self, handler: Arc<dyn EventHandler>, listener: Arc<dyn EventListener>) -> Self {
        self.events = EventDispatcher::new(handler, listener, self.events.source_id());
        self
    }

    /// Replace the loader used by subsequent `prepare_period` calls
    pub fn with_loader_factory(mut self, loader_factory: Arc<dyn LoaderFactory<SourceLoadable>>) -> Self {
        self.loader_factory = loader_factory;
        self
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn format(&self) -> &Format {
        &self.track.format
    }

    pub fn is_loading_finished(&self) -> bool {
        self.track.state.read().loading_finished
    }

    /// Copy of the fetched sample, once loading has finished
    pub fn loaded_sample(&self) -> Option<LoadedSample> {
        let state = self.track.state.read();
        if state.loading_finished {
            state.sample.clone()
        } else {
            None
        }
    }

    pub fn active_stream_count(&self) -> usize {
        self.sample_streams.len()
    }

    fn is_loading(&self) -> bool {
        self.track
            .loader
            .lock()
            .as_ref()
            .is_some_and(|loader| loader.is_loading())
    }
}

impl MediaSource for SingleSampleMediaSource {
    type Period = Self;

    fn prepare_source(&mut self, listener: &mut dyn SourceInfoListener) {
        let timeline = SinglePeriodTimeline::seekable_final(self.duration_us);
        listener.on_source_info_refreshed(&timeline);
    }

    fn new_playing_period_index(&self, old_playing_period_index: usize, _old_timeline: &dyn Timeline) -> usize {
        old_playing_period_index
    }

    fn default_start_position(&self, _index: usize) -> StartPosition {
        StartPosition::DEFAULT
    }

    fn create_period(&mut self, index: usize) -> &mut Self {
        assert_eq!(index, 0, "single-sample source has exactly one period");
        self
    }

    fn release_source(&mut self) {
        // Nothing held at source level.
    }
}

impl MediaPeriod for SingleSampleMediaSource {
    type Stream = SingleSampleStream;

    fn prepare_period(&mut self, callback: &mut dyn PeriodCallback, _position_us: i64) {
        let loader = self.loader_factory.create_loader(LOADER_NAME);
        *self.track.loader.lock() = Some(loader);
        tracing::debug!("period prepared for {}", self.uri);
        callback.on_period_prepared();
    }

    fn maybe_throw_prepare_error(&self) -> Result<(), LoadError> {
        Ok(())
    }

    fn duration_us(&self) -> i64 {
        self.duration_us
    }

    fn track_groups(&self) -> &TrackGroupArray {
        &self.tracks
    }

    fn select_tracks(
        &mut self,
        selections: &[Option<TrackSelection>],
        may_retain_stream_flags: &[bool],
        streams: &mut [Option<SingleSampleStream>],
        stream_reset_flags: &mut [bool],
        position_us: i64,
    ) -> i64 {
        assert_eq!(selections.len(), streams.len(), "selection/stream slot mismatch");
        assert_eq!(selections.len(), may_retain_stream_flags.len(), "selection/retain slot mismatch");
        assert_eq!(selections.len(), stream_reset_flags.len(), "selection/reset slot mismatch");

        for i in 0..selections.len() {
            let drop_stream =
                streams[i].is_some() && (selections[i].is_none() || !may_retain_stream_flags[i]);
            if drop_stream {
                if let Some(stream) = streams[i].take() {
                    self.sample_streams.retain(|active| !active.same_stream(&stream));
                }
            }
            if streams[i].is_none() && selections[i].is_some() {
                let stream = SingleSampleStream::new(self.track.clone());
                self.sample_streams.push(stream.clone());
                streams[i] = Some(stream);
                stream_reset_flags[i] = true;
            }
        }

        tracing::debug!("track selection: {} active stream(s)", self.sample_streams.len());
        position_us
    }

    fn continue_loading(&mut self, _position_us: i64) -> bool {
        let mut guard = self.track.loader.lock();
        let Some(loader) = guard.as_mut() else {
            panic!("continue_loading called before prepare_period");
        };

        // In-flight before finished: the loader clears in-flight only after
        // the completion callback has set the flag.
        if loader.is_loading() {
            return false;
        }
        // Retries exhausted: the failure stays surfaced until release.
        if loader.maybe_throw_error().is_err() {
            return false;
        }
        let generation = {
            let state = self.track.state.read();
            if state.loading_finished {
                return false;
            }
            state.generation
        };

        let loadable = SourceLoadable::new(
            DataSpec::new(self.uri.clone()),
            self.data_source_factory.create_data_source(),
        );
        let callback = Arc::new(LoadTarget {
            track: Arc::downgrade(&self.track),
            generation,
            events: self.events.clone(),
        });
        loader.start_loading(loadable, callback, self.min_loadable_retry_count);
        tracing::debug!("started loading {}", self.uri);
        true
    }

    fn read_discontinuity(&mut self) -> Option<i64> {
        None
    }

    fn next_load_position_us(&self) -> BufferPosition {
        if self.is_loading() || self.is_loading_finished() {
            BufferPosition::EndOfSource
        } else {
            BufferPosition::Us(0)
        }
    }

    fn buffered_position_us(&self) -> BufferPosition {
        if self.is_loading_finished() {
            BufferPosition::EndOfSource
        } else {
            BufferPosition::Us(0)
        }
    }

    fn seek_to_us(&mut self, position_us: i64) -> i64 {
        for stream in &self.sample_streams {
            stream.seek_to_us(position_us);
        }
        position_us
    }

    fn release_period(&mut self) {
        {
            let mut state = self.track.state.write();
            state.generation += 1;
            state.loading_finished = false;
            state.sample = None;
        }

        let loader = self.track.loader.lock().take();
        if let Some(mut loader) = loader {
            loader.release();
        }
        self.sample_streams.clear();
        tracing::debug!("period released for {}", self.uri);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use crate::buffer::{DecoderInputBuffer, FormatHolder, ReadResult};
    use crate::data_source::{ByteArrayDataSource, ByteArrayDataSourceFactory, DataSourceError};
    use crate::sample_stream::StreamState;
    use crate::source::SampleStream;
    use crate::loader::Loadable;
    use crate::testing::{FlakyDataSourceFactory, ManualLoaderFactory, RunOutcome};

    struct Prepared(bool);

    impl PeriodCallback for Prepared {
        fn on_period_prepared(&mut self) {
            self.0 = true;
        }
    }

    fn source_with(bytes: Vec<u8>) -> (SingleSampleMediaSource, ManualLoaderFactory<SourceLoadable>) {
        let factory = Arc::new(ByteArrayDataSourceFactory::new(ByteArrayDataSource::new(bytes)));
        let loaders = ManualLoaderFactory::new();
        let mut source = SingleSampleMediaSource::new(
            Url::parse("https://example.com/subs/en.srt").unwrap(),
            factory,
            Format::text(Some("en"), "application/x-subrip", Some("en")),
            5_000_000,
        )
        .with_loader_factory(Arc::new(loaders.clone()));

        let mut prepared = Prepared(false);
        source.prepare_period(&mut prepared, 0);
        assert!(prepared.0);
        (source, loaders)
    }

    fn selection(source: &SingleSampleMediaSource) -> Option<TrackSelection> {
        Some(TrackSelection::fixed(source.track_groups().get(0).clone(), 0))
    }

    fn read(stream: &mut SingleSampleStream) -> (ReadResult, FormatHolder, DecoderInputBuffer) {
        let mut holder = FormatHolder::default();
        let mut buffer = DecoderInputBuffer::new();
        let result = stream.read_data(&mut holder, &mut buffer);
        (result, holder, buffer)
    }

    #[test]
    fn test_at_most_one_fetch() {
        let (mut source, loaders) = source_with(vec![1, 2, 3]);

        assert_eq!(source.next_load_position_us(), BufferPosition::Us(0));
        assert!(source.continue_loading(0));
        assert!(!source.continue_loading(0));
        assert_eq!(loaders.loader().submissions(), 1);
        assert_eq!(source.next_load_position_us(), BufferPosition::EndOfSource);
        assert_eq!(source.buffered_position_us(), BufferPosition::Us(0));

        assert_eq!(loaders.loader().run_next(), RunOutcome::Completed);
        assert!(source.is_loading_finished());
        assert!(!source.continue_loading(0));
        assert_eq!(loaders.loader().submissions(), 1);
        assert_eq!(source.buffered_position_us(), BufferPosition::EndOfSource);
        assert_eq!(source.loaded_sample().unwrap().bytes(), &[1, 2, 3]);
    }

    #[test]
    fn test_read_protocol_order() {
        let (mut source, loaders) = source_with(vec![9, 8, 7, 6]);
        let mut streams = vec![None];
        let mut reset = vec![false];
        source.select_tracks(&[selection(&source)], &[true], &mut streams, &mut reset, 0);
        let mut stream = streams[0].clone().unwrap();

        let (result, holder, _) = read(&mut stream);
        assert_eq!(result, ReadResult::FormatRead);
        assert_eq!(holder.format.as_ref(), Some(source.format()));
        assert!(!stream.is_ready());

        source.continue_loading(0);
        for _ in 0..3 {
            assert_eq!(read(&mut stream).0, ReadResult::NothingRead);
        }

        loaders.loader().run_next();
        assert!(stream.is_ready());

        let (result, _, buffer) = read(&mut stream);
        assert_eq!(result, ReadResult::BufferRead);
        assert_eq!(&buffer.data[..], &[9, 8, 7, 6]);
        assert_eq!(buffer.time_us, 0);
        assert!(buffer.is_key_frame());
        assert!(!buffer.is_end_of_stream());

        for _ in 0..2 {
            let (result, _, buffer) = read(&mut stream);
            assert_eq!(result, ReadResult::BufferRead);
            assert!(buffer.is_end_of_stream());
            assert!(buffer.data.is_empty());
        }
    }

    #[test]
    fn test_seek_replays_sample_only_after_eos() {
        let (mut source, loaders) = source_with(vec![5]);
        let mut streams = vec![None];
        let mut reset = vec![false];
        source.select_tracks(&[selection(&source)], &[true], &mut streams, &mut reset, 0);
        let mut stream = streams[0].clone().unwrap();

        // Seeking before the format is read changes nothing.
        assert_eq!(source.seek_to_us(1_000), 1_000);
        assert_eq!(stream.state(), StreamState::AwaitingFormat);
        assert_eq!(read(&mut stream).0, ReadResult::FormatRead);

        source.seek_to_us(2_000);
        assert_eq!(stream.state(), StreamState::AwaitingSample);

        source.continue_loading(0);
        loaders.loader().run_next();
        assert!(read(&mut stream).2.is_key_frame());
        assert!(read(&mut stream).2.is_end_of_stream());

        source.seek_to_us(3_000_000);
        assert_eq!(stream.state(), StreamState::AwaitingSample);
        let (result, _, buffer) = read(&mut stream);
        assert_eq!(result, ReadResult::BufferRead);
        assert_eq!(&buffer.data[..], &[5]);
        assert!(read(&mut stream).2.is_end_of_stream());
    }

    #[test]
    fn test_reconciliation_drops_unretainable_stream() {
        let (mut source, _loaders) = source_with(vec![1]);
        let mut streams = vec![None, None];
        let mut reset = vec![false, false];

        source.select_tracks(&[selection(&source), None], &[true, true], &mut streams, &mut reset, 0);
        assert_eq!(reset, vec![true, false]);
        assert!(streams[1].is_none());
        assert_eq!(source.active_stream_count(), 1);
        let first = streams[0].clone().unwrap();

        // Retainable and still selected: kept as is.
        let mut reset = vec![false, false];
        source.select_tracks(&[selection(&source), None], &[true, true], &mut streams, &mut reset, 0);
        assert!(streams[0].as_ref().unwrap().same_stream(&first));
        assert_eq!(reset, vec![false, false]);

        // Not retainable: destroyed and replaced by a fresh, reset stream.
        let mut reset = vec![false, false];
        let position =
            source.select_tracks(&[selection(&source), None], &[false, true], &mut streams, &mut reset, 42);
        assert_eq!(position, 42);
        let second = streams[0].clone().unwrap();
        assert!(!second.same_stream(&first));
        assert_eq!(second.state(), StreamState::AwaitingFormat);
        assert_eq!(reset, vec![true, false]);
        assert_eq!(source.active_stream_count(), 1);

        // Selection removed: slot cleared.
        let mut reset = vec![false, false];
        source.select_tracks(&[None, None], &[true, true], &mut streams, &mut reset, 0);
        assert!(streams[0].is_none());
        assert_eq!(source.active_stream_count(), 0);
    }

    #[test]
    fn test_release_discards_results() {
        let (mut source, loaders) = source_with(vec![1, 2]);
        let mut streams = vec![None];
        let mut reset = vec![false];
        source.select_tracks(&[selection(&source)], &[true], &mut streams, &mut reset, 0);

        source.continue_loading(0);
        loaders.loader().run_next();
        assert!(source.is_loading_finished());

        source.release_period();
        assert!(!source.is_loading_finished());
        assert!(source.loaded_sample().is_none());
        assert_eq!(source.active_stream_count(), 0);
        assert!(loaders.loader().is_released());

        // A fresh period starts over with a new loader.
        let mut prepared = Prepared(false);
        source.prepare_period(&mut prepared, 0);
        assert!(source.continue_loading(0));
        assert_eq!(loaders.created(), 2);
        assert_eq!(loaders.loader().run_next(), RunOutcome::Completed);
        assert_eq!(source.loaded_sample().unwrap().bytes(), &[1, 2]);
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let (mut source, loaders) = source_with(vec![1, 2]);
        source.continue_loading(0);
        let stale = LoadTarget {
            track: Arc::downgrade(&source.track),
            generation: 0,
            events: EventDispatcher::silent(0),
        };

        source.release_period();
        assert!(!loaders.loader().has_pending());

        let mut loadable = SourceLoadable::new(
            DataSpec::new(source.uri().clone()),
            Box::new(ByteArrayDataSource::new(vec![7u8])),
        );
        loadable.load().unwrap();
        stale.on_load_completed(loadable, Duration::ZERO);

        assert!(!source.is_loading_finished());
        assert!(source.loaded_sample().is_none());
    }

    fn flaky_source(
        failures: u32,
    ) -> (SingleSampleMediaSource, ManualLoaderFactory<SourceLoadable>, FlakyDataSourceFactory) {
        let factory = FlakyDataSourceFactory::new(vec![4u8, 2], failures);
        let loaders = ManualLoaderFactory::new();
        let mut source = SingleSampleMediaSource::new(
            Url::parse("https://example.com/subs/en.srt").unwrap(),
            Arc::new(factory.clone()),
            Format::text(None, "application/x-subrip", None),
            1_000_000,
        )
        .with_loader_factory(Arc::new(loaders.clone()));
        source.prepare_period(&mut Prepared(false), 0);
        (source, loaders, factory)
    }

    fn is_connection_refused(error: &LoadError) -> bool {
        matches!(
            error.source_error(),
            Some(DataSourceError::Io(e)) if e.kind() == io::ErrorKind::ConnectionRefused
        )
    }

    #[test]
    fn test_errors_retry_below_ceiling() {
        let (mut source, loaders, factory) = flaky_source(3);
        let mut streams = vec![None];
        let mut reset = vec![false];
        source.select_tracks(&[selection(&source)], &[true], &mut streams, &mut reset, 0);
        let stream = streams[0].clone().unwrap();

        assert!(source.continue_loading(0));
        let loader = loaders.loader();

        // Default minimum retry count is 3: three failures are retried.
        for attempt in 1..=3 {
            assert_eq!(loader.run_next(), RunOutcome::Failed(RetryAction::Retry));
            assert!(stream.maybe_throw_error().is_ok(), "attempt {}", attempt);
            assert!(!source.continue_loading(0));
        }
        assert_eq!(loader.run_next(), RunOutcome::Completed);
        assert_eq!(factory.opens(), 4);
        assert!(stream.maybe_throw_error().is_ok());
        assert!(stream.is_ready());
    }

    #[test]
    fn test_error_past_ceiling_is_sticky() {
        let (mut source, loaders, factory) = flaky_source(u32::MAX);
        let mut streams = vec![None];
        let mut reset = vec![false];
        source.select_tracks(&[selection(&source)], &[true], &mut streams, &mut reset, 0);
        let stream = streams[0].clone().unwrap();

        assert!(source.continue_loading(0));
        let loader = loaders.loader();
        assert_eq!(loader.run_until_idle(50), RunOutcome::Failed(RetryAction::Retry));

        // The fourth failure crosses the ceiling and nothing runs after it.
        assert_eq!(factory.opens(), 4);
        assert_eq!(loader.error_count(), 4);
        assert!(!loader.has_pending());
        assert_eq!(loader.run_next(), RunOutcome::Idle);

        for _ in 0..5 {
            let error = stream.maybe_throw_error().unwrap_err();
            assert!(is_connection_refused(&error));
            assert!(!source.continue_loading(0));
        }
        assert_eq!(loaders.loader().submissions(), 1);
        assert_eq!(factory.opens(), 4);
        assert!(!stream.is_ready());
        assert_eq!(source.next_load_position_us(), BufferPosition::Us(0));

        source.release_period();
        assert!(stream.maybe_throw_error().is_ok());
    }

    #[test]
    #[should_panic]
    fn test_create_period_rejects_nonzero_index() {
        let (mut source, _loaders) = source_with(vec![]);
        source.create_period(1);
    }

    #[test]
    #[should_panic]
    fn test_continue_loading_requires_prepare() {
        let factory = Arc::new(ByteArrayDataSourceFactory::new(ByteArrayDataSource::new(vec![1u8])));
        let mut source = SingleSampleMediaSource::new(
            Url::parse("memory:///a").unwrap(),
            factory,
            Format::text(None, "text/vtt", None),
            1,
        );
        source.continue_loading(0);
    }
}
