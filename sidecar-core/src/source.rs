//! # Pipeline Contracts
//!
//! The three capabilities a track provider offers the playback pipeline:
//!
//! 1. **MediaSource** - produces a timeline and hands out periods
//! 2. **MediaPeriod** - exposes track groups, accepts selections, loads media
//! 3. **SampleStream** - one per selected track, pulled by the renderer
//!
//! All calls arrive on the playback-control thread. Nothing here blocks:
//! loads run elsewhere and reads return `ReadResult::NothingRead` when data
//! is not there yet.

use crate::buffer::{DecoderInputBuffer, FormatHolder, ReadResult};
use crate::format::{TrackGroupArray, TrackSelection};
use crate::loader::LoadError;
use crate::timeline::{StartPosition, Timeline};
use crate::BufferPosition;

/// Receives timelines as a source learns about its structure
pub trait SourceInfoListener {
    fn on_source_info_refreshed(&mut self, timeline: &dyn Timeline);
}

/// Notified when a period has finished preparing
pub trait PeriodCallback {
    fn on_period_prepared(&mut self);
}

/// Source capability
pub trait MediaSource {
    type Period: MediaPeriod;

    /// Start preparing; the timeline is delivered to `listener`
    fn prepare_source(&mut self, listener: &mut dyn SourceInfoListener);

    /// Index of the playing period after a timeline change
    fn new_playing_period_index(&self, old_playing_period_index: usize, old_timeline: &dyn Timeline) -> usize;

    fn default_start_position(&self, index: usize) -> StartPosition;

    /// Period for `index` in the current timeline
    fn create_period(&mut self, index: usize) -> &mut Self::Period;

    fn release_source(&mut self);
}

/// Period capability
pub trait MediaPeriod {
    type Stream: SampleStream;

    fn prepare_period(&mut self, callback: &mut dyn PeriodCallback, position_us: i64);

    fn maybe_throw_prepare_error(&self) -> Result<(), LoadError>;

    fn duration_us(&self) -> i64;

    fn track_groups(&self) -> &TrackGroupArray;

    /// Reconcile `selections` against `streams` slot by slot
    ///
    /// All four slices are indexed by renderer slot and must have the same
    /// length. Returns the position actually used.
    fn select_tracks(
        &mut self,
        selections: &[Option<TrackSelection>],
        may_retain_stream_flags: &[bool],
        streams: &mut [Option<Self::Stream>],
        stream_reset_flags: &mut [bool],
        position_us: i64,
    ) -> i64;

    /// Ask the period to load more. Returns whether a load was started.
    fn continue_loading(&mut self, position_us: i64) -> bool;

    /// Position to jump to after a discontinuity, if any
    fn read_discontinuity(&mut self) -> Option<i64>;

    fn next_load_position_us(&self) -> BufferPosition;

    fn buffered_position_us(&self) -> BufferPosition;

    /// Returns the position actually seeked to
    fn seek_to_us(&mut self, position_us: i64) -> i64;

    fn release_period(&mut self);
}

/// Sample stream capability
pub trait SampleStream {
    /// Whether data is available to be read
    fn is_ready(&self) -> bool;

    /// Surface a load error that has stopped the stream from making progress
    fn maybe_throw_error(&self) -> Result<(), LoadError>;

    fn read_data(&mut self, format_holder: &mut FormatHolder, buffer: &mut DecoderInputBuffer) -> ReadResult;

    fn skip_to_keyframe_before(&mut self, time_us: i64);
}
