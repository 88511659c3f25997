//! Per-selection read state machine.
//!
//! Each selected track slot gets its own `SingleSampleStream`. The stream
//! walks a three-phase pull protocol over the single fetched sample:
//!
//! ```text
//!   AwaitingFormat ──read──► AwaitingSample ──read (loaded)──► EndOfStream
//!                               ▲    │ read (not loaded):           │ read: EOS
//!                               │    └── NothingRead                │
//!                               └────────────── seek ───────────────┘
//! ```
//!
//! The format is delivered exactly once; seeking only replays the sample.
//!
//! The fetched bytes are written once by the load callback, before
//! `loading_finished` is set, and never touched again until teardown. Reads
//! only look at the bytes after observing the flag, so readers never see a
//! buffer mid-resize. Reads still copy the bytes out into the decoder's
//! buffer; the shared sample is never lent to the renderer.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{BufferFlags, DecoderInputBuffer, FormatHolder, ReadResult};
use crate::loader::LoadError;
use crate::single_sample::TrackShared;
use crate::source::SampleStream;

/// Read phase of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    AwaitingFormat,
    AwaitingSample,
    EndOfStream,
}

/// Sample stream over the track's single sample
///
/// Cloning yields another handle to the same stream; the period keeps one
/// handle to forward seeks while the pipeline reads through the other.
#[derive(Clone)]
pub struct SingleSampleStream {
    state: Arc<Mutex<StreamState>>,
    track: Arc<TrackShared>,
}

impl SingleSampleStream {
    pub(crate) fn new(track: Arc<TrackShared>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StreamState::AwaitingFormat)),
            track,
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    /// Whether both handles refer to the same stream
    pub fn same_stream(&self, other: &SingleSampleStream) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Replay the sample after end of stream; no-op in earlier phases
    pub(crate) fn seek_to_us(&self, position_us: i64) {
        let mut state = self.state.lock();
        if *state == StreamState::EndOfStream {
            tracing::trace!("stream rewound by seek to {}us", position_us);
            *state = StreamState::AwaitingSample;
        }
    }
}

impl SampleStream for SingleSampleStream {
    fn is_ready(&self) -> bool {
        self.track.state.read().loading_finished
    }

    fn maybe_throw_error(&self) -> Result<(), LoadError> {
        match self.track.loader.lock().as_ref() {
            Some(loader) => loader.maybe_throw_error(),
            None => Ok(()),
        }
    }

    fn read_data(&mut self, format_holder: &mut FormatHolder, buffer: &mut DecoderInputBuffer) -> ReadResult {
        let mut state = self.state.lock();
        match *state {
            StreamState::EndOfStream => {
                buffer.add_flag(BufferFlags::END_OF_STREAM);
                ReadResult::BufferRead
            }
            StreamState::AwaitingFormat => {
                format_holder.format = Some(self.track.format.clone());
                *state = StreamState::AwaitingSample;
                ReadResult::FormatRead
            }
            StreamState::AwaitingSample => {
                let sample = self.track.state.read();
                let bytes = match (sample.loading_finished, sample.sample.as_ref()) {
                    (true, Some(loaded)) => loaded.bytes(),
                    _ => return ReadResult::NothingRead,
                };

                buffer.time_us = 0;
                buffer.add_flag(BufferFlags::KEY_FRAME);
                buffer.ensure_space_for_write(bytes.len());
                buffer.data.extend_from_slice(bytes);
                *state = StreamState::EndOfStream;
                ReadResult::BufferRead
            }
        }
    }

    fn skip_to_keyframe_before(&mut self, _time_us: i64) {
        // The only sample is the only keyframe.
    }
}
