//! Decoder-side buffers filled by sample streams.

use bytes::BytesMut;

use crate::format::Format;

// ============================================================================
// Buffer Flags
// ============================================================================

bitflags::bitflags! {
    /// Flags attached to a sample buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        /// Sample is a random-access point
        const KEY_FRAME = 0x1;
        /// Sample should be decoded but not rendered
        const DECODE_ONLY = 0x2;
        /// No more samples follow
        const END_OF_STREAM = 0x4;
    }
}

impl Default for BufferFlags {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// Read Results
// ============================================================================

/// Outcome of `SampleStream::read_data`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    /// Nothing available yet
    NothingRead,
    /// The format holder was populated
    FormatRead,
    /// The input buffer was populated (sample or end of stream)
    BufferRead,
}

/// Receives the track format on a format read
#[derive(Debug, Clone, Default)]
pub struct FormatHolder {
    pub format: Option<Format>,
}

// ============================================================================
// Decoder Input Buffer
// ============================================================================

/// Buffer a sample stream writes one sample into
#[derive(Debug, Default)]
pub struct DecoderInputBuffer {
    /// Sample payload
    pub data: BytesMut,
    /// Presentation timestamp (microseconds)
    pub time_us: i64,
    flags: BufferFlags,
}

impl DecoderInputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            time_us: 0,
            flags: BufferFlags::empty(),
        }
    }

    /// Make sure at least `length` more bytes can be written without reallocating
    pub fn ensure_space_for_write(&mut self, length: usize) {
        self.data.reserve(length);
    }

    pub fn add_flag(&mut self, flag: BufferFlags) {
        self.flags.insert(flag);
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags.contains(BufferFlags::KEY_FRAME)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(BufferFlags::END_OF_STREAM)
    }

    /// Reset for reuse (keeps allocation)
    pub fn clear(&mut self) {
        self.data.clear();
        self.time_us = 0;
        self.flags = BufferFlags::empty();
    }
}
