//! # Sidecar Core
//!
//! Side-loads a single remote resource (an external subtitle file, a
//! thumbnail sheet, any auxiliary blob) as exactly one track with exactly
//! one sample inside a pull-based playback pipeline.

// ============================================================================
// Pipeline Contracts
// ============================================================================
pub mod source;
pub mod timeline;
pub mod format;
pub mod buffer;

// ============================================================================
// Loading
// ============================================================================
pub mod data_source;
pub mod loader;
pub mod sample_loader;
pub mod events;
pub mod config;

// ============================================================================
// Single-Sample Track
// ============================================================================
pub mod sample_stream;
pub mod single_sample;

// ============================================================================
// Test Doubles
// ============================================================================
pub mod testing;

pub use config::SourceConfig;
pub use single_sample::SingleSampleMediaSource;

// ============================================================================
// Positions
// ============================================================================

/// Sentinel for "no time" (e.g. default start position)
pub const TIME_UNSET: i64 = i64::MIN + 1;

/// How far a period has buffered or wants to load next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPosition {
    /// Everything up to the end of the source is available (or in flight)
    EndOfSource,
    /// Position in microseconds
    Us(i64),
}

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
