//! Track Descriptors
//!
//! Immutable format metadata for the side-loaded track, plus the track group
//! and selection types the pipeline uses to pick it.

use serde::{Deserialize, Serialize};

// ============================================================================
// Format
// ============================================================================

bitflags::bitflags! {
    /// How the pipeline may pick a track without user input
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SelectionFlags: u32 {
        /// Selected by default
        const DEFAULT = 0x1;
        /// Must be shown (forced subtitles)
        const FORCED = 0x2;
        const AUTOSELECT = 0x4;
    }
}

impl Default for SelectionFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Format metadata for a single track
///
/// Created once when the source is constructed and shared read-only with
/// every sample stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    /// Track identifier, if known
    pub id: Option<String>,
    /// MIME type of the samples ("application/x-subrip", "text/vtt", ...)
    pub sample_mime_type: String,
    /// Codec string, if any
    #[serde(default)]
    pub codecs: Option<String>,
    /// Average bitrate (bits/sec), if known
    #[serde(default)]
    pub bitrate: Option<u32>,
    /// ISO 639 language code
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub selection_flags: SelectionFlags,
    /// Offset applied to subsample timestamps (microseconds)
    #[serde(default)]
    pub subsample_offset_us: i64,
}

impl Format {
    /// Format for a text track (subtitles, captions)
    pub fn text(id: Option<&str>, sample_mime_type: &str, language: Option<&str>) -> Self {
        Self {
            id: id.map(str::to_string),
            sample_mime_type: sample_mime_type.to_string(),
            codecs: None,
            bitrate: None,
            language: language.map(str::to_string),
            selection_flags: SelectionFlags::empty(),
            subsample_offset_us: 0,
        }
    }

    pub fn with_selection_flags(mut self, flags: SelectionFlags) -> Self {
        self.selection_flags = flags;
        self
    }

    pub fn with_codecs(mut self, codecs: &str) -> Self {
        self.codecs = Some(codecs.to_string());
        self
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    pub fn with_subsample_offset_us(mut self, offset_us: i64) -> Self {
        self.subsample_offset_us = offset_us;
        self
    }

    pub fn is_default(&self) -> bool {
        self.selection_flags.contains(SelectionFlags::DEFAULT)
    }

    pub fn is_forced(&self) -> bool {
        self.selection_flags.contains(SelectionFlags::FORCED)
    }

    /// Guess a text MIME type from a file extension
    pub fn mime_type_for_extension(ext: &str) -> Option<&'static str> {
        match ext.to_ascii_lowercase().as_str() {
            "srt" => Some("application/x-subrip"),
            "vtt" | "webvtt" => Some("text/vtt"),
            "ass" | "ssa" => Some("text/x-ssa"),
            "ttml" | "dfxp" | "xml" => Some("application/ttml+xml"),
            _ => None,
        }
    }
}

// ============================================================================
// Track Groups
// ============================================================================

/// A group of tracks that are alternatives of each other
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackGroup {
    formats: Vec<Format>,
}

impl TrackGroup {
    /// Create a group. Panics if `formats` is empty.
    pub fn new(formats: Vec<Format>) -> Self {
        assert!(!formats.is_empty(), "track group must contain at least one format");
        Self { formats }
    }

    pub fn single(format: Format) -> Self {
        Self { formats: vec![format] }
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    pub fn format(&self, index: usize) -> &Format {
        &self.formats[index]
    }

    pub fn index_of(&self, format: &Format) -> Option<usize> {
        self.formats.iter().position(|f| f == format)
    }
}

/// All track groups exposed by a period
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrackGroupArray {
    groups: Vec<TrackGroup>,
}

impl TrackGroupArray {
    pub fn new(groups: Vec<TrackGroup>) -> Self {
        Self { groups }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, index: usize) -> &TrackGroup {
        &self.groups[index]
    }

    pub fn index_of(&self, group: &TrackGroup) -> Option<usize> {
        self.groups.iter().position(|g| g == group)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackGroup> {
        self.groups.iter()
    }
}

// ============================================================================
// Track Selection
// ============================================================================

/// Tracks chosen from one group by the pipeline's selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSelection {
    group: TrackGroup,
    tracks: Vec<usize>,
}

impl TrackSelection {
    /// Select specific tracks of a group. Panics on an empty or out-of-range list.
    pub fn new(group: TrackGroup, tracks: Vec<usize>) -> Self {
        assert!(!tracks.is_empty(), "selection must contain at least one track");
        assert!(
            tracks.iter().all(|&t| t < group.len()),
            "selected track index out of range"
        );
        Self { group, tracks }
    }

    /// Select a single track
    pub fn fixed(group: TrackGroup, track: usize) -> Self {
        Self::new(group, vec![track])
    }

    pub fn group(&self) -> &TrackGroup {
        &self.group
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn format(&self, index: usize) -> &Format {
        self.group.format(self.tracks[index])
    }

    pub fn selected_format(&self) -> &Format {
        self.format(0)
    }
}
