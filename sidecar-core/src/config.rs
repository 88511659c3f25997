//! Source configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::loader::LoaderConfig;

/// Default minimum number of retries before a load error is surfaced
pub const DEFAULT_MIN_LOADABLE_RETRY_COUNT: u32 = 3;

/// Settings for a `SingleSampleMediaSource`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Failed attempts tolerated before `maybe_throw_error` reports the failure
    pub min_loadable_retry_count: u32,
    /// Id passed to the event listener with every event
    pub event_source_id: i32,
    /// Retry timing for the background loader
    pub loader: LoaderConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            min_loadable_retry_count: DEFAULT_MIN_LOADABLE_RETRY_COUNT,
            event_source_id: 0,
            loader: LoaderConfig::default(),
        }
    }
}

impl SourceConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        serde_json::from_str(&text).map_err(|e| format!("Invalid config {}: {}", path.display(), e))
    }
}
