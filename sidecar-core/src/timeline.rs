//! Single-period timeline for sources that expose one fixed-duration period.

use crate::TIME_UNSET;

/// Read-only view of the windows and periods a source exposes
pub trait Timeline {
    fn window_count(&self) -> usize;

    fn period_count(&self) -> usize;

    fn window(&self, index: usize) -> Window;

    fn period(&self, index: usize) -> Period;

    fn is_empty(&self) -> bool {
        self.window_count() == 0
    }
}

/// A window of the timeline the pipeline can play
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub duration_us: i64,
    pub default_position_us: i64,
    pub is_seekable: bool,
    pub is_dynamic: bool,
    pub first_period_index: usize,
    pub last_period_index: usize,
}

/// A period within the timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub duration_us: i64,
    pub window_index: usize,
    pub position_in_window_us: i64,
}

/// Timeline with exactly one window containing exactly one period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinglePeriodTimeline {
    window: Window,
    period: Period,
}

impl SinglePeriodTimeline {
    /// Seekable, non-dynamic timeline whose period and window both last `duration_us`
    pub fn seekable_final(duration_us: i64) -> Self {
        Self {
            window: Window {
                duration_us,
                default_position_us: 0,
                is_seekable: true,
                is_dynamic: false,
                first_period_index: 0,
                last_period_index: 0,
            },
            period: Period {
                duration_us,
                window_index: 0,
                position_in_window_us: 0,
            },
        }
    }

    pub fn duration_us(&self) -> i64 {
        self.period.duration_us
    }
}

impl Timeline for SinglePeriodTimeline {
    fn window_count(&self) -> usize {
        1
    }

    fn period_count(&self) -> usize {
        1
    }

    fn window(&self, index: usize) -> Window {
        assert_eq!(index, 0, "single-period timeline has one window");
        self.window
    }

    fn period(&self, index: usize) -> Period {
        assert_eq!(index, 0, "single-period timeline has one period");
        self.period
    }
}

/// Where playback should start within a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPosition {
    pub period_index: usize,
    /// Position in the period, or `TIME_UNSET` for the default position
    pub position_us: i64,
}

impl StartPosition {
    pub const DEFAULT: StartPosition = StartPosition {
        period_index: 0,
        position_us: TIME_UNSET,
    };

    pub fn new(period_index: usize, position_us: i64) -> Self {
        Self { period_index, position_us }
    }
}
