//! Immutable tunables for event queues.

use std::time::Duration;

/// Default number of consecutive events a priority bucket may hand out before
/// lower buckets get a turn.
pub const DEFAULT_MAX_HANDLED_EVENTS: u32 = 5;

/// Default deferral applied to vsync readiness tasks in lazy mode.
pub const DEFAULT_VSYNC_DELAY: Duration = Duration::from_millis(50);

/// Configuration for an [`EventQueue`](crate::EventQueue).
///
/// Built once and handed to [`EventQueue::with_config`](crate::EventQueue::with_config);
/// the queue keeps its own copy and never changes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Enables file descriptor monitoring features such as vsync lazy mode.
    pub fd_monitor: bool,
    /// Delay applied to vsync listener tasks while lazy mode is on.
    pub vsync_delay: Duration,
    /// Starvation cap for the IMMEDIATE, HIGH and LOW buckets.
    pub max_handled_events: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            fd_monitor: false,
            vsync_delay: DEFAULT_VSYNC_DELAY,
            max_handled_events: DEFAULT_MAX_HANDLED_EVENTS,
        }
    }
}

impl QueueConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable file descriptor monitoring.
    pub fn with_fd_monitor(mut self, enabled: bool) -> Self {
        self.fd_monitor = enabled;
        self
    }

    /// Set the vsync lazy-mode delay.
    pub fn with_vsync_delay(mut self, delay: Duration) -> Self {
        self.vsync_delay = delay;
        self
    }

    /// Set the starvation cap. Values below one are raised to one.
    pub fn with_max_handled_events(mut self, max: u32) -> Self {
        self.max_handled_events = max.max(1);
        self
    }
}
