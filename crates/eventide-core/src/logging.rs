//! Logging facilities for Eventide.
//!
//! Eventide uses the `tracing` crate for instrumentation and never installs a
//! subscriber itself. To see logs, install one in your application:
//!
//! ```ignore
//! fn main() {
//!     tracing_subscriber::fmt()
//!         .with_env_filter("eventide_core::queue=trace")
//!         .init();
//! }
//! ```

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Event queue scheduling and removal.
    pub const QUEUE: &str = "eventide_core::queue";
    /// I/O waiter blocking, wake-ups and descriptor registration.
    pub const IO_WAITER: &str = "eventide_core::io_waiter";
    /// File descriptor listener registry and readiness dispatch.
    pub const LISTENER: &str = "eventide_core::listener";
    /// Event runner loop and distribution.
    pub const RUNNER: &str = "eventide_core::runner";
    /// Dispatch history.
    pub const HISTORY: &str = "eventide_core::history";
}
