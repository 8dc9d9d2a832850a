//! Error types for Eventide.

use std::io;

/// Result type alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors returned by [`EventQueue`](crate::EventQueue) operations.
///
/// None of these indicate a broken queue: every variant leaves the queue in a
/// consistent state and callers are free to keep using it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// A negative file descriptor or an empty interest mask was supplied.
    #[error("Invalid parameter")]
    InvalidParam,

    /// The file descriptor already has a listener.
    #[error("File descriptor already has a listener")]
    AlreadyRegistered,

    /// The queue could not switch to a waiter able to watch file descriptors.
    #[error("Listening to file descriptors is not supported")]
    NotSupported,

    /// The operating system refused to watch the file descriptor.
    #[error("Failed to register the file descriptor with the I/O waiter")]
    Failed,

    /// The queue has been permanently shut down.
    #[error("Event queue is no longer usable")]
    Unusable,
}

/// Errors that can occur while starting or driving an [`EventRunner`](crate::EventRunner).
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The dedicated runner thread could not be spawned.
    #[error("Failed to spawn runner thread: {0}")]
    Spawn(#[from] io::Error),

    /// The runner loop is already being driven by some thread.
    #[error("Event runner is already running")]
    AlreadyRunning,

    /// The runner owns a dedicated thread, so it cannot be driven manually.
    #[error("Event runner owns a dedicated thread")]
    OwnsThread,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        assert_eq!(QueueError::InvalidParam.to_string(), "Invalid parameter");
        assert_eq!(
            QueueError::Unusable.to_string(),
            "Event queue is no longer usable"
        );
    }

    #[test]
    fn test_runner_error_from_io() {
        let err: RunnerError = io::Error::other("no threads left").into();
        assert!(matches!(err, RunnerError::Spawn(_)));
        assert!(err.to_string().contains("no threads left"));
    }
}
