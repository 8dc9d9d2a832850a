//! Blocking and waking for the queue's consumer thread.
//!
//! An [`IoWaiter`] blocks the consumer until a timeout expires, a producer
//! notifies it, or (for the polling variant) a watched file descriptor becomes
//! ready. Every method is called with the queue lock held; `wait_for` releases
//! the lock while blocked and re-acquires it before returning.

mod none;
#[cfg(target_os = "linux")]
mod epoll;

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::MutexGuard;

use crate::event::Priority;
use crate::listener::FdEvents;

pub use none::NoneIoWaiter;
#[cfg(target_os = "linux")]
pub use epoll::EpollIoWaiter;

/// Longest single wait. Longer timeouts are clamped to avoid overflow in the
/// underlying primitives.
pub const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Callback invoked by a polling waiter for every ready descriptor, with the
/// task name and priority given at registration.
pub type FdEventCallback = Arc<dyn Fn(RawFd, FdEvents, &str, Priority) + Send + Sync>;

/// The waiter currently used by a queue.
pub enum IoWaiter {
    /// Condition variable wait. Cannot watch file descriptors.
    None(NoneIoWaiter),
    /// epoll wait with an eventfd for wake-ups.
    #[cfg(target_os = "linux")]
    Epoll(EpollIoWaiter),
}

impl IoWaiter {
    /// A waiter that only supports notification.
    pub fn none() -> Self {
        Self::None(NoneIoWaiter::new())
    }

    /// A waiter able to watch file descriptors on this platform.
    pub fn polling() -> io::Result<Self> {
        #[cfg(target_os = "linux")]
        {
            EpollIoWaiter::new().map(Self::Epoll)
        }
        #[cfg(not(target_os = "linux"))]
        {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "no file descriptor waiter on this platform",
            ))
        }
    }

    /// Block for up to `timeout` (`None` waits until notified).
    ///
    /// Returns `false` if the underlying wait failed in a way that makes the
    /// waiter unusable.
    pub fn wait_for<T>(&self, guard: &mut MutexGuard<'_, T>, timeout: Option<Duration>) -> bool {
        match self {
            Self::None(waiter) => waiter.wait_for(guard, timeout),
            #[cfg(target_os = "linux")]
            Self::Epoll(waiter) => waiter.wait_for(guard, timeout),
        }
    }

    /// Wake one thread blocked in [`wait_for`](Self::wait_for). Dropped if nobody waits.
    pub fn notify_one(&self) {
        match self {
            Self::None(waiter) => waiter.notify_one(),
            #[cfg(target_os = "linux")]
            Self::Epoll(waiter) => waiter.notify(),
        }
    }

    /// Wake every thread blocked in [`wait_for`](Self::wait_for). Dropped if nobody waits.
    pub fn notify_all(&self) {
        match self {
            Self::None(waiter) => waiter.notify_all(),
            #[cfg(target_os = "linux")]
            Self::Epoll(waiter) => waiter.notify(),
        }
    }

    /// Whether this waiter can watch file descriptors.
    pub fn supports_fd(&self) -> bool {
        match self {
            Self::None(_) => false,
            #[cfg(target_os = "linux")]
            Self::Epoll(_) => true,
        }
    }

    /// Start watching `fd` for `events`.
    pub fn add_file_descriptor(
        &self,
        fd: RawFd,
        events: FdEvents,
        task_name: &str,
        priority: Priority,
    ) -> bool {
        match self {
            Self::None(waiter) => waiter.add_file_descriptor(fd, events),
            #[cfg(target_os = "linux")]
            Self::Epoll(waiter) => waiter.add_file_descriptor(fd, events, task_name, priority),
        }
    }

    /// Stop watching `fd`.
    pub fn remove_file_descriptor(&self, fd: RawFd) {
        match self {
            Self::None(waiter) => waiter.remove_file_descriptor(fd),
            #[cfg(target_os = "linux")]
            Self::Epoll(waiter) => waiter.remove_file_descriptor(fd),
        }
    }

    /// Install the readiness callback. The none waiter logs and drops it.
    pub fn set_fd_event_callback(&self, callback: FdEventCallback) {
        match self {
            Self::None(waiter) => waiter.set_fd_event_callback(callback),
            #[cfg(target_os = "linux")]
            Self::Epoll(waiter) => waiter.set_fd_event_callback(callback),
        }
    }

    /// Variant name for logs and dumps.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None(_) => "none",
            #[cfg(target_os = "linux")]
            Self::Epoll(_) => "epoll",
        }
    }
}

impl Default for IoWaiter {
    fn default() -> Self {
        Self::none()
    }
}

/// Clamp a timeout to [`MAX_WAIT`].
pub(crate) fn clamp_timeout(timeout: Duration) -> Duration {
    timeout.min(MAX_WAIT)
}
