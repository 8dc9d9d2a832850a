//! Condition variable waiter.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, MutexGuard};

use super::{FdEventCallback, clamp_timeout};
use crate::listener::FdEvents;
use crate::logging::targets;

/// Waiter that blocks on a condition variable.
///
/// `waiting` and `pending` are only modified with the queue lock held, so a
/// notification either reaches a thread that is already waiting or is dropped.
/// It never lingers to wake a later, unrelated wait.
#[derive(Debug, Default)]
pub struct NoneIoWaiter {
    condvar: Condvar,
    waiting: AtomicUsize,
    pending: AtomicBool,
}

impl NoneIoWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait_for<T>(&self, guard: &mut MutexGuard<'_, T>, timeout: Option<Duration>) -> bool {
        self.waiting.fetch_add(1, Ordering::AcqRel);
        match timeout {
            Some(timeout) => {
                let _ = self.condvar.wait_while_for(
                    guard,
                    |_| !self.pending.load(Ordering::Acquire),
                    clamp_timeout(timeout),
                );
            }
            None => {
                self.condvar
                    .wait_while(guard, |_| !self.pending.load(Ordering::Acquire));
            }
        }
        self.waiting.fetch_sub(1, Ordering::AcqRel);
        self.pending.store(false, Ordering::Release);
        true
    }

    pub fn notify_one(&self) {
        if self.waiting.load(Ordering::Acquire) > 0 {
            self.pending.store(true, Ordering::Release);
            self.condvar.notify_one();
        }
    }

    pub fn notify_all(&self) {
        if self.waiting.load(Ordering::Acquire) > 0 {
            self.pending.store(true, Ordering::Release);
            self.condvar.notify_all();
        }
    }

    pub fn add_file_descriptor(&self, fd: RawFd, events: FdEvents) -> bool {
        tracing::warn!(
            target: targets::IO_WAITER,
            fd,
            ?events,
            "file descriptors cannot be watched without a polling waiter"
        );
        false
    }

    pub fn remove_file_descriptor(&self, fd: RawFd) {
        tracing::warn!(
            target: targets::IO_WAITER,
            fd,
            "file descriptors cannot be watched without a polling waiter"
        );
    }

    pub fn set_fd_event_callback(&self, _callback: FdEventCallback) {
        tracing::warn!(
            target: targets::IO_WAITER,
            "readiness callback ignored without a polling waiter"
        );
    }

    /// Number of threads currently blocked.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }
}
