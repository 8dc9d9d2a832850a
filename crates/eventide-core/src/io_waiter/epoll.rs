//! epoll based waiter.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use super::{FdEventCallback, clamp_timeout};
use crate::event::Priority;
use crate::listener::FdEvents;
use crate::logging::targets;

/// Maximum number of readiness events collected per wait.
const MAX_EPOLL_EVENTS: usize = 64;

/// A descriptor reported ready by one wait.
struct ReadyFd {
    fd: RawFd,
    events: FdEvents,
    task_name: String,
    priority: Priority,
}

/// Waiter that blocks in `epoll_wait`.
///
/// An eventfd registered with the epoll instance is written to force an early
/// wake-up. Ready descriptors are reported through the [`FdEventCallback`]
/// with the queue lock released.
pub struct EpollIoWaiter {
    epoll: OwnedFd,
    awaken: OwnedFd,
    waiting: AtomicUsize,
    callback: Mutex<Option<FdEventCallback>>,
    /// Task name and priority per watched descriptor.
    registrations: Mutex<HashMap<RawFd, (String, Priority)>>,
}

impl EpollIoWaiter {
    /// Create the epoll instance and its wake-up eventfd.
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall, the result is checked before use.
        let epoll = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `epoll` is a fresh descriptor owned by nobody else.
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll) };

        // SAFETY: plain syscall, the result is checked before use.
        let awaken = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if awaken < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `awaken` is a fresh descriptor owned by nobody else.
        let awaken = unsafe { OwnedFd::from_raw_fd(awaken) };

        let waiter = Self {
            epoll,
            awaken,
            waiting: AtomicUsize::new(0),
            callback: Mutex::new(None),
            registrations: Mutex::new(HashMap::new()),
        };
        waiter.epoll_ctl(
            libc::EPOLL_CTL_ADD,
            waiter.awaken.as_raw_fd(),
            libc::EPOLLIN as u32,
        )?;

        tracing::debug!(
            target: targets::IO_WAITER,
            epoll = waiter.epoll.as_raw_fd(),
            awaken = waiter.awaken.as_raw_fd(),
            "epoll waiter initialized"
        );
        Ok(waiter)
    }

    pub fn wait_for<T>(&self, guard: &mut MutexGuard<'_, T>, timeout: Option<Duration>) -> bool {
        self.waiting.fetch_add(1, Ordering::AcqRel);
        let result = MutexGuard::unlocked(guard, || self.poll(timeout_millis(timeout)));
        self.waiting.fetch_sub(1, Ordering::AcqRel);
        // A notify that raced with the end of the poll must not cut the next wait short.
        self.drain_awaken();

        let ready = match result {
            Ok(ready) => ready,
            Err(err) => {
                tracing::warn!(target: targets::IO_WAITER, %err, "epoll_wait failed");
                return false;
            }
        };
        if ready.is_empty() {
            return true;
        }

        let Some(callback) = self.callback.lock().clone() else {
            tracing::warn!(
                target: targets::IO_WAITER,
                count = ready.len(),
                "descriptors ready but no callback installed"
            );
            return true;
        };
        MutexGuard::unlocked(guard, || {
            for ready_fd in ready {
                callback(
                    ready_fd.fd,
                    ready_fd.events,
                    &ready_fd.task_name,
                    ready_fd.priority,
                );
            }
        });
        true
    }

    /// Force a thread blocked in [`wait_for`](Self::wait_for) to return.
    pub fn notify(&self) {
        if self.waiting.load(Ordering::Acquire) == 0 {
            return;
        }
        let value: u64 = 1;
        // SAFETY: writes 8 bytes from a live u64 into our own eventfd.
        let ret = unsafe {
            libc::write(
                self.awaken.as_raw_fd(),
                (&value as *const u64).cast(),
                size_of::<u64>(),
            )
        };
        if ret < 0 {
            tracing::warn!(
                target: targets::IO_WAITER,
                err = %io::Error::last_os_error(),
                "failed to signal eventfd"
            );
        }
    }

    pub fn add_file_descriptor(
        &self,
        fd: RawFd,
        events: FdEvents,
        task_name: &str,
        priority: Priority,
    ) -> bool {
        if fd < 0 || events.is_empty() {
            tracing::warn!(target: targets::IO_WAITER, fd, ?events, "invalid descriptor registration");
            return false;
        }
        if let Err(err) = self.epoll_ctl(libc::EPOLL_CTL_ADD, fd, to_epoll_events(events)) {
            tracing::warn!(target: targets::IO_WAITER, fd, %err, "failed to watch descriptor");
            return false;
        }
        self.registrations
            .lock()
            .insert(fd, (task_name.to_string(), priority));
        true
    }

    pub fn remove_file_descriptor(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        if let Err(err) = self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, 0) {
            tracing::warn!(target: targets::IO_WAITER, fd, %err, "failed to unwatch descriptor");
        }
        self.registrations.lock().remove(&fd);
    }

    pub fn set_fd_event_callback(&self, callback: FdEventCallback) {
        *self.callback.lock() = Some(callback);
    }

    fn epoll_ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // SAFETY: `event` outlives the call; the kernel copies it.
        let ret = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn poll(&self, timeout_ms: libc::c_int) -> io::Result<Vec<ReadyFd>> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EPOLL_EVENTS];
        // SAFETY: `events` has room for MAX_EPOLL_EVENTS entries.
        let count = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                MAX_EPOLL_EVENTS as libc::c_int,
                timeout_ms,
            )
        };
        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let awaken = self.awaken.as_raw_fd();
        let registrations = self.registrations.lock();
        let mut ready = Vec::with_capacity(count as usize);
        for event in &events[..count as usize] {
            let fd = { event.u64 } as RawFd;
            let flags = { event.events };
            if fd == awaken {
                continue;
            }
            // Unwatched between the wake-up and now.
            let Some((task_name, priority)) = registrations.get(&fd) else {
                continue;
            };
            ready.push(ReadyFd {
                fd,
                events: from_epoll_events(flags),
                task_name: task_name.clone(),
                priority: *priority,
            });
        }
        Ok(ready)
    }

    fn drain_awaken(&self) {
        let mut value: u64 = 0;
        // SAFETY: reads at most 8 bytes into a live u64.
        let ret = unsafe {
            libc::read(
                self.awaken.as_raw_fd(),
                (&mut value as *mut u64).cast(),
                size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                tracing::warn!(target: targets::IO_WAITER, %err, "failed to drain eventfd");
            }
        }
    }
}

fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(timeout) => {
            let millis = clamp_timeout(timeout).as_nanos().div_ceil(1_000_000);
            millis.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

fn to_epoll_events(events: FdEvents) -> u32 {
    let mut epoll_events = 0;
    if events.contains(FdEvents::READABLE) {
        epoll_events |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
    }
    if events.contains(FdEvents::WRITABLE) {
        epoll_events |= libc::EPOLLOUT as u32;
    }
    if events.contains(FdEvents::SHUTDOWN) {
        epoll_events |= (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;
    }
    if events.contains(FdEvents::EXCEPTION) {
        epoll_events |= libc::EPOLLERR as u32;
    }
    epoll_events
}

fn from_epoll_events(epoll_events: u32) -> FdEvents {
    let mut events = FdEvents::EMPTY;
    if epoll_events & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0 {
        events = events | FdEvents::READABLE;
    }
    if epoll_events & libc::EPOLLOUT as u32 != 0 {
        events = events | FdEvents::WRITABLE;
    }
    if epoll_events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
        events = events | FdEvents::SHUTDOWN;
    }
    if epoll_events & libc::EPOLLERR as u32 != 0 {
        events = events | FdEvents::EXCEPTION;
    }
    events
}
