//! Polling waiter creation failure.
//!
//! Lowers the process file descriptor limit, so it lives in its own test binary.
#![cfg(target_os = "linux")]

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use eventide_core::{
    CallbackListener, Event, EventQueue, Expired, FdEvents, Handler, HandlerExt, InsertType,
    Priority, QueueError,
};

fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
    assert_eq!(ret, 0);
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

/// Restores the original descriptor limit when dropped.
struct LimitGuard(libc::rlimit);

impl LimitGuard {
    /// Allow no descriptor numbers beyond the ones currently in use.
    fn exhaust() -> Self {
        let mut original = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut original) }, 0);

        let lowest_free = unsafe { libc::fcntl(0, libc::F_DUPFD_CLOEXEC, 0) };
        let lowest_free = if lowest_free < 0 {
            // stdin closed: 0 itself is free.
            0
        } else {
            unsafe { libc::close(lowest_free) };
            lowest_free
        };

        let limited = libc::rlimit {
            rlim_cur: lowest_free as libc::rlim_t,
            rlim_max: original.rlim_max,
        };
        assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limited) }, 0);
        Self(original)
    }
}

impl Drop for LimitGuard {
    fn drop(&mut self) {
        unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &self.0) };
    }
}

#[test]
fn test_listener_rejected_when_polling_waiter_unavailable() {
    let queue = EventQueue::new();
    let handler = Handler::new(queue.clone());
    let (read, _write) = pipe();
    let listener = Arc::new(CallbackListener::new(handler.as_owner()));

    let result = {
        let _limit = LimitGuard::exhaust();
        handler.add_file_descriptor_listener(read.as_raw_fd(), FdEvents::READABLE, listener, "reader", Priority::Low)
    };
    assert_eq!(result, Err(QueueError::NotSupported));

    // The queue keeps working on the notification-only waiter.
    let info = queue.dump_queue_info();
    assert!(info.contains("I/O waiter: none, listeners: 0"));
    queue.insert(Event::new(1u32), Priority::Low, InsertType::AtEnd).unwrap();
    assert!(matches!(queue.get_expired_event(), Expired::Ready(_)));
}
