//! File descriptor listeners and the registry that binds them to descriptors.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::{Arc, Weak};

use crate::event::Priority;
use crate::handler::EventHandler;
use crate::logging::targets;

/// Readiness interest mask for a file descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FdEvents(u32);

impl FdEvents {
    pub const EMPTY: FdEvents = FdEvents(0);
    /// Data can be read.
    pub const READABLE: FdEvents = FdEvents(1 << 0);
    /// Data can be written.
    pub const WRITABLE: FdEvents = FdEvents(1 << 1);
    /// The peer hung up.
    pub const SHUTDOWN: FdEvents = FdEvents(1 << 2);
    /// An error condition occurred.
    pub const EXCEPTION: FdEvents = FdEvents(1 << 3);

    const MASK: u32 = 0b1111;

    /// Build a mask from raw bits, dropping unknown ones.
    pub fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::MASK)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: FdEvents) -> bool {
        self.0 & other.0 == other.0 && !other.is_empty()
    }
}

impl BitOr for FdEvents {
    type Output = FdEvents;

    fn bitor(self, rhs: FdEvents) -> FdEvents {
        FdEvents(self.0 | rhs.0)
    }
}

impl fmt::Debug for FdEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::READABLE) {
            names.push("READABLE");
        }
        if self.contains(Self::WRITABLE) {
            names.push("WRITABLE");
        }
        if self.contains(Self::SHUTDOWN) {
            names.push("SHUTDOWN");
        }
        if self.contains(Self::EXCEPTION) {
            names.push("EXCEPTION");
        }
        write!(f, "FdEvents({})", names.join(" | "))
    }
}

/// Receives readiness notifications for a file descriptor.
///
/// Callbacks run on the owner's queue as ordinary tasks. A listener only
/// fires while its owner is alive; the registry never extends that lifetime.
pub trait FileDescriptorListener: Send + Sync + 'static {
    fn on_readable(&self, _fd: RawFd) {}

    fn on_writable(&self, _fd: RawFd) {}

    fn on_shutdown(&self, _fd: RawFd) {}

    fn on_exception(&self, _fd: RawFd) {}

    /// The handler on whose queue readiness tasks are posted.
    fn owner(&self) -> Option<Weak<dyn EventHandler>>;

    /// Whether this listener delivers vsync signals, which lazy mode may defer.
    fn is_vsync(&self) -> bool {
        false
    }
}

/// Invoke the callbacks matching `events`, in fixed order.
pub(crate) fn dispatch_fd_events(listener: &dyn FileDescriptorListener, fd: RawFd, events: FdEvents) {
    if events.contains(FdEvents::READABLE) {
        listener.on_readable(fd);
    }
    if events.contains(FdEvents::WRITABLE) {
        listener.on_writable(fd);
    }
    if events.contains(FdEvents::SHUTDOWN) {
        listener.on_shutdown(fd);
    }
    if events.contains(FdEvents::EXCEPTION) {
        listener.on_exception(fd);
    }
}

type FdCallback = Box<dyn Fn(RawFd) + Send + Sync>;

/// A listener assembled from closures.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use eventide_core::{CallbackListener, EventQueue, FdEvents, Handler, HandlerExt, Priority};
///
/// let queue = EventQueue::new();
/// let handler = Handler::new(queue.clone());
/// let listener = CallbackListener::new(handler.as_owner())
///     .on_readable(|fd| println!("fd {fd} is readable"));
/// handler
///     .add_file_descriptor_listener(0, FdEvents::READABLE, Arc::new(listener), "stdin", Priority::High)
///     .ok();
/// ```
pub struct CallbackListener {
    owner: Weak<dyn EventHandler>,
    vsync: bool,
    readable: Option<FdCallback>,
    writable: Option<FdCallback>,
    shutdown: Option<FdCallback>,
    exception: Option<FdCallback>,
}

impl CallbackListener {
    pub fn new(owner: Weak<dyn EventHandler>) -> Self {
        Self {
            owner,
            vsync: false,
            readable: None,
            writable: None,
            shutdown: None,
            exception: None,
        }
    }

    pub fn on_readable(mut self, f: impl Fn(RawFd) + Send + Sync + 'static) -> Self {
        self.readable = Some(Box::new(f));
        self
    }

    pub fn on_writable(mut self, f: impl Fn(RawFd) + Send + Sync + 'static) -> Self {
        self.writable = Some(Box::new(f));
        self
    }

    pub fn on_shutdown(mut self, f: impl Fn(RawFd) + Send + Sync + 'static) -> Self {
        self.shutdown = Some(Box::new(f));
        self
    }

    pub fn on_exception(mut self, f: impl Fn(RawFd) + Send + Sync + 'static) -> Self {
        self.exception = Some(Box::new(f));
        self
    }

    /// Mark the listener as a vsync source.
    pub fn vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }
}

impl FileDescriptorListener for CallbackListener {
    fn on_readable(&self, fd: RawFd) {
        if let Some(f) = &self.readable {
            f(fd);
        }
    }

    fn on_writable(&self, fd: RawFd) {
        if let Some(f) = &self.writable {
            f(fd);
        }
    }

    fn on_shutdown(&self, fd: RawFd) {
        if let Some(f) = &self.shutdown {
            f(fd);
        }
    }

    fn on_exception(&self, fd: RawFd) {
        if let Some(f) = &self.exception {
            f(fd);
        }
    }

    fn owner(&self) -> Option<Weak<dyn EventHandler>> {
        Some(self.owner.clone())
    }

    fn is_vsync(&self) -> bool {
        self.vsync
    }
}

/// A registered listener together with its registration parameters.
#[derive(Clone)]
pub(crate) struct Registration {
    pub listener: Arc<dyn FileDescriptorListener>,
    pub events: FdEvents,
    pub task_name: String,
    pub priority: Priority,
}

impl Registration {
    fn owner_is_gone(&self) -> bool {
        self.listener
            .owner()
            .is_none_or(|owner| owner.strong_count() == 0)
    }

    fn is_owned_by<H: EventHandler + ?Sized>(&self, owner: &Arc<H>) -> bool {
        self.listener
            .owner()
            .is_some_and(|weak| ptr::addr_eq(weak.as_ptr(), Arc::as_ptr(owner)))
    }
}

/// Mapping from file descriptor to listener.
///
/// Lives inside the queue state and is only touched with the queue lock held.
/// Removal methods hand back the removed registrations so the caller can drop
/// them after releasing the lock.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    entries: BTreeMap<RawFd, Registration>,
}

impl ListenerRegistry {
    pub fn contains(&self, fd: RawFd) -> bool {
        self.entries.contains_key(&fd)
    }

    pub fn get(&self, fd: RawFd) -> Option<&Registration> {
        self.entries.get(&fd)
    }

    pub fn insert(&mut self, fd: RawFd, registration: Registration) {
        tracing::debug!(
            target: targets::LISTENER,
            fd,
            events = ?registration.events,
            task = %registration.task_name,
            "listener registered"
        );
        self.entries.insert(fd, registration);
    }

    pub fn remove(&mut self, fd: RawFd) -> Option<Registration> {
        let removed = self.entries.remove(&fd);
        if removed.is_some() {
            tracing::debug!(target: targets::LISTENER, fd, "listener removed");
        }
        removed
    }

    /// Remove every registration belonging to `owner`.
    pub fn remove_owned_by<H: EventHandler + ?Sized>(
        &mut self,
        owner: &Arc<H>,
    ) -> Vec<(RawFd, Registration)> {
        self.extract(|registration| registration.is_owned_by(owner))
    }

    /// Remove every registration whose owner has been dropped.
    pub fn remove_invalid(&mut self) -> Vec<(RawFd, Registration)> {
        self.extract(Registration::owner_is_gone)
    }

    pub fn clear(&mut self) -> Vec<(RawFd, Registration)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawFd, &Registration)> {
        self.entries.iter().map(|(fd, registration)| (*fd, registration))
    }

    fn extract(&mut self, mut filter: impl FnMut(&Registration) -> bool) -> Vec<(RawFd, Registration)> {
        let fds: Vec<RawFd> = self
            .entries
            .iter()
            .filter(|(_, registration)| filter(registration))
            .map(|(fd, _)| *fd)
            .collect();
        fds.into_iter()
            .filter_map(|fd| self.remove(fd).map(|registration| (fd, registration)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EventQueue;
    use parking_lot::Mutex;

    struct Owner;

    impl EventHandler for Owner {
        fn event_queue(&self) -> Option<Arc<EventQueue>> {
            None
        }
    }

    fn registration(owner: &Arc<dyn EventHandler>) -> Registration {
        Registration {
            listener: Arc::new(CallbackListener::new(Arc::downgrade(owner))),
            events: FdEvents::READABLE,
            task_name: "test".to_string(),
            priority: Priority::High,
        }
    }

    #[test]
    fn test_fd_events_bits() {
        let events = FdEvents::READABLE | FdEvents::EXCEPTION;
        assert!(events.contains(FdEvents::READABLE));
        assert!(!events.contains(FdEvents::WRITABLE));
        assert!(!events.contains(FdEvents::EMPTY));
        assert_eq!(FdEvents::from_bits_truncate(0xf0).bits(), 0);
        assert_eq!(format!("{events:?}"), "FdEvents(READABLE | EXCEPTION)");
    }

    #[test]
    fn test_dispatch_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let owner: Arc<dyn EventHandler> = Arc::new(Owner);
        let (c1, c2, c3, c4) = (calls.clone(), calls.clone(), calls.clone(), calls.clone());
        let listener = CallbackListener::new(Arc::downgrade(&owner))
            .on_exception(move |_| c4.lock().push("exception"))
            .on_shutdown(move |_| c3.lock().push("shutdown"))
            .on_writable(move |_| c2.lock().push("writable"))
            .on_readable(move |_| c1.lock().push("readable"));

        let all = FdEvents::READABLE | FdEvents::WRITABLE | FdEvents::SHUTDOWN | FdEvents::EXCEPTION;
        dispatch_fd_events(&listener, 3, all);
        assert_eq!(
            *calls.lock(),
            vec!["readable", "writable", "shutdown", "exception"]
        );

        calls.lock().clear();
        dispatch_fd_events(&listener, 3, FdEvents::SHUTDOWN);
        assert_eq!(*calls.lock(), vec!["shutdown"]);
    }

    #[test]
    fn test_registry_remove_by_owner() {
        let first: Arc<dyn EventHandler> = Arc::new(Owner);
        let second: Arc<dyn EventHandler> = Arc::new(Owner);
        let mut registry = ListenerRegistry::default();
        registry.insert(3, registration(&first));
        registry.insert(4, registration(&second));
        registry.insert(5, registration(&first));

        let removed = registry.remove_owned_by(&first);
        let fds: Vec<RawFd> = removed.iter().map(|(fd, _)| *fd).collect();
        assert_eq!(fds, vec![3, 5]);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(4));
    }

    #[test]
    fn test_registry_remove_invalid() {
        let alive: Arc<dyn EventHandler> = Arc::new(Owner);
        let dying: Arc<dyn EventHandler> = Arc::new(Owner);
        let mut registry = ListenerRegistry::default();
        registry.insert(7, registration(&alive));
        registry.insert(8, registration(&dying));
        drop(dying);

        let removed = registry.remove_invalid();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, 8);
        assert!(registry.get(7).is_some());
        assert!(registry.get(8).is_none());
    }
}
