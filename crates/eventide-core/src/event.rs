//! Events: the scheduled units of work held by an [`EventQueue`](crate::EventQueue).

use std::fmt;
use std::ptr;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::handler::EventHandler;
use crate::task::Task;

/// Priority buckets of an event queue.
///
/// Selection order is VIP first, then IMMEDIATE, HIGH and LOW (subject to
/// starvation avoidance), and IDLE only when nothing else is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    /// Most urgent of the time-ordered buckets.
    Immediate = 0,
    /// Urgent work such as input handling.
    High = 1,
    /// Regular work.
    #[default]
    Low = 2,
    /// Runs only while the queue would otherwise be idle.
    Idle = 3,
    /// FIFO fast path drained before every other bucket.
    Vip = 4,
}

impl Priority {
    /// Every priority, in bucket order.
    pub const ALL: [Priority; 5] = [
        Priority::Immediate,
        Priority::High,
        Priority::Low,
        Priority::Idle,
        Priority::Vip,
    ];

    /// Upper-case name used in dumps.
    pub fn name(self) -> &'static str {
        match self {
            Self::Immediate => "IMMEDIATE",
            Self::High => "HIGH",
            Self::Low => "LOW",
            Self::Idle => "IDLE",
            Self::Vip => "VIP",
        }
    }

    /// Position of the bucket in the queue's bucket array.
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where an event lands inside its bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertType {
    /// Ordered by handle time, after existing events with the same time.
    #[default]
    AtEnd,
    /// Ahead of every event already in the bucket.
    AtFront,
}

/// Identity of an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventId {
    /// Numeric identifier.
    Numeric(u32),
    /// String identifier.
    Named(String),
}

impl Default for EventId {
    fn default() -> Self {
        Self::Numeric(0)
    }
}

impl From<u32> for EventId {
    fn from(id: u32) -> Self {
        Self::Numeric(id)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self::Named(id.to_string())
    }
}

impl From<String> for EventId {
    fn from(id: String) -> Self {
        Self::Named(id)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(id) => write!(f, "{id}"),
            Self::Named(id) => f.write_str(id),
        }
    }
}

/// A scheduled unit of work.
///
/// An event carries an identity, an optional parameter, an optional [`Task`],
/// its send and handle times, and a weak reference to the handler that owns
/// it. The owner is never kept alive by the event: once the handler is
/// dropped the event becomes an orphan and is discarded instead of dispatched.
pub struct Event {
    id: EventId,
    param: i64,
    task: Option<Task>,
    owner: Option<Weak<dyn EventHandler>>,
    send_time: Instant,
    handle_time: Instant,
    sender_thread: ThreadId,
}

impl Event {
    /// Create an event that is due immediately.
    pub fn new(id: impl Into<EventId>) -> Self {
        Self::with_param(id, 0)
    }

    /// Create an event with a parameter.
    pub fn with_param(id: impl Into<EventId>, param: i64) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            param,
            task: None,
            owner: None,
            send_time: now,
            handle_time: now,
            sender_thread: thread::current().id(),
        }
    }

    /// Create an event that carries a task.
    pub fn from_task(task: Task) -> Self {
        let mut event = Self::new(EventId::default());
        event.task = Some(task);
        event
    }

    /// Set the owning handler.
    pub fn owned_by(mut self, owner: Weak<dyn EventHandler>) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Make the event due `delay` after its send time.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.handle_time = self.send_time + delay;
        self
    }

    /// Make the event due at `handle_time`.
    pub fn at(mut self, handle_time: Instant) -> Self {
        self.handle_time = handle_time;
        self
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn param(&self) -> i64 {
        self.param
    }

    pub fn send_time(&self) -> Instant {
        self.send_time
    }

    pub fn handle_time(&self) -> Instant {
        self.handle_time
    }

    /// Thread that created the event.
    pub fn sender_thread(&self) -> ThreadId {
        self.sender_thread
    }

    pub fn has_task(&self) -> bool {
        self.task.is_some()
    }

    /// Name of the carried task, if any.
    pub fn task_name(&self) -> Option<&str> {
        self.task.as_ref().map(Task::name)
    }

    /// Task name for task events, the id otherwise.
    pub fn name(&self) -> String {
        match &self.task {
            Some(task) => task.name().to_string(),
            None => self.id.to_string(),
        }
    }

    /// Take the task out of the event.
    pub fn take_task(&mut self) -> Option<Task> {
        self.task.take()
    }

    /// Resolve the owner to a strong reference.
    ///
    /// Returns `None` if the event has no owner or the owner has been dropped.
    pub fn owner(&self) -> Option<Arc<dyn EventHandler>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }

    /// Whether the owner can no longer be resolved.
    ///
    /// Does not create a strong reference, so it is safe to call while holding
    /// locks that a handler's `Drop` might take.
    pub fn is_orphan(&self) -> bool {
        self.owner.as_ref().is_none_or(|owner| owner.strong_count() == 0)
    }

    /// Whether `owner` is the handler this event belongs to.
    pub fn is_owned_by<H: EventHandler + ?Sized>(&self, owner: &Arc<H>) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|weak| ptr::addr_eq(weak.as_ptr(), Arc::as_ptr(owner)))
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("param", &self.param)
            .field("task", &self.task_name())
            .field("send_time", &self.send_time)
            .field("handle_time", &self.handle_time)
            .field("orphan", &self.is_orphan())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EventQueue;

    struct Owner;

    impl EventHandler for Owner {
        fn event_queue(&self) -> Option<Arc<EventQueue>> {
            None
        }
    }

    #[test]
    fn test_priority_order_and_names() {
        assert!(Priority::Immediate < Priority::High);
        assert!(Priority::High < Priority::Low);
        assert_eq!(Priority::default(), Priority::Low);
        assert_eq!(Priority::Vip.to_string(), "VIP");
        assert_eq!(Priority::Idle.index(), 3);
    }

    #[test]
    fn test_event_name_prefers_task() {
        let event = Event::new("resize");
        assert_eq!(event.name(), "resize");
        assert!(!event.has_task());

        let event = Event::from_task(Task::new("paint", || {}));
        assert_eq!(event.name(), "paint");
        assert_eq!(event.task_name(), Some("paint"));
    }

    #[test]
    fn test_delay_sets_handle_time() {
        let event = Event::new(1u32).delayed(Duration::from_millis(30));
        assert_eq!(
            event.handle_time() - event.send_time(),
            Duration::from_millis(30)
        );
    }

    #[test]
    fn test_owner_is_weak() {
        let owner: Arc<dyn EventHandler> = Arc::new(Owner);
        let event = Event::new(7u32).owned_by(Arc::downgrade(&owner));
        assert!(event.is_owned_by(&owner));
        assert!(!event.is_orphan());
        assert_eq!(Arc::strong_count(&owner), 1);

        drop(owner);
        assert!(event.is_orphan());
        assert!(event.owner().is_none());
    }

    #[test]
    fn test_unowned_event_is_orphan() {
        let other: Arc<dyn EventHandler> = Arc::new(Owner);
        let event = Event::with_param(3u32, -4);
        assert!(event.is_orphan());
        assert!(!event.is_owned_by(&other));
        assert_eq!(event.param(), -4);
    }
}
