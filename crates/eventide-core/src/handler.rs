//! Event handlers: the owners of events and listeners.
//!
//! A handler is bound to one [`EventQueue`]. Everything it posts is owned by it
//! through a weak reference, so dropping the handler turns its pending events
//! into orphans that the queue discards.

use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::bounded;

use crate::error::{QueueError, Result};
use crate::event::{Event, EventId, InsertType, Priority};
use crate::listener::{FdEvents, FileDescriptorListener};
use crate::logging::targets;
use crate::queue::EventQueue;
use crate::runner::EventRunner;
use crate::task::Task;

/// Owner of events and file descriptor listeners.
pub trait EventHandler: Send + Sync + 'static {
    /// The queue this handler posts to.
    fn event_queue(&self) -> Option<Arc<EventQueue>>;

    /// Handle an event without a task.
    fn process_event(&self, event: &Event) {
        tracing::trace!(target: targets::RUNNER, id = %event.id(), "event ignored by handler");
    }
}

/// Closure used by [`Handler`] to process events.
type Processor = Box<dyn Fn(&Event) + Send + Sync>;

/// The standard [`EventHandler`], bound to a queue for its whole life.
///
/// Dropping a `Handler` sweeps orphans from its queue.
pub struct Handler {
    queue: Arc<EventQueue>,
    processor: Option<Processor>,
}

impl Handler {
    /// Create a handler that only runs tasks.
    pub fn new(queue: Arc<EventQueue>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            processor: None,
        })
    }

    /// Create a handler that passes task-less events to `processor`.
    pub fn with_processor<F>(queue: Arc<EventQueue>, processor: F) -> Arc<Self>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        Arc::new(Self {
            queue,
            processor: Some(Box::new(processor)),
        })
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }
}

impl EventHandler for Handler {
    fn event_queue(&self) -> Option<Arc<EventQueue>> {
        Some(self.queue.clone())
    }

    fn process_event(&self, event: &Event) {
        match &self.processor {
            Some(processor) => processor(event),
            None => {
                tracing::trace!(target: targets::RUNNER, id = %event.id(), "event ignored by handler");
            }
        }
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        self.queue.remove_orphan();
    }
}

/// Run an event on its owner: the task if it has one, `process_event` otherwise.
pub(crate) fn distribute_event(handler: &Arc<dyn EventHandler>, mut event: Event) {
    match event.take_task() {
        Some(task) => task.run(),
        None => handler.process_event(&event),
    }
}

/// Posting and removal helpers available on every shared handler.
pub trait HandlerExt {
    /// The handler as a trait object.
    fn handler(&self) -> Arc<dyn EventHandler>;

    /// Weak reference used as the owner of posted events and listeners.
    fn as_owner(&self) -> Weak<dyn EventHandler> {
        Arc::downgrade(&self.handler())
    }

    /// Queue `event` to run after `delay`.
    fn send_event(&self, event: Event, delay: Duration, priority: Priority) -> Result<()> {
        let handler = self.handler();
        let queue = handler.event_queue().ok_or(QueueError::Unusable)?;
        let event = event.owned_by(Arc::downgrade(&handler)).delayed(delay);
        queue.insert(event, priority, InsertType::AtEnd)
    }

    /// Queue a closure to run after `delay`.
    fn post_task<F>(&self, name: &str, delay: Duration, priority: Priority, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send_event(Event::from_task(Task::new(name, f)), delay, priority)
    }

    /// Run a closure on the handler's queue and wait for its result.
    ///
    /// Runs inline when called from the thread currently driving the queue.
    /// Returns `None` if the task could not be queued or was discarded.
    fn post_sync_task<F, R>(&self, name: &str, priority: Priority, f: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let handler = self.handler();
        let queue = handler.event_queue()?;
        if EventRunner::is_current(&queue) {
            return Some(f());
        }

        let (sender, receiver) = bounded(1);
        let task = Task::new(name, move || {
            let _ = sender.send(f());
        });
        let event = Event::from_task(task).owned_by(Arc::downgrade(&handler));
        queue.insert(event, priority, InsertType::AtFront).ok()?;
        drop(handler);
        receiver.recv().ok()
    }

    /// Remove every pending event of this handler.
    fn remove_all_events(&self) {
        let handler = self.handler();
        if let Some(queue) = handler.event_queue() {
            queue.remove_by_owner(&handler);
        }
    }

    /// Remove pending task-less events with `id`.
    fn remove_event(&self, id: impl Into<EventId>) {
        let handler = self.handler();
        if let Some(queue) = handler.event_queue() {
            queue.remove_by_id(&handler, id);
        }
    }

    /// Remove pending tasks called `name`.
    fn remove_task(&self, name: &str) {
        let handler = self.handler();
        if let Some(queue) = handler.event_queue() {
            queue.remove_by_name(&handler, name);
        }
    }

    /// Whether a task-less event with `id` is pending.
    fn has_inner_event(&self, id: impl Into<EventId>) -> bool {
        let handler = self.handler();
        handler
            .event_queue()
            .is_some_and(|queue| queue.has_inner_event(&handler, id))
    }

    /// Watch `fd` and post `listener` callbacks to this handler's queue.
    fn add_file_descriptor_listener(
        &self,
        fd: RawFd,
        events: FdEvents,
        listener: Arc<dyn FileDescriptorListener>,
        task_name: &str,
        priority: Priority,
    ) -> Result<()> {
        let queue = self.handler().event_queue().ok_or(QueueError::Unusable)?;
        queue.add_file_descriptor_listener(fd, events, listener, task_name, priority)
    }

    fn remove_file_descriptor_listener(&self, fd: RawFd) {
        if let Some(queue) = self.handler().event_queue() {
            queue.remove_file_descriptor_listener(fd);
        }
    }

    /// Remove every listener owned by this handler.
    fn remove_all_file_descriptor_listeners(&self) {
        let handler = self.handler();
        if let Some(queue) = handler.event_queue() {
            queue.remove_file_descriptor_listeners_of(&handler);
        }
    }
}

impl<H: EventHandler> HandlerExt for Arc<H> {
    fn handler(&self) -> Arc<dyn EventHandler> {
        self.clone()
    }
}

impl HandlerExt for Arc<dyn EventHandler> {
    fn handler(&self) -> Arc<dyn EventHandler> {
        Arc::clone(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn prepared_queue() -> Arc<EventQueue> {
        let queue = EventQueue::new();
        queue.prepare();
        queue
    }

    #[test]
    fn test_post_task_owns_event() {
        let queue = prepared_queue();
        let handler = Handler::new(queue.clone());
        handler
            .post_task("work", Duration::ZERO, Priority::Low, || {})
            .unwrap();

        let event = queue.get_event().unwrap();
        assert!(event.is_owned_by(&handler));
        assert_eq!(event.task_name(), Some("work"));
    }

    #[test]
    fn test_distribute_runs_task_or_processor() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let queue = prepared_queue();
        let handler = Handler::with_processor(queue.clone(), move |event| {
            seen_clone.lock().push(event.id().clone());
        });
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        handler
            .send_event(Event::new(11u32), Duration::ZERO, Priority::High)
            .unwrap();
        handler
            .post_task("count", Duration::ZERO, Priority::High, move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let dyn_handler: Arc<dyn EventHandler> = handler.clone();
        for _ in 0..2 {
            let event = queue.get_event().unwrap();
            distribute_event(&dyn_handler, event);
        }
        assert_eq!(*seen.lock(), vec![EventId::Numeric(11)]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_helpers() {
        let queue = prepared_queue();
        let handler = Handler::new(queue.clone());
        handler
            .send_event(Event::new(1u32), Duration::from_secs(60), Priority::Low)
            .unwrap();
        handler
            .post_task("later", Duration::from_secs(60), Priority::Low, || {})
            .unwrap();
        assert!(handler.has_inner_event(1u32));

        handler.remove_event(1u32);
        assert!(!handler.has_inner_event(1u32));
        assert!(!queue.is_queue_empty());

        handler.remove_task("later");
        assert!(queue.is_queue_empty());
    }

    #[test]
    fn test_dropping_handler_sweeps_orphans() {
        let queue = prepared_queue();
        let keeper = Handler::new(queue.clone());
        let handler = Handler::new(queue.clone());
        handler
            .post_task("orphan", Duration::ZERO, Priority::Low, || {})
            .unwrap();
        keeper
            .post_task("kept", Duration::ZERO, Priority::Low, || {})
            .unwrap();

        drop(handler);
        let event = queue.get_event().unwrap();
        assert_eq!(event.task_name(), Some("kept"));
        assert!(queue.is_queue_empty());
    }

    #[test]
    fn test_post_sync_task_without_runner_fails_when_unusable() {
        let queue = prepared_queue();
        let handler = Handler::new(queue.clone());
        queue.set_usable(false);
        assert_eq!(handler.post_sync_task("sync", Priority::High, || 1), None);
    }
}
