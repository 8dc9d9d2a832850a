//! The priority event queue.
//!
//! An [`EventQueue`] holds five buckets:
//!
//! - **VIP**: FIFO, always drained before anything else
//! - **IMMEDIATE**, **HIGH**, **LOW**: ordered by handle time, selected in that
//!   order with starvation avoidance
//! - **IDLE**: FIFO, handed out only when nothing else is ready
//!
//! Producers on any thread call [`insert`](EventQueue::insert) and the remove
//! methods. One consumer thread calls [`get_event`](EventQueue::get_event) in a
//! loop; when nothing is due it blocks in the queue's [`IoWaiter`] until the
//! next handle time, a notification, or file descriptor readiness.
//!
//! # Example
//!
//! ```
//! use eventide_core::{Event, EventId, EventQueue, InsertType, Priority};
//!
//! let queue = EventQueue::new();
//! queue.prepare();
//! queue.insert(Event::new(1u32), Priority::Low, InsertType::AtEnd).unwrap();
//! queue.insert(Event::new(2u32), Priority::High, InsertType::AtEnd).unwrap();
//!
//! assert_eq!(queue.get_event().unwrap().id(), &EventId::Numeric(2));
//! assert_eq!(queue.get_event().unwrap().id(), &EventId::Numeric(1));
//! ```

mod bucket;

use std::fmt::Write as _;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::event::{Event, EventId, InsertType, Priority};
use crate::handler::{EventHandler, HandlerExt};
use crate::history::{Dumper, History, HistoryEvent, RunningEvent, describe, format_instant};
use crate::io_waiter::{FdEventCallback, IoWaiter};
use crate::listener::{FdEvents, FileDescriptorListener, ListenerRegistry, Registration, dispatch_fd_events};
use crate::logging::targets;
use crate::observer::{RunnerStage, StageCallback, StageInfo, StageMask, StageObserver};

use bucket::SubEventQueue;

/// Buckets subject to starvation avoidance, in selection order.
const ORDERED_PRIORITIES: [Priority; 3] = [Priority::Immediate, Priority::High, Priority::Low];

/// Bucket order used by dumps.
const DUMP_ORDER: [Priority; 5] = [
    Priority::Vip,
    Priority::Immediate,
    Priority::High,
    Priority::Low,
    Priority::Idle,
];

/// Result of [`EventQueue::get_expired_event`].
#[derive(Debug)]
pub enum Expired {
    /// An event that was due.
    Ready(Event),
    /// Nothing is due; the earliest pending handle time, or `None` if nothing
    /// is pending.
    Pending(Option<Instant>),
}

/// State guarded by the queue lock.
struct QueueState {
    buckets: [SubEventQueue; 5],
    /// Handle time the consumer sleeps until; `None` while it sleeps
    /// indefinitely or is not sleeping at all.
    wake_up_time: Option<Instant>,
    is_idle: bool,
    idle_since: Instant,
    finished: bool,
    io_waiter: Arc<IoWaiter>,
    listeners: ListenerRegistry,
    observer: Option<StageObserver>,
    lazy_mode: bool,
}

impl QueueState {
    fn new(io_waiter: IoWaiter) -> Self {
        Self {
            buckets: Default::default(),
            wake_up_time: None,
            is_idle: true,
            idle_since: Instant::now(),
            finished: true,
            io_waiter: Arc::new(io_waiter),
            listeners: ListenerRegistry::default(),
            observer: None,
            lazy_mode: false,
        }
    }

    fn bucket(&self, priority: Priority) -> &SubEventQueue {
        &self.buckets[priority.index()]
    }

    fn bucket_mut(&mut self, priority: Priority) -> &mut SubEventQueue {
        &mut self.buckets[priority.index()]
    }

    fn events(&self) -> impl Iterator<Item = &Event> {
        self.buckets.iter().flat_map(SubEventQueue::iter)
    }

    fn extract(&mut self, mut filter: impl FnMut(&Event) -> bool) -> Vec<Event> {
        let mut removed = Vec::new();
        for bucket in &mut self.buckets {
            removed.extend(bucket.extract(&mut filter));
        }
        removed
    }

    /// Swap back to the notification-only waiter, dropping every listener.
    fn reset_io_waiter(&mut self) -> Vec<(RawFd, Registration)> {
        tracing::error!(
            target: targets::IO_WAITER,
            waiter = self.io_waiter.kind(),
            listeners = self.listeners.len(),
            "I/O waiter failed, falling back to notification only"
        );
        self.io_waiter = Arc::new(IoWaiter::none());
        self.listeners.clear()
    }
}

/// Thread-safe priority event queue.
///
/// Created behind an [`Arc`]; readiness callbacks from the I/O waiter hold a
/// weak reference back to the queue.
pub struct EventQueue {
    state: Mutex<QueueState>,
    usable: AtomicBool,
    history: History,
    config: QueueConfig,
    weak_self: Weak<EventQueue>,
}

impl EventQueue {
    /// Create a queue with the default configuration.
    pub fn new() -> Arc<Self> {
        Self::with_config(&QueueConfig::default())
    }

    /// Create a queue with the given configuration.
    pub fn with_config(config: &QueueConfig) -> Arc<Self> {
        Self::with_io_waiter(config, IoWaiter::none())
    }

    /// Create a queue that starts out with `io_waiter`.
    pub fn with_io_waiter(config: &QueueConfig, io_waiter: IoWaiter) -> Arc<Self> {
        Arc::new_cyclic(|weak_self: &Weak<EventQueue>| {
            if io_waiter.supports_fd() {
                io_waiter.set_fd_event_callback(fd_event_callback(weak_self.clone()));
            }
            Self {
                state: Mutex::new(QueueState::new(io_waiter)),
                usable: AtomicBool::new(true),
                history: History::new(),
                config: config.clone(),
                weak_self: weak_self.clone(),
            }
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queue `event` in the bucket for `priority`.
    ///
    /// Wakes the consumer if the event is due before its current wake-up
    /// time. Fails only when the queue is no longer usable.
    #[tracing::instrument(skip(self, event), target = "eventide_core::queue", level = "trace")]
    pub fn insert(&self, event: Event, priority: Priority, insert_type: InsertType) -> Result<()> {
        let vip_observer = {
            let mut state = self.state.lock();
            if !self.is_usable() {
                tracing::warn!(target: targets::QUEUE, name = %event.name(), "insert into unusable queue");
                return Err(QueueError::Unusable);
            }

            let handle_time = event.handle_time();
            let bucket = state.bucket_mut(priority);
            let was_empty = bucket.is_empty();
            match priority {
                Priority::Vip | Priority::Idle => bucket.push_fifo(event, insert_type),
                _ => bucket.insert_ordered(event, insert_type),
            }

            let need_notify = priority == Priority::Vip
                || state.wake_up_time.is_none_or(|wake_up| handle_time < wake_up);
            if need_notify {
                state.io_waiter.notify_one();
            }

            if priority == Priority::Vip && was_empty {
                state.observer.clone()
            } else {
                None
            }
        };

        if let Some(observer) = vip_observer {
            observer.notify(RunnerStage::VipExisted, &StageInfo::now(None));
        }
        Ok(())
    }

    /// Block until an event is due and return it.
    ///
    /// Returns `None` once the queue is finished or unusable, and keeps
    /// returning `None` until [`prepare`](Self::prepare) is called.
    pub fn get_event(&self) -> Option<Event> {
        let mut state = self.state.lock();
        let mut announced = false;
        loop {
            if state.finished || !self.is_usable() {
                return None;
            }

            if let Some((event, priority)) = self.pick_locked(&mut state, Instant::now()) {
                self.after_pick(state, priority);
                return Some(event);
            }

            let timeout = state
                .wake_up_time
                .map(|wake_up| wake_up.saturating_duration_since(Instant::now()));

            // The observer runs unlocked, so selection is retried before sleeping.
            if !announced {
                if let Some(observer) = state.observer.clone() {
                    if observer.stages.contains(RunnerStage::BeforeWaiting) {
                        announced = true;
                        MutexGuard::unlocked(&mut state, || {
                            observer.notify(RunnerStage::BeforeWaiting, &StageInfo::now(timeout));
                        });
                        continue;
                    }
                }
            }
            announced = false;

            self.wait_locked(&mut state, timeout);
        }
    }

    /// Return a due event without blocking.
    pub fn get_expired_event(&self) -> Expired {
        let mut state = self.state.lock();
        match self.pick_locked(&mut state, Instant::now()) {
            Some((event, priority)) => {
                self.after_pick(state, priority);
                Expired::Ready(event)
            }
            None => Expired::Pending(state.wake_up_time),
        }
    }

    /// Select and remove the next due event.
    fn pick_locked(&self, state: &mut QueueState, now: Instant) -> Option<(Event, Priority)> {
        state.wake_up_time = None;

        if let Some(event) = state.bucket_mut(Priority::Vip).pop_front() {
            return Some((event, Priority::Vip));
        }

        let max_handled = self.config.max_handled_events;
        let mut wake_up: Option<Instant> = None;
        let mut chosen: Option<(Priority, usize)> = None;
        for priority in ORDERED_PRIORITIES {
            let bucket = state.bucket(priority);
            if let Some(earliest) = bucket.earliest() {
                wake_up = Some(wake_up.map_or(earliest, |current| current.min(earliest)));
            }
            let Some((pos, _)) = bucket.first_ready(now) else {
                continue;
            };
            // A capped bucket yields to the next lower bucket with a ready event.
            chosen = Some((priority, pos));
            if bucket.handled_count < max_handled {
                break;
            }
        }

        if let Some((priority, pos)) = chosen {
            for higher in &mut state.buckets[..priority.index()] {
                higher.handled_count = 0;
            }
            let bucket = state.bucket_mut(priority);
            bucket.handled_count = bucket.handled_count.saturating_add(1);
            let event = bucket.take(pos)?;
            state.is_idle = false;
            tracing::trace!(target: targets::QUEUE, %priority, name = %event.name(), "event picked");
            return Some((event, priority));
        }

        if !state.is_idle {
            state.is_idle = true;
            state.idle_since = now;
        }

        let idle = state.bucket_mut(Priority::Idle);
        if let Some(handle_time) = idle.front_handle_time() {
            if handle_time <= now {
                return idle.pop_front().map(|event| (event, Priority::Idle));
            }
            wake_up = Some(wake_up.map_or(handle_time, |current| current.min(handle_time)));
        }

        state.wake_up_time = wake_up;
        None
    }

    /// Release the lock and report a drained VIP bucket.
    fn after_pick(&self, state: MutexGuard<'_, QueueState>, priority: Priority) {
        let observer = if priority == Priority::Vip && state.bucket(Priority::Vip).is_empty() {
            state.observer.clone()
        } else {
            None
        };
        drop(state);
        if let Some(observer) = observer {
            observer.notify(RunnerStage::VipNone, &StageInfo::now(None));
        }
    }

    /// Block in the current waiter for up to `timeout`.
    fn wait_locked(&self, state: &mut MutexGuard<'_, QueueState>, timeout: Option<Duration>) {
        let io_waiter = Arc::clone(&state.io_waiter);
        tracing::trace!(target: targets::QUEUE, ?timeout, waiter = io_waiter.kind(), "waiting");
        if !io_waiter.wait_for(state, timeout) {
            let removed = state.reset_io_waiter();
            MutexGuard::unlocked(state, || drop(removed));
        }

        if let Some(observer) = state.observer.clone() {
            if observer.stages.contains(RunnerStage::AfterWaiting) {
                MutexGuard::unlocked(state, || {
                    observer.notify(RunnerStage::AfterWaiting, &StageInfo::now(None));
                });
            }
        }
    }

    /// Allow [`get_event`](Self::get_event) to return events again.
    pub fn prepare(&self) {
        let mut state = self.state.lock();
        if !self.is_usable() {
            return;
        }
        state.finished = false;
    }

    /// Make [`get_event`](Self::get_event) return `None` and wake a blocked consumer.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        if !self.is_usable() {
            return;
        }
        state.finished = true;
        state.io_waiter.notify_all();
    }

    /// Mark the queue as unusable.
    ///
    /// This is one-way: passing `true` to an unusable queue has no effect.
    pub fn set_usable(&self, usable: bool) {
        let mut state = self.state.lock();
        if usable {
            if !self.is_usable() {
                tracing::warn!(target: targets::QUEUE, "an unusable queue cannot be revived");
            }
            return;
        }
        if self.usable.swap(false, Ordering::AcqRel) {
            tracing::debug!(target: targets::QUEUE, "queue marked unusable");
            state.finished = true;
            state.io_waiter.notify_all();
        }
    }

    pub fn is_usable(&self) -> bool {
        self.usable.load(Ordering::Acquire)
    }

    /// Remove every event of `owner`.
    pub fn remove_by_owner<H: EventHandler + ?Sized>(&self, owner: &Arc<H>) {
        self.remove_where(|event| event.is_owned_by(owner));
    }

    /// Remove task-less events of `owner` with `id`.
    pub fn remove_by_id<H: EventHandler + ?Sized>(&self, owner: &Arc<H>, id: impl Into<EventId>) {
        let id = id.into();
        self.remove_where(|event| !event.has_task() && event.is_owned_by(owner) && *event.id() == id);
    }

    /// Remove task-less events of `owner` with `id` and `param`.
    pub fn remove_by_id_and_param<H: EventHandler + ?Sized>(
        &self,
        owner: &Arc<H>,
        id: impl Into<EventId>,
        param: i64,
    ) {
        let id = id.into();
        self.remove_where(|event| {
            !event.has_task() && event.is_owned_by(owner) && *event.id() == id && event.param() == param
        });
    }

    /// Remove tasks of `owner` called `name`. An empty name removes nothing.
    pub fn remove_by_name<H: EventHandler + ?Sized>(&self, owner: &Arc<H>, name: &str) {
        if name.is_empty() {
            return;
        }
        self.remove_where(|event| event.is_owned_by(owner) && event.task_name() == Some(name));
    }

    /// Remove every event and listener whose owner is gone.
    pub fn remove_orphan(&self) {
        let (events, listeners) = {
            let mut state = self.state.lock();
            let events = state.extract(Event::is_orphan);
            let listeners = state.listeners.remove_invalid();
            for (fd, _) in &listeners {
                state.io_waiter.remove_file_descriptor(*fd);
            }
            (events, listeners)
        };
        if !events.is_empty() || !listeners.is_empty() {
            tracing::debug!(
                target: targets::QUEUE,
                events = events.len(),
                listeners = listeners.len(),
                "orphans removed"
            );
        }
    }

    /// Remove every event.
    pub fn remove_all(&self) {
        let removed = {
            let mut state = self.state.lock();
            let mut removed = Vec::new();
            for bucket in &mut state.buckets {
                removed.extend(bucket.clear());
            }
            removed
        };
        tracing::debug!(target: targets::QUEUE, count = removed.len(), "all events removed");
    }

    /// Removed events are dropped after the lock is released, since their
    /// tasks may hold the last reference to a handler.
    fn remove_where(&self, filter: impl FnMut(&Event) -> bool) {
        let removed = self.state.lock().extract(filter);
        if !removed.is_empty() {
            tracing::trace!(target: targets::QUEUE, count = removed.len(), "events removed");
        }
    }

    /// Watch `fd` and post `listener` callbacks when it becomes ready.
    ///
    /// The first registration switches the queue to a polling waiter.
    #[tracing::instrument(skip(self, listener), target = "eventide_core::listener", level = "debug")]
    pub fn add_file_descriptor_listener(
        &self,
        fd: RawFd,
        events: FdEvents,
        listener: Arc<dyn FileDescriptorListener>,
        task_name: &str,
        priority: Priority,
    ) -> Result<()> {
        if fd < 0 || events.is_empty() {
            return Err(QueueError::InvalidParam);
        }

        let mut state = self.state.lock();
        if !self.is_usable() {
            return Err(QueueError::Unusable);
        }
        if state.listeners.contains(fd) {
            tracing::warn!(target: targets::LISTENER, fd, "file descriptor already has a listener");
            return Err(QueueError::AlreadyRegistered);
        }
        self.ensure_polling_waiter(&mut state)?;
        if !state.io_waiter.add_file_descriptor(fd, events, task_name, priority) {
            return Err(QueueError::Failed);
        }

        state.listeners.insert(
            fd,
            Registration {
                listener,
                events,
                task_name: task_name.to_string(),
                priority,
            },
        );
        Ok(())
    }

    /// Switch to a polling waiter if the current one cannot watch descriptors.
    fn ensure_polling_waiter(&self, state: &mut QueueState) -> Result<()> {
        if state.io_waiter.supports_fd() {
            return Ok(());
        }
        let io_waiter = IoWaiter::polling().map_err(|err| {
            tracing::warn!(target: targets::IO_WAITER, %err, "failed to create polling waiter");
            QueueError::NotSupported
        })?;
        io_waiter.set_fd_event_callback(fd_event_callback(self.weak_self.clone()));

        // A consumer blocked in the old waiter must move over to the new one.
        state.io_waiter.notify_all();
        state.io_waiter = Arc::new(io_waiter);
        tracing::debug!(target: targets::IO_WAITER, waiter = state.io_waiter.kind(), "waiter upgraded");
        Ok(())
    }

    /// Stop watching `fd`.
    pub fn remove_file_descriptor_listener(&self, fd: RawFd) {
        let removed = {
            let mut state = self.state.lock();
            if !self.is_usable() {
                return;
            }
            let removed = state.listeners.remove(fd);
            if removed.is_some() {
                state.io_waiter.remove_file_descriptor(fd);
            }
            removed
        };
        drop(removed);
    }

    /// Stop watching every descriptor whose listener belongs to `owner`.
    pub fn remove_file_descriptor_listeners_of<H: EventHandler + ?Sized>(&self, owner: &Arc<H>) {
        let removed = {
            let mut state = self.state.lock();
            if !self.is_usable() {
                return;
            }
            let removed = state.listeners.remove_owned_by(owner);
            for (fd, _) in &removed {
                state.io_waiter.remove_file_descriptor(*fd);
            }
            removed
        };
        drop(removed);
    }

    /// Turn a readiness report into a task on the listener owner's queue.
    ///
    /// Called by the waiter without the queue lock held.
    fn handle_file_descriptor_event(&self, fd: RawFd, events: FdEvents, task_name: &str, priority: Priority) {
        let (listener, delay) = {
            let state = self.state.lock();
            if !self.is_usable() {
                return;
            }
            let Some(registration) = state.listeners.get(fd) else {
                tracing::debug!(target: targets::LISTENER, fd, "listener removed before dispatch");
                return;
            };
            let lazy_vsync = self.config.fd_monitor && state.lazy_mode && registration.listener.is_vsync();
            let delay = if lazy_vsync {
                self.config.vsync_delay
            } else {
                Duration::ZERO
            };
            (registration.listener.clone(), delay)
        };

        let Some(owner) = listener.owner().and_then(|owner| owner.upgrade()) else {
            tracing::debug!(target: targets::LISTENER, fd, "listener owner is gone");
            return;
        };

        let weak_listener = Arc::downgrade(&listener);
        drop(listener);
        let result = owner.post_task(task_name, delay, priority, move || {
            if let Some(listener) = weak_listener.upgrade() {
                dispatch_fd_events(listener.as_ref(), fd, events);
            }
        });
        if let Err(err) = result {
            tracing::warn!(target: targets::LISTENER, fd, %err, "failed to post readiness task");
        }
    }

    /// Poll watched descriptors once without blocking.
    pub fn check_file_descriptor_event(&self) {
        let mut state = self.state.lock();
        let io_waiter = Arc::clone(&state.io_waiter);
        if !io_waiter.wait_for(&mut state, Some(Duration::ZERO)) {
            let removed = state.reset_io_waiter();
            drop(state);
            drop(removed);
        }
    }

    /// Defer vsync listener tasks by the configured delay.
    ///
    /// Has no effect unless file descriptor monitoring is enabled.
    pub fn set_vsync_lazy_mode(&self, lazy: bool) {
        if !self.config.fd_monitor {
            tracing::debug!(target: targets::LISTENER, "fd monitoring disabled, lazy mode ignored");
            return;
        }
        let mut state = self.state.lock();
        if !self.is_usable() {
            return;
        }
        state.lazy_mode = lazy;
    }

    /// Register the observer for `stages`, replacing any previous one.
    pub fn add_observer<F>(&self, stages: impl Into<StageMask>, callback: F)
    where
        F: Fn(RunnerStage, &StageInfo) -> i32 + Send + Sync + 'static,
    {
        let callback: StageCallback = Arc::new(callback);
        let observer = StageObserver {
            stages: stages.into(),
            callback,
        };
        // The old callback may own the last reference to a handler.
        let previous = std::mem::replace(&mut self.state.lock().observer, Some(observer));
        drop(previous);
    }

    /// Whether a task-less event of `owner` with `id` is pending.
    pub fn has_inner_event<H: EventHandler + ?Sized>(&self, owner: &Arc<H>, id: impl Into<EventId>) -> bool {
        let id = id.into();
        self.state
            .lock()
            .events()
            .any(|event| !event.has_task() && event.is_owned_by(owner) && *event.id() == id)
    }

    /// Whether a task-less event of `owner` with `param` is pending.
    pub fn has_inner_event_with_param<H: EventHandler + ?Sized>(&self, owner: &Arc<H>, param: i64) -> bool {
        self.state
            .lock()
            .events()
            .any(|event| !event.has_task() && event.is_owned_by(owner) && event.param() == param)
    }

    /// Whether a time-ordered bucket more urgent than `base` holds events.
    pub fn has_prefer_event(&self, base: Priority) -> bool {
        let state = self.state.lock();
        ORDERED_PRIORITIES
            .iter()
            .filter(|priority| **priority < base)
            .any(|priority| !state.bucket(*priority).is_empty())
    }

    pub fn has_vip_task(&self) -> bool {
        !self.state.lock().bucket(Priority::Vip).is_empty()
    }

    /// Whether the last selection found nothing to run.
    pub fn is_idle(&self) -> bool {
        self.state.lock().is_idle
    }

    /// When the queue last became idle.
    pub fn idle_since(&self) -> Instant {
        self.state.lock().idle_since
    }

    pub fn is_queue_empty(&self) -> bool {
        self.state.lock().buckets.iter().all(SubEventQueue::is_empty)
    }

    /// Number of pending events in the bucket for `priority`.
    pub fn len(&self, priority: Priority) -> usize {
        self.state.lock().bucket(priority).len()
    }

    /// Record the start of a distribution.
    pub fn push_history_before_distribute(&self, event: &Event) {
        self.history.before_distribute(event);
    }

    /// Record the end of the distribution started last.
    pub fn push_history_after_distribute(&self) {
        self.history.after_distribute();
    }

    pub fn current_running_event(&self) -> Option<RunningEvent> {
        self.history.current()
    }

    /// Recent distributions, oldest first.
    pub fn history_snapshot(&self) -> Vec<HistoryEvent> {
        self.history.snapshot()
    }

    /// Write the running event, the history and the queue contents.
    pub fn dump(&self, dumper: &mut dyn Dumper) {
        let tag = dumper.tag();
        let current = match self.history.current() {
            Some(running) => format!(
                "{tag} Current Running: start at {}, Event {{ send thread = {:?}, send time = {}, handle time = {}, {} }}\n",
                format_instant(running.begin_time),
                running.sender_thread,
                format_instant(running.send_time),
                format_instant(running.handle_time),
                describe(&running.event_id, running.task_name.as_deref()),
            ),
            None => format!("{tag} Current Running: null\n"),
        };
        dumper.dump(&current);
        dumper.dump(&self.history.format(&tag));
        dumper.dump(&self.format_queue(&tag));
    }

    /// Queue contents per bucket.
    pub fn dump_queue_info(&self) -> String {
        self.format_queue("")
    }

    /// One line with the size of every bucket.
    pub fn dump_current_queue_size(&self) -> String {
        let state = self.state.lock();
        format!(
            "Current queue size: IMMEDIATE = {},HIGH = {},LOW = {},IDLE = {},VIP = {} ; ",
            state.bucket(Priority::Immediate).len(),
            state.bucket(Priority::High).len(),
            state.bucket(Priority::Low).len(),
            state.bucket(Priority::Idle).len(),
            state.bucket(Priority::Vip).len(),
        )
    }

    fn format_queue(&self, tag: &str) -> String {
        let state = self.state.lock();
        let prefix = if tag.is_empty() { String::new() } else { format!("{tag} ") };
        let mut out = String::new();
        let mut total = 0;
        for priority in DUMP_ORDER {
            let bucket = state.bucket(priority);
            let _ = writeln!(out, "{prefix}{priority} priority event queue information:");
            for (index, event) in bucket.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "{prefix}No.{} : Event {{ send thread = {:?}, send time = {}, handle time = {}, {} }}",
                    index + 1,
                    event.sender_thread(),
                    format_instant(event.send_time()),
                    format_instant(event.handle_time()),
                    describe(event.id(), event.task_name()),
                );
            }
            let _ = writeln!(out, "{prefix}Total size of {priority} events : {}", bucket.len());
            total += bucket.len();
        }
        let _ = writeln!(
            out,
            "{prefix}I/O waiter: {}, listeners: {}",
            state.io_waiter.kind(),
            state.listeners.len()
        );
        for (fd, registration) in state.listeners.iter() {
            let _ = writeln!(
                out,
                "{prefix}Listener fd = {fd}, events = {:?}, task name = {}, priority = {}",
                registration.events, registration.task_name, registration.priority
            );
        }
        let _ = writeln!(out, "{prefix}Total event size : {total}");
        out
    }
}

/// Readiness callback installed in polling waiters.
fn fd_event_callback(queue: Weak<EventQueue>) -> FdEventCallback {
    Arc::new(
        move |fd: RawFd, events: FdEvents, task_name: &str, priority: Priority| {
            if let Some(queue) = queue.upgrade() {
                queue.handle_file_descriptor_event(fd, events, task_name, priority);
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use crate::history::StringDumper;
    use crate::task::Task;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn prepared() -> Arc<EventQueue> {
        let queue = EventQueue::new();
        queue.prepare();
        queue
    }

    fn numeric(event: Option<Event>) -> u32 {
        match event.map(|event| event.id().clone()) {
            Some(EventId::Numeric(id)) => id,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_get_event_before_prepare_returns_none() {
        let queue = EventQueue::new();
        queue.insert(Event::new(1u32), Priority::Low, InsertType::AtEnd).unwrap();
        assert!(queue.get_event().is_none());

        queue.prepare();
        assert_eq!(numeric(queue.get_event()), 1);
    }

    #[test]
    fn test_priority_order() {
        let queue = prepared();
        let base = Instant::now() - Duration::from_millis(100);
        for (offset, priority) in [Priority::Low, Priority::High, Priority::Immediate].into_iter().enumerate() {
            let id = priority as u32;
            let event = Event::new(id).at(base + Duration::from_millis(offset as u64));
            queue.insert(event, priority, InsertType::AtEnd).unwrap();
        }
        assert_eq!(numeric(queue.get_event()), Priority::Immediate as u32);
        assert_eq!(numeric(queue.get_event()), Priority::High as u32);
        assert_eq!(numeric(queue.get_event()), Priority::Low as u32);
    }

    #[test]
    fn test_starvation_yields_to_low() {
        let queue = prepared();
        for id in 0..6u32 {
            queue.insert(Event::new(id), Priority::High, InsertType::AtEnd).unwrap();
        }
        queue.insert(Event::new(100u32), Priority::Low, InsertType::AtEnd).unwrap();

        let order: Vec<u32> = (0..7).map(|_| numeric(queue.get_event())).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 100, 5]);
    }

    #[test]
    fn test_starvation_yields_to_equal_time_low() {
        let queue = prepared();
        let due = Instant::now() - Duration::from_millis(10);
        for id in 0..6u32 {
            queue.insert(Event::new(id).at(due), Priority::High, InsertType::AtEnd).unwrap();
        }
        queue.insert(Event::new(100u32).at(due), Priority::Low, InsertType::AtEnd).unwrap();

        let order: Vec<u32> = (0..7).map(|_| numeric(queue.get_event())).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 100, 5]);
    }

    #[test]
    fn test_starvation_skips_to_first_ready_lower_bucket() {
        let queue = prepared();
        for id in 0..6u32 {
            queue.insert(Event::new(id), Priority::Immediate, InsertType::AtEnd).unwrap();
        }
        queue
            .insert(Event::new(50u32).delayed(Duration::from_secs(60)), Priority::High, InsertType::AtEnd)
            .unwrap();
        queue.insert(Event::new(100u32), Priority::Low, InsertType::AtEnd).unwrap();

        let order: Vec<u32> = (0..7).map(|_| numeric(queue.get_event())).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 100, 5]);
    }

    #[test]
    fn test_yield_resets_higher_counter() {
        let queue = prepared();
        for id in 0..12u32 {
            queue.insert(Event::new(id), Priority::High, InsertType::AtEnd).unwrap();
        }
        for id in 100..102u32 {
            queue.insert(Event::new(id), Priority::Low, InsertType::AtEnd).unwrap();
        }

        let order: Vec<u32> = (0..14).map(|_| numeric(queue.get_event())).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 100, 5, 6, 7, 8, 9, 101, 10, 11]);
    }

    #[test]
    fn test_vip_drains_first() {
        let queue = prepared();
        queue.insert(Event::new(1u32), Priority::Low, InsertType::AtEnd).unwrap();
        queue.insert(Event::new(2u32), Priority::Vip, InsertType::AtEnd).unwrap();
        queue.insert(Event::new(3u32), Priority::Immediate, InsertType::AtEnd).unwrap();
        queue.insert(Event::new(4u32), Priority::Vip, InsertType::AtEnd).unwrap();
        assert!(queue.has_vip_task());

        let order: Vec<u32> = (0..4).map(|_| numeric(queue.get_event())).collect();
        assert_eq!(order, vec![2, 4, 3, 1]);
        assert!(!queue.has_vip_task());
    }

    #[test]
    fn test_idle_only_when_nothing_else_ready() {
        let queue = prepared();
        queue.insert(Event::new(1u32), Priority::Idle, InsertType::AtEnd).unwrap();
        queue.insert(Event::new(2u32), Priority::Low, InsertType::AtEnd).unwrap();
        queue
            .insert(
                Event::new(3u32).delayed(Duration::from_secs(60)),
                Priority::High,
                InsertType::AtEnd,
            )
            .unwrap();

        assert_eq!(numeric(queue.get_event()), 2);
        assert!(!queue.is_idle());
        assert_eq!(numeric(queue.get_event()), 1);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_front_insert_respects_handle_time() {
        let queue = prepared();
        let now = Instant::now();
        queue.insert(Event::new(1u32).at(now), Priority::Low, InsertType::AtEnd).unwrap();
        queue
            .insert(Event::new(2u32).at(now + Duration::from_secs(60)), Priority::Low, InsertType::AtFront)
            .unwrap();
        queue.insert(Event::new(3u32).at(now), Priority::Low, InsertType::AtFront).unwrap();

        assert_eq!(numeric(queue.get_event()), 3);
        assert_eq!(numeric(queue.get_event()), 1);
        match queue.get_expired_event() {
            Expired::Pending(Some(next)) => assert_eq!(next, now + Duration::from_secs(60)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_get_expired_event_reports_next_time() {
        let queue = EventQueue::new();
        assert!(matches!(queue.get_expired_event(), Expired::Pending(None)));

        let event = Event::new(1u32).delayed(Duration::from_secs(30));
        let handle_time = event.handle_time();
        queue.insert(event, Priority::High, InsertType::AtEnd).unwrap();
        match queue.get_expired_event() {
            Expired::Pending(Some(next)) => assert_eq!(next, handle_time),
            other => panic!("unexpected {other:?}"),
        }

        queue.insert(Event::new(2u32), Priority::Low, InsertType::AtEnd).unwrap();
        assert!(matches!(queue.get_expired_event(), Expired::Ready(event) if *event.id() == EventId::Numeric(2)));
    }

    #[test]
    fn test_delay_is_honored() {
        let queue = prepared();
        let start = Instant::now();
        queue
            .insert(Event::new(1u32).delayed(Duration::from_millis(100)), Priority::Low, InsertType::AtEnd)
            .unwrap();
        assert_eq!(numeric(queue.get_event()), 1);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_insert_wakes_blocked_consumer() {
        let queue = prepared();
        let consumer_queue = queue.clone();
        let handle = thread::spawn(move || consumer_queue.get_event().map(|event| event.param()));

        thread::sleep(Duration::from_millis(30));
        queue.insert(Event::with_param(1u32, 77), Priority::High, InsertType::AtEnd).unwrap();
        assert_eq!(handle.join().unwrap(), Some(77));
    }

    #[test]
    fn test_earlier_insert_shortens_wait() {
        let queue = prepared();
        queue
            .insert(Event::new(1u32).delayed(Duration::from_secs(10)), Priority::Low, InsertType::AtEnd)
            .unwrap();
        let consumer_queue = queue.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || numeric(consumer_queue.get_event()));

        thread::sleep(Duration::from_millis(20));
        queue
            .insert(Event::new(2u32).delayed(Duration::from_millis(10)), Priority::Low, InsertType::AtEnd)
            .unwrap();
        assert_eq!(handle.join().unwrap(), 2);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_finish_wakes_and_prepare_resumes() {
        let queue = prepared();
        let consumer_queue = queue.clone();
        let handle = thread::spawn(move || consumer_queue.get_event().is_none());

        thread::sleep(Duration::from_millis(20));
        queue.finish();
        assert!(handle.join().unwrap());

        queue.insert(Event::new(5u32), Priority::Low, InsertType::AtEnd).unwrap();
        assert!(queue.get_event().is_none());
        queue.prepare();
        assert_eq!(numeric(queue.get_event()), 5);
    }

    #[test]
    fn test_unusable_queue() {
        let queue = prepared();
        queue.set_usable(false);
        queue.set_usable(false);
        assert!(!queue.is_usable());
        assert_eq!(
            queue.insert(Event::new(1u32), Priority::Low, InsertType::AtEnd),
            Err(QueueError::Unusable)
        );
        queue.prepare();
        assert!(queue.get_event().is_none());

        queue.set_usable(true);
        assert!(!queue.is_usable());
        queue.remove_orphan();
        queue.remove_all();
    }

    #[test]
    fn test_remove_variants() {
        let queue = prepared();
        let handler = Handler::new(queue.clone());
        let other = Handler::new(queue.clone());
        let owner = handler.as_owner();
        let later = Duration::from_secs(60);

        for (id, param) in [(1u32, 10), (1, 20), (2, 10)] {
            queue
                .insert(
                    Event::with_param(id, param).owned_by(owner.clone()).delayed(later),
                    Priority::Low,
                    InsertType::AtEnd,
                )
                .unwrap();
        }
        let task = Event::from_task(Task::new("job", || {})).owned_by(owner.clone());
        queue.insert(task.delayed(later), Priority::High, InsertType::AtEnd).unwrap();
        queue
            .insert(Event::new(1u32).owned_by(other.as_owner()).delayed(later), Priority::Low, InsertType::AtEnd)
            .unwrap();

        queue.remove_by_id_and_param(&handler, 1u32, 20);
        assert!(queue.has_inner_event_with_param(&handler, 10));
        assert!(!queue.has_inner_event_with_param(&handler, 20));

        queue.remove_by_id(&handler, 1u32);
        assert!(!queue.has_inner_event(&handler, 1u32));
        assert!(queue.has_inner_event(&other, 1u32));
        assert!(queue.has_inner_event(&handler, 2u32));

        queue.remove_by_name(&handler, "");
        assert_eq!(queue.len(Priority::High), 1);
        queue.remove_by_name(&handler, "job");
        assert_eq!(queue.len(Priority::High), 0);

        queue.remove_by_owner(&handler);
        assert_eq!(queue.len(Priority::Low), 1);
        queue.remove_all();
        assert!(queue.is_queue_empty());
    }

    struct BareOwner(Arc<EventQueue>);

    impl EventHandler for BareOwner {
        fn event_queue(&self) -> Option<Arc<EventQueue>> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn test_remove_orphan() {
        let queue = prepared();
        let alive: Arc<dyn EventHandler> = Arc::new(BareOwner(queue.clone()));
        let dying: Arc<dyn EventHandler> = Arc::new(BareOwner(queue.clone()));
        queue
            .insert(Event::new(1u32).owned_by(Arc::downgrade(&dying)), Priority::Low, InsertType::AtEnd)
            .unwrap();
        queue
            .insert(Event::new(2u32).owned_by(Arc::downgrade(&alive)), Priority::Low, InsertType::AtEnd)
            .unwrap();
        queue.insert(Event::new(3u32), Priority::Low, InsertType::AtEnd).unwrap();

        drop(dying);
        assert_eq!(queue.len(Priority::Low), 3);
        queue.remove_orphan();
        assert_eq!(queue.len(Priority::Low), 1);
        assert_eq!(numeric(queue.get_event()), 2);
        assert!(queue.is_queue_empty());
    }

    #[test]
    fn test_has_prefer_event() {
        let queue = EventQueue::new();
        assert!(!queue.has_prefer_event(Priority::Idle));
        queue.insert(Event::new(1u32), Priority::High, InsertType::AtEnd).unwrap();
        assert!(!queue.has_prefer_event(Priority::Immediate));
        assert!(!queue.has_prefer_event(Priority::High));
        assert!(queue.has_prefer_event(Priority::Low));
    }

    #[test]
    fn test_replacing_observer_drops_its_handler() {
        let queue = prepared();
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let worker_queue = queue.clone();
        thread::spawn(move || {
            let handler = Handler::new(worker_queue.clone());
            worker_queue.add_observer(RunnerStage::BeforeWaiting, move |_: RunnerStage, _: &StageInfo| {
                let _ = handler.queue();
                0
            });
            worker_queue.add_observer(RunnerStage::AfterWaiting, |_: RunnerStage, _: &StageInfo| 0);
            let _ = done_tx.send(());
        });
        assert!(done_rx.recv_timeout(Duration::from_secs(3)).is_ok());
        assert!(queue.is_queue_empty());
    }

    #[test]
    fn test_observer_stages() {
        let queue = prepared();
        let stages = Arc::new(Mutex::new(Vec::new()));
        let stages_clone = stages.clone();
        queue.add_observer(StageMask::ALL, move |stage, _| {
            stages_clone.lock().push(stage);
            0
        });

        queue.insert(Event::new(1u32), Priority::Vip, InsertType::AtEnd).unwrap();
        queue.insert(Event::new(2u32), Priority::Vip, InsertType::AtEnd).unwrap();
        queue.get_event();
        queue.get_event();
        queue
            .insert(Event::new(3u32).delayed(Duration::from_millis(20)), Priority::Low, InsertType::AtEnd)
            .unwrap();
        queue.get_event();

        assert_eq!(
            *stages.lock(),
            vec![
                RunnerStage::VipExisted,
                RunnerStage::VipNone,
                RunnerStage::BeforeWaiting,
                RunnerStage::AfterWaiting,
            ]
        );
    }

    #[test]
    fn test_observer_sees_sleep_time() {
        let queue = prepared();
        let sleeps = Arc::new(AtomicUsize::new(0));
        let sleeps_clone = sleeps.clone();
        queue.add_observer(RunnerStage::BeforeWaiting, move |_, info| {
            if info.sleep_time.is_some_and(|sleep| sleep <= Duration::from_millis(50)) {
                sleeps_clone.fetch_add(1, Ordering::SeqCst);
            }
            0
        });
        queue
            .insert(Event::new(1u32).delayed(Duration::from_millis(30)), Priority::High, InsertType::AtEnd)
            .unwrap();
        assert_eq!(numeric(queue.get_event()), 1);
        assert!(sleeps.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_dump_output() {
        let queue = EventQueue::new();
        queue.insert(Event::new(9u32), Priority::High, InsertType::AtEnd).unwrap();
        queue
            .insert(Event::from_task(Task::new("paint", || {})), Priority::Vip, InsertType::AtEnd)
            .unwrap();

        assert_eq!(
            queue.dump_current_queue_size(),
            "Current queue size: IMMEDIATE = 0,HIGH = 1,LOW = 0,IDLE = 0,VIP = 1 ; "
        );

        let info = queue.dump_queue_info();
        assert!(info.contains("HIGH priority event queue information:"));
        assert!(info.contains("id = 9"));
        assert!(info.contains("task name = paint"));
        assert!(info.contains("Total event size : 2"));

        let mut dumper = StringDumper::new("[main]");
        queue.dump(&mut dumper);
        assert!(dumper.output().starts_with("[main] Current Running: null"));
        assert!(dumper.output().contains("[main] Total size of VIP events : 1"));
    }

    #[test]
    fn test_history_through_queue() {
        let queue = EventQueue::new();
        let event = Event::new(4u32);
        queue.push_history_before_distribute(&event);
        assert_eq!(queue.current_running_event().unwrap().event_id, EventId::Numeric(4));
        queue.push_history_after_distribute();
        assert!(queue.current_running_event().is_none());
        assert_eq!(queue.history_snapshot().len(), 1);
    }

    #[test]
    fn test_vsync_lazy_mode_requires_fd_monitor() {
        let queue = EventQueue::new();
        queue.set_vsync_lazy_mode(true);
        assert!(!queue.state.lock().lazy_mode);

        let queue = EventQueue::with_config(&QueueConfig::new().with_fd_monitor(true));
        queue.set_vsync_lazy_mode(true);
        assert!(queue.state.lock().lazy_mode);
    }
}
