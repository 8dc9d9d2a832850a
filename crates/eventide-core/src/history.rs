//! Dispatch history and diagnostics output.
//!
//! The runner records every distributed event in a fixed-size ring. Dumps take
//! a snapshot under the ring's own lock, so reading never interferes with the
//! queue lock or with scheduling.

use std::fmt::Write as _;
use std::thread::ThreadId;
use std::time::{Instant, SystemTime};

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use static_assertions::const_assert;

use crate::event::{Event, EventId};
use crate::logging::targets;

/// Number of dispatch records kept.
pub const HISTORY_CAPACITY: usize = 32;

const_assert!(HISTORY_CAPACITY.is_power_of_two());

const HISTORY_MASK: usize = HISTORY_CAPACITY - 1;

/// Sink for diagnostic text.
pub trait Dumper {
    /// Receive one chunk of output.
    fn dump(&mut self, message: &str);

    /// Prefix written at the start of every line.
    fn tag(&self) -> String;
}

/// A [`Dumper`] that collects everything into a string.
#[derive(Debug, Default, Clone)]
pub struct StringDumper {
    tag: String,
    output: String,
}

impl StringDumper {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            output: String::new(),
        }
    }

    pub fn output(&self) -> &str {
        &self.output
    }
}

impl Dumper for StringDumper {
    fn dump(&mut self, message: &str) {
        self.output.push_str(message);
    }

    fn tag(&self) -> String {
        self.tag.clone()
    }
}

/// One completed (or in-flight) distribution.
#[derive(Debug, Clone)]
pub struct HistoryEvent {
    pub event_id: EventId,
    pub task_name: Option<String>,
    pub sender_thread: ThreadId,
    pub send_time: Instant,
    pub handle_time: Instant,
    /// When distribution started.
    pub trigger_time: Instant,
    /// When distribution finished; `None` while it is running.
    pub complete_time: Option<Instant>,
}

impl HistoryEvent {
    fn new(event: &Event, trigger_time: Instant) -> Self {
        Self {
            event_id: event.id().clone(),
            task_name: event.task_name().map(str::to_string),
            sender_thread: event.sender_thread(),
            send_time: event.send_time(),
            handle_time: event.handle_time(),
            trigger_time,
            complete_time: None,
        }
    }

    /// Task name for task events, the id otherwise.
    pub fn name(&self) -> String {
        match &self.task_name {
            Some(name) => name.clone(),
            None => self.event_id.to_string(),
        }
    }
}

/// The event being distributed right now.
#[derive(Debug, Clone)]
pub struct RunningEvent {
    pub begin_time: Instant,
    pub event_id: EventId,
    pub param: i64,
    pub task_name: Option<String>,
    pub sender_thread: ThreadId,
    pub send_time: Instant,
    pub handle_time: Instant,
}

#[derive(Default)]
struct HistoryState {
    records: Vec<HistoryEvent>,
    /// Slot of the next write.
    next: usize,
    /// Slot written by the last `before_distribute` not yet completed.
    in_progress: Option<usize>,
    current: Option<RunningEvent>,
}

/// Ring buffer of recent distributions.
#[derive(Default)]
pub(crate) struct History {
    state: Mutex<HistoryState>,
}

impl History {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HistoryState {
                records: Vec::with_capacity(HISTORY_CAPACITY),
                ..Default::default()
            }),
        }
    }

    pub fn before_distribute(&self, event: &Event) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let slot = state.next;
        let record = HistoryEvent::new(event, now);
        if slot < state.records.len() {
            state.records[slot] = record;
        } else {
            state.records.push(record);
        }
        state.in_progress = Some(slot);
        state.next = (slot + 1) & HISTORY_MASK;
        state.current = Some(RunningEvent {
            begin_time: now,
            event_id: event.id().clone(),
            param: event.param(),
            task_name: event.task_name().map(str::to_string),
            sender_thread: event.sender_thread(),
            send_time: event.send_time(),
            handle_time: event.handle_time(),
        });
    }

    pub fn after_distribute(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.in_progress.take() {
            Some(slot) => state.records[slot].complete_time = Some(now),
            None => tracing::trace!(target: targets::HISTORY, "completion without a running event"),
        }
        state.current = None;
    }

    pub fn current(&self) -> Option<RunningEvent> {
        self.state.lock().current.clone()
    }

    /// Records from oldest to newest.
    pub fn snapshot(&self) -> Vec<HistoryEvent> {
        let state = self.state.lock();
        if state.records.len() < HISTORY_CAPACITY {
            return state.records.clone();
        }
        let (newer, older) = state.records.split_at(state.next);
        older.iter().chain(newer).cloned().collect()
    }

    /// Render the history for a dump.
    pub fn format(&self, tag: &str) -> String {
        let records = self.snapshot();
        let mut out = String::new();
        let _ = writeln!(out, "{tag} History event queue information:");
        for (index, record) in records.iter().enumerate() {
            let _ = writeln!(
                out,
                "{tag} No. {} : Event {{ send thread = {:?}, send time = {}, handle time = {}, trigger time = {}, complete time = {}, {} }}",
                index,
                record.sender_thread,
                format_instant(record.send_time),
                format_instant(record.handle_time),
                format_instant(record.trigger_time),
                record
                    .complete_time
                    .map(format_instant)
                    .unwrap_or_default(),
                describe(&record.event_id, record.task_name.as_deref()),
            );
        }
        out
    }
}

/// `task name = ...` for task events, `id = ...` otherwise.
pub(crate) fn describe(event_id: &EventId, task_name: Option<&str>) -> String {
    match task_name {
        Some(name) => format!("task name = {name}"),
        None => format!("id = {event_id}"),
    }
}

/// Render a monotonic instant as local wall-clock time.
pub fn format_instant(instant: Instant) -> String {
    let now = Instant::now();
    let wall_now = SystemTime::now();
    let wall = if instant <= now {
        wall_now.checked_sub(now - instant)
    } else {
        wall_now.checked_add(instant - now)
    };
    match wall {
        Some(wall) => DateTime::<Local>::from(wall)
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string(),
        None => String::from("-"),
    }
}
