//! A single priority bucket.

use std::collections::VecDeque;
use std::time::Instant;

use crate::event::{Event, InsertType};

/// Events of one priority class.
///
/// The time-ordered buckets (IMMEDIATE, HIGH, LOW) keep their entries sorted
/// by handle time, except for a leading run of entries inserted at the front.
/// Those stay ahead of the sorted run, most recent first, and still only become
/// eligible once their own handle time has passed. IDLE and VIP use the FIFO
/// operations and never have pinned entries.
#[derive(Default)]
pub(crate) struct SubEventQueue {
    entries: VecDeque<Event>,
    /// Length of the front-inserted prefix.
    pinned: usize,
    /// Events handed out since a lower bucket last had a turn.
    pub handled_count: u32,
}

impl SubEventQueue {
    /// Insert keeping handle-time order; equal times keep insertion order.
    pub fn insert_ordered(&mut self, event: Event, insert_type: InsertType) {
        match insert_type {
            InsertType::AtFront => {
                self.entries.push_front(event);
                self.pinned += 1;
            }
            InsertType::AtEnd => {
                let handle_time = event.handle_time();
                let mut pos = self.entries.len();
                while pos > self.pinned && self.entries[pos - 1].handle_time() > handle_time {
                    pos -= 1;
                }
                self.entries.insert(pos, event);
            }
        }
    }

    /// Insert ignoring handle times.
    pub fn push_fifo(&mut self, event: Event, insert_type: InsertType) {
        match insert_type {
            InsertType::AtFront => self.entries.push_front(event),
            InsertType::AtEnd => self.entries.push_back(event),
        }
    }

    /// Position and handle time of the first entry due at `now`.
    pub fn first_ready(&self, now: Instant) -> Option<(usize, Instant)> {
        let candidates = self.entries.iter().take(self.pinned + 1).enumerate();
        for (pos, event) in candidates {
            if event.handle_time() <= now {
                return Some((pos, event.handle_time()));
            }
        }
        None
    }

    /// Earliest handle time among the entries that can become ready first.
    pub fn earliest(&self) -> Option<Instant> {
        self.entries
            .iter()
            .take(self.pinned + 1)
            .map(Event::handle_time)
            .min()
    }

    pub fn front_handle_time(&self) -> Option<Instant> {
        self.entries.front().map(Event::handle_time)
    }

    pub fn take(&mut self, pos: usize) -> Option<Event> {
        let event = self.entries.remove(pos)?;
        if pos < self.pinned {
            self.pinned -= 1;
        }
        Some(event)
    }

    pub fn pop_front(&mut self) -> Option<Event> {
        self.take(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.entries.iter()
    }

    /// Remove and return every entry matching `filter`, keeping the order of
    /// the rest.
    pub fn extract(&mut self, mut filter: impl FnMut(&Event) -> bool) -> Vec<Event> {
        let mut kept = VecDeque::with_capacity(self.entries.len());
        let mut removed = Vec::new();
        let mut pinned = 0;
        for (pos, event) in self.entries.drain(..).enumerate() {
            if filter(&event) {
                removed.push(event);
            } else {
                if pos < self.pinned {
                    pinned += 1;
                }
                kept.push_back(event);
            }
        }
        self.entries = kept;
        self.pinned = pinned;
        removed
    }

    pub fn clear(&mut self) -> Vec<Event> {
        self.pinned = 0;
        self.entries.drain(..).collect()
    }
}
