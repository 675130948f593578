//! Deadline ordered deferred actions
//!
//! Actions are never cancelled. A stale action is recognised by the flags it
//! checks when it runs.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

struct Entry<A> {
    due: Instant,
    seq: u64,
    action: A,
}

impl<A> PartialEq for Entry<A> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<A> Eq for Entry<A> {}

impl<A> PartialOrd for Entry<A> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<A> Ord for Entry<A> {
    // Reversed so the max-heap yields the earliest deadline
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority queue of `(deadline, action)` pairs polled by the engine tick
pub struct TimerQueue<A> {
    heap: BinaryHeap<Entry<A>>,
    next_seq: u64,
}

impl<A> Default for TimerQueue<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> TimerQueue<A> {
    pub fn new() -> Self {
        TimerQueue {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Runs `action` once `due` has passed
    pub fn schedule(&mut self, due: Instant, action: A) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { due, seq, action });
    }

    /// Removes and returns every action due at `now`, earliest first.
    /// Actions scheduled for the same instant keep their insertion order.
    pub fn pop_due(&mut self, now: Instant) -> Vec<A> {
        let mut due = Vec::new();
        while self.heap.peek().map_or(false, |entry| entry.due <= now) {
            if let Some(entry) = self.heap.pop() {
                due.push(entry.action);
            }
        }
        due
    }

    /// Earliest pending deadline
    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.due)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<A> std::fmt::Debug for TimerQueue<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerQueue")
            .field("pending", &self.heap.len())
            .field("next_due", &self.next_due())
            .finish()
    }
}
