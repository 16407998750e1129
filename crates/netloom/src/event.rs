//! The per-timeline event queue. Entries are ordered by
//! `(time, tie-breaking seed, insertion counter)` so that replays of the
//! same model produce identical traces.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::time::Ltime;

/// An opaque event payload delivered to a model process after a delay.
/// Payloads must be cloneable because a single channel write fans out to
/// every mapped in-channel.
pub trait Payload: Send {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
    fn clone_box(&self) -> Box<dyn Payload>;
}

impl<T: Any + Send + Clone> Payload for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn clone_box(&self) -> Box<dyn Payload> {
        Box::new(self.clone())
    }
}

/// An activation: a boxed opaque payload queued on a channel.
pub type Activation = Box<dyn Payload>;

/// Identifies a process within a host; the meaning of the key is assigned
/// by the model (e.g. "inbound channel of interface 2" or "slow timer").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessKey(pub u32);

/// The delivery target of an event: a host index local to the owning
/// timeline, plus the process key within that host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventTarget {
    pub host: usize,
    pub process: ProcessKey,
}

/// The ordering key of a scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventKey {
    pub time: Ltime,
    pub tie: u64,
    pub seq: u64,
}

/// A handle to a scheduled event; cancelling marks the entry inert, so it
/// is dequeued but not delivered.
#[derive(Debug, Clone)]
pub struct EventHandle {
    cancelled: Arc<AtomicBool>,
}

impl EventHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Relaxed)
    }
}

pub(crate) struct EventEntry {
    pub key: EventKey,
    pub target: EventTarget,
    pub ac: Activation,
    pub cancelled: Option<Arc<AtomicBool>>,
}

impl EventEntry {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
            .as_ref()
            .map(|c| c.load(AtomicOrdering::Relaxed))
            .unwrap_or(false)
    }
}

impl PartialEq for EventEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for EventEntry {}

// reverse order to get the smallest key first out of the max-heap
impl Ord for EventEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .time
            .cmp(&other.key.time)
            .then_with(|| self.key.tie.cmp(&other.key.tie))
            .then_with(|| self.key.seq.cmp(&other.key.seq))
            .reverse()
    }
}

impl PartialOrd for EventEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The event queue of one timeline.
pub(crate) struct EventQueue {
    heap: BinaryHeap<EventEntry>,
    next_seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue { heap: BinaryHeap::with_capacity(1024), next_seq: 0 }
    }

    /// Push an entry, assigning it the next insertion counter.
    pub fn push(
        &mut self,
        time: Ltime,
        tie: u64,
        target: EventTarget,
        ac: Activation,
        with_handle: bool,
    ) -> Option<EventHandle> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let cancelled = with_handle.then(|| Arc::new(AtomicBool::new(false)));
        let handle = cancelled
            .as_ref()
            .map(|c| EventHandle { cancelled: Arc::clone(c) });
        self.heap.push(EventEntry {
            key: EventKey { time, tie, seq },
            target,
            ac,
            cancelled,
        });
        handle
    }

    pub fn peek_time(&self) -> Option<Ltime> {
        self.heap.peek().map(|e| e.key.time)
    }

    /// Pop the head if its time is strictly before `end`.
    pub fn pop_before(&mut self, end: Ltime) -> Option<EventEntry> {
        match self.heap.peek() {
            Some(e) if e.key.time < end => self.heap.pop(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> EventTarget {
        EventTarget { host: 0, process: ProcessKey(0) }
    }

    #[test]
    fn ordering_is_time_tie_seq() {
        let mut q = EventQueue::new();
        q.push(30, 0, target(), Box::new(3u32), false);
        q.push(10, 5, target(), Box::new(1u32), false);
        q.push(10, 2, target(), Box::new(0u32), false);
        q.push(20, 0, target(), Box::new(2u32), false);

        let mut seen = Vec::new();
        while let Some(e) = q.pop_before(Ltime::MAX) {
            seen.push(*e.ac.as_any().downcast_ref::<u32>().unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn equal_keys_keep_insertion_order() {
        let mut q = EventQueue::new();
        for i in 0..10u32 {
            q.push(7, 1, target(), Box::new(i), false);
        }
        let mut seen = Vec::new();
        while let Some(e) = q.pop_before(Ltime::MAX) {
            seen.push(*e.ac.as_any().downcast_ref::<u32>().unwrap());
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn head_time_is_monotonic() {
        let mut q = EventQueue::new();
        for t in [5i64, 1, 9, 3, 3, 8] {
            q.push(t, 0, target(), Box::new(()), false);
        }
        let mut last = i64::MIN;
        while let Some(e) = q.pop_before(Ltime::MAX) {
            assert!(e.key.time >= last);
            last = e.key.time;
        }
    }

    #[test]
    fn pop_before_respects_window() {
        let mut q = EventQueue::new();
        q.push(10, 0, target(), Box::new(()), false);
        assert!(q.pop_before(10).is_none());
        assert!(q.pop_before(11).is_some());
    }

    #[test]
    fn cancellation_marks_entry() {
        let mut q = EventQueue::new();
        let h = q.push(1, 0, target(), Box::new(()), true).unwrap();
        h.cancel();
        let e = q.pop_before(Ltime::MAX).unwrap();
        assert!(e.is_cancelled());
    }
}
