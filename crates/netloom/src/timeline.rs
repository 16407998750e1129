//! A timeline: one logical process of the parallel simulation. Each
//! timeline owns an event queue and the model partition (hosts) aligned to
//! it, and exclusively mutates both. No lock protects per-timeline state
//! because no other timeline may touch it; the only cross-thread operation
//! is pushing into another timeline's inbox.

use log::trace;

use crate::channel::{ChannelMap, Inbox, InboxEntry, OutChannelId};
use crate::event::{Activation, EventHandle, EventQueue, EventTarget};
use crate::time::{Ltime, TickScale};

/// The model partition owned by one timeline. Implementations route
/// delivered activations to the right entity (host) and process.
pub trait TimelineModel: Send {
    /// Called once, in timeline order, before the first call to `advance`.
    fn init(&mut self, ctx: &mut SchedContext<'_>);

    /// Deliver an activation to a process of a host owned by this
    /// timeline.
    fn deliver(&mut self, target: EventTarget, ac: Activation, ctx: &mut SchedContext<'_>);

    /// Downcast support so callers can inspect the concrete model between
    /// advances.
    fn as_any(&self) -> &dyn std::any::Any;

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// Everything a model may do while handling an event: read the clock and
/// schedule further activations, either locally or across channels.
pub struct SchedContext<'a> {
    pub(crate) now: Ltime,
    pub(crate) timeline: usize,
    pub(crate) scale: TickScale,
    pub(crate) queue: &'a mut EventQueue,
    pub(crate) channels: &'a ChannelMap,
    pub(crate) inboxes: &'a [Inbox],
}

impl SchedContext<'_> {
    pub fn now(&self) -> Ltime {
        self.now
    }

    pub fn timeline(&self) -> usize {
        self.timeline
    }

    pub fn scale(&self) -> TickScale {
        self.scale
    }

    /// Schedule an activation on this timeline after `delay` ticks.
    pub fn schedule(&mut self, target: EventTarget, ac: Activation, delay: Ltime, tie: u64) {
        debug_assert!(delay >= 0);
        self.queue.push(self.now + delay, tie, target, ac, false);
    }

    /// Like [`schedule`](Self::schedule), but returns a handle that can
    /// cancel the event before it fires.
    pub fn schedule_cancellable(
        &mut self,
        target: EventTarget,
        ac: Activation,
        delay: Ltime,
        tie: u64,
    ) -> EventHandle {
        debug_assert!(delay >= 0);
        self.queue
            .push(self.now + delay, tie, target, ac, true)
            .expect("handle requested")
    }

    /// Write an activation to an out-channel: it is enqueued on every
    /// mapped in-channel at `now + delay + mapping_delay`. Local mappings
    /// go straight into this timeline's queue; remote mappings go through
    /// the target timeline's inbox.
    pub fn write(&mut self, out: OutChannelId, ac: Activation, delay: Ltime, tie: u64) {
        debug_assert!(delay >= 0);
        let mappings = self.channels.mappings_of(out);
        let mut ac = Some(ac);
        for (i, m) in mappings.iter().enumerate() {
            // the last mapping consumes the activation, the rest clone it
            let deliver = if i + 1 == mappings.len() {
                ac.take().expect("activation consumed early")
            } else {
                ac.as_ref().expect("activation consumed early").clone_box()
            };
            let time = self.now + delay + m.delay;
            if m.dst.timeline == self.timeline {
                self.queue.push(time, tie, m.dst.target, deliver, false);
            } else {
                self.inboxes[m.dst.timeline].push(InboxEntry {
                    time,
                    tie,
                    target: m.dst.target,
                    ac: deliver,
                });
            }
        }
    }
}

pub(crate) struct Timeline {
    pub idx: usize,
    pub now: Ltime,
    pub queue: EventQueue,
    pub model: Box<dyn TimelineModel>,
}

impl Timeline {
    pub fn new(idx: usize, model: Box<dyn TimelineModel>) -> Self {
        Timeline { idx, now: 0, queue: EventQueue::new(), model }
    }

    fn drain_inbox(&mut self, inboxes: &[Inbox]) {
        for entry in inboxes[self.idx].drain() {
            self.queue.push(entry.time, entry.tie, entry.target, entry.ac, false);
        }
    }

    /// Run this timeline's portion of one epoch: execute every queued
    /// event with time strictly before `end`, then advance the local clock
    /// to `end`. Returns the number of events executed.
    pub fn run_epoch(&mut self, end: Ltime, shared: &SharedState) -> u64 {
        self.drain_inbox(&shared.inboxes);

        let mut executed = 0;
        while let Some(entry) = self.queue.pop_before(end) {
            if entry.is_cancelled() {
                trace!("timeline {}: skipping cancelled event", self.idx);
                continue;
            }
            debug_assert!(entry.key.time >= self.now, "event moves time backwards");
            self.now = entry.key.time;
            let mut ctx = SchedContext {
                now: self.now,
                timeline: self.idx,
                scale: shared.scale,
                queue: &mut self.queue,
                channels: &shared.channels,
                inboxes: &shared.inboxes,
            };
            self.model.deliver(entry.target, entry.ac, &mut ctx);
            executed += 1;
        }
        self.now = end;
        executed
    }

    pub fn init(&mut self, shared: &SharedState) {
        let mut ctx = SchedContext {
            now: self.now,
            timeline: self.idx,
            scale: shared.scale,
            queue: &mut self.queue,
            channels: &shared.channels,
            inboxes: &shared.inboxes,
        };
        self.model.init(&mut ctx);
    }
}

/// State shared read-only (or through interior locks) by all timelines.
pub(crate) struct SharedState {
    pub scale: TickScale,
    pub channels: ChannelMap,
    pub inboxes: Vec<Inbox>,
}

/// A hand-cranked single-timeline context, for driving model pieces
/// outside a full [`Engine`](crate::Engine): protocol unit tests, or
/// embedding one host in another program. Events scheduled through its
/// context land in an internal queue that [`Harness::pop_next`] steps.
pub struct Harness {
    now: Ltime,
    queue: EventQueue,
    channels: ChannelMap,
    inboxes: Vec<Inbox>,
    scale: TickScale,
}

impl Harness {
    pub fn new(scale: TickScale) -> Self {
        Harness {
            now: 0,
            queue: EventQueue::new(),
            channels: ChannelMap::new(),
            inboxes: vec![Inbox::new()],
            scale,
        }
    }

    pub fn now(&self) -> Ltime {
        self.now
    }

    /// Move the clock forward.
    pub fn advance_to(&mut self, t: Ltime) {
        debug_assert!(t >= self.now);
        self.now = t;
    }

    /// A scheduling context at the current time.
    pub fn ctx(&mut self) -> SchedContext<'_> {
        SchedContext {
            now: self.now,
            timeline: 0,
            scale: self.scale,
            queue: &mut self.queue,
            channels: &self.channels,
            inboxes: &self.inboxes,
        }
    }

    /// Dequeue the next scheduled event, advancing the clock to it.
    pub fn pop_next(&mut self) -> Option<(EventTarget, Activation)> {
        loop {
            let entry = self.queue.pop_before(Ltime::MAX)?;
            if entry.is_cancelled() {
                continue;
            }
            self.now = self.now.max(entry.key.time);
            return Some((entry.target, entry.ac));
        }
    }

    /// The time of the next scheduled event.
    pub fn peek_next_time(&self) -> Option<Ltime> {
        self.queue.peek_time()
    }
}
