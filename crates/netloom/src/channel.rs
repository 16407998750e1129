//! Channel endpoints and mappings. An out-channel fans out to one or more
//! in-channels; each mapping carries a fixed delay. Writing an activation
//! to an out-channel enqueues it on every mapped in-channel's owning
//! timeline at `now + write_delay + mapping_delay`.

use std::sync::Mutex;

use crate::event::{Activation, EventTarget};
use crate::time::Ltime;
use crate::Error;

/// Identifies an out-channel registered with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutChannelId(pub u32);

/// An in-channel endpoint: the timeline owning it plus the delivery target
/// within that timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InChannelRef {
    pub timeline: usize,
    pub target: EventTarget,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Mapping {
    pub dst: InChannelRef,
    pub delay: Ltime,
}

/// The immutable mapping table, shared by all timelines after build.
pub struct ChannelMap {
    mappings: Vec<Vec<Mapping>>,
    owners: Vec<usize>,
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelMap {
    pub fn new() -> Self {
        ChannelMap { mappings: Vec::new(), owners: Vec::new() }
    }

    /// Register an out-channel owned by (written from) the given timeline.
    pub fn new_out_channel(&mut self, owner: usize) -> OutChannelId {
        let id = OutChannelId(self.mappings.len() as u32);
        self.mappings.push(Vec::new());
        self.owners.push(owner);
        id
    }

    /// Map `out` onto an in-channel with the given delay. A cross-timeline
    /// mapping with a non-positive delay is rejected: it would leave the
    /// target timeline without lookahead.
    pub fn map(&mut self, out: OutChannelId, dst: InChannelRef, delay: Ltime) -> Result<(), Error> {
        let src = self.owners[out.0 as usize];
        if delay < 0 || (delay == 0 && src != dst.timeline) {
            return Err(Error::Mapping(format!(
                "mapping delay {} from timeline {} to timeline {} breaks lookahead",
                delay, src, dst.timeline
            )));
        }
        self.mappings[out.0 as usize].push(Mapping { dst, delay });
        Ok(())
    }

    pub(crate) fn mappings_of(&self, out: OutChannelId) -> &[Mapping] {
        &self.mappings[out.0 as usize]
    }

    /// The smallest cross-timeline mapping delay, which bounds the epoch
    /// window. `None` when no mapping crosses timelines.
    pub fn min_cross_delay(&self) -> Option<Ltime> {
        let mut min: Option<Ltime> = None;
        for (i, maps) in self.mappings.iter().enumerate() {
            let src = self.owners[i];
            for m in maps {
                if m.dst.timeline != src {
                    min = Some(min.map_or(m.delay, |v: Ltime| v.min(m.delay)));
                }
            }
        }
        min
    }
}

/// An activation in flight to another timeline. The insertion counter is
/// assigned by the receiving timeline when it drains its inbox, after
/// sorting by `(time, tie)`, so cross-thread arrival order cannot leak into
/// the schedule.
pub(crate) struct InboxEntry {
    pub time: Ltime,
    pub tie: u64,
    pub target: EventTarget,
    pub ac: Activation,
}

/// The linearization point for cross-timeline delivery: a mutex-protected
/// staging list per timeline.
pub(crate) struct Inbox {
    entries: Mutex<Vec<InboxEntry>>,
}

impl Inbox {
    pub fn new() -> Self {
        Inbox { entries: Mutex::new(Vec::new()) }
    }

    pub fn push(&self, entry: InboxEntry) {
        self.entries.lock().expect("poisoned inbox").push(entry);
    }

    pub fn drain(&self) -> Vec<InboxEntry> {
        let mut staged = self.entries.lock().expect("poisoned inbox");
        let mut out = std::mem::take(&mut *staged);
        drop(staged);
        out.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.tie.cmp(&b.tie)));
        out
    }
}
