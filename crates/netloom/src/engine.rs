//! The epoch driver. The engine owns one timeline per configured logical
//! process and advances them in barrier-synchronized epochs: each epoch
//! ends at `min(stop_before, clock + global_lookahead)`, so every event a
//! timeline executes is guaranteed not to be invalidated by a peer (the
//! conservative synchronization contract).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use log::debug;

use crate::channel::{ChannelMap, Inbox};
use crate::time::{Ltime, TickScale};
use crate::timeline::{SharedState, Timeline, TimelineModel};
use crate::Error;

/// How [`Engine::advance`] decides when to hand control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Simulate up to (but not past) the given time.
    BeforeTime,
    /// Additionally evaluate the engine's stop function at epoch
    /// boundaries.
    Function,
}

/// How per-timeline stop votes combine under [`StopMode::Function`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCond {
    OnAny,
    OnAll,
}

/// Per-timeline stop predicate: `(timeline index, local clock) -> stop?`.
pub type StopFn = dyn Fn(usize, Ltime) -> bool + Send + Sync;

/// The parallel simulation engine.
pub struct Engine {
    shared: Arc<SharedState>,
    timelines: Vec<Timeline>,
    clock: Ltime,
    lookahead: Option<Ltime>,
    stop_cond: StopCond,
    stop_fn: Option<Box<StopFn>>,
    initialized: bool,
}

impl Engine {
    /// Assemble an engine from the built model: one [`TimelineModel`] per
    /// timeline plus the channel mapping table. Fails if any mapping
    /// violates the lookahead contract (already rejected by
    /// [`ChannelMap::map`]) or if no timeline exists.
    pub fn build_model(
        scale: TickScale,
        models: Vec<Box<dyn TimelineModel>>,
        channels: ChannelMap,
    ) -> Result<Self, Error> {
        if models.is_empty() {
            return Err(Error::Config("at least one timeline is required".into()));
        }
        let n = models.len();
        let lookahead = channels.min_cross_delay();
        if n > 1 && lookahead.is_none() {
            debug!("build_model(): {n} timelines with no cross-timeline mappings");
        }
        let shared = Arc::new(SharedState {
            scale,
            channels,
            inboxes: (0..n).map(|_| Inbox::new()).collect(),
        });
        let timelines = models
            .into_iter()
            .enumerate()
            .map(|(i, m)| Timeline::new(i, m))
            .collect();
        Ok(Engine {
            shared,
            timelines,
            clock: 0,
            lookahead,
            stop_cond: StopCond::OnAny,
            stop_fn: None,
            initialized: false,
        })
    }

    /// Install the stop predicate used by [`StopMode::Function`]. Must be
    /// called before the simulation threads first spawn.
    pub fn set_stop_function(&mut self, cond: StopCond, f: Box<StopFn>) {
        assert!(!self.initialized, "stop function must be set before init_model");
        self.stop_cond = cond;
        self.stop_fn = Some(f);
    }

    /// Call every session's `init` in deterministic (timeline-index)
    /// traversal order.
    pub fn init_model(&mut self) {
        assert!(!self.initialized, "init_model called twice");
        for tl in &mut self.timelines {
            tl.init(&self.shared);
        }
        self.initialized = true;
    }

    /// The time to which the simulation has completely advanced.
    pub fn clock(&self) -> Ltime {
        self.clock
    }

    pub fn num_timelines(&self) -> usize {
        self.timelines.len()
    }

    pub fn scale(&self) -> TickScale {
        self.shared.scale
    }

    /// Direct read-only access to a timeline's model, for inspection
    /// between advances (e.g. by tests).
    pub fn model(&self, timeline: usize) -> &dyn TimelineModel {
        self.timelines[timeline].model.as_ref()
    }

    /// Mutable access to a timeline's model between advances.
    pub fn model_mut(&mut self, timeline: usize) -> &mut dyn TimelineModel {
        self.timelines[timeline].model.as_mut()
    }

    /// Simulate until the stop condition holds and return the simulated
    /// time reached.
    pub fn advance(&mut self, mode: StopMode, stop_before: Ltime) -> Ltime {
        assert!(self.initialized, "advance before init_model");
        assert!(stop_before >= self.clock);

        if self.timelines.len() == 1 {
            self.advance_single(mode, stop_before)
        } else {
            self.advance_parallel(mode, stop_before)
        }
    }

    /// One timeline needs neither threads nor barriers; the epoch window
    /// degenerates to the whole advance.
    fn advance_single(&mut self, mode: StopMode, stop_before: Ltime) -> Ltime {
        let Self { timelines, stop_fn, shared, .. } = self;
        let tl = &mut timelines[0];
        let stopped = match (mode, stop_fn.as_deref()) {
            (StopMode::Function, Some(f)) => {
                let mut stopped = false;
                while !stopped {
                    let Some(head) = tl.queue.peek_time() else { break };
                    if head >= stop_before {
                        break;
                    }
                    tl.run_epoch(head + 1, shared);
                    stopped = f(0, tl.now);
                }
                stopped
            }
            _ => {
                tl.run_epoch(stop_before, shared);
                false
            }
        };
        self.clock = if stopped { tl.now } else { stop_before };
        tl.now = tl.now.max(self.clock);
        debug!("advance(): single timeline reached {}", self.clock);
        self.clock
    }

    fn advance_parallel(&mut self, mode: StopMode, stop_before: Ltime) -> Ltime {
        let Self { timelines, stop_fn, shared, lookahead, stop_cond, .. } = self;
        let n = timelines.len();
        // with no cross-timeline traffic the window spans the whole advance
        let lookahead = lookahead.unwrap_or(stop_before - self.clock).max(1);
        let stop_cond = *stop_cond;

        let top = Barrier::new(n + 1);
        let bottom = Barrier::new(n + 1);
        let window = Barrier::new(n + 1);
        let epoch_end = AtomicI64::new(0);
        let done = AtomicBool::new(false);
        let stop_votes: Vec<AtomicBool> = (0..n).map(|_| AtomicBool::new(false)).collect();

        let shared = Arc::clone(shared);
        let stop_fn = stop_fn.as_deref();
        let use_stop = mode == StopMode::Function && stop_fn.is_some();
        let mut clock = self.clock;

        thread::scope(|s| {
            for tl in timelines.iter_mut() {
                let top = &top;
                let bottom = &bottom;
                let window = &window;
                let epoch_end = &epoch_end;
                let done = &done;
                let stop_votes = &stop_votes;
                let shared = &shared;
                s.spawn(move || loop {
                    top.wait();
                    let end = epoch_end.load(Ordering::SeqCst);
                    tl.run_epoch(end, shared);
                    if use_stop {
                        let vote = stop_fn.map(|f| f(tl.idx, tl.now)).unwrap_or(false);
                        stop_votes[tl.idx].store(vote, Ordering::SeqCst);
                    }
                    bottom.wait();
                    window.wait();
                    if done.load(Ordering::SeqCst) {
                        break;
                    }
                });
            }

            // the driver: release an epoch, wait for the timelines, check
            // the stop condition, loop or finish
            loop {
                let end = stop_before.min(clock.saturating_add(lookahead));
                epoch_end.store(end, Ordering::SeqCst);
                debug!("advance(): epoch [{clock}, {end})");
                top.wait();
                bottom.wait();
                clock = end;

                let stopped = use_stop
                    && match stop_cond {
                        StopCond::OnAny => {
                            stop_votes.iter().any(|v| v.load(Ordering::SeqCst))
                        }
                        StopCond::OnAll => {
                            stop_votes.iter().all(|v| v.load(Ordering::SeqCst))
                        }
                    };

                if stopped || clock >= stop_before {
                    done.store(true, Ordering::SeqCst);
                    window.wait();
                    break;
                }
                window.wait();
            }
        });

        self.clock = clock;
        debug!("advance(): parallel run reached {}", self.clock);
        self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InChannelRef;
    use crate::event::{Activation, EventTarget, ProcessKey};
    use crate::timeline::SchedContext;

    // a model that echoes every received counter back across a channel
    // until the counter runs out, recording each delivery time
    struct PingPong {
        out: crate::channel::OutChannelId,
        log: Vec<(Ltime, u32)>,
        start: Option<u32>,
    }

    impl TimelineModel for PingPong {
        fn init(&mut self, ctx: &mut SchedContext<'_>) {
            if let Some(v) = self.start {
                ctx.write(self.out, Box::new(v), 0, 0);
            }
        }

        fn deliver(&mut self, _t: EventTarget, ac: Activation, ctx: &mut SchedContext<'_>) {
            let v = *ac.as_any().downcast_ref::<u32>().unwrap();
            self.log.push((ctx.now(), v));
            if v > 0 {
                ctx.write(self.out, Box::new(v - 1), 0, 0);
            }
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    fn build_pair(count: u32) -> Engine {
        let mut channels = ChannelMap::new();
        let out0 = channels.new_out_channel(0);
        let out1 = channels.new_out_channel(1);
        let t = |tl: usize| InChannelRef {
            timeline: tl,
            target: EventTarget { host: 0, process: ProcessKey(0) },
        };
        channels.map(out0, t(1), 10).unwrap();
        channels.map(out1, t(0), 10).unwrap();
        let a = Box::new(PingPong { out: out0, log: Vec::new(), start: Some(count) });
        let b = Box::new(PingPong { out: out1, log: Vec::new(), start: None });
        Engine::build_model(TickScale::new(0), vec![a, b], channels).unwrap()
    }

    #[test]
    fn ping_pong_across_timelines() {
        let mut engine = build_pair(5);
        engine.init_model();
        let reached = engine.advance(StopMode::BeforeTime, 1000);
        assert_eq!(reached, 1000);

        // counters 5,3,1 land on timeline 1; 4,2,0 on timeline 0, each hop
        // 10 ticks (the mapping delay) after the previous one
        let log1 = &engine.model(1).as_any().downcast_ref::<PingPong>().unwrap().log;
        assert_eq!(*log1, vec![(10, 5), (30, 3), (50, 1)]);
        let log0 = &engine.model(0).as_any().downcast_ref::<PingPong>().unwrap().log;
        assert_eq!(*log0, vec![(20, 4), (40, 2), (60, 0)]);
    }

    #[test]
    fn advance_is_resumable() {
        let mut engine = build_pair(3);
        engine.init_model();
        assert_eq!(engine.advance(StopMode::BeforeTime, 15), 15);
        assert_eq!(engine.advance(StopMode::BeforeTime, 100), 100);
    }

    #[test]
    #[should_panic(expected = "advance before init_model")]
    fn advance_requires_init() {
        let mut engine = build_pair(1);
        engine.advance(StopMode::BeforeTime, 10);
    }
}
