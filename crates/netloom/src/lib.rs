//! netloom is a conservative parallel discrete-event engine for network
//! simulation. Simulated time advances across N *timelines* (logical
//! processes, one OS thread each); each timeline owns a local event queue
//! and the model entities aligned to it. Cross-timeline event delivery is
//! only possible through *mapped channels* whose delay is at least the
//! receiving timeline's lookahead, which is what makes barrier-synchronized
//! epochs safe without rollback.
//!
//! The crate is model-agnostic: the simulated entities live behind the
//! [`TimelineModel`] trait, and activations are opaque [`Payload`] boxes.
//! The companion `netloom-stack` crate provides the layered protocol stack
//! (nic queues, IP, TCP, UDP, sockets) on top of this engine.
//!
//! ## Example usage
//! ```
//! use netloom::{
//!     Activation, ChannelMap, Engine, EventTarget, InChannelRef, ProcessKey,
//!     SchedContext, StopMode, TickScale, TimelineModel,
//! };
//!
//! // A trivial model: deliveries just count.
//! struct Counter {
//!     seen: u32,
//! }
//!
//! impl TimelineModel for Counter {
//!     fn init(&mut self, ctx: &mut SchedContext<'_>) {
//!         // schedule a first activation for ourselves at t=5
//!         let target = EventTarget { host: 0, process: ProcessKey(0) };
//!         ctx.schedule(target, Box::new(()), 5, 0);
//!     }
//!
//!     fn deliver(&mut self, _: EventTarget, _: Activation, _: &mut SchedContext<'_>) {
//!         self.seen += 1;
//!     }
//!
//!     fn as_any(&self) -> &dyn std::any::Any {
//!         self
//!     }
//!
//!     fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
//!         self
//!     }
//! }
//!
//! let mut engine = Engine::build_model(
//!     TickScale::new(0),
//!     vec![Box::new(Counter { seen: 0 })],
//!     ChannelMap::new(),
//! )
//! .unwrap();
//! engine.init_model();
//! engine.advance(StopMode::BeforeTime, 100);
//! let model = engine.model(0).as_any().downcast_ref::<Counter>().unwrap();
//! assert_eq!(model.seen, 1);
//! ```

pub mod addr;
pub mod channel;
pub mod config;
pub mod engine;
pub mod event;
pub mod rng;
pub mod time;
pub mod timeline;

mod error;

pub use addr::{IpAddr, IpPrefix, Mac48Addr, Nhi, NhiTag};
pub use channel::{ChannelMap, InChannelRef, OutChannelId};
pub use config::EngineConfig;
pub use engine::{Engine, StopCond, StopFn, StopMode};
pub use error::Error;
pub use event::{Activation, EventHandle, EventTarget, Payload, ProcessKey};
pub use rng::RngSource;
pub use time::{Ltime, TickScale};
pub use timeline::{Harness, SchedContext, TimelineModel};
