//! The simulated protocol stack for the netloom engine.
//!
//! A network model is a hierarchy of hosts and subnets connected by links.
//! Inside each host runs a layered protocol stack: physical and MAC
//! sessions per interface, an IP session with a longest-prefix forwarding
//! table, TCP and UDP masters owning their sessions, and a socket layer
//! that bridges single-threaded application code onto the event loop with
//! continuations. Hosts bind to the engine's timelines; link delays become
//! the channel mapping delays that give the conservative scheduler its
//! lookahead.
//!
//! Build a model from a configuration tree with [`net::build`], then drive
//! it through the returned [`netloom::Engine`]:
//!
//! ```
//! use netloom::StopMode;
//! use netloom_stack::config::ModelConfig;
//!
//! let cfg = ModelConfig::from_json(
//!     r#"{
//!         "run_time": 1.0,
//!         "net": {
//!             "host": [
//!                 {"id": 0, "graph": [
//!                     {"name": "socket"}, {"name": "tcp"},
//!                     {"name": "udp"}, {"name": "ip"}
//!                 ],
//!                 "interface": [{"id": 0, "ip": "10.0.0.1"}]},
//!                 {"id": 1, "graph": [
//!                     {"name": "socket"}, {"name": "tcp"},
//!                     {"name": "udp"}, {"name": "ip"}
//!                 ],
//!                 "interface": [{"id": 0, "ip": "10.0.0.2"}]}
//!             ],
//!             "link": [{"prop_delay": 0.05, "attach": ["0(0)", "1(0)"]}]
//!         }
//!     }"#,
//! )
//! .unwrap();
//! let mut engine = netloom_stack::net::build(&cfg).unwrap();
//! engine.init_model();
//! let scale = engine.scale();
//! engine.advance(StopMode::BeforeTime, scale.d2t(1.0));
//! ```

pub mod app;
pub mod config;
pub mod fib;
pub mod host;
pub mod ip;
pub mod message;
pub mod model;
pub mod net;
pub mod nic;
pub mod queue;
pub mod red;
pub mod session;
pub mod socket;
pub mod tcp;
pub mod udp;

pub use fib::{ForwardingTable, RouteInfo, RoutingProtocol};
pub use host::Host;
pub use message::{DataChunk, DataMessage, NetMsg};
pub use model::StackModel;
pub use session::{ProtocolGraph, ProtocolNum, SessionKind};
pub use socket::{SocketMaster, SocketSignal};
pub use tcp::{TcpMaster, TcpSession, TcpState, TcpVersion};
pub use udp::UdpMaster;
