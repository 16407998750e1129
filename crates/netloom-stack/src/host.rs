//! A simulated host: the protocol graph, the network interfaces, the
//! forwarding table, and the op-queue dispatcher that moves traffic
//! between layers.

use std::collections::VecDeque;

use log::{debug, warn};
use netloom::event::ProcessKey;
use netloom::{Activation, EventTarget, Nhi, SchedContext};
use rand_xoshiro::Xoshiro256StarStar;

use crate::fib::{AddRouteResult, ForwardingTable, RemoveRouteResult, RouteInfo};
use crate::message::NetMsg;
use crate::nic::{NetworkInterface, RxFrame};
use crate::session::{CtrlMsg, ProtocolGraph, ProtocolNum, SessionKind, StackOp};
use crate::socket::SocketSignal;

/// Process keys within a host. Keys below `PROC_TCP_SLOW` are interface
/// in-channel indices.
pub(crate) const PROC_TCP_SLOW: u32 = 0x1000;
pub(crate) const PROC_TCP_FAST: u32 = 0x1001;
pub(crate) const PROC_APP_START: u32 = 0x2000;

/// Derive the host's tie-breaking seed from its hierarchical ids, so
/// replays order same-time events identically.
pub fn tie_seed_from_ids(ids: &[u32]) -> u64 {
    ids.iter().fold(0u64, |acc, id| acc * 100_000 + *id as u64)
}

pub struct Host {
    pub nhi: Nhi,
    pub ids: Vec<u32>,
    pub tie_seed: u64,
    pub timeline: usize,
    /// Index of this host within its timeline (the event-target host id).
    pub index: usize,
    pub rng: Xoshiro256StarStar,
    pub ifaces: Vec<NetworkInterface>,
    pub fib: ForwardingTable,
    pub graph: ProtocolGraph,
    ops: VecDeque<StackOp>,
}

impl Host {
    pub fn new(
        nhi: Nhi,
        ids: Vec<u32>,
        timeline: usize,
        index: usize,
        rng: Xoshiro256StarStar,
    ) -> Self {
        let tie_seed = tie_seed_from_ids(&ids);
        Host {
            nhi,
            ids,
            tie_seed,
            timeline,
            index,
            rng,
            ifaces: Vec::new(),
            fib: ForwardingTable::new(),
            graph: ProtocolGraph::new(),
            ops: VecDeque::new(),
        }
    }

    /// Initialize every session, bottom-up in registration order, and
    /// kick the applications at time zero.
    pub fn init(&mut self, ctx: &mut SchedContext<'_>) {
        let mut has_app = false;
        for idx in 0..self.graph.protocols().len() {
            let mut session = self.graph.take(idx);
            match &mut session {
                SessionKind::Tcp(m) => m.init(self, ctx),
                SessionKind::App(_) => has_app = true,
                _ => {}
            }
            self.graph.put_back(idx, session);
        }
        if has_app {
            ctx.schedule(
                EventTarget { host: self.index, process: ProcessKey(PROC_APP_START) },
                Box::new(()),
                0,
                self.tie_seed,
            );
        }
        self.run_ops(ctx);
    }

    /// Enqueue an op for dispatch; it runs when the current dispatch loop
    /// reaches it (or when `run_ops` is next entered).
    pub fn push_op(&mut self, op: StackOp) {
        self.ops.push_back(op);
    }

    /// Pull the queued ops out without dispatching them, so tests can
    /// observe and route a session's raw output by hand.
    #[cfg(test)]
    pub(crate) fn drain_ops(&mut self) -> Vec<StackOp> {
        self.ops.drain(..).collect()
    }

    /// Raise signal bits on a socket.
    pub fn signal_socket(&mut self, sig: SocketSignal) {
        self.push_op(StackOp::Control { to: ProtocolNum::Socket, ctrl: CtrlMsg::SetSignal(sig) });
    }

    /// Clear signal bits on a socket.
    pub fn clear_socket_signal(&mut self, sig: SocketSignal) {
        self.push_op(StackOp::Control {
            to: ProtocolNum::Socket,
            ctrl: CtrlMsg::ClearSignal(sig),
        });
    }

    /// Notify an application that a socket operation completed.
    pub fn app_done(&mut self, app: ProtocolNum, token: u64, ok: bool, retval: i32, data: Vec<u8>) {
        self.push_op(StackOp::Control { to: app, ctrl: CtrlMsg::AppDone { token, ok, retval, data } });
    }

    /// Drain the op queue, dispatching each op to its target session.
    pub fn run_ops(&mut self, ctx: &mut SchedContext<'_>) {
        while let Some(op) = self.ops.pop_front() {
            let target = op.target();
            let Some(idx) = self.graph.index_by_num(target) else {
                warn!("host {}: no session for {:?}, op dropped", self.nhi, target);
                continue;
            };
            let mut session = self.graph.take(idx);
            session.handle_op(op, self, ctx);
            self.graph.put_back(idx, session);
        }
    }

    /// Run a closure against one session with the rest of the host still
    /// reachable; used for synchronous cross-session calls (socket layer
    /// driving a transport session). Returns `None` if the protocol is not
    /// on this host.
    pub fn with_session<R>(
        &mut self,
        num: ProtocolNum,
        ctx: &mut SchedContext<'_>,
        f: impl FnOnce(&mut SessionKind, &mut Host, &mut SchedContext<'_>) -> R,
    ) -> Option<R> {
        let idx = self.graph.index_by_num(num)?;
        let mut session = self.graph.take(idx);
        let r = f(&mut session, self, ctx);
        self.graph.put_back(idx, session);
        Some(r)
    }

    /// Hand an IP chain to an interface for transmission toward
    /// `next_hop`. The nic queue decides the departure time (or drops).
    pub fn transmit(
        &mut self,
        iface: u32,
        next_hop: netloom::IpAddr,
        msg: NetMsg,
        ctx: &mut SchedContext<'_>,
    ) {
        let tie = self.tie_seed;
        match self.ifaces.get_mut(iface as usize) {
            Some(ifc) => ifc.transmit(next_hop, msg, tie, ctx),
            None => warn!("host {}: transmit on unknown interface {}", self.nhi, iface),
        }
    }

    /// An activation arrived for this host; route it by process key.
    pub(crate) fn handle_activation(
        &mut self,
        process: ProcessKey,
        ac: Activation,
        ctx: &mut SchedContext<'_>,
    ) {
        match process.0 {
            PROC_TCP_SLOW => {
                self.push_op(StackOp::Control {
                    to: ProtocolNum::Tcp,
                    ctrl: CtrlMsg::TcpSlowTimer,
                });
            }
            PROC_TCP_FAST => {
                self.push_op(StackOp::Control {
                    to: ProtocolNum::Tcp,
                    ctrl: CtrlMsg::TcpFastTimer,
                });
            }
            PROC_APP_START => {
                self.start_apps(ctx);
            }
            iface => match ac.into_any().downcast::<RxFrame>() {
                Ok(frame) => self.receive_frame(iface, frame.msg),
                Err(_) => warn!("host {}: non-frame activation on interface key", self.nhi),
            },
        }
        self.run_ops(ctx);
    }

    /// A frame arrived on an interface: run it up through PHY and MAC and
    /// hand the network-layer payload to IP.
    fn receive_frame(&mut self, iface: u32, frame: NetMsg) {
        let Some(ifc) = self.ifaces.get_mut(iface as usize) else {
            warn!("host {}: frame on unknown interface {}", self.nhi, iface);
            return;
        };
        let Some(msg) = ifc.receive(frame) else {
            return; // not addressed to us
        };
        debug!("host {}: iface {} rx {} bytes", self.nhi, iface, msg.total_real_bytes());
        self.push_op(StackOp::Pop {
            to: ProtocolNum::Ipv4,
            msg,
            info: crate::session::PopInfo {
                src_ip: netloom::IpAddr::ANY,
                dst_ip: netloom::IpAddr::ANY,
                ttl: 0,
                iface,
            },
        });
    }

    /// Kick every application session once at boot.
    fn start_apps(&mut self, ctx: &mut SchedContext<'_>) {
        let apps: Vec<usize> = self
            .graph
            .protocols()
            .iter()
            .enumerate()
            .filter(|(_, p)| matches!(p, ProtocolNum::App(_)))
            .map(|(i, _)| i)
            .collect();
        for idx in apps {
            let mut session = self.graph.take(idx);
            if let SessionKind::App(app) = &mut session {
                app.start(self, ctx);
            }
            self.graph.put_back(idx, session);
        }
    }

    /// The interface whose address is `a`, if any; used by IP for the
    /// deliver-local check.
    pub fn iface_with_addr(&self, a: netloom::IpAddr) -> Option<u32> {
        self.ifaces.iter().position(|i| i.ip == a).map(|i| i as u32)
    }

    /// Install a route and tell every FIB listener about it.
    pub fn add_route(&mut self, route: RouteInfo, replace: bool) -> AddRouteResult {
        let result = self.fib.add_route(route.clone(), replace);
        if result != AddRouteResult::NotReplaced {
            for listener in self.fib.listeners().to_vec() {
                self.push_op(StackOp::Control {
                    to: listener,
                    ctrl: CtrlMsg::FibRouteAdded(route.clone()),
                });
            }
        }
        result
    }

    /// Remove a route and tell every FIB listener about it.
    pub fn remove_route(&mut self, route: &RouteInfo) -> RemoveRouteResult {
        let result = self.fib.remove_route(route);
        if result == RemoveRouteResult::Success {
            for listener in self.fib.listeners().to_vec() {
                self.push_op(StackOp::Control {
                    to: listener,
                    ctrl: CtrlMsg::FibRouteDeleted(route.clone()),
                });
            }
        }
        result
    }
}
