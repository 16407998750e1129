//! The protocol-session abstraction: the tagged wrapper over the
//! well-known sessions, the per-host protocol graph, and the op queue that
//! carries push/pop/control traffic between layers.
//!
//! Layers never hold references to each other. A session that wants to talk
//! to a neighbor enqueues a [`StackOp`] on its host; the host dispatcher
//! takes the target session out of the graph, hands it the op together with
//! mutable access to the rest of the host, and puts it back. Synchronous
//! calls (the socket layer driving a TCP session) use the same take-out
//! dance through [`ProtocolGraph::take`].

use netloom::{IpAddr, SchedContext};

use crate::app::AppSession;
use crate::fib::RouteInfo;
use crate::host::Host;
use crate::ip::IpSession;
use crate::message::NetMsg;
use crate::socket::{SocketMaster, SocketSignal};
use crate::tcp::TcpMaster;
use crate::udp::UdpMaster;

/// Protocol numbers, shared by sessions and the messages they emit. The
/// well-known values match their IANA numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolNum {
    Invalid,
    Icmp,
    Ipv4,
    Tcp,
    Udp,
    SimpleMac,
    SimplePhy,
    Socket,
    App(u8),
}

impl ProtocolNum {
    pub fn number(&self) -> u32 {
        match self {
            ProtocolNum::Invalid => 0,
            ProtocolNum::Icmp => 1,
            ProtocolNum::Ipv4 => 4,
            ProtocolNum::Tcp => 6,
            ProtocolNum::Udp => 17,
            ProtocolNum::SimpleMac => 200,
            ProtocolNum::SimplePhy => 201,
            ProtocolNum::Socket => 202,
            ProtocolNum::App(n) => 210 + *n as u32,
        }
    }
}

/// Extra information travelling downward with a push into the IP layer.
#[derive(Debug, Clone, Copy)]
pub struct PushInfo {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: ProtocolNum,
    pub ttl: u8,
}

/// Extra information travelling upward with a pop out of a lower layer.
#[derive(Debug, Clone, Copy)]
pub struct PopInfo {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub ttl: u8,
    pub iface: u32,
}

/// A control message routed to a session through the op queue.
#[derive(Debug)]
pub enum CtrlMsg {
    /// Raise socket signal bits; delivered to the socket master.
    SetSignal(SocketSignal),
    /// Clear socket signal bits.
    ClearSignal(SocketSignal),
    /// The TCP slow timer fired.
    TcpSlowTimer,
    /// The TCP fast timer fired.
    TcpFastTimer,
    /// A route appeared in the forwarding table.
    FibRouteAdded(RouteInfo),
    /// A route left the forwarding table.
    FibRouteDeleted(RouteInfo),
    /// A socket operation completed for the application that issued it.
    AppDone { token: u64, ok: bool, retval: i32, data: Vec<u8> },
}

/// One unit of intra-host layer traffic.
#[derive(Debug)]
pub enum StackOp {
    /// Downward traversal (toward the wire).
    Push { to: ProtocolNum, msg: NetMsg, info: PushInfo },
    /// Upward traversal (toward the application).
    Pop { to: ProtocolNum, msg: NetMsg, info: PopInfo },
    /// Out-of-band control.
    Control { to: ProtocolNum, ctrl: CtrlMsg },
}

impl StackOp {
    pub fn target(&self) -> ProtocolNum {
        match self {
            StackOp::Push { to, .. } | StackOp::Pop { to, .. } | StackOp::Control { to, .. } => *to,
        }
    }
}

/// Uniform interface the socket layer uses to drive a transport session,
/// implemented by the TCP and UDP masters. Session ids are master-local.
pub trait SessionMaster {
    fn create_session(&mut self, sock: i32) -> usize;
    fn set_source(&mut self, id: usize, ip: IpAddr, port: u16) -> bool;
    fn connect(
        &mut self,
        id: usize,
        ip: IpAddr,
        port: u16,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) -> bool;
    fn listen(&mut self, id: usize, host: &mut Host, ctx: &mut SchedContext<'_>) -> bool;
    /// Accept bytes for transmission; returns how many were taken in, or
    /// -1 on error.
    fn send(
        &mut self,
        id: usize,
        length: u32,
        data: Option<Vec<u8>>,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) -> i64;
    /// Receive up to `length` bytes; returns how many are immediately
    /// available, or -1 on error.
    fn recv(&mut self, id: usize, length: u32, host: &mut Host, ctx: &mut SchedContext<'_>) -> i64;
    fn disconnect(&mut self, id: usize, host: &mut Host, ctx: &mut SchedContext<'_>);
    fn abort(&mut self, id: usize, host: &mut Host, ctx: &mut SchedContext<'_>);
    fn connected(&self, id: usize) -> bool;
    /// Release the session once the socket layer is done with it.
    fn release(&mut self, id: usize);
    fn set_socket(&mut self, id: usize, sock: i32);
    /// Take the bytes accumulated for the application since the last call.
    fn take_received(&mut self, id: usize) -> Vec<u8>;
    fn dst_endpoint(&self, id: usize) -> Option<(IpAddr, u16)>;
}

/// The tagged wrapper over the well-known sessions. User-defined
/// application sessions ride in the `App` variant behind a trait object.
pub enum SessionKind {
    Ip(IpSession),
    Tcp(TcpMaster),
    Udp(UdpMaster),
    Socket(SocketMaster),
    App(Box<dyn AppSession>),
}

impl SessionKind {
    pub fn protocol(&self) -> ProtocolNum {
        match self {
            SessionKind::Ip(_) => ProtocolNum::Ipv4,
            SessionKind::Tcp(_) => ProtocolNum::Tcp,
            SessionKind::Udp(_) => ProtocolNum::Udp,
            SessionKind::Socket(_) => ProtocolNum::Socket,
            SessionKind::App(a) => a.protocol(),
        }
    }

    pub fn as_session_master(&mut self) -> Option<&mut dyn SessionMaster> {
        match self {
            SessionKind::Tcp(m) => Some(m),
            SessionKind::Udp(m) => Some(m),
            _ => None,
        }
    }

    /// Dispatch one op. `self` has been taken out of the host's graph, so
    /// the session is free to reach back into `host` (other sessions,
    /// interfaces, the forwarding table) without aliasing.
    pub fn handle_op(&mut self, op: StackOp, host: &mut Host, ctx: &mut SchedContext<'_>) {
        match (self, op) {
            (SessionKind::Ip(ip), StackOp::Push { msg, info, .. }) => {
                ip.push(msg, info, host, ctx);
            }
            (SessionKind::Ip(ip), StackOp::Pop { msg, info, .. }) => {
                ip.pop(msg, info, host, ctx);
            }
            (SessionKind::Tcp(tcp), StackOp::Pop { msg, info, .. }) => {
                tcp.pop(msg, info, host, ctx);
            }
            (SessionKind::Tcp(tcp), StackOp::Control { ctrl, .. }) => {
                tcp.control(ctrl, host, ctx);
            }
            (SessionKind::Udp(udp), StackOp::Pop { msg, info, .. }) => {
                udp.pop(msg, info, host, ctx);
            }
            (SessionKind::Socket(sock), StackOp::Control { ctrl, .. }) => {
                sock.control(ctrl, host, ctx);
            }
            (SessionKind::App(app), StackOp::Control { ctrl, .. }) => {
                if let CtrlMsg::AppDone { token, ok, retval, data } = ctrl {
                    app.done(token, ok, retval, data, host, ctx);
                }
            }
            (this, op) => {
                log::warn!(
                    "session {:?} dropped unexpected op for {:?}",
                    this.protocol(),
                    op.target()
                );
            }
        }
    }
}

/// The ordered stack of protocol sessions of one host, indexed by name and
/// by protocol number.
pub struct ProtocolGraph {
    slots: Vec<Option<SessionKind>>,
    order: Vec<ProtocolNum>,
    by_name: std::collections::HashMap<String, usize>,
    by_num: std::collections::HashMap<ProtocolNum, usize>,
}

impl Default for ProtocolGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolGraph {
    pub fn new() -> Self {
        ProtocolGraph {
            slots: Vec::new(),
            order: Vec::new(),
            by_name: std::collections::HashMap::new(),
            by_num: std::collections::HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, session: SessionKind) -> Result<(), netloom::Error> {
        let num = session.protocol();
        if self.by_name.contains_key(name) || self.by_num.contains_key(&num) {
            return Err(netloom::Error::DuplicateProtocol(format!(
                "session \"{name}\" ({num:?}) registered twice"
            )));
        }
        let idx = self.slots.len();
        self.slots.push(Some(session));
        self.order.push(num);
        self.by_name.insert(name.to_string(), idx);
        self.by_num.insert(num, idx);
        Ok(())
    }

    pub fn index_by_num(&self, num: ProtocolNum) -> Option<usize> {
        self.by_num.get(&num).copied()
    }

    pub fn index_by_name(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Protocol numbers in registration order; used for deterministic init
    /// traversal.
    pub fn protocols(&self) -> &[ProtocolNum] {
        &self.order
    }

    /// Take a session out of its slot for dispatch. Panics if the slot is
    /// already vacant, which would mean re-entrant dispatch to the same
    /// session without going through the op queue.
    pub fn take(&mut self, idx: usize) -> SessionKind {
        self.slots[idx].take().expect("session already taken")
    }

    pub fn put_back(&mut self, idx: usize, session: SessionKind) {
        debug_assert!(self.slots[idx].is_none());
        self.slots[idx] = Some(session);
    }

    /// Borrow a session in place (no dispatch, inspection only).
    pub fn get(&self, num: ProtocolNum) -> Option<&SessionKind> {
        self.index_by_num(num).and_then(|i| self.slots[i].as_ref())
    }

    pub fn get_mut(&mut self, num: ProtocolNum) -> Option<&mut SessionKind> {
        self.index_by_num(num).and_then(|i| self.slots[i].as_mut())
    }
}
