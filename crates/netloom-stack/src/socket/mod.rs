//! The socket layer: the descriptor table, the signal/mask coordination
//! that lets single-threaded application code block on network I/O inside
//! the non-blocking event loop, and both operation styles (continuation
//! stage machines in `blocking`, resume-point re-entry in `nonblocking`).

pub mod blocking;
pub mod nonblocking;

use std::collections::{BTreeSet, HashMap};

use log::{debug, warn};
use netloom::{IpAddr, SchedContext};

use crate::host::Host;
use crate::session::{CtrlMsg, ProtocolNum, SessionKind};
use crate::socket::blocking::BlockingOp;
use crate::socket::nonblocking::NbOp;

/// Socket signal flags.
pub mod signal {
    pub const CONN_RESET: u32 = 1;
    pub const DATA_AVAILABLE: u32 = 2;
    pub const OK_TO_SEND: u32 = 4;
    pub const CONN_CLOSED: u32 = 8;
    pub const SOCK_EOF: u32 = 16;
    pub const OK_TO_CLOSE: u32 = 32;
    pub const FIRST_CONNECTION: u32 = 64;
    pub const SESSION_RELEASED: u32 = 128;
    pub const CONNECT_ACTIVE: u32 = 256;
    pub const SOCK_DELETED: u32 = 0x1000_0000;
}

/// A signal raised on (or cleared from) a socket by a transport session.
#[derive(Debug, Clone, Copy)]
pub struct SocketSignal {
    pub sock: i32,
    pub signal: u32,
    pub nbytes: u32,
}

/// One socket descriptor.
pub(crate) struct Socket {
    /// The backing transport session, as (protocol, master-local id).
    pub session: Option<(ProtocolNum, usize)>,
    /// Signal bits currently raised.
    pub state: u32,
    /// Signal bits a suspended caller waits for.
    pub mask: u32,
    /// The suspended blocking operation, if any.
    pub continuation: Option<BlockingOp>,
    /// The suspended non-blocking operation, if any.
    pub nb_op: Option<NbOp>,
    /// Bytes transferred so far by the operation in flight.
    pub bytes_completed: u32,
    /// Pending activations; the socket may not be freed while positive.
    pub active_counter: i32,
    /// Resume-point bits (non-blocking only).
    pub resume: u8,
    died: bool,
}

impl Socket {
    fn new() -> Self {
        Socket {
            session: None,
            state: 0,
            mask: 0,
            continuation: None,
            nb_op: None,
            bytes_completed: 0,
            active_counter: 0,
            resume: 0,
            died: false,
        }
    }

    pub fn activate(&mut self) {
        self.active_counter += 1;
    }

    pub fn deactivate(&mut self) {
        self.active_counter -= 1;
    }

    pub fn is_active(&self) -> bool {
        self.active_counter > 0
    }

    /// Defer destruction until the last deactivate.
    pub fn die_slowly(&mut self) {
        self.died = true;
        self.state |= signal::SOCK_DELETED;
    }

    pub fn has_died(&self) -> bool {
        self.died
    }

    /// Back to a clean slate; the attached session survives.
    pub fn reinit(&mut self) {
        self.state = 0;
        self.mask = 0;
        self.bytes_completed = 0;
        self.resume = 0;
    }
}

/// The socket master session of one host.
pub struct SocketMaster {
    new_sockid: i32,
    pub(crate) bound: HashMap<i32, Socket>,
    unbound: BTreeSet<i32>,
}

impl Default for SocketMaster {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketMaster {
    pub fn new() -> Self {
        SocketMaster { new_sockid: 0, bound: HashMap::new(), unbound: BTreeSet::new() }
    }

    /// Allocate a descriptor: a monotonic wrap-around counter skipping
    /// live ids. Returns -1 when the space is exhausted.
    pub fn socket(&mut self) -> i32 {
        let mut wrapped = false;
        loop {
            self.new_sockid = self.new_sockid.wrapping_add(1);
            if self.new_sockid < 0 {
                self.new_sockid = 1; // start over from one
                if wrapped {
                    return -1;
                }
                wrapped = true;
            }
            if !self.bound.contains_key(&self.new_sockid)
                && !self.unbound.contains(&self.new_sockid)
            {
                break;
            }
        }
        self.unbound.insert(self.new_sockid);
        debug!("socket(): new descriptor {}", self.new_sockid);
        self.new_sockid
    }

    /// Bind a descriptor to a protocol by name: create a transport
    /// session and set its source endpoint.
    pub fn bind(
        &mut self,
        sock: i32,
        src_ip: IpAddr,
        src_port: u16,
        protocol: &str,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) -> bool {
        let Some(idx) = host.graph.index_by_name(protocol) else {
            debug!("bind(): protocol {protocol} not found on host {}", host.nhi);
            return false;
        };
        let num = host.graph.protocols()[idx];
        if self.bound.contains_key(&sock) || !self.unbound.contains(&sock) {
            return false;
        }

        let created = host.with_session(num, ctx, |s, _host, _ctx| {
            s.as_session_master().map(|m| {
                let id = m.create_session(sock);
                let ok = m.set_source(id, src_ip, src_port);
                if !ok {
                    m.release(id);
                }
                (id, ok)
            })
        });
        let Some(Some((id, true))) = created else { return false };

        let mut socket = Socket::new();
        socket.session = Some((num, id));
        self.unbound.remove(&sock);
        self.bound.insert(sock, socket);
        true
    }

    /// Passive open without the accept machinery (used by datagram-style
    /// callers).
    pub fn listen(&mut self, sock: i32, host: &mut Host, ctx: &mut SchedContext<'_>) -> bool {
        let Some((proto, id)) = self.bound.get(&sock).and_then(|s| s.session) else {
            return false;
        };
        if self.session_connected(proto, id, host) {
            return false;
        }
        self.with_master(proto, host, ctx, |m, h, c| m.listen(id, h, c)).unwrap_or(false)
    }

    pub fn connected(&self, sock: i32, host: &Host) -> Option<(IpAddr, u16)> {
        let (proto, id) = self.bound.get(&sock)?.session?;
        match host.graph.get(proto)? {
            SessionKind::Tcp(m) => m.session(id).filter(|s| s.connected()).map(|s| (s.dst_ip, s.dst_port)),
            SessionKind::Udp(m) => {
                m.session(id).filter(|s| s.connected()).map(|s| (s.dst_ip, s.dst_port))
            }
            _ => None,
        }
    }

    /// End-of-file: the peer closed and nothing is left to read. An
    /// unknown descriptor reads as EOF.
    pub fn eof(&self, sock: i32) -> bool {
        match self.bound.get(&sock) {
            Some(s) => {
                s.state & signal::SOCK_EOF != 0 && s.state & signal::DATA_AVAILABLE == 0
            }
            None => true,
        }
    }

    /// Hard-kill the connection.
    pub fn abort(&mut self, sock: i32, host: &mut Host, ctx: &mut SchedContext<'_>) {
        let Some(sk) = self.bound.get_mut(&sock) else { return };
        let session = sk.session;
        let active = sk.is_active();
        if let Some((proto, id)) = session {
            let _ = self.with_master(proto, host, ctx, |m, h, c| m.abort(id, h, c));
        }
        let sk = self.bound.get_mut(&sock).expect("socket exists");
        if active {
            sk.die_slowly();
        } else {
            self.release_socket(sock, host, ctx);
        }
    }

    /// Control entry: signal delivery from the transport sessions.
    pub fn control(&mut self, ctrl: CtrlMsg, host: &mut Host, ctx: &mut SchedContext<'_>) {
        match ctrl {
            CtrlMsg::SetSignal(sig) => self.set_signal(sig, host, ctx),
            CtrlMsg::ClearSignal(sig) => {
                if let Some(sk) = self.bound.get_mut(&sig.sock) {
                    sk.state &= !sig.signal;
                } else {
                    warn!("socket master: clear-signal for unknown socket {}", sig.sock);
                }
            }
            other => debug!("socket master: unexpected control {other:?}"),
        }
    }

    fn set_signal(&mut self, sig: SocketSignal, host: &mut Host, ctx: &mut SchedContext<'_>) {
        let Some(sk) = self.bound.get_mut(&sig.sock) else {
            warn!("socket master: signal for unknown socket {}", sig.sock);
            return;
        };
        debug!(
            "socket {}: signal {:#x} nbytes {} (state {:#x}, mask {:#x})",
            sig.sock, sig.signal, sig.nbytes, sk.state, sk.mask
        );

        if sig.signal & (signal::DATA_AVAILABLE | signal::OK_TO_SEND) != 0 {
            sk.bytes_completed += sig.nbytes;
        }

        // only bits the state does not already include can wake anyone
        if !sk.state & sig.signal != 0 {
            sk.state |= sig.signal;
            if sig.signal & sk.mask != 0 {
                // clear the data-available flag so the next receive has to
                // re-arm; the non-blocking path keeps it via resume state
                if sk.continuation.is_some() && sk.state & signal::DATA_AVAILABLE != 0 {
                    sk.state &= !signal::DATA_AVAILABLE;
                }
                if let Some(op) = sk.continuation.take() {
                    self.run_stage(op, host, ctx);
                } else if sk.nb_op.is_some() {
                    self.nb_resume(sig.sock, host, ctx);
                }
            }
        }
    }

    //
    // shared helpers
    //

    pub(crate) fn session_of(&self, sock: i32) -> Option<(ProtocolNum, usize)> {
        self.bound.get(&sock).and_then(|s| s.session)
    }

    pub(crate) fn session_connected(&self, proto: ProtocolNum, id: usize, host: &Host) -> bool {
        match host.graph.get(proto) {
            Some(SessionKind::Tcp(m)) => m.session(id).map(|s| s.connected()).unwrap_or(false),
            Some(SessionKind::Udp(m)) => m.session(id).map(|s| s.connected()).unwrap_or(false),
            _ => false,
        }
    }

    /// Whether data may move on this socket. Datagram sessions carry no
    /// established state, so a bound UDP socket is always ready.
    pub(crate) fn io_ready(&self, proto: ProtocolNum, id: usize, host: &Host) -> bool {
        proto == ProtocolNum::Udp || self.session_connected(proto, id, host)
    }

    /// Run a closure against the transport master backing a session.
    pub(crate) fn with_master<R>(
        &mut self,
        proto: ProtocolNum,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
        f: impl FnOnce(&mut dyn crate::session::SessionMaster, &mut Host, &mut SchedContext<'_>) -> R,
    ) -> Option<R> {
        host.with_session(proto, ctx, |s, h, c| s.as_session_master().map(|m| f(m, h, c)))
            .flatten()
    }

    /// Detach and reclaim the backing session, then drop the descriptor.
    pub(crate) fn release_socket(&mut self, sock: i32, host: &mut Host, ctx: &mut SchedContext<'_>) {
        if let Some(sk) = self.bound.get(&sock) {
            if let Some((proto, id)) = sk.session {
                let _ = self.with_master(proto, host, ctx, |m, _h, _c| m.release(id));
            }
        }
        self.bound.remove(&sock);
        debug!("socket {}: released", sock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_defers_death_while_active() {
        let mut s = Socket::new();
        s.activate();
        s.die_slowly();
        assert!(s.has_died());
        assert!(s.is_active(), "a socket with pending activations stays alive");
        s.deactivate();
        assert!(!s.is_active());
        assert!(s.state & signal::SOCK_DELETED != 0);
    }

    #[test]
    fn reinit_keeps_the_session() {
        let mut s = Socket::new();
        s.session = Some((ProtocolNum::Tcp, 3));
        s.state = signal::OK_TO_SEND | signal::DATA_AVAILABLE;
        s.mask = signal::CONN_RESET;
        s.bytes_completed = 42;
        s.reinit();
        assert_eq!(s.state, 0);
        assert_eq!(s.mask, 0);
        assert_eq!(s.bytes_completed, 0);
        assert_eq!(s.session, Some((ProtocolNum::Tcp, 3)));
    }

    #[test]
    fn descriptor_allocation_skips_live_ids() {
        let mut m = SocketMaster::new();
        let a = m.socket();
        let b = m.socket();
        assert!(a > 0 && b > 0 && a != b);
        // both stay reserved while unbound
        let c = m.socket();
        assert!(c != a && c != b);
    }
}
