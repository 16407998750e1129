//! Non-blocking socket operations. Where a blocking call would park a
//! continuation, these record a resume point in the socket and return
//! [`SocketCode::WouldBlock`]; the signal handler re-enters the recorded
//! point and reports completion to the application.

use log::debug;
use netloom::{IpAddr, SchedContext};

use crate::host::Host;
use crate::session::ProtocolNum;
use crate::socket::{signal, SocketMaster};

/// Return codes of the non-blocking API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketCode {
    Success,
    WouldBlock,
    /// The socket is already connected.
    Connected,
    Generic,
}

/// Resume-point bits recorded in `Socket::resume`.
pub(crate) mod resume {
    pub const ACCEPT1: u8 = 0x01;
    pub const ACCEPT2: u8 = 0x02;
    pub const MAKENEW: u8 = 0x04;
    pub const SEND1: u8 = 0x08;
    pub const CONNECT1: u8 = 0x10;
    pub const RECV1: u8 = 0x20;
    pub const CLOSE1: u8 = 0x40;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NbKind {
    Connect,
    Accept,
    Send,
    Recv,
    Close,
}

/// A suspended non-blocking operation.
#[derive(Debug)]
pub(crate) struct NbOp {
    pub sock: i32,
    pub kind: NbKind,
    pub token: u64,
    pub app: ProtocolNum,
    pub make_new: bool,
    /// The mask of the stage that blocked; multi-stage operations need it
    /// across resumes because `block_till` clears the socket's mask.
    pub premask: u32,
    pub length: u32,
}

/// Synchronous outcome of a non-blocking call.
#[derive(Debug)]
pub struct NbResult {
    pub code: SocketCode,
    pub retval: i32,
    pub data: Vec<u8>,
}

impl NbResult {
    fn code(code: SocketCode) -> Self {
        NbResult { code, retval: -1, data: Vec::new() }
    }

    fn ok(retval: i32) -> Self {
        NbResult { code: SocketCode::Success, retval, data: Vec::new() }
    }
}

impl SocketMaster {
    /// Record a resume point instead of blocking. Returns true when the
    /// state already satisfies the mask and the caller may proceed.
    fn block_till_nb(&mut self, sock: i32, mask: u32, bit: u8) -> bool {
        let Some(sk) = self.bound.get_mut(&sock) else { return false };
        if sk.state & mask != 0 {
            return true;
        }
        sk.mask = mask & !sk.state;
        sk.resume |= bit;
        sk.activate();
        debug!("socket {sock}: nb suspend (mask {:#x}, resume {:#x})", sk.mask, sk.resume);
        false
    }

    pub fn nb_connect(
        &mut self,
        sock: i32,
        ip: IpAddr,
        port: u16,
        token: u64,
        app: ProtocolNum,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) -> NbResult {
        let Some((proto, id)) = self.session_of(sock) else {
            return NbResult::code(SocketCode::Generic);
        };
        if self.session_connected(proto, id, host) {
            return NbResult::code(SocketCode::Connected);
        }
        if self.bound.get(&sock).map(|s| s.state & signal::CONNECT_ACTIVE != 0).unwrap_or(true) {
            return NbResult::code(SocketCode::Generic);
        }
        if !self
            .with_master(proto, host, ctx, |m, h, c| m.connect(id, ip, port, h, c))
            .unwrap_or(false)
        {
            return NbResult::code(SocketCode::Generic);
        }
        self.bound.get_mut(&sock).expect("bound socket").state |= signal::CONNECT_ACTIVE;

        if self.block_till_nb(sock, signal::OK_TO_SEND | signal::CONN_RESET, resume::CONNECT1) {
            self.finish_connect(sock)
        } else {
            self.park(NbOp {
                sock,
                kind: NbKind::Connect,
                token,
                app,
                make_new: false,
                premask: signal::OK_TO_SEND | signal::CONN_RESET,
                length: 0,
            });
            NbResult::code(SocketCode::WouldBlock)
        }
    }

    pub fn nb_accept(
        &mut self,
        sock: i32,
        make_new_socket: bool,
        token: u64,
        app: ProtocolNum,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) -> NbResult {
        let Some((proto, id)) = self.session_of(sock) else {
            return NbResult::code(SocketCode::Generic);
        };
        if self.session_connected(proto, id, host) {
            return NbResult::code(SocketCode::Connected);
        }
        if self.bound.get(&sock).map(|s| s.state & signal::CONNECT_ACTIVE != 0).unwrap_or(true) {
            return NbResult::code(SocketCode::Generic);
        }
        if !self.with_master(proto, host, ctx, |m, h, c| m.listen(id, h, c)).unwrap_or(false) {
            return NbResult::code(SocketCode::Generic);
        }
        self.bound.get_mut(&sock).expect("bound socket").state |= signal::CONNECT_ACTIVE;

        if self.block_till_nb(sock, signal::FIRST_CONNECTION | signal::CONN_RESET, resume::ACCEPT1)
        {
            self.accept_stage2(sock, make_new_socket, token, app, host, ctx)
        } else {
            self.park(NbOp {
                sock,
                kind: NbKind::Accept,
                token,
                app,
                make_new: make_new_socket,
                premask: signal::FIRST_CONNECTION | signal::CONN_RESET,
                length: 0,
            });
            NbResult::code(SocketCode::WouldBlock)
        }
    }

    fn accept_stage2(
        &mut self,
        sock: i32,
        make_new_socket: bool,
        token: u64,
        app: ProtocolNum,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) -> NbResult {
        {
            let sk = self.bound.get_mut(&sock).expect("bound socket");
            sk.state &= !signal::CONNECT_ACTIVE;
            if sk.state & signal::CONN_RESET != 0 {
                sk.reinit();
                return NbResult::code(SocketCode::Generic);
            }
            sk.state |= signal::CONNECT_ACTIVE;
        }

        if self.block_till_nb(sock, signal::OK_TO_SEND | signal::CONN_RESET, resume::ACCEPT2) {
            self.finish_accept(sock, make_new_socket, host, ctx)
        } else {
            self.park(NbOp {
                sock,
                kind: NbKind::Accept,
                token,
                app,
                make_new: make_new_socket,
                premask: signal::OK_TO_SEND | signal::CONN_RESET,
                length: 0,
            });
            NbResult::code(SocketCode::WouldBlock)
        }
    }

    fn finish_accept(
        &mut self,
        sock: i32,
        make_new_socket: bool,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) -> NbResult {
        {
            let sk = self.bound.get_mut(&sock).expect("bound socket");
            sk.state &= !signal::CONNECT_ACTIVE;
            if sk.state & signal::CONN_RESET != 0 {
                sk.reinit();
                return NbResult::code(SocketCode::Generic);
            }
        }
        if make_new_socket {
            let sk = self.bound.get_mut(&sock).expect("bound socket");
            sk.resume |= resume::MAKENEW;
            let moved = self.transfer_to_new_socket(sock, host, ctx);
            if let Some(sk) = self.bound.get_mut(&sock) {
                sk.resume &= !resume::MAKENEW;
            }
            match moved {
                Some(new_sock) => NbResult::ok(new_sock),
                None => NbResult::code(SocketCode::Generic),
            }
        } else {
            NbResult::ok(sock)
        }
    }

    pub fn nb_send(
        &mut self,
        sock: i32,
        length: u32,
        data: Option<Vec<u8>>,
        token: u64,
        app: ProtocolNum,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) -> NbResult {
        let Some((proto, id)) = self.session_of(sock) else {
            return NbResult::code(SocketCode::Generic);
        };
        if !self.io_ready(proto, id, host) {
            return NbResult::code(SocketCode::Generic);
        }
        let accepted = self
            .with_master(proto, host, ctx, |m, h, c| m.send(id, length, data, h, c))
            .unwrap_or(-1);
        if accepted < 0 {
            return NbResult::code(SocketCode::Generic);
        }
        let sk = self.bound.get_mut(&sock).expect("bound socket");
        sk.bytes_completed = accepted as u32;

        if (accepted as u32) < length {
            // a full buffer must re-arm on freed space only
            sk.state &= !signal::OK_TO_SEND;
            if self.block_till_nb(sock, signal::OK_TO_SEND | signal::CONN_RESET, resume::SEND1) {
                self.finish_send(sock)
            } else {
                self.park(NbOp {
                    sock,
                    kind: NbKind::Send,
                    token,
                    app,
                    make_new: false,
                    premask: signal::OK_TO_SEND | signal::CONN_RESET,
                    length,
                });
                NbResult::code(SocketCode::WouldBlock)
            }
        } else {
            NbResult::ok(length as i32)
        }
    }

    pub fn nb_recv(
        &mut self,
        sock: i32,
        length: u32,
        token: u64,
        app: ProtocolNum,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) -> NbResult {
        let Some((proto, id)) = self.session_of(sock) else {
            return NbResult::code(SocketCode::Generic);
        };
        if !self.io_ready(proto, id, host) {
            return NbResult::code(SocketCode::Generic);
        }
        let got = self
            .with_master(proto, host, ctx, |m, h, c| m.recv(id, length, h, c))
            .unwrap_or(-1);
        if got < 0 {
            return NbResult::code(SocketCode::Generic);
        }
        let sk = self.bound.get_mut(&sock).expect("bound socket");
        sk.bytes_completed = got as u32;

        if (got as u32) < length {
            // an exhausted buffer must re-arm on fresh data only
            sk.state &= !signal::DATA_AVAILABLE;
            if self.block_till_nb(
                sock,
                signal::SOCK_EOF | signal::DATA_AVAILABLE | signal::CONN_RESET,
                resume::RECV1,
            ) {
                self.finish_recv(sock, host, ctx)
            } else {
                self.park(NbOp {
                    sock,
                    kind: NbKind::Recv,
                    token,
                    app,
                    make_new: false,
                    premask: signal::SOCK_EOF | signal::DATA_AVAILABLE | signal::CONN_RESET,
                    length,
                });
                NbResult::code(SocketCode::WouldBlock)
            }
        } else {
            let data = self
                .with_master(proto, host, ctx, |m, _h, _c| m.take_received(id))
                .unwrap_or_default();
            NbResult { code: SocketCode::Success, retval: length as i32, data }
        }
    }

    pub fn nb_close(
        &mut self,
        sock: i32,
        token: u64,
        app: ProtocolNum,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) -> NbResult {
        if !self.bound.contains_key(&sock) {
            return NbResult::code(SocketCode::Generic);
        }
        let session = self.session_of(sock);
        let connected = session
            .map(|(proto, id)| self.session_connected(proto, id, host))
            .unwrap_or(false);

        if connected {
            let (proto, id) = session.expect("connected session");
            let _ = self.with_master(proto, host, ctx, |m, h, c| m.disconnect(id, h, c));
            if self.block_till_nb(
                sock,
                signal::CONN_RESET | signal::CONN_CLOSED | signal::SESSION_RELEASED,
                resume::CLOSE1,
            ) {
                self.finish_close(sock, host, ctx)
            } else {
                self.park(NbOp {
                    sock,
                    kind: NbKind::Close,
                    token,
                    app,
                    make_new: false,
                    premask: signal::CONN_RESET
                        | signal::CONN_CLOSED
                        | signal::SESSION_RELEASED,
                    length: 0,
                });
                NbResult::code(SocketCode::WouldBlock)
            }
        } else {
            let sk = self.bound.get_mut(&sock).expect("bound socket");
            sk.reinit();
            if sk.is_active() {
                sk.die_slowly();
            } else {
                self.release_socket(sock, host, ctx);
            }
            NbResult::ok(0)
        }
    }

    fn park(&mut self, op: NbOp) {
        let sock = op.sock;
        if let Some(sk) = self.bound.get_mut(&sock) {
            sk.nb_op = Some(op);
        }
    }

    fn finish_connect(&mut self, sock: i32) -> NbResult {
        let sk = self.bound.get_mut(&sock).expect("bound socket");
        sk.state &= !signal::CONNECT_ACTIVE;
        if sk.state & signal::CONN_RESET != 0 {
            sk.reinit();
            return NbResult::code(SocketCode::Generic);
        }
        NbResult::ok(0)
    }

    fn finish_send(&mut self, sock: i32) -> NbResult {
        let sk = self.bound.get_mut(&sock).expect("bound socket");
        let completed = sk.bytes_completed;
        if sk.state & signal::CONN_RESET != 0 {
            sk.reinit();
            if completed == 0 {
                return NbResult::code(SocketCode::Generic);
            }
        }
        NbResult::ok(completed as i32)
    }

    fn finish_recv(&mut self, sock: i32, host: &mut Host, ctx: &mut SchedContext<'_>) -> NbResult {
        let sk = self.bound.get_mut(&sock).expect("bound socket");
        let completed = sk.bytes_completed;
        let state = sk.state;
        if state & signal::CONN_RESET != 0 {
            sk.reinit();
            if completed == 0 {
                return NbResult::code(SocketCode::Generic);
            }
        }
        if state & signal::SOCK_EOF != 0 && completed == 0 {
            return NbResult::code(SocketCode::Generic);
        }
        let data = match self.session_of(sock) {
            Some((proto, id)) => self
                .with_master(proto, host, ctx, |m, _h, _c| m.take_received(id))
                .unwrap_or_default(),
            None => Vec::new(),
        };
        NbResult { code: SocketCode::Success, retval: completed as i32, data }
    }

    fn finish_close(&mut self, sock: i32, host: &mut Host, ctx: &mut SchedContext<'_>) -> NbResult {
        let sk = self.bound.get_mut(&sock).expect("bound socket");
        let release_session = sk.state & signal::SESSION_RELEASED != 0;
        let session = sk.session;
        if release_session {
            if let Some((proto, id)) = session {
                let _ = self.with_master(proto, host, ctx, |m, _h, _c| m.release(id));
            }
        }
        let sk = self.bound.get_mut(&sock).expect("bound socket");
        sk.reinit();
        if sk.is_active() {
            sk.die_slowly();
        } else {
            self.release_socket(sock, host, ctx);
        }
        NbResult::ok(0)
    }

    /// Re-enter the recorded resume point after a matching signal; the
    /// outcome goes to the owning application.
    pub(crate) fn nb_resume(&mut self, sock: i32, host: &mut Host, ctx: &mut SchedContext<'_>) {
        let Some(sk) = self.bound.get_mut(&sock) else { return };
        sk.deactivate();
        sk.mask = 0;
        let bits = sk.resume;
        let Some(op) = sk.nb_op.take() else { return };
        debug!(
            "socket {sock}: nb resume (bits {bits:#x}, kind {:?}, stage mask {:#x}, len {})",
            op.kind, op.premask, op.length
        );

        let result = match op.kind {
            NbKind::Connect => {
                self.clear_resume(sock, resume::CONNECT1);
                Some(self.finish_connect(sock))
            }
            NbKind::Accept if bits & resume::ACCEPT1 != 0 => {
                self.clear_resume(sock, resume::ACCEPT1);
                let r = self.accept_stage2(sock, op.make_new, op.token, op.app, host, ctx);
                // a re-block parked a fresh op; swallow the would-block
                (r.code != SocketCode::WouldBlock).then_some(r)
            }
            NbKind::Accept => {
                self.clear_resume(sock, resume::ACCEPT2);
                Some(self.finish_accept(sock, op.make_new, host, ctx))
            }
            NbKind::Send => {
                self.clear_resume(sock, resume::SEND1);
                Some(self.finish_send(sock))
            }
            NbKind::Recv => {
                self.clear_resume(sock, resume::RECV1);
                Some(self.finish_recv(sock, host, ctx))
            }
            NbKind::Close => {
                self.clear_resume(sock, resume::CLOSE1);
                Some(self.finish_close(sock, host, ctx))
            }
        };

        if let Some(r) = result {
            host.app_done(op.app, op.token, r.code == SocketCode::Success, r.retval, r.data);
        }
    }

    fn clear_resume(&mut self, sock: i32, bit: u8) {
        if let Some(sk) = self.bound.get_mut(&sock) {
            sk.resume &= !bit;
        }
    }
}
