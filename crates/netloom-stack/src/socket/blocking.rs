//! Blocking socket operations as explicit stage machines. Each operation
//! either completes synchronously or parks a [`BlockingOp`] on the socket;
//! the signal handler re-enters the recorded stage when the awaited mask
//! matches. Completion is reported to the owning application session.

use log::debug;
use netloom::{IpAddr, SchedContext};

use crate::host::Host;
use crate::session::ProtocolNum;
use crate::socket::{signal, SocketMaster};

/// Where a suspended blocking operation resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BStage {
    Connect1,
    Accept1,
    Accept2,
    Send1,
    Recv1,
    Close1,
}

/// A suspended blocking operation: the continuation.
#[derive(Debug)]
pub(crate) struct BlockingOp {
    pub sock: i32,
    pub stage: BStage,
    /// Completion token the application chose.
    pub token: u64,
    /// The application session to notify.
    pub app: ProtocolNum,
    /// Accept only: transfer the connection to a fresh descriptor.
    pub make_new: bool,
    /// Accept only: a continuation to poke at the first-connection event.
    pub chain_token: Option<u64>,
}

impl SocketMaster {
    /// Park the caller until a masked signal arrives, or continue
    /// immediately when the state already matches.
    fn block_till(
        &mut self,
        mask: u32,
        any_signal: bool,
        op: BlockingOp,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) {
        let Some(sk) = self.bound.get_mut(&op.sock) else { return };
        if mask & sk.state == 0 {
            sk.mask = if any_signal { 0xffff_ffff } else { mask & !sk.state };
            debug!("socket {}: suspend (mask {:#x}, state {:#x})", op.sock, sk.mask, sk.state);
            sk.activate();
            sk.continuation = Some(op);
        } else {
            self.run_stage(op, host, ctx);
        }
    }

    fn fail(&mut self, op: &BlockingOp, host: &mut Host) {
        host.app_done(op.app, op.token, false, -1, Vec::new());
    }

    fn succeed(&mut self, op: &BlockingOp, retval: i32, data: Vec<u8>, host: &mut Host) {
        host.app_done(op.app, op.token, true, retval, data);
    }

    /// The common stage prologue: consume the activation, clear the mask,
    /// and reap a socket that died while suspended. Returns false when the
    /// operation must fail.
    fn stage_prologue(
        &mut self,
        sock: i32,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) -> bool {
        let Some(sk) = self.bound.get_mut(&sock) else { return false };
        sk.deactivate();
        sk.mask = 0;
        if sk.has_died() && !sk.is_active() {
            self.release_socket(sock, host, ctx);
            return false;
        }
        true
    }

    /// Initiate an active open.
    pub fn connect(
        &mut self,
        sock: i32,
        ip: IpAddr,
        port: u16,
        token: u64,
        app: ProtocolNum,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) {
        let op = BlockingOp { sock, stage: BStage::Connect1, token, app, make_new: false, chain_token: None };
        let Some((proto, id)) = self.session_of(sock) else {
            self.fail(&op, host);
            return;
        };
        let busy = self
            .bound
            .get(&sock)
            .map(|s| s.state & signal::CONNECT_ACTIVE != 0)
            .unwrap_or(true);
        if busy || self.session_connected(proto, id, host) {
            self.fail(&op, host);
            return;
        }

        let ok = self
            .with_master(proto, host, ctx, |m, h, c| m.connect(id, ip, port, h, c))
            .unwrap_or(false);
        if !ok {
            self.fail(&op, host);
            return;
        }

        self.bound.get_mut(&sock).expect("bound socket").state |= signal::CONNECT_ACTIVE;
        self.block_till(signal::OK_TO_SEND | signal::CONN_RESET, false, op, host, ctx);
    }

    /// Passive open plus the two-stage wait for an incoming connection.
    pub fn accept(
        &mut self,
        sock: i32,
        make_new_socket: bool,
        token: u64,
        chain_token: Option<u64>,
        app: ProtocolNum,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) {
        let op = BlockingOp {
            sock,
            stage: BStage::Accept1,
            token,
            app,
            make_new: make_new_socket,
            chain_token,
        };
        let Some((proto, id)) = self.session_of(sock) else {
            self.fail(&op, host);
            return;
        };
        let busy = self
            .bound
            .get(&sock)
            .map(|s| s.state & signal::CONNECT_ACTIVE != 0)
            .unwrap_or(true);
        if busy || self.session_connected(proto, id, host) {
            self.fail(&op, host);
            return;
        }

        let ok = self.with_master(proto, host, ctx, |m, h, c| m.listen(id, h, c)).unwrap_or(false);
        if !ok {
            self.fail(&op, host);
            return;
        }

        self.bound.get_mut(&sock).expect("bound socket").state |= signal::CONNECT_ACTIVE;
        self.block_till(signal::FIRST_CONNECTION | signal::CONN_RESET, false, op, host, ctx);
    }

    /// Send `length` bytes; completes once the transport has accepted
    /// them all (or the connection dies).
    pub fn send(
        &mut self,
        sock: i32,
        length: u32,
        data: Option<Vec<u8>>,
        token: u64,
        app: ProtocolNum,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) {
        let op = BlockingOp { sock, stage: BStage::Send1, token, app, make_new: false, chain_token: None };
        let Some((proto, id)) = self.session_of(sock) else {
            self.fail(&op, host);
            return;
        };
        if !self.io_ready(proto, id, host) {
            self.fail(&op, host);
            return;
        }

        let accepted = self
            .with_master(proto, host, ctx, |m, h, c| m.send(id, length, data, h, c))
            .unwrap_or(-1);
        if accepted < 0 {
            self.fail(&op, host);
            return;
        }
        let sk = self.bound.get_mut(&sock).expect("bound socket");
        sk.bytes_completed = accepted as u32;

        if (accepted as u32) < length {
            // the buffer is full: only freed space may wake us, never a
            // stale ok-to-send flag
            sk.state &= !signal::OK_TO_SEND;
            self.block_till(signal::OK_TO_SEND | signal::CONN_RESET, false, op, host, ctx);
        } else {
            debug!("socket {sock}: sent all {length} bytes immediately");
            self.succeed(&op, length as i32, Vec::new(), host);
        }
    }

    /// Receive up to `length` bytes; completes on data, EOF, or reset.
    pub fn recv(
        &mut self,
        sock: i32,
        length: u32,
        token: u64,
        app: ProtocolNum,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) {
        let op = BlockingOp { sock, stage: BStage::Recv1, token, app, make_new: false, chain_token: None };
        let Some((proto, id)) = self.session_of(sock) else {
            self.fail(&op, host);
            return;
        };
        if !self.io_ready(proto, id, host) {
            self.fail(&op, host);
            return;
        }

        let got = self
            .with_master(proto, host, ctx, |m, h, c| m.recv(id, length, h, c))
            .unwrap_or(-1);
        if got < 0 {
            self.fail(&op, host);
            return;
        }
        let sk = self.bound.get_mut(&sock).expect("bound socket");
        sk.bytes_completed = got as u32;

        if (got as u32) < length {
            // the session exhausted its buffer: only fresh data may wake
            // us, never the stale availability flag
            sk.state &= !signal::DATA_AVAILABLE;
            self.block_till(
                signal::SOCK_EOF | signal::DATA_AVAILABLE | signal::CONN_RESET,
                false,
                op,
                host,
                ctx,
            );
        } else {
            let data = self
                .with_master(proto, host, ctx, |m, _h, _c| m.take_received(id))
                .unwrap_or_default();
            self.succeed(&op, length as i32, data, host);
        }
    }

    /// Orderly close; waits for the transport's close handshake when
    /// connected.
    pub fn close(
        &mut self,
        sock: i32,
        token: u64,
        app: ProtocolNum,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) {
        let op = BlockingOp { sock, stage: BStage::Close1, token, app, make_new: false, chain_token: None };
        if !self.bound.contains_key(&sock) {
            self.fail(&op, host);
            return;
        }

        let session = self.session_of(sock);
        let connected = session
            .map(|(proto, id)| self.session_connected(proto, id, host))
            .unwrap_or(false);

        if connected {
            let (proto, id) = session.expect("connected session");
            let _ = self.with_master(proto, host, ctx, |m, h, c| m.disconnect(id, h, c));
            self.block_till(
                signal::CONN_RESET | signal::CONN_CLOSED | signal::SESSION_RELEASED,
                false,
                op,
                host,
                ctx,
            );
        } else {
            debug!("socket {sock}: close with no connection");
            let sk = self.bound.get_mut(&sock).expect("bound socket");
            sk.reinit();
            if sk.is_active() {
                sk.die_slowly();
            } else {
                self.release_socket(sock, host, ctx);
            }
            self.succeed(&op, 0, Vec::new(), host);
        }
    }

    /// Re-enter a suspended operation at its recorded stage.
    pub(crate) fn run_stage(
        &mut self,
        mut op: BlockingOp,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) {
        if !self.stage_prologue(op.sock, host, ctx) {
            self.fail(&op, host);
            return;
        }
        match op.stage {
            BStage::Connect1 => {
                let sk = self.bound.get_mut(&op.sock).expect("bound socket");
                sk.state &= !signal::CONNECT_ACTIVE;
                if sk.state & signal::CONN_RESET != 0 {
                    sk.reinit();
                    self.fail(&op, host);
                    return;
                }
                self.succeed(&op, 0, Vec::new(), host);
            }
            BStage::Accept1 => {
                let sk = self.bound.get_mut(&op.sock).expect("bound socket");
                sk.state &= !signal::CONNECT_ACTIVE;
                if sk.state & signal::CONN_RESET != 0 {
                    sk.reinit();
                    self.fail(&op, host);
                    return;
                }
                // the first-connection event lets the application fork a
                // handler before the handshake completes
                if let Some(chain) = op.chain_token.take() {
                    host.app_done(op.app, chain, true, 0, Vec::new());
                }
                let sk = self.bound.get_mut(&op.sock).expect("bound socket");
                sk.state |= signal::CONNECT_ACTIVE;
                op.stage = BStage::Accept2;
                self.block_till(signal::OK_TO_SEND | signal::CONN_RESET, false, op, host, ctx);
            }
            BStage::Accept2 => {
                let sk = self.bound.get_mut(&op.sock).expect("bound socket");
                sk.state &= !signal::CONNECT_ACTIVE;
                if sk.state & signal::CONN_RESET != 0 {
                    sk.reinit();
                    self.fail(&op, host);
                    return;
                }
                if op.make_new {
                    match self.transfer_to_new_socket(op.sock, host, ctx) {
                        Some(new_sock) => self.succeed(&op, new_sock, Vec::new(), host),
                        None => self.fail(&op, host),
                    }
                } else {
                    self.succeed(&op, op.sock, Vec::new(), host);
                }
            }
            BStage::Send1 => {
                let sk = self.bound.get_mut(&op.sock).expect("bound socket");
                let completed = sk.bytes_completed;
                if sk.state & signal::CONN_RESET != 0 {
                    sk.reinit();
                    // report what made it out unless nothing did
                    if completed == 0 {
                        self.fail(&op, host);
                        return;
                    }
                }
                self.succeed(&op, completed as i32, Vec::new(), host);
            }
            BStage::Recv1 => {
                let sk = self.bound.get_mut(&op.sock).expect("bound socket");
                let completed = sk.bytes_completed;
                let state = sk.state;
                if state & signal::CONN_RESET != 0 {
                    sk.reinit();
                    if completed == 0 {
                        self.fail(&op, host);
                        return;
                    }
                }
                if state & signal::SOCK_EOF != 0 && completed == 0 {
                    self.fail(&op, host);
                    return;
                }
                let data = match self.session_of(op.sock) {
                    Some((proto, id)) => self
                        .with_master(proto, host, ctx, |m, _h, _c| m.take_received(id))
                        .unwrap_or_default(),
                    None => Vec::new(),
                };
                self.succeed(&op, completed as i32, data, host);
            }
            BStage::Close1 => {
                let sk = self.bound.get_mut(&op.sock).expect("bound socket");
                let release_session = sk.state & signal::SESSION_RELEASED != 0;
                if release_session {
                    if let Some((proto, id)) = sk.session {
                        let _ = self.with_master(proto, host, ctx, |m, _h, _c| m.release(id));
                    }
                }
                let sk = self.bound.get_mut(&op.sock).expect("bound socket");
                sk.reinit();
                if sk.is_active() {
                    sk.die_slowly();
                } else {
                    self.release_socket(op.sock, host, ctx);
                }
                self.succeed(&op, 0, Vec::new(), host);
            }
        }
    }

    /// Accept with `make_new_socket`: the established session moves to a
    /// freshly allocated bound descriptor, and the listening descriptor
    /// gets a brand-new session so it can listen again.
    pub(super) fn transfer_to_new_socket(
        &mut self,
        sock: i32,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) -> Option<i32> {
        let (proto, old_id) = self.session_of(sock)?;

        // the source endpoint carries over to the replacement listener
        let src = host.graph.get(proto).and_then(|s| match s {
            crate::session::SessionKind::Tcp(m) => {
                m.session(old_id).map(|t| (t.src_ip, t.src_port))
            }
            _ => None,
        })?;

        let fresh = self.with_master(proto, host, ctx, |m, _h, _c| {
            let id = m.create_session(sock);
            if m.set_source(id, src.0, src.1) {
                Some(id)
            } else {
                m.release(id);
                None
            }
        })??;

        let new_sock = self.socket();
        if new_sock < 0 {
            let _ = self.with_master(proto, host, ctx, |m, _h, _c| m.release(fresh));
            return None;
        }

        // move the established session to the new descriptor, keep its
        // signal state
        let old_state = self.bound.get(&sock).expect("bound socket").state;
        let mut new_socket = super::Socket::new();
        new_socket.session = Some((proto, old_id));
        new_socket.state = old_state;
        let _ = self.with_master(proto, host, ctx, |m, _h, _c| m.set_socket(old_id, new_sock));
        self.unbound.remove(&new_sock);
        self.bound.insert(new_sock, new_socket);

        // the old descriptor keeps listening through the fresh session
        let sk = self.bound.get_mut(&sock).expect("bound socket");
        sk.session = Some((proto, fresh));
        sk.reinit();

        Some(new_sock)
    }
}
