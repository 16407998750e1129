//! The application contract: sessions on top of the socket layer. Only
//! the generic request/response shape lives here, plus two small built-in
//! applications (a bulk sender and a sink) that the integration tests use
//! to drive sockets end-to-end.

use std::any::Any;

use log::debug;
use netloom::{IpAddr, SchedContext};

use crate::host::Host;
use crate::session::{ProtocolNum, SessionKind};
use crate::socket::SocketMaster;

/// An application session in the protocol graph. Socket operations carry
/// a caller-chosen token; `done` delivers each completion.
pub trait AppSession: Send {
    fn protocol(&self) -> ProtocolNum;

    /// Called once at boot.
    fn start(&mut self, host: &mut Host, ctx: &mut SchedContext<'_>);

    /// A socket operation completed.
    fn done(
        &mut self,
        token: u64,
        ok: bool,
        retval: i32,
        data: Vec<u8>,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    );

    /// Downcast support for inspection between advances.
    fn as_any(&self) -> &dyn Any;
}

/// Run a closure against the host's socket master.
pub fn with_sockets<R>(
    host: &mut Host,
    ctx: &mut SchedContext<'_>,
    f: impl FnOnce(&mut SocketMaster, &mut Host, &mut SchedContext<'_>) -> R,
) -> Option<R> {
    host.with_session(ProtocolNum::Socket, ctx, |s, h, c| match s {
        SessionKind::Socket(m) => Some(f(m, h, c)),
        _ => None,
    })
    .flatten()
}

const TOK_CONNECT: u64 = 1;
const TOK_SEND: u64 = 2;
const TOK_CLOSE: u64 = 3;
const TOK_ACCEPT: u64 = 4;
const TOK_RECV: u64 = 5;

fn token(op: u64, sock: i32) -> u64 {
    (sock as u64) << 8 | op
}

fn token_op(token: u64) -> u64 {
    token & 0xff
}

fn token_sock(token: u64) -> i32 {
    (token >> 8) as i32
}

/// Connects, streams a fixed number of bytes, then closes.
pub struct BulkSender {
    app: u8,
    dst_ip: IpAddr,
    dst_port: u16,
    src_port: u16,
    pub total_bytes: u32,
    pub sent: u32,
    pub connected: bool,
    pub finished: bool,
    pub failed: bool,
    sock: i32,
}

impl BulkSender {
    pub fn new(app: u8, dst_ip: IpAddr, dst_port: u16, src_port: u16, total_bytes: u32) -> Self {
        BulkSender {
            app,
            dst_ip,
            dst_port,
            src_port,
            total_bytes,
            sent: 0,
            connected: false,
            finished: false,
            failed: false,
            sock: -1,
        }
    }
}

impl AppSession for BulkSender {
    fn protocol(&self) -> ProtocolNum {
        ProtocolNum::App(self.app)
    }

    fn start(&mut self, host: &mut Host, ctx: &mut SchedContext<'_>) {
        let app = self.protocol();
        let src_ip = host.ifaces.first().map(|i| i.ip).unwrap_or(IpAddr::ANY);
        let (dst_ip, dst_port, src_port) = (self.dst_ip, self.dst_port, self.src_port);
        let sock = with_sockets(host, ctx, |m, h, c| {
            let sock = m.socket();
            if sock < 0 || !m.bind(sock, src_ip, src_port, "tcp", h, c) {
                return -1;
            }
            m.connect(sock, dst_ip, dst_port, token(TOK_CONNECT, sock), app, h, c);
            sock
        })
        .unwrap_or(-1);
        if sock < 0 {
            self.failed = true;
        }
        self.sock = sock;
    }

    fn done(
        &mut self,
        token_: u64,
        ok: bool,
        retval: i32,
        _data: Vec<u8>,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) {
        let app = self.protocol();
        let sock = self.sock;
        match token_op(token_) {
            TOK_CONNECT => {
                if !ok {
                    self.failed = true;
                    return;
                }
                self.connected = true;
                let remaining = self.total_bytes;
                debug!("bulk sender: connected, sending {remaining} bytes");
                let _ = with_sockets(host, ctx, |m, h, c| {
                    m.send(sock, remaining, None, token(TOK_SEND, sock), app, h, c);
                });
            }
            TOK_SEND => {
                if !ok {
                    self.failed = true;
                    return;
                }
                self.sent += retval as u32;
                if self.sent < self.total_bytes {
                    let remaining = self.total_bytes - self.sent;
                    let _ = with_sockets(host, ctx, |m, h, c| {
                        m.send(sock, remaining, None, token(TOK_SEND, sock), app, h, c);
                    });
                } else {
                    debug!("bulk sender: all {} bytes accepted, closing", self.sent);
                    let _ = with_sockets(host, ctx, |m, h, c| {
                        m.close(sock, token(TOK_CLOSE, sock), app, h, c);
                    });
                }
            }
            TOK_CLOSE => {
                self.finished = ok;
                self.failed |= !ok;
            }
            _ => {}
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Listens on a port and drains every connection it accepts.
pub struct BulkSink {
    app: u8,
    port: u16,
    recv_chunk: u32,
    pub received: u32,
    pub accepted: u32,
    pub closed: u32,
    pub data: Vec<u8>,
    listener: i32,
}

impl BulkSink {
    pub fn new(app: u8, port: u16, recv_chunk: u32) -> Self {
        BulkSink {
            app,
            port,
            recv_chunk,
            received: 0,
            accepted: 0,
            closed: 0,
            data: Vec::new(),
            listener: -1,
        }
    }

    fn issue_accept(&mut self, host: &mut Host, ctx: &mut SchedContext<'_>) {
        let app = self.protocol();
        let listener = self.listener;
        let _ = with_sockets(host, ctx, |m, h, c| {
            m.accept(listener, true, token(TOK_ACCEPT, listener), None, app, h, c);
        });
    }

    fn issue_recv(&mut self, conn: i32, host: &mut Host, ctx: &mut SchedContext<'_>) {
        let app = self.protocol();
        let chunk = self.recv_chunk;
        let _ = with_sockets(host, ctx, |m, h, c| {
            m.recv(conn, chunk, token(TOK_RECV, conn), app, h, c);
        });
    }
}

impl AppSession for BulkSink {
    fn protocol(&self) -> ProtocolNum {
        ProtocolNum::App(self.app)
    }

    fn start(&mut self, host: &mut Host, ctx: &mut SchedContext<'_>) {
        let src_ip = host.ifaces.first().map(|i| i.ip).unwrap_or(IpAddr::ANY);
        let port = self.port;
        let sock = with_sockets(host, ctx, |m, h, c| {
            let sock = m.socket();
            if sock < 0 || !m.bind(sock, src_ip, port, "tcp", h, c) {
                return -1;
            }
            sock
        })
        .unwrap_or(-1);
        self.listener = sock;
        if sock >= 0 {
            self.issue_accept(host, ctx);
        }
    }

    fn done(
        &mut self,
        token_: u64,
        ok: bool,
        retval: i32,
        data: Vec<u8>,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) {
        let app = self.protocol();
        match token_op(token_) {
            TOK_ACCEPT => {
                if !ok {
                    return;
                }
                self.accepted += 1;
                let conn = retval;
                debug!("bulk sink: accepted connection on socket {conn}");
                self.issue_recv(conn, host, ctx);
                // the listener is free again
                self.issue_accept(host, ctx);
            }
            TOK_RECV => {
                let conn = token_sock(token_);
                if ok && retval > 0 {
                    self.received += retval as u32;
                    self.data.extend_from_slice(&data);
                    self.issue_recv(conn, host, ctx);
                } else {
                    // EOF or reset: close our side
                    let _ = with_sockets(host, ctx, |m, h, c| {
                        m.close(conn, token(TOK_CLOSE, conn), app, h, c);
                    });
                }
            }
            TOK_CLOSE => {
                self.closed += 1;
            }
            _ => {}
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
