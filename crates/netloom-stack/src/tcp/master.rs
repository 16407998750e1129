//! The TCP master session: owns every TCP session of a host, partitioned
//! into bins, drives the phase-aligned slow and fast timers, and
//! demultiplexes arriving segments.

use std::collections::BTreeSet;

use enum_map::{enum_map, Enum, EnumMap};
use log::debug;
use netloom::event::ProcessKey;
use netloom::{EventTarget, IpAddr, Ltime, SchedContext};
use rand_core::RngCore;

use crate::host::{Host, PROC_TCP_FAST, PROC_TCP_SLOW};
use crate::message::NetMsg;
use crate::session::{CtrlMsg, PopInfo, SessionMaster};
use crate::tcp::session::{MasterOp, TcpEnv, TcpSession};
use crate::tcp::{into_header, TcpConfig};

/// Which set a session currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
pub enum SessionBin {
    Listening,
    Connected,
    Idle,
    FastTimeout,
    Defunct,
}

pub struct TcpMaster {
    cfg: TcpConfig,
    sessions: Vec<Option<TcpSession>>,
    bins: EnumMap<SessionBin, BTreeSet<usize>>,
    boot_time: Ltime,
    fast_timer_armed: bool,
}

impl TcpMaster {
    pub fn new(cfg: TcpConfig) -> Self {
        TcpMaster {
            cfg,
            sessions: Vec::new(),
            bins: enum_map! { _ => BTreeSet::new() },
            boot_time: 0,
            fast_timer_armed: false,
        }
    }

    pub fn cfg(&self) -> &TcpConfig {
        &self.cfg
    }

    /// Read-only session access for inspection (tests, applications
    /// peeking at endpoints).
    pub fn session(&self, id: usize) -> Option<&TcpSession> {
        self.sessions.get(id).and_then(Option::as_ref)
    }

    #[cfg(test)]
    pub(crate) fn session_mut(&mut self, id: usize) -> Option<&mut TcpSession> {
        self.sessions.get_mut(id).and_then(Option::as_mut)
    }

    /// Sample the boot-time offset and start the slow timer.
    pub fn init(&mut self, host: &mut Host, ctx: &mut SchedContext<'_>) {
        if self.cfg.boot_time_window > 0 {
            let u = (host.rng.next_u64() >> 11) as f64 / (1u64 << 53) as f64;
            self.boot_time = (u * self.cfg.boot_time_window as f64) as Ltime;
        }
        self.arm_slow_timer(host, ctx);
    }

    /// The next firing instant keeps phase with `boot_time + k*interval`.
    fn aligned_delay(&self, interval: Ltime, now: Ltime) -> Ltime {
        let k = (now + self.boot_time).div_euclid(interval);
        interval * (k + 1) - self.boot_time - now
    }

    fn arm_slow_timer(&mut self, host: &mut Host, ctx: &mut SchedContext<'_>) {
        let delay = self.aligned_delay(self.cfg.slow_timeout, ctx.now());
        ctx.schedule(
            EventTarget { host: host.index, process: ProcessKey(PROC_TCP_SLOW) },
            Box::new(()),
            delay,
            host.tie_seed,
        );
    }

    fn arm_fast_timer(&mut self, host: &mut Host, ctx: &mut SchedContext<'_>) {
        let delay = self.aligned_delay(self.cfg.fast_timeout, ctx.now());
        ctx.schedule(
            EventTarget { host: host.index, process: ProcessKey(PROC_TCP_FAST) },
            Box::new(()),
            delay,
            host.tie_seed,
        );
        self.fast_timer_armed = true;
    }

    /// Timer controls from the host.
    pub fn control(&mut self, ctrl: CtrlMsg, host: &mut Host, ctx: &mut SchedContext<'_>) {
        match ctrl {
            CtrlMsg::TcpSlowTimer => {
                self.delete_defunct_sessions();
                // snapshot: sessions may re-bin themselves mid-iteration
                let snapshot: Vec<usize> = self.bins[SessionBin::Connected].iter().copied().collect();
                for id in snapshot {
                    let _ = self.with_session(id, host, ctx, |s, env| s.slow_timeout_handling(env));
                }
                self.arm_slow_timer(host, ctx);
            }
            CtrlMsg::TcpFastTimer => {
                self.delete_defunct_sessions();
                let snapshot: Vec<usize> =
                    self.bins[SessionBin::FastTimeout].iter().copied().collect();
                for id in snapshot {
                    let _ = self.with_session(id, host, ctx, |s, env| s.fast_timeout_handling(env));
                }
                self.arm_fast_timer(host, ctx);
            }
            other => {
                debug!("tcp master: unexpected control {other:?}");
            }
        }
    }

    /// An arriving segment: match a connected session on the remote
    /// endpoint and ports, else hand it to a listener on the local port
    /// (binding the listener's remote endpoint in place).
    pub fn pop(
        &mut self,
        msg: NetMsg,
        info: PopInfo,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) {
        // to be safe, reclaim defunct sessions first
        self.delete_defunct_sessions();

        let Some(hdr) = into_header(msg) else {
            debug!("tcp master: non-tcp message popped up, dropped");
            return;
        };

        let connected = self.bins[SessionBin::Connected].iter().copied().find(|&id| {
            self.sessions[id]
                .as_ref()
                .map(|s| {
                    s.dst_ip == info.src_ip
                        && s.src_port == hdr.dst_port
                        && s.dst_port == hdr.src_port
                })
                .unwrap_or(false)
        });
        if let Some(id) = connected {
            let _ = self.with_session(id, host, ctx, |s, env| s.receive(hdr, env));
            return;
        }

        let listening = self.bins[SessionBin::Listening].iter().copied().find(|&id| {
            self.sessions[id].as_ref().map(|s| s.src_port == hdr.dst_port).unwrap_or(false)
        });
        if let Some(id) = listening {
            // the listener turns into a connected session; the socket
            // layer clones a fresh listener when it accepts
            {
                let s = self.sessions[id].as_mut().expect("live session");
                s.src_ip = info.dst_ip;
                s.dst_ip = info.src_ip;
                s.dst_port = hdr.src_port;
            }
            let _ = self.with_session(id, host, ctx, |s, env| s.receive(hdr, env));
            return;
        }

        debug!(
            "tcp master: no session for {}:{} -> port {}, segment dropped",
            info.src_ip, hdr.src_port, hdr.dst_port
        );
    }

    /// Run a closure against one session with the master's configuration
    /// and the host reachable, then apply the bin/timer moves the session
    /// staged.
    fn with_session<R>(
        &mut self,
        id: usize,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
        f: impl FnOnce(&mut TcpSession, &mut TcpEnv<'_, '_>) -> R,
    ) -> Option<R> {
        let mut moves = Vec::new();
        let r = {
            let TcpMaster { cfg, sessions, .. } = self;
            let session = sessions.get_mut(id)?.as_mut()?;
            let mut env = TcpEnv { cfg, host: &mut *host, ctx: &mut *ctx, moves: &mut moves };
            f(session, &mut env)
        };
        self.apply_moves(moves, host, ctx);
        Some(r)
    }

    fn apply_moves(&mut self, moves: Vec<MasterOp>, host: &mut Host, ctx: &mut SchedContext<'_>) {
        for m in moves {
            match m {
                MasterOp::SetConnected(id) => self.rebin(id, SessionBin::Connected),
                MasterOp::SetListening(id) => self.rebin(id, SessionBin::Listening),
                MasterOp::SetIdle(id) => self.rebin(id, SessionBin::Idle),
                MasterOp::EnableFast(id) => {
                    self.bins[SessionBin::FastTimeout].insert(id);
                    if !self.fast_timer_armed {
                        self.arm_fast_timer(host, ctx);
                    }
                }
                MasterOp::DisableFast(id) => {
                    self.bins[SessionBin::FastTimeout].remove(&id);
                }
            }
        }
    }

    fn separate_session(&mut self, id: usize) {
        self.bins[SessionBin::Listening].remove(&id);
        self.bins[SessionBin::Connected].remove(&id);
        self.bins[SessionBin::Idle].remove(&id);
        self.bins[SessionBin::FastTimeout].remove(&id);
    }

    fn rebin(&mut self, id: usize, bin: SessionBin) {
        let keep_fast = self.bins[SessionBin::FastTimeout].contains(&id);
        self.separate_session(id);
        if keep_fast {
            self.bins[SessionBin::FastTimeout].insert(id);
        }
        self.bins[bin].insert(id);
    }

    fn delete_session(&mut self, id: usize) {
        self.separate_session(id);
        self.bins[SessionBin::Defunct].insert(id);
    }

    /// Reclaim sessions retired since the last sweep. Destruction is
    /// deferred so a timer or demux iteration never frees a session it is
    /// about to visit.
    fn delete_defunct_sessions(&mut self) {
        let defunct: Vec<usize> = self.bins[SessionBin::Defunct].iter().copied().collect();
        for id in defunct {
            self.sessions[id] = None;
        }
        self.bins[SessionBin::Defunct].clear();
    }
}

impl SessionMaster for TcpMaster {
    fn create_session(&mut self, sock: i32) -> usize {
        let id = match self.sessions.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                self.sessions.push(None);
                self.sessions.len() - 1
            }
        };
        self.sessions[id] = Some(TcpSession::new(id, sock, &self.cfg));
        self.bins[SessionBin::Idle].insert(id);
        debug!("tcp master: created session {id} for socket {sock}");
        id
    }

    fn set_source(&mut self, id: usize, ip: IpAddr, port: u16) -> bool {
        match self.sessions.get_mut(id).and_then(Option::as_mut) {
            Some(s) => s.set_source(ip, port),
            None => false,
        }
    }

    fn connect(
        &mut self,
        id: usize,
        ip: IpAddr,
        port: u16,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) -> bool {
        self.with_session(id, host, ctx, |s, env| s.connect(ip, port, env)).unwrap_or(false)
    }

    fn listen(&mut self, id: usize, host: &mut Host, ctx: &mut SchedContext<'_>) -> bool {
        self.with_session(id, host, ctx, |s, env| s.listen(env)).unwrap_or(false)
    }

    fn send(
        &mut self,
        id: usize,
        length: u32,
        data: Option<Vec<u8>>,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) -> i64 {
        self.with_session(id, host, ctx, |s, env| s.send(length, data, env)).unwrap_or(-1)
    }

    fn recv(&mut self, id: usize, length: u32, host: &mut Host, ctx: &mut SchedContext<'_>) -> i64 {
        self.with_session(id, host, ctx, |s, env| s.recv(length, env)).unwrap_or(-1)
    }

    fn disconnect(&mut self, id: usize, host: &mut Host, ctx: &mut SchedContext<'_>) {
        let _ = self.with_session(id, host, ctx, |s, env| s.disconnect(env));
    }

    fn abort(&mut self, id: usize, host: &mut Host, ctx: &mut SchedContext<'_>) {
        let _ = self.with_session(id, host, ctx, |s, env| s.abort(env));
    }

    fn connected(&self, id: usize) -> bool {
        self.sessions
            .get(id)
            .and_then(Option::as_ref)
            .map(TcpSession::connected)
            .unwrap_or(false)
    }

    fn release(&mut self, id: usize) {
        self.delete_session(id);
    }

    fn set_socket(&mut self, id: usize, sock: i32) {
        if let Some(s) = self.sessions.get_mut(id).and_then(Option::as_mut) {
            s.socket = sock;
        }
    }

    fn take_received(&mut self, id: usize) -> Vec<u8> {
        self.sessions
            .get_mut(id)
            .and_then(Option::as_mut)
            .and_then(|s| s.rcvwnd.as_mut())
            .map(|rw| rw.take_appl_buf())
            .unwrap_or_default()
    }

    fn dst_endpoint(&self, id: usize) -> Option<(IpAddr, u16)> {
        self.sessions
            .get(id)
            .and_then(Option::as_ref)
            .filter(|s| s.connected())
            .map(|s| (s.dst_ip, s.dst_port))
    }
}
