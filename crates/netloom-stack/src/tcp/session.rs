//! The TCP session proper: connection state, windows, congestion-control
//! variables, and the application-facing entry points. The receive path,
//! send path, timers, SACK machinery, and state entries live in the
//! sibling modules, all as `impl TcpSession` blocks.

use log::debug;
use netloom::{IpAddr, Ltime, SchedContext};

use crate::host::Host;
use crate::socket::{signal, SocketSignal};
use crate::tcp::blocks::{BlockPattern, TcpBlockList};
use crate::tcp::message::{TcpHeader, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_RST, TCP_FLAG_SYN};
use crate::tcp::rcvwnd::RecvWindow;
use crate::tcp::sndwnd::SendWindow;
use crate::tcp::TcpConfig;

/// Session states. The integer order is semantically significant only for
/// the `connected` predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    CloseWait,
    Closing,
    FinWait1,
    FinWait2,
    LastAck,
    TimeWait,
}

impl TcpState {
    pub fn connected(self) -> bool {
        self >= TcpState::Established
    }
}

/// Application-visible actions; legality is a function of state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AppAction {
    #[allow(dead_code)]
    ResetPort,
    Send,
    Receive,
    Disconnect,
    Connect,
    Listen,
}

/// Bin/timer changes a session requests from its master; applied after the
/// session call returns so the master's sets never mutate mid-iteration.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MasterOp {
    SetConnected(usize),
    SetListening(usize),
    SetIdle(usize),
    EnableFast(usize),
    DisableFast(usize),
}

/// Everything a session may touch while handling an event: the master's
/// configuration, the host (for pushing ops down the stack and signalling
/// sockets), the scheduler context, and the master-op staging list.
pub(crate) struct TcpEnv<'a, 'b> {
    pub cfg: &'a TcpConfig,
    pub host: &'a mut Host,
    pub ctx: &'a mut SchedContext<'b>,
    pub moves: &'a mut Vec<MasterOp>,
}

impl TcpEnv<'_, '_> {
    pub fn now(&self) -> Ltime {
        self.ctx.now()
    }
}

pub struct TcpSession {
    pub(crate) id: usize,
    pub(crate) socket: i32,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,

    pub(crate) state: TcpState,
    pub(crate) sndwnd: Option<SendWindow>,
    pub(crate) rcvwnd: Option<RecvWindow>,

    /// Remote receive window size, from the peer's advertisements.
    pub(crate) rcvwnd_size: u32,
    pub(crate) cwnd: u32,
    pub(crate) ssthresh: u32,
    pub(crate) mss: u32,

    pub(crate) ndupacks: u32,
    pub(crate) nrxmits: u32,

    pub(crate) rtt_smoothed: i64,
    pub(crate) rtt_measured: i64,
    pub(crate) rtt_count: i64,
    pub(crate) rtt_var: i64,

    /// One past the last retransmitted segment.
    pub(crate) rxmit_seq: u32,
    /// The segment currently being timed for RTT.
    pub(crate) measured_seq: u32,
    /// The largest seqno sent out when loss happened.
    pub(crate) recover_seq: u32,
    /// How much may be in flight during SACK fast recovery.
    pub(crate) sack_pipe: u32,

    pub(crate) delayed_ack_pending: bool,
    pub(crate) fast_recovery: bool,
    pub(crate) timeout_loss: bool,
    pub(crate) sack_permitted: bool,
    pub(crate) close_issued: bool,
    pub(crate) simultaneous_closing: bool,

    pub(crate) snd_scoreboard: TcpBlockList,
    pub(crate) rcv_scoreboard: TcpBlockList,

    pub(crate) rxmit_timeout: Ltime,
    pub(crate) rxmit_timer_count: Ltime,
    pub(crate) msl_timer_count: Ltime,
    pub(crate) idle_time: Ltime,
}

impl TcpSession {
    pub(crate) fn new(id: usize, socket: i32, cfg: &TcpConfig) -> Self {
        let mut s = TcpSession {
            id,
            socket,
            src_ip: IpAddr::ANY,
            src_port: 0,
            dst_ip: IpAddr::ANYDEST,
            dst_port: 0,
            state: TcpState::Closed,
            sndwnd: None,
            rcvwnd: None,
            rcvwnd_size: 0,
            cwnd: 0,
            ssthresh: 0,
            mss: 0,
            ndupacks: 0,
            nrxmits: 0,
            rtt_smoothed: 0,
            rtt_measured: 0,
            rtt_count: 0,
            rtt_var: 0,
            rxmit_seq: 0,
            measured_seq: 0,
            recover_seq: 0,
            sack_pipe: 0,
            delayed_ack_pending: false,
            fast_recovery: false,
            timeout_loss: false,
            sack_permitted: false,
            close_issued: false,
            simultaneous_closing: false,
            // both sorted: the sender scans for holes with `unavailable`
            snd_scoreboard: TcpBlockList::new(BlockPattern::Increasing),
            rcv_scoreboard: TcpBlockList::new(BlockPattern::Increasing),
            rxmit_timeout: 0,
            rxmit_timer_count: 0,
            msl_timer_count: 0,
            idle_time: 0,
        };
        s.reset_closed_vars(cfg);
        s
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn connected(&self) -> bool {
        self.state.connected()
    }

    pub(crate) fn is_ok(&self, action: AppAction) -> bool {
        match action {
            AppAction::ResetPort | AppAction::Connect | AppAction::Listen => {
                self.state == TcpState::Closed
            }
            AppAction::Send => {
                matches!(self.state, TcpState::Established | TcpState::CloseWait)
            }
            AppAction::Receive => matches!(
                self.state,
                TcpState::Established
                    | TcpState::CloseWait
                    | TcpState::FinWait1
                    | TcpState::FinWait2
            ),
            AppAction::Disconnect => matches!(
                self.state,
                TcpState::Established | TcpState::CloseWait | TcpState::TimeWait
            ),
        }
    }

    //
    // application-facing entry points
    //

    pub(crate) fn connect(&mut self, dst_ip: IpAddr, dst_port: u16, env: &mut TcpEnv<'_, '_>) -> bool {
        if !self.is_ok(AppAction::Connect) {
            return false;
        }
        self.active_open(dst_ip, dst_port, env);
        true
    }

    pub(crate) fn listen(&mut self, env: &mut TcpEnv<'_, '_>) -> bool {
        if !self.is_ok(AppAction::Listen) {
            return false;
        }
        self.passive_open(env);
        true
    }

    pub(crate) fn send(
        &mut self,
        length: u32,
        data: Option<Vec<u8>>,
        env: &mut TcpEnv<'_, '_>,
    ) -> i64 {
        if !self.is_ok(AppAction::Send) {
            return 0;
        }
        self.appl_send(length, data, env) as i64
    }

    pub(crate) fn recv(&mut self, length: u32, env: &mut TcpEnv<'_, '_>) -> i64 {
        if !self.is_ok(AppAction::Receive) {
            return 0;
        }
        self.appl_recv(length, env) as i64
    }

    pub(crate) fn disconnect(&mut self, env: &mut TcpEnv<'_, '_>) {
        if self.is_ok(AppAction::Disconnect) {
            self.appl_close(env);
        }
    }

    pub(crate) fn abort(&mut self, env: &mut TcpEnv<'_, '_>) {
        if self.sndwnd.is_some() {
            let seqno = self.sndwnd.as_ref().expect("send window").seq.next();
            let ackno = self.rcvwnd.as_ref().expect("recv window").expected_seqno();
            self.send_data(seqno, 0, TCP_FLAG_RST, ackno, false, false, env);
        }
        self.reset(env);
    }

    pub(crate) fn set_source(&mut self, ip: IpAddr, port: u16) -> bool {
        self.src_ip = ip;
        self.src_port = port;
        true
    }

    fn active_open(&mut self, dst_ip: IpAddr, dst_port: u16, env: &mut TcpEnv<'_, '_>) {
        self.dst_ip = dst_ip;
        self.dst_port = dst_port;
        self.allocate_buffers(env.cfg);
        self.sndwnd.as_mut().expect("send window").seq.set_start(env.cfg.iss);
        self.init_state_syn_sent(env);
    }

    fn passive_open(&mut self, env: &mut TcpEnv<'_, '_>) {
        self.allocate_buffers(env.cfg);
        self.init_state_listen(env);
    }

    pub(crate) fn appl_close(&mut self, env: &mut TcpEnv<'_, '_>) {
        let sw = self.sndwnd.as_ref().expect("send window");
        if sw.seq.empty() && sw.data_in_buffer() == 0 {
            match self.state {
                TcpState::Established => {
                    let sig = self.init_state_fin_wait_1(env);
                    if sig != 0 {
                        self.wake_app(sig, env);
                    }
                }
                TcpState::CloseWait => {
                    let seqno = self.sndwnd.as_ref().expect("send window").seq.first_unused();
                    let ackno = self.rcvwnd.as_ref().expect("recv window").expected_seqno();
                    self.send_data(seqno, 0, TCP_FLAG_FIN, ackno, true, true, env);
                    self.sndwnd.as_mut().expect("send window").seq.set_fin(true);
                    self.init_state_last_ack(env);
                }
                TcpState::TimeWait => {
                    self.wake_app(signal::CONN_CLOSED, env);
                }
                _ => {}
            }
        } else {
            // the buffer must drain first; remember the intent
            self.clear_app_state(signal::OK_TO_CLOSE, env);
            self.close_issued = true;
        }
    }

    pub(crate) fn allocate_buffers(&mut self, cfg: &TcpConfig) {
        self.sndwnd = Some(SendWindow::new(0, cfg.snd_buf_size, cfg.snd_wnd_size));
        self.rcvwnd = Some(RecvWindow::new(0, cfg.rcv_wnd_size));
    }

    pub(crate) fn deallocate_buffers(&mut self) {
        self.sndwnd = None;
        self.rcvwnd = None;
    }

    /// Back to CLOSED and wake the application; the session may be
    /// reclaimed by the socket layer right after the signal.
    pub(crate) fn reset(&mut self, env: &mut TcpEnv<'_, '_>) {
        self.init_state_closed(env);
        self.wake_app(signal::CONN_RESET, env);
    }

    pub(crate) fn wake_app(&mut self, sig: u32, env: &mut TcpEnv<'_, '_>) {
        let mut nbytes = 0;
        if sig & signal::OK_TO_SEND != 0 {
            if let Some(sw) = self.sndwnd.as_mut() {
                nbytes = sw.data_buffered();
                sw.clear_data_buffered();
            }
        }
        if sig & signal::DATA_AVAILABLE != 0 {
            if let Some(rw) = self.rcvwnd.as_mut() {
                nbytes = rw.data_received();
                rw.clear_data_received();
            }
        }
        debug!(
            "tcp sock {}: wake app, signal {:#x}, nbytes {}",
            self.socket, sig, nbytes
        );
        env.host.signal_socket(SocketSignal { sock: self.socket, signal: sig, nbytes });
    }

    pub(crate) fn clear_app_state(&mut self, sig: u32, env: &mut TcpEnv<'_, '_>) {
        env.host
            .clear_socket_signal(SocketSignal { sock: self.socket, signal: sig, nbytes: 0 });
    }

    //
    // receive path entry (steps per segment; the helpers live in
    // receiver.rs)
    //

    pub(crate) fn receive(&mut self, mut hdr: TcpHeader, env: &mut TcpEnv<'_, '_>) {
        debug!(
            "tcp sock {}: rx seq={} ack={} flags={:#x} wsize={} in {:?}",
            self.socket, hdr.seqno, hdr.ackno, hdr.flags, hdr.wsize, self.state
        );
        self.idle_time = env.now();
        let mut sig: u32 = 0;

        if hdr.has(TCP_FLAG_RST) && self.state != TcpState::Listen {
            self.reset(env);
            return;
        }

        let mut suppress_ack = false;
        if hdr.has(TCP_FLAG_SYN) {
            suppress_ack = self.process_syn(&hdr, &mut sig, env);
        }
        if hdr.has(TCP_FLAG_FIN) {
            self.process_fin(&mut sig, env);
        }

        let payload = hdr.payload.take().map(|b| *b);
        let mut had_payload = false;
        if let Some(crate::message::NetMsg::Data(dm)) = payload {
            if matches!(
                self.state,
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
            ) {
                had_payload = dm.real_byte_count() > 0;
                self.process_new_data(dm, &hdr, &mut sig, env);
            }
        }

        let mut must_ack = false;
        if hdr.has(TCP_FLAG_ACK) {
            must_ack = self.process_ack(&hdr, &mut sig, env);
        }

        if self.state != TcpState::Closed {
            let ctrl_seen = (hdr.has(TCP_FLAG_SYN) && !suppress_ack) || hdr.has(TCP_FLAG_FIN);
            if must_ack || had_payload || ctrl_seen {
                self.acknowledge(must_ack || ctrl_seen, env);
            }
        }

        if matches!(self.state, TcpState::Established | TcpState::CloseWait) {
            let (first, can) = {
                let sw = self.sndwnd.as_ref().expect("send window");
                (sw.seq.first_unused(), sw.can_send())
            };
            if can > 0 {
                // congestion throttling happens inside segment_and_send's
                // window-room computation
                self.segment_and_send(first, can, env);
            }
            if self.sndwnd.as_ref().expect("send window").data_buffered() > 0 {
                sig |= signal::OK_TO_SEND;
            }
        }

        if self.close_issued && self.state == TcpState::Established {
            let sw = self.sndwnd.as_ref().expect("send window");
            if sw.seq.empty() && sw.data_in_buffer() == 0 {
                sig |= self.init_state_fin_wait_1(env);
            }
        }

        if sig != 0 {
            self.wake_app(sig, env);
        }
    }

    /// Emit an acknowledgement, delayed unless `nodelay`.
    pub(crate) fn acknowledge(&mut self, nodelay: bool, env: &mut TcpEnv<'_, '_>) {
        if env.cfg.delayed_ack && !nodelay && !self.delayed_ack_pending {
            self.send_delay_ack(env);
            return;
        }
        let seqno = self.sndwnd.as_ref().expect("send window").seq.first_unused();
        let ackno = self.rcvwnd.as_ref().expect("recv window").expected_seqno();
        self.send_data(seqno, 0, TCP_FLAG_ACK, ackno, false, false, env);
    }
}
