//! State entries of the TCP session. Each `init_state_*` performs the
//! actions the state transition demands and returns the socket signal bits
//! to accumulate.

use crate::socket::signal;
use crate::tcp::message::{TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_SYN};
use crate::tcp::session::{MasterOp, TcpEnv, TcpSession, TcpState};
use crate::tcp::{MSL_TIMEOUT_FACTOR, RTTVAR_SHIFT};

impl TcpSession {
    /// Reset every variable a CLOSED session starts from.
    pub(crate) fn reset_closed_vars(&mut self, cfg: &crate::tcp::TcpConfig) {
        self.rxmit_timer_count = 0;
        self.msl_timer_count = 0;
        self.rcvwnd_size = cfg.rcv_wnd_size;
        self.cwnd = cfg.mss;
        self.ssthresh = cfg.init_thresh();
        self.mss = cfg.mss;
        self.rtt_smoothed = 0;
        self.rtt_count = 0;
        self.rtt_var = ((3.0 / cfg.slow_timeout_secs).round() as i64) << RTTVAR_SHIFT;
        self.rxmit_timeout = self.initial_timeout_ticks(cfg);
        self.nrxmits = 0;
        self.ndupacks = 0;
        self.fast_recovery = false;
        self.timeout_loss = false;
        self.sack_permitted = false;
        self.close_issued = false;
        self.simultaneous_closing = false;
        self.snd_scoreboard.clear_all_blocks();
        self.rcv_scoreboard.clear_all_blocks();
    }

    pub(crate) fn init_state_closed(&mut self, env: &mut TcpEnv<'_, '_>) -> u32 {
        self.state = TcpState::Closed;
        self.reset_closed_vars(env.cfg);
        self.cancel_delay_ack(env);
        self.deallocate_buffers();
        env.moves.push(MasterOp::SetIdle(self.id));
        0
    }

    pub(crate) fn init_state_syn_sent(&mut self, env: &mut TcpEnv<'_, '_>) -> u32 {
        self.state = TcpState::SynSent;
        self.nrxmits = 0;
        env.moves.push(MasterOp::SetConnected(self.id));

        let seqno = self.sndwnd.as_ref().expect("send window").seq.first_unused();
        let ackno = self.rcvwnd.as_ref().expect("recv window").seq.expect();
        self.send_data(seqno, 0, TCP_FLAG_SYN, ackno, true, true, env);
        self.sndwnd.as_mut().expect("send window").seq.set_syn(true);
        0
    }

    pub(crate) fn init_state_syn_received(&mut self, env: &mut TcpEnv<'_, '_>) -> u32 {
        debug_assert!(self.state != TcpState::Closed);
        let from_listen = self.state == TcpState::Listen;

        self.state = TcpState::SynReceived;
        self.nrxmits = 0;
        env.moves.push(MasterOp::SetConnected(self.id));

        if from_listen {
            self.sndwnd.as_mut().expect("send window").seq.set_syn(true);
            let seqno = self.sndwnd.as_ref().expect("send window").seq.start();
            let ackno = self.rcvwnd.as_ref().expect("recv window").seq.expect();
            self.send_data(seqno, 0, TCP_FLAG_SYN | TCP_FLAG_ACK, ackno, true, true, env);
        } else {
            let seqno = self.sndwnd.as_ref().expect("send window").seq.next();
            let ackno = self.rcvwnd.as_ref().expect("recv window").seq.expect();
            self.send_data(seqno, 0, TCP_FLAG_ACK, ackno, false, false, env);
        }
        0
    }

    pub(crate) fn init_state_listen(&mut self, env: &mut TcpEnv<'_, '_>) -> u32 {
        env.moves.push(MasterOp::SetListening(self.id));

        // coming from anywhere but CLOSED, the session state must be
        // re-initialized
        if self.state != TcpState::Closed {
            self.sndwnd.as_mut().expect("send window").reset(0);
            self.rcvwnd.as_mut().expect("recv window").reset(0);
            self.rcvwnd_size = env.cfg.rcv_wnd_size;
            self.mss = env.cfg.mss;
            self.cwnd = self.mss;
            self.ssthresh = env.cfg.init_thresh();
            self.cancel_delay_ack(env);
            self.ndupacks = 0;
        }

        self.state = TcpState::Listen;
        self.rxmit_timer_count = 0;
        self.msl_timer_count = 0;
        0
    }

    pub(crate) fn init_state_established(&mut self, env: &mut TcpEnv<'_, '_>) -> u32 {
        self.state = TcpState::Established;
        self.close_issued = false;
        self.simultaneous_closing = false;
        self.ssthresh = env.cfg.init_thresh();
        let sw = self.sndwnd.as_ref().expect("send window");
        debug_assert!(!sw.seq.syn() && !sw.seq.fin());
        self.recover_seq = sw.seq.start();
        signal::OK_TO_SEND
    }

    pub(crate) fn init_state_close_wait(&mut self, env: &mut TcpEnv<'_, '_>) -> u32 {
        self.state = TcpState::CloseWait;
        self.rxmit_timer_count = 0;

        // a FIN arrived: if the receive window is empty nothing more will
        // come, so the application sees EOF
        if self.rcvwnd.as_ref().expect("recv window").empty() {
            self.clear_app_state(signal::DATA_AVAILABLE, env);
            signal::SOCK_EOF
        } else {
            signal::DATA_AVAILABLE | signal::SOCK_EOF
        }
    }

    pub(crate) fn init_state_last_ack(&mut self, env: &mut TcpEnv<'_, '_>) -> u32 {
        self.state = TcpState::LastAck;

        if env.cfg.delayed_ack && self.delayed_ack_pending {
            let seqno = self.sndwnd.as_ref().expect("send window").seq.next();
            let ackno = self.rcvwnd.as_ref().expect("recv window").expected_seqno();
            self.send_data(seqno, 0, TCP_FLAG_ACK, ackno, false, false, env);
            self.cancel_delay_ack(env);
        }

        self.clear_app_state(signal::OK_TO_SEND | signal::OK_TO_CLOSE, env);
        0
    }

    pub(crate) fn init_state_fin_wait_1(&mut self, env: &mut TcpEnv<'_, '_>) -> u32 {
        self.state = TcpState::FinWait1;

        let sw = self.sndwnd.as_ref().expect("send window");
        debug_assert!(sw.seq.empty() && sw.data_in_buffer() == 0);
        self.nrxmits = 0;

        let seqno = sw.seq.first_unused();
        let ackno = self.rcvwnd.as_ref().expect("recv window").expected_seqno();
        if env.cfg.delayed_ack && self.delayed_ack_pending {
            // piggyback the leftover delayed ACK on the FIN
            self.send_data(seqno, 0, TCP_FLAG_FIN | TCP_FLAG_ACK, ackno, true, true, env);
            self.cancel_delay_ack(env);
        } else {
            self.send_data(seqno, 0, TCP_FLAG_FIN, ackno, true, true, env);
        }
        self.sndwnd.as_mut().expect("send window").seq.set_fin(true);

        // a FIN received while the buffer was draining means both sides
        // are closing at once
        if self.simultaneous_closing {
            self.init_state_closing(env)
        } else {
            0
        }
    }

    pub(crate) fn init_state_fin_wait_2(&mut self) -> u32 {
        self.state = TcpState::FinWait2;
        self.rxmit_timer_count = 0;
        0
    }

    pub(crate) fn init_state_closing(&mut self, env: &mut TcpEnv<'_, '_>) -> u32 {
        self.state = TcpState::Closing;
        if self.rcvwnd.as_ref().expect("recv window").empty() {
            self.clear_app_state(signal::DATA_AVAILABLE, env);
            signal::SOCK_EOF
        } else {
            0
        }
    }

    pub(crate) fn init_state_time_wait(&mut self, env: &mut TcpEnv<'_, '_>) -> u32 {
        self.state = TcpState::TimeWait;
        self.msl_timer_count = MSL_TIMEOUT_FACTOR * env.cfg.msl;
        0
    }
}
