//! The receiving path: SYN/FIN/ACK processing, congestion response, and
//! data delivery toward the application.

use log::debug;

use crate::message::DataMessage;
use crate::socket::signal;
use crate::tcp::message::{TcpHeader, TCP_FLAG_ACK, TCP_FLAG_RST};
use crate::tcp::seqwnd::{seq_leq, seq_lt};
use crate::tcp::session::{TcpEnv, TcpSession, TcpState};
use crate::tcp::{TcpVersion, MAX_DUPACKS};

impl TcpSession {
    /// State-specific SYN handling. Returns true when the transition
    /// itself already emitted the acknowledgement.
    pub(crate) fn process_syn(
        &mut self,
        hdr: &TcpHeader,
        sig: &mut u32,
        env: &mut TcpEnv<'_, '_>,
    ) -> bool {
        if env.cfg.version == TcpVersion::Sack {
            self.receiver_recv_sack_options(hdr);
        }
        match self.state {
            TcpState::SynSent => {
                let rw = self.rcvwnd.as_mut().expect("recv window");
                rw.seq.set_start(hdr.seqno);
                rw.seq.set_syn(true);
                self.nrxmits = 0;
                self.rcvwnd_size = hdr.wsize;
                if !hdr.has(TCP_FLAG_ACK) {
                    // simultaneous open; the entry emits a plain ACK
                    self.init_state_syn_received(env);
                    return true;
                }
                false
            }
            TcpState::Listen => {
                let rw = self.rcvwnd.as_mut().expect("recv window");
                rw.seq.set_start(hdr.seqno);
                rw.seq.set_syn(true);
                let sw = self.sndwnd.as_mut().expect("send window");
                sw.seq.set_start(env.cfg.iss);
                self.rcvwnd_size = hdr.wsize;
                *sig |= signal::FIRST_CONNECTION;
                // the entry emits the SYN+ACK itself
                self.init_state_syn_received(env);
                true
            }
            _ => false,
        }
    }

    /// State-specific FIN handling.
    pub(crate) fn process_fin(&mut self, sig: &mut u32, env: &mut TcpEnv<'_, '_>) {
        if let Some(rw) = self.rcvwnd.as_mut() {
            rw.seq.set_fin(true);
        }
        match self.state {
            TcpState::Established => {
                if self.close_issued {
                    // our own FIN is pending behind buffered data
                    self.simultaneous_closing = true;
                }
                *sig |= self.init_state_close_wait(env);
            }
            TcpState::FinWait1 => {
                *sig |= self.init_state_closing(env);
            }
            TcpState::FinWait2 => {
                *sig |= self.init_state_time_wait(env);
            }
            _ => {}
        }
    }

    /// State-specific ACK handling. Returns true when the ACK was illegal
    /// and must be answered immediately.
    pub(crate) fn process_ack(
        &mut self,
        hdr: &TcpHeader,
        sig: &mut u32,
        env: &mut TcpEnv<'_, '_>,
    ) -> bool {
        match self.state {
            TcpState::SynSent | TcpState::SynReceived => {
                let sw = self.sndwnd.as_ref().expect("send window");
                if hdr.ackno != sw.seq.next() {
                    // a bogus handshake ACK kills the attempt
                    let seqno = sw.seq.next();
                    let ackno = self.rcvwnd.as_ref().expect("recv window").expected_seqno();
                    self.send_data(seqno, 0, TCP_FLAG_RST, ackno, false, false, env);
                    self.reset(env);
                    return false;
                }
                self.sndwnd.as_mut().expect("send window").seq.absorb_syn();
                self.rxmit_timer_count = 0;
                *sig |= self.init_state_established(env);
                false
            }
            TcpState::Established | TcpState::CloseWait => self.process_acks(hdr, env),
            TcpState::FinWait1 => {
                let illegal = self.process_acks(hdr, env);
                if !illegal && !self.sndwnd.as_ref().expect("send window").seq.fin() {
                    // our FIN is covered
                    *sig |= self.init_state_fin_wait_2();
                }
                illegal
            }
            TcpState::FinWait2 => self.process_acks(hdr, env),
            TcpState::LastAck => {
                let illegal = self.process_acks(hdr, env);
                if !illegal && !self.sndwnd.as_ref().expect("send window").seq.fin() {
                    self.init_state_closed(env);
                    *sig |= signal::CONN_CLOSED | signal::SESSION_RELEASED;
                }
                illegal
            }
            TcpState::Closing => {
                let illegal = self.process_acks(hdr, env);
                if !illegal && !self.sndwnd.as_ref().expect("send window").seq.fin() {
                    *sig |= self.init_state_time_wait(env);
                }
                illegal
            }
            _ => false,
        }
    }

    /// The common ACK path: legality, duplicate detection, window update,
    /// and new-data acknowledgement. Returns true on an illegal ACK.
    pub(crate) fn process_acks(&mut self, hdr: &TcpHeader, env: &mut TcpEnv<'_, '_>) -> bool {
        if env.cfg.version == TcpVersion::Sack {
            self.sender_recv_sack(hdr);
        }

        let sw = self.sndwnd.as_ref().expect("send window");
        let snd_una = sw.seq.start();
        if !(seq_leq(snd_una, hdr.ackno) && seq_leq(hdr.ackno, sw.seq.next())) {
            debug!(
                "tcp sock {}: illegal ack {} outside [{}, {}]",
                self.socket,
                hdr.ackno,
                snd_una,
                sw.seq.next()
            );
            return true;
        }

        if hdr.ackno == snd_una && hdr.wsize == self.rcvwnd_size && sw.seq.used() > 0 {
            self.process_dup_acks(env);
            return false;
        }

        self.update_remote_window_size(hdr.wsize);
        let acked = hdr.ackno.wrapping_sub(snd_una);
        if acked > 0 {
            self.process_new_acks(hdr, acked, env);
            self.ndupacks = 0;
        }
        false
    }

    /// An ACK advanced the window: release data, restart the timer, feed
    /// the RTT estimator, and run the version-specific congestion
    /// response.
    pub(crate) fn process_new_acks(
        &mut self,
        hdr: &TcpHeader,
        mut acked: u32,
        env: &mut TcpEnv<'_, '_>,
    ) {
        let in_recovery = self.ndupacks >= MAX_DUPACKS || self.fast_recovery || self.timeout_loss;

        {
            let sw = self.sndwnd.as_mut().expect("send window");
            if sw.seq.syn() {
                sw.seq.absorb_syn();
                acked -= 1;
            }
            let data_acked = acked.min(sw.seq.used());
            let fin_acked = sw.seq.fin() && acked > data_acked;
            if data_acked > 0
                && matches!(self.state, TcpState::Established | TcpState::CloseWait)
            {
                sw.release(data_acked);
            }
            if fin_acked {
                sw.seq.absorb_fin();
            }
        }

        // restart the retransmission timer while data remains in flight
        self.rxmit_timer_count = 0;
        if self.sndwnd.as_ref().expect("send window").seq.used() > 0 {
            self.rxmit_timer_count = self.rxmit_timeout;
        }

        // Karn's rule: only a measurement whose segment the ACK covers
        if self.rtt_count > 0 && seq_lt(self.measured_seq, hdr.ackno) {
            self.rtt_measured = self.rtt_count - 1;
            self.update_timeout(env);
        }

        match env.cfg.version {
            TcpVersion::Tahoe => {
                self.check_cwnd(env);
                if in_recovery {
                    if seq_lt(hdr.ackno, self.recover_seq) {
                        // go-back-N from the hole
                        let segs = self
                            .recover_seq
                            .wrapping_sub(hdr.ackno)
                            .div_ceil(self.mss.max(1));
                        self.resend_segments(hdr.ackno, segs, env);
                    } else {
                        self.timeout_loss = false;
                    }
                }
            }
            TcpVersion::Reno => {
                if in_recovery {
                    self.cwnd = self.ssthresh.min(env.cfg.max_cwnd());
                    if self.timeout_loss && seq_lt(hdr.ackno, self.recover_seq) {
                        self.resend_segments(hdr.ackno, 1, env);
                    }
                    if seq_leq(self.recover_seq, hdr.ackno) {
                        self.fast_recovery = false;
                        self.timeout_loss = false;
                    }
                } else {
                    self.check_cwnd(env);
                }
            }
            TcpVersion::NewReno => {
                if self.fast_recovery || self.timeout_loss {
                    if seq_lt(hdr.ackno, self.recover_seq) {
                        // partial ACK: retransmit the next hole, deflate
                        self.resend_segments(hdr.ackno, 1, env);
                        self.cwnd = self.cwnd.saturating_sub(acked.saturating_sub(self.mss));
                    } else {
                        let used = self.sndwnd.as_ref().expect("send window").seq.used();
                        self.cwnd = self.ssthresh.min(self.mss + used).min(env.cfg.max_cwnd());
                        self.fast_recovery = false;
                        self.timeout_loss = false;
                    }
                } else {
                    self.check_cwnd(env);
                }
            }
            TcpVersion::Sack => {
                if self.fast_recovery || self.timeout_loss {
                    if seq_lt(hdr.ackno, self.recover_seq) {
                        self.sack_pipe = self.sack_pipe.saturating_sub(self.mss);
                        self.sack_send_in_fast_recovery(env);
                    } else {
                        self.snd_scoreboard.clear_all_blocks();
                        let used = self.sndwnd.as_ref().expect("send window").seq.used();
                        self.cwnd = self.ssthresh.min(self.mss + used).min(env.cfg.max_cwnd());
                        self.fast_recovery = false;
                        self.timeout_loss = false;
                    }
                } else {
                    self.check_cwnd(env);
                }
            }
        }
    }

    /// A duplicate ACK arrived. The third one triggers fast retransmit;
    /// further ones inflate (Reno) or refill the pipe (SACK).
    pub(crate) fn process_dup_acks(&mut self, env: &mut TcpEnv<'_, '_>) {
        self.ndupacks += 1;
        debug!("tcp sock {}: dup ack #{}", self.socket, self.ndupacks);

        if self.ndupacks == MAX_DUPACKS {
            self.calc_threshold();
            self.recover_seq = self.sndwnd.as_ref().expect("send window").seq.first_unused();
            self.rtt_count = 0;

            let start = self.sndwnd.as_ref().expect("send window").seq.start();
            match env.cfg.version {
                TcpVersion::Tahoe => {
                    self.cwnd = self.mss;
                    self.resend_segments(start, 1, env);
                }
                TcpVersion::Reno | TcpVersion::NewReno => {
                    self.fast_recovery = true;
                    self.cwnd = (self.ssthresh + 3 * self.mss).min(env.cfg.max_cwnd());
                    self.resend_segments(start, 1, env);
                    // the inflated window may admit new data
                    let sw = self.sndwnd.as_ref().expect("send window");
                    let (first, can) = (sw.seq.first_unused(), sw.can_send());
                    if can > 0 {
                        self.segment_and_send(first, can, env);
                    }
                }
                TcpVersion::Sack => {
                    self.fast_recovery = true;
                    self.sack_pipe = self.cwnd.saturating_sub(3 * self.mss);
                    self.cwnd = self.ssthresh.min(env.cfg.max_cwnd());
                    self.sack_resend_segments(true, env);
                }
            }
        } else if self.ndupacks > MAX_DUPACKS {
            match env.cfg.version {
                TcpVersion::Reno | TcpVersion::NewReno => {
                    self.cwnd = (self.cwnd + self.mss).min(env.cfg.max_cwnd());
                    let sw = self.sndwnd.as_ref().expect("send window");
                    let (first, can) = (sw.seq.first_unused(), sw.can_send());
                    if can > 0 {
                        self.segment_and_send(first, can, env);
                    }
                }
                TcpVersion::Sack => {
                    self.sack_pipe = self.sack_pipe.saturating_sub(self.mss);
                    self.sack_send_in_fast_recovery(env);
                }
                TcpVersion::Tahoe => {}
            }
        }
    }

    /// New payload arrived: record it for SACK, buffer it, and satisfy a
    /// pending application receive.
    pub(crate) fn process_new_data(
        &mut self,
        payload: DataMessage,
        hdr: &TcpHeader,
        sig: &mut u32,
        env: &mut TcpEnv<'_, '_>,
    ) {
        if env.cfg.version == TcpVersion::Sack {
            self.receiver_record_sack(hdr.seqno, payload.real_byte_count());
        }

        let rw = self.rcvwnd.as_mut().expect("recv window");
        rw.add_to_buffer(payload, hdr.seqno);

        if rw.available() {
            // feed a waiting receive first
            let pending = rw.pending_recv();
            if pending > 0 {
                let got = rw.generate(pending);
                if got > 0 {
                    rw.add_data_received(got);
                    rw.reset_recv_params();
                    *sig |= signal::DATA_AVAILABLE;
                }
            } else {
                *sig |= signal::DATA_AVAILABLE;
            }
        }
    }

    /// The application asks for up to `length` bytes. Whatever is
    /// contiguously buffered comes back immediately; the rest becomes a
    /// pending receive satisfied as data arrives.
    pub(crate) fn appl_recv(&mut self, length: u32, env: &mut TcpEnv<'_, '_>) -> u32 {
        let got = {
            let rw = self.rcvwnd.as_mut().expect("recv window");
            rw.clear_data_received();
            rw.reset_recv_params();
            let got = rw.generate(length);
            if got < length {
                rw.set_recv_params(length - got);
            }
            got
        };
        if got < length {
            self.clear_app_state(signal::DATA_AVAILABLE, env);
        }
        got
    }
}
