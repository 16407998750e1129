//! The sending path: application sends, segmentation, the wire emit, and
//! retransmissions.

use log::debug;

use crate::ip::DEFAULT_TTL;
use crate::message::NetMsg;
use crate::session::{ProtocolNum, PushInfo, StackOp};
use crate::socket::signal;
use crate::tcp::message::{TcpHeader, TCP_FLAG_ACK, TCP_FLAG_SYN};
use crate::tcp::seqwnd::seq_lt;
use crate::tcp::session::{MasterOp, TcpEnv, TcpSession};
use crate::tcp::{TcpVersion, IP_MAX_SEGMENT};

impl TcpSession {
    /// The application wants `length` more bytes on the wire. Everything
    /// that fits in the send buffer is accepted; the rest waits in
    /// request. Returns the number of bytes accepted.
    pub(crate) fn appl_send(
        &mut self,
        length: u32,
        data: Option<Vec<u8>>,
        env: &mut TcpEnv<'_, '_>,
    ) -> u32 {
        // a long-idle connection restarts from slow start
        self.check_idle(env);

        let sw = self.sndwnd.as_mut().expect("send window");
        sw.clear_data_buffered();
        sw.request_to_send(data, length);

        let first = sw.seq.first_unused();
        let can = sw.can_send();
        self.segment_and_send(first, can, env);

        let accepted = self.sndwnd.as_mut().expect("send window").data_buffered();
        self.sndwnd.as_mut().expect("send window").clear_data_buffered();
        self.clear_app_state(signal::OK_TO_SEND, env);
        accepted
    }

    /// Consume window capacity from `seqno` on, one segment at a time:
    /// only full-MSS segments go out, except the exact final remainder of
    /// the buffer (the Nagle-like policy). Returns the bytes sent.
    pub(crate) fn segment_and_send(
        &mut self,
        mut seqno: u32,
        limit: u32,
        env: &mut TcpEnv<'_, '_>,
    ) -> u32 {
        let mut remaining = limit;
        let mut total = 0;
        loop {
            let sw = self.sndwnd.as_ref().expect("send window");
            let wnd_room = self.rcvwnd_size.min(self.cwnd).saturating_sub(sw.seq.used());
            let nbytes = wnd_room
                .min(sw.seq.unused())
                .min(remaining)
                .min(self.mss)
                .min(IP_MAX_SEGMENT);
            // a partial segment goes out only when it is everything left
            // in the buffer
            let is_tail = nbytes > 0 && nbytes == sw.can_send();
            if nbytes == 0 || (nbytes < self.mss && !is_tail) {
                break;
            }

            self.sndwnd.as_mut().expect("send window").seq.use_slots(nbytes);
            let ackno = self.rcvwnd.as_ref().expect("recv window").expected_seqno();
            self.send_data(seqno, nbytes, TCP_FLAG_ACK, ackno, true, true, env);
            seqno = seqno.wrapping_add(nbytes);
            remaining -= nbytes;
            total += nbytes;
        }
        total
    }

    /// Re-emit up to `nsegments` MSS-sized segments starting at `seqno`
    /// from data already in the window.
    pub(crate) fn resend_segments(
        &mut self,
        mut seqno: u32,
        nsegments: u32,
        env: &mut TcpEnv<'_, '_>,
    ) -> u32 {
        let mut total = 0;
        for _ in 0..nsegments {
            let sw = self.sndwnd.as_ref().expect("send window");
            // the range may have been acknowledged since the caller chose
            // it; resending starts no lower than the window base
            if seq_lt(seqno, sw.seq.start()) {
                seqno = sw.seq.start();
            }
            let end = sw.seq.first_unused();
            if !seq_lt(seqno, end) {
                break;
            }
            let len = self.mss.min(end.wrapping_sub(seqno));
            let ackno = self.rcvwnd.as_ref().expect("recv window").expected_seqno();
            self.send_data(seqno, len, TCP_FLAG_ACK, ackno, false, true, env);
            seqno = seqno.wrapping_add(len);
            total += len;
        }
        self.rxmit_seq = seqno;
        total
    }

    /// The retransmission timer fired: resend from the window base.
    pub(crate) fn timeout_resend(&mut self, env: &mut TcpEnv<'_, '_>) {
        let sw = self.sndwnd.as_ref().expect("send window");
        if sw.seq.syn() {
            // the SYN itself was lost
            let seqno = sw.seq.start();
            let ackno = self.rcvwnd.as_ref().expect("recv window").seq.expect();
            let flags = if self.state == crate::tcp::TcpState::SynReceived {
                TCP_FLAG_SYN | TCP_FLAG_ACK
            } else {
                TCP_FLAG_SYN
            };
            self.send_data(seqno, 0, flags, ackno, false, true, env);
            return;
        }
        if sw.seq.used() > 0 {
            let start = sw.seq.start();
            self.resend_segments(start, 1, env);
        } else if sw.seq.fin() {
            let seqno = sw.seq.first_unused();
            let ackno = self.rcvwnd.as_ref().expect("recv window").expected_seqno();
            self.send_data(
                seqno,
                0,
                crate::tcp::message::TCP_FLAG_FIN | TCP_FLAG_ACK,
                ackno,
                false,
                true,
                env,
            );
        }
    }

    /// Build a segment and push it down to IP. `need_calc_rtt` starts an
    /// RTT measurement if none is in flight; `arm_rxmit` arms the
    /// retransmission timer if it is not already running.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn send_data(
        &mut self,
        seqno: u32,
        datalen: u32,
        flags: u8,
        ackno: u32,
        need_calc_rtt: bool,
        arm_rxmit: bool,
        env: &mut TcpEnv<'_, '_>,
    ) {
        let wsize = self.calc_advertised_wnd();
        let mut hdr = TcpHeader::new(self.src_port, self.dst_port, seqno, ackno, flags, wsize);

        if env.cfg.version == TcpVersion::Sack {
            if flags & TCP_FLAG_SYN != 0 {
                hdr = hdr.with_options(self.sender_send_sack());
            } else if flags & TCP_FLAG_ACK != 0 {
                if let Some(opt) = self.receiver_send_sack(ackno) {
                    hdr = hdr.with_options(opt);
                }
            }
        }

        let mut msg = NetMsg::Tcp(hdr);
        if datalen > 0 {
            let dm = self.sndwnd.as_mut().expect("send window").generate(seqno, datalen);
            msg.carry(NetMsg::Data(dm));
        }

        if need_calc_rtt && self.rtt_count == 0 {
            self.measured_seq = seqno;
            self.rtt_count = 1;
        }

        debug!(
            "tcp sock {}: tx seq={} len={} ack={} flags={:#x}",
            self.socket, seqno, datalen, ackno, flags
        );
        self.idle_time = env.now();

        env.host.push_op(StackOp::Push {
            to: ProtocolNum::Ipv4,
            msg,
            info: PushInfo {
                src: self.src_ip,
                dst: self.dst_ip,
                protocol: ProtocolNum::Tcp,
                ttl: DEFAULT_TTL,
            },
        });

        if arm_rxmit && self.rxmit_timer_count == 0 {
            self.rxmit_timer_count = self.rxmit_timeout;
        }
    }

    /// The window we advertise: free receive-buffer capacity.
    pub(crate) fn calc_advertised_wnd(&self) -> u32 {
        self.rcvwnd.as_ref().map(|rw| rw.free_in_buffer()).unwrap_or(0)
    }

    pub(crate) fn send_delay_ack(&mut self, env: &mut TcpEnv<'_, '_>) {
        self.delayed_ack_pending = true;
        env.moves.push(MasterOp::EnableFast(self.id));
    }

    pub(crate) fn cancel_delay_ack(&mut self, env: &mut TcpEnv<'_, '_>) {
        if self.delayed_ack_pending {
            self.delayed_ack_pending = false;
            env.moves.push(MasterOp::DisableFast(self.id));
        }
    }

    /// Grow the congestion window: exponentially below the threshold
    /// (slow start), linearly above it (congestion avoidance).
    pub(crate) fn check_cwnd(&mut self, env: &TcpEnv<'_, '_>) {
        if self.cwnd <= self.ssthresh {
            self.cwnd += self.mss;
        } else {
            self.cwnd += (self.mss * self.mss / self.cwnd).max(1);
        }
        self.cwnd = self.cwnd.min(env.cfg.max_cwnd());
    }

    /// Halve the effective window into the threshold, floored at two
    /// segments.
    pub(crate) fn calc_threshold(&mut self) {
        self.ssthresh = (self.cwnd.min(self.rcvwnd_size) / 2).max(2 * self.mss);
    }

    pub(crate) fn update_remote_window_size(&mut self, wsize: u32) {
        self.rcvwnd_size = wsize;
    }
}
