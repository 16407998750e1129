//! Selective acknowledgement.
//!
//! The sender advertises SACK-permitted on its SYN and maintains a
//! scoreboard of ranges the peer reports; during fast recovery it resends
//! exactly the holes. The receiver records what it has and attaches up to
//! four blocks to every ACK that does not cover its highest sequence
//! number.

use crate::tcp::message::{TcpHeader, TcpOption, TCP_FLAG_ACK};
use crate::tcp::seqwnd::seq_lt;
use crate::tcp::session::{TcpEnv, TcpSession};
use crate::tcp::SACK_MAX_BLOCKS;

impl TcpSession {
    /// The option the sender attaches to its SYN.
    pub(crate) fn sender_send_sack(&self) -> TcpOption {
        TcpOption::SackPermitted
    }

    /// The option a receiver attaches to an ACK, when blocks beyond the
    /// cumulative ACK exist. Per RFC 2018 the option rides on every ACK
    /// that does not acknowledge the highest received sequence number.
    pub(crate) fn receiver_send_sack(&mut self, ackno: u32) -> Option<TcpOption> {
        if !self.sack_permitted {
            return None;
        }
        if !seq_lt(ackno, self.rcvwnd.as_ref().expect("recv window").highest_seqno()) {
            return None;
        }
        self.rcv_scoreboard.clear_blocks(ackno);
        let blocks = self.rcv_scoreboard.fetch_blocks(SACK_MAX_BLOCKS);
        if blocks.is_empty() {
            return None;
        }
        Some(TcpOption::Sack(blocks))
    }

    /// The sender learned what the peer has: trim the scoreboard below
    /// the cumulative ACK, then record the reported blocks.
    pub(crate) fn sender_recv_sack(&mut self, hdr: &TcpHeader) {
        let TcpOption::Sack(blocks) = &hdr.options else { return };
        if hdr.has(TCP_FLAG_ACK) {
            self.snd_scoreboard.clear_blocks(hdr.ackno);
        }
        for (left, right) in blocks {
            self.snd_scoreboard.insert_block(*left, right.wrapping_sub(*left));
        }
    }

    /// The receiver saw a SYN (or any segment) carrying options: latch
    /// SACK permission.
    pub(crate) fn receiver_recv_sack_options(&mut self, hdr: &TcpHeader) {
        if matches!(hdr.options, TcpOption::SackPermitted) {
            self.sack_permitted = true;
        }
    }

    /// The receiver buffers a payload: record the range.
    pub(crate) fn receiver_record_sack(&mut self, seqno: u32, length: u32) {
        if length == 0 {
            return;
        }
        let mut s = seqno;
        let mut l = length;
        if self.rcv_scoreboard.is_new(&mut s, &mut l) {
            self.rcv_scoreboard.insert_block(s, l);
        }
    }

    /// Resend one segment at the next unsacked hole. `first` restarts the
    /// scan from the window base. Returns false when no hole remains below
    /// the recovery point.
    pub(crate) fn sack_resend_segments(&mut self, first: bool, env: &mut TcpEnv<'_, '_>) -> bool {
        let from = if first {
            self.sndwnd.as_ref().expect("send window").seq.start()
        } else {
            self.rxmit_seq
        };
        self.rxmit_seq = self.snd_scoreboard.unavailable(from);

        if seq_lt(self.rxmit_seq, self.recover_seq) {
            let at = self.rxmit_seq;
            self.resend_segments(at, 1, env);
            true
        } else {
            false
        }
    }

    /// Keep the pipe full during fast recovery: retransmit holes while
    /// room remains, then fall through to new data.
    pub(crate) fn sack_send_in_fast_recovery(&mut self, env: &mut TcpEnv<'_, '_>) {
        let mut found = true;
        while self.sack_pipe < self.cwnd && found {
            if !self.sack_resend_segments(false, env) {
                found = false;
            } else {
                self.sack_pipe += self.mss;
            }
        }

        if !found && self.sndwnd.as_ref().expect("send window").seq.unused() >= self.mss {
            let first = self.sndwnd.as_ref().expect("send window").seq.first_unused();
            let budget = self.cwnd.saturating_sub(self.sack_pipe);
            self.sack_pipe += self.segment_and_send(first, budget, env);
        }
    }
}
