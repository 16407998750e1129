//! The TCP receiver's sliding window: a sorted list of received segments
//! plus the pending application receive request. Arriving packets either
//! perfectly overlap an existing segment or are disjoint from all of them;
//! adjacent fake segments merge.

use crate::message::DataMessage;
use crate::tcp::seqwnd::{seq_leq, seq_lt, SeqWindow};

#[derive(Debug, Clone)]
struct Segment {
    seqno: u32,
    length: u32,
    /// `None` for fake data.
    data: Option<Vec<u8>>,
}

pub struct RecvWindow {
    pub seq: SeqWindow,
    segments: Vec<Segment>,
    highest_seqno: u32,
    /// Outstanding application receive request, in bytes; 0 when none.
    pending_size: u32,
    /// Real bytes accumulated for the application since the last request.
    appl_buf: Vec<u8>,
    /// Bytes moved toward the application since the last request.
    appl_data_rcvd: u32,
}

impl RecvWindow {
    pub fn new(initseq: u32, winsize: u32) -> Self {
        RecvWindow {
            seq: SeqWindow::new(initseq, winsize),
            segments: Vec::new(),
            highest_seqno: 0,
            pending_size: 0,
            appl_buf: Vec::new(),
            appl_data_rcvd: 0,
        }
    }

    pub fn empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether contiguous data waits at the expected sequence number.
    pub fn available(&self) -> bool {
        self.segments.first().map(|s| s.seqno == self.seq.expect()).unwrap_or(false)
    }

    pub fn highest_seqno(&self) -> u32 {
        self.highest_seqno
    }

    /// Bytes currently buffered (claimed window capacity).
    pub fn buffered_bytes(&self) -> u32 {
        self.segments.iter().map(|s| s.length).sum()
    }

    /// The contiguous run of undelivered bytes at the window base.
    fn in_order_buffered(&self) -> u32 {
        let mut e = self.seq.start().wrapping_add(self.seq.syn() as u32);
        let mut total = 0;
        for seg in &self.segments {
            if seg.seqno == e {
                total += seg.length;
                e = e.wrapping_add(seg.length);
            } else {
                break;
            }
        }
        total
    }

    /// What we advertise to the peer. Out-of-order segments do not shrink
    /// the advertisement: a stable window across duplicate ACKs is what
    /// lets the sender count them.
    pub fn free_in_buffer(&self) -> u32 {
        self.seq.win_size() - self.in_order_buffered()
    }

    /// The cumulative-ACK sequence number: everything contiguously
    /// received from the window base, plus the FIN slot once all buffered
    /// data is contiguous.
    pub fn expected_seqno(&self) -> u32 {
        let mut e = self.seq.start().wrapping_add(self.seq.syn() as u32);
        let mut idx = 0;
        while idx < self.segments.len() && self.segments[idx].seqno == e {
            e = e.wrapping_add(self.segments[idx].length);
            idx += 1;
        }
        if self.seq.fin() && idx == self.segments.len() {
            e = e.wrapping_add(1);
        }
        e
    }

    /// Insert an arriving payload at `seqno`. Out-of-window and duplicate
    /// data is dropped silently.
    pub fn add_to_buffer(&mut self, payload: DataMessage, seqno: u32) {
        let length = payload.real_byte_count();
        if length == 0 {
            return;
        }
        let expect = self.seq.expect();
        // stale retransmission or beyond our advertised capacity
        if seq_lt(seqno, expect)
            || !seq_leq(
                seqno.wrapping_add(length),
                expect.wrapping_add(self.seq.unused()),
            )
        {
            return;
        }

        let pos = self.segments.partition_point(|s| seq_lt(s.seqno, seqno));
        if self.segments.get(pos).map(|s| s.seqno == seqno).unwrap_or(false) {
            return; // perfect overlap with an existing segment
        }

        let data = if payload.chunks.iter().any(crate::message::DataChunk::is_real) {
            Some(payload.real_bytes())
        } else {
            None
        };
        if !self.seq.use_slots(length) {
            return;
        }
        self.segments.insert(pos, Segment { seqno, length, data });

        if seq_lt(self.highest_seqno, seqno.wrapping_add(length)) {
            self.highest_seqno = seqno.wrapping_add(length);
        }

        self.merge_adjacent_fake(pos);
        if pos > 0 {
            self.merge_adjacent_fake(pos - 1);
        }
    }

    /// Adjacent segments with matching fake data merge into one.
    fn merge_adjacent_fake(&mut self, idx: usize) {
        if idx + 1 >= self.segments.len() {
            return;
        }
        let (a, b) = (&self.segments[idx], &self.segments[idx + 1]);
        if a.data.is_none()
            && b.data.is_none()
            && a.seqno.wrapping_add(a.length) == b.seqno
        {
            let extra = b.length;
            self.segments.remove(idx + 1);
            self.segments[idx].length += extra;
        }
    }

    /// Copy up to `length` bytes of contiguous head data toward the
    /// application, advancing the window base. Returns the byte count;
    /// real content accumulates in the application buffer.
    pub fn generate(&mut self, length: u32) -> u32 {
        let mut copied = 0;
        while copied < length {
            let expect = self.seq.expect();
            let Some(head) = self.segments.first_mut() else { break };
            if head.seqno != expect {
                break;
            }
            let take = (length - copied).min(head.length);
            if let Some(bytes) = &mut head.data {
                self.appl_buf.extend(bytes.drain(..take as usize));
            }
            head.seqno = head.seqno.wrapping_add(take);
            head.length -= take;
            if head.length == 0 {
                self.segments.remove(0);
            }
            self.seq.shift(take);
            copied += take;
        }
        copied
    }

    /// The application could not be satisfied synchronously: remember how
    /// much it still wants.
    pub fn set_recv_params(&mut self, size: u32) {
        debug_assert_eq!(self.pending_size, 0);
        self.pending_size = size;
    }

    pub fn reset_recv_params(&mut self) {
        self.pending_size = 0;
    }

    pub fn pending_recv(&self) -> u32 {
        self.pending_size
    }

    /// Bytes moved toward the application since the last request.
    pub fn data_received(&self) -> u32 {
        self.appl_data_rcvd
    }

    pub fn add_data_received(&mut self, n: u32) {
        self.appl_data_rcvd += n;
    }

    pub fn clear_data_received(&mut self) {
        self.appl_data_rcvd = 0;
    }

    /// Take the real bytes accumulated for the application.
    pub fn take_appl_buf(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.appl_buf)
    }

    pub fn reset(&mut self, initseq: u32) {
        self.seq.reset(initseq);
        self.segments.clear();
        self.highest_seqno = 0;
        self.pending_size = 0;
        self.appl_buf.clear();
        self.appl_data_rcvd = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wnd() -> RecvWindow {
        let mut w = RecvWindow::new(1000, 1000);
        w.seq.set_syn(true); // data starts at 1001
        w
    }

    #[test]
    fn in_order_data_is_available() {
        let mut w = wnd();
        assert!(!w.available());
        w.add_to_buffer(DataMessage::fake(100), 1001);
        assert!(w.available());
        assert_eq!(w.expected_seqno(), 1101);
    }

    #[test]
    fn out_of_order_waits_for_the_gap() {
        let mut w = wnd();
        w.add_to_buffer(DataMessage::fake(100), 1101);
        assert!(!w.available());
        assert_eq!(w.expected_seqno(), 1001);
        w.add_to_buffer(DataMessage::fake(100), 1001);
        assert!(w.available());
        // fake neighbors merged into one contiguous run
        assert_eq!(w.expected_seqno(), 1201);
        assert_eq!(w.buffered_bytes(), 200);
    }

    #[test]
    fn duplicates_are_ignored() {
        let mut w = wnd();
        w.add_to_buffer(DataMessage::fake(100), 1001);
        w.add_to_buffer(DataMessage::fake(100), 1001);
        assert_eq!(w.buffered_bytes(), 100);
    }

    #[test]
    fn generate_consumes_contiguous_head() {
        let mut w = wnd();
        w.add_to_buffer(DataMessage::real((0u8..100).collect()), 1001);
        assert_eq!(w.generate(60), 60);
        assert_eq!(w.take_appl_buf(), (0u8..60).collect::<Vec<_>>());
        // the remaining 40 bytes follow on the next call
        assert_eq!(w.generate(60), 40);
        assert_eq!(w.take_appl_buf(), (60u8..100).collect::<Vec<_>>());
        assert!(w.empty());
    }

    #[test]
    fn generate_stops_at_gaps() {
        let mut w = wnd();
        w.add_to_buffer(DataMessage::fake(50), 1001);
        w.add_to_buffer(DataMessage::fake(50), 1101);
        assert_eq!(w.generate(200), 50);
        assert!(!w.available());
    }

    #[test]
    fn fin_extends_expected_seqno_only_when_drained() {
        let mut w = wnd();
        w.add_to_buffer(DataMessage::fake(100), 1001);
        w.seq.set_fin(true);
        assert_eq!(w.expected_seqno(), 1102);
        // a gap holds the FIN back
        w.add_to_buffer(DataMessage::fake(10), 1201);
        assert_eq!(w.expected_seqno(), 1101);
    }

    #[test]
    fn window_capacity_bounds_insertion() {
        let mut w = RecvWindow::new(0, 100);
        w.seq.set_syn(true);
        w.add_to_buffer(DataMessage::fake(100), 1);
        // full: further data does not fit
        w.add_to_buffer(DataMessage::fake(50), 101);
        assert_eq!(w.buffered_bytes(), 100);
    }
}
