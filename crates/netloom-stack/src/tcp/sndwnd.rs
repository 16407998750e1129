//! The TCP sender's sliding window: a sequence window over a buffer of
//! outbound data chunks. Data the application offers beyond the buffer
//! capacity stays "in request" and is pulled in as acknowledgements free
//! space.

use std::collections::VecDeque;

use crate::message::{DataChunk, DataMessage};
use crate::tcp::seqwnd::SeqWindow;

pub struct SendWindow {
    pub seq: SeqWindow,
    buffer_size: u32,
    length_in_buffer: u32,
    length_in_request: u32,
    length_buffered: u32,
    chunks: VecDeque<DataChunk>,
}

impl SendWindow {
    /// Window size must be no larger than the buffer size (checked by the
    /// master's configuration).
    pub fn new(initseq: u32, bufsize: u32, wndsize: u32) -> Self {
        debug_assert!(wndsize <= bufsize);
        SendWindow {
            seq: SeqWindow::new(initseq, wndsize),
            buffer_size: bufsize,
            length_in_buffer: 0,
            length_in_request: 0,
            length_buffered: 0,
            chunks: VecDeque::new(),
        }
    }

    /// Bytes in the buffer not yet claimed by the window: what could be
    /// sent right now.
    pub fn can_send(&self) -> u32 {
        self.length_in_buffer - self.seq.used()
    }

    pub fn data_in_buffer(&self) -> u32 {
        self.length_in_buffer
    }

    pub fn free_in_buffer(&self) -> u32 {
        self.buffer_size - self.length_in_buffer
    }

    pub fn data_in_request(&self) -> u32 {
        self.length_in_request
    }

    /// Bytes accepted into the buffer since the last clear.
    pub fn data_buffered(&self) -> u32 {
        self.length_buffered
    }

    pub fn clear_data_buffered(&mut self) {
        self.length_buffered = 0;
    }

    /// Fabricate a payload message covering `[seqno, seqno+length)`, a
    /// range that must already reside in the buffer. Contiguous real bytes
    /// consolidate into one chunk; adjacent fake ranges merge.
    pub fn generate(&mut self, seqno: u32, length: u32) -> DataMessage {
        let mut offset = seqno.wrapping_sub(self.seq.start());
        debug_assert!(offset + length <= self.length_in_buffer);

        // find the chunk containing the start position
        let mut idx = 0;
        while idx < self.chunks.len() && offset >= self.chunks[idx].real_length {
            offset -= self.chunks[idx].real_length;
            idx += 1;
        }
        debug_assert!(idx < self.chunks.len());

        let mut out: Vec<DataChunk> = Vec::new();
        let mut remaining = length;
        while remaining > 0 {
            let chunk = &self.chunks[idx];
            let take = (chunk.real_length - offset).min(remaining);
            match &chunk.data {
                Some(bytes) => {
                    let piece = bytes[offset as usize..(offset + take) as usize].to_vec();
                    out.push(DataChunk::real(piece));
                }
                None => match out.last_mut() {
                    // merge with a fake tail by adding lengths
                    Some(tail) if !tail.is_real() => tail.real_length += take,
                    _ => out.push(DataChunk::fake(take)),
                },
            }
            remaining -= take;
            if remaining > 0 {
                idx += 1;
                offset = 0;
            }
        }
        DataMessage::from_chunks(out)
    }

    /// Acknowledged bytes: slide the window, drop them from the head of
    /// the buffer, and pull pending request bytes into the freed space.
    pub fn release(&mut self, length: u32) {
        self.seq.shift(length);
        self.release_buffer(length);
        self.add_to_buffer(self.length_in_request.min(self.free_in_buffer()));
    }

    /// The application offers `msg_len` more bytes (with content when
    /// `msg` is given). As much as fits moves into the buffer immediately.
    pub fn request_to_send(&mut self, msg: Option<Vec<u8>>, msg_len: u32) {
        let chunk = match msg {
            Some(bytes) => {
                debug_assert_eq!(bytes.len() as u32, msg_len);
                DataChunk::real(bytes)
            }
            None => DataChunk::fake(msg_len),
        };
        self.chunks.push_back(chunk);
        self.length_in_request += msg_len;
        self.add_to_buffer(msg_len.min(self.free_in_buffer()));
    }

    pub fn reset(&mut self, initseq: u32) {
        self.seq.reset(initseq);
        self.length_in_request = 0;
        self.length_in_buffer = 0;
        self.length_buffered = 0;
        self.chunks.clear();
    }

    fn add_to_buffer(&mut self, length: u32) {
        debug_assert!(self.length_in_buffer + length <= self.buffer_size);
        debug_assert!(length <= self.length_in_request);
        self.length_in_buffer += length;
        self.length_in_request -= length;
        self.length_buffered += length;
    }

    fn release_buffer(&mut self, mut length: u32) {
        debug_assert!(length <= self.length_in_buffer);
        self.length_in_buffer -= length;
        while length > 0 {
            let head = self.chunks.front_mut().expect("released past buffered data");
            if head.real_length > length {
                head.real_length -= length;
                if let Some(bytes) = &mut head.data {
                    bytes.drain(..length as usize);
                }
                length = 0;
            } else {
                length -= head.real_length;
                self.chunks.pop_front();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_fills_buffer_then_queues() {
        let mut w = SendWindow::new(0, 100, 50);
        w.request_to_send(None, 80);
        assert_eq!(w.data_in_buffer(), 80);
        assert_eq!(w.data_in_request(), 0);
        w.request_to_send(None, 80);
        assert_eq!(w.data_in_buffer(), 100);
        assert_eq!(w.data_in_request(), 60);
        assert_eq!(w.data_buffered(), 100);
    }

    #[test]
    fn release_slides_and_refills() {
        let mut w = SendWindow::new(1000, 100, 50);
        w.request_to_send(None, 160);
        assert!(w.seq.use_slots(50));

        w.release(30);
        assert_eq!(w.seq.start(), 1030);
        assert_eq!(w.seq.used(), 20);
        // 30 freed bytes pull 30 request bytes in
        assert_eq!(w.data_in_buffer(), 100);
        assert_eq!(w.data_in_request(), 30);
    }

    #[test]
    fn generate_copies_real_bytes() {
        let mut w = SendWindow::new(0, 100, 100);
        w.request_to_send(Some((0u8..40).collect()), 40);
        let dm = w.generate(10, 20);
        assert_eq!(dm.real_byte_count(), 20);
        assert_eq!(dm.real_bytes(), (10u8..30).collect::<Vec<_>>());
    }

    #[test]
    fn generate_spans_chunks_and_merges_fake() {
        let mut w = SendWindow::new(0, 100, 100);
        w.request_to_send(None, 10);
        w.request_to_send(None, 10);
        w.request_to_send(Some(vec![7; 10]), 10);
        let dm = w.generate(5, 22);
        // 15 fake bytes merge into one chunk, then 7 real bytes
        assert_eq!(dm.chunks.len(), 2);
        assert_eq!(dm.chunks[0].real_length, 15);
        assert!(!dm.chunks[0].is_real());
        assert_eq!(dm.chunks[1].real_length, 7);
        assert_eq!(dm.real_byte_count(), 22);
    }

    #[test]
    fn release_drops_real_prefix() {
        let mut w = SendWindow::new(0, 100, 100);
        w.request_to_send(Some((0u8..30).collect()), 30);
        w.seq.use_slots(30);
        w.release(10);
        let dm = w.generate(10, 10);
        assert_eq!(dm.real_bytes(), (10u8..20).collect::<Vec<_>>());
    }

    #[test]
    fn can_send_tracks_window_claims() {
        let mut w = SendWindow::new(0, 100, 50);
        w.request_to_send(None, 40);
        assert_eq!(w.can_send(), 40);
        w.seq.use_slots(25);
        assert_eq!(w.can_send(), 15);
    }
}
