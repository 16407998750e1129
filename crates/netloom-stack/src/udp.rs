//! The UDP layer: connectionless datagram delivery with optional
//! `connect`-style endpoint pinning. The master demultiplexes arriving
//! datagrams to its sessions; each session buffers payloads until the
//! application drains them.

use std::collections::VecDeque;

use log::debug;
use netloom::{IpAddr, SchedContext};

use crate::host::Host;
use crate::ip::DEFAULT_TTL;
use crate::message::{DataChunk, DataMessage, NetMsg};
use crate::session::{PopInfo, ProtocolNum, PushInfo, SessionMaster, StackOp};
use crate::socket::{signal, SocketSignal};

pub(crate) const UDP_HDR_LEN: u32 = 8;
const DEFAULT_MAX_DATAGRAM: u32 = 65_507;

/// The UDP datagram header.
#[derive(Debug, Clone, PartialEq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Option<Box<NetMsg>>,
}

impl UdpHeader {
    pub fn new(src_port: u16, dst_port: u16) -> Self {
        UdpHeader { src_port, dst_port, payload: None }
    }

    pub fn header_bytes(&self) -> u32 {
        UDP_HDR_LEN
    }
}

/// One UDP session: an endpoint pair plus a receive buffer.
pub struct UdpSession {
    #[allow(dead_code)]
    pub(crate) id: usize,
    pub(crate) socket: i32,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    is_connected: bool,
    rcvbuf: VecDeque<DataMessage>,
    rcvbuf_len: u32,
    /// Offset into the first buffered message: the next byte to hand the
    /// application.
    rcvbuf_offset: u32,
    pending_size: u32,
    appl_buf: Vec<u8>,
    appl_data_rcvd: u32,
}

impl UdpSession {
    fn new(id: usize, socket: i32) -> Self {
        UdpSession {
            id,
            socket,
            src_ip: IpAddr::ANY,
            src_port: 0,
            dst_ip: IpAddr::ANYDEST,
            dst_port: 0,
            is_connected: false,
            rcvbuf: VecDeque::new(),
            rcvbuf_len: 0,
            rcvbuf_offset: 0,
            pending_size: 0,
            appl_buf: Vec::new(),
            appl_data_rcvd: 0,
        }
    }

    pub fn connected(&self) -> bool {
        self.is_connected
    }

    fn wake_app(&self, sig: u32, nbytes: u32, host: &mut Host) {
        host.signal_socket(SocketSignal { sock: self.socket, signal: sig, nbytes });
    }

    fn clear_app_state(&self, sig: u32, host: &mut Host) {
        host.clear_socket_signal(SocketSignal { sock: self.socket, signal: sig, nbytes: 0 });
    }

    /// Fragment and emit `length` bytes toward the pinned (or previously
    /// adopted) destination. Always accepts everything.
    fn send(&mut self, length: u32, data: Option<Vec<u8>>, max_datagram: u32, host: &mut Host) -> i64 {
        if self.dst_ip == IpAddr::ANYDEST {
            return -1;
        }
        let mut remaining = length;
        let mut offset = 0u32;
        while remaining > 0 {
            let frag = remaining.min(max_datagram);
            let chunk = match &data {
                Some(bytes) => {
                    DataChunk::real(bytes[offset as usize..(offset + frag) as usize].to_vec())
                }
                None => DataChunk::fake(frag),
            };
            let mut msg = NetMsg::Udp(UdpHeader::new(self.src_port, self.dst_port));
            msg.carry(NetMsg::Data(DataMessage::from_chunks(vec![chunk])));
            host.push_op(StackOp::Push {
                to: ProtocolNum::Ipv4,
                msg,
                info: PushInfo {
                    src: self.src_ip,
                    dst: self.dst_ip,
                    protocol: ProtocolNum::Udp,
                    ttl: DEFAULT_TTL,
                },
            });
            remaining -= frag;
            offset += frag;
        }
        self.wake_app(signal::OK_TO_SEND, length, host);
        length as i64
    }

    /// Hand buffered datagram bytes to the application; an unsatisfied
    /// request becomes pending.
    fn recv(&mut self, length: u32, host: &mut Host) -> i64 {
        self.appl_data_rcvd = 0;
        self.pending_size = 0;
        let got = self.generate(length);
        if got == 0 {
            self.pending_size = length;
            self.clear_app_state(signal::DATA_AVAILABLE, host);
        }
        got as i64
    }

    /// A datagram arrived: buffer it, then satisfy a pending receive.
    fn receive(&mut self, payload: DataMessage, host: &mut Host) {
        let len = payload.real_byte_count();
        if len == 0 {
            return;
        }
        self.rcvbuf.push_back(payload);
        self.rcvbuf_len += len;

        if self.pending_size > 0 {
            let want = self.pending_size;
            let got = self.generate(want);
            if got > 0 {
                self.pending_size = 0;
                self.appl_data_rcvd += got;
                self.wake_app(signal::DATA_AVAILABLE, got, host);
            }
        } else {
            self.wake_app(signal::DATA_AVAILABLE, 0, host);
        }
    }

    /// Sequentially consume head messages; a partial consume of the final
    /// message advances the offset. Real bytes are copied when present.
    fn generate(&mut self, length: u32) -> u32 {
        let mut copied = 0;
        while copied < length {
            let Some(head) = self.rcvbuf.front() else { break };
            let head_remaining = head.real_byte_count() - self.rcvbuf_offset;
            let take = head_remaining.min(length - copied);
            if head.chunks.iter().any(DataChunk::is_real) {
                let bytes = head.real_bytes();
                let from = self.rcvbuf_offset as usize;
                self.appl_buf.extend_from_slice(&bytes[from..from + take as usize]);
            }
            copied += take;
            self.rcvbuf_len -= take;
            if take == head_remaining {
                self.rcvbuf.pop_front();
                self.rcvbuf_offset = 0;
            } else {
                self.rcvbuf_offset += take;
            }
        }
        copied
    }
}

/// The UDP master: session bookkeeping and datagram demultiplexing.
pub struct UdpMaster {
    max_datagram_size: u32,
    sessions: Vec<Option<UdpSession>>,
}

impl Default for UdpMaster {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DATAGRAM)
    }
}

impl UdpMaster {
    pub fn new(max_datagram_size: u32) -> Self {
        UdpMaster { max_datagram_size, sessions: Vec::new() }
    }

    pub fn session(&self, id: usize) -> Option<&UdpSession> {
        self.sessions.get(id).and_then(Option::as_ref)
    }

    /// A datagram popped out of IP: demultiplex. A connected session
    /// matching the 4-tuple wins; otherwise an unconnected session on the
    /// right port adopts the peer endpoint; otherwise the datagram drops.
    pub fn pop(
        &mut self,
        msg: NetMsg,
        info: PopInfo,
        host: &mut Host,
        _ctx: &mut SchedContext<'_>,
    ) {
        let NetMsg::Udp(mut hdr) = msg else {
            debug!("udp master: non-udp message popped up, dropped");
            return;
        };
        let Some(NetMsg::Data(payload)) = hdr.payload.take().map(|b| *b) else {
            return;
        };

        for s in self.sessions.iter_mut().flatten() {
            if s.is_connected
                && s.dst_ip == info.src_ip
                && s.src_port == hdr.dst_port
                && s.dst_port == hdr.src_port
            {
                s.receive(payload, host);
                return;
            }
        }
        for s in self.sessions.iter_mut().flatten() {
            if !s.is_connected && s.src_port == hdr.dst_port {
                // adopt the arriving peer so replies have a destination
                s.dst_ip = info.src_ip;
                s.dst_port = hdr.src_port;
                s.receive(payload, host);
                return;
            }
        }
        debug!(
            "udp master: no session for {}:{} -> port {}, datagram dropped",
            info.src_ip, hdr.src_port, hdr.dst_port
        );
    }
}

impl SessionMaster for UdpMaster {
    fn create_session(&mut self, sock: i32) -> usize {
        let id = match self.sessions.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                self.sessions.push(None);
                self.sessions.len() - 1
            }
        };
        self.sessions[id] = Some(UdpSession::new(id, sock));
        id
    }

    fn set_source(&mut self, id: usize, ip: IpAddr, port: u16) -> bool {
        match self.sessions.get_mut(id).and_then(Option::as_mut) {
            Some(s) => {
                s.src_ip = ip;
                s.src_port = port;
                true
            }
            None => false,
        }
    }

    fn connect(
        &mut self,
        id: usize,
        ip: IpAddr,
        port: u16,
        host: &mut Host,
        _ctx: &mut SchedContext<'_>,
    ) -> bool {
        let Some(s) = self.sessions.get_mut(id).and_then(Option::as_mut) else {
            return false;
        };
        s.dst_ip = ip;
        s.dst_port = port;
        s.is_connected = true;
        s.wake_app(signal::OK_TO_SEND, 0, host);
        true
    }

    fn listen(&mut self, _id: usize, _host: &mut Host, _ctx: &mut SchedContext<'_>) -> bool {
        // datagram sessions have no passive open
        false
    }

    fn send(
        &mut self,
        id: usize,
        length: u32,
        data: Option<Vec<u8>>,
        host: &mut Host,
        _ctx: &mut SchedContext<'_>,
    ) -> i64 {
        let max = self.max_datagram_size;
        match self.sessions.get_mut(id).and_then(Option::as_mut) {
            Some(s) => s.send(length, data, max, host),
            None => -1,
        }
    }

    fn recv(&mut self, id: usize, length: u32, host: &mut Host, _ctx: &mut SchedContext<'_>) -> i64 {
        match self.sessions.get_mut(id).and_then(Option::as_mut) {
            Some(s) => s.recv(length, host),
            None => -1,
        }
    }

    fn disconnect(&mut self, id: usize, host: &mut Host, _ctx: &mut SchedContext<'_>) {
        if let Some(s) = self.sessions.get_mut(id).and_then(Option::as_mut) {
            s.is_connected = false;
            s.wake_app(signal::CONN_CLOSED | signal::SESSION_RELEASED, 0, host);
        }
    }

    fn abort(&mut self, id: usize, _host: &mut Host, _ctx: &mut SchedContext<'_>) {
        if let Some(s) = self.sessions.get_mut(id).and_then(Option::as_mut) {
            s.is_connected = false;
            s.rcvbuf.clear();
            s.rcvbuf_len = 0;
            s.rcvbuf_offset = 0;
        }
    }

    fn connected(&self, id: usize) -> bool {
        self.sessions
            .get(id)
            .and_then(Option::as_ref)
            .map(UdpSession::connected)
            .unwrap_or(false)
    }

    fn release(&mut self, id: usize) {
        if let Some(slot) = self.sessions.get_mut(id) {
            *slot = None;
        }
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
            .map(|s| std::mem::take(&mut s.appl_buf))
            .unwrap_or_default()
    }

    fn dst_endpoint(&self, id: usize) -> Option<(IpAddr, u16)> {
        self.sessions
            .get(id)
            .and_then(Option::as_ref)
            .filter(|s| s.is_connected)
            .map(|s| (s.dst_ip, s.dst_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_spans_datagrams_with_offset() {
        let mut s = UdpSession::new(0, 1);
        s.rcvbuf.push_back(DataMessage::real(vec![1, 2, 3, 4]));
        s.rcvbuf.push_back(DataMessage::real(vec![5, 6, 7, 8]));
        s.rcvbuf_len = 8;

        assert_eq!(s.generate(3), 3);
        assert_eq!(s.rcvbuf_offset, 3);
        assert_eq!(s.generate(3), 3);
        // crossed the datagram boundary
        assert_eq!(s.rcvbuf_offset, 2);
        assert_eq!(s.generate(10), 2);
        assert_eq!(s.appl_buf, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(s.rcvbuf.is_empty());
    }

    #[test]
    fn fake_datagrams_count_without_content() {
        let mut s = UdpSession::new(0, 1);
        s.rcvbuf.push_back(DataMessage::fake(100));
        s.rcvbuf_len = 100;
        assert_eq!(s.generate(60), 60);
        assert_eq!(s.generate(60), 40);
        assert!(s.appl_buf.is_empty());
    }
}
