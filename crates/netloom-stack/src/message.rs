//! Protocol messages through the stack. A message is the head of a
//! singly-linked payload chain: a MAC frame wrapping an IP header wrapping
//! a TCP or UDP header wrapping data. Appending a payload transfers
//! ownership to the parent header; taking it back returns ownership to the
//! caller; dropping a head frees the whole chain. No node is ever shared:
//! cloning deep-copies the chain.

use crate::ip::IpHeader;
use crate::nic::MacHeader;
use crate::session::ProtocolNum;
use crate::tcp::TcpHeader;
use crate::udp::UdpHeader;

/// A protocol message: one header (or data node) plus its payload chain.
/// The variant set doubles as the compile-time message-type registry, so an
/// unknown message type is a build error rather than a runtime one.
#[derive(Debug, Clone, PartialEq)]
pub enum NetMsg {
    Mac(MacHeader),
    Ip(IpHeader),
    Tcp(TcpHeader),
    Udp(UdpHeader),
    Data(DataMessage),
}

impl NetMsg {
    /// The protocol number this node represents, used by lower layers to
    /// demultiplex upward.
    pub fn protocol(&self) -> ProtocolNum {
        match self {
            NetMsg::Mac(_) => ProtocolNum::SimpleMac,
            NetMsg::Ip(_) => ProtocolNum::Ipv4,
            NetMsg::Tcp(_) => ProtocolNum::Tcp,
            NetMsg::Udp(_) => ProtocolNum::Udp,
            NetMsg::Data(_) => ProtocolNum::Invalid,
        }
    }

    pub fn payload(&self) -> Option<&NetMsg> {
        match self {
            NetMsg::Mac(h) => h.payload.as_deref(),
            NetMsg::Ip(h) => h.payload.as_deref(),
            NetMsg::Tcp(h) => h.payload.as_deref(),
            NetMsg::Udp(h) => h.payload.as_deref(),
            NetMsg::Data(_) => None,
        }
    }

    /// Append `payload`, transferring its ownership to this node. A data
    /// node cannot carry a payload.
    pub fn carry(&mut self, payload: NetMsg) {
        let slot = match self {
            NetMsg::Mac(h) => &mut h.payload,
            NetMsg::Ip(h) => &mut h.payload,
            NetMsg::Tcp(h) => &mut h.payload,
            NetMsg::Udp(h) => &mut h.payload,
            NetMsg::Data(_) => panic!("data messages cannot carry a payload"),
        };
        debug_assert!(slot.is_none(), "payload already attached");
        *slot = Some(Box::new(payload));
    }

    /// Drop the payload from the chain and return it, severing this head.
    pub fn take_payload(&mut self) -> Option<NetMsg> {
        let slot = match self {
            NetMsg::Mac(h) => &mut h.payload,
            NetMsg::Ip(h) => &mut h.payload,
            NetMsg::Tcp(h) => &mut h.payload,
            NetMsg::Udp(h) => &mut h.payload,
            NetMsg::Data(_) => return None,
        };
        slot.take().map(|b| *b)
    }

    /// The number of real (simulated-content) bytes across the whole
    /// chain, headers included.
    pub fn total_real_bytes(&self) -> u32 {
        let own = match self {
            NetMsg::Mac(h) => h.header_bytes(),
            NetMsg::Ip(h) => h.header_bytes(),
            NetMsg::Tcp(h) => h.header_bytes(),
            NetMsg::Udp(h) => h.header_bytes(),
            NetMsg::Data(d) => d.real_byte_count(),
        };
        own + self.payload().map_or(0, NetMsg::total_real_bytes)
    }

    /// Bytes this chain would occupy if serialized onto a wire. Used only
    /// for hypothetical on-the-wire accounting.
    pub fn packing_size(&self) -> u32 {
        self.total_real_bytes()
    }
}

/// One block of application data: a real length plus, optionally, the
/// actual bytes. Fake bytes count toward lengths and transmission times but
/// hold no content.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChunk {
    pub real_length: u32,
    pub data: Option<Vec<u8>>,
}

impl DataChunk {
    pub fn fake(real_length: u32) -> Self {
        DataChunk { real_length, data: None }
    }

    pub fn real(data: Vec<u8>) -> Self {
        DataChunk { real_length: data.len() as u32, data: Some(data) }
    }

    pub fn is_real(&self) -> bool {
        self.data.is_some()
    }
}

/// The data-carrying payload at the end of a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    pub chunks: Vec<DataChunk>,
}

impl DataMessage {
    pub fn fake(real_length: u32) -> Self {
        DataMessage { chunks: vec![DataChunk::fake(real_length)] }
    }

    pub fn real(data: Vec<u8>) -> Self {
        DataMessage { chunks: vec![DataChunk::real(data)] }
    }

    pub fn from_chunks(chunks: Vec<DataChunk>) -> Self {
        DataMessage { chunks }
    }

    pub fn real_byte_count(&self) -> u32 {
        self.chunks.iter().map(|c| c.real_length).sum()
    }

    /// Concatenated real bytes of the chunks that carry content.
    pub fn real_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for c in &self.chunks {
            if let Some(d) = &c.data {
                out.extend_from_slice(d);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::IpHeader;
    use crate::tcp::TcpHeader;
    use netloom::IpAddr;

    fn chain(data_len: u32) -> NetMsg {
        let mut tcp = NetMsg::Tcp(TcpHeader::new(1000, 80, 0, 0, 0, 0));
        tcp.carry(NetMsg::Data(DataMessage::fake(data_len)));
        let mut ip = NetMsg::Ip(IpHeader::new(
            IpAddr(1),
            IpAddr(2),
            ProtocolNum::Tcp,
            64,
        ));
        ip.carry(tcp);
        ip
    }

    #[test]
    fn total_real_bytes_sums_the_chain() {
        let msg = chain(100);
        // 20 (ip) + 20 (tcp) + 100 (data)
        assert_eq!(msg.total_real_bytes(), 140);
    }

    #[test]
    fn take_payload_severs_the_head() {
        let mut msg = chain(50);
        let tcp = msg.take_payload().unwrap();
        assert!(msg.payload().is_none());
        assert_eq!(tcp.total_real_bytes(), 70);
        assert_eq!(msg.total_real_bytes(), 20);
    }

    #[test]
    fn clone_is_deep() {
        let msg = chain(10);
        let mut copy = msg.clone();
        copy.take_payload();
        assert_eq!(msg.total_real_bytes(), 50);
        assert_eq!(copy.total_real_bytes(), 20);
    }

    #[test]
    fn data_message_mixes_real_and_fake() {
        let dm = DataMessage::from_chunks(vec![
            DataChunk::real(vec![1, 2, 3]),
            DataChunk::fake(7),
            DataChunk::real(vec![4]),
        ]);
        assert_eq!(dm.real_byte_count(), 11);
        assert_eq!(dm.real_bytes(), vec![1, 2, 3, 4]);
    }
}
