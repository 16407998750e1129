//! The TCP segment header.

use crate::message::NetMsg;
use crate::tcp::SACK_MAX_BLOCKS;

pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;
pub const TCP_FLAG_URG: u8 = 0x20;

pub(crate) const TCP_HDR_LENGTH: u32 = 20;
pub(crate) const TCP_HDR_LENGTH_IN_WORDS: u8 = 5;

/// TCP options carried in the header. The SACK option always reserves the
/// full four-block length on the wire, whatever the valid count, so
/// bandwidth accounting does not depend on the scoreboard state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpOption {
    None,
    /// Kind 4: SACK permitted, sent with SYN.
    SackPermitted,
    /// Kind 5: up to four `[left, right)` sacked blocks.
    Sack(Vec<(u32, u32)>),
}

impl TcpOption {
    /// Bytes the option occupies in the header (padded to 32-bit words).
    pub fn wire_bytes(&self) -> u32 {
        match self {
            TcpOption::None => 0,
            TcpOption::SackPermitted => 4,
            TcpOption::Sack(_) => 4 + 8 * SACK_MAX_BLOCKS as u32,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seqno: u32,
    pub ackno: u32,
    pub flags: u8,
    /// Advertised receive window, in bytes.
    pub wsize: u32,
    /// Header length in 32-bit words, options included.
    pub length_words: u8,
    pub options: TcpOption,
    pub payload: Option<Box<NetMsg>>,
}

impl TcpHeader {
    pub fn new(src_port: u16, dst_port: u16, seqno: u32, ackno: u32, flags: u8, wsize: u32) -> Self {
        TcpHeader {
            src_port,
            dst_port,
            seqno,
            ackno,
            flags,
            wsize,
            length_words: TCP_HDR_LENGTH_IN_WORDS,
            options: TcpOption::None,
            payload: None,
        }
    }

    pub fn with_options(mut self, options: TcpOption) -> Self {
        self.length_words = TCP_HDR_LENGTH_IN_WORDS + (options.wire_bytes() / 4) as u8;
        self.options = options;
        self
    }

    pub fn header_bytes(&self) -> u32 {
        self.length_words as u32 * 4
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}
