//! The network layer: routing, TTL, and demultiplexing between the
//! transports above and the interfaces below.

use log::{debug, warn};
use netloom::{IpAddr, SchedContext};

use crate::host::Host;
use crate::message::NetMsg;
use crate::session::{PopInfo, ProtocolNum, PushInfo, StackOp};

pub(crate) const IP_HDR_LEN: u32 = 20;
pub const DEFAULT_TTL: u8 = 64;
/// The largest packet the network layer will carry.
#[allow(dead_code)]
pub(crate) const IP_MAX_PKT: u32 = 65_536;

/// The network-layer header.
#[derive(Debug, Clone, PartialEq)]
pub struct IpHeader {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: ProtocolNum,
    pub ttl: u8,
    pub payload: Option<Box<NetMsg>>,
}

impl IpHeader {
    pub fn new(src: IpAddr, dst: IpAddr, protocol: ProtocolNum, ttl: u8) -> Self {
        IpHeader { src, dst, protocol, ttl, payload: None }
    }

    pub fn header_bytes(&self) -> u32 {
        IP_HDR_LEN
    }
}

/// Typed outcome of a push into the network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpPushResult {
    ToLocalDone,
    DownDone,
    NoRoute,
    DroppedTtlLimit,
}

/// Typed outcome of a pop out of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpPopResult {
    UpDone,
    ForwardDone,
    DroppedNoRoute,
    DroppedTtlLimit,
    DroppedNoProtocol,
}

/// The IP session of one host.
#[derive(Default)]
pub struct IpSession {
    pub drops_no_route: u64,
    pub drops_ttl: u64,
    pub drops_no_protocol: u64,
    pub forwards: u64,
}

impl IpSession {
    pub fn new() -> Self {
        IpSession::default()
    }

    /// A transport pushed a segment down: wrap it in an IP header, then
    /// either loop it back up (destination is one of our addresses) or
    /// route it out of an interface.
    pub fn push(
        &mut self,
        msg: NetMsg,
        info: PushInfo,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) -> IpPushResult {
        // deliver-local without touching the wire
        if host.iface_with_addr(info.dst).is_some() {
            debug!("ip {}: push to local {}", host.nhi, info.dst);
            host.push_op(StackOp::Pop {
                to: info.protocol,
                msg,
                info: PopInfo {
                    src_ip: info.dst,
                    dst_ip: info.dst,
                    ttl: info.ttl,
                    iface: u32::MAX,
                },
            });
            return IpPushResult::ToLocalDone;
        }

        if info.ttl == 0 {
            self.drops_ttl += 1;
            warn!("ip {}: push dropped, ttl limit ({})", host.nhi, info.dst);
            return IpPushResult::DroppedTtlLimit;
        }

        let Some(route) = host.fib.get_route(info.dst) else {
            self.drops_no_route += 1;
            warn!("ip {}: no route to {}", host.nhi, info.dst);
            return IpPushResult::NoRoute;
        };

        let src = if info.src == IpAddr::ANY {
            match host.ifaces.get(route.iface as usize) {
                Some(ifc) => ifc.ip,
                None => {
                    self.drops_no_route += 1;
                    warn!("ip {}: route names unknown interface {}", host.nhi, route.iface);
                    return IpPushResult::NoRoute;
                }
            }
        } else {
            info.src
        };

        let mut ip_msg = NetMsg::Ip(IpHeader::new(src, info.dst, info.protocol, info.ttl));
        ip_msg.carry(msg);

        let next_hop = if route.next_hop == IpAddr::ANY { info.dst } else { route.next_hop };
        host.transmit(route.iface, next_hop, ip_msg, ctx);
        IpPushResult::DownDone
    }

    /// A packet arrived from an interface: deliver it locally or forward
    /// it.
    pub fn pop(
        &mut self,
        msg: NetMsg,
        info: PopInfo,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) -> IpPopResult {
        let NetMsg::Ip(mut hdr) = msg else {
            warn!("ip {}: non-ip message popped up, dropped", host.nhi);
            return IpPopResult::DroppedNoProtocol;
        };

        if host.iface_with_addr(hdr.dst).is_some() {
            // ours: demultiplex to the transport above
            if host.graph.index_by_num(hdr.protocol).is_none() {
                self.drops_no_protocol += 1;
                warn!("ip {}: no session for {:?}, packet dropped", host.nhi, hdr.protocol);
                return IpPopResult::DroppedNoProtocol;
            }
            let Some(payload) = hdr.payload.take().map(|b| *b) else {
                return IpPopResult::DroppedNoProtocol;
            };
            host.push_op(StackOp::Pop {
                to: hdr.protocol,
                msg: payload,
                info: PopInfo {
                    src_ip: hdr.src,
                    dst_ip: hdr.dst,
                    ttl: hdr.ttl,
                    iface: info.iface,
                },
            });
            return IpPopResult::UpDone;
        }

        // forwarding path
        if hdr.ttl <= 1 {
            self.drops_ttl += 1;
            warn!("ip {}: forward dropped, ttl limit ({})", host.nhi, hdr.dst);
            return IpPopResult::DroppedTtlLimit;
        }
        let Some(route) = host.fib.get_route(hdr.dst) else {
            self.drops_no_route += 1;
            warn!("ip {}: forward, no route to {}", host.nhi, hdr.dst);
            return IpPopResult::DroppedNoRoute;
        };

        hdr.ttl -= 1;
        let dst = hdr.dst;
        let next_hop = if route.next_hop == IpAddr::ANY { dst } else { route.next_hop };
        debug!("ip {}: forward {} via iface {}", host.nhi, dst, route.iface);
        host.transmit(route.iface, next_hop, NetMsg::Ip(hdr), ctx);
        self.forwards += 1;
        IpPopResult::ForwardDone
    }
}
