//! Network interfaces: the MAC and PHY sessions plus the outbound channel
//! of one attachment point. The MAC is the simple simulated kind: frames
//! carry the next hop's IP address in place of a resolved hardware address
//! (the classic simulation shortcut for ARP), and delivery filters on it.

use log::debug;
use netloom::{IpAddr, Ltime, Mac48Addr, Nhi, OutChannelId, SchedContext, TickScale};
use rand_core::RngCore;
use rand_xoshiro::Xoshiro256StarStar;

use crate::message::NetMsg;
use crate::queue::NicQueue;

pub(crate) const MAC_HDR_LEN: u32 = 14;

/// The link-layer frame header.
#[derive(Debug, Clone, PartialEq)]
pub struct MacHeader {
    pub src: Mac48Addr,
    /// Where the frame is headed; the next hop's interface address, or
    /// `ANYDEST` for broadcast.
    pub dst_ip: IpAddr,
    pub payload: Option<Box<NetMsg>>,
}

impl MacHeader {
    pub fn new(src: Mac48Addr, dst_ip: IpAddr) -> Self {
        MacHeader { src, dst_ip, payload: None }
    }

    pub fn header_bytes(&self) -> u32 {
        MAC_HDR_LEN
    }
}

/// The payload carried by a channel write: one frame in flight.
#[derive(Debug, Clone)]
pub struct RxFrame {
    pub msg: NetMsg,
}

/// The MAC session of an interface: frame encapsulation and the receive
/// filter.
pub struct MacSession {
    pub addr: Mac48Addr,
}

impl MacSession {
    pub fn encapsulate(&self, msg: NetMsg, next_hop: IpAddr) -> NetMsg {
        let mut frame = NetMsg::Mac(MacHeader::new(self.addr, next_hop));
        frame.carry(msg);
        frame
    }

    /// Strip the frame header if it is addressed to `local_ip` (or
    /// broadcast); `None` means the frame is not for us.
    pub fn decapsulate(&self, mut frame: NetMsg, local_ip: IpAddr) -> Option<NetMsg> {
        match &frame {
            NetMsg::Mac(h) if h.dst_ip == local_ip || h.dst_ip == IpAddr::ANYDEST => {
                frame.take_payload()
            }
            NetMsg::Mac(_) => None,
            _ => {
                debug!("mac: non-frame message on the wire, dropped");
                None
            }
        }
    }
}

/// The PHY session of an interface: the nic queue and the channel write.
pub struct PhySession {
    pub queue: NicQueue,
}

impl PhySession {
    /// Admit the frame to the queue; returns the computed departure delay
    /// or `None` on drop.
    pub fn send_packet(
        &mut self,
        len: u32,
        now: Ltime,
        rng: &mut impl RngCore,
        scale: TickScale,
    ) -> Option<Ltime> {
        self.queue.enqueue(len, now, rng, scale)
    }
}

/// One attachment point of a host: addresses, the MAC and PHY sessions,
/// and the out-channel toward the link.
pub struct NetworkInterface {
    pub id: u32,
    pub nhi: Nhi,
    pub ip: IpAddr,
    pub mac: MacSession,
    pub phy: PhySession,
    pub out_channel: OutChannelId,
    pub rng: Xoshiro256StarStar,
}

impl NetworkInterface {
    /// Push a network-layer chain onto the wire toward `next_hop`.
    pub fn transmit(
        &mut self,
        next_hop: IpAddr,
        msg: NetMsg,
        tie: u64,
        ctx: &mut SchedContext<'_>,
    ) {
        let frame = self.mac.encapsulate(msg, next_hop);
        let len = frame.total_real_bytes();
        match self.phy.send_packet(len, ctx.now(), &mut self.rng, ctx.scale()) {
            Some(delay) => {
                debug!("nic {}: tx {} bytes, departure in {} ticks", self.nhi, len, delay);
                ctx.write(self.out_channel, Box::new(RxFrame { msg: frame }), delay, tie);
            }
            None => {
                debug!("nic {}: queue dropped {} byte frame", self.nhi, len);
            }
        }
    }

    /// A frame arrived from the link; returns the network-layer payload if
    /// the frame is addressed to us.
    pub fn receive(&mut self, frame: NetMsg) -> Option<NetMsg> {
        self.mac.decapsulate(frame, self.ip)
    }

    pub fn queue_drops(&self) -> u64 {
        self.phy.queue.drops()
    }
}
