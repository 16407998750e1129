//! The TCP layer: a master session owning every TCP session of a host,
//! driving their slow/fast timers and demultiplexing arriving segments.
//! Sessions implement the full connection lifecycle, sliding windows, RTT
//! estimation, and Tahoe/Reno/NewReno/SACK congestion control.

pub mod blocks;
mod master;
pub mod message;
mod rcvwnd;
mod receiver;
mod sack;
mod sender;
mod seqwnd;
mod session;
mod sndwnd;
mod state;
#[cfg(test)]
mod tests;
mod timer;

pub use blocks::{BlockPattern, TcpBlockList};
pub use master::TcpMaster;
pub use message::{TcpHeader, TcpOption};
pub use rcvwnd::RecvWindow;
pub use session::{TcpSession, TcpState};
pub use sndwnd::SendWindow;

use netloom::{Error, Ltime, TickScale};

use crate::config::TcpInit;
use crate::ip::IP_HDR_LEN;
use crate::message::NetMsg;
use crate::tcp::message::TCP_HDR_LENGTH;

/// Duplicate-ACK threshold for fast retransmit.
pub(crate) const MAX_DUPACKS: u32 = 3;
/// Smoothed-RTT fixed-point shift (Jacobson/Karels).
pub(crate) const RTT_SHIFT: u32 = 3;
/// RTT-variance fixed-point shift.
pub(crate) const RTTVAR_SHIFT: u32 = 2;
/// TIME_WAIT lingers for this many MSLs.
pub(crate) const MSL_TIMEOUT_FACTOR: i64 = 2;
/// Retransmission timeout clamp, in seconds.
pub(crate) const RXMIT_MIN_TIMEOUT: f64 = 1.0;
pub(crate) const RXMIT_MAX_TIMEOUT: f64 = 64.0;
/// Exponential backoff multipliers, indexed by consecutive retransmits.
pub(crate) const BACKOFF: [i64; 13] = [1, 2, 4, 8, 16, 32, 64, 64, 64, 64, 64, 64, 64];
/// SACK blocks carried per ACK.
pub(crate) const SACK_MAX_BLOCKS: usize = 4;

/// The congestion-control flavor of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpVersion {
    Tahoe,
    Reno,
    NewReno,
    Sack,
}

/// Master-level configuration; sizes are in bytes after load-time scaling
/// by the MSS.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub version: TcpVersion,
    pub iss: u32,
    pub mss: u32,
    pub rcv_wnd_size: u32,
    pub snd_wnd_size: u32,
    pub snd_buf_size: u32,
    pub max_rxmit: u32,
    pub slow_timeout: Ltime,
    pub slow_timeout_secs: f64,
    pub fast_timeout: Ltime,
    pub fast_timeout_secs: f64,
    pub idle_timeout: Ltime,
    pub msl: Ltime,
    pub delayed_ack: bool,
    /// 0 means unbounded.
    pub max_cong_wnd: u32,
    pub boot_time_window: Ltime,
    pub boot_time_window_secs: f64,
}

impl TcpConfig {
    pub fn from_init(init: &TcpInit, scale: TickScale) -> Result<Self, Error> {
        let version = match init.version.as_str() {
            "tahoe" => TcpVersion::Tahoe,
            "reno" => TcpVersion::Reno,
            "new_reno" => TcpVersion::NewReno,
            "sack" => TcpVersion::Sack,
            other => {
                return Err(Error::Config(format!("unknown TCP version: {other}")));
            }
        };
        if init.mss == 0 || init.mss > IP_MAX_SEGMENT {
            return Err(Error::Config(format!(
                "tcpinit.mss ({}) must be in [1, {IP_MAX_SEGMENT}]",
                init.mss
            )));
        }
        if init.maxrexmittimes > 31 {
            return Err(Error::Config(format!(
                "tcpinit.maxrexmittimes ({}) must be in [0, 31]",
                init.maxrexmittimes
            )));
        }
        if init.sendwndsize > init.sendbuffersize {
            return Err(Error::Config(format!(
                "tcpinit.sendwndsize ({}) must be no larger than sendbuffersize ({})",
                init.sendwndsize, init.sendbuffersize
            )));
        }
        if init.tcp_slow_interval <= 0.0 || init.tcp_fast_interval <= 0.0 {
            return Err(Error::Config("tcp timer intervals must be positive".into()));
        }

        // the MSS-denominated sizes become bytes once the MSS is known
        Ok(TcpConfig {
            version,
            iss: init.iss,
            mss: init.mss,
            rcv_wnd_size: init.rcvwndsize * init.mss,
            snd_wnd_size: init.sendwndsize * init.mss,
            snd_buf_size: init.sendbuffersize * init.mss,
            max_rxmit: init.maxrexmittimes,
            slow_timeout: scale.d2t(init.tcp_slow_interval),
            slow_timeout_secs: init.tcp_slow_interval,
            fast_timeout: scale.d2t(init.tcp_fast_interval),
            fast_timeout_secs: init.tcp_fast_interval,
            idle_timeout: scale.d2t(init.maxidletime),
            msl: scale.d2t(init.msl),
            delayed_ack: init.delayed_ack,
            max_cong_wnd: init.maxconwnd * init.mss,
            boot_time_window: scale.d2t(init.boot_time),
            boot_time_window_secs: init.boot_time,
        })
    }

    /// The initial slow-start threshold.
    pub(crate) fn init_thresh(&self) -> u32 {
        self.rcv_wnd_size
    }

    /// The congestion-window ceiling, saturating when unbounded.
    pub(crate) fn max_cwnd(&self) -> u32 {
        if self.max_cong_wnd == 0 {
            u32::MAX
        } else {
            self.max_cong_wnd
        }
    }
}

/// The largest TCP payload a single IP packet can carry.
pub(crate) const IP_MAX_SEGMENT: u32 = 65_536 - TCP_HDR_LENGTH - IP_HDR_LEN;

/// Unwrap an arriving chain into the TCP header (payload still attached).
pub(crate) fn into_header(msg: NetMsg) -> Option<TcpHeader> {
    match msg {
        NetMsg::Tcp(h) => Some(h),
        _ => None,
    }
}
