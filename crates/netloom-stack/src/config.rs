//! Declarative model configuration. The DML-style syntax itself is parsed
//! elsewhere; these serde structs are the already-parsed tree the stack
//! consumes (JSON in tests and tools).

use serde::{Deserialize, Serialize};

pub use netloom::EngineConfig;

use crate::red::RedParams;

/// The whole model: engine options plus the top net.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    pub net: NetConfig,
}

impl ModelConfig {
    pub fn from_json(json: &str) -> Result<Self, netloom::Error> {
        serde_json::from_str(json).map_err(|e| netloom::Error::Config(e.to_string()))
    }
}

/// A net: a recursive container of sub-nets, hosts, and links.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetConfig {
    #[serde(default)]
    pub id: u32,
    #[serde(default, rename = "net")]
    pub nets: Vec<NetConfig>,
    #[serde(default, rename = "host")]
    pub hosts: Vec<HostConfig>,
    #[serde(default, rename = "link")]
    pub links: Vec<LinkConfig>,
}

fn default_rng_level() -> String {
    "host".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub id: u32,
    /// The timeline this host is aligned to.
    #[serde(default)]
    pub timeline: u32,
    /// "host" shares one stream per host; "protocol" gives each
    /// interface/session its own derived stream.
    #[serde(default = "default_rng_level")]
    pub rng_level: String,
    /// The protocol stack, bottom-up.
    #[serde(default)]
    pub graph: Vec<SessionConfig>,
    #[serde(default, rename = "interface")]
    pub interfaces: Vec<IfaceConfig>,
    #[serde(default, rename = "route")]
    pub routes: Vec<RouteConfig>,
    #[serde(default, rename = "nhi_route")]
    pub nhi_routes: Vec<NhiRouteConfig>,
}

/// One protocol session, by registered name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub name: String,
    #[serde(default)]
    pub tcpinit: Option<TcpInit>,
    #[serde(default)]
    pub udpinit: Option<UdpInit>,
    /// Parameters of an application session.
    #[serde(default)]
    pub app: Option<AppInit>,
}

fn d_version() -> String {
    "reno".into()
}
fn d_mss() -> u32 {
    1024
}
fn d_wnd() -> u32 {
    32
}
fn d_maxrexmit() -> u32 {
    12
}
fn d_slow() -> f64 {
    0.5
}
fn d_fast() -> f64 {
    0.2
}
fn d_idle() -> f64 {
    600.0
}
fn d_msl() -> f64 {
    60.0
}

/// TCP master tunables; window and buffer sizes are in MSS units until
/// load-time scaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpInit {
    #[serde(default = "d_version")]
    pub version: String,
    #[serde(default)]
    pub iss: u32,
    #[serde(default = "d_mss")]
    pub mss: u32,
    #[serde(default = "d_wnd")]
    pub rcvwndsize: u32,
    #[serde(default = "d_wnd")]
    pub sendwndsize: u32,
    #[serde(default = "d_wnd")]
    pub sendbuffersize: u32,
    #[serde(default = "d_maxrexmit")]
    pub maxrexmittimes: u32,
    #[serde(default = "d_slow")]
    pub tcp_slow_interval: f64,
    #[serde(default = "d_fast")]
    pub tcp_fast_interval: f64,
    #[serde(default = "d_idle")]
    pub maxidletime: f64,
    #[serde(default = "d_msl")]
    pub msl: f64,
    #[serde(default)]
    pub delayed_ack: bool,
    /// In MSS units; 0 means unbounded.
    #[serde(default)]
    pub maxconwnd: u32,
    /// Uniform random session start offset, seconds.
    #[serde(default)]
    pub boot_time: f64,
}

impl Default for TcpInit {
    fn default() -> Self {
        TcpInit {
            version: d_version(),
            iss: 0,
            mss: d_mss(),
            rcvwndsize: d_wnd(),
            sendwndsize: d_wnd(),
            sendbuffersize: d_wnd(),
            maxrexmittimes: d_maxrexmit(),
            tcp_slow_interval: d_slow(),
            tcp_fast_interval: d_fast(),
            maxidletime: d_idle(),
            msl: d_msl(),
            delayed_ack: false,
            maxconwnd: 0,
            boot_time: 0.0,
        }
    }
}

fn d_max_datagram() -> u32 {
    65_507
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpInit {
    #[serde(default = "d_max_datagram")]
    pub max_datagram_size: u32,
}

impl Default for UdpInit {
    fn default() -> Self {
        UdpInit { max_datagram_size: d_max_datagram() }
    }
}

/// Parameters of the built-in applications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppInit {
    #[serde(default)]
    pub dst: Option<String>,
    #[serde(default)]
    pub dst_port: u16,
    #[serde(default)]
    pub src_port: u16,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub total_bytes: u32,
    #[serde(default)]
    pub recv_chunk: u32,
}

fn d_queue() -> String {
    "droptail".into()
}
fn d_bitrate() -> f64 {
    1e7
}
fn d_buffer() -> u32 {
    65_536
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfaceConfig {
    pub id: u32,
    /// Dotted address; required for any interface that carries traffic.
    pub ip: String,
    /// "droptail" or "red".
    #[serde(default = "d_queue")]
    pub queue: String,
    /// Bits per second.
    #[serde(default = "d_bitrate")]
    pub bitrate: f64,
    /// Seconds.
    #[serde(default)]
    pub latency: f64,
    /// In [0, 1].
    #[serde(default)]
    pub jitter_range: f64,
    /// Bytes.
    #[serde(default = "d_buffer")]
    pub buffer: u32,
    #[serde(default)]
    pub red: RedParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Seconds; the cross-timeline lookahead floor.
    #[serde(default)]
    pub min_delay: f64,
    /// Seconds.
    #[serde(default)]
    pub prop_delay: f64,
    /// Interface NHIs, `a:b(i)` form; at least two.
    pub attach: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// "default" or a `a.b.c.d/len` prefix.
    pub dest: String,
    pub iface: u32,
    #[serde(default)]
    pub next_hop: Option<String>,
}

/// A route to a named remote interface, resolved to its address at build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NhiRouteConfig {
    pub dest: String,
    pub iface: u32,
    #[serde(default)]
    pub next_hop: Option<String>,
}
