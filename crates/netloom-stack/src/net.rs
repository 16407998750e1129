//! Building the entity tree: walk the net hierarchy, create hosts bound
//! to their timelines, wire links into channel mappings, resolve static
//! routes, and hand the finished partitions to the engine.

use std::collections::HashMap;

use log::debug;
use netloom::event::ProcessKey;
use netloom::{
    ChannelMap, Engine, Error, EventTarget, InChannelRef, IpAddr, IpPrefix, Mac48Addr, Nhi,
    RngSource, TickScale,
};

use crate::config::{HostConfig, LinkConfig, ModelConfig, SessionConfig};
use crate::fib::RouteInfo;
use crate::host::{tie_seed_from_ids, Host};
use crate::ip::IpSession;
use crate::model::StackModel;
use crate::nic::{MacSession, NetworkInterface, PhySession};
use crate::queue::{DroptailQueue, NicQueue};
use crate::red::RedQueue;
use crate::session::SessionKind;
use crate::socket::SocketMaster;
use crate::tcp::{TcpConfig, TcpMaster};
use crate::udp::UdpMaster;

/// A session constructor: builds a graph entry from its configuration.
/// The last argument is the index the session gets if it is an
/// application.
pub type SessionCtor = fn(&SessionConfig, TickScale, u8) -> Result<SessionKind, Error>;

/// Sessions are registered by name; unknown names are fatal at build.
pub struct SessionRegistry {
    ctors: HashMap<String, SessionCtor>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        let mut r = SessionRegistry { ctors: HashMap::new() };
        r.register("ip", |_, _, _| Ok(SessionKind::Ip(IpSession::new())));
        r.register("tcp", |sc, scale, _| {
            let init = sc.tcpinit.clone().unwrap_or_default();
            Ok(SessionKind::Tcp(TcpMaster::new(TcpConfig::from_init(&init, scale)?)))
        });
        r.register("udp", |sc, _, _| {
            let init = sc.udpinit.clone().unwrap_or_default();
            Ok(SessionKind::Udp(UdpMaster::new(init.max_datagram_size)))
        });
        r.register("socket", |_, _, _| Ok(SessionKind::Socket(SocketMaster::new())));
        r.register("bulk_sender", |sc, _, app| {
            let a = sc
                .app
                .as_ref()
                .ok_or_else(|| Error::Config("bulk_sender requires app parameters".into()))?;
            let dst: IpAddr = a
                .dst
                .as_deref()
                .ok_or_else(|| Error::Config("bulk_sender requires app.dst".into()))?
                .parse()?;
            Ok(SessionKind::App(Box::new(crate::app::BulkSender::new(
                app,
                dst,
                a.dst_port,
                a.src_port,
                a.total_bytes,
            ))))
        });
        r.register("bulk_sink", |sc, _, app| {
            let a = sc
                .app
                .as_ref()
                .ok_or_else(|| Error::Config("bulk_sink requires app parameters".into()))?;
            Ok(SessionKind::App(Box::new(crate::app::BulkSink::new(
                app,
                a.port,
                if a.recv_chunk == 0 { 4096 } else { a.recv_chunk },
            ))))
        });
        r
    }
}

impl SessionRegistry {
    pub fn register(&mut self, name: &str, ctor: SessionCtor) {
        self.ctors.insert(name.to_string(), ctor);
    }

    fn build(
        &self,
        sc: &SessionConfig,
        scale: TickScale,
        app_index: u8,
    ) -> Result<SessionKind, Error> {
        match self.ctors.get(&sc.name) {
            Some(ctor) => ctor(sc, scale, app_index),
            None => Err(Error::UnknownProtocol(sc.name.clone())),
        }
    }
}

#[derive(Clone, Copy)]
struct IfaceRef {
    timeline: usize,
    host: usize,
    iface: u32,
    ip: IpAddr,
    out: netloom::OutChannelId,
}

/// Build the whole model with the default session registry.
pub fn build(cfg: &ModelConfig) -> Result<Engine, Error> {
    build_with_registry(cfg, &SessionRegistry::default())
}

/// Build the whole model: hosts on their timelines, links as channel
/// mappings, routes in the forwarding tables.
pub fn build_with_registry(cfg: &ModelConfig, registry: &SessionRegistry) -> Result<Engine, Error> {
    cfg.engine.validate()?;
    let scale = cfg.engine.scale();
    let seed = cfg.engine.seed().unwrap_or(0);
    let n_timelines = cfg.engine.total_timeline as usize;

    // flatten the net tree into (path, host) and (path, link) lists
    let mut hosts: Vec<(Vec<u32>, &HostConfig)> = Vec::new();
    let mut links: Vec<(Vec<u32>, &LinkConfig)> = Vec::new();
    collect_net(&cfg.net, &mut Vec::new(), &mut hosts, &mut links);

    let mut models: Vec<StackModel> = (0..n_timelines).map(|_| StackModel::new()).collect();
    let mut channels = ChannelMap::new();
    let mut iface_map: HashMap<String, IfaceRef> = HashMap::new();
    let mut host_map: HashMap<String, (usize, usize)> = HashMap::new();

    for (path, hc) in &hosts {
        let timeline = hc.timeline as usize;
        if timeline >= n_timelines {
            return Err(Error::Config(format!(
                "host {} aligned to timeline {} but only {} exist",
                hc.id, hc.timeline, n_timelines
            )));
        }

        let mut ids = path.clone();
        ids.push(hc.id);
        let nhi = Nhi::machine(ids.clone());
        if host_map.contains_key(&nhi.to_string()) {
            return Err(Error::Config(format!("duplicate host nhi {nhi}")));
        }
        let index = models[timeline].hosts.len();
        let tie = tie_seed_from_ids(&ids);
        let mut host = Host::new(nhi.clone(), ids.clone(), timeline, index, RngSource::derive(seed, tie));

        let mut app_index: u8 = 0;
        for sc in &hc.graph {
            let session = registry.build(sc, scale, app_index)?;
            if matches!(session, SessionKind::App(_)) {
                app_index += 1;
            }
            host.graph.register(&sc.name, session)?;
        }

        for (pos, ic) in hc.interfaces.iter().enumerate() {
            if ic.id as usize != pos {
                return Err(Error::Config(format!(
                    "host {nhi}: interface ids must be dense and in order (found {} at {})",
                    ic.id, pos
                )));
            }
            let ip: IpAddr = ic.ip.parse()?;
            let queue = match ic.queue.as_str() {
                "droptail" => NicQueue::Droptail(DroptailQueue::new(
                    ic.bitrate,
                    ic.latency,
                    ic.jitter_range,
                    ic.buffer,
                    scale,
                )),
                "red" => NicQueue::Red(RedQueue::new(
                    ic.bitrate,
                    ic.latency,
                    ic.jitter_range,
                    ic.buffer,
                    &ic.red,
                    scale,
                )?),
                other => {
                    return Err(Error::Config(format!("unknown queue discipline \"{other}\"")));
                }
            };
            let iface_nhi = Nhi::interface(ids.clone(), ic.id);
            let out = channels.new_out_channel(timeline);
            host.ifaces.push(NetworkInterface {
                id: ic.id,
                nhi: iface_nhi.clone(),
                ip,
                mac: MacSession { addr: Mac48Addr::allocate() },
                phy: PhySession { queue },
                out_channel: out,
                rng: RngSource::derive(seed, tie ^ (0x1f00 + ic.id as u64)),
            });
            iface_map.insert(
                iface_nhi.to_string(),
                IfaceRef { timeline, host: index, iface: ic.id, ip, out },
            );
        }

        host_map.insert(nhi.to_string(), (timeline, index));
        debug!("built host {nhi} on timeline {timeline}");
        models[timeline].hosts.push(host);
    }

    // links become channel mappings; the mapping delay is the lookahead
    for (path, lc) in &links {
        if lc.attach.len() < 2 {
            return Err(Error::Config("a link must attach at least two interfaces".into()));
        }
        let delay = scale.d2t(lc.min_delay + lc.prop_delay);
        let mut refs = Vec::with_capacity(lc.attach.len());
        for attach in &lc.attach {
            let full = qualify_nhi(path, attach);
            let r = iface_map
                .get(&full)
                .ok_or_else(|| Error::Config(format!("link attaches unknown interface {full}")))?;
            refs.push(*r);
        }
        for a in &refs {
            for b in &refs {
                if a.out == b.out {
                    continue;
                }
                channels.map(
                    a.out,
                    InChannelRef {
                        timeline: b.timeline,
                        target: EventTarget { host: b.host, process: ProcessKey(b.iface) },
                    },
                    delay,
                )?;
            }
        }
    }

    // static routes
    for (path, hc) in &hosts {
        let mut ids = path.clone();
        ids.push(hc.id);
        let (timeline, index) = host_map[&Nhi::machine(ids).to_string()];
        let host = &mut models[timeline].hosts[index];

        for rc in &hc.routes {
            let dest = parse_prefix(&rc.dest)?;
            let next_hop = match &rc.next_hop {
                Some(s) => s.parse()?,
                None => IpAddr::ANY,
            };
            host.fib.add_route(RouteInfo::new(dest, next_hop, rc.iface), true);
        }
        for rc in &hc.nhi_routes {
            let full = qualify_nhi(path, &rc.dest);
            let target = iface_map
                .get(&full)
                .ok_or_else(|| Error::Config(format!("nhi_route to unknown interface {full}")))?;
            let next_hop = match &rc.next_hop {
                Some(s) => s.parse()?,
                None => target.ip,
            };
            host.fib.add_route(
                RouteInfo::new(IpPrefix::new(target.ip, 32), next_hop, rc.iface),
                true,
            );
        }
    }

    let boxed: Vec<Box<dyn netloom::TimelineModel>> =
        models.into_iter().map(|m| Box::new(m) as Box<dyn netloom::TimelineModel>).collect();
    Engine::build_model(scale, boxed, channels)
}

fn collect_net<'a>(
    net: &'a crate::config::NetConfig,
    path: &mut Vec<u32>,
    hosts: &mut Vec<(Vec<u32>, &'a HostConfig)>,
    links: &mut Vec<(Vec<u32>, &'a LinkConfig)>,
) {
    for h in &net.hosts {
        hosts.push((path.clone(), h));
    }
    for l in &net.links {
        links.push((path.clone(), l));
    }
    for sub in &net.nets {
        path.push(sub.id);
        collect_net(sub, path, hosts, links);
        path.pop();
    }
}

/// Attach NHIs are relative to the net that declares the link.
fn qualify_nhi(path: &[u32], attach: &str) -> String {
    if path.is_empty() {
        attach.to_string()
    } else {
        let prefix: Vec<String> = path.iter().map(u32::to_string).collect();
        format!("{}:{}", prefix.join(":"), attach)
    }
}

fn parse_prefix(s: &str) -> Result<IpPrefix, Error> {
    if s == "default" {
        return Ok(IpPrefix::DEFAULT);
    }
    let (addr, len) = s
        .split_once('/')
        .ok_or_else(|| Error::Addr(format!("bad prefix \"{s}\"")))?;
    let len: u8 = len.parse().map_err(|_| Error::Addr(format!("bad prefix length in \"{s}\"")))?;
    if len > 32 {
        return Err(Error::Addr(format!("prefix length {len} out of range")));
    }
    Ok(IpPrefix::new(addr.parse()?, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    #[test]
    fn lookahead_violation_is_fatal() {
        // two hosts on different timelines joined by a zero-delay link
        let json = r#"{
            "run_time": 1.0, "total_timeline": 2,
            "net": {
                "host": [
                    {"id": 0, "timeline": 0, "graph": [{"name": "ip"}],
                     "interface": [{"id": 0, "ip": "10.0.0.1"}]},
                    {"id": 1, "timeline": 1, "graph": [{"name": "ip"}],
                     "interface": [{"id": 0, "ip": "10.0.0.2"}]}
                ],
                "link": [{"attach": ["0(0)", "1(0)"]}]
            }
        }"#;
        let cfg = ModelConfig::from_json(json).unwrap();
        assert!(matches!(build(&cfg), Err(Error::Mapping(_))));
    }

    #[test]
    fn unknown_protocol_is_fatal() {
        let json = r#"{
            "run_time": 1.0,
            "net": {"host": [{"id": 0, "graph": [{"name": "quic"}]}]}
        }"#;
        let cfg = ModelConfig::from_json(json).unwrap();
        assert!(matches!(build(&cfg), Err(Error::UnknownProtocol(_))));
    }

    #[test]
    fn duplicate_protocol_is_fatal() {
        let json = r#"{
            "run_time": 1.0,
            "net": {"host": [{"id": 0, "graph": [{"name": "ip"}, {"name": "ip"}]}]}
        }"#;
        let cfg = ModelConfig::from_json(json).unwrap();
        assert!(matches!(build(&cfg), Err(Error::DuplicateProtocol(_))));
    }

    #[test]
    fn nested_nets_qualify_nhi_paths() {
        let json = r#"{
            "run_time": 1.0,
            "net": {
                "net": [
                    {"id": 1, "host": [
                        {"id": 0, "graph": [{"name": "ip"}],
                         "interface": [{"id": 0, "ip": "10.1.0.1"}]},
                        {"id": 1, "graph": [{"name": "ip"}],
                         "interface": [{"id": 0, "ip": "10.1.0.2"}]}
                    ],
                    "link": [{"prop_delay": 0.01, "attach": ["0(0)", "1(0)"]}]}
                ]
            }
        }"#;
        let cfg = ModelConfig::from_json(json).unwrap();
        let engine = build(&cfg).unwrap();
        assert_eq!(engine.num_timelines(), 1);
    }
}
