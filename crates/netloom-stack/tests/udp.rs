//! Datagram delivery end to end: endpoint pinning, port demultiplexing
//! with peer adoption, and fragmentation at the maximum datagram size.

use std::any::Any;

use netloom::{SchedContext, StopMode, TickScale};
use netloom_stack::app::{with_sockets, AppSession};
use netloom_stack::config::{ModelConfig, SessionConfig};
use netloom_stack::host::Host;
use netloom_stack::net::SessionRegistry;
use netloom_stack::{ProtocolNum, SessionKind, StackModel};

const T_CONNECT: u64 = 1;
const T_SEND: u64 = 2;
const T_RECV: u64 = 3;

struct DatagramSource {
    app: u8,
    dst: netloom::IpAddr,
    dst_port: u16,
    src_port: u16,
    chunk: u32,
    count: u32,
    pub sent: u32,
    sock: i32,
}

impl AppSession for DatagramSource {
    fn protocol(&self) -> ProtocolNum {
        ProtocolNum::App(self.app)
    }

    fn start(&mut self, host: &mut Host, ctx: &mut SchedContext<'_>) {
        let ip = host.ifaces[0].ip;
        let (dst, dst_port, src_port, app) = (self.dst, self.dst_port, self.src_port, self.protocol());
        self.sock = with_sockets(host, ctx, |m, h, c| {
            let sock = m.socket();
            assert!(m.bind(sock, ip, src_port, "udp", h, c));
            m.connect(sock, dst, dst_port, T_CONNECT, app, h, c);
            sock
        })
        .expect("socket master");
    }

    fn done(
        &mut self,
        token: u64,
        ok: bool,
        retval: i32,
        _data: Vec<u8>,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) {
        assert!(ok);
        let (sock, app, chunk) = (self.sock, self.protocol(), self.chunk);
        match token {
            T_CONNECT => {
                let _ = with_sockets(host, ctx, |m, h, c| {
                    m.send(sock, chunk, None, T_SEND, app, h, c);
                });
            }
            T_SEND => {
                self.sent += retval as u32;
                if self.sent < self.chunk * self.count {
                    let _ = with_sockets(host, ctx, |m, h, c| {
                        m.send(sock, chunk, None, T_SEND, app, h, c);
                    });
                }
            }
            _ => {}
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct DatagramSink {
    app: u8,
    port: u16,
    pub received: u32,
    sock: i32,
}

impl DatagramSink {
    fn issue_recv(&mut self, host: &mut Host, ctx: &mut SchedContext<'_>) {
        let (sock, app) = (self.sock, self.protocol());
        let _ = with_sockets(host, ctx, |m, h, c| {
            m.recv(sock, 1_000_000, T_RECV, app, h, c);
        });
    }
}

impl AppSession for DatagramSink {
    fn protocol(&self) -> ProtocolNum {
        ProtocolNum::App(self.app)
    }

    fn start(&mut self, host: &mut Host, ctx: &mut SchedContext<'_>) {
        let ip = host.ifaces[0].ip;
        let port = self.port;
        self.sock = with_sockets(host, ctx, |m, h, c| {
            let sock = m.socket();
            assert!(m.bind(sock, ip, port, "udp", h, c));
            sock
        })
        .expect("socket master");
        self.issue_recv(host, ctx);
    }

    fn done(
        &mut self,
        token: u64,
        ok: bool,
        retval: i32,
        _data: Vec<u8>,
        host: &mut Host,
        ctx: &mut SchedContext<'_>,
    ) {
        if token == T_RECV && ok {
            self.received += retval as u32;
            self.issue_recv(host, ctx);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn source_ctor(
    sc: &SessionConfig,
    _scale: TickScale,
    app: u8,
) -> Result<SessionKind, netloom::Error> {
    let a = sc.app.as_ref().expect("app params");
    Ok(SessionKind::App(Box::new(DatagramSource {
        app,
        dst: a.dst.as_deref().unwrap().parse().unwrap(),
        dst_port: a.dst_port,
        src_port: a.src_port,
        chunk: a.total_bytes,
        count: 3,
        sent: 0,
        sock: -1,
    })))
}

fn sink_ctor(
    sc: &SessionConfig,
    _scale: TickScale,
    app: u8,
) -> Result<SessionKind, netloom::Error> {
    let a = sc.app.as_ref().expect("app params");
    Ok(SessionKind::App(Box::new(DatagramSink {
        app,
        port: a.port,
        received: 0,
        sock: -1,
    })))
}

fn run_model(max_datagram: u32, chunk: u32) -> (u32, u32) {
    let json = format!(
        r#"{{
        "run_time": 10.0, "tick_per_second": 6, "seed": 9,
        "net": {{
            "host": [
                {{"id": 0,
                 "graph": [
                    {{"name": "socket"}},
                    {{"name": "udp", "udpinit": {{"max_datagram_size": {max_datagram}}}}},
                    {{"name": "ip"}},
                    {{"name": "dg_source", "app": {{"dst": "10.0.0.2", "dst_port": 5000, "src_port": 3000, "total_bytes": {chunk}}}}}
                 ],
                 "interface": [{{"id": 0, "ip": "10.0.0.1"}}]}},
                {{"id": 1,
                 "graph": [
                    {{"name": "socket"}},
                    {{"name": "udp", "udpinit": {{"max_datagram_size": {max_datagram}}}}},
                    {{"name": "ip"}},
                    {{"name": "dg_sink", "app": {{"port": 5000}}}}
                 ],
                 "interface": [{{"id": 0, "ip": "10.0.0.2"}}]}}
            ],
            "link": [{{"prop_delay": 0.02, "attach": ["0(0)", "1(0)"]}}]
        }}
    }}"#
    );
    let cfg = ModelConfig::from_json(&json).unwrap();
    let mut registry = SessionRegistry::default();
    registry.register("dg_source", source_ctor);
    registry.register("dg_sink", sink_ctor);
    let mut engine = netloom_stack::net::build_with_registry(&cfg, &registry).unwrap();
    engine.init_model();
    let scale = engine.scale();
    engine.advance(StopMode::BeforeTime, scale.d2t(10.0));

    let model = engine.model(0).as_any().downcast_ref::<StackModel>().unwrap();
    let source = match model.host_by_nhi("0").unwrap().graph.get(ProtocolNum::App(0)).unwrap() {
        SessionKind::App(a) => a.as_any().downcast_ref::<DatagramSource>().unwrap().sent,
        _ => unreachable!(),
    };
    let sink = match model.host_by_nhi("1").unwrap().graph.get(ProtocolNum::App(0)).unwrap() {
        SessionKind::App(a) => a.as_any().downcast_ref::<DatagramSink>().unwrap().received,
        _ => unreachable!(),
    };
    (source, sink)
}

#[test_log::test]
fn datagrams_reach_an_unconnected_listener() {
    // three 500-byte sends; the listener adopts the peer on first arrival
    let (sent, received) = run_model(65_507, 500);
    assert_eq!(sent, 1500);
    assert_eq!(received, 1500);
}

#[test_log::test]
fn large_sends_fragment_at_the_datagram_size() {
    // each 90 kB send splits into three datagrams of at most 40 kB
    let (sent, received) = run_model(40_000, 90_000);
    assert_eq!(sent, 270_000);
    assert_eq!(received, 270_000);
}
