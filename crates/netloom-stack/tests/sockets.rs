//! Socket-layer behavior over full models: non-blocking accept with
//! resume points, and the data-available re-arm rule.

use std::any::Any;

use netloom::{SchedContext, StopMode, TickScale};
use netloom_stack::app::{with_sockets, AppSession, BulkSender};
use netloom_stack::config::{ModelConfig, SessionConfig};
use netloom_stack::host::Host;
use netloom_stack::net::SessionRegistry;
use netloom_stack::socket::nonblocking::SocketCode;
use netloom_stack::{ProtocolNum, SessionKind, StackModel};

fn app_of<'a, T: 'static>(model: &'a StackModel, nhi: &str, app: u8) -> &'a T {
    let host = model.host_by_nhi(nhi).expect("host");
    match host.graph.get(ProtocolNum::App(app)).expect("app") {
        SessionKind::App(a) => a.as_any().downcast_ref::<T>().expect("app type"),
        _ => panic!("not an app"),
    }
}

//
// a listener driven entirely through the non-blocking API
//

const TOK_ACCEPT: u64 = 1;
const TOK_RECV_BASE: u64 = 0x100;

struct NbListener {
    app: u8,
    port: u16,
    listener: i32,
    pub first_code: Option<SocketCode>,
    pub would_blocks: u32,
    pub accepted: Vec<i32>,
    pub received: u32,
}

impl NbListener {
    fn issue_accept(&mut self, host: &mut Host, ctx: &mut SchedContext<'_>) {
        let (listener, app) = (self.listener, ProtocolNum::App(self.app));
        let r = with_sockets(host, ctx, |m, h, c| {
            m.nb_accept(listener, true, TOK_ACCEPT, app, h, c)
        })
        .expect("socket master");
        if self.first_code.is_none() {
            self.first_code = Some(r.code);
        }
        match r.code {
            SocketCode::Success => {
                let conn = r.retval;
                self.accepted.push(conn);
                self.issue_recv(conn, host, ctx);
                self.issue_accept(host, ctx);
            }
            SocketCode::WouldBlock => self.would_blocks += 1,
            _ => {}
        }
    }

    fn issue_recv(&mut self, conn: i32, host: &mut Host, ctx: &mut SchedContext<'_>) {
        let app = ProtocolNum::App(self.app);
        loop {
            let r = with_sockets(host, ctx, |m, h, c| {
                m.nb_recv(conn, 4096, TOK_RECV_BASE + conn as u64, app, h, c)
            })
            .expect("socket master");
            match r.code {
                SocketCode::Success if r.retval > 0 => {
                    self.received += r.retval as u32;
                }
                SocketCode::WouldBlock => break,
                _ => {
                    let _ = with_sockets(host, ctx, |m, h, c| {
                        m.nb_close(conn, 0, app, h, c);
                    });
                    break;
                }
            }
        }
    }
}

impl AppSession for NbListener {
    fn protocol(&self) -> ProtocolNum {
        ProtocolNum::App(self.app)
    }

    fn start(&mut self, host: &mut Host, ctx: &mut SchedContext<'_>) {
        let src_ip = host.ifaces[0].ip;
        let port = self.port;
        self.listener = with_sockets(host, ctx, |m, h, c| {
            let sock = m.socket();
            assert!(m.bind(sock, src_ip, port, "tcp", h, c));
            sock
        })
        .expect("socket master");
        self.issue_accept(host, ctx);
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
        if !ok {
            return;
        }
        if token == TOK_ACCEPT {
            let conn = retval;
            self.accepted.push(conn);
            self.issue_recv(conn, host, ctx);
            self.issue_accept(host, ctx);
        } else if token >= TOK_RECV_BASE {
            let conn = (token - TOK_RECV_BASE) as i32;
            if retval > 0 {
                self.received += retval as u32;
                self.issue_recv(conn, host, ctx);
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn nb_listener_ctor(
    sc: &SessionConfig,
    _scale: TickScale,
    app: u8,
) -> Result<SessionKind, netloom::Error> {
    let a = sc.app.as_ref().expect("app params");
    Ok(SessionKind::App(Box::new(NbListener {
        app,
        port: a.port,
        listener: -1,
        first_code: None,
        would_blocks: 0,
        accepted: Vec::new(),
        received: 0,
    })))
}

#[test_log::test]
fn nonblocking_accept_resumes_across_connections() {
    let json = r#"{
        "run_time": 30.0, "tick_per_second": 6, "seed": 11,
        "net": {
            "host": [
                {"id": 0,
                 "graph": [
                    {"name": "socket"},
                    {"name": "tcp", "tcpinit": {"mss": 1000, "msl": 1.0}},
                    {"name": "ip"},
                    {"name": "nb_listener", "app": {"port": 80}}
                 ],
                 "interface": [{"id": 0, "ip": "10.0.0.1"}]},
                {"id": 1,
                 "graph": [
                    {"name": "socket"},
                    {"name": "tcp", "tcpinit": {"mss": 1000, "msl": 1.0}},
                    {"name": "ip"},
                    {"name": "bulk_sender", "app": {"dst": "10.0.0.1", "dst_port": 80, "src_port": 2001, "total_bytes": 2000}}
                 ],
                 "interface": [{"id": 0, "ip": "10.0.0.2"}]},
                {"id": 2,
                 "graph": [
                    {"name": "socket"},
                    {"name": "tcp", "tcpinit": {"mss": 1000, "msl": 1.0}},
                    {"name": "ip"},
                    {"name": "bulk_sender", "app": {"dst": "10.0.0.1", "dst_port": 80, "src_port": 2002, "total_bytes": 2000}}
                 ],
                 "interface": [{"id": 0, "ip": "10.0.0.3"}]}
            ],
            "link": [{"prop_delay": 0.01, "attach": ["0(0)", "1(0)", "2(0)"]}]
        }
    }"#;
    let cfg = ModelConfig::from_json(json).unwrap();
    let mut registry = SessionRegistry::default();
    registry.register("nb_listener", nb_listener_ctor);
    let mut engine = netloom_stack::net::build_with_registry(&cfg, &registry).unwrap();
    engine.init_model();
    let scale = engine.scale();
    engine.advance(StopMode::BeforeTime, scale.d2t(30.0));

    let model = engine.model(0).as_any().downcast_ref::<StackModel>().unwrap();
    let listener: &NbListener = app_of(model, "0", 0);

    // nothing was pending at boot, so the first accept had to block
    assert_eq!(listener.first_code, Some(SocketCode::WouldBlock));
    // both clients got through; the loser of the first race retried its
    // SYN on the retransmission timer
    assert_eq!(listener.accepted.len(), 2);
    assert_eq!(listener.received, 4000);
    assert!(listener.would_blocks >= 2);

    for nhi in ["1", "2"] {
        let sender: &BulkSender = app_of(model, nhi, 0);
        assert!(sender.connected, "client {nhi} connected");
        assert_eq!(sender.sent, 2000);
    }
}

//
// the data-available re-arm rule, over a loopback connection
//

const T_ACCEPT: u64 = 1;
const T_CONNECT: u64 = 2;
const T_SEND1: u64 = 3;
const T_RECV1: u64 = 4;
const T_RECV2: u64 = 5;
const T_SEND2: u64 = 6;

struct RaceApp {
    app: u8,
    client: i32,
    conn: i32,
    pub r1_retval: Option<i32>,
    pub r2_retval: Option<i32>,
    pub r2_done_early: bool,
    s2_sent: bool,
}

impl AppSession for RaceApp {
    fn protocol(&self) -> ProtocolNum {
        ProtocolNum::App(self.app)
    }

    fn start(&mut self, host: &mut Host, ctx: &mut SchedContext<'_>) {
        let ip = host.ifaces[0].ip;
        let app = self.protocol();
        self.client = with_sockets(host, ctx, |m, h, c| {
            let listener = m.socket();
            assert!(m.bind(listener, ip, 80, "tcp", h, c));
            m.accept(listener, true, T_ACCEPT, None, app, h, c);

            let client = m.socket();
            assert!(m.bind(client, ip, 2000, "tcp", h, c));
            m.connect(client, ip, 80, T_CONNECT, app, h, c);
            client
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
        assert!(ok, "operation {token} failed");
        let app = self.protocol();
        match token {
            T_CONNECT => {
                let client = self.client;
                let _ = with_sockets(host, ctx, |m, h, c| m.send(client, 100, None, T_SEND1, app, h, c));
            }
            T_ACCEPT => {
                self.conn = retval;
                let conn = self.conn;
                let _ = with_sockets(host, ctx, |m, h, c| m.recv(conn, 100, T_RECV1, app, h, c));
            }
            T_RECV1 => {
                self.r1_retval = Some(retval);
                let (conn, client) = (self.conn, self.client);
                // issue the second receive while nothing is buffered; only
                // fresh data may complete it
                let _ = with_sockets(host, ctx, |m, h, c| m.recv(conn, 100, T_RECV2, app, h, c));
                let _ = with_sockets(host, ctx, |m, h, c| m.send(client, 100, None, T_SEND2, app, h, c));
                self.s2_sent = true;
            }
            T_RECV2 => {
                self.r2_retval = Some(retval);
                if !self.s2_sent {
                    self.r2_done_early = true;
                }
            }
            _ => {}
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn race_app_ctor(
    _sc: &SessionConfig,
    _scale: TickScale,
    app: u8,
) -> Result<SessionKind, netloom::Error> {
    Ok(SessionKind::App(Box::new(RaceApp {
        app,
        client: -1,
        conn: -1,
        r1_retval: None,
        r2_retval: None,
        r2_done_early: false,
        s2_sent: false,
    })))
}

#[test_log::test]
fn second_recv_waits_for_fresh_data() {
    let json = r#"{
        "run_time": 10.0, "tick_per_second": 6, "seed": 5,
        "net": {
            "host": [
                {"id": 0,
                 "graph": [
                    {"name": "socket"},
                    {"name": "tcp", "tcpinit": {"mss": 1000, "msl": 1.0}},
                    {"name": "ip"},
                    {"name": "race"}
                 ],
                 "interface": [{"id": 0, "ip": "10.0.0.1"}]}
            ]
        }
    }"#;
    let cfg = ModelConfig::from_json(json).unwrap();
    let mut registry = SessionRegistry::default();
    registry.register("race", race_app_ctor);
    let mut engine = netloom_stack::net::build_with_registry(&cfg, &registry).unwrap();
    engine.init_model();
    let scale = engine.scale();
    engine.advance(StopMode::BeforeTime, scale.d2t(10.0));

    let model = engine.model(0).as_any().downcast_ref::<StackModel>().unwrap();
    let race: &RaceApp = app_of(model, "0", 0);

    assert_eq!(race.r1_retval, Some(100));
    // the second receive completed with the second chunk, not with a
    // zero-byte success off the stale availability flag
    assert_eq!(race.r2_retval, Some(100));
    assert!(!race.r2_done_early);
}
