//! Longest-prefix routing end to end: traffic from one subnet to another
//! crosses a forwarding host that owns no transport stack at all.

use netloom::StopMode;
use netloom_stack::app::{BulkSender, BulkSink};
use netloom_stack::config::ModelConfig;
use netloom_stack::{ProtocolNum, SessionKind, StackModel};

const MODEL: &str = r#"{
    "run_time": 60.0, "tick_per_second": 6, "seed": 3,
    "net": {
        "host": [
            {"id": 0,
             "graph": [
                {"name": "socket"},
                {"name": "tcp", "tcpinit": {"mss": 1000, "msl": 1.0}},
                {"name": "ip"},
                {"name": "bulk_sender", "app": {"dst": "10.1.0.2", "dst_port": 80, "src_port": 2001, "total_bytes": 30000}}
             ],
             "interface": [{"id": 0, "ip": "10.0.0.1"}],
             "route": [{"dest": "default", "iface": 0, "next_hop": "10.0.0.2"}]},
            {"id": 1,
             "graph": [{"name": "ip"}],
             "interface": [
                {"id": 0, "ip": "10.0.0.2"},
                {"id": 1, "ip": "10.1.0.1"}
             ],
             "route": [
                {"dest": "10.0.0.0/24", "iface": 0},
                {"dest": "10.1.0.0/24", "iface": 1}
             ]},
            {"id": 2,
             "graph": [
                {"name": "socket"},
                {"name": "tcp", "tcpinit": {"mss": 1000, "msl": 1.0}},
                {"name": "ip"},
                {"name": "bulk_sink", "app": {"port": 80, "recv_chunk": 4096}}
             ],
             "interface": [{"id": 0, "ip": "10.1.0.2"}],
             "route": [{"dest": "default", "iface": 0, "next_hop": "10.1.0.1"}]}
        ],
        "link": [
            {"prop_delay": 0.01, "attach": ["0(0)", "1(0)"]},
            {"prop_delay": 0.01, "attach": ["1(1)", "2(0)"]}
        ]
    }
}"#;

#[test_log::test]
fn transfer_through_a_forwarding_router() {
    let cfg = ModelConfig::from_json(MODEL).unwrap();
    let mut engine = netloom_stack::net::build(&cfg).unwrap();
    engine.init_model();
    let scale = engine.scale();
    engine.advance(StopMode::BeforeTime, scale.d2t(60.0));

    let model = engine.model(0).as_any().downcast_ref::<StackModel>().unwrap();

    let sender_host = model.host_by_nhi("0").unwrap();
    let sender = match sender_host.graph.get(ProtocolNum::App(0)).unwrap() {
        SessionKind::App(a) => a.as_any().downcast_ref::<BulkSender>().unwrap(),
        _ => unreachable!(),
    };
    assert!(sender.finished && !sender.failed);

    let sink_host = model.host_by_nhi("2").unwrap();
    let sink = match sink_host.graph.get(ProtocolNum::App(0)).unwrap() {
        SessionKind::App(a) => a.as_any().downcast_ref::<BulkSink>().unwrap(),
        _ => unreachable!(),
    };
    assert_eq!(sink.received, 30_000);

    // the router forwarded every packet of both directions
    let router = model.host_by_nhi("1").unwrap();
    let ip = match router.graph.get(ProtocolNum::Ipv4).unwrap() {
        SessionKind::Ip(ip) => ip,
        _ => unreachable!(),
    };
    assert!(ip.forwards > 60, "router forwards counted ({})", ip.forwards);
    assert_eq!(ip.drops_no_route, 0);
    assert_eq!(ip.drops_ttl, 0);
}
