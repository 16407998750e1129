//! End-to-end TCP transfers over fully built models.

use netloom::{Engine, StopMode};
use netloom_stack::app::{BulkSender, BulkSink};
use netloom_stack::config::ModelConfig;
use netloom_stack::{ProtocolNum, SessionKind, StackModel};

fn build(json: &str) -> Engine {
    let cfg = ModelConfig::from_json(json).unwrap();
    let mut engine = netloom_stack::net::build(&cfg).unwrap();
    engine.init_model();
    engine
}

fn run(engine: &mut Engine, secs: f64) {
    let scale = engine.scale();
    engine.advance(StopMode::BeforeTime, scale.d2t(secs));
}

fn app<'a, T: 'static>(engine: &'a Engine, timeline: usize, nhi: &str, app: u8) -> &'a T {
    let model = engine.model(timeline).as_any().downcast_ref::<StackModel>().unwrap();
    let host = model.host_by_nhi(nhi).expect("host on timeline");
    match host.graph.get(ProtocolNum::App(app)).expect("app session") {
        SessionKind::App(a) => a.as_any().downcast_ref::<T>().expect("app type"),
        _ => panic!("not an app session"),
    }
}

fn transfer_model(total_timeline: u32, sink_timeline: u32, total_bytes: u32) -> String {
    format!(
        r#"{{
        "run_time": 60.0, "tick_per_second": 6, "seed": 7,
        "total_timeline": {total_timeline},
        "net": {{
            "host": [
                {{"id": 0, "timeline": 0,
                 "graph": [
                    {{"name": "socket"}},
                    {{"name": "tcp", "tcpinit": {{"version": "reno", "mss": 536, "msl": 1.0, "rcvwndsize": 8, "sendwndsize": 64, "sendbuffersize": 64}}}},
                    {{"name": "ip"}},
                    {{"name": "bulk_sender", "app": {{"dst": "10.0.0.2", "dst_port": 80, "src_port": 2001, "total_bytes": {total_bytes}}}}}
                 ],
                 "interface": [{{"id": 0, "ip": "10.0.0.1", "bitrate": 1e7, "buffer": 262144}}]}},
                {{"id": 1, "timeline": {sink_timeline},
                 "graph": [
                    {{"name": "socket"}},
                    {{"name": "tcp", "tcpinit": {{"version": "reno", "mss": 536, "msl": 1.0, "rcvwndsize": 8, "sendwndsize": 64, "sendbuffersize": 64}}}},
                    {{"name": "ip"}},
                    {{"name": "bulk_sink", "app": {{"port": 80, "recv_chunk": 4096}}}}
                 ],
                 "interface": [{{"id": 0, "ip": "10.0.0.2", "bitrate": 1e7, "buffer": 262144}}]}}
            ],
            "link": [{{"prop_delay": 0.05, "attach": ["0(0)", "1(0)"]}}]
        }}
    }}"#
    )
}

#[test_log::test]
fn bulk_transfer_delivers_every_byte() {
    let total = 100_000;
    let mut engine = build(&transfer_model(1, 0, total));
    run(&mut engine, 60.0);

    let sender: &BulkSender = app(&engine, 0, "0", 0);
    assert!(!sender.failed);
    assert!(sender.connected);
    assert_eq!(sender.sent, total);
    assert!(sender.finished, "close handshake completed");

    let sink: &BulkSink = app(&engine, 0, "1", 0);
    assert_eq!(sink.accepted, 1);
    assert_eq!(sink.received, total);
    assert!(sink.closed >= 1);

    // a clean 10 Mbps link with a quarter-megabyte buffer loses nothing
    let model = engine.model(0).as_any().downcast_ref::<StackModel>().unwrap();
    for host in &model.hosts {
        for iface in &host.ifaces {
            assert_eq!(iface.queue_drops(), 0);
        }
    }
}

#[test_log::test]
fn bulk_transfer_across_two_timelines() {
    let total = 50_000;
    let mut engine = build(&transfer_model(2, 1, total));
    assert_eq!(engine.num_timelines(), 2);
    run(&mut engine, 60.0);

    let sender: &BulkSender = app(&engine, 0, "0", 0);
    assert!(sender.finished && !sender.failed);
    assert_eq!(sender.sent, total);

    let sink: &BulkSink = app(&engine, 1, "1", 0);
    assert_eq!(sink.received, total);
    assert_eq!(sink.accepted, 1);
}

#[test_log::test]
fn advance_in_stages_is_resumable() {
    let total = 20_000;
    let mut engine = build(&transfer_model(1, 0, total));
    let scale = engine.scale();
    // half the run, then the rest
    engine.advance(StopMode::BeforeTime, scale.d2t(1.0));
    engine.advance(StopMode::BeforeTime, scale.d2t(60.0));

    let sink: &BulkSink = app(&engine, 0, "1", 0);
    assert_eq!(sink.received, total);
}
