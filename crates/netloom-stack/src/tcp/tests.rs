//! Protocol-level TCP scenarios: two masters wired back to back through a
//! hand-cranked harness, so individual segments can be delivered, delayed,
//! or dropped at will.

use netloom::{Harness, IpAddr, Nhi, RngSource, TickScale};

use crate::host::Host;
use crate::message::NetMsg;
use crate::session::{CtrlMsg, PopInfo, SessionMaster, StackOp};
use crate::socket::signal;
use crate::tcp::message::{TcpHeader, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_SYN};
use crate::tcp::{TcpConfig, TcpMaster, TcpState, TcpVersion};

fn config(version: TcpVersion, mss: u32) -> TcpConfig {
    let init = crate::config::TcpInit {
        version: match version {
            TcpVersion::Tahoe => "tahoe".into(),
            TcpVersion::Reno => "reno".into(),
            TcpVersion::NewReno => "new_reno".into(),
            TcpVersion::Sack => "sack".into(),
        },
        mss,
        rcvwndsize: 64,
        sendwndsize: 64,
        sendbuffersize: 64,
        ..Default::default()
    };
    TcpConfig::from_init(&init, TickScale::new(6)).unwrap()
}

struct Peer {
    host: Host,
    master: TcpMaster,
    harness: Harness,
    ip: IpAddr,
}

impl Peer {
    fn new(version: TcpVersion, mss: u32, ip: u32) -> Self {
        let harness = Harness::new(TickScale::new(6));
        let host = Host::new(
            Nhi::machine(vec![ip]),
            vec![ip],
            0,
            0,
            RngSource::derive(1, ip as u64),
        );
        Peer { host, master: TcpMaster::new(config(version, mss)), harness, ip: IpAddr(ip) }
    }

    fn open(&mut self, port: u16) -> usize {
        let id = self.master.create_session(1);
        assert!(self.master.set_source(id, self.ip, port));
        id
    }

    fn connect(&mut self, id: usize, dst: IpAddr, port: u16) -> bool {
        let mut ctx = self.harness.ctx();
        self.master.connect(id, dst, port, &mut self.host, &mut ctx)
    }

    fn listen(&mut self, id: usize) -> bool {
        let mut ctx = self.harness.ctx();
        self.master.listen(id, &mut self.host, &mut ctx)
    }

    fn send(&mut self, id: usize, len: u32) -> i64 {
        let mut ctx = self.harness.ctx();
        self.master.send(id, len, None, &mut self.host, &mut ctx)
    }

    fn recv(&mut self, id: usize, len: u32) -> i64 {
        let mut ctx = self.harness.ctx();
        self.master.recv(id, len, &mut self.host, &mut ctx)
    }

    fn disconnect(&mut self, id: usize) {
        let mut ctx = self.harness.ctx();
        self.master.disconnect(id, &mut self.host, &mut ctx);
    }

    fn state(&self, id: usize) -> TcpState {
        self.master.session(id).expect("session").state()
    }

    /// Everything the sessions emitted since the last drain: segments
    /// bound for the wire, and socket signals.
    fn drain(&mut self) -> (Vec<TcpHeader>, Vec<(u32, u32)>) {
        let mut segments = Vec::new();
        let mut signals = Vec::new();
        for op in self.host.drain_ops() {
            match op {
                StackOp::Push { msg: NetMsg::Tcp(hdr), .. } => segments.push(hdr),
                StackOp::Control { ctrl: CtrlMsg::SetSignal(s), .. } => {
                    signals.push((s.signal, s.nbytes));
                }
                _ => {}
            }
        }
        (segments, signals)
    }

    fn deliver(&mut self, hdr: TcpHeader, from: IpAddr) {
        let mut ctx = self.harness.ctx();
        self.master.pop(
            NetMsg::Tcp(hdr),
            PopInfo { src_ip: from, dst_ip: self.ip, ttl: 64, iface: 0 },
            &mut self.host,
            &mut ctx,
        );
    }

    fn slow_tick(&mut self) {
        let mut ctx = self.harness.ctx();
        self.master.control(CtrlMsg::TcpSlowTimer, &mut self.host, &mut ctx);
    }
}

/// Run the three-way handshake and return the established session ids.
fn establish(a: &mut Peer, b: &mut Peer) -> (usize, usize) {
    let sa = a.open(1000);
    let sb = b.open(80);
    assert!(b.listen(sb));
    assert!(a.connect(sa, b.ip, 80));

    let (syn, _) = a.drain();
    assert_eq!(syn.len(), 1);
    assert!(syn[0].has(TCP_FLAG_SYN) && !syn[0].has(TCP_FLAG_ACK));

    b.deliver(syn.into_iter().next().unwrap(), a.ip);
    assert_eq!(b.state(sb), TcpState::SynReceived);
    let (synack, sigs) = b.drain();
    assert_eq!(synack.len(), 1);
    assert!(synack[0].has(TCP_FLAG_SYN) && synack[0].has(TCP_FLAG_ACK));
    assert!(sigs.iter().any(|(s, _)| s & signal::FIRST_CONNECTION != 0));

    a.deliver(synack.into_iter().next().unwrap(), b.ip);
    assert_eq!(a.state(sa), TcpState::Established);
    let (ack, sigs) = a.drain();
    assert_eq!(ack.len(), 1);
    assert!(ack[0].has(TCP_FLAG_ACK) && !ack[0].has(TCP_FLAG_SYN));
    assert!(sigs.iter().any(|(s, _)| s & signal::OK_TO_SEND != 0));

    b.deliver(ack.into_iter().next().unwrap(), a.ip);
    assert_eq!(b.state(sb), TcpState::Established);
    let (none, sigs) = b.drain();
    assert!(none.is_empty(), "handshake completion must not emit a segment");
    assert!(sigs.iter().any(|(s, _)| s & signal::OK_TO_SEND != 0));

    (sa, sb)
}

#[test_log::test]
fn three_way_handshake() {
    let mut a = Peer::new(TcpVersion::Reno, 1000, 0x0a00_0001);
    let mut b = Peer::new(TcpVersion::Reno, 1000, 0x0a00_0002);

    let sa = a.open(1000);
    let sb = b.open(80);
    assert!(b.listen(sb));
    assert_eq!(b.state(sb), TcpState::Listen);
    assert!(a.connect(sa, b.ip, 80));
    assert_eq!(a.state(sa), TcpState::SynSent);

    let (syn, _) = a.drain();
    let iss_a = syn[0].seqno;
    b.deliver(syn.into_iter().next().unwrap(), a.ip);
    let (synack, _) = b.drain();
    let iss_b = synack[0].seqno;
    assert_eq!(synack[0].ackno, iss_a.wrapping_add(1));

    a.deliver(synack.into_iter().next().unwrap(), b.ip);
    let (ack, _) = a.drain();
    assert_eq!(ack[0].ackno, iss_b.wrapping_add(1));
    b.deliver(ack.into_iter().next().unwrap(), a.ip);

    assert!(a.master.connected(sa));
    assert!(b.master.connected(sb));
}

#[test_log::test]
fn segments_respect_sequence_bounds() {
    let mut a = Peer::new(TcpVersion::Reno, 1000, 1);
    let mut b = Peer::new(TcpVersion::Reno, 1000, 2);
    let (sa, sb) = establish(&mut a, &mut b);

    b.recv(sb, 1_000_000);
    a.send(sa, 5000);
    let (segs, _) = a.drain();
    assert!(!segs.is_empty());
    let s = a.master.session(sa).unwrap();
    let start = s.sndwnd.as_ref().unwrap().seq.start();
    let limit = start.wrapping_add(s.sndwnd.as_ref().unwrap().seq.win_size());
    for seg in &segs {
        // every emitted seqno lies within the send window
        assert!(seg.seqno.wrapping_sub(start) <= limit.wrapping_sub(start));
    }
}

#[test_log::test]
fn reno_fast_retransmit_and_recovery() {
    let mss = 1000;
    let mut a = Peer::new(TcpVersion::Reno, mss, 1);
    let mut b = Peer::new(TcpVersion::Reno, mss, 2);
    let (sa, sb) = establish(&mut a, &mut b);
    b.recv(sb, 1_000_000);
    b.drain();

    // open the window wide enough for eight segments in flight
    {
        let s = a.master.session_mut(sa).unwrap();
        s.cwnd = 8 * mss;
        s.ssthresh = 64_000;
    }
    assert_eq!(a.send(sa, 8 * mss), (8 * mss) as i64);
    let (mut segs, _) = a.drain();
    assert_eq!(segs.len(), 8);
    let s3 = segs.remove(2); // lost on the wire

    let mut acks = Vec::new();
    for seg in segs {
        b.deliver(seg, a.ip);
        let (out, _) = b.drain();
        acks.extend(out);
    }
    assert_eq!(acks.len(), 7);
    // in-order ACKs for s1 and s2, then five duplicates of s3's seqno
    assert_eq!(acks[1].ackno, s3.seqno);
    for dup in &acks[2..] {
        assert_eq!(dup.ackno, s3.seqno);
    }

    // two new ACKs grow the window in slow start
    a.deliver(acks.remove(0), b.ip);
    a.deliver(acks.remove(0), b.ip);
    a.drain();
    assert_eq!(a.master.session(sa).unwrap().cwnd, 10 * mss);

    // dup one and two change nothing yet
    a.deliver(acks.remove(0), b.ip);
    a.deliver(acks.remove(0), b.ip);
    let (out, _) = a.drain();
    assert!(out.is_empty());
    assert!(!a.master.session(sa).unwrap().fast_recovery);

    // the third duplicate triggers fast retransmit
    a.deliver(acks.remove(0), b.ip);
    let (out, _) = a.drain();
    let s = a.master.session(sa).unwrap();
    assert!(s.fast_recovery);
    assert_eq!(s.ssthresh, 5 * mss); // max(min(10mss, rwnd)/2, 2mss)
    assert_eq!(s.cwnd, 5 * mss + 3 * mss);
    assert!(out.iter().any(|h| h.seqno == s3.seqno), "fast retransmit of the hole");

    // further duplicates inflate the window by one mss each
    a.deliver(acks.remove(0), b.ip);
    a.deliver(acks.remove(0), b.ip);
    a.drain();
    assert_eq!(a.master.session(sa).unwrap().cwnd, 10 * mss);

    // recovery does not freeze new application data: the inflated window
    // has room for two fresh segments beyond everything sent so far
    let new_data = a.master.session(sa).unwrap().recover_seq;
    assert_eq!(a.send(sa, 2 * mss), (2 * mss) as i64);
    let (fresh, _) = a.drain();
    assert!(a.master.session(sa).unwrap().fast_recovery);
    assert_eq!(fresh.len(), 2);
    assert!(fresh.iter().any(|h| h.seqno == new_data));
    assert!(fresh.iter().any(|h| h.seqno == new_data.wrapping_add(mss)));

    // the retransmission fills the hole; the cumulative ACK ends recovery
    b.deliver(s3, a.ip);
    let (full, _) = b.drain();
    let full_ack = full.into_iter().next().unwrap();
    let recover = a.master.session(sa).unwrap().recover_seq;
    assert_eq!(full_ack.ackno, recover);
    a.deliver(full_ack, b.ip);
    a.drain();
    let s = a.master.session(sa).unwrap();
    assert!(!s.fast_recovery);
    assert_eq!(s.cwnd, s.ssthresh); // deflate to the threshold
    assert_eq!(s.ndupacks, 0);
}

#[test_log::test]
fn sack_fast_recovery_retransmits_exactly_the_holes() {
    let mss = 1000;
    let mut a = Peer::new(TcpVersion::Sack, mss, 1);
    let mut b = Peer::new(TcpVersion::Sack, mss, 2);
    let (sa, sb) = establish(&mut a, &mut b);
    b.recv(sb, 1_000_000);
    b.drain();

    {
        let s = a.master.session_mut(sa).unwrap();
        s.cwnd = 10 * mss;
        s.ssthresh = 64_000;
    }
    assert_eq!(a.send(sa, 10 * mss), (10 * mss) as i64);
    let (mut segs, _) = a.drain();
    assert_eq!(segs.len(), 10);
    let s6 = segs.remove(5);
    let s3 = segs.remove(2);

    let mut acks = Vec::new();
    for seg in segs {
        b.deliver(seg, a.ip);
        let (out, _) = b.drain();
        acks.extend(out);
    }
    assert_eq!(acks.len(), 8);
    // the duplicates carry SACK blocks for the ranges beyond the hole
    assert!(acks[2..].iter().all(|h| h.ackno == s3.seqno));
    assert!(matches!(acks[3].options, super::TcpOption::Sack(_)));

    // two new ACKs plus two duplicates leave the window grown but the
    // sender still out of recovery
    for ack in acks.drain(..4) {
        a.deliver(ack, b.ip);
    }
    a.drain();
    let cwnd_at_loss = a.master.session(sa).unwrap().cwnd;
    assert!(!a.master.session(sa).unwrap().fast_recovery);

    // the third duplicate enters fast recovery and resends the first hole
    a.deliver(acks.remove(0), b.ip);
    let (out, _) = a.drain();
    let s = a.master.session(sa).unwrap();
    assert!(s.fast_recovery);
    assert_eq!(s.cwnd, s.ssthresh);
    assert_eq!(s.sack_pipe, cwnd_at_loss - 3 * mss);
    assert!(out.iter().any(|h| h.seqno == s3.seqno), "first hole retransmitted");

    for ack in acks {
        a.deliver(ack, b.ip);
    }
    a.drain();

    // new application data offered mid-recovery is buffered, not lost;
    // with everything sent still unacknowledged there is no room yet
    let new_data = a.master.session(sa).unwrap().recover_seq;
    assert_eq!(a.send(sa, 2 * mss), (2 * mss) as i64);
    let (held, _) = a.drain();
    assert!(held.is_empty(), "the deflated window has no room yet");

    // fill the first hole: the partial ACK advances to the second hole,
    // fast recovery stays on, and the freed room admits the first fresh
    // segment alongside the retransmission
    b.deliver(s3, a.ip);
    let (partial, _) = b.drain();
    let partial = partial.into_iter().next().unwrap();
    assert_eq!(partial.ackno, s6.seqno);
    a.deliver(partial, b.ip);
    let (resent, _) = a.drain();
    assert!(a.master.session(sa).unwrap().fast_recovery);
    assert!(resent.iter().any(|h| h.seqno == s6.seqno), "second hole retransmitted");
    assert!(resent.iter().any(|h| h.seqno == new_data), "new data rides the freed room");

    // fill the second hole: full recovery, and the second fresh segment
    // follows once the window deflates and the backlog drains
    b.deliver(s6, a.ip);
    let (full, _) = b.drain();
    a.deliver(full.into_iter().next().unwrap(), b.ip);
    let (tail, _) = a.drain();
    let s = a.master.session(sa).unwrap();
    assert!(!s.fast_recovery);
    assert!(s.snd_scoreboard.is_empty());
    assert!(tail.iter().any(|h| h.seqno == new_data.wrapping_add(mss)));
    // the exit deflation counted the one fresh segment still in flight
    assert_eq!(s.cwnd, 2 * mss);
}

#[test_log::test]
fn graceful_close_both_sides() {
    let mut a = Peer::new(TcpVersion::Reno, 1000, 1);
    let mut b = Peer::new(TcpVersion::Reno, 1000, 2);
    let (sa, sb) = establish(&mut a, &mut b);

    // A initiates the close
    a.disconnect(sa);
    assert_eq!(a.state(sa), TcpState::FinWait1);
    let (fin_a, _) = a.drain();
    assert!(fin_a[0].has(TCP_FLAG_FIN));

    b.deliver(fin_a.into_iter().next().unwrap(), a.ip);
    assert_eq!(b.state(sb), TcpState::CloseWait);
    let (ack_of_fin, sigs) = b.drain();
    assert!(sigs.iter().any(|(s, _)| s & signal::SOCK_EOF != 0));
    a.deliver(ack_of_fin.into_iter().next().unwrap(), b.ip);
    assert_eq!(a.state(sa), TcpState::FinWait2);

    // B's application closes in turn
    b.disconnect(sb);
    assert_eq!(b.state(sb), TcpState::LastAck);
    let (fin_b, _) = b.drain();
    assert!(fin_b[0].has(TCP_FLAG_FIN));

    a.deliver(fin_b.into_iter().next().unwrap(), b.ip);
    assert_eq!(a.state(sa), TcpState::TimeWait);
    let (last_ack, _) = a.drain();
    b.deliver(last_ack.into_iter().next().unwrap(), a.ip);
    assert_eq!(b.state(sb), TcpState::Closed);
    let (_, sigs) = b.drain();
    assert!(sigs
        .iter()
        .any(|(s, _)| s & (signal::CONN_CLOSED | signal::SESSION_RELEASED)
            == (signal::CONN_CLOSED | signal::SESSION_RELEASED)));

    // A's TIME_WAIT expires after 2 MSL of slow-timer ticks
    let msl_ticks = 2 * 60_000_000 / a.master.cfg().slow_timeout + 1;
    for _ in 0..msl_ticks {
        a.slow_tick();
    }
    let (_, sigs) = a.drain();
    assert!(sigs
        .iter()
        .any(|(s, _)| s & (signal::CONN_CLOSED | signal::SESSION_RELEASED)
            == (signal::CONN_CLOSED | signal::SESSION_RELEASED)));
}

#[test_log::test]
fn retransmission_timeout_backs_off_and_resends() {
    let mss = 1000;
    let mut a = Peer::new(TcpVersion::Reno, mss, 1);
    let mut b = Peer::new(TcpVersion::Reno, mss, 2);
    let (sa, _sb) = establish(&mut a, &mut b);

    a.send(sa, mss);
    let (segs, _) = a.drain();
    let lost = &segs[0];
    let lost_seq = lost.seqno;

    // no ACK ever arrives; tick the slow timer until the RTO fires
    let mut resent = Vec::new();
    for _ in 0..1000 {
        a.slow_tick();
        let (out, _) = a.drain();
        resent.extend(out);
        if !resent.is_empty() {
            break;
        }
    }
    assert_eq!(resent[0].seqno, lost_seq, "timeout retransmits from the window base");
    let s = a.master.session(sa).unwrap();
    assert_eq!(s.nrxmits, 1);
    assert_eq!(s.cwnd, mss); // back to slow start
    assert!(s.timeout_loss);
}

#[test_log::test]
fn retransmit_exhaustion_resets_the_connection() {
    let mss = 1000;
    let mut a = Peer::new(TcpVersion::Reno, mss, 1);
    let mut b = Peer::new(TcpVersion::Reno, mss, 2);
    let (sa, _sb) = establish(&mut a, &mut b);

    a.send(sa, mss);
    a.drain();

    let max = a.master.cfg().max_rxmit;
    let mut reset_seen = false;
    for _ in 0..100_000 {
        a.slow_tick();
        let (segs, sigs) = a.drain();
        if segs.iter().any(|h| h.has(crate::tcp::message::TCP_FLAG_RST)) {
            assert!(sigs.iter().any(|(s, _)| s & signal::CONN_RESET != 0));
            reset_seen = true;
            break;
        }
    }
    assert!(reset_seen, "after {max} retransmissions the session must reset");
    assert_eq!(a.state(sa), TcpState::Closed);
}

#[test_log::test]
fn delayed_ack_rides_the_fast_timer() {
    let mss = 1000;
    let mut a = Peer::new(TcpVersion::Reno, mss, 1);
    let mut b = Peer::new(TcpVersion::Reno, mss, 2);
    // rebuild B with delayed ACKs on
    let init = crate::config::TcpInit {
        delayed_ack: true,
        mss,
        ..Default::default()
    };
    b.master = TcpMaster::new(TcpConfig::from_init(&init, TickScale::new(6)).unwrap());
    let (sa, sb) = establish(&mut a, &mut b);
    b.recv(sb, 1_000_000);
    b.drain();

    a.send(sa, mss);
    let (segs, _) = a.drain();
    b.deliver(segs.into_iter().next().unwrap(), a.ip);
    let (immediate, _) = b.drain();
    assert!(immediate.is_empty(), "the ACK waits for the fast timer");

    let mut ctx = b.harness.ctx();
    b.master.control(CtrlMsg::TcpFastTimer, &mut b.host, &mut ctx);
    drop(ctx);
    let (acked, _) = b.drain();
    assert_eq!(acked.len(), 1);
    assert!(acked[0].has(TCP_FLAG_ACK));
}
