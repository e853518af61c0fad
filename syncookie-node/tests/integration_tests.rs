//! End-to-end tests for the SYN cookie node: flood detection, key rotation windows and
//! the full SYN / SYN-ACK / ACK exchange through the filter hook.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use syncookie_node::config::HandshakeConfig;
use syncookie_node::filter::{observe_handshake, restore_replay_tag};
use syncookie_node::status::RotationOutcome;
use syncookie_node::wire::{build_segment, parse_segment};
use syncookie_node::{
    filter_tcp, ConnectionDescriptor, Direction, FloodCheck, HandshakeTable, NodeConfig,
    RecordingSender, RotatorState, SyncookieEngine, TcpFlags, Verdict,
};

struct Node {
    engine: Arc<SyncookieEngine>,
    half_open: Arc<AtomicU64>,
    sender: Arc<RecordingSender>,
}

fn node(enabled: bool, adaptive: bool) -> Node {
    let mut config = NodeConfig::default();
    config.syncookies.enabled = enabled;
    config.syncookies.adaptive = adaptive;
    config.syncookies.hiwat = 100;
    config.syncookies.lowat = 50;

    let half_open = Arc::new(AtomicU64::new(0));
    let sender = Arc::new(RecordingSender::new());
    let engine = SyncookieEngine::new(&config, half_open.clone(), sender.clone()).unwrap();
    Node {
        engine: Arc::new(engine),
        half_open,
        sender,
    }
}

fn client_syn(n: u16) -> ConnectionDescriptor {
    ConnectionDescriptor {
        src: IpAddr::V4(Ipv4Addr::new(198, 18, (n >> 8) as u8, n as u8)),
        dst: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 80)),
        sport: 30000 + n,
        dport: 80,
        seq: 0x0100_0000 + u32::from(n),
        ack: 0,
        flags: TcpFlags::SYN,
        mss: Some(1460),
        wscale: Some(7),
        sack_permitted: true,
        direction: Direction::In,
        recreated: false,
    }
}

fn ack_for(syn: &ConnectionDescriptor, iss: u32) -> ConnectionDescriptor {
    ConnectionDescriptor {
        seq: syn.seq.wrapping_add(1),
        ack: iss.wrapping_add(1),
        flags: TcpFlags::ACK,
        mss: None,
        wscale: None,
        sack_permitted: false,
        ..syn.clone()
    }
}

#[test]
fn test_adaptive_flood_scenario() {
    let node = node(true, true);
    let engine = &node.engine;

    node.half_open.store(150, Ordering::SeqCst);
    assert_eq!(engine.check_flood(&client_syn(0)), FloodCheck::ActiveAdaptive);
    assert!(engine.get_config().active);

    // The rotation task mints the first key
    assert!(matches!(engine.rotate_keys(), RotationOutcome::Rotated { .. }));
    assert!(engine.stats().keys_present);

    let slot = engine.stats().current_slot;
    let mut acks = Vec::new();
    for n in 0..10 {
        let syn = client_syn(n);
        let iss = engine.send_cookie_synack(&syn).unwrap();
        acks.push(ack_for(&syn, iss));
    }
    assert_eq!(engine.stats().in_flight[slot], 10);
    assert_eq!(node.sender.sent().len(), 10);

    for ack in &acks {
        assert!(engine.validate_cookie(ack));
    }
    assert_eq!(engine.stats().in_flight[slot], 0);

    node.half_open.store(10, Ordering::SeqCst);
    assert_eq!(engine.rotate_keys(), RotationOutcome::Stopped);
    let stats = engine.stats();
    assert!(!stats.active);
    assert!(!stats.keys_present);
}

#[test]
fn test_hysteresis_keeps_active_between_watermarks() {
    let node = node(true, true);
    let engine = &node.engine;

    node.half_open.store(101, Ordering::SeqCst);
    engine.check_flood(&client_syn(0));
    engine.rotate_keys();

    // Between lowat and hiwat: stays on
    node.half_open.store(75, Ordering::SeqCst);
    assert!(matches!(engine.rotate_keys(), RotationOutcome::Rotated { .. }));
    assert_eq!(engine.check_flood(&client_syn(1)), FloodCheck::ActiveAdaptive);

    // Outstanding cookies count toward the load
    node.half_open.store(0, Ordering::SeqCst);
    for n in 0..60 {
        engine.generate(&client_syn(n), 1460);
    }
    assert!(matches!(engine.rotate_keys(), RotationOutcome::Rotated { .. }));
    assert!(engine.get_config().active);
}

#[test]
fn test_key_window_bound() {
    let node = node(true, false);
    let engine = &node.engine;

    let syn = client_syn(7);
    let iss = engine.generate(&syn, 1460);
    let ack = ack_for(&syn, iss);

    engine.rotate_keys();
    assert!(engine.check_cookie(&ack), "cookie must survive one rotation");

    engine.rotate_keys();
    assert!(!engine.check_cookie(&ack), "cookie must expire once its slot is reused");
    assert!(!engine.validate_cookie(&ack));
}

#[test]
fn test_never_honors_outstanding_cookies() {
    let node = node(true, false);
    let engine = &node.engine;

    let syn = client_syn(3);
    let iss = engine.send_cookie_synack(&syn).unwrap();
    engine.set_config(false, false, 100, 50).unwrap();

    // First tick deactivates but keeps the keys while a cookie is in flight
    assert!(matches!(engine.rotate_keys(), RotationOutcome::Rotated { .. }));
    assert!(!engine.get_config().active);
    assert!(engine.validate_cookie(&ack_for(&syn, iss)));

    assert_eq!(engine.rotate_keys(), RotationOutcome::Stopped);
    assert!(!engine.stats().keys_present);
}

#[test]
fn test_invalid_config_leaves_state() {
    let node = node(true, true);
    let before = node.engine.get_config();
    assert!(node.engine.set_config(true, false, 50, 60).is_err());
    assert_eq!(node.engine.get_config(), before);
}

#[test]
fn test_wire_level_handshake() {
    let node = node(true, false);
    let table = HandshakeTable::new(&HandshakeConfig {
        timeout_seconds: 30,
        cleanup_interval_seconds: 5,
        max_tracked: 1024,
    });

    let syn = client_syn(1);
    let syn_bytes = build_segment(&syn_segment(&syn)).unwrap();
    let parsed = parse_segment(&syn_bytes, Direction::In).unwrap();
    let verdict = filter_tcp(&node.engine, &parsed, false);
    assert_eq!(verdict, Verdict::Drop);
    observe_handshake(&table, &parsed, &verdict);
    assert!(table.is_empty());

    let synack = node.sender.take().pop().unwrap();
    let synack_bytes = build_segment(&synack).unwrap();
    let synack_seen = parse_segment(&synack_bytes, Direction::Out).unwrap();
    assert_eq!(synack_seen.flags, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(synack_seen.ack, syn.seq + 1);

    let ack = ack_for(&syn, synack_seen.seq);
    let Verdict::Replay(rebuilt) = filter_tcp(&node.engine, &ack, false) else {
        panic!("valid cookie ACK was not turned into a SYN");
    };
    assert_eq!(rebuilt.seq, syn.seq);
    assert_eq!(rebuilt.mss, Some(1460));
    assert_eq!(rebuilt.wscale, Some(7));
    assert!(rebuilt.recreated);

    // Injected back through the raw socket, the SYN loses its tag on the wire
    table.mark_replayed(rebuilt.flow_key());
    let mut replayed = parse_segment(&build_segment(&rebuilt).unwrap(), Direction::In).unwrap();
    restore_replay_tag(&table, &mut replayed);
    assert!(replayed.recreated);
    let verdict = filter_tcp(&node.engine, &replayed, false);
    assert_eq!(verdict, Verdict::Continue);
    observe_handshake(&table, &replayed, &verdict);
    assert!(table.contains(&syn.flow_key()));
    assert!(node.sender.sent().is_empty());
}

fn syn_segment(syn: &ConnectionDescriptor) -> syncookie_node::TcpSegment {
    syncookie_node::TcpSegment {
        src: syn.src,
        dst: syn.dst,
        sport: syn.sport,
        dport: syn.dport,
        seq: syn.seq,
        ack: 0,
        flags: syn.flags,
        window: 64240,
        mss: syn.mss,
        wscale: syn.wscale,
        sack_permitted: syn.sack_permitted,
        ttl: 64,
        recreated: false,
    }
}

#[tokio::test(start_paused = true)]
async fn test_rotator_drives_adaptive_cycle() {
    let node = node(true, true);
    let cancel = CancellationToken::new();
    let rotator = node.engine.spawn_rotator(cancel.clone());

    node.half_open.store(500, Ordering::SeqCst);
    assert_eq!(node.engine.check_flood(&client_syn(0)), FloodCheck::ActiveAdaptive);
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(node.engine.stats().keys_present);
    assert_eq!(rotator.state(), RotatorState::Running);

    let syn = client_syn(9);
    let iss = node.engine.generate(&syn, 1460);
    let ack = ack_for(&syn, iss);

    // One interval later the cookie is still honored
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert!(node.engine.check_cookie(&ack));

    // After a second interval its slot has been reused
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(!node.engine.check_cookie(&ack));

    node.half_open.store(0, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(rotator.state(), RotatorState::Stopped);
    assert!(!node.engine.get_config().active);

    cancel.cancel();
    rotator.join().await;
}

#[test]
fn test_config_file_drives_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.toml");
    let path = path.to_str().unwrap();

    let mut config = NodeConfig::default();
    config.syncookies.enabled = true;
    config.syncookies.adaptive = true;
    config.syncookies.hiwat = 2000;
    config.syncookies.lowat = 1000;
    config.save_to_file(path).unwrap();

    let loaded = NodeConfig::from_file(path).unwrap();
    loaded.validate().unwrap();
    let engine = SyncookieEngine::new(
        &loaded,
        Arc::new(AtomicU64::new(0)),
        Arc::new(RecordingSender::new()),
    )
    .unwrap();

    let settings = engine.get_config();
    assert!(settings.enabled && settings.adaptive);
    assert_eq!((settings.hiwat, settings.lowat), (2000, 1000));
    assert!(!settings.active);
}
