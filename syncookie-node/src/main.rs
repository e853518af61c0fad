use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use pnet::packet::Packet;
use pnet::transport::{ipv4_packet_iter, TransportReceiver};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use syncookie_node::config::NodeConfig;
use syncookie_node::filter::{observe_handshake, restore_replay_tag};
use syncookie_node::management::start_management_api;
use syncookie_node::secret::Secret;
use syncookie_node::wire::{parse_segment, RawSocketSender};
use syncookie_node::{
    filter_tcp, Direction, HandshakeTable, RecordingSender, SegmentSender, SyncookieEngine,
    Verdict,
};

const DEFAULT_CONFIG_PATH: &str = "config/default";
const MANAGEMENT_TOKEN_ENV: &str = "SYNCOOKIE_MANAGEMENT_TOKEN";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    // Load configuration from file if available, otherwise use defaults
    let (mut config, load_error) = match NodeConfig::from_file(&config_path) {
        Ok(config) => match config.validate() {
            Ok(()) => (config, None),
            Err(e) => (NodeConfig::default(), Some(format!("invalid configuration: {}", e))),
        },
        Err(e) => (NodeConfig::default(), Some(e.to_string())),
    };

    init_logging(&config);

    info!("Starting SYN cookie node v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        None => info!(path = %config_path, "Configuration loaded"),
        Some(e) => warn!(path = %config_path, error = %e, "Failed to load config file, using defaults"),
    }

    if config.management.auth_token.is_none() {
        config.management.auth_token = Secret::from_env(MANAGEMENT_TOKEN_ENV).ok();
    }

    initialize_metrics();
    if config.metrics_enabled() {
        let addr = config.metrics_addr().context("Invalid metrics listen address")?;
        start_metrics_exporter(addr)?;
    }

    let cancel = CancellationToken::new();
    let handshakes = Arc::new(HandshakeTable::new(&config.handshake));

    let (sender, receiver): (Arc<dyn SegmentSender>, Option<TransportReceiver>) =
        if config.network.raw_socket_enabled {
            let (sender, rx) = RawSocketSender::open(config.network.channel_buffer_size)
                .context("Failed to open raw socket (CAP_NET_RAW required)")?;
            (Arc::new(sender) as Arc<dyn SegmentSender>, Some(rx))
        } else {
            info!("Raw socket disabled, cookie SYN-ACKs are recorded only");
            (Arc::new(RecordingSender::new()) as Arc<dyn SegmentSender>, None)
        };

    let engine = Arc::new(
        SyncookieEngine::new(&config, handshakes.clone(), Arc::clone(&sender))
            .context("Failed to initialize syncookie engine")?,
    );
    let settings = engine.get_config();
    info!(
        enabled = settings.enabled,
        adaptive = settings.adaptive,
        hiwat = settings.hiwat,
        lowat = settings.lowat,
        key_lifetime_secs = config.syncookies.key_lifetime_seconds,
        "Syncookie engine ready"
    );

    let rotator = engine.spawn_rotator(cancel.child_token());
    let cleanup = Arc::clone(&handshakes)
        .start_cleanup_task(config.handshake_cleanup_interval(), cancel.child_token());

    if config.management_enabled() {
        let management_config = config.management.clone();
        let engine = Arc::clone(&engine);
        let token = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = start_management_api(management_config, engine, token).await {
                error!(error = %e, "Management API server failed");
            }
        });
    }

    let segment_loop = match receiver {
        Some(rx) => {
            let local = config.interface_addr().context("Invalid interface address")?;
            let engine = Arc::clone(&engine);
            let handshakes = Arc::clone(&handshakes);
            let token = cancel.child_token();
            Some(tokio::task::spawn_blocking(move || {
                run_segment_loop(rx, local, engine, handshakes, sender, token)
            }))
        }
        None => None,
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    cancel.cancel();
    rotator.join().await;
    let _ = cleanup.await;
    if let Some(handle) = segment_loop {
        let _ = handle.await;
    }
    engine.shutdown();

    info!("SYN cookie node stopped");
    Ok(())
}

fn init_logging(config: &NodeConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.json_logging() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    }
}

/// Receive inbound TCP through the raw socket and run each segment through the cookie path
fn run_segment_loop(
    mut rx: TransportReceiver,
    local: IpAddr,
    engine: Arc<SyncookieEngine>,
    handshakes: Arc<HandshakeTable>,
    sender: Arc<dyn SegmentSender>,
    cancel: CancellationToken,
) {
    info!(local = %local, "Segment loop started");
    let mut packets = ipv4_packet_iter(&mut rx);

    while !cancel.is_cancelled() {
        let packet = match packets.next_with_timeout(Duration::from_millis(500)) {
            Ok(Some((packet, _))) => packet,
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Failed to receive segment");
                continue;
            }
        };

        let Some(mut conn) = parse_segment(packet.packet(), Direction::In) else {
            continue;
        };
        if !local.is_unspecified() && conn.dst != local {
            continue;
        }
        restore_replay_tag(&handshakes, &mut conn);

        let has_state = handshakes.contains(&conn.flow_key());
        let verdict = filter_tcp(&engine, &conn, has_state);
        observe_handshake(&handshakes, &conn, &verdict);

        if let Verdict::Replay(syn) = verdict {
            debug!(src = %syn.src, sport = syn.sport, "Injecting rebuilt SYN");
            handshakes.mark_replayed(syn.flow_key());
            if let Err(e) = sender.send_segment(&syn) {
                handshakes.take_replayed(&syn.flow_key());
                warn!(error = %e, "Failed to inject rebuilt SYN");
            }
        }
    }

    info!("Segment loop stopped");
}

/// Initialize metrics descriptions
fn initialize_metrics() {
    describe_counter!(
        "syncookies_sent_total",
        "Total number of SYN-ACKs answered with a cookie"
    );
    describe_counter!(
        "syncookies_validated_total",
        "Total number of ACKs carrying a valid cookie"
    );
    describe_counter!(
        "syncookies_rejected_total",
        "Total number of ACKs whose cookie failed validation"
    );
    describe_gauge!(
        "syncookies_active",
        "Whether cookies are currently being issued (1) or not (0)"
    );
    describe_gauge!(
        "syncookies_half_open",
        "Number of tracked half-open handshakes"
    );
}

/// Install the Prometheus exporter
fn start_metrics_exporter(listen_addr: SocketAddr) -> Result<()> {
    info!(
        metrics_addr = %listen_addr,
        "Starting Prometheus metrics server"
    );

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(listen_addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    Ok(())
}
