use anyhow::{Context, Result};
use ipcookie_node::clock::MonotonicClock;
use ipcookie_node::config::CookieConfig;
use ipcookie_node::daemon::{spawn_receive_loop, ControlHandler};
use ipcookie_node::events::EventSink;
use ipcookie_node::shared::SharedState;
use ipcookie_node::shutdown::ShutdownSignal;
use ipcookie_node::transport::open_icmp6_channel;
use metrics::describe_counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

const DEFAULT_CONFIG_PATH: &str = "config/default";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let loaded = CookieConfig::from_file(&config_path);
    let config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => CookieConfig::default(),
    };

    init_logging(&config);

    info!("Starting IP cookie daemon v{}", env!("CARGO_PKG_VERSION"));
    match loaded {
        Ok(_) => info!(path = %config_path, "Configuration loaded"),
        Err(e) => warn!("Failed to load config file {}: {}, using defaults", config_path, e),
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Invalid configuration")?;

    initialize_metrics();
    if config.metrics.enabled {
        start_metrics_exporter(&config)?;
    }

    let node_id = Uuid::new_v4();
    let shutdown = ShutdownSignal::new();
    let shared = SharedState::new(config.cache.capacity).into_handle();
    let clock = Arc::new(MonotonicClock::new());

    let rotation_task = if config.rotation.enabled {
        info!(interval_seconds = config.rotation.interval_seconds, "Secret rotation enabled");
        Some(Arc::clone(&shared).spawn_rotation_task(config.rotation_interval(), shutdown.clone()))
    } else {
        warn!("Secret rotation disabled, cookies never expire on the receive side");
        None
    };

    let (transport, receiver) = open_icmp6_channel().context("Failed to open ICMPv6 channel (needs CAP_NET_RAW)")?;

    let events = EventSink::new(node_id, 256);
    let event_task = tokio::spawn(log_security_events(events.subscribe(), shutdown.clone()));

    let handler = Arc::new(ControlHandler::new(
        Arc::clone(&shared),
        &config,
        Arc::new(transport),
        events,
        clock,
    ));
    let receive_task = spawn_receive_loop(
        handler,
        receiver,
        Duration::from_millis(config.daemon.recv_timeout_ms),
        shutdown.clone(),
    );

    info!(node_id = %node_id, "IP cookie daemon running");

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    shutdown.initiate_shutdown();

    if let Err(e) = receive_task.await {
        error!(error = %e, "Receive loop terminated abnormally");
    }
    if let Some(task) = rotation_task {
        if let Err(e) = task.await {
            error!(error = %e, "Rotation task terminated abnormally");
        }
    }
    if let Err(e) = event_task.await {
        error!(error = %e, "Event logger terminated abnormally");
    }

    info!("IP cookie daemon stopped");
    Ok(())
}

fn init_logging(config: &CookieConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "ipcookied={level},ipcookie_node={level}",
            level = config.logging.level
        )
        .into()
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(config.logging.include_thread_id)
        .with_line_number(true);

    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Emit every security event as a JSON log line until shutdown
async fn log_security_events(mut events: broadcast::Receiver<ipcookie_node::SecurityEvent>, shutdown: ShutdownSignal) {
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => warn!(event = %json, "Security event"),
                    Err(e) => error!(error = %e, "Failed to serialize security event"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Security event logger lagging, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.wait() => break,
        }
    }
}

/// Describe all metrics exported by the node
fn initialize_metrics() {
    describe_counter!("ipcookie_entries_created", "Peer cookie entries created on the send path");
    describe_counter!("ipcookie_fallback_entered", "Peers switched to cookie-less sending");
    describe_counter!("ipcookie_fallback_expired", "Peers whose fallback period ended");
    describe_counter!("ipcookie_cookies_accepted", "Inbound datagrams with a valid cookie");
    describe_counter!("ipcookie_cookies_renewed", "Inbound cookies from the previous secret");
    describe_counter!("ipcookie_cookies_rejected", "Inbound datagrams with an invalid cookie");
    describe_counter!("ipcookie_unmarked_received", "Inbound datagrams without a cookie");
    describe_counter!("ipcookie_setcookie_sent", "SET-COOKIE messages sent by the receive path");
    describe_counter!("ipcookie_setcookie_applied", "SET-COOKIE messages applied to the cache");
    describe_counter!("ipcookie_setcookie_stale", "SET-COOKIE messages with a stale echo");
    describe_counter!("ipcookie_control_received", "Control messages received");
    describe_counter!("ipcookie_control_malformed", "Malformed control messages discarded");
    describe_counter!("ipcookie_control_sent", "Control messages sent, by code");
    describe_counter!("ipcookie_control_send_errors", "Control messages that failed to send");
    describe_counter!("ipcookie_not_expected_forged", "SETCOOKIE-NOT-EXPECTED with an unknown cookie");
    describe_counter!("ipcookie_spoof_detected", "Spoofed datagrams detected");
    describe_counter!("ipcookie_security_events", "Security events published");
    describe_counter!("ipcookie_secret_rotations", "Stateless secret rotations");
}

fn start_metrics_exporter(config: &CookieConfig) -> Result<()> {
    let listen_addr = config.metrics_addr().context("Invalid metrics listen address")?;

    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    builder
        .with_http_listener(listen_addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!(metrics_addr = %listen_addr, "Prometheus metrics exporter started");
    Ok(())
}
