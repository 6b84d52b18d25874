//! Zonewatch - zone enter/exit/dwell events from tracked detections
//!
//! Module structure:
//! - `domain/` - Core types (zones, detections, events)
//! - `io/` - External interfaces (MQTT ingress and egress, replay, Prometheus)
//! - `services/` - Zone logic (geometry, membership engine, frame processor)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use zonewatch::domain::load_zone_file;
use zonewatch::infra::{Config, Metrics};
use zonewatch::io::{create_event_channel, DiagnosticSink, EventPublisher, MqttTransport, PublisherSettings};
use zonewatch::services::{EngineSettings, FrameProcessor, GeometryIndex, MembershipEngine};

/// Zonewatch - zone membership events for tracked objects
#[derive(Parser, Debug)]
#[command(name = "zonewatch", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Read detection frames from a JSONL file instead of MQTT
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    // Default: INFO, use RUST_LOG=debug for per-frame visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    info!(git_hash = env!("GIT_HASH"), "zonewatch starting");

    let config_path = Config::resolve_config_path(args.config.as_deref());
    let config = Config::from_file(&config_path)?;

    info!(
        config_file = %config.config_file(),
        site = %config.site_id().unwrap_or("default"),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        ingress_topic = %config.ingress_topic(),
        egress_topic = %config.egress_topic(),
        zones_file = %config.zones_file(),
        tolerance_ms = %config.tolerance_ms(),
        track_lost_ms = %config.track_lost_ms(),
        dwell_threshold_ms = %config.dwell_threshold_ms(),
        hierarchy_policy = ?config.hierarchy_policy(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let zones = load_zone_file(config.zones_file(), config.frame_bounds())?;
    let geometry = GeometryIndex::new(zones)
        .with_context(|| format!("Invalid zone geometry in {}", config.zones_file()))?;
    info!(zones = %geometry.len(), "zones_loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let metrics = Arc::new(Metrics::new());

    // Event queue and publisher
    let (event_sender, event_rx) =
        create_event_channel(config.egress_queue_size(), config.egress_high_water(), metrics.clone());
    let transport = MqttTransport::connect(&config, metrics.clone());
    let publisher = EventPublisher::new(
        transport,
        event_rx,
        PublisherSettings::from_config(&config),
        DiagnosticSink::new(config.diagnostics_file()),
        metrics.clone(),
    );
    let publisher_handle = tokio::spawn(publisher.run(shutdown_rx.clone()));

    // Frame source
    let (frame_tx, frame_rx) = mpsc::channel(config.ingress_queue_size());
    if let Some(replay_path) = args.replay {
        tokio::spawn(async move {
            if let Err(e) = zonewatch::io::replay::replay_file(&replay_path, frame_tx).await {
                error!(error = %format!("{e:#}"), "replay_failed");
            }
        });
    } else {
        let mqtt_config = config.clone();
        let mqtt_metrics = metrics.clone();
        let mqtt_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) =
                zonewatch::io::mqtt::start_mqtt_client(&mqtt_config, frame_tx, mqtt_metrics, mqtt_shutdown).await
            {
                error!(error = %e, "MQTT ingress error");
            }
        });
    }

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().unwrap_or("default").to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) =
                zonewatch::io::prometheus::start_metrics_server(prometheus_port, prom_metrics, prom_site, prom_shutdown)
                    .await
            {
                error!(error = %format!("{e:#}"), "Prometheus metrics server error");
            }
        });
    }

    // Periodic metrics summary
    let reporter_metrics = metrics.clone();
    let mut reporter_shutdown = shutdown_rx.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => reporter_metrics.report().log(),
                _ = reporter_shutdown.changed() => {
                    if *reporter_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    // Handle shutdown on Ctrl+C
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown_signal_received");
            let _ = signal_tx.send(true);
        }
    });

    let engine = MembershipEngine::new(geometry, EngineSettings::from_config(&config), metrics.clone());
    let processor = FrameProcessor::new(engine, event_sender);

    // Runs until the frame source ends (replay) or shutdown is signalled
    let stats = processor.run(frame_rx, shutdown_rx).await;

    // The processor dropped its event sender; the publisher drains and stops
    let _ = shutdown_tx.send(true);
    match publisher_handle.await {
        Ok(diagnostics) => info!(undelivered = %diagnostics.records(), "publisher_joined"),
        Err(e) => error!(error = %e, "publisher task failed"),
    }

    metrics.report().log();
    info!(frames = %stats.frames, events = %stats.events, "zonewatch shutdown complete");
    Ok(())
}
