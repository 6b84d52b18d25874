//! Prometheus metrics HTTP endpoint
//!
//! Exposes zonewatch metrics in Prometheus text format at /metrics and a
//! liveness check at /health. Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use anyhow::Context;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

fn write_gauge_f64(output: &mut String, name: &str, help: &str, site: &str, val: f64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} gauge");
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val:.6}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {}", avg * count);
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_frame_metrics(&mut output, site_id, &summary);
    write_membership_metrics(&mut output, site_id, &summary);
    write_publisher_metrics(&mut output, site_id, &summary);

    output
}

fn write_frame_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "zonewatch_frames_total",
        "Detection frames processed",
        MetricType::Counter,
        site,
        summary.frames_total,
    );
    write_gauge_f64(
        output,
        "zonewatch_frames_per_sec",
        "Frames processed per second over the current window",
        site,
        summary.frames_per_sec,
    );
    write_histogram(
        output,
        "zonewatch_frame_latency_us",
        "Per-frame processing latency in microseconds",
        site,
        &summary.lat_buckets,
        summary.avg_frame_latency_us,
    );
    write_metric(
        output,
        "zonewatch_frames_rejected_total",
        "Frames rejected for going back in time",
        MetricType::Counter,
        site,
        summary.frames_rejected,
    );
    write_metric(
        output,
        "zonewatch_frames_dropped_total",
        "Frames dropped because the frame queue was full",
        MetricType::Counter,
        site,
        summary.frames_dropped,
    );
    write_metric(
        output,
        "zonewatch_detections_total",
        "Valid detections evaluated",
        MetricType::Counter,
        site,
        summary.detections_total,
    );
    write_metric(
        output,
        "zonewatch_detections_dropped_total",
        "Detections discarded as malformed or duplicate",
        MetricType::Counter,
        site,
        summary.detections_dropped,
    );
}

fn write_membership_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    let _ = writeln!(output, "# HELP zonewatch_events_emitted_total Zone events emitted by type");
    let _ = writeln!(output, "# TYPE zonewatch_events_emitted_total counter");
    for (event_type, count) in [
        ("zone_enter", summary.zone_enter_total),
        ("zone_exit", summary.zone_exit_total),
        ("dwell", summary.dwell_total),
    ] {
        let _ = writeln!(
            output,
            "zonewatch_events_emitted_total{{site=\"{site}\",event_type=\"{event_type}\"}} {count}"
        );
    }

    write_metric(
        output,
        "zonewatch_forced_exits_total",
        "Exits forced by track disappearance",
        MetricType::Counter,
        site,
        summary.forced_exits_total,
    );
    write_metric(
        output,
        "zonewatch_abandoned_memberships_total",
        "Memberships dropped without exit when a zone was deactivated",
        MetricType::Counter,
        site,
        summary.abandoned_total,
    );
    write_metric(
        output,
        "zonewatch_invariant_violations_total",
        "Membership state consistency violations detected",
        MetricType::Counter,
        site,
        summary.invariant_violations,
    );
    write_metric(output, "zonewatch_active_tracks", "Tracks currently known", MetricType::Gauge, site, summary.active_tracks);
    write_metric(
        output,
        "zonewatch_active_memberships",
        "Track and zone pairs in INSIDE or GRACE",
        MetricType::Gauge,
        site,
        summary.active_memberships,
    );
}

fn write_publisher_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "zonewatch_events_published_total",
        "Events accepted by the transport",
        MetricType::Counter,
        site,
        summary.events_published,
    );
    write_metric(
        output,
        "zonewatch_events_publish_failed_total",
        "Publish attempts the transport rejected",
        MetricType::Counter,
        site,
        summary.events_publish_failed,
    );
    write_metric(
        output,
        "zonewatch_events_degraded_total",
        "Events written to diagnostics instead of the transport",
        MetricType::Counter,
        site,
        summary.events_degraded,
    );
    write_metric(
        output,
        "zonewatch_events_queue_dropped_total",
        "Events dropped because the event queue was full",
        MetricType::Counter,
        site,
        summary.events_queue_dropped,
    );
    write_metric(
        output,
        "zonewatch_events_discarded_total",
        "Events left in the queue when the shutdown drain timed out",
        MetricType::Counter,
        site,
        summary.events_discarded,
    );
    write_metric(
        output,
        "zonewatch_pubacks_total",
        "Broker acknowledgements received",
        MetricType::Counter,
        site,
        summary.pubacks_total,
    );
    write_metric(
        output,
        "zonewatch_event_queue_depth",
        "Events waiting for the publisher",
        MetricType::Gauge,
        site,
        summary.event_queue_depth,
    );
    write_metric(
        output,
        "zonewatch_event_queue_peak",
        "Highest event queue depth observed",
        MetricType::Gauge,
        site,
        summary.event_queue_peak,
    );
    write_metric(
        output,
        "zonewatch_transport_connected",
        "1 when the event transport is connected",
        MetricType::Gauge,
        site,
        u64::from(summary.transport_connected),
    );
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics, &site_id),
        ),
        (&Method::GET, "/health") => text_response(StatusCode::OK, "text/plain", "ok".to_string()),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics endpoint on {addr}"))?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                handle_request(req, metrics.clone(), site_id.clone())
                            });

                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::ZoneEventType;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_frame_processed(150);
        metrics.record_frame_processed(250);
        metrics.record_event_emitted(ZoneEventType::ZoneEnter);
        metrics.record_event_emitted(ZoneEventType::Dwell);
        metrics.set_engine_population(3, 5);
        metrics.set_transport_connected(true);

        let output = format_prometheus_metrics(&metrics, "dc-north");

        assert!(output.contains("zonewatch_frames_total{site=\"dc-north\"} 2"));
        assert!(output.contains("zonewatch_frame_latency_us_bucket{site=\"dc-north\",le=\"+Inf\"} 2"));
        assert!(output.contains("zonewatch_events_emitted_total{site=\"dc-north\",event_type=\"zone_enter\"} 1"));
        assert!(output.contains("zonewatch_events_emitted_total{site=\"dc-north\",event_type=\"zone_exit\"} 0"));
        assert!(output.contains("zonewatch_active_tracks{site=\"dc-north\"} 3"));
        assert!(output.contains("zonewatch_active_memberships{site=\"dc-north\"} 5"));
        assert!(output.contains("zonewatch_transport_connected{site=\"dc-north\"} 1"));
    }

    #[test]
    fn test_scrape_does_not_consume_report_window() {
        let metrics = Metrics::new();
        metrics.record_frame_processed(150);

        let _ = format_prometheus_metrics(&metrics, "default");
        assert_eq!(metrics.report().lat_buckets.iter().sum::<u64>(), 1);
    }
}
