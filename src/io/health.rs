//! Health and Prometheus metrics HTTP endpoint
//!
//! - GET /health  -> 200 while ingestion is fresh, 503 once it goes stale
//! - GET /metrics -> Prometheus text format
//!
//! Uses hyper for the HTTP server.

use crate::domain::timestamp::to_backend_string;
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Shared state for request handlers
pub struct HealthState {
    pub metrics: Arc<Metrics>,
    pub site_id: String,
    pub stale_after: Duration,
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
}

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
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(summary: &MetricsSummary, site: &str) -> String {
    let mut output = String::with_capacity(4096);

    let counters: [(&str, &str, u64); 10] = [
        ("counter_sync_cycles_total", "Poll cycles completed", summary.cycles_total),
        ("counter_sync_sensor_polls_total", "Successful sensor fetches", summary.sensor_polls_total),
        (
            "counter_sync_sensor_poll_failures_total",
            "Sensor polls that failed",
            summary.sensor_poll_failures_total,
        ),
        ("counter_sync_records_fetched_total", "Records read from sensors", summary.records_fetched_total),
        ("counter_sync_records_inserted_total", "Records inserted", summary.records_inserted_total),
        ("counter_sync_records_updated_total", "Records updated", summary.records_updated_total),
        (
            "counter_sync_records_unchanged_total",
            "Records already up to date",
            summary.records_unchanged_total,
        ),
        (
            "counter_sync_records_decreased_total",
            "Updates whose totals went down",
            summary.records_decreased_total,
        ),
        (
            "counter_sync_records_rejected_future_total",
            "Future-dated records dropped",
            summary.records_rejected_future_total,
        ),
        ("counter_sync_store_errors_total", "Table store errors", summary.store_errors_total),
    ];
    for (name, help, val) in counters {
        write_metric(&mut output, name, help, MetricType::Counter, site, val);
    }

    write_histogram(
        &mut output,
        "counter_sync_fetch_latency_ms",
        "Sensor fetch latency in milliseconds",
        site,
        &summary.fetch_latency_cumulative_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.fetch_latency_cumulative_sum_ms,
    );

    write_metric(
        &mut output,
        "counter_sync_last_success_timestamp_seconds",
        "Unix time of the last cycle with a successful sensor",
        MetricType::Gauge,
        site,
        summary.last_success_epoch_ms.unwrap_or(0) / 1000,
    );

    output
}

/// Health verdict and JSON body
pub fn health_response(state: &HealthState, now: DateTime<Utc>) -> (StatusCode, String) {
    let last_success = state
        .metrics
        .last_success_epoch_ms()
        .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms as i64));

    // Before the first success, measure from process start
    let reference = last_success.unwrap_or(state.started_at);
    let age = (now - reference).to_std().unwrap_or_default();
    let fresh = age <= state.stale_after;

    let body = serde_json::json!({
        "status": if fresh { "ok" } else { "stale" },
        "site": state.site_id,
        "version": state.version,
        "last_success": last_success.map(to_backend_string),
        "age_secs": age.as_secs(),
    });
    let status = if fresh { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, body.to_string())
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<HealthState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&state.metrics.snapshot(), &state.site_id);
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
        }
        (&Method::GET, "/health") => {
            let (status, body) = health_response(&state, Utc::now());
            Response::builder()
                .status(status)
                .header("Content-Type", "application/json")
                .body(Full::new(Bytes::from(body)))
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found"))),
    };

    Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::from("internal error")))))
}

/// Start the health/metrics HTTP server
pub async fn start_health_server(
    port: u16,
    state: Arc<HealthState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, site = %state.site_id, "health_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "health_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "health_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("health_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn state(metrics: Arc<Metrics>, started_at: DateTime<Utc>) -> HealthState {
        HealthState {
            metrics,
            site_id: "mall-a".to_string(),
            stale_after: Duration::from_secs(7200),
            version: "test",
            started_at,
        }
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).single().unwrap()
    }

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_fetch(120, 4);
        metrics.record_upsert(3, 1, 0, 0);
        metrics.record_poll_failure();

        let output = format_prometheus_metrics(&metrics.snapshot(), "mall-a");

        assert!(output.contains("counter_sync_sensor_polls_total{site=\"mall-a\"} 1"));
        assert!(output.contains("counter_sync_records_inserted_total{site=\"mall-a\"} 3"));
        assert!(output.contains("counter_sync_sensor_poll_failures_total{site=\"mall-a\"} 1"));
        assert!(output.contains("counter_sync_fetch_latency_ms_bucket{site=\"mall-a\",le=\"200\"} 1"));
        assert!(output.contains("counter_sync_fetch_latency_ms_count{site=\"mall-a\"} 1"));
        assert!(output.contains("counter_sync_fetch_latency_ms_sum{site=\"mall-a\"} 120"));
    }

    #[test]
    fn test_latency_histogram_survives_periodic_report() {
        let metrics = Metrics::new();
        metrics.record_fetch(120, 1);
        metrics.record_fetch(900, 1);
        let _ = metrics.report();
        metrics.record_fetch(40, 1);

        let output = format_prometheus_metrics(&metrics.report(), "mall-a");
        assert!(output.contains("counter_sync_fetch_latency_ms_count{site=\"mall-a\"} 3"));
        assert!(output.contains("counter_sync_fetch_latency_ms_sum{site=\"mall-a\"} 1060"));
        assert!(output.contains("counter_sync_fetch_latency_ms_bucket{site=\"mall-a\",le=\"+Inf\"} 3"));
    }

    #[test]
    fn test_health_fresh_after_success() {
        let metrics = Arc::new(Metrics::new());
        metrics.mark_success(at(10).timestamp_millis() as u64);
        let (status, body) = health_response(&state(metrics, at(0)), at(11));

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["last_success"], "2024-05-01T10:00:00Z");
        assert_eq!(json["age_secs"], 3600);
    }

    #[test]
    fn test_health_stale_after_threshold() {
        let metrics = Arc::new(Metrics::new());
        metrics.mark_success(at(1).timestamp_millis() as u64);
        let (status, body) = health_response(&state(metrics, at(0)), at(4));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("\"stale\""));
    }

    #[test]
    fn test_health_grace_period_before_first_success() {
        let metrics = Arc::new(Metrics::new());
        let (status, _) = health_response(&state(metrics.clone(), at(10)), at(11));
        assert_eq!(status, StatusCode::OK);

        let (status, body) = health_response(&state(metrics, at(5)), at(11));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("\"last_success\":null"));
    }
}
