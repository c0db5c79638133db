use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::server::bind_address;

/// Prometheus metrics for relay health and observability.
///
/// All metrics use the "emoji_relay" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Subscribers currently connected, by view.
    pub subscribers_active: GaugeVec,
    /// Subscriptions accepted, by view.
    pub subscriptions_total: CounterVec,
    /// Outputs pushed to subscribers, by view.
    pub outputs_emitted: CounterVec,
    /// Pipelines terminated by an error, by error kind.
    pub pipeline_errors: CounterVec,
    /// Upstream connection attempts, by status.
    pub upstream_connects: CounterVec,
    /// Time to establish an upstream connection (5ms-10s buckets).
    pub upstream_connect_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let subscribers_active = GaugeVec::new(
            Opts::new(
                "subscribers_active",
                "Number of subscribers currently connected.",
            )
            .namespace("emoji_relay"),
            &["view"],
        )?;
        let subscriptions_total = CounterVec::new(
            Opts::new("subscriptions_total", "Total subscriptions accepted.")
                .namespace("emoji_relay"),
            &["view"],
        )?;
        let outputs_emitted = CounterVec::new(
            Opts::new(
                "outputs_emitted_total",
                "Total outputs pushed to subscribers.",
            )
            .namespace("emoji_relay"),
            &["view"],
        )?;
        let pipeline_errors = CounterVec::new(
            Opts::new(
                "pipeline_errors_total",
                "Total pipelines terminated by an error.",
            )
            .namespace("emoji_relay"),
            &["kind"],
        )?;
        let upstream_connects = CounterVec::new(
            Opts::new(
                "upstream_connects_total",
                "Total upstream connection attempts.",
            )
            .namespace("emoji_relay"),
            &["status"],
        )?;
        let upstream_connect_duration = Histogram::with_opts(
            HistogramOpts::new(
                "upstream_connect_duration_seconds",
                "Time to establish an upstream connection.",
            )
            .namespace("emoji_relay")
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;

        registry.register(Box::new(subscribers_active.clone()))?;
        registry.register(Box::new(subscriptions_total.clone()))?;
        registry.register(Box::new(outputs_emitted.clone()))?;
        registry.register(Box::new(pipeline_errors.clone()))?;
        registry.register(Box::new(upstream_connects.clone()))?;
        registry.register(Box::new(upstream_connect_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            subscribers_active,
            subscriptions_total,
            outputs_emitted,
            pipeline_errors,
            upstream_connects,
            upstream_connect_duration,
        })
    }

    /// Record one upstream connection attempt.
    pub fn record_upstream_connect(&self, status: &str, duration: Duration) {
        self.upstream_connects.with_label_values(&[status]).inc();
        self.upstream_connect_duration
            .observe(duration.as_secs_f64());
    }

    /// Render every registered metric in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr, ":9090");

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(Arc::clone(self));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        Ok(())
    }
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(metrics): State<Arc<HealthMetrics>>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_encode() {
        let metrics = HealthMetrics::new(":0").expect("metrics");
        metrics
            .subscribers_active
            .with_label_values(&["top"])
            .inc();
        metrics.pipeline_errors.with_label_values(&["decode"]).inc();
        metrics.record_upstream_connect("success", Duration::from_millis(20));

        let text = metrics.encode().expect("encodable");
        assert!(text.contains("emoji_relay_subscribers_active{view=\"top\"} 1"));
        assert!(text.contains("emoji_relay_pipeline_errors_total{kind=\"decode\"} 1"));
        assert!(text.contains("emoji_relay_upstream_connects_total{status=\"success\"} 1"));
        assert!(text.contains("emoji_relay_upstream_connect_duration_seconds_count 1"));
    }

    #[tokio::test]
    async fn test_health_server_serves_healthz() {
        let metrics = Arc::new(HealthMetrics::new("127.0.0.1:0").expect("metrics"));
        let addr = metrics.start().await.expect("server starts");

        let body = reqwest::get(format!("http://{addr}/healthz"))
            .await
            .expect("request")
            .text()
            .await
            .expect("body");
        assert_eq!(body, "ok");

        metrics.stop().await.expect("stop");
    }
}
