//! Server-sent event delivery of the derived views.
//!
//! Every request gets its own pipeline and its own upstream connection.
//! The pipeline lives exactly as long as the response stream: dropping the
//! stream (client gone) or stopping the server cancels it.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info, warn};

use crate::export::health::HealthMetrics;
use crate::pipeline::top::resolve_limit;
use crate::pipeline::{self, Output, PipelineError, PipelineSettings, View};
use crate::source::EventSource;

type SseStream = BoxStream<'static, Result<Event, Infallible>>;

/// Resolve a listen address, expanding the ":port" shorthand.
pub fn bind_address(addr: &str, default: &str) -> String {
    let addr = if addr.is_empty() { default } else { addr };
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Shared state for axum handlers.
struct AppState {
    source: Arc<dyn EventSource>,
    settings: PipelineSettings,
    default_limit: NonZeroUsize,
    metrics: Option<Arc<HealthMetrics>>,
    /// Parent of every subscriber's cancellation token.
    shutdown: CancellationToken,
}

/// HTTP server exposing one SSE endpoint per view.
pub struct RelayServer {
    addr: String,
    source: Arc<dyn EventSource>,
    settings: PipelineSettings,
    default_limit: NonZeroUsize,
    metrics: Option<Arc<HealthMetrics>>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl RelayServer {
    pub fn new(
        addr: &str,
        source: Arc<dyn EventSource>,
        settings: PipelineSettings,
        default_limit: NonZeroUsize,
    ) -> Self {
        Self {
            addr: addr.to_string(),
            source,
            settings,
            default_limit,
            metrics: None,
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Record subscriber and pipeline metrics.
    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Binds the listener and starts serving. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr, ":8080");

        let cancel = CancellationToken::new();
        let state = Arc::new(AppState {
            source: Arc::clone(&self.source),
            settings: self.settings,
            default_limit: self.default_limit,
            metrics: self.metrics.clone(),
            shutdown: cancel.clone(),
        });

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        *self.shutdown.lock() = Some(cancel.clone());

        let app = router(state);
        tokio::spawn(async move {
            info!(addr = %local_addr, "relay server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "relay server error");
            }
        });

        Ok(local_addr)
    }

    /// Stops accepting connections and ends every open subscription.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        Ok(())
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/emojis/raw", get(raw_handler))
        .route("/emojis/eps", get(eps_handler))
        .route("/emojis/rps", get(rps_handler))
        .route("/emojis/aggregated", get(aggregated_handler))
        .route("/emojis/top", get(top_handler))
        .route("/emojis/topStr", get(top_str_handler))
        .with_state(state)
}

/// Query parameters for the top-N endpoints. Kept as text so that an
/// unusable value falls back to the default instead of rejecting.
#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<String>,
}

/// GET /emojis/raw - upstream frames as received.
async fn raw_handler(State(state): State<Arc<AppState>>) -> Sse<SseStream> {
    subscribe(&state, View::Raw)
}

/// GET /emojis/eps - frames per window.
async fn eps_handler(State(state): State<Arc<AppState>>) -> Sse<SseStream> {
    subscribe(&state, View::EventsPerSecond)
}

/// GET /emojis/rps - summed counts per window.
async fn rps_handler(State(state): State<Arc<AppState>>) -> Sse<SseStream> {
    subscribe(&state, View::RatePerSecond)
}

/// GET /emojis/aggregated - running totals.
async fn aggregated_handler(State(state): State<Arc<AppState>>) -> Sse<SseStream> {
    subscribe(&state, View::Aggregated)
}

/// GET /emojis/top?limit=N - top-N totals on change.
async fn top_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Sse<SseStream> {
    let limit = resolve_limit(query.limit.as_deref(), state.default_limit);
    subscribe(&state, View::Top(limit))
}

/// GET /emojis/topStr?limit=N - top-N glyphs on change.
async fn top_str_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Sse<SseStream> {
    let limit = resolve_limit(query.limit.as_deref(), state.default_limit);
    subscribe(&state, View::TopText(limit))
}

/// Lifetime of one subscriber's response stream.
struct Subscription {
    view: View,
    metrics: Option<Arc<HealthMetrics>>,
    rx: mpsc::Receiver<Result<Output, PipelineError>>,
    _cancel: DropGuard,
}

impl Subscription {
    fn record_output(&self) {
        if let Some(metrics) = &self.metrics {
            metrics
                .outputs_emitted
                .with_label_values(&[self.view.as_str()])
                .inc();
        }
    }

    fn record_error(&self, err: &PipelineError) {
        warn!(view = self.view.as_str(), error = %err, "pipeline terminated");
        if let Some(metrics) = &self.metrics {
            metrics
                .pipeline_errors
                .with_label_values(&[err.kind()])
                .inc();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        info!(view = self.view.as_str(), "subscriber disconnected");
        if let Some(metrics) = &self.metrics {
            metrics
                .subscribers_active
                .with_label_values(&[self.view.as_str()])
                .dec();
        }
    }
}

fn subscribe(state: &AppState, view: View) -> Sse<SseStream> {
    let cancel = state.shutdown.child_token();
    let rx = pipeline::spawn(state.source.frames(), view, state.settings, cancel.clone());

    match view {
        View::Top(limit) | View::TopText(limit) => {
            info!(view = view.as_str(), limit = limit.get(), "subscriber connected");
        }
        _ => info!(view = view.as_str(), "subscriber connected"),
    }
    if let Some(metrics) = &state.metrics {
        metrics
            .subscriptions_total
            .with_label_values(&[view.as_str()])
            .inc();
        metrics
            .subscribers_active
            .with_label_values(&[view.as_str()])
            .inc();
    }

    let subscription = Subscription {
        view,
        metrics: state.metrics.clone(),
        rx,
        _cancel: cancel.drop_guard(),
    };

    let events = stream::unfold(Some(subscription), |subscription| async move {
        let mut subscription = subscription?;
        match subscription.rx.recv().await {
            Some(Ok(output)) => match to_sse_event(&output) {
                Ok(event) => {
                    subscription.record_output();
                    Some((Ok(event), Some(subscription)))
                }
                Err(e) => {
                    warn!(view = subscription.view.as_str(), error = %e, "encoding output");
                    Some((Ok(error_event(&e.to_string())), None))
                }
            },
            Some(Err(e)) => {
                subscription.record_error(&e);
                Some((Ok(error_event(&e.to_string())), None))
            }
            None => None,
        }
    });

    Sse::new(events.boxed()).keep_alive(KeepAlive::default())
}

/// Encode one pipeline output as an SSE event.
///
/// Field values that cannot be framed (CR anywhere, LF or NUL in
/// `event`/`id`) are reported as errors instead of reaching the encoder.
fn to_sse_event(output: &Output) -> Result<Event, axum::Error> {
    match output {
        Output::Frame(frame) => {
            let mut event = Event::default().data(data_field(&frame.data)?);
            if let Some(name) = &frame.event {
                event = event.event(line_field("event", name)?);
            }
            if let Some(id) = &frame.id {
                event = event.id(line_field("id", id)?);
            }
            Ok(event)
        }
        Output::Count(n) => Ok(Event::default().data(n.to_string())),
        Output::Snapshot(snapshot) => Event::default().json_data(snapshot),
        Output::Top(top) => Event::default().json_data(top),
        Output::Text(text) => Ok(Event::default().data(data_field(text)?)),
    }
}

fn data_field(value: &str) -> Result<&str, axum::Error> {
    if value.contains('\r') {
        return Err(axum::Error::new("data contains a carriage return"));
    }
    Ok(value)
}

fn line_field<'a>(name: &str, value: &'a str) -> Result<&'a str, axum::Error> {
    if value.contains(['\r', '\n', '\0']) {
        return Err(axum::Error::new(format!(
            "{name} contains a line break or NUL"
        )));
    }
    Ok(value)
}

fn error_event(message: &str) -> Event {
    Event::default()
        .event("error")
        .data(message.replace('\r', " "))
}
