pub mod sse;

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use reqwest::header::ACCEPT;
use reqwest::Url;
use tracing::debug;

use crate::config::SourceConfig;
use crate::pipeline::PipelineError;

pub use self::sse::{Frame, SseDecoder};

/// Lazy, possibly erroring sequence of upstream frames in arrival order.
pub type FrameStream = BoxStream<'static, Result<Frame, PipelineError>>;

/// Callback type for recording upstream connection attempts.
/// Receives (status, duration).
pub type MetricsCallback = Arc<dyn Fn(&str, Duration) + Send + Sync>;

/// Supplier of upstream event streams.
pub trait EventSource: Send + Sync {
    /// Open a fresh subscription. Nothing is connected until the stream is
    /// first polled.
    fn frames(&self) -> FrameStream;
}

/// Event source reading a server-sent event stream over HTTP.
pub struct HttpEventSource {
    http: reqwest::Client,
    url: Url,
    connect_timeout: Duration,
    metrics: Option<MetricsCallback>,
}

impl HttpEventSource {
    /// Create a new source for the configured upstream URL.
    pub fn new(cfg: &SourceConfig) -> Result<Self> {
        let url = parse_source_url(&cfg.url)?;

        let connect_timeout = if cfg.connect_timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.connect_timeout
        };

        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            url,
            connect_timeout,
            metrics: None,
        })
    }

    /// Set a metrics callback for recording connection attempts.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

}

impl EventSource for HttpEventSource {
    fn frames(&self) -> FrameStream {
        let request = self
            .http
            .get(self.url.clone())
            .header(ACCEPT, "text/event-stream");
        let url = self.url.clone();
        let timeout = self.connect_timeout;
        let metrics = self.metrics.clone();

        let connect = async move {
            let start = Instant::now();

            let result = match tokio::time::timeout(timeout, request.send()).await {
                Ok(sent) => sent
                    .and_then(|response| response.error_for_status())
                    .map_err(|e| e.to_string()),
                Err(_) => Err(format!("no response within {timeout:?}")),
            };

            let status = if result.is_ok() { "success" } else { "error" };
            if let Some(cb) = &metrics {
                cb(status, start.elapsed());
            }

            let response = result.map_err(|reason| PipelineError::UpstreamConnection {
                reason: format!("connecting to {url}: {reason}"),
            })?;

            debug!(url = %url, status = %response.status(), "upstream connected");

            Ok::<_, PipelineError>(decode_body(response.bytes_stream()))
        };

        stream::once(connect).try_flatten().boxed()
    }
}

/// Validate an upstream URL: it must parse and use http or https.
pub fn parse_source_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("parsing source url {raw:?}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => bail!("unsupported source url scheme {scheme:?}"),
    }
}

struct BodyState<S> {
    body: Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<Frame>,
    done: bool,
}

/// Turn an event-stream body into frames.
///
/// A transport error ends the stream after one `UpstreamConnection` item.
pub fn decode_body<S, E>(body: S) -> impl Stream<Item = Result<Frame, PipelineError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display,
{
    let state = BodyState {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                return Some((Ok(frame), state));
            }
            if state.done {
                return None;
            }

            match state.body.next().await {
                Some(Ok(chunk)) => match state.decoder.feed(&chunk) {
                    Ok(frames) => state.pending.extend(frames),
                    Err(e) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                },
                Some(Err(e)) => {
                    state.done = true;
                    let err = PipelineError::UpstreamConnection {
                        reason: format!("reading event stream: {e}"),
                    };
                    return Some((Err(err), state));
                }
                None => return None,
            }
        }
    })
}
