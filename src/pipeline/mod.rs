//! Per-subscriber stream transformation.
//!
//! A pipeline turns one upstream [`FrameStream`] into the output sequence of
//! a single [`View`]. Every stage is a plain synchronous transform owned by
//! one task, so a subscriber's outputs keep the order of the frames that
//! caused them and no state is shared between subscribers.

pub mod aggregate;
pub mod dedup;
pub mod event;
pub mod render;
pub mod top;
pub mod window;

use std::num::NonZeroUsize;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::source::{Frame, FrameStream};

use self::aggregate::{Aggregator, Snapshot};
use self::dedup::Dedup;
use self::event::Event;
use self::render::DecodeError;
use self::top::{select_top, TopView};
use self::window::{WindowCounter, WindowMode};

/// Errors that terminate a pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("upstream connection failed: {reason}")]
    UpstreamConnection { reason: String },

    #[error("malformed payload: {reason}")]
    MalformedPayload { reason: String },

    #[error("rendering top view: {0}")]
    Decode(#[from] DecodeError),
}

impl PipelineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::UpstreamConnection { .. } => "upstream_connection",
            PipelineError::MalformedPayload { .. } => "malformed_payload",
            PipelineError::Decode(_) => "decode",
        }
    }
}

/// The derived sequence a subscriber asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    /// Upstream frames, unchanged.
    Raw,
    /// Frames per window.
    EventsPerSecond,
    /// Sum of counts per window.
    RatePerSecond,
    /// Running totals, one snapshot per `(code, delta)` pair.
    Aggregated,
    /// Top-N totals, emitted when they change.
    Top(NonZeroUsize),
    /// Top-N codes rendered as glyphs, emitted when the text changes.
    TopText(NonZeroUsize),
}

impl View {
    pub fn as_str(&self) -> &'static str {
        match self {
            View::Raw => "raw",
            View::EventsPerSecond => "eps",
            View::RatePerSecond => "rps",
            View::Aggregated => "aggregated",
            View::Top(_) => "top",
            View::TopText(_) => "top_str",
        }
    }

    fn window_mode(&self) -> Option<WindowMode> {
        match self {
            View::EventsPerSecond => Some(WindowMode::Events),
            View::RatePerSecond => Some(WindowMode::Rate),
            _ => None,
        }
    }
}

/// One element of a view's output sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Frame(Frame),
    Count(i64),
    Snapshot(Snapshot),
    Top(TopView),
    Text(String),
}

/// Tunables shared by every pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// Window length for the per-second views.
    pub window: Duration,
    /// Capacity of the output channel. A full channel stalls the pipeline,
    /// which stops reading upstream.
    pub buffer: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(1),
            buffer: 64,
        }
    }
}

/// Stage state for one view.
enum Transform {
    Raw,
    Window(WindowCounter),
    Aggregate(Aggregator),
    Top {
        aggregator: Aggregator,
        limit: NonZeroUsize,
        changes: Dedup<TopView>,
    },
    TopText {
        aggregator: Aggregator,
        limit: NonZeroUsize,
        changes: Dedup<TopView>,
        text_changes: Dedup<String>,
    },
}

impl Transform {
    fn new(view: View) -> Self {
        match view {
            View::Raw => Transform::Raw,
            View::EventsPerSecond => Transform::Window(WindowCounter::new(WindowMode::Events)),
            View::RatePerSecond => Transform::Window(WindowCounter::new(WindowMode::Rate)),
            View::Aggregated => Transform::Aggregate(Aggregator::new()),
            View::Top(limit) => Transform::Top {
                aggregator: Aggregator::new(),
                limit,
                changes: Dedup::new(),
            },
            View::TopText(limit) => Transform::TopText {
                aggregator: Aggregator::new(),
                limit,
                changes: Dedup::new(),
                text_changes: Dedup::new(),
            },
        }
    }

    /// Push one frame through the stages, collecting outputs into `out`.
    fn on_frame(&mut self, frame: Frame, out: &mut Vec<Output>) -> Result<(), PipelineError> {
        match self {
            Transform::Raw => out.push(Output::Frame(frame)),
            Transform::Window(counter) => counter.record(&frame)?,
            Transform::Aggregate(aggregator) => {
                let event = Event::from_frame(&frame)?;
                out.extend(
                    aggregator
                        .apply_event(&event)
                        .into_iter()
                        .map(Output::Snapshot),
                );
            }
            Transform::Top {
                aggregator,
                limit,
                changes,
            } => {
                let event = Event::from_frame(&frame)?;
                for snapshot in aggregator.apply_event(&event) {
                    if let Some(top) = changes.admit(select_top(snapshot.iter(), *limit)) {
                        out.push(Output::Top(top));
                    }
                }
            }
            Transform::TopText {
                aggregator,
                limit,
                changes,
                text_changes,
            } => {
                let event = Event::from_frame(&frame)?;
                for snapshot in aggregator.apply_event(&event) {
                    let Some(top) = changes.admit(select_top(snapshot.iter(), *limit)) else {
                        continue;
                    };
                    if let Some(text) = text_changes.admit(render::render(&top)?) {
                        out.push(Output::Text(text));
                    }
                }
            }
        }
        Ok(())
    }

    /// Close the current window, if this view is windowed.
    fn on_window_closed(&mut self) -> Option<Output> {
        match self {
            Transform::Window(counter) => Some(Output::Count(counter.close())),
            _ => None,
        }
    }
}

/// Start a pipeline for `view` over `frames`.
///
/// Windows are measured from this call. The returned channel yields outputs
/// in order, at most one error, and then closes. Cancelling `cancel` or
/// dropping the receiver stops the pipeline and releases the upstream.
pub fn spawn(
    frames: FrameStream,
    view: View,
    settings: PipelineSettings,
    cancel: CancellationToken,
) -> mpsc::Receiver<Result<Output, PipelineError>> {
    let (tx, rx) = mpsc::channel(settings.buffer.max(1));

    let ticker = view.window_mode().map(|_| {
        let period = settings.window.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        // Every elapsed window must report, even after a stall.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        ticker
    });

    tokio::spawn(run(frames, view, ticker, tx, cancel));

    rx
}

async fn run(
    mut frames: FrameStream,
    view: View,
    mut ticker: Option<Interval>,
    tx: mpsc::Sender<Result<Output, PipelineError>>,
    cancel: CancellationToken,
) {
    let mut transform = Transform::new(view);
    let mut outputs = Vec::new();

    debug!(view = view.as_str(), "pipeline started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(view = view.as_str(), "pipeline cancelled");
                break;
            }
            _ = tx.closed() => {
                debug!(view = view.as_str(), "subscriber gone");
                break;
            }
            _ = next_tick(&mut ticker) => {
                if let Some(output) = transform.on_window_closed() {
                    if !deliver(&tx, &cancel, Ok(output)).await {
                        break;
                    }
                }
            }
            next = frames.next() => {
                let frame = match next {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        deliver(&tx, &cancel, Err(e)).await;
                        break;
                    }
                    None => {
                        debug!(view = view.as_str(), "upstream ended");
                        break;
                    }
                };

                let result = transform.on_frame(frame, &mut outputs);

                // Outputs produced before a failure still go out first.
                let mut open = true;
                for output in outputs.drain(..) {
                    if open {
                        open = deliver(&tx, &cancel, Ok(output)).await;
                    }
                }
                if let Err(e) = result {
                    if open {
                        deliver(&tx, &cancel, Err(e)).await;
                    }
                    break;
                }
                if !open {
                    break;
                }
            }
        }
    }
}

/// Waits for the next window boundary; never resolves for unwindowed views.
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Sends one item, waiting for room. Returns false once the pipeline
/// should stop.
async fn deliver(
    tx: &mpsc::Sender<Result<Output, PipelineError>>,
    cancel: &CancellationToken,
    item: Result<Output, PipelineError>,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}
