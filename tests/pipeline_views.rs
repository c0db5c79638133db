use std::num::NonZeroUsize;
use std::time::Duration;

use emoji_relay::pipeline::top::TopView;
use emoji_relay::pipeline::{spawn, Output, PipelineError, PipelineSettings, View};
use emoji_relay::source::{Frame, FrameStream};
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The three events of the reference scenario, all inside the first window.
const SCENARIO: [&str; 3] = [r#"{"1F600":3}"#, r#"{"1F601":1}"#, r#"{"1F600":2}"#];

fn frames(payloads: &[&str]) -> Vec<Result<Frame, PipelineError>> {
    payloads.iter().map(|p| Ok(Frame::new(*p))).collect()
}

/// Upstream that delivers `payloads` and then stays connected.
fn live(payloads: &[&str]) -> FrameStream {
    stream::iter(frames(payloads))
        .chain(stream::pending())
        .boxed()
}

/// Upstream that delivers `payloads` at `gap` intervals and stays connected.
fn paced(payloads: &[&str], gap: Duration) -> FrameStream {
    let items = frames(payloads);
    stream::iter(items)
        .then(move |item| async move {
            tokio::time::sleep(gap).await;
            item
        })
        .chain(stream::pending())
        .boxed()
}

fn open(frames: FrameStream, view: View) -> mpsc::Receiver<Result<Output, PipelineError>> {
    spawn(
        frames,
        view,
        PipelineSettings::default(),
        CancellationToken::new(),
    )
}

async fn next(rx: &mut mpsc::Receiver<Result<Output, PipelineError>>) -> Output {
    rx.recv()
        .await
        .expect("pipeline still open")
        .expect("pipeline healthy")
}

fn view(entries: &[(&str, i64)]) -> TopView {
    entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

#[tokio::test(start_paused = true)]
async fn scenario_events_per_second() {
    let mut rx = open(live(&SCENARIO), View::EventsPerSecond);
    assert_eq!(next(&mut rx).await, Output::Count(3));
}

#[tokio::test(start_paused = true)]
async fn scenario_rate_per_second() {
    let mut rx = open(live(&SCENARIO), View::RatePerSecond);
    assert_eq!(next(&mut rx).await, Output::Count(6));
}

#[tokio::test]
async fn scenario_aggregated() {
    let mut rx = open(live(&SCENARIO), View::Aggregated);

    let mut maps = Vec::new();
    for _ in 0..3 {
        match next(&mut rx).await {
            Output::Snapshot(s) => maps.push(s.as_map().clone()),
            other => panic!("unexpected output {other:?}"),
        }
    }

    assert_eq!(maps[0], view(&[("1F600", 3)]));
    assert_eq!(maps[1], view(&[("1F600", 3), ("1F601", 1)]));
    assert_eq!(maps[2], view(&[("1F600", 5), ("1F601", 1)]));
}

#[tokio::test(start_paused = true)]
async fn scenario_top_one_suppresses_unchanged() {
    let limit = NonZeroUsize::new(1).expect("non-zero");
    let mut rx = open(live(&SCENARIO), View::Top(limit));

    assert_eq!(next(&mut rx).await, Output::Top(view(&[("1F600", 3)])));
    assert_eq!(next(&mut rx).await, Output::Top(view(&[("1F600", 5)])));

    // Nothing else is pending even after a long quiet period.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn windows_partition_time_from_subscription() {
    // Frames land at 0.4s, 0.8s, 1.2s, 1.6s and 2.0s after subscribing.
    let payloads = [r#"{"a":1}"#; 5];
    let mut rx = spawn(
        paced(&payloads, Duration::from_millis(400)),
        View::EventsPerSecond,
        PipelineSettings::default(),
        CancellationToken::new(),
    );

    let mut counts = Vec::new();
    for _ in 0..4 {
        match next(&mut rx).await {
            Output::Count(n) => counts.push(n),
            other => panic!("unexpected output {other:?}"),
        }
    }

    // Every window reports once; the total across windows is every frame.
    assert_eq!(counts.len(), 4);
    assert_eq!(counts.iter().sum::<i64>(), 5);
    assert_eq!(counts[0], 2);
    assert_eq!(counts[3], 0);
}

#[tokio::test(start_paused = true)]
async fn idle_upstream_still_reports_every_window() {
    let mut rx = open(live(&[]), View::RatePerSecond);
    for _ in 0..5 {
        assert_eq!(next(&mut rx).await, Output::Count(0));
    }
}

#[tokio::test]
async fn top_text_scenario() {
    let limit = NonZeroUsize::new(2).expect("non-zero");
    let mut rx = open(live(&SCENARIO), View::TopText(limit));

    assert_eq!(next(&mut rx).await, Output::Text("\u{1F600}".to_string()));
    assert_eq!(
        next(&mut rx).await,
        Output::Text("\u{1F600}\u{1F601}".to_string())
    );
}

#[tokio::test]
async fn dropping_receiver_releases_upstream() {
    let (tx, rx_frames) = mpsc::channel::<Result<Frame, PipelineError>>(4);
    let upstream = stream::unfold(rx_frames, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed();

    let rx = open(upstream, View::Aggregated);
    drop(rx);

    // The pipeline drops its upstream once it notices the subscriber left.
    tokio::time::timeout(Duration::from_secs(5), tx.closed())
        .await
        .expect("upstream released");
}
