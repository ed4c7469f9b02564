#![cfg(unix)]

mod common;

use std::{pin::pin, time::Duration};

use serde_json::Value;
use timelapse_core::EventKind;
use timelapse_server::handlers::stream::{build_log_stream, build_status_stream};
use tokio::time::timeout;
use tokio_stream::{Stream, StreamExt};

use common::{THREE_FRAMES, TestApp, WAIT};

async fn next_json<S>(stream: &mut std::pin::Pin<&mut S>) -> Value
where
    S: Stream<Item = String>,
{
    let payload = timeout(WAIT, stream.next())
        .await
        .expect("stream stalled")
        .expect("stream ended");
    serde_json::from_str(&payload).expect("payload is json")
}

fn log_text(payload: &Value) -> String {
    let line = payload["log"].as_str().expect("log field");
    let (_, text) = line.split_once(" - ").expect("timestamped line");
    text.to_string()
}

#[tokio::test]
async fn live_log_stream_follows_a_run_in_order() {
    let app = TestApp::with_script(THREE_FRAMES);
    let mut stream = pin!(build_log_stream(&app.state.supervisor, 50));

    app.state.supervisor.start(1, 3).await.unwrap();

    let mut lines = Vec::new();
    for _ in 0..3 {
        lines.push(log_text(&next_json(&mut stream).await));
    }
    assert_eq!(lines, ["captured: 1", "captured: 2", "captured: 3"]);

    app.wait_idle().await;
}

#[tokio::test]
async fn late_log_viewer_gets_the_replay() {
    let app = TestApp::with_script(THREE_FRAMES);
    app.state.supervisor.start(1, 3).await.unwrap();
    app.wait_idle().await;

    let mut stream = pin!(build_log_stream(&app.state.supervisor, 2));
    let first = log_text(&next_json(&mut stream).await);
    let second = log_text(&next_json(&mut stream).await);
    assert_eq!([first, second], ["captured: 2", "captured: 3"]);

    // Nothing else is buffered, so the stream now waits for new lines.
    let idle = timeout(Duration::from_millis(100), stream.next()).await;
    assert!(idle.is_err());
}

#[tokio::test]
async fn status_stream_reports_progress_through_done() {
    let app = TestApp::with_script(THREE_FRAMES);
    let mut stream = pin!(build_status_stream(
        app.state.supervisor.clone(),
        Duration::from_secs(30),
    ));

    let initial = next_json(&mut stream).await;
    assert_eq!(initial["status"], "idle");

    app.state.supervisor.start(1, 3).await.unwrap();

    let mut last = initial;
    while last["status"] != "done" {
        last = next_json(&mut stream).await;
        assert_ne!(last["status"], "error", "run failed: {last}");
    }
    assert_eq!(last["captured"], 3);
    assert_eq!(last["total"], 3);
}

#[tokio::test]
async fn shutdown_ends_open_streams() {
    let app = TestApp::with_script(THREE_FRAMES);
    let mut logs = pin!(build_log_stream(&app.state.supervisor, 50));
    let mut statuses = pin!(build_status_stream(
        app.state.supervisor.clone(),
        Duration::from_secs(30),
    ));
    let _ = next_json(&mut statuses).await;

    app.state.supervisor.shutdown().await;

    assert!(timeout(WAIT, logs.next()).await.unwrap().is_none());
    assert!(timeout(WAIT, statuses.next()).await.unwrap().is_none());
    assert_eq!(app.state.supervisor.hub().subscriber_count(EventKind::Log), 0);
}
