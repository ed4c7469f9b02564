use std::{convert::Infallible, time::Duration};

use axum::{
    extract::State,
    response::{
        Sse,
        sse::{Event, KeepAlive},
    },
};
use serde_json::json;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

use timelapse_core::{
    EventKind, HubEvent, LogLine, ProcessSupervisor, RunStatus,
};

use crate::infra::app_state::AppState;

/// Live log lines as JSON payloads `{"log": "<timestamp> - <line>"}`.
///
/// The subscription is registered before the replay is read, so a line
/// produced in between is delivered (possibly twice) rather than lost.
pub fn build_log_stream(
    supervisor: &ProcessSupervisor,
    replay: usize,
) -> impl Stream<Item = String> + Send + 'static + use<> {
    let mut subscription = supervisor.subscribe(EventKind::Log);
    let history = supervisor.recent_logs(replay);

    async_stream::stream! {
        for line in history {
            yield log_payload(&line);
        }

        while let Some(event) = subscription.recv().await {
            if let HubEvent::Log(line) = event {
                yield log_payload(&line);
            }
        }
    }
}

/// Status snapshots as JSON payloads: the current status first, then every
/// change, and the current status again whenever `heartbeat` passes quietly.
pub fn build_status_stream(
    supervisor: ProcessSupervisor,
    heartbeat: Duration,
) -> impl Stream<Item = String> + Send + 'static {
    let mut subscription = supervisor.subscribe(EventKind::Status);

    async_stream::stream! {
        if let Some(payload) = status_payload(&supervisor.status()) {
            yield payload;
        }

        loop {
            let status = match tokio::time::timeout(heartbeat, subscription.recv()).await {
                Ok(Some(HubEvent::Status(status))) => status,
                Ok(Some(HubEvent::Log(_))) => continue,
                Ok(None) => break,
                Err(_) => supervisor.status(),
            };
            if let Some(payload) = status_payload(&status) {
                yield payload;
            }
        }
    }
}

/// `GET /stream/logs`
pub async fn log_stream_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = build_log_stream(&state.supervisor, state.config.logs.replay)
        .map(|data| Ok(Event::default().data(data)));

    Sse::new(stream).keep_alive(keep_alive(state.config.stream.keepalive))
}

/// `GET /stream/status`
pub async fn status_stream_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = build_status_stream(
        state.supervisor.clone(),
        state.config.stream.status_heartbeat,
    )
    .map(|data| Ok(Event::default().data(data)));

    Sse::new(stream).keep_alive(keep_alive(state.config.stream.keepalive))
}

fn keep_alive(interval: Duration) -> KeepAlive {
    KeepAlive::new().interval(interval).text("keep-alive")
}

fn log_payload(line: &LogLine) -> String {
    json!({ "log": line.to_string() }).to_string()
}

fn status_payload(status: &RunStatus) -> Option<String> {
    match serde_json::to_string(status) {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!(error = %err, "failed to encode status event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::pin;

    use tempfile::TempDir;
    use timelapse_core::{RunState, SupervisorConfig};

    fn supervisor(dir: &TempDir) -> ProcessSupervisor {
        ProcessSupervisor::new(SupervisorConfig {
            status_file: dir.path().join("status.json"),
            script_path: dir.path().join("missing.sh"),
            ..SupervisorConfig::default()
        })
    }

    async fn next<S: Stream<Item = String>>(
        stream: &mut std::pin::Pin<&mut S>,
    ) -> serde_json::Value {
        let payload = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("stream stalled")
            .expect("stream ended");
        serde_json::from_str(&payload).unwrap()
    }

    #[tokio::test]
    async fn log_stream_forwards_published_lines() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);
        let mut stream = pin!(build_log_stream(&supervisor, 50));

        supervisor.hub().publish_log(LogLine::new("frame 1 saved"));

        let payload = next(&mut stream).await;
        let line = payload["log"].as_str().unwrap();
        assert!(line.ends_with(" - frame 1 saved"), "got {line}");
    }

    #[tokio::test]
    async fn log_stream_deregisters_when_dropped() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);

        let stream = build_log_stream(&supervisor, 50);
        assert_eq!(supervisor.hub().subscriber_count(EventKind::Log), 1);

        drop(stream);
        assert_eq!(supervisor.hub().subscriber_count(EventKind::Log), 0);
    }

    #[tokio::test]
    async fn status_stream_starts_with_current_status() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);
        let mut stream = pin!(build_status_stream(
            supervisor.clone(),
            Duration::from_secs(30)
        ));

        let first = next(&mut stream).await;
        assert_eq!(first["status"], "idle");
        assert_eq!(first["captured"], 0);
        assert!(first["error"].is_null());
    }

    #[tokio::test]
    async fn status_stream_forwards_changes() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);
        let mut stream = pin!(build_status_stream(
            supervisor.clone(),
            Duration::from_secs(30)
        ));
        let _ = next(&mut stream).await;

        supervisor
            .store()
            .update(|status| {
                status.set_state(RunState::Done);
                status.captured = 4;
                status.total = 4;
            })
            .unwrap();

        let changed = next(&mut stream).await;
        assert_eq!(changed["status"], "done");
        assert_eq!(changed["captured"], 4);
    }

    #[tokio::test]
    async fn status_stream_heartbeats_when_quiet() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);
        let mut stream = pin!(build_status_stream(
            supervisor.clone(),
            Duration::from_millis(30)
        ));

        let first = next(&mut stream).await;
        let second = next(&mut stream).await;
        assert_eq!(first, second);
    }
}
