use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};

use timelapse_core::ProcessSupervisor;

use crate::infra::{
    app_state::AppState,
    config::{Config, ServerConfig},
};

/// How long a capture gets to exit after SIGINT before the server stops
/// waiting for it.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Builds the application state and makes sure the status file exists, so
/// external readers always find a record.
pub fn bootstrap(config: Config) -> AppState {
    let state = AppState::new(config);

    match state.supervisor.store().ensure_persisted() {
        Ok(true) => info!(
            path = %state.supervisor.store().path().display(),
            "created status file"
        ),
        Ok(false) => {}
        Err(err) => warn!(
            path = %state.supervisor.store().path().display(),
            error = %err,
            "could not create status file; continuing with in-memory status"
        ),
    }

    state
}

/// Binds the configured host, which may be an IP literal or a name such as
/// `localhost`.
pub async fn bind_listener(server: &ServerConfig) -> anyhow::Result<TcpListener> {
    TcpListener::bind((server.host.as_str(), server.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", server.host, server.port))
}

/// Resolves on Ctrl-C (or SIGTERM on unix), after interrupting any active
/// capture so the script is not orphaned.
pub async fn shutdown_signal(supervisor: ProcessSupervisor) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown requested");
    if tokio::time::timeout(SHUTDOWN_GRACE, supervisor.shutdown())
        .await
        .is_err()
    {
        warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "capture did not exit in time; closing streams anyway"
        );
        supervisor.hub().close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn bootstrap_creates_missing_status_file() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.capture.status_file = dir.path().join("status.json");

        let _state = bootstrap(config);

        let raw = std::fs::read_to_string(dir.path().join("status.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["status"], "idle");
    }

    #[tokio::test]
    async fn bind_listener_resolves_host_names() {
        let server = ServerConfig {
            host: "localhost".into(),
            port: 0,
        };

        let listener = bind_listener(&server).await.unwrap();

        assert!(listener.local_addr().unwrap().ip().is_loopback());
    }

    #[tokio::test]
    async fn bind_listener_accepts_ip_literals() {
        let server = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        };

        let listener = bind_listener(&server).await.unwrap();

        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
