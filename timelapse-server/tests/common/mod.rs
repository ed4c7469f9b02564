#![allow(dead_code)]

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Duration,
};

use axum_test::TestServer;
use tempfile::TempDir;
use timelapse_server::{
    AppState,
    infra::{config::Config, startup::bootstrap},
    routes::create_router,
};

pub const WAIT: Duration = Duration::from_secs(10);

pub const THREE_FRAMES: &str = r#"#!/bin/sh
echo "captured: 1"
echo "captured: 2"
echo "captured: 3"
exit 0
"#;

pub const LOOP_UNTIL_INTERRUPTED: &str = r#"#!/bin/sh
trap 'echo "interrupted"; exit 130' INT
echo "interval=$1 frames=$2"
while true; do
  sleep 0.1
done
"#;

/// A server wired to a throwaway directory holding the status file, the
/// capture script and the run folders.
pub struct TestApp {
    pub dir: TempDir,
    pub state: AppState,
    pub server: TestServer,
}

impl TestApp {
    pub fn with_script(body: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(dir.path(), "timelapse.sh", body);
        Self::build(dir, script)
    }

    pub fn without_script() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("missing.sh");
        Self::build(dir, script)
    }

    fn build(dir: TempDir, script: PathBuf) -> Self {
        let mut config = Config::default();
        config.capture.script_path = script;
        config.capture.status_file = dir.path().join("status.json");
        config.capture.output_root = dir.path().to_path_buf();
        config.stream.status_heartbeat = Duration::from_millis(50);

        let state = bootstrap(config);
        let server = TestServer::new(create_router(state.clone()))
            .expect("test server");
        Self { dir, state, server }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub async fn wait_idle(&self) {
        tokio::time::timeout(WAIT, self.state.supervisor.wait_until_idle())
            .await
            .expect("run did not finish in time");
    }
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod script");
    path
}
