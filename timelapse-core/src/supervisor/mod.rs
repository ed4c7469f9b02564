//! Lifecycle of the external capture script.
//!
//! ```text
//!   start() ──► Starting ──► Running ──stop()──► Stopping
//!      ▲                        │                    │
//!      └──────── Idle ◄─────────┴── process exits ◄──┘
//! ```
//!
//! All transitions happen under the run-lock. The reader task owns the child
//! process; `stop()` only asks it to deliver the interrupt, so the child is
//! never signalled after it has been reaped.

mod process;
mod progress;

pub use progress::parse_progress;

use std::{
    any::Any,
    fmt,
    io,
    panic::AssertUnwindSafe,
    path::PathBuf,
    process::ExitStatus,
    sync::Arc,
};

use chrono::{NaiveDateTime, TimeZone, Utc};
use futures::FutureExt;
use tokio::sync::{Mutex, mpsc, mpsc::error::TrySendError, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    broadcast::{BroadcastHub, EventKind, HubConfig, Subscription},
    error::{Result, SupervisorError},
    logs::{DEFAULT_LOG_CAPACITY, LogLine, LogRingBuffer},
    status::{RunState, RunStatus, StatusStore},
};

use process::{OutputLines, SupervisedProcess, is_executable, send_interrupt};

pub const DEFAULT_SCRIPT_PATH: &str = "/usr/local/bin/timelapse.sh";
pub const DEFAULT_STATUS_FILE: &str = "timelapse_status.json";

const RESTART_INTERRUPTED_MESSAGE: &str =
    "server restarted while a capture was running";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub script_path: PathBuf,
    pub status_file: PathBuf,
    pub log_capacity: usize,
    pub hub: HubConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            script_path: PathBuf::from(DEFAULT_SCRIPT_PATH),
            status_file: PathBuf::from(DEFAULT_STATUS_FILE),
            log_capacity: DEFAULT_LOG_CAPACITY,
            hub: HubConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    Idle,
    Starting,
    Running,
    Stopping,
}

struct ActiveRun {
    pid: Option<u32>,
    stop_tx: mpsc::Sender<()>,
}

struct RunSlot {
    phase: SupervisorPhase,
    active: Option<ActiveRun>,
}

struct SupervisorInner {
    config: SupervisorConfig,
    hub: BroadcastHub,
    store: StatusStore,
    logs: LogRingBuffer,
    slot: Mutex<RunSlot>,
    phase_tx: watch::Sender<SupervisorPhase>,
}

/// Owns the single capture process and everything derived from its output.
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("script", &self.inner.config.script_path)
            .field("phase", &*self.inner.phase_tx.borrow())
            .field("hub", &self.inner.hub)
            .finish()
    }
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let hub = BroadcastHub::new(config.hub);
        let store = StatusStore::open(&config.status_file, hub.clone());
        let logs = LogRingBuffer::new(config.log_capacity);
        for raw in store.recent_logs() {
            logs.append(restore_log_line(&raw));
        }

        if store.read().state == RunState::Running {
            warn!("previous run did not finish; marking it failed");
            if let Err(err) = store.update(|status| {
                status.fail(RESTART_INTERRUPTED_MESSAGE);
            }) {
                warn!(error = %err, "failed to persist recovered status");
            }
        }

        let (phase_tx, _) = watch::channel(SupervisorPhase::Idle);
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                hub,
                store,
                logs,
                slot: Mutex::new(RunSlot {
                    phase: SupervisorPhase::Idle,
                    active: None,
                }),
                phase_tx,
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.inner.hub
    }

    pub fn store(&self) -> &StatusStore {
        &self.inner.store
    }

    pub fn status(&self) -> RunStatus {
        self.inner.store.read()
    }

    pub fn recent_logs(&self, n: usize) -> Vec<LogLine> {
        self.inner.logs.recent(n)
    }

    pub fn subscribe(&self, kind: EventKind) -> Subscription {
        self.inner.hub.subscribe(kind)
    }

    pub fn phase(&self) -> SupervisorPhase {
        *self.inner.phase_tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.phase(), SupervisorPhase::Idle)
    }

    /// Resolves once no run is active.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.inner.phase_tx.subscribe();
        let _ = rx.wait_for(|phase| *phase == SupervisorPhase::Idle).await;
    }

    /// Launches the capture script and returns without waiting for it.
    #[instrument(skip(self))]
    pub async fn start(&self, interval: u32, frames: u32) -> Result<()> {
        if interval < 1 || frames < 1 {
            return Err(SupervisorError::InvalidArgument(
                "Interval and frames must be >= 1".to_string(),
            ));
        }

        let mut slot = self.inner.slot.lock().await;
        if slot.active.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }

        let script = self.inner.config.script_path.clone();
        if !is_executable(&script) {
            return Err(SupervisorError::ScriptUnavailable(script));
        }

        self.inner.set_phase(&mut slot, SupervisorPhase::Starting);
        self.inner.logs.clear();
        self.inner.sync_log_tail();
        self.inner
            .persist(|status| *status = RunStatus::running(frames, Utc::now()));

        let (process, output) =
            match SupervisedProcess::spawn(&script, interval, frames) {
                Ok(spawned) => spawned,
                Err(err) => {
                    error!(error = %err, "failed to spawn capture script");
                    self.inner.persist(|status| {
                        status.fail(format!("failed to start: {err}"))
                    });
                    self.inner.set_phase(&mut slot, SupervisorPhase::Idle);
                    return Err(SupervisorError::Spawn(err));
                }
            };

        let pid = process.id();
        let (stop_tx, stop_rx) = mpsc::channel(1);
        slot.active = Some(ActiveRun { pid, stop_tx });
        self.inner.set_phase(&mut slot, SupervisorPhase::Running);
        info!(?pid, interval, frames, "timelapse started");

        tokio::spawn(supervise_run(
            Arc::clone(&self.inner),
            process,
            output,
            stop_rx,
            frames,
        ));

        Ok(())
    }

    /// Asks the running script to stop. A running status is set back to idle
    /// right away; the reader task records the real outcome once the process
    /// exits. An outcome it has already recorded is left alone.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.inner.slot.lock().await;
        let Some(active) = slot.active.as_ref() else {
            return Err(SupervisorError::NotRunning);
        };

        match active.stop_tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Closed(())) => {
                return Err(SupervisorError::NotRunning);
            }
        }
        info!(pid = ?active.pid, "stop requested");

        self.inner.set_phase(&mut slot, SupervisorPhase::Stopping);
        self.inner.persist(|status| {
            if status.is_running() {
                status.set_state(RunState::Idle);
            }
        });
        Ok(())
    }

    /// Interrupts an active run, waits for it to wind down, then ends every
    /// live subscription.
    pub async fn shutdown(&self) {
        match self.stop().await {
            Ok(()) => self.wait_until_idle().await,
            Err(SupervisorError::NotRunning) => {}
            Err(err) => warn!(error = %err, "failed to stop capture on shutdown"),
        }
        self.inner.hub.close_all();
    }
}

impl SupervisorInner {
    fn set_phase(&self, slot: &mut RunSlot, phase: SupervisorPhase) {
        slot.phase = phase;
        self.phase_tx.send_replace(phase);
        debug!(?phase, "supervisor phase changed");
    }

    fn persist<F>(&self, mutate: F)
    where
        F: FnOnce(&mut RunStatus),
    {
        if let Err(err) = self.store.update(mutate) {
            warn!(
                path = %self.store.path().display(),
                error = %err,
                "failed to persist status; keeping in-memory copy"
            );
        }
    }

    fn sync_log_tail(&self) {
        let tail = self
            .logs
            .recent(self.logs.capacity())
            .iter()
            .map(ToString::to_string)
            .collect();
        if let Err(err) = self.store.record_logs(tail) {
            debug!(error = %err, "failed to persist log tail");
        }
    }

    fn record_line(&self, text: String) -> LogLine {
        let line = LogLine::new(text);
        self.logs.append(line.clone());
        self.hub.publish_log(line.clone());
        self.sync_log_tail();
        line
    }

    fn handle_output(&self, text: String, total: u32) {
        let line = self.record_line(text);
        if let Some(captured) = parse_progress(&line.text) {
            debug!(captured, total, "progress marker");
            self.persist(|status| {
                status.total = total;
                status.record_progress(captured);
            });
        }
    }

    fn finish(&self, exit: ExitStatus, total: u32) {
        let failure = exit_failure(exit);
        match &failure {
            None => info!("timelapse finished"),
            Some(message) => warn!(%message, "timelapse failed"),
        }
        self.persist(|status| {
            status.total = total;
            match failure {
                None => status.set_state(RunState::Done),
                Some(message) => status.fail(message),
            }
        });
    }

    fn fail_run(&self, message: String) {
        error!(%message, "timelapse reader failed");
        self.persist(|status| status.fail(message.clone()));
        self.record_line(format!("ERROR: {message}"));
    }

    fn interrupt(&self, pid: Option<u32>) {
        match send_interrupt(pid) {
            Ok(()) => debug!(?pid, "sent SIGINT"),
            Err(err) => {
                warn!(?pid, error = %err, "failed to interrupt capture");
                self.record_line(format!("ERROR: failed to stop: {err}"));
            }
        }
    }
}

async fn supervise_run(
    inner: Arc<SupervisorInner>,
    mut process: SupervisedProcess,
    mut output: OutputLines,
    mut stop_rx: mpsc::Receiver<()>,
    total: u32,
) {
    let outcome = AssertUnwindSafe(drive_run(
        &inner,
        &mut process,
        &mut output,
        &mut stop_rx,
        total,
    ))
    .catch_unwind()
    .await;

    let failure = match outcome {
        Ok(Ok(exit)) => {
            inner.finish(exit, total);
            None
        }
        Ok(Err(err)) => Some(err.to_string()),
        Err(panic) => Some(panic_message(panic.as_ref())),
    };

    if let Some(message) = failure {
        if let Err(err) = process.kill().await {
            debug!(error = %err, "capture process already gone");
        }
        inner.fail_run(message);
    }

    if let Err(err) = inner.store.flush_async().await {
        warn!(error = %err, "failed to persist final status");
    }

    let mut slot = inner.slot.lock().await;
    slot.active = None;
    inner.set_phase(&mut slot, SupervisorPhase::Idle);
}

async fn drive_run(
    inner: &SupervisorInner,
    process: &mut SupervisedProcess,
    output: &mut OutputLines,
    stop_rx: &mut mpsc::Receiver<()>,
    total: u32,
) -> io::Result<ExitStatus> {
    let pid = process.id();
    let mut output_open = true;

    loop {
        tokio::select! {
            line = output.recv(), if output_open => match line {
                Some(Ok(text)) => inner.handle_output(text, total),
                Some(Err(err)) => return Err(err),
                None => output_open = false,
            },
            Some(()) = stop_rx.recv() => inner.interrupt(pid),
            exit = process.wait(), if !output_open => return exit,
        }
    }
}

fn exit_failure(exit: ExitStatus) -> Option<String> {
    if exit.success() {
        return None;
    }
    if let Some(code) = exit.code() {
        return Some(format!("process exited with code {code}"));
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = exit.signal() {
            return Some(format!("process terminated by signal {signal}"));
        }
    }

    Some("process exited abnormally".to_string())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "reader task panicked".to_string()
    }
}

/// Rebuilds a persisted `"<timestamp> - <text>"` entry. Entries that do not
/// carry a parseable timestamp keep their full text.
fn restore_log_line(raw: &str) -> LogLine {
    raw.split_once(" - ")
        .and_then(|(stamp, text)| {
            NaiveDateTime::parse_from_str(stamp, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| LogLine::at(Utc.from_utc_datetime(&naive), text))
        })
        .unwrap_or_else(|| LogLine::new(raw))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{exit_failure, restore_log_line};
    use crate::logs::LogLine;

    #[test]
    fn restores_formatted_log_lines() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 22, 15, 1).unwrap();
        let original = LogLine::at(ts, "captured: 2 - ok");

        let restored = restore_log_line(&original.to_string());
        assert_eq!(restored, original);
    }

    #[test]
    fn keeps_unparseable_entries_verbatim() {
        let restored = restore_log_line("no timestamp here");
        assert_eq!(restored.text, "no timestamp here");
    }

    #[cfg(unix)]
    #[test]
    fn maps_exit_status_to_failure_message() {
        use std::os::unix::process::ExitStatusExt;
        use std::process::ExitStatus;

        assert_eq!(exit_failure(ExitStatus::from_raw(0)), None);
        assert_eq!(
            exit_failure(ExitStatus::from_raw(2 << 8)).as_deref(),
            Some("process exited with code 2")
        );
        assert_eq!(
            exit_failure(ExitStatus::from_raw(9)).as_deref(),
            Some("process terminated by signal 9")
        );
    }
}
