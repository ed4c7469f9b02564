use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{broadcast::BroadcastHub, error::StoreError};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Done,
    Error,
}

/// Latest known state of the current or most recent capture run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    #[serde(rename = "status")]
    pub state: RunState,
    #[serde(default)]
    pub captured: u32,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
}

impl RunStatus {
    pub fn running(total: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            state: RunState::Running,
            captured: 0,
            total,
            error: None,
            start_time: Some(started_at),
        }
    }

    /// Applies a progress marker. `captured` never exceeds `total` once the
    /// total is known.
    pub fn record_progress(&mut self, captured: u32) {
        self.captured = if self.total > 0 {
            captured.min(self.total)
        } else {
            captured
        };
    }

    pub fn set_state(&mut self, state: RunState) {
        self.state = state;
        if state != RunState::Error {
            self.error = None;
        }
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.state = RunState::Error;
        self.error = Some(message.into());
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }
}

/// On-disk shape: the status plus the tail of the run's output so a restart
/// still shows what happened.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StatusRecord {
    #[serde(flatten)]
    status: RunStatus,
    #[serde(default)]
    recent_logs: Vec<String>,
}

/// Single-record status file, replaced atomically on every write. Every write
/// is also fanned out to status subscribers.
///
/// Mutations apply to memory under a short lock. The file write happens
/// afterwards, on the blocking pool when called from inside a tokio runtime
/// and inline otherwise.
#[derive(Debug)]
pub struct StatusStore {
    record: Mutex<StatusRecord>,
    version: AtomicU64,
    persister: Arc<Persister>,
    hub: BroadcastHub,
}

impl StatusStore {
    /// Loads the persisted record at `path`. A missing or unreadable file
    /// yields the default idle status.
    pub fn open(path: impl Into<PathBuf>, hub: BroadcastHub) -> Self {
        let path = path.into();
        let record = match load_record(&path) {
            Ok(Some(record)) => record,
            Ok(None) => StatusRecord::default(),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "status file unreadable; starting idle"
                );
                StatusRecord::default()
            }
        };

        Self {
            record: Mutex::new(record),
            version: AtomicU64::new(0),
            persister: Arc::new(Persister::new(path)),
            hub,
        }
    }

    pub fn path(&self) -> &Path {
        &self.persister.path
    }

    pub fn read(&self) -> RunStatus {
        self.record.lock().status.clone()
    }

    pub fn recent_logs(&self) -> Vec<String> {
        self.record.lock().recent_logs.clone()
    }

    /// Replaces the whole status. The in-memory record and subscribers see
    /// the new value even when persisting fails.
    pub fn write(&self, status: RunStatus) -> Result<(), StoreError> {
        self.update(|current| *current = status).map(|_| ())
    }

    /// Read-modify-write of the current status under the store lock.
    ///
    /// Inside a runtime the file write is handed to the blocking pool and
    /// its failures are logged; outside one it happens before returning and
    /// failures are returned.
    pub fn update<F>(&self, mutate: F) -> Result<RunStatus, StoreError>
    where
        F: FnOnce(&mut RunStatus),
    {
        let (snapshot, queued) = {
            let mut guard = self.record.lock();
            mutate(&mut guard.status);
            let snapshot = guard.status.clone();
            let queued = self.snapshot(&guard);
            self.hub.publish_status(snapshot.clone());
            (snapshot, queued)
        };

        self.persist(queued?)?;
        Ok(snapshot)
    }

    /// Mirrors the output tail into the status file without emitting a
    /// status event.
    pub fn record_logs(&self, lines: Vec<String>) -> Result<(), StoreError> {
        let queued = {
            let mut guard = self.record.lock();
            guard.recent_logs = lines;
            self.snapshot(&guard)
        };
        self.persist(queued?)
    }

    /// Writes the current record if the status file does not exist yet.
    /// Returns whether a file was created.
    pub fn ensure_persisted(&self) -> Result<bool, StoreError> {
        let queued = {
            let guard = self.record.lock();
            if self.persister.path.exists() {
                return Ok(false);
            }
            self.snapshot(&guard)?
        };
        self.persister.enqueue(queued);
        self.persister.flush()?;
        debug!(path = %self.persister.path.display(), "created status file");
        Ok(true)
    }

    /// Waits, off the async workers, until every change made so far is on
    /// disk.
    pub async fn flush_async(&self) -> Result<(), StoreError> {
        let persister = Arc::clone(&self.persister);
        tokio::task::spawn_blocking(move || persister.flush())
            .await
            .map_err(|err| StoreError::Io(io::Error::other(err)))?
    }

    /// Serializes the record and stamps it. Must run under the record lock
    /// so versions follow mutation order.
    fn snapshot(&self, record: &StatusRecord) -> Result<Snapshot, StoreError> {
        let bytes = serde_json::to_vec_pretty(record)?;
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Snapshot { version, bytes })
    }

    fn persist(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        self.persister.enqueue(snapshot);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let persister = Arc::clone(&self.persister);
                handle.spawn_blocking(move || {
                    if let Err(err) = persister.flush() {
                        warn!(
                            path = %persister.path.display(),
                            error = %err,
                            "failed to persist status"
                        );
                    }
                });
                Ok(())
            }
            Err(_) => self.persister.flush(),
        }
    }
}

#[derive(Debug)]
struct Snapshot {
    version: u64,
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct Pending {
    next: Option<Snapshot>,
    written: u64,
}

/// Holds the newest unwritten snapshot. Older snapshots that arrive late are
/// dropped, so the file always converges on the newest record.
#[derive(Debug)]
struct Persister {
    path: PathBuf,
    pending: Mutex<Pending>,
    write_lock: Mutex<()>,
}

impl Persister {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            pending: Mutex::new(Pending::default()),
            write_lock: Mutex::new(()),
        }
    }

    fn enqueue(&self, snapshot: Snapshot) {
        let mut pending = self.pending.lock();
        let newest = pending
            .next
            .as_ref()
            .map_or(pending.written, |queued| queued.version);
        if snapshot.version > newest {
            pending.next = Some(snapshot);
        }
    }

    fn flush(&self) -> Result<(), StoreError> {
        let _write = self.write_lock.lock();
        let snapshot = {
            let mut pending = self.pending.lock();
            let Some(snapshot) = pending.next.take() else {
                return Ok(());
            };
            pending.written = snapshot.version;
            snapshot
        };
        write_snapshot_sync(&self.path, &snapshot.bytes)
    }
}

fn load_record(path: &Path) -> Result<Option<StatusRecord>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Writes `bytes` next to `path` and renames over it, so readers only ever
/// see a complete file.
fn write_snapshot_sync(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::InvalidPath(path.to_path_buf()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use chrono::Utc;
    use tempfile::tempdir;

    use super::{Persister, RunState, RunStatus, Snapshot, StatusStore};
    use crate::broadcast::{BroadcastHub, EventKind, HubEvent};

    #[test]
    fn missing_file_reads_as_idle() {
        let dir = tempdir().unwrap();
        let store = StatusStore::open(
            dir.path().join("status.json"),
            BroadcastHub::default(),
        );

        assert_eq!(store.read(), RunStatus::default());
        assert_eq!(store.read().state, RunState::Idle);
    }

    #[test]
    fn corrupt_file_falls_back_to_idle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let store = StatusStore::open(&path, BroadcastHub::default());
        assert_eq!(store.read(), RunStatus::default());
    }

    #[test]
    fn write_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("status.json");
        let store = StatusStore::open(&path, BroadcastHub::default());

        let mut status = RunStatus::running(10, Utc::now());
        status.record_progress(4);
        store.write(status.clone()).unwrap();
        store
            .record_logs(vec!["2024-01-01T00:00:00.000000 - hi".into()])
            .unwrap();

        let reopened = StatusStore::open(&path, BroadcastHub::default());
        assert_eq!(reopened.read(), status);
        assert_eq!(reopened.recent_logs().len(), 1);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn persisted_json_uses_status_field() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json");
        let store = StatusStore::open(&path, BroadcastHub::default());
        store.write(RunStatus::default()).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["status"], "idle");
        assert_eq!(raw["captured"], 0);
        assert_eq!(raw["total"], 0);
        assert!(raw["error"].is_null());
        assert!(raw["recent_logs"].as_array().unwrap().is_empty());
    }

    #[test]
    fn write_broadcasts_same_record() {
        let dir = tempdir().unwrap();
        let hub = BroadcastHub::default();
        let mut sub = hub.subscribe(EventKind::Status);
        let store = StatusStore::open(dir.path().join("s.json"), hub);

        let status = RunStatus::running(3, Utc::now());
        store.write(status.clone()).unwrap();

        assert_eq!(sub.try_recv(), Some(HubEvent::Status(status)));
    }

    #[test]
    fn record_logs_does_not_broadcast() {
        let dir = tempdir().unwrap();
        let hub = BroadcastHub::default();
        let mut sub = hub.subscribe(EventKind::Status);
        let store = StatusStore::open(dir.path().join("s.json"), hub);

        store.record_logs(vec!["line".into()]).unwrap();
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn unwritable_path_still_updates_memory() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file, not a directory").unwrap();
        let store = StatusStore::open(
            blocker.join("status.json"),
            BroadcastHub::default(),
        );

        let result = store.write(RunStatus::running(5, Utc::now()));
        assert!(result.is_err());
        assert_eq!(store.read().state, RunState::Running);
    }

    #[test]
    fn ensure_persisted_creates_file_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json");
        let store = StatusStore::open(&path, BroadcastHub::default());

        assert!(store.ensure_persisted().unwrap());
        assert!(path.exists());
        assert!(!store.ensure_persisted().unwrap());
    }

    #[test]
    fn concurrent_writers_last_writer_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json");
        let store = Arc::new(StatusStore::open(&path, BroadcastHub::default()));

        let handles: Vec<_> = (1..=8u32)
            .map(|worker| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for step in 0..20u32 {
                        let mut status = RunStatus::running(1_000, Utc::now());
                        status.record_progress(worker * 100 + step);
                        store.write(status.clone()).unwrap();
                        let seen = store.read();
                        assert_eq!(seen.state, RunState::Running);
                        assert_eq!(seen.total, 1_000);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let on_disk = StatusStore::open(&path, BroadcastHub::default());
        assert_eq!(on_disk.read(), store.read());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_disk_does_not_block_readers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json");
        let store = StatusStore::open(&path, BroadcastHub::default());

        let status = RunStatus::running(12, Utc::now());
        {
            let _stalled = store.persister.write_lock.lock();
            store.write(status.clone()).unwrap();
            assert_eq!(store.read(), status);
            assert!(!path.exists());
        }

        store.flush_async().await.unwrap();
        let on_disk = StatusStore::open(&path, BroadcastHub::default());
        assert_eq!(on_disk.read(), status);
    }

    #[test]
    fn late_stale_snapshot_is_not_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json");
        let persister = Persister::new(path.clone());

        persister.enqueue(Snapshot {
            version: 2,
            bytes: br#"{"status":"done"}"#.to_vec(),
        });
        persister.enqueue(Snapshot {
            version: 1,
            bytes: br#"{"status":"running"}"#.to_vec(),
        });
        persister.flush().unwrap();
        persister.enqueue(Snapshot {
            version: 1,
            bytes: br#"{"status":"running"}"#.to_vec(),
        });
        persister.flush().unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["status"], "done");
    }

    #[test]
    fn error_is_cleared_when_leaving_error_state() {
        let mut status = RunStatus::running(2, Utc::now());
        status.fail("boom");
        assert_eq!(status.error.as_deref(), Some("boom"));

        status.set_state(RunState::Idle);
        assert_eq!(status.state, RunState::Idle);
        assert!(status.error.is_none());
    }

    #[test]
    fn progress_is_clamped_to_total() {
        let mut status = RunStatus::running(3, Utc::now());
        status.record_progress(7);
        assert_eq!(status.captured, 3);

        let mut unknown_total = RunStatus::default();
        unknown_total.record_progress(7);
        assert_eq!(unknown_total.captured, 7);
    }
}
