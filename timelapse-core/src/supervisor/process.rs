use std::{
    io,
    path::Path,
    process::{ExitStatus, Stdio},
};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    process::{Child, Command},
    sync::mpsc,
};
use tracing::{debug, trace, warn};

const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Longest line forwarded from the script. Anything past this on the same
/// line is dropped.
pub(crate) const MAX_LINE_BYTES: usize = 16 * 1024;

/// Lines read from the child's stdout and stderr, interleaved in arrival
/// order. The channel closes once both pipes reach end-of-file.
pub(crate) type OutputLines = mpsc::Receiver<io::Result<String>>;

/// Handle to the running capture script.
#[derive(Debug)]
pub(crate) struct SupervisedProcess {
    child: Child,
    pid: Option<u32>,
}

impl SupervisedProcess {
    /// Spawns `<script> <interval> <frames>` with both output pipes merged
    /// into one line stream.
    pub(crate) fn spawn(
        script: &Path,
        interval: u32,
        frames: u32,
    ) -> io::Result<(Self, OutputLines)> {
        let mut child = Command::new(script)
            .arg(interval.to_string())
            .arg(frames.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pid = child.id();
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, tx.clone(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, tx, "stderr"));
        }

        debug!(?pid, script = %script.display(), "spawned capture process");
        Ok((Self { child, pid }, rx))
    }

    pub(crate) fn id(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Forcefully terminates the process and reaps it.
    pub(crate) async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

/// Sends SIGINT so the script can stop its capture loop cleanly.
#[cfg(unix)]
pub(crate) fn send_interrupt(pid: Option<u32>) -> io::Result<()> {
    let pid = pid.ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "process has no pid")
    })?;
    let pid = libc::pid_t::try_from(pid).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "pid out of range")
    })?;

    // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs to
    // a child that has not been reaped yet.
    let rc = unsafe { libc::kill(pid, libc::SIGINT) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub(crate) fn send_interrupt(_pid: Option<u32>) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "graceful interrupt requires a unix platform",
    ))
}

/// True when `path` is a regular file the server may execute.
pub(crate) fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}

async fn pump_lines<R>(
    reader: R,
    tx: mpsc::Sender<io::Result<String>>,
    source: &'static str,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut buf)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {
                let truncated =
                    buf.len() == MAX_LINE_BYTES && buf.last() != Some(&b'\n');
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if !line.is_empty() && tx.send(Ok(line.to_string())).await.is_err() {
                    break;
                }
                if truncated {
                    match discard_rest_of_line(&mut reader).await {
                        Ok(0) => {}
                        Ok(skipped) => warn!(
                            source,
                            skipped,
                            limit = MAX_LINE_BYTES,
                            "truncated oversized output line"
                        ),
                        Err(err) => {
                            let _ = tx.send(Err(err)).await;
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                break;
            }
        }
    }
    trace!(source, "output pipe closed");
}

/// Consumes input up to and including the next newline, returning how many
/// bytes were skipped before it.
async fn discard_rest_of_line<R>(reader: &mut R) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut skipped = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(skipped);
        }
        match available.iter().position(|&byte| byte == b'\n') {
            Some(idx) => {
                reader.consume(idx + 1);
                return Ok(skipped + idx);
            }
            None => {
                let len = available.len();
                reader.consume(len);
                skipped += len;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;
    use tokio::sync::mpsc;

    use super::{MAX_LINE_BYTES, is_executable, pump_lines};

    #[test]
    fn detects_executable_bit() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("capture.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();

        std::fs::set_permissions(
            &script,
            std::fs::Permissions::from_mode(0o644),
        )
        .unwrap();
        assert!(!is_executable(&script));

        std::fs::set_permissions(
            &script,
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        assert!(is_executable(&script));
    }

    #[test]
    fn missing_path_and_directories_are_not_executable() {
        let dir = tempdir().unwrap();
        assert!(!is_executable(&dir.path().join("missing.sh")));
        assert!(!is_executable(dir.path()));
    }

    #[tokio::test]
    async fn oversized_line_is_truncated_and_remainder_skipped() {
        let mut input = vec![b'x'; MAX_LINE_BYTES * 3];
        input.extend_from_slice(b"\ncaptured: 1\n");
        let (tx, mut rx) = mpsc::channel(4);

        pump_lines(input.as_slice(), tx, "stdout").await;

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.len(), MAX_LINE_BYTES);
        assert_eq!(rx.recv().await.unwrap().unwrap(), "captured: 1");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unterminated_flood_yields_one_bounded_line() {
        let input = vec![b'y'; MAX_LINE_BYTES * 2 + 17];
        let (tx, mut rx) = mpsc::channel(4);

        pump_lines(input.as_slice(), tx, "stderr").await;

        assert_eq!(rx.recv().await.unwrap().unwrap().len(), MAX_LINE_BYTES);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn line_of_exactly_the_limit_is_kept_whole() {
        let mut input = vec![b'z'; MAX_LINE_BYTES];
        input.extend_from_slice(b"\ndone\n");
        let (tx, mut rx) = mpsc::channel(4);

        pump_lines(input.as_slice(), tx, "stdout").await;

        assert_eq!(rx.recv().await.unwrap().unwrap().len(), MAX_LINE_BYTES);
        assert_eq!(rx.recv().await.unwrap().unwrap(), "done");
        assert!(rx.recv().await.is_none());
    }
}
