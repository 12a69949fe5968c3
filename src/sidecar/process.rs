//! Spawning, tracking and terminating the sidecar process.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::sidecar::config::{CREDENTIALS_ENV, LISTEN_ADDR_ENV, SupervisorConfig};
use crate::sidecar::error::ProcessError;

/// How long to wait for output readers to drain after the child exits.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Which child stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Receives the sidecar's output, one line at a time.
pub trait LogSink: Send + Sync {
    fn line(&self, pid: u32, stream: OutputStream, line: &str);
}

/// Default sink: forwards lines as tracing events.
#[derive(Debug, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn line(&self, pid: u32, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => {
                tracing::info!(target: "lexe_sidecar::child", pid, stream = stream.as_str(), "{}", line)
            }
            OutputStream::Stderr => {
                tracing::warn!(target: "lexe_sidecar::child", pid, stream = stream.as_str(), "{}", line)
            }
        }
    }
}

/// An owned OS process.
pub struct ProcessHandle {
    pid: u32,
    started_at: DateTime<Utc>,
    alive: bool,
    exit_status: Option<ExitStatus>,
    child: Child,
    log_tasks: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// When the process was spawned.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Liveness as of the last check.
    pub fn alive(&self) -> bool {
        self.alive
    }

    /// Exit status, once the process has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Non-blocking liveness check. Reaps the child if it has exited.
    fn poll_alive(&mut self) -> bool {
        if !self.alive {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::debug!(pid = self.pid, status = %status, "Sidecar process has exited");
                self.mark_exited(status);
                false
            }
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "Failed to inspect sidecar process state");
                false
            }
        }
    }

    fn mark_exited(&mut self, status: ExitStatus) {
        self.alive = false;
        self.exit_status = Some(status);
    }

    async fn drain_logs(&mut self) {
        for task in self.log_tasks.drain(..) {
            if tokio::time::timeout(LOG_DRAIN_TIMEOUT, task).await.is_err() {
                tracing::debug!(pid = self.pid, "Sidecar output reader still open after exit");
            }
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .field("alive", &self.alive)
            .field("exit_status", &self.exit_status)
            .finish()
    }
}

/// Owns at most one sidecar process.
pub struct ProcessController {
    sink: Arc<dyn LogSink>,
    handle: Option<ProcessHandle>,
}

impl ProcessController {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink, handle: None }
    }

    /// The tracked process, if any.
    pub fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref()
    }

    /// Launch `binary` for `config`.
    ///
    /// Credentials and the listen address travel through the child's
    /// environment only; the argument vector stays empty so neither shows up
    /// in process listings.
    pub async fn spawn(
        &mut self,
        binary: &Path,
        config: &SupervisorConfig,
    ) -> Result<&ProcessHandle, ProcessError> {
        if let Some(handle) = self.handle.as_mut() {
            if handle.poll_alive() {
                return Err(ProcessError::AlreadySpawned { pid: handle.pid });
            }
            self.handle = None;
        }

        let mut command = Command::new(binary);
        command
            .env(LISTEN_ADDR_ENV, config.listen_addr())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref credentials) = config.credentials {
            command.env(CREDENTIALS_ENV, credentials.expose_secret());
        }

        let mut child = spawn_with_retry(&mut command).await.map_err(|source| ProcessError::Spawn {
            binary: binary.to_path_buf(),
            source,
        })?;

        // A child that has already been reaped has no id; treat it as dead on arrival.
        let pid = child.id().unwrap_or_default();
        let mut log_tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            log_tasks.push(spawn_reader(stdout, pid, OutputStream::Stdout, self.sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            log_tasks.push(spawn_reader(stderr, pid, OutputStream::Stderr, self.sink.clone()));
        }

        tracing::info!(
            pid,
            binary = %binary.display(),
            listen_addr = %config.listen_addr(),
            "Spawned sidecar process"
        );

        Ok(self.handle.insert(ProcessHandle {
            pid,
            started_at: Utc::now(),
            alive: pid != 0,
            exit_status: None,
            child,
            log_tasks,
        }))
    }

    /// Non-blocking liveness check of the tracked process.
    pub fn is_alive(&mut self) -> bool {
        self.handle.as_mut().is_some_and(ProcessHandle::poll_alive)
    }

    /// Stop the tracked process: SIGTERM, wait up to `timeout`, then SIGKILL.
    ///
    /// Succeeds once the process is reaped. A missing or already-exited
    /// process is a no-op success. The handle is released either way.
    pub async fn terminate(&mut self, timeout: Duration) -> Result<(), ProcessError> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        let pid = handle.pid;

        if !handle.poll_alive() {
            handle.drain_logs().await;
            return Ok(());
        }

        match send_graceful_stop(pid) {
            Ok(()) => tracing::debug!(pid, "Sent SIGTERM to sidecar"),
            Err(e) => tracing::warn!(pid, error = %e, "Graceful stop signal failed"),
        }

        let result = match tokio::time::timeout(timeout, handle.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid, status = %status, "Sidecar exited after SIGTERM");
                handle.mark_exited(status);
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!(pid, error = %e, "Waiting on sidecar failed; forcing kill");
                force_kill(&mut handle).await
            }
            Err(_) => {
                tracing::warn!(
                    pid,
                    timeout_ms = timeout.as_millis() as u64,
                    "Sidecar ignored SIGTERM; forcing kill"
                );
                force_kill(&mut handle).await
            }
        };

        handle.drain_logs().await;
        result
    }
}

impl std::fmt::Debug for ProcessController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessController")
            .field("handle", &self.handle)
            .finish()
    }
}

async fn force_kill(handle: &mut ProcessHandle) -> Result<(), ProcessError> {
    let pid = handle.pid;
    if let Err(e) = handle.child.kill().await {
        // kill fails if the child exited in the meantime; reap and check.
        return match handle.child.try_wait() {
            Ok(Some(status)) => {
                handle.mark_exited(status);
                Ok(())
            }
            _ => Err(ProcessError::Terminate {
                pid,
                reason: e.to_string(),
            }),
        };
    }
    match handle.child.try_wait() {
        Ok(Some(status)) => handle.mark_exited(status),
        _ => handle.alive = false,
    }
    tracing::info!(pid, "Sidecar killed");
    Ok(())
}

#[cfg(unix)]
fn send_graceful_stop(pid: u32) -> std::io::Result<()> {
    // pid 0 would signal our own process group.
    let pid = libc::pid_t::try_from(pid)
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid pid"))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_graceful_stop(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "no graceful stop signal on this platform",
    ))
}

/// Spawn, retrying briefly on ETXTBSY: a binary that was just renamed into
/// place may still be open for writing in a concurrently forked child. The
/// backoff yields to the runtime.
async fn spawn_with_retry(command: &mut Command) -> std::io::Result<Child> {
    let mut attempts = 0;
    loop {
        match command.spawn() {
            #[cfg(unix)]
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempts < 5 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(20 * attempts)).await;
            }
            other => return other,
        }
    }
}

fn spawn_reader<R>(
    reader: R,
    pid: u32,
    stream: OutputStream,
    sink: Arc<dyn LogSink>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => sink.line(pid, stream, &line),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(pid, stream = stream.as_str(), error = %e, "Sidecar output reader failed");
                    break;
                }
            }
        }
    })
}
