//! Process session: owns the engine subprocess and its three streams.
//!
//! The session is the only writer to the engine's stdin. Commands go out one
//! line at a time and are flushed immediately; the engine's stdout is drained
//! (optionally into a transcript) and its stderr is captured for diagnostics.

pub mod encoder;
pub mod sync;

use crate::error::{DriverError, Result};
use crate::model::{DriverEvent, EngineConfig, SessionState, SessionSummary};
use encoder::{encode, Command};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync::{ExitWatch, PendingArtifacts, SyncReport, Synchronizer};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Upper bound on captured stderr; older text is dropped first.
const STDERR_CAPTURE_LIMIT: usize = 64 * 1024;
/// How long to wait for the stream readers to drain once the engine is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub enum EngineControl {
    /// Abort the session: kill the engine and fail any in-flight wait.
    Cancel,
}

/// Cloneable handle for cancelling a session from another task.
#[derive(Debug, Clone)]
pub struct SessionController {
    tx: UnboundedSender<EngineControl>,
}

impl SessionController {
    pub fn cancel(&self) {
        let _ = self.tx.send(EngineControl::Cancel);
    }
}

/// Captured stderr text shared with the reader task.
#[derive(Debug, Clone, Default)]
struct StderrBuffer(Arc<Mutex<StderrInner>>);

#[derive(Debug, Default)]
struct StderrInner {
    text: String,
    /// Bytes ever pushed, including those trimmed off the front.
    total: usize,
}

impl StderrBuffer {
    fn push_line(&self, line: &str) {
        let mut inner = self.0.lock().unwrap_or_else(|e| e.into_inner());
        inner.text.push_str(line);
        inner.text.push('\n');
        inner.total += line.len() + 1;
        if inner.text.len() > STDERR_CAPTURE_LIMIT {
            let cut = ceil_char_boundary(&inner.text, inner.text.len() - STDERR_CAPTURE_LIMIT);
            inner.text.drain(..cut);
        }
    }

    fn total(&self) -> usize {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).total
    }

    fn text(&self) -> String {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).text.clone()
    }

    /// Text pushed after the first `seen` bytes, as far as it is still held.
    fn since(&self, seen: usize) -> String {
        let inner = self.0.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = inner.total.saturating_sub(seen).min(inner.text.len());
        let start = ceil_char_boundary(&inner.text, inner.text.len() - fresh);
        inner.text[start..].to_string()
    }
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

struct Running {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

/// Adapter that lets the synchronizer watch a child process.
struct ChildWatch<'a> {
    child: &'a mut Child,
}

impl ExitWatch for ChildWatch<'_> {
    fn poll_exit(&mut self) -> Result<Option<Option<i32>>> {
        let status = self
            .child
            .try_wait()
            .map_err(|e| DriverError::io("polling engine status", e))?;
        Ok(status.map(|s| s.code()))
    }
}

pub struct EngineSession {
    cfg: EngineConfig,
    state: SessionState,
    running: Option<Running>,
    stderr: StderrBuffer,
    /// Stderr length already attributed to earlier commands.
    stderr_seen: usize,
    commands_sent: usize,
    control_tx: UnboundedSender<EngineControl>,
    control_rx: UnboundedReceiver<EngineControl>,
    events: Option<UnboundedSender<DriverEvent>>,
}

impl EngineSession {
    pub fn new(cfg: EngineConfig) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            cfg,
            state: SessionState::NotStarted,
            running: None,
            stderr: StderrBuffer::default(),
            stderr_seen: 0,
            commands_sent: 0,
            control_tx,
            control_rx,
            events: None,
        }
    }

    pub fn with_events(mut self, events: UnboundedSender<DriverEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn commands_sent(&self) -> usize {
        self.commands_sent
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn controller(&self) -> SessionController {
        SessionController {
            tx: self.control_tx.clone(),
        }
    }

    /// Captured stderr so far.
    pub fn stderr_text(&self) -> String {
        self.stderr.text()
    }

    pub(crate) fn emit(&self, ev: DriverEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(ev);
        }
    }

    /// Spawn the engine with piped stdin, stdout and stderr.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != SessionState::NotStarted {
            return Err(DriverError::ordering(format!(
                "start() on a session that is {:?}",
                self.state
            )));
        }

        let log = match self.cfg.log_file.clone() {
            Some(path) => match open_transcript(&path).await {
                Ok(file) => Some(file),
                Err(e) => {
                    self.state = SessionState::Failed;
                    return Err(e);
                }
            },
            None => None,
        };

        let mut cmd = tokio::process::Command::new(&self.cfg.executable);
        cmd.args(&self.cfg.args)
            .envs(&self.cfg.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cfg.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| {
            self.state = SessionState::Failed;
            DriverError::Launch {
                program: self.cfg.executable.clone(),
                source,
            }
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            let _ = child.start_kill();
            self.state = SessionState::Failed;
            return Err(DriverError::Launch {
                program: self.cfg.executable.clone(),
                source: std::io::Error::other("engine streams were not captured"),
            });
        };

        let stdout_task = tokio::spawn(drain_stdout(stdout, log));
        let buffer = self.stderr.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "cpt_driver::engine::stderr", "{line}");
                buffer.push_line(&line);
            }
        });

        let pid = child.id();
        info!(program = %self.cfg.executable.display(), ?pid, "engine started");
        self.running = Some(Running {
            child,
            stdin: Some(stdin),
            stdout_task,
            stderr_task,
        });
        self.state = SessionState::Running;
        self.emit(DriverEvent::SessionStarted { pid });
        Ok(())
    }

    /// Write one command and flush it to the engine.
    pub async fn send(&mut self, command: &Command) -> Result<()> {
        self.ensure_running("send")?;
        if let Ok(EngineControl::Cancel) = self.control_rx.try_recv() {
            return Err(self.cancel().await);
        }
        if let Some(code) = self.poll_exit()? {
            return Err(self.exited(code, Vec::new()).await);
        }
        self.check_stderr()?;

        if !self.write_command(command).await? {
            let code = self.wait_exit_briefly().await;
            return Err(self.exited(code, Vec::new()).await);
        }
        Ok(())
    }

    /// Encode, write and flush one line. `Ok(false)` means the engine's input
    /// pipe is gone.
    async fn write_command(&mut self, command: &Command) -> Result<bool> {
        let line = encode(command)?;
        let index = self.commands_sent + 1;
        let running = self
            .running
            .as_mut()
            .ok_or_else(|| DriverError::ordering("session has no engine process"))?;
        let stdin = running
            .stdin
            .as_mut()
            .ok_or_else(|| DriverError::ordering("engine input was already closed"))?;

        let written: std::io::Result<()> = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        match written {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => return Ok(false),
            Err(e) => {
                self.state = SessionState::Failed;
                return Err(DriverError::io(format!("writing command #{index}"), e));
            }
        }

        self.commands_sent = index;
        let shown = line.trim_end().to_string();
        trace!(index, line = %shown, "command sent");
        self.emit(DriverEvent::CommandSent { index, line: shown });
        Ok(true)
    }

    /// Block until every artifact in `pending` is complete on disk.
    pub async fn synchronize(&mut self, pending: &mut PendingArtifacts) -> Result<SyncReport> {
        self.ensure_running("synchronize")?;
        let sync = Synchronizer::new(self.cfg.sync);
        let events = self.events.clone();
        let running = self
            .running
            .as_mut()
            .ok_or_else(|| DriverError::ordering("session has no engine process"))?;
        let mut watch = ChildWatch {
            child: &mut running.child,
        };
        let outcome = sync
            .wait(pending, &mut watch, Some(&mut self.control_rx), |name, path| {
                if let Some(tx) = &events {
                    let _ = tx.send(DriverEvent::ArtifactReady {
                        name: name.to_string(),
                        path: path.to_path_buf(),
                    });
                }
            })
            .await;

        match outcome {
            Ok(report) => {
                info!(
                    artifacts = report.ready.len(),
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "artifacts synchronized"
                );
                self.emit(DriverEvent::Synchronized {
                    artifacts: report.ready.len(),
                    elapsed: report.elapsed,
                });
                Ok(report)
            }
            Err(DriverError::EngineExit { code, pending, .. }) => {
                Err(self.exited(code, pending).await)
            }
            Err(DriverError::Cancelled { .. }) => Err(self.cancel().await),
            Err(err @ DriverError::Timeout { .. }) => {
                warn!(error = %err, "synchronization timed out");
                self.kill().await;
                self.state = SessionState::TimedOut;
                Err(err)
            }
            Err(err) => {
                self.kill().await;
                self.state = SessionState::Failed;
                Err(err)
            }
        }
    }

    /// Finish the session: send the quit sequence, close stdin and reap.
    pub async fn close(&mut self, quit: &[Command]) -> Result<SessionSummary> {
        self.ensure_running("close")?;
        if let Ok(EngineControl::Cancel) = self.control_rx.try_recv() {
            return Err(self.cancel().await);
        }
        // The engine may leave on its own part-way through the quit sequence.
        for cmd in quit {
            if self.poll_exit()?.is_some() || !self.write_command(cmd).await? {
                break;
            }
        }
        let grace = self.cfg.shutdown_grace;
        let Some(running) = self.running.as_mut() else {
            return Err(DriverError::ordering("session has no engine process"));
        };
        // EOF on stdin tells the engine nothing more is coming.
        drop(running.stdin.take());

        // `None` when a cancel arrived before the engine exited.
        let waited = tokio::select! {
            biased;
            Some(EngineControl::Cancel) = self.control_rx.recv() => None,
            waited = tokio::time::timeout(grace, running.child.wait()) => Some(waited),
        };
        let Some(waited) = waited else {
            return Err(self.cancel().await);
        };
        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                self.kill().await;
                self.state = SessionState::Failed;
                return Err(DriverError::io("waiting for engine exit", e));
            }
            Err(_) => {
                warn!(?grace, "engine ignored the quit sequence, killing it");
                self.kill().await;
                self.state = SessionState::Failed;
                return Err(DriverError::EngineHung { grace });
            }
        };

        self.drain_streams().await;
        self.reap();
        let code = status.code();
        self.emit(DriverEvent::SessionClosed { code });
        if !status.success() {
            self.state = SessionState::Failed;
            return Err(DriverError::EngineExit {
                code,
                commands_sent: self.commands_sent,
                pending: Vec::new(),
                stderr: self.stderr.text(),
            });
        }
        self.state = SessionState::Completed;
        info!(commands = self.commands_sent, "engine session closed");
        Ok(SessionSummary {
            exit_code: code,
            commands_sent: self.commands_sent,
            stderr: self.stderr.text(),
        })
    }

    /// Kill the engine if it is still around; used on every failure path.
    pub async fn abort(&mut self) {
        if self.running.is_some() {
            self.kill().await;
        }
        if !self.state.is_terminal() {
            self.state = SessionState::Failed;
        }
    }

    fn ensure_running(&self, op: &str) -> Result<()> {
        if self.state == SessionState::Running {
            Ok(())
        } else {
            Err(DriverError::ordering(format!(
                "{op}() on a session that is {:?}",
                self.state
            )))
        }
    }

    fn poll_exit(&mut self) -> Result<Option<Option<i32>>> {
        match self.running.as_mut() {
            Some(r) => ChildWatch {
                child: &mut r.child,
            }
            .poll_exit(),
            None => Ok(None),
        }
    }

    /// Fail fast when the engine complained about an earlier command.
    fn check_stderr(&mut self) -> Result<()> {
        if !self.cfg.fail_on_stderr {
            return Ok(());
        }
        let total = self.stderr.total();
        if total <= self.stderr_seen {
            return Ok(());
        }
        let fresh = self.stderr.since(self.stderr_seen);
        self.stderr_seen = total;
        if fresh.trim().is_empty() {
            return Ok(());
        }
        self.state = SessionState::Failed;
        Err(DriverError::EngineRejected {
            command_index: self.commands_sent,
            stderr: fresh,
        })
    }

    async fn wait_exit_briefly(&mut self) -> Option<i32> {
        let running = self.running.as_mut()?;
        match tokio::time::timeout(DRAIN_TIMEOUT, running.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            _ => None,
        }
    }

    async fn exited(&mut self, code: Option<i32>, pending: Vec<String>) -> DriverError {
        self.drain_streams().await;
        self.reap();
        self.state = SessionState::Failed;
        self.emit(DriverEvent::SessionClosed { code });
        DriverError::EngineExit {
            code,
            commands_sent: self.commands_sent,
            pending,
            stderr: self.stderr.text(),
        }
    }

    async fn cancel(&mut self) -> DriverError {
        info!(commands = self.commands_sent, "session cancelled");
        self.kill().await;
        self.state = SessionState::Cancelled;
        DriverError::Cancelled {
            commands_sent: self.commands_sent,
        }
    }

    async fn kill(&mut self) {
        if let Some(running) = self.running.as_mut() {
            drop(running.stdin.take());
            if let Err(e) = running.child.kill().await {
                debug!(error = %e, "kill failed (engine probably already gone)");
            }
        }
        self.drain_streams().await;
        self.reap();
    }

    fn reap(&mut self) {
        if let Some(mut running) = self.running.take() {
            let _ = running.child.try_wait();
            running.stdout_task.abort();
            running.stderr_task.abort();
        }
    }

    /// Give the reader tasks a moment to pick up what the engine wrote last.
    async fn drain_streams(&mut self) {
        if let Some(running) = self.running.as_mut() {
            // A finished handle may already have been awaited; polling it again panics.
            if !running.stderr_task.is_finished() {
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, &mut running.stderr_task).await;
            }
            if !running.stdout_task.is_finished() {
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, &mut running.stdout_task).await;
            }
        }
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        if let Some(running) = self.running.as_mut() {
            // kill_on_drop covers the child; the reader tasks end with its pipes.
            let _ = running.child.start_kill();
        }
    }
}

async fn open_transcript(path: &Path) -> Result<tokio::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DriverError::io(format!("creating {}", parent.display()), e))?;
    }
    tokio::fs::File::create(path)
        .await
        .map_err(|e| DriverError::io(format!("creating transcript {}", path.display()), e))
}

async fn drain_stdout(mut stdout: tokio::process::ChildStdout, mut log: Option<tokio::fs::File>) {
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        match log.as_mut() {
            Some(file) => {
                if file.write_all(&buf[..n]).await.is_err() {
                    log = None;
                }
            }
            None => trace!(bytes = n, "engine output discarded"),
        }
    }
    if let Some(mut file) = log {
        let _ = file.flush().await;
    }
}
