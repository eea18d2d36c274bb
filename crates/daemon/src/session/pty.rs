//! PTY process handles.
//!
//! This module provides the core PTY spawning and I/O functionality.
//! A [`ProcessHandle`] owns one shell process attached to a pseudo-terminal:
//! its input sink, its output source, and the notification of its exit.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::watch;
use webterm_protocol::{ProtocolError, SessionId};

/// Time a killed shell gets to honour SIGHUP before SIGKILL.
#[cfg(unix)]
const KILL_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session identifier is malformed.
    #[error(transparent)]
    InvalidId(#[from] ProtocolError),

    /// The input payload was rejected before reaching the PTY.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The session's process has already terminated.
    #[error("session process has terminated: {0}")]
    ProcessTerminated(SessionId),

    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// The registry refuses to hold more sessions.
    #[error("session limit reached ({0} sessions)")]
    LimitReached(usize),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    /// Columns.
    pub cols: u16,
    /// Rows.
    pub rows: u16,
}

impl TerminalSize {
    /// Creates a new terminal size.
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(80, 30)
    }
}

/// Parameters a session is spawned with. Immutable once the session exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnParams {
    /// Shell executable.
    pub shell: String,
    /// Arguments passed to the shell.
    pub args: Vec<String>,
    /// Working directory; must exist.
    pub cwd: PathBuf,
    /// Variables set on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Initial terminal size.
    pub size: TerminalSize,
}

impl SpawnParams {
    /// Creates parameters for `shell` in `cwd` with the default size.
    pub fn new(shell: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
            size: TerminalSize::default(),
        }
    }

    /// Sets the initial terminal size.
    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.size = TerminalSize::new(cols, rows);
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Adds an argument to the shell command line.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code reported by the OS.
    pub code: u32,
    /// Whether the process exited successfully.
    pub success: bool,
}

impl ExitInfo {
    /// Exit information used when the wait itself failed.
    fn unknown() -> Self {
        Self {
            code: u32::MAX,
            success: false,
        }
    }
}

impl From<portable_pty::ExitStatus> for ExitInfo {
    fn from(status: portable_pty::ExitStatus) -> Self {
        Self {
            code: status.exit_code(),
            success: status.success(),
        }
    }
}

/// A shell process attached to a pseudo-terminal.
///
/// The handle exclusively owns the PTY master and the child. Dropping it
/// kills the child if it is still running; a dedicated waiter thread reaps
/// the child in every case, and the master side of the PTY is closed with
/// the handle.
pub struct ProcessHandle {
    /// Session this process belongs to.
    id: SessionId,

    /// The PTY master handle.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// The writer for the PTY.
    writer: Arc<Mutex<Box<dyn Write + Send>>>,

    /// Output source, handed out once to the reader loop.
    reader: Mutex<Option<Box<dyn Read + Send>>>,

    /// Kills the child without needing the child itself (owned by the waiter).
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,

    /// Exit status, published by the waiter thread.
    exit_rx: watch::Receiver<Option<ExitInfo>>,

    /// Flag indicating if the process is still running.
    running: Arc<AtomicBool>,

    /// Current terminal size.
    size: Mutex<TerminalSize>,

    /// Process ID.
    pid: Option<u32>,
}

impl ProcessHandle {
    /// Spawns `params.shell` on a fresh PTY.
    ///
    /// Fails with [`SessionError::SpawnFailed`] when the working directory
    /// does not exist, when the PTY can't be allocated, or when the shell
    /// can't be started. Nothing is left behind on failure.
    pub fn spawn(id: SessionId, params: &SpawnParams) -> Result<Self, SessionError> {
        // portable-pty silently falls back to $HOME for a bad cwd.
        if !params.cwd.is_dir() {
            return Err(SessionError::SpawnFailed(format!(
                "working directory does not exist: {}",
                params.cwd.display()
            )));
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(params.size.to_pty_size())
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&params.shell);
        cmd.args(&params.args);
        cmd.cwd(&params.cwd);
        for (key, value) in &params.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        // The slave stays open in the child only, so the master sees EOF
        // once the shell and its descendants are gone.
        drop(pair.slave);

        let pid = child.process_id();

        let io = pair
            .master
            .take_writer()
            .and_then(|writer| Ok((writer, pair.master.try_clone_reader()?)));
        let (writer, reader) = match io {
            Ok(io) => io,
            Err(e) => {
                discard_child(&id, child);
                return Err(SessionError::SpawnFailed(e.to_string()));
            }
        };

        let killer = child.clone_killer();
        let running = Arc::new(AtomicBool::new(true));
        let exit_rx = spawn_waiter(id.clone(), child, Arc::clone(&running))?;

        tracing::debug!(
            session_id = %id,
            pid = ?pid,
            shell = %params.shell,
            cwd = %params.cwd.display(),
            "Spawned shell process"
        );

        Ok(Self {
            id,
            master: Mutex::new(pair.master),
            writer: Arc::new(Mutex::new(writer)),
            reader: Mutex::new(Some(reader)),
            killer: Mutex::new(killer),
            exit_rx,
            running,
            size: Mutex::new(params.size),
            pid,
        })
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> TerminalSize {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns whether the process is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the exit status, if the process has exited.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Takes the output source. Returns `None` after the first call.
    pub fn take_reader(&self) -> Option<Box<dyn Read + Send>> {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Writes data to the PTY (the shell's stdin).
    ///
    /// The write runs on the blocking pool since a PTY whose reader has
    /// stalled can block the writer.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::ProcessTerminated(self.id.clone()));
        }

        let writer = Arc::clone(&self.writer);
        let data = data.to_vec();
        let result = tokio::task::spawn_blocking(move || {
            let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
            writer.write_all(&data)?;
            writer.flush()
        })
        .await
        .map_err(|e| SessionError::WriteFailed(e.to_string()))?;

        match result {
            Ok(()) => Ok(()),
            Err(_) if !self.is_running() => Err(SessionError::ProcessTerminated(self.id.clone())),
            Err(e) => Err(SessionError::WriteFailed(e.to_string())),
        }
    }

    /// Resizes the PTY to the given dimensions.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::ProcessTerminated(self.id.clone()));
        }

        let size = TerminalSize::new(cols, rows);
        self.master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(size.to_pty_size())
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        *self.size.lock().unwrap_or_else(PoisonError::into_inner) = size;

        tracing::debug!(session_id = %self.id, cols, rows, "Resized PTY");
        Ok(())
    }

    /// Terminates the process and everything in its process group.
    ///
    /// Returns without waiting; the exit is observed through [`wait`](Self::wait)
    /// and [`on_exit`](Self::on_exit). Killing an exited process is a no-op.
    pub fn kill(&self) -> Result<(), SessionError> {
        if !self.is_running() {
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            // The shell leads its own session, so its pgid is its pid.
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                tracing::trace!(session_id = %self.id, error = %e, "killpg failed");
            }
            self.escalate_kill(pid);
        }

        let result = self
            .killer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .kill();

        match result {
            Ok(()) => Ok(()),
            // Raced with a natural exit.
            Err(_) if !self.is_running() => Ok(()),
            Err(e) => Err(SessionError::Io(e)),
        }
    }

    /// Sends SIGKILL to the process group if SIGHUP didn't end it in time.
    #[cfg(unix)]
    fn escalate_kill(&self, pid: u32) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let running = Arc::clone(&self.running);
        let id = self.id.clone();
        runtime.spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            // Still unreaped, so the pid can't have been recycled.
            if running.load(Ordering::SeqCst) {
                use nix::sys::signal::{killpg, Signal};
                use nix::unistd::Pid;

                tracing::warn!(session_id = %id, pid, "Shell ignored SIGHUP, sending SIGKILL");
                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        });
    }

    /// Waits for the process to exit.
    pub async fn wait(&self) -> ExitInfo {
        wait_exit(self.exit_rx.clone()).await
    }

    /// Registers a callback invoked exactly once when the process exits.
    ///
    /// If the process has already exited, the callback runs as soon as the
    /// spawned task is polled. Must be called from within a Tokio runtime.
    pub fn on_exit<F>(&self, callback: F)
    where
        F: FnOnce(ExitInfo) + Send + 'static,
    {
        let rx = self.exit_rx.clone();
        tokio::spawn(async move {
            callback(wait_exit(rx).await);
        });
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.is_running() {
            tracing::debug!(session_id = %self.id, "Killing shell process on handle drop");
            if let Err(e) = self.kill() {
                tracing::warn!(session_id = %self.id, error = %e, "Failed to kill shell process");
            }
        }
    }
}

/// Starts the thread that reaps the child and publishes its exit status.
fn spawn_waiter(
    id: SessionId,
    child: Box<dyn Child + Send + Sync>,
    running: Arc<AtomicBool>,
) -> Result<watch::Receiver<Option<ExitInfo>>, SessionError> {
    let (exit_tx, exit_rx) = watch::channel(None);

    // The child stays reachable here if the thread never starts.
    let slot = Arc::new(Mutex::new(Some(child)));
    let waiter_slot = Arc::clone(&slot);
    let thread_id = id.clone();

    let spawned = std::thread::Builder::new()
        .name(format!("pty-wait-{}", id))
        .spawn(move || {
            let id = thread_id;
            let child = waiter_slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let Some(mut child) = child else {
                return;
            };
            let info = match child.wait() {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    tracing::error!(session_id = %id, error = %e, "Failed to wait for shell process");
                    ExitInfo::unknown()
                }
            };
            running.store(false, Ordering::SeqCst);
            tracing::info!(session_id = %id, code = info.code, "Shell process exited");
            let _ = exit_tx.send(Some(info));
        });

    match spawned {
        Ok(_) => Ok(exit_rx),
        Err(e) => {
            let child = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(child) = child {
                discard_child(&id, child);
            }
            Err(SessionError::SpawnFailed(format!(
                "failed to start waiter thread: {e}"
            )))
        }
    }
}

/// Kills and reaps a child that never made it into a [`ProcessHandle`].
fn discard_child(id: &SessionId, mut child: Box<dyn Child + Send + Sync>) {
    if let Err(e) = child.kill() {
        tracing::debug!(session_id = %id, error = %e, "Kill of abandoned shell failed");
    }
    if let Err(e) = child.wait() {
        tracing::warn!(session_id = %id, error = %e, "Failed to reap abandoned shell");
    }
}

async fn wait_exit(mut rx: watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    match rx.wait_for(Option::is_some).await {
        Ok(info) => {
            let info = *info;
            info.unwrap_or_else(ExitInfo::unknown)
        }
        // The waiter always sends before dropping; a closed channel means it died.
        Err(_) => ExitInfo::unknown(),
    }
}
