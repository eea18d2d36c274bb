//! Session registry.
//!
//! The registry is the single authority mapping identifiers to live sessions.
//! Sessions enter it only after their shell has been spawned, and leave it
//! when they are removed explicitly or shortly after their shell exits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use webterm_protocol::{SessionId, SessionState, SessionSummary};

use super::broadcaster::{now_millis, OutputBroadcaster, QueueLimits, Subscription};
use super::pty::{ExitInfo, ProcessHandle, SessionError, SpawnParams, TerminalSize};
use crate::config::Config;

/// Lifecycle status of a session.
///
/// Transitions only move forward one step at a time:
/// `Starting -> Running -> Exited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The shell is being spawned.
    Starting,
    /// The shell is running.
    Running,
    /// The shell has exited.
    Exited(ExitInfo),
}

impl SessionStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::Running => 1,
            Self::Exited(_) => 2,
        }
    }

    /// Returns whether `next` is the state directly after this one.
    pub fn can_advance_to(&self, next: &SessionStatus) -> bool {
        next.rank() == self.rank() + 1
    }

    /// Returns the wire representation of this status.
    pub fn as_state(&self) -> SessionState {
        match self {
            Self::Starting => SessionState::Starting,
            Self::Running => SessionState::Running,
            Self::Exited(_) => SessionState::Exited,
        }
    }

    /// Returns whether the shell has exited.
    pub fn is_exited(&self) -> bool {
        matches!(self, Self::Exited(_))
    }
}

/// A terminal session: one shell process plus its output fan-out.
pub struct Session {
    id: SessionId,
    created_at: SystemTime,
    params: SpawnParams,
    status: RwLock<SessionStatus>,
    handle: ProcessHandle,
    broadcaster: OutputBroadcaster,
    /// Last input timestamp (Unix epoch milliseconds).
    last_input: AtomicU64,
}

impl Session {
    /// Returns the session identifier.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the parameters the session was spawned with.
    pub fn params(&self) -> &SpawnParams {
        &self.params
    }

    /// Returns when the session was created.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Returns the current status.
    pub fn status(&self) -> SessionStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the shell's process id.
    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> TerminalSize {
        self.handle.size()
    }

    /// Returns the output broadcaster.
    pub fn broadcaster(&self) -> &OutputBroadcaster {
        &self.broadcaster
    }

    /// Moves the status forward. Returns false if `next` would skip a state
    /// or go backwards.
    pub fn advance(&self, next: SessionStatus) -> bool {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        if !status.can_advance_to(&next) {
            return false;
        }
        *status = next;
        true
    }

    fn mark_exited(&self, info: ExitInfo) {
        if self.advance(SessionStatus::Exited(info)) {
            tracing::info!(
                session_id = %self.id,
                code = info.code,
                success = info.success,
                "Session exited"
            );
        }
    }

    /// Writes input to the shell.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if self.status().is_exited() {
            return Err(SessionError::ProcessTerminated(self.id.clone()));
        }
        self.handle.write(data).await?;
        self.last_input.store(now_millis(), Ordering::Relaxed);
        Ok(())
    }

    /// Attaches a new output consumer.
    pub fn attach(&self) -> Result<Subscription, SessionError> {
        if self.status().is_exited() {
            return Err(SessionError::ProcessTerminated(self.id.clone()));
        }
        Ok(self.broadcaster.attach())
    }

    /// Resizes the terminal.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if self.status().is_exited() {
            return Err(SessionError::ProcessTerminated(self.id.clone()));
        }
        self.handle.resize(cols, rows)
    }

    /// Returns the last input or output timestamp in Unix milliseconds.
    pub fn last_activity(&self) -> u64 {
        self.last_input
            .load(Ordering::Relaxed)
            .max(self.broadcaster.last_activity())
    }

    /// Returns the number of attached output consumers.
    pub fn consumer_count(&self) -> usize {
        self.broadcaster.consumer_count()
    }

    /// Returns a snapshot of the session.
    pub fn summary(&self) -> SessionSummary {
        let status = self.status();
        let size = self.size();
        SessionSummary {
            id: self.id.clone(),
            state: status.as_state(),
            pid: self.pid(),
            shell: self.params.shell.clone(),
            cwd: self.params.cwd.display().to_string(),
            cols: size.cols,
            rows: size.rows,
            created_at: system_time_millis(self.created_at),
            last_activity: self.last_activity(),
            consumers: self.consumer_count(),
            exit_code: match status {
                SessionStatus::Exited(info) => Some(info.code),
                _ => None,
            },
        }
    }

    /// Kills the shell and ends the output stream.
    fn terminate(&self) {
        if let Err(e) = self.handle.kill() {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to kill shell process");
        }
        self.broadcaster.finish();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("pid", &self.pid())
            .finish()
    }
}

/// Registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of sessions held at once.
    pub max_sessions: usize,
    /// Per-consumer output buffering limits.
    pub queue_limits: QueueLimits,
    /// Buffer size for reading PTY output.
    pub read_buffer_size: usize,
    /// How long an exited session lingers so consumers can drain its output.
    pub exit_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            queue_limits: QueueLimits::default(),
            read_buffer_size: super::broadcaster::DEFAULT_READ_BUFFER_SIZE,
            exit_grace: Duration::from_millis(500),
        }
    }
}

impl RegistryConfig {
    /// Builds registry settings from the daemon configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_sessions: config.session.max_sessions,
            queue_limits: QueueLimits {
                max_chunks: config.stream.queue_chunks,
                max_bytes: config.stream.queue_bytes,
            },
            read_buffer_size: config.stream.read_buffer_size,
            exit_grace: Duration::from_millis(config.session.exit_grace_ms),
        }
    }
}

type SessionMap = DashMap<SessionId, Arc<Session>>;

/// Thread-safe registry of live sessions.
pub struct SessionRegistry {
    sessions: Arc<SessionMap>,
    config: RegistryConfig,
    /// Serializes the capacity check with insertion.
    insert_lock: Mutex<()>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            config,
            insert_lock: Mutex::new(()),
        }
    }

    /// Returns the registry settings.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Spawns a shell and registers it under a fresh identifier.
    ///
    /// Output produced from the moment of spawning is broadcast to consumers
    /// attached at that time. On any failure nothing is registered.
    pub async fn create(&self, params: SpawnParams) -> Result<SessionId, SessionError> {
        if self.sessions.len() >= self.config.max_sessions {
            return Err(SessionError::LimitReached(self.config.max_sessions));
        }

        let mut id = SessionId::generate();
        while self.sessions.contains_key(&id) {
            id = SessionId::generate();
        }

        let handle = ProcessHandle::spawn(id.clone(), &params)?;
        let reader = handle
            .take_reader()
            .ok_or_else(|| SessionError::SpawnFailed("PTY reader unavailable".to_string()))?;
        let broadcaster = OutputBroadcaster::new(id.clone(), self.config.queue_limits);

        let session = Arc::new(Session {
            id: id.clone(),
            created_at: SystemTime::now(),
            params,
            status: RwLock::new(SessionStatus::Starting),
            handle,
            broadcaster,
            last_input: AtomicU64::new(now_millis()),
        });

        {
            let _guard = self.insert_lock.lock().unwrap_or_else(PoisonError::into_inner);
            if self.sessions.len() >= self.config.max_sessions {
                // Dropping the session kills the shell.
                return Err(SessionError::LimitReached(self.config.max_sessions));
            }
            match self.sessions.entry(id.clone()) {
                Entry::Occupied(_) => {
                    return Err(SessionError::SpawnFailed(format!(
                        "session identifier collision: {}",
                        id
                    )));
                }
                Entry::Vacant(entry) => {
                    entry.insert(Arc::clone(&session));
                }
            }
        }

        session
            .broadcaster
            .start_reader_loop(reader, self.config.read_buffer_size);
        session.advance(SessionStatus::Running);

        let weak_session = Arc::downgrade(&session);
        let weak_map = Arc::downgrade(&self.sessions);
        let grace = self.config.exit_grace;
        session.handle.on_exit(move |info| {
            if let Some(session) = weak_session.upgrade() {
                session.mark_exited(info);
                tokio::spawn(retire(weak_map, session, grace));
            }
        });

        let size = session.size();
        tracing::info!(
            session_id = %id,
            pid = ?session.pid(),
            shell = %session.params.shell,
            cols = size.cols,
            rows = size.rows,
            "Created new session"
        );

        Ok(id)
    }

    /// Looks up a registered session.
    pub fn lookup(&self, id: &SessionId) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    /// Returns a session if registered.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Attaches an output consumer to a live session.
    pub fn attach(&self, id: &SessionId) -> Result<Subscription, SessionError> {
        self.lookup(id)?.attach()
    }

    /// Writes input to a live session.
    pub async fn write(&self, id: &SessionId, data: Bytes) -> Result<(), SessionError> {
        let session = self.lookup(id)?;
        session.write(&data).await
    }

    /// Resizes a live session's terminal.
    pub fn resize(&self, id: &SessionId, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.lookup(id)?.resize(cols, rows)
    }

    /// Kills and unregisters a session. Idempotent; returns whether it existed.
    pub fn remove(&self, id: &SessionId) -> bool {
        match self.sessions.remove(id) {
            Some((id, session)) => {
                session.terminate();
                tracing::info!(session_id = %id, "Session removed");
                true
            }
            None => false,
        }
    }

    /// Returns snapshots of all sessions, oldest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions.iter().map(|s| s.summary()).collect()
    }

    /// Returns whether a session is registered.
    pub fn exists(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Returns the number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Removes sessions with no consumers and no activity within `timeout`.
    pub fn sweep_idle(&self, timeout: Duration) -> Vec<SessionId> {
        let cutoff = now_millis().saturating_sub(timeout.as_millis() as u64);
        let idle: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                session.consumer_count() == 0 && session.last_activity() < cutoff
            })
            .map(|entry| entry.key().clone())
            .collect();

        idle.into_iter()
            .filter(|id| {
                let removed = self.remove(id);
                if removed {
                    tracing::info!(session_id = %id, "Removed idle session");
                }
                removed
            })
            .collect()
    }

    /// Starts a background task that sweeps idle sessions until cancelled.
    pub fn start_sweep_task(
        self: &Arc<Self>,
        interval: Duration,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = registry.sweep_idle(idle_timeout);
                        if !removed.is_empty() {
                            tracing::debug!(count = removed.len(), "Idle sweep finished");
                        }
                    }
                }
            }
            tracing::debug!("Idle sweep task stopped");
        })
    }

    /// Kills and unregisters every session. Returns how many were removed.
    pub fn shutdown(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let removed = ids.iter().filter(|id| self.remove(id)).count();
        tracing::info!(sessions = removed, "Session registry shut down");
        removed
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

/// Unregisters an exited session once its output has drained.
async fn retire(sessions: Weak<SessionMap>, session: Arc<Session>, grace: Duration) {
    if !session.broadcaster.wait_finished(grace).await {
        session.broadcaster.finish();
    }
    if let Some(sessions) = sessions.upgrade() {
        if sessions
            .remove_if(&session.id, |_, current| Arc::ptr_eq(current, &session))
            .is_some()
        {
            tracing::debug!(session_id = %session.id, "Exited session unregistered");
        }
    }
}

fn system_time_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
