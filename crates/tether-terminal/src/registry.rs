use bytes::Bytes;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tether_types::model::new_id;
use tether_types::{
    clamp_geometry, Result, SessionId, SessionStore, TerminalId, TerminalRecord, TetherError,
    UserId,
};

use super::bridge::{check_multiplexer_ids, multiplexer_name, ProcessBridge, SpawnedProcess};
use super::clock::{Clock, SystemClock};
use super::terminal::{Terminal, TerminalEvent, TerminalInfo, TerminalSpec};
use super::{DEFAULT_EVENT_CAPACITY, DEFAULT_SCROLLBACK_BYTES};

/// Registry tunables
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Byte cap of each terminal's in-memory scrollback
    pub scrollback_bytes: usize,
    /// Broadcast buffer per terminal; slower subscribers skip ahead
    pub event_capacity: usize,
    pub default_cwd: Option<PathBuf>,
    /// Upper bound on a restore-time capture before falling back to an empty replay
    pub capture_timeout: Duration,
    /// Quiet period that ends the attach redraw swallowed on re-attach
    pub attach_settle: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            default_cwd: None,
            capture_timeout: Duration::from_secs(5),
            attach_settle: Duration::from_millis(100),
        }
    }
}

type OpLock = Arc<tokio::sync::Mutex<()>>;

struct Inner {
    bridge: Arc<dyn ProcessBridge>,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
    terminals: RwLock<HashMap<TerminalId, Arc<Terminal>>>,
    /// Serializes restore and close for the same id
    op_locks: Mutex<HashMap<TerminalId, OpLock>>,
}

/// Single owner of all live terminals
///
/// Cheap to clone; clones share the same map. Every live terminal has exactly
/// one attached OS process and one output pump task.
#[derive(Clone)]
pub struct TerminalRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TerminalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalRegistry")
            .field("backend", &self.inner.bridge.backend_name())
            .field("terminals", &self.len())
            .finish()
    }
}

impl TerminalRegistry {
    pub fn new(
        bridge: Arc<dyn ProcessBridge>,
        store: Arc<dyn SessionStore>,
        config: RegistryConfig,
    ) -> Self {
        Self::with_clock(bridge, store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        bridge: Arc<dyn ProcessBridge>,
        store: Arc<dyn SessionStore>,
        config: RegistryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bridge,
                store,
                clock,
                config,
                terminals: RwLock::new(HashMap::new()),
                op_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn bridge(&self) -> &Arc<dyn ProcessBridge> {
        &self.inner.bridge
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.bridge.is_degraded()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Terminal>> {
        self.inner.read_map().get(id).cloned()
    }

    pub fn list(&self) -> Vec<TerminalInfo> {
        self.inner.read_map().values().map(|t| t.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a terminal backed by a fresh multiplexer session.
    pub async fn create(
        &self,
        user_id: &str,
        session_id: &str,
        cols: u16,
        rows: u16,
        panel_id: Option<String>,
    ) -> Result<Arc<Terminal>> {
        let (cols, rows) = clamp_geometry(cols, rows);
        let id = new_id();
        check_multiplexer_ids(session_id, &id)?;
        let terminal = self
            .spawn_fresh(id, user_id, session_id, cols, rows, panel_id)
            .await?;
        info!(
            terminal_id = %terminal.id(),
            session_id = %session_id,
            backend = self.inner.bridge.backend_name(),
            "terminal created"
        );
        Ok(terminal)
    }

    /// Re-attach a client to `id`.
    ///
    /// A live terminal is returned as is. Otherwise the terminal is rebuilt
    /// under the same id, re-attaching to its multiplexer session when it
    /// still exists (with the captured history queued as a one-shot replay)
    /// or starting a new one when it does not. Ids outside the multiplexer
    /// name charset are refused with `InvalidRequest`.
    pub async fn restore(
        &self,
        id: &str,
        user_id: &str,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<Terminal>> {
        check_multiplexer_ids(session_id, id)?;
        let lock = self.inner.op_lock(id);
        let result = {
            let _guard = lock.lock().await;
            self.restore_locked(id, user_id, session_id, cols, rows).await
        };
        self.inner.forget_op_lock(id);
        result
    }

    async fn restore_locked(
        &self,
        id: &str,
        user_id: &str,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<Terminal>> {
        if let Some(terminal) = self.get(id) {
            if !terminal.is_owned_by(user_id) || terminal.session_id() != session_id {
                return Err(TetherError::unauthorized(format!(
                    "terminal {} does not belong to this session",
                    id
                )));
            }
            debug!(terminal_id = %id, "restore found live terminal");
            return Ok(terminal);
        }

        let record = self.inner.store.find_terminal_record(id).await?;
        if let Some(record) = &record {
            if record.owner_user_id != user_id {
                return Err(TetherError::unauthorized(format!(
                    "terminal {} belongs to another user",
                    id
                )));
            }
            if record.session_id != session_id {
                return Err(TetherError::unauthorized(format!(
                    "terminal {} belongs to another session",
                    id
                )));
            }
        }

        let (cols, rows) = clamp_geometry(cols, rows);
        let panel_id = record.and_then(|r| r.panel_id);
        let name = multiplexer_name(session_id, id);

        if !self.inner.bridge.session_exists(&name).await? {
            let terminal = self
                .spawn_fresh(id.to_string(), user_id, session_id, cols, rows, panel_id)
                .await?;
            info!(terminal_id = %id, "restored terminal without history, started fresh");
            return Ok(terminal);
        }

        // Capture before attaching: the attach redraw must not end up in the snapshot.
        let snapshot = self.inner.capture_or_empty(&name).await;
        let cwd = self.inner.config.default_cwd.clone();
        let mut spawned = self
            .inner
            .bridge
            .spawn_attached(&name, cols, rows, cwd.as_deref())
            .await?;
        let settle = self.inner.config.attach_settle;
        let absorbed = absorb_attach_redraw(&mut spawned.output, settle).await;
        debug!(terminal_id = %id, bytes = absorbed, "attach redraw discarded");

        let spec = TerminalSpec {
            id: id.to_string(),
            owner_user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            panel_id,
            multiplexer_name: name,
            persistent: true,
            cols,
            rows,
        };
        let snapshot_len = snapshot.len();
        // The multiplexer session predates this process; leave it alive on failure.
        let terminal = self.inner.install(spec, spawned, Some(snapshot), false).await?;
        info!(terminal_id = %id, replay_bytes = snapshot_len, "terminal re-attached");
        Ok(terminal)
    }

    /// Forward input. Unknown ids are ignored.
    pub fn write(&self, id: &str, data: &[u8]) -> Result<()> {
        match self.get(id) {
            Some(terminal) => terminal.write(data),
            None => {
                debug!(terminal_id = %id, "input for unknown terminal dropped");
                Ok(())
            }
        }
    }

    /// Forward a resize, even when the geometry is unchanged (forces a redraw).
    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        let (cols, rows) = clamp_geometry(cols, rows);
        match self.get(id) {
            Some(terminal) => terminal.resize(cols, rows),
            None => Ok(()),
        }
    }

    pub fn subscribe(&self, id: &str) -> Option<broadcast::Receiver<TerminalEvent>> {
        self.get(id).map(|t| t.subscribe())
    }

    /// Owner and session of a live or recorded terminal.
    pub async fn owner_of(&self, id: &str) -> Result<Option<(UserId, SessionId)>> {
        if let Some(terminal) = self.get(id) {
            return Ok(Some((
                terminal.owner_user_id().to_string(),
                terminal.session_id().to_string(),
            )));
        }
        Ok(self
            .inner
            .store
            .find_terminal_record(id)
            .await?
            .map(|r| (r.owner_user_id, r.session_id)))
    }

    /// Tear down a terminal: kill the process, destroy the multiplexer
    /// session, forget the live entry and the persisted record.
    ///
    /// Works for terminals that only exist as a record. Every step runs even
    /// if an earlier one fails; the first error is returned.
    pub async fn close(&self, id: &str) -> Result<()> {
        let lock = self.inner.op_lock(id);
        let _guard = lock.lock().await;
        let result = self.inner.close_locked(id).await;
        self.inner.forget_op_lock(id);
        result
    }

    /// Snapshot to show a client that is (re)subscribing.
    pub async fn replay_for(&self, terminal: &Terminal) -> Bytes {
        if let Some(snapshot) = terminal.take_replay() {
            return snapshot;
        }
        if terminal.is_persistent() {
            let name = terminal.multiplexer_name();
            match tokio::time::timeout(
                self.inner.config.capture_timeout,
                self.inner.bridge.capture_scrollback(name),
            )
            .await
            {
                Ok(Ok(snapshot)) => return snapshot,
                Ok(Err(e)) => {
                    debug!(
                        terminal_id = %terminal.id(),
                        error = %e,
                        "capture failed, using local scrollback"
                    )
                }
                Err(_) => {
                    debug!(
                        terminal_id = %terminal.id(),
                        "capture timed out, using local scrollback"
                    )
                }
            }
        }
        terminal.scrollback_snapshot()
    }

    /// Close every terminal idle longer than `max_idle`. Failures are logged.
    pub async fn evict_idle(&self, max_idle: Duration) -> Vec<TerminalId> {
        let idle: Vec<TerminalId> = self
            .inner
            .read_map()
            .values()
            .filter(|t| t.idle_for() > max_idle)
            .map(|t| t.id().to_string())
            .collect();

        for id in &idle {
            match self.close(id).await {
                Ok(()) => info!(terminal_id = %id, "evicted idle terminal"),
                Err(e) => warn!(terminal_id = %id, error = %e, "idle eviction failed"),
            }
        }
        idle
    }

    pub fn spawn_idle_reaper(&self, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = registry.evict_idle(max_idle).await;
                if !evicted.is_empty() {
                    debug!(count = evicted.len(), "idle sweep finished");
                }
            }
        })
    }

    /// Close live and recorded terminals of a session. Returns how many closed cleanly.
    pub async fn close_session_terminals(&self, session_id: &str) -> usize {
        let mut ids: HashSet<TerminalId> = self
            .inner
            .read_map()
            .values()
            .filter(|t| t.session_id() == session_id)
            .map(|t| t.id().to_string())
            .collect();

        match self.inner.store.list_terminal_records(session_id).await {
            Ok(records) => ids.extend(records.into_iter().map(|r| r.id)),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "failed to list terminal records")
            }
        }

        self.close_all(ids).await
    }

    /// Close every live terminal owned by `user_id`.
    pub async fn close_user_terminals(&self, user_id: &str) -> usize {
        let ids: HashSet<TerminalId> = self
            .inner
            .read_map()
            .values()
            .filter(|t| t.is_owned_by(user_id))
            .map(|t| t.id().to_string())
            .collect();
        self.close_all(ids).await
    }

    async fn close_all(&self, ids: HashSet<TerminalId>) -> usize {
        let mut closed = 0;
        for id in ids {
            match self.close(&id).await {
                Ok(()) => closed += 1,
                Err(e) => warn!(terminal_id = %id, error = %e, "failed to close terminal"),
            }
        }
        closed
    }

    /// Kill every attach process but keep multiplexer sessions and records,
    /// so shells survive a server restart.
    pub fn detach_all(&self) -> usize {
        let drained: Vec<Arc<Terminal>> = {
            let mut map = self.inner.write_map();
            map.drain().map(|(_, t)| t).collect()
        };
        for terminal in &drained {
            if let Err(e) = terminal.kill() {
                debug!(terminal_id = %terminal.id(), error = %e, "kill during detach failed");
            }
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "detached terminals");
        }
        drained.len()
    }

    async fn spawn_fresh(
        &self,
        id: TerminalId,
        user_id: &str,
        session_id: &str,
        cols: u16,
        rows: u16,
        panel_id: Option<String>,
    ) -> Result<Arc<Terminal>> {
        let inner = &self.inner;
        let name = multiplexer_name(session_id, &id);
        let cwd = inner.config.default_cwd.clone();

        inner
            .bridge
            .ensure_session(&name, cols, rows, cwd.as_deref())
            .await?;

        let spawned = match inner
            .bridge
            .spawn_attached(&name, cols, rows, cwd.as_deref())
            .await
        {
            Ok(spawned) => spawned,
            Err(e) => {
                inner.destroy_quietly(&name).await;
                return Err(e);
            }
        };

        let spec = TerminalSpec {
            id,
            owner_user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            panel_id,
            multiplexer_name: name,
            persistent: !inner.bridge.is_degraded(),
            cols,
            rows,
        };
        inner.install(spec, spawned, None, true).await
    }
}

impl Inner {
    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TerminalId, Arc<Terminal>>> {
        self.terminals.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TerminalId, Arc<Terminal>>> {
        self.terminals.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn op_lock(&self, id: &str) -> OpLock {
        self.op_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    fn forget_op_lock(&self, id: &str) {
        let mut locks = self.op_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Only drop the entry if nobody else is waiting on it.
        if locks.get(id).is_some_and(|l| Arc::strong_count(l) <= 2) {
            locks.remove(id);
        }
    }

    async fn capture_or_empty(&self, name: &str) -> Bytes {
        match tokio::time::timeout(
            self.config.capture_timeout,
            self.bridge.capture_scrollback(name),
        )
        .await
        {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                warn!(
                    session = %name,
                    error = %e,
                    "scrollback capture failed, replay will be empty"
                );
                Bytes::new()
            }
            Err(_) => {
                warn!(session = %name, "scrollback capture timed out, replay will be empty");
                Bytes::new()
            }
        }
    }

    async fn destroy_quietly(&self, name: &str) {
        if let Err(e) = self.bridge.destroy_session(name).await {
            warn!(session = %name, error = %e, "failed to destroy multiplexer session");
        }
    }

    /// Persist, register and start pumping a freshly spawned process.
    ///
    /// On failure the process is killed, and the multiplexer session too when
    /// `owns_session` is set.
    async fn install(
        self: &Arc<Self>,
        spec: TerminalSpec,
        spawned: SpawnedProcess,
        replay: Option<Bytes>,
        owns_session: bool,
    ) -> Result<Arc<Terminal>> {
        let SpawnedProcess {
            handle,
            output,
            exit,
        } = spawned;

        let terminal = Arc::new(Terminal::new(
            spec,
            handle,
            self.config.scrollback_bytes,
            self.config.event_capacity,
            self.clock.clone(),
        ));
        if let Some(snapshot) = replay {
            terminal.set_replay(snapshot);
        }

        let record = TerminalRecord {
            id: terminal.id().to_string(),
            session_id: terminal.session_id().to_string(),
            owner_user_id: terminal.owner_user_id().to_string(),
            panel_id: terminal.panel_id().map(str::to_string),
            multiplexer_name: terminal.multiplexer_name().to_string(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.create_terminal_record(&record).await {
            if let Err(kill_err) = terminal.kill() {
                debug!(
                    terminal_id = %terminal.id(),
                    error = %kill_err,
                    "kill after failed persist"
                );
            }
            if owns_session {
                self.destroy_quietly(terminal.multiplexer_name()).await;
            }
            return Err(e);
        }

        self.write_map()
            .insert(terminal.id().to_string(), terminal.clone());

        tokio::spawn(pump(
            Arc::downgrade(self),
            terminal.clone(),
            output,
            exit,
        ));

        Ok(terminal)
    }

    async fn close_locked(&self, id: &str) -> Result<()> {
        let removed = self.write_map().remove(id);
        let mut first_error: Option<TetherError> = None;

        let name = match &removed {
            Some(terminal) => {
                if let Err(e) = terminal.kill() {
                    warn!(terminal_id = %id, error = %e, "failed to kill terminal process");
                    first_error.get_or_insert(e);
                }
                Some(terminal.multiplexer_name().to_string())
            }
            None => match self.store.find_terminal_record(id).await {
                Ok(record) => record.map(|r| r.multiplexer_name),
                Err(e) => {
                    first_error.get_or_insert(e);
                    None
                }
            },
        };

        if removed.is_none() && name.is_none() && first_error.is_none() {
            debug!(terminal_id = %id, "close of unknown terminal ignored");
            return Ok(());
        }

        if let Some(name) = &name {
            if let Err(e) = self.bridge.destroy_session(name).await {
                warn!(
                    terminal_id = %id,
                    session = %name,
                    error = %e,
                    "failed to destroy multiplexer session"
                );
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.store.delete_terminal_record(id).await {
            warn!(terminal_id = %id, error = %e, "failed to delete terminal record");
            first_error.get_or_insert(e);
        }

        info!(terminal_id = %id, live = removed.is_some(), "terminal closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Cleanup after the attached process ended on its own.
    async fn handle_exit(&self, terminal: &Arc<Terminal>, code: Option<u32>) {
        let removed = {
            let mut map = self.write_map();
            match map.get(terminal.id()) {
                Some(current) if Arc::ptr_eq(current, terminal) => map.remove(terminal.id()),
                _ => None,
            }
        };
        // Closed or detached already; whoever removed it owns the cleanup.
        if removed.is_none() {
            return;
        }

        info!(terminal_id = %terminal.id(), exit_code = ?code, "terminal process exited");
        self.destroy_quietly(terminal.multiplexer_name()).await;
        if let Err(e) = self.store.delete_terminal_record(terminal.id()).await {
            error!(terminal_id = %terminal.id(), error = %e, "failed to delete terminal record");
        }
    }
}

/// Swallow the screen redraw a freshly attached client prints.
///
/// The snapshot captured before attaching already shows that screen. Reading
/// stops once the process has been quiet for `settle`, and after four times
/// that in total so a busy program cannot stall the restore.
async fn absorb_attach_redraw(output: &mut mpsc::Receiver<Bytes>, settle: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + settle * 4;
    let mut absorbed = 0;
    loop {
        let quiet_until = (tokio::time::Instant::now() + settle).min(deadline);
        match tokio::time::timeout_at(quiet_until, output.recv()).await {
            Ok(Some(chunk)) => absorbed += chunk.len(),
            // EOF is seen again by the pump, which then reports the exit
            Ok(None) | Err(_) => break,
        }
    }
    absorbed
}

/// Route one process's output into its terminal until EOF, then handle exit.
async fn pump(
    inner: Weak<Inner>,
    terminal: Arc<Terminal>,
    mut output: mpsc::Receiver<Bytes>,
    exit: oneshot::Receiver<Option<u32>>,
) {
    while let Some(chunk) = output.recv().await {
        terminal.ingest(chunk);
    }
    let code = exit.await.ok().flatten();
    terminal.mark_exited(code);

    if let Some(inner) = inner.upgrade() {
        inner.handle_exit(&terminal, code).await;
    }
}
