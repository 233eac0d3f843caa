use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use tether_types::{Result, SessionId, TerminalId, TetherError, UserId};

use super::bridge::ProcessHandle;
use super::clock::Clock;
use super::sanitize::OutputScrubber;
use super::scrollback::ScrollbackBuffer;

/// Event published to every subscriber of a terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    /// Scrubbed output chunk, in emission order
    Output(Bytes),
    /// The attached process ended
    Exited(Option<u32>),
}

/// Identity and geometry of a new terminal
#[derive(Debug, Clone)]
pub struct TerminalSpec {
    pub id: TerminalId,
    pub owner_user_id: UserId,
    pub session_id: SessionId,
    pub panel_id: Option<String>,
    pub multiplexer_name: String,
    pub persistent: bool,
    pub cols: u16,
    pub rows: u16,
}

/// Point-in-time view of a terminal for listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalInfo {
    pub id: TerminalId,
    pub owner_user_id: UserId,
    pub session_id: SessionId,
    pub multiplexer_name: String,
    pub persistent: bool,
    pub cols: u16,
    pub rows: u16,
    pub subscribers: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A live terminal: one OS process plus its output fan-out
///
/// Created and destroyed only by the registry. Output arrives through
/// [`Terminal::ingest`] from the terminal's single pump task, which keeps the
/// broadcast order identical to the emission order.
pub struct Terminal {
    spec: TerminalSpec,
    geometry: Mutex<(u16, u16)>,
    process: Box<dyn ProcessHandle>,
    scrollback: Mutex<ScrollbackBuffer>,
    scrubber: Mutex<OutputScrubber>,
    /// One-shot snapshot captured during restore
    replay: Mutex<Option<Bytes>>,
    events: broadcast::Sender<TerminalEvent>,
    clock: Arc<dyn Clock>,
    last_activity: Mutex<Instant>,
    exited: AtomicBool,
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("id", &self.spec.id)
            .field("session_id", &self.spec.session_id)
            .field("multiplexer_name", &self.spec.multiplexer_name)
            .field("persistent", &self.spec.persistent)
            .finish()
    }
}

impl Terminal {
    pub(crate) fn new(
        spec: TerminalSpec,
        process: Box<dyn ProcessHandle>,
        scrollback_bytes: usize,
        event_capacity: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let now = clock.now();
        Self {
            geometry: Mutex::new((spec.cols, spec.rows)),
            spec,
            process,
            scrollback: Mutex::new(ScrollbackBuffer::new(scrollback_bytes)),
            scrubber: Mutex::new(OutputScrubber::new()),
            replay: Mutex::new(None),
            events,
            clock,
            last_activity: Mutex::new(now),
            exited: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn owner_user_id(&self) -> &str {
        &self.spec.owner_user_id
    }

    pub fn session_id(&self) -> &str {
        &self.spec.session_id
    }

    pub fn panel_id(&self) -> Option<&str> {
        self.spec.panel_id.as_deref()
    }

    pub fn multiplexer_name(&self) -> &str {
        &self.spec.multiplexer_name
    }

    /// False for terminals created without tmux; those cannot be restored.
    pub fn is_persistent(&self) -> bool {
        self.spec.persistent
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.spec.owner_user_id == user_id
    }

    pub fn geometry(&self) -> (u16, u16) {
        *lock(&self.geometry)
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> TerminalInfo {
        let (cols, rows) = self.geometry();
        TerminalInfo {
            id: self.spec.id.clone(),
            owner_user_id: self.spec.owner_user_id.clone(),
            session_id: self.spec.session_id.clone(),
            multiplexer_name: self.spec.multiplexer_name.clone(),
            persistent: self.spec.persistent,
            cols,
            rows,
            subscribers: self.events.receiver_count(),
        }
    }

    /// Attach a new listener. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.events.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        if self.has_exited() {
            return Err(TetherError::ProcessExited(self.spec.id.clone()));
        }
        self.touch();
        self.process.write(data)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        *lock(&self.geometry) = (cols, rows);
        self.process.resize(cols, rows)
    }

    pub(crate) fn kill(&self) -> Result<()> {
        self.process.kill()
    }

    /// Scrub, record and fan out one raw output chunk.
    pub(crate) fn ingest(&self, chunk: Bytes) {
        let chunk = lock(&self.scrubber).scrub(chunk);
        self.publish(chunk);
    }

    pub(crate) fn mark_exited(&self, code: Option<u32>) {
        if !self.exited.swap(true, Ordering::SeqCst) {
            let rest = lock(&self.scrubber).flush();
            self.publish(rest);
            let _ = self.events.send(TerminalEvent::Exited(code));
        }
    }

    fn publish(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        lock(&self.scrollback).push(chunk.clone());
        self.touch();
        // No receivers is fine: output is still recorded for later replay.
        let _ = self.events.send(TerminalEvent::Output(chunk));
    }

    pub(crate) fn set_replay(&self, snapshot: Bytes) {
        *lock(&self.replay) = Some(snapshot);
    }

    /// Take the restore snapshot, if one is still pending.
    pub fn take_replay(&self) -> Option<Bytes> {
        lock(&self.replay).take()
    }

    pub fn scrollback_snapshot(&self) -> Bytes {
        lock(&self.scrollback).snapshot()
    }

    pub fn touch(&self) {
        *lock(&self.last_activity) = self.clock.now();
    }

    pub fn idle_for(&self) -> Duration {
        let last = *lock(&self.last_activity);
        self.clock.now().saturating_duration_since(last)
    }
}
