//! In-process bridge fake for registry and gateway tests.
//!
//! Tracks every bridge call, keeps a set of "multiplexer sessions" and lets
//! tests push output into, or end, the most recent process attached to a name.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};

use tether_types::{Result, TetherError};

use crate::bridge::{MultiplexerSession, ProcessBridge, ProcessHandle, SpawnedProcess};

/// Call counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeCounts {
    pub ensure: usize,
    pub spawn: usize,
    pub capture: usize,
    pub destroy: usize,
    pub kill: usize,
    pub resize: usize,
}

struct FakeProcessIo {
    generation: u64,
    output: mpsc::Sender<Bytes>,
    exit: oneshot::Sender<Option<u32>>,
}

#[derive(Default)]
struct FakeState {
    sessions: HashSet<String>,
    scrollback: HashMap<String, Bytes>,
    /// Printed by every process attaching to the name, like tmux's redraw
    attach_output: HashMap<String, Bytes>,
    processes: HashMap<String, FakeProcessIo>,
    writes: HashMap<String, Vec<u8>>,
    resizes: Vec<(String, u16, u16)>,
    counts: FakeCounts,
    next_generation: u64,
    fail_next_spawn: bool,
    fail_destroy: bool,
}

type Shared = Arc<Mutex<FakeState>>;

fn lock(state: &Shared) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fake [`ProcessBridge`]
#[derive(Clone, Default)]
pub struct FakeBridge {
    state: Shared,
    degraded: bool,
}

impl FakeBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bridge that behaves like the plain fallback.
    pub fn degraded() -> Self {
        Self {
            degraded: true,
            ..Self::default()
        }
    }

    pub fn counts(&self) -> FakeCounts {
        lock(&self.state).counts.clone()
    }

    pub fn has_session(&self, name: &str) -> bool {
        lock(&self.state).sessions.contains(name)
    }

    /// Pretend a multiplexer session survived from an earlier server run.
    pub fn add_existing_session(&self, name: &str) {
        lock(&self.state).sessions.insert(name.to_string());
    }

    pub fn set_scrollback(&self, name: &str, data: impl Into<Bytes>) {
        lock(&self.state)
            .scrollback
            .insert(name.to_string(), data.into());
    }

    /// Output every later attach to `name` prints before anything else.
    pub fn set_attach_output(&self, name: &str, data: impl Into<Bytes>) {
        lock(&self.state)
            .attach_output
            .insert(name.to_string(), data.into());
    }

    pub fn fail_next_spawn(&self) {
        lock(&self.state).fail_next_spawn = true;
    }

    pub fn set_fail_destroy(&self, fail: bool) {
        lock(&self.state).fail_destroy = fail;
    }

    /// Everything written to processes attached to `name`.
    pub fn writes(&self, name: &str) -> Vec<u8> {
        lock(&self.state)
            .writes
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn resizes(&self) -> Vec<(String, u16, u16)> {
        lock(&self.state).resizes.clone()
    }

    pub fn is_running(&self, name: &str) -> bool {
        lock(&self.state).processes.contains_key(name)
    }

    /// Push output from the process attached to `name`. Returns false if none is running.
    pub async fn emit(&self, name: &str, data: &[u8]) -> bool {
        let sender = lock(&self.state)
            .processes
            .get(name)
            .map(|p| p.output.clone());
        match sender {
            Some(sender) => sender.send(Bytes::copy_from_slice(data)).await.is_ok(),
            None => false,
        }
    }

    /// End the process attached to `name` as if the shell exited.
    pub fn exit(&self, name: &str, code: Option<u32>) -> bool {
        let io = lock(&self.state).processes.remove(name);
        match io {
            Some(io) => {
                drop(io.output);
                let _ = io.exit.send(code);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ProcessBridge for FakeBridge {
    async fn ensure_session(
        &self,
        name: &str,
        _cols: u16,
        _rows: u16,
        _cwd: Option<&Path>,
    ) -> Result<MultiplexerSession> {
        let mut state = lock(&self.state);
        state.counts.ensure += 1;
        let created = if self.degraded {
            true
        } else {
            state.sessions.insert(name.to_string())
        };
        Ok(MultiplexerSession {
            name: name.to_string(),
            created,
        })
    }

    async fn session_exists(&self, name: &str) -> Result<bool> {
        Ok(!self.degraded && lock(&self.state).sessions.contains(name))
    }

    async fn spawn_attached(
        &self,
        name: &str,
        _cols: u16,
        _rows: u16,
        _cwd: Option<&Path>,
    ) -> Result<SpawnedProcess> {
        let mut state = lock(&self.state);
        state.counts.spawn += 1;
        if std::mem::take(&mut state.fail_next_spawn) {
            return Err(TetherError::external("injected spawn failure"));
        }

        let (output_tx, output_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = oneshot::channel();
        if let Some(redraw) = state.attach_output.get(name) {
            let _ = output_tx.try_send(redraw.clone());
        }
        state.next_generation += 1;
        let generation = state.next_generation;
        state.processes.insert(
            name.to_string(),
            FakeProcessIo {
                generation,
                output: output_tx,
                exit: exit_tx,
            },
        );

        Ok(SpawnedProcess {
            handle: Box::new(FakeProcess {
                name: name.to_string(),
                generation,
                state: self.state.clone(),
            }),
            output: output_rx,
            exit: exit_rx,
        })
    }

    async fn capture_scrollback(&self, name: &str) -> Result<Bytes> {
        let mut state = lock(&self.state);
        state.counts.capture += 1;
        if self.degraded || !state.sessions.contains(name) {
            return Err(TetherError::NotFound {
                kind: "multiplexer session",
                id: name.to_string(),
            });
        }
        Ok(state.scrollback.get(name).cloned().unwrap_or_default())
    }

    async fn destroy_session(&self, name: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.counts.destroy += 1;
        if state.fail_destroy {
            return Err(TetherError::external("injected destroy failure"));
        }
        state.sessions.remove(name);
        state.scrollback.remove(name);
        Ok(())
    }

    fn is_degraded(&self) -> bool {
        self.degraded
    }

    fn backend_name(&self) -> &str {
        if self.degraded {
            "fake-plain"
        } else {
            "fake-tmux"
        }
    }
}

struct FakeProcess {
    name: String,
    generation: u64,
    state: Shared,
}

impl ProcessHandle for FakeProcess {
    fn write(&self, data: &[u8]) -> Result<()> {
        lock(&self.state)
            .writes
            .entry(self.name.clone())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let mut state = lock(&self.state);
        state.counts.resize += 1;
        state.resizes.push((self.name.clone(), cols, rows));
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.counts.kill += 1;
        let current = state
            .processes
            .get(&self.name)
            .is_some_and(|p| p.generation == self.generation);
        if current {
            if let Some(io) = state.processes.remove(&self.name) {
                drop(io.output);
                let _ = io.exit.send(None);
            }
        }
        Ok(())
    }
}
