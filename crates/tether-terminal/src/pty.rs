/// PTY process spawning shared by both bridges
use bytes::Bytes;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use tether_types::{Result, TetherError};

use super::bridge::{ProcessHandle, SpawnedProcess};

/// Output chunks buffered between the reader thread and the async pump.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Input writes queued for the writer thread before `write` starts failing.
const INPUT_CHANNEL_CAPACITY: usize = 256;

const READ_BUFFER_SIZE: usize = 16 * 1024;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the PTY master, the input queue and a killer for the child.
///
/// Writes go through a dedicated thread, so a child that stops reading stdin
/// only fills the queue; resize and kill never wait behind a write.
pub struct PtyProcess {
    label: String,
    master: Mutex<Box<dyn MasterPty + Send>>,
    input: mpsc::Sender<Bytes>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl ProcessHandle for PtyProcess {
    fn write(&self, data: &[u8]) -> Result<()> {
        match self.input.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TetherError::external(format!(
                "input backlog full for {}",
                self.label
            ))),
            Err(TrySendError::Closed(_)) => Err(TetherError::external(format!(
                "PTY writer for {} has stopped",
                self.label
            ))),
        }
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        lock(&self.master)
            .resize(size(cols, rows))
            .map_err(|e| TetherError::external(format!("PTY resize failed: {e}")))
    }

    fn kill(&self) -> Result<()> {
        debug!(process = %self.label, "killing PTY process");
        lock(&self.killer).kill()?;
        Ok(())
    }
}

fn size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Open a PTY, spawn `cmd` on it, and start the reader, writer and waiter threads.
///
/// PTY reads and writes are blocking, so each process gets a dedicated OS
/// thread per direction, joined to the async side by bounded channels. A
/// third thread waits for the child and reports its exit code.
pub fn spawn(label: &str, cmd: CommandBuilder, cols: u16, rows: u16) -> Result<SpawnedProcess> {
    let pty_system = native_pty_system();

    let pair = pty_system
        .openpty(size(cols, rows))
        .map_err(|e| TetherError::external(format!("failed to open PTY: {e}")))?;

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| TetherError::external(format!("failed to spawn command: {e}")))?;
    // Keep only the master side so the reader sees EOF when the child exits.
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| TetherError::external(format!("failed to clone reader: {e}")))?;

    let writer = pair
        .master
        .take_writer()
        .map_err(|e| TetherError::external(format!("failed to take writer: {e}")))?;

    let killer = child.clone_killer();

    let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
    let (exit_tx, exit_rx) = oneshot::channel();

    let handle = PtyProcess {
        label: label.to_string(),
        master: Mutex::new(pair.master),
        input: input_tx,
        killer: Mutex::new(killer),
    };

    let reader_label = label.to_string();
    if let Err(e) = std::thread::Builder::new()
        .name(format!("pty-read-{}", label))
        .spawn(move || read_loop(reader_label, reader, output_tx))
    {
        let _ = handle.kill();
        return Err(e.into());
    }

    let writer_label = label.to_string();
    if let Err(e) = std::thread::Builder::new()
        .name(format!("pty-write-{}", label))
        .spawn(move || write_loop(writer_label, writer, input_rx))
    {
        let _ = handle.kill();
        return Err(e.into());
    }

    let waiter_label = label.to_string();
    let spawned_waiter = std::thread::Builder::new()
        .name(format!("pty-wait-{}", label))
        .spawn(move || {
            let code = match child.wait() {
                Ok(status) => Some(status.exit_code()),
                Err(e) => {
                    warn!(process = %waiter_label, error = %e, "failed to wait for PTY child");
                    None
                }
            };
            let _ = exit_tx.send(code);
        });

    if let Err(e) = spawned_waiter {
        let _ = handle.kill();
        return Err(e.into());
    }

    Ok(SpawnedProcess {
        handle: Box::new(handle),
        output: output_rx,
        exit: exit_rx,
    })
}

fn read_loop(label: String, mut reader: Box<dyn Read + Send>, output: mpsc::Sender<Bytes>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO is how Linux reports a closed PTY
            Err(_) => break,
        };
        if output.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
            break;
        }
    }
    debug!(process = %label, "PTY reader finished");
}

/// Drain queued input into the PTY until the handle is dropped or the PTY closes.
fn write_loop(label: String, mut writer: Box<dyn Write + Send>, mut input: mpsc::Receiver<Bytes>) {
    while let Some(data) = input.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            debug!(process = %label, error = %e, "PTY write failed");
            break;
        }
    }
    debug!(process = %label, "PTY writer finished");
}
