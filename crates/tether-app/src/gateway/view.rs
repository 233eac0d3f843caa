//! One connection's view of one terminal.
//!
//! A view created by `create-terminal` starts in [`ViewState::Streaming`].
//! A restored view starts in [`ViewState::Restoring`] holding the snapshot;
//! its forwarder queues the replay frame first ([`ViewState::ReplayDelivered`])
//! and moves to [`ViewState::Streaming`] with the first live chunk after that.

use bytes::Bytes;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tether_terminal::TerminalEvent;
use tether_types::TerminalId;

use super::protocol::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    /// Snapshot not yet delivered; live output is withheld
    Restoring,
    ReplayDelivered,
    Streaming,
}

pub struct View {
    terminal_id: TerminalId,
    state: ViewState,
    /// Pending snapshot while `Restoring`
    replay: Option<Bytes>,
    decoder: Utf8Stream,
}

impl View {
    pub fn streaming(terminal_id: impl Into<TerminalId>) -> Self {
        Self {
            terminal_id: terminal_id.into(),
            state: ViewState::Streaming,
            replay: None,
            decoder: Utf8Stream::default(),
        }
    }

    pub fn restoring(terminal_id: impl Into<TerminalId>, snapshot: Bytes) -> Self {
        Self {
            terminal_id: terminal_id.into(),
            state: ViewState::Restoring,
            replay: Some(snapshot),
            decoder: Utf8Stream::default(),
        }
    }

    pub fn state(&self) -> ViewState {
        self.state
    }

    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    /// The replay frame, once, leaving `Restoring`.
    pub fn deliver_replay(&mut self) -> Option<ServerMessage> {
        if self.state != ViewState::Restoring {
            return None;
        }
        let snapshot = self.replay.take().unwrap_or_default();
        self.state = ViewState::ReplayDelivered;
        Some(ServerMessage::TerminalReplay {
            terminal_id: self.terminal_id.clone(),
            data: String::from_utf8_lossy(&snapshot).into_owned(),
        })
    }

    /// Frame for a live output chunk, if any should be sent.
    pub fn on_output(&mut self, chunk: &Bytes) -> Option<ServerMessage> {
        match self.state {
            ViewState::Restoring => return None,
            ViewState::ReplayDelivered => {
                debug!(terminal_id = %self.terminal_id, "first live output after replay");
                self.state = ViewState::Streaming;
            }
            ViewState::Streaming => {}
        }
        let data = self.decoder.decode(chunk);
        if data.is_empty() {
            return None;
        }
        Some(ServerMessage::TerminalOutput {
            terminal_id: self.terminal_id.clone(),
            data,
        })
    }

    pub fn on_exit(&self, exit_code: Option<u32>) -> ServerMessage {
        ServerMessage::TerminalExited {
            terminal_id: self.terminal_id.clone(),
            exit_code,
        }
    }
}

/// Forward terminal events to a connection until the terminal exits, its
/// channel closes or the connection goes away.
///
/// A restoring view sends its replay before reading `rx`, so output that
/// queued up meanwhile follows the snapshot. `out` is bounded: while the
/// socket is slow this task waits, the broadcast channel overflows and the
/// skipped chunks are dropped for this viewer only.
pub fn spawn_forwarder(
    mut view: View,
    mut rx: broadcast::Receiver<TerminalEvent>,
    out: mpsc::Sender<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(replay) = view.deliver_replay() {
            if out.send(replay).await.is_err() {
                return;
            }
        }
        loop {
            match rx.recv().await {
                Ok(TerminalEvent::Output(chunk)) => {
                    if let Some(msg) = view.on_output(&chunk) {
                        if out.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(TerminalEvent::Exited(code)) => {
                    let _ = out.send(view.on_exit(code)).await;
                    break;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        terminal_id = %view.terminal_id(),
                        skipped,
                        "viewer lagging, output dropped"
                    );
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!(terminal_id = %view.terminal_id(), "forwarder stopped");
    })
}

/// Incremental UTF-8 decoder that never splits a character across frames.
///
/// An incomplete sequence at the end of a chunk is held back until the next
/// chunk; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);

        let mut out = String::with_capacity(buf.len());
        let mut rest = buf.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[len..];
                        }
                        None => {
                            self.pending = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restoring_withholds_output_until_replay() {
        let mut view = View::restoring("t1", Bytes::from_static(b"history"));
        assert!(view.on_output(&Bytes::from_static(b"redraw")).is_none());

        let replay = view.deliver_replay().unwrap();
        assert_eq!(
            replay,
            ServerMessage::TerminalReplay {
                terminal_id: "t1".into(),
                data: "history".into()
            }
        );
        assert_eq!(view.state(), ViewState::ReplayDelivered);
        assert!(view.deliver_replay().is_none());

        let msg = view.on_output(&Bytes::from_static(b"live")).unwrap();
        assert_eq!(view.state(), ViewState::Streaming);
        assert_eq!(
            msg,
            ServerMessage::TerminalOutput {
                terminal_id: "t1".into(),
                data: "live".into()
            }
        );
    }

    #[test]
    fn test_streaming_view_has_no_replay() {
        let mut view = View::streaming("t1");
        assert!(view.deliver_replay().is_none());
        assert_eq!(view.state(), ViewState::Streaming);
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let mut decoder = Utf8Stream::default();
        let snowman = "\u{2603}".as_bytes();
        assert_eq!(decoder.decode(&[b'a', snowman[0]]), "a");
        assert_eq!(decoder.decode(&snowman[1..]), "\u{2603}");
    }

    #[test]
    fn test_utf8_invalid_bytes_replaced() {
        let mut decoder = Utf8Stream::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[tokio::test]
    async fn test_restoring_forwarder_sends_replay_before_queued_output() {
        let (tx, rx) = broadcast::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        // Output produced while the snapshot was being captured
        tx.send(TerminalEvent::Output(Bytes::from_static(b"late"))).unwrap();

        let handle = spawn_forwarder(
            View::restoring("t1", Bytes::from_static(b"snap")),
            rx,
            out_tx,
        );
        assert_eq!(
            out_rx.recv().await.unwrap(),
            ServerMessage::TerminalReplay {
                terminal_id: "t1".into(),
                data: "snap".into()
            }
        );
        assert_eq!(
            out_rx.recv().await.unwrap(),
            ServerMessage::TerminalOutput {
                terminal_id: "t1".into(),
                data: "late".into()
            }
        );
        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_viewer_queue_stays_bounded() {
        let (tx, rx) = broadcast::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let handle = spawn_forwarder(View::streaming("t1"), rx, out_tx);

        for i in 0..1000 {
            tx.send(TerminalEvent::Output(Bytes::from(format!("{i:04}")))).unwrap();
            tokio::task::yield_now().await;
        }
        tx.send(TerminalEvent::Output(Bytes::from_static(b"tail"))).unwrap();

        let mut frames = Vec::new();
        while let Ok(Some(msg)) =
            tokio::time::timeout(std::time::Duration::from_millis(200), out_rx.recv()).await
        {
            frames.push(msg);
        }
        // The stalled viewer skipped ahead instead of queueing every chunk
        assert!(frames.len() <= 4 + 16 + 1, "queued {} frames", frames.len());
        assert_eq!(
            frames.last(),
            Some(&ServerMessage::TerminalOutput {
                terminal_id: "t1".into(),
                data: "tail".into()
            })
        );
        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_forwarder_stops_after_exit() {
        let (tx, rx) = broadcast::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let handle = spawn_forwarder(View::streaming("t1"), rx, out_tx);

        tx.send(TerminalEvent::Output(Bytes::from_static(b"hi"))).unwrap();
        tx.send(TerminalEvent::Exited(Some(0))).unwrap();
        handle.await.unwrap();

        assert_eq!(
            out_rx.recv().await.unwrap(),
            ServerMessage::TerminalOutput {
                terminal_id: "t1".into(),
                data: "hi".into()
            }
        );
        assert_eq!(
            out_rx.recv().await.unwrap(),
            ServerMessage::TerminalExited {
                terminal_id: "t1".into(),
                exit_code: Some(0)
            }
        );
    }
}
