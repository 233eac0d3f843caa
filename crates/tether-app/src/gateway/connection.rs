//! Per-connection protocol state machine.
//!
//! A connection is unauthenticated until `authenticate` succeeds (or the
//! upgrade request carried a valid token), then serves terminal and session
//! requests one at a time, so input from a single client is applied in order.

use std::collections::HashMap;
use std::ops::ControlFlow;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_types::{AuthenticatedUser, Result, TerminalId, TetherError};

use super::protocol::{ClientMessage, ServerMessage};
use super::routes::AppState;
use super::view::{spawn_forwarder, View};

/// Frames queued per connection before its forwarders wait on the socket
pub const OUTBOUND_CAPACITY: usize = 256;

pub struct Connection {
    state: AppState,
    out: mpsc::Sender<ServerMessage>,
    user: Option<AuthenticatedUser>,
    /// Forwarder task per subscribed terminal
    views: HashMap<TerminalId, JoinHandle<()>>,
}

impl Connection {
    pub fn new(state: AppState, out: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            state,
            out,
            user: None,
            views: HashMap::new(),
        }
    }

    /// A connection whose identity was established during the upgrade.
    pub fn with_user(
        state: AppState,
        out: mpsc::Sender<ServerMessage>,
        user: AuthenticatedUser,
    ) -> Self {
        let mut conn = Self::new(state, out);
        conn.user = Some(user);
        conn
    }

    pub fn user(&self) -> Option<&AuthenticatedUser> {
        self.user.as_ref()
    }

    pub fn subscription_count(&self) -> usize {
        self.views.len()
    }

    /// Handle one text frame. `Break` means the connection should close.
    pub async fn handle_text(&mut self, text: &str) -> ControlFlow<()> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => {
                debug!(error = %e, "unparseable client frame");
                self.send(ServerMessage::Error {
                    message: format!("invalid message: {}", e),
                    code: "INVALID_REQUEST".to_string(),
                })
                .await;
                ControlFlow::Continue(())
            }
        }
    }

    pub async fn handle(&mut self, msg: ClientMessage) -> ControlFlow<()> {
        let Some(user) = self.user.clone() else {
            return match msg {
                ClientMessage::Authenticate { token } => self.authenticate(&token).await,
                _ => {
                    self.send(ServerMessage::AuthFailed {
                        message: "not authenticated".to_string(),
                    })
                    .await;
                    ControlFlow::Break(())
                }
            };
        };
        let user_id = user.user_id.clone();
        let operation = msg.operation();
        debug!(user_id = %user_id, operation, "client message");

        match msg {
            ClientMessage::Authenticate { .. } => {
                self.send(ServerMessage::Authenticated {
                    user_id: user.user_id,
                    username: user.username,
                })
                .await
            }
            ClientMessage::Ping => self.send(ServerMessage::Pong).await,

            ClientMessage::CreateTerminal {
                session_id,
                cols,
                rows,
                panel_id,
            } => {
                if let Err(e) = self
                    .create_terminal(&user_id, &session_id, cols, rows, panel_id)
                    .await
                {
                    self.send(ServerMessage::terminal_error(&e, None, operation)).await;
                }
            }
            ClientMessage::RestoreTerminal {
                terminal_id,
                session_id,
                cols,
                rows,
            } => {
                if let Err(e) = self
                    .restore_terminal(&user_id, &terminal_id, &session_id, cols, rows)
                    .await
                {
                    let reply = ServerMessage::terminal_error(&e, Some(&terminal_id), operation);
                    self.send(reply).await;
                }
            }
            ClientMessage::TerminalInput { terminal_id, input } => {
                if let Err(e) = self.terminal_input(&user_id, &terminal_id, &input) {
                    let reply = ServerMessage::terminal_error(&e, Some(&terminal_id), operation);
                    self.send(reply).await;
                }
            }
            ClientMessage::ResizeTerminal {
                terminal_id,
                cols,
                rows,
            } => {
                if let Err(e) = self.resize_terminal(&user_id, &terminal_id, cols, rows) {
                    let reply = ServerMessage::terminal_error(&e, Some(&terminal_id), operation);
                    self.send(reply).await;
                }
            }
            ClientMessage::CloseTerminal {
                terminal_id,
                session_id,
            } => {
                if let Err(e) = self
                    .close_terminal(&user_id, &terminal_id, session_id.as_deref())
                    .await
                {
                    let reply = ServerMessage::terminal_error(&e, Some(&terminal_id), operation);
                    self.send(reply).await;
                }
            }

            ClientMessage::GetSessionLayout { session_id } => {
                let reply = match self.state.directory.get(&user_id, &session_id).await {
                    Ok(Some(session)) => ServerMessage::SessionLayout {
                        session_id,
                        layout: session.layout,
                    },
                    Ok(None) => ServerMessage::session_error(
                        &TetherError::session_not_found(&session_id),
                        Some(&session_id),
                        operation,
                    ),
                    Err(e) => ServerMessage::session_error(&e, Some(&session_id), operation),
                };
                self.send(reply).await;
            }
            ClientMessage::UpdateSessionLayout { session_id, layout } => {
                let reply = match self
                    .state
                    .directory
                    .update_layout(&user_id, &session_id, layout)
                    .await
                {
                    Ok(()) => ServerMessage::LayoutUpdated { session_id },
                    Err(e) => ServerMessage::session_error(&e, Some(&session_id), operation),
                };
                self.send(reply).await;
            }
            ClientMessage::ListSessions => {
                let reply = match self.state.directory.list_for_user(&user_id).await {
                    Ok(sessions) => ServerMessage::SessionList { sessions },
                    Err(e) => ServerMessage::session_error(&e, None, operation),
                };
                self.send(reply).await;
            }
            ClientMessage::CreateSession { name } => {
                let name = name.unwrap_or_default();
                let reply = match self.state.directory.create(&user_id, &name).await {
                    Ok(session) => ServerMessage::SessionCreated { session },
                    Err(e) => ServerMessage::session_error(&e, None, operation),
                };
                self.send(reply).await;
            }
            ClientMessage::RenameSession { session_id, name } => {
                let reply = match self.state.directory.rename(&user_id, &session_id, &name).await {
                    Ok(true) => ServerMessage::SessionRenamed {
                        session_id,
                        name: name.trim().to_string(),
                    },
                    Ok(false) => ServerMessage::session_error(
                        &TetherError::session_not_found(&session_id),
                        Some(&session_id),
                        operation,
                    ),
                    Err(e) => ServerMessage::session_error(&e, Some(&session_id), operation),
                };
                self.send(reply).await;
            }
            ClientMessage::DeleteSession { session_id } => {
                let reply = match self.state.directory.delete(&user_id, &session_id).await {
                    Ok(true) => ServerMessage::SessionDeleted { session_id },
                    Ok(false) => ServerMessage::session_error(
                        &TetherError::session_not_found(&session_id),
                        Some(&session_id),
                        operation,
                    ),
                    Err(e) => ServerMessage::session_error(&e, Some(&session_id), operation),
                };
                self.send(reply).await;
            }
        }
        ControlFlow::Continue(())
    }

    async fn authenticate(&mut self, token: &str) -> ControlFlow<()> {
        match self.state.auth.validate_token(token).await {
            Some(user) => {
                info!(user_id = %user.user_id, "connection authenticated");
                self.send(ServerMessage::Authenticated {
                    user_id: user.user_id.clone(),
                    username: user.username.clone(),
                })
                .await;
                self.user = Some(user);
                ControlFlow::Continue(())
            }
            None => {
                self.send(ServerMessage::AuthFailed {
                    message: "invalid token".to_string(),
                })
                .await;
                ControlFlow::Break(())
            }
        }
    }

    async fn create_terminal(
        &mut self,
        user_id: &str,
        session_id: &str,
        cols: u16,
        rows: u16,
        panel_id: Option<String>,
    ) -> Result<()> {
        self.require_session(user_id, session_id).await?;
        let terminal = self
            .state
            .registry
            .create(user_id, session_id, cols, rows, panel_id)
            .await?;

        let rx = terminal.subscribe();
        self.send(ServerMessage::TerminalCreated {
            terminal_id: terminal.id().to_string(),
            session_id: session_id.to_string(),
        })
        .await;
        let handle = spawn_forwarder(View::streaming(terminal.id()), rx, self.out.clone());
        self.track(terminal.id(), handle);
        Ok(())
    }

    async fn restore_terminal(
        &mut self,
        user_id: &str,
        terminal_id: &str,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<()> {
        self.require_session(user_id, session_id).await?;
        let terminal = self
            .state
            .registry
            .restore(terminal_id, user_id, session_id, cols, rows)
            .await?;

        self.send(ServerMessage::TerminalRestored {
            terminal_id: terminal.id().to_string(),
            session_id: session_id.to_string(),
        })
        .await;

        // Subscribed before capture: output racing the snapshot is queued behind
        // the replay and may repeat its tail, but is never lost.
        let rx = terminal.subscribe();
        let snapshot = self.state.registry.replay_for(&terminal).await;
        let view = View::restoring(terminal.id(), snapshot);
        let handle = spawn_forwarder(view, rx, self.out.clone());
        self.track(terminal.id(), handle);

        Ok(())
    }

    fn terminal_input(&self, user_id: &str, terminal_id: &str, input: &str) -> Result<()> {
        match self.state.registry.get(terminal_id) {
            Some(terminal) if !terminal.is_owned_by(user_id) => Err(foreign_terminal(terminal_id)),
            Some(_) => self.state.registry.write(terminal_id, input.as_bytes()),
            None => Ok(()),
        }
    }

    fn resize_terminal(
        &self,
        user_id: &str,
        terminal_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<()> {
        match self.state.registry.get(terminal_id) {
            Some(terminal) if !terminal.is_owned_by(user_id) => Err(foreign_terminal(terminal_id)),
            Some(_) => self.state.registry.resize(terminal_id, cols, rows),
            None => Ok(()),
        }
    }

    async fn close_terminal(
        &mut self,
        user_id: &str,
        terminal_id: &str,
        session_id: Option<&str>,
    ) -> Result<()> {
        let owner = self.state.registry.owner_of(terminal_id).await?;
        if let Some((owner_id, _)) = &owner {
            if owner_id != user_id {
                return Err(foreign_terminal(terminal_id));
            }
        }

        if let Some(handle) = self.views.remove(terminal_id) {
            handle.abort();
        }
        let closed = self.state.registry.close(terminal_id).await;

        let layout_session = session_id
            .map(str::to_string)
            .or_else(|| owner.map(|(_, session)| session));
        if let Some(session_id) = layout_session {
            match self
                .state
                .directory
                .detach_terminal(user_id, &session_id, terminal_id)
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(
                    terminal_id = %terminal_id,
                    error = %e,
                    "failed to detach terminal from layout"
                ),
            }
        }

        closed?;
        self.send(ServerMessage::TerminalClosed {
            terminal_id: terminal_id.to_string(),
        })
        .await;
        Ok(())
    }

    async fn require_session(&self, user_id: &str, session_id: &str) -> Result<()> {
        match self.state.directory.get(user_id, session_id).await? {
            Some(_) => Ok(()),
            None => Err(TetherError::session_not_found(session_id)),
        }
    }

    fn track(&mut self, terminal_id: &str, handle: JoinHandle<()>) {
        self.views.retain(|_, h| !h.is_finished());
        if let Some(previous) = self.views.insert(terminal_id.to_string(), handle) {
            previous.abort();
        }
    }

    async fn send(&self, msg: ServerMessage) {
        if self.out.send(msg).await.is_err() {
            debug!("connection writer gone, dropping frame");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for (_, handle) in self.views.drain() {
            handle.abort();
        }
    }
}

fn foreign_terminal(terminal_id: &str) -> TetherError {
    TetherError::unauthorized(format!("terminal {} belongs to another user", terminal_id))
}
