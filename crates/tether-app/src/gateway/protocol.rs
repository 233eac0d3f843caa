use serde::{Deserialize, Serialize};

use tether_types::{Layout, Session, SessionId, TerminalId, TetherError};

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Authenticate {
        token: String,
    },

    // Terminals
    CreateTerminal {
        session_id: SessionId,
        #[serde(default)]
        cols: u16,
        #[serde(default)]
        rows: u16,
        #[serde(default)]
        panel_id: Option<String>,
    },
    RestoreTerminal {
        terminal_id: TerminalId,
        session_id: SessionId,
        #[serde(default)]
        cols: u16,
        #[serde(default)]
        rows: u16,
    },
    TerminalInput {
        terminal_id: TerminalId,
        input: String,
    },
    ResizeTerminal {
        terminal_id: TerminalId,
        cols: u16,
        rows: u16,
    },
    CloseTerminal {
        terminal_id: TerminalId,
        #[serde(default)]
        session_id: Option<SessionId>,
    },

    // Sessions
    GetSessionLayout {
        session_id: SessionId,
    },
    UpdateSessionLayout {
        session_id: SessionId,
        layout: Layout,
    },
    ListSessions,
    CreateSession {
        #[serde(default)]
        name: Option<String>,
    },
    RenameSession {
        session_id: SessionId,
        name: String,
    },
    DeleteSession {
        session_id: SessionId,
    },

    Ping,
}

impl ClientMessage {
    /// Wire name of the message, echoed back in error frames.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::CreateTerminal { .. } => "create-terminal",
            Self::RestoreTerminal { .. } => "restore-terminal",
            Self::TerminalInput { .. } => "terminal-input",
            Self::ResizeTerminal { .. } => "resize-terminal",
            Self::CloseTerminal { .. } => "close-terminal",
            Self::GetSessionLayout { .. } => "get-session-layout",
            Self::UpdateSessionLayout { .. } => "update-session-layout",
            Self::ListSessions => "list-sessions",
            Self::CreateSession { .. } => "create-session",
            Self::RenameSession { .. } => "rename-session",
            Self::DeleteSession { .. } => "delete-session",
            Self::Ping => "ping",
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    // Authentication
    Authenticated {
        user_id: String,
        username: String,
    },
    AuthFailed {
        message: String,
    },

    // Terminal lifecycle and output
    TerminalCreated {
        terminal_id: TerminalId,
        session_id: SessionId,
    },
    TerminalRestored {
        terminal_id: TerminalId,
        session_id: SessionId,
    },
    /// Full-screen replacement, sent once per restore
    TerminalReplay {
        terminal_id: TerminalId,
        data: String,
    },
    TerminalOutput {
        terminal_id: TerminalId,
        data: String,
    },
    TerminalExited {
        terminal_id: TerminalId,
        #[serde(default)]
        exit_code: Option<u32>,
    },
    TerminalClosed {
        terminal_id: TerminalId,
    },
    TerminalError {
        message: String,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        terminal_id: Option<TerminalId>,
        operation: String,
    },

    // Sessions
    SessionLayout {
        session_id: SessionId,
        layout: Layout,
    },
    LayoutUpdated {
        session_id: SessionId,
    },
    SessionList {
        sessions: Vec<Session>,
    },
    SessionCreated {
        session: Session,
    },
    SessionRenamed {
        session_id: SessionId,
        name: String,
    },
    SessionDeleted {
        session_id: SessionId,
    },
    SessionError {
        message: String,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        operation: String,
    },

    /// Frame that could not be parsed
    Error {
        message: String,
        code: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn terminal_error(
        err: &TetherError,
        terminal_id: Option<&str>,
        operation: &str,
    ) -> Self {
        Self::TerminalError {
            message: err.to_string(),
            code: err.code().to_string(),
            terminal_id: terminal_id.map(str::to_string),
            operation: operation.to_string(),
        }
    }

    pub fn session_error(err: &TetherError, session_id: Option<&str>, operation: &str) -> Self {
        Self::SessionError {
            message: err.to_string(),
            code: err.code().to_string(),
            session_id: session_id.map(str::to_string),
            operation: operation.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_create_terminal_with_defaults() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "create-terminal", "sessionId": "s1"})).unwrap();
        assert_eq!(
            msg,
            ClientMessage::CreateTerminal {
                session_id: "s1".into(),
                cols: 0,
                rows: 0,
                panel_id: None,
            }
        );
        assert_eq!(msg.operation(), "create-terminal");
    }

    #[test]
    fn test_parse_unit_variants() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"list-sessions"}"#).unwrap();
        assert_eq!(msg, ClientMessage::ListSessions);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"format-disk"}"#).is_err());
    }

    #[test]
    fn test_server_message_wire_shape() {
        let value = serde_json::to_value(ServerMessage::TerminalReplay {
            terminal_id: "t1".into(),
            data: "$ ".into(),
        })
        .unwrap();
        assert_eq!(value, json!({"type": "terminal-replay", "terminalId": "t1", "data": "$ "}));

        let value = serde_json::to_value(ServerMessage::terminal_error(
            &TetherError::terminal_not_found("t9"),
            Some("t9"),
            "restore-terminal",
        ))
        .unwrap();
        assert_eq!(value["type"], "terminal-error");
        assert_eq!(value["code"], "NOT_FOUND");
        assert_eq!(value["terminalId"], "t9");
        assert_eq!(value["operation"], "restore-terminal");
    }

    #[test]
    fn test_session_error_omits_missing_id() {
        let value = serde_json::to_value(ServerMessage::session_error(
            &TetherError::invalid("bad"),
            None,
            "create-session",
        ))
        .unwrap();
        assert!(value.get("sessionId").is_none());
    }
}
