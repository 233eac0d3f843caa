use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TetherError};

pub type UserId = String;
pub type SessionId = String;
pub type TerminalId = String;

/// Allocate a fresh opaque identifier.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Longest id accepted from clients
pub const MAX_ID_LEN: usize = 128;

/// Ids end up in file names and tmux targets, so only `[A-Za-z0-9_-]` is allowed.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// ============================================================================
// Users
// ============================================================================

/// Identity returned by the authentication collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedUser {
    pub user_id: UserId,
    pub username: String,
}

// ============================================================================
// Layout
// ============================================================================

/// A named slot in a session's layout
///
/// `terminal_id` stays `None` until the client's create round-trip completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Panel {
    pub panel_id: String,
    #[serde(default)]
    pub terminal_id: Option<TerminalId>,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layout {
    #[serde(default)]
    pub panels: Vec<Panel>,
    #[serde(default)]
    pub focused_panel_id: Option<String>,
}

impl Layout {
    /// Terminal ids referenced by the layout, in panel order.
    pub fn terminal_ids(&self) -> Vec<TerminalId> {
        self.panels
            .iter()
            .filter_map(|p| p.terminal_id.clone())
            .collect()
    }

    /// Null out every reference to `terminal_id`. Returns true if any panel changed.
    pub fn detach_terminal(&mut self, terminal_id: &str) -> bool {
        let mut changed = false;
        for panel in &mut self.panels {
            if panel.terminal_id.as_deref() == Some(terminal_id) {
                panel.terminal_id = None;
                changed = true;
            }
        }
        changed
    }

    /// Structural checks that don't need the terminal table.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for panel in &self.panels {
            if panel.panel_id.is_empty() {
                return Err(TetherError::invalid("panel id must not be empty"));
            }
            if !seen.insert(panel.panel_id.as_str()) {
                return Err(TetherError::invalid(format!(
                    "duplicate panel id {}",
                    panel.panel_id
                )));
            }
        }
        if let Some(focused) = &self.focused_panel_id {
            if !seen.contains(focused.as_str()) {
                return Err(TetherError::invalid(format!(
                    "focused panel {} is not part of the layout",
                    focused
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Sessions and terminals
// ============================================================================

/// A named, user-owned group of terminals plus a layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub owner_user_id: UserId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub layout: Layout,
}

impl Session {
    pub fn new(owner_user_id: impl Into<UserId>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            owner_user_id: owner_user_id.into(),
            name: name.into(),
            created_at: now,
            last_accessed: now,
            layout: Layout::default(),
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_user_id == user_id
    }
}

/// Lightweight persisted row for a terminal, enough to re-attach after a restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalRecord {
    pub id: TerminalId,
    pub session_id: SessionId,
    pub owner_user_id: UserId,
    #[serde(default)]
    pub panel_id: Option<String>,
    pub multiplexer_name: String,
    pub created_at: DateTime<Utc>,
}
