//! Persistence collaborator interface
//!
//! Row-shaped storage for sessions and terminal records, keyed by string ids.
//! The gateway binary ships a JSON-file implementation; [`MemoryStore`] backs
//! tests and `--store memory` deployments.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{Result, TetherError};
use crate::model::{Layout, Session, TerminalRecord};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: &Session) -> Result<()>;

    async fn find_session(&self, session_id: &str) -> Result<Option<Session>>;

    async fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<Session>>;

    /// Replace the stored layout. Errors with `NotFound` for unknown sessions.
    async fn update_layout(&self, session_id: &str, layout: &Layout) -> Result<()>;

    /// Returns false when the session does not exist.
    async fn rename_session(&self, session_id: &str, name: &str) -> Result<bool>;

    /// Refresh `last_accessed`.
    async fn touch_session(&self, session_id: &str) -> Result<()>;

    async fn delete_session(&self, session_id: &str) -> Result<()>;

    /// Insert or replace a terminal record.
    async fn create_terminal_record(&self, record: &TerminalRecord) -> Result<()>;

    async fn find_terminal_record(&self, terminal_id: &str) -> Result<Option<TerminalRecord>>;

    async fn list_terminal_records(&self, session_id: &str) -> Result<Vec<TerminalRecord>>;

    async fn delete_terminal_record(&self, terminal_id: &str) -> Result<()>;
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
    terminals: RwLock<HashMap<String, TerminalRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn terminal_record_count(&self) -> usize {
        self.terminals.read().await.len()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, session: &Session) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find_session(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<Session>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.owner_user_id == user_id)
            .cloned()
            .collect())
    }

    async fn update_layout(&self, session_id: &str, layout: &Layout) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| TetherError::session_not_found(session_id))?;
        session.layout = layout.clone();
        Ok(())
    }

    async fn rename_session(&self, session_id: &str, name: &str) -> Result<bool> {
        match self.sessions.write().await.get_mut(session_id) {
            Some(session) => {
                session.name = name.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn touch_session(&self, session_id: &str) -> Result<()> {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.last_accessed = Utc::now();
        }
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.sessions.write().await.remove(session_id);
        Ok(())
    }

    async fn create_terminal_record(&self, record: &TerminalRecord) -> Result<()> {
        self.terminals
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn find_terminal_record(&self, terminal_id: &str) -> Result<Option<TerminalRecord>> {
        Ok(self.terminals.read().await.get(terminal_id).cloned())
    }

    async fn list_terminal_records(&self, session_id: &str) -> Result<Vec<TerminalRecord>> {
        Ok(self
            .terminals
            .read()
            .await
            .values()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn delete_terminal_record(&self, terminal_id: &str) -> Result<()> {
        self.terminals.write().await.remove(terminal_id);
        Ok(())
    }
}
