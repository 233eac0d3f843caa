//! Session directory
//!
//! User-owned sessions and their layouts, fronted by a small LRU cache. All
//! terminal teardown goes through the [`TerminalRegistry`].

use chrono::Utc;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use tether_terminal::TerminalRegistry;
use tether_types::{Layout, Result, Session, SessionStore, TetherError};

const DEFAULT_SESSION_NAME: &str = "New Session";

/// Passes `delete_all` makes over sessions whose deletion failed
const DELETE_ATTEMPTS: usize = 3;

pub struct SessionDirectory {
    store: Arc<dyn SessionStore>,
    registry: TerminalRegistry,
    cache: Mutex<LruCache<String, Session>>,
    /// Serializes layout read-modify-write cycles
    layout_lock: tokio::sync::Mutex<()>,
}

impl SessionDirectory {
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: TerminalRegistry,
        cache_size: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            registry,
            cache: Mutex::new(LruCache::new(capacity)),
            layout_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &TerminalRegistry {
        &self.registry
    }

    pub async fn create(&self, user_id: &str, name: &str) -> Result<Session> {
        let name = name.trim();
        let name = if name.is_empty() { DEFAULT_SESSION_NAME } else { name };
        let session = Session::new(user_id, name);
        self.store.create_session(&session).await?;
        self.cache_put(&session);
        info!(session_id = %session.id, user_id = %user_id, "session created");
        Ok(session)
    }

    /// Fetch a session and refresh its `last_accessed`.
    pub async fn get(&self, user_id: &str, session_id: &str) -> Result<Option<Session>> {
        let Some(mut session) = self.load(session_id).await? else {
            return Ok(None);
        };
        check_owner(&session, user_id)?;

        self.store.touch_session(session_id).await?;
        session.last_accessed = Utc::now();
        self.cache_put(&session);
        Ok(Some(session))
    }

    /// Sessions of `user_id`, most recently accessed first.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Session>> {
        let mut sessions = self.store.list_sessions_for_user(user_id).await?;
        sessions.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        Ok(sessions)
    }

    /// Replace the layout wholesale.
    ///
    /// Every referenced terminal must belong to this session; terminals the
    /// registry has never heard of are accepted.
    pub async fn update_layout(
        &self,
        user_id: &str,
        session_id: &str,
        layout: Layout,
    ) -> Result<()> {
        layout.validate()?;
        let _guard = self.layout_lock.lock().await;
        let mut session = self.owned(user_id, session_id).await?;

        for terminal_id in layout.terminal_ids() {
            if let Some((owner, terminal_session)) = self.registry.owner_of(&terminal_id).await? {
                if owner != user_id {
                    return Err(TetherError::unauthorized(format!(
                        "terminal {} belongs to another user",
                        terminal_id
                    )));
                }
                if terminal_session != session_id {
                    return Err(TetherError::invalid(format!(
                        "terminal {} belongs to session {}",
                        terminal_id, terminal_session
                    )));
                }
            }
        }

        self.store.update_layout(session_id, &layout).await?;
        session.layout = layout;
        self.cache_put(&session);
        debug!(session_id = %session_id, panels = session.layout.panels.len(), "layout updated");
        Ok(())
    }

    /// Returns false when the session does not exist.
    pub async fn rename(&self, user_id: &str, session_id: &str, name: &str) -> Result<bool> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TetherError::invalid("session name must not be empty"));
        }
        let Some(mut session) = self.load(session_id).await? else {
            return Ok(false);
        };
        check_owner(&session, user_id)?;

        if !self.store.rename_session(session_id, name).await? {
            self.cache_evict(session_id);
            return Ok(false);
        }
        session.name = name.to_string();
        self.cache_put(&session);
        Ok(true)
    }

    /// Null out every panel reference to `terminal_id`. Returns whether the layout changed.
    pub async fn detach_terminal(
        &self,
        user_id: &str,
        session_id: &str,
        terminal_id: &str,
    ) -> Result<bool> {
        let _guard = self.layout_lock.lock().await;
        let mut session = self.owned(user_id, session_id).await?;
        if !session.layout.detach_terminal(terminal_id) {
            return Ok(false);
        }
        self.store.update_layout(session_id, &session.layout).await?;
        self.cache_put(&session);
        Ok(true)
    }

    /// Delete a session and close every terminal it owns.
    ///
    /// Terminal teardown failures are logged; the row is removed regardless.
    /// Returns false when the session does not exist.
    pub async fn delete(&self, user_id: &str, session_id: &str) -> Result<bool> {
        let Some(session) = self.load(session_id).await? else {
            return Ok(false);
        };
        check_owner(&session, user_id)?;

        for terminal_id in session.layout.terminal_ids() {
            // A stale layout entry must never take down somebody else's terminal.
            match self.registry.owner_of(&terminal_id).await {
                Ok(Some((_, owner_session))) if owner_session == session_id => {
                    if let Err(e) = self.registry.close(&terminal_id).await {
                        warn!(
                            terminal_id = %terminal_id,
                            error = %e,
                            "failed to close layout terminal"
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(terminal_id = %terminal_id, error = %e, "failed to look up terminal")
                }
            }
        }
        let swept = self.registry.close_session_terminals(session_id).await;

        self.cache_evict(session_id);
        self.store.delete_session(session_id).await?;
        info!(session_id = %session_id, swept, "session deleted");
        Ok(true)
    }

    /// Delete every session of `user_id`, then close any terminal of theirs
    /// still alive.
    ///
    /// Sessions that fail to delete are retried on the next pass, up to
    /// [`DELETE_ATTEMPTS`] passes. Returns how many sessions were deleted.
    pub async fn delete_all(&self, user_id: &str) -> usize {
        let mut pending: Vec<String> = match self.store.list_sessions_for_user(user_id).await {
            Ok(sessions) => sessions.into_iter().map(|s| s.id).collect(),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "failed to list sessions");
                Vec::new()
            }
        };

        let mut deleted = 0;
        for attempt in 1..=DELETE_ATTEMPTS {
            if pending.is_empty() {
                break;
            }
            let mut failed = Vec::new();
            for session_id in pending {
                match self.delete(user_id, &session_id).await {
                    Ok(true) => deleted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(
                            session_id = %session_id,
                            attempt,
                            error = %e,
                            "failed to delete session"
                        );
                        failed.push(session_id);
                    }
                }
            }
            pending = failed;
        }
        if !pending.is_empty() {
            error!(
                user_id = %user_id,
                remaining = ?pending,
                "sessions left behind after delete-all"
            );
        }

        let stragglers = self.registry.close_user_terminals(user_id).await;
        if stragglers > 0 {
            debug!(user_id = %user_id, count = stragglers, "closed terminals outside any session");
        }
        deleted
    }

    async fn owned(&self, user_id: &str, session_id: &str) -> Result<Session> {
        let session = self
            .load(session_id)
            .await?
            .ok_or_else(|| TetherError::session_not_found(session_id))?;
        check_owner(&session, user_id)?;
        Ok(session)
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let cached = self.lock_cache().get(session_id).cloned();
        if cached.is_some() {
            return Ok(cached);
        }
        let session = self.store.find_session(session_id).await?;
        if let Some(session) = &session {
            self.cache_put(session);
        }
        Ok(session)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, LruCache<String, Session>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache_put(&self, session: &Session) {
        self.lock_cache().put(session.id.clone(), session.clone());
    }

    fn cache_evict(&self, session_id: &str) {
        self.lock_cache().pop(session_id);
    }
}

fn check_owner(session: &Session, user_id: &str) -> Result<()> {
    if session.is_owned_by(user_id) {
        Ok(())
    } else {
        Err(TetherError::unauthorized(format!(
            "session {} belongs to another user",
            session.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_terminal::testing::FakeBridge;
    use tether_terminal::RegistryConfig;
    use tether_types::{MemoryStore, TerminalRecord};

    fn directory() -> SessionDirectory {
        directory_on(Arc::new(MemoryStore::new()))
    }

    fn directory_on(store: Arc<dyn SessionStore>) -> SessionDirectory {
        let registry = TerminalRegistry::new(
            Arc::new(FakeBridge::default()),
            store.clone(),
            RegistryConfig::default(),
        );
        SessionDirectory::new(store, registry, 4)
    }

    /// Memory store whose session deletes fail on demand
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        /// Remaining deletes to fail, whatever the session
        transient_failures: AtomicUsize,
        /// Session whose delete always fails
        stuck: Mutex<Option<String>>,
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn create_session(&self, session: &Session) -> Result<()> {
            self.inner.create_session(session).await
        }
        async fn find_session(&self, session_id: &str) -> Result<Option<Session>> {
            self.inner.find_session(session_id).await
        }
        async fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<Session>> {
            self.inner.list_sessions_for_user(user_id).await
        }
        async fn update_layout(&self, session_id: &str, layout: &Layout) -> Result<()> {
            self.inner.update_layout(session_id, layout).await
        }
        async fn rename_session(&self, session_id: &str, name: &str) -> Result<bool> {
            self.inner.rename_session(session_id, name).await
        }
        async fn touch_session(&self, session_id: &str) -> Result<()> {
            self.inner.touch_session(session_id).await
        }
        async fn delete_session(&self, session_id: &str) -> Result<()> {
            let stuck = self.stuck.lock().unwrap().as_deref() == Some(session_id);
            let transient = self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if stuck || transient {
                return Err(TetherError::storage("disk busy"));
            }
            self.inner.delete_session(session_id).await
        }
        async fn create_terminal_record(&self, record: &TerminalRecord) -> Result<()> {
            self.inner.create_terminal_record(record).await
        }
        async fn find_terminal_record(&self, terminal_id: &str) -> Result<Option<TerminalRecord>> {
            self.inner.find_terminal_record(terminal_id).await
        }
        async fn list_terminal_records(&self, session_id: &str) -> Result<Vec<TerminalRecord>> {
            self.inner.list_terminal_records(session_id).await
        }
        async fn delete_terminal_record(&self, terminal_id: &str) -> Result<()> {
            self.inner.delete_terminal_record(terminal_id).await
        }
    }

    #[tokio::test]
    async fn test_create_uses_default_name_for_blank() {
        let dir = directory();
        let session = dir.create("alice", "   ").await.unwrap();
        assert_eq!(session.name, DEFAULT_SESSION_NAME);
        assert!(session.layout.panels.is_empty());
    }

    #[tokio::test]
    async fn test_get_rejects_other_owner() {
        let dir = directory();
        let session = dir.create("alice", "work").await.unwrap();
        let err = dir.get("bob", &session.id).await.unwrap_err();
        assert!(matches!(err, TetherError::Unauthorized(_)));
        assert!(dir.get("alice", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rename_rejects_blank_name() {
        let dir = directory();
        let session = dir.create("alice", "work").await.unwrap();
        assert!(dir.rename("alice", &session.id, " ").await.is_err());
        assert!(dir.rename("alice", &session.id, "play").await.unwrap());
        let fetched = dir.get("alice", &session.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "play");
    }

    #[tokio::test]
    async fn test_cache_size_zero_still_works() {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let registry = TerminalRegistry::new(
            Arc::new(FakeBridge::default()),
            store.clone(),
            RegistryConfig::default(),
        );
        let dir = SessionDirectory::new(store, registry, 0);
        let a = dir.create("alice", "a").await.unwrap();
        let b = dir.create("alice", "b").await.unwrap();
        assert!(dir.get("alice", &a.id).await.unwrap().is_some());
        assert!(dir.get("alice", &b.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_all_retries_transient_store_failures() {
        let store = Arc::new(FlakyStore::default());
        let dir = directory_on(store.clone());
        for name in ["a", "b", "c"] {
            dir.create("alice", name).await.unwrap();
        }
        store.transient_failures.store(2, Ordering::SeqCst);

        assert_eq!(dir.delete_all("alice").await, 3);
        assert!(dir.list_for_user("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_all_reports_only_what_it_removed() {
        let store = Arc::new(FlakyStore::default());
        let dir = directory_on(store.clone());
        let stuck = dir.create("alice", "stuck").await.unwrap();
        dir.create("alice", "a").await.unwrap();
        dir.create("alice", "b").await.unwrap();
        *store.stuck.lock().unwrap() = Some(stuck.id.clone());

        assert_eq!(dir.delete_all("alice").await, 2);
        let left = dir.list_for_user("alice").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, stuck.id);
    }
}
