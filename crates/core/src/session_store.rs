// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `SessionStore` capability the core consumes for optional persistence
//! (spec.md §6). The core operates correctly with a no-op store: no recovery
//! across restarts, no replay of in-flight Messages (DESIGN.md, Open
//! Question 2 — discard is the adopted default).

use crate::{SessionConfig, SessionId, SessionState, WorkspaceId};
use async_trait::async_trait;
use std::collections::HashMap;

/// A point-in-time record of one Session, the unit `SessionStore` persists.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub workspace_id: WorkspaceId,
    pub state: SessionState,
    pub config: SessionConfig,
    pub created_at_epoch_ms: u64,
    pub last_active_epoch_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Optional persistence boundary. Modelled on the shape of
/// `crates/adapters/src/agent/mod.rs`'s `AgentAdapter` trait (async-trait,
/// `Clone + Send + Sync + 'static`), generalised to CRUD over snapshots
/// rather than subprocess control.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn create(&self, snapshot: SessionSnapshot) -> Result<(), SessionStoreError>;
    async fn update(&self, snapshot: SessionSnapshot) -> Result<(), SessionStoreError>;
    async fn get(&self, session_id: &SessionId) -> Result<Option<SessionSnapshot>, SessionStoreError>;
    async fn delete(&self, session_id: &SessionId) -> Result<(), SessionStoreError>;
}

/// A store that persists nothing. Satisfies spec.md §6's requirement that the
/// core "operates correctly if the store is a no-op".
#[derive(Debug, Clone, Default)]
pub struct NoopSessionStore;

#[async_trait]
impl SessionStore for NoopSessionStore {
    async fn create(&self, _snapshot: SessionSnapshot) -> Result<(), SessionStoreError> {
        Ok(())
    }

    async fn update(&self, _snapshot: SessionSnapshot) -> Result<(), SessionStoreError> {
        Ok(())
    }

    async fn get(&self, _session_id: &SessionId) -> Result<Option<SessionSnapshot>, SessionStoreError> {
        Ok(None)
    }

    async fn delete(&self, _session_id: &SessionId) -> Result<(), SessionStoreError> {
        Ok(())
    }
}

/// In-memory store used by tests that need `get` to actually return what was
/// written (the no-op store never does).
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionStore {
    inner: std::sync::Arc<parking_lot::Mutex<HashMap<SessionId, SessionSnapshot>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, snapshot: SessionSnapshot) -> Result<(), SessionStoreError> {
        self.inner.lock().insert(snapshot.session_id.clone(), snapshot);
        Ok(())
    }

    async fn update(&self, snapshot: SessionSnapshot) -> Result<(), SessionStoreError> {
        let mut guard = self.inner.lock();
        if !guard.contains_key(&snapshot.session_id) {
            return Err(SessionStoreError::NotFound(snapshot.session_id));
        }
        guard.insert(snapshot.session_id.clone(), snapshot);
        Ok(())
    }

    async fn get(&self, session_id: &SessionId) -> Result<Option<SessionSnapshot>, SessionStoreError> {
        Ok(self.inner.lock().get(session_id).cloned())
    }

    async fn delete(&self, session_id: &SessionId) -> Result<(), SessionStoreError> {
        self.inner.lock().remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::PathBuf;
    use std::time::Duration;

    fn snapshot(id: &str) -> SessionSnapshot {
        SessionSnapshot {
            session_id: SessionId::new(id),
            workspace_id: WorkspaceId::new("w1"),
            state: SessionState::Active,
            config: SessionConfig {
                system_prompt: String::new(),
                turn_budget: 10,
                tool_allowlist: BTreeSet::new(),
                environment: BTreeMap::new(),
                working_directory: PathBuf::from("/tmp"),
                oauth_token: None,
                max_idle: Duration::from_secs(60),
                max_lifetime: Duration::from_secs(600),
            },
            created_at_epoch_ms: 0,
            last_active_epoch_ms: 0,
        }
    }

    #[tokio::test]
    async fn noop_store_never_returns_what_was_written() {
        let store = NoopSessionStore;
        store.create(snapshot("s1")).await.expect("create");
        assert!(store.get(&SessionId::new("s1")).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn in_memory_store_roundtrips() {
        let store = InMemorySessionStore::new();
        store.create(snapshot("s1")).await.expect("create");
        let got = store.get(&SessionId::new("s1")).await.expect("get");
        assert_eq!(got.expect("present").session_id, SessionId::new("s1"));
    }

    #[tokio::test]
    async fn in_memory_update_of_missing_session_errors() {
        let store = InMemorySessionStore::new();
        let err = store.update(snapshot("missing")).await.unwrap_err();
        assert!(matches!(err, SessionStoreError::NotFound(_)));
    }
}
