//! Per-session handshake state.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::protocol::now_iso8601;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unstarted,
    Initialized,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub state: SessionState,
    /// `clientInfo` sent with `initialize`, if any.
    pub client_info: Option<Value>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("unknown session {0}")]
    Unknown(SessionId),

    #[error("session already initialized")]
    AlreadyInitialized,
}

/// Live sessions keyed by ID. A closed session is removed.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<SessionId, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> SessionId {
        let id = SessionId::generate();
        self.sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                state: SessionState::Unstarted,
                client_info: None,
                created_at: now_iso8601(),
            },
        );
        id
    }

    pub fn state(&self, id: &SessionId) -> Option<SessionState> {
        self.sessions.get(id).map(|s| s.state)
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Move an `Unstarted` session to `Initialized`.
    pub fn initialize(&self, id: &SessionId, client_info: Option<Value>) -> Result<(), SessionError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::Unknown(id.clone()))?;
        if session.state != SessionState::Unstarted {
            return Err(SessionError::AlreadyInitialized);
        }
        session.state = SessionState::Initialized;
        session.client_info = client_info;
        Ok(())
    }

    /// Remove a session, returning it in the `Closed` state.
    pub fn close(&self, id: &SessionId) -> Option<Session> {
        self.sessions.remove(id).map(|(_, mut session)| {
            session.state = SessionState::Closed;
            session
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
