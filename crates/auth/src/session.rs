//! Authenticated RPC sessions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strata_core::RecordId;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("wrong login/password")]
    InvalidCredentials,

    #[error("session expired")]
    SessionExpired,

    #[error("unknown session")]
    UnknownSession,

    #[error("session belongs to database '{0}'")]
    DatabaseMismatch(String),

    #[error("unknown database '{0}'")]
    UnknownDatabase(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub db: String,
    pub uid: RecordId,
    pub login: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Storage of live sessions.
pub trait SessionStore: Send + Sync {
    fn create(&self, db: &str, uid: RecordId, login: &str, now: DateTime<Utc>) -> Session;
    /// Resolve a session, extending its lifetime. Expired sessions are removed.
    fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<Session, AuthError>;
    fn remove(&self, id: &str) -> bool;
    /// Drop every expired session; returns how many were removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> usize;
}

impl<S> SessionStore for Arc<S>
where
    S: SessionStore + ?Sized,
{
    fn create(&self, db: &str, uid: RecordId, login: &str, now: DateTime<Utc>) -> Session {
        (**self).create(db, uid, login, now)
    }

    fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<Session, AuthError> {
        (**self).touch(id, now)
    }

    fn remove(&self, id: &str) -> bool {
        (**self).remove(id)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        (**self).purge_expired(now)
    }
}

/// In-memory session store with a sliding expiry.
#[derive(Debug)]
pub struct InMemorySessionStore {
    ttl: Duration,
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for InMemorySessionStore {
    fn create(&self, db: &str, uid: RecordId, login: &str, now: DateTime<Utc>) -> Session {
        let session = Session {
            id: Uuid::new_v4().simple().to_string(),
            db: db.to_string(),
            uid,
            login: login.to_string(),
            created_at: now,
            expires_at: now + self.ttl,
        };
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(session.id.clone(), session.clone());
        }
        session
    }

    fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<Session, AuthError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| AuthError::UnknownSession)?;
        let Some(session) = sessions.get_mut(id) else {
            return Err(AuthError::UnknownSession);
        };
        if session.is_expired(now) {
            sessions.remove(id);
            return Err(AuthError::SessionExpired);
        }
        session.expires_at = now + self.ttl;
        Ok(session.clone())
    }

    fn remove(&self, id: &str) -> bool {
        self.sessions
            .write()
            .map(|mut s| s.remove(id).is_some())
            .unwrap_or(false)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let Ok(mut sessions) = self.sessions.write() else {
            return 0;
        };
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        before - sessions.len()
    }
}
