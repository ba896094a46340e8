//! Session Registry
//!
//! Thread-safe session lookup using DashMap for concurrent access.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

use super::types::{Session, SessionId, SessionTarget};

/// Default maximum concurrent sessions
const DEFAULT_MAX_SESSIONS: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Session limit reached: {current}/{max}")]
    SessionLimitReached { current: usize, max: usize },

    #[error("Session not found: {0}")]
    NotFound(SessionId),
}

/// All live sessions, keyed by id
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    max_sessions: AtomicUsize,
    /// Lock for create to prevent TOCTOU race between count check and insert
    create_lock: parking_lot::Mutex<()>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_max_sessions(DEFAULT_MAX_SESSIONS)
    }

    pub fn with_max_sessions(max: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions: AtomicUsize::new(max),
            create_lock: parking_lot::Mutex::new(()),
        }
    }

    pub fn set_max_sessions(&self, max: usize) {
        self.max_sessions.store(max, Ordering::SeqCst);
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions.load(Ordering::SeqCst)
    }

    /// Create a session in Idle state
    pub fn create(&self, target: SessionTarget) -> Result<Arc<Session>, RegistryError> {
        let _guard = self.create_lock.lock();

        let current = self.sessions.len();
        let max = self.max_sessions();
        if current >= max {
            return Err(RegistryError::SessionLimitReached { current, max });
        }

        let session = Arc::new(Session::new(target));
        info!(
            "Creating session {}: {} ({:?})",
            session.id,
            session.target.display_label(),
            session.kind()
        );
        self.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn require(&self, id: &SessionId) -> Result<Arc<Session>, RegistryError> {
        self.get(id).ok_or(RegistryError::NotFound(*id))
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(id).map(|(_, session)| session);
        if removed.is_some() {
            debug!("Session {} removed from registry", id);
        }
        removed
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// All sessions, oldest first
    pub fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::SerialParams;

    fn serial() -> SessionTarget {
        SessionTarget::Serial(SerialParams::new("/dev/ttyS0", 9600))
    }

    #[test]
    fn test_create_and_remove() {
        let registry = SessionRegistry::new();
        let session = registry.create(serial()).unwrap();
        assert!(registry.contains(&session.id));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(&session.id).is_some());
        assert!(registry.is_empty());
        assert_eq!(
            registry.require(&session.id).unwrap_err(),
            RegistryError::NotFound(session.id)
        );
    }

    #[test]
    fn test_limit() {
        let registry = SessionRegistry::with_max_sessions(1);
        registry.create(serial()).unwrap();
        assert_eq!(
            registry.create(serial()).unwrap_err(),
            RegistryError::SessionLimitReached { current: 1, max: 1 }
        );
    }

    #[test]
    fn test_list_is_ordered_by_creation() {
        let registry = SessionRegistry::new();
        let a = registry.create(serial()).unwrap();
        let b = registry.create(serial()).unwrap();
        let ids: Vec<_> = registry.list().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }
}
