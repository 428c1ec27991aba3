use super::SessionHandle;
use dashmap::DashMap;
use std::sync::Arc;

/// Live sessions by id. Sharded map, so register/lookup/unregister from many
/// sessions never contend on one lock.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn register(&self, handle: SessionHandle) {
        self.sessions.insert(handle.id().to_string(), handle);
    }

    pub fn unregister(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.remove(id).map(|(_, h)| h)
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize { self.sessions.len() }
    pub fn is_empty(&self) -> bool { self.sessions.is_empty() }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Closes every session, used on shutdown.
    pub fn close_all(&self, reason: &str) -> usize {
        let handles: Vec<SessionHandle> = self.sessions.iter().map(|e| e.value().clone()).collect();
        handles.iter().filter(|h| h.close(super::CLOSE_NORMAL, reason)).count()
    }
}
