use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::session::CdmSession;
use crate::types::SessionId;

/// Shared handle to a session; timer ticks and decrypt calls hold one of
/// these instead of the map lock.
pub type SharedSession = Arc<Mutex<CdmSession>>;

/// (session id → session) with close/list/find semantics.
///
/// Closing marks the session closed before dropping the map's reference, so
/// a handle obtained concurrently stays valid and observes the closed flag.
#[derive(Default)]
pub struct SessionMap {
    sessions: Mutex<HashMap<SessionId, SharedSession>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session_id: &str, session: CdmSession) -> SharedSession {
        let shared = Arc::new(Mutex::new(session));
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id.to_owned(), shared.clone());
        shared
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(session_id)
    }

    pub fn find(&self, session_id: &str) -> Option<SharedSession> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    /// Returns false if the session was not present.
    pub fn close_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.lock().unwrap().remove(session_id);
        match removed {
            Some(session) => {
                session.lock().unwrap().close();
                true
            }
            None => false,
        }
    }

    /// Snapshot of every non-closed session.
    pub fn list(&self) -> Vec<SharedSession> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| !s.lock().unwrap().is_closed())
            .cloned()
            .collect()
    }

    pub fn size(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Close every session and clear the map (engine teardown).
    pub fn terminate_all(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        for session in sessions.values() {
            session.lock().unwrap().close();
        }
        sessions.clear();
    }
}
