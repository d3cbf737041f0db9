use std::collections::BTreeMap;

use crate::common::SessionId;
use crate::log::LogRecord;

/// A session as seen by the persistence core: its id, its auto-commit mode,
/// and the log records routed to it during the last replay.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    auto_commit: bool,
    replayed: Vec<LogRecord>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            auto_commit: true,
            replayed: Vec::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_auto_commit(&self) -> bool {
        self.auto_commit
    }

    /// Records replayed into this session, in log order.
    pub fn replayed(&self) -> &[LogRecord] {
        &self.replayed
    }
}

/// Registry of live and reconstructed sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: BTreeMap<SessionId, Session>,
    next_id: u32,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let mut sessions = BTreeMap::new();
        sessions.insert(SessionId::SYSTEM, Session::new(SessionId::SYSTEM));
        Self {
            sessions,
            next_id: SessionId::SYSTEM.as_u32() + 1,
        }
    }

    /// Opens a new session with a fresh id.
    pub fn open_session(&mut self) -> SessionId {
        let id = SessionId::new(self.next_id);
        self.next_id += 1;
        self.sessions.insert(id, Session::new(id));
        id
    }

    /// Returns the session with `id`, creating it when a replayed record
    /// names a session that does not exist yet.
    pub fn ensure(&mut self, id: SessionId) -> &mut Session {
        if id.as_u32() >= self.next_id {
            self.next_id = id.as_u32() + 1;
        }
        self.sessions.entry(id).or_insert_with(|| Session::new(id))
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn close_session(&mut self, id: SessionId) -> bool {
        id != SessionId::SYSTEM && self.sessions.remove(&id).is_some()
    }

    pub fn all_sessions(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Auto-commit mode of a session; unknown sessions report `true`.
    pub fn auto_commit_state(&self, id: SessionId) -> bool {
        self.sessions.get(&id).map_or(true, |s| s.auto_commit)
    }

    pub fn set_auto_commit(&mut self, id: SessionId, enabled: bool) {
        self.ensure(id).auto_commit = enabled;
    }

    /// Routes a replayed record to the session it is tagged with.
    pub fn route(&mut self, record: LogRecord) {
        self.ensure(record.session()).replayed.push(record);
    }

    pub fn clear_replay_history(&mut self) {
        for session in self.sessions.values_mut() {
            session.replayed.clear();
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_close() {
        let mut reg = SessionRegistry::new();
        let a = reg.open_session();
        let b = reg.open_session();
        assert_ne!(a, b);
        assert_eq!(reg.all_sessions(), vec![SessionId::SYSTEM, a, b]);
        assert!(reg.close_session(a));
        assert!(!reg.close_session(SessionId::SYSTEM));
    }

    #[test]
    fn test_ensure_advances_ids() {
        let mut reg = SessionRegistry::new();
        reg.ensure(SessionId::new(7));
        assert_eq!(reg.open_session(), SessionId::new(8));
    }

    #[test]
    fn test_auto_commit_state() {
        let mut reg = SessionRegistry::new();
        let s = reg.open_session();
        assert!(reg.auto_commit_state(s));
        reg.set_auto_commit(s, false);
        assert!(!reg.auto_commit_state(s));
    }
}
