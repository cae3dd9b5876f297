use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Browsing in progress for one tab, not yet flushed to the day store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub tab_id: i64,
    pub window_id: i64,
    pub domain: String,
    /// Milliseconds since the Unix epoch; moved forward on every checkpoint.
    pub start_time: i64,
}

impl ActiveSession {
    pub fn elapsed_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.start_time
    }
}

/// In-memory view of the in-flight sessions, at most one per tab id.
#[derive(Debug, Default)]
pub struct ActiveSessionTable {
    sessions: HashMap<i64, ActiveSession>,
}

impl ActiveSessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sessions(sessions: impl IntoIterator<Item = ActiveSession>) -> Self {
        let mut table = Self::new();
        for session in sessions {
            table.insert(session);
        }
        table
    }

    /// Stores `session`, returning whatever was tracked for that tab before.
    pub fn insert(&mut self, session: ActiveSession) -> Option<ActiveSession> {
        self.sessions.insert(session.tab_id, session)
    }

    pub fn get(&self, tab_id: i64) -> Option<&ActiveSession> {
        self.sessions.get(&tab_id)
    }

    pub fn remove(&mut self, tab_id: i64) -> Option<ActiveSession> {
        self.sessions.remove(&tab_id)
    }

    pub fn contains(&self, tab_id: i64) -> bool {
        self.sessions.contains_key(&tab_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Tab ids in ascending order, so sweeps process tabs deterministically.
    pub fn tab_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn tabs_in_window(&self, window_id: i64) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .sessions
            .values()
            .filter(|session| session.window_id == window_id)
            .map(|session| session.tab_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn snapshot(&self) -> Vec<ActiveSession> {
        let mut sessions: Vec<ActiveSession> = self.sessions.values().cloned().collect();
        sessions.sort_by_key(|session| session.tab_id);
        sessions
    }
}
