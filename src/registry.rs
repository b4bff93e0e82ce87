//! Worker Registry (spec §4.D): in-memory session handles keyed by server_id.
//!
//! Adapted from `knhk-swarm`'s queen-agent task-assignment map
//! (`Arc<RwLock<HashMap<AgentId, _>>>`), swapped for `dashmap` — the
//! concurrent-map crate the teacher's root package already depends on —
//! since the Registry is read far more often than it is written (every
//! Assignment Engine tick reads `IdleCandidates`, but attach/detach only
//! happens on connect/disconnect).

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::session::SessionHandle;

struct Entry {
    session: SessionHandle,
    connected_at: DateTime<Utc>,
    total_completed: u64,
}

/// In-memory only: lost on restart, rebuilt by worker reconnects.
#[derive(Default)]
pub struct WorkerRegistry {
    sessions: DashMap<String, Entry>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, server_id: String, session: SessionHandle, connected_at: DateTime<Utc>) {
        self.sessions.insert(
            server_id,
            Entry {
                session,
                connected_at,
                total_completed: 0,
            },
        );
    }

    pub fn detach(&self, server_id: &str) {
        self.sessions.remove(server_id);
    }

    pub fn get(&self, server_id: &str) -> Option<SessionHandle> {
        self.sessions.get(server_id).map(|e| e.session.clone())
    }

    pub fn has_live_session(&self, server_id: &str) -> bool {
        self.sessions.contains_key(server_id)
    }

    /// Keeps the Registry's loose notion of "completed" in sync with the
    /// Store's authoritative counter, used for idle-candidate ordering only.
    pub fn record_completed(&self, server_id: &str, total_completed: u64) {
        if let Some(mut e) = self.sessions.get_mut(server_id) {
            e.total_completed = total_completed;
        }
    }

    /// Candidate server_ids with a live session, caller filters by Store
    /// status == idle; ordered least-loaded-first, ties broken by connection
    /// age (spec §4.D). The Registry has no notion of Worker.status itself
    /// (that lives in the Store), so callers pass the idle set directly.
    pub fn order_by_load<'a>(&self, idle_ids: impl IntoIterator<Item = &'a str>, limit: usize) -> Vec<String> {
        let mut scored: Vec<(String, u64, DateTime<Utc>)> = idle_ids
            .into_iter()
            .filter_map(|id| {
                self.sessions.get(id).map(|e| (id.to_string(), e.total_completed, e.connected_at))
            })
            .collect();
        scored.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));
        scored.into_iter().take(limit).map(|(id, ..)| id).collect()
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
    use crate::session::SessionHandle;
    use tokio::sync::mpsc;

    fn fake_session() -> SessionHandle {
        let (tx, _rx) = mpsc::channel(8);
        SessionHandle::new(tx)
    }

    #[test]
    fn order_by_load_prefers_least_completed_then_oldest_connection() {
        let reg = WorkerRegistry::new();
        let t0 = Utc::now();
        reg.attach("busy-history".into(), fake_session(), t0);
        reg.record_completed("busy-history", 10);
        reg.attach("fresh".into(), fake_session(), t0 + chrono::Duration::seconds(5));
        reg.attach("also-fresh".into(), fake_session(), t0 + chrono::Duration::seconds(1));

        let ordered = reg.order_by_load(["busy-history", "fresh", "also-fresh"], 10);
        assert_eq!(ordered, vec!["also-fresh", "fresh", "busy-history"]);
    }

    #[test]
    fn detach_removes_session_without_a_session_never_idle() {
        let reg = WorkerRegistry::new();
        reg.attach("w1".into(), fake_session(), Utc::now());
        assert!(reg.has_live_session("w1"));
        reg.detach("w1");
        assert!(!reg.has_live_session("w1"));
        assert!(reg.order_by_load(["w1"], 10).is_empty());
    }
}
