//! Pending-Due Index (spec §4.C): a time-scored ordered set, planet_id → due_time.
//!
//! Eventually consistent with the Store; `Put`/`Remove` are best-effort and the
//! Health Loop repairs drift every tick (P3).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

/// `(due_time, planet_id)` ordered by due time first; ties break on id for a
/// stable (if arbitrary) secondary order within a snapshot, per spec §4.C.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
struct Entry {
    due: DateTime<Utc>,
    planet_id: String,
}

#[derive(Debug, Default)]
struct Inner {
    by_due: BTreeSet<Entry>,
    by_id: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct PendingDueIndex {
    inner: Mutex<Inner>,
}

impl PendingDueIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert; replaces any existing score for `planet_id`.
    pub fn put(&self, planet_id: &str, due: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        if let Some(old_due) = inner.by_id.get(planet_id).copied() {
            inner.by_due.remove(&Entry {
                due: old_due,
                planet_id: planet_id.to_string(),
            });
        }
        inner.by_due.insert(Entry {
            due,
            planet_id: planet_id.to_string(),
        });
        inner.by_id.insert(planet_id.to_string(), due);
    }

    pub fn remove(&self, planet_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(due) = inner.by_id.remove(planet_id) {
            inner.by_due.remove(&Entry {
                due,
                planet_id: planet_id.to_string(),
            });
        }
    }

    pub fn contains(&self, planet_id: &str) -> bool {
        self.inner.lock().by_id.contains_key(planet_id)
    }

    /// Ids with `due <= now`, ascending, limited to `max`.
    pub fn range_due(&self, now: DateTime<Utc>, max: usize) -> Vec<(String, DateTime<Utc>)> {
        let inner = self.inner.lock();
        inner
            .by_due
            .iter()
            .take_while(|e| e.due <= now)
            .take(max)
            .map(|e| (e.planet_id.clone(), e.due))
            .collect()
    }

    pub fn peek_next(&self) -> Option<(String, DateTime<Utc>)> {
        let inner = self.inner.lock();
        inner.by_due.iter().next().map(|e| (e.planet_id.clone(), e.due))
    }

    pub fn size(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.lock().by_id.keys().cloned().collect()
    }
}
