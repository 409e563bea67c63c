//! The single owner of live session records.

use super::record::SessionRecord;
use super::{SessionId, SessionSnapshot};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Session records keyed by id.
///
/// The lock is never held across an `.await`, and events collected while it
/// is held are emitted only after it is released.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionRecord>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Insert a new record. Returns false if the id is already taken.
    pub(crate) fn insert(&self, record: SessionRecord) -> bool {
        let mut sessions = self.lock();
        if sessions.contains_key(&record.id) {
            return false;
        }
        sessions.insert(record.id.clone(), record);
        true
    }

    pub(crate) fn contains(&self, id: &SessionId) -> bool {
        self.lock().contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn ids(&self) -> Vec<SessionId> {
        self.lock().keys().cloned().collect()
    }

    pub(crate) fn snapshot(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.lock().get(id).map(SessionRecord::snapshot)
    }

    /// Snapshots of every session, oldest first.
    pub(crate) fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> =
            self.lock().values().map(SessionRecord::snapshot).collect();
        snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        snapshots
    }

    /// Live pids, for resource sampling.
    pub(crate) fn live_pids(&self) -> Vec<(SessionId, u32)> {
        self.lock()
            .values()
            .filter(|record| !record.status.is_terminal())
            .filter_map(|record| record.process.pid().map(|pid| (record.id.clone(), pid)))
            .collect()
    }

    /// Remove every record, tearing each one down.
    pub(crate) fn drain(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self.lock().drain().map(|(_, r)| r).collect();
        for record in &mut records {
            record.teardown();
        }
        records
    }
}
