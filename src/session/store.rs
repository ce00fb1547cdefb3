//! In-memory session registry.
//!
//! Every read-modify-write goes through the map's per-key entry lock, so
//! concurrent updates to the same chip serialize while other chips proceed.

use dashmap::DashMap;

use super::{ChipId, Session};

/// Authoritative registry of chip sessions.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<ChipId, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the chip's current record.
    pub fn get(&self, chip_id: &ChipId) -> Option<Session> {
        self.sessions.get(chip_id).map(|entry| entry.value().clone())
    }

    /// Atomically mutate the chip's record, creating it with `init` if absent.
    ///
    /// The mutator runs while the entry is locked; keep it short and never
    /// call back into the store from inside it.
    pub fn upsert<R>(
        &self,
        chip_id: &ChipId,
        init: impl FnOnce() -> Session,
        mutate: impl FnOnce(&mut Session) -> R,
    ) -> R {
        let mut entry = self.sessions.entry(chip_id.clone()).or_insert_with(init);
        mutate(entry.value_mut())
    }

    /// Atomically mutate an existing record. Returns `None` if the chip is absent.
    pub fn update<R>(&self, chip_id: &ChipId, mutate: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.sessions
            .get_mut(chip_id)
            .map(|mut entry| mutate(entry.value_mut()))
    }

    /// Delete the record. Removing an absent chip is a no-op.
    pub fn remove(&self, chip_id: &ChipId) -> Option<Session> {
        self.sessions.remove(chip_id).map(|(_, session)| session)
    }

    /// Point-in-time copy of every session.
    pub fn list(&self) -> Snapshot {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by(|a, b| a.chip_id.cmp(&b.chip_id));
        Snapshot { sessions }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Restartable view over a `list()` result; iterate it as many times as needed.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    sessions: Vec<Session>,
}

impl Snapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, Session> {
        self.sessions.iter()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl IntoIterator for Snapshot {
    type Item = Session;
    type IntoIter = std::vec::IntoIter<Session>;

    fn into_iter(self) -> Self::IntoIter {
        self.sessions.into_iter()
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Session;
    type IntoIter = std::slice::Iter<'a, Session>;

    fn into_iter(self) -> Self::IntoIter {
        self.sessions.iter()
    }
}
