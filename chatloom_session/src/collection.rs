//! The ordered list of sessions and the pointer to the current one.

use chatloom_core::ChatSession;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::StoreError;

/// Serialized form of the whole collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub sessions: Vec<ChatSession>,
    pub current_index: usize,
    /// Monotonic mutation counter; older snapshots never overwrite newer ones.
    #[serde(default)]
    pub revision: u64,
}

/// Sessions ordered newest first.
///
/// Never empty, and `current_index` always points at an existing session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCollection {
    sessions: Vec<ChatSession>,
    current_index: usize,
    revision: u64,
}

impl Default for SessionCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCollection {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: vec![ChatSession::new()],
            current_index: 0,
            revision: 0,
        }
    }

    /// Rebuild a collection from a persisted snapshot, repairing whatever an
    /// interrupted process left behind.
    #[must_use]
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let Snapshot {
            mut sessions,
            current_index,
            revision,
        } = snapshot;

        if sessions.is_empty() {
            sessions.push(ChatSession::new());
        }

        for session in &mut sessions {
            let closed = session.close_interrupted();
            if closed > 0 {
                info!(
                    "Closed {closed} interrupted message(s) in session {}",
                    session.id
                );
            }
            session.repair_summarize_index();
        }

        let current_index = current_index.min(sessions.len() - 1);
        Self {
            sessions,
            current_index,
            revision,
        }
    }

    #[must_use]
    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            sessions: self.sessions.clone(),
            current_index: self.current_index,
            revision: self.revision,
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &[ChatSession] {
        &self.sessions
    }

    #[must_use]
    pub const fn current_index(&self) -> usize {
        self.current_index
    }

    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Advance the revision after a mutation.
    pub fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Always false; kept for API symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[must_use]
    pub fn current(&self) -> &ChatSession {
        &self.sessions[self.current_index]
    }

    pub fn current_mut(&mut self) -> &mut ChatSession {
        &mut self.sessions[self.current_index]
    }

    pub fn get(&self, index: usize) -> Result<&ChatSession, StoreError> {
        self.sessions
            .get(index)
            .ok_or(StoreError::SessionIndexOutOfRange {
                index,
                len: self.sessions.len(),
            })
    }

    pub fn get_mut(&mut self, index: usize) -> Result<&mut ChatSession, StoreError> {
        let len = self.sessions.len();
        self.sessions
            .get_mut(index)
            .ok_or(StoreError::SessionIndexOutOfRange { index, len })
    }

    #[must_use]
    pub fn find(&self, id: Uuid) -> Option<&ChatSession> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn find_mut(&mut self, id: Uuid) -> Option<&mut ChatSession> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    /// Insert a fresh session at the front and make it current.
    pub fn insert_new(&mut self) -> Uuid {
        let session = ChatSession::new();
        let id = session.id;
        self.sessions.insert(0, session);
        self.current_index = 0;
        id
    }

    pub fn select(&mut self, index: usize) -> Result<(), StoreError> {
        self.get(index)?;
        self.current_index = index;
        Ok(())
    }

    /// Remove the session at `index`.
    ///
    /// The current pointer keeps following the same session when another
    /// one is removed. When the current session itself goes, the session
    /// that slides into its position becomes current, or the last one if
    /// it was at the end. Removing the only session leaves a fresh default.
    pub fn remove(&mut self, index: usize) -> Result<ChatSession, StoreError> {
        self.get(index)?;
        let removed = self.sessions.remove(index);

        if self.sessions.is_empty() {
            self.sessions.push(ChatSession::new());
            self.current_index = 0;
        } else if index < self.current_index {
            self.current_index -= 1;
        } else {
            self.current_index = self.current_index.min(self.sessions.len() - 1);
        }

        Ok(removed)
    }

    /// Drop every session and start over with a single default one.
    pub fn clear(&mut self) -> Vec<ChatSession> {
        self.current_index = 0;
        std::mem::replace(&mut self.sessions, vec![ChatSession::new()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatloom_core::{MessageStatus, Role};

    fn collection_of(count: usize) -> SessionCollection {
        let mut collection = SessionCollection::new();
        for _ in 1..count {
            collection.insert_new();
        }
        collection
    }

    #[test]
    fn new_session_goes_first_and_becomes_current() {
        let mut collection = SessionCollection::new();
        let id = collection.insert_new();

        assert_eq!(collection.len(), 2);
        assert_eq!(collection.current_index(), 0);
        assert_eq!(collection.current().id, id);
    }

    #[test]
    fn removing_only_session_leaves_fresh_default() {
        let mut collection = SessionCollection::new();
        let old = collection.current().id;

        collection.remove(0).unwrap();

        assert_eq!(collection.len(), 1);
        assert_eq!(collection.current_index(), 0);
        assert_ne!(collection.current().id, old);
    }

    #[test]
    fn removing_before_current_shifts_pointer() {
        let mut collection = collection_of(3);
        collection.select(2).unwrap();
        let current = collection.current().id;

        collection.remove(0).unwrap();

        assert_eq!(collection.current_index(), 1);
        assert_eq!(collection.current().id, current);
    }

    #[test]
    fn removing_last_current_moves_to_new_last() {
        let mut collection = collection_of(3);
        collection.select(2).unwrap();

        collection.remove(2).unwrap();

        assert_eq!(collection.current_index(), 1);
    }

    #[test]
    fn removing_after_current_keeps_pointer() {
        let mut collection = collection_of(3);
        collection.select(1).unwrap();
        let current = collection.current().id;

        collection.remove(2).unwrap();

        assert_eq!(collection.current().id, current);
    }

    #[test]
    fn out_of_range_is_rejected_without_change() {
        let mut collection = collection_of(2);
        let before = collection.clone();

        assert_eq!(
            collection.select(5),
            Err(StoreError::SessionIndexOutOfRange { index: 5, len: 2 })
        );
        assert!(collection.remove(2).is_err());
        assert_eq!(collection, before);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let mut collection = collection_of(2);
        collection.current_mut().add_message(Role::User, "hi");
        collection.bump();

        let json = serde_json::to_string(&collection.to_snapshot()).unwrap();
        let snapshot: Snapshot = serde_json::from_str(&json).unwrap();
        let restored = SessionCollection::from_snapshot(snapshot);

        assert_eq!(restored, collection);
    }

    #[test]
    fn from_snapshot_repairs_state() {
        let mut session = ChatSession::new();
        session.add_message(Role::User, "hi");
        session.add_placeholder();
        session.last_summarize_index = 10;

        let restored = SessionCollection::from_snapshot(Snapshot {
            sessions: vec![session],
            current_index: 4,
            revision: 7,
        });

        let session = restored.current();
        assert_eq!(restored.current_index(), 0);
        assert_eq!(restored.revision(), 7);
        assert_eq!(session.messages[1].status, MessageStatus::Cancelled);
        assert!(!session.is_streaming());
        assert_eq!(session.last_summarize_index, 2);
    }

    #[test]
    fn empty_snapshot_gets_default_session() {
        let restored = SessionCollection::from_snapshot(Snapshot {
            sessions: vec![],
            current_index: 0,
            revision: 0,
        });
        assert_eq!(restored.len(), 1);
    }
}
