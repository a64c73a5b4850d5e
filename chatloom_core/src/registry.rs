//! Registry of cancellation handles for in-flight requests.
//!
//! Entries are keyed by message identity, so deleting or shifting messages
//! while a stream is running can never stop the wrong request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub session: Uuid,
    pub message: MessageId,
}

impl MessageKey {
    #[must_use]
    pub const fn new(session: Uuid, message: MessageId) -> Self {
        Self { session, message }
    }
}

/// Ability to abort exactly one in-flight stream.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    key: MessageKey,
    generation: u64,
    token: CancellationToken,
}

impl CancelHandle {
    #[must_use]
    pub const fn key(&self) -> MessageKey {
        self.key
    }

    /// Token to hand to the transport.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug)]
struct Entry {
    generation: u64,
    token: CancellationToken,
}

#[derive(Debug, Default)]
pub struct ControllerRegistry {
    entries: Mutex<HashMap<MessageKey, Entry>>,
    generation: AtomicU64,
}

impl ControllerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<MessageKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a fresh handle for `key`.
    ///
    /// A handle already registered under the same key belongs to a superseded
    /// request; it is dropped from the registry but not cancelled.
    pub fn register(&self, key: MessageKey) -> CancelHandle {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let previous = self.entries().insert(
            key,
            Entry {
                generation,
                token: token.clone(),
            },
        );
        if previous.is_some() {
            debug!(
                "Replaced handle for session {} message {}",
                key.session, key.message
            );
        }
        CancelHandle {
            key,
            generation,
            token,
        }
    }

    /// Cancel and forget the handle for `key`. No-op when absent.
    pub fn stop(&self, key: MessageKey) -> bool {
        let Some(entry) = self.entries().remove(&key) else {
            return false;
        };
        entry.token.cancel();
        debug!(
            "Stopped request for session {} message {}",
            key.session, key.message
        );
        true
    }

    /// Forget the handle for `key` without cancelling it.
    pub fn remove(&self, key: MessageKey) -> bool {
        self.entries().remove(&key).is_some()
    }

    /// Forget `handle` if it is still the registered one for its key.
    pub fn release(&self, handle: &CancelHandle) -> bool {
        let mut entries = self.entries();
        if entries
            .get(&handle.key)
            .is_some_and(|entry| entry.generation == handle.generation)
        {
            entries.remove(&handle.key);
            true
        } else {
            false
        }
    }

    /// Cancel every request belonging to `session`.
    pub fn stop_session(&self, session: Uuid) -> usize {
        let mut entries = self.entries();
        let keys: Vec<MessageKey> = entries
            .keys()
            .filter(|key| key.session == session)
            .copied()
            .collect();
        for key in &keys {
            if let Some(entry) = entries.remove(key) {
                entry.token.cancel();
            }
        }
        keys.len()
    }

    #[must_use]
    pub fn contains(&self, key: MessageKey) -> bool {
        self.entries().contains_key(&key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
