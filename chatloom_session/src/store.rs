//! The session store: single owner of all session state.
//!
//! Every mutation goes through [`SessionStore`]. Streams write only to their
//! own placeholder message, addressed by session id and message id, so
//! concurrent submissions and session edits never clobber each other.

use std::sync::{Arc, Weak};

use chatloom_core::{
    ChatSession, ChatTransport, CompressionConfig, ControllerRegistry, Message, MessageId, MessageKey,
    MessageStatus, ModelConfig, Role, StreamError, TokenEvent, TokenStream, collect_text,
};
use chatloom_memory::MemoryCompressor;
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::persist::SnapshotStore;
use crate::{SessionCollection, Snapshot, StoreError, topic};

const EVENT_CAPACITY: usize = 256;
const ERROR_PREFIX: &str = "[error]";

/// Store-wide behavior.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Global model parameters, overridable per session
    pub model: ModelConfig,
    /// Sent first in every context when set
    pub system_prompt: Option<String>,
    /// Compress long sessions and send the memory prompt as context
    pub memory_enabled: bool,
    /// Replace the default topic after the first completed exchange
    pub auto_title: bool,
    pub compression: CompressionConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            system_prompt: None,
            memory_enabled: true,
            auto_title: true,
            compression: CompressionConfig::default(),
        }
    }
}

/// Change notifications for the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    Hydrated,
    /// Sessions were added, removed, reordered or the selection moved
    SessionsChanged,
    /// Messages were added, or the topic, memory or config changed
    SessionUpdated { session: Uuid },
    /// Content or status of one message changed
    MessageUpdated { session: Uuid, message: MessageId },
}

/// Result of a finished submission.
#[derive(Debug)]
pub struct SubmitOutcome {
    pub session: Uuid,
    pub user_message: MessageId,
    pub message: MessageId,
    pub status: MessageStatus,
    /// Background topic derivation and compression, scheduled after a
    /// completed reply
    pub summarize: Option<JoinHandle<()>>,
}

/// Memory state of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryView {
    pub memory_prompt: String,
    pub last_summarize_index: usize,
    pub message_count: usize,
}

struct Inner<T: ?Sized>
where
    T: ChatTransport,
{
    state: RwLock<SessionCollection>,
    registry: ControllerRegistry,
    transport: Arc<T>,
    compressor: MemoryCompressor<Arc<T>>,
    persistence: Option<Arc<dyn SnapshotStore>>,
    last_saved: Mutex<u64>,
    /// Latest revision whose save was deferred to the writer task
    dirty: watch::Sender<u64>,
    events: broadcast::Sender<StoreEvent>,
    hydrated: watch::Sender<bool>,
    config: StoreConfig,
}

/// When a mutation reaches the snapshot store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Save {
    /// Before the mutating call returns
    Now,
    /// By the background writer, coalesced with later changes
    Deferred,
}

/// Shared handle to the session state. Cloning is cheap.
pub struct SessionStore<T: ?Sized = dyn ChatTransport>
where
    T: ChatTransport,
{
    inner: Arc<Inner<T>>,
}

impl<T: ChatTransport + ?Sized> Clone for SessionStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SessionStore<T>
where
    T: ChatTransport + ?Sized + 'static,
{
    /// Create a store that keeps its state in memory only.
    pub fn new(transport: Arc<T>, config: StoreConfig) -> Self {
        Self::build(transport, config, None)
    }

    /// Create a store that saves a snapshot after every mutation.
    ///
    /// Streamed deltas are saved by a background writer that always writes
    /// the latest state, so it must be called within a Tokio runtime.
    pub fn persistent(
        transport: Arc<T>,
        config: StoreConfig,
        persistence: Arc<dyn SnapshotStore>,
    ) -> Self {
        let store = Self::build(transport, config, Some(persistence));
        store.spawn_writer();
        store
    }

    fn build(
        transport: Arc<T>,
        config: StoreConfig,
        persistence: Option<Arc<dyn SnapshotStore>>,
    ) -> Self {
        info!(
            "Creating SessionStore: model={}, memory={}, persistent={}",
            config.model.model,
            config.memory_enabled,
            persistence.is_some()
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (hydrated, _) = watch::channel(false);
        let (dirty, _) = watch::channel(0);
        let compressor = MemoryCompressor::new(Arc::clone(&transport), config.compression.clone());

        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(SessionCollection::new()),
                registry: ControllerRegistry::new(),
                transport,
                compressor,
                persistence,
                last_saved: Mutex::new(0),
                dirty,
                events,
                hydrated,
                config,
            }),
        }
    }

    fn spawn_writer(&self) {
        let weak = Arc::downgrade(&self.inner);
        let mut dirty = self.inner.dirty.subscribe();
        tokio::spawn(async move {
            // Ends once the last store handle is dropped.
            while dirty.changed().await.is_ok() {
                let Some(inner) = Weak::upgrade(&weak) else {
                    break;
                };
                Self { inner }.flush().await;
            }
            debug!("Snapshot writer stopped");
        });
    }

    /// Save the current state unless it was already saved.
    pub async fn flush(&self) {
        if self.inner.persistence.is_none() {
            return;
        }
        let saved = *self.inner.last_saved.lock().await;
        let snapshot = self
            .read(|state| (state.revision() > saved).then(|| state.to_snapshot()))
            .await;
        if let Some(snapshot) = snapshot {
            self.persist(&snapshot).await;
        }
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Load the persisted snapshot, if any, and signal readiness.
    ///
    /// Messages that were still streaming when the snapshot was written are
    /// closed as cancelled.
    pub async fn hydrate(&self) -> anyhow::Result<()> {
        if let Some(persistence) = &self.inner.persistence {
            if let Some(snapshot) = persistence.load().await? {
                let collection = SessionCollection::from_snapshot(snapshot);
                info!(
                    "Hydrated {} session(s) at revision {}",
                    collection.len(),
                    collection.revision()
                );
                *self.inner.last_saved.lock().await = collection.revision();
                *self.inner.state.write().await = collection;
            }
        }

        self.inner.hydrated.send_replace(true);
        self.notify(StoreEvent::Hydrated);
        Ok(())
    }

    #[must_use]
    pub fn hydrated(&self) -> watch::Receiver<bool> {
        self.inner.hydrated.subscribe()
    }

    #[must_use]
    pub fn is_hydrated(&self) -> bool {
        *self.inner.hydrated.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    fn notify(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    pub async fn sessions(&self) -> Vec<ChatSession> {
        self.read(|state| state.sessions().to_vec()).await
    }

    pub async fn session(&self, index: usize) -> Result<ChatSession, StoreError> {
        self.read(|state| state.get(index).cloned()).await
    }

    pub async fn current_session(&self) -> ChatSession {
        self.read(|state| state.current().clone()).await
    }

    pub async fn current_index(&self) -> usize {
        self.read(SessionCollection::current_index).await
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.read(SessionCollection::to_snapshot).await
    }

    pub async fn message(&self, session: Uuid, message: MessageId) -> Option<Message> {
        self.read(|state| state.find(session)?.message(message).cloned())
            .await
    }

    /// Whether a stream for the given message is still registered.
    #[must_use]
    pub fn is_in_flight(&self, session: Uuid, message: MessageId) -> bool {
        self.inner
            .registry
            .contains(MessageKey::new(session, message))
    }

    /// Number of streams currently registered.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.registry.len()
    }

    pub async fn memory_view(&self, index: usize) -> Result<MemoryView, StoreError> {
        self.read(|state| {
            state.get(index).map(|s| MemoryView {
                memory_prompt: s.memory_prompt.clone(),
                last_summarize_index: s.last_summarize_index,
                message_count: s.message_count(),
            })
        })
        .await
    }

    pub async fn export_markdown(&self, index: usize) -> Result<String, StoreError> {
        self.read(|state| state.get(index).map(ChatSession::export_markdown))
            .await
    }

    /// Insert a fresh session at the front and select it.
    pub async fn new_session(&self) -> Uuid {
        let id = self
            .update(|state| (state.insert_new(), Some(StoreEvent::SessionsChanged)))
            .await;
        debug!("Created session {id}");
        id
    }

    pub async fn select_session(&self, index: usize) -> Result<(), StoreError> {
        self.update(|state| match state.select(index) {
            Ok(()) => (Ok(()), Some(StoreEvent::SessionsChanged)),
            Err(e) => (Err(e), None),
        })
        .await
    }

    /// Remove a session, cancelling its in-flight streams first.
    pub async fn remove_session(&self, index: usize) -> Result<ChatSession, StoreError> {
        let removed = self
            .update(|state| match state.remove(index) {
                Ok(removed) => (Ok(removed), Some(StoreEvent::SessionsChanged)),
                Err(e) => (Err(e), None),
            })
            .await?;

        let stopped = self.inner.registry.stop_session(removed.id);
        info!(
            "Removed session {} ({stopped} stream(s) cancelled)",
            removed.id
        );
        Ok(removed)
    }

    /// Drop every session, cancelling all in-flight streams.
    pub async fn clear_sessions(&self) {
        let removed = self
            .update(|state| (state.clear(), Some(StoreEvent::SessionsChanged)))
            .await;
        for session in &removed {
            self.inner.registry.stop_session(session.id);
        }
        info!("Cleared {} session(s)", removed.len());
    }

    /// Set or clear the per-session model override.
    pub async fn set_session_config(
        &self,
        index: usize,
        config: Option<ModelConfig>,
    ) -> Result<(), StoreError> {
        self.update(|state| match state.get_mut(index) {
            Ok(session) => {
                session.config = config;
                session.touch();
                let id = session.id;
                (Ok(()), Some(StoreEvent::SessionUpdated { session: id }))
            }
            Err(e) => (Err(e), None),
        })
        .await
    }

    /// Submit user input to the current session and stream the reply.
    ///
    /// Resolves once the reply reached a terminal state.
    pub async fn submit_input(&self, text: &str) -> Result<SubmitOutcome, StoreError> {
        if text.trim().is_empty() {
            return Err(StoreError::EmptyInput);
        }

        let config = &self.inner.config;
        let (session, user_message, message, context, model, handle) = self
            .update(|state| {
                let session = state.current_mut();
                let user_message = session.add_message(Role::User, text);
                let context = session.effective_context(
                    config.system_prompt.as_deref(),
                    config.memory_enabled,
                );
                let message = session.add_placeholder();
                let model = session.effective_config(&config.model).clone();
                // Registered under the write lock so a stop issued as soon as
                // the placeholder is visible always finds the handle.
                let handle = self
                    .inner
                    .registry
                    .register(MessageKey::new(session.id, message));
                let id = session.id;
                (
                    (id, user_message, message, context, model, handle),
                    Some(StoreEvent::SessionUpdated { session: id }),
                )
            })
            .await;

        info!(
            "Submitting to session {session}: {} context message(s)",
            context.len()
        );
        let stream = self.inner.transport.send(context, &model, handle.token());
        let status = self.drive(session, message, stream).await;
        self.inner.registry.release(&handle);
        debug!("Message {message} in session {session} finished as {status:?}");

        let summarize = (status == MessageStatus::Complete).then(|| {
            let store = self.clone();
            tokio::spawn(async move { store.summarize_session(session).await })
        });

        Ok(SubmitOutcome {
            session,
            user_message,
            message,
            status,
            summarize,
        })
    }

    /// Submit the nearest user message at or before `message_index` in the
    /// current session again.
    pub async fn resend(&self, message_index: usize) -> Result<SubmitOutcome, StoreError> {
        let content = self
            .read(|state| {
                let messages = &state.current().messages;
                if message_index >= messages.len() {
                    return Err(StoreError::MessageIndexOutOfRange {
                        index: message_index,
                        len: messages.len(),
                    });
                }
                messages[..=message_index]
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.clone())
                    .ok_or(StoreError::NoUserMessage(message_index))
            })
            .await?;

        self.submit_input(&content).await
    }

    /// Cancel the stream feeding the message at the given position.
    ///
    /// Returns false when the message does not exist or is not streaming.
    pub async fn stop_message(&self, session_index: usize, message_index: usize) -> bool {
        let key = self
            .read(|state| {
                let session = state.get(session_index).ok()?;
                let message = session.messages.get(message_index)?;
                Some(MessageKey::new(session.id, message.id))
            })
            .await;

        key.is_some_and(|key| self.stop(key))
    }

    /// Cancel the stream registered under `key`.
    pub fn stop(&self, key: MessageKey) -> bool {
        let stopped = self.inner.registry.stop(key);
        if stopped {
            info!("Stopped message {} in session {}", key.message, key.session);
        }
        stopped
    }

    async fn drive(&self, session: Uuid, message: MessageId, mut stream: TokenStream) -> MessageStatus {
        if self
            .update_message(session, message, Save::Now, |m| ((), m.open()))
            .await
            .is_none()
        {
            return MessageStatus::Cancelled;
        }

        while let Some(event) = stream.next().await {
            let (status, content) = match event {
                TokenEvent::Delta(delta) => {
                    let appended = self
                        .update_message(session, message, Save::Deferred, |m| {
                            let appended = m.append(&delta);
                            (appended, appended)
                        })
                        .await;
                    match appended {
                        Some(true) => continue,
                        // Finalized elsewhere or gone with its session.
                        _ => {
                            debug!("Dropping stream for message {message} in session {session}");
                            return self.status_of(session, message).await;
                        }
                    }
                }
                TokenEvent::Done { final_text } => (
                    MessageStatus::Complete,
                    (!final_text.is_empty()).then_some(final_text),
                ),
                TokenEvent::Error(e) => {
                    warn!("Stream for message {message} in session {session} failed: {e}");
                    (MessageStatus::Error, Some(error_content(&e)))
                }
                TokenEvent::Cancelled => (MessageStatus::Cancelled, None),
            };
            return self.finish(session, message, status, content).await;
        }

        let e = StreamError::MalformedStream("stream ended without a terminal event".to_string());
        warn!("Stream for message {message} in session {session} failed: {e}");
        self.finish(session, message, MessageStatus::Error, Some(error_content(&e)))
            .await
    }

    /// Finalize the message; the first terminal state wins.
    async fn finish(
        &self,
        session: Uuid,
        message: MessageId,
        status: MessageStatus,
        content: Option<String>,
    ) -> MessageStatus {
        self.update_message(session, message, Save::Now, |m| {
            let changed = m.finalize(status, content);
            (m.status, changed)
        })
        .await
        .unwrap_or(MessageStatus::Cancelled)
    }

    async fn status_of(&self, session: Uuid, message: MessageId) -> MessageStatus {
        self.read(|state| {
            state
                .find(session)
                .and_then(|s| s.message(message))
                .map(|m| m.status)
        })
        .await
        .unwrap_or(MessageStatus::Cancelled)
    }

    /// Derive a topic if the session still has the default one, then
    /// compress its history when it grew past the thresholds.
    pub async fn summarize_session(&self, session: Uuid) {
        if self.inner.config.auto_title {
            self.derive_topic(session).await;
        }
        if self.inner.config.memory_enabled {
            self.compress_session(session).await;
        }
    }

    /// Returns true when a new topic was applied.
    pub async fn derive_topic(&self, session: Uuid) -> bool {
        let request = self
            .read(|state| {
                let s = state.find(session).filter(|s| s.has_default_topic())?;
                let context = topic::topic_context(s)?;
                Some((context, s.effective_config(&self.inner.config.model).clone()))
            })
            .await;
        let Some((context, model)) = request else {
            return false;
        };

        let stream = self
            .inner
            .transport
            .send(context, &model, CancellationToken::new());
        let raw = match collect_text(stream).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Topic derivation for session {session} failed: {e}");
                return false;
            }
        };
        let Some(new_topic) = topic::clean_topic(&raw) else {
            debug!("Topic derivation for session {session} returned nothing usable");
            return false;
        };

        let applied = self
            .update(|state| match state.find_mut(session) {
                Some(s) if s.has_default_topic() => {
                    s.topic.clone_from(&new_topic);
                    s.touch();
                    (true, Some(StoreEvent::SessionUpdated { session }))
                }
                _ => (false, None),
            })
            .await;
        if applied {
            info!("Session {session} titled \"{new_topic}\"");
        }
        applied
    }

    /// Returns true when a new memory prompt was applied.
    pub async fn compress_session(&self, session: Uuid) -> bool {
        let request = self
            .read(|state| {
                state
                    .find(session)
                    .map(|s| (s.clone(), s.effective_config(&self.inner.config.model).clone()))
            })
            .await;
        let Some((snapshot, model)) = request else {
            return false;
        };

        let update = match self.inner.compressor.compress(&snapshot, &model).await {
            Ok(update) if update.is_noop() => return false,
            Ok(update) => update,
            Err(e) => {
                warn!("Memory compression for session {session} failed: {e}");
                return false;
            }
        };

        let applied = self
            .update(|state| {
                let applied = state.find_mut(session).is_some_and(|s| update.apply(s));
                (applied, applied.then_some(StoreEvent::SessionUpdated { session }))
            })
            .await;
        if !applied {
            debug!("Discarded stale memory update for session {session}");
        }
        applied
    }

    async fn read<R>(&self, f: impl FnOnce(&SessionCollection) -> R) -> R {
        let state = self.inner.state.read().await;
        f(&state)
    }

    async fn update<R>(
        &self,
        f: impl FnOnce(&mut SessionCollection) -> (R, Option<StoreEvent>),
    ) -> R {
        self.update_with(Save::Now, f).await
    }

    /// Apply `f` under the write lock. When it reports an event the revision
    /// advances, a snapshot is saved as `save` says and the event is
    /// published.
    async fn update_with<R>(
        &self,
        save: Save,
        f: impl FnOnce(&mut SessionCollection) -> (R, Option<StoreEvent>),
    ) -> R {
        let (result, event, snapshot) = {
            let mut state = self.inner.state.write().await;
            let (result, event) = f(&mut state);
            let mut snapshot = None;
            if event.is_some() {
                state.bump();
                if self.inner.persistence.is_some() {
                    match save {
                        Save::Now => snapshot = Some(state.to_snapshot()),
                        Save::Deferred => {
                            self.inner.dirty.send_replace(state.revision());
                        }
                    }
                }
            }
            (result, event, snapshot)
        };

        if let Some(snapshot) = snapshot {
            self.persist(&snapshot).await;
        }
        if let Some(event) = event {
            self.notify(event);
        }
        result
    }

    /// Mutate one message; `f` returns its result and whether it changed
    /// anything. `None` when the session or message is gone.
    async fn update_message<R>(
        &self,
        session: Uuid,
        message: MessageId,
        save: Save,
        f: impl FnOnce(&mut Message) -> (R, bool),
    ) -> Option<R> {
        self.update_with(save, |state| {
            let Some(s) = state.find_mut(session) else {
                return (None, None);
            };
            let Some(m) = s.message_mut(message) else {
                return (None, None);
            };
            let (result, changed) = f(m);
            if changed {
                s.touch();
            }
            (
                Some(result),
                changed.then_some(StoreEvent::MessageUpdated { session, message }),
            )
        })
        .await
    }

    async fn persist(&self, snapshot: &Snapshot) {
        let Some(persistence) = &self.inner.persistence else {
            return;
        };

        let mut last_saved = self.inner.last_saved.lock().await;
        if snapshot.revision <= *last_saved {
            debug!(
                "Skipping snapshot revision {} (already saved {})",
                snapshot.revision, *last_saved
            );
            return;
        }
        match persistence.save(snapshot).await {
            Ok(()) => *last_saved = snapshot.revision,
            Err(e) => warn!("Failed to save sessions: {e:#}"),
        }
    }
}

fn error_content(error: &StreamError) -> String {
    format!("{ERROR_PREFIX} {error}")
}
