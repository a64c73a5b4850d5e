//! Folding older turns into a session's running summary.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chatloom_core::util::estimate_message_tokens;
use chatloom_core::{
    ChatSession, ChatTransport, CollectError, CompressionConfig, Message, ModelConfig,
    StreamError, collect_text,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::prompt::build_summary_context;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompressionError {
    #[error("summarization failed: {0}")]
    Stream(#[from] StreamError),

    #[error("summarization was cancelled")]
    Cancelled,

    #[error("summarization returned an empty summary")]
    EmptySummary,
}

impl From<CollectError> for CompressionError {
    fn from(e: CollectError) -> Self {
        match e {
            CollectError::Stream(e) => Self::Stream(e),
            CollectError::Cancelled => Self::Cancelled,
        }
    }
}

/// Range of messages selected for summarization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPlan {
    pub session: Uuid,
    /// `last_summarize_index` the plan was computed from
    pub start: usize,
    /// Exclusive end of the prefix, the new `last_summarize_index`
    pub end: usize,
}

/// New memory state for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryUpdate {
    pub memory_prompt: String,
    pub last_summarize_index: usize,
    /// `last_summarize_index` this update was derived from
    pub base_index: usize,
}

impl MemoryUpdate {
    /// The session's current memory state.
    #[must_use]
    pub fn unchanged(session: &ChatSession) -> Self {
        Self {
            memory_prompt: session.memory_prompt.clone(),
            last_summarize_index: session.last_summarize_index,
            base_index: session.last_summarize_index,
        }
    }

    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.last_summarize_index == self.base_index
    }

    /// Write the update into `session` if it still starts where the update
    /// was computed from.
    pub fn apply(self, session: &mut ChatSession) -> bool {
        if self.is_noop()
            || session.last_summarize_index != self.base_index
            || self.last_summarize_index > session.messages.len()
        {
            return false;
        }
        session.memory_prompt = self.memory_prompt;
        session.last_summarize_index = self.last_summarize_index;
        session.touch();
        true
    }
}

/// Removes the session from the in-flight set when dropped.
struct InFlight<'a> {
    sessions: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl<'a> InFlight<'a> {
    fn acquire(sessions: &'a Mutex<HashSet<Uuid>>, id: Uuid) -> Option<Self> {
        lock(sessions).insert(id).then(|| Self { sessions, id })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.sessions).remove(&self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MemoryCompressor<T = Arc<dyn ChatTransport>>
where
    T: Send + Sync,
{
    transport: T,
    config: CompressionConfig,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl<T> MemoryCompressor<T>
where
    T: ChatTransport,
{
    pub fn new(transport: T, config: CompressionConfig) -> Self {
        Self {
            transport,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Whether the uncompressed tail exceeds either the message-count or the
    /// estimated-token ceiling.
    #[must_use]
    pub fn should_compress(&self, session: &ChatSession) -> bool {
        let tail: Vec<&Message> = session
            .uncompressed_tail()
            .iter()
            .filter(|m| m.is_contextual())
            .collect();
        tail.len() > self.config.max_tail_messages
            || estimate_message_tokens(tail.iter().copied()) > self.config.max_tail_tokens
    }

    /// Select the prefix of the tail to summarize.
    ///
    /// The most recent `keep_recent_messages` stay verbatim and the prefix
    /// never reaches a message that is still streaming.
    #[must_use]
    pub fn plan(&self, session: &ChatSession) -> Option<CompressionPlan> {
        let start = session.last_summarize_index.min(session.messages.len());
        let tail = session.uncompressed_tail();

        let open = tail
            .iter()
            .position(Message::is_streaming)
            .unwrap_or(tail.len());
        let cut = tail
            .len()
            .saturating_sub(self.config.keep_recent_messages)
            .min(open);

        (cut > 0).then_some(CompressionPlan {
            session: session.id,
            start,
            end: start + cut,
        })
    }

    pub async fn compress(
        &self,
        session: &ChatSession,
        model: &ModelConfig,
    ) -> Result<MemoryUpdate, CompressionError> {
        self.compress_with(session, model, CancellationToken::new())
            .await
    }

    /// Summarize the planned prefix together with the existing memory prompt.
    ///
    /// Returns the session's current state unchanged when compression is not
    /// needed, the prefix is empty, or another compression of the same
    /// session is running. On error nothing is changed.
    pub async fn compress_with(
        &self,
        session: &ChatSession,
        model: &ModelConfig,
        cancel: CancellationToken,
    ) -> Result<MemoryUpdate, CompressionError> {
        if !self.should_compress(session) {
            return Ok(MemoryUpdate::unchanged(session));
        }
        let Some(plan) = self.plan(session) else {
            debug!("Session {} has nothing old enough to compress", session.id);
            return Ok(MemoryUpdate::unchanged(session));
        };
        let Some(_guard) = InFlight::acquire(&self.in_flight, session.id) else {
            debug!("Compression already running for session {}", session.id);
            return Ok(MemoryUpdate::unchanged(session));
        };

        let prefix = &session.messages[plan.start..plan.end];
        if !prefix.iter().any(Message::is_contextual) {
            // Only failed turns in the prefix, nothing worth summarizing.
            return Ok(MemoryUpdate {
                memory_prompt: session.memory_prompt.clone(),
                last_summarize_index: plan.end,
                base_index: plan.start,
            });
        }

        info!(
            "Compressing session {}: messages {}..{} into memory",
            session.id, plan.start, plan.end
        );

        let context =
            build_summary_context(&session.memory_prompt, prefix, self.config.summary_max_words);
        let summary = collect_text(self.transport.send(context, model, cancel)).await?;
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(CompressionError::EmptySummary);
        }

        debug!(
            "Compressed session {}: {} -> {} chars of memory",
            session.id,
            session.memory_prompt.len(),
            summary.len()
        );

        Ok(MemoryUpdate {
            memory_prompt: summary.to_string(),
            last_summarize_index: plan.end,
            base_index: plan.start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatloom_core::{MessageStatus, Role};
    use chatloom_providers::{ScriptedProvider, ScriptedTurn};
    use std::time::Duration;

    fn config(max_messages: usize, keep: usize) -> CompressionConfig {
        CompressionConfig::default()
            .with_max_tail_messages(max_messages)
            .with_max_tail_tokens(10_000)
            .with_keep_recent_messages(keep)
    }

    fn session_with(turns: &[(&str, &str)]) -> ChatSession {
        let mut session = ChatSession::new();
        for (user, assistant) in turns {
            session.add_message(Role::User, *user);
            session.add_message(Role::Assistant, *assistant);
        }
        session
    }

    #[tokio::test]
    async fn compresses_after_threshold_is_crossed() {
        let provider = Arc::new(ScriptedProvider::new().with_turn(ScriptedTurn::reply(&["greetings"])));
        let compressor = MemoryCompressor::new(provider.clone(), config(1, 2));
        let mut session = session_with(&[("hi", "hello"), ("how are you", "fine")]);

        assert!(compressor.should_compress(&session));
        let update = compressor
            .compress(&session, &ModelConfig::default())
            .await
            .unwrap_or_else(|e| panic!("compression failed: {e}"));

        assert!(update.last_summarize_index >= 2);
        assert_eq!(update.memory_prompt, "greetings");
        assert!(update.apply(&mut session));
        assert_eq!(session.last_summarize_index, 2);
        assert_eq!(session.memory_prompt, "greetings");

        let sent = &provider.requests()[0];
        let contents: Vec<_> = sent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(&contents[..2], &["hi", "hello"]);
    }

    #[tokio::test]
    async fn default_floor_compresses_the_older_exchange() {
        let provider = Arc::new(ScriptedProvider::new().with_turn(ScriptedTurn::reply(&["greetings"])));
        let compressor = MemoryCompressor::new(
            provider.clone(),
            CompressionConfig::default().with_max_tail_messages(1),
        );
        let session = session_with(&[("hi", "hello"), ("how are you", "fine")]);

        let update = compressor
            .compress(&session, &ModelConfig::default())
            .await
            .unwrap_or_else(|e| panic!("compression failed: {e}"));

        assert_eq!(update.last_summarize_index, 2);
        assert_eq!(update.memory_prompt, "greetings");
        assert_eq!(provider.request_count(), 1);
    }

    #[tokio::test]
    async fn below_threshold_is_noop() {
        let provider = Arc::new(ScriptedProvider::new());
        let compressor = MemoryCompressor::new(provider.clone(), config(10, 2));
        let session = session_with(&[("hi", "hello")]);

        assert!(!compressor.should_compress(&session));
        let update = compressor.compress(&session, &ModelConfig::default()).await;
        assert_eq!(update, Ok(MemoryUpdate::unchanged(&session)));
        assert_eq!(provider.request_count(), 0);
    }

    #[tokio::test]
    async fn token_ceiling_triggers_compression() {
        let provider = Arc::new(ScriptedProvider::new());
        let compressor = MemoryCompressor::new(
            provider,
            config(100, 1).with_max_tail_tokens(10),
        );
        let long = "x".repeat(80);
        let session = session_with(&[(long.as_str(), "ok")]);
        assert!(compressor.should_compress(&session));
    }

    #[tokio::test]
    async fn failure_leaves_memory_untouched() {
        let provider = Arc::new(ScriptedProvider::new().with_turn(ScriptedTurn::fail(
            &["half a sum"],
            StreamError::Network("reset".to_string()),
        )));
        let compressor = MemoryCompressor::new(provider, config(1, 2));
        let session = session_with(&[("a", "b"), ("c", "d")]);

        let result = compressor.compress(&session, &ModelConfig::default()).await;
        assert_eq!(
            result,
            Err(CompressionError::Stream(StreamError::Network("reset".to_string())))
        );
        assert_eq!(session.last_summarize_index, 0);
        assert!(session.memory_prompt.is_empty());
    }

    #[tokio::test]
    async fn blank_summary_is_rejected() {
        let provider = Arc::new(ScriptedProvider::new().with_turn(ScriptedTurn::reply(&["  \n"])));
        let compressor = MemoryCompressor::new(provider, config(1, 2));
        let session = session_with(&[("a", "b"), ("c", "d")]);

        let result = compressor.compress(&session, &ModelConfig::default()).await;
        assert_eq!(result, Err(CompressionError::EmptySummary));
    }

    #[test]
    fn plan_keeps_recent_floor() {
        let compressor = MemoryCompressor::new(Arc::new(ScriptedProvider::new()), config(1, 4));
        let session = session_with(&[("a", "b"), ("c", "d")]);
        assert_eq!(compressor.plan(&session), None);
    }

    #[test]
    fn plan_stops_before_streaming_message() {
        let compressor = MemoryCompressor::new(Arc::new(ScriptedProvider::new()), config(1, 0));
        let mut session = session_with(&[("a", "b")]);
        session.add_message(Role::User, "c");
        session.add_placeholder();
        session.add_message(Role::User, "e");

        let plan = compressor.plan(&session);
        assert_eq!(plan.map(|p| (p.start, p.end)), Some((0, 3)));
    }

    #[test]
    fn plan_starts_at_last_summarize_index() {
        let compressor = MemoryCompressor::new(Arc::new(ScriptedProvider::new()), config(1, 2));
        let mut session = session_with(&[("a", "b"), ("c", "d"), ("e", "f")]);
        session.last_summarize_index = 2;

        let plan = compressor.plan(&session);
        assert_eq!(plan.map(|p| (p.start, p.end)), Some((2, 4)));
    }

    #[tokio::test]
    async fn failed_turns_are_skipped_without_a_call() {
        let provider = Arc::new(ScriptedProvider::new());
        let compressor = MemoryCompressor::new(provider.clone(), config(0, 1));
        let mut session = ChatSession::new();
        let id = session.add_placeholder();
        if let Some(msg) = session.message_mut(id) {
            msg.finalize(MessageStatus::Error, Some("[error] timeout".to_string()));
        }
        session.add_message(Role::User, "retry");

        let update = compressor
            .compress(&session, &ModelConfig::default())
            .await
            .unwrap_or_else(|e| panic!("compression failed: {e}"));
        assert_eq!(update.last_summarize_index, 1);
        assert_eq!(provider.request_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_compression_runs_once() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_turn(ScriptedTurn::reply(&["summary"]).with_delay(Duration::from_millis(20))),
        );
        let compressor = MemoryCompressor::new(provider.clone(), config(1, 2));
        let session = session_with(&[("a", "b"), ("c", "d")]);
        let model = ModelConfig::default();

        let (first, second) = tokio::join!(
            compressor.compress(&session, &model),
            compressor.compress(&session, &model)
        );

        let first = first.unwrap_or_else(|e| panic!("compression failed: {e}"));
        let second = second.unwrap_or_else(|e| panic!("compression failed: {e}"));
        assert!(!first.is_noop());
        assert!(second.is_noop());
        assert_eq!(provider.request_count(), 1);
    }

    #[test]
    fn stale_update_is_not_applied() {
        let mut session = session_with(&[("a", "b"), ("c", "d")]);
        let update = MemoryUpdate {
            memory_prompt: "old".to_string(),
            last_summarize_index: 2,
            base_index: 0,
        };
        session.last_summarize_index = 2;
        session.memory_prompt = "newer".to_string();

        assert!(!update.apply(&mut session));
        assert_eq!(session.memory_prompt, "newer");
    }
}
