//! In-process transport that replays scripted replies.
//!
//! Used by tests and by the offline mode of the command-line front-end.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chatloom_core::{ChatMessage, ChatTransport, ModelConfig, Role, StreamError, TokenEvent, TokenStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedEnd {
    Done,
    Fail(StreamError),
    /// Keep the stream open until it is cancelled
    HoldOpen,
}

#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub deltas: Vec<String>,
    pub end: ScriptedEnd,
    pub delay: Duration,
}

impl ScriptedTurn {
    #[must_use]
    pub fn reply(deltas: &[&str]) -> Self {
        Self {
            deltas: deltas.iter().map(ToString::to_string).collect(),
            end: ScriptedEnd::Done,
            delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn fail(deltas: &[&str], error: StreamError) -> Self {
        Self {
            end: ScriptedEnd::Fail(error),
            ..Self::reply(deltas)
        }
    }

    #[must_use]
    pub fn hold(deltas: &[&str]) -> Self {
        Self {
            end: ScriptedEnd::HoldOpen,
            ..Self::reply(deltas)
        }
    }

    /// Pause before every delta.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    async fn play(self, tx: &mpsc::Sender<TokenEvent>, cancel: &CancellationToken) -> TokenEvent {
        let mut text = String::new();
        for delta in self.deltas {
            if !self.delay.is_zero() {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return TokenEvent::Cancelled,
                    () = tokio::time::sleep(self.delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return TokenEvent::Cancelled;
            }
            text.push_str(&delta);
            tokio::select! {
                biased;
                () = cancel.cancelled() => return TokenEvent::Cancelled,
                sent = tx.send(TokenEvent::Delta(delta)) => {
                    if sent.is_err() {
                        return TokenEvent::Cancelled;
                    }
                }
            }
        }

        match self.end {
            ScriptedEnd::Done => TokenEvent::Done { final_text: text },
            ScriptedEnd::Fail(e) => TokenEvent::Error(e),
            ScriptedEnd::HoldOpen => {
                cancel.cancelled().await;
                TokenEvent::Cancelled
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    echo: bool,
}

impl ScriptedProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer unscripted requests by echoing the last user message.
    #[must_use]
    pub fn echo() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_turn(self, turn: ScriptedTurn) -> Self {
        self.push_turn(turn);
        self
    }

    pub fn push_turn(&self, turn: ScriptedTurn) {
        lock(&self.turns).push_back(turn);
    }

    /// Contexts received so far, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        lock(&self.requests).clone()
    }

    #[must_use]
    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    fn next_turn(&self, context: &[ChatMessage]) -> ScriptedTurn {
        if let Some(turn) = lock(&self.turns).pop_front() {
            return turn;
        }
        if self.echo {
            let last_user = context
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map_or("", |m| m.content.as_str());
            return ScriptedTurn::reply(&["echo: ", last_user]);
        }
        ScriptedTurn::fail(
            &[],
            StreamError::Network("no scripted turn left".to_string()),
        )
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChatTransport for ScriptedProvider {
    fn send(
        &self,
        context: Vec<ChatMessage>,
        _config: &ModelConfig,
        cancel: CancellationToken,
    ) -> TokenStream {
        let turn = self.next_turn(&context);
        lock(&self.requests).push(context);

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let terminal = turn.play(&tx, &cancel).await;
            let _ = tx.send(terminal).await;
        });
        Box::pin(ReceiverStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatloom_core::collect_text;
    use futures::StreamExt;

    #[tokio::test]
    async fn replays_turns_in_order() {
        let provider = ScriptedProvider::new()
            .with_turn(ScriptedTurn::reply(&["a", "b"]))
            .with_turn(ScriptedTurn::reply(&["c"]));
        let config = ModelConfig::default();

        let first = provider.send(vec![], &config, CancellationToken::new());
        let second = provider.send(vec![], &config, CancellationToken::new());

        assert_eq!(collect_text(first).await, Ok("ab".to_string()));
        assert_eq!(collect_text(second).await, Ok("c".to_string()));
        assert_eq!(provider.request_count(), 2);
    }

    #[tokio::test]
    async fn held_stream_ends_on_cancel() {
        let provider = ScriptedProvider::new().with_turn(ScriptedTurn::hold(&["x"]));
        let cancel = CancellationToken::new();
        let mut stream = provider.send(vec![], &ModelConfig::default(), cancel.clone());

        assert_eq!(stream.next().await, Some(TokenEvent::Delta("x".to_string())));
        cancel.cancel();
        assert_eq!(stream.next().await, Some(TokenEvent::Cancelled));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn echo_repeats_last_user_message() {
        let provider = ScriptedProvider::echo();
        let stream = provider.send(
            vec![ChatMessage::system("sys"), ChatMessage::user("ping")],
            &ModelConfig::default(),
            CancellationToken::new(),
        );
        assert_eq!(collect_text(stream).await, Ok("echo: ping".to_string()));
    }

    #[tokio::test]
    async fn exhausted_script_fails() {
        let provider = ScriptedProvider::new();
        let stream = provider.send(vec![], &ModelConfig::default(), CancellationToken::new());
        assert!(collect_text(stream).await.is_err());
    }
}
