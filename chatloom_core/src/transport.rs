//! The streaming transport contract.
//!
//! A transport turns a context plus generation parameters into a lazy,
//! single-consumer sequence of [`TokenEvent`]s. Every sequence ends with
//! exactly one terminal event: `Done`, `Error` or `Cancelled`.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{ChatMessage, ModelConfig};

/// Failures a stream can end with.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// Connection failure or a non-success status
    #[error("network error: {0}")]
    Network(String),

    #[error("no data received within {}s", .0.as_secs())]
    Timeout(Duration),

    /// The response violated the chunk framing
    #[error("malformed stream: {0}")]
    MalformedStream(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    Delta(String),
    Done { final_text: String },
    Error(StreamError),
    Cancelled,
}

impl TokenEvent {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Delta(_))
    }
}

pub type TokenStream = Pin<Box<dyn Stream<Item = TokenEvent> + Send>>;

pub trait ChatTransport: Send + Sync {
    /// Open a stream for `context`.
    ///
    /// Cancelling `cancel` ends the sequence early with
    /// [`TokenEvent::Cancelled`]. The returned stream is not restartable.
    fn send(
        &self,
        context: Vec<ChatMessage>,
        config: &ModelConfig,
        cancel: CancellationToken,
    ) -> TokenStream;
}

impl<T: ChatTransport + ?Sized> ChatTransport for Arc<T> {
    fn send(
        &self,
        context: Vec<ChatMessage>,
        config: &ModelConfig,
        cancel: CancellationToken,
    ) -> TokenStream {
        (**self).send(context, config, cancel)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollectError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("stream was cancelled")]
    Cancelled,
}

/// Drain a stream into its final text.
///
/// A non-empty `final_text` on `Done` wins over the accumulated deltas.
pub async fn collect_text(mut stream: TokenStream) -> Result<String, CollectError> {
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event {
            TokenEvent::Delta(delta) => text.push_str(&delta),
            TokenEvent::Done { final_text } => {
                return Ok(if final_text.is_empty() { text } else { final_text });
            }
            TokenEvent::Error(e) => return Err(CollectError::Stream(e)),
            TokenEvent::Cancelled => return Err(CollectError::Cancelled),
        }
    }
    Err(CollectError::Stream(StreamError::MalformedStream(
        "stream ended without a terminal event".to_string(),
    )))
}
