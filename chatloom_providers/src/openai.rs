use std::fmt;
use std::time::Duration;

use chatloom_core::{ChatMessage, ChatTransport, ModelConfig, StreamError, TokenEvent, TokenStream};
use futures::{Stream, StreamExt};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::sse::{SseDecoder, SseFrame};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CHANNEL_CAPACITY: usize = 16;
const ERROR_BODY_LIMIT: usize = 512;

/// Streaming client for OpenAI-compatible chat completion endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
    channel_capacity: usize,
    retry: RetryPolicy,
}

impl OpenAiProvider {
    pub fn new(api_key: String) -> Self {
        info!("Creating OpenAiProvider");
        Self {
            client: Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Bound on time-to-first-byte and on every later wait for a chunk.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of events buffered before network reads are suspended.
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn request_body(context: &[ChatMessage], config: &ModelConfig) -> serde_json::Value {
        json!({
            "model": config.model,
            "messages": context,
            "temperature": config.temperature,
            "max_tokens": config.max_tokens,
            "presence_penalty": config.presence_penalty,
            "top_p": config.top_p,
            "stream": true,
        })
    }
}

impl ChatTransport for OpenAiProvider {
    fn send(
        &self,
        context: Vec<ChatMessage>,
        config: &ModelConfig,
        cancel: CancellationToken,
    ) -> TokenStream {
        info!(
            "Opening stream to {}: model={}, {} context messages",
            self.base_url,
            config.model,
            context.len()
        );

        let request = StreamRequest {
            client: self.client.clone(),
            url: format!("{}/chat/completions", self.base_url),
            api_key: self.api_key.clone(),
            body: Self::request_body(&context, config),
            timeout: self.timeout,
            retry: self.retry.clone(),
        };

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        tokio::spawn(async move {
            let terminal = request.run(&tx, &cancel).await;
            debug!("Stream finished: {terminal:?}");
            // The consumer may already be gone.
            let _ = tx.send(terminal).await;
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

/// Why opening the connection failed.
#[derive(Debug)]
enum OpenFailure {
    Connect(reqwest::Error),
    Status(StatusCode, String),
}

impl OpenFailure {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Connect(e) => e.is_connect() || e.is_timeout(),
            Self::Status(status, _) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}

impl fmt::Display for OpenFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "{e}"),
            Self::Status(status, body) if body.is_empty() => write!(f, "HTTP {status}"),
            Self::Status(status, body) => write!(f, "HTTP {status}: {body}"),
        }
    }
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
}

/// Everything the producer task needs, detached from the provider.
struct StreamRequest {
    client: Client,
    url: String,
    api_key: String,
    body: serde_json::Value,
    timeout: Duration,
    retry: RetryPolicy,
}

impl StreamRequest {
    /// Helper method to send a single request
    async fn try_open(&self) -> Result<Response, OpenFailure> {
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&self.body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().await.map_err(OpenFailure::Connect)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let excerpt: String = body.chars().take(ERROR_BODY_LIMIT).collect();
        Err(OpenFailure::Status(status, excerpt.trim().to_string()))
    }

    async fn open(&self) -> Result<Response, StreamError> {
        retry_with_backoff(|| self.try_open(), &self.retry, OpenFailure::is_retryable)
            .await
            .map_err(|e| StreamError::Network(e.to_string()))
    }

    /// Drive the request to completion and return its terminal event.
    async fn run(self, tx: &mpsc::Sender<TokenEvent>, cancel: &CancellationToken) -> TokenEvent {
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return TokenEvent::Cancelled,
            opened = timeout(self.timeout, self.open()) => match opened {
                Err(_) => return TokenEvent::Error(StreamError::Timeout(self.timeout)),
                Ok(Err(e)) => return TokenEvent::Error(e),
                Ok(Ok(response)) => response,
            },
        };

        forward_events(response.bytes_stream(), tx, cancel, self.timeout).await
    }
}

/// Decode a response body into deltas on `tx` and return the terminal event.
///
/// A full channel suspends reading from `bytes`, and so from the network.
/// `wait` bounds every wait for the next chunk.
async fn forward_events<S, B, E>(
    bytes: S,
    tx: &mpsc::Sender<TokenEvent>,
    cancel: &CancellationToken,
    wait: Duration,
) -> TokenEvent
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    let mut bytes = Box::pin(bytes);
    let mut decoder = SseDecoder::new();
    let mut text = String::new();

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return TokenEvent::Cancelled,
            next = timeout(wait, bytes.next()) => next,
        };

        let closed = matches!(next, Ok(None));
        let frames = match next {
            Err(_) => return TokenEvent::Error(StreamError::Timeout(wait)),
            Ok(Some(Err(e))) => return TokenEvent::Error(StreamError::Network(e.to_string())),
            Ok(Some(Ok(chunk))) => decoder.feed(chunk.as_ref()),
            // Connection close terminates the stream as well.
            Ok(None) => decoder.finish().map(|frame| frame.into_iter().collect()),
        };
        let frames = match frames {
            Ok(frames) => frames,
            Err(e) => return TokenEvent::Error(e),
        };

        for frame in frames {
            let payload = match frame {
                SseFrame::Done => return TokenEvent::Done { final_text: text },
                SseFrame::Data(payload) => payload,
            };
            let delta = match parse_chunk(&payload) {
                Ok(Some(delta)) => delta,
                Ok(None) => continue,
                Err(e) => return TokenEvent::Error(e),
            };
            text.push_str(&delta);
            tokio::select! {
                biased;
                () = cancel.cancelled() => return TokenEvent::Cancelled,
                sent = tx.send(TokenEvent::Delta(delta)) => {
                    if sent.is_err() {
                        warn!("Stream consumer dropped, aborting request");
                        return TokenEvent::Cancelled;
                    }
                }
            }
        }

        if closed {
            debug!("Connection closed without end marker");
            return TokenEvent::Done { final_text: text };
        }
    }
}

/// Extract the content delta from one `data:` payload.
fn parse_chunk(payload: &str) -> Result<Option<String>, StreamError> {
    let chunk: StreamChunk = serde_json::from_str(payload)
        .map_err(|e| StreamError::MalformedStream(format!("invalid chunk: {e}")))?;

    if let Some(error) = chunk.error {
        let message = error["message"]
            .as_str()
            .map_or_else(|| error.to_string(), str::to_string);
        return Err(StreamError::Network(message));
    }

    let delta: String = chunk
        .choices
        .into_iter()
        .filter_map(|choice| choice.delta.and_then(|d| d.content))
        .collect();
    Ok((!delta.is_empty()).then_some(delta))
}
