//! Integration tests for the OpenAI-compatible streaming transport.
//!
//! A local mock server plays the model endpoint, so these tests cover the
//! full path: request encoding, SSE decoding, status and timeout handling.

use std::time::Duration;

use chatloom_core::{
    ChatMessage, ChatTransport, CollectError, ModelConfig, StreamError, TokenEvent, collect_text,
};
use chatloom_providers::{OpenAiProvider, RetryPolicy};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sse_body(chunks: &[&str], done: bool) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":{}}}}}]}}\n\n",
            serde_json::Value::String((*chunk).to_string())
        ));
    }
    if done {
        body.push_str("data: [DONE]\n\n");
    }
    body
}

fn provider(server: &MockServer) -> OpenAiProvider {
    OpenAiProvider::new("test-key".to_string())
        .with_base_url(server.uri())
        .with_timeout(Duration::from_millis(500))
        .with_retry(RetryPolicy::none())
}

/// Answers one request with a chunked SSE body holding `first`, then keeps
/// the connection open without sending anything else.
async fn stalling_server(first: &str) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = sse_body(&[first], false);

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = vec![0u8; 16 * 1024];
        let _ = socket.read(&mut request).await;

        let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n";
        socket.write_all(head.as_bytes()).await.unwrap();
        socket
            .write_all(format!("{:x}\r\n{body}\r\n", body.len()).as_bytes())
            .await
            .unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    (format!("http://{addr}"), handle)
}

fn context() -> Vec<ChatMessage> {
    vec![ChatMessage::user("hi")]
}

#[tokio::test]
async fn test_streams_deltas_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(serde_json::json!({
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}],
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&["Hel", "lo", "!"], true), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let events: Vec<TokenEvent> = provider(&server)
        .send(context(), &ModelConfig::default(), CancellationToken::new())
        .collect()
        .await;

    assert_eq!(
        events,
        vec![
            TokenEvent::Delta("Hel".to_string()),
            TokenEvent::Delta("lo".to_string()),
            TokenEvent::Delta("!".to_string()),
            TokenEvent::Done {
                final_text: "Hello!".to_string()
            },
        ]
    );
}

#[tokio::test]
async fn test_connection_close_without_marker_completes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body(&["partial"], false), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let stream = provider(&server).send(context(), &ModelConfig::default(), CancellationToken::new());
    assert_eq!(collect_text(stream).await, Ok("partial".to_string()));
}

#[tokio::test]
async fn test_server_error_maps_to_network() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;

    let stream = provider(&server).send(context(), &ModelConfig::default(), CancellationToken::new());
    match collect_text(stream).await {
        Err(CollectError::Stream(StreamError::Network(message))) => {
            assert!(message.contains("500"), "unexpected message: {message}");
            assert!(message.contains("upstream exploded"));
        }
        other => panic!("expected network error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body(&["ok"], true), "text/event-stream"))
        .mount(&server)
        .await;

    let stream = provider(&server)
        .with_retry(RetryPolicy::from_millis(&[10]))
        .send(context(), &ModelConfig::default(), CancellationToken::new());
    assert_eq!(collect_text(stream).await, Ok("ok".to_string()));
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let stream = provider(&server)
        .with_retry(RetryPolicy::from_millis(&[10, 10]))
        .send(context(), &ModelConfig::default(), CancellationToken::new());
    assert!(matches!(
        collect_text(stream).await,
        Err(CollectError::Stream(StreamError::Network(_)))
    ));
}

#[tokio::test]
async fn test_malformed_chunk() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("data: {oops\n\n", "text/event-stream"))
        .mount(&server)
        .await;

    let stream = provider(&server).send(context(), &ModelConfig::default(), CancellationToken::new());
    assert!(matches!(
        collect_text(stream).await,
        Err(CollectError::Stream(StreamError::MalformedStream(_)))
    ));
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&["late"], true), "text/event-stream")
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let stream = provider(&server)
        .with_timeout(Duration::from_millis(100))
        .send(context(), &ModelConfig::default(), CancellationToken::new());
    assert_eq!(
        collect_text(stream).await,
        Err(CollectError::Stream(StreamError::Timeout(Duration::from_millis(100))))
    );
}

#[tokio::test]
async fn test_cancel_before_first_byte() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&["late"], true), "text/event-stream")
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let mut stream = provider(&server)
        .with_timeout(Duration::from_secs(5))
        .send(context(), &ModelConfig::default(), cancel.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    assert_eq!(stream.next().await, Some(TokenEvent::Cancelled));
    assert_eq!(stream.next().await, None);
}

#[tokio::test]
async fn test_stall_after_first_chunk_times_out() {
    let (uri, server) = stalling_server("first").await;

    let mut stream = OpenAiProvider::new("test-key".to_string())
        .with_base_url(uri)
        .with_timeout(Duration::from_millis(300))
        .with_retry(RetryPolicy::none())
        .send(context(), &ModelConfig::default(), CancellationToken::new());

    assert_eq!(stream.next().await, Some(TokenEvent::Delta("first".to_string())));
    assert_eq!(
        stream.next().await,
        Some(TokenEvent::Error(StreamError::Timeout(Duration::from_millis(300))))
    );
    assert_eq!(stream.next().await, None);
    server.abort();
}
