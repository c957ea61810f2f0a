#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use streamchat::completion::CompletionsClient;
use streamchat::config::EndpointConfig;
use streamchat::transport::{Endpoint, HttpTransport};

/// One canned answer of the mock `/chat/completions` route.
#[derive(Clone)]
pub enum Reply {
    /// SSE body sent as the given network chunks, then closed.
    Sse(Vec<String>),
    /// SSE body given as raw byte chunks, which may split UTF-8 sequences.
    Raw(Vec<Vec<u8>>),
    /// SSE chunks, then the body stays open until the client goes away.
    SseThenHang(Vec<String>),
    /// SSE chunks, then the body breaks off with a connection reset.
    SseThenReset(Vec<String>),
    Json(Value),
    Status(u16, String),
}

struct MockState {
    replies: Vec<Reply>,
    served: AtomicUsize,
    requests: Mutex<Vec<Value>>,
}

pub struct MockUpstream {
    pub base_url: String,
    state: Arc<MockState>,
    server: tokio::task::JoinHandle<()>,
}

impl MockUpstream {
    /// Request bodies received so far, in order.
    pub fn requests(&self) -> Vec<Value> {
        self.state.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.lock().len()
    }

    pub fn client(&self) -> CompletionsClient {
        let config = EndpointConfig::new(self.base_url.clone(), "sk-test");
        CompletionsClient::new(
            Arc::new(HttpTransport::new(&config)),
            Arc::new(Endpoint::from_config(&config)),
        )
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn chat_completions(State(mock): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    mock.requests.lock().push(body);
    let index = mock.served.fetch_add(1, Ordering::SeqCst);
    let reply = mock
        .replies
        .get(index)
        .or_else(|| mock.replies.last())
        .cloned()
        .expect("at least one scripted reply");

    match reply {
        Reply::Sse(chunks) => sse_response(chunk_stream(chunks).boxed()),
        Reply::Raw(chunks) => sse_response(
            futures_util::stream::iter(chunks.into_iter().map(|chunk| Ok(Bytes::from(chunk))))
                .boxed(),
        ),
        Reply::SseThenHang(chunks) => {
            sse_response(chunk_stream(chunks).chain(futures_util::stream::pending()).boxed())
        }
        Reply::SseThenReset(chunks) => {
            let reset = futures_util::stream::once(async {
                // Let the server flush what was already sent before failing.
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "upstream went away",
                ))
            });
            sse_response(chunk_stream(chunks).chain(reset).boxed())
        }
        Reply::Json(value) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .expect("json response"),
        Reply::Status(status, body) => Response::builder()
            .status(StatusCode::from_u16(status).expect("status"))
            .body(Body::from(body))
            .expect("status response"),
    }
}

fn chunk_stream(
    chunks: Vec<String>,
) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    futures_util::stream::iter(chunks.into_iter().map(|chunk| Ok(Bytes::from(chunk))))
}

fn sse_response(body: BoxStream<'static, Result<Bytes, std::io::Error>>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(body))
        .expect("sse response")
}

/// Serve `replies` in order from `POST /v1/chat/completions`; the last reply
/// repeats once the script runs out.
pub async fn spawn_chat_upstream(replies: Vec<Reply>) -> MockUpstream {
    let state = Arc::new(MockState {
        replies,
        served: AtomicUsize::new(0),
        requests: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    MockUpstream {
        base_url: format!("http://{addr}/v1"),
        state,
        server,
    }
}

/// `data: <json>\n\n`.
pub fn data(value: &Value) -> String {
    format!("data: {value}\n\n")
}

pub fn done() -> String {
    "data: [DONE]\n\n".to_string()
}

pub fn content_chunk(text: &str) -> Value {
    serde_json::json!({
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {"content": text}}]
    })
}

pub fn finish_chunk(reason: &str) -> Value {
    serde_json::json!({
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {}, "finish_reason": reason}]
    })
}

/// A complete SSE body answering with `text` in the given pieces.
pub fn text_reply(pieces: &[&str]) -> Reply {
    let mut chunks: Vec<String> = pieces.iter().map(|p| data(&content_chunk(p))).collect();
    chunks.push(data(&finish_chunk("stop")));
    chunks.push(done());
    Reply::Sse(chunks)
}

/// A complete SSE body requesting one `search` tool call.
pub fn tool_call_reply(id: &str) -> Reply {
    Reply::Sse(vec![
        data(&serde_json::json!({
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": id, "type": "function",
                 "function": {"name": "search", "arguments": "{\"q\":"}}
            ]}}]
        })),
        data(&serde_json::json!({
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"x\"}"}}
            ]}}]
        })),
        data(&finish_chunk("tool_calls")),
        done(),
    ])
}
