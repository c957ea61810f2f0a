//! One request/response exchange against `<endpoint>/chat/completions`.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ChatError;
use crate::protocol::{CompletionRequest, CompletionResponse};
use crate::stream::{chunk_stream, line_stream, semantic_event_stream, SemanticEvent};
use crate::transport::{Endpoint, HttpTransport};

/// Lazy, single-pass sequence of semantic events for one streamed completion.
pub type SemanticEventStream = BoxStream<'static, Result<SemanticEvent, ChatError>>;

/// Upstream error bodies longer than this are cut before being shown.
const ERROR_BODY_PREVIEW_CHARS: usize = 512;

/// Result of [`CompletionsClient::handle_completion`].
pub enum CompletionOutcome {
    Response(CompletionResponse),
    Stream(SemanticEventStream),
}

impl std::fmt::Debug for CompletionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionOutcome::Response(response) => {
                f.debug_tuple("Response").field(response).finish()
            }
            CompletionOutcome::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Completion client bound to one endpoint.
#[derive(Clone)]
pub struct CompletionsClient {
    transport: Arc<HttpTransport>,
    endpoint: Arc<Endpoint>,
}

impl CompletionsClient {
    #[must_use]
    pub fn new(transport: Arc<HttpTransport>, endpoint: Arc<Endpoint>) -> Self {
        Self {
            transport,
            endpoint,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Perform exactly one exchange, streaming or not depending on
    /// `request.stream`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Request`] for a non-success status (or a streamed
    /// response declared empty), [`ChatError::Transport`] when the request
    /// cannot be sent, [`ChatError::Decode`] for an unreadable non-streaming
    /// body and [`ChatError::Aborted`] when `cancel` fires before the response
    /// arrives.
    pub async fn handle_completion(
        &self,
        request: CompletionRequest,
        cancel: Option<CancellationToken>,
    ) -> Result<CompletionOutcome, ChatError> {
        if request.stream {
            let cancel = cancel.unwrap_or_default();
            self.stream(request, cancel)
                .await
                .map(CompletionOutcome::Stream)
        } else {
            self.complete(request, cancel.as_ref())
                .await
                .map(CompletionOutcome::Response)
        }
    }

    /// Non-streaming completion: the whole JSON body as one response.
    ///
    /// # Errors
    ///
    /// See [`CompletionsClient::handle_completion`].
    pub async fn complete(
        &self,
        mut request: CompletionRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<CompletionResponse, ChatError> {
        request.stream = false;
        let body = encode_request(&request)?;
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "sending completion request"
        );

        let exchange = async {
            let response = self
                .transport
                .send(
                    http::Method::POST,
                    self.endpoint.chat_completions_url(),
                    self.endpoint.json_headers(),
                    Some(reqwest::Body::from(body)),
                )
                .await?;
            let response = ensure_success(response).await?;
            let bytes = response.bytes().await?;
            serde_json::from_slice::<CompletionResponse>(&bytes)
                .map_err(|err| ChatError::Decode(format!("Invalid completion response: {err}")))
        };
        run_cancellable(cancel, exchange).await
    }

    /// Streaming completion: Line Framer → Event Decoder → Delta Aggregator
    /// over the response body, bound to `cancel`.
    ///
    /// Once `cancel` fires the returned stream stops reading and ends without
    /// an error item.
    ///
    /// # Errors
    ///
    /// See [`CompletionsClient::handle_completion`].
    pub async fn stream(
        &self,
        mut request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<SemanticEventStream, ChatError> {
        request.stream = true;
        let body = encode_request(&request)?;
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "opening completion stream"
        );

        let exchange = async {
            let response = self
                .transport
                .send(
                    http::Method::POST,
                    self.endpoint.chat_completions_url(),
                    self.endpoint.sse_headers(),
                    Some(reqwest::Body::from(body)),
                )
                .await?;
            let response = ensure_success(response).await?;
            if response.content_length() == Some(0) {
                return Err(ChatError::Request {
                    status: response.status().as_u16(),
                    message: "response has no body".to_string(),
                });
            }
            Ok(response)
        };
        let response = run_cancellable(Some(&cancel), exchange).await?;

        let lines = line_stream(response.bytes_stream(), cancel.clone());
        let events = semantic_event_stream(chunk_stream(lines));
        Ok(events.take_until(cancel.cancelled_owned()).boxed())
    }
}

fn encode_request(request: &CompletionRequest) -> Result<Bytes, ChatError> {
    serde_json::to_vec(request)
        .map(Bytes::from)
        .map_err(|err| ChatError::Internal(format!("Failed to encode completion request: {err}")))
}

async fn run_cancellable<T, F>(cancel: Option<&CancellationToken>, exchange: F) -> Result<T, ChatError>
where
    F: Future<Output = Result<T, ChatError>>,
{
    let Some(cancel) = cancel else {
        return exchange.await;
    };
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ChatError::Aborted),
        result = exchange => result,
    }
}

/// Pass a successful response through, or turn it into [`ChatError::Request`].
///
/// # Errors
///
/// Returns [`ChatError::Request`] for any non-2xx status.
pub(crate) async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ChatError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    Err(ChatError::Request {
        status: status.as_u16(),
        message: upstream_error_message(status, &body),
    })
}

/// Prefer the upstream's own error text; fall back to the status reason.
fn upstream_error_message(status: http::StatusCode, body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        let message = value
            .pointer("/error/message")
            .or_else(|| value.get("error"))
            .or_else(|| value.get("detail"))
            .or_else(|| value.get("message"))
            .and_then(serde_json::Value::as_str);
        if let Some(message) = message.filter(|m| !m.trim().is_empty()) {
            return message.to_string();
        }
    }
    let reason = status.canonical_reason().unwrap_or("");
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() || text.starts_with('{') {
        return reason.to_string();
    }
    let mut preview: String = text.chars().take(ERROR_BODY_PREVIEW_CHARS).collect();
    if preview.len() < text.len() {
        preview.push('…');
    }
    if reason.is_empty() {
        preview
    } else {
        format!("{reason}: {preview}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_from_openai_shape() {
        let body = br#"{"error":{"message":"Invalid API key","type":"auth"}}"#;
        assert_eq!(
            upstream_error_message(http::StatusCode::UNAUTHORIZED, body),
            "Invalid API key"
        );
    }

    #[test]
    fn test_error_message_from_detail_string() {
        let body = br#"{"detail":"model not found"}"#;
        assert_eq!(
            upstream_error_message(http::StatusCode::NOT_FOUND, body),
            "model not found"
        );
    }

    #[test]
    fn test_error_message_falls_back_to_reason() {
        assert_eq!(
            upstream_error_message(http::StatusCode::INTERNAL_SERVER_ERROR, b""),
            "Internal Server Error"
        );
        assert_eq!(
            upstream_error_message(http::StatusCode::BAD_GATEWAY, br#"{"unexpected":1}"#),
            "Bad Gateway"
        );
    }

    #[test]
    fn test_error_message_includes_plain_text_body() {
        assert_eq!(
            upstream_error_message(http::StatusCode::SERVICE_UNAVAILABLE, b"overloaded\n"),
            "Service Unavailable: overloaded"
        );
    }

    #[tokio::test]
    async fn test_run_cancellable_reports_abort() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), ChatError> =
            run_cancellable(Some(&cancel), std::future::pending()).await;
        assert!(matches!(result, Err(ChatError::Aborted)));
    }
}
