//! Text generation backend trait and a scriptable mock.

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{LlmError, Result};
use crate::types::{CompletionRequest, CompletionResponse, StopReason, Usage};

// ─────────────────────────────────────────────────────────────────────────────
// Shared Retry Logic
// ─────────────────────────────────────────────────────────────────────────────

/// Execute an async operation with exponential backoff retry.
///
/// Retries only on transient errors (network failures, rate limits).
/// Non-retryable errors are returned immediately.
pub async fn with_retry<F, Fut, T>(
    max_retries: u32,
    initial_backoff: Duration,
    backend_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff = initial_backoff;
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() || attempt >= max_retries => return Err(e),
            Err(e) => {
                let wait = e.retry_after().unwrap_or(backoff);
                attempt += 1;
                tracing::warn!(
                    backend = backend_name,
                    attempt,
                    max_retries,
                    backoff_ms = wait.as_millis() as u64,
                    error = %e,
                    "Request failed, retrying"
                );
                tokio::time::sleep(wait).await;
                backoff *= 2;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming Types
// ─────────────────────────────────────────────────────────────────────────────

/// A streaming response from a text generation backend.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send + 'static>>;

/// Events emitted during streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Message started.
    MessageStart { id: String, model: String },
    /// A fragment of generated text.
    TextDelta(String),
    /// Generation finished with final usage stats.
    MessageDelta {
        stop_reason: StopReason,
        usage: Usage,
    },
    /// Message complete.
    MessageStop,
    /// Keep-alive.
    Ping,
    /// Provider reported an error in-stream.
    Error { message: String },
}

impl StreamEvent {
    /// Returns true if this is an error event.
    pub fn is_error(&self) -> bool {
        matches!(self, StreamEvent::Error { .. })
    }

    /// Returns true if this is the final event in a message.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::MessageStop | StreamEvent::Error { .. })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LLM Backend Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A text generation service.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Execute a completion request and return the full response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Execute a completion request and return a stream of events.
    async fn complete_stream(&self, request: CompletionRequest) -> Result<ResponseStream>;

    /// Get the name of this backend.
    fn name(&self) -> &str;

    /// Check if the backend is available and properly configured.
    async fn health_check(&self) -> Result<()>;
}

/// A backend that can be shared across threads.
pub type SharedBackend = Arc<dyn LlmBackend>;

// ─────────────────────────────────────────────────────────────────────────────
// Mock Backend
// ─────────────────────────────────────────────────────────────────────────────

/// A scripted streaming response for [`MockBackend`].
#[derive(Debug, Clone, Default)]
pub struct MockStream {
    /// Text fragments emitted in order.
    pub chunks: Vec<String>,
    /// If set, the stream fails with this message after all chunks.
    pub fail_with: Option<String>,
    /// Delay before each chunk.
    pub chunk_delay: Option<Duration>,
    /// Stop reason reported at the end of a successful stream.
    pub stop_reason: Option<StopReason>,
    /// If true the stream ends without a terminal stop event.
    pub truncate: bool,
}

impl MockStream {
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Fail with a network error after the scripted chunks.
    pub fn failing_with(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn with_stop_reason(mut self, reason: StopReason) -> Self {
        self.stop_reason = Some(reason);
        self
    }

    /// End the byte stream without a stop event.
    pub fn truncated(mut self) -> Self {
        self.truncate = true;
        self
    }
}

/// A mock backend for testing.
///
/// One-shot completions and streams are scripted independently and consumed
/// in order. When no stream is scripted, `complete_stream` falls back to the
/// next completion and emits it as a single fragment.
#[derive(Debug, Default)]
pub struct MockBackend {
    name: String,
    responses: Mutex<VecDeque<Result<CompletionResponse>>>,
    streams: Mutex<VecDeque<MockStream>>,
    request_log: Mutex<Vec<CompletionRequest>>,
    stream_log: Mutex<Vec<CompletionRequest>>,
}

impl MockBackend {
    /// Create a mock backend returning the given completions in order.
    pub fn new(responses: Vec<CompletionResponse>) -> Self {
        Self {
            name: "mock".to_string(),
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            ..Default::default()
        }
    }

    /// Create a mock backend with a single text response.
    pub fn with_text(text: impl Into<String>) -> Self {
        Self::new(vec![mock_response(text)])
    }

    /// Create a mock backend that streams the given fragments once.
    pub fn with_chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Vec::new()).push_stream(MockStream::chunks(chunks))
    }

    /// Queue a one-shot completion.
    pub fn push_text(self, text: impl Into<String>) -> Self {
        self.responses.lock().push_back(Ok(mock_response(text)));
        self
    }

    /// Queue a failing one-shot completion.
    pub fn push_error(self, error: LlmError) -> Self {
        self.responses.lock().push_back(Err(error));
        self
    }

    /// Queue a scripted stream.
    pub fn push_stream(self, stream: MockStream) -> Self {
        self.streams.lock().push_back(stream);
        self
    }

    /// Get all requests that were made to this backend.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.request_log.lock().clone()
    }

    /// Get the number of requests made.
    pub fn request_count(&self) -> usize {
        self.request_log.lock().len()
    }

    /// Requests that went through `complete_stream`, whatever their `stream` flag.
    pub fn stream_requests(&self) -> Vec<CompletionRequest> {
        self.stream_log.lock().clone()
    }
}

fn mock_response(text: impl Into<String>) -> CompletionResponse {
    CompletionResponse::new(
        "mock_msg",
        "mock-model",
        text,
        StopReason::EndTurn,
        Usage::new(10, 20),
    )
}

fn scripted_events(script: MockStream) -> ResponseStream {
    Box::pin(futures::stream::unfold(
        (script, 0usize, false),
        |(script, index, finished)| async move {
            if finished {
                return None;
            }
            if index == 0 {
                let start = StreamEvent::MessageStart {
                    id: "mock_msg".to_string(),
                    model: "mock-model".to_string(),
                };
                return Some((Ok(start), (script, 1, false)));
            }

            let chunk_index = index - 1;
            if let Some(chunk) = script.chunks.get(chunk_index).cloned() {
                if let Some(delay) = script.chunk_delay {
                    tokio::time::sleep(delay).await;
                }
                return Some((Ok(StreamEvent::TextDelta(chunk)), (script, index + 1, false)));
            }

            let tail = chunk_index - script.chunks.len();
            if let Some(message) = script.fail_with.clone() {
                return Some((Err(LlmError::Network(message)), (script, index, true)));
            }
            if script.truncate {
                return None;
            }
            match tail {
                0 => {
                    let delta = StreamEvent::MessageDelta {
                        stop_reason: script.stop_reason.unwrap_or(StopReason::EndTurn),
                        usage: Usage::new(10, script.chunks.len() as u32),
                    };
                    Some((Ok(delta), (script, index + 1, false)))
                }
                _ => Some((Ok(StreamEvent::MessageStop), (script, index, true))),
            }
        },
    ))
}

#[async_trait]
impl LlmBackend for MockBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.request_log.lock().push(request);

        self.responses.lock().pop_front().unwrap_or_else(|| {
            Err(LlmError::Backend(
                "MockBackend: no more responses available".to_string(),
            ))
        })
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<ResponseStream> {
        self.stream_log.lock().push(request.clone());
        let scripted = self.streams.lock().pop_front();
        if let Some(script) = scripted {
            self.request_log.lock().push(request);
            return Ok(scripted_events(script));
        }

        let response = self.complete(request).await?;
        Ok(scripted_events(
            MockStream::chunks([response.text()])
                .with_stop_reason(response.stop_reason.unwrap_or(StopReason::EndTurn)),
        ))
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
