//! OpenAI-compatible chat completions backend.
//!
//! One client covers OpenAI, Groq, Ollama and any self-hosted server that
//! speaks `/chat/completions` with server-sent events.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{Client, Response, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backend::{LlmBackend, ResponseStream, StreamEvent, with_retry};
use crate::error::{LlmError, Result, parse_retry_after};
use crate::types::{CompletionRequest, CompletionResponse, StopReason, Usage};

const OPENAI_BASE: &str = "https://api.openai.com/v1";
const GROQ_BASE: &str = "https://api.groq.com/openai/v1";
const GROQ_MODEL: &str = "llama-3.3-70b-versatile";
const OLLAMA_BASE: &str = "http://localhost:11434/v1";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Connection settings for an OpenAI-compatible service.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Sent as a bearer token when present and non-empty.
    pub api_key: Option<String>,
    pub base_url: String,
    /// Replaces the model named in each request when set.
    pub model: Option<String>,
    pub timeout: Duration,
    /// Retries for connection errors and 429s. Doubles `retry_backoff` each time.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Label used in logs and [`LlmBackend::name`].
    pub name: String,
}

impl OpenAiConfig {
    fn preset(name: &str, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.to_string(),
            model: None,
            timeout: Duration::from_secs(300),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            name: name.to_string(),
        }
    }

    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::preset("openai", OPENAI_BASE, Some(api_key.into()))
    }

    pub fn groq(api_key: impl Into<String>) -> Self {
        Self {
            model: Some(GROQ_MODEL.to_string()),
            ..Self::preset("groq", GROQ_BASE, Some(api_key.into()))
        }
    }

    /// Local Ollama. No key, and a longer timeout for CPU inference.
    pub fn ollama() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            ..Self::preset("ollama", OLLAMA_BASE, None)
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    pub(crate) fn bearer(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|key| !key.is_empty())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend
// ─────────────────────────────────────────────────────────────────────────────

pub struct OpenAiBackend {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    /// POST a chat request. Non-2xx answers become classified errors.
    async fn post_chat(&self, chat: &ChatRequest<'_>) -> Result<Response> {
        let mut builder = self
            .client
            .post(self.config.endpoint("chat/completions"))
            .json(chat);
        if let Some(key) = self.config.bearer() {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from_response(response).await)
        }
    }
}

async fn error_from_response(response: Response) -> LlmError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = response.text().await.unwrap_or_default();
    classify_error(status, &body, retry_after)
}

/// Map an HTTP status and body to an [`LlmError`].
fn classify_error(status: u16, body: &str, retry_after: Option<Duration>) -> LlmError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| format!("HTTP {}: {}", status, body.trim()));

    match status {
        401 | 403 => LlmError::Auth(message),
        429 => LlmError::rate_limit(message, retry_after),
        400 | 404 | 422 => LlmError::InvalidRequest(message),
        _ => LlmError::Backend(message),
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let chat = ChatRequest::new(&request, self.config.model.as_deref(), false);
        tracing::debug!(
            backend = %self.config.name,
            model = %chat.model,
            messages = chat.messages.len(),
            "Chat completion"
        );

        let (this, chat) = (self, &chat);
        let response = with_retry(
            self.config.max_retries,
            self.config.retry_backoff,
            &self.config.name,
            move || async move { this.post_chat(chat).await },
        )
        .await?;

        let body = response.text().await?;
        let parsed: ChatResponse = serde_json::from_str(&body)?;
        Ok(parsed.into_completion())
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<ResponseStream> {
        let chat = ChatRequest::new(&request, self.config.model.as_deref(), true);
        tracing::debug!(
            backend = %self.config.name,
            model = %chat.model,
            messages = chat.messages.len(),
            "Opening chat stream"
        );

        // Retries cover connecting only. A body that has started is not replayed.
        let (this, chat) = (self, &chat);
        let response = with_retry(
            self.config.max_retries,
            self.config.retry_backoff,
            &self.config.name,
            move || async move { this.post_chat(chat).await },
        )
        .await?;

        Ok(event_stream(
            response.bytes_stream().map(|read| read.map_err(LlmError::from)),
        ))
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    async fn health_check(&self) -> Result<()> {
        let mut builder = self.client.get(self.config.endpoint("models"));
        if let Some(key) = self.config.bearer() {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        // A rate-limited service is still reachable.
        if response.status().is_success() || response.status().as_u16() == 429 {
            Ok(())
        } else {
            Err(error_from_response(response).await)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

impl<'a> ChatRequest<'a> {
    fn new(request: &'a CompletionRequest, model_override: Option<&'a str>, stream: bool) -> Self {
        let system = request.system.as_deref().map(|content| ChatMessage {
            role: "system",
            content,
        });
        let turns = request.messages.iter().map(|m| ChatMessage {
            role: m.role.as_str(),
            content: &m.content,
        });

        Self {
            model: model_override.unwrap_or(&request.model),
            messages: system.into_iter().chain(turns).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream,
            stop: &request.stop_sequences,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl ChatResponse {
    fn into_completion(self) -> CompletionResponse {
        let choice = self.choices.into_iter().next();
        let stop_reason = choice
            .as_ref()
            .and_then(|c| c.finish_reason.as_deref())
            .map_or(StopReason::EndTurn, StopReason::from_finish_reason);
        let text = choice.and_then(|c| c.message.content).unwrap_or_default();
        let usage = self
            .usage
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        CompletionResponse::new(self.id, self.model, text, stop_reason, usage)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: Option<ChunkDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Server-sent events
// ─────────────────────────────────────────────────────────────────────────────

/// Splits a `text/event-stream` body into `data:` payloads.
///
/// Buffers raw bytes so a UTF-8 sequence split across reads stays intact.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn next_data(&mut self) -> Option<String> {
        loop {
            let end = self.buffer.iter().position(|b| *b == b'\n')?;
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(data) = line.trim().strip_prefix("data:") {
                return Some(data.trim().to_string());
            }
        }
    }
}

/// Translate an SSE body into [`StreamEvent`]s.
///
/// `[DONE]` becomes `MessageStop`. A body that just ends yields no stop
/// event, which callers treat as truncation.
fn event_stream(bytes: impl Stream<Item = Result<Bytes>> + Send + 'static) -> ResponseStream {
    Box::pin(async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut decoder = SseDecoder::default();
        let mut started = false;

        'read: while let Some(read) = bytes.next().await {
            match read {
                Ok(chunk) => decoder.push(&chunk),
                Err(e) => {
                    yield Err(e);
                    break 'read;
                }
            }

            while let Some(data) = decoder.next_data() {
                if data == "[DONE]" {
                    yield Ok(StreamEvent::MessageStop);
                    break 'read;
                }
                if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&data) {
                    yield Ok(StreamEvent::Error { message: envelope.error.message });
                    break 'read;
                }
                let Ok(ChatChunk { id, model, choices }) = serde_json::from_str(&data) else {
                    tracing::debug!(data = %data, "Skipping unparseable SSE payload");
                    continue;
                };

                if !started {
                    started = true;
                    yield Ok(StreamEvent::MessageStart { id, model });
                }

                let Some(choice) = choices.into_iter().next() else {
                    continue;
                };
                if let Some(text) = choice.delta.and_then(|d| d.content)
                    && !text.is_empty()
                {
                    yield Ok(StreamEvent::TextDelta(text));
                }
                if let Some(reason) = choice.finish_reason {
                    yield Ok(StreamEvent::MessageDelta {
                        stop_reason: StopReason::from_finish_reason(&reason),
                        usage: Usage::default(),
                    });
                }
            }
        }
    })
}
