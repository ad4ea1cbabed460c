//! Text generation and embedding backends for Medscribe.
//!
//! The core abstraction is the [`LlmBackend`] trait: a one-shot
//! [`complete`](LlmBackend::complete) used for query construction and a
//! streaming [`complete_stream`](LlmBackend::complete_stream) used for report
//! generation.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  LlmBackend trait                       │
//! │  - complete() -> Response               │
//! │  - complete_stream() -> Stream<Event>   │
//! └─────────────────────────────────────────┘
//!                    │
//!          ┌─────────┴─────────┐
//!          ▼                   ▼
//!   ┌──────────────┐    ┌─────────────┐
//!   │ OpenAI-compat│    │ MockBackend │
//!   │ (OpenAI/Groq/│    │  (scripted) │
//!   │  Ollama)     │    └─────────────┘
//!   └──────────────┘
//! ```

pub mod backend;
pub mod embeddings;
pub mod error;
pub mod openai;
pub mod types;

pub use backend::{
    LlmBackend, MockBackend, MockStream, ResponseStream, SharedBackend, StreamEvent, with_retry,
};
pub use error::{LlmError, Result};
pub use types::{
    CompletionRequest, CompletionResponse, Message, Role, StopReason, Usage,
};

pub use embeddings::{
    Embedder, EmbedderSpec, MockEmbedder, OpenAiEmbedder, SharedEmbedder,
    build_embedder, cosine_similarity,
};

pub use openai::{OpenAiBackend, OpenAiConfig};
