//! The Medscribe report pipeline.
//!
//! ```text
//!   instruction + session
//!          │
//!          ▼
//!   ┌─────────────┐   query    ┌──────────────┐
//!   │  Retriever  │───────────▶│ Vector Index │
//!   └─────────────┘            └──────────────┘
//!          │ context
//!          ▼
//!   ┌─────────────────┐
//!   │ PromptAssembler │  (versioned templates)
//!   └─────────────────┘
//!          │ envelope
//!          ▼
//!   ┌────────────────────┐  chunks   ┌────────┐
//!   │ ReportOrchestrator │──────────▶│ caller │
//!   └────────────────────┘           └────────┘
//!          │ complete text only
//!          ▼
//!   ┌──────────────────────┐
//!   │ PersistenceFinalizer │──▶ Document Store / recovery queue
//!   └──────────────────────┘
//! ```

pub mod error;
pub mod finalizer;
pub mod orchestrator;
pub mod prompt;
pub mod retriever;

pub use error::{DomainError, Result};
pub use finalizer::{
    FinalizeRequest, IncidentDraft, PendingReport, PersistenceFinalizer, RecoveryQueue,
};
pub use orchestrator::{
    CollectedGeneration, GenerationOutcome, GenerationRequest, MARKER_PREFIX, Phase,
    ReportOrchestrator, ReportStream, StartedGeneration, StreamChunk, collect,
};
pub use prompt::{PromptAssembler, PromptEnvelope, TEMPLATE_VERSION};
pub use retriever::{RetrievalQuery, RetrievedContext, Retriever};
