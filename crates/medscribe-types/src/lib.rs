//! Shared types for the Medscribe report pipeline.

pub mod config;
pub mod report;
pub mod turn;

pub use config::{
    ConfigProvider, GenerationConfigProvider, HasGenerationConfig, HasRetrievalConfig,
    HasSessionConfig, RetrievalConfigProvider, SessionConfigProvider, defaults as config_defaults,
};
pub use report::{
    BlobRef, CompletionStatus, GenerationIncident, GenerationResult, NOT_SPECIFIED,
    PersistedReport, ReportMetadata, ReportQuery, TemplateKind,
};
pub use turn::{ConversationTurn, SessionId, TurnRole};

/// Timestamp type used across records.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Current UTC time.
pub fn now() -> Timestamp {
    chrono::Utc::now()
}
