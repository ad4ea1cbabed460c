//! Streaming report generation.
//!
//! One call to [`ReportOrchestrator::stream`] drives a single task through
//! `Started → Retrieving → Prompting → Generating → {Completed | Failed}`.
//! Text fragments are yielded to the caller as they arrive and fed into an
//! accumulator. Only a clean end of stream appends the turn pair to the
//! session and hands the accumulated text to the finalizer.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use medscribe_llm::{SharedBackend, StopReason, StreamEvent};
use medscribe_session::SessionStore;
use medscribe_store::{SharedDocumentStore, SharedVectorIndex};
use medscribe_types::{
    CompletionStatus, ConversationTurn, GenerationConfigProvider, GenerationResult,
    HasGenerationConfig, HasRetrievalConfig, PersistedReport, ReportMetadata, SessionId,
    TemplateKind,
};

use crate::error::{DomainError, Result};
use crate::finalizer::{FinalizeRequest, IncidentDraft, PersistenceFinalizer};
use crate::prompt::PromptAssembler;
use crate::retriever::Retriever;

/// Prefix of the in-band error marker written into the text stream.
pub const MARKER_PREFIX: &str = "[[medscribe:error:";

// ─────────────────────────────────────────────────────────────────────────────
// Stream Chunk
// ─────────────────────────────────────────────────────────────────────────────

/// A chunk emitted during a generation stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// A fragment of report text.
    Text { content: String },
    /// A terminal error. Generation and persistence failures carry distinct codes.
    Error { code: String, message: String },
    /// The stream is over.
    Done { outcome: GenerationOutcome },
}

impl StreamChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn error(err: &DomainError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// Raw bytes for a plain-text transport. `Done` writes nothing.
    pub fn to_wire(&self) -> Option<String> {
        match self {
            Self::Text { content } => Some(content.clone()),
            Self::Error { code, message } => {
                Some(format!("\n{MARKER_PREFIX}{code}]] {message}\n"))
            }
            Self::Done { .. } => None,
        }
    }
}

/// A boxed stream of generation chunks.
pub type ReportStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send + 'static>>;

// ─────────────────────────────────────────────────────────────────────────────
// Request / Outcome
// ─────────────────────────────────────────────────────────────────────────────

/// Pipeline state for one stream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Started,
    Retrieving,
    Prompting,
    Generating,
    Completed,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Started => "started",
            Phase::Retrieving => "retrieving",
            Phase::Prompting => "prompting",
            Phase::Generating => "generating",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }
}

/// Input for one report generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Existing session to continue. A fresh session is created when absent.
    pub session_id: Option<SessionId>,
    pub kind: TemplateKind,
    pub metadata: ReportMetadata,
    pub instruction: String,
    pub author: Option<String>,
    pub signature: Option<Vec<u8>>,
}

impl GenerationRequest {
    pub fn new(kind: TemplateKind, instruction: impl Into<String>) -> Self {
        Self {
            session_id: None,
            kind,
            metadata: ReportMetadata::default(),
            instruction: instruction.into(),
            author: None,
            signature: None,
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_metadata(mut self, metadata: ReportMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = Some(signature);
        self
    }
}

/// Summary delivered in the final `Done` chunk.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    pub session_id: SessionId,
    pub status: CompletionStatus,
    /// Set when the report was saved.
    pub report: Option<PersistedReport>,
    /// Set when the text completed but the save failed.
    pub pending_id: Option<String>,
    pub phases: Vec<Phase>,
    pub context_passages: usize,
    pub retrieval_degraded: bool,
    pub streamed_bytes: usize,
}

impl GenerationOutcome {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            status: CompletionStatus::Failed,
            report: None,
            pending_id: None,
            phases: Vec::new(),
            context_passages: 0,
            retrieval_degraded: false,
            streamed_bytes: 0,
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!(session_id = %self.session_id, phase = phase.as_str(), "Generation phase");
        self.phases.push(phase);
    }
}

/// A started generation: the session it runs in and its chunk stream.
pub struct StartedGeneration {
    pub session_id: SessionId,
    pub chunks: ReportStream,
}

/// Output of a fully drained generation.
#[derive(Debug, Clone)]
pub struct CollectedGeneration {
    /// Everything written to the wire, error markers included.
    pub wire_text: String,
    pub error: Option<(String, String)>,
    pub outcome: Option<GenerationOutcome>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Disconnect Guard
// ─────────────────────────────────────────────────────────────────────────────

/// Records an incident if the stream is dropped before it settles: `partial`
/// once text has been streamed, `failed` otherwise.
struct DisconnectGuard {
    armed: Option<(Arc<PersistenceFinalizer>, IncidentDraft)>,
    streamed_bytes: usize,
}

impl DisconnectGuard {
    fn new(finalizer: Arc<PersistenceFinalizer>, draft: IncidentDraft) -> Self {
        Self {
            armed: Some((finalizer, draft)),
            streamed_bytes: 0,
        }
    }

    fn disarm(&mut self) {
        self.armed = None;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let Some((finalizer, mut draft)) = self.armed.take() else {
            return;
        };
        draft.status = if self.streamed_bytes > 0 {
            CompletionStatus::Partial
        } else {
            CompletionStatus::Failed
        };
        draft.streamed_bytes = self.streamed_bytes;
        warn!(
            kind = %draft.kind,
            bytes = self.streamed_bytes,
            outcome = draft.status.as_str(),
            "Client disconnected mid-stream"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { finalizer.record_incident(draft).await });
            }
            Err(_) => warn!("No runtime available to record disconnect incident"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

/// Drives retrieval, prompt assembly, streaming generation and persistence.
#[derive(Clone)]
pub struct ReportOrchestrator {
    sessions: SessionStore,
    retriever: Retriever,
    assembler: Arc<PromptAssembler>,
    backend: SharedBackend,
    finalizer: Arc<PersistenceFinalizer>,
    config: GenerationConfigProvider,
}

impl ReportOrchestrator {
    pub fn new(
        sessions: SessionStore,
        backend: SharedBackend,
        index: SharedVectorIndex,
        store: SharedDocumentStore,
    ) -> Self {
        let config = GenerationConfigProvider::default();
        let assembler = Arc::new(PromptAssembler::new());
        let retriever = Retriever::new(backend.clone(), index, assembler.clone(), &config.model);
        Self {
            sessions,
            retriever,
            assembler,
            backend,
            finalizer: Arc::new(PersistenceFinalizer::new(store)),
            config,
        }
    }

    pub fn with_generation_config<C: HasGenerationConfig>(mut self, config: &C) -> Self {
        self.config = GenerationConfigProvider {
            model: config.model().to_string(),
            max_tokens: config.max_tokens(),
            temperature: config.temperature(),
            wall_clock_limit: config.wall_clock_limit(),
        };
        self.retriever = self.retriever.with_model(config.model());
        self
    }

    pub fn with_retrieval_config<C: HasRetrievalConfig>(mut self, config: &C) -> Self {
        self.retriever = self.retriever.with_config(config);
        self
    }

    /// Replace the prompt assembler, e.g. one loaded from an override directory.
    pub fn with_assembler(mut self, assembler: PromptAssembler) -> Self {
        self.assembler = Arc::new(assembler);
        self.retriever = self.retriever.with_assembler(self.assembler.clone());
        self
    }

    pub fn with_finalizer(mut self, finalizer: PersistenceFinalizer) -> Self {
        self.finalizer = Arc::new(finalizer);
        self
    }

    pub fn with_index(mut self, index: SharedVectorIndex) -> Self {
        self.retriever = self.retriever.with_index(index);
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn finalizer(&self) -> &Arc<PersistenceFinalizer> {
        &self.finalizer
    }

    pub fn template_version(&self) -> &str {
        self.assembler.version()
    }

    /// Start a generation.
    ///
    /// Fails fast on an empty instruction or an unknown session, before any
    /// chunk is produced.
    pub async fn stream(&self, request: GenerationRequest) -> Result<StartedGeneration> {
        if request.instruction.trim().is_empty() {
            return Err(DomainError::InvalidRequest(
                "instruction must not be empty".to_string(),
            ));
        }

        let session_id = match request.session_id.clone() {
            Some(id) => id,
            None => self.sessions.create_session().await,
        };
        let history = self.sessions.history(&session_id).await?;

        info!(
            session_id = %session_id,
            kind = %request.kind,
            history_turns = history.len(),
            "Starting report generation"
        );

        let chunks = self.clone().run(session_id.clone(), request, history);
        Ok(StartedGeneration { session_id, chunks })
    }

    /// Run a generation to the end and collect its output.
    pub async fn generate(&self, request: GenerationRequest) -> Result<CollectedGeneration> {
        let started = self.stream(request).await?;
        Ok(collect(started.chunks).await)
    }

    fn run(
        self,
        session_id: SessionId,
        request: GenerationRequest,
        history: Vec<ConversationTurn>,
    ) -> ReportStream {
        Box::pin(async_stream::stream! {
            let limit = self.config.wall_clock_limit;
            let deadline = Instant::now() + limit;
            let mut outcome = GenerationOutcome::new(session_id.clone());
            let mut guard = DisconnectGuard::new(
                self.finalizer.clone(),
                IncidentDraft {
                    kind: request.kind,
                    metadata: request.metadata.clone(),
                    author: request.author.clone(),
                    status: CompletionStatus::Failed,
                    reason: "client disconnected".to_string(),
                    streamed_bytes: 0,
                },
            );
            let mut accumulated = String::new();

            outcome.enter(Phase::Started);

            let failure: Option<DomainError> = 'generate: {
                outcome.enter(Phase::Retrieving);
                let context = self.retriever.retrieve(&request.instruction, &history).await;
                outcome.context_passages = context.len();
                outcome.retrieval_degraded = context.degraded;

                outcome.enter(Phase::Prompting);
                let envelope = match self.assembler.assemble(
                    request.kind,
                    &request.metadata,
                    &context.texts(),
                    &request.instruction,
                    &history,
                ) {
                    Ok(envelope) => envelope,
                    Err(e) => break 'generate Some(e),
                };

                outcome.enter(Phase::Generating);
                let completion = envelope.to_request(
                    &self.config.model,
                    self.config.max_tokens,
                    self.config.temperature,
                );
                let mut events =
                    match tokio::time::timeout_at(deadline, self.backend.complete_stream(completion))
                        .await
                    {
                        Ok(Ok(events)) => events,
                        Ok(Err(e)) => break 'generate Some(DomainError::GenerationFailed(e.to_string())),
                        Err(_) => break 'generate Some(DomainError::GenerationTimedOut(limit)),
                    };

                let mut stop_reason = None;
                let mut stopped = false;
                loop {
                    let event = match tokio::time::timeout_at(deadline, events.next()).await {
                        Err(_) => break 'generate Some(DomainError::GenerationTimedOut(limit)),
                        Ok(None) => break,
                        Ok(Some(Err(e))) => {
                            break 'generate Some(DomainError::GenerationFailed(e.to_string()));
                        }
                        Ok(Some(Ok(event))) => event,
                    };
                    match event {
                        StreamEvent::TextDelta(text) => {
                            if text.is_empty() {
                                continue;
                            }
                            guard.streamed_bytes += text.len();
                            accumulated.push_str(&text);
                            yield StreamChunk::text(text);
                        }
                        StreamEvent::MessageDelta { stop_reason: reason, .. } => {
                            stop_reason = Some(reason);
                        }
                        StreamEvent::MessageStop => {
                            stopped = true;
                            break;
                        }
                        StreamEvent::Error { message } => {
                            break 'generate Some(DomainError::GenerationFailed(message));
                        }
                        StreamEvent::MessageStart { .. } | StreamEvent::Ping => {}
                    }
                }

                if !stopped {
                    break 'generate Some(DomainError::GenerationFailed(
                        "stream ended without a stop signal".to_string(),
                    ));
                }
                if matches!(stop_reason, Some(StopReason::MaxTokens)) {
                    break 'generate Some(DomainError::GenerationFailed(
                        "output truncated at the token limit".to_string(),
                    ));
                }
                None
            };

            outcome.streamed_bytes = guard.streamed_bytes;

            if let Some(err) = failure {
                outcome.enter(Phase::Failed);
                let status = if guard.streamed_bytes > 0 {
                    CompletionStatus::Partial
                } else {
                    CompletionStatus::Failed
                };
                outcome.status = status;

                error!(
                    session_id = %session_id,
                    kind = %request.kind,
                    code = err.code(),
                    bytes = outcome.streamed_bytes,
                    error = %err,
                    "Report generation failed"
                );
                let finalizer = self.finalizer.clone();
                let draft = IncidentDraft {
                    kind: request.kind,
                    metadata: request.metadata.clone(),
                    author: request.author.clone(),
                    status,
                    reason: err.to_string(),
                    streamed_bytes: outcome.streamed_bytes,
                };
                // The task outlives this stream, so the guard can stand down.
                let recording = tokio::spawn(async move { finalizer.record_incident(draft).await });
                guard.disarm();
                if let Err(e) = recording.await {
                    warn!(session_id = %session_id, error = %e, "Incident task aborted");
                }

                yield StreamChunk::error(&err);
                yield StreamChunk::Done { outcome };
                return;
            }

            outcome.status = CompletionStatus::Complete;

            let turns = [
                ConversationTurn::user(request.instruction.clone()),
                ConversationTurn::assistant(accumulated.clone()),
            ];
            let finalize = FinalizeRequest {
                kind: request.kind,
                metadata: request.metadata.clone(),
                result: GenerationResult {
                    text: accumulated,
                    status: CompletionStatus::Complete,
                },
                author: request.author.clone(),
                signature: request.signature.clone(),
                template_version: self.assembler.version().to_string(),
            };
            // History append and save run on one task, so a disconnect from
            // here on cannot cancel either of them.
            let sessions = self.sessions.clone();
            let finalizer = self.finalizer.clone();
            let owner = session_id.clone();
            let completion = tokio::spawn(async move {
                if let Err(e) = sessions.append_all(&owner, turns).await {
                    warn!(session_id = %owner, error = %e, "Session vanished before history append");
                }
                finalizer.finalize(finalize).await
            });
            guard.disarm();

            let saved = match completion.await {
                Ok(result) => result,
                Err(e) => Err(DomainError::PersistenceFailed {
                    pending_id: String::new(),
                    reason: format!("finalize task aborted: {e}"),
                }),
            };

            match saved {
                Ok(report) => outcome.report = Some(report),
                Err(err) => {
                    if let DomainError::PersistenceFailed { ref pending_id, .. } = err
                        && !pending_id.is_empty()
                    {
                        outcome.pending_id = Some(pending_id.clone());
                    }
                    yield StreamChunk::error(&err);
                }
            }

            outcome.enter(Phase::Completed);
            info!(
                session_id = %session_id,
                kind = %request.kind,
                bytes = outcome.streamed_bytes,
                saved = outcome.report.is_some(),
                "Report generation completed"
            );
            yield StreamChunk::Done { outcome };
        })
    }
}

/// Drain a stream, concatenating its wire output.
pub async fn collect(mut chunks: ReportStream) -> CollectedGeneration {
    let mut collected = CollectedGeneration {
        wire_text: String::new(),
        error: None,
        outcome: None,
    };
    while let Some(chunk) = chunks.next().await {
        if let Some(wire) = chunk.to_wire() {
            collected.wire_text.push_str(&wire);
        }
        match chunk {
            StreamChunk::Error { code, message } => collected.error = Some((code, message)),
            StreamChunk::Done { outcome } => collected.outcome = Some(outcome),
            StreamChunk::Text { .. } => {}
        }
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use medscribe_llm::{MockBackend, MockStream};
    use medscribe_session::StoreConfig;
    use medscribe_store::{MockDocumentStore, MockVectorIndex};
    use medscribe_types::TurnRole;

    struct Harness {
        orchestrator: ReportOrchestrator,
        backend: Arc<MockBackend>,
        store: Arc<MockDocumentStore>,
        index: Arc<MockVectorIndex>,
    }

    fn harness(backend: MockBackend, index: MockVectorIndex) -> Harness {
        harness_with_sessions(SessionStore::new(StoreConfig::default()), backend, index)
    }

    fn harness_with_sessions(
        sessions: SessionStore,
        backend: MockBackend,
        index: MockVectorIndex,
    ) -> Harness {
        let backend = Arc::new(backend);
        let store = Arc::new(MockDocumentStore::new());
        let index = Arc::new(index);
        let orchestrator =
            ReportOrchestrator::new(sessions, backend.clone(), index.clone(), store.clone());
        Harness {
            orchestrator,
            backend,
            store,
            index,
        }
    }

    fn request(instruction: &str) -> GenerationRequest {
        GenerationRequest::new(TemplateKind::Correction, instruction)
            .with_metadata(ReportMetadata::default().with_patient_name("Jane Doe"))
            .with_author("dr.house")
    }

    #[tokio::test]
    async fn test_round_trip_persists_concatenated_chunks() {
        let h = harness(
            MockBackend::with_chunks(["Hello", " ", "World"]),
            MockVectorIndex::new(["prior report"]),
        );

        let started = h.orchestrator.stream(request("fix this")).await.unwrap();
        let session_id = started.session_id.clone();
        let collected = collect(started.chunks).await;

        assert_eq!(collected.wire_text, "Hello World");
        assert!(collected.error.is_none());

        let reports = h.store.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].text, "Hello World");
        assert_eq!(reports[0].status, CompletionStatus::Complete);
        assert_eq!(reports[0].generated_by, "correction_flow");
        assert_eq!(reports[0].template_version, "v1");

        let history = h.orchestrator.sessions().history(&session_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], ConversationTurn::user("fix this"));
        assert_eq!(history[1], ConversationTurn::assistant("Hello World"));

        let outcome = collected.outcome.unwrap();
        assert_eq!(outcome.status, CompletionStatus::Complete);
        assert_eq!(outcome.context_passages, 1);
        assert_eq!(
            outcome.phases,
            vec![
                Phase::Started,
                Phase::Retrieving,
                Phase::Prompting,
                Phase::Generating,
                Phase::Completed
            ]
        );
    }

    #[tokio::test]
    async fn test_prompt_carries_context_and_metadata() {
        let h = harness(
            MockBackend::with_chunks(["ok"]),
            MockVectorIndex::new(["Echo showed EF 55%"]),
        );
        h.orchestrator.generate(request("draft it")).await.unwrap();

        let sent = h.backend.stream_requests();
        assert_eq!(sent.len(), 1);
        let system = sent[0].system.clone().unwrap();
        assert!(system.contains("Echo showed EF 55%"));
        assert!(system.contains("Jane Doe"));
        assert!(system.contains("Age: Not specified"));
        assert_eq!(sent[0].last_user_text(), Some("draft it"));
    }

    #[tokio::test]
    async fn test_mid_stream_failure_persists_nothing() {
        let h = harness(
            MockBackend::new(vec![])
                .push_stream(MockStream::chunks(["Hello", " Wor"]).failing_with("connection reset")),
            MockVectorIndex::default(),
        );

        let started = h.orchestrator.stream(request("fix this")).await.unwrap();
        let session_id = started.session_id.clone();
        let collected = collect(started.chunks).await;

        assert!(h.store.reports().is_empty());
        assert!(collected.wire_text.starts_with("Hello Wor"));
        assert!(collected
            .wire_text
            .contains("\n[[medscribe:error:generation_failed]] "));
        let (code, _) = collected.error.unwrap();
        assert_eq!(code, "generation_failed");

        let history = h.orchestrator.sessions().history(&session_id).await.unwrap();
        assert!(history.iter().all(|t| t.role != TurnRole::Assistant));
        assert!(history.is_empty());

        let incidents = h.store.recorded_incidents();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].status, CompletionStatus::Partial);
        assert_eq!(incidents[0].streamed_bytes, "Hello Wor".len());

        let outcome = collected.outcome.unwrap();
        assert_eq!(outcome.status, CompletionStatus::Partial);
        assert_eq!(outcome.phases.last(), Some(&Phase::Failed));
    }

    #[tokio::test]
    async fn test_failure_before_any_text_is_failed() {
        let h = harness(
            MockBackend::new(vec![]).push_stream(MockStream::chunks(Vec::<String>::new()).failing_with("503")),
            MockVectorIndex::default(),
        );
        let collected = h.orchestrator.generate(request("x")).await.unwrap();
        assert_eq!(collected.outcome.unwrap().status, CompletionStatus::Failed);
        assert_eq!(h.store.recorded_incidents()[0].status, CompletionStatus::Failed);
    }

    #[tokio::test]
    async fn test_retrieval_failure_still_reaches_generating() {
        let h = harness(
            MockBackend::with_chunks(["Report"]),
            MockVectorIndex::unavailable(),
        );
        let collected = h.orchestrator.generate(request("write it")).await.unwrap();

        let outcome = collected.outcome.unwrap();
        assert!(outcome.retrieval_degraded);
        assert_eq!(outcome.context_passages, 0);
        assert!(outcome.phases.contains(&Phase::Generating));
        assert_eq!(outcome.status, CompletionStatus::Complete);
        assert_eq!(h.store.reports()[0].text, "Report");
        assert_eq!(h.index.queries().len(), 1);
    }

    #[tokio::test]
    async fn test_truncated_stream_is_generation_failure() {
        let h = harness(
            MockBackend::new(vec![]).push_stream(MockStream::chunks(["The patient"]).truncated()),
            MockVectorIndex::default(),
        );
        let collected = h.orchestrator.generate(request("x")).await.unwrap();
        assert_eq!(collected.error.unwrap().0, "generation_failed");
        assert!(h.store.reports().is_empty());
    }

    #[tokio::test]
    async fn test_max_tokens_stop_is_generation_failure() {
        let h = harness(
            MockBackend::new(vec![])
                .push_stream(MockStream::chunks(["cut"]).with_stop_reason(StopReason::MaxTokens)),
            MockVectorIndex::default(),
        );
        let collected = h.orchestrator.generate(request("x")).await.unwrap();
        assert!(collected.error.unwrap().1.contains("token limit"));
        assert!(h.store.reports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wall_clock_cap_times_out() {
        let h = harness(
            MockBackend::new(vec![]).push_stream(
                MockStream::chunks(["a", "b", "c"]).with_chunk_delay(Duration::from_secs(10)),
            ),
            MockVectorIndex::default(),
        );
        let orchestrator = h.orchestrator.with_generation_config(&GenerationConfigProvider {
            wall_clock_limit: Duration::from_secs(15),
            ..Default::default()
        });

        let collected = orchestrator.generate(request("x")).await.unwrap();
        assert_eq!(collected.wire_text.split('\n').next(), Some("a"));
        assert_eq!(collected.error.unwrap().0, "timeout");
        assert!(h.store.reports().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session_fails_fast() {
        let h = harness(MockBackend::with_chunks(["x"]), MockVectorIndex::default());
        let err = h
            .orchestrator
            .stream(request("x").with_session(SessionId::from("missing")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DomainError::UnknownSession(_)));
        assert_eq!(h.backend.request_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_instruction_rejected() {
        let h = harness(MockBackend::with_chunks(["x"]), MockVectorIndex::default());
        let err = h.orchestrator.stream(request("   ")).await.err().unwrap();
        assert_eq!(err.code(), "invalid_request");
    }

    #[tokio::test]
    async fn test_follow_up_turn_sees_history() {
        let h = harness(
            MockBackend::with_chunks(["First draft"])
                .push_text("condensed follow-up query")
                .push_stream(MockStream::chunks(["Second draft"])),
            MockVectorIndex::new(["p"]),
        );

        let first = h.orchestrator.stream(request("draft")).await.unwrap();
        let session_id = first.session_id.clone();
        collect(first.chunks).await;

        let second = h
            .orchestrator
            .stream(request("shorten it").with_session(session_id.clone()))
            .await
            .unwrap();
        collect(second.chunks).await;

        let history = h.orchestrator.sessions().history(&session_id).await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[3].content, "Second draft");

        assert_eq!(
            h.index.queries(),
            vec!["draft".to_string(), "condensed follow-up query".to_string()]
        );
        let streamed = h.backend.stream_requests();
        assert_eq!(streamed[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_distinct_and_recoverable() {
        let h = harness(MockBackend::with_chunks(["Saved later"]), MockVectorIndex::default());
        h.store.fail_inserts("disk full");

        let started = h.orchestrator.stream(request("x")).await.unwrap();
        let session_id = started.session_id.clone();
        let collected = collect(started.chunks).await;

        assert!(collected
            .wire_text
            .starts_with("Saved later\n[[medscribe:error:persistence_failed]] "));
        let outcome = collected.outcome.unwrap();
        assert_eq!(outcome.status, CompletionStatus::Complete);
        let pending_id = outcome.pending_id.unwrap();

        // The text completed, so the session still records it.
        let history = h.orchestrator.sessions().history(&session_id).await.unwrap();
        assert_eq!(history.len(), 2);

        h.store.clear_failure();
        let report = h.orchestrator.finalizer().retry(&pending_id).await.unwrap();
        assert_eq!(report.text, "Saved later");
        assert_eq!(h.store.reports().len(), 1);
    }

    #[tokio::test]
    async fn test_signature_is_stored_with_report() {
        let h = harness(MockBackend::with_chunks(["Signed"]), MockVectorIndex::default());
        let collected = h
            .orchestrator
            .generate(request("x").with_signature(b"sig".to_vec()))
            .await
            .unwrap();
        let report = collected.outcome.unwrap().report.unwrap();
        assert!(report.signature_ref.is_some());
    }

    #[tokio::test]
    async fn test_client_disconnect_records_partial_incident() {
        let h = harness(
            MockBackend::new(vec![])
                .push_stream(MockStream::chunks(["one ", "two ", "three"])),
            MockVectorIndex::default(),
        );

        let started = h.orchestrator.stream(request("x")).await.unwrap();
        let session_id = started.session_id.clone();
        let mut chunks = started.chunks;
        let first = chunks.next().await.unwrap();
        assert_eq!(first.to_wire().as_deref(), Some("one "));
        drop(chunks);

        for _ in 0..50 {
            if !h.store.recorded_incidents().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let incidents = h.store.recorded_incidents();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].status, CompletionStatus::Partial);
        assert_eq!(incidents[0].reason, "client disconnected");
        assert_eq!(incidents[0].streamed_bytes, 4);
        assert!(h.store.reports().is_empty());
        assert!(h.orchestrator.sessions().history(&session_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_before_any_text_records_failed_incident() {
        let h = harness(
            MockBackend::with_chunks(["never sent"]),
            MockVectorIndex::new(["p"]).with_delay(Duration::from_millis(500)),
        );

        let started = h.orchestrator.stream(request("x")).await.unwrap();
        let mut chunks = started.chunks;
        // Still retrieving when the client goes away.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), chunks.next())
                .await
                .is_err()
        );
        drop(chunks);

        for _ in 0..50 {
            if !h.store.recorded_incidents().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let incidents = h.store.recorded_incidents();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].status, CompletionStatus::Failed);
        assert_eq!(incidents[0].reason, "client disconnected");
        assert_eq!(incidents[0].streamed_bytes, 0);
        assert!(h.store.reports().is_empty());
    }

    /// Yields one turn after blocking its thread, holding the session's
    /// history lock for the duration.
    struct SlowTurns {
        entered: Arc<std::sync::atomic::AtomicBool>,
        remaining: usize,
    }

    impl Iterator for SlowTurns {
        type Item = ConversationTurn;

        fn next(&mut self) -> Option<ConversationTurn> {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            self.entered.store(true, std::sync::atomic::Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(500));
            Some(ConversationTurn::user("concurrent note"))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_while_history_locked_still_saves_report() {
        let h = harness(
            MockBackend::with_chunks(["Complete report."]),
            MockVectorIndex::default(),
        );

        let started = h.orchestrator.stream(request("x")).await.unwrap();
        let session_id = started.session_id.clone();
        let mut chunks = started.chunks;
        let first = chunks.next().await.unwrap();
        assert_eq!(first.to_wire().as_deref(), Some("Complete report."));

        let entered = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let holder = {
            let sessions = h.orchestrator.sessions().clone();
            let session_id = session_id.clone();
            let turns = SlowTurns {
                entered: entered.clone(),
                remaining: 1,
            };
            tokio::spawn(async move { sessions.append_all(&session_id, turns).await })
        };
        while !entered.load(std::sync::atomic::Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Completion is queued behind the held lock; the client leaves now.
        assert!(
            tokio::time::timeout(Duration::from_millis(100), chunks.next())
                .await
                .is_err()
        );
        drop(chunks);

        assert_eq!(holder.await.unwrap().unwrap(), 1);
        for _ in 0..100 {
            if !h.store.reports().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let reports = h.store.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].text, "Complete report.");
        assert!(h.store.recorded_incidents().is_empty());

        let history = h.orchestrator.sessions().history(&session_id).await.unwrap();
        assert_eq!(
            history,
            vec![
                ConversationTurn::user("concurrent note"),
                ConversationTurn::user("x"),
                ConversationTurn::assistant("Complete report."),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_sessions_do_not_block_each_other() {
        let sessions = SessionStore::new(StoreConfig::default());
        let slow = harness_with_sessions(
            sessions.clone(),
            MockBackend::new(vec![]).push_stream(
                MockStream::chunks(["slow"]).with_chunk_delay(Duration::from_millis(500)),
            ),
            MockVectorIndex::default(),
        );
        let fast = harness_with_sessions(
            sessions.clone(),
            MockBackend::with_chunks(["fast"]),
            MockVectorIndex::default(),
        );

        let slow_run = slow.orchestrator.stream(request("slow")).await.unwrap();
        let fast_run = fast.orchestrator.stream(request("fast")).await.unwrap();

        let slow_task = tokio::spawn(collect(slow_run.chunks));
        let fast_done = tokio::time::timeout(Duration::from_millis(250), collect(fast_run.chunks))
            .await
            .expect("fast stream blocked by slow stream");
        assert_eq!(fast_done.wire_text, "fast");
        assert!(!slow_task.is_finished());

        let slow_done = slow_task.await.unwrap();
        assert_eq!(slow_done.wire_text, "slow");
        assert_eq!(sessions.len().await, 2);
    }

    #[test]
    fn test_chunk_wire_format() {
        let err = DomainError::GenerationFailed("boom".into());
        assert_eq!(
            StreamChunk::error(&err).to_wire().unwrap(),
            "\n[[medscribe:error:generation_failed]] Generation failed: boom\n"
        );
        assert_eq!(StreamChunk::text("x").to_wire().as_deref(), Some("x"));

        let json = serde_json::to_value(StreamChunk::text("hi")).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["content"], "hi");
    }
}
