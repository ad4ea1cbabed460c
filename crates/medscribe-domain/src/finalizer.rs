//! Persistence of completed reports, incident records and the recovery queue.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use medscribe_store::{SharedDocumentStore, SharedVectorIndex};
use medscribe_types::config::defaults;
use medscribe_types::{
    CompletionStatus, GenerationIncident, GenerationResult, PersistedReport, ReportMetadata,
    TemplateKind, Timestamp,
};

use crate::error::{DomainError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

/// Everything needed to persist one completed generation.
#[derive(Debug, Clone)]
pub struct FinalizeRequest {
    pub kind: TemplateKind,
    pub metadata: ReportMetadata,
    pub result: GenerationResult,
    pub author: Option<String>,
    /// Raw signature image, stored as a content-addressed blob.
    pub signature: Option<Vec<u8>>,
    pub template_version: String,
}

/// Details of a generation that did not complete. Never carries body text.
#[derive(Debug, Clone)]
pub struct IncidentDraft {
    pub kind: TemplateKind,
    pub metadata: ReportMetadata,
    pub author: Option<String>,
    pub status: CompletionStatus,
    pub reason: String,
    pub streamed_bytes: usize,
}

impl IncidentDraft {
    fn into_incident(self) -> GenerationIncident {
        GenerationIncident {
            id: uuid::Uuid::new_v4().to_string(),
            kind: self.kind,
            metadata: self.metadata,
            author: self.author,
            status: self.status,
            reason: self.reason,
            streamed_bytes: self.streamed_bytes,
            created_at: chrono::Utc::now(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recovery Queue
// ─────────────────────────────────────────────────────────────────────────────

/// A completed report that could not be saved, parked for an operator retry.
#[derive(Debug, Clone, Serialize)]
pub struct PendingReport {
    pub pending_id: String,
    pub report: PersistedReport,
    #[serde(skip)]
    pub signature: Option<Vec<u8>>,
    pub last_error: String,
    pub attempts: u32,
    pub parked_at: Timestamp,
}

/// In-memory queue of reports awaiting a successful save.
///
/// Holds at most `capacity` entries; parking into a full queue drops the
/// entry parked longest ago.
#[derive(Debug)]
pub struct RecoveryQueue {
    pending: Mutex<HashMap<String, PendingReport>>,
    capacity: usize,
}

impl Default for RecoveryQueue {
    fn default() -> Self {
        Self::with_capacity(defaults::MAX_PENDING_REPORTS)
    }
}

impl RecoveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn park(&self, entry: PendingReport) {
        let mut pending = self.pending.lock();
        if !pending.contains_key(&entry.pending_id) && pending.len() >= self.capacity {
            let oldest = pending
                .values()
                .min_by_key(|e| e.parked_at)
                .map(|e| e.pending_id.clone());
            if let Some(evicted) = oldest.and_then(|id| pending.remove(&id)) {
                error!(
                    pending_id = %evicted.pending_id,
                    attempts = evicted.attempts,
                    capacity = self.capacity,
                    "Recovery queue full, dropping oldest unsaved report"
                );
            }
        }
        pending.insert(entry.pending_id.clone(), entry);
    }

    fn take(&self, pending_id: &str) -> Option<PendingReport> {
        self.pending.lock().remove(pending_id)
    }

    /// Parked reports, oldest first.
    pub fn list(&self) -> Vec<PendingReport> {
        let mut entries: Vec<_> = self.pending.lock().values().cloned().collect();
        entries.sort_by_key(|e| e.parked_at);
        entries
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Finalizer
// ─────────────────────────────────────────────────────────────────────────────

/// Writes completed reports to the document store.
pub struct PersistenceFinalizer {
    store: SharedDocumentStore,
    index: Option<SharedVectorIndex>,
    recovery: RecoveryQueue,
}

impl PersistenceFinalizer {
    pub fn new(store: SharedDocumentStore) -> Self {
        Self {
            store,
            index: None,
            recovery: RecoveryQueue::new(),
        }
    }

    /// Bound the recovery queue to `capacity` unsaved reports.
    pub fn with_recovery_capacity(mut self, capacity: usize) -> Self {
        self.recovery = RecoveryQueue::with_capacity(capacity);
        self
    }

    /// Add finalized reports to `index` so later retrievals can find them.
    pub fn with_report_indexing(mut self, index: SharedVectorIndex) -> Self {
        self.index = Some(index);
        self
    }

    pub fn store(&self) -> &SharedDocumentStore {
        &self.store
    }

    pub fn recovery(&self) -> &RecoveryQueue {
        &self.recovery
    }

    /// Persist a completed generation as one record.
    ///
    /// Only `complete` results are accepted. On a store failure the report is
    /// parked and `PersistenceFailed` carries its recovery id.
    pub async fn finalize(&self, request: FinalizeRequest) -> Result<PersistedReport> {
        if !request.result.is_complete() {
            return Err(DomainError::InvalidRequest(format!(
                "refusing to persist a {} generation",
                request.result.status.as_str()
            )));
        }

        let report = PersistedReport {
            id: uuid::Uuid::new_v4().to_string(),
            kind: request.kind,
            metadata: request.metadata,
            text: request.result.text,
            status: CompletionStatus::Complete,
            author: request.author,
            generated_by: request.kind.origin_tag().to_string(),
            template_version: request.template_version,
            signature_ref: None,
            created_at: chrono::Utc::now(),
        };

        let pending = PendingReport {
            pending_id: report.id.clone(),
            report,
            signature: request.signature,
            last_error: String::new(),
            attempts: 0,
            parked_at: chrono::Utc::now(),
        };

        self.save(pending).await
    }

    /// Retry saving a parked report without regenerating it.
    pub async fn retry(&self, pending_id: &str) -> Result<PersistedReport> {
        let pending = self
            .recovery
            .take(pending_id)
            .ok_or_else(|| DomainError::UnknownPending(pending_id.to_string()))?;

        info!(pending_id, attempts = pending.attempts, "Retrying parked report");
        self.save(pending).await
    }

    async fn save(&self, mut pending: PendingReport) -> Result<PersistedReport> {
        pending.attempts += 1;

        if let Some(ref signature) = pending.signature
            && pending.report.signature_ref.is_none()
        {
            match self.store.put_blob(signature).await {
                Ok(blob) => pending.report.signature_ref = Some(blob),
                Err(e) => return Err(self.park(pending, e.to_string())),
            }
        }

        if let Err(e) = self.store.insert(&pending.report).await {
            return Err(self.park(pending, e.to_string()));
        }

        let report = pending.report;
        info!(
            report_id = %report.id,
            kind = %report.kind,
            bytes = report.text.len(),
            template_version = %report.template_version,
            "Report finalized"
        );

        if let Some(ref index) = self.index {
            match index.add_document(&report.text, Some(&report.id)).await {
                Ok(passage_id) => debug!(report_id = %report.id, passage_id, "Indexed report"),
                Err(e) => warn!(report_id = %report.id, error = %e, "Failed to index report"),
            }
        }

        Ok(report)
    }

    fn park(&self, mut pending: PendingReport, reason: String) -> DomainError {
        error!(
            pending_id = %pending.pending_id,
            attempts = pending.attempts,
            reason = %reason,
            "Persistence failed, report parked for recovery"
        );
        let pending_id = pending.pending_id.clone();
        pending.last_error = reason.clone();
        self.recovery.park(pending);
        DomainError::PersistenceFailed { pending_id, reason }
    }

    /// Record a generation that did not complete. Failures are logged only.
    pub async fn record_incident(&self, draft: IncidentDraft) {
        let incident = draft.into_incident();
        match self.store.record_incident(&incident).await {
            Ok(id) => debug!(incident_id = %id, status = incident.status.as_str(), "Incident recorded"),
            Err(e) => error!(error = %e, reason = %incident.reason, "Failed to record incident"),
        }
    }
}
