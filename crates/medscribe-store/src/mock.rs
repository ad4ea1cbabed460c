//! In-memory test doubles with failure injection.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use medscribe_types::{BlobRef, GenerationIncident, PersistedReport, ReportQuery};

use crate::documents::{DEFAULT_FIND_LIMIT, DocumentStore, blob_ref_for};
use crate::error::{Result, StoreError};
use crate::vector::{Passage, VectorIndex};

// ─────────────────────────────────────────────────────────────────────────────
// Document store
// ─────────────────────────────────────────────────────────────────────────────

/// Document store kept in memory. Inserts can be made to fail on demand.
#[derive(Debug, Default)]
pub struct MockDocumentStore {
    reports: Mutex<Vec<PersistedReport>>,
    incidents: Mutex<Vec<GenerationIncident>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    fail_inserts: Mutex<Option<String>>,
}

impl MockDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent `insert` fails with `reason` until cleared.
    pub fn fail_inserts(&self, reason: impl Into<String>) {
        *self.fail_inserts.lock() = Some(reason.into());
    }

    pub fn clear_failure(&self) {
        *self.fail_inserts.lock() = None;
    }

    pub fn reports(&self) -> Vec<PersistedReport> {
        self.reports.lock().clone()
    }

    pub fn recorded_incidents(&self) -> Vec<GenerationIncident> {
        self.incidents.lock().clone()
    }
}

#[async_trait]
impl DocumentStore for MockDocumentStore {
    async fn insert(&self, report: &PersistedReport) -> Result<String> {
        if let Some(reason) = self.fail_inserts.lock().clone() {
            return Err(StoreError::Unavailable(reason));
        }
        self.reports.lock().push(report.clone());
        Ok(report.id.clone())
    }

    async fn find(&self, query: &ReportQuery) -> Result<Vec<PersistedReport>> {
        let reports = self.reports.lock();
        Ok(reports
            .iter()
            .rev()
            .filter(|r| {
                query
                    .file_number
                    .as_ref()
                    .is_none_or(|f| r.metadata.file_number.as_ref() == Some(f))
                    && query
                        .patient_name
                        .as_ref()
                        .is_none_or(|p| r.metadata.patient_name.as_ref() == Some(p))
                    && query.author.as_ref().is_none_or(|a| r.author.as_ref() == Some(a))
                    && query.kind.is_none_or(|k| r.kind == k)
            })
            .take(query.limit.unwrap_or(DEFAULT_FIND_LIMIT))
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<PersistedReport>> {
        Ok(self.reports.lock().iter().find(|r| r.id == id).cloned())
    }

    async fn record_incident(&self, incident: &GenerationIncident) -> Result<String> {
        self.incidents.lock().push(incident.clone());
        Ok(incident.id.clone())
    }

    async fn incidents(&self, limit: usize) -> Result<Vec<GenerationIncident>> {
        Ok(self.incidents.lock().iter().rev().take(limit).cloned().collect())
    }

    async fn put_blob(&self, bytes: &[u8]) -> Result<BlobRef> {
        let blob = blob_ref_for(bytes);
        self.blobs
            .lock()
            .entry(blob.as_str().to_string())
            .or_insert_with(|| bytes.to_vec());
        Ok(blob)
    }

    async fn get_blob(&self, blob: &BlobRef) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(blob.as_str()).cloned())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Vector index
// ─────────────────────────────────────────────────────────────────────────────

/// Vector index returning fixed passages, optionally slow or unreachable.
#[derive(Debug, Default)]
pub struct MockVectorIndex {
    passages: Mutex<Vec<Passage>>,
    unavailable: bool,
    delay: Option<Duration>,
    queries: Mutex<Vec<String>>,
}

impl MockVectorIndex {
    pub fn new<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let passages = texts
            .into_iter()
            .enumerate()
            .map(|(i, text)| Passage {
                id: format!("p{}", i),
                text: text.into(),
                source: None,
                distance: i as f32,
            })
            .collect();
        Self {
            passages: Mutex::new(passages),
            ..Default::default()
        }
    }

    /// Every search fails as if the index were unreachable.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Default::default()
        }
    }

    /// Sleep before answering each search.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queries received so far, in order.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    pub fn documents(&self) -> Vec<String> {
        self.passages.lock().iter().map(|p| p.text.clone()).collect()
    }
}

#[async_trait]
impl VectorIndex for MockVectorIndex {
    async fn similarity_search(&self, query: &str, top_k: usize) -> Result<Vec<Passage>> {
        self.queries.lock().push(query.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable {
            return Err(StoreError::Unavailable("vector index unreachable".into()));
        }
        Ok(self.passages.lock().iter().take(top_k).cloned().collect())
    }

    async fn add_document(&self, text: &str, source: Option<&str>) -> Result<String> {
        if self.unavailable {
            return Err(StoreError::Unavailable("vector index unreachable".into()));
        }
        let mut passages = self.passages.lock();
        let position = passages.len();
        let id = format!("p{}", position);
        passages.push(Passage {
            id: id.clone(),
            text: text.to_string(),
            source: source.map(str::to_string),
            distance: position as f32,
        });
        Ok(id)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.passages.lock().len())
    }
}
