//! Document store for persisted reports, incidents and signature blobs.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use medscribe_types::{
    BlobRef, CompletionStatus, GenerationIncident, PersistedReport, ReportMetadata, ReportQuery,
    TemplateKind,
};

use crate::error::{Result, StoreError};

// ─────────────────────────────────────────────────────────────────────────────
// Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Durable storage for the artifacts of the generation pipeline.
///
/// Records are flat key-value documents. Binary attachments are stored as
/// content-addressed blobs and referenced by [`BlobRef`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a report as a single atomic write. Returns its id.
    async fn insert(&self, report: &PersistedReport) -> Result<String>;

    /// Find reports matching every set field of `query`, newest first.
    async fn find(&self, query: &ReportQuery) -> Result<Vec<PersistedReport>>;

    async fn get(&self, id: &str) -> Result<Option<PersistedReport>>;

    /// Record a generation that did not complete.
    async fn record_incident(&self, incident: &GenerationIncident) -> Result<String>;

    /// Most recent incidents, newest first.
    async fn incidents(&self, limit: usize) -> Result<Vec<GenerationIncident>>;

    /// Store bytes under their SHA-256 digest. Storing the same bytes twice is a no-op.
    async fn put_blob(&self, bytes: &[u8]) -> Result<BlobRef>;

    async fn get_blob(&self, blob: &BlobRef) -> Result<Option<Vec<u8>>>;
}

/// A document store shared across tasks.
pub type SharedDocumentStore = Arc<dyn DocumentStore>;

/// Content address for a blob: lowercase SHA-256 hex.
pub fn blob_ref_for(bytes: &[u8]) -> BlobRef {
    BlobRef(hex::encode(Sha256::digest(bytes)))
}

/// Default page size for [`DocumentStore::find`].
pub const DEFAULT_FIND_LIMIT: usize = 50;

// ─────────────────────────────────────────────────────────────────────────────
// Schema
// ─────────────────────────────────────────────────────────────────────────────

const SCHEMA_VERSION: i32 = 2;

// ─────────────────────────────────────────────────────────────────────────────
// SQLite implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Document store backed by a single SQLite file in WAL mode.
pub struct SqliteDocumentStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDocumentStore").finish_non_exhaustive()
    }
}

impl SqliteDocumentStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|_| {
                StoreError::Database(rusqlite::Error::InvalidPath(path.to_path_buf()))
            })?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;

        info!(path = %path.display(), "Document store opened");
        Ok(store)
    }

    /// Create an in-memory store (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;
        debug!("In-memory document store created");
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Self::create_schema(&conn)
    }

    fn create_schema(conn: &Connection) -> Result<()> {
        let current_version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if current_version >= SCHEMA_VERSION {
            debug!(version = current_version, "Schema up to date");
            return Ok(());
        }

        info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrating document store schema"
        );

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS reports (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                patient_name TEXT,
                age TEXT,
                file_number TEXT,
                doctor_name TEXT,
                department TEXT,
                text TEXT NOT NULL,
                status TEXT NOT NULL,
                author TEXT,
                generated_by TEXT NOT NULL,
                template_version TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_reports_file_number ON reports(file_number);
            CREATE INDEX IF NOT EXISTS idx_reports_created_at ON reports(created_at);

            CREATE TABLE IF NOT EXISTS incidents (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                author TEXT,
                status TEXT NOT NULL,
                reason TEXT NOT NULL,
                streamed_bytes INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS blobs (
                hash TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                size INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )?;

        if current_version < 2 {
            Self::migrate_v2(conn)?;
        }

        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        info!(version = SCHEMA_VERSION, "Document store schema ready");
        Ok(())
    }

    /// Migration v2: signature references on reports.
    fn migrate_v2(conn: &Connection) -> Result<()> {
        let has_column = conn
            .prepare("SELECT signature_ref FROM reports LIMIT 0")
            .is_ok();
        if !has_column {
            conn.execute_batch("ALTER TABLE reports ADD COLUMN signature_ref TEXT;")?;
        }
        Ok(())
    }

    fn row_to_report(row: &Row<'_>) -> Result<PersistedReport> {
        let kind: String = row.get("kind")?;
        let status: String = row.get("status")?;
        let created_at: String = row.get("created_at")?;

        Ok(PersistedReport {
            id: row.get("id")?,
            kind: TemplateKind::parse(&kind)
                .ok_or_else(|| StoreError::InvalidData(format!("report kind '{}'", kind)))?,
            metadata: ReportMetadata {
                patient_name: row.get("patient_name")?,
                age: row.get("age")?,
                file_number: row.get("file_number")?,
                doctor_name: row.get("doctor_name")?,
                department: row.get("department")?,
            },
            text: row.get("text")?,
            status: CompletionStatus::parse(&status)
                .ok_or_else(|| StoreError::InvalidData(format!("report status '{}'", status)))?,
            author: row.get("author")?,
            generated_by: row.get("generated_by")?,
            template_version: row.get("template_version")?,
            signature_ref: row.get::<_, Option<String>>("signature_ref")?.map(BlobRef),
            created_at: parse_timestamp(&created_at)?,
        })
    }

    fn row_to_incident(row: &Row<'_>) -> Result<GenerationIncident> {
        let kind: String = row.get("kind")?;
        let status: String = row.get("status")?;
        let metadata: String = row.get("metadata")?;
        let created_at: String = row.get("created_at")?;
        let streamed_bytes: i64 = row.get("streamed_bytes")?;

        Ok(GenerationIncident {
            id: row.get("id")?,
            kind: TemplateKind::parse(&kind)
                .ok_or_else(|| StoreError::InvalidData(format!("incident kind '{}'", kind)))?,
            metadata: serde_json::from_str(&metadata)?,
            author: row.get("author")?,
            status: CompletionStatus::parse(&status)
                .ok_or_else(|| StoreError::InvalidData(format!("incident status '{}'", status)))?,
            reason: row.get("reason")?,
            streamed_bytes: usize::try_from(streamed_bytes).unwrap_or(0),
            created_at: parse_timestamp(&created_at)?,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| StoreError::InvalidData(format!("timestamp '{}': {}", value, e)))
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn insert(&self, report: &PersistedReport) -> Result<String> {
        let conn = self.conn.lock();
        let meta = &report.metadata;

        conn.execute(
            r#"
            INSERT INTO reports (
                id, kind, patient_name, age, file_number, doctor_name, department,
                text, status, author, generated_by, template_version, signature_ref, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                report.id,
                report.kind.as_str(),
                meta.patient_name,
                meta.age,
                meta.file_number,
                meta.doctor_name,
                meta.department,
                report.text,
                report.status.as_str(),
                report.author,
                report.generated_by,
                report.template_version,
                report.signature_ref.as_ref().map(BlobRef::as_str),
                report.created_at.to_rfc3339(),
            ],
        )?;

        debug!(report_id = %report.id, kind = %report.kind, "Inserted report");
        Ok(report.id.clone())
    }

    async fn find(&self, query: &ReportQuery) -> Result<Vec<PersistedReport>> {
        let conn = self.conn.lock();

        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(ref file_number) = query.file_number {
            clauses.push("file_number = ?");
            values.push(file_number.clone());
        }
        if let Some(ref patient_name) = query.patient_name {
            clauses.push("patient_name = ?");
            values.push(patient_name.clone());
        }
        if let Some(ref author) = query.author {
            clauses.push("author = ?");
            values.push(author.clone());
        }
        if let Some(kind) = query.kind {
            clauses.push("kind = ?");
            values.push(kind.as_str().to_string());
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let limit = query.limit.unwrap_or(DEFAULT_FIND_LIMIT) as i64;

        let sql = format!(
            "SELECT * FROM reports {} ORDER BY created_at DESC LIMIT {}",
            where_clause, limit
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(values.iter()))?;

        let mut reports = Vec::new();
        while let Some(row) = rows.next()? {
            reports.push(Self::row_to_report(row)?);
        }

        debug!(count = reports.len(), "Found reports");
        Ok(reports)
    }

    async fn get(&self, id: &str) -> Result<Option<PersistedReport>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM reports WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;

        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_report(row)?)),
            None => Ok(None),
        }
    }

    async fn record_incident(&self, incident: &GenerationIncident) -> Result<String> {
        let conn = self.conn.lock();
        let metadata = serde_json::to_string(&incident.metadata)?;

        conn.execute(
            r#"
            INSERT INTO incidents (id, kind, metadata, author, status, reason, streamed_bytes, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                incident.id,
                incident.kind.as_str(),
                metadata,
                incident.author,
                incident.status.as_str(),
                incident.reason,
                incident.streamed_bytes as i64,
                incident.created_at.to_rfc3339(),
            ],
        )?;

        debug!(incident_id = %incident.id, status = incident.status.as_str(), "Recorded incident");
        Ok(incident.id.clone())
    }

    async fn incidents(&self, limit: usize) -> Result<Vec<GenerationIncident>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM incidents ORDER BY created_at DESC LIMIT ?1")?;
        let mut rows = stmt.query(params![limit as i64])?;

        let mut incidents = Vec::new();
        while let Some(row) = rows.next()? {
            incidents.push(Self::row_to_incident(row)?);
        }
        Ok(incidents)
    }

    async fn put_blob(&self, bytes: &[u8]) -> Result<BlobRef> {
        let blob = blob_ref_for(bytes);
        let conn = self.conn.lock();

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO blobs (hash, data, size, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                blob.as_str(),
                bytes,
                bytes.len() as i64,
                chrono::Utc::now().to_rfc3339()
            ],
        )?;

        debug!(hash = %blob.as_str(), size = bytes.len(), new = inserted > 0, "Stored blob");
        Ok(blob)
    }

    async fn get_blob(&self, blob: &BlobRef) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let data = conn
            .query_row(
                "SELECT data FROM blobs WHERE hash = ?1",
                params![blob.as_str()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: &str, file_number: &str) -> PersistedReport {
        PersistedReport {
            id: id.to_string(),
            kind: TemplateKind::Generation,
            metadata: ReportMetadata::default()
                .with_patient_name("Jane Roe")
                .with_file_number(file_number),
            text: "Chief complaint: headache.".to_string(),
            status: CompletionStatus::Complete,
            author: Some("dr.smith".to_string()),
            generated_by: TemplateKind::Generation.origin_tag().to_string(),
            template_version: "v1".to_string(),
            signature_ref: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        let original = report("r1", "F-100");

        let id = store.insert(&original).await.unwrap();
        assert_eq!(id, "r1");

        let loaded = store.get("r1").await.unwrap().unwrap();
        assert_eq!(loaded.text, original.text);
        assert_eq!(loaded.metadata, original.metadata);
        assert_eq!(loaded.status, CompletionStatus::Complete);
        assert_eq!(loaded.generated_by, "template_flow");
    }

    #[tokio::test]
    async fn test_duplicate_id_fails() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        store.insert(&report("r1", "F-100")).await.unwrap();
        assert!(matches!(
            store.insert(&report("r1", "F-100")).await,
            Err(StoreError::Database(_))
        ));
    }

    #[tokio::test]
    async fn test_find_filters() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        store.insert(&report("r1", "F-100")).await.unwrap();
        store.insert(&report("r2", "F-200")).await.unwrap();
        let mut correction = report("r3", "F-100");
        correction.kind = TemplateKind::Correction;
        store.insert(&correction).await.unwrap();

        let by_file = store
            .find(&ReportQuery {
                file_number: Some("F-100".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_file.len(), 2);

        let by_kind = store
            .find(&ReportQuery {
                file_number: Some("F-100".into()),
                kind: Some(TemplateKind::Correction),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_kind.len(), 1);
        assert_eq!(by_kind[0].id, "r3");

        let all = store.find(&ReportQuery::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let limited = store
            .find(&ReportQuery {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_incidents_round_trip() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        let incident = GenerationIncident {
            id: "i1".into(),
            kind: TemplateKind::Correction,
            metadata: ReportMetadata::default().with_file_number("F-1"),
            author: None,
            status: CompletionStatus::Partial,
            reason: "client disconnected".into(),
            streamed_bytes: 42,
            created_at: chrono::Utc::now(),
        };
        store.record_incident(&incident).await.unwrap();

        let loaded = store.incidents(10).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].streamed_bytes, 42);
        assert_eq!(loaded[0].metadata.file_number.as_deref(), Some("F-1"));
        assert!(store.find(&ReportQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blobs_are_content_addressed() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        let a = store.put_blob(b"signature-bytes").await.unwrap();
        let b = store.put_blob(b"signature-bytes").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);

        let data = store.get_blob(&a).await.unwrap().unwrap();
        assert_eq!(data, b"signature-bytes");

        let missing = BlobRef("0".repeat(64));
        assert!(store.get_blob(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_signature_ref_persists() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        let blob = store.put_blob(b"png").await.unwrap();
        let mut signed = report("r1", "F-1");
        signed.signature_ref = Some(blob.clone());
        store.insert(&signed).await.unwrap();

        let loaded = store.get("r1").await.unwrap().unwrap();
        assert_eq!(loaded.signature_ref, Some(blob));
    }

    #[tokio::test]
    async fn test_reopen_file_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("medscribe.db");

        {
            let store = SqliteDocumentStore::open(&path).unwrap();
            store.insert(&report("r1", "F-1")).await.unwrap();
        }

        let store = SqliteDocumentStore::open(&path).unwrap();
        assert!(store.get("r1").await.unwrap().is_some());
    }
}
