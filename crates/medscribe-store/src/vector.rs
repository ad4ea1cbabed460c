//! Vector index over prior reports using sqlite-vec.

use std::path::Path;
use std::sync::{Arc, Once};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zerocopy::IntoBytes;

use medscribe_llm::SharedEmbedder;

use crate::error::{Result, StoreError};

// ─────────────────────────────────────────────────────────────────────────────
// Trait
// ─────────────────────────────────────────────────────────────────────────────

/// One passage returned by a similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub id: String,
    pub text: String,
    /// Where the passage came from (file path, report id).
    pub source: Option<String>,
    /// Distance from the query vector (lower = more similar).
    pub distance: f32,
}

/// Nearest-neighbour lookup over embedded text.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// The `top_k` passages most similar to `query`, most relevant first.
    async fn similarity_search(&self, query: &str, top_k: usize) -> Result<Vec<Passage>>;

    /// Embed and index a document. Returns its passage id.
    async fn add_document(&self, text: &str, source: Option<&str>) -> Result<String>;

    async fn count(&self) -> Result<usize>;
}

/// A vector index shared across tasks.
pub type SharedVectorIndex = Arc<dyn VectorIndex>;

// ─────────────────────────────────────────────────────────────────────────────
// Extension
// ─────────────────────────────────────────────────────────────────────────────

static VEC_INIT: Once = Once::new();

/// Register sqlite-vec for every connection opened afterwards.
pub fn init_vector_extension() {
    VEC_INIT.call_once(|| {
        use rusqlite::ffi::sqlite3_auto_extension;
        use sqlite_vec::sqlite3_vec_init;

        unsafe {
            #[allow(clippy::missing_transmute_annotations)]
            sqlite3_auto_extension(Some(std::mem::transmute(sqlite3_vec_init as *const ())));
        }
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Vector index storing passages in SQLite and vectors in a vec0 table.
pub struct SqliteVectorIndex {
    conn: Arc<Mutex<Connection>>,
    embedder: SharedEmbedder,
}

impl std::fmt::Debug for SqliteVectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteVectorIndex")
            .field("embedder", &self.embedder.name())
            .field("dims", &self.embedder.dimensions())
            .finish()
    }
}

impl SqliteVectorIndex {
    pub fn open(path: impl AsRef<Path>, embedder: SharedEmbedder) -> Result<Self> {
        init_vector_extension();
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
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let index = Self::with_connection(conn, embedder)?;
        info!(path = %path.display(), "Vector index opened");
        Ok(index)
    }

    /// Create an in-memory index (useful for testing).
    pub fn open_in_memory(embedder: SharedEmbedder) -> Result<Self> {
        init_vector_extension();
        Self::with_connection(Connection::open_in_memory()?, embedder)
    }

    fn with_connection(conn: Connection, embedder: SharedEmbedder) -> Result<Self> {
        let version: String = conn.query_row("SELECT vec_version()", [], |row| row.get(0))?;
        let dims = embedder.dimensions();

        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS passages (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                source TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS index_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS passage_embeddings USING vec0(
                passage_id TEXT PRIMARY KEY,
                embedding float[{dims}]
            );
            "#
        ))?;

        // vec0 fixes its width at creation, so a different embedder needs a fresh index.
        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM index_meta WHERE key = 'dims'",
                [],
                |row| row.get(0),
            )
            .ok();
        match stored {
            Some(value) if value != dims.to_string() => {
                return Err(StoreError::InvalidData(format!(
                    "index was built with {} dimensions, embedder '{}' produces {}",
                    value,
                    embedder.name(),
                    dims
                )));
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT INTO index_meta (key, value) VALUES ('dims', ?1)",
                    params![dims.to_string()],
                )?;
            }
        }

        debug!(sqlite_vec = %version, dims, "Vector index ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            embedder,
        })
    }

    pub fn embedder(&self) -> &SharedEmbedder {
        &self.embedder
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&mut conn.lock()))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn knn_query(conn: &Connection, embedding: &[f32], top_k: usize) -> Result<Vec<Passage>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT p.id, p.text, p.source, knn.distance
        FROM (
            SELECT passage_id, distance
            FROM passage_embeddings
            WHERE embedding MATCH ?1
            ORDER BY distance
            LIMIT ?2
        ) AS knn
        JOIN passages p ON p.id = knn.passage_id
        ORDER BY knn.distance
        "#,
    )?;

    let mut rows = stmt.query(params![embedding.as_bytes(), top_k as i64])?;
    let mut passages = Vec::new();
    while let Some(row) = rows.next()? {
        passages.push(Passage {
            id: row.get(0)?,
            text: row.get(1)?,
            source: row.get(2)?,
            distance: row.get(3)?,
        });
    }
    Ok(passages)
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn similarity_search(&self, query: &str, top_k: usize) -> Result<Vec<Passage>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let embedding = self.embedder.embed(query).await?;

        let passages = self
            .with_conn(move |conn| knn_query(conn, &embedding, top_k))
            .await?;

        debug!(found = passages.len(), top_k, "Similarity search");
        Ok(passages)
    }

    async fn add_document(&self, text: &str, source: Option<&str>) -> Result<String> {
        let embedding = self.embedder.embed(text).await?;
        let id = uuid::Uuid::new_v4().to_string();

        let row_id = id.clone();
        let row_text = text.to_string();
        let row_source = source.map(str::to_string);
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO passages (id, text, source, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![row_id, row_text, row_source, chrono::Utc::now().to_rfc3339()],
            )?;
            tx.execute(
                "INSERT INTO passage_embeddings (passage_id, embedding) VALUES (?1, ?2)",
                params![row_id, embedding.as_bytes()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        debug!(passage_id = %id, source = source.unwrap_or("-"), "Indexed document");
        Ok(id)
    }

    async fn count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM passages", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }
}
