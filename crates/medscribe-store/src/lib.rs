//! Storage collaborators of the report pipeline.
//!
//! - **Document store**: reports, generation incidents and content-addressed
//!   signature blobs in SQLite (WAL mode).
//! - **Vector index**: prior reports embedded with a [`medscribe_llm::Embedder`]
//!   and searched with sqlite-vec.
//!
//! ```text
//! ┌───────────────────────────────┐   ┌───────────────────────────────┐
//! │  SqliteDocumentStore          │   │  SqliteVectorIndex            │
//! │  reports / incidents / blobs  │   │  passages + vec0 embeddings   │
//! └───────────────────────────────┘   └───────────────────────────────┘
//! ```
//!
//! Both sit behind async traits so the pipeline can be exercised against the
//! in-memory doubles in [`mock`].

pub mod documents;
pub mod error;
pub mod mock;
pub mod vector;

pub use documents::{
    DEFAULT_FIND_LIMIT, DocumentStore, SharedDocumentStore, SqliteDocumentStore, blob_ref_for,
};
pub use error::{Result, StoreError};
pub use mock::{MockDocumentStore, MockVectorIndex};
pub use vector::{Passage, SharedVectorIndex, SqliteVectorIndex, VectorIndex, init_vector_extension};
