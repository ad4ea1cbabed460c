//! Conversation session store.
//!
//! An in-memory map from session identifier to an ordered conversation
//! history, with:
//! - a per-session exclusive section so concurrent appends never interleave
//! - LRU eviction to bound memory
//! - an injectable idle-expiry policy
//!
//! # Example
//!
//! ```rust,ignore
//! use medscribe_session::{SessionStore, StoreConfig, IdleTimeout};
//!
//! let store = SessionStore::new(
//!     StoreConfig::default()
//!         .with_max_sessions(1000)
//!         .with_policy(IdleTimeout::new(Duration::from_secs(3600))),
//! );
//! let id = store.create_session().await;
//! store.append(&id, ConversationTurn::user("draft")).await?;
//! ```

mod config;
mod error;
mod store;
mod ttl;

pub use config::StoreConfig;
pub use error::{Result, SessionError};
pub use store::{SessionHistory, SessionStore, StoreStats};
pub use ttl::{EvictionPolicy, IdleTimeout, NeverExpire, SharedPolicy, TtlTracker};
