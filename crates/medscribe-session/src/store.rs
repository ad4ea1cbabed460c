//! Session store with per-session exclusive appends.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use medscribe_types::{ConversationTurn, SessionId, Timestamp};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::StoreConfig;
use crate::error::{Result, SessionError};
use crate::ttl::TtlTracker;

/// Ordered conversation history of one session.
#[derive(Debug, Clone)]
pub struct SessionHistory {
    id: SessionId,
    turns: Vec<ConversationTurn>,
    created_at: Timestamp,
}

impl SessionHistory {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            turns: Vec::new(),
            created_at: chrono::Utc::now(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }
}

type SessionSlot = Arc<Mutex<SessionHistory>>;

struct StoreInner {
    lru: LruCache<SessionId, SessionSlot>,
    ttl: TtlTracker,
}

impl StoreInner {
    /// Resolve a live session, dropping it if it has expired.
    fn checkout(&mut self, session_id: &SessionId) -> Result<SessionSlot> {
        if self.ttl.is_expired(session_id) {
            if self.lru.pop(session_id).is_some() {
                debug!(session_id = %session_id, "Session expired, removing");
            }
            self.ttl.remove(session_id);
            return Err(SessionError::UnknownSession(session_id.clone()));
        }

        let slot = self
            .lru
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(session_id.clone()))?;
        self.ttl.touch(session_id);
        Ok(slot)
    }
}

/// Concurrency-safe map from session id to conversation history.
///
/// The map lock is held only to resolve a session; appends then take that
/// session's own lock. Work on different sessions never contends beyond the
/// brief map lookup, while appends to one session are strictly serialized.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<RwLock<StoreInner>>,
    config: StoreConfig,
}

impl SessionStore {
    pub fn new(config: StoreConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_sessions).unwrap_or(NonZeroUsize::MIN);

        let inner = StoreInner {
            lru: LruCache::new(cap),
            ttl: TtlTracker::new(Arc::clone(&config.policy)),
        };

        Self {
            inner: Arc::new(RwLock::new(inner)),
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Create a session with an empty history and return its fresh id.
    pub async fn create_session(&self) -> SessionId {
        let id = SessionId::new();
        let mut inner = self.inner.write().await;

        let slot = Arc::new(Mutex::new(SessionHistory::new(id.clone())));
        if let Some((evicted, _)) = inner.lru.push(id.clone(), slot) {
            debug!(session_id = %evicted, "Evicting LRU session to make room");
            inner.ttl.remove(&evicted);
        }
        inner.ttl.touch(&id);

        trace!(session_id = %id, sessions = inner.lru.len(), "Session created");
        id
    }

    /// Append a single turn.
    pub async fn append(&self, session_id: &SessionId, turn: ConversationTurn) -> Result<usize> {
        self.append_all(session_id, [turn]).await
    }

    /// Append several turns as one exclusive step; no other append to the
    /// same session can land between them. Returns the new history length.
    pub async fn append_all<I>(&self, session_id: &SessionId, turns: I) -> Result<usize>
    where
        I: IntoIterator<Item = ConversationTurn>,
    {
        let slot = self.inner.write().await.checkout(session_id)?;

        let mut history = slot.lock().await;
        history.turns.extend(turns);
        trace!(session_id = %session_id, turns = history.turns.len(), "Appended to session");
        Ok(history.turns.len())
    }

    /// Ordered copy of the session's turns.
    pub async fn history(&self, session_id: &SessionId) -> Result<Vec<ConversationTurn>> {
        let slot = self.inner.write().await.checkout(session_id)?;
        let history = slot.lock().await;
        Ok(history.turns.clone())
    }

    /// Snapshot of the full session record.
    pub async fn snapshot(&self, session_id: &SessionId) -> Result<SessionHistory> {
        let slot = self.inner.write().await.checkout(session_id)?;
        let history = slot.lock().await;
        Ok(history.clone())
    }

    /// Whether a live session exists (does not refresh its idle timer).
    pub async fn contains(&self, session_id: &SessionId) -> bool {
        let inner = self.inner.read().await;
        inner.lru.contains(session_id) && !inner.ttl.is_expired(session_id)
    }

    /// Drop a session. Returns true if it existed.
    pub async fn remove(&self, session_id: &SessionId) -> bool {
        let mut inner = self.inner.write().await;
        inner.ttl.remove(session_id);
        inner.lru.pop(session_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.lru.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.lru.is_empty()
    }

    /// Evict every session the policy considers expired.
    pub async fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.write().await;
        let expired = inner.ttl.drain_expired();
        let mut count = 0;

        for session_id in expired {
            if inner.lru.pop(&session_id).is_some() {
                debug!(session_id = %session_id, "Cleaning up expired session");
                count += 1;
            }
        }

        if count > 0 {
            debug!(count, policy = inner.ttl.policy().name(), "Cleaned up expired sessions");
        }
        count
    }

    /// Run `cleanup_expired` on the configured interval.
    ///
    /// Returns `None` when the cleanup task is disabled in config.
    pub fn spawn_cleanup_task(&self) -> Option<JoinHandle<()>> {
        if !self.config.enable_cleanup_task {
            return None;
        }
        let store = self.clone();
        let period = self.config.cleanup_interval.max(Duration::from_millis(10));

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.cleanup_expired().await;
            }
        }))
    }

    pub async fn stats(&self) -> StoreStats {
        let inner = self.inner.read().await;
        StoreStats {
            size: inner.lru.len(),
            capacity: self.config.max_sessions,
            ttl_tracked: inner.ttl.len(),
        }
    }
}

/// Store statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub size: usize,
    pub capacity: usize,
    pub ttl_tracked: usize,
}
