//! Idle tracking and pluggable expiry policies.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use medscribe_types::SessionId;
use tokio::time::Instant;

/// Decides whether a session idle for a given duration should be evicted.
pub trait EvictionPolicy: Debug + Send + Sync {
    fn is_expired(&self, idle: Duration) -> bool;

    /// Short label for logs.
    fn name(&self) -> &str;
}

/// A policy that can be shared across stores and tasks.
pub type SharedPolicy = Arc<dyn EvictionPolicy>;

/// Sessions live for the lifetime of the process (subject to LRU capacity).
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverExpire;

impl EvictionPolicy for NeverExpire {
    fn is_expired(&self, _idle: Duration) -> bool {
        false
    }

    fn name(&self) -> &str {
        "never"
    }
}

/// Evict sessions not touched within `ttl`.
#[derive(Debug, Clone, Copy)]
pub struct IdleTimeout {
    ttl: Duration,
}

impl IdleTimeout {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl EvictionPolicy for IdleTimeout {
    fn is_expired(&self, idle: Duration) -> bool {
        idle > self.ttl
    }

    fn name(&self) -> &str {
        "idle_timeout"
    }
}

/// Tracks last access times and applies an [`EvictionPolicy`].
#[derive(Debug)]
pub struct TtlTracker {
    access_times: HashMap<SessionId, Instant>,
    policy: SharedPolicy,
}

impl TtlTracker {
    pub fn new(policy: SharedPolicy) -> Self {
        Self {
            access_times: HashMap::new(),
            policy,
        }
    }

    /// Record an access for a session (resets its idle timer).
    pub fn touch(&mut self, session_id: &SessionId) {
        self.access_times.insert(session_id.clone(), Instant::now());
    }

    /// Whether a session has expired. Untracked sessions count as expired.
    pub fn is_expired(&self, session_id: &SessionId) -> bool {
        match self.access_times.get(session_id) {
            None => true,
            Some(last_access) => self.policy.is_expired(last_access.elapsed()),
        }
    }

    pub fn remove(&mut self, session_id: &SessionId) {
        self.access_times.remove(session_id);
    }

    /// Remove all expired entries and return their IDs.
    pub fn drain_expired(&mut self) -> Vec<SessionId> {
        let now = Instant::now();
        let expired: Vec<SessionId> = self
            .access_times
            .iter()
            .filter(|(_, last)| self.policy.is_expired(now.duration_since(**last)))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            self.access_times.remove(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.access_times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.access_times.is_empty()
    }

    pub fn policy(&self) -> &SharedPolicy {
        &self.policy
    }
}
