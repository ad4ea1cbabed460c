//! Configuration for the session store.

use std::sync::Arc;
use std::time::Duration;

use medscribe_types::{HasSessionConfig, config_defaults};

use crate::ttl::{EvictionPolicy, IdleTimeout, NeverExpire, SharedPolicy};

/// Configuration for the session store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum number of sessions held before LRU eviction.
    pub max_sessions: usize,

    /// Expiry policy applied to idle sessions.
    pub policy: SharedPolicy,

    /// Whether `spawn_cleanup_task` should run periodic sweeps.
    pub enable_cleanup_task: bool,

    /// Interval for the cleanup task.
    pub cleanup_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_sessions: config_defaults::MAX_SESSIONS,
            policy: Arc::new(IdleTimeout::new(config_defaults::session_ttl())),
            enable_cleanup_task: true,
            cleanup_interval: config_defaults::cleanup_interval(),
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from any session configuration provider.
    pub fn from_provider<C: HasSessionConfig>(config: &C) -> Self {
        let policy: SharedPolicy = match config.session_ttl() {
            Some(ttl) => Arc::new(IdleTimeout::new(ttl)),
            None => Arc::new(NeverExpire),
        };
        Self {
            max_sessions: config.max_sessions(),
            policy,
            enable_cleanup_task: true,
            cleanup_interval: config.cleanup_interval(),
        }
    }

    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Use a custom expiry policy.
    pub fn with_policy(mut self, policy: impl EvictionPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Sessions never expire by idle time.
    pub fn without_ttl(self) -> Self {
        self.with_policy(NeverExpire)
    }

    pub fn with_cleanup_task(mut self, enabled: bool) -> Self {
        self.enable_cleanup_task = enabled;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medscribe_types::SessionConfigProvider;

    #[test]
    fn test_from_provider_without_ttl() {
        let provider = SessionConfigProvider {
            max_sessions: 5,
            cleanup_interval: Duration::from_secs(1),
            session_ttl: None,
        };
        let config = StoreConfig::from_provider(&provider);
        assert_eq!(config.max_sessions, 5);
        assert_eq!(config.policy.name(), "never");
    }

    #[test]
    fn test_default_uses_idle_timeout() {
        assert_eq!(StoreConfig::default().policy.name(), "idle_timeout");
    }
}
