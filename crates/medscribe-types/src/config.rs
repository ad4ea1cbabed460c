//! Configuration traits for decoupled config passing between crates.
//!
//! Components depend on a configuration capability rather than on the full
//! configuration structure. Each trait represents one capability.

use std::time::Duration;

/// Base trait for all configuration types.
pub trait ConfigProvider: Clone + Send + Sync + 'static {}

/// Session store configuration.
pub trait HasSessionConfig: ConfigProvider {
    /// Maximum number of sessions kept before LRU eviction.
    fn max_sessions(&self) -> usize;

    /// Interval between cleanup runs for expired sessions.
    fn cleanup_interval(&self) -> Duration;

    /// Idle TTL for sessions (None = never expire).
    fn session_ttl(&self) -> Option<Duration> {
        None
    }
}

/// Retrieval configuration.
pub trait HasRetrievalConfig: ConfigProvider {
    /// Maximum passages fetched per query.
    fn top_k(&self) -> usize;

    /// Upper bound on a single vector index call.
    fn retrieval_timeout(&self) -> Duration;

    /// Whether to rewrite the input into a standalone query using history.
    fn condense_queries(&self) -> bool {
        true
    }
}

/// Generation configuration.
pub trait HasGenerationConfig: ConfigProvider {
    fn model(&self) -> &str;

    fn max_tokens(&self) -> u32;

    fn temperature(&self) -> Option<f32> {
        None
    }

    /// Wall-clock cap on one streaming generation.
    fn wall_clock_limit(&self) -> Duration;
}

// ─────────────────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Default configuration values.
pub mod defaults {
    use std::time::Duration;

    pub const MAX_SESSIONS: usize = 10_000;
    pub const CLEANUP_INTERVAL_SECS: u64 = 60;
    /// Sessions idle for two hours are evicted.
    pub const SESSION_IDLE_TTL_SECS: u64 = 2 * 60 * 60;
    pub const TOP_K: usize = 4;
    pub const RETRIEVAL_TIMEOUT_MS: u64 = 5_000;
    pub const MODEL: &str = "gpt-4o";
    pub const MAX_TOKENS: u32 = 4_096;
    pub const WALL_CLOCK_SECS: u64 = 300;
    /// Unsaved reports held for retry before the oldest is dropped.
    pub const MAX_PENDING_REPORTS: usize = 1_000;
    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_BIND: &str = "127.0.0.1";
    pub const CORS_ORIGIN: &str = "http://localhost:3000";

    pub fn cleanup_interval() -> Duration {
        Duration::from_secs(CLEANUP_INTERVAL_SECS)
    }

    pub fn session_ttl() -> Duration {
        Duration::from_secs(SESSION_IDLE_TTL_SECS)
    }

    pub fn retrieval_timeout() -> Duration {
        Duration::from_millis(RETRIEVAL_TIMEOUT_MS)
    }

    pub fn wall_clock_limit() -> Duration {
        Duration::from_secs(WALL_CLOCK_SECS)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Standalone providers
// ─────────────────────────────────────────────────────────────────────────────

/// Standalone session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfigProvider {
    pub max_sessions: usize,
    pub cleanup_interval: Duration,
    pub session_ttl: Option<Duration>,
}

impl Default for SessionConfigProvider {
    fn default() -> Self {
        Self {
            max_sessions: defaults::MAX_SESSIONS,
            cleanup_interval: defaults::cleanup_interval(),
            session_ttl: Some(defaults::session_ttl()),
        }
    }
}

impl ConfigProvider for SessionConfigProvider {}

impl HasSessionConfig for SessionConfigProvider {
    fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    fn session_ttl(&self) -> Option<Duration> {
        self.session_ttl
    }
}

/// Standalone retrieval configuration.
#[derive(Debug, Clone)]
pub struct RetrievalConfigProvider {
    pub top_k: usize,
    pub timeout: Duration,
    pub condense_queries: bool,
}

impl Default for RetrievalConfigProvider {
    fn default() -> Self {
        Self {
            top_k: defaults::TOP_K,
            timeout: defaults::retrieval_timeout(),
            condense_queries: true,
        }
    }
}

impl ConfigProvider for RetrievalConfigProvider {}

impl HasRetrievalConfig for RetrievalConfigProvider {
    fn top_k(&self) -> usize {
        self.top_k
    }

    fn retrieval_timeout(&self) -> Duration {
        self.timeout
    }

    fn condense_queries(&self) -> bool {
        self.condense_queries
    }
}

/// Standalone generation configuration.
#[derive(Debug, Clone)]
pub struct GenerationConfigProvider {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub wall_clock_limit: Duration,
}

impl Default for GenerationConfigProvider {
    fn default() -> Self {
        Self {
            model: defaults::MODEL.to_string(),
            max_tokens: defaults::MAX_TOKENS,
            temperature: None,
            wall_clock_limit: defaults::wall_clock_limit(),
        }
    }
}

impl ConfigProvider for GenerationConfigProvider {}

impl HasGenerationConfig for GenerationConfigProvider {
    fn model(&self) -> &str {
        &self.model
    }

    fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    fn wall_clock_limit(&self) -> Duration {
        self.wall_clock_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfigProvider::default();
        assert_eq!(config.max_sessions(), defaults::MAX_SESSIONS);
        assert_eq!(config.cleanup_interval(), defaults::cleanup_interval());
        assert_eq!(config.session_ttl(), Some(defaults::session_ttl()));
    }

    #[test]
    fn test_retrieval_config_defaults() {
        let config = RetrievalConfigProvider::default();
        assert_eq!(config.top_k(), 4);
        assert_eq!(config.retrieval_timeout(), Duration::from_secs(5));
        assert!(config.condense_queries());
    }

    #[test]
    fn test_generation_config_defaults() {
        let config = GenerationConfigProvider::default();
        assert_eq!(config.model(), defaults::MODEL);
        assert_eq!(config.wall_clock_limit(), Duration::from_secs(300));
        assert!(config.temperature().is_none());
    }
}
