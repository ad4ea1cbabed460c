//! Configuration types mapping to the TOML schema.
//!
//! ```toml
//! [llm]          # text generation backend
//! [embedding]    # embedder for the vector index
//! [server]       # HTTP listener
//! [storage]      # SQLite database
//! [session]      # session store capacity and expiry
//! [retrieval]    # top-k, timeout, query condensing
//! [generation]   # model, token limits, wall-clock cap
//! [prompts]      # template override directory
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use medscribe_types::{GenerationConfigProvider, config_defaults};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MedscribeConfig {
    pub llm: Option<LlmConfig>,
    pub embedding: Option<EmbeddingConfig>,
    pub server: Option<ServerConfig>,
    pub storage: Option<StorageConfig>,
    pub session: Option<SessionConfig>,
    pub retrieval: Option<RetrievalConfig>,
    pub generation: Option<GenerationConfig>,
    pub prompts: Option<PromptsConfig>,
}

impl MedscribeConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> crate::Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority per section).
    pub fn merge(&mut self, other: MedscribeConfig) {
        if other.llm.is_some() {
            self.llm = other.llm;
        }
        if other.embedding.is_some() {
            self.embedding = other.embedding;
        }
        if other.server.is_some() {
            self.server = other.server;
        }
        if other.storage.is_some() {
            self.storage = other.storage;
        }
        if other.session.is_some() {
            self.session = other.session;
        }
        if other.retrieval.is_some() {
            self.retrieval = other.retrieval;
        }
        if other.generation.is_some() {
            self.generation = other.generation;
        }
        if other.prompts.is_some() {
            self.prompts = other.prompts;
        }
    }

    pub fn llm_or_default(&self) -> LlmConfig {
        self.llm.clone().unwrap_or_default()
    }

    pub fn embedding_or_default(&self) -> EmbeddingConfig {
        self.embedding.clone().unwrap_or_default()
    }

    pub fn server_or_default(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }

    pub fn storage_or_default(&self) -> StorageConfig {
        self.storage.clone().unwrap_or_default()
    }

    pub fn session_or_default(&self) -> SessionConfig {
        self.session.clone().unwrap_or_default()
    }

    pub fn retrieval_or_default(&self) -> RetrievalConfig {
        self.retrieval.clone().unwrap_or_default()
    }

    pub fn generation_or_default(&self) -> GenerationConfig {
        self.generation.clone().unwrap_or_default()
    }

    /// Generation settings with the model resolved: `[generation] model`,
    /// then `[llm] model`, then the backend's default.
    pub fn generation_provider(&self) -> GenerationConfigProvider {
        let generation = self.generation_or_default();
        let llm = self.llm_or_default();

        let model = generation
            .model
            .or(llm.model)
            .unwrap_or_else(|| llm.backend.unwrap_or_default().default_model().to_string());

        GenerationConfigProvider {
            model,
            max_tokens: generation.max_tokens,
            temperature: generation.temperature,
            wall_clock_limit: Duration::from_secs(generation.wall_clock_secs),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LLM Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for the text generation backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: Option<Backend>,
    pub model: Option<String>,
    /// Custom API base URL (for proxies, custom endpoints).
    pub base_url: Option<String>,
    /// API key (prefer an env var; warns if set here).
    pub api_key: Option<String>,
    pub retry_max: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub timeout_secs: Option<u64>,
}

impl LlmConfig {
    /// Returns true if an API key is stored directly in the config file.
    pub fn has_plaintext_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Supported OpenAI-compatible providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Openai,
    Groq,
    Ollama,
    Custom,
}

impl Backend {
    /// Environment variable name for this backend's API key.
    pub fn env_var(&self) -> &'static str {
        match self {
            Backend::Openai => "OPENAI_API_KEY",
            Backend::Groq => "GROQ_API_KEY",
            Backend::Ollama | Backend::Custom => "LLM_API_KEY",
        }
    }

    /// Whether the backend works without a key.
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, Backend::Ollama)
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Backend::Openai | Backend::Custom => config_defaults::MODEL,
            Backend::Groq => "llama-3.3-70b-versatile",
            Backend::Ollama => "llama3.2",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Backend::Openai => "OpenAI",
            Backend::Groq => "Groq",
            Backend::Ollama => "Ollama",
            Backend::Custom => "Custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "openai" => Some(Backend::Openai),
            "groq" => Some(Backend::Groq),
            "ollama" => Some(Backend::Ollama),
            "custom" => Some(Backend::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedding Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Embedding provider configuration.
///
/// ```toml
/// [embedding]
/// provider = "openai"
/// model = "text-embedding-3-small"
/// dimensions = 1536
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: Option<String>,
    pub dimensions: Option<usize>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::OpenAi,
            model: None,
            dimensions: None,
            base_url: None,
            api_key: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn effective_dimensions(&self) -> usize {
        self.dimensions.unwrap_or(match self.provider {
            EmbeddingProvider::OpenAi => 1536,
            EmbeddingProvider::Mock => 384,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// OpenAI-compatible embeddings API.
    #[serde(rename = "openai")]
    OpenAi,
    /// Deterministic hash embeddings (offline, tests).
    Mock,
}

impl EmbeddingProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingProvider::OpenAi => "openai",
            EmbeddingProvider::Mock => "mock",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    pub request_logging: bool,
    /// Maximum request body size in bytes (signatures are inlined as base64).
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: config_defaults::DEFAULT_PORT,
            bind: config_defaults::DEFAULT_BIND.to_string(),
            cors_origins: vec![config_defaults::CORS_ORIGIN.to_string()],
            request_logging: true,
            max_body_size: 4 * 1024 * 1024,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path. Relative paths resolve against the data directory.
    pub database: Option<PathBuf>,
}

impl StorageConfig {
    /// Database path, defaulting to `<data_dir>/medscribe.db`.
    pub fn database_path(&self, data_dir: &Path) -> PathBuf {
        match self.database {
            Some(ref path) if path.is_absolute() => path.clone(),
            Some(ref path) => data_dir.join(path),
            None => data_dir.join("medscribe.db"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Session store configuration.
///
/// ```toml
/// [session]
/// max_sessions = 10000
/// idle_ttl_secs = 7200   # 0 = never expire
/// cleanup_interval_secs = 60
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_sessions: usize,
    pub idle_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: config_defaults::MAX_SESSIONS,
            idle_ttl_secs: config_defaults::SESSION_IDLE_TTL_SECS,
            cleanup_interval_secs: config_defaults::CLEANUP_INTERVAL_SECS,
        }
    }
}

impl medscribe_types::ConfigProvider for SessionConfig {}

impl medscribe_types::HasSessionConfig for SessionConfig {
    fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    fn session_ttl(&self) -> Option<Duration> {
        (self.idle_ttl_secs > 0).then(|| Duration::from_secs(self.idle_ttl_secs))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Retrieval Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub timeout_ms: u64,
    /// Rewrite follow-up input into a standalone query using history.
    pub condense_queries: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: config_defaults::TOP_K,
            timeout_ms: config_defaults::RETRIEVAL_TIMEOUT_MS,
            condense_queries: true,
        }
    }
}

impl medscribe_types::ConfigProvider for RetrievalConfig {}

impl medscribe_types::HasRetrievalConfig for RetrievalConfig {
    fn top_k(&self) -> usize {
        self.top_k
    }

    fn retrieval_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn condense_queries(&self) -> bool {
        self.condense_queries
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Generation Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Overrides `[llm] model` for report generation.
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub wall_clock_secs: u64,
    /// Add finalized reports to the vector index.
    pub index_generated_reports: bool,
    /// Capacity of the recovery queue for reports that failed to save.
    pub max_pending_reports: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: config_defaults::MAX_TOKENS,
            temperature: None,
            wall_clock_secs: config_defaults::WALL_CLOCK_SECS,
            index_generated_reports: true,
            max_pending_reports: config_defaults::MAX_PENDING_REPORTS,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Prompts Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    /// Directory whose `*.j2` files override the bundled templates.
    pub dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use medscribe_types::{HasGenerationConfig, HasRetrievalConfig, HasSessionConfig};

    #[test]
    fn test_parse_full_config() {
        let config = MedscribeConfig::from_toml(
            r#"
[llm]
backend = "groq"
model = "llama-3.3-70b-versatile"
retry_max = 2

[embedding]
provider = "mock"
dimensions = 64

[server]
port = 9000
cors_origins = ["https://clinic.example"]

[storage]
database = "reports.db"

[session]
idle_ttl_secs = 0

[retrieval]
top_k = 6
timeout_ms = 1500

[generation]
max_tokens = 2048
wall_clock_secs = 60
index_generated_reports = false
max_pending_reports = 50

[prompts]
dir = "/etc/medscribe/prompts"
"#,
        )
        .unwrap();

        assert_eq!(config.llm.as_ref().unwrap().backend, Some(Backend::Groq));
        assert_eq!(config.embedding_or_default().provider, EmbeddingProvider::Mock);
        assert_eq!(config.embedding_or_default().effective_dimensions(), 64);
        assert_eq!(config.server_or_default().port, 9000);
        assert!(config.session_or_default().session_ttl().is_none());
        assert_eq!(config.retrieval_or_default().top_k(), 6);
        assert_eq!(
            config.retrieval_or_default().retrieval_timeout(),
            Duration::from_millis(1500)
        );
        assert!(!config.generation_or_default().index_generated_reports);
        assert_eq!(config.generation_or_default().max_pending_reports, 50);
        assert_eq!(
            config.storage_or_default().database_path(Path::new("/data")),
            PathBuf::from("/data/reports.db")
        );
        assert!(config.prompts.unwrap().dir.is_some());
    }

    #[test]
    fn test_defaults() {
        let config = MedscribeConfig::new();
        assert_eq!(config.retrieval_or_default().top_k, 4);
        assert_eq!(config.retrieval_or_default().timeout_ms, 5000);
        assert_eq!(config.generation_or_default().wall_clock_secs, 300);
        assert_eq!(config.generation_or_default().max_pending_reports, 1_000);
        assert_eq!(
            config.session_or_default().session_ttl(),
            Some(Duration::from_secs(7200))
        );
        assert_eq!(
            config.server_or_default().cors_origins,
            vec!["http://localhost:3000".to_string()]
        );
        assert_eq!(
            config.storage_or_default().database_path(Path::new("/data")),
            PathBuf::from("/data/medscribe.db")
        );
    }

    #[test]
    fn test_generation_model_resolution() {
        let mut config = MedscribeConfig::new();
        assert_eq!(config.generation_provider().model(), "gpt-4o");

        config.llm = Some(LlmConfig {
            backend: Some(Backend::Groq),
            ..Default::default()
        });
        assert_eq!(config.generation_provider().model(), "llama-3.3-70b-versatile");

        config.llm.as_mut().unwrap().model = Some("from-llm".into());
        assert_eq!(config.generation_provider().model(), "from-llm");

        config.generation = Some(GenerationConfig {
            model: Some("from-generation".into()),
            ..Default::default()
        });
        assert_eq!(config.generation_provider().model(), "from-generation");
    }

    #[test]
    fn test_merge_overrides_per_section() {
        let mut base = MedscribeConfig::from_toml(
            r#"
[server]
port = 8080

[retrieval]
top_k = 3
"#,
        )
        .unwrap();
        let overlay = MedscribeConfig::from_toml(
            r#"
[server]
port = 9090
"#,
        )
        .unwrap();

        base.merge(overlay);
        assert_eq!(base.server_or_default().port, 9090);
        assert_eq!(base.retrieval_or_default().top_k, 3);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = MedscribeConfig::new();
        config.retrieval = Some(RetrievalConfig {
            top_k: 7,
            ..Default::default()
        });
        let text = config.to_toml().unwrap();
        let parsed = MedscribeConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.retrieval_or_default().top_k, 7);
    }

    #[test]
    fn test_backend_env_vars() {
        assert_eq!(Backend::Openai.env_var(), "OPENAI_API_KEY");
        assert_eq!(Backend::Groq.env_var(), "GROQ_API_KEY");
        assert_eq!(Backend::Custom.env_var(), "LLM_API_KEY");
        assert!(!Backend::Ollama.requires_api_key());
        assert_eq!(Backend::parse("GROQ"), Some(Backend::Groq));
    }
}
