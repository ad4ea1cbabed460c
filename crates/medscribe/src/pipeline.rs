//! Builds the report pipeline from configuration and CLI overrides.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Args;

use medscribe_config::{
    Backend, EmbeddingConfig, EmbeddingProvider, LoadedConfig, MedscribeConfig, resolve_api_key,
};
use medscribe_domain::{PersistenceFinalizer, PromptAssembler, ReportOrchestrator};
use medscribe_llm::{EmbedderSpec, OpenAiBackend, OpenAiConfig, SharedBackend, SharedEmbedder};
use medscribe_session::{SessionStore, StoreConfig};
use medscribe_store::{SharedVectorIndex, SqliteDocumentStore, SqliteVectorIndex};

/// Backend and config overrides shared by every command.
///
/// CLI arguments override config file values.
#[derive(Args, Debug, Clone, Default)]
pub struct PipelineArgs {
    /// Path to config file (skips discovery)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// LLM backend: openai, groq, ollama, custom (overrides config)
    #[arg(long)]
    pub backend: Option<String>,

    /// API key (overrides config and environment)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Custom base URL (overrides config)
    #[arg(long)]
    pub base_url: Option<String>,

    /// Model (overrides config)
    #[arg(long)]
    pub model: Option<String>,

    /// SQLite database file (overrides config)
    #[arg(long)]
    pub database: Option<PathBuf>,

    /// Directory of template overrides (overrides config)
    #[arg(long)]
    pub prompts_dir: Option<PathBuf>,
}

/// Resolved LLM connection settings.
#[derive(Debug, Clone)]
pub struct ResolvedLlm {
    pub backend: Backend,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub retry_max: Option<u32>,
    pub retry_backoff: Option<Duration>,
    pub timeout: Option<Duration>,
}

/// Everything a command needs to run the pipeline.
pub struct Pipeline {
    pub orchestrator: ReportOrchestrator,
    pub index: SharedVectorIndex,
    pub config: MedscribeConfig,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Load configuration, printing any warnings.
pub fn load(args: &PipelineArgs) -> Result<MedscribeConfig> {
    let loaded = match args.config {
        Some(ref path) => LoadedConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => medscribe_config::load_config(None)?,
    };

    for warning in &loaded.warnings {
        eprintln!("warning: {}", warning);
    }
    for path in loaded.loaded_from() {
        tracing::debug!(path = %path.display(), "Loaded config layer");
    }

    let mut config = loaded.config;
    apply_overrides(&mut config, args);
    Ok(config)
}

fn apply_overrides(config: &mut MedscribeConfig, args: &PipelineArgs) {
    if let Some(ref database) = args.database {
        let mut storage = config.storage_or_default();
        storage.database = Some(database.clone());
        config.storage = Some(storage);
    }
    if let Some(ref dir) = args.prompts_dir {
        let mut prompts = config.prompts.clone().unwrap_or_default();
        prompts.dir = Some(dir.clone());
        config.prompts = Some(prompts);
    }
}

/// Resolve the LLM backend from config plus CLI overrides.
pub fn resolve_llm(config: &MedscribeConfig, args: &PipelineArgs) -> Result<ResolvedLlm> {
    let llm = config.llm_or_default();

    let backend = match args.backend.as_deref() {
        Some(name) => parse_backend(name)?,
        None => llm.backend.unwrap_or_default(),
    };

    let model = args
        .model
        .clone()
        .unwrap_or_else(|| config.generation_provider().model);

    let api_key = resolve_api_key(&backend, args.api_key.as_deref(), llm.api_key.as_deref())
        .map(|resolved| {
            tracing::debug!(source = %resolved.source, "Resolved API key");
            resolved.value
        });

    Ok(ResolvedLlm {
        backend,
        model,
        base_url: args.base_url.clone().or(llm.base_url),
        api_key,
        retry_max: llm.retry_max,
        retry_backoff: llm.retry_backoff_ms.map(Duration::from_millis),
        timeout: llm.timeout_secs.map(Duration::from_secs),
    })
}

fn parse_backend(s: &str) -> Result<Backend> {
    Backend::parse(s).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown backend '{}'. Valid: openai, groq, ollama, custom",
            s
        )
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Construction
// ─────────────────────────────────────────────────────────────────────────────

/// Create a text generation backend from a resolved config.
pub fn create_backend(resolved: &ResolvedLlm) -> Result<SharedBackend> {
    let require_key = || {
        resolved.api_key.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "{} API key required. Set {}, pass --api-key, or add api_key to config",
                resolved.backend.display_name(),
                resolved.backend.env_var()
            )
        })
    };

    let mut config = match resolved.backend {
        Backend::Openai => OpenAiConfig::openai(require_key()?),
        Backend::Groq => OpenAiConfig::groq(require_key()?),
        Backend::Ollama => OpenAiConfig::ollama(),
        Backend::Custom => {
            let base_url = resolved.base_url.as_deref().ok_or_else(|| {
                anyhow::anyhow!("Custom backend requires base_url in config or --base-url")
            })?;
            let mut config = OpenAiConfig::openai("")
                .with_base_url(base_url)
                .with_name("custom");
            config.api_key = resolved.api_key.clone();
            config
        }
    };

    if let Some(ref base_url) = resolved.base_url {
        config = config.with_base_url(base_url);
    }
    config = config.with_model(&resolved.model);
    if let Some(retries) = resolved.retry_max {
        config = config.with_max_retries(retries);
    }
    if let Some(backoff) = resolved.retry_backoff {
        config = config.with_retry_backoff(backoff);
    }
    if let Some(timeout) = resolved.timeout {
        config = config.with_timeout(timeout);
    }

    Ok(Arc::new(OpenAiBackend::new(config)?))
}

/// Build the embedding spec, falling back to the mock embedder when the
/// OpenAI provider has no key.
pub fn embedder_spec(config: &EmbeddingConfig) -> EmbedderSpec {
    let api_key = resolve_api_key(&Backend::Openai, None, config.api_key.as_deref())
        .map(|resolved| resolved.value);

    let provider = match (config.provider, api_key.is_some()) {
        (EmbeddingProvider::OpenAi, false) => {
            tracing::warn!(
                "No OpenAI key for embeddings, using the mock embedder. Retrieval quality will be poor."
            );
            EmbeddingProvider::Mock
        }
        (provider, _) => provider,
    };

    let effective = EmbeddingConfig {
        provider,
        ..config.clone()
    };

    EmbedderSpec {
        provider: provider.as_str().to_string(),
        api_key,
        model: config.model.clone(),
        base_url: config.base_url.clone(),
        dimensions: Some(effective.effective_dimensions()),
    }
}

pub fn build_embedder(config: &MedscribeConfig) -> Result<SharedEmbedder> {
    let spec = embedder_spec(&config.embedding_or_default());
    Ok(medscribe_llm::build_embedder(&spec)?)
}

/// Vector index file next to the document database.
pub fn vector_db_path(database: &Path) -> PathBuf {
    database.with_extension("vectors.db")
}

pub fn database_path(config: &MedscribeConfig) -> PathBuf {
    config
        .storage_or_default()
        .database_path(&medscribe_config::data_dir())
}

pub fn open_index(config: &MedscribeConfig, embedder: SharedEmbedder) -> Result<SharedVectorIndex> {
    let path = vector_db_path(&database_path(config));
    let index = SqliteVectorIndex::open(&path, embedder)
        .with_context(|| format!("opening vector index {}", path.display()))?;
    Ok(Arc::new(index))
}

/// Assemble the full pipeline.
pub fn build(config: MedscribeConfig, args: &PipelineArgs) -> Result<Pipeline> {
    let resolved = resolve_llm(&config, args)?;
    tracing::info!(
        backend = resolved.backend.display_name(),
        model = %resolved.model,
        "Text generation backend"
    );
    let backend = create_backend(&resolved)?;

    let embedder = build_embedder(&config)?;
    tracing::info!(
        embedder = embedder.name(),
        dimensions = embedder.dimensions(),
        "Embedder"
    );

    let db_path = database_path(&config);
    let documents = Arc::new(
        SqliteDocumentStore::open(&db_path)
            .with_context(|| format!("opening document store {}", db_path.display()))?,
    );
    let index = open_index(&config, embedder)?;

    let assembler = match config.prompts.as_ref().and_then(|p| p.dir.as_deref()) {
        Some(dir) => PromptAssembler::from_dir(dir)
            .with_context(|| format!("loading templates from {}", dir.display()))?,
        None => PromptAssembler::new(),
    };

    let generation_settings = config.generation_or_default();
    let mut finalizer = PersistenceFinalizer::new(documents.clone())
        .with_recovery_capacity(generation_settings.max_pending_reports);
    if generation_settings.index_generated_reports {
        finalizer = finalizer.with_report_indexing(index.clone());
    }

    let mut generation = config.generation_provider();
    generation.model = resolved.model.clone();

    let sessions = SessionStore::new(StoreConfig::from_provider(&config.session_or_default()));

    let orchestrator = ReportOrchestrator::new(sessions, backend, index.clone(), documents)
        .with_assembler(assembler)
        .with_generation_config(&generation)
        .with_retrieval_config(&config.retrieval_or_default())
        .with_finalizer(finalizer);

    Ok(Pipeline {
        orchestrator,
        index,
        config,
    })
}
