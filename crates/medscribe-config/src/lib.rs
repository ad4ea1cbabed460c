//! Configuration system for the Medscribe report service.
//!
//! Provides TOML-based configuration with:
//! - One section per pipeline concern (`[llm]`, `[retrieval]`, `[generation]`, ...)
//! - Config file layering (user config dir + project-local overrides)
//! - API key resolution (CLI flag → config file → env var)

pub mod discovery;
pub mod error;
pub mod secrets;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, data_dir, load_config, load_config_file, load_config_with_options,
    user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use secrets::{ResolvedSecret, SecretSource, resolve_api_key};
pub use types::*;
