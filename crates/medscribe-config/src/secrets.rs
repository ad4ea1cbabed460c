//! API key resolution.
//!
//! Resolution order:
//! 1. Explicit value (CLI flag)
//! 2. Config file (with warning)
//! 3. Environment variable for the backend

use crate::Backend;

/// Result of API key resolution with provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSecret {
    pub value: String,
    pub source: SecretSource,
}

/// Where a secret was resolved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    CommandLine,
    /// Config file (plaintext, not recommended).
    ConfigFile,
    EnvVar(String),
}

impl std::fmt::Display for SecretSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretSource::CommandLine => write!(f, "command line"),
            SecretSource::ConfigFile => write!(f, "config file (plaintext)"),
            SecretSource::EnvVar(var) => write!(f, "env var {}", var),
        }
    }
}

/// Resolve an API key for a backend.
pub fn resolve_api_key(
    backend: &Backend,
    explicit: Option<&str>,
    config_value: Option<&str>,
) -> Option<ResolvedSecret> {
    resolve_with_env(backend, explicit, config_value, |var| std::env::var(var).ok())
}

fn resolve_with_env(
    backend: &Backend,
    explicit: Option<&str>,
    config_value: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Option<ResolvedSecret> {
    if let Some(value) = explicit.filter(|v| !v.is_empty()) {
        return Some(ResolvedSecret {
            value: value.to_string(),
            source: SecretSource::CommandLine,
        });
    }

    if let Some(value) = config_value.filter(|v| !v.is_empty()) {
        return Some(ResolvedSecret {
            value: value.to_string(),
            source: SecretSource::ConfigFile,
        });
    }

    let env_var = backend.env_var();
    env(env_var)
        .filter(|v| !v.is_empty())
        .map(|value| ResolvedSecret {
            value,
            source: SecretSource::EnvVar(env_var.to_string()),
        })
}
