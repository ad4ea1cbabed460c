//! Application state shared across handlers.

use std::sync::Arc;

use medscribe_domain::ReportOrchestrator;

use crate::config::ServerConfig;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// The report pipeline. Owns the session store.
    pub orchestrator: Arc<ReportOrchestrator>,

    /// Server configuration.
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(orchestrator: ReportOrchestrator, config: ServerConfig) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            config: Arc::new(config),
        }
    }
}
