use std::sync::Arc;

use swarmd::{Orchestrator, OrchestratorError};

use crate::error::WebError;

/// Shared handler state: the one orchestrator value behind the surface.
/// Orchestrator work does file IO and git subprocess calls, so handlers
/// run it on the blocking pool.
#[derive(Clone)]
pub struct WebState {
    orchestrator: Arc<Orchestrator>,
}

impl WebState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        self.orchestrator.clone()
    }

    pub async fn run_blocking<R, F>(&self, body: F) -> Result<R, WebError>
    where
        R: Send + 'static,
        F: FnOnce(&Orchestrator) -> Result<R, OrchestratorError> + Send + 'static,
    {
        let orchestrator = self.orchestrator.clone();
        let joined = tokio::task::spawn_blocking(move || body(&orchestrator))
            .await
            .map_err(|err| WebError::Internal {
                message: format!("handler task failed: {err}"),
            })?;
        joined.map_err(WebError::from)
    }
}
