use std::sync::Arc;

use crate::enhancement::orchestrator::Orchestrator;
use crate::sources::SourceStore;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub sources: SourceStore,
    /// Expected value of the secret header on provider callbacks.
    pub provider_secret: Arc<str>,
}
