use crate::{
    config::AppConfig,
    services::{pipeline_service::PipelineService, session_service::SessionManager},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pipeline: PipelineService,
    pub sessions: SessionManager,
    /// Cancelled when the server begins shutting down.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        pipeline: PipelineService,
        sessions: SessionManager,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config: Arc::new(config),
            pipeline,
            sessions,
            shutdown,
        }
    }
}
