use liveswap_control::UpdateOrchestrator;
use liveswap_metrics::MetricsService;
use liveswap_models::Config;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub orchestrator: Arc<UpdateOrchestrator>,
    pub metrics: Arc<MetricsService>,
}

impl AppState {
    pub fn new(orchestrator: Arc<UpdateOrchestrator>, metrics: Arc<MetricsService>) -> Self {
        Self {
            config: orchestrator.config().clone(),
            orchestrator,
            metrics,
        }
    }
}
