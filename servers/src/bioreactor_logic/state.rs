use std::sync::Arc;

use lib_bioreactor::configs::PipelineConfig;
use lib_bioreactor::connections::PersistenceLayer;
use lib_bioreactor::core::{PipelineHandle, TransportManager};

/// Everything the request handlers and the monitor share.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PipelineConfig>,
    pub pipeline: PipelineHandle,
    pub transport: Arc<TransportManager>,
    pub persistence: Arc<PersistenceLayer>,
}

impl AppState {
    pub fn new(
        config: PipelineConfig,
        pipeline: PipelineHandle,
        transport: Arc<TransportManager>,
        persistence: Arc<PersistenceLayer>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            pipeline,
            transport,
            persistence,
        }
    }
}
