use std::sync::Arc;

use frame_helpers::metrics::MetricsSink;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::log_client::LogClient;
use crate::core::registry::Registry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub log_client: Arc<dyn LogClient>,
    pub metrics: Arc<dyn MetricsSink>,
    pub shutdown: CancellationToken,
    pub config: Arc<Config>,
}
