use std::sync::Arc;

use crate::health::HealthChecker;
use crate::scheduler::SchedulerRegistry;
use crate::store::NodeStore;

/// Shared state handed to every axum handler. Handlers stay thin and
/// delegate straight to `store`/`registry`/`health_checker`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<NodeStore>,
    pub registry: Arc<SchedulerRegistry>,
    pub health_checker: Arc<HealthChecker>,
}
