use std::sync::Arc;

use manuscript::JobService;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<JobService>,
}

impl AppState {
    pub fn new(service: Arc<JobService>) -> Self {
        Self { service }
    }
}
