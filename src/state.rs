use std::sync::Arc;

use crate::client::availability::SharedAvailability;
use crate::client::token::StaticTokenProvider;
use crate::engine::sync::SyncHandle;
use crate::observability::metrics::Metrics;

pub struct AppState {
    pub sync: SyncHandle,
    pub availability: Arc<SharedAvailability>,
    pub tokens: Arc<StaticTokenProvider>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        sync: SyncHandle,
        availability: Arc<SharedAvailability>,
        tokens: Arc<StaticTokenProvider>,
        metrics: Metrics,
    ) -> Self {
        Self {
            sync,
            availability,
            tokens,
            metrics,
        }
    }
}
