//! HTTP inspection server.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns 200 if the server is running
//! - `GET /api/v1/updaters/{updater_id}/state` - The updater's in-progress PR as JSON
//! - `GET /api/v1/backflow/{commit}` - The cached backflow status for a VMR commit
//! - `POST /api/v1/subscriptions/{id}/trigger` - Queue a subscription update

use std::sync::Arc;

use crate::remote::AssetRegistry;
use crate::store::KeyValueStore;
use crate::worker::WorkQueue;

pub mod health;
pub mod state;
pub mod trigger;

pub use health::health_handler;
pub use state::{backflow_status_handler, updater_state_handler};
pub use trigger::trigger_subscription_handler;

/// Shared application state, passed to handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn KeyValueStore>,
    registry: Arc<dyn AssetRegistry>,
    queue: Arc<dyn WorkQueue>,
}

impl AppState {
    pub fn new(store: Arc<dyn KeyValueStore>, registry: Arc<dyn AssetRegistry>, queue: Arc<dyn WorkQueue>) -> Self {
        AppState { store, registry, queue }
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> Arc<dyn AssetRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn queue(&self) -> Arc<dyn WorkQueue> {
        Arc::clone(&self.queue)
    }
}

pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/api/v1/updaters/{updater_id}/state", get(updater_state_handler))
        .route("/api/v1/backflow/{commit}", get(backflow_status_handler))
        .route("/api/v1/subscriptions/{id}/trigger", post(trigger_subscription_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
