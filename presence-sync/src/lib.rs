pub mod bus;
pub mod cache;
pub mod config;
pub mod directory;
mod error;
pub mod events;
pub mod heartbeat;
pub mod helpers;
pub mod identity;
pub mod instance;
pub mod message;
pub mod presence;
pub mod reconcile;
pub mod retry;
mod routes;
pub mod scheduler;
pub mod validation;
pub mod workers;

pub use error::{ErrorResponse, Result, SyncError};
pub use instance::{Collaborators, Instance, InstanceState};

use axum::{Router, http::StatusCode, routing::get};
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub instance: Arc<Instance>,
}

/// Create the read-only status router for a running instance
pub fn create_app(
    instance: Arc<Instance>,
    request_body_limit: usize,
    request_timeout: Duration,
) -> Router {
    let state = Arc::new(AppState { instance });

    Router::new()
        .route("/health", get(routes::health))
        .route("/proxies", get(routes::proxies))
        .route("/players", get(routes::players))
        .route("/players/count", get(routes::count))
        .route("/players/{uuid}", get(routes::player))
        .route("/servers", get(routes::servers))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(RequestBodyLimitLayer::new(request_body_limit))
        .with_state(state)
}
