//! HTTP surface: streaming search, health and stats.

mod api;

pub use api::{ErrorResponse, HealthResponse, StatsResponse};

use crate::service::Service;
use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct WebState {
    pub service: Arc<Service>,
}

/// Create the router with all routes
pub fn create_router(service: Arc<Service>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/search", post(api::search_handler))
        .route("/healthz", get(api::health_handler))
        .route("/api/stats", get(api::stats_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(WebState { service })
}

/// Serve until `shutdown` resolves; in-flight responses are allowed to
/// finish.
pub async fn serve(
    listener: TcpListener,
    service: Arc<Service>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, create_router(service))
        .with_graceful_shutdown(shutdown)
        .await
}
