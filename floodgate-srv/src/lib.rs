//! floodgate-srv library - HTTP wiring for admission control and SSE streams
//!
//! Every `/events` route passes through the admission middleware before
//! reaching its handler. `/health` is not rate limited.

use axum::Router;
use floodgate_common::config::FloodgateConfig;
use floodgate_common::security::SecurityEngine;
use floodgate_common::sse::StreamRegistry;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod api;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Admission decisions and per-IP bookkeeping
    pub engine: Arc<SecurityEngine>,
    /// Live event streams
    pub registry: Arc<StreamRegistry>,
    pub config: Arc<FloodgateConfig>,
}

impl AppState {
    /// Create new application state
    pub fn new(config: FloodgateConfig) -> Self {
        Self {
            engine: Arc::new(SecurityEngine::new(config.limits.clone())),
            registry: Arc::new(StreamRegistry::new(config.streams.clone())),
            config: Arc::new(config),
        }
    }
}

/// Build application router
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`;
/// the admission middleware rejects requests without a peer address.
pub fn build_router(state: AppState) -> Router {
    use axum::middleware;
    use axum::routing::get;

    let limited = Router::new()
        .route(
            "/events/*path",
            get(api::subscribe)
                .post(api::publish)
                .delete(api::remove_stream),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api::admission_middleware,
        ));

    Router::new()
        .merge(limited)
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
