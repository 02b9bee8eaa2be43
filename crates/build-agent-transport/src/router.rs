//! HTTP router of the agent.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, put},
};
use build_agent_session::SessionRegistry;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    index::index_handler,
    path::AttachPaths,
    upload::{UPLOAD_ROUTE, upload_handler},
    websocket::attach_handler,
};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub paths: Arc<AttachPaths>,
}

impl AppState {
    #[must_use]
    pub fn new(registry: SessionRegistry, paths: AttachPaths) -> Self {
        Self {
            registry,
            paths: Arc::new(paths),
        }
    }
}

/// Create the agent router.
///
/// Attach paths are resolved by the fallback handler since contexts may
/// contain any number of segments.
#[must_use]
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route(UPLOAD_ROUTE, put(upload_handler))
        .fallback(attach_handler)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
