//! HTTP control surface (`spec.md` §6), built on the teacher's axum/tower
//! stack: the job CRUD + stats routes, `/system/status`, `/system/cleanup`,
//! and the WebSocket log/progress stream.

pub mod auth;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::runtime::Runtime;

pub fn build_router(runtime: Arc<Runtime>) -> Router {
    let protected = routes::protected_router()
        .layer(axum::middleware::from_fn_with_state(runtime.clone(), auth::require_api_key));

    Router::new()
        .merge(protected)
        .merge(routes::stream_router())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(CorsLayer::permissive())
        .with_state(runtime)
}
