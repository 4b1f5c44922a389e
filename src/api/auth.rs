//! Shared-API-key authentication middleware (`spec.md` §6 Auth), constant
//! time compare per [`crate::ws::WsFanout::authorize`]'s same reasoning.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

use crate::runtime::Runtime;

pub async fn require_api_key(
    State(runtime): State<Arc<Runtime>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let supplied = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let expected = runtime.config.api_key.as_bytes();
    let ok = expected.len() == supplied.len() && expected.ct_eq(supplied.as_bytes()).into();

    if ok {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}
