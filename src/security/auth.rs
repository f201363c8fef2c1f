// Shared-secret API key check for the generation endpoint.
//
// Runs as route middleware, before the handler mutex is touched, so an
// unauthenticated request never contends for the model lock or triggers a
// load.

use axum::{extract::{Request, State}, middleware::Next, response::Response};

use crate::api::AppState;
use crate::error::{Error, Result};

pub const API_KEY_HEADER: &str = "x-api-key";

pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response> {
    if let Some(expected) = state.config.api_key.as_deref() {
        let provided = request
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected) {
            tracing::warn!("rejected request with missing or invalid API key");
            return Err(Error::Unauthorized);
        }
    }
    Ok(next.run(request).await)
}
