use axum::{extract::State, response::Json};
use serde_json::{Value, json};

use crate::api::AppState;

/// Serve the API documentation JSON file from disk. An unreadable file
/// degrades to an error payload rather than failing the endpoint.
pub async fn documentation(State(state): State<AppState>) -> Json<Value> {
    let path = &state.config.model.docs_path;
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(docs) => Json(docs),
            Err(e) => {
                tracing::error!(path = %path, error = %e, "documentation file is not valid JSON");
                Json(json!({ "error": "Failed to load API documentation" }))
            }
        },
        Err(e) => {
            tracing::error!(path = %path, error = %e, "failed to read documentation file");
            Json(json!({ "error": "Failed to load API documentation" }))
        }
    }
}
