use axum::{extract::State, response::Json};
use serde_json::{Value, json};

use crate::api::AppState;
use crate::error::Result;
use crate::models::registry;

pub async fn service_status(State(state): State<AppState>) -> Result<Json<Value>> {
    let active_model_key = {
        let handler = state.handler.lock().await;
        handler.active_key().to_string()
    };

    let available_models: Vec<&str> = registry::global()?.list().map(|(key, _)| key).collect();

    Ok(Json(json!({
        "status": "running",
        "service": "local-llm-service",
        "version": env!("CARGO_PKG_VERSION"),
        "active_model_key": active_model_key,
        "available_models": available_models,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}
