use axum::{extract::State, response::Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::AppState;
use crate::error::{Error, Result};
use crate::models::GenerationRequest;

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub model_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub generated_text: String,
    pub processing_time_seconds: f64,
    pub model_used: String,
}

impl GenerateRequest {
    // Input validation before the model lock is touched.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.prompt.trim().is_empty() {
            return Err("Prompt cannot be empty".to_string());
        }
        if self.prompt.len() > 4096 {
            return Err("Prompt too long (max 4096 characters)".to_string());
        }
        if let Some(max_tokens) = self.max_tokens {
            if max_tokens == 0 || max_tokens > 512 {
                return Err("max_tokens must be between 1 and 512".to_string());
            }
        }
        if let Some(temperature) = self.temperature {
            if !temperature.is_finite() || temperature < 0.0 {
                return Err("temperature must be a finite value >= 0".to_string());
            }
        }
        Ok(())
    }
}

pub async fn generate_text(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>> {
    let request_id = Uuid::new_v4();
    request.validate().map_err(Error::InvalidRequest)?;

    tracing::info!(
        %request_id,
        prompt_length = request.prompt.len(),
        model_key = request.model_key.as_deref(),
        "received generation request"
    );

    let generation = GenerationRequest {
        prompt: request.prompt,
        max_tokens: request.max_tokens.unwrap_or(100),
        temperature: request.temperature.unwrap_or(0.7),
        model_key: request.model_key,
    };

    let result = {
        let mut handler = state.handler.lock().await;
        handler.generate(generation).await?
    };

    tracing::info!(
        %request_id,
        model = %result.model_used,
        latency_seconds = result.latency_seconds,
        "generation complete"
    );

    Ok(Json(GenerateResponse {
        generated_text: result.text,
        processing_time_seconds: result.latency_seconds,
        model_used: result.model_used,
    }))
}
