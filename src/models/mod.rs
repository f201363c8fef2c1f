pub mod backend;
pub mod handler;
pub mod pipeline;
pub mod registry;

pub use backend::{BackendLoader, CandleLoader, TextGenBackend};
pub use handler::{LoadState, ModelHandler};
pub use registry::{Extraction, ModelConfig, ModelConfigRegistry};

use serde::{Deserialize, Serialize};

/// One text-generation request as the handler sees it.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_tokens: usize,
    pub temperature: f32,
    /// Target model; defaults to the handler's active key.
    pub model_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    pub text: String,
    pub latency_seconds: f64,
    pub model_used: String,
}
