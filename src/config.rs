use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub model: ModelSettings,
    /// Shared secret compared against the `x-api-key` header. `None` disables
    /// the check entirely.
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

/// Settings consumed by the model layer. Immutable per process except for the
/// active model key, which changes only through `ModelHandler::switch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    pub default_key: String,
    pub max_context: usize,
    pub num_threads: usize,
    pub docs_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8050".to_string())
                    .parse()
                    .unwrap_or(8050),
                log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            },
            model: ModelSettings {
                default_key: env::var("MODEL_KEY").unwrap_or_else(|_| "tinyllama".to_string()),
                max_context: env::var("MAX_CONTEXT")
                    .unwrap_or_else(|_| "2048".to_string())
                    .parse()
                    .unwrap_or(2048),
                num_threads: env::var("NUM_THREADS")
                    .unwrap_or_else(|_| "4".to_string())
                    .parse()
                    .unwrap_or(4),
                docs_path: env::var("DOCS_PATH")
                    .unwrap_or_else(|_| "documentation.json".to_string()),
            },
            api_key: env::var("API_KEY").ok().filter(|k| !k.is_empty()),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Ok(Self::default())
    }
}
