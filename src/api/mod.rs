pub mod docs;
pub mod generate;
pub mod models;
pub mod status;

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::models::ModelHandler;
use crate::security::require_api_key;

/// Shared application state: the single model handler behind its exclusive
/// critical section, plus immutable service configuration.
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<Mutex<ModelHandler>>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(handler: ModelHandler, config: Config) -> Self {
        Self {
            handler: Arc::new(Mutex::new(handler)),
            config: Arc::new(config),
        }
    }
}

/// Build the service router. Kept free of listener setup so tests can drive
/// it in-process.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/generate",
            post(generate::generate_text).layer(middleware::from_fn_with_state(
                state.clone(),
                require_api_key,
            )),
        )
        .route("/", get(status::service_status))
        .route("/models", get(models::list_models))
        .route("/documentation", get(docs::documentation))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
