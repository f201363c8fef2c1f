use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unknown model key: {0}")]
    UnknownModel(String),

    #[error("Malformed prompt template: {0}")]
    MalformedTemplate(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid or missing API key")]
    Unauthorized,

    #[error("Model loading error: {0}")]
    Load(#[source] anyhow::Error),

    #[error("Generation error: {0}")]
    Generation(#[source] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Config and auth failures are the client's fault; load and
        // generation failures are ours.
        let (status, error_message) = match self {
            Error::UnknownModel(_) => (StatusCode::NOT_FOUND, self.to_string()),
            Error::MalformedTemplate(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            Error::Load(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            Error::Generation(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            Error::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO error".to_string()),
            Error::Serialization(_) => (StatusCode::BAD_REQUEST, "Invalid JSON".to_string()),
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}
