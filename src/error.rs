use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Error taxonomy for the proxy pool gateway.
#[derive(Error, Debug)]
pub enum ProxyPoolError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("client protocol error: {0}")]
    ClientProtocol(String),

    #[error("no upstream node available")]
    NoUpstreamAvailable,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream dial failed: {0}")]
    UpstreamDial(#[from] std::io::Error),

    #[error("relay error: {0}")]
    Relay(String),

    #[error("probe error: {0}")]
    Probe(String),

    #[error("http request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ProxyPoolError>;

impl IntoResponse for ProxyPoolError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyPoolError::NoUpstreamAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyPoolError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyPoolError::ClientProtocol(_) | ProxyPoolError::Json(_) => StatusCode::BAD_REQUEST,
            ProxyPoolError::Config(_)
            | ProxyPoolError::Database(_)
            | ProxyPoolError::UpstreamDial(_)
            | ProxyPoolError::Relay(_)
            | ProxyPoolError::Probe(_)
            | ProxyPoolError::Http(_)
            | ProxyPoolError::Internal(_)
            | ProxyPoolError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
