use crate::engine::EngineError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use facetrace_core::PipelineError;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, ServiceError>;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0}")]
    Validation(String),
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error(transparent)]
    Engine(EngineError),
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Pipeline(PipelineError::Decode(e)) => ServiceError::InvalidImage(e.to_string()),
            other => ServiceError::Engine(other),
        }
    }
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServiceError::Validation(_) | ServiceError::InvalidImage(_) => StatusCode::BAD_REQUEST,
            ServiceError::Engine(EngineError::ChannelClosed) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
