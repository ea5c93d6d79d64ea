use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HeimdallError {
    #[error("Upstream API error: {0}")]
    Upstream(String),

    #[error("Parsing error: {0}")]
    Parsing(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl HeimdallError {
    /// Storage faults are the only errors the cascade surfaces to callers.
    pub fn is_storage_fault(&self) -> bool {
        matches!(self, HeimdallError::Storage(_) | HeimdallError::Database(_))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            HeimdallError::BadRequest(_) | HeimdallError::Parsing(_) => StatusCode::BAD_REQUEST,
            HeimdallError::Unauthorized => StatusCode::UNAUTHORIZED,
            HeimdallError::Upstream(_) => StatusCode::BAD_GATEWAY,
            HeimdallError::Storage(_) | HeimdallError::Database(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            HeimdallError::Cache(_) | HeimdallError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<reqwest::Error> for HeimdallError {
    fn from(err: reqwest::Error) -> Self {
        HeimdallError::Upstream(err.to_string())
    }
}

impl From<serde_json::Error> for HeimdallError {
    fn from(err: serde_json::Error) -> Self {
        HeimdallError::Parsing(err.to_string())
    }
}

impl IntoResponse for HeimdallError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "status_code": status.as_u16(),
            }
        });
        (status, axum::Json(body)).into_response()
    }
}
