use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-wide error types. Every variant is scoped to a single
/// request; only `Config` aborts startup.
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Purge not allowed from {client_ip}")]
    PurgeDenied { client_ip: String },

    #[error("Pool '{pool}' rejected request: queue full")]
    AdmissionRejected { pool: String },

    #[error("Pool '{pool}' admission timed out after {waited_ms}ms")]
    AdmissionTimeout { pool: String, waited_ms: u64 },

    #[error("Origin unavailable: {0}")]
    OriginUnavailable(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl GateError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateError::PurgeDenied { .. } => StatusCode::METHOD_NOT_ALLOWED,
            GateError::AdmissionRejected { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GateError::AdmissionTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GateError::OriginUnavailable(_) => StatusCode::BAD_GATEWAY,
            GateError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GateError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GateError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code; admission timeout stays distinguishable
    /// from queue overflow even though both map to 503.
    pub fn error_code(&self) -> &'static str {
        match self {
            GateError::PurgeDenied { .. } => "PURGE_DENIED",
            GateError::AdmissionRejected { .. } => "ADMISSION_REJECTED",
            GateError::AdmissionTimeout { .. } => "ADMISSION_TIMEOUT",
            GateError::OriginUnavailable(_) => "ORIGIN_UNAVAILABLE",
            GateError::BadRequest(_) => "BAD_REQUEST",
            GateError::Config(_) => "CONFIG_ERROR",
            GateError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
                "status": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GateError>;
