//! HTTP boundary error envelopes.
//!
//! Two envelope shapes leave the sidecar. Middleware-level rejections use a
//! short code envelope, `{"error": "HMAC_INVALID", "message": ...}`;
//! pipeline failures use the full structured `ChevalError` envelope,
//! `{"error": "ChevalError", "code": ..., ...}`. Both are produced here so
//! every handler converts errors the same way.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cheval_core::ChevalError;
use serde_json::json;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    /// The sidecar has no HMAC secret; non-GET requests cannot be served.
    #[error("CHEVAL_HMAC_SECRET not set")]
    HmacNotConfigured,

    /// One or more of the four HMAC headers is missing.
    #[error("Missing required HMAC headers")]
    HmacMissingHeaders,

    /// Signature, timestamp, or canonicalization mismatch.
    #[error("HMAC signature verification failed")]
    HmacInvalid,

    /// The nonce was already used inside its validity window.
    #[error("Nonce already used")]
    ReplayDetected,

    /// Request body is not valid JSON.
    #[error("Request body is not valid JSON")]
    InvalidJson,

    /// Provider block is missing its base_url or api_key.
    #[error("Missing provider base_url or api_key")]
    MissingProvider,

    /// A structured pipeline failure.
    #[error(transparent)]
    Cheval(#[from] ChevalError),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::HmacNotConfigured => "HMAC_NOT_CONFIGURED",
            ApiError::HmacMissingHeaders => "HMAC_MISSING_HEADERS",
            ApiError::HmacInvalid => "HMAC_INVALID",
            ApiError::ReplayDetected => "REPLAY_DETECTED",
            ApiError::InvalidJson => "INVALID_JSON",
            ApiError::MissingProvider => "MISSING_PROVIDER",
            ApiError::Cheval(_) => "ChevalError",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::HmacNotConfigured => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::HmacMissingHeaders | ApiError::HmacInvalid | ApiError::ReplayDetected => {
                StatusCode::FORBIDDEN
            }
            ApiError::InvalidJson | ApiError::MissingProvider => StatusCode::BAD_REQUEST,
            ApiError::Cheval(err) => {
                StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// IntoResponse implementation
// ---------------------------------------------------------------------------

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Cheval(err) => err.to_wire(),
            other => json!({
                "error": other.code(),
                "message": other.to_string(),
            }),
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn hmac_errors_are_403_with_code_envelope() {
        for (error, code) in [
            (ApiError::HmacMissingHeaders, "HMAC_MISSING_HEADERS"),
            (ApiError::HmacInvalid, "HMAC_INVALID"),
            (ApiError::ReplayDetected, "REPLAY_DETECTED"),
        ] {
            let response = error.into_response();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
            let body = body_json(response).await;
            assert_eq!(body["error"], code);
            assert!(body["message"].is_string());
        }
    }

    #[tokio::test]
    async fn unconfigured_secret_is_500() {
        let response = ApiError::HmacNotConfigured.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "HMAC_NOT_CONFIGURED");
    }

    #[tokio::test]
    async fn request_shape_errors_are_400() {
        let response = ApiError::InvalidJson.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = ApiError::MissingProvider.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "MISSING_PROVIDER");
    }

    #[tokio::test]
    async fn cheval_errors_use_wire_envelope_and_mapped_status() {
        let err = ChevalError::provider_error("HTTP 503: overloaded", 503, true);
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["error"], "ChevalError");
        assert_eq!(body["code"], "provider_error");
        assert_eq!(body["status_code"], 503);
    }
}
