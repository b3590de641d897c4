//! Structured error taxonomy shared across the pipeline.
//!
//! Every failure that crosses a crate boundary is a [`ChevalError`]: a code
//! from the fixed taxonomy, a human-readable message, optional provider
//! detail, and a retryability flag the retry engine keys off. The wire
//! envelope (`{"error": "ChevalError", ...}`) and the one-shot exit codes
//! are both derived here so the sidecar and the CLI cannot drift apart.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The provider returned a non-success response.
    ProviderError,
    /// Transport-level failure (connect, timeout, protocol).
    NetworkError,
    /// Request authentication failed (missing headers, bad signature,
    /// expired timestamp, replay).
    HmacInvalid,
    /// The request itself is malformed (bad JSON, missing provider, schema
    /// violation).
    InvalidRequest,
    /// Anything that should never happen.
    Internal,
}

// ---------------------------------------------------------------------------
// ChevalError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ChevalError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub retryable: bool,
}

impl ChevalError {
    pub fn provider_error(message: impl Into<String>, status_code: u16, retryable: bool) -> Self {
        Self {
            code: ErrorCode::ProviderError,
            message: message.into(),
            provider_code: None,
            status_code: Some(status_code),
            retryable,
        }
    }

    pub fn network_error(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: ErrorCode::NetworkError,
            message: message.into(),
            provider_code: None,
            status_code: None,
            retryable,
        }
    }

    pub fn hmac_invalid(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::HmacInvalid,
            message: message.into(),
            provider_code: None,
            status_code: None,
            retryable: false,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidRequest,
            message: message.into(),
            provider_code: None,
            status_code: None,
            retryable: false,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Internal,
            message: message.into(),
            provider_code: None,
            status_code: None,
            retryable: false,
        }
    }

    pub fn with_provider_code(mut self, provider_code: impl Into<String>) -> Self {
        self.provider_code = Some(provider_code.into());
        self
    }

    /// HTTP status this error maps to at the sidecar boundary.
    pub fn http_status(&self) -> u16 {
        match self.code {
            ErrorCode::InvalidRequest => 400,
            ErrorCode::HmacInvalid => 403,
            ErrorCode::Internal => 500,
            ErrorCode::ProviderError | ErrorCode::NetworkError => 502,
        }
    }

    /// Process exit code for one-shot mode.
    pub fn exit_code(&self) -> i32 {
        match self.code {
            ErrorCode::ProviderError => 1,
            ErrorCode::NetworkError => 2,
            ErrorCode::HmacInvalid => 3,
            ErrorCode::InvalidRequest => 4,
            ErrorCode::Internal => 5,
        }
    }

    /// JSON wire envelope: `{"error": "ChevalError", "code": ..., ...}`.
    pub fn to_wire(&self) -> serde_json::Value {
        let mut envelope = serde_json::json!({
            "error": "ChevalError",
            "code": self.code,
            "message": self.message,
            "retryable": self.retryable,
        });
        if let Some(ref pc) = self.provider_code {
            envelope["provider_code"] = serde_json::json!(pc);
        }
        if let Some(sc) = self.status_code {
            envelope["status_code"] = serde_json::json!(sc);
        }
        envelope
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
