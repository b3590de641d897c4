//! Phase-3 HMAC verification middleware.
//!
//! Every non-GET request must carry the four `x-cheval-*` headers; the body
//! is buffered, hashed, and checked against the endpoint-bound canonical
//! string before the nonce is admitted. GET routes (`/healthz`, `/readyz`)
//! bypass verification entirely. When no secret is configured the sidecar
//! refuses non-GET traffic outright rather than running open.

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use cheval_core::hmac as core_hmac;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::api_error::ApiError;
use crate::http_api::ApiState;

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

pub const SIGNATURE_HEADER: &str = "x-cheval-signature";
pub const NONCE_HEADER: &str = "x-cheval-nonce";
pub const ISSUED_AT_HEADER: &str = "x-cheval-issued-at";
pub const TRACE_ID_HEADER: &str = "x-cheval-trace-id";

/// Largest request body the middleware will buffer for hashing.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct HmacConfig {
    /// `None` means unconfigured: non-GET requests are refused with 500.
    pub secret: Option<String>,
    /// Previous secret accepted during rotation.
    pub secret_prev: Option<String>,
    pub skew_seconds: f64,
}

impl HmacConfig {
    pub fn new(secret: Option<String>, secret_prev: Option<String>, skew_seconds: f64) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            secret_prev: secret_prev.filter(|s| !s.is_empty()),
            skew_seconds,
        }
    }

    /// Read `CHEVAL_HMAC_SECRET`, `CHEVAL_HMAC_SECRET_PREV`, and
    /// `CHEVAL_HMAC_SKEW_SECONDS` from the process environment.
    pub fn from_env() -> Self {
        let skew = std::env::var("CHEVAL_HMAC_SKEW_SECONDS")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(core_hmac::DEFAULT_SKEW_SECONDS);
        Self::new(
            std::env::var("CHEVAL_HMAC_SECRET").ok(),
            std::env::var("CHEVAL_HMAC_SECRET_PREV").ok(),
            skew,
        )
    }

    /// Nonce validity window: twice the accepted clock skew.
    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.skew_seconds * 2.0)
    }
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

fn header_value(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Verify HMAC headers and admit the nonce on all non-GET requests.
pub async fn hmac_middleware(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == axum::http::Method::GET {
        return next.run(request).await;
    }

    let Some(secret) = state.hmac.secret.clone() else {
        return ApiError::HmacNotConfigured.into_response();
    };

    let signature = header_value(&request, SIGNATURE_HEADER);
    let nonce = header_value(&request, NONCE_HEADER);
    let issued_at = header_value(&request, ISSUED_AT_HEADER);
    let trace_id = header_value(&request, TRACE_ID_HEADER);
    let (Some(signature), Some(nonce), Some(issued_at), Some(trace_id)) =
        (signature, nonce, issued_at, trace_id)
    else {
        return ApiError::HmacMissingHeaders.into_response();
    };

    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();

    let (parts, body) = request.into_parts();
    let body_bytes: Bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "failed to buffer request body for HMAC check");
            return ApiError::InvalidJson.into_response();
        }
    };

    if let Err(err) = core_hmac::verify(
        &method,
        &path,
        &body_bytes,
        &signature,
        &nonce,
        &trace_id,
        &issued_at,
        &secret,
        state.hmac.secret_prev.as_deref(),
        state.hmac.skew_seconds,
    ) {
        debug!(trace_id, %path, reason = %err, "rejecting request");
        return ApiError::HmacInvalid.into_response();
    }

    {
        let mut cache = state.nonce_cache.lock().await;
        if !cache.check_and_add(&nonce, state.hmac.nonce_ttl()) {
            warn!(trace_id, "nonce replay detected");
            return ApiError::ReplayDetected.into_response();
        }
    }

    let request = Request::from_parts(parts, Body::from(body_bytes));
    next.run(request).await
}
