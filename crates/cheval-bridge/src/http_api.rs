//! Axum HTTP surface for the sidecar.
//!
//! Routes:
//! - `GET /healthz` - liveness; bypasses auth
//! - `GET /readyz` - readiness plus nonce cache size; bypasses auth
//! - `POST /invoke` - blocking completion through the full pipeline
//! - `POST /invoke/stream` - streaming completion re-framed as SSE
//!
//! Per-trace pipeline order: verify -> admit nonce -> translate -> invoke
//! (with retry) -> normalize -> enrich -> record. The ledger append is
//! fire-and-forget; a caller disconnect drops the handler future and
//! cancels the in-flight provider call before anything is recorded.

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use cheval_core::pricing::PricingEntry;
use cheval_core::types::CanonicalRequest;
use cheval_core::ChevalError;
use cheval_harness::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use cheval_harness::pool::PoolManager;
use cheval_harness::registry::{resolve_chat_url, resolve_headers};
use cheval_harness::retry::{
    classify_status, classify_transport_error, error_snippet, invoke_with_retry, StatusClass,
};
use cheval_harness::sse::{encode_event, SseDecoder};
use cheval_harness::usage::{enrich_with_cost, record_usage, usage_for_ledger};
use cheval_harness::wire::{build_chat_request, normalize_response};

use crate::api_error::ApiError;
use crate::auth::{hmac_middleware, HmacConfig};
use crate::nonce::{NonceCache, DEFAULT_CAPACITY};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Process-level sidecar configuration, read from `CHEVAL_*` env vars.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    pub port: u16,
    pub hmac: HmacConfig,
    pub nonce_cache_size: usize,
    pub ledger_path: PathBuf,
    pub run_dir: PathBuf,
}

impl SidecarConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("CHEVAL_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3001);
        let nonce_cache_size = std::env::var("CHEVAL_NONCE_CACHE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CAPACITY);
        let ledger_path = std::env::var("CHEVAL_LEDGER_PATH")
            .unwrap_or_else(|_| "data/cheval/cost-ledger.jsonl".to_string())
            .into();
        let run_dir = std::env::var("CHEVAL_RUN_DIR")
            .unwrap_or_else(|_| ".run".to_string())
            .into();
        Self {
            port,
            hmac: HmacConfig::from_env(),
            nonce_cache_size,
            ledger_path,
            run_dir,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Process-wide holders, constructed at startup and torn down on shutdown.
pub struct ApiState {
    pub start_time: Instant,
    pub hmac: HmacConfig,
    pub nonce_cache: Mutex<NonceCache>,
    pub pools: PoolManager,
    pub breaker: CircuitBreaker,
    pub ledger_path: PathBuf,
    /// Pricing overrides from the configuration record; empty means the
    /// built-in table alone.
    pub pricing_overrides: Vec<PricingEntry>,
}

impl ApiState {
    pub fn new(config: &SidecarConfig) -> Self {
        Self {
            start_time: Instant::now(),
            hmac: config.hmac.clone(),
            nonce_cache: Mutex::new(NonceCache::new(config.nonce_cache_size)),
            pools: PoolManager::new(),
            breaker: CircuitBreaker::new(&config.run_dir, CircuitBreakerConfig::default()),
            ledger_path: config.ledger_path.clone(),
            pricing_overrides: Vec::new(),
        }
    }

    /// Drain connection pools; called on shutdown.
    pub fn shutdown(&self) {
        self.pools.close_all();
    }
}

/// Build the sidecar router with the HMAC middleware installed.
pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/invoke", post(invoke))
        .route("/invoke/stream", post(invoke_stream))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            hmac_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

fn uptime_s(state: &ApiState) -> f64 {
    (state.start_time.elapsed().as_secs_f64() * 100.0).round() / 100.0
}

async fn healthz(State(state): State<Arc<ApiState>>) -> Json<Value> {
    Json(json!({
        "status": "alive",
        "uptime_s": uptime_s(&state),
    }))
}

async fn readyz(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let nonce_cache_size = state.nonce_cache.lock().await.len();
    Json(json!({
        "status": "ready",
        "uptime_s": uptime_s(&state),
        "nonce_cache_size": nonce_cache_size,
    }))
}

// ---------------------------------------------------------------------------
// Request parsing shared by both invoke routes
// ---------------------------------------------------------------------------

fn parse_invoke_body(body: &Bytes) -> Result<CanonicalRequest, ApiError> {
    let value: Value = serde_json::from_slice(body).map_err(|_| ApiError::InvalidJson)?;

    let provider = &value["provider"];
    let base_url = provider["base_url"].as_str().unwrap_or_default();
    let api_key = provider["api_key"].as_str().unwrap_or_default();
    if base_url.is_empty() || api_key.is_empty() {
        return Err(ApiError::MissingProvider);
    }

    serde_json::from_value(value).map_err(|err| {
        ApiError::Cheval(ChevalError::invalid_request(format!(
            "request does not match the canonical schema: {err}"
        )))
    })
}

/// Circuit-breaker gate. OPEN rejects without a provider call; HALF_OPEN
/// admits the request as a probe.
fn breaker_gate(state: &ApiState, provider: &str) -> Result<(), ApiError> {
    match state.breaker.check(provider) {
        CircuitState::Open => Err(ApiError::Cheval(ChevalError {
            code: cheval_core::ErrorCode::ProviderError,
            message: format!("circuit breaker open for provider '{provider}'"),
            provider_code: None,
            status_code: None,
            retryable: true,
        })),
        CircuitState::HalfOpen => {
            state.breaker.begin_probe(provider);
            Ok(())
        }
        CircuitState::Closed => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// POST /invoke
// ---------------------------------------------------------------------------

async fn invoke(State(state): State<Arc<ApiState>>, body: Bytes) -> Response {
    let request = match parse_invoke_body(&body) {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };
    let provider_name = request.provider.name.clone();
    let trace_id = request.metadata.trace_id.clone();

    if let Err(err) = breaker_gate(&state, &provider_name) {
        return err.into_response();
    }

    let pool = match state.pools.get_or_create(&request.provider) {
        Ok(pool) => pool,
        Err(err) => return ApiError::Cheval(err).into_response(),
    };

    let wire_body = build_chat_request(&request);
    let url = resolve_chat_url(&request.provider);
    let headers = resolve_headers(&request.provider, &trace_id);

    let started = Instant::now();
    let response = match invoke_with_retry(
        &pool.client,
        &url,
        &headers,
        &wire_body,
        &request.retry,
        &trace_id,
    )
    .await
    {
        Ok(response) => response,
        Err(err) => {
            state.breaker.record_failure(&provider_name);
            return ApiError::Cheval(err).into_response();
        }
    };
    let latency_ms = started.elapsed().as_millis() as u64;
    state.breaker.record_success(&provider_name);

    let raw: Value = match response.json().await {
        Ok(raw) => raw,
        Err(err) => {
            return ApiError::Cheval(ChevalError {
                code: cheval_core::ErrorCode::ProviderError,
                message: format!("Non-JSON response from provider: {err}"),
                provider_code: None,
                status_code: None,
                retryable: false,
            })
            .into_response();
        }
    };

    let result = normalize_response(&raw, request.provider.provider_type, &trace_id, latency_ms);
    let enriched = enrich_with_cost(
        &result,
        &provider_name,
        &request.model,
        &state.pricing_overrides,
    );

    // Fire-and-forget: ledger failures never reach the caller.
    {
        let (usage, usage_source) = usage_for_ledger(&request.messages, &result);
        let overrides = state.pricing_overrides.clone();
        let ledger_path = state.ledger_path.clone();
        let model = request.model.clone();
        let trace = trace_id.clone();
        tokio::task::spawn_blocking(move || {
            record_usage(
                &trace,
                &provider_name,
                &model,
                &usage,
                usage_source,
                latency_ms,
                &overrides,
                &ledger_path,
            );
        });
    }

    (StatusCode::OK, Json(enriched)).into_response()
}

// ---------------------------------------------------------------------------
// POST /invoke/stream
// ---------------------------------------------------------------------------

async fn invoke_stream(State(state): State<Arc<ApiState>>, body: Bytes) -> Response {
    let request = match parse_invoke_body(&body) {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };
    let provider_name = request.provider.name.clone();
    let trace_id = request.metadata.trace_id.clone();

    if let Err(err) = breaker_gate(&state, &provider_name) {
        return err.into_response();
    }

    let pool = match state.pools.get_or_create(&request.provider) {
        Ok(pool) => pool,
        Err(err) => return ApiError::Cheval(err).into_response(),
    };

    let mut wire_body = build_chat_request(&request);
    wire_body["stream"] = json!(true);
    let url = resolve_chat_url(&request.provider);
    let headers = resolve_headers(&request.provider, &trace_id);

    // Streaming never retries: once bytes have flowed, partial data has
    // already been delivered to the caller.
    let mut upstream_request = pool.client.post(&url).json(&wire_body);
    for (name, value) in &headers {
        upstream_request = upstream_request.header(name, value);
    }
    let response = match upstream_request.send().await {
        Ok(response) => response,
        Err(err) => {
            state.breaker.record_failure(&provider_name);
            return ApiError::Cheval(classify_transport_error(&err)).into_response();
        }
    };

    let status = response.status().as_u16();
    if let StatusClass::RetryableProvider | StatusClass::NonRetryableProvider =
        classify_status(status, &request.retry.retryable_status_codes)
    {
        state.breaker.record_failure(&provider_name);
        let snippet = error_snippet(response).await;
        return ApiError::Cheval(ChevalError::provider_error(
            format!("HTTP {status}: {snippet}"),
            status,
            false,
        ))
        .into_response();
    }
    state.breaker.record_success(&provider_name);
    info!(trace_id, provider = %provider_name, "streaming provider response");

    // Decode the provider's SSE bytes and re-emit them with identical
    // framing; a mid-stream failure terminates the stream.
    let body_stream = futures_util::stream::unfold(
        (response.bytes_stream(), SseDecoder::new(), false, trace_id),
        |(mut upstream, mut decoder, finished, trace_id)| async move {
            if finished {
                return None;
            }
            loop {
                match upstream.next().await {
                    Some(Ok(chunk)) => {
                        let events = decoder.feed(&chunk);
                        if events.is_empty() {
                            continue;
                        }
                        let frame: String = events.iter().map(encode_event).collect();
                        return Some((
                            Ok::<Bytes, std::io::Error>(Bytes::from(frame)),
                            (upstream, decoder, false, trace_id),
                        ));
                    }
                    Some(Err(err)) => {
                        warn!(trace_id, error = %err, "provider stream failed mid-flight");
                        return None;
                    }
                    None => {
                        let tail = decoder
                            .finish()
                            .map(|event| encode_event(&event))
                            .unwrap_or_default();
                        if tail.is_empty() {
                            return None;
                        }
                        return Some((
                            Ok(Bytes::from(tail)),
                            (upstream, decoder, true, trace_id),
                        ));
                    }
                }
            }
        },
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> Arc<ApiState> {
        let tmp = std::env::temp_dir().join(format!("cheval-test-{}", std::process::id()));
        let config = SidecarConfig {
            port: 0,
            hmac: HmacConfig::new(Some("unit-secret".into()), None, 30.0),
            nonce_cache_size: 100,
            ledger_path: tmp.join("ledger.jsonl"),
            run_dir: tmp.join("run"),
        };
        Arc::new(ApiState::new(&config))
    }

    #[tokio::test]
    async fn healthz_reports_alive_without_auth() {
        let app = api_router(test_state());
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "alive");
        assert!(body["uptime_s"].is_number());
    }

    #[tokio::test]
    async fn readyz_reports_nonce_cache_size() {
        let app = api_router(test_state());
        let response = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ready");
        assert_eq!(body["nonce_cache_size"], 0);
    }

    #[tokio::test]
    async fn post_without_headers_is_rejected_before_parsing() {
        let app = api_router(test_state());
        let response = app
            .oneshot(
                Request::post("/invoke")
                    .body(Body::from("not even json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn config_defaults_without_env() {
        std::env::remove_var("CHEVAL_PORT");
        std::env::remove_var("CHEVAL_NONCE_CACHE_SIZE");
        let config = SidecarConfig::from_env();
        assert_eq!(config.port, 3001);
        assert_eq!(config.nonce_cache_size, DEFAULT_CAPACITY);
        assert_eq!(config.run_dir, PathBuf::from(".run"));
    }
}
