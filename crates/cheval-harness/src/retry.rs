//! Classified retry with exponential backoff and jitter.
//!
//! One provider HTTP exchange is classified as success, retryable provider
//! error, non-retryable provider error, retryable network error, or
//! non-retryable network error. Retryable failures are absorbed up to the
//! request's retry budget; everything else short-circuits.
//!
//! The classification and backoff arithmetic are pure functions so the
//! one-shot CLI can drive its own transport loop with identical semantics.

use cheval_core::config::redact_string;
use cheval_core::types::RetryPolicy;
use cheval_core::ChevalError;
use rand::Rng;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

/// Statuses that never retry regardless of the configured retryable set.
pub const NON_RETRYABLE_STATUS: &[u16] = &[400, 401, 403, 404];

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    RetryableProvider,
    NonRetryableProvider,
}

/// Classify a provider HTTP status against the request's retryable set.
pub fn classify_status(status: u16, retryable_codes: &[u16]) -> StatusClass {
    if status == 200 {
        StatusClass::Success
    } else if NON_RETRYABLE_STATUS.contains(&status) {
        StatusClass::NonRetryableProvider
    } else if retryable_codes.contains(&status) {
        StatusClass::RetryableProvider
    } else {
        StatusClass::NonRetryableProvider
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Delay before retry attempt `attempt` (1-based; attempt 0 is immediate).
///
/// `jitter_unit` must lie in [-1, 1]; the scaled jitter is applied to the
/// capped exponential delay and the result clamps at zero.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, jitter_unit: f64) -> Duration {
    debug_assert!(attempt >= 1);
    let exponent = attempt.saturating_sub(1).min(32);
    let base = policy.base_delay_ms as f64 * 2f64.powi(exponent as i32);
    let capped = base.min(policy.max_delay_ms as f64);
    let jitter = capped * (policy.jitter_percent as f64 / 100.0) * jitter_unit;
    Duration::from_millis((capped + jitter).max(0.0) as u64)
}

fn jitter_unit() -> f64 {
    rand::thread_rng().gen_range(-1.0..=1.0)
}

// ---------------------------------------------------------------------------
// Retrying invocation
// ---------------------------------------------------------------------------

/// Read a bounded, redacted snippet of an error response body.
pub async fn error_snippet(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    if text.is_empty() {
        return "(empty body)".to_string();
    }
    let truncated: String = text.chars().take(200).collect();
    redact_string(&truncated)
}

/// Classify a transport-level failure: connect and timeout errors retry,
/// anything else does not.
pub fn classify_transport_error(err: &reqwest::Error) -> ChevalError {
    if err.is_timeout() {
        ChevalError::network_error(format!("Request timed out: {err}"), true)
    } else if err.is_connect() {
        ChevalError::network_error(format!("Connection failed: {err}"), true)
    } else {
        ChevalError::network_error(format!("Unexpected transport error: {err}"), false)
    }
}

/// POST `body` to `url`, retrying per `policy`. Returns the successful
/// response or the last classified error once the budget is exhausted.
pub async fn invoke_with_retry(
    client: &reqwest::Client,
    url: &str,
    headers: &[(String, String)],
    body: &Value,
    policy: &RetryPolicy,
    trace_id: &str,
) -> Result<reqwest::Response, ChevalError> {
    let mut last_error: Option<ChevalError> = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = backoff_delay(policy, attempt, jitter_unit());
            warn!(
                trace_id,
                attempt = attempt + 1,
                attempts = policy.max_retries + 1,
                delay_ms = delay.as_millis() as u64,
                "retrying provider request"
            );
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                match classify_status(status, &policy.retryable_status_codes) {
                    StatusClass::Success => return Ok(response),
                    StatusClass::NonRetryableProvider => {
                        let snippet = error_snippet(response).await;
                        return Err(ChevalError::provider_error(
                            format!("HTTP {status}: {snippet}"),
                            status,
                            false,
                        ));
                    }
                    StatusClass::RetryableProvider => {
                        let snippet = error_snippet(response).await;
                        let err = ChevalError::provider_error(
                            format!("HTTP {status}: {snippet}"),
                            status,
                            true,
                        );
                        if attempt < policy.max_retries {
                            last_error = Some(err);
                            continue;
                        }
                        return Err(err);
                    }
                }
            }
            Err(transport_err) => {
                let err = classify_transport_error(&transport_err);
                if !err.retryable {
                    return Err(err);
                }
                if attempt < policy.max_retries {
                    last_error = Some(err);
                    continue;
                }
                return Err(err);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| ChevalError::network_error("All retries exhausted", false)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
