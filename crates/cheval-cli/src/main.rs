//! cheval - one-shot invocation mode.
//!
//! Reads a canonical request from a file, verifies its embedded HMAC
//! envelope when a secret is configured, sends it to the named provider,
//! and prints the normalized result on stdout.
//!
//! Exit codes:
//!   0 = success
//!   1 = provider returned an error
//!   2 = network/timeout error
//!   3 = HMAC validation failed
//!   4 = invalid request
//!   5 = internal error
//!
//! Shares the pure pipeline functions (request building, normalization,
//! retry classification, backoff arithmetic) with the sidecar; transport is
//! a plain single-threaded client with no pool manager.

use clap::Parser;
use rand::Rng;
use serde_json::Value;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::warn;

use cheval_core::hmac as core_hmac;
use cheval_core::types::{CanonicalRequest, CanonicalResult, RetryPolicy};
use cheval_core::ChevalError;
use cheval_harness::registry::{resolve_chat_url, resolve_headers, resolve_timeouts, validate_provider};
use cheval_harness::retry::{
    backoff_delay, classify_status, classify_transport_error, error_snippet, StatusClass,
};
use cheval_harness::usage::{enrich_with_cost, record_usage, usage_for_ledger};
use cheval_harness::wire::{build_chat_request, normalize_response};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "cheval", about = "One-shot LLM provider invocation")]
struct Cli {
    /// Path to the canonical request JSON file.
    #[arg(long)]
    request: PathBuf,

    /// Ledger path override (defaults to CHEVAL_LEDGER_PATH when set).
    #[arg(long)]
    ledger: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    cheval_core::logging::init_logging("cheval", "warn");
    let cli = Cli::parse();

    let exit_code = match run(&cli).await {
        Ok(result) => {
            match serde_json::to_string_pretty(&result) {
                Ok(json) => println!("{json}"),
                Err(err) => {
                    eprintln!("{}", ChevalError::internal(err.to_string()).to_wire());
                    std::process::exit(5);
                }
            }
            0
        }
        Err(err) => {
            eprintln!("{}", err.to_wire());
            err.exit_code()
        }
    };
    std::process::exit(exit_code);
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

async fn run(cli: &Cli) -> Result<CanonicalResult, ChevalError> {
    let text = std::fs::read_to_string(&cli.request)
        .map_err(|e| ChevalError::invalid_request(format!("cannot read request file: {e}")))?;
    let value: Value = serde_json::from_str(&text)
        .map_err(|e| ChevalError::invalid_request(format!("request file is not valid JSON: {e}")))?;
    let request: CanonicalRequest = serde_json::from_value(value.clone())
        .map_err(|e| ChevalError::invalid_request(format!("request does not match the canonical schema: {e}")))?;

    let provider_errors = validate_provider(&request.provider);
    if !provider_errors.is_empty() {
        return Err(ChevalError::invalid_request(provider_errors.join("; ")));
    }

    verify_envelope(&value, &request)?;

    let (connect_ms, read_ms, total_ms) = resolve_timeouts(&request.provider);
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(connect_ms))
        .read_timeout(Duration::from_millis(read_ms))
        .timeout(Duration::from_millis(total_ms))
        .build()
        .map_err(|e| ChevalError::internal(format!("failed to build HTTP client: {e}")))?;

    let url = resolve_chat_url(&request.provider);
    let headers = resolve_headers(&request.provider, &request.metadata.trace_id);
    let wire_body = build_chat_request(&request);

    let started = Instant::now();
    let raw = send_with_retry(
        &client,
        &url,
        &headers,
        &wire_body,
        &request.retry,
        &request.metadata.trace_id,
    )
    .await?;
    let latency_ms = started.elapsed().as_millis() as u64;

    let result = normalize_response(
        &raw,
        request.provider.provider_type,
        &request.metadata.trace_id,
        latency_ms,
    );
    let enriched = enrich_with_cost(&result, &request.provider.name, &request.model, &[]);

    let ledger_path = cli
        .ledger
        .clone()
        .or_else(|| std::env::var("CHEVAL_LEDGER_PATH").ok().map(PathBuf::from));
    if let Some(path) = ledger_path {
        let (usage, usage_source) = usage_for_ledger(&request.messages, &result);
        record_usage(
            &request.metadata.trace_id,
            &request.provider.name,
            &request.model,
            &usage,
            usage_source,
            latency_ms,
            &[],
            &path,
        );
    }

    Ok(enriched)
}

/// Verify the request's embedded HMAC envelope when a secret is configured.
///
/// The signature covers the Phase-3 canonical string for `POST /invoke`
/// over the request record serialized without its `hmac` member.
fn verify_envelope(raw: &Value, request: &CanonicalRequest) -> Result<(), ChevalError> {
    let secret = match std::env::var("CHEVAL_HMAC_SECRET") {
        Ok(secret) if !secret.is_empty() => secret,
        _ => return Ok(()),
    };
    let secret_prev = std::env::var("CHEVAL_HMAC_SECRET_PREV").ok();
    let skew = std::env::var("CHEVAL_HMAC_SKEW_SECONDS")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(core_hmac::DEFAULT_SKEW_SECONDS);

    let envelope = request
        .hmac
        .as_ref()
        .ok_or_else(|| ChevalError::hmac_invalid("request is missing its hmac envelope"))?;

    let mut unsigned = raw.clone();
    if let Some(map) = unsigned.as_object_mut() {
        map.remove("hmac");
    }
    let body = serde_json::to_string(&unsigned)
        .map_err(|e| ChevalError::internal(format!("failed to canonicalize request: {e}")))?;

    core_hmac::verify(
        "POST",
        "/invoke",
        body.as_bytes(),
        &envelope.signature,
        &envelope.nonce,
        &request.metadata.trace_id,
        &envelope.issued_at,
        &secret,
        secret_prev.as_deref(),
        skew,
    )
    .map_err(|e| ChevalError::hmac_invalid(format!("HMAC validation failed: {e}")))
}

/// One-shot transport loop over the shared classification and backoff
/// helpers.
async fn send_with_retry(
    client: &reqwest::Client,
    url: &str,
    headers: &[(String, String)],
    body: &Value,
    policy: &RetryPolicy,
    trace_id: &str,
) -> Result<Value, ChevalError> {
    let mut last_error: Option<ChevalError> = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let jitter_unit = rand::thread_rng().gen_range(-1.0..=1.0);
            let delay = backoff_delay(policy, attempt, jitter_unit);
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
                    StatusClass::Success => {
                        return response.json::<Value>().await.map_err(|e| ChevalError {
                            code: cheval_core::ErrorCode::ProviderError,
                            message: format!("Non-JSON response from provider: {e}"),
                            provider_code: None,
                            status_code: None,
                            retryable: false,
                        });
                    }
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
                if !err.retryable || attempt == policy.max_retries {
                    return Err(err);
                }
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| ChevalError::network_error("All retries exhausted", false)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
