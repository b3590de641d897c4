//! Phase-3 HMAC canonicalization and verification.
//!
//! The canonical signing string is endpoint-bound and newline-delimited:
//!
//! ```text
//! METHOD \n PATH \n SHA256_HEX(BODY) \n ISSUED_AT \n NONCE \n TRACE_ID
//! ```
//!
//! Signatures are lowercase-hex HMAC-SHA256 over that string. Verification
//! enforces a clock-skew window on `ISSUED_AT`, compares in constant time,
//! and supports zero-downtime key rotation by falling back to a previous
//! secret when the current one does not match.

use chrono::{DateTime, SecondsFormat, Utc};
use ring::digest;
use ring::hmac as ring_hmac;
use subtle::ConstantTimeEq;

/// Default accepted clock skew, seconds.
pub const DEFAULT_SKEW_SECONDS: f64 = 30.0;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HmacError {
    #[error("issued_at is not a valid RFC-3339 timestamp")]
    BadTimestamp,
    #[error("issued_at outside the allowed clock skew")]
    SkewExceeded,
    #[error("signature mismatch")]
    SignatureMismatch,
}

// ---------------------------------------------------------------------------
// Canonicalization
// ---------------------------------------------------------------------------

/// Lowercase hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(digest::digest(&digest::SHA256, data).as_ref())
}

/// Build the Phase-3 canonical string.
pub fn build_canonical(
    method: &str,
    path: &str,
    body: &[u8],
    issued_at: &str,
    nonce: &str,
    trace_id: &str,
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        path,
        sha256_hex(body),
        issued_at,
        nonce,
        trace_id
    )
}

/// Sign a canonical string under a secret; lowercase hex output.
pub fn sign(secret: &str, canonical: &str) -> String {
    let key = ring_hmac::Key::new(ring_hmac::HMAC_SHA256, secret.as_bytes());
    hex::encode(ring_hmac::sign(&key, canonical.as_bytes()).as_ref())
}

/// RFC-3339 UTC timestamp with millisecond precision and `Z` suffix,
/// suitable for the `ISSUED_AT` field.
pub fn issued_at_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

fn constant_time_eq(a: &str, b: &str) -> bool {
    bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Verify a Phase-3 signature.
///
/// Checks the clock skew first, then compares the expected signature under
/// the current secret, and finally (when configured) under the previous
/// secret for rotation.
#[allow(clippy::too_many_arguments)]
pub fn verify(
    method: &str,
    path: &str,
    body: &[u8],
    signature: &str,
    nonce: &str,
    trace_id: &str,
    issued_at: &str,
    secret: &str,
    secret_prev: Option<&str>,
    skew_seconds: f64,
) -> Result<(), HmacError> {
    let issued = DateTime::parse_from_rfc3339(issued_at)
        .map_err(|_| HmacError::BadTimestamp)?
        .with_timezone(&Utc);
    let delta_s = (Utc::now() - issued).num_milliseconds().abs() as f64 / 1000.0;
    if delta_s > skew_seconds {
        return Err(HmacError::SkewExceeded);
    }

    let canonical = build_canonical(method, path, body, issued_at, nonce, trace_id);

    if constant_time_eq(signature, &sign(secret, &canonical)) {
        return Ok(());
    }
    if let Some(prev) = secret_prev {
        if !prev.is_empty() && constant_time_eq(signature, &sign(prev, &canonical)) {
            return Ok(());
        }
    }
    Err(HmacError::SignatureMismatch)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    fn signed(method: &str, path: &str, body: &[u8], nonce: &str, trace: &str) -> (String, String) {
        let issued_at = issued_at_now();
        let canonical = build_canonical(method, path, body, &issued_at, nonce, trace);
        (sign(SECRET, &canonical), issued_at)
    }

    #[test]
    fn canonical_string_is_newline_delimited() {
        let canonical = build_canonical("POST", "/invoke", b"{}", "2026-08-01T00:00:00.000Z", "n1", "t1");
        let parts: Vec<&str> = canonical.split('\n').collect();
        assert_eq!(parts.len(), 6);
        assert_eq!(parts[0], "POST");
        assert_eq!(parts[1], "/invoke");
        assert_eq!(parts[2], sha256_hex(b"{}"));
        assert_eq!(parts[4], "n1");
        assert_eq!(parts[5], "t1");
    }

    #[test]
    fn sha256_hex_is_lowercase_and_stable() {
        // Well-known digest of the empty string.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn valid_signature_verifies() {
        let body = br#"{"model":"gpt-4o"}"#;
        let (sig, issued_at) = signed("POST", "/invoke", body, "n1", "t1");
        let result = verify(
            "POST", "/invoke", body, &sig, "n1", "t1", &issued_at, SECRET, None, 30.0,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn wrong_secret_fails() {
        let body = b"{}";
        let (sig, issued_at) = signed("POST", "/invoke", body, "n1", "t1");
        let result = verify(
            "POST", "/invoke", body, &sig, "n1", "t1", &issued_at, "other", None, 30.0,
        );
        assert_eq!(result, Err(HmacError::SignatureMismatch));
    }

    #[test]
    fn previous_secret_accepted_for_rotation() {
        let body = b"{}";
        let issued_at = issued_at_now();
        let canonical = build_canonical("POST", "/invoke", body, &issued_at, "n1", "t1");
        let old_sig = sign("old-secret", &canonical);
        let result = verify(
            "POST",
            "/invoke",
            body,
            &old_sig,
            "n1",
            "t1",
            &issued_at,
            "new-secret",
            Some("old-secret"),
            30.0,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn expired_timestamp_rejected() {
        let body = b"{}";
        let issued_at = (Utc::now() - chrono::Duration::minutes(10))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let canonical = build_canonical("POST", "/invoke", body, &issued_at, "n1", "t1");
        let sig = sign(SECRET, &canonical);
        let result = verify(
            "POST", "/invoke", body, &sig, "n1", "t1", &issued_at, SECRET, None, 30.0,
        );
        assert_eq!(result, Err(HmacError::SkewExceeded));
    }

    #[test]
    fn future_timestamp_beyond_skew_rejected() {
        let body = b"{}";
        let issued_at = (Utc::now() + chrono::Duration::minutes(10))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let canonical = build_canonical("POST", "/invoke", body, &issued_at, "n1", "t1");
        let sig = sign(SECRET, &canonical);
        let result = verify(
            "POST", "/invoke", body, &sig, "n1", "t1", &issued_at, SECRET, None, 30.0,
        );
        assert_eq!(result, Err(HmacError::SkewExceeded));
    }

    #[test]
    fn garbage_timestamp_rejected() {
        let result = verify(
            "POST",
            "/invoke",
            b"{}",
            "abc",
            "n1",
            "t1",
            "not-a-timestamp",
            SECRET,
            None,
            30.0,
        );
        assert_eq!(result, Err(HmacError::BadTimestamp));
    }

    #[test]
    fn signature_is_endpoint_bound() {
        let body = b"{}";
        let (sig, issued_at) = signed("POST", "/invoke", body, "n1", "t1");
        // Same signature presented against a different path must fail.
        let result = verify(
            "POST",
            "/invoke/stream",
            body,
            &sig,
            "n1",
            "t1",
            &issued_at,
            SECRET,
            None,
            30.0,
        );
        assert_eq!(result, Err(HmacError::SignatureMismatch));
    }

    #[test]
    fn signature_is_body_bound() {
        let (sig, issued_at) = signed("POST", "/invoke", b"{\"a\":1}", "n1", "t1");
        let result = verify(
            "POST",
            "/invoke",
            b"{\"a\":2}",
            &sig,
            "n1",
            "t1",
            &issued_at,
            SECRET,
            None,
            30.0,
        );
        assert_eq!(result, Err(HmacError::SignatureMismatch));
    }

    #[test]
    fn issued_at_now_has_millis_and_z() {
        let stamp = issued_at_now();
        assert!(stamp.ends_with('Z'));
        // e.g. 2026-08-01T12:34:56.789Z - fractional part present.
        assert!(stamp.contains('.'));
        assert!(DateTime::parse_from_rfc3339(&stamp).is_ok());
    }
}
