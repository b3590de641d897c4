//! Provider registry - metadata and validation for supported provider types.
//!
//! The transport goes through [`crate::pool`] and [`crate::retry`]; this
//! module only answers questions about a provider: which types exist, what
//! headers authenticate a request, where the chat endpoint lives, and what
//! a rough token count for a prompt looks like.

use cheval_core::types::{ChatMessage, ProviderConfig, ProviderType};

// ---------------------------------------------------------------------------
// Defaults per provider type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProviderDefaults {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub total_timeout_ms: u64,
    pub chat_path: &'static str,
    pub auth_header: &'static str,
    pub auth_prefix: &'static str,
    pub extra_headers: &'static [(&'static str, &'static str)],
}

const OPENAI_DEFAULTS: ProviderDefaults = ProviderDefaults {
    connect_timeout_ms: 5_000,
    read_timeout_ms: 60_000,
    total_timeout_ms: 300_000,
    chat_path: "/chat/completions",
    auth_header: "Authorization",
    auth_prefix: "Bearer",
    extra_headers: &[],
};

const ANTHROPIC_DEFAULTS: ProviderDefaults = ProviderDefaults {
    connect_timeout_ms: 5_000,
    read_timeout_ms: 60_000,
    total_timeout_ms: 300_000,
    chat_path: "/messages",
    auth_header: "x-api-key",
    auth_prefix: "",
    extra_headers: &[("anthropic-version", "2023-06-01")],
};

/// Default configuration for a provider type.
pub fn defaults_for(provider_type: ProviderType) -> ProviderDefaults {
    match provider_type {
        ProviderType::Openai | ProviderType::OpenaiCompat => OPENAI_DEFAULTS,
        ProviderType::Anthropic => ANTHROPIC_DEFAULTS,
    }
}

/// Wire names of the supported provider types.
pub fn supported_types() -> &'static [&'static str] {
    &["openai", "openai_compat", "anthropic"]
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a provider configuration. Returns error strings (empty = valid).
pub fn validate_provider(provider: &ProviderConfig) -> Vec<String> {
    let mut errors = Vec::new();
    if provider.name.is_empty() {
        errors.push("Provider 'name' is required".to_string());
    }
    if provider.base_url.is_empty() {
        errors.push("Provider 'base_url' is required".to_string());
    }
    if provider.api_key.is_empty() {
        errors.push("Provider 'api_key' is required".to_string());
    }
    errors
}

// ---------------------------------------------------------------------------
// URL and header resolution
// ---------------------------------------------------------------------------

/// Full chat-completions URL for a provider.
pub fn resolve_chat_url(provider: &ProviderConfig) -> String {
    let defaults = defaults_for(provider.provider_type);
    format!(
        "{}{}",
        provider.base_url.trim_end_matches('/'),
        defaults.chat_path
    )
}

/// Auth and content headers for a provider request. `trace_id` is forwarded
/// as `X-Request-ID` so provider-side logs correlate with the ledger.
pub fn resolve_headers(provider: &ProviderConfig, trace_id: &str) -> Vec<(String, String)> {
    let defaults = defaults_for(provider.provider_type);
    let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];

    let auth_value = if defaults.auth_prefix.is_empty() {
        provider.api_key.clone()
    } else {
        format!("{} {}", defaults.auth_prefix, provider.api_key)
    };
    headers.push((defaults.auth_header.to_string(), auth_value));

    for (name, value) in defaults.extra_headers {
        headers.push((name.to_string(), value.to_string()));
    }
    if !trace_id.is_empty() {
        headers.push(("X-Request-ID".to_string(), trace_id.to_string()));
    }
    headers
}

/// Effective timeouts for a provider, request overrides first.
pub fn resolve_timeouts(provider: &ProviderConfig) -> (u64, u64, u64) {
    let defaults = defaults_for(provider.provider_type);
    (
        provider.connect_timeout_ms.unwrap_or(defaults.connect_timeout_ms),
        provider.read_timeout_ms.unwrap_or(defaults.read_timeout_ms),
        provider.total_timeout_ms.unwrap_or(defaults.total_timeout_ms),
    )
}

// ---------------------------------------------------------------------------
// Token estimation
// ---------------------------------------------------------------------------

/// Best-effort token estimate: ~3.5 characters per token.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as f64 / 3.5) as u64
}

/// Estimate the token count of a message sequence (string content only).
pub fn estimate_message_tokens(messages: &[ChatMessage]) -> u64 {
    let total_len: usize = messages
        .iter()
        .filter_map(|m| m.content.as_deref())
        .map(|c| c.len())
        .sum();
    (total_len as f64 / 3.5) as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
