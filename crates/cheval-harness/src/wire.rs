//! Request builder and response normalizer.
//!
//! `build_chat_request` translates a [`CanonicalRequest`] into the
//! OpenAI-compatible chat-completions wire body; `normalize_response` parses
//! whatever the provider sent back into a [`CanonicalResult`]. Both are pure
//! functions shared by the sidecar and the one-shot CLI.
//!
//! Normalization is defensive end to end: every extracted field must survive
//! missing, null, or wrong-typed input without panicking.

use cheval_core::hmac::sha256_hex;
use cheval_core::types::{
    CanonicalRequest, CanonicalResult, NormalizedToolCall, ProviderType, ResultMetadata,
    ToolFunction, UsageBlock,
};
use serde_json::{json, Value};
use tracing::warn;

// ---------------------------------------------------------------------------
// Request builder
// ---------------------------------------------------------------------------

/// Build the provider wire body for a canonical request.
pub fn build_chat_request(request: &CanonicalRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|m| {
            let mut msg = json!({ "role": m.role });
            match &m.content {
                Some(content) => msg["content"] = json!(content),
                None => {
                    // Assistant tool-call messages legitimately omit content;
                    // everything else coerces to an empty string.
                    if !(m.role == "assistant" && m.tool_calls.is_some()) {
                        msg["content"] = json!("");
                    }
                }
            }
            if let Some(ref tool_calls) = m.tool_calls {
                msg["tool_calls"] = json!(tool_calls);
            }
            if let Some(ref tool_call_id) = m.tool_call_id {
                msg["tool_call_id"] = json!(tool_call_id);
            }
            if let Some(ref name) = m.name {
                msg["name"] = json!(name);
            }
            msg
        })
        .collect();

    let mut body = json!({
        "model": request.model,
        "messages": messages,
    });

    if let Some(ref options) = request.options {
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = options.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(ref stop) = options.stop {
            body["stop"] = json!(stop);
        }
        if let Some(ref tool_choice) = options.tool_choice {
            body["tool_choice"] = tool_choice.clone();
        }
    }
    if let Some(ref tools) = request.tools {
        body["tools"] = json!(tools);
    }

    body
}

// ---------------------------------------------------------------------------
// Response normalizer
// ---------------------------------------------------------------------------

fn coerce_u64(value: &Value) -> u64 {
    value.as_u64().unwrap_or(0)
}

fn extract_usage(raw: &Value) -> UsageBlock {
    let usage = &raw["usage"];
    UsageBlock {
        prompt_tokens: coerce_u64(&usage["prompt_tokens"]),
        completion_tokens: coerce_u64(&usage["completion_tokens"]),
        reasoning_tokens: coerce_u64(&usage["reasoning_tokens"]),
        cost: None,
    }
}

/// Reasoning text, only for provider types that emit it, and only when it
/// trims to a non-empty string. Never folded into `content`.
fn extract_thinking(message: &Value, provider_type: ProviderType) -> Option<String> {
    if provider_type != ProviderType::OpenaiCompat {
        return None;
    }
    message["reasoning_content"]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn extract_tool_calls(message: &Value, trace_id: &str) -> Option<Vec<NormalizedToolCall>> {
    let raw_calls = message["tool_calls"].as_array()?;
    let mut calls = Vec::new();

    for raw in raw_calls {
        if !raw.is_object() {
            warn!(trace_id, "skipping non-object tool call entry");
            continue;
        }
        let function = &raw["function"];
        let Some(name) = function["name"].as_str().filter(|n| !n.is_empty()) else {
            warn!(trace_id, "skipping tool call without function.name");
            continue;
        };

        let id = match raw["id"].as_str().filter(|i| !i.is_empty()) {
            Some(id) => id.to_string(),
            // Deterministic 8-char id derived from the call payload.
            None => sha256_hex(raw.to_string().as_bytes())[..8].to_string(),
        };
        let arguments = match &function["arguments"] {
            Value::String(s) => s.clone(),
            Value::Object(_) => function["arguments"].to_string(),
            _ => "{}".to_string(),
        };

        calls.push(NormalizedToolCall {
            id,
            call_type: "function".to_string(),
            function: ToolFunction {
                name: name.to_string(),
                arguments,
            },
        });
    }

    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

/// Normalize a provider response into the canonical result schema.
pub fn normalize_response(
    raw: &Value,
    provider_type: ProviderType,
    trace_id: &str,
    latency_ms: u64,
) -> CanonicalResult {
    let metadata = ResultMetadata {
        model: raw["model"].as_str().unwrap_or("").to_string(),
        provider_request_id: raw["id"].as_str().map(str::to_string),
        latency_ms,
        trace_id: trace_id.to_string(),
    };

    let Some(choice) = raw["choices"].as_array().and_then(|c| c.first()) else {
        return CanonicalResult {
            content: String::new(),
            thinking: None,
            tool_calls: None,
            usage: extract_usage(raw),
            metadata,
        };
    };

    let message = &choice["message"];
    CanonicalResult {
        content: message["content"].as_str().unwrap_or("").to_string(),
        thinking: extract_thinking(message, provider_type),
        tool_calls: extract_tool_calls(message, trace_id),
        usage: extract_usage(raw),
        metadata,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cheval_core::types::{
        ChatMessage, ProviderConfig, RequestMetadata, RequestOptions, RetryPolicy,
    };

    fn request_with_messages(messages: Vec<ChatMessage>) -> CanonicalRequest {
        CanonicalRequest {
            model: "gpt-4o".into(),
            messages,
            options: None,
            tools: None,
            provider: ProviderConfig {
                name: "openai".into(),
                provider_type: ProviderType::Openai,
                base_url: "https://x".into(),
                api_key: "k".into(),
                connect_timeout_ms: None,
                read_timeout_ms: None,
                total_timeout_ms: None,
            },
            retry: RetryPolicy::default(),
            metadata: RequestMetadata {
                trace_id: "t1".into(),
            },
            hmac: None,
        }
    }

    fn user_message(content: &str) -> ChatMessage {
        ChatMessage {
            role: "user".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    // -- build --

    #[test]
    fn build_copies_model_and_messages() {
        let body = build_chat_request(&request_with_messages(vec![user_message("hi")]));
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn build_coerces_missing_content_to_empty_string() {
        let body = build_chat_request(&request_with_messages(vec![ChatMessage {
            role: "user".into(),
            content: None,
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }]));
        assert_eq!(body["messages"][0]["content"], "");
    }

    #[test]
    fn build_drops_content_for_assistant_tool_calls() {
        let body = build_chat_request(&request_with_messages(vec![ChatMessage {
            role: "assistant".into(),
            content: None,
            tool_calls: Some(vec![json!({"id": "c1"})]),
            tool_call_id: None,
            name: None,
        }]));
        assert!(body["messages"][0].get("content").is_none());
        assert_eq!(body["messages"][0]["tool_calls"][0]["id"], "c1");
    }

    #[test]
    fn build_copies_tool_message_fields() {
        let body = build_chat_request(&request_with_messages(vec![ChatMessage {
            role: "tool".into(),
            content: Some("result".into()),
            tool_calls: None,
            tool_call_id: Some("c1".into()),
            name: Some("lookup".into()),
        }]));
        assert_eq!(body["messages"][0]["tool_call_id"], "c1");
        assert_eq!(body["messages"][0]["name"], "lookup");
    }

    #[test]
    fn build_copies_options_when_set() {
        let mut request = request_with_messages(vec![user_message("hi")]);
        request.options = Some(RequestOptions {
            temperature: Some(0.2),
            top_p: Some(0.9),
            max_tokens: Some(256),
            stop: Some(vec!["END".into()]),
            tool_choice: Some(json!("auto")),
        });
        request.tools = Some(vec![json!({"type": "function"})]);

        let body = build_chat_request(&request);
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["top_p"], 0.9);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["stop"][0], "END");
        assert_eq!(body["tool_choice"], "auto");
        assert!(body["tools"].is_array());
    }

    #[test]
    fn build_omits_unset_options() {
        let body = build_chat_request(&request_with_messages(vec![user_message("hi")]));
        assert!(body.get("temperature").is_none());
        assert!(body.get("tools").is_none());
        assert!(body.get("stop").is_none());
    }

    // -- normalize --

    #[test]
    fn normalize_happy_path() {
        let raw = json!({
            "id": "chatcmpl-123",
            "model": "gpt-4o",
            "choices": [{"message": {"role": "assistant", "content": "hello"}}],
            "usage": {"prompt_tokens": 1000, "completion_tokens": 500, "reasoning_tokens": 0}
        });
        let result = normalize_response(&raw, ProviderType::Openai, "t1", 42);
        assert_eq!(result.content, "hello");
        assert_eq!(result.thinking, None);
        assert!(result.tool_calls.is_none());
        assert_eq!(result.usage.prompt_tokens, 1000);
        assert_eq!(result.usage.completion_tokens, 500);
        assert_eq!(result.metadata.provider_request_id.as_deref(), Some("chatcmpl-123"));
        assert_eq!(result.metadata.latency_ms, 42);
        assert_eq!(result.metadata.trace_id, "t1");
    }

    #[test]
    fn normalize_missing_choices_yields_empty_result() {
        let raw = json!({"usage": {"prompt_tokens": 7}});
        let result = normalize_response(&raw, ProviderType::Openai, "t1", 1);
        assert_eq!(result.content, "");
        assert_eq!(result.thinking, None);
        assert!(result.tool_calls.is_none());
        assert_eq!(result.usage.prompt_tokens, 7);
        assert_eq!(result.usage.completion_tokens, 0);
    }

    #[test]
    fn normalize_empty_choices_yields_empty_result() {
        let raw = json!({"choices": []});
        let result = normalize_response(&raw, ProviderType::Openai, "t1", 1);
        assert_eq!(result.content, "");
        assert_eq!(result.usage.prompt_tokens, 0);
    }

    #[test]
    fn normalize_null_content_coerces_to_empty() {
        let raw = json!({"choices": [{"message": {"content": null}}]});
        let result = normalize_response(&raw, ProviderType::Openai, "t1", 1);
        assert_eq!(result.content, "");
    }

    #[test]
    fn thinking_extracted_only_for_openai_compat() {
        let raw = json!({
            "choices": [{"message": {"content": "x", "reasoning_content": "step by step"}}]
        });
        let compat = normalize_response(&raw, ProviderType::OpenaiCompat, "t1", 1);
        assert_eq!(compat.thinking.as_deref(), Some("step by step"));

        let openai = normalize_response(&raw, ProviderType::Openai, "t1", 1);
        assert_eq!(openai.thinking, None);
    }

    #[test]
    fn blank_reasoning_content_is_none_not_empty() {
        let raw = json!({
            "choices": [{"message": {"content": "x", "reasoning_content": "   "}}]
        });
        let result = normalize_response(&raw, ProviderType::OpenaiCompat, "t1", 1);
        assert_eq!(result.thinking, None);
    }

    #[test]
    fn wrong_typed_reasoning_content_is_none() {
        let raw = json!({
            "choices": [{"message": {"content": "x", "reasoning_content": 17}}]
        });
        let result = normalize_response(&raw, ProviderType::OpenaiCompat, "t1", 1);
        assert_eq!(result.thinking, None);
    }

    #[test]
    fn tool_calls_normalized() {
        let raw = json!({
            "choices": [{"message": {
                "content": null,
                "tool_calls": [
                    {"id": "call_1", "function": {"name": "get_weather", "arguments": "{\"city\":\"Tokyo\"}"}}
                ]
            }}]
        });
        let result = normalize_response(&raw, ProviderType::Openai, "t1", 1);
        let calls = result.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].call_type, "function");
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(calls[0].function.arguments, "{\"city\":\"Tokyo\"}");
    }

    #[test]
    fn malformed_tool_entries_are_skipped() {
        let raw = json!({
            "choices": [{"message": {
                "tool_calls": [
                    "not an object",
                    {"id": "c2", "function": {}},
                    {"id": "c3", "function": {"name": "ok"}}
                ]
            }}]
        });
        let result = normalize_response(&raw, ProviderType::Openai, "t1", 1);
        let calls = result.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "ok");
        assert_eq!(calls[0].function.arguments, "{}");
    }

    #[test]
    fn all_invalid_tool_calls_yield_none_not_empty_vec() {
        let raw = json!({
            "choices": [{"message": {"tool_calls": [42, {"function": {}}]}}]
        });
        let result = normalize_response(&raw, ProviderType::Openai, "t1", 1);
        assert!(result.tool_calls.is_none());
    }

    #[test]
    fn missing_tool_id_is_synthesized_deterministically() {
        let raw = json!({
            "choices": [{"message": {
                "tool_calls": [{"function": {"name": "f", "arguments": "{}"}}]
            }}]
        });
        let a = normalize_response(&raw, ProviderType::Openai, "t1", 1);
        let b = normalize_response(&raw, ProviderType::Openai, "t1", 1);
        let id_a = a.tool_calls.unwrap()[0].id.clone();
        let id_b = b.tool_calls.unwrap()[0].id.clone();
        assert_eq!(id_a.len(), 8);
        assert_eq!(id_a, id_b);
    }

    #[test]
    fn object_arguments_are_reserialized() {
        let raw = json!({
            "choices": [{"message": {
                "tool_calls": [{"id": "c1", "function": {"name": "f", "arguments": {"k": 1}}}]
            }}]
        });
        let result = normalize_response(&raw, ProviderType::Openai, "t1", 1);
        assert_eq!(result.tool_calls.unwrap()[0].function.arguments, "{\"k\":1}");
    }

    #[test]
    fn usage_tolerates_wrong_types() {
        let raw = json!({
            "choices": [{"message": {"content": "x"}}],
            "usage": {"prompt_tokens": "many", "completion_tokens": -3}
        });
        let result = normalize_response(&raw, ProviderType::Openai, "t1", 1);
        assert_eq!(result.usage.prompt_tokens, 0);
        assert_eq!(result.usage.completion_tokens, 0);
    }
}
