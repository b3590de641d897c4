//! Usage calculator - cost enrichment and best-effort recording.
//!
//! This module observes. It resolves pricing (request-config override, then
//! the built-in table), annotates results with string-encoded micro-USD
//! costs, and appends ledger entries. It holds no opinion about whether a
//! request should have happened: nothing here can reject, block, or
//! downgrade anything, and recording failures never reach the caller.

use cheval_core::ledger::{append_entry, update_daily_spend, LedgerEntry, UsageSource};
use cheval_core::pricing::{resolve_pricing, total_cost, PricingEntry, PricingSource};
use cheval_core::types::{CanonicalResult, ChatMessage, CostEstimate, UsageBlock};
use std::path::Path;
use tracing::warn;

use crate::registry::{estimate_message_tokens, estimate_tokens};

/// Agent name stamped on ledger entries written by the sidecar.
pub const LEDGER_AGENT: &str = "cheval-sidecar";

// ---------------------------------------------------------------------------
// Cost estimation
// ---------------------------------------------------------------------------

/// Compute the cost estimate for a usage block.
///
/// Returns `None` when no pricing resolves; an arithmetic overflow is also
/// treated as "no estimate" (logged, never raised) so absurd token counts
/// cannot fail a completed request.
pub fn compute_cost_estimate(
    usage: &UsageBlock,
    provider: &str,
    model: &str,
    overrides: &[PricingEntry],
) -> Option<(CostEstimate, PricingSource)> {
    let (pricing, source) = resolve_pricing(provider, model, overrides)?;
    match total_cost(
        usage.prompt_tokens,
        usage.completion_tokens,
        usage.reasoning_tokens,
        &pricing,
    ) {
        Ok(breakdown) => Some((
            CostEstimate {
                input_cost_micro: breakdown.input_cost_micro.to_string(),
                output_cost_micro: breakdown.output_cost_micro.to_string(),
                reasoning_cost_micro: breakdown.reasoning_cost_micro.to_string(),
                total_cost_micro: breakdown.total_cost_micro.to_string(),
            },
            source,
        )),
        Err(err) => {
            warn!(provider, model, error = %err, "cost estimate skipped");
            None
        }
    }
}

/// Return a copy of `result` with `usage.cost` populated when pricing
/// resolves. The input is never mutated; with no pricing the copy carries
/// no cost field.
pub fn enrich_with_cost(
    result: &CanonicalResult,
    provider: &str,
    model: &str,
    overrides: &[PricingEntry],
) -> CanonicalResult {
    let mut enriched = result.clone();
    if let Some((cost, _)) = compute_cost_estimate(&result.usage, provider, model, overrides) {
        enriched.usage.cost = Some(cost);
    }
    enriched
}

// ---------------------------------------------------------------------------
// Recording
// ---------------------------------------------------------------------------

/// Usage to record for a completed request: the provider-reported counters
/// when any are present, otherwise a best-effort estimate from the prompt
/// and the generated content.
pub fn usage_for_ledger(
    request_messages: &[ChatMessage],
    result: &CanonicalResult,
) -> (UsageBlock, UsageSource) {
    let reported = &result.usage;
    if reported.prompt_tokens == 0
        && reported.completion_tokens == 0
        && reported.reasoning_tokens == 0
    {
        (
            UsageBlock {
                prompt_tokens: estimate_message_tokens(request_messages),
                completion_tokens: estimate_tokens(&result.content),
                reasoning_tokens: 0,
                cost: None,
            },
            UsageSource::Estimated,
        )
    } else {
        (reported.clone(), UsageSource::Actual)
    }
}

/// Append a ledger entry for a completed request (fire-and-forget).
///
/// Every failure path logs and returns; nothing propagates to the caller.
#[allow(clippy::too_many_arguments)]
pub fn record_usage(
    trace_id: &str,
    provider: &str,
    model: &str,
    usage: &UsageBlock,
    usage_source: UsageSource,
    latency_ms: u64,
    overrides: &[PricingEntry],
    ledger_path: &Path,
) {
    let (cost_micro, pricing_source) =
        match compute_cost_estimate(usage, provider, model, overrides) {
            Some((estimate, source)) => (
                estimate.total_cost_micro.parse::<u64>().unwrap_or(0),
                source,
            ),
            None => (0, PricingSource::Unknown),
        };

    let entry = LedgerEntry::new(
        trace_id,
        LEDGER_AGENT,
        provider,
        model,
        usage.prompt_tokens,
        usage.completion_tokens,
        usage.reasoning_tokens,
        cost_micro,
        pricing_source,
        latency_ms,
        usage_source,
    );

    if let Err(err) = append_entry(&entry, ledger_path) {
        warn!(trace_id, error = %err, "failed to record usage to ledger");
        return;
    }
    if cost_micro > 0 {
        if let Err(err) = update_daily_spend(cost_micro, ledger_path) {
            warn!(trace_id, error = %err, "failed to update daily spend counter");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cheval_core::ledger::{read_daily_spend, read_entries};
    use cheval_core::types::ResultMetadata;

    fn result_with_usage(prompt: u64, completion: u64, reasoning: u64) -> CanonicalResult {
        CanonicalResult {
            content: "hello".into(),
            thinking: None,
            tool_calls: None,
            usage: UsageBlock {
                prompt_tokens: prompt,
                completion_tokens: completion,
                reasoning_tokens: reasoning,
                cost: None,
            },
            metadata: ResultMetadata {
                model: "gpt-4o".into(),
                provider_request_id: None,
                latency_ms: 10,
                trace_id: "t1".into(),
            },
        }
    }

    #[test]
    fn enrichment_adds_string_encoded_costs() {
        let result = result_with_usage(1000, 500, 0);
        let enriched = enrich_with_cost(&result, "openai", "gpt-4o", &[]);
        let cost = enriched.usage.cost.unwrap();
        assert_eq!(cost.input_cost_micro, "2500");
        assert_eq!(cost.output_cost_micro, "5000");
        assert_eq!(cost.reasoning_cost_micro, "0");
        assert_eq!(cost.total_cost_micro, "7500");
    }

    #[test]
    fn enrichment_never_mutates_the_input() {
        let result = result_with_usage(1000, 500, 0);
        let _ = enrich_with_cost(&result, "openai", "gpt-4o", &[]);
        assert!(result.usage.cost.is_none());
    }

    #[test]
    fn no_pricing_means_no_cost_field() {
        let result = result_with_usage(1000, 500, 0);
        let enriched = enrich_with_cost(&result, "nobody", "mystery-model", &[]);
        assert!(enriched.usage.cost.is_none());
    }

    #[test]
    fn request_overrides_beat_default_table() {
        let overrides = vec![PricingEntry::new("openai", "gpt-4o", 1_000_000, 1_000_000, 0)];
        let result = result_with_usage(1000, 500, 0);
        let enriched = enrich_with_cost(&result, "openai", "gpt-4o", &overrides);
        assert_eq!(enriched.usage.cost.unwrap().total_cost_micro, "1500");
    }

    #[test]
    fn enormous_token_counts_never_panic() {
        let result = result_with_usage(u64::MAX, u64::MAX, u64::MAX);
        // Overflow inside the estimate degrades to "no cost", not a panic.
        let enriched = enrich_with_cost(&result, "openai", "gpt-4o", &[]);
        assert!(enriched.usage.cost.is_none());
    }

    #[test]
    fn record_usage_writes_one_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = tmp.path().join("ledger.jsonl");
        let result = result_with_usage(1000, 500, 0);

        record_usage(
            "t1",
            "openai",
            "gpt-4o",
            &result.usage,
            UsageSource::Actual,
            123,
            &[],
            &ledger,
        );

        let entries = read_entries(&ledger);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].trace_id, "t1");
        assert_eq!(entries[0].agent, LEDGER_AGENT);
        assert_eq!(entries[0].cost_micro_usd, 7500);
        assert_eq!(entries[0].pricing_source, PricingSource::Default);
        assert_eq!(read_daily_spend(&ledger), 7500);
    }

    #[test]
    fn unknown_pricing_records_zero_cost() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = tmp.path().join("ledger.jsonl");
        let usage = UsageBlock {
            prompt_tokens: 10,
            completion_tokens: 5,
            reasoning_tokens: 0,
            cost: None,
        };

        record_usage(
            "t2",
            "nobody",
            "mystery",
            &usage,
            UsageSource::Actual,
            50,
            &[],
            &ledger,
        );

        let entries = read_entries(&ledger);
        assert_eq!(entries[0].cost_micro_usd, 0);
        assert_eq!(entries[0].pricing_source, PricingSource::Unknown);
    }

    #[test]
    fn record_usage_swallows_unwritable_paths() {
        let usage = UsageBlock::default();
        // Root of the filesystem is not writable for this test user; the
        // call must still return normally.
        record_usage(
            "t3",
            "openai",
            "gpt-4o",
            &usage,
            UsageSource::Actual,
            1,
            &[],
            Path::new("/proc/definitely/not/writable/ledger.jsonl"),
        );
    }

    #[test]
    fn reported_usage_is_recorded_as_actual() {
        let result = result_with_usage(1000, 500, 0);
        let (usage, source) = usage_for_ledger(&[], &result);
        assert_eq!(source, UsageSource::Actual);
        assert_eq!(usage.prompt_tokens, 1000);
    }

    #[test]
    fn missing_usage_falls_back_to_estimates() {
        let mut result = result_with_usage(0, 0, 0);
        result.content = "x".repeat(35);
        let messages = vec![ChatMessage {
            role: "user".into(),
            content: Some("y".repeat(70)),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }];

        let (usage, source) = usage_for_ledger(&messages, &result);
        assert_eq!(source, UsageSource::Estimated);
        assert_eq!(usage.prompt_tokens, 20);
        assert_eq!(usage.completion_tokens, 10);
    }
}
