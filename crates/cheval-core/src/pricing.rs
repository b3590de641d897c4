//! Integer micro-USD pricing math.
//!
//! All cost arithmetic in the system happens in integer micro-USD
//! (USD x 10^6). Division truncates toward zero and the remainder is
//! surfaced to the caller so sub-micro amounts can be carried per scope by
//! a [`RemainderAccumulator`] instead of silently dropped.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const MICRO_DIVISOR: u64 = 1_000_000;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PricingError {
    /// BUDGET_OVERFLOW: `tokens * price` exceeded the integer range.
    #[error("BUDGET_OVERFLOW: {tokens} tokens at {price_micro_per_mtok} micro-USD/Mtok overflows")]
    Overflow {
        tokens: u64,
        price_micro_per_mtok: u64,
    },
}

// ---------------------------------------------------------------------------
// Pricing entries
// ---------------------------------------------------------------------------

/// Where a resolved pricing entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PricingSource {
    Config,
    Default,
    Unknown,
}

/// Per-model rates in integer micro-USD per million tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingEntry {
    pub provider: String,
    pub model: String,
    pub input_micro_per_mtok: u64,
    pub output_micro_per_mtok: u64,
    /// Defaults to zero for models without a separate reasoning rate.
    #[serde(default)]
    pub reasoning_micro_per_mtok: u64,
}

impl PricingEntry {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        input: u64,
        output: u64,
        reasoning: u64,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            input_micro_per_mtok: input,
            output_micro_per_mtok: output,
            reasoning_micro_per_mtok: reasoning,
        }
    }
}

/// Built-in rates for common models (approximate 2025-2026 pricing).
pub fn default_pricing_table() -> Vec<PricingEntry> {
    vec![
        // Anthropic
        PricingEntry::new("anthropic", "claude-opus-4-20250514", 15_000_000, 75_000_000, 0),
        PricingEntry::new("anthropic", "claude-sonnet-4-20250514", 3_000_000, 15_000_000, 0),
        PricingEntry::new("anthropic", "claude-haiku-4-20250514", 800_000, 4_000_000, 0),
        // OpenAI
        PricingEntry::new("openai", "gpt-4o", 2_500_000, 10_000_000, 0),
        PricingEntry::new("openai", "gpt-4o-mini", 150_000, 600_000, 0),
        PricingEntry::new("openai", "o3-mini", 1_100_000, 4_400_000, 4_400_000),
        // Moonshot
        PricingEntry::new("moonshot", "kimi-k2", 600_000, 2_500_000, 0),
    ]
}

/// Look up the built-in table by exact (provider, model).
pub fn find_default_pricing(provider: &str, model: &str) -> Option<PricingEntry> {
    default_pricing_table()
        .into_iter()
        .find(|e| e.provider == provider && e.model == model)
}

/// Resolve pricing: config overrides first, then the default table.
pub fn resolve_pricing(
    provider: &str,
    model: &str,
    overrides: &[PricingEntry],
) -> Option<(PricingEntry, PricingSource)> {
    if let Some(entry) = overrides
        .iter()
        .find(|e| e.provider == provider && e.model == model)
    {
        return Some((entry.clone(), PricingSource::Config));
    }
    find_default_pricing(provider, model).map(|e| (e, PricingSource::Default))
}

// ---------------------------------------------------------------------------
// Cost math
// ---------------------------------------------------------------------------

/// Cost of `tokens` at `price` micro-USD per million tokens.
///
/// Returns `(cost_micro, remainder_micro)` where
/// `cost * 1_000_000 + remainder == tokens * price` and
/// `0 <= remainder < 1_000_000`.
pub fn cost_micro(tokens: u64, price_micro_per_mtok: u64) -> Result<(u64, u64), PricingError> {
    let product = tokens
        .checked_mul(price_micro_per_mtok)
        .ok_or(PricingError::Overflow {
            tokens,
            price_micro_per_mtok,
        })?;
    Ok((product / MICRO_DIVISOR, product % MICRO_DIVISOR))
}

/// Cost breakdown of one request, all components in integer micro-USD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostBreakdown {
    pub input_cost_micro: u64,
    pub output_cost_micro: u64,
    pub reasoning_cost_micro: u64,
    pub total_cost_micro: u64,
    /// Sum of the three truncated remainders, for carry accounting.
    pub remainder_micro: u64,
}

/// Combine input/output/reasoning components under independent rates.
pub fn total_cost(
    input_tokens: u64,
    output_tokens: u64,
    reasoning_tokens: u64,
    pricing: &PricingEntry,
) -> Result<CostBreakdown, PricingError> {
    let (input_cost, input_rem) = cost_micro(input_tokens, pricing.input_micro_per_mtok)?;
    let (output_cost, output_rem) = cost_micro(output_tokens, pricing.output_micro_per_mtok)?;
    let (reasoning_cost, reasoning_rem) =
        cost_micro(reasoning_tokens, pricing.reasoning_micro_per_mtok)?;

    Ok(CostBreakdown {
        input_cost_micro: input_cost,
        output_cost_micro: output_cost,
        reasoning_cost_micro: reasoning_cost,
        total_cost_micro: input_cost + output_cost + reasoning_cost,
        remainder_micro: input_rem + output_rem + reasoning_rem,
    })
}

// ---------------------------------------------------------------------------
// Remainder accumulator
// ---------------------------------------------------------------------------

/// Carries fractional (sub-micro) remainders per scope key so long sessions
/// never silently drop cost.
///
/// Each call to [`RemainderAccumulator::carry`] folds a new remainder into
/// the running residue for the scope, emits the whole micro-USD carry, and
/// keeps the fractional part.
#[derive(Debug, Default)]
pub struct RemainderAccumulator {
    residues: HashMap<String, u64>,
}

impl RemainderAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `remainder_micro` into the scope; returns whole micro-USD units
    /// to bill now.
    pub fn carry(&mut self, scope: &str, remainder_micro: u64) -> u64 {
        let residue = self.residues.entry(scope.to_string()).or_insert(0);
        let sum = *residue + remainder_micro;
        let carry = sum / MICRO_DIVISOR;
        *residue = sum % MICRO_DIVISOR;
        carry
    }

    /// Current fractional residue for a scope.
    pub fn residue(&self, scope: &str) -> u64 {
        self.residues.get(scope).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
