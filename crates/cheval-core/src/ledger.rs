//! Append-only cost ledger.
//!
//! One JSON line per completed request at `CHEVAL_LEDGER_PATH`. The ledger
//! is observability: nothing in the pipeline ever reads it to make a
//! decision. A sidecar `daily-spend.json` in the same directory holds a
//! running micro-USD counter updated under an exclusive file lock;
//! corruption of either file degrades, it never crashes the pipeline.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::pricing::PricingSource;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageSource {
    Actual,
    Estimated,
}

/// One immutable ledger line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub trace_id: String,
    pub agent: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub cost_micro_usd: u64,
    pub pricing_source: PricingSource,
    pub latency_ms: u64,
    pub usage_source: UsageSource,
    pub ts: String,
}

impl LedgerEntry {
    /// Build an entry stamped with the current UTC time.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trace_id: impl Into<String>,
        agent: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
        reasoning_tokens: u64,
        cost_micro_usd: u64,
        pricing_source: PricingSource,
        latency_ms: u64,
        usage_source: UsageSource,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            agent: agent.into(),
            provider: provider.into(),
            model: model.into(),
            input_tokens,
            output_tokens,
            reasoning_tokens,
            cost_micro_usd,
            pricing_source,
            latency_ms,
            usage_source,
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }
    }
}

// ---------------------------------------------------------------------------
// Append / read
// ---------------------------------------------------------------------------

/// Append one entry, creating parent directories as needed. Relies on
/// O_APPEND atomicity; no lock is taken.
pub fn append_entry(entry: &LedgerEntry, path: &Path) -> Result<(), LedgerError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let line = serde_json::to_string(entry)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()?;
    Ok(())
}

/// Read every parseable entry in insertion order. Malformed lines are
/// skipped with a warning; a missing file reads as empty.
pub fn read_entries(path: &Path) -> Vec<LedgerEntry> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };
    let mut entries = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                warn!(line = idx + 1, error = %err, "skipping malformed ledger line");
            }
        }
    }
    entries
}

// ---------------------------------------------------------------------------
// Daily spend counter
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct DailySpend {
    total_micro_usd: u64,
}

/// Path of the counter file next to the ledger.
pub fn daily_spend_path(ledger_path: &Path) -> PathBuf {
    let dir = ledger_path.parent().unwrap_or_else(|| Path::new("."));
    dir.join("daily-spend.json")
}

/// Read the running counter. Missing or corrupt file reads as zero.
pub fn read_daily_spend(ledger_path: &Path) -> u64 {
    let path = daily_spend_path(ledger_path);
    std::fs::read_to_string(&path)
        .ok()
        .and_then(|text| serde_json::from_str::<DailySpend>(&text).ok())
        .map(|spend| spend.total_micro_usd)
        .unwrap_or(0)
}

/// Atomically add `delta_micro` to the running counter, holding an
/// exclusive lock across the read-modify-write. Returns the new total.
pub fn update_daily_spend(delta_micro: u64, ledger_path: &Path) -> Result<u64, LedgerError> {
    let path = daily_spend_path(ledger_path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    file.lock_exclusive()?;

    let result = (|| -> Result<u64, LedgerError> {
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        // Corruption degrades to zero, never to an error.
        let current = serde_json::from_str::<DailySpend>(&text)
            .map(|spend| spend.total_micro_usd)
            .unwrap_or(0);
        let total = current.saturating_add(delta_micro);

        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        let updated = serde_json::to_string(&DailySpend {
            total_micro_usd: total,
        })?;
        file.write_all(updated.as_bytes())?;
        file.flush()?;
        Ok(total)
    })();

    let _ = fs2::FileExt::unlock(&file);
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
