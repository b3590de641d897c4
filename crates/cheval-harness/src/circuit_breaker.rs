//! File-persisted per-provider circuit breaker.
//!
//! State machine: CLOSED -> OPEN -> HALF_OPEN -> CLOSED, with one JSON state
//! file per provider under the run directory
//! (`<run_dir>/circuit-breaker-<provider>.json`).
//!
//! Counting is best-effort: reads take no lock and fall back to the default
//! CLOSED state on a missing, partially-written, or mismatched file; writes
//! hold an advisory exclusive lock for the full truncate-and-rewrite. The
//! read-modify-write window between two concurrent transitions is tolerated:
//! a doubled OPEN -> HALF_OPEN transition zeroes the probe counter twice,
//! extra probes are bounded by concurrent request count, and the breaker
//! re-opens on the first probe failure.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation – requests pass through.
    #[serde(rename = "CLOSED")]
    Closed,
    /// Too many failures – requests are rejected immediately.
    #[serde(rename = "OPEN")]
    Open,
    /// Testing recovery – a bounded number of probes are allowed through.
    #[serde(rename = "HALF_OPEN")]
    HalfOpen,
}

/// Persisted per-provider record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerState {
    pub provider: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_ts: Option<f64>,
    pub opened_at: Option<f64>,
    pub half_open_probes: u32,
}

impl BreakerState {
    fn default_for(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_ts: None,
            opened_at: None,
            half_open_probes: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within the count window before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting probes.
    pub reset_timeout: Duration,
    /// Sliding window for the failure counter.
    pub count_window: Duration,
    /// Probes admitted while half-open.
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            count_window: Duration::from_secs(300),
            half_open_max_probes: 1,
        }
    }
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    run_dir: PathBuf,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(run_dir: impl Into<PathBuf>, config: CircuitBreakerConfig) -> Self {
        Self {
            run_dir: run_dir.into(),
            config,
        }
    }

    /// State file for a provider.
    pub fn state_file_path(&self, provider: &str) -> PathBuf {
        self.run_dir.join(format!("circuit-breaker-{provider}.json"))
    }

    /// Lock-free best-effort read. Missing, unparseable, or mismatched
    /// files read as the default CLOSED state.
    pub fn read_state(&self, provider: &str) -> BreakerState {
        let path = self.state_file_path(provider);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(_) => return BreakerState::default_for(provider),
        };
        match serde_json::from_str::<BreakerState>(&text) {
            Ok(state) if state.provider == provider => state,
            _ => BreakerState::default_for(provider),
        }
    }

    fn write_state(&self, state: &BreakerState) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.run_dir)?;
        let path = self.state_file_path(&state.provider);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.lock_exclusive()?;
        let result = (|| {
            let json = serde_json::to_string_pretty(state)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            file.set_len(0)?;
            let mut writer = &file;
            writer.write_all(json.as_bytes())?;
            writer.flush()
        })();
        let _ = fs2::FileExt::unlock(&file);
        result
    }

    /// Persistence is advisory: a failed write must never fail the request
    /// path, so it only logs.
    fn persist(&self, state: &BreakerState) {
        if let Err(err) = self.write_state(state) {
            warn!(provider = %state.provider, error = %err, "circuit breaker state write failed");
        }
    }

    /// Current state for a provider, applying the OPEN -> HALF_OPEN
    /// transition when the reset timeout has elapsed.
    pub fn check(&self, provider: &str) -> CircuitState {
        let mut state = self.read_state(provider);
        match state.state {
            CircuitState::Open => {
                if let Some(opened_at) = state.opened_at {
                    if now_epoch() - opened_at >= self.config.reset_timeout.as_secs_f64() {
                        state.state = CircuitState::HalfOpen;
                        state.half_open_probes = 0;
                        self.persist(&state);
                        info!(provider, "circuit breaker OPEN -> HALF_OPEN (reset timeout expired)");
                        return CircuitState::HalfOpen;
                    }
                }
                CircuitState::Open
            }
            CircuitState::HalfOpen => {
                if state.half_open_probes >= self.config.half_open_max_probes {
                    CircuitState::Open
                } else {
                    CircuitState::HalfOpen
                }
            }
            CircuitState::Closed => CircuitState::Closed,
        }
    }

    /// Record a failure; returns the resulting state.
    pub fn record_failure(&self, provider: &str) -> CircuitState {
        let mut state = self.read_state(provider);
        let now = now_epoch();

        match state.state {
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                state.half_open_probes = 0;
                self.persist(&state);
                warn!(provider, "circuit breaker HALF_OPEN -> OPEN (probe failed)");
                CircuitState::Open
            }
            CircuitState::Closed => {
                if let Some(last) = state.last_failure_ts {
                    if now - last > self.config.count_window.as_secs_f64() {
                        state.failure_count = 0;
                    }
                }
                state.failure_count += 1;
                state.last_failure_ts = Some(now);

                if state.failure_count >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(now);
                    self.persist(&state);
                    warn!(
                        provider,
                        failures = state.failure_count,
                        threshold = self.config.failure_threshold,
                        "circuit breaker CLOSED -> OPEN"
                    );
                    CircuitState::Open
                } else {
                    self.persist(&state);
                    CircuitState::Closed
                }
            }
            CircuitState::Open => {
                state.last_failure_ts = Some(now);
                self.persist(&state);
                CircuitState::Open
            }
        }
    }

    /// Record a success; returns the resulting state.
    pub fn record_success(&self, provider: &str) -> CircuitState {
        let mut state = self.read_state(provider);
        match state.state {
            CircuitState::HalfOpen => {
                let fresh = BreakerState::default_for(provider);
                self.persist(&fresh);
                info!(provider, "circuit breaker HALF_OPEN -> CLOSED (probe succeeded)");
                CircuitState::Closed
            }
            CircuitState::Closed => {
                if state.failure_count > 0 {
                    state.failure_count = 0;
                    self.persist(&state);
                }
                CircuitState::Closed
            }
            CircuitState::Open => CircuitState::Open,
        }
    }

    /// Count a probe attempt before sending it. No-op unless half-open.
    pub fn begin_probe(&self, provider: &str) {
        let mut state = self.read_state(provider);
        if state.state == CircuitState::HalfOpen {
            state.half_open_probes += 1;
            self.persist(&state);
        }
    }

    /// Offline sweep of stale state files. Returns the number removed;
    /// files that are not circuit-breaker state are left alone.
    pub fn cleanup_stale_files(run_dir: &Path, max_age: Duration) -> usize {
        let entries = match std::fs::read_dir(run_dir) {
            Ok(e) => e,
            Err(_) => return 0,
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("circuit-breaker-") {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                .map(|age| age > max_age)
                .unwrap_or(false);
            if stale && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        removed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(dir: &Path) -> CircuitBreaker {
        CircuitBreaker::new(dir, CircuitBreakerConfig::default())
    }

    fn breaker_with_threshold(dir: &Path, threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            dir,
            CircuitBreakerConfig {
                failure_threshold: threshold,
                ..Default::default()
            },
        )
    }

    #[test]
    fn initial_state_is_closed() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(breaker(tmp.path()).check("openai"), CircuitState::Closed);
    }

    #[test]
    fn single_failure_stays_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let cb = breaker(tmp.path());
        assert_eq!(cb.record_failure("openai"), CircuitState::Closed);
        assert_eq!(cb.read_state("openai").failure_count, 1);
    }

    #[test]
    fn threshold_failures_open_circuit() {
        let tmp = tempfile::tempdir().unwrap();
        let cb = breaker_with_threshold(tmp.path(), 2);
        assert_eq!(cb.record_failure("p"), CircuitState::Closed);
        assert_eq!(cb.record_failure("p"), CircuitState::Open);
        assert_eq!(cb.check("p"), CircuitState::Open);
    }

    #[test]
    fn success_resets_failure_count() {
        let tmp = tempfile::tempdir().unwrap();
        let cb = breaker_with_threshold(tmp.path(), 3);
        cb.record_failure("p");
        cb.record_failure("p");
        cb.record_success("p");
        assert_eq!(cb.read_state("p").failure_count, 0);
        // The reset counter means two more failures still do not open it.
        cb.record_failure("p");
        assert_eq!(cb.record_failure("p"), CircuitState::Closed);
    }

    #[test]
    fn failure_count_resets_outside_window() {
        let tmp = tempfile::tempdir().unwrap();
        let cb = breaker_with_threshold(tmp.path(), 2);
        cb.record_failure("p");

        // Age the recorded failure beyond the count window.
        let mut state = cb.read_state("p");
        state.last_failure_ts = Some(now_epoch() - 301.0);
        cb.write_state(&state).unwrap();

        // Stale failure no longer counts toward the threshold.
        assert_eq!(cb.record_failure("p"), CircuitState::Closed);
        assert_eq!(cb.read_state("p").failure_count, 1);
    }

    #[test]
    fn open_transitions_to_half_open_after_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let cb = breaker_with_threshold(tmp.path(), 1);
        cb.record_failure("p");
        assert_eq!(cb.check("p"), CircuitState::Open);

        let mut state = cb.read_state("p");
        state.opened_at = Some(now_epoch() - 61.0);
        cb.write_state(&state).unwrap();

        assert_eq!(cb.check("p"), CircuitState::HalfOpen);
        assert_eq!(cb.read_state("p").half_open_probes, 0);
    }

    #[test]
    fn probe_success_closes_circuit() {
        let tmp = tempfile::tempdir().unwrap();
        let cb = breaker_with_threshold(tmp.path(), 1);
        cb.record_failure("p");
        let mut state = cb.read_state("p");
        state.opened_at = Some(now_epoch() - 61.0);
        cb.write_state(&state).unwrap();
        assert_eq!(cb.check("p"), CircuitState::HalfOpen);

        cb.begin_probe("p");
        assert_eq!(cb.record_success("p"), CircuitState::Closed);
        assert_eq!(cb.read_state("p").failure_count, 0);
    }

    #[test]
    fn probe_failure_reopens_with_fresh_timer() {
        let tmp = tempfile::tempdir().unwrap();
        let cb = breaker_with_threshold(tmp.path(), 1);
        cb.record_failure("p");
        let mut state = cb.read_state("p");
        let old_opened_at = now_epoch() - 61.0;
        state.opened_at = Some(old_opened_at);
        cb.write_state(&state).unwrap();
        assert_eq!(cb.check("p"), CircuitState::HalfOpen);

        cb.begin_probe("p");
        assert_eq!(cb.record_failure("p"), CircuitState::Open);
        assert!(cb.read_state("p").opened_at.unwrap() > old_opened_at);
    }

    #[test]
    fn exhausted_probes_report_open() {
        let tmp = tempfile::tempdir().unwrap();
        let cb = breaker(tmp.path());
        let mut state = BreakerState::default_for("p");
        state.state = CircuitState::HalfOpen;
        state.half_open_probes = 1;
        cb.write_state(&state).unwrap();

        assert_eq!(cb.check("p"), CircuitState::Open);
    }

    #[test]
    fn begin_probe_is_noop_outside_half_open() {
        let tmp = tempfile::tempdir().unwrap();
        let cb = breaker(tmp.path());
        cb.begin_probe("p");
        assert_eq!(cb.read_state("p").half_open_probes, 0);
    }

    #[test]
    fn corrupted_file_reads_as_default() {
        let tmp = tempfile::tempdir().unwrap();
        let cb = breaker(tmp.path());
        std::fs::create_dir_all(tmp.path()).unwrap();
        std::fs::write(cb.state_file_path("p"), "{truncated").unwrap();
        assert_eq!(cb.check("p"), CircuitState::Closed);
    }

    #[test]
    fn provider_mismatch_reads_as_default() {
        let tmp = tempfile::tempdir().unwrap();
        let cb = breaker(tmp.path());
        let mut other = BreakerState::default_for("someone-else");
        other.state = CircuitState::Open;
        std::fs::create_dir_all(tmp.path()).unwrap();
        std::fs::write(
            cb.state_file_path("p"),
            serde_json::to_string(&other).unwrap(),
        )
        .unwrap();
        assert_eq!(cb.check("p"), CircuitState::Closed);
    }

    #[test]
    fn providers_are_isolated() {
        let tmp = tempfile::tempdir().unwrap();
        let cb = breaker_with_threshold(tmp.path(), 1);
        cb.record_failure("bad-provider");
        assert_eq!(cb.check("bad-provider"), CircuitState::Open);
        assert_eq!(cb.check("good-provider"), CircuitState::Closed);
    }

    #[test]
    fn state_serializes_with_screaming_names() {
        let json = serde_json::to_string(&CircuitState::HalfOpen).unwrap();
        assert_eq!(json, "\"HALF_OPEN\"");
    }
}
