//! Per-provider connection pools.
//!
//! Each provider name maps to one lazily-created `reqwest::Client` bound to
//! the provider's base URL and timeouts. The map uses a double-checked
//! lookup: a lock-free read first, then an entry insert that keeps the
//! winner if two requests race on first use.

use cheval_core::types::ProviderConfig;
use cheval_core::ChevalError;
use dashmap::DashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::registry::resolve_timeouts;

const POOL_MAX_KEEPALIVE: usize = 10;
const POOL_KEEPALIVE_EXPIRY: Duration = Duration::from_secs(30);

/// A pooled client plus the base URL it was created for.
#[derive(Debug, Clone)]
pub struct ProviderPool {
    pub client: reqwest::Client,
    pub base_url: String,
}

/// Map from provider name to its pooled HTTP client.
#[derive(Debug, Default)]
pub struct PoolManager {
    pools: DashMap<String, ProviderPool>,
}

impl PoolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the pool for a provider, creating it on first use.
    pub fn get_or_create(&self, provider: &ProviderConfig) -> Result<ProviderPool, ChevalError> {
        if let Some(existing) = self.pools.get(&provider.name) {
            return Ok(existing.clone());
        }

        let (connect_ms, read_ms, total_ms) = resolve_timeouts(provider);
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(connect_ms))
            .read_timeout(Duration::from_millis(read_ms))
            // Write-side limits ride on the total timeout.
            .timeout(Duration::from_millis(total_ms))
            .pool_max_idle_per_host(POOL_MAX_KEEPALIVE)
            .pool_idle_timeout(POOL_KEEPALIVE_EXPIRY)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| ChevalError::internal(format!("failed to build HTTP client: {e}")))?;

        let pool = ProviderPool {
            client,
            base_url: provider.base_url.trim_end_matches('/').to_string(),
        };

        debug!(provider = %provider.name, "created provider connection pool");
        // Double-checked: if another request created the pool meanwhile,
        // keep the existing one.
        let entry = self
            .pools
            .entry(provider.name.clone())
            .or_insert(pool);
        Ok(entry.clone())
    }

    /// Number of live pools.
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Drop every pool; idle connections close as the clients are dropped.
    pub fn close_all(&self) {
        let drained = self.pools.len();
        self.pools.clear();
        info!(pools = drained, "drained provider connection pools");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
