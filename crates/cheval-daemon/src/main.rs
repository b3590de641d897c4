//! cheval daemon - the authenticated LLM proxy sidecar.
//!
//! Binds the HTTP surface on `127.0.0.1:{CHEVAL_PORT}` (default 3001),
//! serves until SIGTERM or ctrl-c, then drains the provider connection
//! pools. Configuration is environment-only; startup logs report what is
//! configured without ever printing a secret.

use anyhow::{Context, Result};
use cheval_bridge::http_api::{api_router, ApiState, SidecarConfig};
use cheval_harness::circuit_breaker::CircuitBreaker;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    cheval_core::logging::init_logging("cheval-daemon", "info");

    let config = SidecarConfig::from_env();

    // Sweep circuit-breaker state left behind by earlier runs.
    let swept = CircuitBreaker::cleanup_stale_files(&config.run_dir, Duration::from_secs(24 * 3600));
    if swept > 0 {
        info!(swept, "removed stale circuit breaker state files");
    }

    let state = Arc::new(ApiState::new(&config));

    let bind_addr = format!("127.0.0.1:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    let local_addr = listener.local_addr()?;

    info!(addr = %local_addr, "cheval sidecar started");
    info!(
        hmac = if config.hmac.secret.is_some() {
            "configured"
        } else {
            "NOT CONFIGURED"
        },
        nonce_cache_max = config.nonce_cache_size,
        ledger = %config.ledger_path.display(),
        "sidecar configuration"
    );

    let app = api_router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down, draining pools");
    state.shutdown();
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
