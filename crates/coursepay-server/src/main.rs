//! # coursepay-server
//!
//! Escrow payment settlement service for the course marketplace.
//!
//! This binary provides:
//! - **REST API** (axum) for checkout quotes, purchase processing,
//!   refunds, purchase history and the admin escrow surface
//! - **Purchase orchestration** that verifies payment tokens against the
//!   on-chain registry before any funds move
//! - **Release scheduler** that periodically releases due escrows to
//!   instructors and reconciles the ledger against on-chain state
//! - **Per-IP rate limiting** on the payment endpoints

mod api;
mod cache;
mod config;
mod error;
mod orchestrator;
mod quote;
mod rate_limit;
mod refund;
mod scheduler;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use coursepay_chain::adapter::EvmEscrowChain;
use coursepay_chain::oracle::PriceOracle;
use coursepay_chain::ChainRegistry;
use coursepay_shared::Blockchain;
use coursepay_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::orchestrator::PurchaseOrchestrator;
use crate::rate_limit::RateLimiter;
use crate::scheduler::ReleaseScheduler;

/// Shared handle to the ledger database.
pub type Ledger = Arc<Mutex<Database>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,coursepay_server=debug")),
        )
        .init();

    info!("Starting coursepay server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    info!(
        production = config.production,
        chains = config.chains.len(),
        admin_enabled = config.admin_token.is_some(),
        registry_pin = config.registry_code_hash.is_some(),
        "Loaded configuration"
    );
    let config = Arc::new(config);

    // -----------------------------------------------------------------------
    // 3. Open the ledger and build the chain adapters
    // -----------------------------------------------------------------------
    let db = match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    let ledger: Ledger = Arc::new(Mutex::new(db));

    let mut registry = ChainRegistry::new();
    for endpoint in &config.chains {
        match endpoint.key.blockchain {
            Blockchain::Evm => {
                registry.register(Arc::new(EvmEscrowChain::new(
                    endpoint.key,
                    endpoint.rpc_url.clone(),
                    endpoint.operator.clone(),
                )));
            }
            Blockchain::Solana => {
                anyhow::bail!("no solana adapter is available yet");
            }
        }
    }
    if registry.is_empty() {
        tracing::warn!("no chain adapters configured; purchases will fail");
    }
    let registry = Arc::new(registry);

    let oracle = Arc::new(PriceOracle::new());
    let rate_limiter = RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst);

    let orchestrator = Arc::new(PurchaseOrchestrator::new(
        ledger.clone(),
        registry.clone(),
        oracle.clone(),
        config.clone(),
    ));

    let app_state = AppState {
        ledger: ledger.clone(),
        orchestrator,
        registry: registry.clone(),
        oracle: oracle.clone(),
        config: config.clone(),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Release scheduler + reconciliation sweep.
    let sched = Arc::new(ReleaseScheduler::new(
        ledger.clone(),
        registry.clone(),
        config.clone(),
    ));
    tokio::spawn(sched.run_forever());

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(600.0).await;
        }
    });

    // Periodic price cache cleanup (every 10 minutes)
    let oracle_for_purge = oracle.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
        loop {
            interval.tick().await;
            oracle_for_purge.purge_stale().await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let http_addr = config.http_addr;
    tokio::select! {
        result = api::serve(app_state, rate_limiter, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
