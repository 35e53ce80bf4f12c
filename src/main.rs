//! Delta-neutral perpetual keeper entry point: wires venue adapters, the
//! shared caches/registries, and the periodic-loop components together,
//! then serves the diagnostics HTTP surface alongside them.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use delta_keeper::adapter::{HyperliquidAdapter, OkxAdapter, OkxCredentials, ParadexAdapter, VenueAdapter};
use delta_keeper::clock::{SharedClock, SystemClock};
use delta_keeper::config::Config;
use delta_keeper::diagnostics::{self, DiagnosticsState};
use delta_keeper::executor::HedgedExecutor;
use delta_keeper::guardian::Guardian;
use delta_keeper::lock_registry::LockRegistry;
use delta_keeper::market_state::MarketStateCache;
use delta_keeper::model::VenueId;
use delta_keeper::predictor::{FundingPredictor, StaticFundingPredictor};
use delta_keeper::reconcile::ReconciliationEngine;
use delta_keeper::scheduler::Scheduler;
use delta_keeper::unwinder::WithdrawalUnwinder;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "delta_keeper=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Builds whichever venue adapters have credentials in the environment.
/// A venue missing its credentials is simply left out — the keeper runs
/// against whatever subset is configured, same as the exchange-specific
/// env gating any single venue's credentials use.
fn build_adapters(config: &Config) -> HashMap<VenueId, Arc<dyn VenueAdapter>> {
    let mut adapters: HashMap<VenueId, Arc<dyn VenueAdapter>> = HashMap::new();

    if let Ok(key) = env::var("HYPERLIQUID_PRIVATE_KEY") {
        match HyperliquidAdapter::new(&key, config.clone()) {
            Ok(adapter) => {
                adapters.insert(VenueId::Hyperliquid, Arc::new(adapter));
                info!("Hyperliquid adapter initialized");
            }
            Err(e) => warn!(error = %e, "Hyperliquid adapter init failed, running without it"),
        }
    }

    let okx_creds = (
        env::var("OKX_API_KEY"),
        env::var("OKX_SECRET"),
        env::var("OKX_PASSPHRASE"),
    );
    if let (Ok(api_key), Ok(secret), Ok(passphrase)) = okx_creds {
        let adapter = OkxAdapter::new(OkxCredentials { api_key, secret, passphrase }, config.clone());
        adapters.insert(VenueId::Okx, Arc::new(adapter));
        info!("Okx adapter initialized");
    }

    let paradex_creds = (env::var("PARADEX_STARK_PRIVATE_KEY"), env::var("PARADEX_ACCOUNT_ADDRESS"));
    if let (Ok(stark_key), Ok(account_address)) = paradex_creds {
        match ParadexAdapter::new(&stark_key, account_address, config.clone()) {
            Ok(adapter) => {
                adapters.insert(VenueId::Paradex, Arc::new(adapter));
                info!("Paradex adapter initialized");
            }
            Err(e) => warn!(error = %e, "Paradex adapter init failed, running without it"),
        }
    }

    adapters
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("delta-neutral keeper starting");

    let config = Config::from_env();
    let clock: SharedClock = Arc::new(SystemClock);

    let adapters = build_adapters(&config);
    if adapters.is_empty() {
        warn!("no venue adapters configured, the keeper will idle with an empty book");
    }
    let configured_venues: Vec<VenueId> = adapters.keys().copied().collect();

    let registry = Arc::new(LockRegistry::new());
    let market_state = Arc::new(MarketStateCache::new(adapters, clock.clone()));
    let executor = Arc::new(HedgedExecutor::new(registry.clone(), market_state.clone(), config.clone()));
    let predictor: Arc<dyn FundingPredictor> = Arc::new(StaticFundingPredictor::new(configured_venues));
    let guardian = Arc::new(Guardian::new(
        registry.clone(),
        market_state.clone(),
        config.clone(),
        clock.clone(),
        predictor,
    ));
    let reconciler = Arc::new(ReconciliationEngine::new(market_state.clone(), config.clone(), clock.clone()));
    let unwinder = Arc::new(WithdrawalUnwinder::new(registry.clone(), market_state.clone(), config.clone()));

    let scheduler = Arc::new(Scheduler::new(
        registry.clone(),
        market_state.clone(),
        executor,
        guardian,
        reconciler.clone(),
        unwinder,
        config.clone(),
        clock,
    ));

    market_state.refresh_all().await;

    let _loop_handles = scheduler.spawn_all();

    // Production ingestion (on-chain log following) owns `vault_tx` and
    // feeds it from its own task; `_vault_tx` just keeps the channel open
    // for the lifetime of the process until that's wired in.
    let (_vault_tx, vault_rx) = mpsc::channel(256);
    tokio::spawn(scheduler.clone().run_vault_events(vault_rx));

    let diagnostics_state = DiagnosticsState { registry, reconciler, scheduler };
    let app = diagnostics::router(diagnostics_state);

    let listener = TcpListener::bind(&config.diagnostics_bind_addr)
        .await
        .with_context(|| format!("failed to bind diagnostics server on {}", config.diagnostics_bind_addr))?;
    info!(addr = %config.diagnostics_bind_addr, "diagnostics server listening");
    axum::serve(listener, app).await.context("diagnostics server error")?;

    Ok(())
}
