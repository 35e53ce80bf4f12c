//! Scheduler / control plane: wires the Market State Cache,
//! Hedged Executor, Order Guardian, Reconciliation Engine, and
//! Withdrawal Unwinder into the keeper's periodic-loop model, and is the
//! one place that translates vault events and reconciliation drift into
//! concrete actions. None of the components above call each other
//! directly outside the registry/adapters they already share — this is
//! the only layer that does.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::SharedClock;
use crate::config::Config;
use crate::executor::{HedgeRequest, HedgeResult, HedgedExecutor};
use crate::guardian::Guardian;
use crate::lock_registry::LockRegistry;
use crate::market_state::MarketStateCache;
use crate::model::{OrderRequest, OrderSide, OrderType, Symbol, ThreadId, TimeInForce, VenueId};
use crate::reconcile::{DriftClass, DriftEvent, ReconciliationEngine};
use crate::unwinder::WithdrawalUnwinder;

/// The vault event stream the Scheduler consumes. Production
/// ingestion (on-chain log following, mempool watching) lives outside
/// the core — this crate only defines the shape and the reaction.
#[derive(Debug, Clone)]
pub enum VaultEvent {
    /// New capital is available to put to work as a fresh hedge pair.
    CapitalDeployed {
        symbol: Symbol,
        long_venue: VenueId,
        short_venue: VenueId,
        size: f64,
        long_price: f64,
        short_price: f64,
    },
    /// A normal, best-effort withdrawal: unwind as much as needed, report
    /// a residual if the book can't fully cover it.
    WithdrawalRequested { amount_usd: f64 },
    /// Unwind everything the keeper holds, as fast as safely possible.
    EmergencyRecall,
    /// Same shape as `WithdrawalRequested` but the vault has already
    /// committed to the amount; the keeper must not report a residual
    /// without first exhausting every unpaired position too (the
    /// unwinder already does this, so the handling is identical).
    ImmediateWithdrawal { amount_usd: f64 },
}

/// Per-venue balance/equity snapshot: the NAV surface.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct VenueBalance {
    pub balance: f64,
    pub equity: f64,
}

pub struct Scheduler {
    registry: Arc<LockRegistry>,
    market_state: Arc<MarketStateCache>,
    executor: Arc<HedgedExecutor>,
    guardian: Arc<Guardian>,
    reconciler: Arc<ReconciliationEngine>,
    unwinder: Arc<WithdrawalUnwinder>,
    config: Config,
    clock: SharedClock,
    /// Symbols with an opening/closing execution currently in flight —
    /// gates single-leg recovery/close and the paired-order cleanup
    /// check, (c)).
    active_executions: Mutex<HashSet<Symbol>>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<LockRegistry>,
        market_state: Arc<MarketStateCache>,
        executor: Arc<HedgedExecutor>,
        guardian: Arc<Guardian>,
        reconciler: Arc<ReconciliationEngine>,
        unwinder: Arc<WithdrawalUnwinder>,
        config: Config,
        clock: SharedClock,
    ) -> Self {
        Self {
            registry,
            market_state,
            executor,
            guardian,
            reconciler,
            unwinder,
            config,
            clock,
            active_executions: Mutex::new(HashSet::new()),
        }
    }

    /// Starts every periodic loop names (Guardian, Reconciliation,
    /// market-state refresh, NAV sync) and returns their join handles so
    /// the caller can hold the process open.
    pub fn spawn_all(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.guardian.clone().spawn()];
        handles.push(self.clone().spawn_reconciliation_loop());
        handles.push(self.clone().spawn_market_state_loop());
        handles.push(self.clone().spawn_nav_sync_loop());
        handles
    }

    fn spawn_reconciliation_loop(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.reconcile_tick_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let events = self.reconciler.tick().await;
                self.handle_drift_events(events).await;
                self.scan_for_single_leg_positions().await;
            }
        })
    }

    fn spawn_market_state_loop(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.market_state_refresh_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.market_state.refresh_all().await;
            }
        })
    }

    fn spawn_nav_sync_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                let balances = self.get_all_balances().await;
                info!(venues = balances.len(), "NAV sync tick: balances refreshed");
            }
        })
    }

    /// The read-only NAV surface.
    pub async fn get_all_balances(&self) -> std::collections::HashMap<VenueId, VenueBalance> {
        let mut out = std::collections::HashMap::new();
        for venue in self.market_state.venues() {
            let Some(adapter) = self.market_state.adapter(venue) else {
                continue;
            };
            let balance = adapter.get_balance().await.unwrap_or_else(|e| {
                warn!(%venue, error = %e, "get_all_balances: balance fetch failed");
                0.0
            });
            let equity = adapter.get_equity().await.unwrap_or_else(|e| {
                warn!(%venue, error = %e, "get_all_balances: equity fetch failed");
                0.0
            });
            out.insert(venue, VenueBalance { balance, equity });
        }
        out
    }

    /// Runs a hedge open under the `active_executions` gate and, on
    /// success, registers reconciliation expectations for both legs.
    pub async fn open_hedge(&self, request: HedgeRequest) -> HedgeResult {
        let symbol = request.symbol.clone();
        if !self.active_executions.lock().insert(symbol.clone()) {
            warn!(%symbol, "open_hedge refused: an execution is already in flight for this symbol");
            return HedgeResult {
                abort_reason: Some("execution already in flight for symbol".to_string()),
                ..Default::default()
            };
        }

        let long_venue = request.long_venue;
        let short_venue = request.short_venue;
        let result = self.executor.execute(request).await;

        if result.success {
            if let Some(order_id) = result.long_order_id.clone() {
                self.reconciler.register_expectation(
                    long_venue,
                    symbol.clone(),
                    OrderSide::Long,
                    result.long_filled,
                    order_id,
                );
            }
            if let Some(order_id) = result.short_order_id.clone() {
                self.reconciler.register_expectation(
                    short_venue,
                    symbol.clone(),
                    OrderSide::Short,
                    result.short_filled,
                    order_id,
                );
            }
        }

        self.active_executions.lock().remove(&symbol);
        result
    }

    /// Scans actual positions for a symbol with exactly one leg and
    /// drives it through Guardian recovery/close, skipping any symbol
    /// with an opening/closing execution currently in flight (    /// concurrency hazard (c): recovery must never race an opening).
    async fn scan_for_single_leg_positions(&self) {
        let mut by_symbol: std::collections::HashMap<Symbol, Vec<VenueId>> =
            std::collections::HashMap::new();
        for venue in self.market_state.venues() {
            for position in self.market_state.positions(venue) {
                if position.size.abs() <= 1e-8 {
                    continue;
                }
                by_symbol.entry(position.symbol.clone()).or_default().push(venue);
            }
        }

        for (symbol, venues) in by_symbol {
            if venues.len() != 1 {
                continue;
            }
            if self.active_executions.lock().contains(&symbol) {
                continue;
            }
            let existing_venue = venues[0];
            let recovered = self.guardian.try_recover_missing_side(&symbol, existing_venue).await;
            if !recovered {
                if let Some(record) = self.guardian.retry_record(&symbol, existing_venue) {
                    if record.retry_count >= self.config.max_retries {
                        warn!(%symbol, venue = %existing_venue, "single-leg recovery exhausted retries, escalating to close");
                        self.guardian.close_single_leg(&symbol, existing_venue).await;
                    }
                }
            }
        }
    }

    async fn handle_drift_events(&self, events: Vec<DriftEvent>) {
        for event in events {
            match event {
                DriftEvent::ExpectationDrift { venue, symbol, side, class } => match class {
                    DriftClass::Overfill => {
                        error!(%venue, %symbol, ?side, "OVERFILL detected: alerting only, never auto-unwinding");
                    }
                    DriftClass::PartialFill => {
                        warn!(%venue, %symbol, ?side, "PARTIAL_FILL detected: reporting only");
                    }
                    DriftClass::NoFill => {
                        info!(%venue, %symbol, ?side, "NO_FILL drift handled by reconciliation's own cancel");
                    }
                    DriftClass::Matched => {}
                },
                DriftEvent::HedgePairImbalance {
                    symbol,
                    long_venue,
                    short_venue,
                    imbalance_percent,
                    rebalance_leg,
                    ..
                } => {
                    warn!(%symbol, %long_venue, %short_venue, imbalance_percent, "hedge-pair imbalance detected");
                    if let Some((venue, side, excess)) = rebalance_leg {
                        self.rebalance_leg(&symbol, venue, side, excess).await;
                    }
                }
            }
        }
    }

    /// Shrinks the larger leg of an imbalanced pair by `excess`, reduce-
    /// only, at the current mark price.
    async fn rebalance_leg(&self, symbol: &Symbol, venue: VenueId, side: OrderSide, excess: f64) {
        let Some(adapter) = self.market_state.adapter(venue) else {
            return;
        };
        let mark = match adapter.get_mark_price(symbol).await {
            Ok(m) => m,
            Err(e) => {
                warn!(%venue, %symbol, error = %e, "rebalance: mark fetch failed");
                return;
            }
        };
        let request = OrderRequest {
            symbol: symbol.clone(),
            side: side.closing_side(),
            order_type: OrderType::Limit,
            size: excess,
            price: Some(mark),
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: true,
            client_order_id: uuid::Uuid::new_v4().to_string(),
        };
        match adapter.place_order(request).await {
            Ok(response) => {
                let _ = self.registry.register_order_placing(
                    venue,
                    symbol.clone(),
                    side.closing_side(),
                    response.venue_order_id,
                    excess,
                    Some(mark),
                    ThreadId::new("rebalance", symbol),
                    self.clock.now(),
                );
                info!(%venue, %symbol, excess, "hedge-pair rebalance order placed");
            }
            Err(e) => warn!(%venue, %symbol, error = %e, "hedge-pair rebalance order failed"),
        }
    }

    /// Consumes vault events until the sender is dropped, converting each
    /// into calls on the Hedged Executor / Withdrawal Unwinder:
    /// vault events are never handled inside those components directly.
    pub async fn run_vault_events(self: Arc<Self>, mut events: mpsc::Receiver<VaultEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                VaultEvent::CapitalDeployed {
                    symbol,
                    long_venue,
                    short_venue,
                    size,
                    long_price,
                    short_price,
                } => {
                    info!(%symbol, %long_venue, %short_venue, size, "vault event: capital deployed, opening hedge");
                    let result = self
                        .open_hedge(HedgeRequest {
                            symbol,
                            long_venue,
                            short_venue,
                            size,
                            long_price,
                            short_price,
                            reduce_only: false,
                        })
                        .await;
                    if !result.success {
                        error!(reason = ?result.abort_reason, "vault event: capital deployment hedge failed");
                    }
                }
                VaultEvent::WithdrawalRequested { amount_usd } => {
                    info!(amount_usd, "vault event: withdrawal requested");
                    let result = self.unwinder.unwind(amount_usd).await;
                    match result.outcome {
                        crate::unwinder::UnwindOutcome::Full => {
                            info!("withdrawal fully covered by unwind plan");
                        }
                        crate::unwinder::UnwindOutcome::Partial { residual_usd } => {
                            warn!(residual_usd, "withdrawal only partially covered by unwind plan");
                        }
                    }
                }
                VaultEvent::ImmediateWithdrawal { amount_usd } => {
                    info!(amount_usd, "vault event: immediate withdrawal");
                    let result = self.unwinder.unwind(amount_usd).await;
                    if let crate::unwinder::UnwindOutcome::Partial { residual_usd } = result.outcome {
                        error!(residual_usd, "immediate withdrawal could not be fully covered");
                    }
                }
                VaultEvent::EmergencyRecall => {
                    error!("vault event: EMERGENCY RECALL, unwinding entire book");
                    let total: f64 = self
                        .market_state
                        .all_positions()
                        .iter()
                        .map(|p| p.size.abs() * p.mark_price)
                        .sum();
                    let result = self.unwinder.unwind(total * 1.01).await;
                    if let crate::unwinder::UnwindOutcome::Partial { residual_usd } = result.outcome {
                        error!(residual_usd, "emergency recall left a residual, manual intervention required");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::error::ExchangeError;
    use crate::model::{OrderResponse, OrderStatus, Position};
    use crate::predictor::StaticFundingPredictor;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FlatAdapter {
        venue: VenueId,
        positions: Vec<Position>,
    }

    #[async_trait]
    impl crate::adapter::VenueAdapter for FlatAdapter {
        fn venue(&self) -> VenueId {
            self.venue
        }
        async fn place_order(&self, request: OrderRequest) -> Result<OrderResponse, ExchangeError> {
            Ok(OrderResponse {
                venue: self.venue,
                venue_order_id: uuid::Uuid::new_v4().to_string(),
                status: OrderStatus::Filled,
                filled_size: request.size,
                avg_fill_price: request.price,
                error: None,
            })
        }
        async fn cancel_order(&self, _: &str, _: Option<&Symbol>) -> Result<bool, ExchangeError> {
            Ok(true)
        }
        async fn cancel_all_orders(&self, _: &Symbol) -> Result<u32, ExchangeError> {
            Ok(0)
        }
        async fn get_order_status(&self, _: &str, _: Option<&Symbol>) -> Result<OrderResponse, ExchangeError> {
            Ok(OrderResponse {
                venue: self.venue,
                venue_order_id: "x".into(),
                status: OrderStatus::Filled,
                filled_size: 1.0,
                avg_fill_price: None,
                error: None,
            })
        }
        async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
            Ok(self.positions.clone())
        }
        async fn get_mark_price(&self, _: &Symbol) -> Result<f64, ExchangeError> {
            Ok(3500.0)
        }
        async fn get_balance(&self) -> Result<f64, ExchangeError> {
            Ok(50_000.0)
        }
        async fn get_equity(&self) -> Result<f64, ExchangeError> {
            Ok(51_000.0)
        }
        async fn get_open_orders(&self) -> Result<Vec<crate::adapter::OpenOrder>, ExchangeError> {
            Ok(vec![])
        }
        async fn is_ready(&self) -> bool {
            true
        }
        async fn test_connection(&self) -> Result<(), ExchangeError> {
            Ok(())
        }
    }

    fn scheduler() -> Arc<Scheduler> {
        let mut adapters: HashMap<VenueId, Arc<dyn crate::adapter::VenueAdapter>> = HashMap::new();
        adapters.insert(VenueId::Hyperliquid, Arc::new(FlatAdapter { venue: VenueId::Hyperliquid, positions: vec![] }));
        adapters.insert(VenueId::Okx, Arc::new(FlatAdapter { venue: VenueId::Okx, positions: vec![] }));
        let clock: SharedClock = Arc::new(TestClock::new(chrono::Utc::now()));
        let config = Config::default();
        let registry = Arc::new(LockRegistry::new());
        let market_state = Arc::new(MarketStateCache::new(adapters, clock.clone()));
        let executor = Arc::new(HedgedExecutor::new(registry.clone(), market_state.clone(), config.clone()));
        let predictor: Arc<dyn crate::predictor::FundingPredictor> =
            Arc::new(StaticFundingPredictor::new(vec![VenueId::Hyperliquid, VenueId::Okx]));
        let guardian = Arc::new(Guardian::new(registry.clone(), market_state.clone(), config.clone(), clock.clone(), predictor));
        let reconciler = Arc::new(ReconciliationEngine::new(market_state.clone(), config.clone(), clock.clone()));
        let unwinder = Arc::new(WithdrawalUnwinder::new(registry.clone(), market_state.clone(), config.clone()));
        Arc::new(Scheduler::new(registry, market_state, executor, guardian, reconciler, unwinder, config, clock))
    }

    #[tokio::test]
    async fn get_all_balances_covers_every_configured_venue() {
        let scheduler = scheduler();
        let balances = scheduler.get_all_balances().await;
        assert_eq!(balances.len(), 2);
        assert_eq!(balances[&VenueId::Okx].balance, 50_000.0);
    }

    #[tokio::test]
    async fn open_hedge_registers_expectations_on_success() {
        let scheduler = scheduler();
        let mut config = Config::default();
        config.number_of_slices = 1;
        let result = scheduler
            .open_hedge(HedgeRequest {
                symbol: Symbol::new("ETH"),
                long_venue: VenueId::Hyperliquid,
                short_venue: VenueId::Okx,
                size: 1.0,
                long_price: 3500.0,
                short_price: 3500.0,
                reduce_only: false,
            })
            .await;
        assert!(result.success);
        assert_eq!(scheduler.reconciler.expectation_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_open_hedge_for_same_symbol_is_refused() {
        let scheduler = scheduler();
        scheduler.active_executions.lock().insert(Symbol::new("ETH"));
        let result = scheduler
            .open_hedge(HedgeRequest {
                symbol: Symbol::new("ETH"),
                long_venue: VenueId::Hyperliquid,
                short_venue: VenueId::Okx,
                size: 1.0,
                long_price: 3500.0,
                short_price: 3500.0,
                reduce_only: false,
            })
            .await;
        assert!(!result.success);
    }
}
