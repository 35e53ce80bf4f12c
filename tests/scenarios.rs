//! End-to-end scenarios against scriptable mock venue adapters, covering
//! the concrete walkthroughs for hedge opening, Guardian escalation,
//! orphan cleanup, single-leg recovery, and withdrawal unwinding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use delta_keeper::adapter::{OpenOrder, VenueAdapter};
use delta_keeper::clock::{SharedClock, TestClock};
use delta_keeper::config::Config;
use delta_keeper::error::ExchangeError;
use delta_keeper::executor::{HedgeRequest, HedgedExecutor};
use delta_keeper::guardian::Guardian;
use delta_keeper::lock_registry::LockRegistry;
use delta_keeper::market_state::MarketStateCache;
use delta_keeper::model::{OrderRequest, OrderResponse, OrderSide, OrderStatus, Position, Symbol, VenueId};
use delta_keeper::predictor::{FundingPredictor, StaticFundingPredictor};
use delta_keeper::reconcile::ReconciliationEngine;
use delta_keeper::unwinder::WithdrawalUnwinder;

/// A scriptable venue double: every call that matters to a scenario can
/// be steered from the test, everything else answers a sane default.
struct MockAdapter {
    venue: VenueId,
    mark_price: Mutex<f64>,
    positions: Mutex<Vec<Position>>,
    open_orders: Mutex<Vec<OpenOrder>>,
    /// If set, `place_order` returns this status instead of `Filled`.
    next_place_status: Mutex<Option<OrderStatus>>,
    /// If set, every `get_order_status` call returns this fixed
    /// (status, filled_size) instead of the default `(Filled, request size)`
    /// — used to script a leg that stalls on a venue across repeated polls.
    status_poll_override: Mutex<Option<(OrderStatus, f64)>>,
    place_calls: AtomicU32,
    cancel_calls: AtomicU32,
    last_cancelled_id: Mutex<Option<String>>,
}

impl MockAdapter {
    fn new(venue: VenueId, mark_price: f64) -> Self {
        Self {
            venue,
            mark_price: Mutex::new(mark_price),
            positions: Mutex::new(vec![]),
            open_orders: Mutex::new(vec![]),
            next_place_status: Mutex::new(None),
            status_poll_override: Mutex::new(None),
            place_calls: AtomicU32::new(0),
            cancel_calls: AtomicU32::new(0),
            last_cancelled_id: Mutex::new(None),
        }
    }

    fn stall_order_status(&self, status: OrderStatus, filled_size: f64) {
        *self.status_poll_override.lock() = Some((status, filled_size));
    }

    fn set_position(&self, symbol: &str, side: OrderSide, size: f64, mark: f64) {
        *self.positions.lock() = vec![Position {
            venue: self.venue,
            symbol: Symbol::new(symbol),
            side,
            size,
            entry_price: mark,
            mark_price: mark,
            unrealized_pnl: 0.0,
            leverage: None,
            liquidation_price: None,
            margin_used: 0.0,
        }];
    }
}

#[async_trait]
impl VenueAdapter for MockAdapter {
    fn venue(&self) -> VenueId {
        self.venue
    }

    async fn place_order(&self, request: OrderRequest) -> Result<OrderResponse, ExchangeError> {
        self.place_calls.fetch_add(1, Ordering::SeqCst);
        let status = self.next_place_status.lock().take().unwrap_or(OrderStatus::Filled);
        let filled_size = if status == OrderStatus::Filled { request.size } else { 0.0 };
        Ok(OrderResponse {
            venue: self.venue,
            venue_order_id: uuid::Uuid::new_v4().to_string(),
            status,
            filled_size,
            avg_fill_price: request.price,
            error: None,
        })
    }

    async fn cancel_order(&self, venue_order_id: &str, _symbol: Option<&Symbol>) -> Result<bool, ExchangeError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_cancelled_id.lock() = Some(venue_order_id.to_string());
        self.open_orders.lock().retain(|o| o.venue_order_id != venue_order_id);
        Ok(true)
    }

    async fn cancel_all_orders(&self, _symbol: &Symbol) -> Result<u32, ExchangeError> {
        let n = self.open_orders.lock().len() as u32;
        self.open_orders.lock().clear();
        Ok(n)
    }

    async fn get_order_status(&self, venue_order_id: &str, _symbol: Option<&Symbol>) -> Result<OrderResponse, ExchangeError> {
        let (status, filled_size) = self
            .status_poll_override
            .lock()
            .clone()
            .unwrap_or((OrderStatus::Filled, 1.0));
        Ok(OrderResponse {
            venue: self.venue,
            venue_order_id: venue_order_id.to_string(),
            status,
            filled_size,
            avg_fill_price: None,
            error: None,
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        Ok(self.positions.lock().clone())
    }

    async fn get_mark_price(&self, _symbol: &Symbol) -> Result<f64, ExchangeError> {
        Ok(*self.mark_price.lock())
    }

    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        Ok(100_000.0)
    }

    async fn get_equity(&self) -> Result<f64, ExchangeError> {
        Ok(100_000.0)
    }

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError> {
        Ok(self.open_orders.lock().clone())
    }

    async fn is_ready(&self) -> bool {
        true
    }

    async fn test_connection(&self) -> Result<(), ExchangeError> {
        Ok(())
    }
}

struct Harness {
    registry: Arc<LockRegistry>,
    market_state: Arc<MarketStateCache>,
    executor: Arc<HedgedExecutor>,
    guardian: Arc<Guardian>,
    reconciler: Arc<ReconciliationEngine>,
    unwinder: Arc<WithdrawalUnwinder>,
    clock: Arc<TestClock>,
    adapter_a: Arc<MockAdapter>,
    adapter_b: Arc<MockAdapter>,
}

fn harness(config: Config) -> Harness {
    let adapter_a = Arc::new(MockAdapter::new(VenueId::Hyperliquid, 3500.0));
    let adapter_b = Arc::new(MockAdapter::new(VenueId::Okx, 3500.0));
    let mut adapters: HashMap<VenueId, Arc<dyn VenueAdapter>> = HashMap::new();
    adapters.insert(VenueId::Hyperliquid, adapter_a.clone());
    adapters.insert(VenueId::Okx, adapter_b.clone());

    let clock = Arc::new(TestClock::new(Utc::now()));
    let shared_clock: SharedClock = clock.clone();
    let registry = Arc::new(LockRegistry::new());
    let market_state = Arc::new(MarketStateCache::new(adapters, shared_clock.clone()));
    let executor = Arc::new(HedgedExecutor::new(registry.clone(), market_state.clone(), config.clone()));
    let predictor: Arc<dyn FundingPredictor> =
        Arc::new(StaticFundingPredictor::new(vec![VenueId::Hyperliquid, VenueId::Okx]));
    let guardian = Arc::new(Guardian::new(
        registry.clone(),
        market_state.clone(),
        config.clone(),
        shared_clock.clone(),
        predictor,
    ));
    let reconciler = Arc::new(ReconciliationEngine::new(market_state.clone(), config.clone(), shared_clock.clone()));
    let unwinder = Arc::new(WithdrawalUnwinder::new(registry.clone(), market_state.clone(), config.clone()));

    Harness {
        registry,
        market_state,
        executor,
        guardian,
        reconciler,
        unwinder,
        clock,
        adapter_a,
        adapter_b,
    }
}

fn single_slice_config() -> Config {
    let mut config = Config::default();
    config.number_of_slices = 1;
    config
}

/// S1 — Clean hedge open: both legs fill immediately, balanced.
#[tokio::test]
async fn s1_clean_hedge_open() {
    let h = harness(single_slice_config());
    let result = h
        .executor
        .execute(HedgeRequest {
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
    assert_eq!(result.completed_slices, 1);
    assert_eq!(result.long_filled, 1.0);
    assert_eq!(result.short_filled, 1.0);
    assert_eq!(h.adapter_a.place_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.adapter_b.place_calls.load(Ordering::SeqCst), 1);
}

/// S2 — Asymmetric fill: the long leg fills immediately, the short leg
/// stalls on its venue. The executor's own poll loop is the only thing
/// that ever writes `Filled`/`PartiallyFilled` into the registry, so
/// driving this through `execute` (rather than hand-setting statuses)
/// proves the Guardian's escalation ladder is reachable from a real fill.
/// Once the laggard ages past the aggressive threshold, the Guardian
/// cancels + re-prices it.
#[tokio::test]
async fn s2_guardian_improves_price_on_laggard_leg() {
    let mut config = Config::default();
    config.number_of_slices = 1;
    config.slice_fill_timeout = std::time::Duration::from_millis(20);
    config.fill_check_interval = std::time::Duration::from_millis(5);
    let h = harness(config);

    // Venue A (Hyperliquid, the long leg) fills immediately via the
    // adapter's default get_order_status response. Venue B (Okx, the
    // short leg) reports the full size but never flips to `Filled` —
    // a resting order stuck just short of confirmation.
    h.adapter_b.stall_order_status(OrderStatus::PartiallyFilled, 1.0);

    let result = h
        .executor
        .execute(HedgeRequest {
            symbol: Symbol::new("ETH"),
            long_venue: VenueId::Hyperliquid,
            short_venue: VenueId::Okx,
            size: 1.0,
            long_price: 3500.0,
            short_price: 3500.0,
            reduce_only: false,
        })
        .await;
    assert_eq!(result.completed_slices, 1);
    assert_eq!(h.adapter_b.cancel_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.adapter_b.place_calls.load(Ordering::SeqCst), 1);

    h.clock.advance(chrono::Duration::seconds(95));
    h.guardian.tick().await;

    assert_eq!(h.adapter_b.cancel_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.adapter_b.place_calls.load(Ordering::SeqCst), 2);
}

/// S3 — Orphan on venue B requires three consecutive ticks before it is
/// cancelled.
#[tokio::test]
async fn s3_orphan_requires_three_ticks_before_cancel() {
    let h = harness(Config::default());
    h.adapter_b.open_orders.lock().push(OpenOrder {
        venue_order_id: "orphan-1".into(),
        symbol: Symbol::new("ETH"),
        side: OrderSide::Long,
        size: 1.0,
        price: Some(3500.0),
    });

    h.guardian.tick().await;
    assert_eq!(h.adapter_b.cancel_calls.load(Ordering::SeqCst), 0);
    h.guardian.tick().await;
    assert_eq!(h.adapter_b.cancel_calls.load(Ordering::SeqCst), 0);
    h.guardian.tick().await;
    assert_eq!(h.adapter_b.cancel_calls.load(Ordering::SeqCst), 1);
}

/// S4 — Single-leg recovery never targets the venue already holding the
/// existing leg, and the retry record's venues don't change across calls.
#[tokio::test]
async fn s4_single_leg_recovery_never_targets_existing_venue() {
    let h = harness(Config::default());
    h.adapter_a.set_position("ETH", OrderSide::Long, 1.0, 3500.0);
    h.market_state.refresh_all().await;

    let recovered = h.guardian.try_recover_missing_side(&Symbol::new("ETH"), VenueId::Hyperliquid).await;
    assert!(recovered);
    assert_eq!(h.adapter_b.place_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.adapter_a.place_calls.load(Ordering::SeqCst), 0);

    let record = h.guardian.retry_record(&Symbol::new("ETH"), VenueId::Hyperliquid).unwrap();
    assert_eq!(record.long_venue, VenueId::Hyperliquid);
    assert_ne!(record.short_venue, record.long_venue);

    // A second attempt must report the same venues — immutable after creation.
    h.guardian.try_recover_missing_side(&Symbol::new("ETH"), VenueId::Hyperliquid).await;
    let record_again = h.guardian.retry_record(&Symbol::new("ETH"), VenueId::Hyperliquid).unwrap();
    assert_eq!(record_again.long_venue, record.long_venue);
    assert_eq!(record_again.short_venue, record.short_venue);
}

/// S5 — Withdrawing $1,000 from a $7,000 ETH pair reduces both legs
/// proportionally and leaves the pair still delta-neutral.
#[tokio::test]
async fn s5_partial_withdrawal_preserves_delta_neutrality() {
    let h = harness(Config::default());
    h.adapter_a.set_position("ETH", OrderSide::Long, 1.0, 3500.0);
    h.adapter_b.set_position("ETH", OrderSide::Short, 1.0, 3500.0);
    h.market_state.refresh_all().await;
    h.market_state.upsert_mark_price(Symbol::new("ETH"), VenueId::Hyperliquid, 3500.0);
    h.market_state.upsert_mark_price(Symbol::new("ETH"), VenueId::Okx, 3500.0);

    let result = h.unwinder.unwind(1000.0).await;

    assert!(matches!(result.outcome, delta_keeper::unwinder::UnwindOutcome::Full));
    assert_eq!(result.reductions.len(), 2);
    for reduction in &result.reductions {
        assert!((reduction.size - 1000.0 / (2.0 * 3500.0)).abs() < 1e-6);
        assert!(!reduction.full_close);
    }
    let long_reduction = result.reductions.iter().find(|r| r.side == OrderSide::Short && r.venue == VenueId::Hyperliquid);
    let short_reduction = result.reductions.iter().find(|r| r.side == OrderSide::Long && r.venue == VenueId::Okx);
    assert!(long_reduction.is_some());
    assert!(short_reduction.is_some());
}

/// S6 — Withdrawing $10,000 from the same $7,000 pair caps at a full
/// close and reports the uncovered residual.
#[tokio::test]
async fn s6_oversized_withdrawal_caps_at_full_close_and_reports_residual() {
    let h = harness(Config::default());
    h.adapter_a.set_position("ETH", OrderSide::Long, 1.0, 3500.0);
    h.adapter_b.set_position("ETH", OrderSide::Short, 1.0, 3500.0);
    h.market_state.refresh_all().await;
    h.market_state.upsert_mark_price(Symbol::new("ETH"), VenueId::Hyperliquid, 3500.0);
    h.market_state.upsert_mark_price(Symbol::new("ETH"), VenueId::Okx, 3500.0);

    let result = h.unwinder.unwind(10_000.0).await;

    assert_eq!(result.reductions.len(), 2);
    for reduction in &result.reductions {
        assert!((reduction.size - 1.0).abs() < 1e-6);
        assert!(reduction.full_close);
    }
    match result.outcome {
        delta_keeper::unwinder::UnwindOutcome::Partial { residual_usd } => {
            assert!((residual_usd - 3000.0).abs() < 1.0);
        }
        delta_keeper::unwinder::UnwindOutcome::Full => panic!("expected a partial outcome with a residual"),
    }
}
