//! Market State Cache: the single read-heavy view of cached
//! positions and mark prices. A cache-only-reads design, generalized to
//! "return the last known value, not `None`", since positions are
//! long-lived rather than per-tick ephemera.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::adapter::VenueAdapter;
use crate::clock::SharedClock;
use crate::model::{Position, Symbol, VenueId};

#[derive(Debug, Clone, Default)]
struct Snapshot {
    /// Positions observed per venue, last-known — never cleared on a
    /// failed refresh, only replaced on a successful one.
    positions: HashMap<VenueId, Vec<Position>>,
    mark_prices: HashMap<(Symbol, VenueId), f64>,
    last_update_time: Option<DateTime<Utc>>,
}

enum RefreshState {
    Idle,
    /// A refresh is in flight; latecomers wait on the `Notify` rather
    /// than issuing their own fetches.
    InProgress(Arc<Notify>),
}

pub struct MarketStateCache {
    adapters: HashMap<VenueId, Arc<dyn VenueAdapter>>,
    snapshot: RwLock<Snapshot>,
    refresh_state: Mutex<RefreshState>,
    clock: SharedClock,
}

impl MarketStateCache {
    pub fn new(adapters: HashMap<VenueId, Arc<dyn VenueAdapter>>, clock: SharedClock) -> Self {
        Self {
            adapters,
            snapshot: RwLock::new(Snapshot::default()),
            refresh_state: Mutex::new(RefreshState::Idle),
            clock,
        }
    }

    /// Fetches positions from every venue in parallel and replaces the
    /// cached snapshot. Single-flighted: a caller arriving while a
    /// refresh is already running waits for it instead of issuing a
    /// second round of fetches.
    pub async fn refresh_all(&self) {
        let notify = {
            let mut state = self.refresh_state.lock();
            match &*state {
                RefreshState::InProgress(notify) => {
                    let notify = notify.clone();
                    drop(state);
                    notify.notified().await;
                    return;
                }
                RefreshState::Idle => {
                    let notify = Arc::new(Notify::new());
                    *state = RefreshState::InProgress(notify.clone());
                    notify
                }
            }
        };

        let venues: Vec<VenueId> = self.adapters.keys().copied().collect();
        let fetches = venues.iter().map(|venue| {
            let adapter = self.adapters[venue].clone();
            let venue = *venue;
            async move { (venue, adapter.get_positions().await) }
        });
        let results = futures_util::future::join_all(fetches).await;

        {
            let mut snapshot = self.snapshot.write();
            for (venue, result) in results {
                match result {
                    Ok(positions) => {
                        snapshot.positions.insert(venue, positions);
                    }
                    Err(e) => {
                        warn!(%venue, error = %e, "position refresh failed, keeping last known positions");
                    }
                }
            }
            snapshot.last_update_time = Some(self.clock.now());
        }

        *self.refresh_state.lock() = RefreshState::Idle;
        notify.notify_waiters();
        debug!("market state refresh complete");
    }

    /// A cache-only upsert used by reconciliation to patch a single
    /// venue's position list without a full refresh.
    pub fn upsert_positions(&self, venue: VenueId, positions: Vec<Position>) {
        self.snapshot.write().positions.insert(venue, positions);
    }

    pub fn upsert_mark_price(&self, symbol: Symbol, venue: VenueId, price: f64) {
        self.snapshot.write().mark_prices.insert((symbol, venue), price);
    }

    pub fn positions(&self, venue: VenueId) -> Vec<Position> {
        self.snapshot.read().positions.get(&venue).cloned().unwrap_or_default()
    }

    pub fn all_positions(&self) -> Vec<Position> {
        self.snapshot.read().positions.values().flatten().cloned().collect()
    }

    pub fn position(&self, venue: VenueId, symbol: &Symbol) -> Option<Position> {
        self.snapshot
            .read()
            .positions
            .get(&venue)?
            .iter()
            .find(|p| &p.symbol == symbol)
            .cloned()
    }

    pub fn mark_price(&self, symbol: &Symbol, venue: VenueId) -> Option<f64> {
        self.snapshot.read().mark_prices.get(&(symbol.clone(), venue)).copied()
    }

    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        self.snapshot.read().last_update_time
    }

    pub fn adapter(&self, venue: VenueId) -> Option<Arc<dyn VenueAdapter>> {
        self.adapters.get(&venue).cloned()
    }

    pub fn venues(&self) -> Vec<VenueId> {
        self.adapters.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::error::ExchangeError;
    use crate::model::{OrderRequest, OrderResponse, OrderSide};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingAdapter {
        venue: VenueId,
        calls: Arc<AtomicU32>,
        positions: Vec<Position>,
    }

    #[async_trait]
    impl VenueAdapter for CountingAdapter {
        fn venue(&self) -> VenueId {
            self.venue
        }
        async fn place_order(&self, _: OrderRequest) -> Result<OrderResponse, ExchangeError> {
            unimplemented!()
        }
        async fn cancel_order(&self, _: &str, _: Option<&Symbol>) -> Result<bool, ExchangeError> {
            unimplemented!()
        }
        async fn cancel_all_orders(&self, _: &Symbol) -> Result<u32, ExchangeError> {
            unimplemented!()
        }
        async fn get_order_status(&self, _: &str, _: Option<&Symbol>) -> Result<OrderResponse, ExchangeError> {
            unimplemented!()
        }
        async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(self.positions.clone())
        }
        async fn get_mark_price(&self, _: &Symbol) -> Result<f64, ExchangeError> {
            unimplemented!()
        }
        async fn get_balance(&self) -> Result<f64, ExchangeError> {
            unimplemented!()
        }
        async fn get_equity(&self) -> Result<f64, ExchangeError> {
            unimplemented!()
        }
        async fn get_open_orders(&self) -> Result<Vec<crate::adapter::OpenOrder>, ExchangeError> {
            unimplemented!()
        }
        async fn is_ready(&self) -> bool {
            true
        }
        async fn test_connection(&self) -> Result<(), ExchangeError> {
            Ok(())
        }
    }

    fn pos(venue: VenueId) -> Position {
        Position {
            venue,
            symbol: "ETH".into(),
            side: OrderSide::Long,
            size: 1.0,
            entry_price: 3500.0,
            mark_price: 3500.0,
            unrealized_pnl: 0.0,
            leverage: None,
            liquidation_price: None,
            margin_used: 0.0,
        }
    }

    #[tokio::test]
    async fn refresh_all_populates_all_venues() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut adapters: HashMap<VenueId, Arc<dyn VenueAdapter>> = HashMap::new();
        adapters.insert(
            VenueId::Hyperliquid,
            Arc::new(CountingAdapter { venue: VenueId::Hyperliquid, calls: calls.clone(), positions: vec![pos(VenueId::Hyperliquid)] }),
        );
        adapters.insert(
            VenueId::Okx,
            Arc::new(CountingAdapter { venue: VenueId::Okx, calls: calls.clone(), positions: vec![pos(VenueId::Okx)] }),
        );
        let clock: SharedClock = Arc::new(TestClock::new(Utc::now()));
        let cache = MarketStateCache::new(adapters, clock);
        cache.refresh_all().await;

        assert_eq!(cache.all_positions().len(), 2);
        assert!(cache.last_update_time().is_some());
    }

    #[tokio::test]
    async fn concurrent_refresh_calls_are_single_flighted() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut adapters: HashMap<VenueId, Arc<dyn VenueAdapter>> = HashMap::new();
        adapters.insert(
            VenueId::Hyperliquid,
            Arc::new(CountingAdapter { venue: VenueId::Hyperliquid, calls: calls.clone(), positions: vec![pos(VenueId::Hyperliquid)] }),
        );
        let clock: SharedClock = Arc::new(TestClock::new(Utc::now()));
        let cache = Arc::new(MarketStateCache::new(adapters, clock));

        let c1 = cache.clone();
        let c2 = cache.clone();
        let (r1, r2) = tokio::join!(c1.refresh_all(), c2.refresh_all());
        let _ = (r1, r2);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn upsert_never_fabricates_missing_venue() {
        let adapters: HashMap<VenueId, Arc<dyn VenueAdapter>> = HashMap::new();
        let clock: SharedClock = Arc::new(TestClock::new(Utc::now()));
        let cache = MarketStateCache::new(adapters, clock);
        assert!(cache.positions(VenueId::Hyperliquid).is_empty());
        assert!(cache.position(VenueId::Hyperliquid, &Symbol::new("ETH")).is_none());
    }
}
