//! Hedged Executor: places paired orders, drives them to
//! matched fills, slices large orders, and rolls back partial fills.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant as TokioInstant;
use tracing::{info, warn};

use crate::config::Config;
use crate::lock_registry::LockRegistry;
use crate::market_state::MarketStateCache;
use crate::model::{
    OrderRequest, OrderSide, OrderStatus, OrderType, Symbol, ThreadId, TimeInForce, VenueId,
};

/// Parameters for one hedge opening/closing operation.
#[derive(Debug, Clone)]
pub struct HedgeRequest {
    pub symbol: Symbol,
    pub long_venue: VenueId,
    pub short_venue: VenueId,
    pub size: f64,
    pub long_price: f64,
    pub short_price: f64,
    pub reduce_only: bool,
}

/// Outcome of one hedge operation: per-leg filled size, overall success,
/// and — when unsuccessful — why.
#[derive(Debug, Clone, Default)]
pub struct HedgeResult {
    pub long_filled: f64,
    pub short_filled: f64,
    pub success: bool,
    pub completed_slices: u32,
    pub abort_reason: Option<String>,
    pub rollback_failed: bool,
    /// The last slice's venue order ids, for whoever needs to register a
    /// reconciliation expectation or cancel a still-resting order.
    pub long_order_id: Option<String>,
    pub short_order_id: Option<String>,
}

pub struct HedgedExecutor {
    registry: Arc<LockRegistry>,
    market_state: Arc<MarketStateCache>,
    config: Config,
}

impl HedgedExecutor {
    pub fn new(registry: Arc<LockRegistry>, market_state: Arc<MarketStateCache>, config: Config) -> Self {
        Self {
            registry,
            market_state,
            config,
        }
    }

    /// Runs the multi-slice algorithm, degrading gracefully
    /// to a single slice when `config.number_of_slices == 1`.
    pub async fn execute(&self, request: HedgeRequest) -> HedgeResult {
        let thread_id = ThreadId::new("open", &request.symbol);
        let n = self.config.number_of_slices.max(1);
        let slice_size = request.size / n as f64;

        let mut total_long_filled = 0.0;
        let mut total_short_filled = 0.0;
        let mut completed_slices = 0;
        let mut long_order_id = None;
        let mut short_order_id = None;

        for slice_index in 0..n {
            if slice_index > 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
                // Re-read mark prices before the next slice.
                if let Some(p) = self.market_state.mark_price(&request.symbol, request.long_venue) {
                    info!(slice = slice_index, price = p, "refreshed long mark before next slice");
                }
            }

            let slice = SliceRequest {
                symbol: request.symbol.clone(),
                long_venue: request.long_venue,
                short_venue: request.short_venue,
                size: slice_size,
                long_price: request.long_price,
                short_price: request.short_price,
                reduce_only: request.reduce_only,
                thread_id: thread_id.clone(),
            };
            let result = self.execute_slice(slice).await;

            total_long_filled += result.long_filled;
            total_short_filled += result.short_filled;
            if result.long_order_id.is_some() {
                long_order_id = result.long_order_id.clone();
            }
            if result.short_order_id.is_some() {
                short_order_id = result.short_order_id.clone();
            }

            if !result.success {
                return HedgeResult {
                    long_filled: total_long_filled,
                    short_filled: total_short_filled,
                    success: false,
                    completed_slices,
                    abort_reason: result.abort_reason,
                    rollback_failed: result.rollback_failed,
                    long_order_id,
                    short_order_id,
                };
            }

            let imbalance = (result.long_filled - result.short_filled).abs();
            if slice_size > 0.0 && imbalance / slice_size > self.config.max_imbalance_percent {
                return HedgeResult {
                    long_filled: total_long_filled,
                    short_filled: total_short_filled,
                    success: false,
                    completed_slices,
                    abort_reason: Some(format!(
                        "slice {slice_index} imbalance {:.4} exceeds max_imbalance_percent {:.4}",
                        imbalance / slice_size,
                        self.config.max_imbalance_percent
                    )),
                    rollback_failed: result.rollback_failed,
                    long_order_id,
                    short_order_id,
                };
            }

            completed_slices += 1;
        }

        let total_imbalance = (total_long_filled - total_short_filled).abs();
        let success = completed_slices == n && request.size > 0.0 && total_imbalance / request.size < 0.02;

        HedgeResult {
            long_filled: total_long_filled,
            short_filled: total_short_filled,
            success,
            completed_slices,
            abort_reason: if success {
                None
            } else {
                Some("completed slices or aggregate imbalance outside tolerance".to_string())
            },
            rollback_failed: false,
            long_order_id,
            short_order_id,
        }
    }

    async fn execute_slice(&self, slice: SliceRequest) -> HedgeResult {
        let (first_venue, second_venue) = self
            .config
            .harder_to_fill_first(slice.long_venue, slice.short_venue);
        let first_side = if first_venue == slice.long_venue { OrderSide::Long } else { OrderSide::Short };
        let second_side = first_side.closing_side();
        let first_price = if first_side == OrderSide::Long { slice.long_price } else { slice.short_price };

        let Some(first_adapter) = self.market_state.adapter(first_venue) else {
            return HedgeResult {
                abort_reason: Some(format!("no adapter registered for {first_venue}")),
                ..Default::default()
            };
        };

        let first_request = OrderRequest {
            symbol: slice.symbol.clone(),
            side: first_side,
            order_type: OrderType::Limit,
            size: slice.size,
            price: Some(first_price),
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: slice.reduce_only,
            client_order_id: uuid::Uuid::new_v4().to_string(),
        };

        let placed = match first_adapter.place_order(first_request.clone()).await {
            Ok(p) => p,
            Err(e) => {
                return HedgeResult {
                    abort_reason: Some(format!("first leg placement failed: {e}")),
                    ..Default::default()
                }
            }
        };
        if self
            .registry
            .register_order_placing(
                first_venue,
                slice.symbol.clone(),
                first_side,
                placed.venue_order_id.clone(),
                slice.size,
                Some(first_price),
                slice.thread_id.clone(),
                chrono::Utc::now(),
            )
            .is_err()
        {
            warn!(%first_venue, symbol = %slice.symbol, "duplicate active order detected placing first leg");
        }

        let first_filled = self
            .poll_until_terminal(
                first_adapter.as_ref(),
                &placed.venue_order_id,
                Some(&slice.symbol),
                first_venue,
                first_side,
                slice.size,
            )
            .await;

        if first_filled < 0.5 * slice.size {
            let _ = first_adapter.cancel_order(&placed.venue_order_id, Some(&slice.symbol)).await;
            self.registry.force_clear_order(first_venue, &slice.symbol, first_side);
            return HedgeResult {
                long_filled: if first_side == OrderSide::Long { first_filled } else { 0.0 },
                short_filled: if first_side == OrderSide::Short { first_filled } else { 0.0 },
                success: false,
                abort_reason: Some("first leg underfilled".to_string()),
                ..Default::default()
            };
        }

        let Some(second_adapter) = self.market_state.adapter(second_venue) else {
            return HedgeResult {
                abort_reason: Some(format!("no adapter registered for {second_venue}")),
                ..Default::default()
            };
        };
        let second_price = if second_side == OrderSide::Long { slice.long_price } else { slice.short_price };
        let second_request = OrderRequest {
            symbol: slice.symbol.clone(),
            side: second_side,
            order_type: OrderType::Limit,
            size: first_filled,
            price: Some(second_price),
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: slice.reduce_only,
            client_order_id: uuid::Uuid::new_v4().to_string(),
        };

        let second_placed = match second_adapter.place_order(second_request).await {
            Ok(p) => p,
            Err(e) => {
                let rollback_failed = self.rollback(first_adapter.as_ref(), &slice.symbol, first_side, first_filled).await;
                return HedgeResult {
                    long_filled: if first_side == OrderSide::Long { first_filled } else { 0.0 },
                    short_filled: if first_side == OrderSide::Short { first_filled } else { 0.0 },
                    success: false,
                    abort_reason: Some(format!("second leg placement failed: {e}")),
                    rollback_failed,
                    ..Default::default()
                };
            }
        };
        if self
            .registry
            .register_order_placing(
                second_venue,
                slice.symbol.clone(),
                second_side,
                second_placed.venue_order_id.clone(),
                first_filled,
                Some(second_price),
                slice.thread_id.clone(),
                chrono::Utc::now(),
            )
            .is_err()
        {
            warn!(%second_venue, symbol = %slice.symbol, "duplicate active order detected placing second leg");
        }

        let second_filled = self
            .poll_until_terminal(
                second_adapter.as_ref(),
                &second_placed.venue_order_id,
                Some(&slice.symbol),
                second_venue,
                second_side,
                first_filled,
            )
            .await;

        if second_filled < f64::EPSILON {
            let _ = second_adapter.cancel_order(&second_placed.venue_order_id, Some(&slice.symbol)).await;
            self.registry.force_clear_order(second_venue, &slice.symbol, second_side);
            let rollback_failed = self.rollback(first_adapter.as_ref(), &slice.symbol, first_side, first_filled).await;
            return HedgeResult {
                long_filled: if first_side == OrderSide::Long { first_filled } else { 0.0 },
                short_filled: 0.0,
                success: false,
                abort_reason: Some("second leg failed entirely".to_string()),
                rollback_failed,
                ..Default::default()
            };
        }
        if second_filled < first_filled {
            let _ = second_adapter.cancel_order(&second_placed.venue_order_id, Some(&slice.symbol)).await;
        }

        let (long_filled, short_filled) = if first_side == OrderSide::Long {
            (first_filled, second_filled)
        } else {
            (second_filled, first_filled)
        };

        let (long_order_id, short_order_id) = if first_side == OrderSide::Long {
            (Some(placed.venue_order_id.clone()), Some(second_placed.venue_order_id.clone()))
        } else {
            (Some(second_placed.venue_order_id.clone()), Some(placed.venue_order_id.clone()))
        };

        HedgeResult {
            long_filled,
            short_filled,
            success: true,
            completed_slices: 1,
            abort_reason: None,
            rollback_failed: false,
            long_order_id,
            short_order_id,
        }
    }

    /// Polls order status every `fill_check_interval` until a terminal
    /// state or `slice_fill_timeout` elapses; falls back to comparing
    /// position size if status calls fail outright. Writes every
    /// observed fill back into the registry so `thread_health` sees a
    /// real `Filled`/`PartiallyFilled` record, not just `Submitted`.
    async fn poll_until_terminal(
        &self,
        adapter: &(dyn crate::adapter::VenueAdapter),
        order_id: &str,
        symbol: Option<&Symbol>,
        venue: VenueId,
        side: OrderSide,
        requested_size: f64,
    ) -> f64 {
        let deadline = TokioInstant::now() + self.config.slice_fill_timeout;
        let mut last_filled = 0.0;
        while TokioInstant::now() < deadline {
            match adapter.get_order_status(order_id, symbol).await {
                Ok(status) => {
                    last_filled = status.filled_size;
                    if status.status.is_terminal() {
                        if let Some(symbol) = symbol {
                            self.registry.update_order_status(venue, symbol, side, status.status, order_id);
                        }
                        return last_filled;
                    }
                    if last_filled > 0.0 {
                        if let Some(symbol) = symbol {
                            self.registry.update_order_status(venue, symbol, side, OrderStatus::PartiallyFilled, order_id);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, order_id, "status poll failed, falling back to position check");
                    if let Some(symbol) = symbol {
                        if let Ok(Some(position)) = adapter.get_position(symbol).await {
                            last_filled = position.size;
                            let inferred = if last_filled >= requested_size - f64::EPSILON {
                                OrderStatus::Filled
                            } else if last_filled > 0.0 {
                                OrderStatus::PartiallyFilled
                            } else {
                                OrderStatus::Submitted
                            };
                            if inferred != OrderStatus::Submitted {
                                self.registry.update_order_status(venue, symbol, side, inferred, order_id);
                            }
                            return last_filled;
                        }
                    }
                }
            }
            tokio::time::sleep(self.config.fill_check_interval).await;
        }
        if last_filled > 0.0 {
            if let Some(symbol) = symbol {
                self.registry.update_order_status(venue, symbol, side, OrderStatus::PartiallyFilled, order_id);
            }
        }
        last_filled
    }

    async fn rollback(
        &self,
        adapter: &(dyn crate::adapter::VenueAdapter),
        symbol: &Symbol,
        filled_side: OrderSide,
        filled_size: f64,
    ) -> bool {
        if filled_size <= 0.0 {
            return false;
        }
        let rollback_request = OrderRequest {
            symbol: symbol.clone(),
            side: filled_side.closing_side(),
            order_type: OrderType::Limit,
            size: filled_size,
            price: None,
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: true,
            client_order_id: uuid::Uuid::new_v4().to_string(),
        };
        match adapter.place_order(rollback_request).await {
            Ok(_) => false,
            Err(e) => {
                warn!(error = %e, %symbol, "rollback order failed, surfacing but not blocking");
                true
            }
        }
    }
}

struct SliceRequest {
    symbol: Symbol,
    long_venue: VenueId,
    short_venue: VenueId,
    size: f64,
    long_price: f64,
    short_price: f64,
    reduce_only: bool,
    thread_id: ThreadId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{SharedClock, TestClock};
    use crate::error::ExchangeError;
    use crate::model::{OrderResponse, Position};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct ScriptedAdapter {
        venue: VenueId,
        fill_fraction: f64,
    }

    #[async_trait]
    impl crate::adapter::VenueAdapter for ScriptedAdapter {
        fn venue(&self) -> VenueId {
            self.venue
        }
        async fn place_order(&self, request: OrderRequest) -> Result<OrderResponse, ExchangeError> {
            Ok(OrderResponse {
                venue: self.venue,
                venue_order_id: uuid::Uuid::new_v4().to_string(),
                status: OrderStatus::Filled,
                filled_size: request.size * self.fill_fraction,
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
                filled_size: self.fill_fraction,
                avg_fill_price: None,
                error: None,
            })
        }
        async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
            Ok(vec![])
        }
        async fn get_mark_price(&self, _: &Symbol) -> Result<f64, ExchangeError> {
            Ok(3500.0)
        }
        async fn get_balance(&self) -> Result<f64, ExchangeError> {
            Ok(10000.0)
        }
        async fn get_equity(&self) -> Result<f64, ExchangeError> {
            Ok(10000.0)
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

    fn market_state(fill_fraction: f64) -> Arc<MarketStateCache> {
        let mut adapters: HashMap<VenueId, Arc<dyn crate::adapter::VenueAdapter>> = HashMap::new();
        adapters.insert(VenueId::Hyperliquid, Arc::new(ScriptedAdapter { venue: VenueId::Hyperliquid, fill_fraction }));
        adapters.insert(VenueId::Okx, Arc::new(ScriptedAdapter { venue: VenueId::Okx, fill_fraction }));
        let clock: SharedClock = Arc::new(TestClock::new(chrono::Utc::now()));
        Arc::new(MarketStateCache::new(adapters, clock))
    }

    fn request() -> HedgeRequest {
        HedgeRequest {
            symbol: Symbol::new("ETH"),
            long_venue: VenueId::Hyperliquid,
            short_venue: VenueId::Okx,
            size: 1.0,
            long_price: 3500.0,
            short_price: 3500.0,
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn clean_hedge_open_succeeds_with_full_fills() {
        let mut config = Config::default();
        config.number_of_slices = 1;
        let executor = HedgedExecutor::new(
            Arc::new(LockRegistry::new()),
            market_state(1.0),
            config,
        );
        let result = executor.execute(request()).await;
        assert!(result.success);
        assert_eq!(result.long_filled, 1.0);
        assert_eq!(result.short_filled, 1.0);
    }

    #[tokio::test]
    async fn underfilled_first_leg_aborts_without_placing_second() {
        let mut config = Config::default();
        config.number_of_slices = 1;
        config.fill_check_interval = Duration::from_millis(1);
        config.slice_fill_timeout = Duration::from_millis(5);
        let executor = HedgedExecutor::new(Arc::new(LockRegistry::new()), market_state(0.1), config);
        let result = executor.execute(request()).await;
        assert!(!result.success);
        assert_eq!(result.abort_reason.as_deref(), Some("first leg underfilled"));
    }
}
