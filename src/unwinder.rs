//! Withdrawal Unwinder: turns a USD amount to free into a
//! sequence of reduce-only orders that leave the book still
//! delta-neutral once they fill.

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::lock_registry::LockRegistry;
use crate::market_state::MarketStateCache;
use crate::model::{OrderRequest, OrderSide, OrderStatus, OrderType, Position, Symbol, ThreadId, TimeInForce, VenueId};

/// One planned reduce-only leg, already placed by the time it appears
/// in a [`UnwindResult`].
#[derive(Debug, Clone)]
pub struct PlannedReduction {
    pub symbol: Symbol,
    pub venue: VenueId,
    pub side: OrderSide,
    pub size: f64,
    pub venue_order_id: Option<String>,
    pub full_close: bool,
}

#[derive(Debug, Clone)]
pub enum UnwindOutcome {
    Full,
    Partial { residual_usd: f64 },
}

#[derive(Debug, Clone)]
pub struct UnwindResult {
    pub outcome: UnwindOutcome,
    pub reductions: Vec<PlannedReduction>,
}

struct PairView {
    symbol: Symbol,
    long_venue: VenueId,
    short_venue: VenueId,
    long_size: f64,
    short_size: f64,
    combined_pnl: f64,
}

pub struct WithdrawalUnwinder {
    registry: Arc<LockRegistry>,
    market_state: Arc<MarketStateCache>,
    config: Config,
}

impl WithdrawalUnwinder {
    pub fn new(registry: Arc<LockRegistry>, market_state: Arc<MarketStateCache>, config: Config) -> Self {
        Self { registry, market_state, config }
    }

    /// Runs the unwind plan for `amount_needed_usd`, submitting reduce-only
    /// orders as it goes. Returns `Partial` with the unfreed residual if
    /// the book can't free the full amount.
    pub async fn unwind(&self, amount_needed_usd: f64) -> UnwindResult {
        self.market_state.refresh_all().await;

        let mut amount_needed = amount_needed_usd;
        let mut reductions = Vec::new();

        let all_positions = self.market_state.all_positions();
        let (pairs, unpaired) = partition(&all_positions);

        let mut pairs = pairs;
        pairs.sort_by(|a, b| a.combined_pnl.partial_cmp(&b.combined_pnl).unwrap_or(std::cmp::Ordering::Equal));

        for pair in &pairs {
            if amount_needed <= 0.0 {
                break;
            }
            let Some(mark) = self
                .market_state
                .mark_price(&pair.symbol, pair.long_venue)
                .or_else(|| self.market_state.mark_price(&pair.symbol, pair.short_venue))
            else {
                continue;
            };
            if mark <= 0.0 {
                continue;
            }

            let max_delta_neutral_size = pair.long_size.abs().min(pair.short_size.abs());
            if max_delta_neutral_size <= 0.0 {
                continue;
            }

            let size_to_reduce = (amount_needed / (2.0 * mark)).min(max_delta_neutral_size);
            let full_close = size_to_reduce >= 0.99 * max_delta_neutral_size;
            let thread_id = ThreadId::new("unwind", &pair.symbol);

            if let Some(r) = self
                .submit_reduction(&pair.symbol, pair.long_venue, OrderSide::Long, size_to_reduce, mark, full_close, thread_id.clone())
                .await
            {
                reductions.push(r);
            }
            if let Some(r) = self
                .submit_reduction(&pair.symbol, pair.short_venue, OrderSide::Short, size_to_reduce, mark, full_close, thread_id)
                .await
            {
                reductions.push(r);
            }

            let freed = size_to_reduce * 2.0 * mark;
            amount_needed -= freed;
            info!(symbol = %pair.symbol, freed, remaining = amount_needed, "unwind pair reduced");
        }

        let mut unpaired = unpaired;
        unpaired.sort_by(|a, b| a.unrealized_pnl.partial_cmp(&b.unrealized_pnl).unwrap_or(std::cmp::Ordering::Equal));

        for position in &unpaired {
            if amount_needed <= 0.0 {
                break;
            }
            let Some(mark) = self.market_state.mark_price(&position.symbol, position.venue) else {
                continue;
            };
            if mark <= 0.0 {
                continue;
            }
            let size_to_reduce = (amount_needed / mark).min(position.size.abs());
            let full_close = size_to_reduce >= 0.99 * position.size.abs();
            let thread_id = ThreadId::new("unwind", &position.symbol);

            if let Some(r) = self
                .submit_reduction(&position.symbol, position.venue, position.side, size_to_reduce, mark, full_close, thread_id)
                .await
            {
                reductions.push(r);
            }
            amount_needed -= size_to_reduce * mark;
            info!(symbol = %position.symbol, venue = %position.venue, remaining = amount_needed, "unwind unpaired position reduced");
        }

        if amount_needed > 0.0 {
            UnwindResult { outcome: UnwindOutcome::Partial { residual_usd: amount_needed }, reductions }
        } else {
            UnwindResult { outcome: UnwindOutcome::Full, reductions }
        }
    }

    async fn submit_reduction(
        &self,
        symbol: &Symbol,
        venue: VenueId,
        side: OrderSide,
        size: f64,
        mark: f64,
        full_close: bool,
        thread_id: ThreadId,
    ) -> Option<PlannedReduction> {
        if size <= 0.0 {
            return None;
        }
        let Some(adapter) = self.market_state.adapter(venue) else {
            return None;
        };
        let request = OrderRequest {
            symbol: symbol.clone(),
            side: side.closing_side(),
            order_type: OrderType::Limit,
            size,
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
                    response.venue_order_id.clone(),
                    size,
                    Some(mark),
                    thread_id,
                    chrono::Utc::now(),
                );
                Some(PlannedReduction {
                    symbol: symbol.clone(),
                    venue,
                    side: side.closing_side(),
                    size,
                    venue_order_id: Some(response.venue_order_id),
                    full_close,
                })
            }
            Err(e) => {
                tracing::warn!(%venue, %symbol, error = %e, "unwind reduction order failed");
                Some(PlannedReduction {
                    symbol: symbol.clone(),
                    venue,
                    side: side.closing_side(),
                    size,
                    venue_order_id: None,
                    full_close,
                })
            }
        }
    }
}

/// Splits positions into cross-venue delta-neutral pairs and unpaired
/// leftovers: a pair requires the same normalized symbol,
/// different venues, and opposite sides.
fn partition(positions: &[Position]) -> (Vec<PairView>, Vec<Position>) {
    let mut used = vec![false; positions.len()];
    let mut pairs = Vec::new();

    for i in 0..positions.len() {
        if used[i] || positions[i].side != OrderSide::Long {
            continue;
        }
        for j in 0..positions.len() {
            if used[j] || i == j {
                continue;
            }
            let a = &positions[i];
            let b = &positions[j];
            if b.side == OrderSide::Short && a.symbol == b.symbol && a.venue != b.venue {
                used[i] = true;
                used[j] = true;
                pairs.push(PairView {
                    symbol: a.symbol.clone(),
                    long_venue: a.venue,
                    short_venue: b.venue,
                    long_size: a.size,
                    short_size: b.size,
                    combined_pnl: a.unrealized_pnl + b.unrealized_pnl,
                });
                break;
            }
        }
    }

    let unpaired = positions
        .iter()
        .enumerate()
        .filter(|(i, _)| !used[*i])
        .map(|(_, p)| p.clone())
        .collect();

    (pairs, unpaired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{OpenOrder, VenueAdapter};
    use crate::clock::{SharedClock, TestClock};
    use crate::error::ExchangeError;
    use crate::model::OrderResponse;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FillAdapter {
        venue: VenueId,
        positions: Vec<Position>,
    }

    #[async_trait]
    impl VenueAdapter for FillAdapter {
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
            unimplemented!()
        }
        async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
            Ok(self.positions.clone())
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
        async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError> {
            Ok(vec![])
        }
        async fn is_ready(&self) -> bool {
            true
        }
        async fn test_connection(&self) -> Result<(), ExchangeError> {
            Ok(())
        }
    }

    fn pos(venue: VenueId, side: OrderSide, size: f64, pnl: f64) -> Position {
        Position {
            venue,
            symbol: "ETH".into(),
            side,
            size,
            entry_price: 3500.0,
            mark_price: 3500.0,
            unrealized_pnl: pnl,
            leverage: None,
            liquidation_price: None,
            margin_used: 0.0,
        }
    }

    fn unwinder_with_positions(positions: Vec<Position>) -> Arc<WithdrawalUnwinder> {
        let mut adapters: HashMap<VenueId, Arc<dyn VenueAdapter>> = HashMap::new();
        adapters.insert(
            VenueId::Hyperliquid,
            Arc::new(FillAdapter {
                venue: VenueId::Hyperliquid,
                positions: positions.iter().filter(|p| p.venue == VenueId::Hyperliquid).cloned().collect(),
            }),
        );
        adapters.insert(
            VenueId::Okx,
            Arc::new(FillAdapter {
                venue: VenueId::Okx,
                positions: positions.iter().filter(|p| p.venue == VenueId::Okx).cloned().collect(),
            }),
        );
        let clock: SharedClock = Arc::new(TestClock::new(chrono::Utc::now()));
        let market_state = Arc::new(MarketStateCache::new(adapters, clock));
        market_state.upsert_mark_price(Symbol::new("ETH"), VenueId::Hyperliquid, 3500.0);
        market_state.upsert_mark_price(Symbol::new("ETH"), VenueId::Okx, 3500.0);
        Arc::new(WithdrawalUnwinder::new(Arc::new(LockRegistry::new()), market_state, Config::default()))
    }

    #[test]
    fn partition_pairs_opposite_sides_across_venues() {
        let positions = vec![
            pos(VenueId::Hyperliquid, OrderSide::Long, 1.0, 10.0),
            pos(VenueId::Okx, OrderSide::Short, 1.0, -5.0),
        ];
        let (pairs, unpaired) = partition(&positions);
        assert_eq!(pairs.len(), 1);
        assert!(unpaired.is_empty());
        assert_eq!(pairs[0].combined_pnl, 5.0);
    }

    #[test]
    fn partition_leaves_unmatched_position_unpaired() {
        let positions = vec![pos(VenueId::Hyperliquid, OrderSide::Long, 1.0, 10.0)];
        let (pairs, unpaired) = partition(&positions);
        assert!(pairs.is_empty());
        assert_eq!(unpaired.len(), 1);
    }

    #[tokio::test]
    async fn full_amount_freed_reports_full_outcome() {
        let unwinder = unwinder_with_positions(vec![
            pos(VenueId::Hyperliquid, OrderSide::Long, 10.0, 0.0),
            pos(VenueId::Okx, OrderSide::Short, 10.0, 0.0),
        ]);
        // 10 units * 2 * 3500 = 70000 USD max freeable.
        let result = unwinder.unwind(1000.0).await;
        assert!(matches!(result.outcome, UnwindOutcome::Full));
        assert_eq!(result.reductions.len(), 2);
    }

    #[tokio::test]
    async fn amount_exceeding_book_reports_partial_residual() {
        let unwinder = unwinder_with_positions(vec![
            pos(VenueId::Hyperliquid, OrderSide::Long, 1.0, 0.0),
            pos(VenueId::Okx, OrderSide::Short, 1.0, 0.0),
        ]);
        // Max freeable = 1.0 * 2 * 3500 = 7000 USD.
        let result = unwinder.unwind(100_000.0).await;
        match result.outcome {
            UnwindOutcome::Partial { residual_usd } => assert!(residual_usd > 0.0),
            UnwindOutcome::Full => panic!("expected partial outcome"),
        }
    }
}
