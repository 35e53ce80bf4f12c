//! The venue-agnostic adapter contract and the pieces every
//! concrete adapter shares: a TTL cache for balance/price/symbol lookups,
//! and the rate-limit backoff helper.

mod hyperliquid;
mod okx;
mod paradex;

pub use hyperliquid::HyperliquidAdapter;
pub use okx::{OkxAdapter, OkxCredentials};
pub use paradex::ParadexAdapter;

use crate::config::Config;
use crate::error::{ExchangeError, ExchangeErrorKind};
use crate::model::{OrderRequest, OrderResponse, OrderSide, Position, Symbol, VenueId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// An order observed resting on a venue via `get_open_orders`, used by
/// the Guardian's orphan sweep and by reconciliation.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub venue_order_id: String,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub size: f64,
    pub price: Option<f64>,
}

/// The uniform contract the rest of the keeper depends on.
/// Every method returns a typed `ExchangeError` rather than panicking;
/// callers treat a failed call as a fact to react to, not a crash.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn venue(&self) -> VenueId;

    async fn place_order(&self, request: OrderRequest) -> Result<OrderResponse, ExchangeError>;

    async fn cancel_order(
        &self,
        venue_order_id: &str,
        symbol: Option<&Symbol>,
    ) -> Result<bool, ExchangeError>;

    async fn cancel_all_orders(&self, symbol: &Symbol) -> Result<u32, ExchangeError>;

    async fn get_order_status(
        &self,
        venue_order_id: &str,
        symbol: Option<&Symbol>,
    ) -> Result<OrderResponse, ExchangeError>;

    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError>;

    async fn get_position(&self, symbol: &Symbol) -> Result<Option<Position>, ExchangeError> {
        Ok(self
            .get_positions()
            .await?
            .into_iter()
            .find(|p| &p.symbol == symbol))
    }

    async fn get_mark_price(&self, symbol: &Symbol) -> Result<f64, ExchangeError>;

    async fn get_balance(&self) -> Result<f64, ExchangeError>;

    async fn get_equity(&self) -> Result<f64, ExchangeError>;

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError>;

    async fn is_ready(&self) -> bool;

    async fn test_connection(&self) -> Result<(), ExchangeError>;

    /// Default: cancel then resubmit. Adapters whose venue supports a
    /// native modify override this.
    async fn modify_order(
        &self,
        venue_order_id: &str,
        new_request: OrderRequest,
    ) -> Result<OrderResponse, ExchangeError> {
        self.cancel_order(venue_order_id, Some(&new_request.symbol))
            .await?;
        self.place_order(new_request).await
    }
}

/// A cached value with a last-refreshed timestamp. `get_or_stale` never
/// fabricates a value: if no refresh has ever succeeded, it has nothing
/// to return.
pub struct TtlCache<T: Clone> {
    ttl: Duration,
    state: Mutex<Option<(T, Instant)>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(None),
        }
    }

    pub fn fresh(&self) -> Option<T> {
        let guard = self.state.lock();
        guard
            .as_ref()
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(v, _)| v.clone())
    }

    pub fn stale(&self) -> Option<T> {
        self.state.lock().as_ref().map(|(v, _)| v.clone())
    }

    pub fn store(&self, value: T) {
        *self.state.lock() = Some((value, Instant::now()));
    }
}

/// A per-adapter cache mapping a normalized [`Symbol`] to the venue's own
/// symbol/asset-index representation. TTL default 1h; refreshed on a
/// cache miss by the caller (the adapter knows how to look one up).
pub struct SymbolCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl SymbolCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, symbol: &Symbol) -> Option<String> {
        let entries = self.entries.lock();
        entries
            .get(symbol.as_str())
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(v, _)| v.clone())
    }

    pub fn insert(&self, symbol: &Symbol, venue_symbol: String) {
        self.entries
            .lock()
            .insert(symbol.as_str().to_string(), (venue_symbol, Instant::now()));
    }
}

/// Exponential backoff retry, only on a 429-equivalent (`RateLimited`):
/// 1, 2, 4, 8, 16s, up to 5 attempts.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &Config,
    mut op: F,
) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ExchangeError>>,
{
    let mut delay = config.rate_limit_backoff_base;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.kind == ExchangeErrorKind::RateLimited && attempt + 1 < config.rate_limit_max_attempts => {
                attempt += 1;
                tokio::time::sleep(delay).await;
                delay = (delay * config.rate_limit_backoff_multiplier).min(config.rate_limit_backoff_cap);
            }
            Err(e) => return Err(e),
        }
    }
}
