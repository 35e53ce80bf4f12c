//! Stark-curve signed adapter, grounded in the order-hashing/signing
//! pattern used for Starknet-based perp venues: a Pedersen hash chain
//! over the order's typed fields, signed with `starknet_crypto::sign`
//! using a deterministic RFC6979 nonce.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use starknet_crypto::{pedersen_hash, rfc6979_generate_k, sign, Felt};
use tracing::warn;

use super::{retry_with_backoff, OpenOrder, SymbolCache, TtlCache, VenueAdapter};
use crate::config::Config;
use crate::error::{ExchangeError, ExchangeErrorKind};
use crate::model::{OrderRequest, OrderResponse, OrderSide, OrderStatus, Position, Symbol, VenueId};

pub struct ParadexAdapter {
    client: Client,
    stark_private_key: Felt,
    account_address: String,
    host: String,
    config: Config,
    balance_cache: TtlCache<f64>,
    equity_cache: TtlCache<f64>,
    price_cache: std::sync::Mutex<std::collections::HashMap<String, (f64, std::time::Instant)>>,
    symbol_cache: SymbolCache,
}

impl ParadexAdapter {
    pub const HOST: &'static str = "https://api.prod.paradex.trade/v1";

    pub fn new(stark_private_key_hex: &str, account_address: String, config: Config) -> Result<Self, ExchangeError> {
        let stark_private_key = Felt::from_hex(stark_private_key_hex).map_err(|e| {
            ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Auth, format!("invalid stark key: {e:?}"))
        })?;
        let client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .expect("failed to build HTTP client");
        Ok(Self {
            client,
            stark_private_key,
            account_address,
            host: Self::HOST.to_string(),
            balance_cache: TtlCache::new(config.balance_cache_ttl),
            equity_cache: TtlCache::new(config.balance_cache_ttl),
            price_cache: std::sync::Mutex::new(std::collections::HashMap::new()),
            symbol_cache: SymbolCache::new(config.symbol_cache_ttl),
            config,
        })
    }

    /// Pedersen hash chain over (market, side, size, price, nonce) —
    /// a simplified stand-in for Paradex's full SNIP-712 order struct,
    /// sufficient to produce a deterministic, order-specific digest.
    fn order_hash(market: &str, is_buy: bool, size_internal: u64, price_internal: u64, nonce: u64) -> Felt {
        let market_felt = Felt::from_bytes_be_slice(market.as_bytes());
        let mut msg = pedersen_hash(&market_felt, &Felt::from(is_buy as u64));
        msg = pedersen_hash(&msg, &Felt::from(size_internal));
        msg = pedersen_hash(&msg, &Felt::from(price_internal));
        pedersen_hash(&msg, &Felt::from(nonce))
    }

    fn sign_order(
        &self,
        market: &str,
        is_buy: bool,
        size_internal: u64,
        price_internal: u64,
        nonce: u64,
    ) -> Result<(String, String, String), ExchangeError> {
        let hash = Self::order_hash(market, is_buy, size_internal, price_internal, nonce);
        let k = rfc6979_generate_k(&hash, &self.stark_private_key, None);
        let signature = sign(&self.stark_private_key, &hash, &k).map_err(|e| {
            ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Auth, format!("stark signing failed: {e:?}"))
        })?;
        Ok((hash.to_string(), signature.r.to_string(), signature.s.to_string()))
    }

    fn venue_symbol(&self, symbol: &Symbol) -> String {
        if let Some(cached) = self.symbol_cache.get(symbol) {
            return cached;
        }
        let resolved = format!("{}-USD-PERP", symbol.as_str());
        self.symbol_cache.insert(symbol, resolved.clone());
        resolved
    }

    fn classify_status(code: reqwest::StatusCode) -> ExchangeErrorKind {
        if code.as_u16() == 429 {
            ExchangeErrorKind::RateLimited
        } else if code.is_server_error() {
            ExchangeErrorKind::Transient
        } else {
            ExchangeErrorKind::Rejected
        }
    }

    /// Internal fixed-point representation Paradex expects on the wire
    /// (8 decimal places), mirroring the synthetic/collateral resolution
    /// scaling used by other Stark-curve venues.
    fn to_internal(value: f64) -> u64 {
        (value * 1e8).round().max(0.0) as u64
    }
}

#[async_trait]
impl VenueAdapter for ParadexAdapter {
    fn venue(&self) -> VenueId {
        VenueId::Paradex
    }

    async fn place_order(&self, request: OrderRequest) -> Result<OrderResponse, ExchangeError> {
        request
            .validate()
            .map_err(|e| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Rejected, e))?;

        let market = self.venue_symbol(&request.symbol);
        let is_buy = request.side == OrderSide::Long;

        let price = match request.order_type {
            crate::model::OrderType::Market => {
                let mark = self.get_mark_price(&request.symbol).await?;
                let slip = self.config.market_fallback_slip_percent;
                if is_buy {
                    mark * (1.0 + slip)
                } else {
                    mark * (1.0 - slip)
                }
            }
            _ => request.price.unwrap_or(0.0),
        };

        let nonce = chrono::Utc::now().timestamp_millis() as u64;
        let size_internal = Self::to_internal(request.size);
        let price_internal = Self::to_internal(price);
        let (order_hash, r, s) = self.sign_order(&market, is_buy, size_internal, price_internal, nonce)?;

        let body = json!({
            "market": market,
            "side": if is_buy { "BUY" } else { "SELL" },
            "type": "LIMIT",
            "size": format!("{:.8}", request.size),
            "price": format!("{:.8}", price),
            "reduce_only": request.reduce_only,
            "instruction": "IOC",
            "signature_timestamp": nonce,
            "signature": format!("{r}:{s}"),
            "order_hash": order_hash,
        });

        #[derive(Deserialize)]
        struct Ack {
            id: String,
            status: String,
            #[serde(default)]
            error: Option<String>,
        }

        let ack: Ack = retry_with_backoff(&self.config, || {
            let body = body.clone();
            async move {
                let url = format!("{}/orders", self.host);
                let response = self
                    .client
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", self.account_address))
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Transient, e.to_string()))?;
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                if !status.is_success() {
                    return Err(ExchangeError::new(VenueId::Paradex, Self::classify_status(status), text));
                }
                serde_json::from_str(&text)
                    .map_err(|e| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Decode, format!("{e}: {text}")))
            }
        })
        .await?;

        if let Some(err) = ack.error {
            return Ok(OrderResponse {
                venue: VenueId::Paradex,
                venue_order_id: ack.id,
                status: OrderStatus::Rejected,
                filled_size: 0.0,
                avg_fill_price: None,
                error: Some(err),
            });
        }

        Ok(OrderResponse {
            venue: VenueId::Paradex,
            venue_order_id: ack.id,
            status: if ack.status == "CLOSED" { OrderStatus::Filled } else { OrderStatus::Submitted },
            filled_size: 0.0,
            avg_fill_price: None,
            error: None,
        })
    }

    async fn cancel_order(
        &self,
        venue_order_id: &str,
        _symbol: Option<&Symbol>,
    ) -> Result<bool, ExchangeError> {
        let url = format!("{}/orders/{}", self.host, venue_order_id);
        let response = self
            .client
            .delete(&url)
            .header("Authorization", format!("Bearer {}", self.account_address))
            .send()
            .await
            .map_err(|e| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Transient, e.to_string()))?;
        Ok(response.status().is_success())
    }

    async fn cancel_all_orders(&self, symbol: &Symbol) -> Result<u32, ExchangeError> {
        let open = self.get_open_orders().await?;
        let mut n = 0;
        for order in open.into_iter().filter(|o| &o.symbol == symbol) {
            if self.cancel_order(&order.venue_order_id, Some(symbol)).await? {
                n += 1;
            }
        }
        Ok(n)
    }

    async fn get_order_status(
        &self,
        venue_order_id: &str,
        _symbol: Option<&Symbol>,
    ) -> Result<OrderResponse, ExchangeError> {
        let url = format!("{}/orders/{}", self.host, venue_order_id);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.account_address))
            .send()
            .await
            .map_err(|e| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Transient, e.to_string()))?;
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Decode, e.to_string()))?;

        #[derive(Deserialize)]
        struct Row {
            status: String,
            #[serde(default)]
            size_remaining: String,
            size: String,
            #[serde(default)]
            avg_fill_price: String,
        }
        let row: Row = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Decode, e.to_string()))?;
        let total: f64 = row.size.parse().unwrap_or(0.0);
        let remaining: f64 = row.size_remaining.parse().unwrap_or(total);
        let filled = (total - remaining).max(0.0);
        let status = match row.status.as_str() {
            "NEW" | "OPEN" => OrderStatus::Submitted,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "CLOSED" => OrderStatus::Filled,
            "CANCELED" => OrderStatus::Cancelled,
            _ => OrderStatus::Rejected,
        };
        Ok(OrderResponse {
            venue: VenueId::Paradex,
            venue_order_id: venue_order_id.to_string(),
            status,
            filled_size: filled,
            avg_fill_price: row.avg_fill_price.parse().ok(),
            error: None,
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let url = format!("{}/positions", self.host);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.account_address))
            .send()
            .await
            .map_err(|e| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Transient, e.to_string()))?;
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Decode, e.to_string()))?;

        #[derive(Deserialize)]
        struct Row {
            market: String,
            side: String,
            size: String,
            #[serde(default)]
            average_entry_price: String,
            #[serde(default)]
            mark_price: String,
            #[serde(default)]
            unrealized_pnl: String,
            #[serde(default)]
            leverage: Option<String>,
            #[serde(default)]
            liquidation_price: Option<String>,
        }
        #[derive(Deserialize)]
        struct Envelope {
            results: Vec<Row>,
        }
        let envelope: Envelope = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Decode, e.to_string()))?;

        Ok(envelope
            .results
            .into_iter()
            .filter_map(|r| {
                let size: f64 = r.size.parse().ok()?;
                if size.abs() < f64::EPSILON {
                    return None;
                }
                let base = r.market.split('-').next().unwrap_or(&r.market);
                Some(Position {
                    venue: VenueId::Paradex,
                    symbol: Symbol::new(base),
                    side: if r.side == "SHORT" { OrderSide::Short } else { OrderSide::Long },
                    size: size.abs(),
                    entry_price: r.average_entry_price.parse().unwrap_or(0.0),
                    mark_price: r.mark_price.parse().unwrap_or(0.0),
                    unrealized_pnl: r.unrealized_pnl.parse().unwrap_or(0.0),
                    leverage: r.leverage.and_then(|l| l.parse().ok()),
                    liquidation_price: r.liquidation_price.and_then(|l| l.parse().ok()),
                    margin_used: 0.0,
                })
            })
            .collect())
    }

    async fn get_mark_price(&self, symbol: &Symbol) -> Result<f64, ExchangeError> {
        if let Some((price, at)) = self.price_cache.lock().unwrap().get(symbol.as_str()) {
            if at.elapsed() < self.config.price_cache_ttl {
                return Ok(*price);
            }
        }
        let market = self.venue_symbol(symbol);
        let url = format!("{}/markets/summary?market={}", self.host, market);
        let response = self.client.get(&url).send().await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                let err = ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Transient, e.to_string());
                if let Some(stale) = self.price_cache.lock().unwrap().get(symbol.as_str()).map(|(p, _)| *p) {
                    warn!(error = %err, symbol = %symbol, "mark price refresh failed, using stale value");
                    return Ok(stale);
                }
                return Err(err);
            }
        };

        #[derive(Deserialize)]
        struct Row {
            mark_price: String,
        }
        #[derive(Deserialize)]
        struct Envelope {
            results: Vec<Row>,
        }
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Decode, e.to_string()))?;
        let envelope: Envelope = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Decode, e.to_string()))?;
        let price: f64 = envelope
            .results
            .first()
            .and_then(|r| r.mark_price.parse().ok())
            .ok_or_else(|| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Decode, "no mark price"))?;

        self.price_cache
            .lock()
            .unwrap()
            .insert(symbol.as_str().to_string(), (price, std::time::Instant::now()));
        Ok(price)
    }

    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        if let Some(b) = self.balance_cache.fresh() {
            return Ok(b);
        }
        match self.fetch_account_summary().await {
            Ok((free, _)) => {
                self.balance_cache.store(free);
                Ok(free)
            }
            Err(e) => {
                if let Some(stale) = self.balance_cache.stale() {
                    warn!(error = %e, "balance refresh failed, using stale value");
                    Ok(stale)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn get_equity(&self) -> Result<f64, ExchangeError> {
        if let Some(v) = self.equity_cache.fresh() {
            return Ok(v);
        }
        match self.fetch_account_summary().await {
            Ok((_, equity)) => {
                self.equity_cache.store(equity);
                Ok(equity)
            }
            Err(e) => {
                if let Some(stale) = self.equity_cache.stale() {
                    warn!(error = %e, "equity refresh failed, using stale value");
                    Ok(stale)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError> {
        let url = format!("{}/orders", self.host);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.account_address))
            .send()
            .await
            .map_err(|e| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Transient, e.to_string()))?;
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Decode, e.to_string()))?;

        #[derive(Deserialize)]
        struct Row {
            id: String,
            market: String,
            side: String,
            size: String,
            #[serde(default)]
            price: String,
        }
        #[derive(Deserialize)]
        struct Envelope {
            results: Vec<Row>,
        }
        let envelope: Envelope = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Decode, e.to_string()))?;

        Ok(envelope
            .results
            .into_iter()
            .map(|r| OpenOrder {
                venue_order_id: r.id,
                symbol: Symbol::new(r.market.split('-').next().unwrap_or(&r.market)),
                side: if r.side == "SELL" { OrderSide::Short } else { OrderSide::Long },
                size: r.size.parse().unwrap_or(0.0),
                price: r.price.parse().ok(),
            })
            .collect())
    }

    async fn is_ready(&self) -> bool {
        self.test_connection().await.is_ok()
    }

    async fn test_connection(&self) -> Result<(), ExchangeError> {
        self.get_balance().await.map(|_| ())
    }
}

impl ParadexAdapter {
    async fn fetch_account_summary(&self) -> Result<(f64, f64), ExchangeError> {
        let url = format!("{}/account", self.host);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.account_address))
            .send()
            .await
            .map_err(|e| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Transient, e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Decode, e.to_string()))?;
        if !status.is_success() {
            return Err(ExchangeError::new(VenueId::Paradex, Self::classify_status(status), text));
        }

        #[derive(Deserialize)]
        struct Row {
            free_collateral: String,
            account_value: String,
        }
        let row: Row = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Decode, e.to_string()))?;
        let free: f64 = row
            .free_collateral
            .parse()
            .map_err(|_| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Decode, "unparseable balance"))?;
        let equity: f64 = row
            .account_value
            .parse()
            .map_err(|_| ExchangeError::new(VenueId::Paradex, ExchangeErrorKind::Decode, "unparseable equity"))?;
        Ok((free, equity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> String {
        "0x1".to_string()
    }

    #[test]
    fn signing_is_deterministic_for_identical_input() {
        let adapter = ParadexAdapter::new(&key(), "0xabc".into(), Config::default()).unwrap();
        let sig1 = adapter.sign_order("ETH-USD-PERP", true, 100_000_000, 350_000_000_000, 1).unwrap();
        let sig2 = adapter.sign_order("ETH-USD-PERP", true, 100_000_000, 350_000_000_000, 1).unwrap();
        assert_eq!(sig1, sig2);
    }

    #[test]
    fn signature_changes_with_nonce() {
        let adapter = ParadexAdapter::new(&key(), "0xabc".into(), Config::default()).unwrap();
        let sig1 = adapter.sign_order("ETH-USD-PERP", true, 100_000_000, 350_000_000_000, 1).unwrap();
        let sig2 = adapter.sign_order("ETH-USD-PERP", true, 100_000_000, 350_000_000_000, 2).unwrap();
        assert_ne!(sig1, sig2);
    }

    #[test]
    fn rejects_malformed_stark_key() {
        assert!(ParadexAdapter::new("not-hex", "0xabc".into(), Config::default()).is_err());
    }

    #[test]
    fn internal_fixed_point_scaling() {
        assert_eq!(ParadexAdapter::to_internal(1.5), 150_000_000);
    }
}
