//! Reconciliation Engine: the fixed-tick loop that compares
//! what the keeper expects to be true against what venues actually
//! report, classifying drift and raising the only order action this
//! engine is allowed to take on its own — a cancel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::config::Config;
use crate::market_state::MarketStateCache;
use crate::model::{OrderKey, OrderSide, Symbol, VenueId};

/// Positions below this size are noise (dust), not a real leg.
const DUST_SIZE: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DriftClass {
    Matched,
    NoFill,
    PartialFill,
    Overfill,
}

/// What the keeper expects a single leg to settle at, owned by this
/// engine and registered by the Scheduler right after a leg is placed.
#[derive(Debug, Clone, Serialize)]
pub struct Expectation {
    pub venue: VenueId,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub expected_size: f64,
    pub order_id: String,
    pub placed_at: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,
    pub verified: bool,
}

impl Expectation {
    fn key(&self) -> OrderKey {
        OrderKey::new(self.venue, self.symbol.clone(), self.side)
    }
}

/// The last-observed balance of a cross-venue pair, rebuilt every tick
/// from actual positions.
#[derive(Debug, Clone, Serialize)]
pub struct HedgePairRecord {
    pub symbol: Symbol,
    pub long_venue: VenueId,
    pub short_venue: VenueId,
    pub measured_long_size: f64,
    pub measured_short_size: f64,
    pub imbalance: f64,
    pub imbalance_percent: f64,
    pub last_reconciled: DateTime<Utc>,
}

/// A drift event the Scheduler may act on — reconciliation only ever
/// cancels orders itself; everything else is reported for the Scheduler
/// to decide.
#[derive(Debug, Clone, Serialize)]
pub enum DriftEvent {
    ExpectationDrift {
        venue: VenueId,
        symbol: Symbol,
        side: OrderSide,
        class: DriftClass,
    },
    HedgePairImbalance {
        symbol: Symbol,
        long_venue: VenueId,
        short_venue: VenueId,
        imbalance: f64,
        imbalance_percent: f64,
        /// `None` unless `excess / larger > 1%` — the Scheduler should
        /// only rebalance when this is populated.
        rebalance_leg: Option<(VenueId, OrderSide, f64)>,
    },
}

/// How many recent drift events the diagnostics snapshot keeps.
const RECENT_EVENTS_CAP: usize = 50;

pub struct ReconciliationEngine {
    market_state: Arc<MarketStateCache>,
    config: Config,
    clock: SharedClock,
    expectations: Mutex<HashMap<OrderKey, Expectation>>,
    pairs: Mutex<HashMap<Symbol, HedgePairRecord>>,
    recent_events: Mutex<VecDeque<DriftEvent>>,
}

impl ReconciliationEngine {
    pub fn new(market_state: Arc<MarketStateCache>, config: Config, clock: SharedClock) -> Self {
        Self {
            market_state,
            config,
            clock,
            expectations: Mutex::new(HashMap::new()),
            pairs: Mutex::new(HashMap::new()),
            recent_events: Mutex::new(VecDeque::with_capacity(RECENT_EVENTS_CAP)),
        }
    }

    /// Registers a new expectation, replacing any prior expectation for
    /// the same `(venue, symbol, side)` key.
    pub fn register_expectation(
        &self,
        venue: VenueId,
        symbol: Symbol,
        side: OrderSide,
        expected_size: f64,
        order_id: String,
    ) {
        let now = self.clock.now();
        let expectation = Expectation {
            venue,
            symbol: symbol.clone(),
            side,
            expected_size,
            order_id,
            placed_at: now,
            last_checked: now,
            verified: false,
        };
        self.expectations.lock().insert(expectation.key(), expectation);
    }

    pub fn clear_expectation(&self, venue: VenueId, symbol: &Symbol, side: OrderSide) {
        self.expectations
            .lock()
            .remove(&OrderKey::new(venue, symbol.clone(), side));
    }

    pub fn expectation_count(&self) -> usize {
        self.expectations.lock().len()
    }

    pub fn expectations_snapshot(&self) -> Vec<Expectation> {
        self.expectations.lock().values().cloned().collect()
    }

    pub fn hedge_pairs_snapshot(&self) -> Vec<HedgePairRecord> {
        self.pairs.lock().values().cloned().collect()
    }

    pub fn recent_events_snapshot(&self) -> Vec<DriftEvent> {
        self.recent_events.lock().iter().cloned().collect()
    }

    fn record_events(&self, events: &[DriftEvent]) {
        let mut recent = self.recent_events.lock();
        for event in events {
            if recent.len() >= RECENT_EVENTS_CAP {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
    }

    /// One reconciliation tick: refresh actuals, classify every
    /// expectation, compute hedge-pair drift, and sweep stale entries.
    /// Returns the drift events the Scheduler should consider.
    pub async fn tick(&self) -> Vec<DriftEvent> {
        self.market_state.refresh_all().await;

        let mut events = self.check_expectations().await;
        events.extend(self.check_hedge_pairs());
        self.cleanup();
        self.record_events(&events);
        events
    }

    async fn check_expectations(&self) -> Vec<DriftEvent> {
        let now = self.clock.now();
        let snapshot: Vec<Expectation> = self.expectations.lock().values().cloned().collect();
        let mut events = Vec::new();

        for expectation in snapshot {
            let actual = self
                .market_state
                .position(expectation.venue, &expectation.symbol)
                .map(|p| p.size)
                .filter(|&s| s.abs() > DUST_SIZE)
                .unwrap_or(0.0);

            let age = now - expectation.placed_at;
            let class = classify(actual, expectation.expected_size, age, chrono::Duration::seconds(60));

            match class {
                DriftClass::Matched => {
                    let mut guard = self.expectations.lock();
                    if let Some(e) = guard.get_mut(&expectation.key()) {
                        e.verified = true;
                        e.last_checked = now;
                    }
                }
                DriftClass::NoFill => {
                    info!(venue = %expectation.venue, symbol = %expectation.symbol, order_id = %expectation.order_id, "NO_FILL past 60s, cancelling");
                    if let Some(adapter) = self.market_state.adapter(expectation.venue) {
                        if let Err(e) = adapter
                            .cancel_order(&expectation.order_id, Some(&expectation.symbol))
                            .await
                        {
                            warn!(venue = %expectation.venue, error = %e, "NO_FILL cancel failed");
                        }
                    }
                    events.push(DriftEvent::ExpectationDrift {
                        venue: expectation.venue,
                        symbol: expectation.symbol.clone(),
                        side: expectation.side,
                        class,
                    });
                }
                DriftClass::PartialFill | DriftClass::Overfill => {
                    events.push(DriftEvent::ExpectationDrift {
                        venue: expectation.venue,
                        symbol: expectation.symbol.clone(),
                        side: expectation.side,
                        class,
                    });
                }
            }
        }
        events
    }

    fn check_hedge_pairs(&self) -> Vec<DriftEvent> {
        let now = self.clock.now();
        let mut by_symbol: HashMap<Symbol, Vec<(VenueId, OrderSide, f64)>> = HashMap::new();
        for venue in self.market_state.venues() {
            for position in self.market_state.positions(venue) {
                if position.size.abs() <= DUST_SIZE {
                    continue;
                }
                by_symbol
                    .entry(position.symbol.clone())
                    .or_default()
                    .push((venue, position.side, position.size));
            }
        }

        let mut events = Vec::new();
        for (symbol, legs) in by_symbol {
            let Some(long_leg) = legs.iter().find(|(_, side, _)| *side == OrderSide::Long) else {
                continue;
            };
            let Some(short_leg) = legs.iter().find(|(_, side, _)| *side == OrderSide::Short) else {
                continue;
            };
            let (long_venue, _, long_size) = *long_leg;
            let (short_venue, _, short_size) = *short_leg;
            if long_venue == short_venue {
                continue;
            }

            let avg = (long_size.abs() + short_size.abs()) / 2.0;
            if avg <= 0.0 {
                continue;
            }
            let imbalance = (long_size.abs() - short_size.abs()).abs();
            let imbalance_percent = imbalance / avg;

            self.pairs.lock().insert(
                symbol.clone(),
                HedgePairRecord {
                    symbol: symbol.clone(),
                    long_venue,
                    short_venue,
                    measured_long_size: long_size,
                    measured_short_size: short_size,
                    imbalance,
                    imbalance_percent,
                    last_reconciled: now,
                },
            );

            if imbalance_percent > self.config.imbalance_threshold_percent {
                let (larger_venue, larger_side, larger_size, smaller_size) = if long_size.abs() >= short_size.abs() {
                    (long_venue, OrderSide::Long, long_size.abs(), short_size.abs())
                } else {
                    (short_venue, OrderSide::Short, short_size.abs(), long_size.abs())
                };
                let excess = larger_size - smaller_size;
                let rebalance_leg = if larger_size > 0.0 && excess / larger_size > 0.01 {
                    Some((larger_venue, larger_side, excess))
                } else {
                    None
                };

                events.push(DriftEvent::HedgePairImbalance {
                    symbol,
                    long_venue,
                    short_venue,
                    imbalance,
                    imbalance_percent,
                    rebalance_leg,
                });
            }
        }
        events
    }

    fn cleanup(&self) {
        let now = self.clock.now();
        let mut guard = self.expectations.lock();
        guard.retain(|_, e| {
            let age = now - e.last_checked;
            if e.verified && age > chrono::Duration::seconds(60) {
                return false;
            }
            if !e.verified && age > chrono::Duration::seconds(300) {
                warn!(venue = %e.venue, symbol = %e.symbol, order_id = %e.order_id, "unverified expectation expired, dropping");
                return false;
            }
            true
        });
    }
}

fn classify(actual: f64, expected: f64, age: chrono::Duration, no_fill_age: chrono::Duration) -> DriftClass {
    if expected <= 0.0 {
        return DriftClass::Matched;
    }
    let actual_abs = actual.abs();
    let delta_percent = (actual_abs - expected).abs() / expected;

    if delta_percent < 0.02 {
        return DriftClass::Matched;
    }
    if actual_abs <= DUST_SIZE {
        if age > no_fill_age {
            return DriftClass::NoFill;
        }
        return DriftClass::Matched;
    }
    if actual_abs < 0.95 * expected {
        return DriftClass::PartialFill;
    }
    if actual_abs > 1.05 * expected {
        return DriftClass::Overfill;
    }
    DriftClass::Matched
}
