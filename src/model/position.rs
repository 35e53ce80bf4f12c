use serde::{Deserialize, Serialize};

use super::{OrderSide, Symbol, VenueId};

/// A snapshot of a position as reported by a venue. Value semantics: a
/// refreshed position is a new `Position`, never a mutation in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub venue: VenueId,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: Option<f64>,
    pub liquidation_price: Option<f64>,
    pub margin_used: f64,
}

impl Position {
    pub fn value(&self) -> f64 {
        self.mark_price * self.size
    }

    /// Signed size: positive for LONG, negative for SHORT. Used when
    /// comparing a position's side against the sign of its size.
    pub fn signed_size(&self) -> f64 {
        match self.side {
            OrderSide::Long => self.size,
            OrderSide::Short => -self.size,
        }
    }
}

/// Two positions with the same normalized symbol on different venues,
/// opposite sides, sized within 5% of each other.
#[derive(Debug, Clone)]
pub struct HedgePair<'a> {
    pub long: &'a Position,
    pub short: &'a Position,
}

impl<'a> HedgePair<'a> {
    const IMBALANCE_TOLERANCE: f64 = 0.05;

    /// Attempts to pair two positions as a delta-neutral pair. Returns
    /// `None` if they don't satisfy the invariants in §3 (same venue,
    /// same side, different symbol, or imbalance beyond tolerance).
    pub fn try_new(a: &'a Position, b: &'a Position) -> Option<Self> {
        if a.venue == b.venue {
            return None;
        }
        if a.symbol != b.symbol {
            return None;
        }
        if a.side == b.side {
            return None;
        }
        let (long, short) = match a.side {
            OrderSide::Long => (a, b),
            OrderSide::Short => (b, a),
        };
        let avg = (long.size + short.size) / 2.0;
        if avg <= 0.0 {
            return None;
        }
        let imbalance = (long.size - short.size).abs() / avg;
        if imbalance > Self::IMBALANCE_TOLERANCE {
            return None;
        }
        Some(Self { long, short })
    }

    pub fn imbalance(&self) -> f64 {
        (self.long.size - self.short.size).abs()
    }

    pub fn imbalance_percent(&self) -> f64 {
        let avg = (self.long.size + self.short.size) / 2.0;
        if avg <= 0.0 {
            0.0
        } else {
            self.imbalance() / avg
        }
    }

    pub fn combined_pnl(&self) -> f64 {
        self.long.unrealized_pnl + self.short.unrealized_pnl
    }
}
