//! The core data model. Value-semantic snapshot types: an
//! "update" produces a new value rather than mutating one in place.

mod order;
mod position;
mod symbol;
mod venue;

pub use order::{OrderRequest, OrderResponse, OrderSide, OrderStatus, OrderType, TimeInForce};
pub use position::{HedgePair, Position};
pub use symbol::Symbol;
pub use venue::VenueId;

use serde::{Deserialize, Serialize};

/// An opaque correlation id grouping the legs of one opening or closing
/// operation (its "execution thread").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new(op: &str, symbol: &Symbol) -> Self {
        Self(format!("{op}-{symbol}-{}", uuid::Uuid::new_v4()))
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The key identifying a single logical order slot: at most one active
/// record may exist per key at any time (Lock Registry invariant).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderKey {
    pub venue: VenueId,
    pub symbol: Symbol,
    pub side: OrderSide,
}

impl OrderKey {
    pub fn new(venue: VenueId, symbol: Symbol, side: OrderSide) -> Self {
        Self { venue, symbol, side }
    }
}

impl std::fmt::Display for OrderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {:?})", self.venue, self.symbol, self.side)
    }
}
