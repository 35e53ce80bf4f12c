//! Funding-rate predictor interface: consumed, not owned. The
//! production ensemble/Kalman/regime pipeline lives outside the core;
//! this crate only needs a trait narrow enough for the Guardian's
//! single-leg recovery fallback to consult.

use async_trait::async_trait;

use crate::model::{Symbol, VenueId};

#[derive(Debug, Clone)]
pub struct VenueRate {
    pub venue: VenueId,
    pub current_rate: f64,
    pub predicted_rate: f64,
}

#[async_trait]
pub trait FundingPredictor: Send + Sync {
    async fn compare_funding_rates(&self, symbol: &Symbol) -> Vec<VenueRate>;
}

/// A fixed-preference predictor double: returns a stable ranking of
/// venues by a configured fill-priority-like order (first-listed = most
/// favorable). Sufficient for the Guardian's fallback path and for
/// tests; a real ensemble model is out of scope for the core.
pub struct StaticFundingPredictor {
    venues: Vec<VenueId>,
}

impl StaticFundingPredictor {
    pub fn new(venues: Vec<VenueId>) -> Self {
        Self { venues }
    }
}

#[async_trait]
impl FundingPredictor for StaticFundingPredictor {
    async fn compare_funding_rates(&self, _symbol: &Symbol) -> Vec<VenueRate> {
        self.venues
            .iter()
            .enumerate()
            .map(|(i, &venue)| VenueRate {
                venue,
                current_rate: 0.0,
                predicted_rate: -(i as f64) * 0.0001,
            })
            .collect()
    }
}
