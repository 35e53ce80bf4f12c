//! Typed failures for the keeper core.
//!
//! Nothing in this crate panics across a component boundary. Every
//! adapter call returns `Result<_, ExchangeError>`; everything above the
//! adapter layer speaks `anyhow::Result`, wrapping an `ExchangeError` with
//! `.context()` at the point it crosses into a higher-level operation.

use crate::model::VenueId;
use thiserror::Error;

/// A typed failure from a venue adapter. Callers match on `kind` when the
/// distinction matters (e.g. the Guardian treats `RateLimited` differently
/// from `Rejected`); everything else just logs and propagates.
#[derive(Debug, Error, Clone)]
#[error("{venue:?} exchange error: {kind}{}", code.as_ref().map(|c| format!(" (code {c})")).unwrap_or_default())]
pub struct ExchangeError {
    pub venue: VenueId,
    pub kind: ExchangeErrorKind,
    pub code: Option<String>,
    pub cause: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeErrorKind {
    /// Transient: network error, 5xx, or a 429-equivalent. Safe to retry.
    Transient,
    /// Rate limited. Adapter should back off and retry internally before
    /// this ever reaches the caller; surfaced only once retries exhaust.
    RateLimited,
    /// The venue rejected the order/request itself (bad size, closed
    /// market, insufficient balance). Not retriable as-is.
    Rejected,
    /// Signing or authentication failed. Fatal for the adapter until an
    /// operator rotates credentials; does not crash the process.
    Auth,
    /// Response could not be parsed/decoded.
    Decode,
}

impl std::fmt::Display for ExchangeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExchangeErrorKind::Transient => "transient",
            ExchangeErrorKind::RateLimited => "rate_limited",
            ExchangeErrorKind::Rejected => "rejected",
            ExchangeErrorKind::Auth => "auth",
            ExchangeErrorKind::Decode => "decode",
        };
        f.write_str(s)
    }
}

impl ExchangeError {
    pub fn new(venue: VenueId, kind: ExchangeErrorKind, cause: impl Into<String>) -> Self {
        Self {
            venue,
            kind,
            code: None,
            cause: cause.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            ExchangeErrorKind::Transient | ExchangeErrorKind::RateLimited
        )
    }
}

/// Errors surfaced by the keeper's own components (not the venue wire).
#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("active order already exists for ({venue:?}, {symbol}, {side:?})")]
    DuplicateActiveOrder {
        venue: VenueId,
        symbol: String,
        side: crate::model::OrderSide,
    },
    #[error("single-leg recovery safety check failed: missing venue {missing:?} equals existing position venue")]
    SameVenueRecovery { missing: VenueId },
    #[error("withdrawal could not be fully satisfied: ${residual:.2} remaining")]
    PartialWithdrawal { residual: f64 },
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}
