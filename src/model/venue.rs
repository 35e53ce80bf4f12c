use serde::{Deserialize, Serialize};

/// Closed enum of every venue the keeper knows how to trade on.
///
/// Equality is derived (total, as required by spec) and the enum is the
/// key used throughout the registry, cache, and reconciliation maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VenueId {
    Hyperliquid,
    Paradex,
    Okx,
}

impl VenueId {
    pub const ALL: [VenueId; 3] = [VenueId::Hyperliquid, VenueId::Paradex, VenueId::Okx];

    pub fn as_str(&self) -> &'static str {
        match self {
            VenueId::Hyperliquid => "hyperliquid",
            VenueId::Paradex => "paradex",
            VenueId::Okx => "okx",
        }
    }
}

impl std::fmt::Display for VenueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_total() {
        for a in VenueId::ALL {
            for b in VenueId::ALL {
                assert_eq!(a == b, a.as_str() == b.as_str());
            }
        }
    }
}
