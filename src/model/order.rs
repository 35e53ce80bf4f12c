use serde::{Deserialize, Serialize};

use super::VenueId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Long,
    Short,
}

impl OrderSide {
    /// The closing side of a side is its opposite.
    pub fn closing_side(&self) -> OrderSide {
        match self {
            OrderSide::Long => OrderSide::Short,
            OrderSide::Short => OrderSide::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    TakeProfit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    /// Whether a transition from `self` to `next` is permitted. The
    /// transition graph forbids moving out of a terminal state.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (OrderStatus::Pending, OrderStatus::Submitted) => true,
            (OrderStatus::Pending, n) if n.is_terminal() => true,
            (OrderStatus::Submitted, OrderStatus::PartiallyFilled) => true,
            (OrderStatus::Submitted, n) if n.is_terminal() => true,
            (OrderStatus::PartiallyFilled, OrderStatus::PartiallyFilled) => true,
            (OrderStatus::PartiallyFilled, n) if n.is_terminal() => true,
            _ => false,
        }
    }
}

/// A request to place an order on a venue. `size > 0` always; a LIMIT
/// request must carry a price, a stop request must carry a stop price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: super::Symbol,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub size: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    /// Client-assigned id used to correlate placement with later status
    /// polls and with the execution thread that spawned it.
    pub client_order_id: String,
}

impl OrderRequest {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.size.is_finite() && self.size > 0.0) {
            return Err(format!("invalid size: {}", self.size));
        }
        if self.order_type == OrderType::Limit && self.price.is_none() {
            return Err("LIMIT order requires a price".into());
        }
        if matches!(self.order_type, OrderType::StopLoss | OrderType::TakeProfit)
            && self.stop_price.is_none()
        {
            return Err("stop order requires a stop price".into());
        }
        Ok(())
    }

    /// MARKET orders are internally translated to IOC; LIMIT defaults to
    /// GTC unless the caller specified otherwise.
    pub fn effective_time_in_force(&self) -> TimeInForce {
        if self.order_type == OrderType::Market {
            TimeInForce::Ioc
        } else {
            self.time_in_force
        }
    }
}

/// A venue's response to an order request or status poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub venue: VenueId,
    pub venue_order_id: String,
    pub status: OrderStatus,
    pub filled_size: f64,
    pub avg_fill_price: Option<f64>,
    pub error: Option<String>,
}

impl OrderResponse {
    pub fn is_success(&self) -> bool {
        self.status != OrderStatus::Rejected && self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_forbid_further_transitions() {
        for terminal in [
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Rejected,
            OrderStatus::Expired,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(OrderStatus::Submitted));
            assert!(!terminal.can_transition_to(OrderStatus::PartiallyFilled));
        }
    }

    #[test]
    fn happy_path_transition_graph() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Submitted));
        assert!(OrderStatus::Submitted.can_transition_to(OrderStatus::PartiallyFilled));
        assert!(OrderStatus::PartiallyFilled.can_transition_to(OrderStatus::Filled));
        assert!(OrderStatus::Submitted.can_transition_to(OrderStatus::Filled));
    }

    #[test]
    fn closing_side_is_opposite() {
        assert_eq!(OrderSide::Long.closing_side(), OrderSide::Short);
        assert_eq!(OrderSide::Short.closing_side(), OrderSide::Long);
    }

    #[test]
    fn market_order_is_internally_ioc() {
        let req = OrderRequest {
            symbol: "ETH".into(),
            side: OrderSide::Long,
            order_type: OrderType::Market,
            size: 1.0,
            price: None,
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            client_order_id: "x".into(),
        };
        assert_eq!(req.effective_time_in_force(), TimeInForce::Ioc);
    }
}
