//! Execution Lock Registry: the process-wide record of every
//! order the keeper has placed, keyed by `(venue, symbol, side)`, plus
//! the execution-thread grouping for paired legs.
//!
//! `parking_lot::Mutex` over a plain `HashMap`, since nothing inside the
//! lock ever awaits and the critical sections are always short.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::model::{OrderKey, OrderSide, OrderStatus, Symbol, ThreadId, VenueId};

/// A single order slot the registry tracks. `placed_at` is wall-clock
/// for diagnostics; `placed_at_instant` drives age computations so the
/// Guardian's escalation ladder isn't disturbed by clock skew.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveOrderRecord {
    pub venue: VenueId,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub order_id: String,
    pub size: f64,
    pub requested_price: Option<f64>,
    pub placed_at: DateTime<Utc>,
    pub status: OrderStatus,
    pub thread_id: ThreadId,
}

impl ActiveOrderRecord {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.placed_at
    }
}

#[derive(Default)]
struct Inner {
    records: HashMap<OrderKey, ActiveOrderRecord>,
}

pub struct LockRegistry {
    inner: Mutex<Inner>,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Inserts a new record in `PENDING`→ about-to-be-`SUBMITTED` state.
    /// Refuses if a non-terminal record already occupies this key — the
    /// single serialization point requires.
    pub fn register_order_placing(
        &self,
        venue: VenueId,
        symbol: Symbol,
        side: OrderSide,
        order_id: String,
        size: f64,
        requested_price: Option<f64>,
        thread_id: ThreadId,
        now: DateTime<Utc>,
    ) -> Result<(), ActiveOrderRecord> {
        let key = OrderKey::new(venue, symbol.clone(), side);
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.records.get(&key) {
            if !existing.status.is_terminal() {
                return Err(existing.clone());
            }
        }
        debug!(%venue, %symbol, ?side, %order_id, "registering order placement");
        inner.records.insert(
            key,
            ActiveOrderRecord {
                venue,
                symbol,
                side,
                order_id,
                size,
                requested_price,
                placed_at: now,
                status: OrderStatus::Submitted,
                thread_id,
            },
        );
        Ok(())
    }

    /// Updates the status of the record for `(venue, symbol, side)`, if
    /// its current status permits the transition. Returns `false` if no
    /// record exists or the transition is forbidden.
    pub fn update_order_status(
        &self,
        venue: VenueId,
        symbol: &Symbol,
        side: OrderSide,
        new_status: OrderStatus,
        order_id: &str,
    ) -> bool {
        let key = OrderKey::new(venue, symbol.clone(), side);
        let mut inner = self.inner.lock();
        let Some(record) = inner.records.get_mut(&key) else {
            warn!(%venue, %symbol, ?side, %order_id, "status update for unknown order");
            return false;
        };
        if record.order_id != order_id {
            warn!(%venue, %symbol, ?side, expected = %record.order_id, got = %order_id, "order id mismatch on status update");
            return false;
        }
        if !record.status.can_transition_to(new_status) {
            warn!(%venue, %symbol, ?side, from = ?record.status, to = ?new_status, "forbidden status transition ignored");
            return false;
        }
        record.status = new_status;
        true
    }

    pub fn has_active_order(&self, venue: VenueId, symbol: &Symbol, side: OrderSide) -> bool {
        let key = OrderKey::new(venue, symbol.clone(), side);
        self.inner
            .lock()
            .records
            .get(&key)
            .is_some_and(|r| !r.status.is_terminal())
    }

    pub fn get_all_active_orders(&self) -> Vec<ActiveOrderRecord> {
        self.inner
            .lock()
            .records
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect()
    }

    /// True if some non-terminal record on `venue` carries `order_id` —
    /// the orphan sweep's test for "this order is ours".
    pub fn is_order_tracked(&self, venue: VenueId, order_id: &str) -> bool {
        self.inner
            .lock()
            .records
            .values()
            .any(|r| r.venue == venue && r.order_id == order_id && !r.status.is_terminal())
    }

    /// Distinct thread ids with at least one non-terminal record —
    /// the Guardian's thread-health sweep iterates this set.
    pub fn active_thread_ids(&self) -> Vec<ThreadId> {
        let inner = self.inner.lock();
        let set: std::collections::HashSet<ThreadId> = inner
            .records
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.thread_id.clone())
            .collect();
        set.into_iter().collect()
    }

    pub fn get_by_thread(&self, thread_id: &ThreadId) -> Vec<ActiveOrderRecord> {
        self.inner
            .lock()
            .records
            .values()
            .filter(|r| &r.thread_id == thread_id)
            .cloned()
            .collect()
    }

    /// Removes the record for this key outright, terminal or not. A
    /// repeated call on an already-absent key is a no-op (    /// round-trip property).
    pub fn force_clear_order(&self, venue: VenueId, symbol: &Symbol, side: OrderSide) {
        let key = OrderKey::new(venue, symbol.clone(), side);
        if self.inner.lock().records.remove(&key).is_some() {
            debug!(%venue, %symbol, ?side, "force-cleared order record");
        }
    }

    /// Drops any record whose status is terminal — called after a
    /// Guardian tick or a reconciliation pass confirms the terminal
    /// state has been observed and acted on.
    pub fn sweep_terminal(&self) {
        self.inner.lock().records.retain(|_, r| !r.status.is_terminal());
    }
}

/// Untracked-order tracker for the Guardian's orphan sweep:
/// per `(venue, order_id)`, remembers when it was first observed and how
/// many consecutive ticks it has been seen on, purely in-memory and
/// touched only from Guardian methods.
pub struct OrphanTracker {
    inner: Mutex<HashMap<(VenueId, String), OrphanEntry>>,
}

#[derive(Debug, Clone)]
pub struct OrphanEntry {
    pub first_seen_at: Instant,
    pub seen_count: u32,
}

impl Default for OrphanTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OrphanTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Records that `(venue, order_id)` was observed untracked this
    /// tick, bumping its seen count. Returns the updated entry.
    pub fn observe(&self, venue: VenueId, order_id: &str) -> OrphanEntry {
        let mut inner = self.inner.lock();
        let entry = inner
            .entry((venue, order_id.to_string()))
            .or_insert_with(|| OrphanEntry {
                first_seen_at: Instant::now(),
                seen_count: 0,
            });
        entry.seen_count += 1;
        entry.clone()
    }

    /// Drops tracker entries for `venue` whose order id isn't in
    /// `still_open_ids` — orders no longer observed on the venue are
    /// purged. Entries for other venues are untouched.
    pub fn purge_venue_except(&self, venue: VenueId, still_open_ids: &[String]) {
        let keep: std::collections::HashSet<&String> = still_open_ids.iter().collect();
        self.inner
            .lock()
            .retain(|(v, order_id), _| *v != venue || keep.contains(order_id));
    }

    pub fn remove(&self, venue: VenueId, order_id: &str) {
        self.inner.lock().remove(&(venue, order_id.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread() -> ThreadId {
        ThreadId::new("open", &Symbol::new("ETH"))
    }

    #[test]
    fn refuses_duplicate_active_order_for_same_key() {
        let registry = LockRegistry::new();
        let now = Utc::now();
        registry
            .register_order_placing(
                VenueId::Hyperliquid,
                Symbol::new("ETH"),
                OrderSide::Long,
                "oid-1".into(),
                1.0,
                Some(3500.0),
                thread(),
                now,
            )
            .unwrap();
        let err = registry
            .register_order_placing(
                VenueId::Hyperliquid,
                Symbol::new("ETH"),
                OrderSide::Long,
                "oid-2".into(),
                1.0,
                Some(3500.0),
                thread(),
                now,
            )
            .unwrap_err();
        assert_eq!(err.order_id, "oid-1");
    }

    #[test]
    fn allows_reregistration_after_terminal_status() {
        let registry = LockRegistry::new();
        let now = Utc::now();
        registry
            .register_order_placing(
                VenueId::Okx,
                Symbol::new("ETH"),
                OrderSide::Short,
                "oid-1".into(),
                1.0,
                None,
                thread(),
                now,
            )
            .unwrap();
        assert!(registry.update_order_status(
            VenueId::Okx,
            &Symbol::new("ETH"),
            OrderSide::Short,
            OrderStatus::Filled,
            "oid-1",
        ));
        registry.force_clear_order(VenueId::Okx, &Symbol::new("ETH"), OrderSide::Short);
        registry
            .register_order_placing(
                VenueId::Okx,
                Symbol::new("ETH"),
                OrderSide::Short,
                "oid-2".into(),
                1.0,
                None,
                thread(),
                now,
            )
            .unwrap();
    }

    #[test]
    fn has_active_order_false_after_terminal() {
        let registry = LockRegistry::new();
        let now = Utc::now();
        registry
            .register_order_placing(
                VenueId::Paradex,
                Symbol::new("BTC"),
                OrderSide::Long,
                "oid-1".into(),
                1.0,
                None,
                thread(),
                now,
            )
            .unwrap();
        assert!(registry.has_active_order(VenueId::Paradex, &Symbol::new("BTC"), OrderSide::Long));
        registry.update_order_status(
            VenueId::Paradex,
            &Symbol::new("BTC"),
            OrderSide::Long,
            OrderStatus::Cancelled,
            "oid-1",
        );
        assert!(!registry.has_active_order(VenueId::Paradex, &Symbol::new("BTC"), OrderSide::Long));
    }

    #[test]
    fn force_clear_is_idempotent() {
        let registry = LockRegistry::new();
        registry.force_clear_order(VenueId::Hyperliquid, &Symbol::new("ETH"), OrderSide::Long);
        registry.force_clear_order(VenueId::Hyperliquid, &Symbol::new("ETH"), OrderSide::Long);
    }

    #[test]
    fn orphan_requires_three_observations() {
        let tracker = OrphanTracker::new();
        let e1 = tracker.observe(VenueId::Okx, "o1");
        assert_eq!(e1.seen_count, 1);
        let e2 = tracker.observe(VenueId::Okx, "o1");
        assert_eq!(e2.seen_count, 2);
        let e3 = tracker.observe(VenueId::Okx, "o1");
        assert_eq!(e3.seen_count, 3);
    }

    #[test]
    fn orphan_purge_drops_unseen_entries() {
        let tracker = OrphanTracker::new();
        tracker.observe(VenueId::Okx, "o1");
        tracker.observe(VenueId::Okx, "o2");
        tracker.purge_venue_except(VenueId::Okx, &["o1".to_string()]);
        assert_eq!(tracker.observe(VenueId::Okx, "o1").seen_count, 2);
        assert_eq!(tracker.observe(VenueId::Okx, "o2").seen_count, 1);
    }
}
