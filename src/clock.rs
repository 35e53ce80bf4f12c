//! Time as a capability, not a direct dependency (Design Notes §9).
//!
//! Every age/timeout computation in the Guardian and Reconciliation
//! engine consults a `Clock` instead of `Utc::now()` directly, so tests
//! can drive both deterministically without real sleeps.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock tests advance explicitly, so age-based logic (e.g. the
/// Guardian's 45s/90s/120s escalation ladder) can be exercised without
/// waiting on a wall clock.
#[derive(Clone)]
pub struct TestClock {
    inner: Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut guard = self.inner.lock();
        *guard = *guard + duration;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(chrono::Duration::seconds(secs));
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.lock()
    }
}

pub type SharedClock = Arc<dyn Clock>;
