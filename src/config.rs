//! Keeper configuration, loaded from the environment: read a var, parse
//! it, fall back to the documented default on absence or a parse failure.

use std::time::Duration;

use crate::model::VenueId;

#[derive(Debug, Clone)]
pub struct Config {
    /// How many pieces a large hedge is cut into.
    pub number_of_slices: u32,
    /// Per-slice fill deadline.
    pub slice_fill_timeout: Duration,
    /// Polling period while waiting for a leg to fill.
    pub fill_check_interval: Duration,
    /// Abort threshold per slice, as a fraction (0.10 = 10%).
    pub max_imbalance_percent: f64,

    /// Guardian escalation ladder.
    pub min_age: Duration,
    pub aggressive_age: Duration,
    pub market_order_age: Duration,
    pub zombie_timeout: Duration,

    /// Single-leg recovery cap.
    pub max_retries: u32,
    /// Hedge-pair drift alarm threshold, as a fraction (0.05 = 5%).
    pub imbalance_threshold_percent: f64,

    /// Adapter caches.
    pub balance_cache_ttl: Duration,
    pub price_cache_ttl: Duration,
    pub symbol_cache_ttl: Duration,

    /// Rate-limit backoff: base, multiplier, cap, max attempts.
    pub rate_limit_backoff_base: Duration,
    pub rate_limit_backoff_multiplier: u32,
    pub rate_limit_backoff_cap: Duration,
    pub rate_limit_max_attempts: u32,

    /// Market-order fallback slip for venues lacking a native market order.
    pub market_fallback_slip_percent: f64,

    /// Guardian/Reconciliation tick intervals.
    pub guardian_tick_interval: Duration,
    pub reconcile_tick_interval: Duration,
    pub market_state_refresh_interval: Duration,

    /// HTTP call timeout, per adapter.
    pub http_timeout: Duration,

    /// Diagnostics HTTP surface bind address.
    pub diagnostics_bind_addr: String,

    /// Venue fill-priority ranking, hardest-to-fill first. The Hedged
    /// Executor places whichever leg's venue sorts earlier in this list
    /// first ("Lighter first" in the source's fixed two-venue case,
    /// generalized to a stable per-pair ordering table).
    pub venue_fill_priority: Vec<VenueId>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(key, default_secs))
}

fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(key, default_ms))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            number_of_slices: 5,
            slice_fill_timeout: Duration::from_secs(30),
            fill_check_interval: Duration::from_secs(2),
            max_imbalance_percent: 0.10,

            min_age: Duration::from_secs(45),
            aggressive_age: Duration::from_secs(90),
            market_order_age: Duration::from_secs(120),
            zombie_timeout: Duration::from_secs(300),

            max_retries: 5,
            imbalance_threshold_percent: 0.05,

            balance_cache_ttl: Duration::from_secs(30),
            price_cache_ttl: Duration::from_secs(10),
            symbol_cache_ttl: Duration::from_secs(3600),

            rate_limit_backoff_base: Duration::from_secs(1),
            rate_limit_backoff_multiplier: 2,
            rate_limit_backoff_cap: Duration::from_secs(16),
            rate_limit_max_attempts: 5,

            market_fallback_slip_percent: 0.002,

            guardian_tick_interval: Duration::from_secs(30),
            reconcile_tick_interval: Duration::from_secs(5),
            market_state_refresh_interval: Duration::from_secs(15),

            http_timeout: Duration::from_secs(30),

            diagnostics_bind_addr: "0.0.0.0:8090".to_string(),

            venue_fill_priority: vec![VenueId::Paradex, VenueId::Hyperliquid, VenueId::Okx],
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let mut config = Self::default();

        config.number_of_slices = env_parse("KEEPER_NUMBER_OF_SLICES", config.number_of_slices);
        config.slice_fill_timeout =
            env_millis("KEEPER_SLICE_FILL_TIMEOUT_MS", config.slice_fill_timeout.as_millis() as u64);
        config.fill_check_interval = env_millis(
            "KEEPER_FILL_CHECK_INTERVAL_MS",
            config.fill_check_interval.as_millis() as u64,
        );
        config.max_imbalance_percent =
            env_parse("KEEPER_MAX_IMBALANCE_PERCENT", config.max_imbalance_percent);

        config.min_age = env_secs("KEEPER_MIN_AGE_SECONDS", config.min_age.as_secs());
        config.aggressive_age =
            env_secs("KEEPER_AGGRESSIVE_AGE_SECONDS", config.aggressive_age.as_secs());
        config.market_order_age = env_secs(
            "KEEPER_MARKET_ORDER_AGE_SECONDS",
            config.market_order_age.as_secs(),
        );
        config.zombie_timeout =
            env_secs("KEEPER_ZOMBIE_TIMEOUT_SECONDS", config.zombie_timeout.as_secs());

        config.max_retries = env_parse("KEEPER_MAX_RETRIES", config.max_retries);
        config.imbalance_threshold_percent = env_parse(
            "KEEPER_IMBALANCE_THRESHOLD_PERCENT",
            config.imbalance_threshold_percent,
        );

        config.balance_cache_ttl =
            env_millis("KEEPER_BALANCE_CACHE_TTL_MS", config.balance_cache_ttl.as_millis() as u64);
        config.price_cache_ttl =
            env_millis("KEEPER_PRICE_CACHE_TTL_MS", config.price_cache_ttl.as_millis() as u64);

        config.diagnostics_bind_addr = std::env::var("KEEPER_DIAGNOSTICS_BIND_ADDR")
            .unwrap_or(config.diagnostics_bind_addr);

        config
    }

    /// Which of two venues should receive the harder-to-fill leg first,
    /// per `venue_fill_priority`. Stable for a given pair; falls back to
    /// `a` if neither venue is ranked.
    pub fn harder_to_fill_first(&self, a: VenueId, b: VenueId) -> (VenueId, VenueId) {
        let rank = |v: VenueId| self.venue_fill_priority.iter().position(|&r| r == v).unwrap_or(usize::MAX);
        if rank(a) <= rank(b) {
            (a, b)
        } else {
            (b, a)
        }
    }
}
