// =============================================================================
// Rate Limiter — sliding-window token budget with min-interval and ban pause
// =============================================================================
//
// Binance enforces request-weight budgets per minute plus hard bans (HTTP
// 418/429, code -1003). One limiter instance is shared per (environment,
// account) pair; every REST call acquires an estimated weight before it is
// sent. `acquire` blocks until three conditions hold simultaneously:
//
//   1. elapsed since last request >= min_interval,
//   2. window weight + requested weight <= capacity,
//   3. now >= pause_until (no active ban).
//
// Sleep granularity is capped at one second so `pause_for` extensions take
// effect promptly.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::types::{epoch_secs, AccountType, TradeMode};

/// Sliding window length in seconds.
const WINDOW_SECS: f64 = 60.0;
/// Fallback ban length when no unban hint can be parsed.
const BAN_FALLBACK_SECS: f64 = 8.0;
/// Safety buffer added after every registered ban.
const BAN_BUFFER_SECS: f64 = 3.0;

/// Per-profile limiter parameters.
#[derive(Debug, Clone, Copy)]
pub struct LimiterProfile {
    pub max_per_minute: f64,
    pub min_interval: f64,
    pub safety_margin: f64,
}

impl LimiterProfile {
    /// Parameters keyed by (environment, account), matching the exchange's
    /// published budgets with headroom.
    pub fn for_account(mode: TradeMode, account: AccountType) -> Self {
        match (mode, account) {
            (TradeMode::Live, AccountType::Futures) => Self {
                max_per_minute: 1100.0,
                min_interval: 0.2,
                safety_margin: 0.9,
            },
            (TradeMode::Live, AccountType::Spot) => Self {
                max_per_minute: 900.0,
                min_interval: 0.25,
                safety_margin: 0.85,
            },
            (TradeMode::Testnet, _) => Self {
                max_per_minute: 180.0,
                min_interval: 0.65,
                safety_margin: 0.8,
            },
        }
    }

    fn capacity(&self) -> f64 {
        (self.max_per_minute * self.safety_margin).max(1.0)
    }
}

struct LimiterState {
    /// (timestamp, weight) of requests inside the sliding window.
    events: VecDeque<(f64, f64)>,
    window_weight: f64,
    last_request: f64,
    pause_until: f64,
}

/// Shared limiter for one (environment, account) pair.
pub struct RateLimiter {
    capacity: f64,
    min_interval: f64,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(profile: LimiterProfile) -> Self {
        Self {
            capacity: profile.capacity(),
            min_interval: profile.min_interval.max(0.0),
            state: Mutex::new(LimiterState {
                events: VecDeque::new(),
                window_weight: 0.0,
                last_request: 0.0,
                pause_until: 0.0,
            }),
        }
    }

    /// Block until `weight` can be spent, then record it.
    pub async fn acquire(&self, weight: f64) {
        let weight = weight.max(0.0);
        if weight == 0.0 {
            return;
        }
        loop {
            let sleep_for = {
                let mut state = self.state.lock();
                let now = epoch_secs();
                let delay = Self::next_delay(&mut state, now, weight, self.capacity, self.min_interval);
                if delay <= 0.0 {
                    state.events.push_back((now, weight));
                    state.window_weight = (state.window_weight + weight).min(self.capacity);
                    state.last_request = now;
                    return;
                }
                delay
            };
            tokio::time::sleep(Duration::from_secs_f64(sleep_for.min(1.0))).await;
        }
    }

    /// Compute how long the caller must wait before spending `weight`.
    /// Expires old window entries as a side effect. Zero means "go now".
    fn next_delay(
        state: &mut LimiterState,
        now: f64,
        weight: f64,
        capacity: f64,
        min_interval: f64,
    ) -> f64 {
        while let Some(&(ts, w)) = state.events.front() {
            if now - ts >= WINDOW_SECS {
                state.events.pop_front();
                state.window_weight = (state.window_weight - w).max(0.0);
            } else {
                break;
            }
        }

        let mut wait_interval = 0.0;
        if state.last_request > 0.0 {
            let elapsed = now - state.last_request;
            if elapsed < min_interval {
                wait_interval = min_interval - elapsed;
            }
        }

        let mut wait_capacity = 0.0;
        if state.window_weight + weight > capacity {
            let earliest = state.events.front().map(|&(ts, _)| ts).unwrap_or(now);
            wait_capacity = (WINDOW_SECS - (now - earliest)).max(0.0);
        }

        let pause_remaining = (state.pause_until - now).max(0.0);

        wait_interval.max(wait_capacity).max(pause_remaining)
    }

    /// Atomically extend the pause window by `seconds` from now.
    pub fn pause_for(&self, seconds: f64) {
        if seconds <= 0.0 {
            return;
        }
        let mut state = self.state.lock();
        let until = epoch_secs() + seconds;
        if until > state.pause_until {
            state.pause_until = until;
        }
    }

    /// Register a ban lasting until `until_epoch` (already buffered).
    pub fn register_ban(&self, until_epoch: f64) {
        let mut state = self.state.lock();
        if until_epoch > state.pause_until {
            state.pause_until = until_epoch;
            warn!(
                until_epoch = format!("{until_epoch:.0}"),
                "REST ban registered; pausing requests"
            );
        }
    }

    /// Seconds until requests may flow again; zero when unbanned.
    pub fn seconds_until_resume(&self) -> f64 {
        let state = self.state.lock();
        (state.pause_until - epoch_secs()).max(0.0)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("window_weight", &state.window_weight)
            .field("pause_until", &state.pause_until)
            .finish()
    }
}

// =============================================================================
// Ban parsing
// =============================================================================

/// Resolve the unban time from a vendor error. Preference order:
/// "banned until <ms>" in the message, then a `Retry-After` header value in
/// seconds, then an 8 s fallback. A 3 s buffer is always added.
pub fn ban_until_from(message: &str, retry_after_secs: Option<f64>, now: f64) -> f64 {
    let parsed = parse_banned_until_ms(message).map(|ms| ms as f64 / 1000.0);
    let until = parsed
        .or(retry_after_secs.map(|s| now + s))
        .unwrap_or(now + BAN_FALLBACK_SECS);
    until + BAN_BUFFER_SECS
}

fn parse_banned_until_ms(message: &str) -> Option<u64> {
    let lower = message.to_ascii_lowercase();
    let idx = lower.find("banned until ")?;
    let rest = &message[idx + "banned until ".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

// =============================================================================
// Weight estimation
// =============================================================================

/// Estimate request weight from the endpoint path. Mirrors the documented
/// Binance weights for the endpoints the engine uses.
pub fn estimate_weight(path: &str) -> f64 {
    let path = path.to_ascii_lowercase();
    if path.contains("exchangeinfo") {
        10.0
    } else if path.contains("balance") || path.contains("account") || path.contains("position") {
        5.0
    } else if path.contains("klines") {
        4.0
    } else if path.contains("ticker/price") {
        1.0
    } else {
        2.0
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Process-wide limiter pool, one instance per (environment, account).
pub struct RateLimiterPool {
    limiters: Mutex<HashMap<(TradeMode, AccountType), Arc<RateLimiter>>>,
}

impl RateLimiterPool {
    pub fn new() -> Self {
        Self {
            limiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, mode: TradeMode, account: AccountType) -> Arc<RateLimiter> {
        let mut map = self.limiters.lock();
        map.entry((mode, account))
            .or_insert_with(|| {
                debug!(%mode, %account, "creating rate limiter");
                Arc::new(RateLimiter::new(LimiterProfile::for_account(mode, account)))
            })
            .clone()
    }
}

impl Default for RateLimiterPool {
    fn default() -> Self {
        Self::new()
    }
}
