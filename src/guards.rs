// =============================================================================
// Guard Layers — bar guard, symbol guard, pending-attempt coalescer,
// signature tracker, cooldown and hold windows
// =============================================================================
//
// Three independent stages run before any order submission:
//
//   1. Bar guard      — at most one successful order per (symbol, interval,
//                       side, signature) per kline bar.
//   2. Pending guard  — repeated identical attempts coalesce into a single
//                       in-flight slot until the first one resolves.
//   3. Signature guard— a recent successful order with the same signature
//                       inside the guard window refuses a re-entry, unless
//                       an opposite indicator leg is live (flip override).
//
// The window helpers at the bottom are pure; everything stateful sits under
// one mutex that is never held across an await.
// =============================================================================

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Refusal;
use crate::ledger::Entry;
use crate::types::{epoch_secs, Side};

/// Canonical signature key: sorted lowercase tokens (slot suffix included).
pub type SigKey = Vec<String>;

/// Build a signature key from arbitrary tokens.
pub fn sig_key(tokens: &[String]) -> SigKey {
    let mut out: Vec<String> = tokens
        .iter()
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out
}

/// A "fast context" carries a slot suffix; its guard window is shortened so
/// stacked adds are not starved.
pub fn is_fast_context(sig: &[String]) -> bool {
    sig.iter().any(|t| t.starts_with("slot"))
}

// =============================================================================
// Window math (pure)
// =============================================================================

/// Base signature-guard window for an interval.
pub fn guard_window(interval_secs: f64, fast_context: bool) -> f64 {
    let base = (interval_secs * 1.5).clamp(8.0, 45.0);
    if fast_context {
        base.min((interval_secs * 0.12).clamp(2.0, 6.0))
    } else {
        base
    }
}

/// TTL for a coalesced pending attempt.
pub fn pending_ttl(testnet: bool) -> f64 {
    if testnet {
        12.0
    } else {
        45.0
    }
}

/// Remaining flip-cooldown seconds for an indicator whose last action was on
/// the opposite side. Zero when clear.
pub fn flip_cooldown_remaining(
    last_action: Option<(Side, f64)>,
    new_side: Side,
    cooldown_seconds: f64,
    cooldown_bars: u32,
    interval_secs: f64,
    now: f64,
) -> f64 {
    let (last_side, last_ts) = match last_action {
        Some(v) => v,
        None => return 0.0,
    };
    if last_side == new_side {
        return 0.0;
    }
    let window = cooldown_seconds.max(cooldown_bars as f64 * interval_secs);
    (window - (now - last_ts)).max(0.0)
}

/// True when an entry is old enough to be closed by indicator-flip logic.
/// Stop-loss closes ignore this.
pub fn hold_ready(
    entry_ts: f64,
    now: f64,
    min_hold_seconds: f64,
    min_hold_bars: u32,
    interval_secs: f64,
) -> bool {
    let window = min_hold_seconds.max(min_hold_bars as f64 * interval_secs);
    now - entry_ts >= window
}

/// Window inside which an identical-signature entry blocks a re-open while
/// the exchange still reports the side live.
pub fn duplicate_fill_window(interval_secs: f64) -> f64 {
    (interval_secs * 1.2).max(12.0)
}

/// True when `entries` contains a younger-than-window entry with the same
/// slot-less signature.
pub fn has_recent_duplicate(
    entries: &[Entry],
    signature_without_slots: &[String],
    window: f64,
    now: f64,
) -> bool {
    entries.iter().any(|e| {
        now - e.timestamp < window && e.signature_without_slots() == signature_without_slots
    })
}

// =============================================================================
// Bar guard
// =============================================================================

type BarKey = (String, String, Side);

#[derive(Debug, Default)]
struct BarTracker {
    bar_id: i64,
    signatures: HashSet<SigKey>,
}

/// Process-wide bar guard: one successful order per signature per bar,
/// shared across every strategy loop in the process.
pub struct BarGuard {
    bars: Mutex<HashMap<BarKey, BarTracker>>,
}

impl BarGuard {
    pub fn new() -> Self {
        Self {
            bars: Mutex::new(HashMap::new()),
        }
    }

    /// True when `sig` has not yet been submitted for this bar.
    pub fn allows(&self, symbol: &str, interval: &str, side: Side, bar_id: i64, sig: &SigKey) -> bool {
        let mut bars = self.bars.lock();
        let tracker = bars
            .entry((symbol.to_string(), interval.to_string(), side))
            .or_default();
        if tracker.bar_id != bar_id {
            tracker.bar_id = bar_id;
            tracker.signatures.clear();
        }
        !tracker.signatures.contains(sig)
    }

    /// Record a successful submission for this bar.
    pub fn commit(&self, symbol: &str, interval: &str, side: Side, bar_id: i64, sig: &SigKey) {
        let mut bars = self.bars.lock();
        let tracker = bars
            .entry((symbol.to_string(), interval.to_string(), side))
            .or_default();
        if tracker.bar_id != bar_id {
            tracker.bar_id = bar_id;
            tracker.signatures.clear();
        }
        tracker.signatures.insert(sig.clone());
    }
}

impl Default for BarGuard {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Symbol guard (pending coalescer + signature tracker)
// =============================================================================

#[derive(Debug, Default)]
struct SymbolState {
    /// Last order attempt resolution (success or failure) timestamp.
    last: f64,
    /// Signature -> timestamp of last *successful* order.
    signatures: HashMap<SigKey, f64>,
    /// Signature -> timestamp of the claimed in-flight attempt.
    pending: HashMap<SigKey, f64>,
}

/// Per-(symbol, side) guard state shared by every loop in the process.
pub struct SymbolGuard {
    state: Mutex<HashMap<(String, Side), SymbolState>>,
    pending_ttl: f64,
}

impl SymbolGuard {
    pub fn new(testnet: bool) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            pending_ttl: pending_ttl(testnet),
        }
    }

    /// Attempt to claim the submission slot for `sig`. On success the caller
    /// MUST later call exactly one of `commit`, `fail`, or `abort`.
    ///
    /// `override_guard` is set when an opposite indicator leg is live and we
    /// are flipping; it bypasses the signature window but still claims the
    /// pending slot.
    pub fn begin(
        &self,
        symbol: &str,
        side: Side,
        sig: &SigKey,
        window: f64,
        override_guard: bool,
    ) -> Result<(), Refusal> {
        let mut map = self.state.lock();
        let state = map.entry((symbol.to_string(), side)).or_default();
        let now = epoch_secs();

        state.signatures.retain(|_, ts| now - *ts <= window);
        let pending_ttl = self.pending_ttl.max(window * 1.5);
        state.pending.retain(|_, ts| now - *ts <= pending_ttl);

        if state.pending.contains_key(sig) {
            if !override_guard {
                return Err(Refusal::PendingAttempt);
            }
        }

        let elapsed = if state.last > 0.0 {
            now - state.last
        } else {
            f64::INFINITY
        };

        if let Some(success_ts) = state.signatures.get(sig).copied() {
            let since = now - success_ts;
            if since < window && !override_guard {
                return Err(Refusal::SignatureGuard {
                    remaining: window - since,
                });
            }
            state.signatures.remove(sig);
        } else if state.signatures.is_empty() && elapsed < window && !override_guard {
            // No signature on file but a very recent order on this side.
            return Err(Refusal::SignatureGuard {
                remaining: window - elapsed,
            });
        }

        state.pending.insert(sig.clone(), now);
        if override_guard {
            debug!(symbol, %side, "guard override claimed (flipping opposite exposure)");
        }
        Ok(())
    }

    /// Successful order: stamp the signature window and release the slot.
    pub fn commit(&self, symbol: &str, side: Side, sig: &SigKey) {
        let mut map = self.state.lock();
        let state = map.entry((symbol.to_string(), side)).or_default();
        let now = epoch_secs();
        state.pending.remove(sig);
        state.signatures.insert(sig.clone(), now);
        state.last = now;
    }

    /// Failed order: release the slot and advance the last-attempt clock.
    pub fn fail(&self, symbol: &str, side: Side, sig: &SigKey) {
        let mut map = self.state.lock();
        let state = map.entry((symbol.to_string(), side)).or_default();
        state.pending.remove(sig);
        state.last = state.last.max(epoch_secs());
    }

    /// Abort without an attempt (a later pipeline stage refused).
    pub fn abort(&self, symbol: &str, side: Side, sig: &SigKey) {
        let mut map = self.state.lock();
        if let Some(state) = map.get_mut(&(symbol.to_string(), side)) {
            state.pending.remove(sig);
        }
    }

    /// Forget guard state for a leg that fully closed, so a fresh entry on
    /// the same signature is not refused.
    pub fn mark_leg_closed(&self, symbol: &str, side: Side) {
        let mut map = self.state.lock();
        if let Some(state) = map.get_mut(&(symbol.to_string(), side)) {
            state.signatures.clear();
            state.pending.clear();
        }
    }

    /// True when `sig` currently owns a pending slot.
    pub fn is_pending(&self, symbol: &str, side: Side, sig: &SigKey) -> bool {
        self.state
            .lock()
            .get(&(symbol.to_string(), side))
            .map(|s| s.pending.contains_key(sig))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for SymbolGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolGuard")
            .field("keys", &self.state.lock().len())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sig(tokens: &[&str]) -> SigKey {
        sig_key(&tokens.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    // ---- window math -------------------------------------------------------

    #[test]
    fn guard_window_bounds() {
        assert_eq!(guard_window(60.0, false), 90.0f64.clamp(8.0, 45.0));
        assert_eq!(guard_window(1.0, false), 8.0);
        assert_eq!(guard_window(86_400.0, false), 45.0);
    }

    #[test]
    fn guard_window_fast_context_shortens() {
        // 1m: base 45 capped -> fast min(45, clamp(7.2, 2, 6)) = 6.
        assert_eq!(guard_window(60.0, true), 6.0);
        // Very short interval: floor at 2 s.
        assert_eq!(guard_window(5.0, true), 2.0);
    }

    #[test]
    fn cooldown_only_for_opposite_side() {
        let now = 1000.0;
        let last = Some((Side::Buy, 990.0));
        // Same side: no cooldown.
        assert_eq!(
            flip_cooldown_remaining(last, Side::Buy, 0.0, 1, 60.0, now),
            0.0
        );
        // Opposite: 1 bar of 60 s, 10 elapsed -> 50 remaining.
        let rem = flip_cooldown_remaining(last, Side::Sell, 0.0, 1, 60.0, now);
        assert!((rem - 50.0).abs() < 1e-9);
        // Seconds override dominates when larger.
        let rem = flip_cooldown_remaining(last, Side::Sell, 120.0, 1, 60.0, now);
        assert!((rem - 110.0).abs() < 1e-9);
    }

    #[test]
    fn hold_ready_window() {
        assert!(hold_ready(0.0, 100.0, 0.0, 0, 60.0));
        assert!(!hold_ready(50.0, 100.0, 0.0, 1, 60.0));
        assert!(hold_ready(30.0, 100.0, 60.0, 0, 60.0));
        assert!(!hold_ready(50.0, 100.0, 60.0, 0, 60.0));
    }

    #[test]
    fn duplicate_fill_window_floor() {
        assert_eq!(duplicate_fill_window(1.0), 12.0);
        assert!((duplicate_fill_window(60.0) - 72.0).abs() < 1e-9);
    }

    #[test]
    fn fast_context_detection() {
        assert!(is_fast_context(&sig(&["rsi", "slot1"])));
        assert!(!is_fast_context(&sig(&["rsi"])));
    }

    // ---- bar guard ---------------------------------------------------------

    #[test]
    fn bar_guard_blocks_same_sig_same_bar() {
        let guard = BarGuard::new();
        let s = sig(&["rsi", "slot0"]);
        assert!(guard.allows("BTCUSDT", "1m", Side::Buy, 100, &s));
        guard.commit("BTCUSDT", "1m", Side::Buy, 100, &s);
        assert!(!guard.allows("BTCUSDT", "1m", Side::Buy, 100, &s));
        // Different signature on the same bar is fine.
        assert!(guard.allows("BTCUSDT", "1m", Side::Buy, 100, &sig(&["macd", "slot0"])));
        // Next bar clears the set.
        assert!(guard.allows("BTCUSDT", "1m", Side::Buy, 101, &s));
    }

    #[test]
    fn bar_guard_keys_are_independent() {
        let guard = BarGuard::new();
        let s = sig(&["rsi", "slot0"]);
        guard.commit("BTCUSDT", "1m", Side::Buy, 100, &s);
        assert!(guard.allows("BTCUSDT", "1m", Side::Sell, 100, &s));
        assert!(guard.allows("BTCUSDT", "5m", Side::Buy, 100, &s));
        assert!(guard.allows("ETHUSDT", "1m", Side::Buy, 100, &s));
    }

    // ---- symbol guard ------------------------------------------------------

    #[test]
    fn pending_coalesces_identical_attempts() {
        let guard = SymbolGuard::new(false);
        let s = sig(&["rsi", "slot0"]);
        guard.begin("BTCUSDT", Side::Buy, &s, 45.0, false).unwrap();
        let err = guard
            .begin("BTCUSDT", Side::Buy, &s, 45.0, false)
            .unwrap_err();
        assert_eq!(err, Refusal::PendingAttempt);
        // Abort frees the slot.
        guard.abort("BTCUSDT", Side::Buy, &s);
        guard.begin("BTCUSDT", Side::Buy, &s, 45.0, false).unwrap();
    }

    #[test]
    fn signature_guard_refuses_within_window() {
        let guard = SymbolGuard::new(false);
        let s = sig(&["rsi", "slot0"]);
        guard.begin("BTCUSDT", Side::Buy, &s, 45.0, false).unwrap();
        guard.commit("BTCUSDT", Side::Buy, &s);
        match guard.begin("BTCUSDT", Side::Buy, &s, 45.0, false) {
            Err(Refusal::SignatureGuard { remaining }) => {
                assert!(remaining > 0.0 && remaining <= 45.0);
            }
            other => panic!("expected signature guard, got {other:?}"),
        }
    }

    #[test]
    fn override_bypasses_signature_guard() {
        let guard = SymbolGuard::new(false);
        let s = sig(&["rsi", "slot0"]);
        guard.begin("BTCUSDT", Side::Buy, &s, 45.0, false).unwrap();
        guard.commit("BTCUSDT", Side::Buy, &s);
        guard.begin("BTCUSDT", Side::Buy, &s, 45.0, true).unwrap();
        assert!(guard.is_pending("BTCUSDT", Side::Buy, &s));
    }

    #[test]
    fn recent_order_without_signature_still_guards() {
        let guard = SymbolGuard::new(false);
        let s1 = sig(&["rsi", "slot0"]);
        guard.begin("BTCUSDT", Side::Buy, &s1, 45.0, false).unwrap();
        // Failure: clears pending, stamps last, keeps signatures empty.
        guard.fail("BTCUSDT", Side::Buy, &s1);
        let s2 = sig(&["macd", "slot0"]);
        let err = guard
            .begin("BTCUSDT", Side::Buy, &s2, 45.0, false)
            .unwrap_err();
        assert!(matches!(err, Refusal::SignatureGuard { .. }));
    }

    #[test]
    fn mark_leg_closed_clears_state() {
        let guard = SymbolGuard::new(false);
        let s = sig(&["rsi", "slot0"]);
        guard.begin("BTCUSDT", Side::Buy, &s, 45.0, false).unwrap();
        guard.commit("BTCUSDT", Side::Buy, &s);
        guard.mark_leg_closed("BTCUSDT", Side::Buy);
        // Signature cleared; only the bare last-order window could refuse,
        // and it refuses because signatures are now empty and last is fresh.
        let res = guard.begin("BTCUSDT", Side::Buy, &s, 45.0, false);
        assert!(matches!(res, Err(Refusal::SignatureGuard { .. })));
    }

    #[test]
    fn sides_do_not_interfere() {
        let guard = SymbolGuard::new(false);
        let s = sig(&["rsi", "slot0"]);
        guard.begin("BTCUSDT", Side::Buy, &s, 45.0, false).unwrap();
        guard.begin("BTCUSDT", Side::Sell, &s, 45.0, false).unwrap();
    }
}
