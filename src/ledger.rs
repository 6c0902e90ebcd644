// =============================================================================
// Leg Ledger — in-memory ownership of every open entry
// =============================================================================
//
// The ledger is the single owner of open-exposure state. Two denormalized
// indexes are rebuilt atomically with it under the same mutex:
//
//   TradeBook   (symbol, interval, indicator, side) -> ledger_id -> slice
//               The source of truth for "does indicator X own a leg here?".
//   LedgerIndex ledger_id -> LegKey, for O(1) lookups during scoped closes.
//
// IndicatorMemory (cooldown timestamps, confirmation streaks) lives under the
// same lock because append/remove must update it in the same critical
// section. No references point back; everything is keyed.
//
// Entries are only created on an exchange ack and only destroyed on a close
// ack or a reconciliation that observed a flat position. All mutations are
// total-ordered by the ledger mutex; nothing here suspends.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::exchange::flat_epsilon;
use crate::journal::TradeJournal;
use crate::types::{epoch_secs, Side};

/// Identity of a leg: all exposure for one (symbol, interval, side).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LegKey {
    pub symbol: String,
    pub interval: String,
    pub side: Side,
}

impl LegKey {
    pub fn new(symbol: &str, interval: &str, side: Side) -> Self {
        Self {
            symbol: symbol.to_ascii_uppercase(),
            interval: interval.to_string(),
            side,
        }
    }
}

impl std::fmt::Display for LegKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}/{}", self.symbol, self.interval, self.side)
    }
}

/// A single contributory position inside a leg, provenance-tagged by the
/// indicator signature that triggered it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub ledger_id: String,
    pub qty: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub margin_usdt: f64,
    /// Sorted lowercase indicator tokens plus a `slotN` suffix.
    pub trigger_signature: Vec<String>,
    /// Canonical indicator identities responsible for this entry.
    pub indicator_keys: Vec<String>,
    pub timestamp: f64,
    #[serde(default)]
    pub fees_usdt: Option<f64>,
    #[serde(default)]
    pub entry_realized_usdt: Option<f64>,
}

impl Entry {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Signature without slot suffixes, for duplicate comparison.
    pub fn signature_without_slots(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self
            .trigger_signature
            .iter()
            .filter(|t| !t.starts_with("slot"))
            .cloned()
            .collect();
        tokens.sort();
        tokens
    }
}

/// Aggregated view of one leg.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Leg {
    pub qty_total: f64,
    pub entry_price_vwap: f64,
    pub margin_total: f64,
    pub entries: Vec<Entry>,
    pub last_update: f64,
}

impl Leg {
    fn rebuild_totals(&mut self) {
        self.qty_total = self.entries.iter().map(|e| e.qty).sum();
        self.margin_total = self.entries.iter().map(|e| e.margin_usdt).sum();
        self.entry_price_vwap = if self.qty_total > 0.0 {
            self.entries
                .iter()
                .map(|e| e.qty * e.entry_price)
                .sum::<f64>()
                / self.qty_total
        } else {
            0.0
        };
        self.last_update = epoch_secs();
    }
}

/// One TradeBook slice: the portion of an entry owned by an indicator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSlice {
    pub qty: f64,
    pub timestamp: f64,
    pub entry_price: f64,
    pub margin_usdt: f64,
}

type BookKey = (String, String, String, Side);

/// An opposite-side conflict discovered while appending an entry. The flip
/// resolver consumes these and performs the actual closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRef {
    pub indicator: String,
    pub leg_key: LegKey,
    pub ledger_ids: Vec<String>,
}

/// Per-indicator streak used for N-bar confirmation.
#[derive(Debug, Clone, Copy)]
struct SignalStreak {
    side: Side,
    count: u32,
    started_at: f64,
}

#[derive(Default)]
struct LedgerInner {
    legs: HashMap<LegKey, Leg>,
    trade_book: HashMap<BookKey, HashMap<String, BookSlice>>,
    index: HashMap<String, LegKey>,
    /// (symbol, interval, indicator) -> last action side + timestamp.
    last_action: HashMap<(String, String, String), (Side, f64)>,
    signal_streaks: HashMap<(String, String, String), SignalStreak>,
}

/// The ledger service. All public operations are atomic under one mutex;
/// journal lines are written inside the same critical section so the
/// on-disk order matches the mutation order.
pub struct LegLedger {
    inner: Mutex<LedgerInner>,
    journal: Option<Arc<TradeJournal>>,
}

impl LegLedger {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
            journal: None,
        }
    }

    pub fn with_journal(journal: Arc<TradeJournal>) -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
            journal: Some(journal),
        }
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Insert an entry into its leg, rebuild totals and indexes, stamp the
    /// indicator cooldown memory, and report any opposite-side conflicts for
    /// the entry's indicators (same symbol + interval).
    pub fn append_entry(&self, leg_key: &LegKey, entry: Entry) -> Result<Vec<ConflictRef>, String> {
        if entry.qty <= 0.0 {
            return Err(format!("entry qty must be > 0, got {}", entry.qty));
        }
        let mut inner = self.inner.lock();
        let now = epoch_secs();

        if inner.index.contains_key(&entry.ledger_id) {
            return Err(format!("duplicate ledger id {}", entry.ledger_id));
        }

        for indicator in &entry.indicator_keys {
            let book_key = (
                leg_key.symbol.clone(),
                leg_key.interval.clone(),
                indicator.clone(),
                leg_key.side,
            );
            inner.trade_book.entry(book_key).or_default().insert(
                entry.ledger_id.clone(),
                BookSlice {
                    qty: entry.qty,
                    timestamp: entry.timestamp,
                    entry_price: entry.entry_price,
                    margin_usdt: entry.margin_usdt,
                },
            );
            inner.last_action.insert(
                (
                    leg_key.symbol.clone(),
                    leg_key.interval.clone(),
                    indicator.clone(),
                ),
                (leg_key.side, now),
            );
        }
        inner.index.insert(entry.ledger_id.clone(), leg_key.clone());

        let conflicts = Self::find_conflicts(&inner, leg_key, &entry.indicator_keys);

        if let Some(journal) = &self.journal {
            journal.record_open(leg_key, &entry);
        }

        let leg = inner.legs.entry(leg_key.clone()).or_default();
        info!(
            leg = %leg_key,
            ledger_id = %entry.ledger_id,
            qty = entry.qty,
            entry_price = entry.entry_price,
            margin_usdt = entry.margin_usdt,
            signature = ?entry.trigger_signature,
            "ledger entry appended"
        );
        leg.entries.push(entry);
        leg.rebuild_totals();

        Ok(conflicts)
    }

    fn find_conflicts(
        inner: &LedgerInner,
        leg_key: &LegKey,
        indicators: &[String],
    ) -> Vec<ConflictRef> {
        let opposite = leg_key.side.opposite();
        let mut out = Vec::new();
        for indicator in indicators {
            let book_key = (
                leg_key.symbol.clone(),
                leg_key.interval.clone(),
                indicator.clone(),
                opposite,
            );
            if let Some(slices) = inner.trade_book.get(&book_key) {
                if !slices.is_empty() {
                    out.push(ConflictRef {
                        indicator: indicator.clone(),
                        leg_key: LegKey {
                            symbol: leg_key.symbol.clone(),
                            interval: leg_key.interval.clone(),
                            side: opposite,
                        },
                        ledger_ids: slices.keys().cloned().collect(),
                    });
                }
            }
        }
        out
    }

    /// Remove one entry (or the whole leg when `ledger_id` is `None`).
    /// Returns the removed entries; the leg is dropped when it empties.
    pub fn remove_entry(&self, leg_key: &LegKey, ledger_id: Option<&str>) -> Vec<Entry> {
        let mut inner = self.inner.lock();
        let removed: Vec<Entry> = match inner.legs.get_mut(leg_key) {
            Some(leg) => match ledger_id {
                Some(id) => {
                    let pos = leg.entries.iter().position(|e| e.ledger_id == id);
                    match pos {
                        Some(i) => vec![leg.entries.remove(i)],
                        None => Vec::new(),
                    }
                }
                None => std::mem::take(&mut leg.entries),
            },
            None => Vec::new(),
        };

        for entry in &removed {
            Self::unindex_entry(&mut inner, leg_key, entry);
            if let Some(journal) = &self.journal {
                journal.record_close(leg_key, &entry.ledger_id, entry.qty, "entry_removed");
            }
        }

        let drop_leg = inner
            .legs
            .get_mut(leg_key)
            .map(|leg| {
                leg.rebuild_totals();
                leg.entries.is_empty()
            })
            .unwrap_or(false);
        if drop_leg {
            inner.legs.remove(leg_key);
            debug!(leg = %leg_key, "leg emptied and dropped");
        }
        removed
    }

    fn unindex_entry(inner: &mut LedgerInner, leg_key: &LegKey, entry: &Entry) {
        inner.index.remove(&entry.ledger_id);
        for indicator in &entry.indicator_keys {
            let book_key = (
                leg_key.symbol.clone(),
                leg_key.interval.clone(),
                indicator.clone(),
                leg_key.side,
            );
            if let Some(slices) = inner.trade_book.get_mut(&book_key) {
                slices.remove(&entry.ledger_id);
                if slices.is_empty() {
                    inner.trade_book.remove(&book_key);
                }
            }
        }
    }

    /// Scale one entry's qty-proportional fields from `prev_qty` down to
    /// `remaining_qty` after a partial close.
    pub fn decrement_entry_qty(
        &self,
        leg_key: &LegKey,
        ledger_id: &str,
        prev_qty: f64,
        remaining_qty: f64,
    ) {
        if prev_qty <= 0.0 {
            return;
        }
        let factor = (remaining_qty / prev_qty).max(0.0);
        let mut inner = self.inner.lock();
        let mut scaled = None;
        if let Some(leg) = inner.legs.get_mut(leg_key) {
            if let Some(entry) = leg.entries.iter_mut().find(|e| e.ledger_id == ledger_id) {
                entry.qty = remaining_qty;
                entry.margin_usdt *= factor;
                if let Some(fees) = entry.fees_usdt.as_mut() {
                    *fees *= factor;
                }
                scaled = Some((entry.qty, entry.margin_usdt, entry.timestamp, entry.entry_price));
            }
            leg.rebuild_totals();
        }
        if let Some((qty, margin, ts, entry_price)) = scaled {
            if let Some(journal) = &self.journal {
                journal.record_close(leg_key, ledger_id, prev_qty - remaining_qty, "entry_reduced");
            }
            // Mirror the new slice size into the TradeBook.
            let keys: Vec<BookKey> = inner
                .trade_book
                .keys()
                .filter(|(sym, iv, _, side)| {
                    *sym == leg_key.symbol && *iv == leg_key.interval && *side == leg_key.side
                })
                .cloned()
                .collect();
            for key in keys {
                if let Some(slices) = inner.trade_book.get_mut(&key) {
                    if let Some(slice) = slices.get_mut(ledger_id) {
                        *slice = BookSlice {
                            qty,
                            timestamp: ts,
                            entry_price,
                            margin_usdt: margin,
                        };
                    }
                }
            }
        }
    }

    /// Proportionally rescale every entry of a leg so totals match the
    /// exchange-reported quantity.
    pub fn sync_leg_totals(&self, leg_key: &LegKey, actual_qty: f64) {
        let mut inner = self.inner.lock();
        let leg = match inner.legs.get_mut(leg_key) {
            Some(l) if l.qty_total > 0.0 => l,
            _ => return,
        };
        if actual_qty <= 0.0 {
            return;
        }
        let factor = actual_qty / leg.qty_total;
        if (factor - 1.0).abs() < 1e-9 {
            return;
        }
        warn!(
            leg = %leg_key,
            ledger_qty = leg.qty_total,
            exchange_qty = actual_qty,
            "rescaling ledger leg to exchange-reported quantity"
        );
        let updates: Vec<(String, f64, f64, f64, f64)> = leg
            .entries
            .iter_mut()
            .map(|entry| {
                entry.qty *= factor;
                entry.margin_usdt *= factor;
                (
                    entry.ledger_id.clone(),
                    entry.qty,
                    entry.margin_usdt,
                    entry.timestamp,
                    entry.entry_price,
                )
            })
            .collect();
        leg.rebuild_totals();

        for (ledger_id, qty, margin, ts, entry_price) in updates {
            let keys: Vec<BookKey> = inner
                .trade_book
                .keys()
                .filter(|(sym, iv, _, side)| {
                    *sym == leg_key.symbol && *iv == leg_key.interval && *side == leg_key.side
                })
                .cloned()
                .collect();
            for key in keys {
                if let Some(slices) = inner.trade_book.get_mut(&key) {
                    if let Some(slice) = slices.get_mut(&ledger_id) {
                        *slice = BookSlice {
                            qty,
                            timestamp: ts,
                            entry_price,
                            margin_usdt: margin,
                        };
                    }
                }
            }
        }
    }

    /// Apply a confirmed close of `executed_qty` against one entry: remove it
    /// when (almost) fully closed, otherwise scale it down proportionally.
    pub fn apply_close(&self, leg_key: &LegKey, ledger_id: &str, executed_qty: f64) {
        let prev_qty = {
            let inner = self.inner.lock();
            inner
                .legs
                .get(leg_key)
                .and_then(|l| l.entries.iter().find(|e| e.ledger_id == ledger_id))
                .map(|e| e.qty)
        };
        let prev_qty = match prev_qty {
            Some(q) => q,
            None => return,
        };
        let remaining = prev_qty - executed_qty;
        if remaining <= flat_epsilon(prev_qty) {
            self.remove_entry(leg_key, Some(ledger_id));
        } else {
            self.decrement_entry_qty(leg_key, ledger_id, prev_qty, remaining);
        }
    }

    /// Drop a leg wholesale (reconciliation observed a flat position).
    pub fn drop_leg(&self, leg_key: &LegKey) -> Vec<Entry> {
        self.remove_entry(leg_key, None)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn leg(&self, leg_key: &LegKey) -> Option<Leg> {
        self.inner.lock().legs.get(leg_key).cloned()
    }

    pub fn entries_for(&self, leg_key: &LegKey) -> Vec<Entry> {
        self.inner
            .lock()
            .legs
            .get(leg_key)
            .map(|l| l.entries.clone())
            .unwrap_or_default()
    }

    pub fn leg_key_of(&self, ledger_id: &str) -> Option<LegKey> {
        self.inner.lock().index.get(ledger_id).cloned()
    }

    pub fn has_open(&self, symbol: &str, interval: &str, indicator: &str, side: Side) -> bool {
        let inner = self.inner.lock();
        inner
            .trade_book
            .get(&(
                symbol.to_string(),
                interval.to_string(),
                indicator.to_string(),
                side,
            ))
            .map(|slices| !slices.is_empty())
            .unwrap_or(false)
    }

    pub fn ledger_ids(
        &self,
        symbol: &str,
        interval: &str,
        indicator: &str,
        side: Side,
    ) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .trade_book
            .get(&(
                symbol.to_string(),
                interval.to_string(),
                indicator.to_string(),
                side,
            ))
            .map(|slices| slices.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn open_qty(&self, symbol: &str, interval: &str, indicator: &str, side: Side) -> f64 {
        let inner = self.inner.lock();
        inner
            .trade_book
            .get(&(
                symbol.to_string(),
                interval.to_string(),
                indicator.to_string(),
                side,
            ))
            .map(|slices| slices.values().map(|s| s.qty).sum())
            .unwrap_or(0.0)
    }

    /// Total quantity owned by an indicator on one side of a symbol, across
    /// intervals.
    pub fn total_qty_for_indicator(&self, symbol: &str, indicator: &str, side: Side) -> f64 {
        let inner = self.inner.lock();
        inner
            .trade_book
            .iter()
            .filter(|((sym, _, ind, s), _)| sym == symbol && ind == indicator && *s == side)
            .map(|(_, slices)| slices.values().map(|s| s.qty).sum::<f64>())
            .sum()
    }

    /// Every (leg key, entry) on one side of a symbol, across intervals.
    pub fn entries_on_side(&self, symbol: &str, side: Side) -> Vec<(LegKey, Entry)> {
        let inner = self.inner.lock();
        inner
            .legs
            .iter()
            .filter(|(key, _)| key.symbol == symbol && key.side == side)
            .flat_map(|(key, leg)| leg.entries.iter().map(move |e| (key.clone(), e.clone())))
            .collect()
    }

    /// All legs holding non-zero quantity, optionally filtered by symbol.
    pub fn legs_with_qty(&self, symbol: Option<&str>) -> Vec<(LegKey, f64)> {
        let inner = self.inner.lock();
        inner
            .legs
            .iter()
            .filter(|(key, leg)| {
                leg.qty_total > 0.0 && symbol.map(|s| key.symbol == s).unwrap_or(true)
            })
            .map(|(key, leg)| (key.clone(), leg.qty_total))
            .collect()
    }

    /// Sum of margin across all legs (equity reconstruction input).
    pub fn total_margin(&self) -> f64 {
        self.inner
            .lock()
            .legs
            .values()
            .map(|l| l.margin_total)
            .sum()
    }

    // -------------------------------------------------------------------------
    // Indicator memory
    // -------------------------------------------------------------------------

    pub fn last_action(&self, symbol: &str, interval: &str, indicator: &str) -> Option<(Side, f64)> {
        self.inner
            .lock()
            .last_action
            .get(&(
                symbol.to_string(),
                interval.to_string(),
                indicator.to_string(),
            ))
            .copied()
    }

    /// Record a raw same-direction signal and return the current streak
    /// count. The streak resets on direction change or window expiry.
    pub fn record_signal(
        &self,
        symbol: &str,
        interval: &str,
        indicator: &str,
        side: Side,
        reset_window: f64,
    ) -> u32 {
        let mut inner = self.inner.lock();
        let key = (
            symbol.to_string(),
            interval.to_string(),
            indicator.to_string(),
        );
        let now = epoch_secs();
        let streak = inner
            .signal_streaks
            .entry(key)
            .and_modify(|s| {
                if s.side != side || now - s.started_at > reset_window {
                    *s = SignalStreak {
                        side,
                        count: 1,
                        started_at: now,
                    };
                } else {
                    s.count += 1;
                }
            })
            .or_insert(SignalStreak {
                side,
                count: 1,
                started_at: now,
            });
        streak.count
    }

    /// Forget a streak after it fires.
    pub fn clear_signal(&self, symbol: &str, interval: &str, indicator: &str) {
        self.inner.lock().signal_streaks.remove(&(
            symbol.to_string(),
            interval.to_string(),
            indicator.to_string(),
        ));
    }

    // -------------------------------------------------------------------------
    // Consistency
    // -------------------------------------------------------------------------

    /// Verify the structural invariants: leg totals match entry sums, every
    /// index row points at a leg containing its entry, and every TradeBook
    /// quantity agrees with the owning entries.
    pub fn check_invariants(&self) -> Result<(), String> {
        let inner = self.inner.lock();

        for (key, leg) in &inner.legs {
            let qty_sum: f64 = leg.entries.iter().map(|e| e.qty).sum();
            if (leg.qty_total - qty_sum).abs() > 1e-9 {
                return Err(format!("{key}: qty_total {} != sum {qty_sum}", leg.qty_total));
            }
            let margin_sum: f64 = leg.entries.iter().map(|e| e.margin_usdt).sum();
            if (leg.margin_total - margin_sum).abs() > 1e-9 {
                return Err(format!(
                    "{key}: margin_total {} != sum {margin_sum}",
                    leg.margin_total
                ));
            }
        }

        for (ledger_id, key) in &inner.index {
            let present = inner
                .legs
                .get(key)
                .map(|l| l.entries.iter().any(|e| &e.ledger_id == ledger_id))
                .unwrap_or(false);
            if !present {
                return Err(format!("index row {ledger_id} -> {key} has no entry"));
            }
        }

        for ((sym, iv, ind, side), slices) in &inner.trade_book {
            let book_qty: f64 = slices.values().map(|s| s.qty).sum();
            let leg_key = LegKey::new(sym, iv, *side);
            let owned: f64 = inner
                .legs
                .get(&leg_key)
                .map(|l| {
                    l.entries
                        .iter()
                        .filter(|e| e.indicator_keys.iter().any(|k| k == ind))
                        .map(|e| e.qty)
                        .sum()
                })
                .unwrap_or(0.0);
            if (book_qty - owned).abs() > 1e-9 {
                return Err(format!(
                    "trade book {sym}/{iv}/{ind}/{side:?}: {book_qty} != owned {owned}"
                ));
            }
        }
        Ok(())
    }

    /// Deep snapshot of all legs (UI export; copied under the lock).
    pub fn snapshot(&self) -> HashMap<LegKey, Leg> {
        self.inner.lock().legs.clone()
    }

    /// Symbols with any open leg.
    pub fn active_symbols(&self) -> HashSet<String> {
        self.inner
            .lock()
            .legs
            .keys()
            .map(|k| k.symbol.clone())
            .collect()
    }
}

impl Default for LegLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LegLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LegLedger")
            .field("legs", &inner.legs.len())
            .field("entries", &inner.index.len())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, qty: f64, price: f64, margin: f64, indicators: &[&str]) -> Entry {
        let mut signature: Vec<String> = indicators.iter().map(|s| s.to_string()).collect();
        signature.sort();
        signature.push("slot0".to_string());
        Entry {
            ledger_id: id.to_string(),
            qty,
            entry_price: price,
            leverage: 5,
            margin_usdt: margin,
            trigger_signature: signature,
            indicator_keys: indicators.iter().map(|s| s.to_string()).collect(),
            timestamp: epoch_secs(),
            fees_usdt: None,
            entry_realized_usdt: None,
        }
    }

    fn buy_key() -> LegKey {
        LegKey::new("BTCUSDT", "1m", Side::Buy)
    }

    fn sell_key() -> LegKey {
        LegKey::new("BTCUSDT", "1m", Side::Sell)
    }

    #[test]
    fn append_builds_totals_and_vwap() {
        let ledger = LegLedger::new();
        ledger
            .append_entry(&buy_key(), entry("a", 0.005, 20_000.0, 20.0, &["rsi"]))
            .unwrap();
        ledger
            .append_entry(&buy_key(), entry("b", 0.005, 21_000.0, 21.0, &["rsi"]))
            .unwrap();

        let leg = ledger.leg(&buy_key()).unwrap();
        assert!((leg.qty_total - 0.010).abs() < 1e-12);
        assert!((leg.margin_total - 41.0).abs() < 1e-12);
        assert!((leg.entry_price_vwap - 20_500.0).abs() < 1e-9);
        ledger.check_invariants().unwrap();
    }

    #[test]
    fn append_rejects_bad_qty_and_duplicate_ids() {
        let ledger = LegLedger::new();
        assert!(ledger
            .append_entry(&buy_key(), entry("a", 0.0, 20_000.0, 20.0, &["rsi"]))
            .is_err());
        ledger
            .append_entry(&buy_key(), entry("a", 0.005, 20_000.0, 20.0, &["rsi"]))
            .unwrap();
        assert!(ledger
            .append_entry(&buy_key(), entry("a", 0.005, 20_000.0, 20.0, &["rsi"]))
            .is_err());
    }

    #[test]
    fn append_then_remove_restores_pre_state() {
        let ledger = LegLedger::new();
        ledger
            .append_entry(&buy_key(), entry("a", 0.005, 20_000.0, 20.0, &["rsi"]))
            .unwrap();
        let removed = ledger.remove_entry(&buy_key(), Some("a"));
        assert_eq!(removed.len(), 1);
        assert!(ledger.leg(&buy_key()).is_none());
        assert!(!ledger.has_open("BTCUSDT", "1m", "rsi", Side::Buy));
        assert!(ledger.leg_key_of("a").is_none());
        ledger.check_invariants().unwrap();
    }

    #[test]
    fn conflicts_reported_for_opposite_indicator_legs() {
        let ledger = LegLedger::new();
        ledger
            .append_entry(&sell_key(), entry("s1", 0.004, 20_500.0, 16.0, &["rsi"]))
            .unwrap();
        let conflicts = ledger
            .append_entry(&buy_key(), entry("b1", 0.005, 20_000.0, 20.0, &["rsi", "macd"]))
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].indicator, "rsi");
        assert_eq!(conflicts[0].leg_key, sell_key());
        assert_eq!(conflicts[0].ledger_ids, vec!["s1".to_string()]);
    }

    #[test]
    fn no_conflict_for_unrelated_indicator() {
        let ledger = LegLedger::new();
        ledger
            .append_entry(&sell_key(), entry("s1", 0.004, 20_500.0, 16.0, &["macd"]))
            .unwrap();
        let conflicts = ledger
            .append_entry(&buy_key(), entry("b1", 0.005, 20_000.0, 20.0, &["rsi"]))
            .unwrap();
        assert!(conflicts.is_empty());
    }

    #[test]
    fn decrement_scales_proportional_fields() {
        let ledger = LegLedger::new();
        ledger
            .append_entry(&buy_key(), entry("a", 0.010, 20_000.0, 40.0, &["rsi"]))
            .unwrap();
        ledger.decrement_entry_qty(&buy_key(), "a", 0.010, 0.004);

        let leg = ledger.leg(&buy_key()).unwrap();
        assert!((leg.qty_total - 0.004).abs() < 1e-12);
        assert!((leg.margin_total - 16.0).abs() < 1e-9);
        assert!((ledger.open_qty("BTCUSDT", "1m", "rsi", Side::Buy) - 0.004).abs() < 1e-12);
        ledger.check_invariants().unwrap();
    }

    #[test]
    fn sync_rescales_all_entries() {
        let ledger = LegLedger::new();
        ledger
            .append_entry(&buy_key(), entry("a", 0.006, 20_000.0, 24.0, &["rsi"]))
            .unwrap();
        ledger
            .append_entry(&buy_key(), entry("b", 0.004, 20_000.0, 16.0, &["macd"]))
            .unwrap();
        ledger.sync_leg_totals(&buy_key(), 0.005);

        let leg = ledger.leg(&buy_key()).unwrap();
        assert!((leg.qty_total - 0.005).abs() < 1e-12);
        // Entries scaled by 0.5 each.
        assert!((leg.entries[0].qty - 0.003).abs() < 1e-12);
        assert!((leg.entries[1].qty - 0.002).abs() < 1e-12);
        assert!((leg.margin_total - 20.0).abs() < 1e-9);
        ledger.check_invariants().unwrap();
    }

    #[test]
    fn apply_close_removes_when_flat() {
        let ledger = LegLedger::new();
        ledger
            .append_entry(&buy_key(), entry("a", 0.005, 20_000.0, 20.0, &["rsi"]))
            .unwrap();
        ledger.apply_close(&buy_key(), "a", 0.005);
        assert!(ledger.leg(&buy_key()).is_none());
    }

    #[test]
    fn apply_close_decrements_partial() {
        let ledger = LegLedger::new();
        ledger
            .append_entry(&buy_key(), entry("a", 0.010, 20_000.0, 40.0, &["rsi"]))
            .unwrap();
        ledger.apply_close(&buy_key(), "a", 0.006);
        let leg = ledger.leg(&buy_key()).unwrap();
        assert!((leg.qty_total - 0.004).abs() < 1e-12);
        assert!((leg.margin_total - 16.0).abs() < 1e-9);
        ledger.check_invariants().unwrap();
    }

    #[test]
    fn trade_book_projection_matches_open_qty() {
        let ledger = LegLedger::new();
        ledger
            .append_entry(&buy_key(), entry("a", 0.003, 20_000.0, 12.0, &["rsi"]))
            .unwrap();
        ledger
            .append_entry(&buy_key(), entry("b", 0.002, 20_000.0, 8.0, &["rsi"]))
            .unwrap();
        assert!((ledger.open_qty("BTCUSDT", "1m", "rsi", Side::Buy) - 0.005).abs() < 1e-12);
        assert_eq!(
            ledger.ledger_ids("BTCUSDT", "1m", "rsi", Side::Buy).len(),
            2
        );
        assert!(
            (ledger.total_qty_for_indicator("BTCUSDT", "rsi", Side::Buy) - 0.005).abs() < 1e-12
        );
    }

    #[test]
    fn signal_streak_resets_on_side_change() {
        let ledger = LegLedger::new();
        assert_eq!(
            ledger.record_signal("BTCUSDT", "1m", "rsi", Side::Buy, 120.0),
            1
        );
        assert_eq!(
            ledger.record_signal("BTCUSDT", "1m", "rsi", Side::Buy, 120.0),
            2
        );
        assert_eq!(
            ledger.record_signal("BTCUSDT", "1m", "rsi", Side::Sell, 120.0),
            1
        );
        ledger.clear_signal("BTCUSDT", "1m", "rsi");
        assert_eq!(
            ledger.record_signal("BTCUSDT", "1m", "rsi", Side::Sell, 120.0),
            1
        );
    }

    #[test]
    fn last_action_recorded_on_append() {
        let ledger = LegLedger::new();
        assert!(ledger.last_action("BTCUSDT", "1m", "rsi").is_none());
        ledger
            .append_entry(&buy_key(), entry("a", 0.005, 20_000.0, 20.0, &["rsi"]))
            .unwrap();
        let (side, ts) = ledger.last_action("BTCUSDT", "1m", "rsi").unwrap();
        assert_eq!(side, Side::Buy);
        assert!(ts > 0.0);
    }

    #[test]
    fn entries_on_side_spans_intervals() {
        let ledger = LegLedger::new();
        ledger
            .append_entry(&buy_key(), entry("a", 0.005, 20_000.0, 20.0, &["rsi"]))
            .unwrap();
        let key_5m = LegKey::new("BTCUSDT", "5m", Side::Buy);
        ledger
            .append_entry(&key_5m, entry("b", 0.002, 20_000.0, 8.0, &["rsi"]))
            .unwrap();
        let rows = ledger.entries_on_side("BTCUSDT", Side::Buy);
        assert_eq!(rows.len(), 2);
        assert!((ledger.total_margin() - 28.0).abs() < 1e-9);
    }
}
