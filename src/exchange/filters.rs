// =============================================================================
// Symbol Filters — tick/step/minQty/minNotional registry with exact snapping
// =============================================================================
//
// All snapping arithmetic runs on `Decimal` so that submitted quantities and
// prices are exact multiples of the exchange's step and tick sizes. Floats
// only appear at the boundary (indicator math, sizing estimates) and are
// converted once, here.
// =============================================================================

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{info, warn};

/// Absolute ceiling on leverage regardless of bracket data.
const LEVERAGE_HARD_CAP: u32 = 150;

/// Exchange trading constraints for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolFilters {
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
    pub max_leverage: u32,
}

impl Default for SymbolFilters {
    fn default() -> Self {
        Self {
            tick_size: Decimal::new(1, 2),   // 0.01
            step_size: Decimal::new(1, 3),   // 0.001
            min_qty: Decimal::new(1, 3),     // 0.001
            min_notional: Decimal::from(5),  // 5 USDT
            max_leverage: 20,
        }
    }
}

impl SymbolFilters {
    /// Parse the `filters` array of one exchangeInfo symbol entry. Fields the
    /// payload omits keep their defaults.
    pub fn from_exchange_info(symbol_entry: &Value) -> Self {
        let mut out = Self::default();
        let filters = match symbol_entry.get("filters").and_then(Value::as_array) {
            Some(arr) => arr,
            None => return out,
        };
        for f in filters {
            match f.get("filterType").and_then(Value::as_str) {
                Some("LOT_SIZE") | Some("MARKET_LOT_SIZE") => {
                    if let Some(step) = decimal_field(f, "stepSize") {
                        if step > Decimal::ZERO {
                            out.step_size = step;
                        }
                    }
                    if let Some(min_qty) = decimal_field(f, "minQty") {
                        if min_qty > Decimal::ZERO {
                            out.min_qty = min_qty;
                        }
                    }
                }
                Some("PRICE_FILTER") => {
                    if let Some(tick) = decimal_field(f, "tickSize") {
                        if tick > Decimal::ZERO {
                            out.tick_size = tick;
                        }
                    }
                }
                // Futures payloads call the field `notional`, spot `minNotional`.
                Some("MIN_NOTIONAL") | Some("NOTIONAL") => {
                    let notional =
                        decimal_field(f, "notional").or_else(|| decimal_field(f, "minNotional"));
                    if let Some(n) = notional {
                        if n > Decimal::ZERO {
                            out.min_notional = n;
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Fold the highest `initialLeverage` out of a leverageBracket payload.
    pub fn apply_leverage_brackets(&mut self, bracket_entry: &Value) {
        let brackets = bracket_entry
            .get("brackets")
            .and_then(Value::as_array)
            .map(|a| a.as_slice())
            .unwrap_or(&[]);
        let mut max_lev = 0u32;
        for b in brackets {
            if let Some(lev) = b.get("initialLeverage").and_then(Value::as_u64) {
                max_lev = max_lev.max(lev as u32);
            }
        }
        if max_lev > 0 {
            self.max_leverage = max_lev;
        }
    }

    /// Snap `qty` down to the step grid and validate against minQty and
    /// minNotional at `price`. Returns the snapped quantity or a message
    /// describing the violated constraint.
    pub fn snap_order_qty(&self, qty: Decimal, price: Decimal) -> Result<Decimal, String> {
        if price <= Decimal::ZERO {
            return Err("no price available".to_string());
        }
        let snapped = floor_to_step(qty, self.step_size);
        if snapped <= Decimal::ZERO {
            return Err(format!("quantity {qty} below step {}", self.step_size));
        }
        if snapped < self.min_qty {
            return Err(format!("quantity {snapped} below minQty {}", self.min_qty));
        }
        if snapped * price < self.min_notional {
            return Err(format!(
                "notional {} below minNotional {}",
                snapped * price,
                self.min_notional
            ));
        }
        Ok(snapped)
    }

    /// Smallest legal order quantity at `price`: max(minQty, minNotional
    /// rounded *up* to the step grid).
    pub fn min_legal_qty(&self, price: Decimal) -> Decimal {
        if price <= Decimal::ZERO {
            return self.min_qty;
        }
        let by_notional = ceil_to_step(self.min_notional / price, self.step_size);
        self.min_qty.max(by_notional)
    }
}

fn decimal_field(value: &Value, key: &str) -> Option<Decimal> {
    match value.get(key) {
        Some(Value::String(s)) => Decimal::from_str(s).ok(),
        Some(Value::Number(n)) => n.as_f64().and_then(Decimal::from_f64),
        _ => None,
    }
}

// =============================================================================
// Snapping helpers
// =============================================================================

pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}

pub fn ceil_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).ceil() * step
}

pub fn round_to_tick(value: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return value;
    }
    (value / tick).round() * tick
}

/// Lossy f64 -> Decimal for values that originated as floats (prices from
/// indicator math). Order quantities should be built from Decimal directly.
pub fn decimal_from_f64(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

/// Render a quantity for the wire without trailing zeros.
pub fn format_qty(qty: Decimal) -> String {
    qty.normalize().to_string()
}

// =============================================================================
// Registry
// =============================================================================

/// Memoized per-symbol filters. The adapter populates entries the first time
/// a symbol is touched; lookups afterwards are lock-cheap.
pub struct FilterRegistry {
    filters: RwLock<HashMap<String, SymbolFilters>>,
    clamp_logged: RwLock<HashSet<String>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self {
            filters: RwLock::new(HashMap::new()),
            clamp_logged: RwLock::new(HashSet::new()),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<SymbolFilters> {
        self.filters.read().get(symbol).cloned()
    }

    pub fn insert(&self, symbol: &str, filters: SymbolFilters) {
        self.filters.write().insert(symbol.to_string(), filters);
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.filters.read().contains_key(symbol)
    }

    /// Clamp a requested leverage to the symbol's bracket maximum and the
    /// hard cap. Logs once per symbol when the request is reduced.
    pub fn clamp_leverage(&self, symbol: &str, requested: u32) -> u32 {
        let max_lev = self
            .get(symbol)
            .map(|f| f.max_leverage)
            .unwrap_or(LEVERAGE_HARD_CAP);
        let clamped = requested.min(max_lev).min(LEVERAGE_HARD_CAP).max(1);
        if clamped < requested {
            let mut logged = self.clamp_logged.write();
            if logged.insert(symbol.to_string()) {
                info!(
                    symbol,
                    requested,
                    clamped,
                    max_leverage = max_lev,
                    "leverage clamped to symbol maximum"
                );
            }
        }
        clamped
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("symbols", &self.filters.read().len())
            .finish()
    }
}

/// Warn helper used by the adapter when a payload has no usable filters.
pub fn warn_missing_filters(symbol: &str) {
    warn!(symbol, "exchangeInfo carried no usable filters; using defaults");
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn parses_exchange_info_filters() {
        let entry = json!({
            "symbol": "BTCUSDT",
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.10"},
                {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"},
                {"filterType": "MIN_NOTIONAL", "notional": "5"}
            ]
        });
        let f = SymbolFilters::from_exchange_info(&entry);
        assert_eq!(f.tick_size, dec!(0.10));
        assert_eq!(f.step_size, dec!(0.001));
        assert_eq!(f.min_qty, dec!(0.001));
        assert_eq!(f.min_notional, dec!(5));
    }

    #[test]
    fn leverage_brackets_take_max() {
        let mut f = SymbolFilters::default();
        let entry = json!({
            "symbol": "BTCUSDT",
            "brackets": [
                {"bracket": 1, "initialLeverage": 125},
                {"bracket": 2, "initialLeverage": 100}
            ]
        });
        f.apply_leverage_brackets(&entry);
        assert_eq!(f.max_leverage, 125);
    }

    #[test]
    fn floor_and_ceil_snap() {
        assert_eq!(floor_to_step(dec!(0.0056), dec!(0.001)), dec!(0.005));
        assert_eq!(ceil_to_step(dec!(0.0051), dec!(0.001)), dec!(0.006));
        assert_eq!(round_to_tick(dec!(19983.04), dec!(0.10)), dec!(19983.0));
    }

    #[test]
    fn snap_order_qty_scenario() {
        // 1000 USDT * 2% * 5x / 20000 = 0.005 exactly on the step grid.
        let f = SymbolFilters {
            tick_size: dec!(0.10),
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: dec!(5),
            max_leverage: 125,
        };
        let qty = f.snap_order_qty(dec!(0.005), dec!(20000)).unwrap();
        assert_eq!(qty, dec!(0.005));
    }

    #[test]
    fn snap_order_qty_rejects_small_notional() {
        let f = SymbolFilters::default();
        let err = f.snap_order_qty(dec!(0.0001), dec!(20000)).unwrap_err();
        assert!(err.contains("minQty") || err.contains("notional"), "{err}");
    }

    #[test]
    fn min_legal_qty_respects_notional() {
        let f = SymbolFilters {
            tick_size: dec!(0.10),
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: dec!(5),
            max_leverage: 125,
        };
        // 5 / 20000 = 0.00025 -> ceil to 0.001 -> max with minQty = 0.001
        assert_eq!(f.min_legal_qty(dec!(20000)), dec!(0.001));
        // Finer step: 5 / 20000 = 0.00025 exactly on grid.
        let f2 = SymbolFilters {
            step_size: dec!(0.00001),
            min_qty: dec!(0.00001),
            ..f
        };
        assert_eq!(f2.min_legal_qty(dec!(20000)), dec!(0.00025));
    }

    #[test]
    fn clamp_leverage_applies_caps() {
        let reg = FilterRegistry::new();
        reg.insert(
            "BTCUSDT",
            SymbolFilters {
                max_leverage: 125,
                ..SymbolFilters::default()
            },
        );
        assert_eq!(reg.clamp_leverage("BTCUSDT", 200), 125);
        assert_eq!(reg.clamp_leverage("BTCUSDT", 20), 20);
        // Unknown symbol only gets the hard cap.
        assert_eq!(reg.clamp_leverage("ETHUSDT", 400), 150);
    }

    #[test]
    fn format_qty_strips_zeros() {
        assert_eq!(format_qty(dec!(0.00500)), "0.005");
        assert_eq!(format_qty(dec!(12.0)), "12");
    }
}
