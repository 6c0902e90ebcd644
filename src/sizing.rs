// =============================================================================
// Order Sizer — per-indicator margin allocation with slot caps and auto-bump
// =============================================================================
//
// Sizing is budget-driven: each indicator owns "slots" of
// `wallet_total * pct` margin each. An order may add one slot; the total
// margin an indicator holds may not exceed
// `slots_after * per_slot_target * (1 + tolerance)`, and the whole side is
// capped the same way across all of its slots.
//
// When the budget produces a quantity below the exchange minimum the sizer
// may *auto-bump* to the smallest legal quantity, but only while that stays
// within both the available balance and the configured percent ceiling.
//
// All exchange-facing quantities leave here snapped to the step grid as
// `Decimal`; floats are used only for the budget estimates.
// =============================================================================

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

use crate::error::Refusal;
use crate::exchange::filters::{decimal_from_f64, SymbolFilters};
use crate::ledger::{Entry, LegKey};
use crate::types::Side;

/// Everything the sizer needs for one decision.
#[derive(Debug, Clone)]
pub struct SizingInputs<'a> {
    pub symbol: &'a str,
    pub interval: &'a str,
    pub side: Side,
    pub price: f64,
    /// Equity estimate (see `wallet_equity`).
    pub wallet_total: f64,
    pub available: f64,
    /// Allocation per indicator slot, as a fraction.
    pub pct: f64,
    pub leverage: u32,
    pub filters: &'a SymbolFilters,
    /// Fractional slack over the caps (0.05 = 5%).
    pub tolerance: f64,
    pub max_auto_bump_percent: f64,
    pub auto_bump_percent_multiplier: f64,
    /// When flipping, the closed quantity the new side must at least match.
    pub flip_qty_override: Option<f64>,
    /// Canonical indicator identity for slot accounting, when known.
    pub indicator_key: Option<String>,
    /// Slot-less signature of the attempt.
    pub signature: Vec<String>,
    /// Every existing ledger entry on this side of the symbol.
    pub entries_side_all: Vec<(LegKey, Entry)>,
}

/// A sized, filter-snapped order.
#[derive(Debug, Clone)]
pub struct SizingOutcome {
    pub qty: Decimal,
    pub qty_f64: f64,
    pub margin_est: f64,
    /// `slotN` token appended to the order signature.
    pub slot_suffix: String,
    /// Full signature including the slot suffix, sorted.
    pub signature: Vec<String>,
    pub mode: &'static str,
}

/// Equity estimate: the reported wallet, or available + ledger margin when
/// the wallet read lags, whichever is largest.
pub fn wallet_equity(wallet: f64, available: f64, free: f64, ledger_margin: f64) -> f64 {
    let mut equity = wallet.max(0.0);
    equity = equity.max(available.max(0.0) + ledger_margin.max(0.0));
    equity = equity.max(free.max(0.0) + ledger_margin.max(0.0));
    if equity <= 0.0 {
        equity = wallet.max(available).max(free).max(ledger_margin).max(0.0);
    }
    equity
}

/// Slot token for side-wide accounting: one slot per indicator identity (or
/// signature, or bare entry) per interval.
pub fn slot_token(entry: &Entry, leg_key: &LegKey) -> String {
    let base = if let Some(first) = entry.indicator_keys.first() {
        format!("ind:{first}")
    } else {
        let sig = entry.signature_without_slots();
        if !sig.is_empty() {
            format!("sig:{}", sig.join("|"))
        } else {
            format!("id:{}", entry.ledger_id)
        }
    };
    format!("{base}@{}", leg_key.interval.to_ascii_lowercase())
}

/// Produce a concrete quantity for the attempt, or a refusal naming the
/// violated budget.
pub fn size_order(inputs: &SizingInputs<'_>) -> Result<SizingOutcome, Refusal> {
    if inputs.price <= 0.0 {
        return Err(Refusal::Sizing("no market price available".into()));
    }
    let lev = inputs.leverage.max(1) as f64;
    let pct = inputs.pct.clamp(0.0001, 1.0);
    let tolerance = inputs.tolerance.max(0.0);

    let per_slot_margin = inputs.wallet_total * pct;
    if per_slot_margin <= 0.0 {
        return Err(Refusal::Sizing(format!(
            "computed margin target <= 0 for {:.2}% allocation",
            pct * 100.0
        )));
    }

    // --- Which existing entries belong to this indicator/signature? ---------
    let indicator_entries: Vec<&Entry> = if let Some(key) = &inputs.indicator_key {
        inputs
            .entries_side_all
            .iter()
            .filter(|(_, e)| e.indicator_keys.iter().any(|k| k == key))
            .map(|(_, e)| e)
            .collect()
    } else if !inputs.signature.is_empty() {
        let sig = crate::guards::sig_key(&inputs.signature);
        inputs
            .entries_side_all
            .iter()
            .filter(|(_, e)| e.signature_without_slots() == sig)
            .map(|(_, e)| e)
            .collect()
    } else {
        inputs.entries_side_all.iter().map(|(_, e)| e).collect()
    };

    let existing_margin_indicator: f64 = indicator_entries.iter().map(|e| e.margin_usdt).sum();
    let slot_count_existing = indicator_entries.len();
    let desired_slots_after = slot_count_existing + 1;
    let slot_suffix = format!("slot{slot_count_existing}");

    let max_indicator_margin = per_slot_margin * desired_slots_after as f64 * (1.0 + tolerance);
    if existing_margin_indicator >= max_indicator_margin - 1e-9 {
        return Err(Refusal::Sizing(format!(
            "existing {} margin {existing_margin_indicator:.4} USDT already >= cap {max_indicator_margin:.4} USDT",
            inputs.side
        )));
    }

    // --- Target margin for this order ---------------------------------------
    let desired_total_margin = per_slot_margin * desired_slots_after as f64;
    let mut target_margin = (desired_total_margin - existing_margin_indicator).max(0.0);
    let flip_qty = inputs.flip_qty_override.unwrap_or(0.0);
    if flip_qty > 0.0 {
        let flip_margin = flip_qty * inputs.price / lev;
        if flip_margin > target_margin {
            target_margin = flip_margin;
        }
    }
    if target_margin <= 0.0 {
        return Err(Refusal::Sizing(format!(
            "exposure already meets the {:.2}% margin allocation target",
            pct * 100.0
        )));
    }

    if inputs.available <= 0.0 {
        return Err(Refusal::Sizing("no available USDT to allocate".into()));
    }
    if inputs.available < target_margin * 0.95 {
        return Err(Refusal::Sizing(format!(
            "requested {target_margin:.4} USDT but only {:.4} USDT available",
            inputs.available
        )));
    }

    // --- Exchange minimum feasibility ---------------------------------------
    let price_dec = decimal_from_f64(inputs.price);
    let min_required_margin = {
        let by_notional = inputs
            .filters
            .min_notional
            .to_f64()
            .unwrap_or(0.0)
            / lev;
        let by_qty = inputs.filters.min_qty.to_f64().unwrap_or(0.0) * inputs.price / lev;
        by_notional.max(by_qty)
    };
    if min_required_margin > max_indicator_margin + 1e-9 {
        return Err(Refusal::Sizing(format!(
            "minimum contract margin {min_required_margin:.4} exceeds cap {max_indicator_margin:.4} USDT"
        )));
    }

    // --- Raw quantity, snap, auto-bump --------------------------------------
    let qty_target = if flip_qty > 0.0 {
        flip_qty
    } else {
        target_margin * lev / inputs.price
    };

    let mut mode: &'static str = if flip_qty > 0.0 { "flip" } else { "percent" };
    let qty = match inputs
        .filters
        .snap_order_qty(decimal_from_f64(qty_target), price_dec)
    {
        Ok(q) => q,
        Err(reason) => {
            // Below the exchange minimum: consider bumping to the smallest
            // legal quantity.
            let min_qty = inputs.filters.min_legal_qty(price_dec);
            let min_qty_f = min_qty.to_f64().unwrap_or(0.0);
            let required_margin = min_qty_f * inputs.price / lev;
            let required_pct = if inputs.wallet_total > 0.0 {
                required_margin / inputs.wallet_total * 100.0
            } else {
                f64::MAX
            };
            let cap_pct = inputs
                .max_auto_bump_percent
                .max(pct * 100.0 * inputs.auto_bump_percent_multiplier);
            if required_margin <= inputs.available && required_pct <= cap_pct {
                debug!(
                    symbol = inputs.symbol,
                    interval = inputs.interval,
                    required_pct,
                    cap_pct,
                    "auto-bumping order to exchange minimum"
                );
                mode = "percent(bumped_to_min)";
                min_qty
            } else {
                return Err(Refusal::Sizing(format!(
                    "insufficient funds for exchange minimum: {reason} (cap {cap_pct:.2}% / requested {required_pct:.2}%)"
                )));
            }
        }
    };

    let qty_f64 = qty.to_f64().unwrap_or(0.0);
    if qty_f64 <= 0.0 {
        return Err(Refusal::Sizing("quantity <= 0 after filter adjustment".into()));
    }

    let margin_est = qty_f64 * inputs.price / lev;
    if existing_margin_indicator + margin_est > max_indicator_margin + 1e-6 {
        return Err(Refusal::Sizing(format!(
            "adding {margin_est:.4} USDT would exceed cap {max_indicator_margin:.4} USDT"
        )));
    }

    // --- Side-wide slot cap --------------------------------------------------
    let existing_margin_side: f64 = inputs
        .entries_side_all
        .iter()
        .map(|(_, e)| e.margin_usdt)
        .sum();
    let mut tokens: std::collections::HashSet<String> = inputs
        .entries_side_all
        .iter()
        .map(|(key, e)| slot_token(e, key))
        .collect();
    let order_token = {
        let base = if let Some(key) = &inputs.indicator_key {
            format!("ind:{key}")
        } else if !inputs.signature.is_empty() {
            format!("sig:{}", crate::guards::sig_key(&inputs.signature).join("|"))
        } else {
            format!("side:{}", inputs.side)
        };
        format!("{base}@{}", inputs.interval.to_ascii_lowercase())
    };
    tokens.insert(order_token);
    let expected_slots_after = tokens.len().max(desired_slots_after).max(1);
    let max_side_margin = per_slot_margin * expected_slots_after as f64 * (1.0 + tolerance);
    if existing_margin_side + margin_est > max_side_margin + 1e-6 {
        return Err(Refusal::Sizing(format!(
            "projected total {} margin {:.4} USDT exceeds cap {max_side_margin:.4} USDT for {expected_slots_after} slot(s)",
            inputs.side,
            existing_margin_side + margin_est
        )));
    }

    let mut signature = crate::guards::sig_key(&inputs.signature);
    signature.push(slot_suffix.clone());
    signature.sort();

    Ok(SizingOutcome {
        qty,
        qty_f64,
        margin_est,
        slot_suffix,
        signature,
        mode,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc_filters() -> SymbolFilters {
        SymbolFilters {
            tick_size: dec!(0.10),
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: dec!(5),
            max_leverage: 125,
        }
    }

    fn base_inputs<'a>(filters: &'a SymbolFilters) -> SizingInputs<'a> {
        SizingInputs {
            symbol: "BTCUSDT",
            interval: "1m",
            side: Side::Buy,
            price: 20_000.0,
            wallet_total: 1_000.0,
            available: 1_000.0,
            pct: 0.02,
            leverage: 5,
            filters,
            tolerance: 0.05,
            max_auto_bump_percent: 5.0,
            auto_bump_percent_multiplier: 10.0,
            flip_qty_override: None,
            indicator_key: Some("rsi".to_string()),
            signature: vec!["rsi".to_string()],
            entries_side_all: Vec::new(),
        }
    }

    fn existing_entry(qty: f64, margin: f64, indicator: &str) -> (LegKey, Entry) {
        (
            LegKey::new("BTCUSDT", "1m", Side::Buy),
            Entry {
                ledger_id: uuid::Uuid::new_v4().to_string(),
                qty,
                entry_price: 20_000.0,
                leverage: 5,
                margin_usdt: margin,
                trigger_signature: vec![indicator.to_string(), "slot0".to_string()],
                indicator_keys: vec![indicator.to_string()],
                timestamp: 0.0,
                fees_usdt: None,
                entry_realized_usdt: None,
            },
        )
    }

    #[test]
    fn sizes_the_rsi_long_open_scenario() {
        // 1000 USDT * 2% * 5x / 20000 = 0.005 BTC, margin 20 USDT.
        let filters = btc_filters();
        let out = size_order(&base_inputs(&filters)).unwrap();
        assert_eq!(out.qty, dec!(0.005));
        assert!((out.margin_est - 20.0).abs() < 1e-9);
        assert_eq!(out.slot_suffix, "slot0");
        assert_eq!(out.mode, "percent");
        assert!(out.signature.contains(&"slot0".to_string()));
        assert!(out.signature.contains(&"rsi".to_string()));
    }

    #[test]
    fn second_slot_gets_next_suffix() {
        let filters = btc_filters();
        let mut inputs = base_inputs(&filters);
        inputs.entries_side_all = vec![existing_entry(0.005, 20.0, "rsi")];
        let out = size_order(&inputs).unwrap();
        assert_eq!(out.slot_suffix, "slot1");
    }

    #[test]
    fn refuses_when_indicator_cap_reached() {
        let filters = btc_filters();
        let mut inputs = base_inputs(&filters);
        // Two oversized slots: 81 USDT held vs a 3-slot cap of 63 USDT.
        inputs.entries_side_all = vec![
            existing_entry(0.010, 40.0, "rsi"),
            existing_entry(0.010, 41.0, "rsi"),
        ];
        match size_order(&inputs) {
            Err(Refusal::Sizing(msg)) => assert!(msg.contains("cap"), "{msg}"),
            other => panic!("expected sizing refusal, got {other:?}"),
        }
    }

    #[test]
    fn auto_bump_when_budget_below_minimum() {
        // Wallet 200 USDT at 0.49% -> margin budget 0.98 USDT -> qty 0.000245
        // floors to 0.00024, notional 4.8 < 5 minimum. The smallest legal
        // quantity 0.00025 needs 1 USDT margin = 0.5% of equity, inside the
        // 5% bump ceiling.
        let filters = SymbolFilters {
            step_size: dec!(0.00001),
            min_qty: dec!(0.00001),
            ..btc_filters()
        };
        let mut inputs = base_inputs(&filters);
        inputs.wallet_total = 200.0;
        inputs.available = 200.0;
        inputs.pct = 0.0049;
        let out = size_order(&inputs).unwrap();
        assert_eq!(out.mode, "percent(bumped_to_min)");
        assert_eq!(out.qty, dec!(0.00025));
        assert!((out.margin_est - 1.0).abs() < 1e-9);
    }

    #[test]
    fn auto_bump_refused_over_percent_cap() {
        let filters = SymbolFilters {
            step_size: dec!(0.00001),
            min_qty: dec!(0.00001),
            ..btc_filters()
        };
        let mut inputs = base_inputs(&filters);
        inputs.wallet_total = 200.0;
        inputs.available = 200.0;
        inputs.pct = 0.0049;
        inputs.max_auto_bump_percent = 0.4;
        inputs.auto_bump_percent_multiplier = 0.5;
        match size_order(&inputs) {
            Err(Refusal::Sizing(msg)) => {
                assert!(msg.contains("insufficient funds"), "{msg}");
                assert!(msg.contains("cap 0.40%"), "{msg}");
                assert!(msg.contains("requested 0.50%"), "{msg}");
            }
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[test]
    fn flip_override_sets_quantity() {
        let filters = btc_filters();
        let mut inputs = base_inputs(&filters);
        // Reopening after closing 0.008 on the other side: the flip quantity
        // replaces the budget-derived one (margin 32 USDT, inside the 42 USDT
        // single-slot cap at this equity).
        inputs.wallet_total = 2_000.0;
        inputs.available = 2_000.0;
        inputs.flip_qty_override = Some(0.008);
        let out = size_order(&inputs).unwrap();
        assert_eq!(out.qty, dec!(0.008));
        assert_eq!(out.mode, "flip");
        assert!((out.margin_est - 32.0).abs() < 1e-9);
    }

    #[test]
    fn refuses_without_available_balance() {
        let filters = btc_filters();
        let mut inputs = base_inputs(&filters);
        inputs.available = 0.0;
        assert!(matches!(size_order(&inputs), Err(Refusal::Sizing(_))));
        inputs.available = 10.0; // < 95% of the 20 USDT target
        assert!(matches!(size_order(&inputs), Err(Refusal::Sizing(_))));
    }

    #[test]
    fn side_cap_counts_other_indicators() {
        let filters = btc_filters();
        let mut inputs = base_inputs(&filters);
        // Another indicator already consumes one slot at its full budget;
        // side cap for 2 slots = 42 USDT with tolerance. Adding 20 for rsi
        // totals 41 -> allowed.
        inputs.entries_side_all = vec![existing_entry(0.005, 21.0, "macd")];
        let out = size_order(&inputs).unwrap();
        assert!((out.margin_est - 20.0).abs() < 1e-9);

        // A fat foreign slot pushes past the side cap.
        inputs.entries_side_all = vec![existing_entry(0.006, 25.0, "macd")];
        match size_order(&inputs) {
            Err(Refusal::Sizing(msg)) => assert!(msg.contains("projected total"), "{msg}"),
            other => panic!("expected side-cap refusal, got {other:?}"),
        }
    }

    #[test]
    fn wallet_equity_prefers_largest_estimate() {
        assert_eq!(wallet_equity(1000.0, 800.0, 0.0, 100.0), 1000.0);
        assert_eq!(wallet_equity(0.0, 800.0, 0.0, 300.0), 1100.0);
        assert_eq!(wallet_equity(0.0, 0.0, 500.0, 100.0), 600.0);
        assert_eq!(wallet_equity(0.0, 0.0, 0.0, 0.0), 0.0);
    }
}
