// =============================================================================
// Conflict Resolver — the flip protocol
// =============================================================================
//
// When indicator X fires BUY while X (or an overlapping indicator identity)
// still owns SELL exposure, the resolver flattens the opposite side before
// the new side may open:
//
//   1. Close every opposite-side ledger entry tagged with one of the
//      indicator tokens, ignoring min-hold.
//   2. If the exchange still reports opposite exposure, fall back to a
//      live-residual close sized to the reported quantity, retrying the
//      position-side variants to survive hedge/one-way mismatches.
//   3. Re-verify with a fresh snapshot. Any remaining opposite exposure
//      blocks the open.
//
// Invariant preserved: after a successful flip the net live position for the
// indicator's token set is on the new side only.
// =============================================================================

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::error::ExchangeResult;
use crate::events::{new_event_id, CloseEvent, EventBus};
use crate::exchange::filters::decimal_from_f64;
use crate::exchange::{flat_epsilon, ExchangeAdapter};
use crate::ledger::{Entry, LegKey, LegLedger};
use crate::market::positions::{live_qty_for_side, PositionView};
use crate::types::{epoch_secs, PositionSide, Side};

/// Result of the pre-open conflict resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum FlipResult {
    /// Opposite side is flat; `closed_qty` is what this pass closed.
    Clear { closed_qty: f64 },
    /// Opposite exposure survived every close attempt; refuse the open.
    Blocked,
}

/// Close one ledger entry with a reduce-only market order and settle the
/// ledger + event bus from the ack. Returns the executed quantity.
pub async fn close_ledger_entry(
    adapter: &dyn ExchangeAdapter,
    ledger: &LegLedger,
    bus: &EventBus,
    leg_key: &LegKey,
    entry: &Entry,
    reason: &str,
    dual: bool,
    close_price_hint: f64,
) -> ExchangeResult<f64> {
    let close_side = leg_key.side.close_side();
    let position_side = dual.then(|| leg_key.side.position_side());
    let qty = decimal_from_f64(entry.qty);
    if qty <= Decimal::ZERO {
        return Ok(0.0);
    }

    let started = epoch_secs();
    let ack = adapter
        .close_leg_exact(&leg_key.symbol, qty, close_side, position_side)
        .await?;
    let latency = epoch_secs() - started;

    let executed = ack.effective_qty();
    ledger.apply_close(leg_key, &entry.ledger_id, executed);

    let close_price = if ack.avg_price > 0.0 {
        ack.avg_price
    } else {
        close_price_hint
    };
    let direction = if leg_key.side == Side::Buy { 1.0 } else { -1.0 };
    let pnl = direction * (close_price - entry.entry_price) * executed;
    let roi = if entry.margin_usdt > 0.0 {
        pnl / entry.margin_usdt * 100.0
    } else {
        0.0
    };
    let fills = ack.fills.as_ref();

    let event = CloseEvent {
        symbol: leg_key.symbol.clone(),
        interval: leg_key.interval.clone(),
        side: leg_key.side,
        qty: executed,
        close_price,
        entry_price: entry.entry_price,
        pnl_value: pnl,
        margin_usdt: entry.margin_usdt,
        leverage: entry.leverage,
        roi_percent: roi,
        ledger_id: Some(entry.ledger_id.clone()),
        entry_fee_usdt: entry.fees_usdt,
        close_fee_usdt: fills.map(|f| f.commission_usdt),
        realized_pnl_usdt: fills.map(|f| f.net_realized),
        reason: reason.to_string(),
        latency_seconds: latency,
        latency_ms: latency * 1000.0,
        event_id: new_event_id(),
    };
    bus.emit_close(event.clone());
    // The last entry leaving a leg also closes the (symbol, interval) pair.
    if ledger.leg(leg_key).is_none() {
        bus.emit_close_interval(CloseEvent {
            event_id: new_event_id(),
            ..event
        });
    }

    info!(
        leg = %leg_key,
        ledger_id = %entry.ledger_id,
        qty = executed,
        close_price,
        pnl,
        reason,
        "ledger entry closed"
    );
    Ok(executed)
}

/// Flatten opposite exposure for `indicator_tokens` before opening
/// `new_side`. `target_qty` optionally bounds how much the caller needs
/// closed (flip reopen sizing).
#[allow(clippy::too_many_arguments)]
pub async fn close_opposite_exposure(
    adapter: &dyn ExchangeAdapter,
    ledger: &LegLedger,
    view: &PositionView,
    bus: &EventBus,
    symbol: &str,
    interval: &str,
    new_side: Side,
    indicator_tokens: &[String],
    dual: bool,
    price_hint: f64,
) -> ExchangeResult<FlipResult> {
    let opposite = new_side.opposite();
    let opposite_key = LegKey::new(symbol, interval, opposite);
    let mut closed_total = 0.0;

    // --- Stage 1: indicator-scoped ledger closes ----------------------------
    for token in indicator_tokens {
        let ids = ledger.ledger_ids(symbol, interval, token, opposite);
        for ledger_id in ids {
            let entry = ledger
                .entries_for(&opposite_key)
                .into_iter()
                .find(|e| e.ledger_id == ledger_id);
            if let Some(entry) = entry {
                closed_total += close_ledger_entry(
                    adapter,
                    ledger,
                    bus,
                    &opposite_key,
                    &entry,
                    "indicator_flip",
                    dual,
                    price_hint,
                )
                .await?;
            }
        }
    }
    if closed_total > 0.0 {
        view.invalidate();
    }

    // --- Stage 2: live-residual fallback ------------------------------------
    let residual = view
        .live_qty(adapter, symbol, opposite, dual, true)
        .await?;
    if residual > flat_epsilon(residual) {
        warn!(
            symbol,
            interval,
            %opposite,
            residual,
            "opposite exposure survived indicator closes; sending residual close"
        );
        let close_side = opposite.close_side();
        let preferred = dual.then(|| opposite.position_side());
        // Position-side mismatches (-4061 and friends) show up when the
        // account mode changed underneath us; retry the other variant.
        let variants: [Option<PositionSide>; 2] = [preferred, if preferred.is_some() { None } else { Some(opposite.position_side()) }];
        let qty = decimal_from_f64(residual);
        let mut sent = false;
        for position_side in variants {
            match adapter
                .close_leg_exact(symbol, qty, close_side, position_side)
                .await
            {
                Ok(ack) => {
                    closed_total += ack.effective_qty();
                    sent = true;
                    break;
                }
                Err(err) => {
                    warn!(symbol, error = %err, "residual close variant failed");
                }
            }
        }
        if sent {
            // The ledger may still carry the leg; reconcile it away.
            ledger.drop_leg(&opposite_key);
            view.invalidate();
        }
    }

    // --- Stage 3: re-verify --------------------------------------------------
    let remaining = view
        .live_qty(adapter, symbol, opposite, dual, true)
        .await?;
    if remaining > flat_epsilon(remaining) {
        warn!(
            symbol,
            interval,
            %opposite,
            remaining,
            "flip_blocked: opposite exposure still live after close attempts"
        );
        return Ok(FlipResult::Blocked);
    }

    Ok(FlipResult::Clear {
        closed_qty: closed_total,
    })
}

/// Final pre-open verification: any live opposite position rejects the open.
/// In one-way mode a BOTH-side row on the wrong sign blocks; in hedge mode
/// only a LONG/SHORT row on the opposite side does (unless opposite overlap
/// is allowed by config, which the caller checks before invoking).
pub async fn verify_no_opposite(
    adapter: &dyn ExchangeAdapter,
    view: &PositionView,
    symbol: &str,
    new_side: Side,
    dual: bool,
) -> ExchangeResult<bool> {
    let rows = view.positions(adapter, true).await?;
    let opposite_qty = live_qty_for_side(&rows, symbol, new_side.opposite(), dual);
    Ok(opposite_qty <= flat_epsilon(opposite_qty))
}
