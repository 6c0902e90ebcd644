// =============================================================================
// Stop-Loss Engine — per-trade, cumulative, and entire-account scopes
// =============================================================================
//
// Loss accounting per entry (long shown, shorts mirror):
//
//   loss_usdt  = max(0, (entry_price - last_price) * qty)
//   price_pct  = loss / (entry_price * qty) * 100
//   margin_pct = loss / margin_usdt * 100
//   effective  = max(price_pct, margin_pct)
//
// The margin denominator is the entry-time allocated margin recorded in the
// ledger (falling back to notional / leverage). Stop closes ignore min-hold
// and run through the liquidation-safe reduce-only path.
// =============================================================================

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::{StopLossConfig, StopLossScope};
use crate::error::ExchangeResult;
use crate::events::{new_event_id, CloseEvent, EventBus};
use crate::exchange::filters::decimal_from_f64;
use crate::exchange::{flat_epsilon, ExchangeAdapter, PositionInfo};
use crate::flip::close_ledger_entry;
use crate::ledger::{LegKey, LegLedger};
use crate::market::positions::PositionView;
use crate::types::{epoch_secs, Side};

/// Loss readings for one entry or one aggregated side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossReading {
    pub loss_usdt: f64,
    pub price_pct: f64,
    pub margin_pct: f64,
    pub effective_pct: f64,
}

/// Pure loss computation for an exposure of `qty` at `entry_price`.
pub fn loss_reading(
    side: Side,
    entry_price: f64,
    qty: f64,
    last_price: f64,
    margin_usdt: f64,
    leverage: u32,
) -> LossReading {
    let loss_usdt = match side {
        Side::Buy => ((entry_price - last_price) * qty).max(0.0),
        Side::Sell => ((last_price - entry_price) * qty).max(0.0),
    };
    let notional = entry_price * qty;
    let price_pct = if notional > 0.0 {
        loss_usdt / notional * 100.0
    } else {
        0.0
    };
    let margin = if margin_usdt > 0.0 {
        margin_usdt
    } else if leverage > 0 {
        notional / leverage as f64
    } else {
        notional
    };
    let margin_pct = if margin > 0.0 {
        loss_usdt / margin * 100.0
    } else {
        0.0
    };
    LossReading {
        loss_usdt,
        price_pct,
        margin_pct,
        effective_pct: price_pct.max(margin_pct),
    }
}

/// Does this reading trip the configured thresholds?
pub fn breached(reading: &LossReading, cfg: &StopLossConfig) -> bool {
    if !cfg.enabled {
        return false;
    }
    if cfg.mode.applies_usdt() && reading.loss_usdt >= cfg.usdt && reading.loss_usdt > 0.0 {
        return true;
    }
    cfg.mode.applies_percent()
        && reading.effective_pct >= cfg.percent
        && reading.effective_pct > 0.0
}

/// What one stop-loss tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum StopTickOutcome {
    Idle,
    ClosedEntries(u32),
    ClosedSide(Side),
    /// Entire-account threshold tripped: the caller must dispatch the
    /// emergency closer with reason `entire_account_stop` and stop.
    EntireAccountTriggered,
}

/// Evaluate the configured scope once for (symbol, interval).
#[allow(clippy::too_many_arguments)]
pub async fn run_tick(
    adapter: &dyn ExchangeAdapter,
    ledger: &LegLedger,
    view: &PositionView,
    bus: &EventBus,
    cfg: &StopLossConfig,
    symbol: &str,
    interval: &str,
    last_price: f64,
    dual: bool,
) -> ExchangeResult<StopTickOutcome> {
    if !cfg.enabled || last_price <= 0.0 {
        return Ok(StopTickOutcome::Idle);
    }
    match cfg.scope {
        StopLossScope::PerTrade => {
            per_trade_tick(adapter, ledger, view, bus, cfg, symbol, interval, last_price, dual)
                .await
        }
        StopLossScope::Cumulative => {
            cumulative_tick(adapter, ledger, view, bus, cfg, symbol, interval, last_price, dual)
                .await
        }
        StopLossScope::EntireAccount => entire_account_tick(adapter, view, cfg).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn per_trade_tick(
    adapter: &dyn ExchangeAdapter,
    ledger: &LegLedger,
    view: &PositionView,
    bus: &EventBus,
    cfg: &StopLossConfig,
    symbol: &str,
    interval: &str,
    last_price: f64,
    dual: bool,
) -> ExchangeResult<StopTickOutcome> {
    let mut closed = 0u32;
    for side in [Side::Buy, Side::Sell] {
        let leg_key = LegKey::new(symbol, interval, side);
        let entries = ledger.entries_for(&leg_key);
        if entries.is_empty() {
            continue;
        }

        // Partial liquidations shrink the live position without telling the
        // ledger; rescale before loss math so closes cannot over-fill.
        let live = view.live_qty(adapter, symbol, side, dual, false).await?;
        if live > flat_epsilon(live) {
            ledger.sync_leg_totals(&leg_key, live);
        }

        for entry in ledger.entries_for(&leg_key) {
            let reading = loss_reading(
                side,
                entry.entry_price,
                entry.qty,
                last_price,
                entry.margin_usdt,
                entry.leverage,
            );
            if breached(&reading, cfg) {
                info!(
                    leg = %leg_key,
                    ledger_id = %entry.ledger_id,
                    loss_usdt = reading.loss_usdt,
                    effective_pct = reading.effective_pct,
                    "per-trade stop loss tripped"
                );
                close_ledger_entry(
                    adapter,
                    ledger,
                    bus,
                    &leg_key,
                    &entry,
                    "per_trade_stop_loss",
                    dual,
                    last_price,
                )
                .await?;
                view.invalidate();
                closed += 1;
            }
        }
    }
    Ok(if closed > 0 {
        StopTickOutcome::ClosedEntries(closed)
    } else {
        StopTickOutcome::Idle
    })
}

/// Aggregate matching exchange rows for (symbol, side).
fn aggregate_side(rows: &[PositionInfo], symbol: &str, side: Side, dual: bool) -> (f64, f64, f64, f64) {
    let mut qty = 0.0;
    let mut loss = 0.0;
    let mut margin = 0.0;
    let mut notional = 0.0;
    for p in rows.iter().filter(|p| p.symbol == symbol) {
        let amt = match (dual, side) {
            (true, Side::Buy) if p.position_side == crate::types::PositionSide::Long => {
                p.position_amt.abs()
            }
            (true, Side::Sell) if p.position_side == crate::types::PositionSide::Short => {
                p.position_amt.abs()
            }
            (false, Side::Buy) if p.position_amt > 0.0 => p.position_amt,
            (false, Side::Sell) if p.position_amt < 0.0 => p.position_amt.abs(),
            _ => 0.0,
        };
        if amt <= 0.0 {
            continue;
        }
        qty += amt;
        loss += (-p.unrealized_pnl).max(0.0);
        margin += p.allocated_margin();
        notional += p.entry_price * amt;
    }
    (qty, loss, margin, notional)
}

#[allow(clippy::too_many_arguments)]
async fn cumulative_tick(
    adapter: &dyn ExchangeAdapter,
    ledger: &LegLedger,
    view: &PositionView,
    bus: &EventBus,
    cfg: &StopLossConfig,
    symbol: &str,
    interval: &str,
    last_price: f64,
    dual: bool,
) -> ExchangeResult<StopTickOutcome> {
    let rows = view.positions(adapter, false).await?;
    for side in [Side::Buy, Side::Sell] {
        let (qty, loss, margin, notional) = aggregate_side(&rows, symbol, side, dual);
        if qty <= 0.0 {
            continue;
        }
        let price_pct = if notional > 0.0 { loss / notional * 100.0 } else { 0.0 };
        let margin_pct = if margin > 0.0 { loss / margin * 100.0 } else { 0.0 };
        let reading = LossReading {
            loss_usdt: loss,
            price_pct,
            margin_pct,
            effective_pct: price_pct.max(margin_pct),
        };
        if !breached(&reading, cfg) {
            continue;
        }
        warn!(
            symbol,
            %side,
            qty,
            loss_usdt = loss,
            effective_pct = reading.effective_pct,
            "cumulative stop loss tripped; closing entire side"
        );
        let started = epoch_secs();
        let ack = adapter
            .close_leg_exact(
                symbol,
                decimal_from_f64(qty).max(Decimal::ZERO),
                side.close_side(),
                dual.then(|| side.position_side()),
            )
            .await?;
        let latency = epoch_secs() - started;
        view.invalidate();

        // The whole side is gone; drop every ledger leg on it.
        for (key, _) in ledger.legs_with_qty(Some(symbol)) {
            if key.side == side {
                ledger.drop_leg(&key);
            }
        }

        let executed = ack.effective_qty();
        let avg_entry = if qty > 0.0 { notional / qty } else { 0.0 };
        let close_price = if ack.avg_price > 0.0 { ack.avg_price } else { last_price };
        let direction = if side == Side::Buy { 1.0 } else { -1.0 };
        bus.emit_close(CloseEvent {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            side,
            qty: executed,
            close_price,
            entry_price: avg_entry,
            pnl_value: direction * (close_price - avg_entry) * executed,
            margin_usdt: margin,
            leverage: 0,
            roi_percent: if margin > 0.0 {
                direction * (close_price - avg_entry) * executed / margin * 100.0
            } else {
                0.0
            },
            ledger_id: None,
            entry_fee_usdt: None,
            close_fee_usdt: ack.fills.as_ref().map(|f| f.commission_usdt),
            realized_pnl_usdt: ack.fills.as_ref().map(|f| f.net_realized),
            reason: "cumulative_stop_loss".to_string(),
            latency_seconds: latency,
            latency_ms: latency * 1000.0,
            event_id: new_event_id(),
        });
        return Ok(StopTickOutcome::ClosedSide(side));
    }
    Ok(StopTickOutcome::Idle)
}

async fn entire_account_tick(
    adapter: &dyn ExchangeAdapter,
    view: &PositionView,
    cfg: &StopLossConfig,
) -> ExchangeResult<StopTickOutcome> {
    let account = view.account(adapter, false).await?;
    let loss = (-account.unrealized_pnl).max(0.0);
    let pct = if account.wallet_balance > 0.0 {
        loss / account.wallet_balance * 100.0
    } else {
        0.0
    };
    let reading = LossReading {
        loss_usdt: loss,
        price_pct: pct,
        margin_pct: pct,
        effective_pct: pct,
    };
    if breached(&reading, cfg) {
        warn!(
            loss_usdt = loss,
            pct,
            wallet = account.wallet_balance,
            "entire-account stop loss tripped"
        );
        return Ok(StopTickOutcome::EntireAccountTriggered);
    }
    Ok(StopTickOutcome::Idle)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StopLossMode;
    use crate::events::EngineEvent;
    use crate::exchange::AccountSnapshot;
    use crate::ledger::Entry;
    use crate::testutil::{position, MockExchange};
    use crate::types::PositionSide;

    fn usdt_stop(usdt: f64) -> StopLossConfig {
        StopLossConfig {
            enabled: true,
            mode: StopLossMode::Usdt,
            usdt,
            percent: 100.0,
            scope: StopLossScope::PerTrade,
        }
    }

    fn buy_entry(qty: f64, entry_price: f64, margin: f64) -> Entry {
        Entry {
            ledger_id: uuid::Uuid::new_v4().to_string(),
            qty,
            entry_price,
            leverage: 5,
            margin_usdt: margin,
            trigger_signature: vec!["rsi".into(), "slot0".into()],
            indicator_keys: vec!["rsi".into()],
            timestamp: epoch_secs(),
            fees_usdt: None,
            entry_realized_usdt: None,
        }
    }

    #[test]
    fn loss_reading_long_drop() {
        // 0.005 BTC long from 20000, price 19000: loss exactly 5 USDT.
        let r = loss_reading(Side::Buy, 20_000.0, 0.005, 19_000.0, 20.0, 5);
        assert!((r.loss_usdt - 5.0).abs() < 1e-12);
        assert!((r.price_pct - 5.0).abs() < 1e-9);
        assert!((r.margin_pct - 25.0).abs() < 1e-9);
        assert!((r.effective_pct - 25.0).abs() < 1e-9);
    }

    #[test]
    fn loss_reading_profit_is_zero() {
        let r = loss_reading(Side::Buy, 20_000.0, 0.005, 21_000.0, 20.0, 5);
        assert_eq!(r.loss_usdt, 0.0);
        assert_eq!(r.effective_pct, 0.0);
    }

    #[test]
    fn loss_reading_short_mirror() {
        let r = loss_reading(Side::Sell, 20_000.0, 0.005, 21_000.0, 20.0, 5);
        assert!((r.loss_usdt - 5.0).abs() < 1e-12);
    }

    #[test]
    fn breach_modes() {
        let r = loss_reading(Side::Buy, 20_000.0, 0.005, 19_000.0, 20.0, 5);
        assert!(breached(&r, &usdt_stop(5.0)));
        assert!(!breached(&r, &usdt_stop(5.01)));

        let pct_cfg = StopLossConfig {
            enabled: true,
            mode: StopLossMode::Percent,
            usdt: 0.1,
            percent: 20.0,
            scope: StopLossScope::PerTrade,
        };
        // margin_pct 25 >= 20 even though price_pct is only 5.
        assert!(breached(&r, &pct_cfg));

        let disabled = StopLossConfig {
            enabled: false,
            ..usdt_stop(1.0)
        };
        assert!(!breached(&r, &disabled));
    }

    #[tokio::test]
    async fn per_trade_stop_closes_entry_exactly() {
        let mock = MockExchange::new();
        mock.auto_flatten_on_close(true);
        mock.set_price(19_000.0);
        mock.set_positions(vec![position("BTCUSDT", 0.005, 20_000.0, PositionSide::Both)]);

        let ledger = LegLedger::new();
        let key = LegKey::new("BTCUSDT", "1m", Side::Buy);
        ledger.append_entry(&key, buy_entry(0.005, 20_000.0, 20.0)).unwrap();

        let view = PositionView::new();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let outcome = run_tick(
            &mock,
            &ledger,
            &view,
            &bus,
            &usdt_stop(5.0),
            "BTCUSDT",
            "1m",
            19_000.0,
            false,
        )
        .await
        .unwrap();

        assert_eq!(outcome, StopTickOutcome::ClosedEntries(1));
        assert!(ledger.leg(&key).is_none());

        let closes = mock.closes();
        assert_eq!(closes.len(), 1);
        assert!((closes[0].1 - 0.005).abs() < 1e-12);
        assert_eq!(closes[0].2, Side::Sell);

        match rx.recv().await.unwrap() {
            EngineEvent::Close(ev) => {
                assert_eq!(ev.reason, "per_trade_stop_loss");
                assert!((ev.pnl_value + 5.0).abs() < 1e-9);
                assert!((ev.margin_usdt - 20.0).abs() < 1e-12);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn per_trade_syncs_to_live_before_closing() {
        let mock = MockExchange::new();
        mock.auto_flatten_on_close(true);
        mock.set_price(19_000.0);
        // Exchange reports only 0.004 live (partial liquidation).
        mock.set_positions(vec![position("BTCUSDT", 0.004, 20_000.0, PositionSide::Both)]);

        let ledger = LegLedger::new();
        let key = LegKey::new("BTCUSDT", "1m", Side::Buy);
        ledger.append_entry(&key, buy_entry(0.005, 20_000.0, 20.0)).unwrap();

        let view = PositionView::new();
        let bus = EventBus::new();

        run_tick(
            &mock,
            &ledger,
            &view,
            &bus,
            &usdt_stop(3.0),
            "BTCUSDT",
            "1m",
            19_000.0,
            false,
        )
        .await
        .unwrap();

        let closes = mock.closes();
        assert_eq!(closes.len(), 1);
        assert!((closes[0].1 - 0.004).abs() < 1e-12, "close must use synced qty");
    }

    #[tokio::test]
    async fn cumulative_closes_whole_side() {
        let mock = MockExchange::new();
        mock.auto_flatten_on_close(true);
        mock.set_price(19_000.0);
        let mut pos = position("BTCUSDT", 0.010, 20_000.0, PositionSide::Both);
        pos.unrealized_pnl = -10.0;
        pos.isolated_margin = 40.0;
        mock.set_positions(vec![pos]);

        let ledger = LegLedger::new();
        let key_1m = LegKey::new("BTCUSDT", "1m", Side::Buy);
        let key_5m = LegKey::new("BTCUSDT", "5m", Side::Buy);
        ledger.append_entry(&key_1m, buy_entry(0.006, 20_000.0, 24.0)).unwrap();
        ledger.append_entry(&key_5m, buy_entry(0.004, 20_000.0, 16.0)).unwrap();

        let view = PositionView::new();
        let bus = EventBus::new();
        let cfg = StopLossConfig {
            scope: StopLossScope::Cumulative,
            ..usdt_stop(10.0)
        };

        let outcome = run_tick(
            &mock, &ledger, &view, &bus, &cfg, "BTCUSDT", "1m", 19_000.0, false,
        )
        .await
        .unwrap();

        assert_eq!(outcome, StopTickOutcome::ClosedSide(Side::Buy));
        assert!(ledger.leg(&key_1m).is_none());
        assert!(ledger.leg(&key_5m).is_none());
        let closes = mock.closes();
        assert_eq!(closes.len(), 1);
        assert!((closes[0].1 - 0.010).abs() < 1e-12);
    }

    #[tokio::test]
    async fn entire_account_triggers_without_closing() {
        let mock = MockExchange::new();
        mock.set_account(AccountSnapshot {
            wallet_balance: 1_000.0,
            available_balance: 900.0,
            margin_balance: 950.0,
            unrealized_pnl: -60.0,
        });
        let ledger = LegLedger::new();
        let view = PositionView::new();
        let bus = EventBus::new();
        let cfg = StopLossConfig {
            scope: StopLossScope::EntireAccount,
            ..usdt_stop(50.0)
        };
        let outcome = run_tick(
            &mock, &ledger, &view, &bus, &cfg, "BTCUSDT", "1m", 19_000.0, false,
        )
        .await
        .unwrap();
        assert_eq!(outcome, StopTickOutcome::EntireAccountTriggered);
        assert!(mock.closes().is_empty());
    }
}
