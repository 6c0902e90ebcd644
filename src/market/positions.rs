// =============================================================================
// Position View — live positions and account totals behind short-TTL caches
// =============================================================================
//
// Exchange reads are expensive and rate-weighted; the view keeps positions
// for 1.5 s and account totals for 2.5 s. Any order ack or close must call
// `invalidate` so the next read reflects the fill. Force-refresh bypasses
// the cache outright.
// =============================================================================

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::ExchangeResult;
use crate::exchange::{flat_epsilon, AccountSnapshot, ExchangeAdapter, PositionInfo};
use crate::ledger::{LegKey, LegLedger};
use crate::types::{epoch_secs, PositionSide, Side};

const POSITIONS_TTL: f64 = 1.5;
const ACCOUNT_TTL: f64 = 2.5;

pub struct PositionView {
    positions: Mutex<Option<(Vec<PositionInfo>, f64)>>,
    account: Mutex<Option<(AccountSnapshot, f64)>>,
}

impl PositionView {
    pub fn new() -> Self {
        Self {
            positions: Mutex::new(None),
            account: Mutex::new(None),
        }
    }

    /// Live positions, cached for 1.5 s unless `force_refresh`.
    pub async fn positions(
        &self,
        adapter: &dyn ExchangeAdapter,
        force_refresh: bool,
    ) -> ExchangeResult<Vec<PositionInfo>> {
        if !force_refresh {
            let cache = self.positions.lock();
            if let Some((rows, ts)) = cache.as_ref() {
                if epoch_secs() - ts < POSITIONS_TTL {
                    return Ok(rows.clone());
                }
            }
        }
        let rows = adapter.positions().await?;
        *self.positions.lock() = Some((rows.clone(), epoch_secs()));
        Ok(rows)
    }

    /// Account totals, cached for 2.5 s unless `force_refresh`.
    pub async fn account(
        &self,
        adapter: &dyn ExchangeAdapter,
        force_refresh: bool,
    ) -> ExchangeResult<AccountSnapshot> {
        if !force_refresh {
            let cache = self.account.lock();
            if let Some((snap, ts)) = cache.as_ref() {
                if epoch_secs() - ts < ACCOUNT_TTL {
                    return Ok(snap.clone());
                }
            }
        }
        let snap = adapter.account_snapshot().await?;
        *self.account.lock() = Some((snap.clone(), epoch_secs()));
        Ok(snap)
    }

    /// Drop both caches. Call after every order ack or close.
    pub fn invalidate(&self) {
        *self.positions.lock() = None;
        *self.account.lock() = None;
        debug!("position/account caches invalidated");
    }

    /// Live exposure for one (symbol, side), hedge-aware.
    pub async fn live_qty(
        &self,
        adapter: &dyn ExchangeAdapter,
        symbol: &str,
        side: Side,
        dual: bool,
        force_refresh: bool,
    ) -> ExchangeResult<f64> {
        let rows = self.positions(adapter, force_refresh).await?;
        Ok(live_qty_for_side(&rows, symbol, side, dual))
    }

    /// Remove ledger legs whose live exchange position has gone flat
    /// (liquidation or manual close outside the bot). Returns the purged
    /// keys so the caller can release guard state and notify the risk
    /// coordinator.
    pub async fn purge_flat_legs(
        &self,
        adapter: &dyn ExchangeAdapter,
        ledger: &LegLedger,
        symbol: &str,
        dual: bool,
    ) -> ExchangeResult<Vec<LegKey>> {
        let legs = ledger.legs_with_qty(Some(symbol));
        if legs.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self.positions(adapter, true).await?;

        let mut purged = Vec::new();
        for (key, ledger_qty) in legs {
            let live = live_qty_for_side(&rows, &key.symbol, key.side, dual);
            if live <= flat_epsilon(ledger_qty) {
                info!(
                    leg = %key,
                    ledger_qty,
                    "exchange reports flat; purging ledger leg"
                );
                ledger.drop_leg(&key);
                purged.push(key);
            }
        }
        Ok(purged)
    }
}

impl Default for PositionView {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionView")
            .field("positions_cached", &self.positions.lock().is_some())
            .field("account_cached", &self.account.lock().is_some())
            .finish()
    }
}

/// Absolute live quantity held on `side` of `symbol` in the given position
/// mode. In hedge mode only rows labelled LONG/SHORT count for their side;
/// in one-way mode the sign of the net position decides.
pub fn live_qty_for_side(rows: &[PositionInfo], symbol: &str, side: Side, dual: bool) -> f64 {
    rows.iter()
        .filter(|p| p.symbol == symbol)
        .map(|p| {
            if dual {
                match (side, p.position_side) {
                    (Side::Buy, PositionSide::Long) => p.position_amt.abs(),
                    (Side::Sell, PositionSide::Short) => p.position_amt.abs(),
                    _ => 0.0,
                }
            } else {
                match side {
                    Side::Buy if p.position_amt > 0.0 => p.position_amt,
                    Side::Sell if p.position_amt < 0.0 => p.position_amt.abs(),
                    _ => 0.0,
                }
            }
        })
        .sum()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Entry;
    use crate::testutil::{position, MockExchange};

    #[test]
    fn live_qty_one_way() {
        let rows = vec![position("BTCUSDT", 0.005, 20_000.0, PositionSide::Both)];
        assert!((live_qty_for_side(&rows, "BTCUSDT", Side::Buy, false) - 0.005).abs() < 1e-12);
        assert_eq!(live_qty_for_side(&rows, "BTCUSDT", Side::Sell, false), 0.0);
    }

    #[test]
    fn live_qty_hedge_ignores_both_rows() {
        let rows = vec![
            position("BTCUSDT", 0.005, 20_000.0, PositionSide::Long),
            position("BTCUSDT", -0.002, 20_500.0, PositionSide::Short),
        ];
        assert!((live_qty_for_side(&rows, "BTCUSDT", Side::Buy, true) - 0.005).abs() < 1e-12);
        assert!((live_qty_for_side(&rows, "BTCUSDT", Side::Sell, true) - 0.002).abs() < 1e-12);
    }

    #[tokio::test]
    async fn purge_drops_flat_legs_only() {
        let mock = MockExchange::new();
        mock.set_positions(vec![position("BTCUSDT", 0.005, 20_000.0, PositionSide::Both)]);

        let ledger = LegLedger::new();
        let live_key = LegKey::new("BTCUSDT", "1m", Side::Buy);
        let dead_key = LegKey::new("BTCUSDT", "1m", Side::Sell);
        let mk = |id: &str| Entry {
            ledger_id: id.into(),
            qty: 0.005,
            entry_price: 20_000.0,
            leverage: 5,
            margin_usdt: 20.0,
            trigger_signature: vec!["rsi".into(), "slot0".into()],
            indicator_keys: vec!["rsi".into()],
            timestamp: epoch_secs(),
            fees_usdt: None,
            entry_realized_usdt: None,
        };
        ledger.append_entry(&live_key, mk("a")).unwrap();
        ledger.append_entry(&dead_key, mk("b")).unwrap();

        let view = PositionView::new();
        let purged = view
            .purge_flat_legs(&mock, &ledger, "BTCUSDT", false)
            .await
            .unwrap();
        assert_eq!(purged, vec![dead_key.clone()]);
        assert!(ledger.leg(&live_key).is_some());
        assert!(ledger.leg(&dead_key).is_none());
    }

    #[tokio::test]
    async fn account_cache_serves_within_ttl() {
        let mock = MockExchange::new();
        mock.set_account(AccountSnapshot {
            wallet_balance: 1000.0,
            available_balance: 900.0,
            margin_balance: 1000.0,
            unrealized_pnl: 0.0,
        });
        let view = PositionView::new();
        let first = view.account(&mock, false).await.unwrap();
        mock.set_account(AccountSnapshot::default());
        let second = view.account(&mock, false).await.unwrap();
        assert!((second.wallet_balance - first.wallet_balance).abs() < 1e-12);
        // Force refresh bypasses.
        let third = view.account(&mock, true).await.unwrap();
        assert_eq!(third.wallet_balance, 0.0);
    }
}
