// =============================================================================
// Risk Coordinator — pre-commit open handshake and exchange reconciliation
// =============================================================================
//
// The coordinator owns the process-wide guard tables and exposes the
// four-step handshake the order pipeline runs around every submission:
//
//   can_open    — advisory probe, no state change
//   begin_open  — claims the pending slot (bar + signature checks)
//   end_open    — commits a success or releases a failure
//   mark_closed — clears guard state when a leg fully closes
//
// Reconciliation re-projects live exchange positions onto the ledger at
// startup and after an emergency: legs with no live backing are phantom and
// dropped.
// =============================================================================

use tracing::{info, warn};

use crate::error::{ExchangeResult, Refusal};
use crate::exchange::{flat_epsilon, ExchangeAdapter};
use crate::guards::{BarGuard, SigKey, SymbolGuard};
use crate::ledger::{LegKey, LegLedger};
use crate::market::positions::{live_qty_for_side, PositionView};
use crate::types::Side;

pub struct RiskCoordinator {
    bar_guard: BarGuard,
    symbol_guard: SymbolGuard,
}

/// What reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub phantom_legs_dropped: usize,
    pub legs_kept: usize,
}

impl RiskCoordinator {
    pub fn new(testnet: bool) -> Self {
        Self {
            bar_guard: BarGuard::new(),
            symbol_guard: SymbolGuard::new(testnet),
        }
    }

    // -------------------------------------------------------------------------
    // Handshake
    // -------------------------------------------------------------------------

    /// Advisory check: would `begin_open` stand a chance? Makes no claim.
    pub fn can_open(
        &self,
        symbol: &str,
        interval: &str,
        side: Side,
        bar_id: i64,
        sig: &SigKey,
    ) -> bool {
        self.bar_guard.allows(symbol, interval, side, bar_id, sig)
            && !self.symbol_guard.is_pending(symbol, side, sig)
    }

    /// Claim the submission slot. Callers MUST resolve with `end_open` or
    /// `abort_open`.
    pub fn begin_open(
        &self,
        symbol: &str,
        interval: &str,
        side: Side,
        bar_id: i64,
        sig: &SigKey,
        guard_window: f64,
        override_guard: bool,
    ) -> Result<(), Refusal> {
        if !self.bar_guard.allows(symbol, interval, side, bar_id, sig) {
            return Err(Refusal::BarGuard);
        }
        self.symbol_guard
            .begin(symbol, side, sig, guard_window, override_guard)
    }

    /// Resolve a claimed attempt.
    pub fn end_open(
        &self,
        symbol: &str,
        interval: &str,
        side: Side,
        bar_id: i64,
        sig: &SigKey,
        success: bool,
    ) {
        if success {
            self.bar_guard.commit(symbol, interval, side, bar_id, sig);
            self.symbol_guard.commit(symbol, side, sig);
        } else {
            self.symbol_guard.fail(symbol, side, sig);
        }
    }

    /// Release a claim without an attempt (a later stage refused).
    pub fn abort_open(&self, symbol: &str, side: Side, sig: &SigKey) {
        self.symbol_guard.abort(symbol, side, sig);
    }

    /// A leg fully closed; forget its guard state.
    pub fn mark_closed(&self, symbol: &str, _interval: &str, side: Side) {
        self.symbol_guard.mark_leg_closed(symbol, side);
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Re-project live exchange positions onto the ledger: any leg holding
    /// quantity with no live backing is phantom and dropped. Run at startup
    /// and after emergency completion.
    pub async fn reconcile(
        &self,
        adapter: &dyn ExchangeAdapter,
        ledger: &LegLedger,
        view: &PositionView,
        dual: bool,
    ) -> ExchangeResult<ReconcileReport> {
        let rows = view.positions(adapter, true).await?;
        let mut report = ReconcileReport::default();

        for (key, ledger_qty) in ledger.legs_with_qty(None) {
            let live = live_qty_for_side(&rows, &key.symbol, key.side, dual);
            if live <= flat_epsilon(ledger_qty) {
                warn!(leg = %key, ledger_qty, "phantom leg dropped during reconciliation");
                ledger.drop_leg(&key);
                self.mark_closed(&key.symbol, &key.interval, key.side);
                report.phantom_legs_dropped += 1;
            } else {
                report.legs_kept += 1;
            }
        }

        info!(
            dropped = report.phantom_legs_dropped,
            kept = report.legs_kept,
            "ledger reconciled against exchange"
        );
        Ok(report)
    }

    /// Purge legs the exchange reports flat for one symbol (per-tick variant
    /// of reconciliation) and release their guard state.
    pub async fn purge_flats(
        &self,
        adapter: &dyn ExchangeAdapter,
        ledger: &LegLedger,
        view: &PositionView,
        symbol: &str,
        dual: bool,
    ) -> ExchangeResult<Vec<LegKey>> {
        let purged = view.purge_flat_legs(adapter, ledger, symbol, dual).await?;
        for key in &purged {
            self.mark_closed(&key.symbol, &key.interval, key.side);
        }
        Ok(purged)
    }
}

impl std::fmt::Debug for RiskCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskCoordinator").finish()
    }
}
