// =============================================================================
// Margin Mode Enforcer — aligns margin type and leverage before any order
// =============================================================================
//
// Binance refuses orders placed under the wrong margin type, and refuses to
// *change* the margin type while orders or positions are open (-4048). The
// enforcer therefore runs before every submission:
//
//   1. Read the current margin type for the symbol.
//   2. Wrong type with live exposure -> refuse the order outright.
//   3. Cancel open orders on the symbol (change prerequisite).
//   4. Change the margin type, tolerating "-4046 no need to change", and
//      verify by re-reading. A blank probe passes when nothing is live.
//   5. Apply the clamped leverage, tolerating "same leverage" responses.
// =============================================================================

use tracing::{debug, warn};

use crate::error::{ExchangeError, ExchangeResult, Refusal};
use crate::exchange::{flat_epsilon, ExchangeAdapter};
use crate::types::MarginMode;

/// Whether the order pipeline may proceed.
#[derive(Debug, Clone, PartialEq)]
pub enum EnforceOutcome {
    Ready,
    Refused(Refusal),
}

/// Align the symbol's margin type and leverage with the desired settings.
pub async fn ensure_margin_and_leverage(
    adapter: &dyn ExchangeAdapter,
    symbol: &str,
    desired: MarginMode,
    leverage: Option<u32>,
) -> ExchangeResult<EnforceOutcome> {
    let positions = adapter.positions().await?;
    let symbol_rows: Vec<_> = positions.iter().filter(|p| p.symbol == symbol).collect();

    let current = symbol_rows.iter().find_map(|p| p.margin_type);
    let live_qty: f64 = symbol_rows
        .iter()
        .map(|p| p.position_amt.abs())
        .sum();
    let has_exposure = live_qty > flat_epsilon(live_qty);

    if let Some(current) = current {
        if current != desired && has_exposure {
            warn!(
                symbol,
                current = %current,
                desired = %desired,
                "margin type mismatch with open exposure; refusing order"
            );
            return Ok(EnforceOutcome::Refused(Refusal::MarginMode(format!(
                "wrong_margin_mode: {current} live, {desired} desired"
            ))));
        }
    }

    if current != Some(desired) {
        // Open orders block the change; clear them first.
        adapter.cancel_all_orders(symbol).await?;

        match adapter.change_margin_type(symbol, desired).await {
            Ok(()) => {}
            Err(ExchangeError::Client { code: -4048, message, .. }) => {
                return Ok(EnforceOutcome::Refused(Refusal::MarginMode(format!(
                    "exchange refused margin change: {message}"
                ))));
            }
            Err(err) => return Err(err),
        }

        // Verify; a blank probe (no position rows yet) passes when flat.
        let verified = adapter.margin_type(symbol).await?;
        match verified {
            Some(now) if now != desired => {
                return Ok(EnforceOutcome::Refused(Refusal::MarginMode(format!(
                    "margin type still {now} after change to {desired}"
                ))));
            }
            Some(_) => {}
            None if has_exposure => {
                return Ok(EnforceOutcome::Refused(Refusal::MarginMode(
                    "margin type unreadable with live exposure".into(),
                )));
            }
            None => {
                debug!(symbol, "margin type probe blank with no exposure; accepting");
            }
        }
    }

    if let Some(requested) = leverage {
        let applied = adapter
            .change_leverage(symbol, adapter.clamp_leverage(symbol, requested))
            .await?;
        debug!(symbol, requested, applied, "leverage aligned");
    }

    Ok(EnforceOutcome::Ready)
}
