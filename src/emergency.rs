// =============================================================================
// Emergency Closer — single-flight flatten-everything worker
// =============================================================================
//
// Started by any of: operator command, network-offline escalation, the
// entire-account stop loss, or a strategy fatal. Only one worker runs at a
// time; duplicate dispatches while active are dropped.
//
// Each attempt cancels open orders per symbol, force-reads positions, and
// closes every live row hedge-aware: closePosition=true first (immune to
// filter edge cases), then an exact reduce-only market order, with the
// -2022 "ReduceOnly rejected" fallback going back to closePosition.
// Attempts repeat up to `max_attempts` with delay min(90 s, base * (i + 1)).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::{ExchangeError, ExchangeResult};
use crate::events::{EmergencyEvent, EngineEvent, EventBus};
use crate::exchange::{ExchangeAdapter, NetworkSnapshot};
use crate::ledger::LegLedger;
use crate::market::positions::PositionView;
use crate::types::{epoch_secs, PositionSide, Side};

/// Offline escalation thresholds.
const OFFLINE_HITS_THRESHOLD: u32 = 4;
const OFFLINE_ELAPSED_THRESHOLD: f64 = 45.0;

const DEFAULT_MAX_ATTEMPTS: u32 = 12;
const DEFAULT_BASE_DELAY: f64 = 5.0;
const MAX_ATTEMPT_DELAY: f64 = 90.0;
/// Passes over the position list inside one attempt (partial fills shift
/// quantities under us).
const PASSES_PER_ATTEMPT: u32 = 3;

pub struct EmergencyCloser {
    active: Mutex<bool>,
    max_attempts: u32,
    base_delay: f64,
}

impl EmergencyCloser {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(false),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }

    #[cfg(test)]
    fn with_timings(max_attempts: u32, base_delay: f64) -> Self {
        Self {
            active: Mutex::new(false),
            max_attempts,
            base_delay,
        }
    }

    /// Spawn the close-all worker. Returns false when one is already
    /// running (single-flight).
    pub fn dispatch(
        self: &Arc<Self>,
        adapter: Arc<dyn ExchangeAdapter>,
        ledger: Arc<LegLedger>,
        view: Arc<PositionView>,
        bus: Arc<EventBus>,
        reason: String,
        source: String,
    ) -> bool {
        {
            let mut active = self.active.lock();
            if *active {
                return false;
            }
            *active = true;
        }
        warn!(reason, source, "emergency close dispatched");
        let closer = Arc::clone(self);
        tokio::spawn(async move {
            closer.run(adapter, ledger, view, bus, reason, source).await;
        });
        true
    }

    async fn run(
        &self,
        adapter: Arc<dyn ExchangeAdapter>,
        ledger: Arc<LegLedger>,
        view: Arc<PositionView>,
        bus: Arc<EventBus>,
        reason: String,
        source: String,
    ) {
        let requested_at = epoch_secs();
        bus.emit(EngineEvent::EmergencyStarted(EmergencyEvent {
            reason: reason.clone(),
            source: source.clone(),
            requested_at,
            completed_at: None,
            success: None,
            error: None,
        }));

        let mut last_error: Option<String> = None;
        let mut success = false;

        for attempt in 0..self.max_attempts {
            match self.close_all_once(adapter.as_ref()).await {
                Ok(true) => {
                    success = true;
                    break;
                }
                Ok(false) => {
                    last_error = Some("positions still open after attempt".to_string());
                }
                Err(err) => {
                    last_error = Some(err.to_string());
                    error!(attempt, error = %err, "emergency close attempt failed");
                }
            }
            let delay = (self.base_delay * (attempt + 1) as f64).min(MAX_ATTEMPT_DELAY);
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }

        if success {
            // Everything is flat on the exchange; the ledger must agree.
            for (key, _) in ledger.legs_with_qty(None) {
                ledger.drop_leg(&key);
            }
            view.invalidate();
            info!(reason, "emergency close completed; all positions flat");
        } else {
            error!(reason, error = ?last_error, "emergency close exhausted attempts");
        }

        bus.emit(EngineEvent::EmergencyCompleted(EmergencyEvent {
            reason,
            source,
            requested_at,
            completed_at: Some(epoch_secs()),
            success: Some(success),
            error: if success { None } else { last_error },
        }));

        *self.active.lock() = false;
    }

    /// One attempt: up to three passes over the live position list.
    /// Returns Ok(true) when the account reads flat.
    async fn close_all_once(&self, adapter: &dyn ExchangeAdapter) -> ExchangeResult<bool> {
        let dual = adapter.dual_side().await.unwrap_or(false);

        for _pass in 0..PASSES_PER_ATTEMPT {
            let live: Vec<_> = adapter
                .positions()
                .await?
                .into_iter()
                .filter(|p| !p.is_flat())
                .collect();
            if live.is_empty() {
                return Ok(true);
            }

            for pos in &live {
                let close_side = if pos.position_amt > 0.0 {
                    Side::Sell
                } else {
                    Side::Buy
                };
                let position_side: Option<PositionSide> = if dual {
                    Some(if pos.position_amt > 0.0 {
                        PositionSide::Long
                    } else {
                        PositionSide::Short
                    })
                } else {
                    None
                };

                if let Err(err) = adapter.cancel_all_orders(&pos.symbol).await {
                    warn!(symbol = %pos.symbol, error = %err, "cancel before close failed");
                }

                // closePosition first: immune to minQty/step edge cases.
                match adapter
                    .close_position_full(&pos.symbol, close_side, position_side)
                    .await
                {
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(symbol = %pos.symbol, error = %err, "closePosition failed; trying exact close");
                    }
                }

                let qty = crate::exchange::filters::decimal_from_f64(pos.position_amt.abs());
                match adapter
                    .close_leg_exact(&pos.symbol, qty, close_side, position_side)
                    .await
                {
                    Ok(_) => {}
                    Err(ExchangeError::Client { code: -2022, .. }) => {
                        // ReduceOnly rejected: the closePosition path again.
                        adapter
                            .close_position_full(&pos.symbol, close_side, position_side)
                            .await?;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        let still_open = adapter
            .positions()
            .await?
            .into_iter()
            .any(|p| !p.is_flat());
        Ok(!still_open)
    }
}

impl Default for EmergencyCloser {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EmergencyCloser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmergencyCloser")
            .field("active", &*self.active.lock())
            .finish()
    }
}

// =============================================================================
// Network monitor
// =============================================================================

/// Evaluate the adapter's connectivity snapshot and dispatch the emergency
/// closer when the outage crosses the threshold. Returns true when a
/// dispatch happened on this call.
pub fn escalate_if_offline(
    closer: &Arc<EmergencyCloser>,
    adapter: &Arc<dyn ExchangeAdapter>,
    ledger: &Arc<LegLedger>,
    view: &Arc<PositionView>,
    bus: &Arc<EventBus>,
    snapshot: NetworkSnapshot,
    context: &str,
) -> bool {
    if !snapshot.offline || snapshot.emergency_dispatched {
        return false;
    }
    let elapsed = epoch_secs() - snapshot.offline_since;
    if snapshot.offline_hits < OFFLINE_HITS_THRESHOLD && elapsed < OFFLINE_ELAPSED_THRESHOLD {
        return false;
    }
    // At most one dispatch per offline interval.
    if !adapter.network().mark_emergency_dispatched() {
        return false;
    }
    closer.dispatch(
        Arc::clone(adapter),
        Arc::clone(ledger),
        Arc::clone(view),
        Arc::clone(bus),
        format!("network_offline:{context}"),
        "network_monitor".to_string(),
    )
}
