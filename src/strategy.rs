// =============================================================================
// Strategy Loop — per-(symbol, interval) scheduler and the order pipeline
// =============================================================================
//
// One worker runs per (symbol, interval) pair. Startup applies a
// deterministic phase offset (hashed from the pair name) so many loops do
// not thunder the exchange together; a process-wide semaphore bounds how
// many `run_once` bodies execute concurrently.
//
// run_once:
//   klines -> indicators -> signals -> stop-loss tick -> flat purge ->
//   gates (confirmation, cooldown, duplicates, hold) -> sizing ->
//   risk handshake -> flip -> margin enforcement -> throttled submit ->
//   ledger append + events.
//
// No sync lock is held across an await; every exchange ack settles the
// ledger before the next iteration proceeds.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::BotConfig;
use crate::emergency::{escalate_if_offline, EmergencyCloser};
use crate::error::{ExchangeError, ExchangeResult, Refusal};
use crate::events::{EventBus, PlacedEvent};
use crate::exchange::{ExchangeAdapter, MarketOrderRequest};
use crate::flip::{close_opposite_exposure, verify_no_opposite, FlipResult};
use crate::guards::{
    duplicate_fill_window, flip_cooldown_remaining, guard_window, has_recent_duplicate,
    hold_ready, is_fast_context, sig_key, BarGuard, SigKey,
};
use crate::indicators;
use crate::ledger::{Entry, LegKey, LegLedger};
use crate::margin::{ensure_margin_and_leverage, EnforceOutcome};
use crate::market::klines::KlineCache;
use crate::market::positions::PositionView;
use crate::risk::RiskCoordinator;
use crate::signal::{self, SignalReport};
use crate::sizing::{size_order, wallet_equity, SizingInputs};
use crate::stops::{self, StopTickOutcome};
use crate::types::{epoch_secs, AccountType, Interval, Side, TradeMode};

/// Gate acquisition timeout per loop iteration.
const GATE_TIMEOUT: Duration = Duration::from_millis(250);
/// Order submission retry budget on rate-pressure errors.
const ORDER_MAX_ATTEMPTS: u32 = 3;

/// Concurrency limit heuristic: tight on small hosts, gentle growth after.
pub fn default_parallel_limit(cpu_count: usize) -> usize {
    let cpu = cpu_count.max(1);
    let limit = match cpu {
        1 => 1,
        2 => 2,
        3..=4 => cpu,
        5..=8 => (cpu as f64 * 1.25).round() as usize,
        _ => ((cpu as f64 * 1.5).round() as usize).min(16),
    };
    limit.clamp(1, 16)
}

// =============================================================================
// Order throttle
// =============================================================================

/// Process-wide serializer for order submissions. Holding the reservation
/// spans the REST call, so submissions for a given account are total-ordered
/// with at least `spacing` seconds between consecutive sends.
pub struct OrderThrottle {
    last_sent: Arc<tokio::sync::Mutex<f64>>,
}

impl OrderThrottle {
    pub fn new() -> Self {
        Self {
            last_sent: Arc::new(tokio::sync::Mutex::new(0.0)),
        }
    }

    /// Block until `spacing` seconds have passed since the previous
    /// reservation, then hold the slot until the guard drops.
    pub async fn reserve(&self, spacing: f64) -> tokio::sync::OwnedMutexGuard<f64> {
        let mut guard = Arc::clone(&self.last_sent).lock_owned().await;
        let now = epoch_secs();
        let wait = spacing - (now - *guard);
        if wait > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
        *guard = epoch_secs();
        guard
    }
}

impl Default for OrderThrottle {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Engine context
// =============================================================================

/// Process-wide services, passed to every worker. No singletons: everything
/// is constructed once in main and shared by Arc.
#[derive(Clone)]
pub struct EngineContext {
    pub adapter: Arc<dyn ExchangeAdapter>,
    pub config: Arc<RwLock<BotConfig>>,
    pub ledger: Arc<LegLedger>,
    pub view: Arc<PositionView>,
    pub cache: Arc<KlineCache>,
    pub risk: Arc<RiskCoordinator>,
    pub bus: Arc<EventBus>,
    pub closer: Arc<EmergencyCloser>,
    pub throttle: Arc<OrderThrottle>,
    pub run_gate: Arc<Semaphore>,
}

// =============================================================================
// Worker
// =============================================================================

pub struct StrategyWorker {
    ctx: EngineContext,
    symbol: String,
    interval: Interval,
    /// Per-engine copy of the bar guard; the global one lives in the risk
    /// coordinator.
    bar_local: BarGuard,
    phase_seed: f64,
    stop: Arc<AtomicBool>,
    stop_time: Arc<Mutex<f64>>,
    offline_backoff: Mutex<f64>,
    last_offline_log: Mutex<f64>,
}

/// Deterministic per-pair seed in [0, 1).
fn phase_seed(symbol: &str, interval: &str) -> f64 {
    let mut hasher = DefaultHasher::new();
    format!("{symbol}@{interval}").hash(&mut hasher);
    (hasher.finish() % 1000) as f64 / 1000.0
}

impl StrategyWorker {
    pub fn new(ctx: EngineContext, symbol: impl Into<String>, interval: Interval) -> Self {
        let symbol = symbol.into().to_ascii_uppercase();
        let seed = phase_seed(&symbol, interval.as_str());
        Self {
            ctx,
            symbol,
            interval,
            bar_local: BarGuard::new(),
            phase_seed: seed,
            stop: Arc::new(AtomicBool::new(false)),
            stop_time: Arc::new(Mutex::new(0.0)),
            offline_backoff: Mutex::new(0.0),
            last_offline_log: Mutex::new(0.0),
        }
    }

    /// Handle used to stop the worker cooperatively; any order whose origin
    /// precedes the stop time is dropped.
    pub fn stop_handle(&self) -> (Arc<AtomicBool>, Arc<Mutex<f64>>) {
        (Arc::clone(&self.stop), Arc::clone(&self.stop_time))
    }

    pub fn stop(&self) {
        *self.stop_time.lock() = epoch_secs();
        self.stop.store(true, Ordering::SeqCst);
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleep in half-second chunks so stop requests land within 250 ms.
    async fn interruptible_sleep(&self, mut remaining: f64) {
        while remaining > 0.0 && !self.stopped() {
            let chunk = remaining.min(0.5);
            tokio::time::sleep(Duration::from_secs_f64(chunk)).await;
            remaining -= chunk;
        }
    }

    // -------------------------------------------------------------------------
    // The loop
    // -------------------------------------------------------------------------

    pub async fn run_loop(self) {
        let interval_secs = self.interval.seconds_f64().max(1.0);
        info!(symbol = %self.symbol, interval = %self.interval, "loop start");

        // Phase offset so parallel pairs stagger their wakeups.
        let phase_span = (interval_secs * 0.35).clamp(2.0, 10.0);
        self.interruptible_sleep(self.phase_seed * phase_span).await;

        while !self.stopped() {
            let started = epoch_secs();
            let mut sleep_override: Option<f64> = None;

            let permit =
                tokio::time::timeout(GATE_TIMEOUT, Arc::clone(&self.ctx.run_gate).acquire_owned())
                    .await;
            match permit {
                Ok(Ok(_permit)) => {
                    match self.run_once().await {
                        Ok(()) => {
                            *self.offline_backoff.lock() = 0.0;
                            *self.last_offline_log.lock() = 0.0;
                        }
                        Err(err) if err.is_network() => {
                            sleep_override = Some(self.handle_network_outage(&err));
                        }
                        Err(err) => {
                            error!(
                                symbol = %self.symbol,
                                interval = %self.interval,
                                error = %err,
                                "loop iteration failed"
                            );
                        }
                    }
                }
                Ok(Err(_)) => break, // gate closed: engine shutting down
                Err(_) => continue,  // gate busy; try again immediately
            }

            let elapsed = epoch_secs() - started;
            let sleep_for = match sleep_override {
                Some(s) => s,
                None => {
                    let mut remaining = (interval_secs - elapsed).max(0.0);
                    if interval_secs > 1.0 && remaining > 0.0 {
                        remaining += self.phase_seed * (interval_secs * 0.05).clamp(0.1, 0.75);
                    }
                    remaining
                }
            };
            self.interruptible_sleep(sleep_for).await;
        }
        info!(symbol = %self.symbol, interval = %self.interval, "loop stopped");
    }

    /// Offline backoff ladder: 5 s, then *1.5 up to 90 s; escalation to the
    /// emergency closer happens at the monitor thresholds.
    fn handle_network_outage(&self, err: &ExchangeError) -> f64 {
        let mut backoff = self.offline_backoff.lock();
        *backoff = if *backoff <= 0.0 {
            5.0
        } else {
            (*backoff * 1.5).clamp(5.0, 90.0)
        };

        let snapshot = self.ctx.adapter.network().snapshot();
        let dispatched = escalate_if_offline(
            &self.ctx.closer,
            &self.ctx.adapter,
            &self.ctx.ledger,
            &self.ctx.view,
            &self.ctx.bus,
            snapshot,
            &format!("{}@{}", self.symbol, self.interval),
        );

        let mut last_log = self.last_offline_log.lock();
        let now = epoch_secs();
        if now - *last_log >= 8.0 {
            *last_log = now;
            let note = if dispatched || snapshot.emergency_dispatched {
                "emergency close queued"
            } else {
                "monitoring"
            };
            warn!(
                symbol = %self.symbol,
                interval = %self.interval,
                error = %err,
                note,
                retry_in = format!("{:.0}s", *backoff),
                "network offline"
            );
        }
        *backoff
    }

    // -------------------------------------------------------------------------
    // One evaluation
    // -------------------------------------------------------------------------

    pub async fn run_once(&self) -> ExchangeResult<()> {
        let cfg = self.ctx.config.read().clone();
        let adapter = self.ctx.adapter.as_ref();

        let klines = self
            .ctx
            .cache
            .fetch(adapter, &self.symbol, &self.interval, cfg.lookback)
            .await?;
        if klines.len() < 2 {
            debug!(symbol = %self.symbol, "insufficient kline history");
            return Ok(());
        }
        let bar_id = klines[klines.len() - 1].open_time;
        let last_price = klines[klines.len() - 1].close;

        let dual = adapter.dual_side().await.unwrap_or(false);

        // Stop-loss runs every tick, before any new entries.
        let stop_outcome = stops::run_tick(
            adapter,
            &self.ctx.ledger,
            &self.ctx.view,
            &self.ctx.bus,
            &cfg.stop_loss,
            &self.symbol,
            self.interval.as_str(),
            last_price,
            dual,
        )
        .await?;
        if stop_outcome == StopTickOutcome::EntireAccountTriggered {
            self.ctx.closer.dispatch(
                Arc::clone(&self.ctx.adapter),
                Arc::clone(&self.ctx.ledger),
                Arc::clone(&self.ctx.view),
                Arc::clone(&self.ctx.bus),
                "entire_account_stop".to_string(),
                "stop_loss".to_string(),
            );
            self.stop();
            return Ok(());
        }

        // Legs the exchange no longer backs are purged before new decisions.
        self.ctx
            .risk
            .purge_flats(adapter, &self.ctx.ledger, &self.ctx.view, &self.symbol, dual)
            .await?;

        let series = indicators::compute(&klines, &cfg.indicators);
        let report = signal::generate(&klines, &series, &cfg);
        let side = match report.primary {
            Some(side) => side,
            None => return Ok(()),
        };

        self.execute_signal(&cfg, &report, side, bar_id, last_price, dual)
            .await
    }

    /// Gate, size, and submit one entry order for `side`.
    async fn execute_signal(
        &self,
        cfg: &BotConfig,
        report: &SignalReport,
        side: Side,
        bar_id: i64,
        last_price: f64,
        dual: bool,
    ) -> ExchangeResult<()> {
        let adapter = self.ctx.adapter.as_ref();
        let interval_secs = self.interval.seconds_f64();
        let now = epoch_secs();
        let origin_ts = now;

        // --- Which indicators survive the per-indicator gates? --------------
        let mut tokens: Vec<String> = Vec::new();
        for (token, &action) in &report.actions {
            if action != side {
                continue;
            }
            // Flip cooldown per indicator.
            let remaining = flip_cooldown_remaining(
                self.ctx
                    .ledger
                    .last_action(&self.symbol, self.interval.as_str(), token),
                side,
                cfg.indicator_flip_cooldown_seconds,
                cfg.indicator_flip_cooldown_bars,
                interval_secs,
                now,
            );
            if remaining > 0.0 {
                self.log_refusal(side, &Refusal::FlipCooldown { remaining });
                continue;
            }
            // N-bar confirmation.
            let required = cfg.indicator_flip_confirmation_bars.max(1);
            if required > 1 {
                let count = self.ctx.ledger.record_signal(
                    &self.symbol,
                    self.interval.as_str(),
                    token,
                    side,
                    interval_secs * (required as f64 + 1.0),
                );
                if count < required {
                    self.log_refusal(
                        side,
                        &Refusal::AwaitingConfirmation {
                            seen: count,
                            required,
                        },
                    );
                    continue;
                }
                self.ctx
                    .ledger
                    .clear_signal(&self.symbol, self.interval.as_str(), token);
            }
            tokens.push(token.clone());
        }
        if tokens.is_empty() {
            return Ok(());
        }

        let base_sig: SigKey = sig_key(&tokens);
        let leg_key = LegKey::new(&self.symbol, self.interval.as_str(), side);

        // --- Duplicate pending-fill guard ------------------------------------
        let dup_window = duplicate_fill_window(interval_secs);
        let entries_here = self.ctx.ledger.entries_for(&leg_key);
        if has_recent_duplicate(&entries_here, &base_sig, dup_window, now) {
            let live = self
                .ctx
                .view
                .live_qty(adapter, &self.symbol, side, dual, false)
                .await?;
            if live > 0.0 {
                self.log_refusal(side, &Refusal::DuplicatePendingFill);
                return Ok(());
            }
        }

        // --- Flip override + min-hold ----------------------------------------
        let opposite = side.opposite();
        let flipping = tokens.iter().any(|t| {
            self.ctx
                .ledger
                .has_open(&self.symbol, self.interval.as_str(), t, opposite)
        });
        if flipping {
            // Entries younger than min-hold cannot be closed by flip logic.
            let opposite_key = LegKey::new(&self.symbol, self.interval.as_str(), opposite);
            let all_held = self
                .ctx
                .ledger
                .entries_for(&opposite_key)
                .iter()
                .all(|e| {
                    hold_ready(
                        e.timestamp,
                        now,
                        cfg.indicator_min_position_hold_seconds,
                        cfg.indicator_min_position_hold_bars,
                        interval_secs,
                    )
                });
            if !all_held {
                debug!(
                    symbol = %self.symbol,
                    interval = %self.interval,
                    %side,
                    "flip deferred: opposite entries inside min-hold window"
                );
                return Ok(());
            }
        }

        // --- Sizing -----------------------------------------------------------
        let account = self.ctx.view.account(adapter, false).await?;
        let equity = wallet_equity(
            account.wallet_balance,
            account.available_balance,
            account.available_balance,
            self.ctx.ledger.total_margin(),
        );
        let leverage = adapter.clamp_leverage(&self.symbol, cfg.leverage);
        let filters = adapter.symbol_filters(&self.symbol).await?;
        let indicator_key = if tokens.len() == 1 {
            Some(tokens[0].clone())
        } else {
            None
        };
        let entries_side_all = self.ctx.ledger.entries_on_side(&self.symbol, side);

        let sized = match size_order(&SizingInputs {
            symbol: &self.symbol,
            interval: self.interval.as_str(),
            side,
            price: last_price,
            wallet_total: equity,
            available: account.available_balance,
            pct: cfg.position_fraction(),
            leverage,
            filters: &filters,
            tolerance: cfg.margin_tolerance_fraction(),
            max_auto_bump_percent: cfg.max_auto_bump_percent,
            auto_bump_percent_multiplier: cfg.auto_bump_percent_multiplier,
            flip_qty_override: None,
            indicator_key: indicator_key.clone(),
            signature: base_sig.clone(),
            entries_side_all,
        }) {
            Ok(out) => out,
            Err(refusal) => {
                self.log_refusal(side, &refusal);
                return Ok(());
            }
        };
        let full_sig: SigKey = sized.signature.clone();

        // --- Bar guards (engine-local, then global via the coordinator) ------
        if !self
            .bar_local
            .allows(&self.symbol, self.interval.as_str(), side, bar_id, &full_sig)
        {
            self.log_refusal(side, &Refusal::BarGuardLocal);
            return Ok(());
        }
        let window = guard_window(interval_secs, is_fast_context(&full_sig));
        if let Err(refusal) = self.ctx.risk.begin_open(
            &self.symbol,
            self.interval.as_str(),
            side,
            bar_id,
            &full_sig,
            window,
            flipping,
        ) {
            self.log_refusal(side, &refusal);
            return Ok(());
        }

        // Every exit below must resolve the claim.
        let abort = |refusal: &Refusal| {
            self.ctx.risk.abort_open(&self.symbol, side, &full_sig);
            self.log_refusal(side, refusal);
        };

        // --- Flip: flatten opposite exposure ---------------------------------
        let mut flip_qty_closed = 0.0;
        if flipping {
            match close_opposite_exposure(
                adapter,
                &self.ctx.ledger,
                &self.ctx.view,
                &self.ctx.bus,
                &self.symbol,
                self.interval.as_str(),
                side,
                &tokens,
                dual,
                last_price,
            )
            .await?
            {
                FlipResult::Clear { closed_qty } => flip_qty_closed = closed_qty,
                FlipResult::Blocked => {
                    abort(&Refusal::ConflictResidual);
                    return Ok(());
                }
            }
        }

        // --- Final exchange-side verification --------------------------------
        let opposite_allowed = dual && cfg.allow_opposite_positions;
        if !opposite_allowed
            && !verify_no_opposite(adapter, &self.ctx.view, &self.symbol, side, dual).await?
        {
            abort(&Refusal::ConflictResidual);
            return Ok(());
        }

        // --- One-way add-only guard ------------------------------------------
        let mut order_qty = sized.qty;
        let mut reduce_only = false;
        if cfg.add_only && !dual {
            let net: f64 = self
                .ctx
                .view
                .positions(adapter, false)
                .await?
                .iter()
                .filter(|p| p.symbol == self.symbol)
                .map(|p| p.position_amt)
                .sum();
            let opposes = (net > 0.0 && side == Side::Sell) || (net < 0.0 && side == Side::Buy);
            if opposes {
                let cap = crate::exchange::filters::decimal_from_f64(net.abs());
                if cap < order_qty {
                    order_qty = cap;
                }
                reduce_only = true;
                if order_qty <= rust_decimal::Decimal::ZERO {
                    abort(&Refusal::AddOnlyBlocked);
                    return Ok(());
                }
            }
        }

        // --- Margin mode + leverage ------------------------------------------
        match ensure_margin_and_leverage(adapter, &self.symbol, cfg.margin_mode, Some(leverage))
            .await?
        {
            EnforceOutcome::Ready => {}
            EnforceOutcome::Refused(refusal) => {
                abort(&refusal);
                return Ok(());
            }
        }

        // --- Sizing again for flips: cover the closed quantity ---------------
        let final_qty = if flip_qty_closed > 0.0 {
            let flip_cover = crate::exchange::filters::decimal_from_f64(flip_qty_closed);
            order_qty.max(flip_cover)
        } else {
            order_qty
        };

        // --- Submit, serialized and retried under rate pressure --------------
        if self.stopped() || origin_ts <= *self.stop_time.lock() {
            abort(&Refusal::Stopping);
            return Ok(());
        }

        let request = MarketOrderRequest {
            symbol: self.symbol.clone(),
            side,
            qty: final_qty,
            price_hint: last_price,
            position_side: dual.then(|| side.position_side()),
            reduce_only,
            client_order_id: None,
        };

        let mut ack = None;
        let mut last_err: Option<ExchangeError> = None;
        for attempt in 1..=ORDER_MAX_ATTEMPTS {
            let _slot = self.ctx.throttle.reserve(cfg.order_rate_min_spacing).await;
            if self.stopped() {
                break;
            }
            match adapter.place_market_order(&request).await {
                Ok(a) => {
                    ack = Some(a);
                    break;
                }
                Err(err) if err.is_rate_pressure() && attempt < ORDER_MAX_ATTEMPTS => {
                    let wait = (cfg.order_rate_retry_backoff * attempt as f64).min(5.0);
                    warn!(
                        symbol = %self.symbol,
                        attempt,
                        error = %err,
                        "order rate pressure; retrying in {wait:.2}s"
                    );
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                }
                Err(err) => {
                    last_err = Some(err);
                    break;
                }
            }
        }

        let ack = match ack {
            Some(a) => a,
            None => {
                self.ctx.risk.end_open(
                    &self.symbol,
                    self.interval.as_str(),
                    side,
                    bar_id,
                    &full_sig,
                    false,
                );
                let err_text = last_err
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "stopped".to_string());
                warn!(symbol = %self.symbol, %side, error = %err_text, "order failed");
                self.emit_placed(cfg, report, side, 0.0, last_price, 0.0, &tokens, false, None);
                return Ok(());
            }
        };

        // --- Settle: ledger, guards, journal, events -------------------------
        self.bar_local
            .commit(&self.symbol, self.interval.as_str(), side, bar_id, &full_sig);
        self.ctx.risk.end_open(
            &self.symbol,
            self.interval.as_str(),
            side,
            bar_id,
            &full_sig,
            true,
        );
        self.ctx.view.invalidate();

        let executed = ack.effective_qty();
        let fill_price = if ack.avg_price > 0.0 {
            ack.avg_price
        } else {
            last_price
        };
        let margin = executed * fill_price / leverage.max(1) as f64;

        let entry = Entry {
            ledger_id: Entry::new_id(),
            qty: executed,
            entry_price: fill_price,
            leverage,
            margin_usdt: margin,
            trigger_signature: full_sig.clone(),
            indicator_keys: tokens.clone(),
            timestamp: epoch_secs(),
            fees_usdt: ack.fills.as_ref().map(|f| f.commission_usdt),
            entry_realized_usdt: ack.fills.as_ref().map(|f| f.net_realized),
        };
        match self.ctx.ledger.append_entry(&leg_key, entry) {
            Ok(conflicts) => {
                // The flip already ran; anything left here is a safety net.
                for conflict in conflicts {
                    warn!(
                        indicator = %conflict.indicator,
                        leg = %conflict.leg_key,
                        "conflict survived flip; scheduling indicator close"
                    );
                    let _ = close_opposite_exposure(
                        adapter,
                        &self.ctx.ledger,
                        &self.ctx.view,
                        &self.ctx.bus,
                        &self.symbol,
                        self.interval.as_str(),
                        side,
                        &[conflict.indicator.clone()],
                        dual,
                        last_price,
                    )
                    .await;
                }
            }
            Err(err) => error!(symbol = %self.symbol, error = %err, "ledger append failed"),
        }

        info!(
            symbol = %self.symbol,
            interval = %self.interval,
            %side,
            qty = executed,
            price = fill_price,
            margin_usdt = margin,
            signature = ?full_sig,
            mode = sized.mode,
            "entry placed"
        );
        self.emit_placed(
            cfg,
            report,
            side,
            executed,
            fill_price,
            ack.avg_price,
            &tokens,
            true,
            Some(&ack),
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_placed(
        &self,
        cfg: &BotConfig,
        report: &SignalReport,
        side: Side,
        qty: f64,
        price: f64,
        avg_price: f64,
        tokens: &[String],
        ok: bool,
        ack: Option<&crate::exchange::OrderAck>,
    ) {
        self.ctx.bus.emit_placed(PlacedEvent {
            symbol: self.symbol.clone(),
            interval: self.interval.as_str().to_string(),
            side,
            qty,
            price,
            avg_price,
            leverage: cfg.leverage,
            trigger_indicators: tokens.to_vec(),
            trigger_desc: report.trigger_desc.clone(),
            time: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            status: if ok { "placed" } else { "error" }.to_string(),
            ok,
            order_id: ack.and_then(|a| a.order_id),
            client_order_id: ack.and_then(|a| a.client_order_id.clone()),
            commission_usdt: ack.and_then(|a| a.fills.as_ref().map(|f| f.commission_usdt)),
            net_realized_usdt: ack.and_then(|a| a.fills.as_ref().map(|f| f.net_realized)),
        });
    }

    fn log_refusal(&self, side: Side, refusal: &Refusal) {
        info!(
            symbol = %self.symbol,
            interval = %self.interval,
            %side,
            "{refusal}"
        );
    }
}

// =============================================================================
// Engine assembly
// =============================================================================

/// Build the run gate from the host's core count.
pub fn build_run_gate() -> Arc<Semaphore> {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    Arc::new(Semaphore::new(default_parallel_limit(cores)))
}

/// Spawn one worker per configured (symbol, interval) pair; returns the
/// workers' stop callbacks.
pub fn spawn_workers(ctx: &EngineContext) -> Vec<(String, Arc<AtomicBool>, Arc<Mutex<f64>>)> {
    let cfg = ctx.config.read().clone();
    let mut handles = Vec::new();
    for symbol in &cfg.symbols {
        for label in &cfg.intervals {
            let interval = match Interval::parse(label) {
                Some(iv) => iv,
                None => {
                    warn!(interval = %label, "unparseable interval skipped");
                    continue;
                }
            };
            let worker = StrategyWorker::new(ctx.clone(), symbol.clone(), interval);
            let (flag, stop_time) = worker.stop_handle();
            handles.push((format!("{symbol}@{label}"), flag, stop_time));
            tokio::spawn(worker.run_loop());
        }
    }
    info!(count = handles.len(), "strategy workers spawned");
    handles
}

/// Which limiter profile the engine uses, from config.
pub fn limiter_key(cfg: &BotConfig) -> (TradeMode, AccountType) {
    (cfg.mode, cfg.account_type)
}
