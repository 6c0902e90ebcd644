// =============================================================================
// Meridian — Main Entry Point
// =============================================================================
//
// The engine starts against the testnet unless the config says otherwise;
// switching to live endpoints is an explicit configuration change, never a
// default.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod emergency;
mod error;
mod events;
mod exchange;
mod flip;
mod guards;
mod indicators;
mod journal;
mod ledger;
mod margin;
mod market;
mod risk;
mod signal;
mod sizing;
mod stops;
mod strategy;
#[cfg(test)]
mod testutil;
mod types;

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::BotConfig;
use crate::emergency::EmergencyCloser;
use crate::events::{EngineEvent, EventBus};
use crate::exchange::binance::BinanceUsdFutures;
use crate::exchange::rate_limit::RateLimiterPool;
use crate::exchange::ExchangeAdapter;
use crate::journal::TradeJournal;
use crate::ledger::LegLedger;
use crate::market::klines::KlineCache;
use crate::market::positions::PositionView;
use crate::risk::RiskCoordinator;
use crate::strategy::{build_run_gate, limiter_key, spawn_workers, EngineContext, OrderThrottle};
use crate::types::TradeMode;

const CONFIG_PATH: &str = "meridian_config.json";
const JOURNAL_PATH: &str = "meridian_journal.jsonl";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Trading Engine — Starting Up             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut cfg = BotConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        BotConfig::default()
    });

    // Symbol override from the environment, comma separated.
    if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
        let parsed: Vec<String> = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !parsed.is_empty() {
            cfg.symbols = parsed;
        }
    }

    info!(
        symbols = ?cfg.symbols,
        intervals = ?cfg.intervals,
        mode = %cfg.mode,
        account = %cfg.account_type,
        leverage = cfg.leverage,
        "configuration resolved"
    );
    if cfg.mode == TradeMode::Live {
        warn!("LIVE mode enabled: orders will reach the production exchange");
    }

    // ── 2. Exchange adapter ──────────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        warn!("BINANCE_API_KEY / BINANCE_API_SECRET not set; signed endpoints will fail");
    }

    let limiter_pool = RateLimiterPool::new();
    let (mode, account) = limiter_key(&cfg);
    let limiter = limiter_pool.get(mode, account);
    let adapter: Arc<dyn ExchangeAdapter> =
        Arc::new(BinanceUsdFutures::new(api_key, api_secret, mode, limiter));

    // ── 3. Engine context ────────────────────────────────────────────────
    let ledger = match TradeJournal::open(JOURNAL_PATH) {
        Ok(journal) => LegLedger::with_journal(Arc::new(journal)),
        Err(e) => {
            warn!(error = %e, "journal unavailable; continuing without it");
            LegLedger::new()
        }
    };

    let ctx = EngineContext {
        adapter: adapter.clone(),
        config: Arc::new(RwLock::new(cfg)),
        ledger: Arc::new(ledger),
        view: Arc::new(PositionView::new()),
        cache: Arc::new(KlineCache::new()),
        risk: Arc::new(RiskCoordinator::new(mode == TradeMode::Testnet)),
        bus: Arc::new(EventBus::new()),
        closer: Arc::new(EmergencyCloser::new()),
        throttle: Arc::new(OrderThrottle::new()),
        run_gate: build_run_gate(),
    };

    // ── 4. Event sink ────────────────────────────────────────────────────
    // No UI attached in headless mode; the subscriber mirrors events into
    // the structured log so nothing is silently dropped.
    let mut event_rx = ctx.bus.subscribe();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match &event {
                EngineEvent::Placed(ev) => {
                    info!(symbol = %ev.symbol, side = %ev.side, qty = ev.qty, ok = ev.ok, "event: placed");
                }
                EngineEvent::Close(ev) | EngineEvent::CloseInterval(ev) => {
                    info!(
                        symbol = %ev.symbol,
                        side = %ev.side,
                        qty = ev.qty,
                        pnl = ev.pnl_value,
                        reason = %ev.reason,
                        "event: close"
                    );
                }
                EngineEvent::EmergencyStarted(ev) => {
                    warn!(reason = %ev.reason, source = %ev.source, "event: emergency started");
                }
                EngineEvent::EmergencyCompleted(ev) => {
                    warn!(success = ?ev.success, "event: emergency completed");
                }
            }
        }
    });

    // ── 5. Position mode alignment + startup reconciliation ─────────────
    let want_dual = ctx.config.read().position_mode == types::PositionMode::Hedge;
    match adapter.dual_side().await {
        Ok(current) if current != want_dual => {
            if let Err(e) = adapter.set_dual_side(want_dual).await {
                warn!(error = %e, want_dual, "could not align position mode; keeping exchange setting");
            } else {
                info!(hedge = want_dual, "position mode aligned");
            }
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "position mode unreadable at startup"),
    }

    let dual = adapter.dual_side().await.unwrap_or(false);
    match ctx
        .risk
        .reconcile(adapter.as_ref(), &ctx.ledger, &ctx.view, dual)
        .await
    {
        Ok(report) => info!(?report, "startup reconciliation complete"),
        Err(e) => warn!(error = %e, "startup reconciliation failed; ledger starts empty"),
    }

    // ── 6. Strategy workers ──────────────────────────────────────────────
    let workers = spawn_workers(&ctx);
    if workers.is_empty() {
        error!("no (symbol, interval) pairs to run; exiting");
        return Ok(());
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping workers");

    let stop_ts = types::epoch_secs();
    for (name, flag, stop_time) in &workers {
        *stop_time.lock() = stop_ts;
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
        info!(worker = %name, "stop requested");
    }
    // Give in-flight iterations a moment to land their acks.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    if let Err(e) = ctx.config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("Meridian shut down complete.");
    Ok(())
}
