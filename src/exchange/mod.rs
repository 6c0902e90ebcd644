// =============================================================================
// Exchange Adapter — uniform capability surface over vendor REST APIs
// =============================================================================
//
// The core talks to exchanges exclusively through `ExchangeAdapter`. Vendor
// payload shapes, enum spellings, and error formats are normalized behind
// this trait; nothing above it reads raw JSON fields. All operations return
// `Result<T, ExchangeError>` with the taxonomy from `crate::error`.
// =============================================================================

pub mod binance;
pub mod filters;
pub mod rate_limit;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ExchangeResult;
use crate::market::klines::Kline;
use crate::types::{epoch_secs, AccountType, Interval, MarginMode, PositionSide, Side, TradeMode};

use self::filters::SymbolFilters;

// =============================================================================
// Plain data shapes
// =============================================================================

/// Best bid/ask snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookTicker {
    pub bid: f64,
    pub ask: f64,
}

/// A concrete, filter-snapped market order ready for submission.
#[derive(Debug, Clone)]
pub struct MarketOrderRequest {
    pub symbol: String,
    pub side: Side,
    /// Already snapped to the step grid.
    pub qty: Decimal,
    /// Price used for sizing; informational only for MARKET orders.
    pub price_hint: f64,
    pub position_side: Option<PositionSide>,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

/// Aggregated user-trade view of one order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FillSummary {
    pub filled_qty: f64,
    pub avg_price: f64,
    pub realized_pnl: f64,
    pub commission_usdt: f64,
    pub net_realized: f64,
    pub trade_count: u32,
}

/// Normalized order acknowledgement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: Option<u64>,
    pub client_order_id: Option<String>,
    pub orig_qty: f64,
    pub executed_qty: f64,
    pub avg_price: f64,
    pub status: String,
    #[serde(default)]
    pub fills: Option<FillSummary>,
}

impl OrderAck {
    /// Best available filled quantity: executed when reported, else the
    /// original request.
    pub fn effective_qty(&self) -> f64 {
        if self.executed_qty > 0.0 {
            self.executed_qty
        } else {
            self.orig_qty
        }
    }
}

/// Normalized live position row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    /// Signed: positive long, negative short.
    pub position_amt: f64,
    pub entry_price: f64,
    pub leverage: f64,
    pub unrealized_pnl: f64,
    pub position_side: PositionSide,
    pub isolated_wallet: f64,
    pub isolated_margin: f64,
    pub initial_margin: f64,
    pub maint_margin: f64,
    pub margin_ratio: f64,
    pub liquidation_price: f64,
    pub notional: f64,
    pub margin_type: Option<MarginMode>,
    pub update_time: u64,
}

impl PositionInfo {
    pub fn is_flat(&self) -> bool {
        self.position_amt.abs() <= flat_epsilon(self.position_amt)
    }

    /// Which engine side this exposure belongs to.
    pub fn engine_side(&self) -> Option<Side> {
        match self.position_side {
            PositionSide::Long => Some(Side::Buy),
            PositionSide::Short => Some(Side::Sell),
            PositionSide::Both => {
                if self.position_amt > 0.0 {
                    Some(Side::Buy)
                } else if self.position_amt < 0.0 {
                    Some(Side::Sell)
                } else {
                    None
                }
            }
        }
    }

    /// Allocated margin with the fallback chain: isolatedMargin ->
    /// isolatedWallet -> initialMargin -> notional / leverage.
    pub fn allocated_margin(&self) -> f64 {
        for candidate in [self.isolated_margin, self.isolated_wallet, self.initial_margin] {
            if candidate > 0.0 {
                return candidate;
            }
        }
        let notional = if self.notional.abs() > 0.0 {
            self.notional.abs()
        } else {
            self.entry_price * self.position_amt.abs()
        };
        if self.leverage > 0.0 && notional > 0.0 {
            notional / self.leverage
        } else {
            notional
        }
    }
}

/// Tolerance below which a reported position is considered flat.
pub fn flat_epsilon(qty: f64) -> f64 {
    (qty.abs() * 1e-6).max(1e-8)
}

/// Normalized account totals (USDT terms).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub wallet_balance: f64,
    pub available_balance: f64,
    pub margin_balance: f64,
    pub unrealized_pnl: f64,
}

// =============================================================================
// Network state
// =============================================================================

/// Connectivity bookkeeping fed by adapter request outcomes and consumed by
/// the network monitor (emergency escalation).
pub struct NetworkState {
    inner: Mutex<NetworkInner>,
}

#[derive(Debug, Clone, Copy, Default)]
struct NetworkInner {
    offline: bool,
    offline_since: f64,
    offline_hits: u32,
    emergency_dispatched: bool,
}

/// Snapshot handed to the monitor.
#[derive(Debug, Clone, Copy)]
pub struct NetworkSnapshot {
    pub offline: bool,
    pub offline_since: f64,
    pub offline_hits: u32,
    pub emergency_dispatched: bool,
}

impl NetworkState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(NetworkInner::default()),
        }
    }

    /// A request failed with a connectivity error.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        if !inner.offline {
            inner.offline = true;
            inner.offline_since = epoch_secs();
            inner.offline_hits = 1;
        } else {
            inner.offline_hits = inner.offline_hits.saturating_add(1);
        }
    }

    /// A request succeeded; clears all counters.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        *inner = NetworkInner::default();
    }

    /// Mark that the emergency closer has been dispatched for the current
    /// offline interval. Returns false when already dispatched.
    pub fn mark_emergency_dispatched(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.emergency_dispatched {
            false
        } else {
            inner.emergency_dispatched = true;
            true
        }
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        let inner = self.inner.lock();
        NetworkSnapshot {
            offline: inner.offline,
            offline_since: inner.offline_since,
            offline_hits: inner.offline_hits,
            emergency_dispatched: inner.emergency_dispatched,
        }
    }
}

impl Default for NetworkState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// The adapter trait
// =============================================================================

/// Uniform exchange capability set consumed by the core. One implementation
/// per vendor SDK; all of them normalize payloads to the plain shapes above.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn account_type(&self) -> AccountType;
    fn trade_mode(&self) -> TradeMode;

    // --- Market data --------------------------------------------------------
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &Interval,
        limit: u32,
    ) -> ExchangeResult<Vec<Kline>>;

    /// Paginated fetch covering [start_ms, end_ms], de-duplicated on
    /// open_time and stitched across pages.
    async fn get_klines_range(
        &self,
        symbol: &str,
        interval: &Interval,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> ExchangeResult<Vec<Kline>>;

    async fn last_price(&self, symbol: &str) -> ExchangeResult<f64>;

    async fn book_ticker(&self, symbol: &str) -> ExchangeResult<BookTicker>;

    // --- Filters ------------------------------------------------------------
    async fn symbol_filters(&self, symbol: &str) -> ExchangeResult<SymbolFilters>;

    fn clamp_leverage(&self, symbol: &str, requested: u32) -> u32;

    // --- Trading ------------------------------------------------------------
    async fn place_market_order(&self, req: &MarketOrderRequest) -> ExchangeResult<OrderAck>;

    /// Reduce-only market close of exactly `qty`. Falls back to an IOC limit
    /// at a crossed spread on `-1106` (reduceOnly not required).
    async fn close_leg_exact(
        &self,
        symbol: &str,
        qty: Decimal,
        side: Side,
        position_side: Option<PositionSide>,
    ) -> ExchangeResult<OrderAck>;

    /// Market close of the entire position via closePosition=true.
    async fn close_position_full(
        &self,
        symbol: &str,
        side: Side,
        position_side: Option<PositionSide>,
    ) -> ExchangeResult<OrderAck>;

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()>;

    async fn summarize_fills(&self, symbol: &str, order_id: u64) -> ExchangeResult<FillSummary>;

    // --- Account ------------------------------------------------------------
    async fn positions(&self) -> ExchangeResult<Vec<PositionInfo>>;

    async fn account_snapshot(&self) -> ExchangeResult<AccountSnapshot>;

    async fn dual_side(&self) -> ExchangeResult<bool>;

    async fn set_dual_side(&self, dual: bool) -> ExchangeResult<()>;

    /// Current margin type for the symbol, when the exchange reports one.
    async fn margin_type(&self, symbol: &str) -> ExchangeResult<Option<MarginMode>>;

    async fn change_margin_type(&self, symbol: &str, mode: MarginMode) -> ExchangeResult<()>;

    /// Returns the applied leverage.
    async fn change_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<u32>;

    // --- Connectivity -------------------------------------------------------
    fn network(&self) -> &NetworkState;

    /// Seconds until a registered ban lifts; zero when requests may flow.
    fn ban_remaining(&self) -> f64;
}
