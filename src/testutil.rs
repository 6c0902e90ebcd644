// =============================================================================
// Test support — in-memory ExchangeAdapter double
// =============================================================================
//
// The mock serves scripted data and records every mutating call so pipeline
// tests can assert on exact order flow without any network. Closes can
// optionally auto-flatten the scripted positions, mimicking the exchange
// applying a reduce-only fill.
// =============================================================================
#![cfg(test)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::filters::SymbolFilters;
use crate::exchange::{
    AccountSnapshot, BookTicker, ExchangeAdapter, FillSummary, MarketOrderRequest, NetworkState,
    OrderAck, PositionInfo,
};
use crate::market::klines::Kline;
use crate::types::{AccountType, Interval, MarginMode, PositionSide, Side, TradeMode};

#[derive(Default)]
struct MockState {
    klines: Vec<Kline>,
    kline_fetches: u32,
    net_fail_klines: u32,
    ban_remaining: f64,
    price: f64,
    book: Option<BookTicker>,
    positions: Vec<PositionInfo>,
    account: AccountSnapshot,
    dual: bool,
    filters: SymbolFilters,
    placed: Vec<MarketOrderRequest>,
    closes: Vec<(String, f64, Side, Option<PositionSide>)>,
    full_closes: Vec<(String, Side, Option<PositionSide>)>,
    cancels: Vec<String>,
    margin_type: Option<MarginMode>,
    margin_changes: Vec<(String, MarginMode)>,
    leverage_changes: Vec<(String, u32)>,
    fail_close_1106: u32,
    reject_place_code: Option<i64>,
    auto_flatten_on_close: bool,
    next_fill: Option<FillSummary>,
}

pub struct MockExchange {
    state: Mutex<MockState>,
    network: NetworkState,
}

impl MockExchange {
    pub fn new() -> Self {
        let mut state = MockState::default();
        state.price = 20_000.0;
        Self {
            state: Mutex::new(state),
            network: NetworkState::new(),
        }
    }

    // --- scripting ----------------------------------------------------------

    pub fn set_klines(&self, klines: Vec<Kline>) {
        self.state.lock().klines = klines;
    }

    pub fn set_price(&self, price: f64) {
        self.state.lock().price = price;
    }

    pub fn set_book(&self, bid: f64, ask: f64) {
        self.state.lock().book = Some(BookTicker { bid, ask });
    }

    pub fn set_positions(&self, positions: Vec<PositionInfo>) {
        self.state.lock().positions = positions;
    }

    pub fn set_account(&self, account: AccountSnapshot) {
        self.state.lock().account = account;
    }

    pub fn set_dual(&self, dual: bool) {
        self.state.lock().dual = dual;
    }

    pub fn set_filters(&self, filters: SymbolFilters) {
        self.state.lock().filters = filters;
    }

    pub fn set_margin_type(&self, mode: Option<MarginMode>) {
        self.state.lock().margin_type = mode;
    }

    pub fn set_ban_remaining(&self, secs: f64) {
        self.state.lock().ban_remaining = secs;
    }

    pub fn fail_next_klines_with_network(&self, count: u32) {
        self.state.lock().net_fail_klines = count;
    }

    pub fn fail_next_close_with_1106(&self, count: u32) {
        self.state.lock().fail_close_1106 = count;
    }

    pub fn reject_places_with(&self, code: i64) {
        self.state.lock().reject_place_code = Some(code);
    }

    pub fn allow_places(&self) {
        self.state.lock().reject_place_code = None;
    }

    pub fn auto_flatten_on_close(&self, enabled: bool) {
        self.state.lock().auto_flatten_on_close = enabled;
    }

    pub fn set_next_fill(&self, fill: FillSummary) {
        self.state.lock().next_fill = Some(fill);
    }

    // --- assertions ---------------------------------------------------------

    pub fn kline_fetches(&self) -> u32 {
        self.state.lock().kline_fetches
    }

    pub fn placed_orders(&self) -> Vec<MarketOrderRequest> {
        self.state.lock().placed.clone()
    }

    pub fn closes(&self) -> Vec<(String, f64, Side, Option<PositionSide>)> {
        self.state.lock().closes.clone()
    }

    pub fn full_closes(&self) -> Vec<(String, Side, Option<PositionSide>)> {
        self.state.lock().full_closes.clone()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.state.lock().cancels.clone()
    }

    pub fn margin_changes(&self) -> Vec<(String, MarginMode)> {
        self.state.lock().margin_changes.clone()
    }

    pub fn leverage_changes(&self) -> Vec<(String, u32)> {
        self.state.lock().leverage_changes.clone()
    }

    fn flatten(state: &mut MockState, symbol: &str, closed_qty: f64, close_side: Side) {
        if !state.auto_flatten_on_close {
            return;
        }
        for pos in state.positions.iter_mut().filter(|p| p.symbol == symbol) {
            // Closing SELL reduces a long; closing BUY reduces a short.
            let reduces_long = close_side == Side::Sell && pos.position_amt > 0.0;
            let reduces_short = close_side == Side::Buy && pos.position_amt < 0.0;
            if reduces_long {
                pos.position_amt = (pos.position_amt - closed_qty).max(0.0);
            } else if reduces_short {
                pos.position_amt = (pos.position_amt + closed_qty).min(0.0);
            }
        }
        state.positions.retain(|p| p.position_amt.abs() > 1e-12);
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    fn account_type(&self) -> AccountType {
        AccountType::Futures
    }

    fn trade_mode(&self) -> TradeMode {
        TradeMode::Testnet
    }

    async fn get_klines(
        &self,
        _symbol: &str,
        _interval: &Interval,
        limit: u32,
    ) -> ExchangeResult<Vec<Kline>> {
        let mut state = self.state.lock();
        if state.net_fail_klines > 0 {
            state.net_fail_klines -= 1;
            self.network.record_failure();
            return Err(ExchangeError::network("mock: connection refused"));
        }
        state.kline_fetches += 1;
        self.network.record_success();
        let klines = state.klines.clone();
        let take = klines.len().min(limit as usize);
        Ok(klines[klines.len() - take..].to_vec())
    }

    async fn get_klines_range(
        &self,
        symbol: &str,
        interval: &Interval,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> ExchangeResult<Vec<Kline>> {
        let all = self.get_klines(symbol, interval, limit).await?;
        Ok(all
            .into_iter()
            .filter(|k| k.open_time >= start_ms && k.open_time <= end_ms)
            .collect())
    }

    async fn last_price(&self, _symbol: &str) -> ExchangeResult<f64> {
        Ok(self.state.lock().price)
    }

    async fn book_ticker(&self, _symbol: &str) -> ExchangeResult<BookTicker> {
        let state = self.state.lock();
        Ok(state.book.unwrap_or(BookTicker {
            bid: state.price * 0.9999,
            ask: state.price * 1.0001,
        }))
    }

    async fn symbol_filters(&self, _symbol: &str) -> ExchangeResult<SymbolFilters> {
        Ok(self.state.lock().filters.clone())
    }

    fn clamp_leverage(&self, _symbol: &str, requested: u32) -> u32 {
        requested.min(self.state.lock().filters.max_leverage).min(150).max(1)
    }

    async fn place_market_order(&self, req: &MarketOrderRequest) -> ExchangeResult<OrderAck> {
        let mut state = self.state.lock();
        if let Some(code) = state.reject_place_code {
            return Err(ExchangeError::Client {
                code,
                status: 400,
                message: format!("mock rejection {code}"),
            });
        }
        state.placed.push(req.clone());
        let qty = req.qty.to_f64().unwrap_or(0.0);
        Ok(OrderAck {
            order_id: Some(state.placed.len() as u64),
            client_order_id: req.client_order_id.clone(),
            orig_qty: qty,
            executed_qty: qty,
            avg_price: state.price,
            status: "FILLED".into(),
            fills: state.next_fill.take(),
        })
    }

    async fn close_leg_exact(
        &self,
        symbol: &str,
        qty: Decimal,
        side: Side,
        position_side: Option<PositionSide>,
    ) -> ExchangeResult<OrderAck> {
        let mut state = self.state.lock();
        if state.fail_close_1106 > 0 {
            state.fail_close_1106 -= 1;
            return Err(ExchangeError::Client {
                code: -1106,
                status: 400,
                message: "Parameter 'reduceonly' sent when not required.".into(),
            });
        }
        let qty_f = qty.to_f64().unwrap_or(0.0);
        state
            .closes
            .push((symbol.to_string(), qty_f, side, position_side));
        Self::flatten(&mut state, symbol, qty_f, side);
        Ok(OrderAck {
            order_id: Some(9000 + state.closes.len() as u64),
            client_order_id: None,
            orig_qty: qty_f,
            executed_qty: qty_f,
            avg_price: state.price,
            status: "FILLED".into(),
            fills: state.next_fill.take(),
        })
    }

    async fn close_position_full(
        &self,
        symbol: &str,
        side: Side,
        position_side: Option<PositionSide>,
    ) -> ExchangeResult<OrderAck> {
        let mut state = self.state.lock();
        state
            .full_closes
            .push((symbol.to_string(), side, position_side));
        if state.auto_flatten_on_close {
            state.positions.retain(|p| p.symbol != symbol);
        }
        Ok(OrderAck {
            status: "FILLED".into(),
            ..Default::default()
        })
    }

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()> {
        self.state.lock().cancels.push(symbol.to_string());
        Ok(())
    }

    async fn summarize_fills(&self, _symbol: &str, _order_id: u64) -> ExchangeResult<FillSummary> {
        Ok(self.state.lock().next_fill.clone().unwrap_or_default())
    }

    async fn positions(&self) -> ExchangeResult<Vec<PositionInfo>> {
        Ok(self.state.lock().positions.clone())
    }

    async fn account_snapshot(&self) -> ExchangeResult<AccountSnapshot> {
        Ok(self.state.lock().account.clone())
    }

    async fn dual_side(&self) -> ExchangeResult<bool> {
        Ok(self.state.lock().dual)
    }

    async fn set_dual_side(&self, dual: bool) -> ExchangeResult<()> {
        self.state.lock().dual = dual;
        Ok(())
    }

    async fn margin_type(&self, _symbol: &str) -> ExchangeResult<Option<MarginMode>> {
        Ok(self.state.lock().margin_type)
    }

    async fn change_margin_type(&self, symbol: &str, mode: MarginMode) -> ExchangeResult<()> {
        let mut state = self.state.lock();
        state.margin_changes.push((symbol.to_string(), mode));
        state.margin_type = Some(mode);
        Ok(())
    }

    async fn change_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<u32> {
        self.state
            .lock()
            .leverage_changes
            .push((symbol.to_string(), leverage));
        Ok(leverage)
    }

    fn network(&self) -> &NetworkState {
        &self.network
    }

    fn ban_remaining(&self) -> f64 {
        self.state.lock().ban_remaining
    }
}

/// Convenience builder for a live position row.
pub fn position(symbol: &str, amt: f64, entry: f64, side: PositionSide) -> PositionInfo {
    PositionInfo {
        symbol: symbol.to_string(),
        position_amt: amt,
        entry_price: entry,
        leverage: 5.0,
        position_side: side,
        ..Default::default()
    }
}
