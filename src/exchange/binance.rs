// =============================================================================
// Binance USDT-M Futures Adapter — HMAC-SHA256 signed REST client
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the bot and Binance servers.
//
// Every response is normalized here: payload shapes into the plain structs of
// `exchange::mod`, failures into the `ExchangeError` taxonomy. Bans register
// with the shared rate limiter before surfacing; connectivity failures feed
// the network state consumed by the emergency monitor.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::error::{ExchangeError, ExchangeResult};
use crate::market::klines::Kline;
use crate::types::{
    epoch_ms, epoch_secs, AccountType, Interval, MarginMode, PositionSide, Side, TradeMode,
};

use super::filters::{format_qty, round_to_tick, FilterRegistry, SymbolFilters};
use super::rate_limit::{ban_until_from, estimate_weight, RateLimiter};
use super::{
    AccountSnapshot, BookTicker, ExchangeAdapter, FillSummary, MarketOrderRequest, NetworkState,
    OrderAck, PositionInfo,
};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;
/// Futures kline endpoint page cap.
const FUTURES_PAGE_LIMIT: u32 = 1500;
/// Bound on the exponential backoff between range-fetch retries.
const RANGE_RETRY_CAP_SECS: f64 = 6.0;

/// Binance USDT-M futures client.
pub struct BinanceUsdFutures {
    api_key: String,
    secret: String,
    base_url: String,
    mode: TradeMode,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    filters: FilterRegistry,
    network: NetworkState,
    dual_side_cache: Mutex<Option<bool>>,
}

impl BinanceUsdFutures {
    /// Create a new client. `limiter` is the shared per-(env, account)
    /// instance from the pool.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        mode: TradeMode,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = match mode {
            TradeMode::Live => "https://fapi.binance.com".to_string(),
            TradeMode::Testnet => "https://testnet.binancefuture.com".to_string(),
        };

        debug!(%mode, base_url, "BinanceUsdFutures initialised");

        Self {
            api_key,
            secret,
            base_url,
            mode,
            client,
            limiter,
            filters: FilterRegistry::new(),
            network: NetworkState::new(),
            dual_side_cache: Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Full query string for a signed request (timestamp + recvWindow +
    /// signature appended).
    fn signed_query(&self, params: &str) -> String {
        let ts = epoch_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Issue one REST request: acquire limiter weight, send, normalize.
    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> ExchangeResult<Value> {
        self.limiter.acquire(estimate_weight(path)).await;

        let raw_query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let query = if signed {
            self.signed_query(&raw_query)
        } else {
            raw_query
        };
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let resp = match self.client.request(method, &url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                self.network.record_failure();
                return Err(ExchangeError::network(format!("{path}: {err}")));
            }
        };

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<f64>().ok());

        let body: Value = match resp.json().await {
            Ok(v) => v,
            Err(err) => {
                if (200..300).contains(&status) {
                    self.network.record_failure();
                    return Err(ExchangeError::network(format!("{path}: bad body: {err}")));
                }
                Value::Null
            }
        };

        if (200..300).contains(&status) {
            self.network.record_success();
            return Ok(body);
        }

        let err = normalize_error(status, retry_after, &body, epoch_secs());
        if let ExchangeError::Ban { until_epoch, .. } = &err {
            self.limiter.register_ban(*until_epoch);
        }
        Err(err)
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> ExchangeResult<Value> {
        self.request(Method::GET, path, params, false).await
    }

    async fn get_signed(&self, path: &str, params: &[(&str, String)]) -> ExchangeResult<Value> {
        self.request(Method::GET, path, params, true).await
    }

    async fn post_signed(&self, path: &str, params: &[(&str, String)]) -> ExchangeResult<Value> {
        self.request(Method::POST, path, params, true).await
    }

    async fn delete_signed(&self, path: &str, params: &[(&str, String)]) -> ExchangeResult<Value> {
        self.request(Method::DELETE, path, params, true).await
    }

    // -------------------------------------------------------------------------
    // Order helpers
    // -------------------------------------------------------------------------

    async fn submit_order(&self, params: &[(&str, String)]) -> ExchangeResult<OrderAck> {
        let body = self.post_signed("/fapi/v1/order", params).await?;
        Ok(parse_order_ack(&body))
    }

    /// Attach a fill summary to an ack, best effort.
    async fn enrich_with_fills(&self, symbol: &str, mut ack: OrderAck) -> OrderAck {
        if let Some(order_id) = ack.order_id {
            match self.summarize_fills(symbol, order_id).await {
                Ok(summary) => {
                    if ack.avg_price <= 0.0 && summary.avg_price > 0.0 {
                        ack.avg_price = summary.avg_price;
                    }
                    if ack.executed_qty <= 0.0 && summary.filled_qty > 0.0 {
                        ack.executed_qty = summary.filled_qty;
                    }
                    ack.fills = Some(summary);
                }
                Err(err) => {
                    debug!(symbol, order_id, error = %err, "fill summary unavailable");
                }
            }
        }
        ack
    }
}

// =============================================================================
// Normalization helpers (pure)
// =============================================================================

/// Map a non-2xx response into the error taxonomy.
pub fn normalize_error(
    status: u16,
    retry_after_secs: Option<f64>,
    body: &Value,
    now: f64,
) -> ExchangeError {
    let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
    let message = body
        .get("msg")
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("http {status}"));

    let msg_lower = message.to_ascii_lowercase();
    let banned = status == 418
        || status == 429
        || code == -1003
        || msg_lower.contains("banned until")
        || msg_lower.contains("too many requests")
        || msg_lower.contains("too frequent");

    if banned {
        let until_epoch = ban_until_from(&message, retry_after_secs, now);
        return ExchangeError::Ban {
            until_epoch,
            message,
        };
    }
    if status >= 500 {
        return ExchangeError::Server(message);
    }
    ExchangeError::Client {
        code,
        status,
        message,
    }
}

/// Numeric field that may arrive as a JSON string or a number.
fn f64_field(value: &Value, key: &str) -> f64 {
    match value.get(key) {
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn parse_order_ack(body: &Value) -> OrderAck {
    OrderAck {
        order_id: body.get("orderId").and_then(Value::as_u64),
        client_order_id: body
            .get("clientOrderId")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        orig_qty: f64_field(body, "origQty"),
        executed_qty: f64_field(body, "executedQty"),
        avg_price: f64_field(body, "avgPrice"),
        status: body
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("NEW")
            .to_string(),
        fills: None,
    }
}

/// Parse the array-of-arrays kline payload.
///
/// Array indices:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
///   [6] closeTime, [7] quoteAssetVolume, [8] numberOfTrades,
///   [9] takerBuyBaseVolume, [10] takerBuyQuoteVolume
pub fn parse_klines(body: &Value) -> ExchangeResult<Vec<Kline>> {
    let raw = body
        .as_array()
        .ok_or_else(|| ExchangeError::Server("klines response is not an array".into()))?;

    let mut out = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = match entry.as_array() {
            Some(a) if a.len() >= 7 => a,
            _ => {
                warn!("skipping malformed kline entry");
                continue;
            }
        };
        let num = |v: &Value| -> f64 {
            match v {
                Value::String(s) => s.parse().unwrap_or(0.0),
                Value::Number(n) => n.as_f64().unwrap_or(0.0),
                _ => 0.0,
            }
        };
        out.push(Kline {
            open_time: arr[0].as_i64().unwrap_or(0),
            open: num(&arr[1]),
            high: num(&arr[2]),
            low: num(&arr[3]),
            close: num(&arr[4]),
            volume: num(&arr[5]),
            close_time: arr[6].as_i64().unwrap_or(0),
        });
    }
    Ok(out)
}

fn parse_position_row(row: &Value) -> PositionInfo {
    PositionInfo {
        symbol: row
            .get("symbol")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_ascii_uppercase(),
        position_amt: f64_field(row, "positionAmt"),
        entry_price: f64_field(row, "entryPrice"),
        leverage: f64_field(row, "leverage"),
        unrealized_pnl: f64_field(row, "unRealizedProfit"),
        position_side: PositionSide::parse(
            row.get("positionSide").and_then(Value::as_str).unwrap_or(""),
        ),
        isolated_wallet: f64_field(row, "isolatedWallet"),
        isolated_margin: f64_field(row, "isolatedMargin"),
        initial_margin: f64_field(row, "initialMargin"),
        maint_margin: f64_field(row, "maintMargin"),
        margin_ratio: f64_field(row, "marginRatio"),
        liquidation_price: f64_field(row, "liquidationPrice"),
        notional: f64_field(row, "notional"),
        margin_type: row
            .get("marginType")
            .and_then(Value::as_str)
            .and_then(MarginMode::parse),
        update_time: row.get("updateTime").and_then(Value::as_u64).unwrap_or(0),
    }
}

/// Fold userTrades rows into a fill summary, returning non-USDT commissions
/// as (asset, amount) pairs for the caller to convert.
pub fn fold_fills(rows: &[Value]) -> (FillSummary, Vec<(String, f64)>) {
    let mut filled_qty = 0.0;
    let mut notional = 0.0;
    let mut realized = 0.0;
    let mut commission_usdt = 0.0;
    let mut foreign: Vec<(String, f64)> = Vec::new();
    let mut count = 0u32;

    for row in rows {
        let qty = f64_field(row, "qty");
        let price = f64_field(row, "price");
        filled_qty += qty;
        notional += qty * price;
        realized += f64_field(row, "realizedPnl");
        count += 1;

        let commission = f64_field(row, "commission");
        let asset = row
            .get("commissionAsset")
            .and_then(Value::as_str)
            .unwrap_or("USDT");
        if asset.eq_ignore_ascii_case("USDT") {
            commission_usdt += commission;
        } else if commission != 0.0 {
            foreign.push((asset.to_ascii_uppercase(), commission));
        }
    }

    let avg_price = if filled_qty > 0.0 {
        notional / filled_qty
    } else {
        0.0
    };
    (
        FillSummary {
            filled_qty,
            avg_price,
            realized_pnl: realized,
            commission_usdt,
            net_realized: realized - commission_usdt,
            trade_count: count,
        },
        foreign,
    )
}

// =============================================================================
// Trait implementation
// =============================================================================

#[async_trait]
impl ExchangeAdapter for BinanceUsdFutures {
    fn account_type(&self) -> AccountType {
        AccountType::Futures
    }

    fn trade_mode(&self) -> TradeMode {
        self.mode
    }

    // --- Market data --------------------------------------------------------

    #[instrument(skip(self), name = "binance::get_klines")]
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &Interval,
        limit: u32,
    ) -> ExchangeResult<Vec<Kline>> {
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", interval.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        let body = self.get("/fapi/v1/klines", &params).await?;
        let klines = parse_klines(&body)?;
        debug!(symbol, interval = %interval, count = klines.len(), "klines fetched");
        Ok(klines)
    }

    #[instrument(skip(self), name = "binance::get_klines_range")]
    async fn get_klines_range(
        &self,
        symbol: &str,
        interval: &Interval,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> ExchangeResult<Vec<Kline>> {
        let page_limit = limit.clamp(1, FUTURES_PAGE_LIMIT);
        let mut cursor = start_ms;
        let mut out: Vec<Kline> = Vec::new();

        loop {
            let params = [
                ("symbol", symbol.to_string()),
                ("interval", interval.as_str().to_string()),
                ("startTime", cursor.to_string()),
                ("endTime", end_ms.to_string()),
                ("limit", page_limit.to_string()),
            ];

            // Transient network errors retry with bounded exponential backoff;
            // bans propagate (the limiter already holds the pause).
            let mut attempt = 0u32;
            let body = loop {
                match self.get("/fapi/v1/klines", &params).await {
                    Ok(body) => break body,
                    Err(err @ ExchangeError::Network(_)) if attempt < 4 => {
                        attempt += 1;
                        let backoff = (0.75 * 2f64.powi(attempt as i32)).min(RANGE_RETRY_CAP_SECS);
                        debug!(symbol, attempt, backoff, error = %err, "range fetch retry");
                        tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                    }
                    Err(err) => return Err(err),
                }
            };

            let page = parse_klines(&body)?;
            if page.is_empty() {
                break;
            }

            let last_open = out.last().map(|k| k.open_time).unwrap_or(i64::MIN);
            let mut progressed = false;
            for k in &page {
                if k.open_time > last_open {
                    out.push(*k);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }

            let tail = out.last().map(|k| k.close_time).unwrap_or(end_ms);
            if tail >= end_ms || (page.len() as u32) < page_limit {
                break;
            }
            cursor = tail + 1;
        }

        debug!(symbol, interval = %interval, count = out.len(), "range fetch complete");
        Ok(out)
    }

    async fn last_price(&self, symbol: &str) -> ExchangeResult<f64> {
        let params = [("symbol", symbol.to_string())];
        let body = self.get("/fapi/v1/ticker/price", &params).await?;
        Ok(f64_field(&body, "price"))
    }

    async fn book_ticker(&self, symbol: &str) -> ExchangeResult<BookTicker> {
        let params = [("symbol", symbol.to_string())];
        let body = self.get("/fapi/v1/ticker/bookTicker", &params).await?;
        Ok(BookTicker {
            bid: f64_field(&body, "bidPrice"),
            ask: f64_field(&body, "askPrice"),
        })
    }

    // --- Filters ------------------------------------------------------------

    async fn symbol_filters(&self, symbol: &str) -> ExchangeResult<SymbolFilters> {
        if let Some(filters) = self.filters.get(symbol) {
            return Ok(filters);
        }

        let params = [("symbol", symbol.to_string())];
        let info = self.get("/fapi/v1/exchangeInfo", &params).await?;
        let entry = info
            .get("symbols")
            .and_then(Value::as_array)
            .and_then(|arr| arr.iter().find(|s| {
                s.get("symbol").and_then(Value::as_str) == Some(symbol)
            }))
            .cloned()
            .unwrap_or(Value::Null);

        let mut filters = if entry.is_null() {
            super::filters::warn_missing_filters(symbol);
            SymbolFilters::default()
        } else {
            SymbolFilters::from_exchange_info(&entry)
        };

        match self
            .get_signed("/fapi/v1/leverageBracket", &params)
            .await
        {
            Ok(body) => {
                let first = body.as_array().and_then(|arr| arr.first()).cloned();
                let bracket = first.unwrap_or(body);
                filters.apply_leverage_brackets(&bracket);
            }
            Err(err) => {
                debug!(symbol, error = %err, "leverageBracket unavailable; keeping default cap");
            }
        }

        self.filters.insert(symbol, filters.clone());
        Ok(filters)
    }

    fn clamp_leverage(&self, symbol: &str, requested: u32) -> u32 {
        self.filters.clamp_leverage(symbol, requested)
    }

    // --- Trading ------------------------------------------------------------

    #[instrument(skip(self, req), fields(symbol = %req.symbol, side = %req.side), name = "binance::place_market_order")]
    async fn place_market_order(&self, req: &MarketOrderRequest) -> ExchangeResult<OrderAck> {
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", req.symbol.clone()),
            ("side", req.side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", format_qty(req.qty)),
        ];
        if let Some(ps) = req.position_side {
            params.push(("positionSide", ps.as_str().to_string()));
        } else if req.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        if let Some(coid) = &req.client_order_id {
            params.push(("newClientOrderId", coid.clone()));
        }

        debug!(qty = %req.qty, reduce_only = req.reduce_only, "placing market order");
        let ack = self.submit_order(&params).await?;
        Ok(self.enrich_with_fills(&req.symbol, ack).await)
    }

    #[instrument(skip(self), name = "binance::close_leg_exact")]
    async fn close_leg_exact(
        &self,
        symbol: &str,
        qty: Decimal,
        side: Side,
        position_side: Option<PositionSide>,
    ) -> ExchangeResult<OrderAck> {
        if qty <= Decimal::ZERO {
            return Err(ExchangeError::Client {
                code: 0,
                status: 400,
                message: "close qty <= 0".into(),
            });
        }

        let mut params: Vec<(&str, String)> = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", format_qty(qty)),
            ("newClientOrderId", format!("close-{symbol}-{}", epoch_ms())),
        ];
        if let Some(ps) = position_side {
            params.push(("positionSide", ps.as_str().to_string()));
        } else {
            params.push(("reduceOnly", "true".to_string()));
        }

        match self.submit_order(&params).await {
            Ok(ack) => Ok(self.enrich_with_fills(symbol, ack).await),
            Err(err) => {
                let is_reduce_only_reject = err.code() == Some(-1106)
                    || err.to_string().to_ascii_lowercase().contains("reduceonly");
                if !is_reduce_only_reject {
                    return Err(err);
                }
                // -1106: reduceOnly not required here. Re-send as a LIMIT IOC
                // at a crossed spread so the close still fills immediately.
                warn!(symbol, %side, "reduceOnly rejected (-1106); retrying as IOC limit");
                let book = self.book_ticker(symbol).await?;
                let raw_px = match side {
                    Side::Sell => book.bid * 0.999,
                    Side::Buy => book.ask * 1.001,
                };
                let tick = self
                    .filters
                    .get(symbol)
                    .map(|f| f.tick_size)
                    .unwrap_or_default();
                let px = round_to_tick(
                    super::filters::decimal_from_f64(raw_px),
                    tick,
                );
                let mut alt: Vec<(&str, String)> = vec![
                    ("symbol", symbol.to_string()),
                    ("side", side.as_str().to_string()),
                    ("type", "LIMIT".to_string()),
                    ("timeInForce", "IOC".to_string()),
                    ("price", px.normalize().to_string()),
                    ("quantity", format_qty(qty)),
                ];
                if let Some(ps) = position_side {
                    alt.push(("positionSide", ps.as_str().to_string()));
                } else {
                    alt.push(("reduceOnly", "true".to_string()));
                }
                let ack = self.submit_order(&alt).await?;
                Ok(self.enrich_with_fills(symbol, ack).await)
            }
        }
    }

    async fn close_position_full(
        &self,
        symbol: &str,
        side: Side,
        position_side: Option<PositionSide>,
    ) -> ExchangeResult<OrderAck> {
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("closePosition", "true".to_string()),
        ];
        if let Some(ps) = position_side {
            params.push(("positionSide", ps.as_str().to_string()));
        }
        self.submit_order(&params).await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()> {
        let params = [("symbol", symbol.to_string())];
        self.delete_signed("/fapi/v1/allOpenOrders", &params).await?;
        Ok(())
    }

    async fn summarize_fills(&self, symbol: &str, order_id: u64) -> ExchangeResult<FillSummary> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let mut body = self.get_signed("/fapi/v1/userTrades", &params).await?;
        if body.as_array().map(|a| a.is_empty()).unwrap_or(true) {
            // Fills can lag the ack by a beat; one short retry.
            tokio::time::sleep(Duration::from_millis(200)).await;
            body = self.get_signed("/fapi/v1/userTrades", &params).await?;
        }
        let rows = body.as_array().cloned().unwrap_or_default();
        let (mut summary, foreign) = fold_fills(&rows);

        for (asset, amount) in foreign {
            let pair = format!("{asset}USDT");
            match self.last_price(&pair).await {
                Ok(px) if px > 0.0 => summary.commission_usdt += amount * px,
                _ => debug!(asset, "commission conversion price unavailable"),
            }
        }
        summary.net_realized = summary.realized_pnl - summary.commission_usdt;
        Ok(summary)
    }

    // --- Account ------------------------------------------------------------

    async fn positions(&self) -> ExchangeResult<Vec<PositionInfo>> {
        let body = self.get_signed("/fapi/v2/positionRisk", &[]).await?;
        let rows = body.as_array().cloned().unwrap_or_default();
        Ok(rows.iter().map(parse_position_row).collect())
    }

    async fn account_snapshot(&self) -> ExchangeResult<AccountSnapshot> {
        let body = self.get_signed("/fapi/v2/account", &[]).await?;
        Ok(AccountSnapshot {
            wallet_balance: f64_field(&body, "totalWalletBalance"),
            available_balance: f64_field(&body, "availableBalance"),
            margin_balance: f64_field(&body, "totalMarginBalance"),
            unrealized_pnl: f64_field(&body, "totalUnrealizedProfit"),
        })
    }

    async fn dual_side(&self) -> ExchangeResult<bool> {
        if let Some(cached) = *self.dual_side_cache.lock() {
            return Ok(cached);
        }
        let body = self.get_signed("/fapi/v1/positionSide/dual", &[]).await?;
        let dual = body
            .get("dualSidePosition")
            .map(|v| v.as_bool().unwrap_or_else(|| v.as_str() == Some("true")))
            .unwrap_or(false);
        *self.dual_side_cache.lock() = Some(dual);
        Ok(dual)
    }

    async fn set_dual_side(&self, dual: bool) -> ExchangeResult<()> {
        let params = [("dualSidePosition", dual.to_string())];
        match self.post_signed("/fapi/v1/positionSide/dual", &params).await {
            Ok(_) => {}
            // -4059: no need to change position side.
            Err(ExchangeError::Client { code: -4059, .. }) => {}
            Err(err) => return Err(err),
        }
        *self.dual_side_cache.lock() = Some(dual);
        Ok(())
    }

    async fn margin_type(&self, symbol: &str) -> ExchangeResult<Option<MarginMode>> {
        let positions = self.positions().await?;
        Ok(positions
            .iter()
            .find(|p| p.symbol == symbol)
            .and_then(|p| p.margin_type))
    }

    async fn change_margin_type(&self, symbol: &str, mode: MarginMode) -> ExchangeResult<()> {
        let params = [
            ("symbol", symbol.to_string()),
            ("marginType", mode.as_api_str().to_string()),
        ];
        match self.post_signed("/fapi/v1/marginType", &params).await {
            Ok(_) => Ok(()),
            // -4046: no need to change margin type — already as desired.
            Err(ExchangeError::Client { code: -4046, .. }) => Ok(()),
            Err(err) if err.to_string().to_ascii_lowercase().contains("no need to change") => {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn change_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<u32> {
        let clamped = self.clamp_leverage(symbol, leverage);
        let params = [
            ("symbol", symbol.to_string()),
            ("leverage", clamped.to_string()),
        ];
        match self.post_signed("/fapi/v1/leverage", &params).await {
            Ok(body) => Ok(body
                .get("leverage")
                .and_then(Value::as_u64)
                .map(|l| l as u32)
                .unwrap_or(clamped)),
            Err(err) => {
                let msg = err.to_string().to_ascii_lowercase();
                if msg.contains("same leverage") || msg.contains("not modified") {
                    Ok(clamped)
                } else {
                    Err(err)
                }
            }
        }
    }

    // --- Connectivity -------------------------------------------------------

    fn network(&self) -> &NetworkState {
        &self.network
    }

    fn ban_remaining(&self) -> f64 {
        self.limiter.seconds_until_resume()
    }
}

impl std::fmt::Debug for BinanceUsdFutures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceUsdFutures")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
