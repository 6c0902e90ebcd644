// =============================================================================
// Klines — candle type, custom-interval resampling, TTL cache with
// ban-fallback serving
// =============================================================================
//
// Cache entries are keyed by (symbol, interval, limit) and live for
// min(interval * 0.9, 3600) seconds. While a REST ban is active a stale copy
// is served instead of hitting the exchange; the strategy loop keeps running
// on old data rather than stalling.
//
// Custom intervals (labels the exchange does not serve natively) are
// resampled from the largest native divisor of at least one minute.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::ExchangeAdapter;
use crate::types::{epoch_ms, epoch_secs, Interval};

/// One candle. Times are UNIX milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

/// Close column, the input most indicators consume.
pub fn closes(klines: &[Kline]) -> Vec<f64> {
    klines.iter().map(|k| k.close).collect()
}

// =============================================================================
// Resampling
// =============================================================================

/// Aggregate native candles into `target`-sized bins aligned to the target
/// duration grid: open = first, high = max, low = min, close = last,
/// volume = sum. Input must be ordered by open_time.
pub fn resample(klines: &[Kline], target: &Interval) -> Vec<Kline> {
    let bin_ms = (target.seconds() * 1000) as i64;
    if bin_ms <= 0 || klines.is_empty() {
        return Vec::new();
    }

    let mut out: Vec<Kline> = Vec::new();
    for k in klines {
        let bin_start = (k.open_time / bin_ms) * bin_ms;
        match out.last_mut() {
            Some(current) if current.open_time == bin_start => {
                current.high = current.high.max(k.high);
                current.low = current.low.min(k.low);
                current.close = k.close;
                current.volume += k.volume;
                current.close_time = current.close_time.max(k.close_time);
            }
            _ => out.push(Kline {
                open_time: bin_start,
                open: k.open,
                high: k.high,
                low: k.low,
                close: k.close,
                volume: k.volume,
                close_time: bin_start + bin_ms - 1,
            }),
        }
    }
    out
}

// =============================================================================
// Cache
// =============================================================================

/// Cache TTL for an interval: nine tenths of the bar, capped at an hour,
/// floored at one second.
fn ttl_secs(interval: &Interval) -> f64 {
    (interval.seconds_f64() * 0.9).min(3600.0).max(1.0)
}

struct CacheEntry {
    klines: Vec<Kline>,
    fetched_at: f64,
}

/// TTL kline cache over an `ExchangeAdapter`.
pub struct KlineCache {
    entries: Mutex<HashMap<(String, String, u32), CacheEntry>>,
    last_ban_log: Mutex<f64>,
}

impl KlineCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            last_ban_log: Mutex::new(0.0),
        }
    }

    /// Fetch klines, serving from cache while fresh and from a stale copy
    /// while banned. Network failures surface as `ExchangeError::Network`
    /// after the adapter has updated its connectivity counters.
    pub async fn fetch(
        &self,
        adapter: &dyn ExchangeAdapter,
        symbol: &str,
        interval: &Interval,
        limit: u32,
    ) -> ExchangeResult<Vec<Kline>> {
        let key = (symbol.to_string(), interval.as_str().to_string(), limit);
        let ttl = ttl_secs(interval);
        let now = epoch_secs();

        let stale: Option<Vec<Kline>> = {
            let entries = self.entries.lock();
            match entries.get(&key) {
                Some(entry) if now - entry.fetched_at < ttl => {
                    return Ok(entry.klines.clone());
                }
                Some(entry) => Some(entry.klines.clone()),
                None => None,
            }
        };

        let ban_remaining = adapter.ban_remaining();
        if ban_remaining > 0.0 {
            if let Some(cached) = stale {
                self.log_ban_throttled(symbol, interval, ban_remaining);
                return Ok(cached);
            }
        }

        let fresh = if interval.is_native() {
            self.fetch_native(adapter, symbol, interval, limit, stale.as_deref())
                .await?
        } else {
            self.fetch_custom(adapter, symbol, interval, limit).await?
        };

        self.entries.lock().insert(
            key,
            CacheEntry {
                klines: fresh.clone(),
                fetched_at: epoch_secs(),
            },
        );
        Ok(fresh)
    }

    /// Native interval: direct fetch with up to 5 retries across short ban
    /// waits. A ban with a stale copy on hand serves the stale copy instead.
    async fn fetch_native(
        &self,
        adapter: &dyn ExchangeAdapter,
        symbol: &str,
        interval: &Interval,
        limit: u32,
        stale: Option<&[Kline]>,
    ) -> ExchangeResult<Vec<Kline>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match adapter.get_klines(symbol, interval, limit).await {
                Ok(klines) => return Ok(klines),
                Err(ExchangeError::Ban { until_epoch, message }) => {
                    if let Some(cached) = stale {
                        self.log_ban_throttled(symbol, interval, until_epoch - epoch_secs());
                        return Ok(cached.to_vec());
                    }
                    if attempt >= 5 {
                        return Err(ExchangeError::Ban { until_epoch, message });
                    }
                    let wait = (until_epoch - epoch_secs()).clamp(1.0, 5.0);
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Custom interval: fetch the largest native divisor over twice the
    /// requested span, resample, and trim to `limit`.
    async fn fetch_custom(
        &self,
        adapter: &dyn ExchangeAdapter,
        symbol: &str,
        interval: &Interval,
        limit: u32,
    ) -> ExchangeResult<Vec<Kline>> {
        let base = interval.native_divisor().ok_or_else(|| ExchangeError::Client {
            code: 0,
            status: 400,
            message: format!("unsupported sub-minute interval '{interval}'"),
        })?;

        let span_ms = (interval.seconds() * 1000) as i64 * limit.max(1) as i64;
        let end_ms = epoch_ms() as i64;
        let start_ms = end_ms - span_ms * 2;
        let fetch_limit = limit.max(1) * 2;

        let raw = adapter
            .get_klines_range(symbol, &base, start_ms, end_ms, fetch_limit)
            .await?;
        if raw.is_empty() {
            return Err(ExchangeError::Server(format!(
                "no kline data returned for interval '{interval}'"
            )));
        }

        let mut resampled = resample(&raw, interval);
        if resampled.len() > limit as usize {
            resampled.drain(..resampled.len() - limit as usize);
        }
        debug!(
            symbol,
            interval = %interval,
            base = %base,
            bars = resampled.len(),
            "custom interval resampled"
        );
        Ok(resampled)
    }

    /// One warn line per 15 s window while serving stale data under a ban.
    fn log_ban_throttled(&self, symbol: &str, interval: &Interval, remaining: f64) {
        let mut last = self.last_ban_log.lock();
        let now = epoch_secs();
        if now - *last > 15.0 {
            *last = now;
            warn!(
                symbol,
                interval = %interval,
                remaining = format!("{remaining:.0}s"),
                "REST ban active; serving cached klines"
            );
        }
    }
}

impl Default for KlineCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KlineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KlineCache")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockExchange;

    fn candle(open_time: i64, o: f64, h: f64, l: f64, c: f64, v: f64) -> Kline {
        Kline {
            open_time,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
            close_time: open_time + 59_999,
        }
    }

    #[test]
    fn ttl_bounds() {
        assert!((ttl_secs(&Interval::parse("1m").unwrap()) - 54.0).abs() < 1e-9);
        assert_eq!(ttl_secs(&Interval::parse("1d").unwrap()), 3600.0);
    }

    #[test]
    fn resample_two_minute_bins() {
        let target = Interval::parse("2m").unwrap();
        let m = 60_000i64;
        let raw = vec![
            candle(0, 10.0, 12.0, 9.0, 11.0, 1.0),
            candle(m, 11.0, 13.0, 10.0, 12.0, 2.0),
            candle(2 * m, 12.0, 12.5, 11.0, 11.5, 3.0),
            candle(3 * m, 11.5, 14.0, 11.0, 13.0, 4.0),
        ];
        let out = resample(&raw, &target);
        assert_eq!(out.len(), 2);

        // First bin: candles at 0 and 60 000.
        assert_eq!(out[0].open_time, 0);
        assert!((out[0].open - 10.0).abs() < 1e-12);
        assert!((out[0].high - 13.0).abs() < 1e-12);
        assert!((out[0].low - 9.0).abs() < 1e-12);
        assert!((out[0].close - 12.0).abs() < 1e-12);
        assert!((out[0].volume - 3.0).abs() < 1e-12);
        assert_eq!(out[0].close_time, 2 * m - 1);

        // Second bin.
        assert_eq!(out[1].open_time, 2 * m);
        assert!((out[1].high - 14.0).abs() < 1e-12);
        assert!((out[1].volume - 7.0).abs() < 1e-12);
    }

    #[test]
    fn resample_empty() {
        assert!(resample(&[], &Interval::parse("2m").unwrap()).is_empty());
    }

    #[tokio::test]
    async fn cache_serves_fresh_copy_within_ttl() {
        let mock = MockExchange::new();
        mock.set_klines(vec![candle(0, 1.0, 2.0, 0.5, 1.5, 10.0)]);
        let cache = KlineCache::new();
        let iv = Interval::parse("1m").unwrap();

        let first = cache.fetch(&mock, "BTCUSDT", &iv, 100).await.unwrap();
        // Change what the adapter would serve; cache must still return the
        // original frame inside the TTL.
        mock.set_klines(vec![candle(60_000, 9.0, 9.0, 9.0, 9.0, 1.0)]);
        let second = cache.fetch(&mock, "BTCUSDT", &iv, 100).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(mock.kline_fetches(), 1);
    }

    #[tokio::test]
    async fn cache_rejects_sub_minute_custom() {
        let mock = MockExchange::new();
        let cache = KlineCache::new();
        let iv = Interval::parse("30s").unwrap();
        let err = cache.fetch(&mock, "BTCUSDT", &iv, 10).await.unwrap_err();
        assert!(err.to_string().contains("sub-minute"));
    }

    #[tokio::test]
    async fn cache_serves_stale_during_ban() {
        let mock = MockExchange::new();
        mock.set_klines(vec![candle(0, 1.0, 2.0, 0.5, 1.5, 10.0)]);
        let cache = KlineCache::new();
        let iv = Interval::parse("1m").unwrap();

        let first = cache.fetch(&mock, "BTCUSDT", &iv, 100).await.unwrap();
        // Expire the entry manually, then activate a ban: the stale copy must
        // be served without touching the adapter again.
        {
            let mut entries = cache.entries.lock();
            for entry in entries.values_mut() {
                entry.fetched_at -= 3600.0;
            }
        }
        mock.set_ban_remaining(30.0);
        let second = cache.fetch(&mock, "BTCUSDT", &iv, 100).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(mock.kline_fetches(), 1);
    }

    #[tokio::test]
    async fn cache_propagates_network_error() {
        let mock = MockExchange::new();
        mock.fail_next_klines_with_network(1);
        let cache = KlineCache::new();
        let iv = Interval::parse("1m").unwrap();
        let err = cache.fetch(&mock, "BTCUSDT", &iv, 100).await.unwrap_err();
        assert!(err.is_network());
    }
}
