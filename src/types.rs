// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Order direction. Everything in the engine is keyed on BUY/SELL; hedge-mode
/// LONG/SHORT labels are translated at the exchange boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// The side of a market order that closes exposure on this side.
    pub fn close_side(&self) -> Side {
        self.opposite()
    }

    /// Hedge-mode position side label for exposure on this side.
    pub fn position_side(&self) -> PositionSide {
        match self {
            Self::Buy => PositionSide::Long,
            Self::Sell => PositionSide::Short,
        }
    }

    /// Accepts BUY/SELL as well as hedge labels LONG/SHORT.
    pub fn parse(text: &str) -> Option<Side> {
        match text.trim().to_ascii_uppercase().as_str() {
            "BUY" | "LONG" | "L" => Some(Self::Buy),
            "SELL" | "SHORT" | "S" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hedge-mode position labels as Binance reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
    Both,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
            Self::Both => "BOTH",
        }
    }

    pub fn parse(text: &str) -> PositionSide {
        match text.trim().to_ascii_uppercase().as_str() {
            "LONG" => Self::Long,
            "SHORT" => Self::Short,
            _ => Self::Both,
        }
    }
}

impl Default for PositionSide {
    fn default() -> Self {
        Self::Both
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which account the engine trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountType {
    Spot,
    Futures,
}

impl Default for AccountType {
    fn default() -> Self {
        Self::Futures
    }
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spot => write!(f, "SPOT"),
            Self::Futures => write!(f, "FUTURES"),
        }
    }
}

/// Whether we hit the production or the testnet endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeMode {
    Live,
    Testnet,
}

impl Default for TradeMode {
    fn default() -> Self {
        Self::Testnet
    }
}

impl std::fmt::Display for TradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Testnet => write!(f, "Testnet"),
        }
    }
}

/// Futures position mode: a single net position per symbol, or split
/// LONG/SHORT legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionMode {
    OneWay,
    Hedge,
}

impl Default for PositionMode {
    fn default() -> Self {
        Self::OneWay
    }
}

impl std::fmt::Display for PositionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OneWay => write!(f, "One-way"),
            Self::Hedge => write!(f, "Hedge"),
        }
    }
}

/// Futures margin type per symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    Cross,
    Isolated,
}

impl MarginMode {
    /// The token Binance expects on /fapi/v1/marginType.
    pub fn as_api_str(&self) -> &'static str {
        match self {
            Self::Cross => "CROSSED",
            Self::Isolated => "ISOLATED",
        }
    }

    pub fn parse(text: &str) -> Option<MarginMode> {
        match text.trim().to_ascii_uppercase().as_str() {
            "CROSS" | "CROSSED" => Some(Self::Cross),
            "ISOLATED" => Some(Self::Isolated),
            _ => None,
        }
    }
}

impl Default for MarginMode {
    fn default() -> Self {
        Self::Isolated
    }
}

impl std::fmt::Display for MarginMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_api_str())
    }
}

/// Which side(s) the strategy is allowed to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SideFilter {
    Buy,
    Sell,
    Both,
}

impl SideFilter {
    pub fn allows(&self, side: Side) -> bool {
        matches!(
            (self, side),
            (Self::Both, _) | (Self::Buy, Side::Buy) | (Self::Sell, Side::Sell)
        )
    }
}

impl Default for SideFilter {
    fn default() -> Self {
        Self::Both
    }
}

// =============================================================================
// Intervals
// =============================================================================

/// Native kline intervals the exchange serves directly, with durations.
/// (1M is approximated as 30 days for scheduling purposes.)
const NATIVE_INTERVALS: &[(&str, u64)] = &[
    ("1m", 60),
    ("3m", 180),
    ("5m", 300),
    ("15m", 900),
    ("30m", 1800),
    ("1h", 3600),
    ("2h", 7200),
    ("4h", 14400),
    ("6h", 21600),
    ("8h", 28800),
    ("12h", 43200),
    ("1d", 86400),
    ("3d", 259_200),
    ("1w", 604_800),
    ("1M", 2_592_000),
];

/// A kline interval: a finite label plus its duration in seconds.
///
/// Labels outside the native exchange set are *custom* intervals: klines for
/// them are resampled from the largest native divisor of at least one minute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    label: String,
    secs: u64,
}

impl Interval {
    /// Parse an interval label such as "1m", "4h", "1d" or a custom "2m",
    /// "90m", "10h". Returns `None` on unknown units or zero durations.
    pub fn parse(label: &str) -> Option<Interval> {
        let label = label.trim();
        if label.is_empty() || label.len() < 2 {
            return None;
        }
        if let Some(&(name, secs)) = NATIVE_INTERVALS.iter().find(|(n, _)| *n == label) {
            return Some(Interval {
                label: name.to_string(),
                secs,
            });
        }
        let (num, unit) = label.split_at(label.len() - 1);
        let n: u64 = num.parse().ok()?;
        if n == 0 {
            return None;
        }
        let secs = match unit {
            "s" => n,
            "m" => n * 60,
            "h" => n * 3600,
            "d" => n * 86_400,
            "w" => n * 604_800,
            _ => return None,
        };
        Some(Interval {
            label: label.to_string(),
            secs,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.label
    }

    pub fn seconds(&self) -> u64 {
        self.secs
    }

    pub fn seconds_f64(&self) -> f64 {
        self.secs as f64
    }

    pub fn is_native(&self) -> bool {
        NATIVE_INTERVALS.iter().any(|(n, _)| *n == self.label)
    }

    /// Largest native interval of at least one minute that evenly divides
    /// this interval. `None` for sub-minute custom intervals, which are
    /// unsupported.
    pub fn native_divisor(&self) -> Option<Interval> {
        if self.secs < 60 {
            return None;
        }
        NATIVE_INTERVALS
            .iter()
            .rev()
            .find(|(_, s)| *s >= 60 && self.secs % s == 0)
            .map(|&(n, s)| Interval {
                label: n.to_string(),
                secs: s,
            })
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label)
    }
}

/// Current UNIX timestamp in seconds, as f64 (sub-second precision).
pub fn epoch_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Current UNIX timestamp in milliseconds.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
