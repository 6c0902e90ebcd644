// =============================================================================
// Bot Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian engine. Every tunable parameter
// lives here so the engine can be reconfigured without a rebuild.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{AccountType, MarginMode, PositionMode, SideFilter, TradeMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string()]
}

fn default_intervals() -> Vec<String> {
    vec!["1m".to_string()]
}

fn default_lookback() -> u32 {
    200
}

fn default_leverage() -> u32 {
    1
}

fn default_position_pct() -> f64 {
    2.0
}

fn default_max_auto_bump_percent() -> f64 {
    5.0
}

fn default_auto_bump_multiplier() -> f64 {
    10.0
}

fn default_flip_cooldown_bars() -> u32 {
    1
}

fn default_flip_confirmation_bars() -> u32 {
    1
}

fn default_order_rate_min_spacing() -> f64 {
    0.35
}

fn default_order_rate_retry_backoff() -> f64 {
    0.75
}

fn default_margin_tolerance() -> f64 {
    0.05
}

fn default_stop_loss_usdt() -> f64 {
    10.0
}

fn default_stop_loss_percent() -> f64 {
    5.0
}

// =============================================================================
// Stop loss
// =============================================================================

/// Which threshold(s) the stop-loss engine applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopLossMode {
    Usdt,
    Percent,
    Both,
}

impl Default for StopLossMode {
    fn default() -> Self {
        Self::Usdt
    }
}

impl StopLossMode {
    pub fn applies_usdt(&self) -> bool {
        matches!(self, Self::Usdt | Self::Both)
    }

    pub fn applies_percent(&self) -> bool {
        matches!(self, Self::Percent | Self::Both)
    }
}

/// Granularity at which losses are aggregated before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopLossScope {
    PerTrade,
    Cumulative,
    EntireAccount,
}

impl Default for StopLossScope {
    fn default() -> Self {
        Self::PerTrade
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: StopLossMode,
    /// Absolute loss threshold in USDT.
    #[serde(default = "default_stop_loss_usdt")]
    pub usdt: f64,
    /// Percentage loss threshold (against price move or allocated margin,
    /// whichever is larger).
    #[serde(default = "default_stop_loss_percent")]
    pub percent: f64,
    #[serde(default)]
    pub scope: StopLossScope,
}

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: StopLossMode::default(),
            usdt: default_stop_loss_usdt(),
            percent: default_stop_loss_percent(),
            scope: StopLossScope::default(),
        }
    }
}

// =============================================================================
// Indicators
// =============================================================================

/// Per-indicator settings. Length/parameter fields are optional; each
/// indicator reads the ones it understands and falls back to its canonical
/// defaults (RSI 14, Bollinger 20/2.0, MACD 12/26/9, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub length: Option<u32>,
    #[serde(default)]
    pub buy_value: Option<f64>,
    #[serde(default)]
    pub sell_value: Option<f64>,
    /// MACD fast period.
    #[serde(default)]
    pub fast: Option<u32>,
    /// MACD slow period.
    #[serde(default)]
    pub slow: Option<u32>,
    /// MACD / StochRSI / Stochastic signal smoothing period.
    #[serde(default)]
    pub signal: Option<u32>,
    /// %K smoothing for StochRSI / Stochastic.
    #[serde(default)]
    pub k: Option<u32>,
    /// %D smoothing for StochRSI / Stochastic.
    #[serde(default)]
    pub d: Option<u32>,
    /// Bollinger standard-deviation multiplier.
    #[serde(default)]
    pub std_mult: Option<f64>,
    /// Supertrend ATR length.
    #[serde(default)]
    pub atr_length: Option<u32>,
    /// Supertrend ATR multiplier.
    #[serde(default)]
    pub multiplier: Option<f64>,
    /// PSAR acceleration factor.
    #[serde(default)]
    pub af: Option<f64>,
    /// PSAR maximum acceleration factor.
    #[serde(default)]
    pub max_af: Option<f64>,
    /// Ultimate Oscillator short period.
    #[serde(default)]
    pub a: Option<u32>,
    /// Ultimate Oscillator medium period.
    #[serde(default)]
    pub b: Option<u32>,
    /// Ultimate Oscillator long period.
    #[serde(default)]
    pub c: Option<u32>,
}

impl IndicatorConfig {
    pub fn enabled_with_length(length: u32, buy: f64, sell: f64) -> Self {
        Self {
            enabled: true,
            length: Some(length),
            buy_value: Some(buy),
            sell_value: Some(sell),
            ..Default::default()
        }
    }
}

// =============================================================================
// Position percent units
// =============================================================================

/// How `position_pct` is interpreted. `Auto` treats values > 1 as percent
/// and values <= 1 as a fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PctUnits {
    Percent,
    Fraction,
    Auto,
}

impl Default for PctUnits {
    fn default() -> Self {
        Self::Auto
    }
}

// =============================================================================
// BotConfig
// =============================================================================

/// Top-level configuration for the Meridian engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    // --- Account & connectivity ---------------------------------------------
    #[serde(default)]
    pub account_type: AccountType,

    #[serde(default)]
    pub mode: TradeMode,

    // --- Universe -----------------------------------------------------------
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_intervals")]
    pub intervals: Vec<String>,

    /// Klines fetched per evaluation.
    #[serde(default = "default_lookback")]
    pub lookback: u32,

    // --- Position shape -----------------------------------------------------
    #[serde(default = "default_leverage")]
    pub leverage: u32,

    #[serde(default)]
    pub position_mode: PositionMode,

    #[serde(default)]
    pub margin_mode: MarginMode,

    /// Which side(s) signals may open.
    #[serde(default)]
    pub side: SideFilter,

    /// Margin allocation per indicator slot (see `position_pct_units`).
    #[serde(default = "default_position_pct")]
    pub position_pct: f64,

    #[serde(default)]
    pub position_pct_units: PctUnits,

    // --- Auto-bump ----------------------------------------------------------
    /// Hard ceiling on the percent of equity an auto-bumped minimum order
    /// may consume.
    #[serde(default = "default_max_auto_bump_percent")]
    pub max_auto_bump_percent: f64,

    /// The requested percent times this multiplier also caps auto-bump.
    #[serde(default = "default_auto_bump_multiplier")]
    pub auto_bump_percent_multiplier: f64,

    // --- Indicator evaluation gates -----------------------------------------
    /// Use the live (still-forming) bar for threshold checks instead of the
    /// last closed bar.
    #[serde(default)]
    pub indicator_use_live_values: bool,

    #[serde(default = "default_flip_cooldown_bars")]
    pub indicator_flip_cooldown_bars: u32,

    #[serde(default)]
    pub indicator_flip_cooldown_seconds: f64,

    #[serde(default)]
    pub indicator_min_position_hold_bars: u32,

    #[serde(default)]
    pub indicator_min_position_hold_seconds: f64,

    /// A same-direction signal must repeat this many bars before it fires.
    #[serde(default = "default_flip_confirmation_bars")]
    pub indicator_flip_confirmation_bars: u32,

    // --- Risk ---------------------------------------------------------------
    #[serde(default)]
    pub stop_loss: StopLossConfig,

    /// Permit simultaneous BUY and SELL legs in hedge mode.
    #[serde(default)]
    pub allow_opposite_positions: bool,

    /// In one-way mode, block signals that would reverse the net position
    /// (only reduce-only shrinking is allowed).
    #[serde(default)]
    pub add_only: bool,

    // --- Order submission ---------------------------------------------------
    #[serde(default = "default_order_rate_min_spacing")]
    pub order_rate_min_spacing: f64,

    #[serde(default = "default_order_rate_retry_backoff")]
    pub order_rate_retry_backoff: f64,

    /// Slack over the per-indicator margin cap before refusing (fraction,
    /// 0.05 = 5%).
    #[serde(default = "default_margin_tolerance")]
    pub margin_over_target_tolerance: f64,

    // --- Indicators ---------------------------------------------------------
    /// Keyed by canonical indicator token: "rsi", "stoch_rsi", "willr",
    /// "ma", "bb", "macd", "uo", "adx", "dmi", "supertrend", "stochastic",
    /// "psar", "donchian".
    #[serde(default)]
    pub indicators: BTreeMap<String, IndicatorConfig>,
}

impl Default for BotConfig {
    fn default() -> Self {
        let mut indicators = BTreeMap::new();
        indicators.insert(
            "rsi".to_string(),
            IndicatorConfig::enabled_with_length(14, 30.0, 70.0),
        );
        Self {
            account_type: AccountType::default(),
            mode: TradeMode::default(),
            symbols: default_symbols(),
            intervals: default_intervals(),
            lookback: default_lookback(),
            leverage: default_leverage(),
            position_mode: PositionMode::default(),
            margin_mode: MarginMode::default(),
            side: SideFilter::default(),
            position_pct: default_position_pct(),
            position_pct_units: PctUnits::default(),
            max_auto_bump_percent: default_max_auto_bump_percent(),
            auto_bump_percent_multiplier: default_auto_bump_multiplier(),
            indicator_use_live_values: false,
            indicator_flip_cooldown_bars: default_flip_cooldown_bars(),
            indicator_flip_cooldown_seconds: 0.0,
            indicator_min_position_hold_bars: 0,
            indicator_min_position_hold_seconds: 0.0,
            indicator_flip_confirmation_bars: default_flip_confirmation_bars(),
            stop_loss: StopLossConfig::default(),
            allow_opposite_positions: false,
            add_only: false,
            order_rate_min_spacing: default_order_rate_min_spacing(),
            order_rate_retry_backoff: default_order_rate_retry_backoff(),
            margin_over_target_tolerance: default_margin_tolerance(),
            indicators,
        }
    }
}

impl BotConfig {
    /// Resolve `position_pct` into a fraction in (0, 1].
    pub fn position_fraction(&self) -> f64 {
        let raw = self.position_pct;
        let frac = match self.position_pct_units {
            PctUnits::Percent => raw / 100.0,
            PctUnits::Fraction => raw,
            PctUnits::Auto => {
                if raw > 1.0 {
                    raw / 100.0
                } else {
                    raw
                }
            }
        };
        frac.clamp(0.0001, 1.0)
    }

    /// Margin tolerance normalized to a fraction (accepts 5.0 meaning 5%).
    pub fn margin_tolerance_fraction(&self) -> f64 {
        let tol = self.margin_over_target_tolerance;
        let tol = if tol > 1.0 { tol / 100.0 } else { tol };
        tol.max(0.0)
    }

    pub fn indicator(&self, key: &str) -> Option<&IndicatorConfig> {
        self.indicators.get(key)
    }

    /// Load configuration from a JSON file at `path`. Missing file is an
    /// error so the caller can fall back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            intervals = ?config.intervals,
            mode = %config.mode,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist to `path` using an atomic write (write `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }
}
