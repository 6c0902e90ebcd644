// =============================================================================
// Market data services: kline cache and live position view
// =============================================================================

pub mod klines;
pub mod positions;
