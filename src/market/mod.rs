//! Market Feature Service: ATR, EMA crossover, and trend/range regime, computed
//! from OHLCV candles. Float arithmetic only - these are statistics, not money.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolatilityBucket {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    Trending,
    Ranging,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Features {
    pub atr_percent: f64,
    pub volatility_bucket: VolatilityBucket,
    pub regime: Regime,
    pub ema_fast: f64,
    pub ema_slow: f64,
}

fn to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

/// True range / ATR over a fixed period, Wilder-smoothed.
pub fn average_true_range(candles: &[Candle], period: usize) -> f64 {
    if candles.len() < 2 {
        return 0.0;
    }
    let mut true_ranges = Vec::with_capacity(candles.len() - 1);
    for window in candles.windows(2) {
        let (prev, cur) = (window[0], window[1]);
        let high_low = to_f64(cur.high) - to_f64(cur.low);
        let high_close = (to_f64(cur.high) - to_f64(prev.close)).abs();
        let low_close = (to_f64(cur.low) - to_f64(prev.close)).abs();
        true_ranges.push(high_low.max(high_close).max(low_close));
    }
    let take = period.min(true_ranges.len());
    if take == 0 {
        return 0.0;
    }
    true_ranges[true_ranges.len() - take..].iter().sum::<f64>() / take as f64
}

pub fn atr_percent(candles: &[Candle], period: usize) -> f64 {
    let atr = average_true_range(candles, period);
    let last_close = candles.last().map(|c| to_f64(c.close)).unwrap_or(0.0);
    if last_close.abs() > f64::EPSILON {
        (atr / last_close) * 100.0
    } else {
        0.0
    }
}

/// Exponential moving average over the last `period` closes.
pub fn ema(candles: &[Candle], period: usize) -> f64 {
    if candles.is_empty() || period == 0 {
        return 0.0;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut value = to_f64(candles[0].close);
    for c in &candles[1..] {
        value = alpha * to_f64(c.close) + (1.0 - alpha) * value;
    }
    value
}

pub fn volatility_bucket(atr_pct: f64) -> VolatilityBucket {
    if atr_pct >= 4.0 {
        VolatilityBucket::High
    } else if atr_pct <= 1.5 {
        VolatilityBucket::Low
    } else {
        VolatilityBucket::Medium
    }
}

/// Trending when the fast EMA leads the slow one by more than a small margin;
/// ranging otherwise (the grid strategy's favorable regime).
pub fn regime(ema_fast: f64, ema_slow: f64) -> Regime {
    if ema_slow.abs() < f64::EPSILON {
        return Regime::Ranging;
    }
    let spread = (ema_fast - ema_slow).abs() / ema_slow;
    if spread > 0.02 {
        Regime::Trending
    } else {
        Regime::Ranging
    }
}

pub fn compute_features(candles: &[Candle], atr_period: usize, fast: usize, slow: usize) -> Features {
    let atr_pct = atr_percent(candles, atr_period);
    let ema_fast = ema(candles, fast);
    let ema_slow = ema(candles, slow);
    Features {
        atr_percent: atr_pct,
        volatility_bucket: volatility_bucket(atr_pct),
        regime: regime(ema_fast, ema_slow),
        ema_fast,
        ema_slow,
    }
}

/// Annualized Sharpe ratio from a period-return series (252 trading periods/yr,
/// matching this codebase's existing backtest reporting convention).
pub fn sharpe_ratio(equity_curve: &[f64]) -> f64 {
    if equity_curve.len() < 2 {
        return 0.0;
    }
    let mut returns = Vec::with_capacity(equity_curve.len() - 1);
    for window in equity_curve.windows(2) {
        let (prev, cur) = (window[0], window[1]);
        if prev.abs() > f64::EPSILON {
            returns.push((cur - prev) / prev);
        }
    }
    if returns.is_empty() {
        return 0.0;
    }
    let mean = returns[..].mean();
    let std_dev = returns[..].population_std_dev();
    if std_dev > f64::EPSILON {
        mean * 252.0_f64.sqrt() / std_dev
    } else {
        0.0
    }
}

pub fn max_drawdown(equity_curve: &[f64]) -> f64 {
    if equity_curve.is_empty() {
        return 0.0;
    }
    let mut peak = equity_curve[0];
    let mut worst = 0.0;
    for &equity in equity_curve {
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            let dd = (peak - equity) / peak;
            if dd > worst {
                worst = dd;
            }
        }
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(h: i64, o: f64, hi: f64, lo: f64, c: f64) -> Candle {
        Candle {
            open_time_ms: h,
            open: Decimal::try_from(o).unwrap(),
            high: Decimal::try_from(hi).unwrap(),
            low: Decimal::try_from(lo).unwrap(),
            close: Decimal::try_from(c).unwrap(),
            volume: dec!(1),
        }
    }

    #[test]
    fn atr_is_zero_on_flat_series() {
        let candles: Vec<Candle> = (0..10).map(|i| candle(i, 100.0, 100.0, 100.0, 100.0)).collect();
        assert_eq!(average_true_range(&candles, 5), 0.0);
    }

    #[test]
    fn volatility_bucket_thresholds() {
        assert_eq!(volatility_bucket(0.5), VolatilityBucket::Low);
        assert_eq!(volatility_bucket(2.5), VolatilityBucket::Medium);
        assert_eq!(volatility_bucket(5.0), VolatilityBucket::High);
    }

    #[test]
    fn regime_flags_trending_on_wide_ema_spread() {
        assert_eq!(regime(110.0, 100.0), Regime::Trending);
        assert_eq!(regime(100.5, 100.0), Regime::Ranging);
    }

    #[test]
    fn sharpe_is_zero_with_no_variance() {
        let curve = vec![100.0, 100.0, 100.0];
        assert_eq!(sharpe_ratio(&curve), 0.0);
    }

    #[test]
    fn max_drawdown_tracks_peak_to_trough() {
        let curve = vec![100.0, 120.0, 90.0, 110.0];
        let dd = max_drawdown(&curve);
        assert!((dd - 0.25).abs() < 1e-9);
    }
}
