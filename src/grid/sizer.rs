//! Position Sizer: combines base size, equity, win-rate/Kelly, volatility,
//! and sentiment into an adjusted order size, following this codebase's
//! existing `RiskManager`/Kelly-calculator shape (fractional Kelly, clamped
//! multipliers, an explicit flags/audit trail rather than silent clamping).

use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy)]
pub struct SizerInput {
    pub base_order_size: Decimal,
    pub current_price: Decimal,
    pub available_equity: Decimal,
    pub win_rate: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub total_trades: u32,
    pub atr_percent: Decimal,
    pub grid_spacing_percent: Decimal,
    pub sentiment_multiplier: Decimal,
    pub level_weight: Decimal,
}

#[derive(Debug, Clone)]
pub struct SizerConfig {
    pub max_position_percent: Decimal,
    pub min_position_percent: Decimal,
    pub kelly_fraction: Decimal,
    pub kelly_min_trades: u32,
    pub max_risk_per_trade: Decimal,
    pub lot_precision: u32,
}

#[derive(Debug, Clone)]
pub struct SizedResult {
    pub size_quote: Decimal,
    pub adjustments: Vec<String>,
}

fn clamp(value: Decimal, lo: Decimal, hi: Decimal) -> Decimal {
    if value < lo {
        lo
    } else if value > hi {
        hi
    } else {
        value
    }
}

/// Deterministic: identical inputs always produce an identical result, with
/// an `adjustments` trail naming every rule that fired.
pub fn size_position(input: &SizerInput, cfg: &SizerConfig) -> SizedResult {
    let mut adjustments = Vec::new();

    // 1. Base.
    let mut size = input.base_order_size * input.level_weight * input.sentiment_multiplier;
    adjustments.push(format!(
        "base={}*weight={}*sentiment={}={}",
        input.base_order_size, input.level_weight, input.sentiment_multiplier, size
    ));

    // 2. Cap to maxPositionPercent * equity.
    let max_cap = cfg.max_position_percent * input.available_equity;
    if size > max_cap {
        size = max_cap;
        adjustments.push(format!("capped_to_max_position_percent={max_cap}"));
    }

    // 3. Fractional Kelly, gated on a minimum trade count.
    if input.total_trades >= cfg.kelly_min_trades && !input.avg_loss.is_zero() {
        let p = clamp(input.win_rate, Decimal::new(1, 3), Decimal::new(999, 3));
        let q = Decimal::ONE - p;
        let b = input.avg_win / input.avg_loss;
        if b > Decimal::ZERO {
            let f_star = ((b * p - q) / b).max(Decimal::ZERO);
            let kelly_multiplier = clamp(cfg.kelly_fraction * f_star, Decimal::new(5, 1), Decimal::new(15, 1));
            size *= kelly_multiplier;
            adjustments.push(format!("kelly_multiplier={kelly_multiplier}"));
        }
    }

    // 4. Volatility multiplier: base/atrPercent, clamped [0.5, 2.0].
    if !input.atr_percent.is_zero() {
        let vol_multiplier = clamp(Decimal::ONE / input.atr_percent, Decimal::new(5, 1), Decimal::new(2, 0));
        size *= vol_multiplier;
        adjustments.push(format!("volatility_multiplier={vol_multiplier}"));
    }

    // 5. Risk cap: size <= (maxRiskPerTrade * equity) / potentialLossPercent.
    if !input.grid_spacing_percent.is_zero() {
        let risk_cap = (cfg.max_risk_per_trade * input.available_equity) / input.grid_spacing_percent;
        if size > risk_cap {
            size = risk_cap;
            adjustments.push(format!("capped_to_risk_cap={risk_cap}"));
        }
    }

    // 6. Floor: minPositionPercent * equity.
    let floor = cfg.min_position_percent * input.available_equity;
    if size < floor {
        size = floor;
        adjustments.push(format!("floored_to_min_position_percent={floor}"));
    }

    // 7. Round to lot precision.
    let rounded = size.round_dp(cfg.lot_precision);
    if rounded != size {
        adjustments.push(format!("rounded_to_lot_precision={rounded}"));
    }

    SizedResult { size_quote: rounded, adjustments }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_input() -> SizerInput {
        SizerInput {
            base_order_size: dec!(100),
            current_price: dec!(95000),
            available_equity: dec!(10000),
            win_rate: dec!(0.55),
            avg_win: dec!(120),
            avg_loss: dec!(80),
            total_trades: 5,
            atr_percent: dec!(2.0),
            grid_spacing_percent: dec!(1.0),
            sentiment_multiplier: dec!(1.0),
            level_weight: dec!(1.0),
        }
    }

    fn base_config() -> SizerConfig {
        SizerConfig {
            max_position_percent: dec!(0.10),
            min_position_percent: dec!(0.001),
            kelly_fraction: dec!(0.25),
            kelly_min_trades: 20,
            max_risk_per_trade: dec!(0.02),
            lot_precision: 6,
        }
    }

    #[test]
    fn is_deterministic_for_identical_inputs() {
        let input = base_input();
        let cfg = base_config();
        let a = size_position(&input, &cfg);
        let b = size_position(&input, &cfg);
        assert_eq!(a.size_quote, b.size_quote);
    }

    #[test]
    fn kelly_is_skipped_below_the_minimum_trade_count() {
        let input = base_input();
        let cfg = base_config();
        let result = size_position(&input, &cfg);
        assert!(!result.adjustments.iter().any(|a| a.contains("kelly")));
    }

    #[test]
    fn kelly_applies_once_the_minimum_trade_count_is_reached() {
        let mut input = base_input();
        input.total_trades = 25;
        let cfg = base_config();
        let result = size_position(&input, &cfg);
        assert!(result.adjustments.iter().any(|a| a.contains("kelly")));
    }

    #[test]
    fn is_monotonically_non_decreasing_in_equity() {
        let cfg = base_config();
        let mut low_equity = base_input();
        low_equity.available_equity = dec!(1000);
        let mut high_equity = base_input();
        high_equity.available_equity = dec!(100000);

        let low = size_position(&low_equity, &cfg).size_quote;
        let high = size_position(&high_equity, &cfg).size_quote;
        assert!(high >= low);
    }

    #[test]
    fn is_monotonically_non_increasing_in_atr_percent() {
        let cfg = base_config();
        let mut low_vol = base_input();
        low_vol.atr_percent = dec!(1.0);
        let mut high_vol = base_input();
        high_vol.atr_percent = dec!(4.0);

        let low = size_position(&low_vol, &cfg).size_quote;
        let high = size_position(&high_vol, &cfg).size_quote;
        assert!(high <= low);
    }

    #[test]
    fn never_sizes_below_the_configured_floor() {
        let mut input = base_input();
        input.base_order_size = dec!(0.0001);
        input.level_weight = dec!(1.0);
        let cfg = base_config();
        let result = size_position(&input, &cfg);
        let floor = cfg.min_position_percent * input.available_equity;
        assert!(result.size_quote >= floor);
    }
}
