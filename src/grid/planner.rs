//! Grid Planner: a pure function mapping a price range, requested grid count,
//! and volatility context to an ordered set of weighted levels.

use crate::ledger::{GridLevel, Side};
use crate::market::VolatilityBucket;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

const CURVE_EXPONENT: f64 = 0.85;

#[derive(Debug, Clone, Copy)]
pub struct PlannerInput {
    pub lower_price: Decimal,
    pub upper_price: Decimal,
    pub requested_grid_count: u32,
    pub current_price: Decimal,
    pub volatility_bucket: Option<VolatilityBucket>,
    pub grid_count_floor: u32,
    pub grid_count_cap: u32,
    pub tick_size: Decimal,
}

/// Shrinks the requested count by 30% on HIGH volatility (floor) and grows it
/// by 30% on LOW (cap); MEDIUM and unknown volatility pass the count through.
pub fn effective_grid_count(input: &PlannerInput) -> u32 {
    let base = input.requested_grid_count as f64;
    let adjusted = match input.volatility_bucket {
        Some(VolatilityBucket::High) => base * 0.7,
        Some(VolatilityBucket::Low) => base * 1.3,
        Some(VolatilityBucket::Medium) | None => base,
    };
    (adjusted.round() as u32).clamp(input.grid_count_floor, input.grid_count_cap)
}

fn round_to_tick(price: f64, tick_size: Decimal) -> Decimal {
    let tick_f64 = tick_size.to_f64().unwrap_or(0.0);
    if tick_f64 <= 0.0 {
        return Decimal::try_from(price).unwrap_or_default().round_dp(8);
    }
    let rounded = (price / tick_f64).round() * tick_f64;
    Decimal::try_from(rounded).unwrap_or_default()
}

/// Plans an ordered set of grid levels. `n = effective_grid_count(input) + 1`
/// price points are produced (the fencepost count for `n-1` grid steps).
pub fn plan_levels(input: &PlannerInput) -> Vec<GridLevel> {
    let grid_count = effective_grid_count(input);
    let n = (grid_count + 1).max(2);
    let lower = input.lower_price.to_f64().unwrap_or(0.0);
    let upper = input.upper_price.to_f64().unwrap_or(0.0);
    let width = upper - lower;
    let current = input.current_price;

    let use_curve = input.volatility_bucket.is_some();

    (0..n)
        .map(|i| {
            let t = i as f64 / (n - 1) as f64;
            let raw_price = if use_curve {
                lower + t.powf(CURVE_EXPONENT) * width
            } else {
                lower + t * width
            };
            let price = round_to_tick(raw_price, input.tick_size);

            // Strictly-less-than current price is a buy; equal-or-above is a sell.
            let side_at_plan = if price < current { Side::Buy } else { Side::Sell };

            // Bell curve around the mid-level: weights range [1.0, 1.5].
            let weight_f64 = 1.0 + (1.0 - 2.0 * (t - 0.5).abs()) * 0.5;
            let weight = Decimal::try_from(weight_f64).unwrap_or_default();

            GridLevel { index: i as i32, price, side_at_plan, weight }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_input() -> PlannerInput {
        PlannerInput {
            lower_price: dec!(90000),
            upper_price: dec!(100000),
            requested_grid_count: 10,
            current_price: dec!(95000),
            volatility_bucket: Some(VolatilityBucket::Medium),
            grid_count_floor: 5,
            grid_count_cap: 20,
            tick_size: dec!(0.01),
        }
    }

    #[test]
    fn high_volatility_shrinks_grid_count_with_a_floor() {
        let mut input = base_input();
        input.requested_grid_count = 6;
        input.volatility_bucket = Some(VolatilityBucket::High);
        // 6 * 0.7 = 4.2 -> rounds to 4, floored to 5.
        assert_eq!(effective_grid_count(&input), 5);
    }

    #[test]
    fn low_volatility_grows_grid_count_with_a_cap() {
        let mut input = base_input();
        input.requested_grid_count = 18;
        input.volatility_bucket = Some(VolatilityBucket::Low);
        // 18 * 1.3 = 23.4 -> capped to 20.
        assert_eq!(effective_grid_count(&input), 20);
    }

    #[test]
    fn produces_one_more_level_than_the_effective_grid_count() {
        let input = base_input();
        let levels = plan_levels(&input);
        assert_eq!(levels.len() as u32, effective_grid_count(&input) + 1);
    }

    #[test]
    fn levels_at_current_price_are_sells_not_buys() {
        let mut input = base_input();
        input.current_price = dec!(95000);
        let levels = plan_levels(&input);
        for level in &levels {
            if level.price == input.current_price {
                assert_eq!(level.side_at_plan, Side::Sell);
            }
            if level.price < input.current_price {
                assert_eq!(level.side_at_plan, Side::Buy);
            } else {
                assert_eq!(level.side_at_plan, Side::Sell);
            }
        }
    }

    #[test]
    fn weights_stay_within_the_bell_curve_bounds() {
        let levels = plan_levels(&base_input());
        for level in &levels {
            assert!(level.weight >= dec!(1.0) && level.weight <= dec!(1.5));
        }
    }

    #[test]
    fn uniform_fallback_is_used_when_volatility_is_unknown() {
        let mut input = base_input();
        input.volatility_bucket = None;
        let levels = plan_levels(&input);
        let lower = input.lower_price;
        let upper = input.upper_price;
        let width = upper - lower;
        let n = levels.len();
        for (i, level) in levels.iter().enumerate() {
            let t = Decimal::try_from(i as f64 / (n - 1) as f64).unwrap();
            let expected = lower + t * width;
            assert!((level.price - expected).abs() < dec!(0.5));
        }
    }
}
