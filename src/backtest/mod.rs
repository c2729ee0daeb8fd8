//! Backtest Engine: replays an OHLCV sequence through the same Grid Planner,
//! Position Sizer, and Sentiment Modulator the live engine uses. Only the
//! fill simulator (candle high/low crossing) and the exchange surface differ
//! from the live path - this is shared code, not a parallel reimplementation.

use crate::grid::planner::{plan_levels, PlannerInput};
use crate::grid::sizer::{size_position, SizerConfig, SizerInput};
use crate::ledger::Side;
use crate::market::{self, Candle};
use crate::sentiment::{SentimentModulator, SentimentSnapshot};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub symbol: String,
    pub lower_price: Decimal,
    pub upper_price: Decimal,
    pub grid_count: u32,
    pub order_size: Decimal,
    pub starting_equity: Decimal,
    pub fee_rate: Decimal,
    pub stop_loss_pct: Decimal,
    pub rebalance_threshold: Decimal,
    pub stale_range: Decimal,
    pub grid_count_floor: u32,
    pub grid_count_cap: u32,
    pub sizer: SizerConfig,
}

#[derive(Debug, Clone, Default)]
pub struct BacktestReport {
    pub equity_curve: Vec<f64>,
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_trades: u64,
    pub total_pnl: Decimal,
    pub total_fees: Decimal,
    pub skipped_buys: u64,
    pub skipped_sells: u64,
    pub rebalance_count: u32,
}

#[derive(Debug, Clone)]
struct SimOrder {
    level_index: i32,
    side: Side,
    price: Decimal,
    amount: Decimal,
}

#[derive(Debug, Clone)]
struct OpenPosition {
    entry_price: Decimal,
    amount: Decimal,
}

pub struct BacktestEngine {
    modulator: Arc<dyn SentimentModulator>,
}

impl BacktestEngine {
    pub fn new(modulator: Arc<dyn SentimentModulator>) -> Self {
        Self { modulator }
    }

    pub async fn run(
        &self,
        candles: &[Candle],
        sentiment_history: &HashMap<i64, SentimentSnapshot>,
        cfg: &BacktestConfig,
    ) -> BacktestReport {
        let mut lower = cfg.lower_price;
        let mut upper = cfg.upper_price;
        let mut open_orders: Vec<SimOrder> = Vec::new();
        let mut positions: Vec<OpenPosition> = Vec::new();

        let mut equity = cfg.starting_equity;
        let mut equity_curve = Vec::with_capacity(candles.len());
        let mut wins = 0u64;
        let mut losses = 0u64;
        let mut sum_win = Decimal::ZERO;
        let mut sum_loss = Decimal::ZERO;
        let mut total_fees = Decimal::ZERO;
        let mut total_pnl = Decimal::ZERO;
        let mut total_trades = 0u64;
        let mut skipped_buys = 0u64;
        let mut skipped_sells = 0u64;
        let mut rebalance_count = 0u32;

        for (i, candle) in candles.iter().enumerate() {
            let window_start = i.saturating_sub(30);
            let window = &candles[window_start..=i];
            let features = market::compute_features(window, 14, 12, 26);
            let current_price = candle.close;

            // Fill simulation: buys fill on candle low crossing, sells on high.
            let mut still_open = Vec::with_capacity(open_orders.len());
            for order in open_orders.drain(..) {
                let crossed = match order.side {
                    Side::Buy => candle.low <= order.price,
                    Side::Sell => candle.high >= order.price,
                };
                if !crossed {
                    still_open.push(order);
                    continue;
                }

                let value = order.price * order.amount;
                let fee = value * cfg.fee_rate;
                total_fees += fee;
                equity -= fee;
                total_trades += 1;

                match order.side {
                    Side::Buy => {
                        equity -= value;
                        positions.push(OpenPosition { entry_price: order.price, amount: order.amount });
                    }
                    Side::Sell => {
                        equity += value;
                        if let Some(pos) = pop_matching_position(&mut positions, order.amount) {
                            let profit = (order.price - pos.entry_price) * order.amount - fee;
                            total_pnl += profit;
                            if profit > Decimal::ZERO {
                                wins += 1;
                                sum_win += profit;
                            } else if profit < Decimal::ZERO {
                                losses += 1;
                                sum_loss += -profit;
                            }
                        }
                    }
                }

                // Replacement-order action: opposite side, one grid step away.
                let grid_spacing = (upper - lower) / Decimal::from(cfg.grid_count.max(1));
                let replacement_price = match order.side {
                    Side::Buy => order.price + grid_spacing,
                    Side::Sell => order.price - grid_spacing,
                }
                .clamp(lower, upper);
                still_open.push(SimOrder { level_index: order.level_index, side: order.side.opposite(), price: replacement_price, amount: order.amount });
            }
            open_orders = still_open;

            // Stop-loss sweep: close every open position breaching the hard stop.
            let stop_pct = cfg.stop_loss_pct / Decimal::from(100);
            positions.retain(|pos| {
                let hard_stop = pos.entry_price * (Decimal::ONE - stop_pct);
                if current_price <= hard_stop {
                    let profit = (current_price - pos.entry_price) * pos.amount;
                    total_pnl += profit;
                    equity += current_price * pos.amount;
                    if profit > Decimal::ZERO {
                        wins += 1;
                        sum_win += profit;
                    } else {
                        losses += 1;
                        sum_loss += -profit;
                    }
                    total_trades += 1;
                    false
                } else {
                    true
                }
            });

            // Rebalance check.
            let width = upper - lower;
            if width > Decimal::ZERO {
                let threshold = cfg.rebalance_threshold / Decimal::from(100);
                let lo_bound = lower - width * threshold;
                let hi_bound = upper + width * threshold;
                if current_price < lo_bound || current_price > hi_bound {
                    let new_lower = current_price - width * Decimal::new(4, 1);
                    let new_upper = current_price + width * Decimal::new(6, 1);
                    if new_lower != lower || new_upper != upper {
                        lower = new_lower;
                        upper = new_upper;
                        open_orders.clear();
                        rebalance_count += 1;
                    }
                }
            }

            // Stale-order cancellation.
            let stale_range = cfg.stale_range / Decimal::from(100);
            let last_price_nonzero = current_price.max(Decimal::new(1, 8));
            open_orders.retain(|o| (o.price - current_price).abs() / last_price_nonzero <= stale_range);

            // Planning + sizing for uncovered levels.
            let planner_input = PlannerInput {
                lower_price: lower,
                upper_price: upper,
                requested_grid_count: cfg.grid_count,
                current_price,
                volatility_bucket: Some(features.volatility_bucket),
                grid_count_floor: cfg.grid_count_floor,
                grid_count_cap: cfg.grid_count_cap,
                tick_size: Decimal::new(1, 8),
            };
            let levels = plan_levels(&planner_input);
            let snapshot = sentiment_history.get(&candle.open_time_ms).cloned().unwrap_or_default();
            let modulation = self.modulator.modulate(&cfg.symbol, &snapshot).await.modulation;
            let atr_percent = Decimal::try_from(features.atr_percent.max(0.01)).unwrap_or(Decimal::ONE);
            let grid_spacing_pct = if levels.len() > 1 && !current_price.is_zero() {
                (upper - lower) / Decimal::from(levels.len() as u64) / current_price * Decimal::from(100)
            } else {
                Decimal::ONE
            };
            let win_rate = if wins + losses > 0 { Decimal::from(wins) / Decimal::from(wins + losses) } else { Decimal::ZERO };
            let avg_win = if wins > 0 { sum_win / Decimal::from(wins) } else { Decimal::ZERO };
            let avg_loss = if losses > 0 { sum_loss / Decimal::from(losses) } else { Decimal::ZERO };
            let sentiment_multiplier = Decimal::try_from(modulation.size_multiplier).unwrap_or(Decimal::ONE);

            for level in &levels {
                if open_orders.iter().any(|o| o.level_index == level.index) {
                    continue;
                }
                if modulation.skip_buys && level.side_at_plan == Side::Buy {
                    skipped_buys += 1;
                    continue;
                }
                if modulation.skip_sells && level.side_at_plan == Side::Sell {
                    skipped_sells += 1;
                    continue;
                }
                let sizer_input = SizerInput {
                    base_order_size: cfg.order_size,
                    current_price,
                    available_equity: equity,
                    win_rate,
                    avg_win,
                    avg_loss,
                    total_trades: total_trades as u32,
                    atr_percent,
                    grid_spacing_percent: grid_spacing_pct,
                    sentiment_multiplier,
                    level_weight: level.weight,
                };
                let sized = size_position(&sizer_input, &cfg.sizer);
                if sized.size_quote.is_zero() || level.price.is_zero() {
                    continue;
                }
                let amount = sized.size_quote / level.price;
                open_orders.push(SimOrder { level_index: level.index, side: level.side_at_plan, price: level.price, amount });
            }

            let mark_to_market: Decimal = positions.iter().map(|p| p.amount * current_price).sum();
            equity_curve.push((equity + mark_to_market).to_f64().unwrap_or(0.0));
        }

        let profit_factor = if sum_loss > Decimal::ZERO { (sum_win / sum_loss).to_f64().unwrap_or(0.0) } else { 0.0 };
        let win_rate = if wins + losses > 0 { wins as f64 / (wins + losses) as f64 } else { 0.0 };

        BacktestReport {
            sharpe: market::sharpe_ratio(&equity_curve),
            max_drawdown: market::max_drawdown(&equity_curve),
            equity_curve,
            win_rate,
            profit_factor,
            total_trades,
            total_pnl,
            total_fees,
            skipped_buys,
            skipped_sells,
            rebalance_count,
        }
    }
}

fn pop_matching_position(positions: &mut Vec<OpenPosition>, amount: Decimal) -> Option<OpenPosition> {
    if positions.is_empty() {
        return None;
    }
    if let Some(idx) = positions.iter().position(|p| p.amount == amount) {
        return Some(positions.remove(idx));
    }
    Some(positions.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sentiment::DisabledModulator;
    use rust_decimal_macros::dec;

    fn flat_candles(n: usize, price: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                open_time_ms: i as i64 * 60_000,
                open: Decimal::try_from(price).unwrap(),
                high: Decimal::try_from(price * 1.001).unwrap(),
                low: Decimal::try_from(price * 0.999).unwrap(),
                close: Decimal::try_from(price).unwrap(),
                volume: dec!(1),
            })
            .collect()
    }

    fn base_config() -> BacktestConfig {
        BacktestConfig {
            symbol: "BTC/USD".into(),
            lower_price: dec!(90000),
            upper_price: dec!(100000),
            grid_count: 10,
            order_size: dec!(100),
            starting_equity: dec!(10000),
            fee_rate: dec!(0.001),
            stop_loss_pct: dec!(15),
            rebalance_threshold: dec!(10),
            stale_range: dec!(5),
            grid_count_floor: 5,
            grid_count_cap: 20,
            sizer: SizerConfig { max_position_percent: dec!(0.10), min_position_percent: dec!(0.001), kelly_fraction: dec!(0.25), kelly_min_trades: 20, max_risk_per_trade: dec!(0.02), lot_precision: 6 },
        }
    }

    #[tokio::test]
    async fn produces_an_equity_point_per_candle() {
        let engine = BacktestEngine::new(Arc::new(DisabledModulator));
        let candles = flat_candles(20, 95000.0);
        let report = engine.run(&candles, &HashMap::new(), &base_config()).await;
        assert_eq!(report.equity_curve.len(), candles.len());
    }

    #[tokio::test]
    async fn fee_is_applied_per_trade_not_at_report_time() {
        let engine = BacktestEngine::new(Arc::new(DisabledModulator));
        let candles = flat_candles(30, 95000.0);
        let report = engine.run(&candles, &HashMap::new(), &base_config()).await;
        // Any executed trade must have contributed a nonzero fee total once fills occur.
        if report.total_trades > 0 {
            assert!(report.total_fees >= Decimal::ZERO);
        }
    }
}
