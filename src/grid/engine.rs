//! Grid Engine: the per-bot state machine. Plans grids, places and tracks
//! limit orders through the Ledger, reacts to fills, rebalances, and enforces
//! stops. One engine instance is shared across bots; per-bot in-memory state
//! (open positions, trailing stops, skip counters) lives in `BotRuntime`.

use super::planner::{plan_levels, PlannerInput};
use super::sizer::{size_position, SizerConfig, SizerInput};
use crate::config::Config;
use crate::error::{EngineError, ExchangeError};
use crate::exchange::Exchange;
use crate::ledger::{BotPatch, BotStatus, Ledger, NewOrder, Side, Trade};
use crate::market::{self, Candle, Features};
use crate::sentiment::{SentimentModulator, SentimentSource};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Bounded retry budget for a single retryable exchange call within one cycle,
/// per SPEC_FULL.md's "retry with exponential backoff up to N times within a
/// cycle before falling back to the next cycle" failure semantics.
const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 200;

/// Places a limit order, retrying retryable `ExchangeError`s with exponential
/// backoff before giving up for this cycle.
async fn place_with_retry(
    exchange: &Arc<dyn Exchange>,
    symbol: &str,
    side: Side,
    amount: Decimal,
    price: Decimal,
) -> Result<i64, ExchangeError> {
    let mut attempt = 0;
    loop {
        match exchange.place_limit_order(symbol, side, amount, price).await {
            Ok(id) => return Ok(id),
            Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                attempt += 1;
                let delay = RETRY_BASE_DELAY_MS * 2u64.pow(attempt - 1);
                warn!(symbol, attempt, delay_ms = delay, error = %e, "retryable order placement failure, backing off");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Clone)]
struct OpenPosition {
    trade_id: i64,
    entry_price: Decimal,
    amount: Decimal,
    trailing_stop: Option<Decimal>,
}

#[derive(Debug, Default)]
struct BotRuntime {
    open_positions: Vec<OpenPosition>,
    skipped_buys: u64,
    skipped_sells: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub placed: u32,
    pub cancelled: u32,
    pub closed_positions: u32,
    pub skipped_buys: u64,
    pub skipped_sells: u64,
    pub paused: bool,
}

pub struct GridEngine {
    ledger: Arc<Ledger>,
    exchange: Arc<dyn Exchange>,
    modulator: Arc<dyn SentimentModulator>,
    sentiment_source: Arc<dyn SentimentSource>,
    config: Config,
    runtime: Mutex<HashMap<String, BotRuntime>>,
}

impl GridEngine {
    pub fn new(
        ledger: Arc<Ledger>,
        exchange: Arc<dyn Exchange>,
        modulator: Arc<dyn SentimentModulator>,
        sentiment_source: Arc<dyn SentimentSource>,
        config: Config,
    ) -> Self {
        Self { ledger, exchange, modulator, sentiment_source, config, runtime: Mutex::new(HashMap::new()) }
    }

    fn tick_size_for(&self, _symbol: &str) -> Decimal {
        Decimal::new(1, 8)
    }

    async fn features_for(&self, symbol: &str) -> Result<Features, ExchangeError> {
        let candles: Vec<Candle> = self.exchange.fetch_ohlcv(symbol, "1h", None, None, Some(60)).await?;
        if candles.is_empty() {
            return Ok(Features { atr_percent: 0.0, volatility_bucket: market::VolatilityBucket::Medium, regime: market::Regime::Ranging, ema_fast: 0.0, ema_slow: 0.0 });
        }
        Ok(market::compute_features(&candles, 14, 12, 26))
    }

    /// Reaction to a single fill, driven by the Reconciler. Closes or opens an
    /// in-memory position and queues the replacement-order action (step 7).
    pub async fn on_fill(&self, bot_name: &str, trade: &Trade) -> Result<(), EngineError> {
        let bot = self.ledger.get_bot(bot_name).await?.ok_or_else(|| EngineError::Fatal(format!("bot '{bot_name}' vanished mid-reaction")))?;

        let mut runtime_guard = self.runtime.lock().await;
        let runtime = runtime_guard.entry(bot_name.to_string()).or_default();

        let mut closed_position = None;
        match trade.side {
            Side::Buy => {
                runtime.open_positions.push(OpenPosition {
                    trade_id: trade.id,
                    entry_price: trade.price,
                    amount: trade.amount,
                    trailing_stop: None,
                });
            }
            Side::Sell => {
                if let Some(pos) = runtime.open_positions.iter().position(|p| p.amount <= trade.amount) {
                    closed_position = Some(runtime.open_positions.remove(pos));
                } else if !runtime.open_positions.is_empty() {
                    closed_position = Some(runtime.open_positions.remove(0));
                }
            }
        }
        drop(runtime_guard);

        if let Some(pos) = closed_position {
            let profit = (trade.price - pos.entry_price) * pos.amount - trade.fee;
            self.ledger.set_trade_profit(trade.id, profit).await?;
        }

        let order = trade.order_id;
        let grid_spacing = self.estimate_grid_spacing(&bot).await?;
        let opposite_side = trade.side.opposite();
        let replacement_price = match trade.side {
            Side::Buy => trade.price + grid_spacing,
            Side::Sell => trade.price - grid_spacing,
        };
        let clamped = replacement_price.clamp(bot.lower_price, bot.upper_price);

        let open_orders = self.ledger.list_open_orders(Some(bot_name)).await?;
        let already_covered = open_orders.iter().any(|o| o.price == clamped && o.side == opposite_side);
        if already_covered {
            info!(bot = bot_name, order_id = ?order, "replacement level already covered, skipping");
            return Ok(());
        }

        let level_index = next_free_level_index(&open_orders);
        let amount = if clamped.is_zero() { Decimal::ZERO } else { trade.value / clamped };
        let exchange_id = match place_with_retry(&self.exchange, &bot.symbol, opposite_side, amount, clamped).await {
            Ok(id) => id,
            Err(e) if e.is_retryable() => {
                warn!(bot = bot_name, error = %e, "replacement order placement exhausted retries, will retry next cycle");
                return Ok(());
            }
            Err(e) => return Err(EngineError::Exchange(e)),
        };

        self.ledger
            .insert_orders(&[NewOrder {
                id: exchange_id,
                bot_name: bot_name.to_string(),
                symbol: bot.symbol.clone(),
                side: opposite_side,
                price: clamped,
                amount,
                size_quote: clamped * amount,
                level_index,
                weight: Decimal::ONE,
            }])
            .await?;
        info!(bot = bot_name, side = ?opposite_side, price = %clamped, "replacement order placed");
        Ok(())
    }

    async fn estimate_grid_spacing(&self, bot: &crate::ledger::Bot) -> Result<Decimal, EngineError> {
        let count = Decimal::from(bot.adjusted_grid_count.max(1));
        Ok((bot.upper_price - bot.lower_price) / count)
    }

    /// Runs one control-loop cycle for a running or paused bot. Paused bots
    /// only get the rebalance/stale-order housekeeping; no new placements.
    pub async fn run_cycle(&self, bot_name: &str) -> Result<CycleReport, EngineError> {
        let bot = self.ledger.get_bot(bot_name).await?.ok_or_else(|| EngineError::Ledger(crate::error::LedgerError::BotNotFound(bot_name.to_string())))?;
        if bot.status == BotStatus::Stopped {
            return Ok(CycleReport::default());
        }

        let mut report = CycleReport::default();

        let ticker = self.exchange.fetch_ticker(&bot.symbol).await?;
        let features = self.features_for(&bot.symbol).await?;
        let snapshot = self.sentiment_source.snapshot(&bot.symbol).await;
        let modulation = self.modulator.modulate(&bot.symbol, &snapshot).await.modulation;

        // 2. Stop-loss sweep.
        if bot.status == BotStatus::Running {
            if let Some((reason, pos)) = self.sweep_stops(&bot, ticker.last).await? {
                self.close_position(&bot, &pos, ticker.last).await?;
                {
                    let mut runtime_guard = self.runtime.lock().await;
                    if let Some(runtime) = runtime_guard.get_mut(bot_name) {
                        runtime.open_positions.retain(|p| p.trade_id != pos.trade_id);
                    }
                }
                self.ledger
                    .update_bot(bot_name, BotPatch { status: Some(BotStatus::Paused), stop_reason: Some(Some(reason)), ..Default::default() })
                    .await?;
                report.paused = true;
                report.closed_positions += 1;
                return Ok(report);
            }
        }

        // 3. Rebalance check.
        let rebalanced = self.maybe_rebalance(&bot, ticker.last).await?;
        let bot = if rebalanced { self.ledger.get_bot(bot_name).await?.unwrap() } else { bot };

        // 4. Stale-order cancellation.
        let stale_range = self.config.stale_range / Decimal::from(100);
        let open_orders = self.ledger.list_open_orders(Some(bot_name)).await?;
        for order in &open_orders {
            let distance = (order.price - ticker.last).abs() / ticker.last.max(Decimal::new(1, 8));
            if distance > stale_range {
                self.exchange.cancel_order(order.id, &bot.symbol).await.ok();
                self.ledger.cancel_order(order.id, "TOO_FAR_FROM_MARKET").await?;
                report.cancelled += 1;
            }
        }

        if bot.status != BotStatus::Running {
            return Ok(report);
        }

        // 5 & 6. Admission, sizing, and placement.
        let planner_input = PlannerInput {
            lower_price: bot.lower_price,
            upper_price: bot.upper_price,
            requested_grid_count: bot.grid_count,
            current_price: ticker.last,
            volatility_bucket: Some(features.volatility_bucket),
            grid_count_floor: self.config.grid_count_floor,
            grid_count_cap: self.config.grid_count_cap,
            tick_size: self.tick_size_for(&bot.symbol),
        };
        let levels = plan_levels(&planner_input);
        let open_orders = self.ledger.list_open_orders(Some(bot_name)).await?;

        let equity = self.available_equity(&bot).await?;
        let atr_percent = Decimal::try_from(features.atr_percent.max(0.01)).unwrap_or(Decimal::ONE);
        let grid_spacing_pct = if bot.lower_price.is_zero() {
            Decimal::ONE
        } else {
            (bot.upper_price - bot.lower_price) / Decimal::from(levels.len().max(1) as u64) / ticker.last.max(Decimal::new(1, 8)) * Decimal::from(100)
        };
        let metrics = self.ledger.recompute_metrics(bot_name).await?;

        let sizer_cfg = SizerConfig {
            max_position_percent: self.config.max_position_percent,
            min_position_percent: self.config.min_position_percent,
            kelly_fraction: self.config.kelly_fraction,
            kelly_min_trades: self.config.kelly_min_trades,
            max_risk_per_trade: self.config.max_risk_per_trade,
            lot_precision: 6,
        };
        let sentiment_multiplier = Decimal::try_from(modulation.size_multiplier).unwrap_or(Decimal::ONE);

        let mut runtime_guard = self.runtime.lock().await;
        let runtime = runtime_guard.entry(bot_name.to_string()).or_default();

        for level in &levels {
            if open_orders.iter().any(|o| o.level_index == level.index) {
                continue;
            }
            if modulation.skip_buys && level.side_at_plan == Side::Buy {
                runtime.skipped_buys += 1;
                continue;
            }
            if modulation.skip_sells && level.side_at_plan == Side::Sell {
                runtime.skipped_sells += 1;
                continue;
            }

            let sizer_input = SizerInput {
                base_order_size: bot.order_size,
                current_price: ticker.last,
                available_equity: equity,
                win_rate: metrics.win_rate,
                avg_win: metrics.avg_win,
                avg_loss: metrics.avg_loss,
                total_trades: metrics.total_trades as u32,
                atr_percent,
                grid_spacing_percent: grid_spacing_pct,
                sentiment_multiplier,
                level_weight: level.weight,
            };
            let sized = size_position(&sizer_input, &sizer_cfg);
            if sized.size_quote.is_zero() {
                continue;
            }
            let amount = sized.size_quote / level.price.max(Decimal::new(1, 8));

            match place_with_retry(&self.exchange, &bot.symbol, level.side_at_plan, amount, level.price).await {
                Ok(exchange_id) => {
                    self.ledger
                        .insert_orders(&[NewOrder {
                            id: exchange_id,
                            bot_name: bot_name.to_string(),
                            symbol: bot.symbol.clone(),
                            side: level.side_at_plan,
                            price: level.price,
                            amount,
                            size_quote: sized.size_quote,
                            level_index: level.index,
                            weight: level.weight,
                        }])
                        .await?;
                    report.placed += 1;
                }
                Err(ExchangeError::InsufficientFunds) => {
                    warn!(bot = bot_name, level = level.index, "insufficient funds, dropping level this cycle");
                }
                Err(e) if e.is_retryable() => {
                    warn!(bot = bot_name, level = level.index, error = %e, "transient placement failure exhausted retries, retrying next cycle");
                }
                Err(e) => return Err(EngineError::Exchange(e)),
            }
        }

        report.skipped_buys = runtime.skipped_buys;
        report.skipped_sells = runtime.skipped_sells;
        Ok(report)
    }

    async fn sweep_stops(&self, bot: &crate::ledger::Bot, current_price: Decimal) -> Result<Option<(String, OpenPosition)>, EngineError> {
        let mut runtime_guard = self.runtime.lock().await;
        let runtime = runtime_guard.entry(bot.name.clone()).or_default();

        let stop_loss_pct = self.config.stop_loss_pct / Decimal::from(100);
        let profit_lock = self.config.profit_lock_threshold / Decimal::from(100);
        let trailing_pct = self.config.trailing_pct / Decimal::from(100);

        for pos in runtime.open_positions.iter_mut() {
            let hard_stop = pos.entry_price * (Decimal::ONE - stop_loss_pct);
            if current_price <= hard_stop {
                return Ok(Some(("STOP_LOSS_HIT".to_string(), pos.clone())));
            }

            let unrealized_pct = if pos.entry_price.is_zero() { Decimal::ZERO } else { (current_price - pos.entry_price) / pos.entry_price };
            if unrealized_pct > profit_lock {
                let candidate = current_price * (Decimal::ONE - trailing_pct);
                pos.trailing_stop = Some(match pos.trailing_stop {
                    Some(existing) => existing.max(candidate),
                    None => candidate,
                });
            }
            if let Some(trailing) = pos.trailing_stop {
                if current_price <= trailing {
                    return Ok(Some(("TRAILING_STOP_HIT".to_string(), pos.clone())));
                }
            }
        }
        Ok(None)
    }

    /// Closes a stop-triggered position: places the closing sell, records the
    /// fill, and backfills the realized profit. Mirrors the pairing logic the
    /// backtest engine uses when a simulated stop-loss closes a position.
    async fn close_position(&self, bot: &crate::ledger::Bot, pos: &OpenPosition, current_price: Decimal) -> Result<Trade, EngineError> {
        let exchange_id = place_with_retry(&self.exchange, &bot.symbol, Side::Sell, pos.amount, current_price).await?;
        self.ledger
            .insert_orders(&[NewOrder {
                id: exchange_id,
                bot_name: bot.name.clone(),
                symbol: bot.symbol.clone(),
                side: Side::Sell,
                price: current_price,
                amount: pos.amount,
                size_quote: current_price * pos.amount,
                level_index: -2,
                weight: Decimal::ONE,
            }])
            .await?;
        let fee = current_price * pos.amount * self.config.taker_fee_rate;
        let trade = self.ledger.fill_order(exchange_id, current_price, Some(fee)).await?;
        let profit = (current_price - pos.entry_price) * pos.amount - fee;
        self.ledger.set_trade_profit(trade.id, profit).await?;
        info!(bot = %bot.name, trade_id = trade.id, profit = %profit, "position closed by stop");
        Ok(trade)
    }

    /// Rebalances when price leaves `[lower, upper]` by more than the
    /// configured threshold. Idempotent: re-running at the persisted range's
    /// own anchor point reproduces the same bounds, so the engine short-circuits.
    async fn maybe_rebalance(&self, bot: &crate::ledger::Bot, current_price: Decimal) -> Result<bool, EngineError> {
        let width = bot.upper_price - bot.lower_price;
        if width <= Decimal::ZERO {
            return Ok(false);
        }
        let threshold = self.config.rebalance_threshold / Decimal::from(100);
        let lower_bound = bot.lower_price - width * threshold;
        let upper_bound = bot.upper_price + width * threshold;
        if current_price >= lower_bound && current_price <= upper_bound {
            return Ok(false);
        }

        let new_lower = current_price - width * Decimal::new(4, 1);
        let new_upper = current_price + width * Decimal::new(6, 1);
        if new_lower == bot.lower_price && new_upper == bot.upper_price {
            return Ok(false);
        }

        let open_orders = self.ledger.list_open_orders(Some(&bot.name)).await?;
        for order in &open_orders {
            self.exchange.cancel_order(order.id, &bot.symbol).await.ok();
            self.ledger.cancel_order(order.id, "REBALANCE").await?;
        }

        self.ledger
            .update_bot(
                &bot.name,
                BotPatch { lower_price: Some(new_lower), upper_price: Some(new_upper), rebalance_count: Some(bot.rebalance_count + 1), ..Default::default() },
            )
            .await?;
        info!(bot = %bot.name, new_lower = %new_lower, new_upper = %new_upper, "bot rebalanced");
        Ok(true)
    }

    async fn available_equity(&self, bot: &crate::ledger::Bot) -> Result<Decimal, EngineError> {
        let balances = self.exchange.fetch_balance().await?;
        let quote_asset = bot.symbol.split('/').nth(1).unwrap_or("USD");
        let free = balances.get(quote_asset).map(|b| b.free).unwrap_or(Decimal::ZERO);
        Ok((free - self.config.reserve_usd).max(Decimal::ZERO))
    }
}

fn next_free_level_index(open_orders: &[crate::ledger::Order]) -> i32 {
    let mut used: Vec<i32> = open_orders.iter().map(|o| o.level_index).collect();
    used.sort_unstable();
    let mut candidate = 0;
    for index in used {
        if index == candidate {
            candidate += 1;
        } else if index > candidate {
            break;
        }
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_free_level_index_fills_the_first_gap() {
        let orders = vec![];
        assert_eq!(next_free_level_index(&orders), 0);
    }
}
