//! End-to-end scenarios against an in-memory Ledger and a deterministic fake
//! Exchange Gateway, mirroring this codebase's integration-test shape.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridbot_backend::config::{Config, ExchangeMode};
use gridbot_backend::error::ExchangeError;
use gridbot_backend::exchange::{Balance, Exchange, ExchangeOrder, ExchangeTrade, Ticker};
use gridbot_backend::grid::engine::GridEngine;
use gridbot_backend::ledger::{Bot, BotPatch, BotStatus, Ledger, NewBot, NewOrder, Side};
use gridbot_backend::market::Candle;
use gridbot_backend::reconciler::Reconciler;
use gridbot_backend::sentiment::{ComponentWeights, DisabledModulator, ModulatorThresholds, NoSentimentSource, SentimentSnapshot, SentimentSource, WeightedAverageModulator};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

/// A fully deterministic stand-in exchange: a single mutable price, an
/// incrementing order id, and manual fill injection via `fill()`.
struct FakeExchange {
    price: StdMutex<Decimal>,
    next_id: AtomicI64,
    open_orders: StdMutex<Vec<ExchangeOrder>>,
    trades: StdMutex<Vec<ExchangeTrade>>,
    balance_usd: Decimal,
}

impl FakeExchange {
    fn new(price: Decimal, balance_usd: Decimal) -> Self {
        Self { price: StdMutex::new(price), next_id: AtomicI64::new(1), open_orders: StdMutex::new(Vec::new()), trades: StdMutex::new(Vec::new()), balance_usd }
    }

    fn set_price(&self, price: Decimal) {
        *self.price.lock().unwrap() = price;
    }

    /// Moves an open order straight to a recorded trade, as if it filled on
    /// the exchange between two reconciliation passes.
    fn fill(&self, order_id: i64, fill_price: Decimal, fee_rate: Decimal) {
        let mut open = self.open_orders.lock().unwrap();
        let idx = open.iter().position(|o| o.id == order_id).expect("order must be open to fill it");
        let order = open.remove(idx);
        drop(open);
        let value = fill_price * order.amount;
        self.trades.lock().unwrap().push(ExchangeTrade { order_id, symbol: order.symbol, side: order.side, price: fill_price, amount: order.amount, fee: value * fee_rate, timestamp: Utc::now() });
    }

    fn open_order_near(&self, side: Side, price: Decimal, tolerance: Decimal) -> Option<ExchangeOrder> {
        self.open_orders.lock().unwrap().iter().find(|o| o.side == side && (o.price - price).abs() <= tolerance).cloned()
    }
}

/// A mild, steady wobble around the current price - enough to read as Medium
/// volatility (the geometric curve path) without moving the tested levels.
fn wobble_candles(center: Decimal) -> Vec<Candle> {
    let c = center.to_string().parse::<f64>().unwrap_or(95000.0);
    (0..40)
        .map(|i| {
            let drift = if i % 2 == 0 { 1.02 } else { 0.98 };
            Candle {
                open_time_ms: i as i64 * 3_600_000,
                open: Decimal::try_from(c).unwrap(),
                high: Decimal::try_from(c * drift.max(1.0)).unwrap(),
                low: Decimal::try_from(c * drift.min(1.0)).unwrap(),
                close: Decimal::try_from(c).unwrap(),
                volume: dec!(1),
            }
        })
        .collect()
}

#[async_trait]
impl Exchange for FakeExchange {
    async fn fetch_ticker(&self, _symbol: &str) -> Result<Ticker, ExchangeError> {
        let last = *self.price.lock().unwrap();
        Ok(Ticker { bid: last, ask: last, last })
    }

    async fn fetch_ohlcv(&self, _symbol: &str, _timeframe: &str, _start: Option<DateTime<Utc>>, _end: Option<DateTime<Utc>>, _limit: Option<u32>) -> Result<Vec<Candle>, ExchangeError> {
        let price = *self.price.lock().unwrap();
        Ok(wobble_candles(price))
    }

    async fn fetch_balance(&self) -> Result<HashMap<String, Balance>, ExchangeError> {
        let mut map = HashMap::new();
        map.insert("USD".to_string(), Balance { free: self.balance_usd, total: self.balance_usd });
        Ok(map)
    }

    async fn place_limit_order(&self, symbol: &str, side: Side, amount: Decimal, price: Decimal) -> Result<i64, ExchangeError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.open_orders.lock().unwrap().push(ExchangeOrder { id, symbol: symbol.to_string(), side, price, amount });
        Ok(id)
    }

    async fn cancel_order(&self, id: i64, _symbol: &str) -> Result<(), ExchangeError> {
        self.open_orders.lock().unwrap().retain(|o| o.id != id);
        Ok(())
    }

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        Ok(self.open_orders.lock().unwrap().iter().filter(|o| o.symbol == symbol).cloned().collect())
    }

    async fn fetch_my_trades(&self, symbol: &str, since: Option<DateTime<Utc>>, _limit: Option<u32>) -> Result<Vec<ExchangeTrade>, ExchangeError> {
        let since = since.unwrap_or_else(|| DateTime::<Utc>::MIN_UTC);
        Ok(self.trades.lock().unwrap().iter().filter(|t| t.symbol == symbol && t.timestamp >= since).cloned().collect())
    }
}

fn test_config() -> Config {
    Config {
        database_path: ":memory:".to_string(),
        exchange_mode: ExchangeMode::Paper,
        exchange_api_key: None,
        exchange_api_secret: None,
        exchange_base_url: "https://example.invalid".to_string(),
        sentiment_openai_key: None,
        sentiment_cryptopanic_key: None,
        cycle_seconds: 60,
        reconcile_seconds: 60,
        grid_exponent: 0.85,
        grid_count_floor: 5,
        grid_count_cap: 20,
        max_position_percent: dec!(0.10),
        min_position_percent: dec!(0.001),
        kelly_fraction: dec!(0.25),
        kelly_min_trades: 20,
        max_risk_per_trade: dec!(0.02),
        stop_loss_pct: dec!(15),
        profit_lock_threshold: dec!(3),
        trailing_pct: dec!(5),
        rebalance_threshold: dec!(10),
        stale_range: dec!(50),
        reserve_usd: dec!(0),
        taker_fee_rate: dec!(0.001),
        sentiment_skip_buys_at: dec!(75),
        sentiment_skip_sells_at: dec!(25),
    }
}

async fn new_bot(ledger: &Ledger, name: &str) -> Bot {
    ledger
        .create_bot(NewBot { name: name.to_string(), symbol: "BTC/USD".into(), lower_price: dec!(90000), upper_price: dec!(100000), grid_count: 10, order_size: dec!(100) })
        .await
        .unwrap()
}

#[tokio::test]
async fn create_and_plan_places_eleven_orders_around_current_price() {
    let ledger = Arc::new(Ledger::open_in_memory().unwrap());
    new_bot(&ledger, "btc").await;
    ledger.update_bot("btc", BotPatch { status: Some(BotStatus::Running), ..Default::default() }).await.unwrap();

    let exchange = Arc::new(FakeExchange::new(dec!(95000), dec!(10000)));
    let engine = GridEngine::new(ledger.clone(), exchange.clone(), Arc::new(DisabledModulator), Arc::new(NoSentimentSource), test_config());

    let report = engine.run_cycle("btc").await.unwrap();
    assert_eq!(report.placed, 11);

    let open = ledger.list_open_orders(Some("btc")).await.unwrap();
    assert_eq!(open.len(), 11);
    for order in &open {
        assert!(order.weight >= dec!(1.0) && order.weight <= dec!(1.5));
        if order.price < dec!(95000) {
            assert_eq!(order.side, Side::Buy);
        } else {
            assert_eq!(order.side, Side::Sell);
        }
    }
}

#[tokio::test]
async fn fill_triggers_a_replacement_order_one_grid_step_away() {
    let ledger = Arc::new(Ledger::open_in_memory().unwrap());
    new_bot(&ledger, "btc").await;
    ledger.update_bot("btc", BotPatch { status: Some(BotStatus::Running), ..Default::default() }).await.unwrap();

    let exchange = Arc::new(FakeExchange::new(dec!(95000), dec!(10000)));
    let engine = GridEngine::new(ledger.clone(), exchange.clone(), Arc::new(DisabledModulator), Arc::new(NoSentimentSource), test_config());
    engine.run_cycle("btc").await.unwrap();

    // Fill the resting buy closest to the current price.
    let buy = exchange
        .open_orders
        .lock()
        .unwrap()
        .iter()
        .filter(|o| o.side == Side::Buy)
        .max_by_key(|o| o.price)
        .cloned()
        .expect("at least one buy level must be planned below the current price");
    let fill_price = buy.price;
    exchange.fill(buy.id, fill_price, dec!(0.001));

    let bot = ledger.get_bot("btc").await.unwrap().unwrap();
    let grid_spacing = (bot.upper_price - bot.lower_price) / Decimal::from(bot.adjusted_grid_count.max(1));
    let reconciler = Reconciler::new(ledger.clone(), exchange.clone());
    let report = reconciler.reconcile_bot(&bot, &engine).await.unwrap();
    assert_eq!(report.filled, 1);

    let filled = ledger.get_order(buy.id).await.unwrap().unwrap();
    assert_eq!(filled.status, gridbot_backend::ledger::OrderStatus::Filled);
    assert_eq!(filled.filled_price, Some(fill_price));

    let expected_replacement = (fill_price + grid_spacing).clamp(bot.lower_price, bot.upper_price);
    let replacement = exchange.open_order_near(Side::Sell, expected_replacement, dec!(0.01));
    assert!(replacement.is_some(), "a sell order one grid step above the fill must exist (pre-planned or newly placed)");
}

#[tokio::test]
async fn stop_loss_pauses_the_bot_and_blocks_further_placement() {
    let ledger = Arc::new(Ledger::open_in_memory().unwrap());
    new_bot(&ledger, "btc").await;
    ledger.update_bot("btc", BotPatch { status: Some(BotStatus::Running), ..Default::default() }).await.unwrap();

    let exchange = Arc::new(FakeExchange::new(dec!(95000), dec!(10000)));
    let engine = GridEngine::new(ledger.clone(), exchange.clone(), Arc::new(DisabledModulator), Arc::new(NoSentimentSource), test_config());

    // Seed one filled buy position at 93000 via the ledger directly, then
    // feed it through on_fill so the engine's in-memory position tracks it.
    ledger
        .insert_orders(&[NewOrder { id: 9001, bot_name: "btc".into(), symbol: "BTC/USD".into(), side: Side::Buy, price: dec!(93000), amount: dec!(0.01), size_quote: dec!(930), level_index: 3, weight: dec!(1.2) }])
        .await
        .unwrap();
    let trade = ledger.fill_order(9001, dec!(93000), Some(dec!(0.93))).await.unwrap();
    engine.on_fill("btc", &trade).await.unwrap();

    // stopLossPct=15: hard stop at 93000 * 0.85 = 79050.
    exchange.set_price(dec!(79050));
    let report = engine.run_cycle("btc").await.unwrap();
    assert!(report.paused);
    assert_eq!(report.closed_positions, 1);

    let bot = ledger.get_bot("btc").await.unwrap().unwrap();
    assert_eq!(bot.status, BotStatus::Paused);
    assert_eq!(bot.stop_reason.as_deref(), Some("STOP_LOSS_HIT"));

    // The stop-loss must have placed and recorded a closing trade at 79050,
    // with a realized loss, not just flipped the bot's status.
    let trades = ledger.list_trades("btc", None, None).await.unwrap();
    let closing_trade = trades.iter().find(|t| t.side == Side::Sell && t.price == dec!(79050)).expect("closing trade at 79050 must be recorded");
    assert_eq!(closing_trade.amount, dec!(0.01));
    let profit = closing_trade.profit.expect("closing trade must have a computed profit");
    assert!(profit < Decimal::ZERO, "closing a position at a loss must record negative profit, got {profit}");

    // A paused bot places no new orders on the next cycle.
    let after = engine.run_cycle("btc").await.unwrap();
    assert_eq!(after.placed, 0);
}

#[tokio::test]
async fn price_breakout_rebalances_the_range() {
    let ledger = Arc::new(Ledger::open_in_memory().unwrap());
    new_bot(&ledger, "btc").await;
    ledger.update_bot("btc", BotPatch { status: Some(BotStatus::Running), ..Default::default() }).await.unwrap();

    let exchange = Arc::new(FakeExchange::new(dec!(95000), dec!(10000)));
    let engine = GridEngine::new(ledger.clone(), exchange.clone(), Arc::new(DisabledModulator), Arc::new(NoSentimentSource), test_config());
    engine.run_cycle("btc").await.unwrap();
    assert_eq!(ledger.list_open_orders(Some("btc")).await.unwrap().len(), 11);

    // rebalanceThreshold=10%, width=10000 -> upper bound = 100000 + 1000 = 101000.
    exchange.set_price(dec!(111001));
    engine.run_cycle("btc").await.unwrap();

    let bot = ledger.get_bot("btc").await.unwrap().unwrap();
    assert_eq!(bot.lower_price, dec!(107001.0));
    assert_eq!(bot.upper_price, dec!(117001.0));
    assert_eq!(bot.rebalance_count, 1);
}

struct FixedSentiment(SentimentSnapshot);

#[async_trait]
impl SentimentSource for FixedSentiment {
    async fn snapshot(&self, _symbol: &str) -> SentimentSnapshot {
        self.0.clone()
    }
}

#[tokio::test]
async fn extended_sentiment_skips_new_buys_but_not_sells() {
    let ledger = Arc::new(Ledger::open_in_memory().unwrap());
    new_bot(&ledger, "btc").await;
    ledger.update_bot("btc", BotPatch { status: Some(BotStatus::Running), ..Default::default() }).await.unwrap();

    let exchange = Arc::new(FakeExchange::new(dec!(95000), dec!(10000)));
    let modulator = Arc::new(WeightedAverageModulator::new(ComponentWeights::default(), ModulatorThresholds::default()));
    let sentiment = Arc::new(FixedSentiment(SentimentSnapshot { fear_greed: Some(80.0), ..Default::default() }));
    let engine = GridEngine::new(ledger.clone(), exchange.clone(), modulator, sentiment, test_config());

    let report = engine.run_cycle("btc").await.unwrap();
    assert!(report.skipped_buys > 0);

    let open = ledger.list_open_orders(Some("btc")).await.unwrap();
    assert!(open.iter().all(|o| o.side == Side::Sell), "no buy orders should have been placed while sentiment skips buys");
    assert!(!open.is_empty(), "sell levels must still be placed");
}

#[tokio::test]
async fn reconciler_imports_an_exchange_order_missing_from_the_ledger() {
    let ledger = Arc::new(Ledger::open_in_memory().unwrap());
    let bot = new_bot(&ledger, "btc").await;
    ledger.update_bot("btc", BotPatch { status: Some(BotStatus::Running), ..Default::default() }).await.unwrap();

    let exchange = Arc::new(FakeExchange::new(dec!(95000), dec!(10000)));
    // Simulates a crash between exchange placement and the Ledger write: the
    // exchange already knows about this order, the Ledger does not.
    exchange.place_limit_order("BTC/USD", Side::Buy, dec!(0.01), dec!(93000)).await.unwrap();

    let engine = GridEngine::new(ledger.clone(), exchange.clone(), Arc::new(DisabledModulator), Arc::new(NoSentimentSource), test_config());
    let reconciler = Reconciler::new(ledger.clone(), exchange.clone());
    let report = reconciler.reconcile_bot(&bot, &engine).await.unwrap();
    assert_eq!(report.imported, 1);

    let open = ledger.list_open_orders(Some("btc")).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].price, dec!(93000));
    assert_eq!(open[0].level_index, -1);
}
