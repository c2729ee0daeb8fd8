//! Deterministic paper-trading gateway: real ticker/candle data from a
//! read-only market-data source, with order placement, fills, and balances
//! simulated locally. Fills are decided from candle highs/lows, not modeled
//! network jitter - determinism matters more here than realism.

use super::{Balance, Exchange, ExchangeOrder, ExchangeTrade, Ticker};
use crate::error::ExchangeError;
use crate::ledger::Side;
use crate::market::Candle;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone)]
struct SimOrder {
    id: i64,
    symbol: String,
    side: Side,
    price: Decimal,
    amount: Decimal,
    open: bool,
}

struct PaperBook {
    orders: Vec<SimOrder>,
    trades: Vec<ExchangeTrade>,
    balances: HashMap<String, Balance>,
    last_checked_ms: i64,
}

fn split_symbol(symbol: &str) -> (&str, &str) {
    let mut parts = symbol.splitn(2, '/');
    let base = parts.next().unwrap_or(symbol);
    let quote = parts.next().unwrap_or("USD");
    (base, quote)
}

impl PaperBook {
    fn adjust(&mut self, asset: &str, delta_free: Decimal, delta_total: Decimal) {
        let bal = self.balances.entry(asset.to_string()).or_insert(Balance { free: Decimal::ZERO, total: Decimal::ZERO });
        bal.free += delta_free;
        bal.total += delta_total;
    }

    /// Reserves the committed side of a new order so `available_equity` reflects
    /// exposure the instant an order is placed, not only after it fills.
    fn reserve(&mut self, symbol: &str, side: Side, price: Decimal, amount: Decimal) {
        let (base, quote) = split_symbol(symbol);
        match side {
            Side::Buy => self.adjust(quote, -(price * amount), -(price * amount)),
            Side::Sell => self.adjust(base, -amount, -amount),
        }
    }

    /// Releases a reservation made by `reserve`, used on cancel of a still-open order.
    fn release(&mut self, symbol: &str, side: Side, price: Decimal, amount: Decimal) {
        let (base, quote) = split_symbol(symbol);
        match side {
            Side::Buy => self.adjust(quote, price * amount, price * amount),
            Side::Sell => self.adjust(base, amount, amount),
        }
    }

    /// Settles a fill: credits the side received and charges the fee out of quote.
    /// The committed side was already debited at `reserve` time.
    fn settle_fill(&mut self, symbol: &str, side: Side, price: Decimal, amount: Decimal, fee: Decimal) {
        let (base, quote) = split_symbol(symbol);
        match side {
            Side::Buy => {
                self.adjust(base, amount, amount);
                self.adjust(quote, -fee, -fee);
            }
            Side::Sell => {
                let proceeds = price * amount - fee;
                self.adjust(quote, proceeds, proceeds);
            }
        }
    }
}

/// Wraps any read-only market-data source (typically a `LiveExchange` used
/// only for its public endpoints) and simulates order placement/fills/balance
/// on top of it.
pub struct PaperExchange {
    market_data: Arc<dyn Exchange>,
    next_id: AtomicI64,
    book: Mutex<PaperBook>,
    fee_rate: Decimal,
}

impl PaperExchange {
    pub fn new(market_data: Arc<dyn Exchange>, starting_balances: HashMap<String, Balance>, fee_rate: Decimal) -> Self {
        Self {
            market_data,
            next_id: AtomicI64::new(1),
            book: Mutex::new(PaperBook {
                orders: Vec::new(),
                trades: Vec::new(),
                balances: starting_balances,
                last_checked_ms: 0,
            }),
            fee_rate,
        }
    }

    /// Fetches candles since the last check and fills any resting order whose
    /// price was crossed by a candle's high (sells) or low (buys).
    async fn sweep_fills(&self, symbol: &str) -> Result<(), ExchangeError> {
        let since = {
            let book = self.book.lock().await;
            book.last_checked_ms
        };
        let since_ts = if since == 0 { None } else { DateTime::<Utc>::from_timestamp_millis(since) };
        let candles = self.market_data.fetch_ohlcv(symbol, "1m", since_ts, None, Some(50)).await?;
        if candles.is_empty() {
            return Ok(());
        }

        let mut book = self.book.lock().await;
        let mut settled: Vec<(String, Side, Decimal, Decimal, Decimal)> = Vec::new();
        for candle in &candles {
            for order in book.orders.iter_mut() {
                if !order.open || order.symbol != symbol {
                    continue;
                }
                let crossed = match order.side {
                    Side::Buy => candle.low <= order.price,
                    Side::Sell => candle.high >= order.price,
                };
                if crossed {
                    order.open = false;
                    let value = order.price * order.amount;
                    let fee = value * self.fee_rate;
                    settled.push((order.symbol.clone(), order.side, order.price, order.amount, fee));
                    book.trades.push(ExchangeTrade {
                        order_id: order.id,
                        symbol: order.symbol.clone(),
                        side: order.side,
                        price: order.price,
                        amount: order.amount,
                        fee,
                        timestamp: Utc::now(),
                    });
                    info!(order_id = order.id, price = %order.price, "paper order filled");
                }
            }
        }
        for (sym, side, price, amount, fee) in settled {
            book.settle_fill(&sym, side, price, amount, fee);
        }
        book.last_checked_ms = candles.last().map(|c| c.open_time_ms).unwrap_or(since);
        Ok(())
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        self.sweep_fills(symbol).await?;
        self.market_data.fetch_ticker(symbol).await
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.market_data.fetch_ohlcv(symbol, timeframe, start, end, limit).await
    }

    async fn fetch_balance(&self) -> Result<HashMap<String, Balance>, ExchangeError> {
        Ok(self.book.lock().await.balances.clone())
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        amount: Decimal,
        price: Decimal,
    ) -> Result<i64, ExchangeError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut book = self.book.lock().await;
        book.reserve(symbol, side, price, amount);
        book.orders.push(SimOrder { id, symbol: symbol.to_string(), side, price, amount, open: true });
        Ok(id)
    }

    async fn cancel_order(&self, id: i64, _symbol: &str) -> Result<(), ExchangeError> {
        let mut book = self.book.lock().await;
        if let Some(order) = book.orders.iter_mut().find(|o| o.id == id) {
            if order.open {
                order.open = false;
                let (symbol, side, price, amount) = (order.symbol.clone(), order.side, order.price, order.amount);
                book.release(&symbol, side, price, amount);
            }
        }
        Ok(())
    }

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        self.sweep_fills(symbol).await?;
        let book = self.book.lock().await;
        Ok(book
            .orders
            .iter()
            .filter(|o| o.open && o.symbol == symbol)
            .map(|o| ExchangeOrder { id: o.id, symbol: o.symbol.clone(), side: o.side, price: o.price, amount: o.amount })
            .collect())
    }

    async fn fetch_my_trades(
        &self,
        symbol: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<ExchangeTrade>, ExchangeError> {
        self.sweep_fills(symbol).await?;
        let book = self.book.lock().await;
        let mut trades: Vec<_> = book
            .trades
            .iter()
            .filter(|t| t.symbol == symbol && since.map(|s| t.timestamp >= s).unwrap_or(true))
            .cloned()
            .collect();
        trades.sort_by_key(|t| t.timestamp);
        if let Some(limit) = limit {
            trades.truncate(limit as usize);
        }
        Ok(trades)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Mutex as StdMutex;

    /// A fixed candle sequence, served once and only once per advance, used
    /// purely to drive deterministic fill simulation in tests.
    struct FixedFeed {
        candles: StdMutex<Vec<Candle>>,
        ticker: Ticker,
    }

    #[async_trait]
    impl Exchange for FixedFeed {
        async fn fetch_ticker(&self, _symbol: &str) -> Result<Ticker, ExchangeError> {
            Ok(self.ticker)
        }
        async fn fetch_ohlcv(
            &self,
            _symbol: &str,
            _timeframe: &str,
            _start: Option<DateTime<Utc>>,
            _end: Option<DateTime<Utc>>,
            _limit: Option<u32>,
        ) -> Result<Vec<Candle>, ExchangeError> {
            Ok(std::mem::take(&mut *self.candles.lock().unwrap()))
        }
        async fn fetch_balance(&self) -> Result<HashMap<String, Balance>, ExchangeError> {
            Ok(HashMap::new())
        }
        async fn place_limit_order(&self, _: &str, _: Side, _: Decimal, _: Decimal) -> Result<i64, ExchangeError> {
            unreachable!()
        }
        async fn cancel_order(&self, _: i64, _: &str) -> Result<(), ExchangeError> {
            unreachable!()
        }
        async fn fetch_open_orders(&self, _: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
            unreachable!()
        }
        async fn fetch_my_trades(&self, _: &str, _: Option<DateTime<Utc>>, _: Option<u32>) -> Result<Vec<ExchangeTrade>, ExchangeError> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn resting_buy_fills_when_candle_low_crosses_price() {
        let feed = Arc::new(FixedFeed {
            candles: StdMutex::new(vec![Candle {
                open_time_ms: 1,
                open: dec!(94000),
                high: dec!(94500),
                low: dec!(92900),
                close: dec!(93500),
                volume: dec!(1),
            }]),
            ticker: Ticker { bid: dec!(93000), ask: dec!(93010), last: dec!(93005) },
        });
        let paper = PaperExchange::new(feed, HashMap::new(), dec!(0.001));
        let id = paper.place_limit_order("BTC/USD", Side::Buy, dec!(0.01), dec!(93000)).await.unwrap();

        let open = paper.fetch_open_orders("BTC/USD").await.unwrap();
        assert!(open.is_empty(), "order priced above the candle low must fill");

        let trades = paper.fetch_my_trades("BTC/USD", None, None).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].order_id, id);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_for_unknown_id() {
        let feed = Arc::new(FixedFeed { candles: StdMutex::new(vec![]), ticker: Ticker { bid: dec!(1), ask: dec!(1), last: dec!(1) } });
        let paper = PaperExchange::new(feed, HashMap::new(), dec!(0.001));
        paper.cancel_order(999, "BTC/USD").await.unwrap();
    }
}
