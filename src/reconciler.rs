//! Reconciler: periodically aligns the Ledger with exchange-reported open
//! orders and own-trade history. Holds no persisted state of its own - it
//! only issues transition commands to the Ledger, never mutates it directly.

use crate::error::EngineError;
use crate::exchange::Exchange;
use crate::grid::GridEngine;
use crate::ledger::{Bot, Ledger, NewOrder, OrderStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct Reconciler {
    ledger: Arc<Ledger>,
    exchange: Arc<dyn Exchange>,
    checkpoints: Mutex<HashMap<String, DateTime<Utc>>>,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub filled: u32,
    pub cancelled_missing: u32,
    pub imported: u32,
}

impl Reconciler {
    pub fn new(ledger: Arc<Ledger>, exchange: Arc<dyn Exchange>) -> Self {
        Self { ledger, exchange, checkpoints: Mutex::new(HashMap::new()) }
    }

    /// Reconciles one bot and, if any fills were observed, drives the engine's
    /// fill reaction before returning - so replacement orders are queued
    /// before the caller's next placement pass ever runs.
    pub async fn reconcile_bot(&self, bot: &Bot, engine: &GridEngine) -> Result<ReconcileReport, EngineError> {
        let mut report = ReconcileReport::default();

        let exchange_open = self.exchange.fetch_open_orders(&bot.symbol).await?;
        let since = {
            let checkpoints = self.checkpoints.lock().await;
            checkpoints.get(&bot.name).copied()
        };
        let exchange_trades = self.exchange.fetch_my_trades(&bot.symbol, since, Some(100)).await?;

        let ledger_open = self.ledger.list_open_orders(Some(&bot.name)).await?;

        for order in &ledger_open {
            let still_open = exchange_open.iter().any(|e| e.id == order.id);
            if still_open {
                continue;
            }
            if let Some(matching_trade) = exchange_trades.iter().find(|t| t.order_id == order.id) {
                let trade = self.ledger.fill_order(order.id, matching_trade.price, Some(matching_trade.fee)).await?;
                info!(bot = %bot.name, order_id = order.id, price = %trade.price, "reconciler observed a fill");
                engine.on_fill(&bot.name, &trade).await?;
                report.filled += 1;
            } else {
                self.ledger.cancel_order(order.id, "MISSING_ON_EXCHANGE").await?;
                warn!(bot = %bot.name, order_id = order.id, "order vanished from exchange with no trade, marked cancelled");
                report.cancelled_missing += 1;
            }
        }

        for exchange_order in &exchange_open {
            if ledger_open.iter().any(|o| o.id == exchange_order.id) {
                continue;
            }
            self.ledger
                .insert_orders(&[NewOrder {
                    id: exchange_order.id,
                    bot_name: bot.name.clone(),
                    symbol: exchange_order.symbol.clone(),
                    side: exchange_order.side,
                    price: exchange_order.price,
                    amount: exchange_order.amount,
                    size_quote: exchange_order.price * exchange_order.amount,
                    level_index: -1,
                    weight: rust_decimal::Decimal::ONE,
                }])
                .await?;
            info!(bot = %bot.name, order_id = exchange_order.id, "imported untracked exchange order");
            report.imported += 1;
        }

        let checkpoint = exchange_trades.iter().map(|t| t.timestamp).max().unwrap_or_else(Utc::now);
        self.checkpoints.lock().await.insert(bot.name.clone(), checkpoint);

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Balance, ExchangeOrder, ExchangeTrade, Ticker};
    use crate::ledger::{NewBot, Side};
    use crate::market::Candle;
    use crate::sentiment::DisabledModulator;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Mutex as StdMutex;

    struct StubExchange {
        open_orders: StdMutex<Vec<ExchangeOrder>>,
        trades: StdMutex<Vec<ExchangeTrade>>,
    }

    #[async_trait]
    impl Exchange for StubExchange {
        async fn fetch_ticker(&self, _symbol: &str) -> Result<Ticker, crate::error::ExchangeError> {
            Ok(Ticker { bid: dec!(93000), ask: dec!(93010), last: dec!(93005) })
        }
        async fn fetch_ohlcv(&self, _: &str, _: &str, _: Option<DateTime<Utc>>, _: Option<DateTime<Utc>>, _: Option<u32>) -> Result<Vec<Candle>, crate::error::ExchangeError> {
            Ok(vec![])
        }
        async fn fetch_balance(&self) -> Result<HashMap<String, Balance>, crate::error::ExchangeError> {
            Ok(HashMap::new())
        }
        async fn place_limit_order(&self, _: &str, _: Side, _: Decimal, _: Decimal) -> Result<i64, crate::error::ExchangeError> {
            unreachable!()
        }
        async fn cancel_order(&self, _: i64, _: &str) -> Result<(), crate::error::ExchangeError> {
            Ok(())
        }
        async fn fetch_open_orders(&self, _symbol: &str) -> Result<Vec<ExchangeOrder>, crate::error::ExchangeError> {
            Ok(self.open_orders.lock().unwrap().clone())
        }
        async fn fetch_my_trades(&self, _symbol: &str, _since: Option<DateTime<Utc>>, _limit: Option<u32>) -> Result<Vec<ExchangeTrade>, crate::error::ExchangeError> {
            Ok(self.trades.lock().unwrap().clone())
        }
    }

    async fn ledger_with_bot(name: &str) -> Arc<Ledger> {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        ledger
            .create_bot(NewBot { name: name.to_string(), symbol: "BTC/USD".into(), lower_price: dec!(90000), upper_price: dec!(100000), grid_count: 10, order_size: dec!(100) })
            .await
            .unwrap();
        ledger
    }

    #[tokio::test]
    async fn imports_untracked_exchange_orders() {
        let ledger = ledger_with_bot("btc").await;
        let bot = ledger.get_bot("btc").await.unwrap().unwrap();
        let exchange = Arc::new(StubExchange {
            open_orders: StdMutex::new(vec![ExchangeOrder { id: 42, symbol: "BTC/USD".into(), side: Side::Buy, price: dec!(93000), amount: dec!(0.01) }]),
            trades: StdMutex::new(vec![]),
        });
        let reconciler = Reconciler::new(ledger.clone(), exchange.clone());
        let engine = GridEngine::new(ledger.clone(), exchange, Arc::new(DisabledModulator), Arc::new(crate::sentiment::NoSentimentSource), crate::config::Config::from_env().unwrap());

        let report = reconciler.reconcile_bot(&bot, &engine).await.unwrap();
        assert_eq!(report.imported, 1);
        let open = ledger.list_open_orders(Some("btc")).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, 42);
    }

    #[tokio::test]
    async fn reconciling_twice_over_the_same_snapshot_is_a_no_op() {
        let ledger = ledger_with_bot("btc").await;
        let bot = ledger.get_bot("btc").await.unwrap().unwrap();
        let exchange = Arc::new(StubExchange {
            open_orders: StdMutex::new(vec![ExchangeOrder { id: 7, symbol: "BTC/USD".into(), side: Side::Sell, price: dec!(96000), amount: dec!(0.01) }]),
            trades: StdMutex::new(vec![]),
        });
        let reconciler = Reconciler::new(ledger.clone(), exchange.clone());
        let engine = GridEngine::new(ledger.clone(), exchange, Arc::new(DisabledModulator), Arc::new(crate::sentiment::NoSentimentSource), crate::config::Config::from_env().unwrap());

        reconciler.reconcile_bot(&bot, &engine).await.unwrap();
        let second = reconciler.reconcile_bot(&bot, &engine).await.unwrap();
        assert_eq!(second.imported, 0);
        assert_eq!(second.filled, 0);
        assert_eq!(second.cancelled_missing, 0);
    }
}
