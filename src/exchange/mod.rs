//! Exchange Gateway: a capability trait over a spot exchange, with a live
//! HMAC-signed REST implementation and a deterministic paper-trading
//! implementation, in the style of this codebase's execution-adapter traits.

mod live;
mod paper;
mod rate_limiter;

pub use live::LiveExchange;
pub use paper::PaperExchange;
pub use rate_limiter::RateLimiter;

use crate::error::ExchangeError;
use crate::ledger::Side;
use crate::market::Candle;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ticker {
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Balance {
    pub free: Decimal,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeOrder {
    pub id: i64,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeTrade {
    pub order_id: i64,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub amount: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Capability interface over a spot exchange. Implemented by both the live
/// HMAC-signed REST gateway and the deterministic paper-trading gateway;
/// callers never branch on which one they hold.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn fetch_balance(&self) -> Result<HashMap<String, Balance>, ExchangeError>;

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        amount: Decimal,
        price: Decimal,
    ) -> Result<i64, ExchangeError>;

    /// Cancelling an id the exchange no longer knows about is treated as
    /// success by callers (`ErrNotFound` is not surfaced as a failure here).
    async fn cancel_order(&self, id: i64, symbol: &str) -> Result<(), ExchangeError>;

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    async fn fetch_my_trades(
        &self,
        symbol: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<ExchangeTrade>, ExchangeError>;
}
