//! Data model shared by the Ledger, Grid Engine, Reconciler, and Backtest Engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Stopped,
    Running,
    Paused,
}

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Stopped => "stopped",
            BotStatus::Running => "running",
            BotStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(BotStatus::Stopped),
            "running" => Some(BotStatus::Running),
            "paused" => Some(BotStatus::Paused),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(OrderStatus::Open),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSource {
    Fill,
    Imported,
    Simulated,
}

impl TradeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSource::Fill => "fill",
            TradeSource::Imported => "imported",
            TradeSource::Simulated => "simulated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fill" => Some(TradeSource::Fill),
            "imported" => Some(TradeSource::Imported),
            "simulated" => Some(TradeSource::Simulated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: i64,
    pub name: String,
    pub symbol: String,
    pub lower_price: Decimal,
    pub upper_price: Decimal,
    pub grid_count: u32,
    pub adjusted_grid_count: u32,
    pub order_size: Decimal,
    pub status: BotStatus,
    pub stop_reason: Option<String>,
    pub rebalance_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields a caller may patch on an existing bot. `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct BotPatch {
    pub status: Option<BotStatus>,
    pub stop_reason: Option<Option<String>>,
    pub lower_price: Option<Decimal>,
    pub upper_price: Option<Decimal>,
    pub adjusted_grid_count: Option<u32>,
    pub rebalance_count: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct NewBot {
    pub name: String,
    pub symbol: String,
    pub lower_price: Decimal,
    pub upper_price: Decimal,
    pub grid_count: u32,
    pub order_size: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub bot_name: String,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub amount: Decimal,
    pub size_quote: Decimal,
    pub level_index: i32,
    pub weight: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub filled_price: Option<Decimal>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub id: i64,
    pub bot_name: String,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub amount: Decimal,
    pub size_quote: Decimal,
    pub level_index: i32,
    pub weight: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub bot_name: String,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub amount: Decimal,
    pub value: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
    pub order_id: Option<i64>,
    pub source: TradeSource,
    pub profit: Option<Decimal>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub bot_name: String,
    pub total_trades: u64,
    pub open_positions: u64,
    pub win_count: u64,
    pub loss_count: u64,
    pub win_rate: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub profit_factor: Decimal,
    pub sharpe: f64,
    pub max_drawdown: Decimal,
    pub total_pnl: Decimal,
    pub total_fees: Decimal,
}

/// A single planned resting price, produced by the Grid Planner.
/// Runtime-only; persisted implicitly through the `Order`s placed for it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    pub index: i32,
    pub price: Decimal,
    pub side_at_plan: Side,
    pub weight: Decimal,
}
