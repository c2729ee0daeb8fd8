//! Process configuration, loaded from `.env` then the process environment.
//!
//! Mirrors the `Config::from_env()` convention used throughout this codebase:
//! every tunable has a typed default and an environment-variable override.

use rust_decimal::Decimal;
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeMode {
    Paper,
    Live,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub exchange_mode: ExchangeMode,
    pub exchange_api_key: Option<String>,
    pub exchange_api_secret: Option<String>,
    pub exchange_base_url: String,
    pub sentiment_openai_key: Option<String>,
    pub sentiment_cryptopanic_key: Option<String>,
    pub cycle_seconds: u64,
    pub reconcile_seconds: u64,

    // Grid Planner defaults
    pub grid_exponent: f64,
    pub grid_count_floor: u32,
    pub grid_count_cap: u32,

    // Position Sizer defaults
    pub max_position_percent: Decimal,
    pub min_position_percent: Decimal,
    pub kelly_fraction: Decimal,
    pub kelly_min_trades: u32,
    pub max_risk_per_trade: Decimal,

    // Grid Engine defaults
    pub stop_loss_pct: Decimal,
    pub profit_lock_threshold: Decimal,
    pub trailing_pct: Decimal,
    pub rebalance_threshold: Decimal,
    pub stale_range: Decimal,
    pub reserve_usd: Decimal,
    pub taker_fee_rate: Decimal,

    // Sentiment admission thresholds
    pub sentiment_skip_buys_at: Decimal,
    pub sentiment_skip_sells_at: Decimal,
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_decimal(key: &str, default: Decimal) -> Decimal {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<Decimal>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let exchange_mode = match env_string("EXCHANGE_MODE", "paper").as_str() {
            "live" => ExchangeMode::Live,
            _ => ExchangeMode::Paper,
        };

        Ok(Self {
            database_path: env_string("DATABASE_PATH", "./gridbot.db"),
            exchange_mode,
            exchange_api_key: env_opt_string("EXCHANGE_API_KEY"),
            exchange_api_secret: env_opt_string("EXCHANGE_API_SECRET"),
            exchange_base_url: env_string("EXCHANGE_BASE_URL", "https://api.binance.com"),
            sentiment_openai_key: env_opt_string("SENTIMENT_OPENAI_KEY"),
            sentiment_cryptopanic_key: env_opt_string("SENTIMENT_CRYPTOPANIC_KEY"),
            cycle_seconds: env_u64("CYCLE_SECONDS", 60),
            reconcile_seconds: env_u64("RECONCILE_SECONDS", 60),

            grid_exponent: env_f64("GRID_EXPONENT", 0.85),
            grid_count_floor: env_u32("GRID_COUNT_FLOOR", 5),
            grid_count_cap: env_u32("GRID_COUNT_CAP", 20),

            max_position_percent: env_decimal("MAX_POSITION_PERCENT", Decimal::new(10, 2)),
            min_position_percent: env_decimal("MIN_POSITION_PERCENT", Decimal::new(1, 3)),
            kelly_fraction: env_decimal("KELLY_FRACTION", Decimal::new(25, 2)),
            kelly_min_trades: env_u32("KELLY_MIN_TRADES", 20),
            max_risk_per_trade: env_decimal("MAX_RISK_PER_TRADE", Decimal::new(2, 2)),

            // These are bare percent numbers (15 means 15%), divided by 100 at
            // every use site in the Grid Engine and Backtest Engine.
            stop_loss_pct: env_decimal("STOP_LOSS_PCT", Decimal::new(15, 0)),
            profit_lock_threshold: env_decimal("PROFIT_LOCK_THRESHOLD", Decimal::new(3, 0)),
            trailing_pct: env_decimal("TRAILING_PCT", Decimal::new(5, 0)),
            rebalance_threshold: env_decimal("REBALANCE_THRESHOLD", Decimal::new(10, 0)),
            stale_range: env_decimal("STALE_RANGE", Decimal::new(5, 0)),
            reserve_usd: env_decimal("RESERVE_USD", Decimal::new(0, 0)),
            taker_fee_rate: env_decimal("TAKER_FEE_RATE", Decimal::new(1, 3)),

            sentiment_skip_buys_at: env_decimal("SENTIMENT_SKIP_BUYS_AT", Decimal::new(75, 0)),
            sentiment_skip_sells_at: env_decimal("SENTIMENT_SKIP_SELLS_AT", Decimal::new(25, 0)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_without_env() {
        // Doesn't touch process env; just exercises the parsing helpers' defaults.
        assert_eq!(env_u64("GRIDBOT_TEST_NONEXISTENT_KEY", 60), 60);
        assert_eq!(env_f64("GRIDBOT_TEST_NONEXISTENT_KEY", 0.85), 0.85);
    }
}
