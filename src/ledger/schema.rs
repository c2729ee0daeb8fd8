//! SQLite schema for the Ledger, created on open if absent.
//!
//! Prices/amounts are stored as `TEXT` (rust_decimal's canonical string form) to
//! keep every monetary value exact - no binary-float round-tripping through SQLite's
//! native REAL type.

pub const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS bots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    symbol TEXT NOT NULL,
    lower_price TEXT NOT NULL,
    upper_price TEXT NOT NULL,
    grid_count INTEGER NOT NULL,
    adjusted_grid_count INTEGER NOT NULL,
    order_size TEXT NOT NULL,
    status TEXT NOT NULL,
    stop_reason TEXT,
    rebalance_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    CHECK (status IN ('stopped', 'running', 'paused'))
);

CREATE TABLE IF NOT EXISTS orders (
    id INTEGER PRIMARY KEY,
    bot_name TEXT NOT NULL REFERENCES bots(name) ON DELETE CASCADE,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    price TEXT NOT NULL,
    amount TEXT NOT NULL,
    size_quote TEXT NOT NULL,
    level_index INTEGER NOT NULL,
    weight TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    filled_at INTEGER,
    filled_price TEXT,
    cancelled_at INTEGER,
    cancel_reason TEXT,
    CHECK (side IN ('buy', 'sell')),
    CHECK (status IN ('open', 'filled', 'cancelled'))
);

-- At most one open order per (bot, levelIndex): enforced structurally, not just by convention.
CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_open_level
    ON orders(bot_name, level_index)
    WHERE status = 'open';

CREATE INDEX IF NOT EXISTS idx_orders_bot_status ON orders(bot_name, status);

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bot_name TEXT NOT NULL REFERENCES bots(name) ON DELETE CASCADE,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    price TEXT NOT NULL,
    amount TEXT NOT NULL,
    value TEXT NOT NULL,
    fee TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    order_id INTEGER REFERENCES orders(id),
    source TEXT NOT NULL,
    profit TEXT,
    CHECK (side IN ('buy', 'sell')),
    CHECK (source IN ('fill', 'imported', 'simulated'))
);

CREATE INDEX IF NOT EXISTS idx_trades_bot_ts ON trades(bot_name, timestamp DESC);
"#;
