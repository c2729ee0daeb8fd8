//! The Ledger: authoritative local persistence for bots, orders, trades, and
//! derived metrics. Single writer (the connection is held behind one mutex),
//! many readers of any committed snapshot - following this codebase's existing
//! `rusqlite`-backed stores (WAL mode, schema-on-open, prepared statements).

mod schema;
pub mod types;

use crate::error::LedgerError;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{info, warn};
pub use types::*;

pub struct Ledger {
    conn: Mutex<Connection>,
}

fn dec_to_text(d: Decimal) -> String {
    d.to_string()
}

fn text_to_dec(s: &str) -> Result<Decimal, LedgerError> {
    Decimal::from_str(s).map_err(|e| LedgerError::Validation(format!("bad decimal '{s}': {e}")))
}

fn ts_to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn millis_to_ts(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

impl Ledger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(schema::SCHEMA_SQL)?;
        info!("ledger opened and schema ensured");
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(schema::SCHEMA_SQL)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Writes a consistent snapshot of the database to `path` via `VACUUM INTO`,
    /// used as the backup mechanism that restores last-known-good state on corruption.
    pub async fn backup_to(&self, path: impl AsRef<Path>) -> Result<(), LedgerError> {
        let conn = self.conn.lock().await;
        let path_str = path.as_ref().to_string_lossy().to_string();
        conn.execute("VACUUM INTO ?1", params![path_str])?;
        Ok(())
    }

    // ---- Bots ----------------------------------------------------------

    pub async fn create_bot(&self, cfg: NewBot) -> Result<Bot, LedgerError> {
        if cfg.lower_price <= Decimal::ZERO || cfg.lower_price >= cfg.upper_price {
            return Err(LedgerError::Validation(
                "lowerPrice must be > 0 and < upperPrice".into(),
            ));
        }
        if cfg.grid_count < 2 {
            return Err(LedgerError::Validation("gridCount must be >= 2".into()));
        }
        if cfg.order_size <= Decimal::ZERO {
            return Err(LedgerError::Validation("orderSize must be > 0".into()));
        }

        let conn = self.conn.lock().await;
        let existing: Option<i64> = conn
            .query_row("SELECT id FROM bots WHERE name = ?1", params![cfg.name], |r| r.get(0))
            .optional()?;
        if existing.is_some() {
            return Err(LedgerError::DuplicateName(cfg.name));
        }

        let now = ts_to_millis(Utc::now());
        conn.execute(
            "INSERT INTO bots (name, symbol, lower_price, upper_price, grid_count,
                adjusted_grid_count, order_size, status, stop_reason, rebalance_count,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, 'stopped', NULL, 0, ?7, ?7)",
            params![
                cfg.name,
                cfg.symbol,
                dec_to_text(cfg.lower_price),
                dec_to_text(cfg.upper_price),
                cfg.grid_count,
                dec_to_text(cfg.order_size),
                now,
            ],
        )?;
        info!(bot = %cfg.name, "bot created");
        drop(conn);
        self.get_bot(&cfg.name).await?.ok_or_else(|| LedgerError::BotNotFound(cfg.name))
    }

    pub async fn get_bot(&self, name: &str) -> Result<Option<Bot>, LedgerError> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM bots WHERE name = ?1", params![name], row_to_bot)
            .optional()
            .map_err(LedgerError::from)
    }

    pub async fn list_bots(&self) -> Result<Vec<Bot>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM bots ORDER BY name")?;
        let rows = stmt.query_map([], row_to_bot)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn update_bot(&self, name: &str, patch: BotPatch) -> Result<Bot, LedgerError> {
        let conn = self.conn.lock().await;
        let current = conn
            .query_row("SELECT * FROM bots WHERE name = ?1", params![name], row_to_bot)
            .optional()?
            .ok_or_else(|| LedgerError::BotNotFound(name.to_string()))?;

        let status = patch.status.unwrap_or(current.status);
        let stop_reason = patch.stop_reason.unwrap_or(current.stop_reason);
        let lower_price = patch.lower_price.unwrap_or(current.lower_price);
        let upper_price = patch.upper_price.unwrap_or(current.upper_price);
        let adjusted_grid_count = patch.adjusted_grid_count.unwrap_or(current.adjusted_grid_count);
        let rebalance_count = patch.rebalance_count.unwrap_or(current.rebalance_count);
        let now = ts_to_millis(Utc::now());

        conn.execute(
            "UPDATE bots SET status = ?1, stop_reason = ?2, lower_price = ?3, upper_price = ?4,
                adjusted_grid_count = ?5, rebalance_count = ?6, updated_at = ?7
             WHERE name = ?8",
            params![
                status.as_str(),
                stop_reason,
                dec_to_text(lower_price),
                dec_to_text(upper_price),
                adjusted_grid_count,
                rebalance_count,
                now,
                name,
            ],
        )?;
        info!(bot = %name, before = ?current.status, after = ?status, "bot updated");
        drop(conn);
        self.get_bot(name).await?.ok_or_else(|| LedgerError::BotNotFound(name.to_string()))
    }

    pub async fn delete_bot(&self, name: &str) -> Result<(), LedgerError> {
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM bots WHERE name = ?1", params![name])?;
        if n == 0 {
            return Err(LedgerError::BotNotFound(name.to_string()));
        }
        info!(bot = %name, "bot deleted");
        Ok(())
    }

    // ---- Orders ----------------------------------------------------------

    /// Inserts orders as `open`; upsert semantics by id (an exchange-assigned id
    /// placed twice - e.g. during reconciliation re-import - simply overwrites).
    pub async fn insert_orders(&self, orders: &[NewOrder]) -> Result<(), LedgerError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = ts_to_millis(Utc::now());
        for o in orders {
            tx.execute(
                "INSERT INTO orders (id, bot_name, symbol, side, price, amount, size_quote,
                    level_index, weight, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'open', ?10)
                 ON CONFLICT(id) DO UPDATE SET
                    bot_name=excluded.bot_name, symbol=excluded.symbol, side=excluded.side,
                    price=excluded.price, amount=excluded.amount, size_quote=excluded.size_quote,
                    level_index=excluded.level_index, weight=excluded.weight, status='open'",
                params![
                    o.id,
                    o.bot_name,
                    o.symbol,
                    o.side.as_str(),
                    dec_to_text(o.price),
                    dec_to_text(o.amount),
                    dec_to_text(o.size_quote),
                    o.level_index,
                    dec_to_text(o.weight),
                    now,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Transitions `open -> filled` atomically with a trade insert.
    pub async fn fill_order(
        &self,
        order_id: i64,
        fill_price: Decimal,
        fee: Option<Decimal>,
    ) -> Result<Trade, LedgerError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let order = tx
            .query_row("SELECT * FROM orders WHERE id = ?1", params![order_id], row_to_order)
            .optional()?
            .ok_or(LedgerError::OrderNotFound(order_id))?;
        if order.status != OrderStatus::Open {
            return Err(LedgerError::OrderNotOpen(order_id));
        }

        let now = ts_to_millis(Utc::now());
        tx.execute(
            "UPDATE orders SET status='filled', filled_at=?1, filled_price=?2 WHERE id=?3",
            params![now, dec_to_text(fill_price), order_id],
        )?;

        let fee = fee.unwrap_or(Decimal::ZERO);
        let value = fill_price * order.amount;
        tx.execute(
            "INSERT INTO trades (bot_name, symbol, side, price, amount, value, fee, timestamp,
                order_id, source, profit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'fill', NULL)",
            params![
                order.bot_name,
                order.symbol,
                order.side.as_str(),
                dec_to_text(fill_price),
                dec_to_text(order.amount),
                dec_to_text(value),
                dec_to_text(fee),
                now,
                order_id,
            ],
        )?;
        let trade_id = tx.last_insert_rowid();
        tx.commit()?;
        info!(order_id, bot = %order.bot_name, price = %fill_price, "order filled");

        Ok(Trade {
            id: trade_id,
            bot_name: order.bot_name,
            symbol: order.symbol,
            side: order.side,
            price: fill_price,
            amount: order.amount,
            value,
            fee,
            timestamp: millis_to_ts(now),
            order_id: Some(order_id),
            source: TradeSource::Fill,
            profit: None,
        })
    }

    /// Backfills a trade's realized profit once it is known - used by the Grid
    /// Engine after pairing a closing fill against its opening position, since
    /// `fill_order` itself has no view of which trade closes which position.
    pub async fn set_trade_profit(&self, trade_id: i64, profit: Decimal) -> Result<(), LedgerError> {
        let conn = self.conn.lock().await;
        let n = conn.execute("UPDATE trades SET profit = ?1 WHERE id = ?2", params![dec_to_text(profit), trade_id])?;
        if n == 0 {
            return Err(LedgerError::OrderNotFound(trade_id));
        }
        Ok(())
    }

    /// Transitions `open -> cancelled`; idempotent if already cancelled.
    pub async fn cancel_order(&self, order_id: i64, reason: &str) -> Result<(), LedgerError> {
        let conn = self.conn.lock().await;
        let status: Option<String> = conn
            .query_row("SELECT status FROM orders WHERE id = ?1", params![order_id], |r| r.get(0))
            .optional()?;
        let status = status.ok_or(LedgerError::OrderNotFound(order_id))?;
        if status == "cancelled" {
            return Ok(());
        }
        if status != "open" {
            return Err(LedgerError::OrderNotOpen(order_id));
        }
        let now = ts_to_millis(Utc::now());
        conn.execute(
            "UPDATE orders SET status='cancelled', cancelled_at=?1, cancel_reason=?2 WHERE id=?3",
            params![now, reason, order_id],
        )?;
        info!(order_id, reason, "order cancelled");
        Ok(())
    }

    pub async fn list_open_orders(&self, bot_name: Option<&str>) -> Result<Vec<Order>, LedgerError> {
        let conn = self.conn.lock().await;
        match bot_name {
            Some(name) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM orders WHERE status='open' AND bot_name=?1 ORDER BY level_index",
                )?;
                let rows = stmt.query_map(params![name], row_to_order)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(LedgerError::from)
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT * FROM orders WHERE status='open' ORDER BY bot_name, level_index")?;
                let rows = stmt.query_map([], row_to_order)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(LedgerError::from)
            }
        }
    }

    pub async fn get_order(&self, order_id: i64) -> Result<Option<Order>, LedgerError> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM orders WHERE id = ?1", params![order_id], row_to_order)
            .optional()
            .map_err(LedgerError::from)
    }

    // ---- Trades ----------------------------------------------------------

    pub async fn insert_trade(&self, trade: NewTrade) -> Result<Trade, LedgerError> {
        let conn = self.conn.lock().await;
        let now = ts_to_millis(trade.timestamp);
        conn.execute(
            "INSERT INTO trades (bot_name, symbol, side, price, amount, value, fee, timestamp,
                order_id, source, profit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                trade.bot_name,
                trade.symbol,
                trade.side.as_str(),
                dec_to_text(trade.price),
                dec_to_text(trade.amount),
                dec_to_text(trade.value),
                dec_to_text(trade.fee),
                now,
                trade.order_id,
                trade.source.as_str(),
                trade.profit.map(dec_to_text),
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Trade {
            id,
            bot_name: trade.bot_name,
            symbol: trade.symbol,
            side: trade.side,
            price: trade.price,
            amount: trade.amount,
            value: trade.value,
            fee: trade.fee,
            timestamp: trade.timestamp,
            order_id: trade.order_id,
            source: trade.source,
            profit: trade.profit,
        })
    }

    pub async fn list_trades(
        &self,
        bot_name: &str,
        since_ts: Option<DateTime<Utc>>,
        until_ts: Option<DateTime<Utc>>,
    ) -> Result<Vec<Trade>, LedgerError> {
        let conn = self.conn.lock().await;
        let since = since_ts.map(ts_to_millis).unwrap_or(i64::MIN);
        let until = until_ts.map(ts_to_millis).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(
            "SELECT * FROM trades WHERE bot_name=?1 AND timestamp>=?2 AND timestamp<=?3
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![bot_name, since, until], row_to_trade)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(LedgerError::from)
    }

    // ---- Metrics ----------------------------------------------------------

    /// Recomputes derived metrics for a bot from its trade history. Safe to call
    /// from any component; purely a read over `trades` plus a small fold.
    pub async fn recompute_metrics(&self, bot_name: &str) -> Result<Metrics, LedgerError> {
        let trades = self.list_trades(bot_name, None, None).await?;
        let open_orders = self.list_open_orders(Some(bot_name)).await?;

        let mut wins = 0u64;
        let mut losses = 0u64;
        let mut sum_win = Decimal::ZERO;
        let mut sum_loss = Decimal::ZERO;
        let mut total_pnl = Decimal::ZERO;
        let mut total_fees = Decimal::ZERO;
        let mut equity_curve: Vec<f64> = Vec::new();
        let mut running = Decimal::ZERO;
        let mut peak = Decimal::ZERO;
        let mut max_drawdown = Decimal::ZERO;

        for t in &trades {
            total_fees += t.fee;
            if let Some(profit) = t.profit {
                total_pnl += profit;
                running += profit;
                if profit > Decimal::ZERO {
                    wins += 1;
                    sum_win += profit;
                } else if profit < Decimal::ZERO {
                    losses += 1;
                    sum_loss += -profit;
                }
                if running > peak {
                    peak = running;
                }
                let drawdown = peak - running;
                if drawdown > max_drawdown {
                    max_drawdown = drawdown;
                }
                equity_curve.push(running.to_string().parse::<f64>().unwrap_or(0.0));
            }
        }

        let win_rate = if wins + losses > 0 {
            Decimal::from(wins) / Decimal::from(wins + losses)
        } else {
            Decimal::ZERO
        };
        let avg_win = if wins > 0 { sum_win / Decimal::from(wins) } else { Decimal::ZERO };
        let avg_loss = if losses > 0 { sum_loss / Decimal::from(losses) } else { Decimal::ZERO };
        let profit_factor = if sum_loss > Decimal::ZERO { sum_win / sum_loss } else { Decimal::ZERO };
        let sharpe = crate::market::sharpe_ratio(&equity_curve);

        Ok(Metrics {
            bot_name: bot_name.to_string(),
            total_trades: trades.len() as u64,
            open_positions: open_orders.iter().filter(|o| o.side == Side::Buy).count() as u64,
            win_count: wins,
            loss_count: losses,
            win_rate,
            avg_win,
            avg_loss,
            profit_factor,
            sharpe,
            max_drawdown,
            total_pnl,
            total_fees,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewTrade {
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

fn row_to_bot(row: &rusqlite::Row) -> rusqlite::Result<Bot> {
    let status_str: String = row.get("status")?;
    let lower: String = row.get("lower_price")?;
    let upper: String = row.get("upper_price")?;
    let size: String = row.get("order_size")?;
    Ok(Bot {
        id: row.get("id")?,
        name: row.get("name")?,
        symbol: row.get("symbol")?,
        lower_price: text_to_dec(&lower).unwrap_or_default(),
        upper_price: text_to_dec(&upper).unwrap_or_default(),
        grid_count: row.get::<_, i64>("grid_count")? as u32,
        adjusted_grid_count: row.get::<_, i64>("adjusted_grid_count")? as u32,
        order_size: text_to_dec(&size).unwrap_or_default(),
        status: BotStatus::parse(&status_str).unwrap_or(BotStatus::Stopped),
        stop_reason: row.get("stop_reason")?,
        rebalance_count: row.get::<_, i64>("rebalance_count")? as u32,
        created_at: millis_to_ts(row.get("created_at")?),
        updated_at: millis_to_ts(row.get("updated_at")?),
    })
}

fn row_to_order(row: &rusqlite::Row) -> rusqlite::Result<Order> {
    let side_str: String = row.get("side")?;
    let status_str: String = row.get("status")?;
    let price: String = row.get("price")?;
    let amount: String = row.get("amount")?;
    let size_quote: String = row.get("size_quote")?;
    let weight: String = row.get("weight")?;
    let filled_price: Option<String> = row.get("filled_price")?;
    let filled_at: Option<i64> = row.get("filled_at")?;
    let cancelled_at: Option<i64> = row.get("cancelled_at")?;

    Ok(Order {
        id: row.get("id")?,
        bot_name: row.get("bot_name")?,
        symbol: row.get("symbol")?,
        side: Side::parse(&side_str).unwrap_or(Side::Buy),
        price: text_to_dec(&price).unwrap_or_default(),
        amount: text_to_dec(&amount).unwrap_or_default(),
        size_quote: text_to_dec(&size_quote).unwrap_or_default(),
        level_index: row.get::<_, i64>("level_index")? as i32,
        weight: text_to_dec(&weight).unwrap_or_default(),
        status: OrderStatus::parse(&status_str).unwrap_or(OrderStatus::Open),
        created_at: millis_to_ts(row.get("created_at")?),
        filled_at: filled_at.map(millis_to_ts),
        filled_price: filled_price.and_then(|s| text_to_dec(&s).ok()),
        cancelled_at: cancelled_at.map(millis_to_ts),
        cancel_reason: row.get("cancel_reason")?,
    })
}

fn row_to_trade(row: &rusqlite::Row) -> rusqlite::Result<Trade> {
    let side_str: String = row.get("side")?;
    let source_str: String = row.get("source")?;
    let price: String = row.get("price")?;
    let amount: String = row.get("amount")?;
    let value: String = row.get("value")?;
    let fee: String = row.get("fee")?;
    let profit: Option<String> = row.get("profit")?;

    Ok(Trade {
        id: row.get("id")?,
        bot_name: row.get("bot_name")?,
        symbol: row.get("symbol")?,
        side: Side::parse(&side_str).unwrap_or(Side::Buy),
        price: text_to_dec(&price).unwrap_or_default(),
        amount: text_to_dec(&amount).unwrap_or_default(),
        value: text_to_dec(&value).unwrap_or_default(),
        fee: text_to_dec(&fee).unwrap_or_default(),
        timestamp: millis_to_ts(row.get("timestamp")?),
        order_id: row.get("order_id")?,
        source: TradeSource::parse(&source_str).unwrap_or(TradeSource::Fill),
        profit: profit.and_then(|s| text_to_dec(&s).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_bot(name: &str) -> NewBot {
        NewBot {
            name: name.to_string(),
            symbol: "BTC/USD".to_string(),
            lower_price: dec!(90000),
            upper_price: dec!(100000),
            grid_count: 10,
            order_size: dec!(100),
        }
    }

    #[tokio::test]
    async fn create_bot_rejects_duplicate_name() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.create_bot(sample_bot("btc")).await.unwrap();
        let err = ledger.create_bot(sample_bot("btc")).await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn create_bot_rejects_bad_range() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut cfg = sample_bot("btc");
        cfg.lower_price = dec!(100000);
        cfg.upper_price = dec!(90000);
        let err = ledger.create_bot(cfg).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn fill_order_is_atomic_and_monotonic() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.create_bot(sample_bot("btc")).await.unwrap();
        ledger
            .insert_orders(&[NewOrder {
                id: 1,
                bot_name: "btc".into(),
                symbol: "BTC/USD".into(),
                side: Side::Buy,
                price: dec!(93000),
                amount: dec!(0.01),
                size_quote: dec!(930),
                level_index: 3,
                weight: dec!(1.2),
            }])
            .await
            .unwrap();

        let trade = ledger.fill_order(1, dec!(93000), Some(dec!(0.93))).await.unwrap();
        assert_eq!(trade.price, dec!(93000));

        // Filled orders never return to open, and a second fill fails.
        let err = ledger.fill_order(1, dec!(93000), None).await.unwrap_err();
        assert!(matches!(err, LedgerError::OrderNotOpen(1)));

        let open = ledger.list_open_orders(Some("btc")).await.unwrap();
        assert!(open.is_empty());
    }

    #[tokio::test]
    async fn cancel_order_is_idempotent() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.create_bot(sample_bot("btc")).await.unwrap();
        ledger
            .insert_orders(&[NewOrder {
                id: 2,
                bot_name: "btc".into(),
                symbol: "BTC/USD".into(),
                side: Side::Sell,
                price: dec!(96000),
                amount: dec!(0.01),
                size_quote: dec!(960),
                level_index: 6,
                weight: dec!(1.0),
            }])
            .await
            .unwrap();

        ledger.cancel_order(2, "TOO_FAR_FROM_MARKET").await.unwrap();
        // Second cancel of an already-cancelled order is a no-op, not an error.
        ledger.cancel_order(2, "TOO_FAR_FROM_MARKET").await.unwrap();
    }

    #[tokio::test]
    async fn at_most_one_open_order_per_level() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.create_bot(sample_bot("btc")).await.unwrap();
        ledger
            .insert_orders(&[NewOrder {
                id: 3,
                bot_name: "btc".into(),
                symbol: "BTC/USD".into(),
                side: Side::Buy,
                price: dec!(91000),
                amount: dec!(0.01),
                size_quote: dec!(910),
                level_index: 1,
                weight: dec!(1.1),
            }])
            .await
            .unwrap();

        let second = ledger
            .insert_orders(&[NewOrder {
                id: 4,
                bot_name: "btc".into(),
                symbol: "BTC/USD".into(),
                side: Side::Sell,
                price: dec!(92000),
                amount: dec!(0.01),
                size_quote: dec!(920),
                level_index: 1,
                weight: dec!(1.1),
            }])
            .await;
        assert!(second.is_err(), "inserting a second open order at the same level must fail");
    }
}
