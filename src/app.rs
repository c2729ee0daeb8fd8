//! Component wiring and CLI dispatch: builds the Ledger, Exchange Gateway,
//! and Sentiment Modulator from `Config`, then either executes a one-shot
//! command or drives the Grid Engine's foreground control loop.

use crate::backtest::{BacktestConfig, BacktestEngine};
use crate::cli::{Cli, Command, EXIT_GENERIC_ERROR, EXIT_NOT_FOUND, EXIT_SUCCESS, EXIT_VALIDATION_ERROR};
use crate::config::{Config, ExchangeMode};
use crate::exchange::{Balance, Exchange, LiveExchange, PaperExchange};
use crate::grid::engine::GridEngine;
use crate::grid::sizer::SizerConfig;
use crate::ledger::{BotPatch, BotStatus, Ledger, LedgerError, NewBot};
use crate::reconciler::Reconciler;
use crate::sentiment::{ComponentWeights, DisabledModulator, ModulatorThresholds, NoSentimentSource, SentimentModulator, SentimentSource, WeightedAverageModulator};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct Components {
    pub ledger: Arc<Ledger>,
    pub exchange: Arc<dyn Exchange>,
    pub modulator: Arc<dyn SentimentModulator>,
    pub sentiment_source: Arc<dyn SentimentSource>,
}

/// Builds the shared components from configuration. `EXCHANGE_MODE=live` wires
/// a real `LiveExchange`; `paper` (the default) wraps it for read-only market
/// data and simulates fills, balances, and order placement locally.
pub async fn build_components(config: &Config) -> anyhow::Result<Components> {
    let ledger = Arc::new(Ledger::open(&config.database_path)?);

    let live = Arc::new(LiveExchange::new(
        config.exchange_base_url.clone(),
        config.exchange_api_key.clone().unwrap_or_default(),
        config.exchange_api_secret.clone().unwrap_or_default(),
    ));

    let exchange: Arc<dyn Exchange> = match config.exchange_mode {
        ExchangeMode::Live => live,
        ExchangeMode::Paper => {
            let mut starting_balances = HashMap::new();
            starting_balances.insert("USD".to_string(), Balance { free: Decimal::new(10_000, 0), total: Decimal::new(10_000, 0) });
            Arc::new(PaperExchange::new(live, starting_balances, config.taker_fee_rate))
        }
    };

    let modulator: Arc<dyn SentimentModulator> = if config.sentiment_openai_key.is_some() || config.sentiment_cryptopanic_key.is_some() {
        Arc::new(WeightedAverageModulator::new(
            ComponentWeights::default(),
            ModulatorThresholds { skip_buys_at: config.sentiment_skip_buys_at, skip_sells_at: config.sentiment_skip_sells_at },
        ))
    } else {
        Arc::new(DisabledModulator)
    };

    Ok(Components { ledger, exchange, modulator, sentiment_source: Arc::new(NoSentimentSource) })
}

fn sizer_config(config: &Config) -> SizerConfig {
    SizerConfig {
        max_position_percent: config.max_position_percent,
        min_position_percent: config.min_position_percent,
        kelly_fraction: config.kelly_fraction,
        kelly_min_trades: config.kelly_min_trades,
        max_risk_per_trade: config.max_risk_per_trade,
        lot_precision: 6,
    }
}

fn parse_timestamp(s: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")?;
    Ok(date.and_hms_opt(0, 0, 0).unwrap().and_utc())
}

/// Dispatches one CLI command and returns the process exit code.
pub async fn dispatch(cli: Cli, config: Config) -> i32 {
    let components = match build_components(&config).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to initialize: {e}");
            return EXIT_GENERIC_ERROR;
        }
    };

    match cli.command {
        Command::Create { name, lower, upper, grids, size, symbol } => {
            match components.ledger.create_bot(NewBot { name, symbol, lower_price: lower, upper_price: upper, grid_count: grids, order_size: size }).await {
                Ok(bot) => {
                    println!("created bot '{}' ({} grids, {} to {})", bot.name, bot.grid_count, bot.lower_price, bot.upper_price);
                    EXIT_SUCCESS
                }
                Err(e) => report_ledger_error(&e),
            }
        }

        Command::List => match components.ledger.list_bots().await {
            Ok(bots) if bots.is_empty() => {
                println!("no bots configured");
                EXIT_SUCCESS
            }
            Ok(bots) => {
                for bot in bots {
                    println!("{:<16} {:<10} {:<10} [{} .. {}] grids={}", bot.name, bot.symbol, bot.status.as_str(), bot.lower_price, bot.upper_price, bot.adjusted_grid_count);
                }
                EXIT_SUCCESS
            }
            Err(e) => report_ledger_error(&e),
        },

        Command::Show { name } => show_bot(&components, &name).await,

        Command::Start { name } => {
            match components.ledger.update_bot(&name, BotPatch { status: Some(BotStatus::Running), ..Default::default() }).await {
                Ok(bot) => {
                    println!("bot '{}' is now running", bot.name);
                    EXIT_SUCCESS
                }
                Err(e) => report_ledger_error(&e),
            }
        }

        Command::Stop { name } => stop_bot(&components, &name).await,

        Command::Delete { name, force } => delete_bot(&components, &name, force).await,

        Command::Rebalance { name, lower, upper } => rebalance_bot(&components, &name, lower, upper).await,

        Command::Status => status(&components).await,

        Command::Monitor { name } => monitor(components, &config, &name).await,

        Command::Backtest { name, symbol, lower, upper, grids, size, from, to, timeframe } => {
            backtest(&components, &config, name, symbol, lower, upper, grids, size, &from, &to, &timeframe).await
        }
    }
}

fn report_ledger_error(e: &LedgerError) -> i32 {
    eprintln!("{e}");
    match e {
        LedgerError::BotNotFound(_) | LedgerError::OrderNotFound(_) => EXIT_NOT_FOUND,
        LedgerError::Validation(_) | LedgerError::DuplicateName(_) => EXIT_VALIDATION_ERROR,
        LedgerError::OrderNotOpen(_) | LedgerError::Storage(_) => EXIT_GENERIC_ERROR,
    }
}

async fn show_bot(components: &Components, name: &str) -> i32 {
    let bot = match components.ledger.get_bot(name).await {
        Ok(Some(bot)) => bot,
        Ok(None) => {
            eprintln!("bot '{name}' not found");
            return EXIT_NOT_FOUND;
        }
        Err(e) => return report_ledger_error(&e),
    };
    let metrics = match components.ledger.recompute_metrics(name).await {
        Ok(m) => m,
        Err(e) => return report_ledger_error(&e),
    };
    let open_orders = match components.ledger.list_open_orders(Some(name)).await {
        Ok(o) => o,
        Err(e) => return report_ledger_error(&e),
    };

    println!("bot:          {}", bot.name);
    println!("symbol:       {}", bot.symbol);
    println!("status:       {}", bot.status.as_str());
    if let Some(reason) = &bot.stop_reason {
        println!("stop reason:  {reason}");
    }
    println!("range:        {} .. {}", bot.lower_price, bot.upper_price);
    println!("grid count:   {} (requested {})", bot.adjusted_grid_count, bot.grid_count);
    println!("order size:   {}", bot.order_size);
    println!("rebalances:   {}", bot.rebalance_count);
    println!("open orders:  {}", open_orders.len());
    println!("trades:       {} (win rate {:.1}%)", metrics.total_trades, metrics.win_rate * Decimal::from(100));
    println!("profit factor:{}", metrics.profit_factor);
    println!("sharpe:       {:.2}", metrics.sharpe);
    println!("total pnl:    {}", metrics.total_pnl);
    EXIT_SUCCESS
}

async fn cancel_all_open_orders(components: &Components, name: &str, reason: &str) -> Result<(), LedgerError> {
    let open_orders = components.ledger.list_open_orders(Some(name)).await?;
    for order in &open_orders {
        components.exchange.cancel_order(order.id, &order.symbol).await.ok();
        components.ledger.cancel_order(order.id, reason).await?;
    }
    Ok(())
}

async fn stop_bot(components: &Components, name: &str) -> i32 {
    if let Err(e) = cancel_all_open_orders(components, name, "BOT_STOPPED").await {
        return report_ledger_error(&e);
    }
    match components.ledger.update_bot(name, BotPatch { status: Some(BotStatus::Stopped), ..Default::default() }).await {
        Ok(bot) => {
            println!("bot '{}' stopped", bot.name);
            EXIT_SUCCESS
        }
        Err(e) => report_ledger_error(&e),
    }
}

async fn delete_bot(components: &Components, name: &str, force: bool) -> i32 {
    let bot = match components.ledger.get_bot(name).await {
        Ok(Some(bot)) => bot,
        Ok(None) => {
            eprintln!("bot '{name}' not found");
            return EXIT_NOT_FOUND;
        }
        Err(e) => return report_ledger_error(&e),
    };
    if bot.status == BotStatus::Running && !force {
        eprintln!("bot '{name}' is running; pass --force to delete it anyway");
        return EXIT_VALIDATION_ERROR;
    }
    if let Err(e) = cancel_all_open_orders(components, name, "BOT_DELETED").await {
        return report_ledger_error(&e);
    }
    match components.ledger.delete_bot(name).await {
        Ok(()) => {
            println!("bot '{name}' deleted");
            EXIT_SUCCESS
        }
        Err(e) => report_ledger_error(&e),
    }
}

async fn rebalance_bot(components: &Components, name: &str, lower: Option<Decimal>, upper: Option<Decimal>) -> i32 {
    let bot = match components.ledger.get_bot(name).await {
        Ok(Some(bot)) => bot,
        Ok(None) => {
            eprintln!("bot '{name}' not found");
            return EXIT_NOT_FOUND;
        }
        Err(e) => return report_ledger_error(&e),
    };
    let new_lower = lower.unwrap_or(bot.lower_price);
    let new_upper = upper.unwrap_or(bot.upper_price);
    if new_lower <= Decimal::ZERO || new_lower >= new_upper {
        eprintln!("lower must be > 0 and < upper");
        return EXIT_VALIDATION_ERROR;
    }
    if let Err(e) = cancel_all_open_orders(components, name, "REBALANCE").await {
        return report_ledger_error(&e);
    }
    match components
        .ledger
        .update_bot(name, BotPatch { lower_price: Some(new_lower), upper_price: Some(new_upper), rebalance_count: Some(bot.rebalance_count + 1), ..Default::default() })
        .await
    {
        Ok(bot) => {
            println!("bot '{}' rebalanced to [{} .. {}] (rebalance #{})", bot.name, bot.lower_price, bot.upper_price, bot.rebalance_count);
            EXIT_SUCCESS
        }
        Err(e) => report_ledger_error(&e),
    }
}

async fn status(components: &Components) -> i32 {
    let bots = match components.ledger.list_bots().await {
        Ok(b) => b,
        Err(e) => return report_ledger_error(&e),
    };
    let running = bots.iter().filter(|b| b.status == BotStatus::Running).count();
    let mut total_trades = 0u64;
    for bot in &bots {
        match components.ledger.recompute_metrics(&bot.name).await {
            Ok(m) => total_trades += m.total_trades,
            Err(e) => return report_ledger_error(&e),
        }
    }

    println!("bots:           {} ({} running)", bots.len(), running);
    println!("total trades:   {total_trades}");
    match components.exchange.fetch_balance().await {
        Ok(balances) => {
            println!("balances:");
            for (asset, bal) in balances {
                println!("  {asset:<8} free={} total={}", bal.free, bal.total);
            }
        }
        Err(e) => {
            eprintln!("exchange unreachable: {e}");
            return EXIT_GENERIC_ERROR;
        }
    }
    EXIT_SUCCESS
}

/// Runs the Grid Engine loop for one bot in the foreground, reconciling
/// against the exchange on its own cadence, until Ctrl-C.
async fn monitor(components: Components, config: &Config, name: &str) -> i32 {
    if let Err(e) = match components.ledger.get_bot(name).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(LedgerError::BotNotFound(name.to_string())),
        Err(e) => Err(e),
    } {
        return report_ledger_error(&e);
    }

    let engine = Arc::new(GridEngine::new(
        components.ledger.clone(),
        components.exchange.clone(),
        components.modulator.clone(),
        components.sentiment_source.clone(),
        config.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(components.ledger.clone(), components.exchange.clone()));

    info!(bot = name, "monitor loop starting");
    let mut ticks_since_reconcile = u64::MAX;
    let reconcile_every = (config.reconcile_seconds / config.cycle_seconds.max(1)).max(1);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(bot = name, "shutdown signal received");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(config.cycle_seconds)) => {}
        }

        if ticks_since_reconcile >= reconcile_every {
            let bot = match components.ledger.get_bot(name).await {
                Ok(Some(bot)) => bot,
                Ok(None) => {
                    error!(bot = name, "bot disappeared during monitor loop");
                    break;
                }
                Err(e) => {
                    error!(bot = name, error = %e, "ledger error during reconciliation");
                    continue;
                }
            };
            match reconciler.reconcile_bot(&bot, &engine).await {
                Ok(report) => info!(bot = name, filled = report.filled, cancelled = report.cancelled_missing, imported = report.imported, "reconciled"),
                Err(e) => warn!(bot = name, error = %e, "reconciliation failed, continuing with stale state"),
            }
            ticks_since_reconcile = 0;
        } else {
            ticks_since_reconcile += 1;
        }

        match engine.run_cycle(name).await {
            Ok(report) => info!(bot = name, placed = report.placed, cancelled = report.cancelled, paused = report.paused, "cycle complete"),
            Err(e) => error!(bot = name, error = %e, "cycle failed"),
        }
    }

    EXIT_SUCCESS
}

#[allow(clippy::too_many_arguments)]
async fn backtest(
    components: &Components,
    config: &Config,
    name: Option<String>,
    symbol: Option<String>,
    lower: Option<Decimal>,
    upper: Option<Decimal>,
    grids: Option<u32>,
    size: Option<Decimal>,
    from: &str,
    to: &str,
    timeframe: &str,
) -> i32 {
    let (symbol, lower_price, upper_price, grid_count, order_size) = if let Some(name) = &name {
        match components.ledger.get_bot(name).await {
            Ok(Some(bot)) => (bot.symbol, bot.lower_price, bot.upper_price, bot.grid_count, bot.order_size),
            Ok(None) => {
                eprintln!("bot '{name}' not found");
                return EXIT_NOT_FOUND;
            }
            Err(e) => return report_ledger_error(&e),
        }
    } else {
        let (Some(symbol), Some(lower), Some(upper), Some(grids), Some(size)) = (symbol, lower, upper, grids, size) else {
            eprintln!("backtest requires either --name or all of --symbol/--lower/--upper/--grids/--size");
            return EXIT_VALIDATION_ERROR;
        };
        (symbol, lower, upper, grids, size)
    };

    let start = match parse_timestamp(from) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("invalid --from: {e}");
            return EXIT_VALIDATION_ERROR;
        }
    };
    let end = match parse_timestamp(to) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("invalid --to: {e}");
            return EXIT_VALIDATION_ERROR;
        }
    };

    let candles = match components.exchange.fetch_ohlcv(&symbol, timeframe, Some(start), Some(end), None).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to fetch candle history: {e}");
            return EXIT_GENERIC_ERROR;
        }
    };
    if candles.is_empty() {
        eprintln!("no candle history in the requested range");
        return EXIT_VALIDATION_ERROR;
    }

    let cfg = BacktestConfig {
        symbol,
        lower_price,
        upper_price,
        grid_count,
        order_size,
        starting_equity: Decimal::new(10_000, 0),
        fee_rate: config.taker_fee_rate,
        stop_loss_pct: config.stop_loss_pct,
        rebalance_threshold: config.rebalance_threshold,
        stale_range: config.stale_range,
        grid_count_floor: config.grid_count_floor,
        grid_count_cap: config.grid_count_cap,
        sizer: sizer_config(config),
    };

    let engine = BacktestEngine::new(components.modulator.clone());
    let report = engine.run(&candles, &HashMap::new(), &cfg).await;

    println!("candles:        {}", candles.len());
    println!("total trades:   {}", report.total_trades);
    println!("win rate:       {:.1}%", report.win_rate * 100.0);
    println!("profit factor:  {:.2}", report.profit_factor);
    println!("sharpe:         {:.2}", report.sharpe);
    println!("max drawdown:   {:.2}", report.max_drawdown);
    println!("total pnl:      {}", report.total_pnl);
    println!("total fees:     {}", report.total_fees);
    println!("rebalances:     {}", report.rebalance_count);
    println!("skipped buys:   {}", report.skipped_buys);
    println!("skipped sells:  {}", report.skipped_sells);
    EXIT_SUCCESS
}
