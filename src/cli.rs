//! Command-line surface: a thin collaborator over the Ledger and Grid Engine,
//! built with `clap`'s derive API in the style of this codebase's existing
//! `#[derive(Parser)]` / `#[derive(Subcommand)]` helper binaries.

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;

#[derive(Parser, Debug)]
#[command(name = "gridbot")]
#[command(about = "Multi-strategy spot-market grid trading bot")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate and insert a new bot in the `stopped` state.
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        lower: Decimal,
        #[arg(long)]
        upper: Decimal,
        #[arg(long)]
        grids: u32,
        #[arg(long)]
        size: Decimal,
        #[arg(long, default_value = "BTC/USD")]
        symbol: String,
    },

    /// List all bots with a summary line each.
    List,

    /// Full bot detail plus computed grid and metrics.
    Show {
        #[arg(long)]
        name: String,
    },

    /// Transition a bot to `running`.
    Start {
        #[arg(long)]
        name: String,
    },

    /// Cancel all open orders for a bot and transition it to `stopped`.
    Stop {
        #[arg(long)]
        name: String,
    },

    /// Cancel orders and delete a bot, its orders, and its trades.
    Delete {
        #[arg(long)]
        name: String,
        /// Required to delete a bot that is currently running.
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// Cancel orders, update the price range, and bump `rebalanceCount`.
    Rebalance {
        #[arg(long)]
        name: String,
        #[arg(long)]
        lower: Option<Decimal>,
        #[arg(long)]
        upper: Option<Decimal>,
    },

    /// Exchange connection, balances, and aggregate bot/trade counts.
    Status,

    /// Run the Grid Engine control loop for one bot in the foreground.
    Monitor {
        #[arg(long)]
        name: String,
    },

    /// Replay OHLCV history through the Backtest Engine and print a report.
    Backtest {
        /// Use an existing bot's parameters instead of the ad-hoc grid flags below.
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long)]
        lower: Option<Decimal>,
        #[arg(long)]
        upper: Option<Decimal>,
        #[arg(long)]
        grids: Option<u32>,
        #[arg(long)]
        size: Option<Decimal>,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long, default_value = "1h")]
        timeframe: String,
    },
}

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_GENERIC_ERROR: i32 = 1;
pub const EXIT_VALIDATION_ERROR: i32 = 2;
pub const EXIT_NOT_FOUND: i32 = 3;
