//! gridbot-backend: a multi-strategy spot-market grid trading bot.
//!
//! Components: a SQLite-backed Ledger, an Exchange Gateway (live HMAC-signed
//! REST or deterministic paper trading), a Grid Planner + Position Sizer, a
//! Sentiment Modulator, the Grid Engine control loop that ties them together,
//! a Reconciler that keeps the Ledger aligned with exchange-reported state,
//! and a Backtest Engine that replays the same planning/sizing code over
//! historical candles.

pub mod app;
pub mod backtest;
pub mod cli;
pub mod config;
pub mod error;
pub mod exchange;
pub mod grid;
pub mod ledger;
pub mod market;
pub mod reconciler;
pub mod sentiment;
