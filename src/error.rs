//! Structured error taxonomy for the Ledger and Exchange Gateway boundaries.
//!
//! Component errors are tagged enums (never opaque strings); the CLI and engine
//! loop aggregate them with `anyhow::Context` at the call site.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("bot '{0}' already exists")]
    DuplicateName(String),
    #[error("bot '{0}' not found")]
    BotNotFound(String),
    #[error("order {0} is not open")]
    OrderNotOpen(i64),
    #[error("order {0} not found")]
    OrderNotFound(i64),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("rate limited, retry after backoff")]
    RateLimited,
    #[error("transient exchange error: {0}")]
    Transient(String),
    #[error("authentication failed")]
    Auth,
    #[error("not found")]
    NotFound,
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("market closed")]
    MarketClosed,
}

impl ExchangeError {
    /// Transient/rate-limited failures are worth retrying within a cycle budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::RateLimited | ExchangeError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("fatal: {0}")]
    Fatal(String),
}
