use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the reconciliation engine and its collaborators.
///
/// Callers decide retry vs. abort; no component substitutes a default value
/// and carries on silently.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("exchange returned no price for {symbol}")]
    PriceUnavailable { symbol: String },

    #[error("insufficient {asset} balance: required {required:.8}, available {available:.8}")]
    InsufficientBalance {
        asset: String,
        required: f64,
        available: f64,
    },

    #[error("order notional {notional:.8} is below the exchange minimum {min_notional:.8}")]
    MinNotional { notional: f64, min_notional: f64 },

    #[error("invalid grid range: lower {lower}, upper {upper}, grids {grids}")]
    InvalidRange { lower: f64, upper: f64, grids: u32 },

    #[error("state file {path} is unreadable: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    #[error("order {order_id} not found")]
    OrderNotFound { order_id: u64 },

    #[error("transient exchange error: {0}")]
    Transient(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl EngineError {
    /// Transient errors are retried on the next tick; everything else is a
    /// decision for the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::PriceUnavailable { .. } | EngineError::Transient(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while loading and validating configuration.
#[derive(Error, Debug)]
pub enum BotError {
    #[error("Config error: {0}")]
    ConfigError(#[from] std::io::Error),
    #[error("Parsing error: {0}")]
    ParsingError(#[from] toml::de::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
}
