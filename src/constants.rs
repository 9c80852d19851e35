//! Central configuration constants for spot-grid-bot.
//!
//! This module contains all tunable parameters and magic numbers used throughout
//! the bot. Modify values here to adjust behavior without changing business
//! logic.

use crate::model::{InstrumentRules, Spread};
use std::time::Duration;

// =============================================================================
// RECONCILIATION CADENCES
// =============================================================================

/// Interval between reconciliation ticks (price + open-order poll)
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Minimum interval between grid re-centering passes (15 minutes)
pub const ADJUST_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Heartbeat interval for persisting state even without fills (5 minutes)
pub const STATE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Interval for logging the account balance summary (1 hour)
pub const BALANCE_LOG_INTERVAL: Duration = Duration::from_secs(60 * 60);

// =============================================================================
// GRID GEOMETRY
// =============================================================================

/// Margin applied on each side of the current price when re-centering.
/// 2% per side.
pub const RECENTER_MARGIN: Spread = Spread::new(2.0);

/// Buffer widening the out-of-range predicate. Zero: the grid bounds
/// themselves are the trigger.
pub const RANGE_BUFFER: Spread = Spread::new(0.0);

/// Grid width as a percentage of price must stay inside this band,
/// otherwise the grid is re-derived around the current price.
pub const MIN_WIDTH_PCT: f64 = 3.0;
pub const MAX_WIDTH_PCT: f64 = 10.0;

// =============================================================================
// BALANCE & ORDER SIZING
// =============================================================================

/// Fraction of the free balance that may be committed when scaling the
/// per-level quantity down to fit available funds.
pub const BALANCE_SAFETY_FACTOR: f64 = 0.95;

/// Instrument rules assumed in paper mode, where no venue publishes
/// tick-size metadata.
pub const DEFAULT_INSTRUMENT_RULES: InstrumentRules = InstrumentRules {
    tick_size: 0.0001,
    step_size: 0.01,
    min_notional: 1.0,
};

// =============================================================================
// FAILURE HANDLING
// =============================================================================

/// Consecutive failed ticks tolerated before the engine escalates to fatal.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Attempts for the initial price fetch before giving up on startup.
pub const SETUP_RETRY_ATTEMPTS: u32 = 5;

/// Base delay for the startup retry backoff (doubles per attempt).
pub const SETUP_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

// =============================================================================
// LEDGER & HISTORY
// =============================================================================

/// Tolerated divergence between the persisted running total and the sum
/// recomputed from the trade ledger on startup.
pub const PROFIT_EPSILON: f64 = 0.01;

/// Bounded in-memory price history (ticks), feeds the volatility window.
pub const PRICE_HISTORY_CAPACITY: usize = 1000;

/// Trailing ticks considered by the volatility check (1 hour of 10 s polls).
pub const VOLATILITY_WINDOW: usize = 360;

/// Price range over the volatility window above which a warning is raised.
pub const VOLATILITY_THRESHOLD_PCT: f64 = 5.0;
