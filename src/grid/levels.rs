//! Pure grid geometry: level generation, step targets, range predicates.

use crate::error::{EngineError, EngineResult};
use crate::model::Spread;

/// Calculates the evenly spaced price levels spanning `[lower, upper]`.
///
/// Returns `grid_count + 1` strictly increasing prices, first exactly `lower`
/// and last exactly `upper`.
pub fn generate_levels(lower: f64, upper: f64, grid_count: u32) -> EngineResult<Vec<f64>> {
    if upper <= lower || grid_count < 1 {
        return Err(EngineError::InvalidRange {
            lower,
            upper,
            grids: grid_count,
        });
    }

    let n = grid_count as f64;
    let mut prices = Vec::with_capacity(grid_count as usize + 1);
    for i in 0..=grid_count {
        // Interpolation keeps the endpoints exact.
        let price = lower + (upper - lower) * (i as f64 / n);
        prices.push(price);
    }
    Ok(prices)
}

/// Target for the compensating sell after a buy fill: one step up, computed
/// arithmetically rather than looked up from the level sequence, so it stays
/// valid even while the grid is being re-centered.
pub fn next_level_up(price: f64, grid_size: f64) -> f64 {
    price + grid_size
}

/// Target for the compensating buy after a sell fill: one step down.
pub fn next_level_down(price: f64, grid_size: f64) -> f64 {
    price - grid_size
}

/// Whether `price` has left `[lower, upper]` widened by `buffer` on each side.
pub fn is_outside(price: f64, lower: f64, upper: f64, buffer: Spread) -> bool {
    price < buffer.markdown(lower) || price > buffer.markup(upper)
}

/// Derives new grid bounds centered on `current_price` with `margin` on each
/// side. Single source of truth for re-centering.
pub fn recenter(current_price: f64, margin: Spread) -> (f64, f64) {
    (margin.markdown(current_price), margin.markup(current_price))
}

/// Grid width as a percentage of the current price.
pub fn width_pct(lower: f64, upper: f64, current_price: f64) -> f64 {
    ((upper - lower) / current_price) * 100.0
}
