//! Console renderer for the grid preview output.

use crate::config::GridConfig;
use crate::error::EngineResult;
use crate::grid::levels;

/// Console renderer for `--preview` reports: shows the levels a grid would
/// place at a given price without touching an exchange.
pub struct ConsoleRenderer;

impl ConsoleRenderer {
    /// Render a complete grid preview report to stdout.
    pub fn render(config: &GridConfig, current_price: f64) -> EngineResult<()> {
        let grid_prices =
            levels::generate_levels(config.lower_price, config.upper_price, config.grid_count)?;
        let grid_size = config.grid_size();

        println!();
        println!("{}", "=".repeat(60));
        println!(" GRID PREVIEW REPORT");
        println!("{}", "=".repeat(60));

        println!();
        Self::render_levels(&grid_prices, current_price, config.quantity);

        println!();
        println!("{}", "-".repeat(60));
        Self::render_requirements(&grid_prices, current_price, config);

        println!();
        println!("{}", "=".repeat(60));
        Self::render_config(config, grid_size);

        println!();
        println!("Current Price: {:.6}", current_price);
        println!();
        println!("{}", "=".repeat(60));
        println!();
        Ok(())
    }

    fn render_levels(grid_prices: &[f64], current_price: f64, quantity: f64) {
        println!("GRID LEVELS ({} Levels)", grid_prices.len());
        println!(
            "{:<4} | {:<12} | {:<6} | {:<12} | {:<12}",
            "IDX", "PRICE", "SIDE", "SIZE", "NOTIONAL"
        );
        println!("{}", "-".repeat(60));

        for (index, &price) in grid_prices.iter().enumerate() {
            let side = if (price - current_price).abs() < f64::EPSILON {
                "SKIP"
            } else if price < current_price {
                "BUY"
            } else {
                "SELL"
            };
            println!(
                "{:<4} | {:<12.6} | {:<6} | {:<12.4} | {:<12.4}",
                index,
                price,
                side,
                quantity,
                price * quantity
            );
        }
    }

    fn render_requirements(grid_prices: &[f64], current_price: f64, config: &GridConfig) {
        let required_quote: f64 = grid_prices
            .iter()
            .filter(|&&p| p < current_price)
            .map(|&p| p * config.quantity)
            .sum();
        let sell_count = grid_prices.iter().filter(|&&p| p > current_price).count();
        let required_base = config.quantity * sell_count as f64;

        println!("BALANCE REQUIREMENTS");
        println!(
            "Buy side:   {:.4} {}",
            required_quote,
            config.quote_asset()
        );
        println!("Sell side:  {:.4} {}", required_base, config.base_asset());
    }

    fn render_config(config: &GridConfig, grid_size: f64) {
        println!("CONFIGURATION");
        println!("Symbol:      {}", config.symbol);
        println!(
            "Range:       {:.6} - {:.6}",
            config.lower_price, config.upper_price
        );
        println!("Grid Count:  {}", config.grid_count);
        println!("Grid Size:   {:.6}", grid_size);
        println!("Quantity:    {:.4}", config.quantity);
        println!(
            "Max Inv:     {:.3} {}",
            config.max_investment,
            config.quote_asset()
        );
        println!("Stop Loss:   {:.2}%", config.stop_loss_pct);
    }
}
