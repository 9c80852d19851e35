//! Risk checks invoked by the engine before placing orders, plus the
//! emergency-exit path.

use crate::config::GridConfig;
use crate::error::EngineResult;
use crate::exchange::ExchangePort;
use crate::model::OrderSide;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Hooks the engine consults before committing funds.
#[async_trait]
pub trait RiskHook: Send + Sync {
    /// Whether the current investment is still within the configured limit.
    async fn check_investment_limit(&self) -> EngineResult<bool>;

    /// Whether the price has fallen below the stop-loss threshold relative
    /// to `reference_price`.
    async fn check_stop_loss(&self, reference_price: f64) -> EngineResult<bool>;

    /// Cancel all resting orders and liquidate the base position.
    async fn execute_emergency_exit(&self) -> EngineResult<bool>;
}

/// Threshold-based risk manager over the exchange port.
pub struct RiskManager {
    exchange: Arc<dyn ExchangePort>,
    symbol: String,
    base_asset: String,
    quote_asset: String,
    max_investment: f64,
    stop_loss_pct: f64,
}

impl RiskManager {
    pub fn new(exchange: Arc<dyn ExchangePort>, config: &GridConfig) -> Self {
        info!(
            "[RISK] Manager initialized for {}: max investment {} {}, stop loss {}%",
            config.symbol,
            config.max_investment,
            config.quote_asset(),
            config.stop_loss_pct
        );
        Self {
            exchange,
            symbol: config.symbol.clone(),
            base_asset: config.base_asset().to_string(),
            quote_asset: config.quote_asset().to_string(),
            max_investment: config.max_investment,
            stop_loss_pct: config.stop_loss_pct,
        }
    }

    /// Current investment in quote terms: quote locked in open buy orders
    /// plus the base holding valued at the current price.
    async fn current_investment(&self) -> EngineResult<f64> {
        let quote = self.exchange.get_balance(&self.quote_asset).await?;
        let base = self.exchange.get_balance(&self.base_asset).await?;
        let price = self.exchange.get_price(&self.symbol).await?;
        Ok(quote.locked + base.total() * price)
    }
}

#[async_trait]
impl RiskHook for RiskManager {
    async fn check_investment_limit(&self) -> EngineResult<bool> {
        let investment = self.current_investment().await?;
        if investment > self.max_investment {
            warn!(
                "[RISK] Investment {:.4} {} exceeds limit {:.4}",
                investment, self.quote_asset, self.max_investment
            );
        }
        Ok(investment <= self.max_investment)
    }

    async fn check_stop_loss(&self, reference_price: f64) -> EngineResult<bool> {
        let current_price = self.exchange.get_price(&self.symbol).await?;
        let stop_loss_price = reference_price * (1.0 - self.stop_loss_pct / 100.0);
        if current_price < stop_loss_price {
            warn!(
                "[RISK] Stop loss triggered! Reference: {:.6}, current: {:.6}, threshold: {:.6}",
                reference_price, current_price, stop_loss_price
            );
            return Ok(true);
        }
        Ok(false)
    }

    async fn execute_emergency_exit(&self) -> EngineResult<bool> {
        warn!("[RISK] Executing emergency exit for {}", self.symbol);

        let open_orders = self.exchange.get_open_orders(&self.symbol).await?;
        for order in &open_orders {
            if let Err(e) = self.exchange.cancel_order(order.order_id, &self.symbol).await {
                error!(
                    "[RISK] Failed to cancel order {} during emergency exit: {}",
                    order.order_id, e
                );
            }
        }
        if !open_orders.is_empty() {
            info!("[RISK] Cancelled {} open orders", open_orders.len());
        }

        let base = self.exchange.get_balance(&self.base_asset).await?;
        if base.free > 0.0 {
            match self
                .exchange
                .place_market_order(&self.symbol, OrderSide::Sell, base.free)
                .await
            {
                Ok(order) => {
                    warn!(
                        "[RISK] Emergency sell executed: {:.6} {} at {:.6}",
                        order.quantity, self.base_asset, order.price
                    );
                    return Ok(true);
                }
                Err(e) => {
                    error!("[RISK] Failed to execute emergency sell: {}", e);
                }
            }
        }
        Ok(false)
    }
}

/// Price range over the window as a percentage of its minimum. `None` when
/// the window is empty.
pub fn volatility_range_pct(window: &[f64]) -> Option<f64> {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &price in window {
        min = min.min(price);
        max = max.max(price);
    }
    if !min.is_finite() || min <= 0.0 {
        return None;
    }
    Some(((max - min) / min) * 100.0)
}

/// Volatility check over the trailing price history; logs at elevated
/// severity above the threshold.
pub fn is_volatile(window: &[f64], threshold_pct: f64) -> bool {
    match volatility_range_pct(window) {
        Some(range_pct) if range_pct > threshold_pct => {
            warn!(
                "[RISK] High market volatility detected: {:.2}% (threshold: {}%)",
                range_pct, threshold_pct
            );
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PaperConfig;
    use crate::exchange::paper::PaperExchange;
    use crate::model::InstrumentRules;

    fn config() -> GridConfig {
        GridConfig {
            symbol: "ADAUSDT".to_string(),
            lower_price: 0.785,
            upper_price: 0.815,
            grid_count: 3,
            quantity: 13.0,
            max_investment: 27.0,
            stop_loss_pct: 5.0,
            state_dir: ".".to_string(),
            paper: PaperConfig::default(),
        }
    }

    fn rules() -> InstrumentRules {
        InstrumentRules {
            tick_size: 0.0001,
            step_size: 0.01,
            min_notional: 0.1,
        }
    }

    #[tokio::test]
    async fn test_investment_limit() {
        let exchange = Arc::new(PaperExchange::new("ADA", "USDT", rules(), 0.80));
        exchange.deposit("USDT", 100.0).await;
        let risk = RiskManager::new(exchange.clone(), &config());

        // No base holding, nothing locked: within limit.
        assert!(risk.check_investment_limit().await.unwrap());

        // 50 ADA at 0.80 = 40 quote, over the 27 limit.
        exchange.deposit("ADA", 50.0).await;
        assert!(!risk.check_investment_limit().await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_loss_threshold() {
        let exchange = Arc::new(PaperExchange::new("ADA", "USDT", rules(), 0.80));
        let risk = RiskManager::new(exchange.clone(), &config());

        // 5% below 0.80 is 0.76; 0.80 is safe.
        assert!(!risk.check_stop_loss(0.80).await.unwrap());

        exchange.set_price(0.75).await;
        assert!(risk.check_stop_loss(0.80).await.unwrap());
    }

    #[tokio::test]
    async fn test_emergency_exit_cancels_and_liquidates() {
        let exchange = Arc::new(PaperExchange::new("ADA", "USDT", rules(), 0.80));
        exchange.deposit("USDT", 27.0).await;
        exchange.deposit("ADA", 13.0).await;
        exchange
            .place_limit_order("ADAUSDT", OrderSide::Buy, 13.0, 0.79, None)
            .await
            .unwrap();

        let risk = RiskManager::new(exchange.clone(), &config());
        assert!(risk.execute_emergency_exit().await.unwrap());

        assert_eq!(exchange.open_order_count().await, 0);
        let base = exchange.get_balance("ADA").await.unwrap();
        assert!(base.free.abs() < 1e-9);
    }

    #[test]
    fn test_volatility_range() {
        assert_eq!(volatility_range_pct(&[]), None);
        let range = volatility_range_pct(&[0.80, 0.82, 0.79]).unwrap();
        assert!((range - ((0.82 - 0.79) / 0.79 * 100.0)).abs() < 1e-9);

        assert!(!is_volatile(&[0.80, 0.81], 5.0));
        assert!(is_volatile(&[0.80, 0.85], 5.0));
    }
}
