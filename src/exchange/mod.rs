//! Exchange capability interface consumed by the reconciliation engine.

use crate::error::EngineResult;
use crate::model::{Balance, InstrumentRules, Order, OrderSide};
use async_trait::async_trait;
use uuid::Uuid;

pub mod paper;

/// Exchange operations the engine needs. Adapters translate whatever wire
/// shapes their venue uses into the typed structs in `model`; the engine
/// never sees untyped payloads.
#[async_trait]
pub trait ExchangePort: Send + Sync {
    /// Current price for the instrument. Errors with `PriceUnavailable`
    /// when the venue has no quote.
    async fn get_price(&self, symbol: &str) -> EngineResult<f64>;

    async fn get_balance(&self, asset: &str) -> EngineResult<Balance>;

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        client_id: Option<Uuid>,
    ) -> EngineResult<Order>;

    /// Immediate execution at the current price. Used only by the
    /// emergency-exit path.
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
    ) -> EngineResult<Order>;

    async fn get_open_orders(&self, symbol: &str) -> EngineResult<Vec<Order>>;

    async fn cancel_order(&self, order_id: u64, symbol: &str) -> EngineResult<()>;

    /// Tick-size, lot-size, and minimum-notional rules for the instrument.
    async fn instrument_rules(&self, symbol: &str) -> EngineResult<InstrumentRules>;

    /// Quantizes a price to the instrument tick size. Venues reject orders
    /// that violate tick rules, so every price passes through here before
    /// submission.
    async fn format_price(&self, symbol: &str, price: f64) -> EngineResult<f64> {
        Ok(self.instrument_rules(symbol).await?.round_price(price))
    }

    /// Quantizes a quantity to the instrument step size.
    async fn format_quantity(&self, symbol: &str, quantity: f64) -> EngineResult<f64> {
        Ok(self.instrument_rules(symbol).await?.round_quantity(quantity))
    }
}
