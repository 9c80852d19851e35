use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Side of an order or fill.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status an adapter reports for an order.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
}

/// An order as seen at the exchange boundary.
///
/// Adapters populate this from whatever wire shape the venue returns; the
/// engine never touches untyped payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub order_id: u64,
    pub client_id: Option<Uuid>,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub status: OrderStatus,
}

/// Free/locked balance of a single asset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Balance {
    pub free: f64,
    pub locked: f64,
}

impl Balance {
    pub fn total(&self) -> f64 {
        self.free + self.locked
    }
}

/// Tick-size, lot-size, and minimum-notional rules for an instrument.
///
/// Orders violating these are rejected by real venues, so every price and
/// quantity is quantized through here before submission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentRules {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_notional: f64,
}

impl InstrumentRules {
    pub fn round_price(&self, price: f64) -> f64 {
        round_to_increment(price, self.tick_size)
    }

    /// Lot sizes floor rather than round so a quantity sized against a
    /// balance budget never quantizes above it.
    pub fn round_quantity(&self, quantity: f64) -> f64 {
        floor_to_increment(quantity, self.step_size)
    }

    pub fn price_tick(&self, price: f64) -> PriceTick {
        PriceTick::from_price(price, self.tick_size)
    }
}

fn round_to_increment(value: f64, increment: f64) -> f64 {
    if increment <= 0.0 {
        return value;
    }
    (value / increment).round() * increment
}

fn floor_to_increment(value: f64, increment: f64) -> f64 {
    if increment <= 0.0 {
        return value;
    }
    // Nudge before flooring so an exact multiple is not pushed into the
    // bucket below by representation error.
    ((value / increment) + 1e-9).floor() * increment
}

/// A price quantized to a whole number of ticks.
///
/// Map keys for resting orders are ticks, never raw floats, so two prices
/// that the venue would treat as the same level compare equal here too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PriceTick(i64);

impl PriceTick {
    pub fn from_price(price: f64, tick_size: f64) -> Self {
        if tick_size <= 0.0 {
            return PriceTick(0);
        }
        PriceTick((price / tick_size).round() as i64)
    }
}

/// One entry in the append-only trade ledger.
///
/// Field names are part of the on-disk state contract. `realized_profit` is
/// zero for buy fills; sells realize one grid step against
/// `counterpart_price`, the level the compensating order was sent to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub timestamp: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub counterpart_price: f64,
    pub realized_profit: f64,
    pub running_total_profit: f64,
}

/// Represents a percentage spread for markup/markdown calculations.
///
/// 2.0 means 2%.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spread {
    pub value: f64,
}

impl Spread {
    pub const fn new(value: f64) -> Self {
        Self { value }
    }

    /// Returns value * (1 + spread/100)
    pub fn markup(&self, value: f64) -> f64 {
        value * (1.0 + (self.value / 100.0))
    }

    /// Returns value * (1 - spread/100)
    pub fn markdown(&self, value: f64) -> f64 {
        value * (1.0 - (self.value / 100.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spread_markup_markdown() {
        let spread = Spread::new(2.0); // 2%

        let val = 100.0;
        assert!((spread.markup(val) - 102.0).abs() < 1e-10);
        assert!((spread.markdown(val) - 98.0).abs() < 1e-10);
    }

    #[test]
    fn test_price_tick_quantizes_floats() {
        let tick = 0.0001;
        // 0.795 is not exactly representable; the tick key still matches.
        let a = PriceTick::from_price(0.795, tick);
        let b = PriceTick::from_price(0.79 + 0.005, tick);
        assert_eq!(a, b);
    }

    #[test]
    fn test_instrument_rules_rounding() {
        let rules = InstrumentRules {
            tick_size: 0.0001,
            step_size: 0.1,
            min_notional: 10.0,
        };
        assert!((rules.round_price(0.79503) - 0.795).abs() < 1e-12);
        assert!((rules.round_quantity(13.04) - 13.0).abs() < 1e-12);
    }

    #[test]
    fn test_quantity_floors_to_lot_step() {
        let rules = InstrumentRules {
            tick_size: 0.0001,
            step_size: 0.01,
            min_notional: 10.0,
        };
        // A budget-scaled quantity must never quantize upward.
        assert!((rules.round_quantity(0.479) - 0.47).abs() < 1e-12);
        assert!((rules.round_quantity(0.47949) - 0.47).abs() < 1e-12);
        // Exact multiples survive the floor.
        assert!((rules.round_quantity(0.47) - 0.47).abs() < 1e-12);
    }

    #[test]
    fn test_order_side_serde_uppercase() {
        let json = serde_json::to_string(&OrderSide::Buy).unwrap();
        assert_eq!(json, "\"BUY\"");
        let side: OrderSide = serde_json::from_str("\"SELL\"").unwrap();
        assert_eq!(side, OrderSide::Sell);
    }
}
