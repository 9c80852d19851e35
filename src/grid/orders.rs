//! Resident-order bookkeeping: the engine's memory of which exchange order
//! rests at which grid level.

use crate::model::{OrderSide, PriceTick};
use std::collections::{BTreeMap, HashSet};

/// An order the engine believes is resting on the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct RestingOrder {
    pub order_id: u64,
    pub price: f64,
    pub quantity: f64,
}

/// Price-keyed maps of resting buy and sell orders.
///
/// Keys are prices quantized to the instrument tick size; a tick appears in
/// at most one of the two maps at a time. The exchange remains the authority
/// for which orders are actually open; these maps only record what the
/// engine placed and has not yet seen disappear.
#[derive(Debug)]
pub struct ResidentOrders {
    buys: BTreeMap<PriceTick, RestingOrder>,
    sells: BTreeMap<PriceTick, RestingOrder>,
    tick_size: f64,
}

impl ResidentOrders {
    pub fn new(tick_size: f64) -> Self {
        Self {
            buys: BTreeMap::new(),
            sells: BTreeMap::new(),
            tick_size,
        }
    }

    fn tick(&self, price: f64) -> PriceTick {
        PriceTick::from_price(price, self.tick_size)
    }

    /// Records a placed order. Evicts any entry at the same tick on the
    /// opposite side, returning it, so a tick never carries both a buy and
    /// a sell.
    pub fn insert(&mut self, side: OrderSide, order: RestingOrder) -> Option<RestingOrder> {
        let tick = self.tick(order.price);
        match side {
            OrderSide::Buy => {
                let displaced = self.sells.remove(&tick);
                self.buys.insert(tick, order);
                displaced
            }
            OrderSide::Sell => {
                let displaced = self.buys.remove(&tick);
                self.sells.insert(tick, order);
                displaced
            }
        }
    }

    pub fn clear(&mut self) {
        self.buys.clear();
        self.sells.clear();
    }

    pub fn buy_count(&self) -> usize {
        self.buys.len()
    }

    pub fn sell_count(&self) -> usize {
        self.sells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buys.is_empty() && self.sells.is_empty()
    }

    /// Whether any resting order occupies the level at `price`. Gates
    /// compensating placement: a live order already covering the target
    /// level must not be displaced.
    pub fn occupies(&self, price: f64) -> bool {
        let tick = self.tick(price);
        self.buys.contains_key(&tick) || self.sells.contains_key(&tick)
    }

    /// True when no tick appears in both maps. The insert path maintains
    /// this; tests assert it after every mutation sequence.
    pub fn sides_disjoint(&self) -> bool {
        self.buys.keys().all(|t| !self.sells.contains_key(t))
    }

    /// Drains resident orders whose ids are absent from the live open set.
    ///
    /// Absence is the only fill signal this design has; an order cancelled
    /// by an external actor is indistinguishable from a fill here. Buys are
    /// reported before sells, each side in ascending price order.
    pub fn take_filled(&mut self, open_ids: &HashSet<u64>) -> Vec<(OrderSide, RestingOrder)> {
        let mut filled = Vec::new();

        let gone: Vec<PriceTick> = self
            .buys
            .iter()
            .filter(|(_, o)| !open_ids.contains(&o.order_id))
            .map(|(t, _)| *t)
            .collect();
        for tick in gone {
            if let Some(order) = self.buys.remove(&tick) {
                filled.push((OrderSide::Buy, order));
            }
        }

        let gone: Vec<PriceTick> = self
            .sells
            .iter()
            .filter(|(_, o)| !open_ids.contains(&o.order_id))
            .map(|(t, _)| *t)
            .collect();
        for tick in gone {
            if let Some(order) = self.sells.remove(&tick) {
                filled.push((OrderSide::Sell, order));
            }
        }

        filled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: f64 = 0.0001;

    fn resting(order_id: u64, price: f64) -> RestingOrder {
        RestingOrder {
            order_id,
            price,
            quantity: 13.0,
        }
    }

    #[test]
    fn test_insert_and_counts() {
        let mut residents = ResidentOrders::new(TICK);
        residents.insert(OrderSide::Buy, resting(1, 0.79));
        residents.insert(OrderSide::Buy, resting(2, 0.795));
        residents.insert(OrderSide::Sell, resting(3, 0.805));

        assert_eq!(residents.buy_count(), 2);
        assert_eq!(residents.sell_count(), 1);
        assert!(residents.occupies(0.795));
        assert!(!residents.occupies(0.81));
        assert!(residents.sides_disjoint());
    }

    #[test]
    fn test_same_tick_never_on_both_sides() {
        let mut residents = ResidentOrders::new(TICK);
        residents.insert(OrderSide::Buy, resting(1, 0.795));
        let displaced = residents.insert(OrderSide::Sell, resting(2, 0.795));

        assert_eq!(displaced.map(|o| o.order_id), Some(1));
        assert_eq!(residents.buy_count(), 0);
        assert_eq!(residents.sell_count(), 1);
        assert!(residents.sides_disjoint());
    }

    #[test]
    fn test_take_filled_detects_missing_ids() {
        let mut residents = ResidentOrders::new(TICK);
        residents.insert(OrderSide::Buy, resting(1, 0.79));
        residents.insert(OrderSide::Buy, resting(2, 0.795));
        residents.insert(OrderSide::Sell, resting(3, 0.805));

        // Order 2 vanished from the open set: inferred filled.
        let open: HashSet<u64> = [1, 3].into_iter().collect();
        let filled = residents.take_filled(&open);

        assert_eq!(filled.len(), 1);
        assert_eq!(filled[0].0, OrderSide::Buy);
        assert_eq!(filled[0].1.order_id, 2);
        assert_eq!(residents.buy_count(), 1);
        assert_eq!(residents.sell_count(), 1);
    }

    #[test]
    fn test_take_filled_reports_buys_before_sells() {
        let mut residents = ResidentOrders::new(TICK);
        residents.insert(OrderSide::Sell, resting(4, 0.81));
        residents.insert(OrderSide::Buy, resting(5, 0.79));

        let open = HashSet::new();
        let filled = residents.take_filled(&open);
        assert_eq!(filled[0].0, OrderSide::Buy);
        assert_eq!(filled[1].0, OrderSide::Sell);
        assert!(residents.is_empty());
    }

    #[test]
    fn test_float_noise_maps_to_same_level() {
        let mut residents = ResidentOrders::new(TICK);
        residents.insert(OrderSide::Buy, resting(1, 0.79 + 0.005));
        assert!(residents.occupies(0.795));
        assert!(!residents.occupies(0.7951));
    }
}
