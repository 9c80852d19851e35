//! Deterministic paper-trading adapter.
//!
//! Keeps an in-memory book of balances and resting orders with a crossing
//! fill model: a resting buy fills when the price trades at or below its
//! level, a resting sell at or above. The price follows a scripted sequence
//! when one is supplied (tests) or a bounded random walk (paper runs).
//! Doubles as the test double for the engine, with failure injection.

use crate::config::GridConfig;
use crate::error::{EngineError, EngineResult};
use crate::exchange::ExchangePort;
use crate::model::{Balance, InstrumentRules, Order, OrderSide, OrderStatus};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

struct PaperBook {
    price: f64,
    script: VecDeque<f64>,
    balances: HashMap<String, Balance>,
    open_orders: BTreeMap<u64, Order>,
}

pub struct PaperExchange {
    base_asset: String,
    quote_asset: String,
    rules: InstrumentRules,
    book: Mutex<PaperBook>,
    next_oid: AtomicU64,
    fail_orders: AtomicBool,
    fail_price: AtomicBool,
    random_walk: bool,
}

impl PaperExchange {
    pub fn new(base_asset: &str, quote_asset: &str, rules: InstrumentRules, price: f64) -> Self {
        Self {
            base_asset: base_asset.to_string(),
            quote_asset: quote_asset.to_string(),
            rules,
            book: Mutex::new(PaperBook {
                price,
                script: VecDeque::new(),
                balances: HashMap::new(),
                open_orders: BTreeMap::new(),
            }),
            next_oid: AtomicU64::new(1),
            fail_orders: AtomicBool::new(false),
            fail_price: AtomicBool::new(false),
            random_walk: false,
        }
    }

    /// Paper-mode adapter seeded from the config: balances from the
    /// `[paper]` section, price at the configured start or the midpoint of
    /// the grid range, random walk enabled.
    pub fn from_config(config: &GridConfig, rules: InstrumentRules) -> Self {
        let start_price = config
            .paper
            .start_price
            .unwrap_or((config.lower_price + config.upper_price) / 2.0);
        let mut exchange = Self::new(config.base_asset(), config.quote_asset(), rules, start_price);
        exchange.random_walk = true;
        {
            let book = exchange.book.get_mut();
            book.balances.insert(
                config.quote_asset().to_string(),
                Balance {
                    free: config.paper.quote_balance,
                    locked: 0.0,
                },
            );
            book.balances.insert(
                config.base_asset().to_string(),
                Balance {
                    free: config.paper.base_balance,
                    locked: 0.0,
                },
            );
        }
        info!(
            "[PAPER] Seeded {} {} and {} {} at price {:.6}",
            config.paper.quote_balance,
            config.quote_asset(),
            config.paper.base_balance,
            config.base_asset(),
            start_price
        );
        exchange
    }

    pub async fn deposit(&self, asset: &str, amount: f64) {
        let mut book = self.book.lock().await;
        let balance = book.balances.entry(asset.to_string()).or_default();
        balance.free += amount;
    }

    /// Moves the price and settles any resting orders it crosses.
    pub async fn set_price(&self, price: f64) {
        let mut book = self.book.lock().await;
        book.price = price;
        self.cross_fills(&mut book);
    }

    /// Queues prices to be consumed one per `get_price` call.
    pub async fn push_prices(&self, prices: impl IntoIterator<Item = f64>) {
        let mut book = self.book.lock().await;
        book.script.extend(prices);
    }

    /// When set, order placement fails with a transient error.
    pub fn set_fail_orders(&self, fail: bool) {
        self.fail_orders.store(fail, Ordering::SeqCst);
    }

    /// When set, price fetches fail with `PriceUnavailable`.
    pub fn set_fail_price(&self, fail: bool) {
        self.fail_price.store(fail, Ordering::SeqCst);
    }

    pub async fn open_order_count(&self) -> usize {
        self.book.lock().await.open_orders.len()
    }

    fn cross_fills(&self, book: &mut PaperBook) {
        let price = book.price;
        let filled: Vec<u64> = book
            .open_orders
            .iter()
            .filter(|(_, o)| match o.side {
                OrderSide::Buy => price <= o.price,
                OrderSide::Sell => price >= o.price,
            })
            .map(|(oid, _)| *oid)
            .collect();

        for oid in filled {
            if let Some(order) = book.open_orders.remove(&oid) {
                let notional = order.price * order.quantity;
                match order.side {
                    OrderSide::Buy => {
                        let quote = book.balances.entry(self.quote_asset.clone()).or_default();
                        quote.locked -= notional;
                        let base = book.balances.entry(self.base_asset.clone()).or_default();
                        base.free += order.quantity;
                    }
                    OrderSide::Sell => {
                        let base = book.balances.entry(self.base_asset.clone()).or_default();
                        base.locked -= order.quantity;
                        let quote = book.balances.entry(self.quote_asset.clone()).or_default();
                        quote.free += notional;
                    }
                }
                debug!(
                    "[PAPER] Crossed {} order {} at level {:.6} (price {:.6})",
                    order.side, oid, order.price, price
                );
            }
        }
    }
}

#[async_trait]
impl ExchangePort for PaperExchange {
    async fn get_price(&self, _symbol: &str) -> EngineResult<f64> {
        if self.fail_price.load(Ordering::SeqCst) {
            return Err(EngineError::PriceUnavailable {
                symbol: _symbol.to_string(),
            });
        }

        let mut book = self.book.lock().await;
        if let Some(next) = book.script.pop_front() {
            book.price = next;
            self.cross_fills(&mut book);
        } else if self.random_walk {
            let step = rand::thread_rng().gen_range(-0.002..0.002);
            book.price *= 1.0 + step;
            self.cross_fills(&mut book);
        }
        Ok(book.price)
    }

    async fn get_balance(&self, asset: &str) -> EngineResult<Balance> {
        let book = self.book.lock().await;
        Ok(book.balances.get(asset).copied().unwrap_or_default())
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        client_id: Option<Uuid>,
    ) -> EngineResult<Order> {
        if self.fail_orders.load(Ordering::SeqCst) {
            return Err(EngineError::Transient("paper order rejection".to_string()));
        }

        let price = self.rules.round_price(price);
        let quantity = self.rules.round_quantity(quantity);
        let notional = price * quantity;
        if notional < self.rules.min_notional {
            return Err(EngineError::MinNotional {
                notional,
                min_notional: self.rules.min_notional,
            });
        }

        let mut book = self.book.lock().await;
        match side {
            OrderSide::Buy => {
                let quote = book.balances.entry(self.quote_asset.clone()).or_default();
                if quote.free < notional {
                    return Err(EngineError::InsufficientBalance {
                        asset: self.quote_asset.clone(),
                        required: notional,
                        available: quote.free,
                    });
                }
                quote.free -= notional;
                quote.locked += notional;
            }
            OrderSide::Sell => {
                let base = book.balances.entry(self.base_asset.clone()).or_default();
                if base.free < quantity {
                    return Err(EngineError::InsufficientBalance {
                        asset: self.base_asset.clone(),
                        required: quantity,
                        available: base.free,
                    });
                }
                base.free -= quantity;
                base.locked += quantity;
            }
        }

        let order_id = self.next_oid.fetch_add(1, Ordering::SeqCst);
        let order = Order {
            order_id,
            client_id,
            symbol: symbol.to_string(),
            side,
            price,
            quantity,
            status: OrderStatus::New,
        };
        book.open_orders.insert(order_id, order.clone());
        Ok(order)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
    ) -> EngineResult<Order> {
        let quantity = self.rules.round_quantity(quantity);
        let mut book = self.book.lock().await;
        let price = book.price;
        let notional = price * quantity;

        match side {
            OrderSide::Buy => {
                let quote = book.balances.entry(self.quote_asset.clone()).or_default();
                if quote.free < notional {
                    return Err(EngineError::InsufficientBalance {
                        asset: self.quote_asset.clone(),
                        required: notional,
                        available: quote.free,
                    });
                }
                quote.free -= notional;
                let base = book.balances.entry(self.base_asset.clone()).or_default();
                base.free += quantity;
            }
            OrderSide::Sell => {
                let base = book.balances.entry(self.base_asset.clone()).or_default();
                if base.free < quantity {
                    return Err(EngineError::InsufficientBalance {
                        asset: self.base_asset.clone(),
                        required: quantity,
                        available: base.free,
                    });
                }
                base.free -= quantity;
                let quote = book.balances.entry(self.quote_asset.clone()).or_default();
                quote.free += notional;
            }
        }

        let order_id = self.next_oid.fetch_add(1, Ordering::SeqCst);
        Ok(Order {
            order_id,
            client_id: None,
            symbol: symbol.to_string(),
            side,
            price,
            quantity,
            status: OrderStatus::Filled,
        })
    }

    async fn get_open_orders(&self, _symbol: &str) -> EngineResult<Vec<Order>> {
        let book = self.book.lock().await;
        Ok(book.open_orders.values().cloned().collect())
    }

    async fn cancel_order(&self, order_id: u64, _symbol: &str) -> EngineResult<()> {
        let mut book = self.book.lock().await;
        let order = book
            .open_orders
            .remove(&order_id)
            .ok_or(EngineError::OrderNotFound { order_id })?;

        match order.side {
            OrderSide::Buy => {
                let notional = order.price * order.quantity;
                let quote = book.balances.entry(self.quote_asset.clone()).or_default();
                quote.locked -= notional;
                quote.free += notional;
            }
            OrderSide::Sell => {
                let base = book.balances.entry(self.base_asset.clone()).or_default();
                base.locked -= order.quantity;
                base.free += order.quantity;
            }
        }
        Ok(())
    }

    async fn instrument_rules(&self, _symbol: &str) -> EngineResult<InstrumentRules> {
        Ok(self.rules)
    }
}
