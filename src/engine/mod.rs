//! The grid reconciliation engine.
//!
//! Owns the mapping between grid levels and live exchange orders. Each tick
//! it polls the exchange, diffs the open-order set against its resident
//! maps, treats vanished orders as fills, books profit, places compensating
//! orders one grid step away, and persists state. Re-centers the whole grid
//! when the price drifts out of range.

use crate::config::GridConfig;
use crate::constants::{
    ADJUST_INTERVAL, BALANCE_LOG_INTERVAL, BALANCE_SAFETY_FACTOR, MAX_CONSECUTIVE_FAILURES,
    MAX_WIDTH_PCT, MIN_WIDTH_PCT, POLL_INTERVAL, PRICE_HISTORY_CAPACITY, PROFIT_EPSILON,
    RANGE_BUFFER, RECENTER_MARGIN, SETUP_RETRY_ATTEMPTS, SETUP_RETRY_BASE_DELAY,
    STATE_HEARTBEAT_INTERVAL, VOLATILITY_THRESHOLD_PCT, VOLATILITY_WINDOW,
};
use crate::error::{EngineError, EngineResult};
use crate::exchange::ExchangePort;
use crate::grid::levels;
use crate::grid::orders::{ResidentOrders, RestingOrder};
use crate::logging::trade_audit::TradeAuditLogger;
use crate::model::{InstrumentRules, OrderSide, Trade};
use crate::risk::{self, RiskHook};
use crate::state::{PersistedState, StateStore};
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Grid lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Active,
    Recentering,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Uninitialized => "UNINITIALIZED",
            EngineState::Active => "ACTIVE",
            EngineState::Recentering => "RECENTERING",
            EngineState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// Read-only view of the engine published after each tick. Observers tolerate
/// staleness up to one poll interval.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub state: EngineState,
    pub lower_price: f64,
    pub upper_price: f64,
    pub grid_size: f64,
    pub buy_orders: usize,
    pub sell_orders: usize,
    pub total_profit: f64,
    pub last_price: Option<f64>,
    pub trade_count: usize,
}

/// Cloneable accessor observers hold instead of a reference to the engine.
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<RwLock<EngineSnapshot>>,
}

impl StatusHandle {
    pub async fn read(&self) -> EngineSnapshot {
        self.inner.read().await.clone()
    }
}

pub struct ReconciliationEngine {
    config: GridConfig,
    exchange: Arc<dyn ExchangePort>,
    risk: Arc<dyn RiskHook>,
    store: StateStore,
    audit: Option<TradeAuditLogger>,
    rules: InstrumentRules,

    state: EngineState,
    lower_price: f64,
    upper_price: f64,
    grid_size: f64,
    /// Effective per-level quantity; may be scaled below the configured
    /// value when free balance cannot cover the full grid.
    quantity: f64,

    residents: ResidentOrders,
    trades: Vec<Trade>,
    total_profit: f64,
    last_price: Option<f64>,
    /// Reference price for the overall stop loss, captured at first setup.
    initial_price: Option<f64>,
    price_history: VecDeque<f64>,

    consecutive_failures: u32,
    snapshot: Arc<RwLock<EngineSnapshot>>,
}

impl ReconciliationEngine {
    /// Builds the engine and restores durable state. The ledger is
    /// reconciled against the persisted running total; when they disagree
    /// beyond the epsilon the recomputed sum wins and is re-persisted.
    pub async fn new(
        config: GridConfig,
        exchange: Arc<dyn ExchangePort>,
        risk: Arc<dyn RiskHook>,
        store: StateStore,
        audit: Option<TradeAuditLogger>,
    ) -> EngineResult<Self> {
        // Fails fast on a degenerate range before touching the exchange.
        levels::generate_levels(config.lower_price, config.upper_price, config.grid_count)?;

        let rules = exchange.instrument_rules(&config.symbol).await?;

        let mut trades = Vec::new();
        let mut total_profit = 0.0;
        let mut last_price = None;
        let mut needs_repersist = false;

        if let Some(persisted) = store.load(&config.symbol)? {
            let ledger_total = persisted.ledger_total();
            total_profit = persisted.total_profit;
            if (ledger_total - persisted.total_profit).abs() > PROFIT_EPSILON {
                warn!(
                    "Persisted total profit {:.4} disagrees with ledger sum {:.4}; ledger wins",
                    persisted.total_profit, ledger_total
                );
                total_profit = ledger_total;
                needs_repersist = true;
            }
            trades = persisted.trades;
            last_price = persisted.last_price;
        }

        let grid_size = config.grid_size();
        let snapshot = EngineSnapshot {
            state: EngineState::Uninitialized,
            lower_price: config.lower_price,
            upper_price: config.upper_price,
            grid_size,
            buy_orders: 0,
            sell_orders: 0,
            total_profit,
            last_price,
            trade_count: trades.len(),
        };

        let engine = Self {
            lower_price: config.lower_price,
            upper_price: config.upper_price,
            grid_size,
            quantity: config.quantity,
            residents: ResidentOrders::new(rules.tick_size),
            trades,
            total_profit,
            last_price,
            initial_price: None,
            price_history: VecDeque::with_capacity(PRICE_HISTORY_CAPACITY),
            consecutive_failures: 0,
            snapshot: Arc::new(RwLock::new(snapshot)),
            state: EngineState::Uninitialized,
            config,
            exchange,
            risk,
            store,
            audit,
            rules,
        };

        if needs_repersist {
            engine.persist()?;
        }

        Ok(engine)
    }

    pub fn status(&self) -> StatusHandle {
        StatusHandle {
            inner: self.snapshot.clone(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn total_profit(&self) -> f64 {
        self.total_profit
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.lower_price, self.upper_price)
    }

    pub fn resident_counts(&self) -> (usize, usize) {
        (self.residents.buy_count(), self.residents.sell_count())
    }

    /// Derives levels around the current price and places one resting limit
    /// order per level. Cancels every pre-existing open order first, so a
    /// restart never leaves orphaned orders behind.
    pub async fn setup_grid(&mut self) -> EngineResult<()> {
        info!("[GRID] Setting up grid orders for {}", self.config.symbol);

        let current_price = self.exchange.get_price(&self.config.symbol).await?;
        self.record_price(current_price);
        if self.initial_price.is_none() {
            self.initial_price = Some(current_price);
        }

        if levels::is_outside(current_price, self.lower_price, self.upper_price, RANGE_BUFFER) {
            let (lower, upper) = levels::recenter(current_price, RECENTER_MARGIN);
            info!(
                "[GRID] Price {:.6} outside range [{:.6}, {:.6}]; re-deriving bounds to [{:.6}, {:.6}]",
                current_price, self.lower_price, self.upper_price, lower, upper
            );
            self.set_bounds(lower, upper);
        }

        risk::is_volatile(&self.volatility_window(), VOLATILITY_THRESHOLD_PCT);

        let grid_prices =
            levels::generate_levels(self.lower_price, self.upper_price, self.config.grid_count)?;

        // Levels landing exactly on the current price have no unambiguous
        // side; they are skipped.
        let current_tick = self.rules.price_tick(current_price);
        let mut buy_levels = Vec::new();
        let mut sell_levels = Vec::new();
        for price in grid_prices {
            if self.rules.price_tick(price) == current_tick {
                debug!("[GRID] Skipping level {:.6} at the current price", price);
                continue;
            }
            if price < current_price {
                buy_levels.push(price);
            } else {
                sell_levels.push(price);
            }
        }

        self.quantity = self
            .size_orders_to_balance(current_price, &buy_levels, &sell_levels)
            .await?;

        self.cancel_all_open_orders().await?;
        self.residents.clear();

        let mut buys_placed = 0;
        for price in &buy_levels {
            if self.place_grid_order(OrderSide::Buy, *price).await {
                buys_placed += 1;
            }
        }
        let mut sells_placed = 0;
        for price in &sell_levels {
            if self.place_grid_order(OrderSide::Sell, *price).await {
                sells_placed += 1;
            }
        }

        info!(
            "[GRID] Setup complete. {} buy orders and {} sell orders placed.",
            buys_placed, sells_placed
        );
        self.state = EngineState::Active;
        self.persist()?;
        self.publish_snapshot().await;
        Ok(())
    }

    /// Per-level quantity that the free balances can actually cover. Scales
    /// down against a safety fraction of the free balance, never up; errors
    /// with `MinNotional` when the scaled order would be rejected anyway.
    async fn size_orders_to_balance(
        &self,
        current_price: f64,
        buy_levels: &[f64],
        sell_levels: &[f64],
    ) -> EngineResult<f64> {
        let quote_asset = self.config.quote_asset();
        let base_asset = self.config.base_asset();
        let quote = self.exchange.get_balance(quote_asset).await?;
        let base = self.exchange.get_balance(base_asset).await?;

        info!(
            "[BALANCE] {}: {:.4} (Free) + {:.4} (Locked) | {}: {:.4} (Free) + {:.4} (Locked)",
            quote_asset, quote.free, quote.locked, base_asset, base.free, base.locked
        );

        let mut quantity = self.config.quantity;
        let required_base = quantity * sell_levels.len() as f64;
        let buy_price_sum: f64 = buy_levels.iter().sum();
        let required_quote = buy_price_sum * quantity;

        info!(
            "[REQUIREMENT] Need {:.4} {} for {} buy orders, {:.4} {} for {} sell orders (price {:.6})",
            required_quote,
            quote_asset,
            buy_levels.len(),
            required_base,
            base_asset,
            sell_levels.len(),
            current_price
        );

        if !sell_levels.is_empty() && base.free < required_base {
            let scaled = base.free * BALANCE_SAFETY_FACTOR / sell_levels.len() as f64;
            if scaled > 0.0 && scaled < quantity {
                warn!(
                    "Insufficient {} balance. Adjusting quantity from {:.4} to {:.4}",
                    base_asset, quantity, scaled
                );
                quantity = scaled;
            }
        }

        if !buy_levels.is_empty() {
            let required_quote = buy_price_sum * quantity;
            if quote.free < required_quote {
                let scaled = quote.free * BALANCE_SAFETY_FACTOR / buy_price_sum;
                if scaled > 0.0 && scaled < quantity {
                    warn!(
                        "Insufficient {} balance. Adjusting quantity to {:.4}",
                        quote_asset, scaled
                    );
                    quantity = scaled;
                }
            }
        }

        let quantity = self
            .exchange
            .format_quantity(&self.config.symbol, quantity)
            .await?;

        if let Some(&lowest) = buy_levels.first().or_else(|| sell_levels.first()) {
            let notional = lowest * quantity;
            if notional < self.rules.min_notional {
                error!(
                    "[GRID] Scaled order notional {:.4} is below the exchange minimum {:.4}; aborting setup",
                    notional, self.rules.min_notional
                );
                return Err(EngineError::MinNotional {
                    notional,
                    min_notional: self.rules.min_notional,
                });
            }
        }

        Ok(quantity)
    }

    /// One reconciliation tick: refresh the price, diff resident orders
    /// against the live open set, process fills, then run the stop-loss
    /// check.
    pub async fn check_filled_orders(&mut self) -> EngineResult<()> {
        if self.state != EngineState::Active {
            return Ok(());
        }

        // Price is recorded before anything else so the history advances
        // even when the open-orders fetch below fails.
        let current_price = self.exchange.get_price(&self.config.symbol).await?;
        self.record_price(current_price);

        let open_orders = self.exchange.get_open_orders(&self.config.symbol).await?;
        let open_ids: HashSet<u64> = open_orders.iter().map(|o| o.order_id).collect();

        for (side, order) in self.residents.take_filled(&open_ids) {
            self.handle_fill(side, order).await?;
        }

        if let Some(reference_price) = self.initial_price {
            if self.risk.check_stop_loss(reference_price).await? {
                error!("[RISK] Overall stop loss triggered! Halting engine.");
                self.risk.execute_emergency_exit().await?;
                self.residents.clear();
                self.state = EngineState::Stopped;
                self.persist()?;
            }
        }

        self.publish_snapshot().await;
        Ok(())
    }

    /// Books a detected fill and answers it with a compensating order one
    /// grid step away on the opposite side. Profit is realized on the sell
    /// leg only, one grid step per round trip: the engine does not track
    /// which buy funded which sell, so the reference price is the level one
    /// step down, not the historical entry.
    async fn handle_fill(&mut self, side: OrderSide, order: RestingOrder) -> EngineResult<()> {
        let counterpart = match side {
            OrderSide::Buy => levels::next_level_up(order.price, self.grid_size),
            OrderSide::Sell => levels::next_level_down(order.price, self.grid_size),
        };
        let profit = match side {
            OrderSide::Buy => 0.0,
            OrderSide::Sell => (order.price - counterpart) * order.quantity,
        };

        info!(
            "[RECONCILE] {} order at {:.6} filled. Profit: {:.4}. Total profit: {:.4}",
            side,
            order.price,
            profit,
            self.total_profit + profit
        );

        if let Some(audit) = &self.audit {
            audit.log_fill(
                &self.config.symbol,
                side.as_str(),
                order.price,
                order.quantity,
                order.order_id,
                profit,
            );
        }
        self.append_trade(side, order.price, order.quantity, counterpart, profit);

        if self.residents.occupies(counterpart) {
            warn!(
                "[RECONCILE] Level {:.6} already holds a resting order; skipping compensating {}",
                counterpart,
                side.opposite()
            );
        } else if self.reorder_allowed().await {
            self.place_grid_order(side.opposite(), counterpart).await;
        } else {
            warn!(
                "[RISK] Investment limit reached. Leaving level {:.6} uncovered.",
                counterpart
            );
        }

        self.persist()?;
        Ok(())
    }

    /// Re-centers the grid when the price has left the range, sits within
    /// one step of an edge, or the width has drifted outside the accepted
    /// band. The whole grid is replaced; unfilled resting orders are
    /// discarded (unrealized value only).
    pub async fn adjust_grid(&mut self) -> EngineResult<()> {
        match self.state {
            EngineState::Uninitialized | EngineState::Stopped => return Ok(()),
            EngineState::Recentering => {
                // A previous pass failed mid-replacement; finish it.
                return self.recenter_and_rebuild().await;
            }
            EngineState::Active => {}
        }

        let current_price = self.exchange.get_price(&self.config.symbol).await?;
        self.record_price(current_price);

        let outside =
            levels::is_outside(current_price, self.lower_price, self.upper_price, RANGE_BUFFER);
        let near_edge = current_price < self.lower_price + self.grid_size
            || current_price > self.upper_price - self.grid_size;
        let width = levels::width_pct(self.lower_price, self.upper_price, current_price);
        let width_out = width < MIN_WIDTH_PCT || width > MAX_WIDTH_PCT;

        if !(outside || near_edge || width_out) {
            info!(
                "[GRID] Status: {} buy orders, {} sell orders, range [{:.6}, {:.6}], price {:.6}",
                self.residents.buy_count(),
                self.residents.sell_count(),
                self.lower_price,
                self.upper_price,
                current_price
            );
            return Ok(());
        }

        info!(
            "[GRID] Adjusting grid. Price: {:.6}, range [{:.6}, {:.6}], width {:.2}%",
            current_price, self.lower_price, self.upper_price, width
        );
        self.state = EngineState::Recentering;
        self.recenter_and_rebuild().await
    }

    async fn recenter_and_rebuild(&mut self) -> EngineResult<()> {
        let current_price = self.exchange.get_price(&self.config.symbol).await?;

        self.cancel_all_open_orders().await?;
        self.residents.clear();

        let (lower, upper) = levels::recenter(current_price, RECENTER_MARGIN);
        self.set_bounds(lower, upper);
        self.quantity = self.config.quantity;
        info!(
            "[GRID] New grid range: {:.6} - {:.6}",
            self.lower_price, self.upper_price
        );

        // setup_grid flips the state back to Active and persists.
        self.setup_grid().await
    }

    /// Main loop: poll ticks, adjustment gate, heartbeat saves, balance
    /// logs, and the shutdown signal, multiplexed in one task. Always ends
    /// with a best-effort cancellation sweep, including when the initial
    /// setup fails after orders were already placed.
    pub async fn run(&mut self) -> EngineResult<()> {
        info!("Engine started for {}.", self.config.symbol);

        let result = match self.setup_with_backoff().await {
            Ok(()) => self.run_loop().await,
            Err(e) => Err(e),
        };

        self.shutdown_sweep().await;
        self.state = EngineState::Stopped;
        if let Err(e) = self.persist() {
            warn!("Final state save failed: {}", e);
        }
        self.publish_snapshot().await;
        info!(
            "Engine stopped. Total profit: {:.4} {}",
            self.total_profit,
            self.config.quote_asset()
        );
        result
    }

    async fn run_loop(&mut self) -> EngineResult<()> {
        let mut poll_timer = tokio::time::interval(POLL_INTERVAL);
        let mut adjust_timer = tokio::time::interval(ADJUST_INTERVAL);
        let mut heartbeat_timer = tokio::time::interval(STATE_HEARTBEAT_INTERVAL);
        let mut balance_timer = tokio::time::interval(BALANCE_LOG_INTERVAL);
        // Intervals fire immediately on the first tick; consume those.
        poll_timer.tick().await;
        adjust_timer.tick().await;
        heartbeat_timer.tick().await;
        balance_timer.tick().await;

        loop {
            tokio::select! {
                _ = poll_timer.tick() => {
                    if let Err(e) = self.tick_once().await {
                        break Err(e);
                    }
                }
                _ = adjust_timer.tick() => {
                    match self.adjust_grid().await {
                        Ok(()) => {}
                        Err(e @ EngineError::MinNotional { .. }) => {
                            error!("[GRID] Aborting adjustment pass: {}", e);
                        }
                        Err(e) if e.is_transient() => {
                            warn!("[GRID] Adjustment failed, retrying at the next gate: {}", e);
                        }
                        Err(e) => break Err(e),
                    }
                }
                _ = heartbeat_timer.tick() => {
                    if let Err(e) = self.persist() {
                        warn!("Heartbeat state save failed: {}", e);
                    }
                }
                _ = balance_timer.tick() => {
                    self.log_balances().await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received. Stopping engine...");
                    break Ok(());
                }
            }

            if self.state == EngineState::Stopped {
                info!("Engine halted by emergency exit.");
                break Ok(());
            }
        }
    }

    /// One scheduled reconciliation tick. Transient failures are tolerated
    /// up to the consecutive cap, then escalated; any successful tick
    /// resets the counter.
    async fn tick_once(&mut self) -> EngineResult<()> {
        match self.check_filled_orders().await {
            Ok(()) => {
                self.consecutive_failures = 0;
                Ok(())
            }
            Err(e) if e.is_transient() => {
                self.consecutive_failures += 1;
                warn!(
                    "[RECONCILE] Tick failed ({}/{}): {}",
                    self.consecutive_failures, MAX_CONSECUTIVE_FAILURES, e
                );
                if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    error!("Too many consecutive failed ticks, stopping engine");
                    return Err(e);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Initial setup with bounded exponential backoff on transient errors
    /// (the exchange may simply have no price yet).
    async fn setup_with_backoff(&mut self) -> EngineResult<()> {
        let mut delay = SETUP_RETRY_BASE_DELAY;
        let mut attempt = 0;
        loop {
            match self.setup_grid().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt + 1 < SETUP_RETRY_ATTEMPTS => {
                    attempt += 1;
                    warn!(
                        "Grid setup attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt, SETUP_RETRY_ATTEMPTS, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Best-effort sweep on the way out: cancel whatever is still open so
    /// the exchange is not left with orders nothing tracks. Never retried.
    async fn shutdown_sweep(&mut self) {
        info!("Cancelling open orders before shutdown...");
        match self.exchange.get_open_orders(&self.config.symbol).await {
            Ok(open_orders) => {
                let mut cancelled = 0;
                for order in &open_orders {
                    match self
                        .exchange
                        .cancel_order(order.order_id, &self.config.symbol)
                        .await
                    {
                        Ok(()) => cancelled += 1,
                        Err(e) => warn!(
                            "Failed to cancel order {} during shutdown: {}",
                            order.order_id, e
                        ),
                    }
                }
                info!("Cancelled {}/{} open orders", cancelled, open_orders.len());
            }
            Err(e) => warn!("Could not list open orders for the shutdown sweep: {}", e),
        }
        self.residents.clear();
    }

    async fn cancel_all_open_orders(&mut self) -> EngineResult<()> {
        let open_orders = self.exchange.get_open_orders(&self.config.symbol).await?;
        if open_orders.is_empty() {
            return Ok(());
        }
        for order in &open_orders {
            if let Err(e) = self
                .exchange
                .cancel_order(order.order_id, &self.config.symbol)
                .await
            {
                warn!("[GRID] Failed to cancel order {}: {}", order.order_id, e);
            }
        }
        info!("[GRID] Cancelled {} existing orders", open_orders.len());
        Ok(())
    }

    /// Places one grid order; failures are logged and swallowed so one bad
    /// level never aborts the rest of the pass.
    async fn place_grid_order(&mut self, side: OrderSide, price: f64) -> bool {
        let price = match self.exchange.format_price(&self.config.symbol, price).await {
            Ok(price) => price,
            Err(e) => {
                warn!("[GRID] Could not format price {:.6}: {}", price, e);
                return false;
            }
        };

        let client_id = Uuid::new_v4();
        if let Some(audit) = &self.audit {
            audit.log_request(
                &self.config.symbol,
                side.as_str(),
                price,
                self.quantity,
                Some(client_id),
            );
        }

        match self
            .exchange
            .place_limit_order(
                &self.config.symbol,
                side,
                self.quantity,
                price,
                Some(client_id),
            )
            .await
        {
            Ok(order) => {
                debug!(
                    "[GRID] Placed {} {:.4} at {:.6} (order {})",
                    side, order.quantity, order.price, order.order_id
                );
                self.residents.insert(
                    side,
                    RestingOrder {
                        order_id: order.order_id,
                        price: order.price,
                        quantity: order.quantity,
                    },
                );
                true
            }
            Err(e) => {
                warn!(
                    "[GRID] Failed to place {} order at {:.6}: {}",
                    side, price, e
                );
                false
            }
        }
    }

    async fn reorder_allowed(&self) -> bool {
        match self.risk.check_investment_limit().await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!("[RISK] Investment limit check failed: {}", e);
                false
            }
        }
    }

    fn append_trade(
        &mut self,
        side: OrderSide,
        price: f64,
        quantity: f64,
        counterpart_price: f64,
        realized_profit: f64,
    ) {
        self.total_profit += realized_profit;
        self.trades.push(Trade {
            timestamp: Utc::now().to_rfc3339(),
            side,
            price,
            quantity,
            counterpart_price,
            realized_profit,
            running_total_profit: self.total_profit,
        });
    }

    fn record_price(&mut self, price: f64) {
        self.last_price = Some(price);
        if self.price_history.len() == PRICE_HISTORY_CAPACITY {
            self.price_history.pop_front();
        }
        self.price_history.push_back(price);
    }

    fn volatility_window(&self) -> Vec<f64> {
        self.price_history
            .iter()
            .rev()
            .take(VOLATILITY_WINDOW)
            .copied()
            .collect()
    }

    fn persist(&self) -> EngineResult<()> {
        let state = PersistedState {
            total_profit: self.total_profit,
            trades: self.trades.clone(),
            last_update: Utc::now().to_rfc3339(),
            price_range: [self.lower_price, self.upper_price],
            grid_number: self.config.grid_count,
            last_price: self.last_price,
        };
        self.store.save(&self.config.symbol, &state)
    }

    fn set_bounds(&mut self, lower: f64, upper: f64) {
        self.lower_price = lower;
        self.upper_price = upper;
        self.grid_size = (upper - lower) / self.config.grid_count as f64;
    }

    async fn log_balances(&self) {
        for asset in [self.config.quote_asset(), self.config.base_asset()] {
            match self.exchange.get_balance(asset).await {
                Ok(balance) => info!(
                    "[BALANCE] {}: {:.4} (Free) + {:.4} (Locked)",
                    asset, balance.free, balance.locked
                ),
                Err(e) => warn!("[BALANCE] Could not fetch {} balance: {}", asset, e),
            }
        }
    }

    async fn publish_snapshot(&self) {
        let mut snapshot = self.snapshot.write().await;
        *snapshot = EngineSnapshot {
            state: self.state,
            lower_price: self.lower_price,
            upper_price: self.upper_price,
            grid_size: self.grid_size,
            buy_orders: self.residents.buy_count(),
            sell_orders: self.residents.sell_count(),
            total_profit: self.total_profit,
            last_price: self.last_price,
            trade_count: self.trades.len(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PaperConfig;
    use crate::exchange::paper::PaperExchange;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::{tempdir, TempDir};

    struct StubRisk {
        allow_investment: AtomicBool,
        stop_loss: AtomicBool,
    }

    impl StubRisk {
        fn new() -> Self {
            Self {
                allow_investment: AtomicBool::new(true),
                stop_loss: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl RiskHook for StubRisk {
        async fn check_investment_limit(&self) -> EngineResult<bool> {
            Ok(self.allow_investment.load(Ordering::SeqCst))
        }

        async fn check_stop_loss(&self, _reference_price: f64) -> EngineResult<bool> {
            Ok(self.stop_loss.load(Ordering::SeqCst))
        }

        async fn execute_emergency_exit(&self) -> EngineResult<bool> {
            Ok(true)
        }
    }

    fn test_config(state_dir: &str) -> GridConfig {
        GridConfig {
            symbol: "ADAUSDT".to_string(),
            lower_price: 0.79,
            upper_price: 0.81,
            grid_count: 4,
            quantity: 1.0,
            max_investment: 1000.0,
            stop_loss_pct: 5.0,
            state_dir: state_dir.to_string(),
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

    async fn build_engine(
        price: f64,
        quote: f64,
        base: f64,
    ) -> (
        ReconciliationEngine,
        Arc<PaperExchange>,
        Arc<StubRisk>,
        TempDir,
    ) {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().to_str().unwrap());
        let exchange = Arc::new(PaperExchange::new("ADA", "USDT", rules(), price));
        exchange.deposit("USDT", quote).await;
        exchange.deposit("ADA", base).await;
        let risk = Arc::new(StubRisk::new());
        let store = StateStore::new(dir.path());
        let engine = ReconciliationEngine::new(
            config,
            exchange.clone(),
            risk.clone(),
            store,
            None,
        )
        .await
        .unwrap();
        (engine, exchange, risk, dir)
    }

    fn assert_ledger_consistent(engine: &ReconciliationEngine) {
        let ledger: f64 = engine.trades.iter().map(|t| t.realized_profit).sum();
        assert!(
            (ledger - engine.total_profit).abs() < 1e-12,
            "ledger {} != total {}",
            ledger,
            engine.total_profit
        );
        assert!(engine.residents.sides_disjoint());
    }

    #[tokio::test]
    async fn test_setup_partitions_levels_around_price() {
        let (mut engine, _ex, _risk, _dir) = build_engine(0.80, 100.0, 100.0).await;
        engine.setup_grid().await.unwrap();

        // Levels 0.79, 0.795, 0.80, 0.805, 0.81; the one at the price is
        // skipped.
        assert_eq!(engine.resident_counts(), (2, 2));
        assert_eq!(engine.state(), EngineState::Active);
        assert_ledger_consistent(&engine);
    }

    #[tokio::test]
    async fn test_buy_fill_places_sell_with_zero_profit() {
        let (mut engine, exchange, _risk, _dir) = build_engine(0.80, 100.0, 100.0).await;
        engine.setup_grid().await.unwrap();

        // Cross the buy at 0.795 without reaching 0.79.
        exchange.set_price(0.7945).await;
        engine.check_filled_orders().await.unwrap();

        assert_eq!(engine.resident_counts(), (1, 3));
        let trade = engine.trades().last().unwrap();
        assert_eq!(trade.side, OrderSide::Buy);
        assert!((trade.price - 0.795).abs() < 1e-9);
        assert!((trade.counterpart_price - 0.800).abs() < 1e-9);
        assert_eq!(trade.realized_profit, 0.0);
        assert_eq!(engine.total_profit(), 0.0);
        assert_ledger_consistent(&engine);
    }

    #[tokio::test]
    async fn test_sell_fill_realizes_one_grid_step() {
        let (mut engine, exchange, _risk, _dir) = build_engine(0.80, 100.0, 100.0).await;
        engine.setup_grid().await.unwrap();

        exchange.set_price(0.7945).await;
        engine.check_filled_orders().await.unwrap();

        // The compensating sell at 0.800 fills.
        exchange.set_price(0.8005).await;
        engine.check_filled_orders().await.unwrap();

        let trade = engine.trades().last().unwrap();
        assert_eq!(trade.side, OrderSide::Sell);
        assert!((trade.price - 0.800).abs() < 1e-9);
        assert!((trade.counterpart_price - 0.795).abs() < 1e-9);
        assert!((trade.realized_profit - 0.005).abs() < 1e-9);
        assert!((engine.total_profit() - 0.005).abs() < 1e-9);
        // The round trip restored a buy at 0.795.
        assert_eq!(engine.resident_counts(), (2, 2));
        assert_ledger_consistent(&engine);
    }

    #[tokio::test]
    async fn test_investment_limit_blocks_compensating_order() {
        let (mut engine, exchange, risk, _dir) = build_engine(0.80, 100.0, 100.0).await;
        engine.setup_grid().await.unwrap();

        risk.allow_investment.store(false, Ordering::SeqCst);
        exchange.set_price(0.7945).await;
        engine.check_filled_orders().await.unwrap();

        // Fill recorded, but no sell was placed for it.
        assert_eq!(engine.resident_counts(), (1, 2));
        assert_eq!(engine.trades().len(), 1);
        assert_ledger_consistent(&engine);
    }

    #[tokio::test]
    async fn test_setup_cancels_preexisting_orders() {
        let (mut engine, exchange, _risk, _dir) = build_engine(0.80, 100.0, 100.0).await;

        let stale = exchange
            .place_limit_order("ADAUSDT", OrderSide::Buy, 1.0, 0.78, None)
            .await
            .unwrap();

        engine.setup_grid().await.unwrap();

        let open = exchange.get_open_orders("ADAUSDT").await.unwrap();
        assert!(open.iter().all(|o| o.order_id != stale.order_id));
        assert_eq!(open.len(), 4);
    }

    #[tokio::test]
    async fn test_profit_reconciliation_prefers_ledger() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().to_str().unwrap());
        let store = StateStore::new(dir.path());

        let drifted = PersistedState {
            total_profit: 99.0,
            trades: vec![Trade {
                timestamp: "2024-05-01T11:00:00Z".to_string(),
                side: OrderSide::Sell,
                price: 0.800,
                quantity: 13.0,
                counterpart_price: 0.795,
                realized_profit: 0.065,
                running_total_profit: 0.065,
            }],
            last_update: "2024-05-01T11:00:00Z".to_string(),
            price_range: [0.79, 0.81],
            grid_number: 4,
            last_price: Some(0.80),
        };
        store.save("ADAUSDT", &drifted).unwrap();

        let exchange = Arc::new(PaperExchange::new("ADA", "USDT", rules(), 0.80));
        let engine = ReconciliationEngine::new(
            config,
            exchange,
            Arc::new(StubRisk::new()),
            StateStore::new(dir.path()),
            None,
        )
        .await
        .unwrap();

        assert!((engine.total_profit() - 0.065).abs() < 1e-9);

        // The corrected total was re-persisted.
        let reloaded = StateStore::new(dir.path()).load("ADAUSDT").unwrap().unwrap();
        assert!((reloaded.total_profit - 0.065).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_quantity_scales_down_to_free_balance() {
        // 2 buy levels need (0.79 + 0.795) * 1.0 = 1.585 quote; only 0.8
        // free, so the quantity scales to 0.8 * 0.95 / 1.585 ~= 0.479,
        // floored to the 0.01 lot step.
        let (mut engine, _ex, _risk, _dir) = build_engine(0.80, 0.8, 100.0).await;
        engine.setup_grid().await.unwrap();

        assert!((engine.quantity - 0.47).abs() < 1e-9);
        assert_eq!(engine.resident_counts(), (2, 2));
    }

    #[tokio::test]
    async fn test_min_notional_aborts_setup() {
        // Scaled quantity floors to 0.02; notional 0.02 * 0.79 < 0.1.
        let (mut engine, _ex, _risk, _dir) = build_engine(0.80, 0.05, 100.0).await;
        let err = engine.setup_grid().await.unwrap_err();
        assert!(matches!(err, EngineError::MinNotional { .. }));
        assert_eq!(engine.state(), EngineState::Uninitialized);
    }

    #[tokio::test]
    async fn test_stop_loss_halts_engine() {
        let (mut engine, _ex, risk, _dir) = build_engine(0.80, 100.0, 100.0).await;
        engine.setup_grid().await.unwrap();

        risk.stop_loss.store(true, Ordering::SeqCst);
        engine.check_filled_orders().await.unwrap();

        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(engine.resident_counts(), (0, 0));
    }

    #[tokio::test]
    async fn test_adjust_recenters_when_price_leaves_range() {
        let (mut engine, exchange, _risk, _dir) = build_engine(0.80, 100.0, 100.0).await;
        engine.setup_grid().await.unwrap();

        exchange.set_price(0.85).await;
        engine.adjust_grid().await.unwrap();

        let (lower, upper) = engine.bounds();
        assert!((lower - 0.85 * 0.98).abs() < 1e-9);
        assert!((upper - 0.85 * 1.02).abs() < 1e-9);
        assert_eq!(engine.state(), EngineState::Active);
        assert_ledger_consistent(&engine);

        // No order from the old grid survives.
        let open = exchange.get_open_orders("ADAUSDT").await.unwrap();
        for order in open {
            assert!(order.price >= lower - 1e-9 && order.price <= upper + 1e-9);
        }
    }

    #[tokio::test]
    async fn test_adjust_holds_inside_band() {
        let (mut engine, exchange, _risk, _dir) = build_engine(0.80, 100.0, 100.0).await;
        engine.setup_grid().await.unwrap();
        let before = engine.bounds();

        // Recenter once so the width (4% of price) sits inside the band
        // and the price is dead center.
        exchange.set_price(0.85).await;
        engine.adjust_grid().await.unwrap();
        let after_recenter = engine.bounds();
        assert_ne!(before, after_recenter);

        // Centered price, width in band: no trigger.
        engine.adjust_grid().await.unwrap();
        assert_eq!(engine.bounds(), after_recenter);
    }

    #[tokio::test]
    async fn test_transient_tick_failure_skips_tick() {
        let (mut engine, exchange, _risk, _dir) = build_engine(0.80, 100.0, 100.0).await;
        engine.setup_grid().await.unwrap();

        exchange.set_fail_price(true);
        let err = engine.check_filled_orders().await.unwrap_err();
        assert!(err.is_transient());

        // Nothing was lost; the next tick proceeds normally.
        exchange.set_fail_price(false);
        engine.check_filled_orders().await.unwrap();
        assert_eq!(engine.resident_counts(), (2, 2));
    }

    #[tokio::test]
    async fn test_failed_setup_sweeps_placed_orders() {
        let (mut engine, exchange, _risk, dir) = build_engine(0.80, 100.0, 100.0).await;

        // A directory squatting on the save temp path makes every state
        // write fail after the grid orders are already resting.
        std::fs::create_dir(dir.path().join("grid_state_ADAUSDT.json.tmp")).unwrap();

        let err = engine.run().await.unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(exchange.open_order_count().await, 0);
        assert_eq!(engine.resident_counts(), (0, 0));
    }

    #[tokio::test]
    async fn test_consecutive_failures_escalate_at_cap() {
        let (mut engine, exchange, _risk, _dir) = build_engine(0.80, 100.0, 100.0).await;
        engine.setup_grid().await.unwrap();

        exchange.set_fail_price(true);
        for _ in 0..MAX_CONSECUTIVE_FAILURES - 1 {
            engine.tick_once().await.unwrap();
        }

        // A success in between resets the counter.
        exchange.set_fail_price(false);
        engine.tick_once().await.unwrap();

        exchange.set_fail_price(true);
        for _ in 0..MAX_CONSECUTIVE_FAILURES - 1 {
            engine.tick_once().await.unwrap();
        }
        let err = engine.tick_once().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_compensating_order_skips_occupied_level() {
        // Price between levels: buys rest at 0.79 and 0.795, sells at
        // 0.80, 0.805 and 0.81.
        let (mut engine, exchange, _risk, _dir) = build_engine(0.7975, 100.0, 100.0).await;
        engine.setup_grid().await.unwrap();
        assert_eq!(engine.resident_counts(), (2, 3));

        // The buy at 0.795 fills; its compensating sell would land on the
        // sell already resting at 0.800, so none is placed.
        exchange.set_price(0.7945).await;
        engine.check_filled_orders().await.unwrap();

        assert_eq!(engine.resident_counts(), (1, 3));
        assert_eq!(exchange.open_order_count().await, 4);
        assert_eq!(engine.trades().len(), 1);
        assert_ledger_consistent(&engine);
    }

    #[tokio::test]
    async fn test_snapshot_reflects_engine_state() {
        let (mut engine, _ex, _risk, _dir) = build_engine(0.80, 100.0, 100.0).await;
        let handle = engine.status();
        engine.setup_grid().await.unwrap();

        let snapshot = handle.read().await;
        assert_eq!(snapshot.state, EngineState::Active);
        assert_eq!(snapshot.buy_orders, 2);
        assert_eq!(snapshot.sell_orders, 2);
        assert_eq!(snapshot.total_profit, 0.0);
        assert!(snapshot.last_price.is_some());
    }
}
