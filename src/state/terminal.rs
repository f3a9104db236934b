//! In-memory mirror of remote terminal state.
//!
//! One [`StateData`] exists per server-side replica (instance index), created
//! on the first event from that instance and dropped on stream close. The
//! combined state is the caller-visible projection: it is promoted wholesale
//! from whichever instance most recently completed pending-order
//! synchronization, and thereafter tracks that instance's events.
//!
//! Deletions are remembered as tombstones for five minutes so that stale
//! replays across reconnects cannot resurrect a closed position or order.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use super::hashes::{self, StateHashes};
use crate::error::Error;
use crate::models::{
    AccountInformation, Order, Platform, Position, PositionType, SymbolPrice, SymbolSpecification,
};
use crate::sync::SynchronizationListener;

/// How long a deletion tombstone suppresses stale updates, in minutes.
const TOMBSTONE_TTL_MINUTES: i64 = 5;

/// Mirrored state of one instance (and, structurally, of the combined view).
#[derive(Debug, Clone, Default)]
struct StateData {
    connected: bool,
    connected_to_broker: bool,
    account_information: Option<AccountInformation>,
    positions: Vec<Position>,
    orders: Vec<Order>,
    specifications_by_symbol: HashMap<String, SymbolSpecification>,
    prices_by_symbol: HashMap<String, SymbolPrice>,
    /// Completed order ids with their completion observation time.
    completed_orders: HashMap<String, DateTime<Utc>>,
    /// Removed position ids with their removal observation time.
    removed_positions: HashMap<String, DateTime<Utc>>,
    positions_initialized: bool,
    orders_initialized: bool,
    /// Whether every open position's symbol has a known price.
    prices_initialized: bool,
    last_update_time: Option<DateTime<Utc>>,
}

/// Terminal-state mirror: a deterministic projection of the synchronization
/// event stream, queried synchronously.
pub struct TerminalState {
    instances: RwLock<HashMap<String, StateData>>,
    combined: RwLock<StateData>,
    promoted_instance: RwLock<Option<String>>,
    price_waiters: Mutex<HashMap<String, Vec<oneshot::Sender<SymbolPrice>>>>,
}

impl Default for TerminalState {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalState {
    /// Create an empty mirror.
    #[must_use]
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            combined: RwLock::new(StateData::default()),
            promoted_instance: RwLock::new(None),
            price_waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Whether any replica currently has this client authenticated.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.instances.read().values().any(|s| s.connected)
    }

    /// Whether any replica currently reports a live broker connection.
    #[must_use]
    pub fn connected_to_broker(&self) -> bool {
        self.instances.read().values().any(|s| s.connected_to_broker)
    }

    /// Account information from the combined view.
    #[must_use]
    pub fn account_information(&self) -> Option<AccountInformation> {
        self.combined.read().account_information.clone()
    }

    /// Open positions from the combined view.
    #[must_use]
    pub fn positions(&self) -> Vec<Position> {
        self.combined.read().positions.clone()
    }

    /// One open position by id.
    #[must_use]
    pub fn position(&self, position_id: &str) -> Option<Position> {
        self.combined
            .read()
            .positions
            .iter()
            .find(|p| p.id == position_id)
            .cloned()
    }

    /// Pending orders from the combined view.
    #[must_use]
    pub fn orders(&self) -> Vec<Order> {
        self.combined.read().orders.clone()
    }

    /// One pending order by id.
    #[must_use]
    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.combined
            .read()
            .orders
            .iter()
            .find(|o| o.id == order_id)
            .cloned()
    }

    /// Specification for a symbol.
    #[must_use]
    pub fn specification(&self, symbol: &str) -> Option<SymbolSpecification> {
        self.combined
            .read()
            .specifications_by_symbol
            .get(symbol)
            .cloned()
    }

    /// Latest price for a symbol.
    #[must_use]
    pub fn price(&self, symbol: &str) -> Option<SymbolPrice> {
        self.combined.read().prices_by_symbol.get(symbol).cloned()
    }

    /// Time of the most recent applied quote.
    #[must_use]
    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        self.combined.read().last_update_time
    }

    /// Await the next price update for a symbol, bounded by `timeout`
    /// (callers default to 30 s). Returns the already-known price when one
    /// exists and `None` when the wait times out.
    pub async fn wait_for_price(&self, symbol: &str, timeout: Duration) -> Option<SymbolPrice> {
        if let Some(price) = self.price(symbol) {
            return Some(price);
        }

        let (tx, rx) = oneshot::channel();
        self.price_waiters
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .push(tx);

        tokio::time::timeout(timeout, rx).await.ok().and_then(Result::ok)
    }

    /// Content digests of an instance's collections for delta-resume.
    ///
    /// A digest is `None` while the corresponding collection is
    /// uninitialized: empty specifications, or positions/orders before their
    /// synchronization phase completed.
    #[must_use]
    pub fn get_hashes(&self, account_type: &str, instance_index: &str) -> StateHashes {
        let instances = self.instances.read();
        let Some(state) = instances.get(instance_index) else {
            return StateHashes {
                specifications_hash: None,
                positions_hash: None,
                orders_hash: None,
            };
        };

        let specifications_hash = if state.specifications_by_symbol.is_empty() {
            None
        } else {
            let specs: Vec<SymbolSpecification> =
                state.specifications_by_symbol.values().cloned().collect();
            Some(hashes::specifications_hash(&specs, account_type))
        };
        let positions_hash = state
            .positions_initialized
            .then(|| hashes::positions_hash(&state.positions, account_type));
        let orders_hash = state
            .orders_initialized
            .then(|| hashes::orders_hash(&state.orders, account_type));

        StateHashes {
            specifications_hash,
            positions_hash,
            orders_hash,
        }
    }

    /// Apply a mutation to an instance's state and, when that instance is
    /// the promoted one, to the combined view as well.
    fn mutate(&self, instance_index: &str, mut apply: impl FnMut(&mut StateData)) {
        {
            let mut instances = self.instances.write();
            let state = instances.entry(instance_index.to_string()).or_default();
            apply(state);
        }

        let is_promoted = self
            .promoted_instance
            .read()
            .as_deref()
            .is_some_and(|promoted| promoted == instance_index);
        if is_promoted {
            apply(&mut self.combined.write());
        }
    }

    /// Copy an instance's view into the combined state. Tombstone maps start
    /// empty; prices keep flowing into the combined view through regular
    /// updates, so the existing price book is preserved.
    fn promote(&self, instance_index: &str) {
        let instances = self.instances.read();
        let Some(state) = instances.get(instance_index) else {
            return;
        };

        {
            let mut combined = self.combined.write();
            combined.connected = state.connected;
            combined.connected_to_broker = state.connected_to_broker;
            combined.account_information = state.account_information.clone();
            combined.positions = state.positions.clone();
            combined.orders = state.orders.clone();
            combined.specifications_by_symbol = state.specifications_by_symbol.clone();
            combined.positions_initialized = state.positions_initialized;
            combined.orders_initialized = state.orders_initialized;
            combined.prices_initialized = state.prices_initialized;
            combined.removed_positions.clear();
            combined.completed_orders.clear();
        }
        drop(instances);

        *self.promoted_instance.write() = Some(instance_index.to_string());
    }

    fn resolve_price_waiters(&self, prices: &[SymbolPrice]) {
        let mut waiters = self.price_waiters.lock();
        for price in prices {
            if let Some(pending) = waiters.remove(&price.symbol) {
                for tx in pending {
                    let _ = tx.send(price.clone());
                }
            }
        }
    }
}

/// Drop tombstones older than the TTL. Invoked on every tombstone write.
fn evict_expired_tombstones(tombstones: &mut HashMap<String, DateTime<Utc>>, now: DateTime<Utc>) {
    let cutoff = now - chrono::Duration::minutes(TOMBSTONE_TTL_MINUTES);
    tombstones.retain(|_, recorded| *recorded > cutoff);
}

/// Round to a number of decimal digits.
fn round_to(value: f64, digits: i64) -> f64 {
    #[allow(clippy::cast_possible_truncation)]
    let factor = 10_f64.powi(digits as i32);
    (value * factor).round() / factor
}

/// Round to cents, the resolution equity terms are summed at.
fn round2(value: f64) -> f64 {
    round_to(value, 2)
}

/// Recompute one position's P&L from a fresh quote. Requires the symbol's
/// specification for tick size and rounding digits.
fn update_position_profit(position: &mut Position, price: &SymbolPrice, spec: &SymbolSpecification) {
    let (new_price, direction) = match position.position_type {
        PositionType::Buy => (price.bid, 1.0),
        PositionType::Sell => (price.ask, -1.0),
    };
    let delta = direction * (new_price - position.open_price);
    let tick_value = if delta > 0.0 {
        price.profit_tick_value
    } else {
        price.loss_tick_value
    };

    if spec.tick_size > 0.0 {
        let unrealized = round_to(
            delta * tick_value * position.volume / spec.tick_size,
            spec.digits,
        );
        let realized = position.realized_profit.unwrap_or(0.0);
        position.unrealized_profit = Some(unrealized);
        position.profit = Some(round_to(unrealized + realized, spec.digits));
    }

    position.current_price = Some(new_price);
    position.current_tick_value = Some(tick_value);
}

/// Apply a batch of quotes to one state: refresh the price book, recompute
/// affected position P&L and order prices, then derive equity when the
/// mirror is complete enough to do so.
fn update_symbol_prices(
    state: &mut StateData,
    prices: &[SymbolPrice],
    equity: Option<f64>,
    margin: Option<f64>,
    free_margin: Option<f64>,
    margin_level: Option<f64>,
) {
    for price in prices {
        for order in state
            .orders
            .iter_mut()
            .filter(|o| o.symbol == price.symbol)
        {
            order.current_price = Some(if order.order_type.is_buy() {
                price.ask
            } else {
                price.bid
            });
        }

        // Without the specification the tick only refreshes the price book.
        if let Some(spec) = state.specifications_by_symbol.get(&price.symbol).cloned() {
            for position in state
                .positions
                .iter_mut()
                .filter(|p| p.symbol == price.symbol)
            {
                update_position_profit(position, price, &spec);
            }
        }

        state.last_update_time = Some(
            state
                .last_update_time
                .map_or(price.time, |known| known.max(price.time)),
        );
        state.prices_by_symbol.insert(price.symbol.clone(), price.clone());
    }

    state.prices_initialized = state
        .positions
        .iter()
        .all(|p| state.prices_by_symbol.contains_key(&p.symbol));

    let computable = state.account_information.is_some()
        && state.positions_initialized
        && state.prices_initialized;

    if computable {
        let platform = state
            .account_information
            .as_ref()
            .map(|ai| ai.platform);
        let mut floating = 0.0;
        for position in &state.positions {
            floating += round2(position.unrealized_profit.unwrap_or(0.0));
            floating += round2(position.swap);
            if platform == Some(Platform::Mt4) {
                floating += round2(position.commission.unwrap_or(0.0));
            }
        }
        if let Some(ai) = state.account_information.as_mut() {
            ai.equity = ai.balance + floating;
        }
    } else if let Some(server_equity) = equity {
        if let Some(ai) = state.account_information.as_mut() {
            ai.equity = server_equity;
        }
    }

    if let Some(ai) = state.account_information.as_mut() {
        if let Some(margin) = margin {
            ai.margin = margin;
        }
        if let Some(free_margin) = free_margin {
            ai.free_margin = free_margin;
        }
        if let Some(margin_level) = margin_level {
            ai.margin_level = Some(margin_level);
        }
    }
}

#[async_trait]
impl SynchronizationListener for TerminalState {
    async fn on_connected(&self, instance_index: &str, _replicas: usize) -> Result<(), Error> {
        self.mutate(instance_index, |state| state.connected = true);
        Ok(())
    }

    async fn on_disconnected(&self, instance_index: &str) -> Result<(), Error> {
        self.mutate(instance_index, |state| {
            state.connected = false;
            state.connected_to_broker = false;
        });
        Ok(())
    }

    async fn on_broker_connection_status_changed(
        &self,
        instance_index: &str,
        connected: bool,
    ) -> Result<(), Error> {
        self.mutate(instance_index, |state| state.connected_to_broker = connected);
        Ok(())
    }

    async fn on_synchronization_started(
        &self,
        instance_index: &str,
        specifications_updated: bool,
        positions_updated: bool,
        orders_updated: bool,
    ) -> Result<(), Error> {
        // Sync-phase clears touch only the instance view; the combined view
        // changes at promotion.
        let mut instances = self.instances.write();
        let state = instances.entry(instance_index.to_string()).or_default();
        state.account_information = None;
        state.prices_by_symbol.clear();
        if positions_updated {
            state.positions.clear();
            state.removed_positions.clear();
            state.positions_initialized = false;
        }
        if orders_updated {
            state.orders.clear();
            state.completed_orders.clear();
            state.orders_initialized = false;
        }
        if specifications_updated {
            state.specifications_by_symbol.clear();
        }
        Ok(())
    }

    async fn on_account_information_updated(
        &self,
        instance_index: &str,
        account_information: AccountInformation,
    ) -> Result<(), Error> {
        self.mutate(instance_index, |state| {
            state.account_information = Some(account_information.clone());
        });
        Ok(())
    }

    async fn on_positions_replaced(
        &self,
        instance_index: &str,
        positions: Vec<Position>,
    ) -> Result<(), Error> {
        self.mutate(instance_index, |state| {
            state.positions = positions.clone();
        });
        Ok(())
    }

    async fn on_position_updated(
        &self,
        instance_index: &str,
        position: Position,
    ) -> Result<(), Error> {
        self.mutate(instance_index, |state| {
            // A tombstoned id is a stale replay; ignore it.
            if state.removed_positions.contains_key(&position.id) {
                return;
            }
            match state.positions.iter_mut().find(|p| p.id == position.id) {
                Some(existing) => *existing = position.clone(),
                None => state.positions.push(position.clone()),
            }
        });
        Ok(())
    }

    async fn on_position_removed(
        &self,
        instance_index: &str,
        position_id: &str,
    ) -> Result<(), Error> {
        self.mutate(instance_index, |state| {
            let before = state.positions.len();
            state.positions.retain(|p| p.id != position_id);
            if state.positions.len() == before {
                let now = Utc::now();
                state.removed_positions.insert(position_id.to_string(), now);
                evict_expired_tombstones(&mut state.removed_positions, now);
            }
        });
        Ok(())
    }

    async fn on_positions_synchronized(
        &self,
        instance_index: &str,
        _synchronization_id: &str,
    ) -> Result<(), Error> {
        self.mutate(instance_index, |state| {
            state.removed_positions.clear();
            state.positions_initialized = true;
        });
        Ok(())
    }

    async fn on_pending_orders_replaced(
        &self,
        instance_index: &str,
        orders: Vec<Order>,
    ) -> Result<(), Error> {
        self.mutate(instance_index, |state| {
            state.orders = orders.clone();
        });
        Ok(())
    }

    async fn on_pending_order_updated(
        &self,
        instance_index: &str,
        order: Order,
    ) -> Result<(), Error> {
        self.mutate(instance_index, |state| {
            if state.completed_orders.contains_key(&order.id) {
                return;
            }
            match state.orders.iter_mut().find(|o| o.id == order.id) {
                Some(existing) => *existing = order.clone(),
                None => state.orders.push(order.clone()),
            }
        });
        Ok(())
    }

    async fn on_pending_order_completed(
        &self,
        instance_index: &str,
        order_id: &str,
    ) -> Result<(), Error> {
        self.mutate(instance_index, |state| {
            let before = state.orders.len();
            state.orders.retain(|o| o.id != order_id);
            if state.orders.len() == before {
                let now = Utc::now();
                state.completed_orders.insert(order_id.to_string(), now);
                evict_expired_tombstones(&mut state.completed_orders, now);
            }
        });
        Ok(())
    }

    async fn on_pending_orders_synchronized(
        &self,
        instance_index: &str,
        _synchronization_id: &str,
    ) -> Result<(), Error> {
        self.mutate(instance_index, |state| {
            state.completed_orders.clear();
            state.positions_initialized = true;
            state.orders_initialized = true;
        });
        // The single promotion path: the instance finished its sync round.
        self.promote(instance_index);
        Ok(())
    }

    async fn on_symbol_specifications_updated(
        &self,
        instance_index: &str,
        updates: Vec<SymbolSpecification>,
        removed: Vec<String>,
    ) -> Result<(), Error> {
        self.mutate(instance_index, |state| {
            for spec in &updates {
                state
                    .specifications_by_symbol
                    .insert(spec.symbol.clone(), spec.clone());
            }
            for symbol in &removed {
                state.specifications_by_symbol.remove(symbol);
            }
        });
        Ok(())
    }

    async fn on_symbol_prices_updated(
        &self,
        instance_index: &str,
        prices: Vec<SymbolPrice>,
        equity: Option<f64>,
        margin: Option<f64>,
        free_margin: Option<f64>,
        margin_level: Option<f64>,
    ) -> Result<(), Error> {
        self.mutate(instance_index, |state| {
            update_symbol_prices(state, &prices, equity, margin, free_margin, margin_level);
        });
        self.resolve_price_waiters(&prices);
        Ok(())
    }

    async fn on_stream_closed(&self, instance_index: &str) -> Result<(), Error> {
        self.instances.write().remove(instance_index);
        Ok(())
    }
}
