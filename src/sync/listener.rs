//! Observer contract for synchronization events.
//!
//! The engine fans every event out to its listeners sequentially and awaits
//! each completion before dispatching the next packet for the account, so
//! implementations see events in on-wire order per instance. Every callback
//! takes the originating instance index first and defaults to a no-op.

use async_trait::async_trait;

use crate::error::Error;
use crate::models::{
    AccountInformation, Deal, HealthStatus, MarketDataSubscription, Order, Position, SymbolPrice,
    SymbolSpecification,
};

/// Listener for the per-account synchronization event stream.
#[allow(unused_variables)]
#[async_trait]
pub trait SynchronizationListener: Send + Sync {
    /// A replica authenticated this client; `replicas` is the active count.
    async fn on_connected(&self, instance_index: &str, replicas: usize) -> Result<(), Error> {
        Ok(())
    }

    /// The replica dropped the connection to this client.
    async fn on_disconnected(&self, instance_index: &str) -> Result<(), Error> {
        Ok(())
    }

    /// The replica's connection to the broker changed state.
    async fn on_broker_connection_status_changed(
        &self,
        instance_index: &str,
        connected: bool,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// A synchronization round started; the flags name the collections the
    /// server is about to re-send.
    async fn on_synchronization_started(
        &self,
        instance_index: &str,
        specifications_updated: bool,
        positions_updated: bool,
        orders_updated: bool,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Account information snapshot arrived.
    async fn on_account_information_updated(
        &self,
        instance_index: &str,
        account_information: AccountInformation,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Full position list replacing current state.
    async fn on_positions_replaced(
        &self,
        instance_index: &str,
        positions: Vec<Position>,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Incremental position update.
    async fn on_position_updated(
        &self,
        instance_index: &str,
        position: Position,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// A position was closed or otherwise removed.
    async fn on_position_removed(
        &self,
        instance_index: &str,
        position_id: &str,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Position synchronization phase completed.
    async fn on_positions_synchronized(
        &self,
        instance_index: &str,
        synchronization_id: &str,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Full pending order list replacing current state.
    async fn on_pending_orders_replaced(
        &self,
        instance_index: &str,
        orders: Vec<Order>,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Incremental pending order update.
    async fn on_pending_order_updated(
        &self,
        instance_index: &str,
        order: Order,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// A pending order left the working set (filled, canceled or expired).
    async fn on_pending_order_completed(
        &self,
        instance_index: &str,
        order_id: &str,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Pending order synchronization phase completed.
    async fn on_pending_orders_synchronized(
        &self,
        instance_index: &str,
        synchronization_id: &str,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// A history order record arrived.
    async fn on_history_order_added(
        &self,
        instance_index: &str,
        order: Order,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// A deal record arrived.
    async fn on_deal_added(&self, instance_index: &str, deal: Deal) -> Result<(), Error> {
        Ok(())
    }

    /// History order synchronization completed.
    async fn on_history_orders_synchronized(
        &self,
        instance_index: &str,
        synchronization_id: &str,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Deal synchronization completed; the instance is fully synchronized.
    async fn on_deals_synchronized(
        &self,
        instance_index: &str,
        synchronization_id: &str,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Symbol specifications were updated and/or removed.
    async fn on_symbol_specifications_updated(
        &self,
        instance_index: &str,
        updates: Vec<SymbolSpecification>,
        removed: Vec<String>,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Live quotes arrived, optionally with server-computed account margin
    /// figures.
    async fn on_symbol_prices_updated(
        &self,
        instance_index: &str,
        prices: Vec<SymbolPrice>,
        equity: Option<f64>,
        margin: Option<f64>,
        free_margin: Option<f64>,
        margin_level: Option<f64>,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Server-side health report for the replica.
    async fn on_health_status(
        &self,
        instance_index: &str,
        status: HealthStatus,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// The server downgraded a market data subscription.
    async fn on_subscription_downgraded(
        &self,
        instance_index: &str,
        symbol: &str,
        updates: Vec<MarketDataSubscription>,
        unsubscriptions: Vec<String>,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// The event stream for the instance closed; per-instance state must be
    /// dropped.
    async fn on_stream_closed(&self, instance_index: &str) -> Result<(), Error> {
        Ok(())
    }
}
