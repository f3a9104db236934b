//! Append-only history sink for deals and history orders.
//!
//! The synchronization engine feeds every history record it receives into a
//! [`HistoryStorage`]; the stored high-water marks let a resuming client ask
//! the server to start from where it left off.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::Error;
use crate::models::{Deal, Order};

/// Sink for the history stream of one account.
#[allow(unused_variables)]
#[async_trait]
pub trait HistoryStorage: Send + Sync {
    /// A history order arrived (new or updated revision of the same id).
    async fn on_history_order_added(&self, instance_index: &str, order: Order)
        -> Result<(), Error>;

    /// A deal arrived (new or updated revision of the same id).
    async fn on_deal_added(&self, instance_index: &str, deal: Deal) -> Result<(), Error>;

    /// History order synchronization completed for the instance.
    async fn on_history_orders_synchronized(
        &self,
        instance_index: &str,
        synchronization_id: &str,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Deal synchronization completed for the instance.
    async fn on_deals_synchronized(
        &self,
        instance_index: &str,
        synchronization_id: &str,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Time of the newest stored history order, if any.
    fn last_history_order_time(&self) -> Option<DateTime<Utc>>;

    /// Time of the newest stored deal, if any.
    fn last_deal_time(&self) -> Option<DateTime<Utc>>;

    /// Drop all stored history.
    async fn clear(&self) -> Result<(), Error>;
}

/// In-memory history storage; the default sink and the one tests use.
#[derive(Default)]
pub struct MemoryHistoryStorage {
    history_orders: RwLock<Vec<Order>>,
    deals: RwLock<Vec<Deal>>,
}

impl MemoryHistoryStorage {
    /// Create an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored history orders.
    #[must_use]
    pub fn history_orders(&self) -> Vec<Order> {
        self.history_orders.read().clone()
    }

    /// Stored deals.
    #[must_use]
    pub fn deals(&self) -> Vec<Deal> {
        self.deals.read().clone()
    }
}

#[async_trait]
impl HistoryStorage for MemoryHistoryStorage {
    async fn on_history_order_added(
        &self,
        _instance_index: &str,
        order: Order,
    ) -> Result<(), Error> {
        let mut orders = self.history_orders.write();
        match orders.iter_mut().find(|o| o.id == order.id) {
            Some(existing) => *existing = order,
            None => orders.push(order),
        }
        Ok(())
    }

    async fn on_deal_added(&self, _instance_index: &str, deal: Deal) -> Result<(), Error> {
        let mut deals = self.deals.write();
        match deals.iter_mut().find(|d| d.id == deal.id && d.deal_type == deal.deal_type) {
            Some(existing) => *existing = deal,
            None => deals.push(deal),
        }
        Ok(())
    }

    fn last_history_order_time(&self) -> Option<DateTime<Utc>> {
        self.history_orders
            .read()
            .iter()
            .map(|o| o.done_time.unwrap_or(o.time))
            .max()
    }

    fn last_deal_time(&self) -> Option<DateTime<Utc>> {
        self.deals.read().iter().map(|d| d.time).max()
    }

    async fn clear(&self) -> Result<(), Error> {
        self.history_orders.write().clear();
        self.deals.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderType;
    use chrono::TimeZone;

    fn history_order(id: &str, hour: u32) -> Order {
        Order {
            id: id.to_string(),
            order_type: OrderType::Buy,
            state: "ORDER_STATE_FILLED".to_string(),
            symbol: "EURUSD".to_string(),
            magic: 0,
            time: Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap(),
            done_time: Some(Utc.with_ymd_and_hms(2024, 6, 1, hour, 5, 0).unwrap()),
            open_price: 1.0,
            current_price: None,
            volume: 0.1,
            current_volume: 0.0,
            position_id: None,
            platform: None,
            comment: None,
            client_id: None,
            broker_comment: None,
            update_sequence_number: None,
            account_currency_exchange_rate: None,
        }
    }

    fn deal(id: &str, hour: u32) -> Deal {
        Deal {
            id: id.to_string(),
            deal_type: "DEAL_TYPE_BUY".to_string(),
            time: Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap(),
            symbol: Some("EURUSD".to_string()),
            volume: Some(0.1),
            price: Some(1.0),
            commission: None,
            swap: None,
            profit: Some(1.5),
            position_id: None,
            order_id: None,
            platform: None,
            comment: None,
            client_id: None,
        }
    }

    #[tokio::test]
    async fn deduplicates_by_id() {
        let storage = MemoryHistoryStorage::new();
        storage
            .on_history_order_added("0", history_order("1", 10))
            .await
            .unwrap();
        storage
            .on_history_order_added("0", history_order("1", 11))
            .await
            .unwrap();
        storage
            .on_history_order_added("0", history_order("2", 9))
            .await
            .unwrap();

        assert_eq!(storage.history_orders().len(), 2);
    }

    #[tokio::test]
    async fn tracks_high_water_marks() {
        let storage = MemoryHistoryStorage::new();
        assert!(storage.last_deal_time().is_none());

        storage.on_deal_added("0", deal("1", 10)).await.unwrap();
        storage.on_deal_added("0", deal("2", 12)).await.unwrap();
        storage.on_deal_added("0", deal("3", 11)).await.unwrap();
        assert_eq!(
            storage.last_deal_time().unwrap(),
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
        );

        storage
            .on_history_order_added("0", history_order("1", 10))
            .await
            .unwrap();
        assert_eq!(
            storage.last_history_order_time().unwrap(),
            Utc.with_ymd_and_hms(2024, 6, 1, 10, 5, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn clear_empties_everything() {
        let storage = MemoryHistoryStorage::new();
        storage.on_deal_added("0", deal("1", 10)).await.unwrap();
        storage.clear().await.unwrap();
        assert!(storage.deals().is_empty());
        assert!(storage.last_deal_time().is_none());
    }
}
