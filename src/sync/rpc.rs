//! Request-only connection facade.
//!
//! A thin wrapper over the transport exposing typed request/reply
//! operations. It keeps no local state and subscribes to no events; use
//! [`StreamingConnection`](super::StreamingConnection) for the mirrored
//! terminal state.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::Error;
use crate::models::{AccountInformation, Deal, Order, Position, TradeRequest, TradeResponse};
use crate::transport::TransportClient;

/// RPC facade for one account.
#[derive(Clone)]
pub struct RpcConnection {
    account_id: String,
    transport: TransportClient,
}

impl RpcConnection {
    /// Create a facade for an account on an existing transport.
    #[must_use]
    pub fn new(account_id: impl Into<String>, transport: TransportClient) -> Self {
        Self {
            account_id: account_id.into(),
            transport,
        }
    }

    /// Fetch the account information snapshot.
    ///
    /// # Errors
    ///
    /// Propagates transport and server errors.
    pub async fn get_account_information(&self) -> Result<AccountInformation, Error> {
        self.request_field(json!({"type": "getAccountInformation"}), "accountInformation")
            .await
    }

    /// Fetch all open positions.
    ///
    /// # Errors
    ///
    /// Propagates transport and server errors.
    pub async fn get_positions(&self) -> Result<Vec<Position>, Error> {
        self.request_field(json!({"type": "getPositions"}), "positions")
            .await
    }

    /// Fetch one position by id.
    ///
    /// # Errors
    ///
    /// Propagates transport and server errors, [`Error::NotFound`] included.
    pub async fn get_position(&self, position_id: &str) -> Result<Position, Error> {
        self.request_field(
            json!({"type": "getPosition", "positionId": position_id}),
            "position",
        )
        .await
    }

    /// Fetch all pending orders.
    ///
    /// # Errors
    ///
    /// Propagates transport and server errors.
    pub async fn get_orders(&self) -> Result<Vec<Order>, Error> {
        self.request_field(json!({"type": "getOrders"}), "orders").await
    }

    /// Fetch one pending order by id.
    ///
    /// # Errors
    ///
    /// Propagates transport and server errors, [`Error::NotFound`] included.
    pub async fn get_order(&self, order_id: &str) -> Result<Order, Error> {
        self.request_field(json!({"type": "getOrder", "orderId": order_id}), "order")
            .await
    }

    /// Fetch history orders by ticket.
    ///
    /// # Errors
    ///
    /// Propagates transport and server errors.
    pub async fn get_history_orders_by_ticket(&self, ticket: &str) -> Result<Vec<Order>, Error> {
        self.request_field(
            json!({"type": "getHistoryOrdersByTicket", "ticket": ticket}),
            "historyOrders",
        )
        .await
    }

    /// Fetch history orders by position id.
    ///
    /// # Errors
    ///
    /// Propagates transport and server errors.
    pub async fn get_history_orders_by_position(
        &self,
        position_id: &str,
    ) -> Result<Vec<Order>, Error> {
        self.request_field(
            json!({"type": "getHistoryOrdersByPosition", "positionId": position_id}),
            "historyOrders",
        )
        .await
    }

    /// Fetch history orders in a time range, paginated.
    ///
    /// # Errors
    ///
    /// Propagates transport and server errors.
    pub async fn get_history_orders_by_time_range(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Order>, Error> {
        self.request_field(
            json!({
                "type": "getHistoryOrdersByTimeRange",
                "startTime": iso(start_time),
                "endTime": iso(end_time),
                "offset": offset,
                "limit": limit,
            }),
            "historyOrders",
        )
        .await
    }

    /// Fetch deals by ticket.
    ///
    /// # Errors
    ///
    /// Propagates transport and server errors.
    pub async fn get_deals_by_ticket(&self, ticket: &str) -> Result<Vec<Deal>, Error> {
        self.request_field(json!({"type": "getDealsByTicket", "ticket": ticket}), "deals")
            .await
    }

    /// Fetch deals by position id.
    ///
    /// # Errors
    ///
    /// Propagates transport and server errors.
    pub async fn get_deals_by_position(&self, position_id: &str) -> Result<Vec<Deal>, Error> {
        self.request_field(
            json!({"type": "getDealsByPosition", "positionId": position_id}),
            "deals",
        )
        .await
    }

    /// Fetch deals in a time range, paginated.
    ///
    /// # Errors
    ///
    /// Propagates transport and server errors.
    pub async fn get_deals_by_time_range(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Deal>, Error> {
        self.request_field(
            json!({
                "type": "getDealsByTimeRange",
                "startTime": iso(start_time),
                "endTime": iso(end_time),
                "offset": offset,
                "limit": limit,
            }),
            "deals",
        )
        .await
    }

    /// Execute a trade command.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] on client-side constraint violations,
    /// [`Error::Trade`] when the trade server rejects the command, and any
    /// transport error.
    pub async fn trade(&self, trade: &TradeRequest) -> Result<TradeResponse, Error> {
        trade.validate()?;

        let mut payload = serde_json::to_value(trade).map_err(|e| Error::Validation {
            message: format!("unserializable trade request: {e}"),
            details: Value::Null,
        })?;
        payload["type"] = Value::from("trade");

        let response: TradeResponse = self.request_field(payload, "response").await?;
        response.into_result()
    }

    /// Ask the server to reconnect the terminal to the broker.
    ///
    /// # Errors
    ///
    /// Propagates transport and server errors.
    pub async fn reconnect_terminal(&self) -> Result<(), Error> {
        let _ = self
            .transport
            .request(&self.account_id, json!({"type": "reconnect"}))
            .await?;
        Ok(())
    }

    async fn request_field<T: DeserializeOwned>(
        &self,
        payload: Value,
        field: &str,
    ) -> Result<T, Error> {
        let reply = self.transport.request(&self.account_id, payload).await?;
        let value = reply.get(field).cloned().ok_or_else(|| Error::Api {
            code: "InvalidResponse".to_string(),
            message: format!("server reply is missing the {field} field"),
        })?;
        serde_json::from_value(value).map_err(|e| Error::Api {
            code: "InvalidResponse".to_string(),
            message: format!("failed to decode the {field} field: {e}"),
        })
    }
}

fn iso(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionOptions;
    use crate::models::TradeActionType;

    fn rpc() -> RpcConnection {
        let options = ConnectionOptions::new("token");
        RpcConnection::new(
            "account-1",
            TransportClient::with_url("ws://127.0.0.1:1/ws", &options),
        )
    }

    #[tokio::test]
    async fn trade_validates_before_touching_transport() {
        let connection = rpc();
        let invalid = TradeRequest {
            action_type: Some(TradeActionType::OrderTypeBuy),
            comment: Some("c".repeat(27)),
            ..TradeRequest::default()
        };
        // The transport is disconnected; a Validation error (not
        // NotConnected) proves validation ran first.
        let err = connection.trade(&invalid).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn missing_action_type_is_rejected() {
        let connection = rpc();
        let err = connection.trade(&TradeRequest::default()).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
