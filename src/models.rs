//! Wire data model for terminal state and trade commands.
//!
//! All structs (de)serialize in the server's camelCase form. Timestamp fields
//! accept both ISO-8601 strings and the epoch-millisecond numbers produced by
//! transport re-hydration (see [`crate::time_serde`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Trading platform hosting the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// MetaTrader 4.
    Mt4,
    /// MetaTrader 5.
    Mt5,
}

/// Account balance and margin snapshot. At most one per instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInformation {
    /// Platform the account runs on.
    pub platform: Platform,
    /// Broker name.
    pub broker: String,
    /// Account currency (ISO-4217 three-letter code).
    pub currency: String,
    /// Trade server name.
    pub server: String,
    /// Account balance.
    pub balance: f64,
    /// Account equity (balance plus floating profit).
    pub equity: f64,
    /// Used margin.
    pub margin: f64,
    /// Free margin.
    pub free_margin: f64,
    /// Account leverage.
    pub leverage: f64,
    /// Margin level percentage, absent when no margin is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin_level: Option<f64>,
}

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionType {
    /// Long position.
    #[serde(rename = "BUY")]
    Buy,
    /// Short position.
    #[serde(rename = "SELL")]
    Sell,
}

/// An open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// Position id, unique within the account.
    pub id: String,
    /// Direction.
    #[serde(rename = "type")]
    pub position_type: PositionType,
    /// Traded symbol.
    pub symbol: String,
    /// Expert advisor magic number.
    #[serde(default)]
    pub magic: i64,
    /// Open time.
    #[serde(with = "crate::time_serde")]
    pub time: DateTime<Utc>,
    /// Last modification time.
    #[serde(
        with = "crate::time_serde::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub update_time: Option<DateTime<Utc>>,
    /// Open price.
    pub open_price: f64,
    /// Current price, absent until the first tick is applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_price: Option<f64>,
    /// Tick value used for the latest profit recomputation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_tick_value: Option<f64>,
    /// Stop loss price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    /// Take profit price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    /// Volume in lots.
    pub volume: f64,
    /// Accumulated swap.
    #[serde(default)]
    pub swap: f64,
    /// Accumulated commission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commission: Option<f64>,
    /// Realized part of the position profit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_profit: Option<f64>,
    /// Unrealized part of the position profit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unrealized_profit: Option<f64>,
    /// Total position profit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit: Option<f64>,
    /// Position comment. The sum of comment and client id lengths is capped
    /// at 26 by the trade servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Client-assigned id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Broker-side comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_comment: Option<String>,
    /// Monotonic update counter assigned by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_sequence_number: Option<i64>,
    /// Exchange rate of the account currency to USD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_currency_exchange_rate: Option<f64>,
}

/// Pending order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Market buy.
    #[serde(rename = "BUY")]
    Buy,
    /// Market sell.
    #[serde(rename = "SELL")]
    Sell,
    /// Buy limit.
    #[serde(rename = "BUY_LIMIT")]
    BuyLimit,
    /// Sell limit.
    #[serde(rename = "SELL_LIMIT")]
    SellLimit,
    /// Buy stop.
    #[serde(rename = "BUY_STOP")]
    BuyStop,
    /// Sell stop.
    #[serde(rename = "SELL_STOP")]
    SellStop,
    /// Buy stop limit.
    #[serde(rename = "BUY_STOP_LIMIT")]
    BuyStopLimit,
    /// Sell stop limit.
    #[serde(rename = "SELL_STOP_LIMIT")]
    SellStopLimit,
}

impl OrderType {
    /// Whether this is a buy-side order (its marketable price is the ask).
    #[must_use]
    pub const fn is_buy(&self) -> bool {
        matches!(self, Self::Buy | Self::BuyLimit | Self::BuyStop | Self::BuyStopLimit)
    }
}

/// A pending order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Order id (ticket), unique within the account.
    pub id: String,
    /// Order type.
    #[serde(rename = "type")]
    pub order_type: OrderType,
    /// Order state (e.g. `ORDER_STATE_PLACED`).
    pub state: String,
    /// Traded symbol.
    pub symbol: String,
    /// Expert advisor magic number.
    #[serde(default)]
    pub magic: i64,
    /// Creation time.
    #[serde(with = "crate::time_serde")]
    pub time: DateTime<Utc>,
    /// Completion time, present on done orders only.
    #[serde(
        with = "crate::time_serde::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub done_time: Option<DateTime<Utc>>,
    /// Requested open price.
    pub open_price: f64,
    /// Current market price for the order's side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_price: Option<f64>,
    /// Requested volume in lots.
    pub volume: f64,
    /// Unfilled volume in lots.
    pub current_volume: f64,
    /// Id of the position opened by this order, once filled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
    /// Platform that produced the order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Order comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Client-assigned id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Broker-side comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_comment: Option<String>,
    /// Monotonic update counter assigned by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_sequence_number: Option<i64>,
    /// Exchange rate of the account currency to USD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_currency_exchange_rate: Option<f64>,
}

/// A historical deal (trade server execution record).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    /// Deal id (ticket).
    pub id: String,
    /// Deal type (e.g. `DEAL_TYPE_BUY`).
    #[serde(rename = "type")]
    pub deal_type: String,
    /// Execution time.
    #[serde(with = "crate::time_serde")]
    pub time: DateTime<Utc>,
    /// Traded symbol, absent on balance operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Executed volume in lots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    /// Execution price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    /// Deal commission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commission: Option<f64>,
    /// Deal swap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap: Option<f64>,
    /// Deal profit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit: Option<f64>,
    /// Id of the position the deal belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
    /// Id of the order that produced the deal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    /// Platform that produced the deal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Deal comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Client-assigned id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Contract specification of a tradable symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolSpecification {
    /// Symbol name.
    pub symbol: String,
    /// Price precision in decimal digits.
    pub digits: i64,
    /// Minimal price change.
    pub tick_size: f64,
    /// Deal execution mode (e.g. `SYMBOL_TRADE_EXECUTION_MARKET`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<String>,
    /// Allowed order filling modes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filling_modes: Option<Vec<String>>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A live quote for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolPrice {
    /// Symbol name.
    pub symbol: String,
    /// Best bid.
    pub bid: f64,
    /// Best ask.
    pub ask: f64,
    /// Tick value for profitable positions, in account currency.
    #[serde(default)]
    pub profit_tick_value: f64,
    /// Tick value for losing positions, in account currency.
    #[serde(default)]
    pub loss_tick_value: f64,
    /// Quote time.
    #[serde(with = "crate::time_serde")]
    pub time: DateTime<Utc>,
}

/// Server-reported health of one account replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// REST API healthy flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest_api_healthy: Option<bool>,
    /// Synchronization channel healthy flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization_api_healthy: Option<bool>,
    /// Market data streaming healthy flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_streaming_healthy: Option<bool>,
}

/// Market data stream kinds a client may subscribe to for a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDataSubscription {
    /// Subscription kind (`quotes`, `candles`, `ticks`, `marketDepth`).
    #[serde(rename = "type")]
    pub subscription_type: String,
    /// Throttling interval for the stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_in_milliseconds: Option<u64>,
}

/// Trade command kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeActionType {
    /// Market buy.
    OrderTypeBuy,
    /// Market sell.
    OrderTypeSell,
    /// Buy limit.
    OrderTypeBuyLimit,
    /// Sell limit.
    OrderTypeSellLimit,
    /// Buy stop.
    OrderTypeBuyStop,
    /// Sell stop.
    OrderTypeSellStop,
    /// Buy stop limit.
    OrderTypeBuyStopLimit,
    /// Sell stop limit.
    OrderTypeSellStopLimit,
    /// Modify a position's stop loss / take profit.
    PositionModify,
    /// Partially close a position.
    PositionPartial,
    /// Close a position by id.
    PositionCloseId,
    /// Close a position by an opposite one.
    PositionCloseBy,
    /// Close all positions for a symbol.
    PositionsCloseSymbol,
    /// Modify a pending order.
    OrderModify,
    /// Cancel a pending order.
    OrderCancel,
}

/// Units of stop loss / take profit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopUnits {
    /// Absolute price level.
    AbsolutePrice,
    /// Distance from the open price, in price units.
    RelativePrice,
    /// Distance from the open price, in points.
    RelativePoints,
    /// Distance from the open price, in account currency.
    RelativeCurrency,
    /// Distance from the open price, as a balance percentage.
    RelativeBalancePercentage,
}

/// Pending order expiration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeExpiration {
    /// Expiration type (e.g. `ORDER_TIME_GTC`, `ORDER_TIME_SPECIFIED`).
    #[serde(rename = "type")]
    pub expiration_type: String,
    /// Expiration moment, required by `ORDER_TIME_SPECIFIED`.
    #[serde(
        with = "crate::time_serde::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub time: Option<DateTime<Utc>>,
}

/// Maximum combined length of `comment` and `client_id` on a trade.
const MAX_COMMENT_AND_CLIENT_ID_LEN: usize = 26;

/// A trade command payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRequest {
    /// Command kind.
    pub action_type: Option<TradeActionType>,
    /// Symbol to trade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Volume in lots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    /// Limit/stop price for pending orders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_price: Option<f64>,
    /// Limit price for stop-limit orders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_limit_price: Option<f64>,
    /// Stop loss value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    /// Units of the stop loss value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss_units: Option<StopUnits>,
    /// Take profit value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    /// Units of the take profit value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit_units: Option<StopUnits>,
    /// Order comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Client-assigned id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Expert advisor magic number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magic: Option<i64>,
    /// Allowed slippage in points.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slippage: Option<f64>,
    /// Allowed filling modes, in preference order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filling_modes: Option<Vec<String>>,
    /// Pending order expiration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<TradeExpiration>,
    /// Target position id for position commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
    /// Opposite position id for close-by commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_by_position_id: Option<String>,
    /// Target order id for order commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}

impl TradeRequest {
    /// Validate client-side constraints before sending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when `action_type` is missing or the
    /// combined `comment` + `client_id` length exceeds the trade server cap.
    pub fn validate(&self) -> Result<(), Error> {
        if self.action_type.is_none() {
            return Err(Error::Validation {
                message: "actionType is required".to_string(),
                details: serde_json::Value::Null,
            });
        }

        let comment_len = self.comment.as_deref().map_or(0, str::len);
        let client_id_len = self.client_id.as_deref().map_or(0, str::len);
        if comment_len + client_id_len > MAX_COMMENT_AND_CLIENT_ID_LEN {
            return Err(Error::Validation {
                message: format!(
                    "combined length of comment and clientId must not exceed {MAX_COMMENT_AND_CLIENT_ID_LEN} characters"
                ),
                details: serde_json::json!({
                    "comment": comment_len,
                    "clientId": client_id_len,
                }),
            });
        }

        Ok(())
    }
}

/// Trade result codes the servers report for accepted commands.
const SUCCESS_RETCODES: &[&str] = &[
    "TRADE_RETCODE_DONE",
    "TRADE_RETCODE_DONE_PARTIAL",
    "TRADE_RETCODE_PLACED",
    "TRADE_RETCODE_NO_CHANGES",
];

/// Result of a trade command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeResponse {
    /// Numeric trade server result code.
    pub numeric_code: i64,
    /// Symbolic result code.
    pub string_code: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Id of the created order, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    /// Id of the affected position, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
}

impl TradeResponse {
    /// Convert into a result, mapping rejection codes to [`Error::Trade`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Trade`] unless the result code is one of the
    /// success codes.
    pub fn into_result(self) -> Result<Self, Error> {
        if SUCCESS_RETCODES.contains(&self.string_code.as_str()) {
            Ok(self)
        } else {
            Err(Error::Trade {
                code: self.numeric_code,
                string_code: self.string_code,
                message: self.message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn position_round_trips_camel_case() {
        let raw = json!({
            "id": "46214692",
            "type": "BUY",
            "symbol": "GBPUSD",
            "magic": 1000,
            "time": "2020-04-15T02:45:06.521Z",
            "updateTime": "2020-04-15T02:45:06.521Z",
            "openPrice": 1.26101,
            "currentPrice": 1.24883,
            "currentTickValue": 1.0,
            "volume": 0.07,
            "swap": 0.0,
            "commission": -0.25,
            "realizedProfit": -6.536_993_168_992_9e-2,
            "unrealizedProfit": -85.252_130_683_100_7,
            "profit": -85.317_500_614_790_64,
            "clientId": "TE_GBPUSD_7hyINWqAlE"
        });

        let position: Position = serde_json::from_value(raw).unwrap();
        assert_eq!(position.position_type, PositionType::Buy);
        assert_eq!(position.magic, 1000);
        assert_eq!(position.client_id.as_deref(), Some("TE_GBPUSD_7hyINWqAlE"));

        let back = serde_json::to_value(&position).unwrap();
        assert_eq!(back["openPrice"], 1.26101);
        assert!(back.get("comment").is_none());
    }

    #[test]
    fn order_side_detection() {
        assert!(OrderType::BuyStopLimit.is_buy());
        assert!(OrderType::BuyLimit.is_buy());
        assert!(!OrderType::SellStop.is_buy());
        assert!(!OrderType::Sell.is_buy());
    }

    #[test]
    fn trade_request_serializes_action_type() {
        let request = TradeRequest {
            action_type: Some(TradeActionType::OrderTypeSellLimit),
            symbol: Some("AUDNZD".to_string()),
            volume: Some(0.07),
            open_price: Some(1.05),
            ..TradeRequest::default()
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["actionType"], "ORDER_TYPE_SELL_LIMIT");
        assert_eq!(value["openPrice"], 1.05);
        assert!(value.get("stopLoss").is_none());
    }

    #[test]
    fn trade_request_rejects_long_comment() {
        let request = TradeRequest {
            action_type: Some(TradeActionType::OrderTypeBuy),
            comment: Some("a".repeat(20)),
            client_id: Some("b".repeat(7)),
            ..TradeRequest::default()
        };

        assert!(matches!(
            request.validate(),
            Err(Error::Validation { .. })
        ));

        let ok = TradeRequest {
            action_type: Some(TradeActionType::OrderTypeBuy),
            comment: Some("a".repeat(20)),
            client_id: Some("b".repeat(6)),
            ..TradeRequest::default()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn trade_response_maps_rejections() {
        let rejected = TradeResponse {
            numeric_code: 10006,
            string_code: "TRADE_RETCODE_REJECT".to_string(),
            message: "Request rejected".to_string(),
            order_id: None,
            position_id: None,
        };
        assert!(matches!(
            rejected.into_result(),
            Err(Error::Trade { code: 10006, .. })
        ));

        let done = TradeResponse {
            numeric_code: 10009,
            string_code: "TRADE_RETCODE_DONE".to_string(),
            message: String::new(),
            order_id: Some("46870472".to_string()),
            position_id: None,
        };
        assert_eq!(
            done.into_result().unwrap().order_id.as_deref(),
            Some("46870472")
        );
    }

    #[test]
    fn platform_wire_form() {
        assert_eq!(serde_json::to_value(Platform::Mt5).unwrap(), "mt5");
        let p: Platform = serde_json::from_value(json!("mt4")).unwrap();
        assert_eq!(p, Platform::Mt4);
    }
}
