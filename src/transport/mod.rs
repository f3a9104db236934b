//! Transport layer: reconnecting websocket RPC with correlated replies.

pub mod codec;
mod client;
mod reconnect;

pub use client::{PacketListener, TransportClient};
pub(crate) use client::random_request_id;
pub use codec::Packet;
pub use reconnect::ReconnectPolicy;
