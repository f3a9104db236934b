//! Client SDK maintaining a locally-mirrored, eventually-consistent replica
//! of a remote trading terminal's state over a long-lived, reconnecting,
//! full-duplex websocket channel.
//!
//! Applications query the mirror synchronously (no round trip) and submit
//! trade commands asynchronously through the same channel.
//!
//! # Architecture
//!
//! - [`transport`]: reconnecting websocket RPC multiplexer with correlated
//!   replies, plus a sibling typed HTTP client in [`http`]
//! - [`sync`]: the synchronization engine — listener contract, streaming
//!   orchestration across account replicas, request-only facade
//! - [`state`]: the in-memory terminal-state mirror and its content digests
//! - [`health`]: connection health scoring and uptime accounting
//! - [`history`]: the append-only deal/order history sink
//!
//! # Example
//!
//! ```rust,ignore
//! use terminal_link::{ConnectionOptions, StreamingConnection, TransportClient};
//!
//! let options = ConnectionOptions::new(std::env::var("TERMINAL_LINK_AUTH_TOKEN")?);
//! let transport = TransportClient::new(&options);
//! let connection = StreamingConnection::new(account_id, "cloud-g2", transport, &options);
//! connection.connect().await?;
//! connection.wait_synchronized(&Default::default()).await?;
//!
//! let balance = connection.terminal_state().account_information().map(|ai| ai.balance);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod health;
pub mod history;
pub mod http;
pub mod logging;
pub mod models;
pub mod state;
pub mod sync;
pub mod time_serde;
pub mod transport;

pub use config::{ConnectionOptions, RetryOptions};
pub use error::Error;
pub use health::{ConnectionHealth, ConnectionHealthMonitor};
pub use history::{HistoryStorage, MemoryHistoryStorage};
pub use http::HttpClient;
pub use state::{StateHashes, TerminalState};
pub use sync::{
    InstanceStatus, RpcConnection, StreamingConnection, SynchronizationListener,
    WaitSynchronizedOptions,
};
pub use transport::TransportClient;
