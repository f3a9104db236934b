//! Synchronization engine: listener contract, streaming orchestration, and
//! the request-only facade.

mod listener;
mod rpc;
mod streaming;

pub use listener::SynchronizationListener;
pub use rpc::RpcConnection;
pub use streaming::{
    InstanceStatus, StreamingConnection, WaitSynchronizedOptions, DEFAULT_MARKET_DATA_TIMEOUT,
    DEFAULT_WAIT_SYNCHRONIZED_TIMEOUT,
};
