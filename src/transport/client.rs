//! Websocket RPC multiplexer.
//!
//! One full-duplex channel carries two packet categories: requests
//! (client → server, correlated replies) and events (server → client).
//! Correlation is a pending-map of oneshot senders keyed by `requestId`;
//! replies may arrive in any order. The connection loop reconnects forever
//! while the logical connection is desired, and outstanding request futures
//! stay pending across reconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::codec::{self, Packet};
use super::reconnect::ReconnectPolicy;
use crate::config::ConnectionOptions;
use crate::error::Error;

/// Capacity of the outbound frame queue per socket.
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Receiver of event packets routed to one account.
///
/// Dispatch is sequential: the transport awaits `on_packet` before delivering
/// the next packet, so implementations must not block on transport requests
/// from inside the callback.
#[async_trait]
pub trait PacketListener: Send + Sync {
    /// Handle one event packet.
    async fn on_packet(&self, packet: Packet);

    /// Called after the socket reconnects, before any new packets flow.
    async fn on_reconnected(&self) {}
}

type PendingMap = HashMap<String, oneshot::Sender<Result<Value, Error>>>;

struct Inner {
    /// Full endpoint URL. Carries the auth token; never logged.
    url: String,
    request_timeout: Duration,
    connect_timeout: Duration,
    pending: Mutex<PendingMap>,
    listeners: RwLock<HashMap<String, Arc<dyn PacketListener>>>,
    outbound: RwLock<Option<mpsc::Sender<String>>>,
    connected_tx: watch::Sender<bool>,
    started: AtomicBool,
    desired: AtomicBool,
    shutdown: CancellationToken,
}

impl Inner {
    fn fail_pending(&self, message: &str) {
        let mut pending = self.pending.lock();
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(Error::not_connected(message)));
        }
    }
}

/// Reconnecting websocket client with request/reply correlation.
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<Inner>,
}

impl TransportClient {
    /// Create a client for the standard endpoint derived from `options`.
    #[must_use]
    pub fn new(options: &ConnectionOptions) -> Self {
        let url = format!(
            "{}?auth-token={}",
            options.websocket_url(),
            options.auth_token
        );
        Self::with_url(url, options)
    }

    /// Create a client for an explicit endpoint URL.
    #[must_use]
    pub fn with_url(url: impl Into<String>, options: &ConnectionOptions) -> Self {
        let (connected_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                request_timeout: options.request_timeout,
                connect_timeout: options.connect_timeout,
                pending: Mutex::new(HashMap::new()),
                listeners: RwLock::new(HashMap::new()),
                outbound: RwLock::new(None),
                connected_tx,
                started: AtomicBool::new(false),
                desired: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Open the channel and resolve on the first successful handshake.
    ///
    /// Idempotent: while the connection is desired, further calls only wait
    /// for connectivity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the handshake does not complete within
    /// the connect timeout, or [`Error::NotConnected`] when the client was
    /// closed.
    pub async fn connect(&self) -> Result<(), Error> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::not_connected("client is closed"));
        }

        self.inner.desired.store(true, Ordering::SeqCst);
        if !self.inner.started.swap(true, Ordering::SeqCst) {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                run_connection(inner).await;
            });
        }

        let mut connected = self.inner.connected_tx.subscribe();
        let result = match timeout(self.inner.connect_timeout, connected.wait_for(|up| *up)).await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::not_connected("connection closed")),
            Err(_) => Err(Error::timeout("timed out waiting for websocket handshake")),
        };
        result
    }

    /// Whether the socket is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.inner.connected_tx.borrow()
    }

    /// Stop the reconnect loop, tear the socket down, and reject every
    /// outstanding request future with a connection-closed error.
    pub fn close(&self) {
        self.inner.desired.store(false, Ordering::SeqCst);
        self.inner.shutdown.cancel();
        let _ = self.inner.connected_tx.send(false);
        self.inner.fail_pending("connection closed");
    }

    /// Register the event packet listener for an account.
    pub fn add_account_listener(&self, account_id: impl Into<String>, listener: Arc<dyn PacketListener>) {
        self.inner.listeners.write().insert(account_id.into(), listener);
    }

    /// Remove the event packet listener for an account.
    pub fn remove_account_listener(&self, account_id: &str) {
        self.inner.listeners.write().remove(account_id);
    }

    /// Send a request and await the correlated reply.
    ///
    /// A fresh 32-character alphanumeric `requestId` plus the `accountId` are
    /// stamped onto the payload. The returned future resolves with the reply
    /// whose `requestId` matches, or with the typed error from a
    /// `processingError` packet.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] when the socket is down or the client closes,
    /// [`Error::Timeout`] when no reply arrives within the request timeout,
    /// and any server-reported error kind.
    pub async fn request(&self, account_id: &str, payload: Value) -> Result<Value, Error> {
        self.request_with_id(account_id, &random_request_id(), payload)
            .await
    }

    /// Like [`TransportClient::request`] with a caller-chosen request id
    /// (synchronization requests correlate by their synchronization id).
    pub(crate) async fn request_with_id(
        &self,
        account_id: &str,
        request_id: &str,
        mut payload: Value,
    ) -> Result<Value, Error> {
        let Some(map) = payload.as_object_mut() else {
            return Err(Error::Validation {
                message: "request payload must be a JSON object".to_string(),
                details: Value::Null,
            });
        };
        map.insert("accountId".to_string(), Value::from(account_id));
        map.insert("requestId".to_string(), Value::from(request_id));

        let Some(sender) = self.inner.outbound.read().clone() else {
            return Err(Error::not_connected("transport is not connected"));
        };

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id.to_string(), tx);

        if sender.send(payload.to_string()).await.is_err() {
            self.inner.pending.lock().remove(request_id);
            return Err(Error::not_connected("transport is not connected"));
        }

        match timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::not_connected("connection closed")),
            Err(_) => {
                self.inner.pending.lock().remove(request_id);
                Err(Error::timeout(format!(
                    "request {request_id} timed out waiting for a server reply"
                )))
            }
        }
    }

    /// Emit a fire-and-forget event packet (no reply correlation).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] when the socket is down.
    pub async fn send_event(&self, account_id: &str, mut payload: Value) -> Result<(), Error> {
        let Some(map) = payload.as_object_mut() else {
            return Err(Error::Validation {
                message: "event payload must be a JSON object".to_string(),
                details: Value::Null,
            });
        };
        map.insert("accountId".to_string(), Value::from(account_id));

        let Some(sender) = self.inner.outbound.read().clone() else {
            return Err(Error::not_connected("transport is not connected"));
        };
        sender
            .send(payload.to_string())
            .await
            .map_err(|_| Error::not_connected("transport is not connected"))
    }
}

/// Generate a 32-character alphanumeric request id.
pub(crate) fn random_request_id() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Connection supervision loop: connect, run the socket until it drops, then
/// back off and reconnect while the connection is still desired.
async fn run_connection(inner: Arc<Inner>) {
    let mut policy = ReconnectPolicy::new();
    let mut reconnecting = false;

    loop {
        if inner.shutdown.is_cancelled() || !inner.desired.load(Ordering::SeqCst) {
            break;
        }

        match connect_async(&inner.url).await {
            Ok((stream, _)) => {
                policy.reset();
                tracing::info!("Websocket connected");
                run_socket(&inner, stream, reconnecting).await;
                reconnecting = true;
                let _ = inner.connected_tx.send(false);
                tracing::warn!("Websocket disconnected");
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt = policy.attempt(), "Websocket connection failed");
            }
        }

        if inner.shutdown.is_cancelled() || !inner.desired.load(Ordering::SeqCst) {
            break;
        }

        let backoff = policy.next_backoff();
        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            () = inner.shutdown.cancelled() => break,
        }
    }

    let _ = inner.connected_tx.send(false);
}

/// Drive one socket until it closes: pump outbound frames, dispatch inbound
/// packets, answer pings.
async fn run_socket(
    inner: &Arc<Inner>,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    reconnected: bool,
) {
    let (mut write, mut read) = stream.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_CAPACITY);
    *inner.outbound.write() = Some(tx);
    let _ = inner.connected_tx.send(true);

    if reconnected {
        let listeners: Vec<Arc<dyn PacketListener>> =
            inner.listeners.read().values().cloned().collect();
        for listener in listeners {
            listener.on_reconnected().await;
        }
    }

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(frame) = outbound else { break };
                if let Err(e) = write.send(Message::Text(frame.into())).await {
                    tracing::warn!(error = %e, "Websocket send failed");
                    break;
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => handle_frame(inner, text.as_str()).await,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("Websocket close frame received");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Websocket read error");
                        break;
                    }
                    None => {
                        tracing::warn!("Websocket stream ended");
                        break;
                    }
                    _ => {}
                }
            }
            () = inner.shutdown.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        }
    }

    *inner.outbound.write() = None;
}

/// Decode one inbound frame and route it: replies and processing errors
/// resolve pending request futures, everything else goes to the account's
/// packet listener. Events for one account are dispatched in on-wire order,
/// one at a time.
async fn handle_frame(inner: &Arc<Inner>, raw: &str) {
    let packet = match codec::decode_packet(raw) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::warn!(error = %e, "Dropping undecodable packet");
            return;
        }
    };

    match packet.packet_type.as_str() {
        "response" => {
            if let Some(request_id) = &packet.request_id {
                if let Some(tx) = inner.pending.lock().remove(request_id) {
                    let _ = tx.send(Ok(packet.body));
                }
            }
        }
        "processingError" => {
            let error = Error::from_processing_error(&packet.body);
            let unauthorized = matches!(error, Error::Unauthorized { .. });
            tracing::warn!(error = %error, request_id = ?packet.request_id, "Server reported processing error");

            if let Some(request_id) = &packet.request_id {
                if let Some(tx) = inner.pending.lock().remove(request_id) {
                    let _ = tx.send(Err(error));
                }
            }

            // An invalid token is fatal for the whole channel.
            if unauthorized {
                tracing::error!("Authorization rejected by server, closing transport");
                inner.desired.store(false, Ordering::SeqCst);
                inner.shutdown.cancel();
                inner.fail_pending("connection closed");
            }
        }
        _ => {
            let listener = packet
                .account_id
                .as_ref()
                .and_then(|id| inner.listeners.read().get(id).cloned());
            match listener {
                Some(listener) => listener.on_packet(packet).await,
                None => {
                    tracing::debug!(
                        packet_type = %packet.packet_type,
                        account_id = ?packet.account_id,
                        "No listener registered for packet"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_32_char_alphanumeric() {
        for _ in 0..100 {
            let id = random_request_id();
            assert_eq!(id.len(), 32);
            assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn request_ids_are_unique() {
        let a = random_request_id();
        let b = random_request_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn request_rejects_non_object_payload() {
        let options = ConnectionOptions::new("token");
        let client = TransportClient::with_url("ws://127.0.0.1:1/ws", &options);
        let err = client
            .request("account", Value::String("nope".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn request_fails_fast_when_disconnected() {
        let options = ConnectionOptions::new("token");
        let client = TransportClient::with_url("ws://127.0.0.1:1/ws", &options);
        let err = client
            .request("account", serde_json::json!({"type": "getPositions"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected { .. }));
    }

    #[tokio::test]
    async fn close_rejects_outstanding_futures() {
        let options = ConnectionOptions::new("token");
        let client = TransportClient::with_url("ws://127.0.0.1:1/ws", &options);

        // Install a fake live socket so the request registers as pending.
        let (tx, mut rx) = mpsc::channel(8);
        *client.inner.outbound.write() = Some(tx);

        let pending_client = client.clone();
        let pending = tokio::spawn(async move {
            pending_client
                .request("account", serde_json::json!({"type": "getPositions"}))
                .await
        });

        // Wait for the frame to be queued, then close.
        let frame = rx.recv().await.expect("request frame");
        assert!(frame.contains("requestId"));
        client.close();

        let err = pending.await.unwrap().unwrap_err();
        match err {
            Error::NotConnected { message } => assert_eq!(message, "connection closed"),
            other => panic!("expected NotConnected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reply_resolves_matching_future_once() {
        let options = ConnectionOptions::new("token");
        let client = TransportClient::with_url("ws://127.0.0.1:1/ws", &options);
        let (tx, mut rx) = mpsc::channel(8);
        *client.inner.outbound.write() = Some(tx);

        let request_client = client.clone();
        let pending = tokio::spawn(async move {
            request_client
                .request_with_id(
                    "account",
                    "fixedRequestId000000000000000000",
                    serde_json::json!({"type": "getPositions"}),
                )
                .await
        });
        let _ = rx.recv().await;

        // A reply for some other request must not resolve this future.
        handle_frame(
            &client.inner,
            r#"{"type":"response","accountId":"account","requestId":"otherRequest","positions":[]}"#,
        )
        .await;
        assert_eq!(client.inner.pending.lock().len(), 1);

        handle_frame(
            &client.inner,
            r#"{"type":"response","accountId":"account","requestId":"fixedRequestId000000000000000000","positions":[]}"#,
        )
        .await;

        let reply = pending.await.unwrap().unwrap();
        assert_eq!(reply["positions"], serde_json::json!([]));
        assert!(client.inner.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn processing_error_resolves_future_with_typed_error() {
        let options = ConnectionOptions::new("token");
        let client = TransportClient::with_url("ws://127.0.0.1:1/ws", &options);
        let (tx, mut rx) = mpsc::channel(8);
        *client.inner.outbound.write() = Some(tx);

        let request_client = client.clone();
        let pending = tokio::spawn(async move {
            request_client
                .request_with_id(
                    "account",
                    "fixedRequestId000000000000000000",
                    serde_json::json!({"type": "trade"}),
                )
                .await
        });
        let _ = rx.recv().await;

        handle_frame(
            &client.inner,
            r#"{"type":"processingError","requestId":"fixedRequestId000000000000000000","error":"ValidationError","message":"bad volume","details":{}}"#,
        )
        .await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
