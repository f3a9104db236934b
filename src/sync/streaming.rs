//! Streaming connection: one logical session per account across replicas.
//!
//! The connection installs itself as the account's packet listener on the
//! transport, routes inbound events to the synchronization listeners
//! (terminal state, health monitor, history storage, user listeners), and
//! drives the per-instance synchronization state machine
//! `CREATED → SUBSCRIBED → SYNCHRONIZING → SYNCHRONIZED → (DISCONNECTED →
//! SUBSCRIBED) | CLOSED`.
//!
//! Several replicas of one account may stream concurrently. Each owns an
//! independent session keyed by instance index; a monotonic `sync_key` gates
//! retry loops so that a newer synchronization round silently invalidates an
//! older one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::SynchronizationListener;
use crate::config::ConnectionOptions;
use crate::error::Error;
use crate::health::ConnectionHealthMonitor;
use crate::history::{HistoryStorage, MemoryHistoryStorage};
use crate::models::{
    AccountInformation, Deal, HealthStatus, MarketDataSubscription, Order, Position, SymbolPrice,
    SymbolSpecification,
};
use crate::state::TerminalState;
use crate::transport::{Packet, PacketListener, TransportClient};

/// Initial delay between synchronization retries.
const SYNC_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Cap on the synchronization retry delay.
const SYNC_RETRY_CAP: Duration = Duration::from_secs(300);

/// Interval between uptime reports to the server.
const UPTIME_REPORT_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default bound for [`StreamingConnection::wait_synchronized`].
pub const DEFAULT_WAIT_SYNCHRONIZED_TIMEOUT: Duration = Duration::from_secs(300);

/// Default bound for awaiting the first price of a new subscription.
pub const DEFAULT_MARKET_DATA_TIMEOUT: Duration = Duration::from_secs(30);

/// Synchronization lifecycle of one replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Known but not yet subscribed.
    #[default]
    Created,
    /// The replica authenticated this client.
    Subscribed,
    /// A synchronization round is in flight.
    Synchronizing,
    /// The replica finished deal synchronization.
    Synchronized,
    /// The replica dropped the connection.
    Disconnected,
    /// The session was closed.
    Closed,
}

#[derive(Debug, Default)]
struct InstanceSession {
    status: InstanceStatus,
    sync_key: u64,
    synchronized: bool,
    last_synchronization_id: Option<String>,
}

/// Options for [`StreamingConnection::wait_synchronized`].
#[derive(Debug, Clone)]
pub struct WaitSynchronizedOptions {
    /// Application pattern the account was subscribed with.
    pub application_pattern: Option<String>,
    /// Wait for this specific synchronization round instead of any.
    pub synchronization_id: Option<String>,
    /// Wait for one specific replica instead of any.
    pub instance_index: Option<String>,
    /// Overall wait bound.
    pub timeout: Duration,
    /// Poll interval.
    pub interval: Duration,
}

impl Default for WaitSynchronizedOptions {
    fn default() -> Self {
        Self {
            application_pattern: None,
            synchronization_id: None,
            instance_index: None,
            timeout: DEFAULT_WAIT_SYNCHRONIZED_TIMEOUT,
            interval: Duration::from_millis(1000),
        }
    }
}

/// Orchestrates subscribe, synchronize, resubscribe and lifecycle for one
/// account.
pub struct StreamingConnection {
    account_id: String,
    account_type: String,
    application: String,
    transport: TransportClient,
    terminal_state: Arc<TerminalState>,
    health_monitor: Arc<ConnectionHealthMonitor>,
    history_storage: Arc<dyn HistoryStorage>,
    listeners: RwLock<Vec<Arc<dyn SynchronizationListener>>>,
    sessions: RwLock<HashMap<String, InstanceSession>>,
    subscriptions: RwLock<HashMap<String, Vec<MarketDataSubscription>>>,
    sync_key_counter: AtomicU64,
    connected: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
    self_ref: Weak<Self>,
}

impl StreamingConnection {
    /// Create a connection with an in-memory history sink.
    #[must_use]
    pub fn new(
        account_id: impl Into<String>,
        account_type: impl Into<String>,
        transport: TransportClient,
        options: &ConnectionOptions,
    ) -> Arc<Self> {
        Self::with_history_storage(
            account_id,
            account_type,
            transport,
            options,
            Arc::new(MemoryHistoryStorage::new()),
        )
    }

    /// Create a connection with a caller-supplied history sink.
    #[must_use]
    pub fn with_history_storage(
        account_id: impl Into<String>,
        account_type: impl Into<String>,
        transport: TransportClient,
        options: &ConnectionOptions,
        history_storage: Arc<dyn HistoryStorage>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            account_id: account_id.into(),
            account_type: account_type.into(),
            application: options.application.clone(),
            transport,
            terminal_state: Arc::new(TerminalState::new()),
            health_monitor: Arc::new(ConnectionHealthMonitor::default()),
            history_storage,
            listeners: RwLock::new(Vec::new()),
            sessions: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            sync_key_counter: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// The mirrored terminal state.
    #[must_use]
    pub fn terminal_state(&self) -> &Arc<TerminalState> {
        &self.terminal_state
    }

    /// The connection health monitor.
    #[must_use]
    pub fn health_monitor(&self) -> &Arc<ConnectionHealthMonitor> {
        &self.health_monitor
    }

    /// The history sink.
    #[must_use]
    pub fn history_storage(&self) -> &Arc<dyn HistoryStorage> {
        &self.history_storage
    }

    /// Register an additional synchronization listener.
    pub fn add_synchronization_listener(&self, listener: Arc<dyn SynchronizationListener>) {
        self.listeners.write().push(listener);
    }

    /// Remove a previously registered listener.
    pub fn remove_synchronization_listener(&self, listener: &Arc<dyn SynchronizationListener>) {
        self.listeners
            .write()
            .retain(|known| !Arc::ptr_eq(known, listener));
    }

    /// Install the account listener, open the transport, and subscribe.
    ///
    /// Idempotent: the first call does the work, later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Propagates transport connect failures. Subscribe failures are logged
    /// and recovered by the resubscribe-on-reconnect path.
    pub async fn connect(self: &Arc<Self>) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::not_connected("connection is closed"));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.transport.add_account_listener(
            self.account_id.clone(),
            Arc::clone(self) as Arc<dyn PacketListener>,
        );
        self.transport.connect().await?;

        if let Err(e) = self.subscribe().await {
            tracing::warn!(account_id = %self.account_id, error = %e, "Initial subscribe failed");
        }

        // Background uptime sampling and hourly reporting.
        let monitor = Arc::clone(&self.health_monitor);
        let sampling_shutdown = self.shutdown.clone();
        tokio::spawn(async move { monitor.run(sampling_shutdown).await });

        let connection = Arc::clone(self);
        tokio::spawn(async move { connection.uptime_report_loop().await });

        Ok(())
    }

    /// Ask the server to add this client to the account's replica set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] while the socket is down.
    pub async fn subscribe(&self) -> Result<(), Error> {
        self.transport
            .send_event(&self.account_id, json!({"type": "subscribe"}))
            .await
    }

    /// One synchronization request for an instance, carrying the mirror's
    /// content hashes so the server can skip unchanged collections.
    ///
    /// # Errors
    ///
    /// Propagates transport and server errors; the scheduled retry loop is
    /// the usual caller.
    pub async fn synchronize(&self, instance_index: &str) -> Result<(), Error> {
        let hashes = self.terminal_state.get_hashes(&self.account_type, instance_index);
        let (instance_number, host) = split_instance_index(instance_index);

        let mut payload = json!({
            "type": "synchronize",
            "instanceIndex": instance_number,
            "application": self.application,
            "specificationsMd5": hashes.specifications_hash,
            "positionsMd5": hashes.positions_hash,
            "ordersMd5": hashes.orders_hash,
        });
        if let Some(host) = host {
            payload["host"] = Value::from(host);
        }
        if let Some(time) = self.history_storage.last_history_order_time() {
            payload["startingHistoryOrderTime"] =
                Value::from(time.to_rfc3339_opts(SecondsFormat::Millis, true));
        }
        if let Some(time) = self.history_storage.last_deal_time() {
            payload["startingDealTime"] =
                Value::from(time.to_rfc3339_opts(SecondsFormat::Millis, true));
        }

        let synchronization_id = crate::transport::random_request_id();
        {
            let mut sessions = self.sessions.write();
            let session = sessions.entry(instance_index.to_string()).or_default();
            session.last_synchronization_id = Some(synchronization_id.clone());
        }

        self.transport
            .request_with_id(&self.account_id, &synchronization_id, payload)
            .await?;
        Ok(())
    }

    /// Whether an instance (or any, when `None`) reports synchronized.
    #[must_use]
    pub fn is_synchronized(&self, instance_index: Option<&str>) -> bool {
        let sessions = self.sessions.read();
        match instance_index {
            Some(instance) => sessions.get(instance).is_some_and(|s| s.synchronized),
            None => sessions.values().any(|s| s.synchronized),
        }
    }

    /// Current lifecycle status of an instance.
    #[must_use]
    pub fn instance_status(&self, instance_index: &str) -> Option<InstanceStatus> {
        self.sessions.read().get(instance_index).map(|s| s.status)
    }

    /// Poll until the chosen instance reports synchronized.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the bound elapses first.
    pub async fn wait_synchronized(&self, options: &WaitSynchronizedOptions) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + options.timeout;
        loop {
            let done = match &options.synchronization_id {
                Some(id) => self.sessions.read().values().any(|s| {
                    s.synchronized && s.last_synchronization_id.as_deref() == Some(id)
                }),
                None => self.is_synchronized(options.instance_index.as_deref()),
            };
            if done {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::timeout(format!(
                    "Timed out waiting for account {} to synchronize",
                    self.account_id
                )));
            }
            tokio::time::sleep(options.interval).await;
        }
    }

    /// Subscribe to market data for a symbol and await its first price
    /// (callers default the bound to
    /// [`DEFAULT_MARKET_DATA_TIMEOUT`]).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when no price arrives in time, and
    /// propagates request errors.
    pub async fn subscribe_to_market_data(
        &self,
        symbol: &str,
        subscriptions: Vec<MarketDataSubscription>,
        instance_index: &str,
        timeout: Duration,
    ) -> Result<SymbolPrice, Error> {
        self.subscriptions
            .write()
            .insert(symbol.to_string(), subscriptions.clone());
        self.health_monitor.set_quotes_expected(true);

        let (instance_number, _) = split_instance_index(instance_index);
        let payload = json!({
            "type": "subscribeToMarketData",
            "symbol": symbol,
            "subscriptions": subscriptions,
            "instanceIndex": instance_number,
        });
        self.transport.request(&self.account_id, payload).await?;

        self.terminal_state
            .wait_for_price(symbol, timeout)
            .await
            .ok_or_else(|| {
                Error::timeout(format!("Timed out waiting for the first {symbol} price"))
            })
    }

    /// Unsubscribe from a symbol's market data.
    ///
    /// # Errors
    ///
    /// Propagates request errors.
    pub async fn unsubscribe_from_market_data(&self, symbol: &str) -> Result<(), Error> {
        self.subscriptions.write().remove(symbol);
        if self.subscriptions.read().is_empty() {
            self.health_monitor.set_quotes_expected(false);
        }
        self.transport
            .request(
                &self.account_id,
                json!({"type": "unsubscribeFromMarketData", "symbol": symbol}),
            )
            .await?;
        Ok(())
    }

    /// Symbols with an active market data subscription.
    #[must_use]
    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.subscriptions.read().keys().cloned().collect()
    }

    /// Active subscriptions for one symbol.
    #[must_use]
    pub fn subscriptions(&self, symbol: &str) -> Option<Vec<MarketDataSubscription>> {
        self.subscriptions.read().get(symbol).cloned()
    }

    /// Ask the server to delete the account's stored history.
    ///
    /// # Errors
    ///
    /// Propagates request errors.
    pub async fn remove_history(&self, application: Option<&str>) -> Result<(), Error> {
        let mut payload = json!({"type": "removeHistory"});
        if let Some(application) = application {
            payload["application"] = Value::from(application);
        }
        self.transport.request(&self.account_id, payload).await?;
        Ok(())
    }

    /// Ask the server to delete all application data for the account.
    ///
    /// # Errors
    ///
    /// Propagates request errors.
    pub async fn remove_application(&self) -> Result<(), Error> {
        self.transport
            .request(&self.account_id, json!({"type": "removeApplication"}))
            .await?;
        Ok(())
    }

    /// Close the session: unsubscribe, detach from the transport, and notify
    /// stream closure for every known instance.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        if let Err(e) = self
            .transport
            .send_event(&self.account_id, json!({"type": "unsubscribe"}))
            .await
        {
            tracing::debug!(error = %e, "Unsubscribe on close failed");
        }
        self.transport.remove_account_listener(&self.account_id);

        let instances: Vec<String> = self.sessions.read().keys().cloned().collect();
        for instance in instances {
            if let Some(session) = self.sessions.write().get_mut(&instance) {
                session.status = InstanceStatus::Closed;
                session.synchronized = false;
            }
            for listener in self.all_listeners() {
                if let Err(e) = listener.on_stream_closed(&instance).await {
                    tracing::warn!(error = %e, "Listener failed to handle stream close");
                }
            }
        }
    }

    fn all_listeners(&self) -> Vec<Arc<dyn SynchronizationListener>> {
        let mut listeners: Vec<Arc<dyn SynchronizationListener>> = vec![
            Arc::clone(&self.terminal_state) as Arc<dyn SynchronizationListener>,
            Arc::clone(&self.health_monitor) as Arc<dyn SynchronizationListener>,
        ];
        listeners.extend(self.listeners.read().iter().cloned());
        listeners
    }

    /// Start (or restart) the synchronization retry loop for an instance.
    /// The freshly issued key invalidates any loop still running for an
    /// older round.
    fn schedule_synchronize(&self, instance_index: String) {
        let key = self.sync_key_counter.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut sessions = self.sessions.write();
            let session = sessions.entry(instance_index.clone()).or_default();
            session.sync_key = key;
            session.status = InstanceStatus::Synchronizing;
        }

        let Some(connection) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            connection.synchronization_loop(instance_index, key).await;
        });
    }

    /// Invalidate the retry loop for an instance without starting a new one.
    fn cancel_synchronize(&self, instance_index: &str) {
        let key = self.sync_key_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(session) = self.sessions.write().get_mut(instance_index) {
            session.sync_key = key;
        }
    }

    fn owns_sync(&self, instance_index: &str, key: u64) -> bool {
        self.sessions
            .read()
            .get(instance_index)
            .is_some_and(|s| s.sync_key == key)
    }

    async fn synchronization_loop(&self, instance_index: String, key: u64) {
        let mut retry_interval = SYNC_RETRY_INTERVAL;
        loop {
            if self.shutdown.is_cancelled() || !self.owns_sync(&instance_index, key) {
                return;
            }

            match self.synchronize(&instance_index).await {
                Ok(()) => {
                    // A successful ack marks the instance synchronized and
                    // resets the back-off; the server now drives the
                    // listener through the synchronization events.
                    if self.owns_sync(&instance_index, key) {
                        if let Some(session) = self.sessions.write().get_mut(&instance_index) {
                            session.synchronized = true;
                        }
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        account_id = %self.account_id,
                        instance_index = %instance_index,
                        error = %e,
                        retry_in_s = retry_interval.as_secs(),
                        "Synchronization attempt failed"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(retry_interval) => {}
                        () = self.shutdown.cancelled() => return,
                    }
                    retry_interval = (retry_interval * 2).min(SYNC_RETRY_CAP);
                }
            }
        }
    }

    async fn uptime_report_loop(&self) {
        let mut interval = tokio::time::interval(UPTIME_REPORT_INTERVAL);
        interval.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let uptime = self.health_monitor.uptime();
                    let payload = json!({"type": "saveUptime", "uptime": uptime});
                    if let Err(e) = self.transport.request(&self.account_id, payload).await {
                        tracing::warn!(account_id = %self.account_id, error = %e, "Uptime report failed");
                    }
                }
                () = self.shutdown.cancelled() => break,
            }
        }
    }

    async fn route_packet(&self, packet: Packet) {
        let body = &packet.body;
        let instance_index = instance_index_of(body);

        match packet.packet_type.as_str() {
            "authenticated" => {
                #[allow(clippy::cast_possible_truncation)]
                let replicas = body
                    .get("replicas")
                    .and_then(Value::as_u64)
                    .unwrap_or(1) as usize;
                {
                    let mut sessions = self.sessions.write();
                    let session = sessions.entry(instance_index.clone()).or_default();
                    session.status = InstanceStatus::Subscribed;
                }
                for listener in self.all_listeners() {
                    if let Err(e) = listener.on_connected(&instance_index, replicas).await {
                        tracing::warn!(error = %e, "Listener failed to handle connect");
                    }
                }
                self.schedule_synchronize(instance_index);
            }
            "disconnected" => {
                self.cancel_synchronize(&instance_index);
                if let Some(session) = self.sessions.write().get_mut(&instance_index) {
                    session.status = InstanceStatus::Disconnected;
                    session.synchronized = false;
                }
                for listener in self.all_listeners() {
                    if let Err(e) = listener.on_disconnected(&instance_index).await {
                        tracing::warn!(error = %e, "Listener failed to handle disconnect");
                    }
                }
            }
            "status" => {
                if let Some(connected) = body.get("connected").and_then(Value::as_bool) {
                    for listener in self.all_listeners() {
                        if let Err(e) = listener
                            .on_broker_connection_status_changed(&instance_index, connected)
                            .await
                        {
                            tracing::warn!(error = %e, "Listener failed to handle status");
                        }
                    }
                }
                if let Some(status) = parse_field::<HealthStatus>(body, "healthStatus") {
                    for listener in self.all_listeners() {
                        if let Err(e) = listener
                            .on_health_status(&instance_index, status.clone())
                            .await
                        {
                            tracing::warn!(error = %e, "Listener failed to handle health status");
                        }
                    }
                }
            }
            "healthStatus" => {
                if let Some(status) = parse_field::<HealthStatus>(body, "healthStatus") {
                    for listener in self.all_listeners() {
                        if let Err(e) = listener
                            .on_health_status(&instance_index, status.clone())
                            .await
                        {
                            tracing::warn!(error = %e, "Listener failed to handle health status");
                        }
                    }
                }
            }
            "synchronizationStarted" => {
                let flag = |field: &str| body.get(field).and_then(Value::as_bool).unwrap_or(true);
                let specifications_updated = flag("specificationsUpdated");
                let positions_updated = flag("positionsUpdated");
                let orders_updated = flag("ordersUpdated");
                for listener in self.all_listeners() {
                    if let Err(e) = listener
                        .on_synchronization_started(
                            &instance_index,
                            specifications_updated,
                            positions_updated,
                            orders_updated,
                        )
                        .await
                    {
                        tracing::warn!(error = %e, "Listener failed to handle sync start");
                    }
                }
            }
            "accountInformation" => {
                if let Some(account_information) =
                    parse_field::<AccountInformation>(body, "accountInformation")
                {
                    for listener in self.all_listeners() {
                        if let Err(e) = listener
                            .on_account_information_updated(
                                &instance_index,
                                account_information.clone(),
                            )
                            .await
                        {
                            tracing::warn!(error = %e, "Listener failed to handle account information");
                        }
                    }
                }
            }
            "positions" => {
                let positions =
                    parse_field::<Vec<Position>>(body, "positions").unwrap_or_default();
                let synchronization_id = synchronization_id_of(body);
                for listener in self.all_listeners() {
                    if let Err(e) = listener
                        .on_positions_replaced(&instance_index, positions.clone())
                        .await
                    {
                        tracing::warn!(error = %e, "Listener failed to handle positions");
                    }
                }
                for listener in self.all_listeners() {
                    if let Err(e) = listener
                        .on_positions_synchronized(&instance_index, &synchronization_id)
                        .await
                    {
                        tracing::warn!(error = %e, "Listener failed to handle position sync");
                    }
                }
            }
            "orders" => {
                let orders = parse_field::<Vec<Order>>(body, "orders").unwrap_or_default();
                let synchronization_id = synchronization_id_of(body);
                for listener in self.all_listeners() {
                    if let Err(e) = listener
                        .on_pending_orders_replaced(&instance_index, orders.clone())
                        .await
                    {
                        tracing::warn!(error = %e, "Listener failed to handle orders");
                    }
                }
                for listener in self.all_listeners() {
                    if let Err(e) = listener
                        .on_pending_orders_synchronized(&instance_index, &synchronization_id)
                        .await
                    {
                        tracing::warn!(error = %e, "Listener failed to handle order sync");
                    }
                }
            }
            "specifications" => {
                let updates =
                    parse_field::<Vec<SymbolSpecification>>(body, "specifications")
                        .unwrap_or_default();
                let removed =
                    parse_field::<Vec<String>>(body, "removedSymbols").unwrap_or_default();
                for listener in self.all_listeners() {
                    if let Err(e) = listener
                        .on_symbol_specifications_updated(
                            &instance_index,
                            updates.clone(),
                            removed.clone(),
                        )
                        .await
                    {
                        tracing::warn!(error = %e, "Listener failed to handle specifications");
                    }
                }
            }
            "update" => self.route_update(&instance_index, body).await,
            "prices" => {
                let prices = parse_field::<Vec<SymbolPrice>>(body, "prices").unwrap_or_default();
                let equity = body.get("equity").and_then(Value::as_f64);
                let margin = body.get("margin").and_then(Value::as_f64);
                let free_margin = body.get("freeMargin").and_then(Value::as_f64);
                let margin_level = body.get("marginLevel").and_then(Value::as_f64);
                for listener in self.all_listeners() {
                    if let Err(e) = listener
                        .on_symbol_prices_updated(
                            &instance_index,
                            prices.clone(),
                            equity,
                            margin,
                            free_margin,
                            margin_level,
                        )
                        .await
                    {
                        tracing::warn!(error = %e, "Listener failed to handle prices");
                    }
                }
            }
            "dealSynchronizationFinished" => {
                let synchronization_id = synchronization_id_of(body);
                if let Some(session) = self.sessions.write().get_mut(&instance_index) {
                    session.synchronized = true;
                    session.status = InstanceStatus::Synchronized;
                }
                if let Err(e) = self
                    .history_storage
                    .on_deals_synchronized(&instance_index, &synchronization_id)
                    .await
                {
                    tracing::warn!(error = %e, "History storage failed to handle deal sync");
                }
                for listener in self.all_listeners() {
                    if let Err(e) = listener
                        .on_deals_synchronized(&instance_index, &synchronization_id)
                        .await
                    {
                        tracing::warn!(error = %e, "Listener failed to handle deal sync");
                    }
                }
            }
            "orderSynchronizationFinished" => {
                let synchronization_id = synchronization_id_of(body);
                if let Err(e) = self
                    .history_storage
                    .on_history_orders_synchronized(&instance_index, &synchronization_id)
                    .await
                {
                    tracing::warn!(error = %e, "History storage failed to handle history sync");
                }
                for listener in self.all_listeners() {
                    if let Err(e) = listener
                        .on_history_orders_synchronized(&instance_index, &synchronization_id)
                        .await
                    {
                        tracing::warn!(error = %e, "Listener failed to handle history sync");
                    }
                }
            }
            "downgradeSubscription" => {
                let symbol = body
                    .get("symbol")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let updates = parse_field::<Vec<MarketDataSubscription>>(body, "updates")
                    .unwrap_or_default();
                let unsubscriptions = subscription_types(body.get("unsubscriptions"));
                self.apply_subscription_downgrade(&symbol, &updates, &unsubscriptions);
                for listener in self.all_listeners() {
                    if let Err(e) = listener
                        .on_subscription_downgraded(
                            &instance_index,
                            &symbol,
                            updates.clone(),
                            unsubscriptions.clone(),
                        )
                        .await
                    {
                        tracing::warn!(error = %e, "Listener failed to handle downgrade");
                    }
                }
            }
            other => {
                tracing::debug!(packet_type = %other, "Ignoring unhandled packet type");
            }
        }
    }

    async fn route_update(&self, instance_index: &str, body: &Value) {
        if let Some(account_information) =
            parse_field::<AccountInformation>(body, "accountInformation")
        {
            for listener in self.all_listeners() {
                if let Err(e) = listener
                    .on_account_information_updated(instance_index, account_information.clone())
                    .await
                {
                    tracing::warn!(error = %e, "Listener failed to handle account information");
                }
            }
        }

        for position in parse_field::<Vec<Position>>(body, "updatedPositions").unwrap_or_default()
        {
            for listener in self.all_listeners() {
                if let Err(e) = listener
                    .on_position_updated(instance_index, position.clone())
                    .await
                {
                    tracing::warn!(error = %e, "Listener failed to handle position update");
                }
            }
        }

        for position_id in
            parse_field::<Vec<String>>(body, "removedPositionIds").unwrap_or_default()
        {
            for listener in self.all_listeners() {
                if let Err(e) = listener
                    .on_position_removed(instance_index, &position_id)
                    .await
                {
                    tracing::warn!(error = %e, "Listener failed to handle position removal");
                }
            }
        }

        for order in parse_field::<Vec<Order>>(body, "updatedOrders").unwrap_or_default() {
            for listener in self.all_listeners() {
                if let Err(e) = listener
                    .on_pending_order_updated(instance_index, order.clone())
                    .await
                {
                    tracing::warn!(error = %e, "Listener failed to handle order update");
                }
            }
        }

        for order_id in parse_field::<Vec<String>>(body, "completedOrderIds").unwrap_or_default()
        {
            for listener in self.all_listeners() {
                if let Err(e) = listener
                    .on_pending_order_completed(instance_index, &order_id)
                    .await
                {
                    tracing::warn!(error = %e, "Listener failed to handle order completion");
                }
            }
        }

        let specification_updates =
            parse_field::<Vec<SymbolSpecification>>(body, "specifications").unwrap_or_default();
        let removed_symbols =
            parse_field::<Vec<String>>(body, "removedSymbols").unwrap_or_default();
        if !specification_updates.is_empty() || !removed_symbols.is_empty() {
            for listener in self.all_listeners() {
                if let Err(e) = listener
                    .on_symbol_specifications_updated(
                        instance_index,
                        specification_updates.clone(),
                        removed_symbols.clone(),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Listener failed to handle specifications");
                }
            }
        }

        for order in parse_field::<Vec<Order>>(body, "historyOrders").unwrap_or_default() {
            if let Err(e) = self
                .history_storage
                .on_history_order_added(instance_index, order.clone())
                .await
            {
                tracing::warn!(error = %e, "History storage failed to store order");
            }
            for listener in self.all_listeners() {
                if let Err(e) = listener
                    .on_history_order_added(instance_index, order.clone())
                    .await
                {
                    tracing::warn!(error = %e, "Listener failed to handle history order");
                }
            }
        }

        for deal in parse_field::<Vec<Deal>>(body, "deals").unwrap_or_default() {
            if let Err(e) = self
                .history_storage
                .on_deal_added(instance_index, deal.clone())
                .await
            {
                tracing::warn!(error = %e, "History storage failed to store deal");
            }
            for listener in self.all_listeners() {
                if let Err(e) = listener.on_deal_added(instance_index, deal.clone()).await {
                    tracing::warn!(error = %e, "Listener failed to handle deal");
                }
            }
        }
    }

    fn apply_subscription_downgrade(
        &self,
        symbol: &str,
        updates: &[MarketDataSubscription],
        unsubscriptions: &[String],
    ) {
        let mut subscriptions = self.subscriptions.write();
        let Some(existing) = subscriptions.get_mut(symbol) else {
            return;
        };

        for update in updates {
            match existing
                .iter_mut()
                .find(|s| s.subscription_type == update.subscription_type)
            {
                Some(subscription) => *subscription = update.clone(),
                None => existing.push(update.clone()),
            }
        }
        existing.retain(|s| !unsubscriptions.contains(&s.subscription_type));
        if existing.is_empty() {
            subscriptions.remove(symbol);
        }
    }
}

#[async_trait]
impl PacketListener for StreamingConnection {
    async fn on_packet(&self, packet: Packet) {
        self.route_packet(packet).await;
    }

    async fn on_reconnected(&self) {
        // Sessions restart from scratch; the server re-authenticates each
        // replica, which re-queues synchronization.
        for session in self.sessions.write().values_mut() {
            session.status = InstanceStatus::Created;
            session.synchronized = false;
        }
        if let Err(e) = self.subscribe().await {
            tracing::warn!(account_id = %self.account_id, error = %e, "Resubscribe after reconnect failed");
        }
    }
}

/// Derive the composite instance index (`"0"` or `"0:ps-mpa-1"`) of a packet.
fn instance_index_of(body: &Value) -> String {
    let number = body
        .get("instanceIndex")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    match body.get("host").and_then(Value::as_str) {
        Some(host) => format!("{number}:{host}"),
        None => number.to_string(),
    }
}

/// Split a composite instance index back into number and host.
fn split_instance_index(instance_index: &str) -> (u64, Option<&str>) {
    match instance_index.split_once(':') {
        Some((number, host)) => (number.parse().unwrap_or(0), Some(host)),
        None => (instance_index.parse().unwrap_or(0), None),
    }
}

fn synchronization_id_of(body: &Value) -> String {
    body.get("synchronizationId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Deserialize one field of a packet body, logging and skipping on mismatch
/// so a malformed section never stalls the dispatcher.
fn parse_field<T: DeserializeOwned>(body: &Value, field: &str) -> Option<T> {
    let value = body.get(field)?.clone();
    match serde_json::from_value(value) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::warn!(field = %field, error = %e, "Dropping malformed packet field");
            None
        }
    }
}

/// Parse an unsubscription list that may carry plain strings or
/// `{"type": ...}` objects.
fn subscription_types(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    item.as_str()
                        .or_else(|| item.get("type").and_then(Value::as_str))
                        .map(ToString::to_string)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connection() -> Arc<StreamingConnection> {
        let options = ConnectionOptions::new("token");
        let transport = TransportClient::with_url("ws://127.0.0.1:1/ws", &options);
        StreamingConnection::new("account-1", "cloud-g2", transport, &options)
    }

    fn packet(packet_type: &str, body: Value) -> Packet {
        Packet {
            packet_type: packet_type.to_string(),
            account_id: Some("account-1".to_string()),
            request_id: None,
            body,
        }
    }

    #[test]
    fn instance_index_composition() {
        assert_eq!(instance_index_of(&json!({"instanceIndex": 1})), "1");
        assert_eq!(
            instance_index_of(&json!({"instanceIndex": 0, "host": "ps-mpa-1"})),
            "0:ps-mpa-1"
        );
        assert_eq!(instance_index_of(&json!({})), "0");

        assert_eq!(split_instance_index("0:ps-mpa-1"), (0, Some("ps-mpa-1")));
        assert_eq!(split_instance_index("2"), (2, None));
    }

    #[tokio::test]
    async fn authenticated_marks_session_and_terminal_state() {
        let connection = connection();
        connection
            .route_packet(packet(
                "authenticated",
                json!({"instanceIndex": 0, "replicas": 2}),
            ))
            .await;

        // The session enters the state machine (the spawned sync loop flips
        // it to Synchronizing, so accept either phase here).
        let status = connection.instance_status("0").unwrap();
        assert!(
            status == InstanceStatus::Subscribed || status == InstanceStatus::Synchronizing,
            "status = {status:?}"
        );
        assert!(connection.terminal_state().connected());
    }

    #[tokio::test]
    async fn positions_packet_replaces_and_synchronizes() {
        let connection = connection();
        connection
            .route_packet(packet(
                "positions",
                json!({
                    "instanceIndex": 0,
                    "synchronizationId": "sync-1",
                    "positions": [{
                        "id": "1",
                        "type": "BUY",
                        "symbol": "EURUSD",
                        "time": "2024-06-01T12:00:00.000Z",
                        "openPrice": 1.1,
                        "volume": 0.1
                    }]
                }),
            ))
            .await;
        connection
            .route_packet(packet(
                "orders",
                json!({"instanceIndex": 0, "synchronizationId": "sync-1", "orders": []}),
            ))
            .await;

        // Orders sync promoted the instance, so the combined view holds the
        // position.
        let positions = connection.terminal_state().positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].id, "1");
    }

    #[tokio::test]
    async fn deal_sync_finished_reports_synchronized() {
        let connection = connection();
        connection
            .route_packet(packet("authenticated", json!({"instanceIndex": 0})))
            .await;
        assert!(!connection.is_synchronized(Some("0")));

        connection
            .route_packet(packet(
                "dealSynchronizationFinished",
                json!({"instanceIndex": 0, "synchronizationId": "sync-1"}),
            ))
            .await;
        assert!(connection.is_synchronized(Some("0")));
        assert!(connection.is_synchronized(None));
        assert_eq!(
            connection.instance_status("0"),
            Some(InstanceStatus::Synchronized)
        );

        connection
            .route_packet(packet("disconnected", json!({"instanceIndex": 0})))
            .await;
        assert!(!connection.is_synchronized(Some("0")));
        assert_eq!(
            connection.instance_status("0"),
            Some(InstanceStatus::Disconnected)
        );
    }

    #[tokio::test]
    async fn update_packet_routes_sections() {
        let connection = connection();
        connection
            .route_packet(packet(
                "orders",
                json!({"instanceIndex": 0, "synchronizationId": "s", "orders": []}),
            ))
            .await;

        connection
            .route_packet(packet(
                "update",
                json!({
                    "instanceIndex": 0,
                    "updatedPositions": [{
                        "id": "42",
                        "type": "SELL",
                        "symbol": "GBPUSD",
                        "time": "2024-06-01T12:00:00.000Z",
                        "openPrice": 1.25,
                        "volume": 0.2
                    }],
                    "historyOrders": [{
                        "id": "900",
                        "type": "BUY",
                        "state": "ORDER_STATE_FILLED",
                        "symbol": "EURUSD",
                        "time": "2024-06-01T11:00:00.000Z",
                        "openPrice": 1.0,
                        "volume": 0.1,
                        "currentVolume": 0.0
                    }],
                    "deals": [{
                        "id": "700",
                        "type": "DEAL_TYPE_BUY",
                        "time": "2024-06-01T11:00:01.000Z"
                    }]
                }),
            ))
            .await;

        assert_eq!(connection.terminal_state().positions().len(), 1);
        assert_eq!(
            connection.terminal_state().position("42").unwrap().symbol,
            "GBPUSD"
        );
        assert_eq!(
            connection.history_storage().last_deal_time().unwrap(),
            chrono::DateTime::parse_from_rfc3339("2024-06-01T11:00:01.000Z").unwrap()
        );

        connection
            .route_packet(packet(
                "update",
                json!({"instanceIndex": 0, "removedPositionIds": ["42"]}),
            ))
            .await;
        assert!(connection.terminal_state().positions().is_empty());
    }

    #[tokio::test]
    async fn prices_packet_reaches_terminal_state_and_health() {
        let connection = connection();
        connection
            .route_packet(packet(
                "orders",
                json!({"instanceIndex": 0, "synchronizationId": "s", "orders": []}),
            ))
            .await;

        connection.health_monitor().set_quotes_expected(true);
        assert!(!connection.health_monitor().quote_streaming_healthy());

        connection
            .route_packet(packet(
                "prices",
                json!({
                    "instanceIndex": 0,
                    "prices": [{
                        "symbol": "EURUSD",
                        "bid": 1.1,
                        "ask": 1.2,
                        "time": "2024-06-01T12:00:00.000Z"
                    }]
                }),
            ))
            .await;

        assert!(connection.terminal_state().price("EURUSD").is_some());
        assert!(connection.health_monitor().quote_streaming_healthy());
    }

    #[tokio::test]
    async fn status_packet_updates_broker_connection() {
        let connection = connection();
        connection
            .route_packet(packet(
                "status",
                json!({"instanceIndex": 0, "connected": true}),
            ))
            .await;
        assert!(connection.terminal_state().connected_to_broker());

        connection
            .route_packet(packet(
                "status",
                json!({"instanceIndex": 0, "connected": false}),
            ))
            .await;
        assert!(!connection.terminal_state().connected_to_broker());
    }

    #[tokio::test]
    async fn downgrade_prunes_local_subscriptions() {
        let connection = connection();
        connection.subscriptions.write().insert(
            "EURUSD".to_string(),
            vec![
                MarketDataSubscription {
                    subscription_type: "quotes".to_string(),
                    interval_in_milliseconds: Some(1000),
                },
                MarketDataSubscription {
                    subscription_type: "marketDepth".to_string(),
                    interval_in_milliseconds: None,
                },
            ],
        );

        connection
            .route_packet(packet(
                "downgradeSubscription",
                json!({
                    "instanceIndex": 0,
                    "symbol": "EURUSD",
                    "updates": [{"type": "quotes", "intervalInMilliseconds": 30000}],
                    "unsubscriptions": [{"type": "marketDepth"}]
                }),
            ))
            .await;

        let subscriptions = connection.subscriptions("EURUSD").unwrap();
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].subscription_type, "quotes");
        assert_eq!(subscriptions[0].interval_in_milliseconds, Some(30_000));
    }

    #[tokio::test]
    async fn failing_listener_does_not_stall_dispatch() {
        struct FailingListener;

        #[async_trait]
        impl SynchronizationListener for FailingListener {
            async fn on_position_updated(
                &self,
                _instance_index: &str,
                _position: Position,
            ) -> Result<(), Error> {
                Err(Error::Internal {
                    message: "listener exploded".to_string(),
                })
            }
        }

        let connection = connection();
        connection.add_synchronization_listener(Arc::new(FailingListener));
        connection
            .route_packet(packet(
                "orders",
                json!({"instanceIndex": 0, "synchronizationId": "s", "orders": []}),
            ))
            .await;

        connection
            .route_packet(packet(
                "update",
                json!({
                    "instanceIndex": 0,
                    "updatedPositions": [{
                        "id": "1",
                        "type": "BUY",
                        "symbol": "EURUSD",
                        "time": "2024-06-01T12:00:00.000Z",
                        "openPrice": 1.1,
                        "volume": 0.1
                    }]
                }),
            ))
            .await;

        // The terminal state listener ran despite the failing one.
        assert_eq!(connection.terminal_state().positions().len(), 1);
    }

    #[tokio::test]
    async fn wait_synchronized_times_out() {
        let connection = connection();
        let options = WaitSynchronizedOptions {
            timeout: Duration::from_millis(30),
            interval: Duration::from_millis(5),
            ..WaitSynchronizedOptions::default()
        };
        let err = connection.wait_synchronized(&options).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn wait_synchronized_matches_specific_sync_id() {
        let connection = connection();
        {
            let mut sessions = connection.sessions.write();
            let session = sessions.entry("0".to_string()).or_default();
            session.synchronized = true;
            session.last_synchronization_id = Some("sync-7".to_string());
        }

        let matching = WaitSynchronizedOptions {
            synchronization_id: Some("sync-7".to_string()),
            timeout: Duration::from_millis(50),
            interval: Duration::from_millis(5),
            ..WaitSynchronizedOptions::default()
        };
        assert!(connection.wait_synchronized(&matching).await.is_ok());

        let other = WaitSynchronizedOptions {
            synchronization_id: Some("sync-8".to_string()),
            timeout: Duration::from_millis(30),
            interval: Duration::from_millis(5),
            ..WaitSynchronizedOptions::default()
        };
        assert!(connection.wait_synchronized(&other).await.is_err());
    }
}
