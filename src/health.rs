//! Connection health scoring and uptime accounting.
//!
//! The monitor listens to the synchronization stream, keeps the boolean
//! health signals current, and samples the composite verdict at a fixed
//! interval into rolling windows for uptime percentages.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::models::{HealthStatus, SymbolPrice};
use crate::sync::SynchronizationListener;

/// Configuration for health scoring and uptime windows.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Maximum quote age while quotes are expected.
    pub staleness_threshold: Duration,
    /// Interval between uptime samples.
    pub sample_interval: Duration,
    /// Named rolling windows for uptime percentages.
    pub windows: Vec<(String, Duration)>,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(60),
            sample_interval: Duration::from_secs(1),
            windows: vec![
                ("1h".to_string(), Duration::from_secs(60 * 60)),
                ("1d".to_string(), Duration::from_secs(24 * 60 * 60)),
                ("1w".to_string(), Duration::from_secs(7 * 24 * 60 * 60)),
            ],
        }
    }
}

/// Composite health verdict with the reasons for an unhealthy one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHealth {
    /// Client is authenticated on at least one replica.
    pub connected: bool,
    /// The replica reports a live broker connection.
    pub connected_to_broker: bool,
    /// Quotes are flowing recently enough, or none are expected.
    pub quote_streaming_healthy: bool,
    /// The account is synchronized.
    pub synchronized: bool,
    /// AND of the four signals.
    pub healthy: bool,
    /// Reasons for an unhealthy verdict.
    pub issues: Vec<String>,
}

/// Listener that scores connection health and accounts uptime.
pub struct ConnectionHealthMonitor {
    config: HealthMonitorConfig,
    connected: AtomicBool,
    connected_to_broker: AtomicBool,
    synchronized: AtomicBool,
    quotes_expected: AtomicBool,
    last_quote: Mutex<Option<Instant>>,
    server_health: RwLock<Option<HealthStatus>>,
    samples: Mutex<VecDeque<(Instant, bool)>>,
}

impl Default for ConnectionHealthMonitor {
    fn default() -> Self {
        Self::new(HealthMonitorConfig::default())
    }
}

impl ConnectionHealthMonitor {
    /// Create a monitor with the given configuration.
    #[must_use]
    pub fn new(config: HealthMonitorConfig) -> Self {
        Self {
            config,
            connected: AtomicBool::new(false),
            connected_to_broker: AtomicBool::new(false),
            synchronized: AtomicBool::new(false),
            quotes_expected: AtomicBool::new(false),
            last_quote: Mutex::new(None),
            server_health: RwLock::new(None),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Tell the monitor whether market data subscriptions exist; without
    /// them a silent quote stream is not a failure.
    pub fn set_quotes_expected(&self, expected: bool) {
        self.quotes_expected.store(expected, Ordering::SeqCst);
    }

    /// Latest server-reported health status, if any arrived.
    #[must_use]
    pub fn server_health_status(&self) -> Option<HealthStatus> {
        self.server_health.read().clone()
    }

    /// Whether the quote stream is fresh enough (or not expected at all).
    #[must_use]
    pub fn quote_streaming_healthy(&self) -> bool {
        if !self.quotes_expected.load(Ordering::SeqCst) {
            return true;
        }
        self.last_quote
            .lock()
            .is_some_and(|at| at.elapsed() <= self.config.staleness_threshold)
    }

    /// Current composite verdict.
    #[must_use]
    pub fn health_status(&self) -> ConnectionHealth {
        let connected = self.connected.load(Ordering::SeqCst);
        let connected_to_broker = self.connected_to_broker.load(Ordering::SeqCst);
        let synchronized = self.synchronized.load(Ordering::SeqCst);
        let quote_streaming_healthy = self.quote_streaming_healthy();

        let mut issues = Vec::new();
        if !connected {
            issues.push("not_connected".to_string());
        }
        if !connected_to_broker {
            issues.push("broker_disconnected".to_string());
        }
        if !quote_streaming_healthy {
            issues.push("quotes_stale".to_string());
        }
        if !synchronized {
            issues.push("not_synchronized".to_string());
        }

        ConnectionHealth {
            connected,
            connected_to_broker,
            quote_streaming_healthy,
            synchronized,
            healthy: issues.is_empty(),
            issues,
        }
    }

    /// Record one uptime sample of the current verdict.
    pub fn record_sample(&self) {
        let healthy = self.health_status().healthy;
        let now = Instant::now();
        let mut samples = self.samples.lock();
        samples.push_back((now, healthy));

        if let Some(max_window) = self.config.windows.iter().map(|(_, w)| *w).max() {
            while let Some((at, _)) = samples.front() {
                if now.duration_since(*at) > max_window {
                    samples.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Uptime percentage per configured window. Windows with no samples yet
    /// report 100: no downtime has been observed.
    #[must_use]
    pub fn uptime(&self) -> HashMap<String, f64> {
        let samples = self.samples.lock();
        let now = Instant::now();

        let mut result = HashMap::new();
        for (name, window) in &self.config.windows {
            let mut total = 0u64;
            let mut healthy = 0u64;
            for (at, sample_healthy) in samples.iter() {
                if now.duration_since(*at) <= *window {
                    total += 1;
                    if *sample_healthy {
                        healthy += 1;
                    }
                }
            }
            #[allow(clippy::cast_precision_loss)]
            let percentage = if total == 0 {
                100.0
            } else {
                healthy as f64 / total as f64 * 100.0
            };
            result.insert(name.clone(), percentage);
        }
        result
    }

    /// Drive periodic uptime sampling until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sample_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.record_sample(),
                () = shutdown.cancelled() => break,
            }
        }
    }
}

#[async_trait]
impl SynchronizationListener for ConnectionHealthMonitor {
    async fn on_connected(&self, _instance_index: &str, _replicas: usize) -> Result<(), Error> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn on_disconnected(&self, _instance_index: &str) -> Result<(), Error> {
        self.connected.store(false, Ordering::SeqCst);
        self.synchronized.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn on_broker_connection_status_changed(
        &self,
        _instance_index: &str,
        connected: bool,
    ) -> Result<(), Error> {
        self.connected_to_broker.store(connected, Ordering::SeqCst);
        Ok(())
    }

    async fn on_deals_synchronized(
        &self,
        _instance_index: &str,
        _synchronization_id: &str,
    ) -> Result<(), Error> {
        self.synchronized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn on_symbol_prices_updated(
        &self,
        _instance_index: &str,
        _prices: Vec<SymbolPrice>,
        _equity: Option<f64>,
        _margin: Option<f64>,
        _free_margin: Option<f64>,
        _margin_level: Option<f64>,
    ) -> Result<(), Error> {
        *self.last_quote.lock() = Some(Instant::now());
        Ok(())
    }

    async fn on_health_status(
        &self,
        _instance_index: &str,
        status: HealthStatus,
    ) -> Result<(), Error> {
        *self.server_health.write() = Some(status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn healthy_monitor() -> ConnectionHealthMonitor {
        let monitor = ConnectionHealthMonitor::default();
        monitor.on_connected("0", 1).await.unwrap();
        monitor
            .on_broker_connection_status_changed("0", true)
            .await
            .unwrap();
        monitor.on_deals_synchronized("0", "s1").await.unwrap();
        monitor
    }

    #[tokio::test]
    async fn initial_state_is_unhealthy() {
        let monitor = ConnectionHealthMonitor::default();
        let health = monitor.health_status();
        assert!(!health.healthy);
        assert!(health.issues.contains(&"not_connected".to_string()));
        assert!(health.issues.contains(&"not_synchronized".to_string()));
    }

    #[tokio::test]
    async fn healthy_after_full_signal_set() {
        let monitor = healthy_monitor().await;
        let health = monitor.health_status();
        assert!(health.healthy, "issues: {:?}", health.issues);
        // Quotes are not expected, so a silent stream is fine.
        assert!(health.quote_streaming_healthy);
    }

    #[tokio::test]
    async fn expected_quotes_must_flow() {
        let monitor = healthy_monitor().await;
        monitor.set_quotes_expected(true);
        assert!(!monitor.quote_streaming_healthy());

        monitor
            .on_symbol_prices_updated("0", vec![], None, None, None, None)
            .await
            .unwrap();
        assert!(monitor.quote_streaming_healthy());
        assert!(monitor.health_status().healthy);
    }

    #[tokio::test]
    async fn stale_quotes_flag_unhealthy() {
        let config = HealthMonitorConfig {
            staleness_threshold: Duration::from_millis(10),
            ..HealthMonitorConfig::default()
        };
        let monitor = ConnectionHealthMonitor::new(config);
        monitor.set_quotes_expected(true);
        monitor
            .on_symbol_prices_updated("0", vec![], None, None, None, None)
            .await
            .unwrap();
        assert!(monitor.quote_streaming_healthy());

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(!monitor.quote_streaming_healthy());
        assert!(monitor
            .health_status()
            .issues
            .contains(&"quotes_stale".to_string()));
    }

    #[tokio::test]
    async fn disconnect_clears_synchronized() {
        let monitor = healthy_monitor().await;
        monitor.on_disconnected("0").await.unwrap();
        let health = monitor.health_status();
        assert!(!health.connected);
        assert!(!health.synchronized);
    }

    #[tokio::test]
    async fn uptime_reflects_sample_ratio() {
        let monitor = healthy_monitor().await;
        monitor.record_sample();
        monitor.record_sample();
        monitor.record_sample();

        monitor.on_disconnected("0").await.unwrap();
        monitor.record_sample();

        let uptime = monitor.uptime();
        let hour = uptime.get("1h").copied().unwrap();
        assert!((hour - 75.0).abs() < f64::EPSILON, "uptime = {hour}");
    }

    #[tokio::test]
    async fn uptime_without_samples_is_full() {
        let monitor = ConnectionHealthMonitor::default();
        let uptime = monitor.uptime();
        assert!((uptime.get("1w").copied().unwrap() - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stores_server_health_report() {
        let monitor = ConnectionHealthMonitor::default();
        assert!(monitor.server_health_status().is_none());
        monitor
            .on_health_status(
                "0",
                HealthStatus {
                    rest_api_healthy: Some(true),
                    synchronization_api_healthy: Some(true),
                    quote_streaming_healthy: Some(false),
                },
            )
            .await
            .unwrap();
        let status = monitor.server_health_status().unwrap();
        assert_eq!(status.quote_streaming_healthy, Some(false));
    }
}
