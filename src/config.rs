//! Client configuration.

use std::time::Duration;

/// Options for the websocket transport and derived connections.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// API access token, sent as the `auth-token` query parameter.
    pub auth_token: String,
    /// Service domain; the websocket endpoint is
    /// `https://mt-provisioning-api-v1.{domain}/ws`.
    pub domain: String,
    /// Application name attached to synchronization requests.
    pub application: String,
    /// Per-request reply timeout.
    pub request_timeout: Duration,
    /// Timeout for the initial socket handshake.
    pub connect_timeout: Duration,
    /// Retry policy shared with the HTTP client.
    pub retry_opts: RetryOptions,
}

impl ConnectionOptions {
    /// Create options with defaults for everything but the token.
    #[must_use]
    pub fn new(auth_token: impl Into<String>) -> Self {
        Self {
            auth_token: auth_token.into(),
            domain: "agiliumtrade.ai".to_string(),
            application: "MetaApi".to_string(),
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(60),
            retry_opts: RetryOptions::default(),
        }
    }

    /// Create options from environment variables.
    ///
    /// Reads `TERMINAL_LINK_AUTH_TOKEN` (required, may be empty) and
    /// `TERMINAL_LINK_DOMAIN` (optional).
    #[must_use]
    pub fn from_env() -> Self {
        let mut options = Self::new(std::env::var("TERMINAL_LINK_AUTH_TOKEN").unwrap_or_default());
        if let Ok(domain) = std::env::var("TERMINAL_LINK_DOMAIN") {
            options.domain = domain;
        }
        options
    }

    /// Override the service domain.
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Override the application name.
    #[must_use]
    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = application.into();
        self
    }

    /// The websocket endpoint derived from the domain.
    #[must_use]
    pub fn websocket_url(&self) -> String {
        format!("wss://mt-provisioning-api-v1.{}/ws", self.domain)
    }
}

/// Retry policy for application-level requests.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Maximum retries on retryable errors (total calls = retries + 1).
    pub retries: u32,
    /// Initial back-off delay.
    pub min_delay: Duration,
    /// Back-off cap; also the longest acceptable single server-advised wait.
    pub max_delay: Duration,
    /// Cumulative cap for HTTP 202 "calculation in progress" waits.
    pub long_running_wait_budget: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            retries: 2,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            long_running_wait_budget: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = ConnectionOptions::new("token");
        assert_eq!(options.domain, "agiliumtrade.ai");
        assert_eq!(options.request_timeout, Duration::from_secs(60));
        assert_eq!(options.retry_opts.retries, 2);
        assert_eq!(
            options.websocket_url(),
            "wss://mt-provisioning-api-v1.agiliumtrade.ai/ws"
        );
    }

    #[test]
    fn builder_overrides() {
        let options = ConnectionOptions::new("token")
            .with_domain("example.org")
            .with_application("tests");
        assert_eq!(
            options.websocket_url(),
            "wss://mt-provisioning-api-v1.example.org/ws"
        );
        assert_eq!(options.application, "tests");
    }
}
