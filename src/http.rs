//! Typed HTTP client with taxonomy-aware retry.
//!
//! Retry is decided purely by error kind:
//!
//! | Kind | Behavior |
//! |------|----------|
//! | `Api`, `Internal` | exponential back-off, up to `retries` retries |
//! | `TooManyRequests` | sleep until the server-recommended moment, free of charge, when it is near enough |
//! | HTTP 202 + `retry-after` | sleep and re-issue while per-wait and cumulative caps hold |
//! | everything else | surfaced immediately |

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::config::RetryOptions;
use crate::error::Error;

/// Timeout message for an over-budget metrics calculation wait.
const CALCULATION_TIMEOUT_MESSAGE: &str =
    "Timed out waiting for the end of the process of calculating metrics";

/// HTTP client for the REST side of the API.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    auth_token: String,
    retry_opts: RetryOptions,
}

impl HttpClient {
    /// Create a client with the given token and retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] when the underlying client cannot be
    /// built.
    pub fn new(auth_token: impl Into<String>, retry_opts: RetryOptions) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Internal {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            auth_token: auth_token.into(),
            retry_opts,
        })
    }

    /// Issue a GET request.
    ///
    /// # Errors
    ///
    /// Propagates mapped server errors after retry policy is exhausted.
    pub async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, Error> {
        self.request_json(Method::GET, url, None::<&()>).await
    }

    /// Issue a POST request with a JSON body.
    ///
    /// # Errors
    ///
    /// Propagates mapped server errors after retry policy is exhausted.
    pub async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, Error> {
        self.request_json(Method::POST, url, Some(body)).await
    }

    /// Issue a PUT request with a JSON body.
    ///
    /// # Errors
    ///
    /// Propagates mapped server errors after retry policy is exhausted.
    pub async fn put<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, Error> {
        self.request_json(Method::PUT, url, Some(body)).await
    }

    /// Issue a DELETE request, discarding the response body.
    ///
    /// # Errors
    ///
    /// Propagates mapped server errors after retry policy is exhausted.
    pub async fn delete(&self, url: &str) -> Result<(), Error> {
        let _: Value = self.request_json(Method::DELETE, url, None::<&()>).await?;
        Ok(())
    }

    async fn request_json<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<T, Error> {
        let mut retry = RetryState::new(&self.retry_opts);

        loop {
            let mut request = self
                .client
                .request(method.clone(), url)
                .header("auth-token", &self.auth_token);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let error = Error::Api {
                        code: "NetworkError".to_string(),
                        message: e.to_string(),
                    };
                    match retry.on_error(&error) {
                        RetryDecision::Retry(delay) => {
                            tracing::warn!(error = %error, delay_ms = delay.as_millis(), "Network error, retrying");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        _ => return Err(error),
                    }
                }
            };

            let status = response.status();

            // 202 means the server is still computing the result.
            if status == StatusCode::ACCEPTED {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map_or(Duration::from_secs(1), Duration::from_secs);

                match retry.on_accepted(retry_after) {
                    RetryDecision::Retry(delay) => {
                        tracing::debug!(
                            delay_s = delay.as_secs(),
                            "Calculation in progress, waiting"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    _ => return Err(Error::timeout(CALCULATION_TIMEOUT_MESSAGE)),
                }
            }

            if status.is_success() {
                let text = response.text().await.map_err(|e| Error::Api {
                    code: "NetworkError".to_string(),
                    message: e.to_string(),
                })?;
                let parsed = if text.is_empty() { "null" } else { text.as_str() };
                return serde_json::from_str(parsed).map_err(|e| Error::Api {
                    code: "InvalidResponse".to_string(),
                    message: format!("failed to parse response body: {e}"),
                });
            }

            let body_text = response.text().await.unwrap_or_default();
            let error = error_from_response(status, &body_text);

            match retry.on_error(&error) {
                RetryDecision::Retry(delay) => {
                    tracing::warn!(
                        error = %error,
                        delay_ms = delay.as_millis(),
                        attempt = retry.attempt,
                        "Retryable error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::RetryAt(when) => {
                    let delay = (when - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tracing::warn!(
                        delay_ms = delay.as_millis(),
                        "Rate limited, waiting for the recommended retry time"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Surface => return Err(error),
            }
        }
    }
}

/// Map an HTTP error response to the taxonomy.
///
/// Bodies that carry a server `error` discriminator are mapped through the
/// same table as `processingError` packets; otherwise the status decides.
fn error_from_response(status: StatusCode, body: &str) -> Error {
    let parsed: Option<Value> = serde_json::from_str(body).ok();

    if let Some(value) = &parsed {
        if value.get("error").and_then(Value::as_str).is_some() {
            return Error::from_processing_error(value);
        }
    }

    let message = parsed
        .as_ref()
        .and_then(|v| v.get("message"))
        .and_then(Value::as_str)
        .map_or_else(
            || {
                if body.is_empty() {
                    format!("HTTP {status}")
                } else {
                    body.to_string()
                }
            },
            ToString::to_string,
        );

    match status.as_u16() {
        400 => Error::Validation {
            message,
            details: parsed
                .and_then(|v| v.get("details").cloned())
                .unwrap_or(Value::Null),
        },
        401 | 403 => Error::Unauthorized { message },
        404 => Error::NotFound { message },
        429 => Error::TooManyRequests {
            message,
            recommended_retry_time: Utc::now() + chrono::Duration::seconds(60),
        },
        500..=599 => Error::Internal { message },
        _ => Error::Api {
            code: status.as_u16().to_string(),
            message,
        },
    }
}

/// Outcome of consulting the retry policy for one failure.
enum RetryDecision {
    /// Sleep this long and repeat the call.
    Retry(Duration),
    /// Sleep until this wall-clock moment and repeat, without consuming a
    /// retry credit.
    RetryAt(DateTime<Utc>),
    /// Give up and surface the error.
    Surface,
}

/// Per-call retry accounting.
struct RetryState {
    attempt: u32,
    retries: u32,
    delay: Duration,
    max_delay: Duration,
    waited: Duration,
    budget: Duration,
}

impl RetryState {
    fn new(opts: &RetryOptions) -> Self {
        Self {
            attempt: 0,
            retries: opts.retries,
            delay: opts.min_delay,
            max_delay: opts.max_delay,
            waited: Duration::ZERO,
            budget: opts.long_running_wait_budget,
        }
    }

    /// Decide what to do about a failed call.
    fn on_error(&mut self, error: &Error) -> RetryDecision {
        match error {
            Error::Api { .. } | Error::Internal { .. } => {
                if self.attempt >= self.retries {
                    return RetryDecision::Surface;
                }
                self.attempt += 1;
                let delay = self.delay;
                self.delay = (self.delay * 2).min(self.max_delay);
                RetryDecision::Retry(delay)
            }
            Error::TooManyRequests {
                recommended_retry_time,
                ..
            } => {
                let deadline = Utc::now()
                    + chrono::Duration::from_std(self.max_delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30));
                if *recommended_retry_time <= deadline {
                    RetryDecision::RetryAt(*recommended_retry_time)
                } else {
                    RetryDecision::Surface
                }
            }
            _ => RetryDecision::Surface,
        }
    }

    /// Decide what to do about a 202 "still calculating" reply.
    fn on_accepted(&mut self, retry_after: Duration) -> RetryDecision {
        if retry_after > self.max_delay || self.waited + retry_after > self.budget {
            return RetryDecision::Surface;
        }
        self.waited += retry_after;
        RetryDecision::Retry(retry_after)
    }
}
