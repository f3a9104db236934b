//! Reconnection back-off for the websocket channel.

use std::time::Duration;

/// Initial delay before the first reconnection attempt.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Cap on the delay between reconnection attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Exponential back-off with a low cap and unlimited attempts.
///
/// The channel is expected to stay up for days; reconnection never gives up,
/// it only spaces attempts out to at most [`MAX_BACKOFF`].
#[derive(Debug)]
pub struct ReconnectPolicy {
    current: Duration,
    attempt: u32,
}

impl ReconnectPolicy {
    /// Create a policy at its initial delay.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: INITIAL_BACKOFF,
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt. Doubles up to the cap.
    pub fn next_backoff(&mut self) -> Duration {
        let backoff = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        self.attempt += 1;
        backoff
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
        self.attempt = 0;
    }

    /// Number of attempts since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new()
    }
}
