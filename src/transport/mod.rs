//! Framed request/response channel to the MCU.
//!
//! One request is in flight at a time — the caller already holds the motion
//! lock, and the implementations serialize port access besides. On an I/O
//! error the channel flags itself broken and every call fails fast until a
//! reconnect succeeds; reconnect pacing is the embedding supervisor's job,
//! using [`ReconnectPolicy`].

mod mock;
mod serial;

pub use mock::{MockAction, MockTransport};
pub use serial::SerialTransport;

use crate::error::TransportError;
use crate::protocol::{McuRequest, McuResponse};
use async_trait::async_trait;
use std::time::Duration;

/// Default per-request reply deadline.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// A framed channel speaking the protocol of [`crate::protocol`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and wait for its reply.
    ///
    /// Strictly serialized: the reply read belongs to the request just
    /// written. `Timeout` leaves the channel usable (the next send drains
    /// any stale reply); `Io` marks it broken.
    async fn send_request(
        &self,
        request: &McuRequest,
        timeout: Duration,
    ) -> Result<McuResponse, TransportError>;

    /// Whether the channel is in the broken, fail-fast state.
    fn is_broken(&self) -> bool;

    /// Try to bring a broken channel back up.
    async fn reconnect(&self) -> Result<(), TransportError>;
}

/// Backoff pacing for reconnect attempts: exponential from 100 ms, capped at
/// 2 s, unlimited attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given zero-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.min(31);
        let delay = self
            .initial_delay
            .saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX));
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_two_seconds() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1600));
        assert_eq!(policy.delay_for(5), Duration::from_secs(2));
        assert_eq!(policy.delay_for(30), Duration::from_secs(2));
        assert_eq!(policy.delay_for(100), Duration::from_secs(2));
    }
}
