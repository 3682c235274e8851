//! Session timing -- the intervals producer and viewer must agree on.
//!
//! The viewer drives liveness: it pings at `ping_interval`, and the producer
//! gives up on a connection that has been silent for `ping_timeout`. The
//! timeout must therefore stay above the interval.

use std::time::Duration;

/// All protocol-level timers of a remote logging session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    /// Delay before reopening a connection to the same peer.
    pub connection_retry: Duration,
    /// How long to wait for `ServerHello` after sending `ClientHello`.
    pub handshake_timeout: Duration,
    /// Period of the producer's own ping packets.
    pub ping_interval: Duration,
    /// Silence from the viewer after which the connection is abandoned.
    pub ping_timeout: Duration,
    /// Delay before restarting a failed browser.
    pub browser_retry: Duration,
    /// Lifetime of the startup buffer. Never re-armed.
    pub startup_buffer: Duration,
}

pub const DEFAULT_TIMING: SessionTiming = SessionTiming {
    connection_retry: Duration::from_secs(2),
    handshake_timeout: Duration::from_secs(10),
    ping_interval: Duration::from_secs(2),
    ping_timeout: Duration::from_secs(4),
    browser_retry: Duration::from_secs(3),
    startup_buffer: Duration::from_secs(2),
};

impl Default for SessionTiming {
    fn default() -> Self {
        DEFAULT_TIMING
    }
}

impl SessionTiming {
    /// Scale every interval down, keeping their ratios. Used by tests that
    /// exercise timeouts against a real clock.
    pub fn scaled(&self, divisor: u32) -> Self {
        let divisor = divisor.max(1);
        Self {
            connection_retry: self.connection_retry / divisor,
            handshake_timeout: self.handshake_timeout / divisor,
            ping_interval: self.ping_interval / divisor,
            ping_timeout: self.ping_timeout / divisor,
            browser_retry: self.browser_retry / divisor,
            startup_buffer: self.startup_buffer / divisor,
        }
    }
}
