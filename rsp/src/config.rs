//! Tunables for the session and presentation layers.

use std::time::Duration;

/// Retry and timing limits shared by every exchange on a connection.
///
/// ```
/// use std::time::Duration;
///
/// let mut config = rsp::Config::default();
/// config.ack_timeout = Duration::from_millis(250);
/// assert_eq!(config.max_attempts, 10);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Config {
    /// Attempts per send-and-acknowledge or receive-and-parse cycle.
    pub max_attempts: u32,
    /// How long to wait for `+`/`-` after transmitting a frame.
    pub ack_timeout: Duration,
    /// How long a cancelled read may take to unwind.
    pub cancel_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            ack_timeout: Duration::from_secs(2),
            cancel_grace: Duration::from_secs(1),
        }
    }
}
