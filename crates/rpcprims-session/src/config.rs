use std::time::Duration;

use rpcprims_frame::FrameConfig;

/// Default depth of a session's outbound queue.
pub const DEFAULT_SEND_QUEUE_SIZE: usize = 1024;

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Frame size limits, applied to both directions.
    pub frame: FrameConfig,
    /// Bounded outbound queue depth. Senders wait when it is full.
    pub send_queue_size: usize,
    /// Limit on writing a single frame. A write that overruns it closes the
    /// session, since a partial frame may already be on the wire.
    pub write_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            send_queue_size: DEFAULT_SEND_QUEUE_SIZE,
            write_timeout: None,
        }
    }
}

/// Re-dial policy used after a client session drops.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first re-dial.
    pub initial_backoff: Duration,
    /// Upper bound for the doubling backoff.
    pub max_backoff: Duration,
    /// Give up after this many failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub(crate) fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff)
    }
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub session: SessionConfig,
    /// Dial attempts made by `run()` before giving up. Values below 1 mean 1.
    pub dial_attempts: u32,
    /// Pause between failed dial attempts.
    pub dial_backoff: Duration,
    /// Re-dial automatically when the session drops. Disabled by default.
    pub reconnect: Option<ReconnectPolicy>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            dial_attempts: 1,
            dial_backoff: Duration::from_millis(100),
            reconnect: None,
        }
    }
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub session: SessionConfig,
    /// Reject connections beyond this many live sessions.
    pub max_sessions: Option<usize>,
    /// Pause after a transient accept error.
    pub accept_backoff: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            max_sessions: None,
            accept_backoff: Duration::from_millis(50),
        }
    }
}
