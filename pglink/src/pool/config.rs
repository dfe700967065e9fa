//! Pool configuration.
use std::time::Duration;

/// Configuration for a [`Pool`][super::Pool].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Upper bound on live sessions, allocated plus idle. The default is 10.
    pub max_connections: usize,
    /// Cap on the pending-request queue; an acquire beyond it fails
    /// immediately with `TooManyRequestsForConnections`. No cap by default.
    pub max_pending_requests: Option<usize>,
    /// How long an acquire may wait in the pending queue before failing
    /// with `TimedOutAcquiringConnection`. No timeout by default.
    pub pending_request_timeout: Option<Duration>,
    /// How long a requestor may hold a session before the pool force-closes
    /// it. No timeout by default.
    pub allocated_connection_timeout: Option<Duration>,
    /// How often the metrics are emitted as a log record. The default is an
    /// hour; zero disables the periodic flush.
    pub metrics_logging_interval: Duration,
    /// Whether each periodic flush also resets the counters.
    pub metrics_reset_when_logged: bool,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            max_connections: 10,
            max_pending_requests: None,
            pending_request_timeout: None,
            allocated_connection_timeout: None,
            metrics_logging_interval: Duration::from_secs(3600),
            metrics_reset_when_logged: true,
        }
    }
}
