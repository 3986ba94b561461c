use std::time::Duration;

use crate::error::ClusterError;

/// Default topic and routing namespace.
pub const DEFAULT_NAMESPACE: &str = "pulse";

/// Configuration for a [`Cluster`](crate::Cluster).
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use std::time::Duration;
/// use pulse_cluster::ClusterConfig;
///
/// let config = ClusterConfig::new()
///     .namespace("lab")
///     .ttl(Duration::from_secs(6))
///     .degree(3, 6);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Pub/sub topic for heartbeats; also the routing namespace for grafts.
    pub(crate) namespace: String,
    /// Lifetime advertised in every heartbeat.
    pub(crate) ttl: Duration,
    /// Lower bound of the target degree range.
    pub(crate) kmin: usize,
    /// Upper bound of the target degree range (exclusive).
    pub(crate) kmax: usize,
    /// Per-candidate connect timeout.
    pub(crate) dial_timeout: Duration,
    /// Overall join/graft timeout.
    pub(crate) operation_timeout: Duration,
    /// How long a join/graft keeps reading a discovery stream.
    pub(crate) discovery_timeout: Duration,
    /// Period of the controller's backstop tick.
    pub(crate) backstop_interval: Duration,
    /// Bootstrap candidates requested per join.
    pub(crate) join_limit: usize,
    /// Capacity of the internal event channels.
    pub(crate) event_buffer: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterConfig {
    /// Create a new config with defaults.
    ///
    /// If the `PULSE_NAMESPACE` environment variable is set, it is used
    /// as the namespace. This can be overridden with [`.namespace()`](Self::namespace).
    pub fn new() -> Self {
        let namespace = std::env::var("PULSE_NAMESPACE")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        Self {
            namespace,
            ttl: Duration::from_secs(10),
            kmin: 5,
            kmax: 15,
            dial_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(30),
            discovery_timeout: Duration::from_secs(10),
            backstop_interval: Duration::from_secs(15),
            join_limit: 3,
            event_buffer: 64,
        }
    }

    /// Set the namespace (default: `"pulse"`).
    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    /// Set the heartbeat TTL (default: 10s).
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the target degree range `[kmin, kmax)` (default: 5..15).
    pub fn degree(mut self, kmin: usize, kmax: usize) -> Self {
        self.kmin = kmin;
        self.kmax = kmax;
        self
    }

    /// Set the per-candidate connect timeout (default: 5s).
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the overall join/graft timeout (default: 30s).
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set how long a join/graft waits on discovery results (default: 10s).
    ///
    /// Candidates are dialed as they arrive; this only bounds how long the
    /// stream is read.
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the controller backstop period (default: 15s).
    pub fn backstop_interval(mut self, interval: Duration) -> Self {
        self.backstop_interval = interval;
        self
    }

    /// Set how many bootstrap candidates a join asks for (default: 3).
    pub fn join_limit(mut self, limit: usize) -> Self {
        self.join_limit = limit;
        self
    }

    /// Set the capacity of internal event channels (default: 64).
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn get_namespace(&self) -> &str {
        &self.namespace
    }

    pub fn get_ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get_degree(&self) -> (usize, usize) {
        (self.kmin, self.kmax)
    }

    /// Reject configurations the controller cannot act on.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.namespace.is_empty() {
            return Err(ClusterError::Config("namespace must not be empty".into()));
        }
        if self.ttl.is_zero() {
            return Err(ClusterError::Config("ttl must be non-zero".into()));
        }
        if self.kmin == 0 {
            return Err(ClusterError::Config("kmin must be at least 1".into()));
        }
        if self.kmin >= self.kmax {
            return Err(ClusterError::Config(format!(
                "kmin ({}) must be below kmax ({})",
                self.kmin, self.kmax
            )));
        }
        if self.dial_timeout.is_zero()
            || self.operation_timeout.is_zero()
            || self.discovery_timeout.is_zero()
            || self.backstop_interval.is_zero()
        {
            return Err(ClusterError::Config("timeouts and intervals must be non-zero".into()));
        }
        if self.join_limit == 0 || self.event_buffer == 0 {
            return Err(ClusterError::Config(
                "join_limit and event_buffer must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
