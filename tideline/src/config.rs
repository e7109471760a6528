/// Execution context group configuration.
#[derive(Clone, Debug)]
pub struct EventLoopConfig {
    /// Number of context threads. 0 = number of CPUs.
    pub threads: usize,
    /// Thread name prefix; each thread is named `{thread_name}-{index}`.
    pub thread_name: String,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        EventLoopConfig {
            threads: 0,
            thread_name: "tideline".to_string(),
        }
    }
}

impl EventLoopConfig {
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.thread_name.is_empty() {
            return Err(crate::error::Error::Config(
                "thread_name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Per-endpoint pool limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolOptions {
    /// Maximum live connections to one endpoint.
    pub max_connections: usize,
    /// Maximum queued waiters once `max_connections` are live.
    /// Negative = unbounded, 0 = fail immediately with `QueueFull`.
    pub max_wait_queue_size: i32,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            max_connections: 5,
            max_wait_queue_size: -1,
        }
    }
}

impl PoolOptions {
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.max_connections == 0 {
            return Err(crate::error::Error::Config(
                "max_connections must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Whether a queue already holding `queued` waiters can take one more.
    pub(crate) fn admits_waiter(&self, queued: usize) -> bool {
        match usize::try_from(self.max_wait_queue_size) {
            Ok(max) => queued < max,
            Err(_) => true,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Execution context settings.
    pub event_loop: EventLoopConfig,
    /// Default pool limits, applied to every endpoint.
    pub pool: PoolOptions,
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        self.event_loop.validate()?;
        self.pool.validate()?;
        Ok(())
    }
}

/// Builder for [`Config`].
///
/// ```
/// use tideline::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .threads(4)
///     .max_connections(16)
///     .max_wait_queue_size(64)
///     .build()
///     .expect("invalid config");
/// assert_eq!(config.pool.max_connections, 16);
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Event loop settings ──────────────────────────────────────────

    /// Set the number of context threads. 0 = number of CPUs.
    pub fn threads(mut self, n: usize) -> Self {
        self.config.event_loop.threads = n;
        self
    }

    /// Set the thread name prefix.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.event_loop.thread_name = name.into();
        self
    }

    // ── Pool settings ────────────────────────────────────────────────

    /// Set the per-endpoint connection limit.
    pub fn max_connections(mut self, n: usize) -> Self {
        self.config.pool.max_connections = n;
        self
    }

    /// Set the per-endpoint wait queue limit. Negative = unbounded.
    pub fn max_wait_queue_size(mut self, n: i32) -> Self {
        self.config.pool.max_wait_queue_size = n;
        self
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
