use std::time::Duration;

/// Configuration for the block I/O shim.
#[derive(Clone)]
pub struct Config {
    /// Number of CPUs to shard pools and wait queues across. 0 = number of
    /// online CPUs.
    pub cpus: usize,
    /// I/O contexts pre-allocated per CPU. Each admitted request holds one
    /// context until its terminal completion.
    pub contexts_per_cpu: u16,
    /// Whether to pin each dispatcher thread to a CPU core.
    pub pin_dispatchers: bool,
    /// Starting CPU core index for dispatcher pinning.
    pub core_offset: usize,
    /// Completions for successful I/O that took longer than this are
    /// reported as [`RequestStatus::Alerted`](crate::request::RequestStatus::Alerted)
    /// instead of `Success`. None disables alerting.
    pub alert_threshold: Option<Duration>,
    /// Interval between drain-progress checks during shutdown.
    pub drain_poll_interval: Duration,
    /// Total time to wait for in-progress contexts to drain during shutdown
    /// before giving up and leaking them.
    pub drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cpus: 0,
            contexts_per_cpu: 1_100,
            pin_dispatchers: true,
            core_offset: 0,
            alert_threshold: None,
            drain_poll_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(120),
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.contexts_per_cpu == 0 {
            return Err(crate::error::Error::Config(
                "contexts_per_cpu must be > 0".into(),
            ));
        }
        if self.drain_poll_interval.is_zero() {
            return Err(crate::error::Error::Config(
                "drain_poll_interval must be non-zero".into(),
            ));
        }
        if self.drain_timeout < self.drain_poll_interval {
            return Err(crate::error::Error::Config(
                "drain_timeout must be >= drain_poll_interval".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the CPU count, substituting the online CPU count for 0.
    pub(crate) fn resolved_cpus(&self) -> usize {
        if self.cpus > 0 {
            self.cpus
        } else {
            num_cpus()
        }
    }
}

/// Number of online CPUs.
pub(crate) fn num_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 { 1 } else { n as usize }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use blockshim::ConfigBuilder;
/// use std::time::Duration;
///
/// let config = ConfigBuilder::default()
///     .cpus(4)
///     .contexts_per_cpu(512)
///     .alert_threshold(Duration::from_secs(5))
///     .drain_timeout(Duration::from_secs(30))
///     .build()
///     .expect("invalid config");
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

    // ── Sharding ─────────────────────────────────────────────────────

    /// Set the number of CPUs to shard across. 0 = number of online CPUs.
    pub fn cpus(mut self, n: usize) -> Self {
        self.config.cpus = n;
        self
    }

    /// Set the number of I/O contexts pre-allocated per CPU.
    pub fn contexts_per_cpu(mut self, n: u16) -> Self {
        self.config.contexts_per_cpu = n;
        self
    }

    // ── Dispatcher threads ───────────────────────────────────────────

    /// Enable or disable dispatcher CPU pinning.
    pub fn pin_dispatchers(mut self, enable: bool) -> Self {
        self.config.pin_dispatchers = enable;
        self
    }

    /// Set the starting CPU core index for dispatcher pinning.
    pub fn core_offset(mut self, offset: usize) -> Self {
        self.config.core_offset = offset;
        self
    }

    // ── Completion policy ────────────────────────────────────────────

    /// Report successful I/O slower than `threshold` as `Alerted`.
    pub fn alert_threshold(mut self, threshold: Duration) -> Self {
        self.config.alert_threshold = Some(threshold);
        self
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Set the interval between drain-progress checks during shutdown.
    pub fn drain_poll_interval(mut self, interval: Duration) -> Self {
        self.config.drain_poll_interval = interval;
        self
    }

    /// Set the total drain timeout during shutdown.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
