//! Listener and sniffer configuration.

use std::time::Duration;

/// Default capacity of the queue of connections handed back to the caller.
pub const DEFAULT_QUEUE_CAPACITY: usize = 8;

/// Default pause after a failed raw accept.
pub const DEFAULT_ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Default bound on consecutive interrupted single-byte reads.
pub const DEFAULT_MAX_INTERRUPTED_READS: u32 = 16;

/// Default sniff deadline (none: a silent peer holds only its own task).
pub const DEFAULT_SNIFF_TIMEOUT: Option<Duration> = None;

/// Configuration for header sniffing.
#[derive(Debug, Clone)]
pub struct SniffConfig {
    /// Deadline for reading the whole header. Expiry falls back to the
    /// ordinary path with whatever was read so far.
    pub timeout: Option<Duration>,
    /// Consecutive `Interrupted` reads tolerated at a single position.
    pub max_interrupted_reads: u32,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_interrupted_reads: DEFAULT_MAX_INTERRUPTED_READS,
        }
    }
}

impl SniffConfig {
    /// Set the sniff deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the interrupted-read bound.
    pub fn with_max_interrupted_reads(mut self, max: u32) -> Self {
        self.max_interrupted_reads = max;
        self
    }
}

/// Configuration for a sniffing listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Capacity of the delivery queue.
    pub queue_capacity: usize,
    /// Log every credentialed connection at info level.
    pub verbose: bool,
    /// Pause after a raw accept error before retrying.
    pub accept_error_backoff: Duration,
    /// Per-connection sniffing configuration.
    pub sniff: SniffConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerConfig {
    /// Create a new listener configuration with defaults.
    pub fn new() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            verbose: false,
            accept_error_backoff: DEFAULT_ACCEPT_ERROR_BACKOFF,
            sniff: SniffConfig::default(),
        }
    }

    /// Set the delivery queue capacity (clamped to at least one).
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Enable or disable verbose logging.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Set the accept error backoff.
    pub fn with_accept_error_backoff(mut self, backoff: Duration) -> Self {
        self.accept_error_backoff = backoff;
        self
    }

    /// Set the sniffing configuration.
    pub fn with_sniff(mut self, sniff: SniffConfig) -> Self {
        self.sniff = sniff;
        self
    }
}
