use crate::error::PoolError;

/// Configuration for the execution-context pool.
///
/// All GC thresholds are tunable policy, not correctness invariants; the
/// safety properties of the pool hold for any setting that passes
/// [`PoolConfig::validate`].
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Minimum number of contexts kept alive (created eagerly at startup).
    pub min_contexts: usize,
    /// Maximum number of contexts (0 = derive from available CPUs).
    pub max_contexts: usize,
    /// Time-based GC cadence: a context released this long after its last
    /// pass is routed to the dirty set.
    pub gc_frequency_secs: f64,
    /// Request-based GC cadence: invocations since the last pass after which
    /// a released context is routed to the dirty set.
    pub gc_interval_invocations: u64,
    /// Retirement age for surplus contexts.
    pub max_context_age_secs: f64,
    /// Retirement invocation count for surplus contexts (0 = unlimited).
    pub max_context_invocations: u64,
    /// Ceiling on how long `acquire` blocks before failing with a
    /// retryable timeout. Fixed at 60 s in production; overridable here so
    /// the timeout path is testable.
    pub acquire_timeout_secs: u64,
    /// How long shutdown waits for busy contexts to yield before treating
    /// the server as defective.
    pub shutdown_grace_secs: u64,
    /// Script loaded into every freshly constructed context.
    pub bootstrap_script: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_contexts: 1,
            max_contexts: 0,
            gc_frequency_secs: 15.0,
            gc_interval_invocations: 1000,
            max_context_age_secs: 60.0,
            max_context_invocations: 0,
            acquire_timeout_secs: 60,
            shutdown_grace_secs: 60,
            bootstrap_script: None,
        }
    }
}

impl PoolConfig {
    /// Create config from environment variables
    ///
    /// Environment variables:
    /// - EMBER_MIN_CONTEXTS: minimum pool size
    /// - EMBER_MAX_CONTEXTS: maximum pool size (0 = derive from CPUs)
    /// - EMBER_GC_FREQUENCY: time-based GC cadence in seconds
    /// - EMBER_GC_INTERVAL: invocation-based GC cadence
    /// - EMBER_MAX_CONTEXT_AGE: retirement age in seconds
    /// - EMBER_MAX_CONTEXT_INVOCATIONS: retirement invocation count (0 = unlimited)
    /// - EMBER_BOOTSTRAP_SCRIPT: script id loaded into new contexts
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            min_contexts: std::env::var("EMBER_MIN_CONTEXTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.min_contexts),
            max_contexts: std::env::var("EMBER_MAX_CONTEXTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_contexts),
            gc_frequency_secs: std::env::var("EMBER_GC_FREQUENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.gc_frequency_secs),
            gc_interval_invocations: std::env::var("EMBER_GC_INTERVAL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.gc_interval_invocations),
            max_context_age_secs: std::env::var("EMBER_MAX_CONTEXT_AGE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_context_age_secs),
            max_context_invocations: std::env::var("EMBER_MAX_CONTEXT_INVOCATIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_context_invocations),
            acquire_timeout_secs: defaults.acquire_timeout_secs,
            shutdown_grace_secs: defaults.shutdown_grace_secs,
            bootstrap_script: std::env::var("EMBER_BOOTSTRAP_SCRIPT").ok(),
        }
    }

    /// Load from a JSON configuration document, falling back to defaults on
    /// parse errors (with a warning, never a startup failure).
    pub fn from_json_value(value: &serde_json::Value) -> Self {
        match serde_json::from_value(value.clone()) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("Failed to parse pool configuration: {}", err);
                Self::default()
            }
        }
    }

    /// The resolved pool ceiling: explicit `max_contexts`, or derived from
    /// the number of available worker threads when set to 0.
    pub fn effective_max_contexts(&self) -> usize {
        if self.max_contexts > 0 {
            self.max_contexts.max(self.min_contexts)
        } else {
            num_cpus::get().max(self.min_contexts).max(1)
        }
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.min_contexts == 0 {
            return Err(PoolError::internal("min_contexts must be at least 1"));
        }
        if self.gc_frequency_secs <= 0.0 {
            return Err(PoolError::internal("gc_frequency_secs must be positive"));
        }
        if self.acquire_timeout_secs == 0 {
            return Err(PoolError::internal("acquire_timeout_secs must be positive"));
        }
        Ok(())
    }
}
