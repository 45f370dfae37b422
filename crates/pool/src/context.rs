use std::sync::Arc;
use std::time::{Duration, Instant};

use runtime_core::{HeapStats, InterruptHandle, Isolate, PoolConfig, PoolError};

/// Unique, monotonically assigned context identifier.
pub type ContextId = u64;

/// Deferred hook queued into a context's mailbox; runs the next time a
/// thread holds the context exclusively (acquire preparation or release
/// cleanup). This is how administrative actions reach contexts without
/// interrupting whatever is running in them.
pub type DeferredHook = Arc<dyn Fn(&mut ExecutionContext) + Send + Sync>;

/// Below this many invocations since the last pass a context counts as
/// "low activity": popping it from the dirty set skips the collection and
/// returns it straight to idle, unless it holds external resources.
pub(crate) const LOW_ACTIVITY_INVOCATIONS: u64 = 10;

#[derive(Debug, Clone)]
pub(crate) struct Operation {
    pub(crate) text: String,
    pub(crate) since: Instant,
}

/// A single heavyweight interpreter instance plus its pool bookkeeping.
///
/// The pool's sets own the box while the context is idle or dirty; a
/// [`ContextLease`](crate::ContextLease) owns it while busy. At no point do
/// two threads share access.
pub struct ExecutionContext {
    id: ContextId,
    isolate: Box<dyn Isolate>,
    interrupt: InterruptHandle,
    is_default: bool,
    created_at: Instant,
    last_gc_stamp: f64,
    invocations_since_gc: u64,
    total_invocations: u64,
    has_active_externals: bool,
    description: Option<Operation>,
}

impl ExecutionContext {
    pub(crate) fn new(
        id: ContextId,
        isolate: Box<dyn Isolate>,
        is_default: bool,
        now_stamp: f64,
    ) -> Self {
        let interrupt = isolate.interrupt_handle();
        Self {
            id,
            isolate,
            interrupt,
            is_default,
            created_at: Instant::now(),
            last_gc_stamp: now_stamp,
            invocations_since_gc: 0,
            total_invocations: 0,
            has_active_externals: false,
            description: None,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn total_invocations(&self) -> u64 {
        self.total_invocations
    }

    pub fn invocations_since_gc(&self) -> u64 {
        self.invocations_since_gc
    }

    pub fn last_gc_stamp(&self) -> f64 {
        self.last_gc_stamp
    }

    pub fn has_active_externals(&self) -> bool {
        self.has_active_externals
    }

    /// Current operation description, set while the context is leased.
    pub fn description(&self) -> Option<&str> {
        self.description.as_ref().map(|op| op.text.as_str())
    }

    /// The interpreter itself; leaseholders run their work through this.
    pub fn isolate_mut(&mut self) -> &mut dyn Isolate {
        self.isolate.as_mut()
    }

    pub(crate) fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub(crate) fn note_entered(&mut self, description: String) {
        self.total_invocations += 1;
        self.invocations_since_gc += 1;
        self.description = Some(Operation {
            text: description,
            since: Instant::now(),
        });
    }

    pub(crate) fn note_exited(&mut self) {
        self.description = None;
    }

    /// Whether this context should be routed to the dirty set on release.
    ///
    /// Either cadence suffices: enough invocations since the last pass, or
    /// the last pass predates the global collection stamp by more than the
    /// configured frequency.
    pub(crate) fn wants_collection(&self, config: &PoolConfig, global_gc_stamp: f64) -> bool {
        if config.gc_interval_invocations > 0
            && self.invocations_since_gc >= config.gc_interval_invocations
        {
            return true;
        }
        self.last_gc_stamp + config.gc_frequency_secs < global_gc_stamp
    }

    /// Contexts with little work since their last pass and no external
    /// resources are not worth a collection pass.
    pub(crate) fn is_low_activity(&self) -> bool {
        self.invocations_since_gc < LOW_ACTIVITY_INVOCATIONS && !self.has_active_externals
    }

    pub(crate) fn has_activity(&self) -> bool {
        self.invocations_since_gc > 0 || self.has_active_externals
    }

    /// Run one bounded collection pass and refresh the GC bookkeeping.
    pub(crate) fn run_collection(
        &mut self,
        budget: Duration,
        now_stamp: f64,
    ) -> Result<(), PoolError> {
        let outcome = self.isolate.collect(budget)?;
        self.last_gc_stamp = now_stamp;
        self.invocations_since_gc = 0;
        self.has_active_externals = outcome.has_active_externals;
        Ok(())
    }

    /// Whether this context may be destroyed once the pool is above its
    /// minimum. The default context is never retired.
    pub(crate) fn retirement_eligible(&self, config: &PoolConfig) -> bool {
        if self.is_default {
            return false;
        }
        if self.age().as_secs_f64() > config.max_context_age_secs {
            return true;
        }
        config.max_context_invocations > 0
            && self.total_invocations >= config.max_context_invocations
    }

    pub(crate) fn snapshot(&self, state: &'static str, now_stamp: f64) -> ContextSnapshot {
        ContextSnapshot {
            id: self.id,
            state,
            is_default: self.is_default,
            description: self.description().map(str::to_string),
            held_ms: self
                .description
                .as_ref()
                .map(|op| op.since.elapsed().as_millis() as u64),
            total_invocations: self.total_invocations,
            invocations_since_gc: self.invocations_since_gc,
            secs_since_gc: (now_stamp - self.last_gc_stamp).max(0.0),
            heap: self.isolate.heap_stats(),
        }
    }
}

/// Point-in-time view of one context, for diagnostics dumps.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContextSnapshot {
    pub id: ContextId,
    pub state: &'static str,
    pub is_default: bool,
    pub description: Option<String>,
    pub held_ms: Option<u64>,
    pub total_invocations: u64,
    pub invocations_since_gc: u64,
    pub secs_since_gc: f64,
    pub heap: HeapStats,
}
