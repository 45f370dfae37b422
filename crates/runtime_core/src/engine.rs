use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::PoolError;

/// Result of one bounded heap-collection pass on an isolate.
#[derive(Debug, Clone, Copy)]
pub struct GcOutcome {
    /// Whether the isolate still holds externally-owned resources after the
    /// pass. Contexts with active externals are never skipped by the
    /// collector's low-activity shortcut.
    pub has_active_externals: bool,
}

/// Heap usage snapshot, used for diagnostics dumps only.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct HeapStats {
    pub used_bytes: usize,
    pub limit_bytes: usize,
}

/// Cheaply clonable, thread-safe cooperative-cancellation flag.
///
/// The pool keeps a clone for every busy context so shutdown can signal
/// termination without access to the context itself; the engine is expected
/// to poll the flag at safe points inside running scripts.
#[derive(Clone, Default)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// One heavyweight interpreter instance with its own isolated heap.
///
/// The pool owns the box exclusively while the context sits in its idle or
/// dirty set; a leaseholder owns it exclusively while busy. Nothing here is
/// ever touched by two threads at once.
pub trait Isolate: Send {
    /// Run a heap-collection pass bounded by `budget`.
    ///
    /// Failures are soft: the collector logs and moves on, it never tears
    /// down the server over a failed pass.
    fn collect(&mut self, budget: Duration) -> Result<GcOutcome, PoolError>;

    /// Whether the isolate raised its out-of-memory condition since the last
    /// reset. Checked on every release.
    fn has_out_of_memory(&self) -> bool;

    fn reset_out_of_memory(&mut self);

    /// Handle for cooperative termination of work running in this isolate.
    fn interrupt_handle(&self) -> InterruptHandle;

    fn heap_stats(&self) -> HeapStats;

    /// Engine-specific access for script loaders and embedders.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Factory for isolates. Injected into the pool; construction may take
/// significant wall-clock time and runs outside the pool lock.
pub trait ScriptEngine: Send + Sync {
    fn create_isolate(&self) -> Result<Box<dyn Isolate>, PoolError>;
}
