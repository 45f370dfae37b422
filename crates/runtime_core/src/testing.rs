//! Stub collaborators shared by the pool and cache test suites.
//!
//! `StubEngine` builds lightweight in-process "isolates" with injectable
//! construction latency and failure, so the pool's admission protocol can be
//! exercised without a real scripting engine.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::engine::{GcOutcome, HeapStats, InterruptHandle, Isolate, ScriptEngine};
use crate::error::PoolError;
use crate::script::{ScriptError, ScriptId, ScriptLoader};

pub struct StubIsolate {
    interrupt: InterruptHandle,
    oom: bool,
    has_externals: bool,
    collect_delay: Duration,
    pub gc_passes: u64,
}

impl StubIsolate {
    pub fn set_out_of_memory(&mut self) {
        self.oom = true;
    }

    pub fn set_active_externals(&mut self, active: bool) {
        self.has_externals = active;
    }
}

impl Isolate for StubIsolate {
    fn collect(&mut self, _budget: Duration) -> Result<GcOutcome, PoolError> {
        if !self.collect_delay.is_zero() {
            std::thread::sleep(self.collect_delay);
        }
        self.gc_passes += 1;
        Ok(GcOutcome {
            has_active_externals: self.has_externals,
        })
    }

    fn has_out_of_memory(&self) -> bool {
        self.oom
    }

    fn reset_out_of_memory(&mut self) {
        self.oom = false;
    }

    fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    fn heap_stats(&self) -> HeapStats {
        HeapStats {
            used_bytes: 0,
            limit_bytes: 64 * 1024 * 1024,
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Default)]
pub struct StubEngine {
    construction_delay: Duration,
    collect_delay_ms: AtomicU64,
    fail_creations: AtomicBool,
    created: AtomicUsize,
}

impl StubEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate slow isolate construction (bootstrap, snapshot restore).
    pub fn with_construction_delay(delay: Duration) -> Self {
        Self {
            construction_delay: delay,
            ..Self::default()
        }
    }

    /// Make every subsequently created isolate's `collect` sleep, to widen
    /// the window in which a collection pass is in flight.
    pub fn set_collect_delay(&self, delay: Duration) {
        self.collect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make every subsequent `create_isolate` fail.
    pub fn fail_creations(&self, fail: bool) {
        self.fail_creations.store(fail, Ordering::SeqCst);
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl ScriptEngine for StubEngine {
    fn create_isolate(&self) -> Result<Box<dyn Isolate>, PoolError> {
        if !self.construction_delay.is_zero() {
            std::thread::sleep(self.construction_delay);
        }
        if self.fail_creations.load(Ordering::SeqCst) {
            return Err(PoolError::internal("stub engine: creation disabled"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubIsolate {
            interrupt: InterruptHandle::new(),
            oom: false,
            has_externals: false,
            collect_delay: Duration::from_millis(self.collect_delay_ms.load(Ordering::SeqCst)),
            gc_passes: 0,
        }))
    }
}

#[derive(Default)]
pub struct StubLoader {
    loads: AtomicU64,
    fail_loads: AtomicBool,
    load_delay_ms: AtomicU64,
}

impl StubLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Make every load sleep, to widen race windows in broadcast tests.
    pub fn set_load_delay(&self, delay: Duration) {
        self.load_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

impl ScriptLoader for StubLoader {
    fn load(&self, _isolate: &mut dyn Isolate, script: &ScriptId) -> Result<(), ScriptError> {
        let delay = self.load_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(ScriptError::LoadFailed(format!(
                "stub loader: loads disabled ({})",
                script
            )));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Convenience bundle for tests: engine + loader + a registry with one
/// `_system` database.
pub fn stub_collaborators() -> (
    Arc<StubEngine>,
    Arc<StubLoader>,
    Arc<crate::database::InMemoryDatabaseRegistry>,
) {
    let registry = crate::database::InMemoryDatabaseRegistry::new();
    registry.create("_system");
    (
        Arc::new(StubEngine::new()),
        Arc::new(StubLoader::new()),
        Arc::new(registry),
    )
}
