//! Bounded pool of execution contexts with blocking admission control.
//!
//! Request threads call [`ContextPool::acquire`]; the pool hands out an
//! idle context (LIFO, warmest first), repurposes a dirty one, or grows up
//! to its ceiling. Contexts are handed out by *moving* them out of the
//! pool's sets into a [`ContextLease`], so exclusive access is a property
//! of ownership, not of a runtime check.
//!
//! One deliberate lock-order exception: context construction is slow
//! (isolate allocation plus bootstrap script), so the pool mutex is
//! released for its duration. The construction slot is reserved through
//! `in_flight_creations` before unlocking, which keeps the pool-bound
//! invariant `idle + dirty + busy + in_flight <= max` true across the
//! unlocked window; invariants are re-checked after re-locking.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use runtime_core::{
    DatabasePin, DatabaseRegistry, InterruptHandle, PoolConfig, PoolError, ScriptEngine, ScriptId,
    ScriptLoader,
};

use crate::collector;
use crate::context::{ContextId, ContextSnapshot, DeferredHook, ExecutionContext};
use crate::metrics::PoolMetrics;

/// How often a blocked acquirer re-checks the pool.
const ACQUIRE_WAIT_SLICE: Duration = Duration::from_millis(100);
/// How often a broadcast re-checks a busy context.
const BROADCAST_WAIT_SLICE: Duration = Duration::from_millis(100);
/// Budget for the extended pass run when a context raised its OOM flag.
const OOM_GC_BUDGET: Duration = Duration::from_secs(300);
/// Budget for the final pass run on each context during shutdown.
const SHUTDOWN_GC_BUDGET: Duration = Duration::from_secs(30);
/// How often shutdown re-checks for quiescence.
const SHUTDOWN_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Who is asking for a context; contributes to the operation description
/// shown in diagnostics dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityProfile {
    /// Server-internal work (bootstraps, upgrades).
    Internal,
    /// A user-facing request handler.
    RestAction,
    /// A scheduled or queued task.
    Task,
    /// An administrative script run by an operator.
    AdminScript,
}

impl SecurityProfile {
    fn label(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::RestAction => "rest-action",
            Self::Task => "task",
            Self::AdminScript => "admin-script",
        }
    }
}

pub(crate) struct BusyEntry {
    pub(crate) description: String,
    pub(crate) since: Instant,
    pub(crate) interrupt: InterruptHandle,
}

/// All mutable pool bookkeeping, guarded by one mutex.
///
/// The idle and dirty sets own their contexts; the busy map holds
/// bookkeeping only, because a busy context lives inside some thread's
/// lease. The union of the three id sets plus `collecting` plus
/// `in_flight_creations` is bounded by the pool ceiling.
pub(crate) struct PoolState {
    /// LIFO stack of free contexts; the top is the most recently released
    /// (warmest) one.
    pub(crate) idle: Vec<Box<ExecutionContext>>,
    /// Released contexts awaiting a background collection pass. Still valid
    /// for reuse; acquire promotes them back to idle when nothing else is
    /// available.
    pub(crate) dirty: VecDeque<Box<ExecutionContext>>,
    pub(crate) busy: HashMap<ContextId, BusyEntry>,
    /// Contexts the collector has taken out of the sets for a pass. Still
    /// live: without this count an acquire racing a slow pass would see
    /// spare capacity and grow the pool past its ceiling.
    pub(crate) collecting: usize,
    /// Per-context deferred-hook mailboxes, drained whenever a thread holds
    /// the context exclusively.
    pub(crate) mailboxes: HashMap<ContextId, Vec<DeferredHook>>,
    pub(crate) in_flight_creations: usize,
    /// Non-zero while a broadcast needs a stable context list; growth is
    /// paused for its duration.
    pub(crate) creation_blockers: usize,
    pub(crate) next_context_id: ContextId,
    pub(crate) default_context_id: Option<ContextId>,
    /// Stamp of the most recent collection pass anywhere in the pool.
    pub(crate) global_gc_stamp: f64,
    pub(crate) shutting_down: bool,
}

impl PoolState {
    pub(crate) fn live_total(&self) -> usize {
        self.idle.len() + self.dirty.len() + self.busy.len() + self.collecting
    }
}

enum BroadcastOrigin {
    Idle,
    Dirty,
}

/// The process-wide execution-context pool. Constructed once at startup and
/// shared by handle; collaborators are injected, never looked up globally.
pub struct ContextPool {
    pub(crate) config: PoolConfig,
    pub(crate) max_contexts: usize,
    engine: Arc<dyn ScriptEngine>,
    loader: Arc<dyn ScriptLoader>,
    databases: Arc<dyn DatabaseRegistry>,
    pub(crate) state: Mutex<PoolState>,
    /// Signalled on every release, creation, and promotion; acquirers and
    /// broadcasts wait here.
    pub(crate) changed: Condvar,
    /// Signalled when a context becomes dirty; the collector waits here.
    pub(crate) gc_signal: Condvar,
    pub(crate) metrics: Arc<PoolMetrics>,
    /// Process-start reference for monotonic GC stamps.
    pub(crate) epoch: Instant,
    collector: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl ContextPool {
    pub fn new(
        config: PoolConfig,
        engine: Arc<dyn ScriptEngine>,
        loader: Arc<dyn ScriptLoader>,
        databases: Arc<dyn DatabaseRegistry>,
    ) -> Result<Arc<Self>, PoolError> {
        config.validate()?;
        let max_contexts = config.effective_max_contexts();
        Ok(Arc::new(Self {
            config,
            max_contexts,
            engine,
            loader,
            databases,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                dirty: VecDeque::new(),
                busy: HashMap::new(),
                collecting: 0,
                mailboxes: HashMap::new(),
                in_flight_creations: 0,
                creation_blockers: 0,
                next_context_id: 1,
                default_context_id: None,
                global_gc_stamp: 0.0,
                shutting_down: false,
            }),
            changed: Condvar::new(),
            gc_signal: Condvar::new(),
            metrics: Arc::new(PoolMetrics::default()),
            epoch: Instant::now(),
            collector: Mutex::new(None),
            started: AtomicBool::new(false),
        }))
    }

    /// Create the minimum context set and start the background collector.
    ///
    /// A construction failure here is fatal: the server cannot function
    /// with zero contexts.
    pub fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PoolError::internal("pool already started"));
        }

        tracing::info!(
            "Initializing context pool: min {}, max {}",
            self.config.min_contexts,
            self.max_contexts
        );

        for n in 0..self.config.min_contexts {
            let is_default = n == 0;
            let context = self.build_context(is_default).map_err(|err| {
                PoolError::fatal(format!("mandatory startup context creation failed: {}", err))
            })?;
            let mut guard = self.lock_state();
            if is_default {
                guard.default_context_id = Some(context.id());
            }
            guard.idle.push(context);
        }

        let weak: Weak<ContextPool> = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("ember-gc".to_string())
            .spawn(move || collector::collector_loop(weak))
            .map_err(|err| PoolError::fatal(format!("failed to spawn collector: {}", err)))?;
        *self
            .collector
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Ok(())
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Monotonic seconds since pool construction; the unit of GC stamps.
    pub(crate) fn now_stamp(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub fn metrics(&self) -> Arc<PoolMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Acquire an execution context for work against `database`.
    ///
    /// Blocks until a context is free, the pool can grow, or the
    /// acquisition ceiling elapses; a ceiling hit is the retryable
    /// [`PoolError::Timeout`]. The database is pinned before any context is
    /// consumed and stays pinned for the lease's lifetime.
    pub fn acquire(
        self: &Arc<Self>,
        database: &str,
        profile: SecurityProfile,
    ) -> Result<ContextLease, PoolError> {
        let pin = self.databases.pin(database)?;
        let deadline = Instant::now() + Duration::from_secs(self.config.acquire_timeout_secs);

        let mut guard = self.lock_state();
        loop {
            if guard.shutting_down {
                self.metrics.note_enter_failure();
                return Err(PoolError::ShuttingDown);
            }

            // 1. Reuse the most recently freed context (warmest first).
            if let Some(mut context) = guard.idle.pop() {
                let hooks = guard.mailboxes.remove(&context.id()).unwrap_or_default();
                let description = format!("{} on database '{}'", profile.label(), database);
                context.note_entered(description.clone());
                // Clear under the lock, before the busy entry exists: a
                // shutdown that starts after this point finds the entry and
                // its termination signal cannot be wiped by us.
                context.interrupt_handle().clear();
                guard.busy.insert(
                    context.id(),
                    BusyEntry {
                        description,
                        since: Instant::now(),
                        interrupt: context.interrupt_handle(),
                    },
                );
                drop(guard);

                for hook in hooks {
                    hook(&mut context);
                }
                self.metrics.note_entered();
                tracing::debug!("Entered context {}", context.id());
                return Ok(ContextLease {
                    pool: Arc::clone(self),
                    context: Some(context),
                    _pin: Some(pin),
                });
            }

            // 2. A dirty context is valid for reuse, just not yet cleaned.
            if let Some(context) = guard.dirty.pop_front() {
                guard.idle.push(context);
                continue;
            }

            // 3. Grow, unless a broadcast needs the context list stable.
            if guard.creation_blockers == 0
                && guard.live_total() + guard.in_flight_creations < self.max_contexts
            {
                guard.in_flight_creations += 1;
                drop(guard);

                // Slow path runs unlocked; the in-flight reservation keeps
                // the bound while other threads come and go.
                let built = self.build_context(false);

                guard = self.lock_state();
                guard.in_flight_creations -= 1;
                match built {
                    Ok(context) => {
                        debug_assert!(
                            guard.live_total() + guard.in_flight_creations < self.max_contexts
                        );
                        guard.idle.push(context);
                        self.changed.notify_all();
                        continue;
                    }
                    Err(err) => {
                        self.metrics.note_enter_failure();
                        self.changed.notify_all();
                        return Err(err);
                    }
                }
            }

            // 4. Nothing available: wait for a release, re-checking the
            //    ceiling on every slice.
            let now = Instant::now();
            if now >= deadline {
                self.metrics.note_enter_failure();
                let dump = self.diagnostics_locked(&guard);
                tracing::warn!(
                    "Timed out waiting for an execution context after {}s; pool state: {}",
                    self.config.acquire_timeout_secs,
                    dump
                );
                return Err(PoolError::Timeout);
            }
            let wait = ACQUIRE_WAIT_SLICE.min(deadline - now);
            let (g, _) = self
                .changed
                .wait_timeout(guard, wait)
                .unwrap_or_else(PoisonError::into_inner);
            guard = g;
        }
    }

    /// Construct one context: isolate allocation plus bootstrap script.
    /// Never called while holding the pool mutex.
    fn build_context(&self, is_default: bool) -> Result<Box<ExecutionContext>, PoolError> {
        let start = Instant::now();
        let mut isolate = self.engine.create_isolate()?;

        if let Some(script) = &self.config.bootstrap_script {
            let script = ScriptId::new(script.clone());
            self.loader
                .load(isolate.as_mut(), &script)
                .map_err(|err| {
                    PoolError::fatal(format!("bootstrap script '{}' failed: {}", script, err))
                })?;
        }

        let id = {
            let mut guard = self.lock_state();
            let id = guard.next_context_id;
            guard.next_context_id += 1;
            id
        };
        let context = Box::new(ExecutionContext::new(id, isolate, is_default, self.now_stamp()));
        self.metrics.note_created(start.elapsed());
        tracing::debug!(
            "Created execution context {} in {}ms",
            id,
            start.elapsed().as_millis()
        );
        Ok(context)
    }

    /// Return path for leases. Cleans the context up, then routes it to
    /// dirty (GC-eligible) or idle.
    fn release_context(&self, mut context: Box<ExecutionContext>) {
        // An OOM condition gets one generous, synchronous pass before the
        // context is reused.
        if context.isolate_mut().has_out_of_memory() {
            tracing::warn!(
                "Context {} raised out-of-memory; running extended collection",
                context.id()
            );
            if let Err(err) = context.run_collection(OOM_GC_BUDGET, self.now_stamp()) {
                tracing::warn!("Extended collection on context {} failed: {}", context.id(), err);
            }
            context.isolate_mut().reset_out_of_memory();
        }

        let hooks = {
            let mut guard = self.lock_state();
            guard.mailboxes.remove(&context.id()).unwrap_or_default()
        };
        for hook in hooks {
            hook(&mut context);
        }

        context.note_exited();
        self.metrics.note_exited();

        let mut guard = self.lock_state();
        guard.busy.remove(&context.id());

        if guard.shutting_down {
            drop(guard);
            self.destroy_context(context, SHUTDOWN_GC_BUDGET);
            self.changed.notify_all();
            return;
        }

        let wants_collection = context.wants_collection(&self.config, guard.global_gc_stamp);
        if wants_collection && !guard.idle.is_empty() {
            guard.dirty.push_back(context);
        } else {
            if wants_collection {
                // GC-eligible, but the pool refuses to orphan itself with
                // zero idle contexts.
                tracing::debug!(
                    "Context {} is collection-eligible but forced idle to keep the pool available",
                    context.id()
                );
            }
            guard.idle.push(context);
        }
        drop(guard);
        self.changed.notify_all();
        self.gc_signal.notify_all();
    }

    /// Final pass plus teardown for one context.
    pub(crate) fn destroy_context(&self, mut context: Box<ExecutionContext>, budget: Duration) {
        if let Err(err) = context.run_collection(budget, self.now_stamp()) {
            tracing::warn!("Final collection on context {} failed: {}", context.id(), err);
        }
        tracing::debug!("Destroying execution context {}", context.id());
        self.metrics.note_destroyed();
        let mut guard = self.lock_state();
        guard.mailboxes.remove(&context.id());
        drop(guard);
        drop(context);
    }

    /// Load `script` into every live context (administrative broadcast).
    ///
    /// Growth is paused for the duration so the snapshot of live contexts
    /// stays meaningful; each context is taken out of its set, loaded while
    /// exclusively held, and put back where it came from. Returns how many
    /// contexts were reached.
    pub fn run_in_all_contexts(&self, script: &ScriptId) -> Result<usize, PoolError> {
        let snapshot: Vec<ContextId> = {
            let mut guard = self.lock_state();
            if guard.shutting_down {
                return Err(PoolError::ShuttingDown);
            }
            guard.creation_blockers += 1;
            guard
                .idle
                .iter()
                .map(|c| c.id())
                .chain(guard.dirty.iter().map(|c| c.id()))
                .chain(guard.busy.keys().copied())
                .collect()
        };

        let result = self.broadcast_to(&snapshot, script);

        let mut guard = self.lock_state();
        guard.creation_blockers -= 1;
        drop(guard);
        self.changed.notify_all();
        result
    }

    fn broadcast_to(&self, ids: &[ContextId], script: &ScriptId) -> Result<usize, PoolError> {
        let mut reached = 0usize;
        'contexts: for &id in ids {
            let mut guard = self.lock_state();
            let (mut context, origin) = loop {
                if guard.shutting_down {
                    return Err(PoolError::ShuttingDown);
                }
                if let Some(pos) = guard.idle.iter().position(|c| c.id() == id) {
                    break (guard.idle.remove(pos), BroadcastOrigin::Idle);
                }
                if let Some(pos) = guard.dirty.iter().position(|c| c.id() == id) {
                    if let Some(context) = guard.dirty.remove(pos) {
                        break (context, BroadcastOrigin::Dirty);
                    }
                    continue;
                }
                if guard.busy.contains_key(&id) {
                    let (g, _) = self
                        .changed
                        .wait_timeout(guard, BROADCAST_WAIT_SLICE)
                        .unwrap_or_else(PoisonError::into_inner);
                    guard = g;
                    continue;
                }
                // Retired or destroyed while we were iterating.
                tracing::warn!("Context {} disappeared during broadcast, skipping", id);
                continue 'contexts;
            };
            drop(guard);

            let load_result = self.loader.load(context.isolate_mut(), script);

            let mut guard = self.lock_state();
            match origin {
                BroadcastOrigin::Idle => guard.idle.push(context),
                BroadcastOrigin::Dirty => guard.dirty.push_back(context),
            }
            drop(guard);
            self.changed.notify_all();

            if let Err(err) = load_result {
                return Err(PoolError::fatal(format!(
                    "broadcast of script '{}' failed in context {}: {}",
                    script, id, err
                )));
            }
            reached += 1;
        }
        Ok(reached)
    }

    /// Queue a deferred hook into every live context's mailbox. Each hook
    /// copy runs the next time its context is exclusively held.
    pub fn defer_in_all(&self, hook: DeferredHook) {
        let mut guard = self.lock_state();
        let ids: Vec<ContextId> = guard
            .idle
            .iter()
            .map(|c| c.id())
            .chain(guard.dirty.iter().map(|c| c.id()))
            .chain(guard.busy.keys().copied())
            .collect();
        for id in ids {
            guard.mailboxes.entry(id).or_default().push(hook.clone());
        }
    }

    /// Cooperative shutdown: signal termination to all busy contexts, wait
    /// out the grace period, then destroy everything.
    ///
    /// A context still busy after the grace period means a script ignored
    /// its termination signal; that is a defect, reported as a fatal error
    /// so the embedding process can abort instead of leaking a hung thread.
    pub fn shutdown(&self) -> Result<(), PoolError> {
        let interrupts: Vec<InterruptHandle> = {
            let mut guard = self.lock_state();
            if guard.shutting_down {
                return Ok(());
            }
            guard.shutting_down = true;
            guard.busy.values().map(|entry| entry.interrupt.clone()).collect()
        };
        self.changed.notify_all();
        self.gc_signal.notify_all();

        for interrupt in &interrupts {
            interrupt.request();
        }
        if !interrupts.is_empty() {
            tracing::info!(
                "Shutdown: sent termination signal to {} busy context(s)",
                interrupts.len()
            );
        }

        // Wait for busy contexts to come home through the release path.
        let deadline = Instant::now() + Duration::from_secs(self.config.shutdown_grace_secs);
        let mut guard = self.lock_state();
        while !guard.busy.is_empty() {
            if Instant::now() >= deadline {
                let stuck = guard.busy.len();
                let dump = self.diagnostics_locked(&guard);
                drop(guard);
                return Err(PoolError::fatal(format!(
                    "{} execution context(s) did not terminate within {}s; state: {}",
                    stuck, self.config.shutdown_grace_secs, dump
                )));
            }
            let (g, _) = self
                .changed
                .wait_timeout(guard, SHUTDOWN_WAIT_SLICE)
                .unwrap_or_else(PoisonError::into_inner);
            guard = g;
        }
        drop(guard);

        // Stop the collector before draining so it cannot race the drain.
        let handle = self
            .collector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            self.gc_signal.notify_all();
            let _ = handle.join();
        }

        loop {
            let mut guard = self.lock_state();
            let context = guard
                .idle
                .pop()
                .or_else(|| guard.dirty.pop_front());
            drop(guard);
            match context {
                Some(context) => self.destroy_context(context, SHUTDOWN_GC_BUDGET),
                None => break,
            }
        }

        tracing::info!(
            "Context pool shut down: {} created, {} destroyed over the pool lifetime",
            self.metrics.contexts_created(),
            self.metrics.contexts_destroyed()
        );
        Ok(())
    }

    /// Per-context diagnostic dump, logged on acquisition timeout and
    /// available to the embedding server's admin surface.
    pub fn diagnostics(&self) -> serde_json::Value {
        let guard = self.lock_state();
        self.diagnostics_locked(&guard)
    }

    fn diagnostics_locked(&self, state: &PoolState) -> serde_json::Value {
        let now_stamp = self.now_stamp();
        let idle: Vec<ContextSnapshot> = state
            .idle
            .iter()
            .map(|c| c.snapshot("idle", now_stamp))
            .collect();
        let dirty: Vec<ContextSnapshot> = state
            .dirty
            .iter()
            .map(|c| c.snapshot("dirty", now_stamp))
            .collect();
        let busy: Vec<serde_json::Value> = state
            .busy
            .iter()
            .map(|(id, entry)| {
                serde_json::json!({
                    "id": id,
                    "state": "busy",
                    "description": entry.description,
                    "held_ms": entry.since.elapsed().as_millis() as u64,
                    "interrupt_requested": entry.interrupt.is_requested(),
                })
            })
            .collect();

        serde_json::json!({
            "total": state.live_total(),
            "max": self.max_contexts,
            "collecting": state.collecting,
            "in_flight_creations": state.in_flight_creations,
            "creation_blockers": state.creation_blockers,
            "shutting_down": state.shutting_down,
            "default_context": state.default_context_id,
            "idle": idle,
            "dirty": dirty,
            "busy": busy,
        })
    }

    /// Full pool stats (config + counters), for a stats endpoint.
    pub fn stats(&self) -> serde_json::Value {
        let (idle, dirty, busy) = {
            let guard = self.lock_state();
            (guard.idle.len(), guard.dirty.len(), guard.busy.len())
        };
        serde_json::json!({
            "config": {
                "min_contexts": self.config.min_contexts,
                "max_contexts": self.max_contexts,
                "gc_frequency_secs": self.config.gc_frequency_secs,
                "gc_interval_invocations": self.config.gc_interval_invocations,
                "max_context_age_secs": self.config.max_context_age_secs,
                "max_context_invocations": self.config.max_context_invocations,
            },
            "contexts": { "idle": idle, "dirty": dirty, "busy": busy },
            "metrics": self.metrics.to_json(),
        })
    }
}

/// RAII grant of exclusive access to one execution context.
///
/// Dropping the lease returns the context through the release path and
/// unpins the database.
pub struct ContextLease {
    pool: Arc<ContextPool>,
    context: Option<Box<ExecutionContext>>,
    _pin: Option<DatabasePin>,
}

impl ContextLease {
    pub fn id(&self) -> ContextId {
        self.deref().id()
    }
}

impl std::fmt::Debug for ContextLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextLease")
            .field("context_id", &self.id())
            .finish_non_exhaustive()
    }
}

impl Deref for ContextLease {
    type Target = ExecutionContext;

    fn deref(&self) -> &Self::Target {
        self.context.as_ref().expect("lease holds its context until drop")
    }
}

impl DerefMut for ContextLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.context.as_mut().expect("lease holds its context until drop")
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            self.pool.release_context(context);
        }
    }
}
