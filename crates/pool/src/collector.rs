//! Background garbage-collection thread.
//!
//! The collector alternates fairness between idle and dirty contexts,
//! drains backlog on a reduced wait interval after a productive pass, and
//! retires over-aged or over-used surplus contexts after cleaning them.
//! A failed pass is never fatal; the collector logs it and treats the cycle
//! as idle.

use std::sync::{Arc, PoisonError, Weak};
use std::time::{Duration, Instant};

use runtime_core::PoolConfig;

use crate::context::ExecutionContext;
use crate::cpu_time::thread_cpu_time;
use crate::pool::{ContextPool, PoolState};

/// Budget for one routine collection pass.
const ROUTINE_GC_BUDGET: Duration = Duration::from_secs(1);
/// Floor for the reduced (backlog-draining) wait interval.
const MIN_REDUCED_WAIT: Duration = Duration::from_millis(250);

pub(crate) fn collector_loop(pool: Weak<ContextPool>) {
    tracing::debug!("Collector thread started");
    let mut prefer_free = false;
    let mut drain_backlog = false;
    let mut timed_out = false;

    loop {
        let Some(pool) = pool.upgrade() else { break };
        let regular = Duration::from_secs_f64(pool.config.gc_frequency_secs.max(0.001));
        let reduced = (regular / 10).max(MIN_REDUCED_WAIT).min(regular);

        let mut guard = pool.lock_state();
        if guard.shutting_down {
            break;
        }

        // Each round advances the global collection stamp; contexts are
        // measured against it both here and in the release routing.
        guard.global_gc_stamp = pool.now_stamp();

        // Alternate which kind of context gets first pick, so a steady
        // stream of dirty contexts cannot starve idle ones of cleaning
        // (and vice versa).
        prefer_free = !prefer_free;

        let mut candidate: Option<(Box<ExecutionContext>, bool)> = None;
        if prefer_free {
            if let Some(pos) = pick_free_context_for_gc(&guard, &pool.config) {
                candidate = Some((guard.idle.remove(pos), false));
            }
        }
        if candidate.is_none() {
            while let Some(context) = guard.dirty.pop_front() {
                if context.is_low_activity() {
                    // Not worth a pass; return it to service directly.
                    tracing::debug!(
                        "Context {} has low activity, skipping collection",
                        context.id()
                    );
                    guard.idle.push(context);
                    pool.changed.notify_all();
                    continue;
                }
                candidate = Some((context, true));
                break;
            }
        }
        if candidate.is_none() && timed_out {
            // Nothing signalled us awake; opportunistically clean an idle
            // context if one qualifies.
            if let Some(pos) = pick_free_context_for_gc(&guard, &pool.config) {
                candidate = Some((guard.idle.remove(pos), false));
            }
        }

        match candidate {
            Some((context, was_dirty)) => {
                // The context is in no set while the pass runs; keep it in
                // the live count so acquirers cannot grow past the ceiling.
                guard.collecting += 1;
                drop(guard);
                drain_backlog = run_pass(&pool, context, was_dirty);
                timed_out = false;
            }
            None => {
                let wait = if drain_backlog { reduced } else { regular };
                drain_backlog = false;
                let (guard, wait_result) = pool
                    .gc_signal
                    .wait_timeout(guard, wait)
                    .unwrap_or_else(PoisonError::into_inner);
                timed_out = wait_result.timed_out();
                drop(guard);
            }
        }
    }
    tracing::debug!("Collector thread stopped");
}

/// Scan the idle set for the least-recently-collected context with real
/// activity. Returns `None` when the best candidate was collected within
/// `gc_frequency_secs` of the global stamp (a pass would be redundant).
fn pick_free_context_for_gc(state: &PoolState, config: &PoolConfig) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (pos, context) in state.idle.iter().enumerate() {
        if !context.has_activity() {
            continue;
        }
        match best {
            None => best = Some((pos, context.last_gc_stamp())),
            Some((_, stamp)) if context.last_gc_stamp() < stamp => {
                best = Some((pos, context.last_gc_stamp()));
            }
            _ => {}
        }
    }
    let (pos, stamp) = best?;
    if state.global_gc_stamp - stamp < config.gc_frequency_secs {
        return None;
    }
    Some(pos)
}

/// One pass over one context, followed by the retirement check. Returns
/// whether the pass produced work (drives the reduced wait interval).
fn run_pass(pool: &Arc<ContextPool>, mut context: Box<ExecutionContext>, was_dirty: bool) -> bool {
    let wall = Instant::now();
    let cpu_before = thread_cpu_time();
    let result = context.run_collection(ROUTINE_GC_BUDGET, pool.now_stamp());
    match &result {
        Ok(()) => tracing::debug!(
            "Collected context {} in {}ms wall, {}ms CPU",
            context.id(),
            wall.elapsed().as_millis(),
            thread_cpu_time().saturating_sub(cpu_before).as_millis()
        ),
        Err(err) => tracing::warn!("Collection pass on context {} failed: {}", context.id(), err),
    }

    let mut guard = pool.lock_state();
    guard.collecting -= 1;
    guard.global_gc_stamp = pool.now_stamp();

    // `live_total` no longer counts the context in hand, hence the + 1.
    let above_min = guard.live_total() + guard.in_flight_creations + 1 > pool.config.min_contexts;
    let retire = result.is_ok()
        && !guard.shutting_down
        && guard.creation_blockers == 0
        && above_min
        && context.retirement_eligible(&pool.config);

    if retire {
        guard.mailboxes.remove(&context.id());
        drop(guard);
        tracing::info!(
            "Retiring execution context {} after {} invocation(s), age {:.1}s",
            context.id(),
            context.total_invocations(),
            context.age().as_secs_f64()
        );
        pool.metrics.note_destroyed();
        drop(context);
    } else if was_dirty {
        // Freshly cleaned; put it on top of the stack where the next
        // acquire finds it.
        guard.idle.push(context);
        drop(guard);
    } else {
        guard.idle.insert(0, context);
        drop(guard);
    }
    pool.changed.notify_all();
    result.is_ok()
}
