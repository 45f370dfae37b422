//! End-to-end pool behavior: admission control, reuse order, growth,
//! broadcast, retirement, and shutdown, exercised through the public API
//! with stub collaborators.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pool::{ContextPool, SecurityProfile};
use runtime_core::testing::{StubEngine, StubIsolate, StubLoader, stub_collaborators};
use runtime_core::{InMemoryDatabaseRegistry, Isolate, PoolConfig, PoolError, ScriptId};

fn start_pool(
    config: PoolConfig,
) -> (
    Arc<ContextPool>,
    Arc<StubEngine>,
    Arc<StubLoader>,
    Arc<InMemoryDatabaseRegistry>,
) {
    let (engine, loader, registry) = stub_collaborators();
    let pool = ContextPool::new(
        config,
        engine.clone(),
        loader.clone(),
        registry.clone(),
    )
    .expect("valid config");
    pool.start().expect("startup succeeds");
    (pool, engine, loader, registry)
}

fn small_config(min: usize, max: usize) -> PoolConfig {
    PoolConfig {
        min_contexts: min,
        max_contexts: max,
        // Keep test failures bounded; individual tests shrink this further
        // when the timeout itself is under test.
        acquire_timeout_secs: 30,
        ..PoolConfig::default()
    }
}

#[test]
fn no_two_threads_share_a_context() {
    let (pool, engine, _, _) = start_pool(small_config(1, 3));
    let held: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));
    let concurrent = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..6 {
        let pool = Arc::clone(&pool);
        let held = Arc::clone(&held);
        let concurrent = Arc::clone(&concurrent);
        handles.push(std::thread::spawn(move || {
            for _ in 0..25 {
                let lease = pool
                    .acquire("_system", SecurityProfile::RestAction)
                    .expect("acquire within ceiling");
                let in_use = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                assert!(in_use <= 3, "{} leases outstanding at once", in_use);
                assert!(
                    held.lock().unwrap().insert(lease.id()),
                    "context {} handed to two threads",
                    lease.id()
                );
                std::thread::sleep(Duration::from_millis(1));
                assert!(held.lock().unwrap().remove(&lease.id()));
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(engine.created_count() <= 3);
    assert_eq!(pool.metrics().contexts_entered(), 150);
    assert_eq!(pool.metrics().contexts_exited(), 150);
}

#[test]
fn pool_grows_to_ceiling_then_times_out() {
    let config = PoolConfig {
        acquire_timeout_secs: 1,
        ..small_config(1, 2)
    };
    let (pool, engine, _, _) = start_pool(config);

    let _first = pool.acquire("_system", SecurityProfile::RestAction).unwrap();
    let _second = pool.acquire("_system", SecurityProfile::RestAction).unwrap();
    assert_eq!(engine.created_count(), 2);

    let started = Instant::now();
    let err = pool
        .acquire("_system", SecurityProfile::RestAction)
        .expect_err("third acquire must hit the ceiling");
    let waited = started.elapsed();

    assert!(matches!(err, PoolError::Timeout));
    assert!(err.is_retryable());
    assert!(waited >= Duration::from_millis(900), "waited {:?}", waited);
    assert!(waited < Duration::from_secs(5), "waited {:?}", waited);
    // The bound held: no extra context was built for the blocked caller.
    assert_eq!(engine.created_count(), 2);
    assert_eq!(pool.diagnostics()["total"], 2);
    assert_eq!(pool.metrics().enter_failures(), 1);
}

#[test]
fn released_contexts_are_reused_warmest_first() {
    let (pool, _, _, _) = start_pool(small_config(1, 2));

    let first = pool.acquire("_system", SecurityProfile::RestAction).unwrap();
    let second = pool.acquire("_system", SecurityProfile::RestAction).unwrap();
    let (a, b) = (first.id(), second.id());
    assert_ne!(a, b);

    drop(first);
    drop(second);

    // b was released last, so it is on top of the idle stack.
    let third = pool.acquire("_system", SecurityProfile::RestAction).unwrap();
    assert_eq!(third.id(), b);
    let fourth = pool.acquire("_system", SecurityProfile::RestAction).unwrap();
    assert_eq!(fourth.id(), a);
}

#[test]
fn lease_pins_its_database() {
    let (pool, _, _, registry) = start_pool(small_config(1, 2));
    assert_eq!(registry.pin_count("_system"), Some(0));

    let lease = pool.acquire("_system", SecurityProfile::Task).unwrap();
    assert_eq!(registry.pin_count("_system"), Some(1));
    let other = pool.acquire("_system", SecurityProfile::Task).unwrap();
    assert_eq!(registry.pin_count("_system"), Some(2));

    drop(lease);
    drop(other);
    assert_eq!(registry.pin_count("_system"), Some(0));
}

#[test]
fn unknown_database_fails_before_consuming_a_context() {
    let (pool, _, _, _) = start_pool(small_config(1, 2));
    let err = pool
        .acquire("does-not-exist", SecurityProfile::RestAction)
        .expect_err("unknown database");
    assert!(matches!(err, PoolError::NotFound(_)));
    assert_eq!(pool.metrics().contexts_entered(), 0);
}

#[test]
fn failed_growth_leaves_the_pool_usable() {
    let (pool, engine, _, _) = start_pool(small_config(1, 2));
    let lease = pool.acquire("_system", SecurityProfile::RestAction).unwrap();

    engine.fail_creations(true);
    let err = pool
        .acquire("_system", SecurityProfile::RestAction)
        .expect_err("growth must fail while creation is disabled");
    assert!(matches!(err, PoolError::Internal { .. }));
    assert!(!err.is_fatal());

    // The failed attempt released its reservation; the existing context
    // still circulates normally.
    drop(lease);
    let lease = pool.acquire("_system", SecurityProfile::RestAction).unwrap();
    drop(lease);
    assert_eq!(engine.created_count(), 1);
}

#[test]
fn slow_construction_does_not_block_other_callers() {
    let (engine, loader, registry) = (
        Arc::new(StubEngine::with_construction_delay(Duration::from_millis(300))),
        Arc::new(StubLoader::new()),
        Arc::new(InMemoryDatabaseRegistry::new()),
    );
    registry.create("_system");
    let pool = ContextPool::new(
        small_config(1, 2),
        engine.clone(),
        loader,
        registry,
    )
    .unwrap();
    pool.start().unwrap();

    let first = pool.acquire("_system", SecurityProfile::RestAction).unwrap();

    // This acquire finds nothing idle and starts building a second
    // context; the pool mutex is free for its whole 300 ms construction.
    let builder = {
        let pool = Arc::clone(&pool);
        std::thread::spawn(move || {
            pool.acquire("_system", SecurityProfile::RestAction)
                .map(|lease| lease.id())
        })
    };

    std::thread::sleep(Duration::from_millis(50));
    let released_id = first.id();
    drop(first);
    let started = Instant::now();
    let reacquired = pool.acquire("_system", SecurityProfile::RestAction).unwrap();
    assert!(
        started.elapsed() < Duration::from_millis(250),
        "re-acquire stalled behind construction: {:?}",
        started.elapsed()
    );
    assert_eq!(reacquired.id(), released_id);

    let built_id = builder.join().unwrap().unwrap();
    assert_ne!(built_id, released_id);
    assert_eq!(engine.created_count(), 2);
}

#[test]
fn broadcast_reaches_every_live_context() {
    let (pool, _, loader, _) = start_pool(small_config(3, 4));

    let reached = pool
        .run_in_all_contexts(&ScriptId::new("admin/reload-routes"))
        .unwrap();
    assert_eq!(reached, 3);
    assert_eq!(loader.load_count(), 3);
}

#[test]
fn broadcast_pauses_growth_until_finished() {
    let config = PoolConfig {
        acquire_timeout_secs: 5,
        ..small_config(1, 4)
    };
    let (pool, engine, loader, _) = start_pool(config);
    loader.set_load_delay(Duration::from_millis(250));

    let broadcaster = {
        let pool = Arc::clone(&pool);
        std::thread::spawn(move || pool.run_in_all_contexts(&ScriptId::new("admin/reload-routes")))
    };

    // Wait until the broadcast has taken the only context out of the pool
    // (it holds it for the whole 250 ms load).
    let taken = Instant::now() + Duration::from_secs(2);
    while pool.diagnostics()["total"] != 0 {
        assert!(Instant::now() < taken, "broadcast never took the context");
        std::thread::sleep(Duration::from_millis(5));
    }
    let started = Instant::now();
    let lease = pool.acquire("_system", SecurityProfile::RestAction).unwrap();
    let waited = started.elapsed();
    drop(lease);

    // The acquire could not grow the pool; it waited for the broadcast to
    // return the context instead of building a second one.
    assert!(waited >= Duration::from_millis(100), "waited {:?}", waited);
    assert_eq!(engine.created_count(), 1);
    assert_eq!(broadcaster.join().unwrap().unwrap(), 1);
    assert_eq!(loader.load_count(), 1);
}

#[test]
fn deferred_hooks_run_at_the_next_exclusive_hold() {
    let (pool, _, _, _) = start_pool(small_config(1, 2));
    let ran = Arc::new(AtomicUsize::new(0));

    // Idle context: the hook runs during acquire preparation.
    {
        let ran = Arc::clone(&ran);
        pool.defer_in_all(Arc::new(move |_context| {
            ran.fetch_add(1, Ordering::SeqCst);
        }));
    }
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    let lease = pool.acquire("_system", SecurityProfile::RestAction).unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    // Busy context: the hook is queued now and runs at release.
    {
        let ran = Arc::clone(&ran);
        pool.defer_in_all(Arc::new(move |_context| {
            ran.fetch_add(1, Ordering::SeqCst);
        }));
    }
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    drop(lease);
    assert_eq!(ran.load(Ordering::SeqCst), 2);
}

#[test]
fn release_routing_keeps_the_pool_available() {
    let config = PoolConfig {
        // Every release is collection-eligible, so routing is decided
        // purely by whether another idle context exists.
        gc_interval_invocations: 1,
        gc_frequency_secs: 1e9,
        ..small_config(1, 2)
    };
    let (pool, _, _, _) = start_pool(config);

    // Sole context: eligible or not, it must stay acquirable.
    let lease = pool.acquire("_system", SecurityProfile::RestAction).unwrap();
    drop(lease);
    let lease = pool.acquire("_system", SecurityProfile::RestAction).unwrap();

    // With a second context idle, the first release may sit in the dirty
    // set; the collector sends low-activity contexts straight back.
    let second = pool.acquire("_system", SecurityProfile::RestAction).unwrap();
    drop(second);
    drop(lease);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = pool.stats();
        let idle = stats["contexts"]["idle"].as_u64().unwrap();
        let dirty = stats["contexts"]["dirty"].as_u64().unwrap();
        if idle == 2 && dirty == 0 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "contexts never settled back to idle: {}",
            stats
        );
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(pool.metrics().contexts_destroyed(), 0);
}

#[test]
fn surplus_contexts_are_retired_after_collection() {
    let config = PoolConfig {
        min_contexts: 1,
        max_contexts: 2,
        max_context_invocations: 1,
        gc_frequency_secs: 0.3,
        acquire_timeout_secs: 5,
        ..PoolConfig::default()
    };
    let (pool, engine, _, _) = start_pool(config);

    let first = pool.acquire("_system", SecurityProfile::RestAction).unwrap();
    let second = pool.acquire("_system", SecurityProfile::RestAction).unwrap();
    assert_eq!(engine.created_count(), 2);
    drop(second);
    drop(first);

    // The collector needs a couple of rounds: a pass on each context, then
    // the retirement check on the non-default one.
    let deadline = Instant::now() + Duration::from_secs(10);
    while pool.metrics().contexts_destroyed() == 0 {
        assert!(
            Instant::now() < deadline,
            "surplus context never retired: {}",
            pool.diagnostics()
        );
        std::thread::sleep(Duration::from_millis(50));
    }

    // Back down to the minimum, and the survivor is the default context.
    let diagnostics = pool.diagnostics();
    assert_eq!(diagnostics["total"], 1);
    assert_eq!(diagnostics["idle"][0]["is_default"], true);
}

#[test]
fn shutdown_interrupts_busy_contexts_and_drains_the_pool() {
    let (pool, _, _, _) = start_pool(small_config(2, 2));

    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let worker = {
        let pool = Arc::clone(&pool);
        std::thread::spawn(move || {
            let mut lease = pool.acquire("_system", SecurityProfile::Task).unwrap();
            ready_tx.send(()).unwrap();
            // A cooperative script: poll for the termination signal.
            while !lease.isolate_mut().interrupt_handle().is_requested() {
                std::thread::sleep(Duration::from_millis(5));
            }
        })
    };
    ready_rx.recv().unwrap();

    pool.shutdown().expect("cooperative worker yields in time");
    worker.join().unwrap();

    let err = pool
        .acquire("_system", SecurityProfile::RestAction)
        .expect_err("no contexts after shutdown");
    assert!(matches!(err, PoolError::ShuttingDown));

    let metrics = pool.metrics();
    assert_eq!(metrics.contexts_created(), metrics.contexts_destroyed());
    assert_eq!(pool.diagnostics()["total"], 0);
}

#[test]
fn context_under_collection_still_counts_against_the_bound() {
    let (engine, loader, registry) = stub_collaborators();
    // A long pass keeps the context out of every set while it runs.
    engine.set_collect_delay(Duration::from_millis(400));
    let config = PoolConfig {
        gc_frequency_secs: 0.2,
        acquire_timeout_secs: 5,
        ..small_config(1, 1)
    };
    let pool = ContextPool::new(config, engine.clone(), loader, registry).unwrap();
    pool.start().unwrap();

    let lease = pool.acquire("_system", SecurityProfile::RestAction).unwrap();
    let id = lease.id();
    drop(lease);

    // Wait until the collector has the sole context in hand.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let diagnostics = pool.diagnostics();
        if diagnostics["collecting"] == 1 {
            assert_eq!(
                diagnostics["total"], 1,
                "context under collection fell out of the live count: {}",
                diagnostics
            );
            break;
        }
        assert!(
            Instant::now() < deadline,
            "collector never took the context: {}",
            diagnostics
        );
        std::thread::sleep(Duration::from_millis(5));
    }

    // An acquire during the pass must wait for the same context to come
    // back rather than building a second one past the ceiling.
    let lease = pool.acquire("_system", SecurityProfile::RestAction).unwrap();
    assert_eq!(lease.id(), id);
    assert_eq!(engine.created_count(), 1);
    assert_eq!(pool.diagnostics()["total"], 1);
}

#[test]
fn out_of_memory_release_gets_an_extended_pass() {
    let (pool, _, _, _) = start_pool(small_config(1, 1));

    let mut lease = pool.acquire("_system", SecurityProfile::RestAction).unwrap();
    lease
        .isolate_mut()
        .as_any_mut()
        .downcast_mut::<StubIsolate>()
        .unwrap()
        .set_out_of_memory();
    drop(lease);

    // The release path ran one synchronous pass and cleared the flag
    // before the context went back into circulation.
    let mut lease = pool.acquire("_system", SecurityProfile::RestAction).unwrap();
    let isolate = lease
        .isolate_mut()
        .as_any_mut()
        .downcast_mut::<StubIsolate>()
        .unwrap();
    assert_eq!(isolate.gc_passes, 1);
    assert!(!isolate.has_out_of_memory());
}

#[test]
fn shutdown_signal_is_not_lost_to_a_racing_acquire() {
    // The clear of a context's interrupt flag and shutdown's request of it
    // race on every acquisition; whichever order they land in, a holder
    // acquired around shutdown must still observe the signal.
    for _ in 0..50 {
        let config = PoolConfig {
            shutdown_grace_secs: 2,
            ..small_config(1, 1)
        };
        let (pool, _, _, _) = start_pool(config);
        let worker = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                if let Ok(mut lease) = pool.acquire("_system", SecurityProfile::Task) {
                    while !lease.isolate_mut().interrupt_handle().is_requested() {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            })
        };
        pool.shutdown()
            .expect("a cooperative holder must see the termination signal");
        worker.join().unwrap();
    }
}

#[test]
fn shutdown_twice_is_a_no_op() {
    let (pool, _, _, _) = start_pool(small_config(1, 1));
    pool.shutdown().unwrap();
    pool.shutdown().unwrap();
}
