//! End-to-end collections with real mutator threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pmcs::api;
use pmcs::gc::GCTrigger;
use pmcs::heap::{ObjectFactory, TypeInfo};
use pmcs::util::logger;
use pmcs::{Epoch, PMCS};

/// A node with two reference slots.
fn node_type() -> &'static TypeInfo {
    TypeInfo::object("Node", 16, &[0, 8]).leak()
}

fn leaf_type() -> &'static TypeInfo {
    TypeInfo::object("Leaf", 16, &[]).leak()
}

fn collector(aux_threads: usize) -> PMCS<ObjectFactory> {
    logger::try_init();
    let mut builder = PMCS::<ObjectFactory>::builder();
    assert!(builder.set_option("threads", &aux_threads.to_string()));
    assert!(builder.set_option("max_parallelism", "4"));
    builder.build()
}

/// S1: live objects behind a root survive and run no finalizers.
#[test]
fn reachable_objects_survive() {
    let pmcs = collector(1);
    let stop = AtomicBool::new(false);
    let ready = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let pmcs = &pmcs;
        let stop = &stop;
        let ready = &ready;
        scope.spawn(move || {
            let mutator = pmcs.register_current_thread();
            let r1 = api::create_object(&mutator, node_type());
            let a = api::create_object(&mutator, node_type());
            let b = api::create_object(&mutator, node_type());
            r1.store_field(0, Some(a));
            a.store_field(0, Some(b));
            mutator.push_root(r1);
            ready.store(true, Ordering::SeqCst);
            while !stop.load(Ordering::SeqCst) {
                api::safe_point(&mutator);
            }
        });

        while !ready.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        let epoch = api::schedule(pmcs);
        api::wait_finalizers(pmcs, epoch);

        assert_eq!(pmcs.allocator().published_object_count(), 3);
        stop.store(true, Ordering::SeqCst);
    });
}

/// S2: unreachable objects are swept and the scheduler sees an empty heap.
#[test]
fn unreachable_objects_are_swept() {
    struct Recorder(Arc<Mutex<Vec<(Epoch, usize)>>>);
    impl GCTrigger for Recorder {
        fn on_gc_finish(&self, epoch: Epoch, allocated_bytes: usize) {
            self.0.lock().unwrap().push((epoch, allocated_bytes));
        }
    }

    logger::try_init();
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let mut builder = PMCS::<ObjectFactory>::builder();
    assert!(builder.set_option("threads", "1"));
    let pmcs: PMCS<ObjectFactory> = builder
        .with_trigger(Box::new(Recorder(recorded.clone())))
        .build();

    let stop = AtomicBool::new(false);
    let ready = AtomicBool::new(false);
    std::thread::scope(|scope| {
        let pmcs = &pmcs;
        let stop = &stop;
        let ready = &ready;
        scope.spawn(move || {
            let mutator = pmcs.register_current_thread();
            for _ in 0..1000 {
                api::create_object(&mutator, leaf_type());
            }
            ready.store(true, Ordering::SeqCst);
            while !stop.load(Ordering::SeqCst) {
                api::safe_point(&mutator);
            }
        });

        while !ready.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        let epoch = api::schedule(pmcs);
        api::wait_finished(pmcs, epoch);

        assert_eq!(pmcs.allocator().published_object_count(), 0);
        assert_eq!(pmcs.allocated_bytes(), 0);
        assert_eq!(*recorded.lock().unwrap(), vec![(epoch, 0)]);
        stop.store(true, Ordering::SeqCst);
    });
}

/// S3: many mutators, parallel markers; every root set is scanned exactly
/// once and every root survives.
#[test]
fn all_root_sets_scanned_exactly_once() {
    const MUTATORS: usize = 4;
    const ROOTS_PER_MUTATOR: usize = 10;
    let pmcs = collector(3);
    let stop = AtomicBool::new(false);
    let ready = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        let pmcs = &pmcs;
        let stop = &stop;
        let ready = &ready;
        for _ in 0..MUTATORS {
            scope.spawn(move || {
                let mutator = pmcs.register_current_thread();
                for _ in 0..ROOTS_PER_MUTATOR {
                    let root = api::create_object(&mutator, leaf_type());
                    mutator.push_root(root);
                }
                ready.fetch_add(1, Ordering::SeqCst);
                while !stop.load(Ordering::SeqCst) {
                    api::safe_point(&mutator);
                }
            });
        }

        while ready.load(Ordering::SeqCst) < MUTATORS {
            std::thread::sleep(Duration::from_millis(5));
        }
        let epoch = api::schedule(pmcs);
        api::wait_finished(pmcs, epoch);

        assert_eq!(pmcs.mark_dispatcher().scanned_root_sets(), MUTATORS);
        assert_eq!(
            pmcs.allocator().published_object_count(),
            MUTATORS * ROOTS_PER_MUTATOR
        );
        stop.store(true, Ordering::SeqCst);
    });
}

/// S4: a finalizer runs exactly once, before wait_finalizers returns.
#[test]
fn finalizer_runs_exactly_once() {
    let pmcs = collector(1);
    let finalized = Arc::new(AtomicUsize::new(0));
    let finalizable = {
        let finalized = finalized.clone();
        TypeInfo::object("Finalizable", 16, &[])
            .with_finalizer(Arc::new(move |_| {
                finalized.fetch_add(1, Ordering::SeqCst);
            }))
            .leak()
    };

    let stop = AtomicBool::new(false);
    let ready = AtomicBool::new(false);
    std::thread::scope(|scope| {
        let pmcs = &pmcs;
        let stop = &stop;
        let ready = &ready;
        scope.spawn(move || {
            let mutator = pmcs.register_current_thread();
            // Allocated and immediately unreachable.
            api::create_object(&mutator, finalizable);
            ready.store(true, Ordering::SeqCst);
            while !stop.load(Ordering::SeqCst) {
                api::safe_point(&mutator);
            }
        });

        while !ready.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        let epoch = api::schedule(pmcs);
        api::wait_finalizers(pmcs, epoch);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);

        // A second collection does not run it again.
        let epoch = api::schedule(pmcs);
        api::wait_finalizers(pmcs, epoch);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        stop.store(true, Ordering::SeqCst);
    });
}

/// S5: schedule() collapses while the pending epoch has not started. The
/// mutator refuses to park, so the epoch cannot start until we let it.
#[test]
fn consecutive_schedules_collapse_to_one_epoch() {
    let pmcs = collector(1);
    let registered = AtomicBool::new(false);
    let may_park = AtomicBool::new(false);
    let stop = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let pmcs = &pmcs;
        let registered = &registered;
        let may_park = &may_park;
        let stop = &stop;
        scope.spawn(move || {
            let mutator = pmcs.register_current_thread();
            registered.store(true, Ordering::SeqCst);
            while !stop.load(Ordering::SeqCst) {
                if may_park.load(Ordering::SeqCst) {
                    api::safe_point(&mutator);
                }
                std::hint::spin_loop();
            }
        });

        while !registered.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        // The GC thread may wake up, but it cannot reach start(epoch) while
        // the mutator keeps running.
        let e1 = api::schedule(pmcs);
        std::thread::sleep(Duration::from_millis(50));
        let e2 = api::schedule(pmcs);
        let e3 = api::schedule(pmcs);
        assert_eq!(e1, e2);
        assert_eq!(e2, e3);

        may_park.store(true, Ordering::SeqCst);
        api::wait_finished(pmcs, e1);
        stop.store(true, Ordering::SeqCst);
    });
}

/// S6: teardown with a collection in flight: the epoch completes (its
/// finalizers run), then every GC thread joins.
#[test]
fn shutdown_completes_inflight_epoch() {
    let pmcs = collector(1);
    let finalized = Arc::new(AtomicUsize::new(0));
    let finalizable = {
        let finalized = finalized.clone();
        TypeInfo::object("LastRites", 16, &[])
            .with_finalizer(Arc::new(move |_| {
                finalized.fetch_add(1, Ordering::SeqCst);
            }))
            .leak()
    };

    let may_park = AtomicBool::new(false);
    let stop = AtomicBool::new(false);
    let ready = AtomicBool::new(false);
    std::thread::scope(|scope| {
        let pmcs = &pmcs;
        let may_park = &may_park;
        let stop = &stop;
        let ready = &ready;
        scope.spawn(move || {
            let mutator = pmcs.register_current_thread();
            api::create_object(&mutator, finalizable);
            ready.store(true, Ordering::SeqCst);
            while !stop.load(Ordering::SeqCst) {
                if may_park.load(Ordering::SeqCst) {
                    api::safe_point(&mutator);
                }
                std::hint::spin_loop();
            }
        });

        while !ready.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        let epoch = api::schedule(pmcs);
        // The GC is now stuck requesting the pause, i.e. mid-collection.
        std::thread::sleep(Duration::from_millis(50));
        may_park.store(true, Ordering::SeqCst);
        api::wait_finished(pmcs, epoch);
        stop.store(true, Ordering::SeqCst);
    });

    drop(pmcs);
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
}

/// Weak refs: cleared for dead referents, preserved for live ones.
#[test]
fn weak_refs_follow_liveness() {
    let pmcs = collector(1);
    let stop = AtomicBool::new(false);
    let cells = Mutex::new(None);

    std::thread::scope(|scope| {
        let pmcs = &pmcs;
        let stop = &stop;
        let cells = &cells;
        scope.spawn(move || {
            let mutator = pmcs.register_current_thread();
            let live = api::create_object(&mutator, leaf_type());
            let dead = api::create_object(&mutator, leaf_type());
            mutator.push_root(live);
            *cells.lock().unwrap() =
                Some((pmcs.create_weak_ref(live), pmcs.create_weak_ref(dead)));
            while !stop.load(Ordering::SeqCst) {
                api::safe_point(&mutator);
            }
        });

        while cells.lock().unwrap().is_none() {
            std::thread::sleep(Duration::from_millis(5));
        }
        let epoch = api::schedule(pmcs);
        api::wait_finished(pmcs, epoch);

        let guard = cells.lock().unwrap();
        let (live_cell, dead_cell) = guard.as_ref().unwrap();
        assert!(api::try_ref(live_cell).is_some());
        assert!(api::try_ref(dead_cell).is_none());
        stop.store(true, Ordering::SeqCst);
    });
}

/// Cooperative marking: the parked mutator scans its own roots and is
/// recorded as cooperating; the collection stays correct.
#[test]
fn cooperative_mutators_scan_their_own_roots() {
    logger::try_init();
    let mut builder = PMCS::<ObjectFactory>::builder();
    assert!(builder.set_option("threads", "1"));
    assert!(builder.set_option("mutators_cooperate", "true"));
    let pmcs: PMCS<ObjectFactory> = builder.build();

    let stop = AtomicBool::new(false);
    let ready = AtomicBool::new(false);
    let cooperative = AtomicBool::new(false);
    std::thread::scope(|scope| {
        let pmcs = &pmcs;
        let stop = &stop;
        let ready = &ready;
        let cooperative = &cooperative;
        scope.spawn(move || {
            let mutator = pmcs.register_current_thread();
            let root = api::create_object(&mutator, node_type());
            root.store_field(0, Some(api::create_object(&mutator, leaf_type())));
            mutator.push_root(root);
            ready.store(true, Ordering::SeqCst);
            while !stop.load(Ordering::SeqCst) {
                api::safe_point(&mutator);
                if mutator.thread().is_cooperative() {
                    cooperative.store(true, Ordering::SeqCst);
                }
            }
        });

        while !ready.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        let epoch = api::schedule(pmcs);
        api::wait_finished(pmcs, epoch);
        assert_eq!(pmcs.allocator().published_object_count(), 2);

        stop.store(true, Ordering::SeqCst);
    });
    assert!(cooperative.load(Ordering::SeqCst));
}

/// The finalizer thread lifecycle entry points.
#[test]
fn finalizer_thread_lifecycle() {
    let pmcs = collector(0);
    assert!(!api::finalizers_thread_is_running(&pmcs));
    api::start_finalizer_thread_if_needed(&pmcs);
    assert!(api::finalizers_thread_is_running(&pmcs));
    api::stop_finalizer_thread_if_running(&pmcs);
    assert!(!api::finalizers_thread_is_running(&pmcs));
}

/// Reconfiguration rebuilds the worker pool between collections.
#[test]
fn reconfigure_between_collections() {
    let pmcs = collector(2);
    let e = api::schedule(&pmcs);
    api::wait_finished(&pmcs, e);

    pmcs.reconfigure(2, true, 1);

    let stop = AtomicBool::new(false);
    let ready = AtomicBool::new(false);
    std::thread::scope(|scope| {
        let pmcs = &pmcs;
        let stop = &stop;
        let ready = &ready;
        scope.spawn(move || {
            let mutator = pmcs.register_current_thread();
            let root = api::create_object(&mutator, leaf_type());
            mutator.push_root(root);
            ready.store(true, Ordering::SeqCst);
            while !stop.load(Ordering::SeqCst) {
                api::safe_point(&mutator);
            }
        });
        while !ready.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        let e = api::schedule(pmcs);
        api::wait_finished(pmcs, e);
        assert_eq!(pmcs.allocator().published_object_count(), 1);
        stop.store(true, Ordering::SeqCst);
    });
}
