//! The orchestrator: GC thread bodies and the per-epoch collection routine.
//!
//! The main GC thread loops on the state machine, running one full
//! collection per scheduled epoch. Auxiliary threads are pure mark workers.
//! `perform_full_gc` is serialized against `reconfigure` by the process-wide
//! GC mutex; it is the only place the world is stopped.

use std::sync::Arc;

use crate::gc::handle::{GCHandle, GCPhase};
use crate::heap::Allocator;
use crate::mm;
use crate::pmcs::GlobalData;
use crate::Epoch;

/// Spawn a named GC thread with entry/exit logging.
fn spawn_gc_thread<F>(name: &str, body: F) -> std::thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    let thread_name = name.to_string();
    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            debug!("{} starts execution", thread_name);
            body();
            debug!("{} finishes execution", thread_name);
        })
        .unwrap_or_else(|e| panic!("failed to spawn {}: {}", name, e))
}

/// Spawn the main GC thread and the configured auxiliary workers. Called
/// once, at collector construction.
pub(crate) fn spawn_gc_threads<A: Allocator>(global: &Arc<GlobalData<A>>, aux_gc_threads: usize) {
    let mut threads = global.gc_threads.lock().unwrap();
    assert!(threads.main.is_none(), "GC threads spawned twice");
    threads.main = Some(spawn_gc_thread("Main GC thread", {
        let global = global.clone();
        move || main_gc_thread_body(&global)
    }));
    drop(threads);
    spawn_aux_threads(global, aux_gc_threads);
}

pub(crate) fn spawn_aux_threads<A: Allocator>(global: &Arc<GlobalData<A>>, count: usize) {
    if count == 0 {
        return;
    }
    assert!(
        !cfg!(feature = "single_threaded_mark"),
        "auxiliary GC threads must not be created with single-threaded mark"
    );
    if count >= global.dispatcher.max_parallelism() {
        warn!(
            "{} auxiliary GC threads configured but max_parallelism is {}; some will idle",
            count,
            global.dispatcher.max_parallelism()
        );
    }
    let mut threads = global.gc_threads.lock().unwrap();
    for _ in 0..count {
        threads.aux.push(spawn_gc_thread("Auxiliary GC thread", {
            let global = global.clone();
            move || auxiliary_gc_thread_body(&global)
        }));
    }
}

fn main_gc_thread_body<A: Allocator>(global: &Arc<GlobalData<A>>) {
    while let Some(epoch) = global.state.wait_scheduled() {
        perform_full_gc(global, epoch);
    }
    // Teardown: release the auxiliary workers from their between-epoch wait.
    global.dispatcher.request_shutdown();
}

fn auxiliary_gc_thread_body<A: Allocator>(global: &Arc<GlobalData<A>>) {
    let mut last_epoch: Epoch = 0;
    while !global.dispatcher.shutdown_requested() {
        global.dispatcher.run_auxiliary(&mut last_epoch);
    }
}

/// One full collection. Runs on the main GC thread only.
pub(crate) fn perform_full_gc<A: Allocator>(global: &Arc<GlobalData<A>>, epoch: Epoch) {
    let gc_lock = global.gc_mutex.lock().unwrap();
    assert!(
        !mm::current_thread_is_registered(),
        "a full GC must run on an unregistered thread"
    );
    let handle = GCHandle::create(&global.stats, epoch);

    global.dispatcher.begin_marking_epoch(global.as_ref(), &handle);

    let did_suspend = global.suspension.request_threads_suspension();
    assert!(did_suspend, "only the GC thread can request suspension");
    handle.suspension_requested();
    global.suspension.wait_for_threads_suspension();
    handle.threads_are_suspended();

    global.trigger.on_gc_start();
    global.state.start(epoch);

    global.dispatcher.run_main_in_stw(global.as_ref(), &handle);
    global.dispatcher.end_marking_epoch(global.as_ref());

    // By this point the whole live heap is marked. Everything mutated or
    // allocated from here on belongs to the next epoch.

    #[cfg(feature = "concurrent_weak_sweep")]
    {
        global.barriers.enable_weak_ref_barriers(epoch);
        global.suspension.resume_threads();
        handle.threads_are_resumed();
    }

    global.weak_refs.process_weaks(&handle);

    #[cfg(feature = "concurrent_weak_sweep")]
    {
        let did_suspend = global.suspension.request_threads_suspension();
        assert!(did_suspend, "only the GC thread can request suspension");
        handle.suspension_requested();
        global.suspension.wait_for_threads_suspension();
        handle.threads_are_suspended();
        global.barriers.disable_weak_ref_barriers();
    }

    // Publish the remaining mutator allocation buffers and pin the sweep
    // set while the world is still stopped, so no destroying thread can
    // publish into the global state at an unexpected time.
    global.allocator.prepare_for_gc(&global.registry);

    global.suspension.resume_threads();
    handle.threads_are_resumed();

    handle.phase_started(GCPhase::Sweep);
    let finalizer_queue = global.allocator.sweep(&handle);
    handle.phase_done(GCPhase::Sweep);

    global
        .trigger
        .on_gc_finish(epoch, global.allocator.allocated_bytes());
    global.state.finish(epoch);
    handle.finalizers_scheduled(finalizer_queue.len());
    handle.finished();

    // Scheduling tasks may start the finalizer thread, which can block on
    // OS primitives that take library-global locks; the GC mutex must be
    // released first.
    drop(gc_lock);
    global.finalizers.schedule_tasks(finalizer_queue, epoch);
}

/// Rebuild the marking configuration and the auxiliary worker pool.
pub(crate) fn reconfigure<A: Allocator>(
    global: &Arc<GlobalData<A>>,
    max_parallelism: usize,
    mutators_cooperate: bool,
    aux_gc_threads: usize,
) {
    if cfg!(feature = "single_threaded_mark") {
        assert_eq!(
            aux_gc_threads, 0,
            "auxiliary GC threads must not be created with single-threaded mark"
        );
        return;
    }
    let _gc_lock = global.gc_mutex.lock().unwrap();
    debug_assert!(!global.state.collection_in_progress());
    global
        .dispatcher
        .reset(max_parallelism, mutators_cooperate, || {
            let mut threads = global.gc_threads.lock().unwrap();
            for thread in threads.aux.drain(..) {
                thread.join().expect("auxiliary GC thread panicked");
            }
        });
    spawn_aux_threads(global, aux_gc_threads);
}
