//! The parallel mark dispatcher.
//!
//! Coordinates one mark phase per epoch across the main GC thread, the
//! auxiliary mark workers and (optionally) cooperating mutators:
//!
//! 1. `begin_marking_epoch` publishes "marking is active", resets the
//!    per-mutator flags and arms the auxiliary workers. With cooperative
//!    marking enabled it also arms safepoints, so mutators start parking
//!    (and scanning their own roots) before the suspension request lands.
//! 2. Each parked mutator's suspension hook calls `run_on_mutator`: the
//!    mutator tries to claim its own root set, scans it into the queue and
//!    publishes its allocation buffer, then (cooperatively) joins heap
//!    traversal.
//! 3. Once the world is stopped, the main GC thread scans global roots,
//!    claims every root set the mutators did not, and traverses alongside
//!    the auxiliary workers until the queue is globally drained.
//!
//! Exactly one agent scans each mutator's roots per epoch, enforced by the
//! `root_set_locked` CAS on the thread data.

pub(crate) mod queue;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crate::gc::handle::{GCHandle, GCPhase};
use crate::heap::{Allocator, AllocatorLocal, ObjHeader, ObjRef};
use crate::mm::thread_data::MutatorThread;
use crate::pmcs::GlobalData;
use crate::Epoch;
use queue::{MarkQueue, MarkerContext};

#[derive(Debug)]
struct ArmState {
    /// The epoch auxiliary workers should mark for. Workers remember the
    /// last epoch they served so they arm exactly once per epoch.
    armed_epoch: Epoch,
    shutdown: bool,
}

pub struct MarkDispatcher {
    queue: MarkQueue,
    sync: Mutex<ArmState>,
    work_available: Condvar,
    max_parallelism: AtomicUsize,
    mutators_cooperate: AtomicBool,
    /// Marking is active for `epoch`: suspension hooks may claim and scan.
    marking: AtomicBool,
    epoch: AtomicI64,
    /// Root sets claimed but not yet fully scanned.
    pending_root_scans: AtomicUsize,
    /// The main GC thread has verified every registered root set is claimed.
    all_root_sets_claimed: AtomicBool,
    /// Root sets scanned this epoch (mutators + GC). Exposed for tests.
    scanned_root_sets: AtomicUsize,
    /// The current epoch's handle, for hooks running on mutator threads.
    handle: Mutex<Option<GCHandle>>,
}

impl MarkDispatcher {
    pub(crate) fn new(max_parallelism: usize, mutators_cooperate: bool) -> Self {
        Self {
            queue: MarkQueue::default(),
            sync: Mutex::new(ArmState {
                armed_epoch: 0,
                shutdown: false,
            }),
            work_available: Condvar::new(),
            max_parallelism: AtomicUsize::new(max_parallelism),
            mutators_cooperate: AtomicBool::new(mutators_cooperate),
            marking: AtomicBool::new(false),
            epoch: AtomicI64::new(0),
            pending_root_scans: AtomicUsize::new(0),
            all_root_sets_claimed: AtomicBool::new(false),
            scanned_root_sets: AtomicUsize::new(0),
            handle: Mutex::new(None),
        }
    }

    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism.load(Ordering::Relaxed)
    }

    /// Marker slots available to auxiliary workers and cooperating
    /// mutators: one slot is reserved for the main GC thread.
    fn helper_slots(&self) -> usize {
        self.max_parallelism().saturating_sub(1)
    }

    pub fn mutators_cooperate(&self) -> bool {
        !cfg!(feature = "single_threaded_mark") && self.mutators_cooperate.load(Ordering::Relaxed)
    }

    /// Root sets scanned in the most recent epoch.
    pub fn scanned_root_sets(&self) -> usize {
        self.scanned_root_sets.load(Ordering::SeqCst)
    }

    /// Publish "marking is active for `epoch`" and arm the workers.
    pub(crate) fn begin_marking_epoch<A: Allocator>(
        &self,
        global: &GlobalData<A>,
        handle: &GCHandle,
    ) {
        let epoch = handle.epoch();
        assert!(
            !self.marking.load(Ordering::SeqCst),
            "marking epoch #{} begun while the previous one is active",
            epoch
        );
        for thread in global.registry.threads_snapshot() {
            thread.clear_mark_flags();
        }
        self.queue.reset_for_epoch();
        self.pending_root_scans.store(0, Ordering::SeqCst);
        self.all_root_sets_claimed.store(false, Ordering::SeqCst);
        self.scanned_root_sets.store(0, Ordering::SeqCst);
        *self.handle.lock().unwrap() = Some(handle.clone());
        self.epoch.store(epoch, Ordering::SeqCst);
        self.marking.store(true, Ordering::SeqCst);

        let mut armed = self.sync.lock().unwrap();
        armed.armed_epoch = epoch;
        self.work_available.notify_all();
        drop(armed);

        if self.mutators_cooperate() {
            global.suspension.arm_cooperative_mark();
        }
        debug!("epoch #{}: marking armed", epoch);
    }

    /// The main GC thread's share of the STW phase: global roots, leftover
    /// root sets, then traversal until global termination.
    pub(crate) fn run_main_in_stw<A: Allocator>(&self, global: &GlobalData<A>, handle: &GCHandle) {
        handle.phase_started(GCPhase::Mark);

        for obj in global.global_roots.snapshot() {
            if obj.try_mark() {
                self.queue.push_global(obj);
            }
        }

        // Complete the root sets no mutator claimed: threads that were
        // executing native code, threads still in their suspension hook, and
        // threads registered into the pause (whose root sets are empty).
        for thread in global.registry.threads_snapshot() {
            self.claim_and_scan_thread(global, &thread, false);
        }
        self.all_root_sets_claimed.store(true, Ordering::SeqCst);
        self.maybe_finish_root_scan();

        let mut ctx = self
            .queue
            .try_register(usize::MAX)
            .expect("unbounded registration cannot fail");
        self.queue.participate(&mut ctx, Self::process_object_in_mark);
        handle.objects_traced(ctx.traced);
        handle.phase_done(GCPhase::Mark);
    }

    /// Body of one auxiliary worker's cycle: wait to be armed, mark, return.
    pub(crate) fn run_auxiliary(&self, last_epoch: &mut Epoch) {
        assert!(
            !cfg!(feature = "single_threaded_mark"),
            "auxiliary mark worker running under single-threaded mark"
        );
        {
            let mut armed = self.sync.lock().unwrap();
            loop {
                if armed.shutdown {
                    return;
                }
                if armed.armed_epoch > *last_epoch {
                    *last_epoch = armed.armed_epoch;
                    break;
                }
                armed = self.work_available.wait(armed).unwrap();
            }
        }
        // A worker spawned by `reset` can observe the arm of an epoch whose
        // mark phase is already over; it must not join a finished queue.
        if !self.marking.load(Ordering::SeqCst) || self.epoch.load(Ordering::SeqCst) != *last_epoch
        {
            return;
        }

        let ctx = self.queue.try_register(self.helper_slots());
        if let Some(mut ctx) = ctx {
            self.queue.participate(&mut ctx, Self::process_object_in_mark);
            self.flush_traced(ctx.traced);
        }
    }

    /// Suspension hook: runs on a mutator as it parks.
    pub(crate) fn run_on_mutator<A: Allocator>(
        &self,
        global: &GlobalData<A>,
        thread: &MutatorThread<A>,
    ) {
        if !self.marking.load(Ordering::SeqCst) {
            return;
        }
        self.claim_and_scan_thread(global, thread, true);

        if self.mutators_cooperate() {
            thread.begin_cooperation();
            if let Some(mut ctx) = self.queue.try_register(self.helper_slots()) {
                trace!("mutator #{} joins heap traversal", thread.id());
                self.queue.participate(&mut ctx, Self::process_object_in_mark);
                self.flush_traced(ctx.traced);
            }
        }
    }

    /// Acknowledge end-of-mark: hooks become no-ops, cooperative safepoints
    /// disarm, the queue must be drained.
    pub(crate) fn end_marking_epoch<A: Allocator>(&self, global: &GlobalData<A>) {
        debug_assert!(self.queue.is_done() || self.queue.is_globally_empty());
        self.marking.store(false, Ordering::SeqCst);
        *self.handle.lock().unwrap() = None;
        if self.mutators_cooperate() {
            global.suspension.disarm_cooperative_mark();
        }
        debug!("epoch #{}: marking done", self.epoch.load(Ordering::SeqCst));
    }

    /// Claim `thread`'s root set if nobody else has, scan it into the queue
    /// and publish the thread's allocation buffer.
    fn claim_and_scan_thread<A: Allocator>(
        &self,
        global: &GlobalData<A>,
        thread: &MutatorThread<A>,
        by_mutator: bool,
    ) {
        self.pending_root_scans.fetch_add(1, Ordering::SeqCst);
        if thread.try_lock_root_set() {
            let mut scanned = 0usize;
            for &obj in thread.roots().iter() {
                if obj.try_mark() {
                    self.queue.push_global(obj);
                }
                scanned += 1;
            }
            thread.local().publish(&global.allocator);
            thread.set_published();
            self.scanned_root_sets.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = self.handle.lock().unwrap().clone() {
                handle.root_set_scanned(by_mutator);
            }
            trace!(
                "mutator #{}: {} roots scanned ({})",
                thread.id(),
                scanned,
                if by_mutator { "by itself" } else { "by GC" }
            );
        }
        self.pending_root_scans.fetch_sub(1, Ordering::SeqCst);
        self.maybe_finish_root_scan();
    }

    fn maybe_finish_root_scan(&self) {
        if self.all_root_sets_claimed.load(Ordering::SeqCst)
            && self.pending_root_scans.load(Ordering::SeqCst) == 0
        {
            self.queue.set_roots_done();
        }
    }

    fn flush_traced(&self, traced: usize) {
        if let Some(handle) = self.handle.lock().unwrap().clone() {
            handle.objects_traced(traced);
        }
    }

    /// Scan one grey object: mark and enqueue its unmarked children.
    fn process_object_in_mark(ctx: &MarkerContext<'_>, obj: ObjRef) {
        if obj.is_ref_array() {
            Self::process_array_in_mark(ctx, obj);
        } else {
            obj.each_ref_slot(|slot| {
                Self::process_field_in_mark(ctx, slot.load(Ordering::Acquire))
            });
        }
    }

    fn process_array_in_mark(ctx: &MarkerContext<'_>, array: ObjRef) {
        array.each_ref_slot(|slot| Self::process_field_in_mark(ctx, slot.load(Ordering::Acquire)));
    }

    fn process_field_in_mark(ctx: &MarkerContext<'_>, field: *mut ObjHeader) {
        if let Some(child) = unsafe { ObjRef::from_raw(field) } {
            if child.try_mark() {
                ctx.push(child);
            }
        }
    }

    /// Stop the auxiliary workers. Set on teardown and transiently during
    /// `reset`.
    pub(crate) fn request_shutdown(&self) {
        let mut armed = self.sync.lock().unwrap();
        armed.shutdown = true;
        self.work_available.notify_all();
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.sync.lock().unwrap().shutdown
    }

    /// Rebuild the marking configuration. Must run with no epoch in
    /// `Started` (the caller holds the GC mutex). `teardown` joins the old
    /// worker pool after the shutdown request, before the flag is rearmed.
    pub(crate) fn reset<F: FnOnce()>(
        &self,
        max_parallelism: usize,
        mutators_cooperate: bool,
        teardown: F,
    ) {
        assert!(
            !self.marking.load(Ordering::SeqCst),
            "mark dispatcher reset during an active epoch"
        );
        self.request_shutdown();
        teardown();
        let mut armed = self.sync.lock().unwrap();
        armed.shutdown = false;
        drop(armed);
        self.max_parallelism.store(max_parallelism, Ordering::SeqCst);
        self.mutators_cooperate
            .store(mutators_cooperate, Ordering::SeqCst);
        info!(
            "mark dispatcher reconfigured: max_parallelism={}, mutators_cooperate={}",
            max_parallelism, mutators_cooperate
        );
    }
}
