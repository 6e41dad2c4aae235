//! A PMCS collector instance and the per-thread mutator handle.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;

use crate::gc::collector;
use crate::gc::finalizer::FinalizerProcessor;
use crate::gc::handle::{GCHandle, GCStats};
use crate::gc::state::GCState;
use crate::gc::trigger::{GCTrigger, NullTrigger};
use crate::gc::weak::{NoBarriers, SpecialRefRegistry, WeakRef, WeakRefBarriers};
use crate::heap::{Allocator, AllocatorLocal, ExtraRef, ObjRef, TypeInfo};
use crate::mark::MarkDispatcher;
use crate::mm::roots::GlobalRoots;
use crate::mm::suspension::ThreadSuspension;
use crate::mm::thread_data::{MutatorThread, ThreadState};
use crate::mm::thread_registry::ThreadRegistry;
use crate::mm;
use crate::util::options::Options;
use crate::Epoch;

pub(crate) struct GCThreads {
    pub main: Option<JoinHandle<()>>,
    pub aux: Vec<JoinHandle<()>>,
}

/// Everything one collector instance owns. GC threads and mutator handles
/// share it through an `Arc`; mutators themselves are observed only through
/// the thread registry, so there is no ownership cycle.
pub struct GlobalData<A: Allocator> {
    pub(crate) options: Options,
    pub(crate) state: Arc<GCState>,
    pub(crate) stats: Arc<GCStats>,
    pub(crate) registry: ThreadRegistry<A>,
    pub(crate) suspension: ThreadSuspension,
    pub(crate) dispatcher: MarkDispatcher,
    pub(crate) allocator: A,
    pub(crate) global_roots: GlobalRoots,
    pub(crate) weak_refs: SpecialRefRegistry,
    pub(crate) finalizers: Arc<FinalizerProcessor>,
    pub(crate) trigger: Box<dyn GCTrigger>,
    #[cfg_attr(not(feature = "concurrent_weak_sweep"), allow(dead_code))]
    pub(crate) barriers: Box<dyn WeakRefBarriers>,
    /// Serializes `perform_full_gc` against `reconfigure`.
    pub(crate) gc_mutex: Mutex<()>,
    pub(crate) gc_threads: Mutex<GCThreads>,
}

/// Builder for a collector instance: options first, then `build`.
pub struct PMCSBuilder {
    pub options: Options,
    trigger: Box<dyn GCTrigger>,
    barriers: Box<dyn WeakRefBarriers>,
}

impl PMCSBuilder {
    /// Options from built-in defaults adjusted by `PMCS_*` env vars.
    pub fn new() -> Self {
        Self {
            options: Options::from_env(),
            trigger: Box::new(NullTrigger),
            barriers: Box::new(NoBarriers),
        }
    }

    pub fn set_option(&mut self, name: &str, value: &str) -> bool {
        self.options.set_from_str(name, value)
    }

    pub fn set_options_bulk(&mut self, options: &str) -> bool {
        self.options.set_bulk_from_str(options)
    }

    /// Install the runtime's GC scheduler callbacks.
    pub fn with_trigger(mut self, trigger: Box<dyn GCTrigger>) -> Self {
        self.trigger = trigger;
        self
    }

    /// Install the runtime's weak-reference barrier module.
    pub fn with_barriers(mut self, barriers: Box<dyn WeakRefBarriers>) -> Self {
        self.barriers = barriers;
        self
    }

    pub fn build<A: Allocator + Default>(self) -> PMCS<A> {
        self.build_with_allocator(A::default())
    }

    pub fn build_with_allocator<A: Allocator>(self, allocator: A) -> PMCS<A> {
        let aux_gc_threads = *self.options.threads;
        if cfg!(feature = "single_threaded_mark") {
            assert_eq!(
                aux_gc_threads, 0,
                "auxiliary GC threads must not be created with single-threaded mark"
            );
        }
        let state = Arc::new(GCState::default());
        let stats = Arc::new(GCStats::default());
        let finalizers = FinalizerProcessor::new({
            let state = state.clone();
            let stats = stats.clone();
            Box::new(move |epoch| {
                GCHandle::get_by_epoch(&stats, epoch).finalizers_done();
                state.finalized(epoch);
            })
        });
        let dispatcher =
            MarkDispatcher::new(*self.options.max_parallelism, *self.options.mutators_cooperate);
        let global = Arc::new(GlobalData {
            state,
            stats,
            registry: ThreadRegistry::default(),
            suspension: ThreadSuspension::default(),
            dispatcher,
            allocator,
            global_roots: GlobalRoots::default(),
            weak_refs: SpecialRefRegistry::default(),
            finalizers,
            trigger: self.trigger,
            barriers: self.barriers,
            gc_mutex: Mutex::new(()),
            gc_threads: Mutex::new(GCThreads {
                main: None,
                aux: Vec::new(),
            }),
            options: self.options,
        });
        collector::spawn_gc_threads(&global, aux_gc_threads);
        info!(
            "parallel mark & concurrent sweep initialized: {} aux threads, max parallelism {}, cooperative {}",
            aux_gc_threads,
            global.dispatcher.max_parallelism(),
            global.dispatcher.mutators_cooperate(),
        );
        PMCS { global }
    }
}

impl Default for PMCSBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A collector instance. Dropping it shuts the collector down: the current
/// epoch (if any) completes, all waiters unblock, and every GC thread,
/// finalizer thread included, is joined.
pub struct PMCS<A: Allocator> {
    global: Arc<GlobalData<A>>,
}

impl<A: Allocator> PMCS<A> {
    pub fn builder() -> PMCSBuilder {
        PMCSBuilder::new()
    }

    pub fn options(&self) -> &Options {
        &self.global.options
    }

    pub fn allocator(&self) -> &A {
        &self.global.allocator
    }

    pub fn mark_dispatcher(&self) -> &MarkDispatcher {
        &self.global.dispatcher
    }

    /// Request a collection; returns its epoch. Collapses with an already
    /// pending request. Never blocks.
    pub fn schedule(&self) -> Epoch {
        self.global.state.schedule()
    }

    /// Block until `epoch` has finished sweeping (or the collector shut
    /// down). Must not be called from a registered mutator in the runnable
    /// state; mutators use [`MutatorHandle::wait_finished`].
    pub fn wait_finished(&self, epoch: Epoch) {
        debug_assert!(!mm::current_thread_is_registered());
        self.global.state.wait_epoch_finished(epoch);
    }

    /// Block until `epoch`'s finalizers have all run (or shutdown).
    pub fn wait_finalizers(&self, epoch: Epoch) {
        debug_assert!(!mm::current_thread_is_registered());
        self.global.state.wait_epoch_finalized(epoch);
    }

    /// Register the calling OS thread as a mutator. The handle is
    /// thread-affine; dropping it deregisters the thread.
    pub fn register_current_thread(&self) -> MutatorHandle<A> {
        assert!(
            !mm::current_thread_is_registered(),
            "thread is already registered as a mutator"
        );
        let id = self.global.registry.next_thread_id();
        let thread = Arc::new(MutatorThread::new(id, self.global.allocator.new_local()));
        self.global.registry.add(thread.clone());
        self.global.suspension.attach_running();
        mm::set_current_thread_registered(true);
        debug!("mutator #{} registered", id);
        let handle = MutatorHandle {
            global: self.global.clone(),
            thread,
            _not_send: PhantomData,
        };
        // If a pause is already in progress, fall in line immediately.
        handle.safe_point();
        handle
    }

    pub fn add_global_root(&self, obj: ObjRef) {
        self.global.global_roots.add(obj);
    }

    pub fn remove_global_root(&self, obj: ObjRef) {
        self.global.global_roots.remove(obj);
    }

    pub fn create_weak_ref(&self, obj: ObjRef) -> Arc<WeakRef> {
        self.global.weak_refs.create_weak_ref(obj)
    }

    pub fn start_finalizer_thread_if_needed(&self) {
        debug_assert!(!mm::current_thread_is_registered());
        self.global.finalizers.start_finalizer_thread_if_none();
    }

    pub fn stop_finalizer_thread_if_running(&self) {
        debug_assert!(!mm::current_thread_is_registered());
        self.global.finalizers.stop_finalizer_thread();
    }

    pub fn finalizers_thread_is_running(&self) -> bool {
        self.global.finalizers.is_running()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.global.allocator.allocated_bytes()
    }

    /// Rebuild the mark worker pool. Must not overlap a collection (the GC
    /// mutex serializes this against `perform_full_gc`).
    pub fn reconfigure(&self, max_parallelism: usize, mutators_cooperate: bool, aux_gc_threads: usize) {
        assert!(max_parallelism > 0);
        collector::reconfigure(
            &self.global,
            max_parallelism,
            mutators_cooperate,
            aux_gc_threads,
        );
    }
}

impl<A: Allocator> Drop for PMCS<A> {
    fn drop(&mut self) {
        debug!("collector shutting down");
        self.global.state.shutdown();
        let (main, aux) = {
            let mut threads = self.global.gc_threads.lock().unwrap();
            (threads.main.take(), std::mem::take(&mut threads.aux))
        };
        if let Some(main) = main {
            main.join().expect("main GC thread panicked");
        }
        for thread in aux {
            thread.join().expect("auxiliary GC thread panicked");
        }
        self.global.finalizers.stop_finalizer_thread();
    }
}

/// The calling thread's mutator identity: allocation entry points, the
/// safepoint, and native-state transitions. Thread-affine by construction.
pub struct MutatorHandle<A: Allocator> {
    global: Arc<GlobalData<A>>,
    thread: Arc<MutatorThread<A>>,
    _not_send: PhantomData<*mut ()>,
}

impl<A: Allocator> MutatorHandle<A> {
    pub fn thread(&self) -> &MutatorThread<A> {
        &self.thread
    }

    /// The safepoint. Cheap fast path; parks the thread when a pause (or
    /// cooperative marking) is pending.
    #[inline]
    pub fn safe_point(&self) {
        if !self.global.suspension.is_action_pending() {
            return;
        }
        self.park();
    }

    #[cold]
    fn park(&self) {
        trace!("mutator #{} parking", self.thread.id());
        self.thread.set_state(ThreadState::Suspended);
        self.global
            .suspension
            .park(|| self.on_suspend_for_gc());
        self.thread.set_state(ThreadState::Runnable);
    }

    /// Invoked once while parking, before the wait: hands the thread to the
    /// mark dispatcher for root-set scanning and cooperative marking.
    fn on_suspend_for_gc(&self) {
        self.global
            .dispatcher
            .run_on_mutator(self.global.as_ref(), &self.thread);
    }

    /// Run `f` with the thread in the native state: the GC treats it as
    /// implicitly suspended, so `f` may block. On return the thread parks
    /// if a pause is still in progress.
    pub fn with_native_state<R>(&self, f: impl FnOnce() -> R) -> R {
        self.thread.set_state(ThreadState::Native);
        self.global.suspension.detach_running();
        let result = f();
        self.global.suspension.attach_running();
        self.thread.set_state(ThreadState::Runnable);
        self.safe_point();
        result
    }

    pub fn create_object(&self, type_info: &'static TypeInfo) -> ObjRef {
        self.thread
            .local()
            .create_object(&self.global.allocator, type_info)
    }

    pub fn create_array(&self, type_info: &'static TypeInfo, len: u32) -> ObjRef {
        self.thread
            .local()
            .create_array(&self.global.allocator, type_info, len)
    }

    pub fn create_extra_object_data(
        &self,
        obj: ObjRef,
        type_info: &'static TypeInfo,
    ) -> ExtraRef {
        self.thread
            .local()
            .create_extra_object_data(&self.global.allocator, obj, type_info)
    }

    /// Flush this thread's allocation buffer to the global set.
    pub fn publish_object_factory(&self) {
        self.thread.local().publish(&self.global.allocator);
        self.thread.set_published();
    }

    pub fn push_root(&self, obj: ObjRef) {
        self.thread.push_root(obj);
    }

    pub fn pop_root(&self) -> Option<ObjRef> {
        self.thread.pop_root()
    }

    /// Request a collection; returns its epoch.
    pub fn schedule(&self) -> Epoch {
        self.global.state.schedule()
    }

    /// Block until `epoch` finishes, with the thread in the native state so
    /// the collection can actually run.
    pub fn wait_finished(&self, epoch: Epoch) {
        self.with_native_state(|| self.global.state.wait_epoch_finished(epoch));
    }

    pub fn wait_finalizers(&self, epoch: Epoch) {
        self.with_native_state(|| self.global.state.wait_epoch_finalized(epoch));
    }

    /// Allocation failed: synchronously collect and block until finished.
    /// If the allocation still fails afterwards, surfacing that is the
    /// allocator's job, not the collector's.
    pub fn on_oom(&self, size: usize) {
        debug!(
            "mutator #{}: attempting GC on OOM at size={}",
            self.thread.id(),
            size
        );
        let epoch = self.schedule();
        self.wait_finished(epoch);
    }
}

impl<A: Allocator> Drop for MutatorHandle<A> {
    fn drop(&mut self) {
        // De-registration publishes all of the thread's state first; any
        // roots it still held are gone with it.
        self.thread.local().publish(&self.global.allocator);
        self.global.registry.remove(self.thread.id());
        if self.thread.state() == ThreadState::Runnable {
            self.global.suspension.detach_running();
        }
        mm::set_current_thread_registered(false);
        debug!("mutator #{} deregistered", self.thread.id());
    }
}
