//! The capability trait between the collector and the object allocator.
//!
//! `PMCS<A>` is generic over its allocator, so the sweep path is fixed at
//! compile time by the type parameter: the built-in
//! [`ObjectFactory`](crate::heap::ObjectFactory) sweeps by iterating its
//! pinned segment lists, while a runtime with its own heap implements
//! [`Allocator::sweep`] natively. There is no runtime dispatch in the sweep
//! loop.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::gc::handle::GCHandle;
use crate::heap::header::{ObjRef, TypeInfo};
use crate::heap::ExtraRef;
use crate::mm::thread_registry::ThreadRegistry;

/// Live-byte accounting shared between an allocator and the finalizer
/// pipeline (which releases finalizable objects long after the sweep).
#[derive(Default)]
pub struct HeapAccounting {
    allocated: AtomicUsize,
}

impl HeapAccounting {
    pub fn add(&self, bytes: usize) {
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn get(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

/// Objects found dead with a pending finalizer during one epoch's sweep.
/// The queue owns the objects: after each finalizer returns the object's
/// storage is released and the accounting adjusted.
pub struct FinalizerQueue {
    objects: Vec<ObjRef>,
    accounting: Arc<HeapAccounting>,
}

impl FinalizerQueue {
    pub fn new(accounting: Arc<HeapAccounting>) -> Self {
        Self {
            objects: Vec::new(),
            accounting,
        }
    }

    pub fn push(&mut self, obj: ObjRef) {
        debug_assert!(obj.has_finalizer());
        self.objects.push(obj);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Move every entry of `other` into this queue. Used by custom
    /// allocators that gather per-thread queues into one batch.
    pub fn transfer_all_from(&mut self, mut other: FinalizerQueue) {
        self.objects.append(&mut other.objects);
    }

    /// Run every finalizer and release the objects. A panicking finalizer is
    /// caught and logged; the remaining tasks still run.
    pub(crate) fn process_all(self) {
        for obj in self.objects {
            if let Some(finalizer) = obj.type_info().finalizer.clone() {
                let result = panic::catch_unwind(AssertUnwindSafe(|| finalizer(obj)));
                if let Err(e) = result {
                    error!("finalizer for {:?} panicked: {:?}", obj, e);
                }
            }
            self.accounting.sub(obj.heap_size());
            unsafe { obj.dealloc() };
        }
    }
}

impl Default for FinalizerQueue {
    fn default() -> Self {
        Self::new(Arc::new(HeapAccounting::default()))
    }
}

/// Integration point for the heap that produces the collector's objects.
pub trait Allocator: Sized + Send + Sync + 'static {
    /// Per-mutator allocation buffer. Lives on the mutator's thread data;
    /// flushed ("published") into the allocator's global set so the sweeper
    /// can see the objects.
    type Local: AllocatorLocal<Self>;

    fn new_local(&self) -> Self::Local;

    /// Called inside the pause, before mutators are resumed. Must pin the
    /// set of objects this epoch will sweep and publish every registered
    /// mutator's local buffer. Objects allocated after their owner's root
    /// set was scanned are born unmarked and must be excluded from the
    /// pinned set; they are candidates for the next epoch.
    fn prepare_for_gc(&self, registry: &ThreadRegistry<Self>);

    /// Reclaim every unmarked object in the pinned set, clearing the mark
    /// bit of survivors. Runs concurrently with resumed mutators. Returns
    /// the objects whose finalizers still have to run.
    fn sweep(&self, handle: &GCHandle) -> FinalizerQueue;

    /// Bytes currently allocated, reported to the GC scheduler after sweep.
    fn allocated_bytes(&self) -> usize;
}

/// Operations on a per-mutator allocation buffer. The allocator itself is
/// passed in explicitly so buffers stay plain data.
pub trait AllocatorLocal<A: Allocator>: Send + Sync {
    fn create_object(&self, alloc: &A, type_info: &'static TypeInfo) -> ObjRef;

    fn create_array(&self, alloc: &A, type_info: &'static TypeInfo, len: u32) -> ObjRef;

    fn create_extra_object_data(
        &self,
        alloc: &A,
        obj: ObjRef,
        type_info: &'static TypeInfo,
    ) -> ExtraRef;

    /// Flush this buffer into the allocator's global set. Called by the
    /// owning mutator at its safepoint, or by a GC thread during the pause.
    fn publish(&self, alloc: &A);
}
