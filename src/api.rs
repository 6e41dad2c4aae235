//! The runtime-facing API.
//!
//! Thin free functions over [`PMCS`] and [`MutatorHandle`], mirroring the
//! entry points a language runtime calls from its own memory-manager glue.
//! Keeping them in one flat module makes the collector's external surface
//! easy to audit; all of them delegate to the owning types.

use std::sync::Arc;

use crate::gc::weak::WeakRef;
use crate::heap::{Allocator, ExtraRef, ObjRef, TypeInfo};
use crate::pmcs::{MutatorHandle, PMCS};
use crate::Epoch;

/// Request a collection; returns the epoch that will (or already will)
/// service the request. Non-blocking.
pub fn schedule<A: Allocator>(pmcs: &PMCS<A>) -> Epoch {
    pmcs.schedule()
}

/// Block until `epoch` has finished sweeping, or the collector shut down.
pub fn wait_finished<A: Allocator>(pmcs: &PMCS<A>, epoch: Epoch) {
    pmcs.wait_finished(epoch)
}

/// Block until `epoch`'s finalizers have completed, or shutdown.
pub fn wait_finalizers<A: Allocator>(pmcs: &PMCS<A>, epoch: Epoch) {
    pmcs.wait_finalizers(epoch)
}

/// Register the calling thread as a mutator.
pub fn on_thread_registration<A: Allocator>(pmcs: &PMCS<A>) -> MutatorHandle<A> {
    pmcs.register_current_thread()
}

/// Allocate a new object. Born unmarked, in the mutator's local buffer.
pub fn create_object<A: Allocator>(
    mutator: &MutatorHandle<A>,
    type_info: &'static TypeInfo,
) -> ObjRef {
    mutator.create_object(type_info)
}

/// Allocate a new reference array of `len` null elements.
pub fn create_array<A: Allocator>(
    mutator: &MutatorHandle<A>,
    type_info: &'static TypeInfo,
    len: u32,
) -> ObjRef {
    mutator.create_array(type_info, len)
}

/// Attach extra data (finalization/weak bookkeeping) to an object.
pub fn create_extra_object_data<A: Allocator>(
    mutator: &MutatorHandle<A>,
    obj: ObjRef,
    type_info: &'static TypeInfo,
) -> ExtraRef {
    mutator.create_extra_object_data(obj, type_info)
}

/// The mutator safepoint: cheap check, parks when a pause is pending.
#[inline]
pub fn safe_point<A: Allocator>(mutator: &MutatorHandle<A>) {
    mutator.safe_point()
}

/// Whether `obj` was reached by the current (or latest) mark phase.
pub fn is_marked(obj: ObjRef) -> bool {
    obj.is_marked()
}

/// Atomically load a weak cell's referent; `None` once cleared.
pub fn try_ref(cell: &Arc<WeakRef>) -> Option<ObjRef> {
    cell.try_ref()
}

pub fn start_finalizer_thread_if_needed<A: Allocator>(pmcs: &PMCS<A>) {
    pmcs.start_finalizer_thread_if_needed()
}

pub fn stop_finalizer_thread_if_running<A: Allocator>(pmcs: &PMCS<A>) {
    pmcs.stop_finalizer_thread_if_running()
}

pub fn finalizers_thread_is_running<A: Allocator>(pmcs: &PMCS<A>) -> bool {
    pmcs.finalizers_thread_is_running()
}
