//! The built-in segmented-list allocator.
//!
//! Mutators allocate into thread-local queues and publish them into the
//! global lists at safepoints and during the pause. `prepare_for_gc` pins
//! the published lists as the epoch's sweep set; allocation continues into
//! fresh lists while the sweep walks the pinned ones, which is what lets the
//! sweep run concurrently with resumed mutators.

use std::sync::{Arc, Mutex};

use crate::gc::handle::GCHandle;
use crate::heap::allocator::{Allocator, AllocatorLocal, FinalizerQueue, HeapAccounting};
use crate::heap::extra_object::ExtraObjectData;
use crate::heap::header::{ObjRef, TypeInfo};
use crate::heap::ExtraRef;
use crate::mm::thread_registry::ThreadRegistry;

pub struct ObjectFactory {
    /// Published objects that are not part of an in-flight sweep.
    objects: Mutex<Vec<ObjRef>>,
    extras: Mutex<Vec<ExtraRef>>,
    /// The pinned sweep sets of the current epoch. Empty between epochs.
    sweep_objects: Mutex<Vec<ObjRef>>,
    sweep_extras: Mutex<Vec<ExtraRef>>,
    accounting: Arc<HeapAccounting>,
}

impl Default for ObjectFactory {
    fn default() -> Self {
        Self {
            objects: Mutex::new(Vec::new()),
            extras: Mutex::new(Vec::new()),
            sweep_objects: Mutex::new(Vec::new()),
            sweep_extras: Mutex::new(Vec::new()),
            accounting: Arc::new(HeapAccounting::default()),
        }
    }
}

impl ObjectFactory {
    pub(crate) fn accounting(&self) -> &Arc<HeapAccounting> {
        &self.accounting
    }

    /// Number of objects currently in the published global set. Test aid.
    pub fn published_object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    fn sweep_extra_objects(&self) {
        let pinned = std::mem::take(&mut *self.sweep_extras.lock().unwrap());
        let mut kept = Vec::with_capacity(pinned.len());
        for extra in pinned {
            if extra.get().is_marked_by_base() {
                kept.push(extra);
            } else {
                // The base object is about to be reclaimed (or handed to the
                // finalizer queue); detach so it cannot be freed twice.
                if let Some(base) = extra.get().base_object() {
                    base.clear_extra_data();
                }
                unsafe { extra.dealloc() };
            }
        }
        self.extras.lock().unwrap().append(&mut kept);
    }
}

impl Allocator for ObjectFactory {
    type Local = FactoryThreadQueue;

    fn new_local(&self) -> FactoryThreadQueue {
        FactoryThreadQueue::default()
    }

    fn prepare_for_gc(&self, registry: &ThreadRegistry<Self>) {
        // Pin first, publish after: whatever a mutator allocated since its
        // root set was scanned (e.g. during a concurrent weak sweep) lands
        // in the fresh lists and is excluded from this epoch's sweep.
        {
            let mut pinned = self.sweep_objects.lock().unwrap();
            debug_assert!(pinned.is_empty(), "sweep of the previous epoch still pinned");
            *pinned = std::mem::take(&mut *self.objects.lock().unwrap());
            let mut pinned_extras = self.sweep_extras.lock().unwrap();
            debug_assert!(pinned_extras.is_empty());
            *pinned_extras = std::mem::take(&mut *self.extras.lock().unwrap());
        }
        for thread in registry.threads_snapshot() {
            thread.local().publish(self);
        }
    }

    fn sweep(&self, handle: &GCHandle) -> FinalizerQueue {
        self.sweep_extra_objects();

        let pinned = std::mem::take(&mut *self.sweep_objects.lock().unwrap());
        let mut queue = FinalizerQueue::new(self.accounting.clone());
        let mut survivors = Vec::with_capacity(pinned.len());
        let mut swept = 0usize;
        for obj in pinned {
            if obj.try_reset_mark() {
                survivors.push(obj);
            } else if obj.has_finalizer() {
                swept += 1;
                queue.push(obj);
            } else {
                swept += 1;
                self.accounting.sub(obj.heap_size());
                unsafe { obj.dealloc() };
            }
        }
        handle.objects_swept(swept, survivors.len());
        self.objects.lock().unwrap().append(&mut survivors);
        queue
    }

    fn allocated_bytes(&self) -> usize {
        self.accounting.get()
    }
}

/// A mutator's thread-local allocation buffer: everything allocated since
/// the last publication.
#[derive(Default)]
pub struct FactoryThreadQueue {
    objects: Mutex<Vec<ObjRef>>,
    extras: Mutex<Vec<ExtraRef>>,
}

impl AllocatorLocal<ObjectFactory> for FactoryThreadQueue {
    fn create_object(&self, alloc: &ObjectFactory, type_info: &'static TypeInfo) -> ObjRef {
        let obj = ObjRef::alloc_object(type_info);
        alloc.accounting.add(obj.heap_size());
        self.objects.lock().unwrap().push(obj);
        obj
    }

    fn create_array(&self, alloc: &ObjectFactory, type_info: &'static TypeInfo, len: u32) -> ObjRef {
        let arr = ObjRef::alloc_array(type_info, len);
        alloc.accounting.add(arr.heap_size());
        self.objects.lock().unwrap().push(arr);
        arr
    }

    fn create_extra_object_data(
        &self,
        _alloc: &ObjectFactory,
        obj: ObjRef,
        type_info: &'static TypeInfo,
    ) -> ExtraRef {
        let extra = ExtraRef(Box::into_raw(Box::new(ExtraObjectData::new(obj, type_info))));
        obj.set_extra_data(extra.0);
        self.extras.lock().unwrap().push(extra);
        extra
    }

    fn publish(&self, alloc: &ObjectFactory) {
        let mut local = self.objects.lock().unwrap();
        if !local.is_empty() {
            alloc.objects.lock().unwrap().append(&mut local);
        }
        drop(local);
        let mut local_extras = self.extras.lock().unwrap();
        if !local_extras.is_empty() {
            alloc.extras.lock().unwrap().append(&mut local_extras);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::handle::GCStats;

    fn leaf() -> &'static TypeInfo {
        TypeInfo::object("Leaf", 16, &[]).leak()
    }

    fn test_handle() -> GCHandle {
        GCHandle::create(&Arc::new(GCStats::default()), 1)
    }

    #[test]
    fn publish_moves_objects_to_global_set() {
        let factory = ObjectFactory::default();
        let local = factory.new_local();
        let obj = local.create_object(&factory, leaf());
        assert_eq!(factory.published_object_count(), 0);
        local.publish(&factory);
        assert_eq!(factory.published_object_count(), 1);
        assert!(factory.allocated_bytes() >= obj.heap_size());
    }

    #[test]
    fn sweep_reclaims_unmarked_and_unmarks_survivors() {
        let factory = ObjectFactory::default();
        let local = factory.new_local();
        let live = local.create_object(&factory, leaf());
        for _ in 0..10 {
            local.create_object(&factory, leaf());
        }
        local.publish(&factory);

        let mut pinned = factory.sweep_objects.lock().unwrap();
        *pinned = std::mem::take(&mut *factory.objects.lock().unwrap());
        drop(pinned);

        assert!(live.try_mark());
        let queue = factory.sweep(&test_handle());
        assert!(queue.is_empty());
        assert_eq!(factory.published_object_count(), 1);
        assert!(!live.is_marked());
        assert_eq!(factory.allocated_bytes(), live.heap_size());
    }

    #[test]
    fn objects_allocated_after_pinning_are_not_swept() {
        let factory = ObjectFactory::default();
        let local = factory.new_local();
        local.create_object(&factory, leaf());
        local.publish(&factory);

        let mut pinned = factory.sweep_objects.lock().unwrap();
        *pinned = std::mem::take(&mut *factory.objects.lock().unwrap());
        drop(pinned);

        // Born after the pin: must survive this sweep without being marked.
        let newborn = local.create_object(&factory, leaf());
        local.publish(&factory);

        factory.sweep(&test_handle());
        assert!(!newborn.is_marked());
        assert_eq!(factory.published_object_count(), 1);
    }

    #[test]
    fn dead_base_discards_extra_data() {
        let factory = ObjectFactory::default();
        let local = factory.new_local();
        let extra_type = TypeInfo::object("Assoc", 0, &[]).leak();
        let live = local.create_object(&factory, leaf());
        let dead = local.create_object(&factory, leaf());
        local.create_extra_object_data(&factory, live, extra_type);
        local.create_extra_object_data(&factory, dead, extra_type);
        local.publish(&factory);

        let mut pinned = factory.sweep_objects.lock().unwrap();
        *pinned = std::mem::take(&mut *factory.objects.lock().unwrap());
        drop(pinned);
        let mut pinned_extras = factory.sweep_extras.lock().unwrap();
        *pinned_extras = std::mem::take(&mut *factory.extras.lock().unwrap());
        drop(pinned_extras);

        assert!(live.try_mark());
        factory.sweep(&test_handle());
        assert_eq!(factory.extras.lock().unwrap().len(), 1);
        assert!(!live.extra_data().is_null());
    }
}
