//! Side-table entries attached to some objects.
//!
//! An [`ExtraObjectData`] carries state that does not fit in the two-word
//! header: the back pointer to its base object and the association installed
//! by the runtime (weak counters, interop handles). Entries live in their own
//! factory lists and are swept independently of the base objects: when the
//! base is found dead, the entry is discarded.

use std::sync::atomic::{AtomicPtr, Ordering};

use crate::heap::header::{ObjHeader, ObjRef, TypeInfo};

pub struct ExtraObjectData {
    base_object: AtomicPtr<ObjHeader>,
    #[allow(dead_code)]
    type_info: &'static TypeInfo,
}

impl ExtraObjectData {
    pub(crate) fn new(base: ObjRef, type_info: &'static TypeInfo) -> Self {
        Self {
            base_object: AtomicPtr::new(base.as_ptr()),
            type_info,
        }
    }

    pub fn base_object(&self) -> Option<ObjRef> {
        unsafe { ObjRef::from_raw(self.base_object.load(Ordering::Acquire)) }
    }

    /// Whether the base object survived the current epoch's mark phase.
    /// Detached entries (no base) are kept alive unconditionally.
    pub(crate) fn is_marked_by_base(&self) -> bool {
        match self.base_object() {
            Some(base) => base.is_marked(),
            None => true,
        }
    }
}

/// A pointer to an extra-data entry owned by the extra-object factory.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ExtraRef(pub(crate) *mut ExtraObjectData);

unsafe impl Send for ExtraRef {}
unsafe impl Sync for ExtraRef {}

impl ExtraRef {
    pub fn get(&self) -> &ExtraObjectData {
        unsafe { &*self.0 }
    }

    pub(crate) unsafe fn dealloc(self) {
        drop(Box::from_raw(self.0));
    }
}
