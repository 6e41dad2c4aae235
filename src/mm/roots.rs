//! Root storage.
//!
//! Per-thread roots (the "shadow stack") live on the mutator's thread data;
//! this module holds the process-wide roots: globals and statics the runtime
//! has pinned. Both are plain locked vectors. Root mutation happens on the
//! owning thread's fast path only in managed code, and scanning happens
//! while that thread is parked.

use std::sync::Mutex;

use crate::heap::ObjRef;

#[derive(Default)]
pub struct GlobalRoots {
    roots: Mutex<Vec<ObjRef>>,
}

impl GlobalRoots {
    pub fn add(&self, obj: ObjRef) {
        self.roots.lock().unwrap().push(obj);
    }

    pub fn remove(&self, obj: ObjRef) {
        let mut roots = self.roots.lock().unwrap();
        if let Some(pos) = roots.iter().position(|r| *r == obj) {
            roots.swap_remove(pos);
        }
    }

    pub fn snapshot(&self) -> Vec<ObjRef> {
        self.roots.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.roots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.lock().unwrap().is_empty()
    }
}
