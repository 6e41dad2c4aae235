//! Weak references and the barrier seam.
//!
//! Weak cells live outside the object graph in a registry; the marker never
//! traces through them. After mark, `process_weaks` nulls every cell whose
//! referent did not get marked, using the epoch's mark bit as the liveness
//! predicate. With the `concurrent_weak_sweep` feature the orchestrator runs
//! this step with mutators resumed, bracketed by externally provided read
//! barriers.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::gc::handle::{GCHandle, GCPhase};
use crate::heap::header::ObjHeader;
use crate::heap::ObjRef;
use crate::Epoch;

/// A weak cell: an atomic reference that the collector clears when the
/// referent dies. Dropping the last `Arc` to a cell retires it from the
/// registry at the next collection.
pub struct WeakRef {
    referent: AtomicPtr<ObjHeader>,
}

impl WeakRef {
    fn new(obj: ObjRef) -> Self {
        Self {
            referent: AtomicPtr::new(obj.as_ptr()),
        }
    }

    /// Load the referent, if it is still alive. A plain atomic load: during
    /// a concurrent weak sweep the external barrier intercepts reads before
    /// they reach this cell.
    pub fn try_ref(&self) -> Option<ObjRef> {
        unsafe { ObjRef::from_raw(self.referent.load(Ordering::Relaxed)) }
    }

    fn clear(&self) {
        self.referent.store(std::ptr::null_mut(), Ordering::Release);
    }
}

#[derive(Default)]
pub struct SpecialRefRegistry {
    cells: Mutex<Vec<Weak<WeakRef>>>,
}

impl SpecialRefRegistry {
    pub fn create_weak_ref(&self, obj: ObjRef) -> Arc<WeakRef> {
        let cell = Arc::new(WeakRef::new(obj));
        self.cells.lock().unwrap().push(Arc::downgrade(&cell));
        cell
    }

    /// Null every cell whose referent is unmarked, and drop retired cells.
    /// Runs after mark, before the mark bits are reset by sweep.
    pub(crate) fn process_weaks(&self, handle: &GCHandle) {
        handle.phase_started(GCPhase::ProcessWeaks);
        let mut cells = self.cells.lock().unwrap();
        let mut cleared = 0usize;
        cells.retain(|weak| match weak.upgrade() {
            Some(cell) => {
                if let Some(referent) = cell.try_ref() {
                    if !referent.is_marked() {
                        cell.clear();
                        cleared += 1;
                    }
                }
                true
            }
            None => false,
        });
        drop(cells);
        handle.phase_done(GCPhase::ProcessWeaks);
        if cleared > 0 {
            debug!("epoch #{}: {} weak refs cleared", handle.epoch(), cleared);
        }
    }

    pub fn cell_count(&self) -> usize {
        self.cells.lock().unwrap().len()
    }
}

/// External read-barrier toggles used by the concurrent weak sweep. The
/// barrier module belongs to the runtime; the collector only flips it.
pub trait WeakRefBarriers: Send + Sync {
    fn enable_weak_ref_barriers(&self, epoch: Epoch);
    fn disable_weak_ref_barriers(&self);
}

/// For runtimes without a barrier module (and for the STW weak sweep path).
pub struct NoBarriers;

impl WeakRefBarriers for NoBarriers {
    fn enable_weak_ref_barriers(&self, _epoch: Epoch) {}
    fn disable_weak_ref_barriers(&self) {}
}
