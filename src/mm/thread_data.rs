//! Per-mutator GC state.
//!
//! Every registered mutator owns one [`MutatorThread`]: its scheduling state,
//! the three per-epoch mark flags, its allocation buffer and its shadow
//! stack of roots. The flags follow the root-scan protocol: whoever wins the
//! `root_set_locked` CAS (the mutator itself in its safepoint, or a GC
//! worker) is the unique scanner of this thread's roots for the epoch.

use atomic::Atomic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::heap::{Allocator, ObjRef};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    /// Executing managed code; must reach a safepoint to be paused.
    Runnable,
    /// Executing native code; implicitly at a safepoint.
    Native,
    /// Parked by the GC.
    Suspended,
}

pub struct MutatorThread<A: Allocator> {
    id: usize,
    state: Atomic<ThreadState>,
    /// Whoever CASes this from false claims scanning rights for this
    /// thread's root set in the current epoch.
    root_set_locked: AtomicBool,
    /// This mutator entered cooperative marking for the current epoch.
    cooperative: AtomicBool,
    /// This thread's allocation buffer has been flushed to the global set.
    published: AtomicBool,
    local: A::Local,
    roots: Mutex<Vec<ObjRef>>,
}

impl<A: Allocator> MutatorThread<A> {
    pub(crate) fn new(id: usize, local: A::Local) -> Self {
        Self {
            id,
            state: Atomic::new(ThreadState::Runnable),
            root_set_locked: AtomicBool::new(false),
            cooperative: AtomicBool::new(false),
            published: AtomicBool::new(false),
            local,
            roots: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn local(&self) -> &A::Local {
        &self.local
    }

    pub fn state(&self) -> ThreadState {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state, Ordering::Release);
    }

    /// Attempt to acquire exclusive scanning rights for this thread's roots.
    pub fn try_lock_root_set(&self) -> bool {
        let locked = self
            .root_set_locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if locked {
            trace!("root set of mutator #{} acquired", self.id);
        }
        locked
    }

    pub fn root_set_is_locked(&self) -> bool {
        self.root_set_locked.load(Ordering::Acquire)
    }

    pub(crate) fn begin_cooperation(&self) {
        self.cooperative.store(true, Ordering::Release);
    }

    pub fn is_cooperative(&self) -> bool {
        self.cooperative.load(Ordering::Acquire)
    }

    pub(crate) fn set_published(&self) {
        self.published.store(true, Ordering::Release);
    }

    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    /// Reset the per-epoch flags. Runs between epochs, before marking is
    /// re-armed; the release store on `root_set_locked` orders the other
    /// resets before any new scanner's acquire.
    pub(crate) fn clear_mark_flags(&self) {
        self.published.store(false, Ordering::Relaxed);
        self.cooperative.store(false, Ordering::Relaxed);
        self.root_set_locked.store(false, Ordering::Release);
    }

    /// This thread's shadow stack. Mutated by the owner in managed code;
    /// read by the unique root scanner while the owner is parked.
    pub fn roots(&self) -> MutexGuard<'_, Vec<ObjRef>> {
        self.roots.lock().unwrap()
    }

    pub fn push_root(&self, obj: ObjRef) {
        self.roots().push(obj);
    }

    pub fn pop_root(&self) -> Option<ObjRef> {
        self.roots().pop()
    }
}
