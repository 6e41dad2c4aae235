//! Enumeration of registered mutators.
//!
//! The collector never owns mutator threads; it only observes them through
//! this registry. Root scanners take an `Arc` snapshot so they can claim
//! root sets without holding the registry lock across the whole scan.
//! A thread cannot disappear under a scanner: deregistration runs on the
//! owning thread, which is parked (or blocked on this lock) during the
//! pause.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::heap::Allocator;
use crate::mm::thread_data::MutatorThread;

pub struct ThreadRegistry<A: Allocator> {
    threads: Mutex<Vec<Arc<MutatorThread<A>>>>,
    next_id: AtomicUsize,
}

impl<A: Allocator> Default for ThreadRegistry<A> {
    fn default() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
        }
    }
}

impl<A: Allocator> ThreadRegistry<A> {
    pub(crate) fn next_thread_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn add(&self, thread: Arc<MutatorThread<A>>) {
        let mut threads = self.threads.lock().unwrap();
        debug_assert!(threads.iter().all(|t| t.id() != thread.id()));
        threads.push(thread);
    }

    pub(crate) fn remove(&self, id: usize) {
        let mut threads = self.threads.lock().unwrap();
        if let Some(pos) = threads.iter().position(|t| t.id() == id) {
            threads.swap_remove(pos);
        }
    }

    /// An owning snapshot of the currently registered mutators.
    pub fn threads_snapshot(&self) -> Vec<Arc<MutatorThread<A>>> {
        self.threads.lock().unwrap().clone()
    }

    pub fn registered_count(&self) -> usize {
        self.threads.lock().unwrap().len()
    }
}
