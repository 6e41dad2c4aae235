//! The work-stealing mark queue.
//!
//! Discovered-but-unscanned objects sit in a global injector plus one local
//! deque per marker; markers steal from each other when their own work runs
//! dry. Termination uses the classic active-counter protocol: a marker only
//! pushes work while it is counted active, so once every marker is idle and
//! every queue is empty, no new work can appear and the phase is over. The
//! phase additionally cannot end before every root set has been claimed and
//! scanned (`roots_done`), so markers that arm early idle-wait instead of
//! declaring a spurious finish.

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::heap::ObjRef;

pub(crate) struct MarkQueue {
    injector: Injector<ObjRef>,
    stealers: RwLock<Vec<Stealer<ObjRef>>>,
    /// Markers currently holding (or able to produce) work.
    active_markers: AtomicUsize,
    /// Every root set has been claimed and fully scanned.
    roots_done: AtomicBool,
    /// Traversal termination has been declared.
    done: AtomicBool,
}

impl Default for MarkQueue {
    fn default() -> Self {
        Self {
            injector: Injector::new(),
            stealers: RwLock::new(Vec::new()),
            active_markers: AtomicUsize::new(0),
            roots_done: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }
    }
}

impl MarkQueue {
    /// Rearm for a new epoch. No marker is participating by now: traversal
    /// of the previous epoch only ended once every marker went idle.
    pub(crate) fn reset_for_epoch(&self) {
        debug_assert!(self.injector.is_empty());
        self.stealers.write().unwrap().clear();
        self.roots_done.store(false, Ordering::SeqCst);
        self.done.store(false, Ordering::SeqCst);
    }

    /// Push newly discovered work without a marker context (root scanners).
    pub(crate) fn push_global(&self, obj: ObjRef) {
        self.injector.push(obj);
    }

    pub(crate) fn set_roots_done(&self) {
        self.roots_done.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn has_work(&self) -> bool {
        if !self.injector.is_empty() {
            return true;
        }
        self.stealers
            .read()
            .unwrap()
            .iter()
            .any(|stealer| !stealer.is_empty())
    }

    pub(crate) fn is_globally_empty(&self) -> bool {
        !self.has_work()
    }

    /// Register a traversal participant. `limit` bounds the number of
    /// concurrent markers; `None` means the limit was reached.
    pub(crate) fn try_register(&self, limit: usize) -> Option<MarkerContext<'_>> {
        let mut stealers = self.stealers.write().unwrap();
        if stealers.len() >= limit {
            return None;
        }
        let local = Worker::new_lifo();
        let slot = stealers.len();
        stealers.push(local.stealer());
        drop(stealers);
        Some(MarkerContext {
            queue: self,
            local,
            slot,
            traced: 0,
        })
    }

    /// Drain the queue, stealing and processing until global termination.
    /// `process` scans one object and pushes its unmarked children.
    pub(crate) fn participate<F>(&self, ctx: &mut MarkerContext<'_>, mut process: F)
    where
        F: FnMut(&MarkerContext<'_>, ObjRef),
    {
        self.active_markers.fetch_add(1, Ordering::SeqCst);
        loop {
            while let Some(obj) = ctx.find_work() {
                process(ctx, obj);
                ctx.traced += 1;
            }

            self.active_markers.fetch_sub(1, Ordering::SeqCst);
            let backoff = Backoff::new();
            loop {
                if self.done.load(Ordering::SeqCst) {
                    return;
                }
                if self.has_work() {
                    self.active_markers.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                // `has_work` is read last: a marker only pushes while it is
                // counted active, so active == 0 and empty queues cannot be
                // observed while work is still in flight.
                if self.roots_done.load(Ordering::SeqCst)
                    && self.active_markers.load(Ordering::SeqCst) == 0
                    && !self.has_work()
                {
                    self.done.store(true, Ordering::SeqCst);
                    return;
                }
                backoff.snooze();
            }
        }
    }
}

/// One traversal participant's view of the queue.
pub(crate) struct MarkerContext<'q> {
    queue: &'q MarkQueue,
    local: Worker<ObjRef>,
    slot: usize,
    /// Objects this marker has scanned; flushed to the epoch's handle once.
    pub(crate) traced: usize,
}

impl MarkerContext<'_> {
    pub(crate) fn push(&self, obj: ObjRef) {
        self.local.push(obj);
    }

    fn find_work(&self) -> Option<ObjRef> {
        if let Some(obj) = self.local.pop() {
            return Some(obj);
        }
        loop {
            match self.queue.injector.steal_batch_and_pop(&self.local) {
                Steal::Success(obj) => return Some(obj),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }
        let stealers = self.queue.stealers.read().unwrap();
        for (i, stealer) in stealers.iter().enumerate() {
            if i == self.slot {
                continue;
            }
            loop {
                match stealer.steal_batch_and_pop(&self.local) {
                    Steal::Success(obj) => return Some(obj),
                    Steal::Empty => break,
                    Steal::Retry => {}
                }
            }
        }
        None
    }
}
