//! Stop-the-world primitives.
//!
//! The safepoint fast path is a single relaxed load of `action_pending`.
//! The slow path parks the mutator: it decrements the running-mutator count
//! (so the GC can declare the world stopped), runs the suspension hook, and
//! waits on the resume condvar. Threads executing native code are not
//! counted as running; they park on re-entry if an action is still pending.
//!
//! Only one agent can hold a suspension at a time: the first
//! `request_threads_suspension` wins and everything else is a programmer
//! error on the caller's side (asserted by the orchestrator).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

#[derive(Debug, Default)]
struct SuspensionState {
    suspension_requested: bool,
    /// Set while a marking epoch wants mutators to park early and help.
    cooperative_mark_armed: bool,
}

pub struct ThreadSuspension {
    /// The safepoint fast-path flag: true iff parking is required.
    action_pending: AtomicBool,
    sync: Mutex<SuspensionState>,
    /// The GC waits here for the running-mutator count to reach zero.
    threads_reached_safety: Condvar,
    /// Parked mutators wait here for the world to restart.
    resume: Condvar,
    /// Registered mutators currently in the `Runnable` state.
    mutators_running: AtomicUsize,
}

impl Default for ThreadSuspension {
    fn default() -> Self {
        Self {
            action_pending: AtomicBool::new(false),
            sync: Mutex::new(SuspensionState::default()),
            threads_reached_safety: Condvar::new(),
            resume: Condvar::new(),
            mutators_running: AtomicUsize::new(0),
        }
    }
}

impl ThreadSuspension {
    /// The safepoint fast path.
    #[inline(always)]
    pub fn is_action_pending(&self) -> bool {
        self.action_pending.load(Ordering::Relaxed)
    }

    /// Claim the right to stop the world. Returns false if a suspension is
    /// already pending, i.e. the caller is not the suspending thread.
    pub fn request_threads_suspension(&self) -> bool {
        let mut state = self.sync.lock().unwrap();
        if state.suspension_requested {
            return false;
        }
        state.suspension_requested = true;
        self.action_pending.store(true, Ordering::SeqCst);
        true
    }

    /// Block until every registered mutator has left the `Runnable` state.
    /// A safepoint action (suspension or cooperative mark) must be pending,
    /// otherwise running mutators have no reason to ever park.
    pub fn wait_for_threads_suspension(&self) {
        let mut state = self.sync.lock().unwrap();
        debug_assert!(state.suspension_requested || state.cooperative_mark_armed);
        while self.mutators_running.load(Ordering::SeqCst) > 0 {
            state = self.threads_reached_safety.wait(state).unwrap();
        }
    }

    /// Restart the world. Parked mutators re-enter `Runnable` as they wake.
    pub fn resume_threads(&self) {
        let mut state = self.sync.lock().unwrap();
        debug_assert!(state.suspension_requested);
        state.suspension_requested = false;
        if !state.cooperative_mark_armed {
            self.action_pending.store(false, Ordering::SeqCst);
        }
        self.resume.notify_all();
    }

    /// Make safepoints park mutators even before the suspension request, so
    /// they can scan their own roots and assist marking.
    pub fn arm_cooperative_mark(&self) {
        let mut state = self.sync.lock().unwrap();
        state.cooperative_mark_armed = true;
        self.action_pending.store(true, Ordering::SeqCst);
        drop(state);
    }

    pub fn disarm_cooperative_mark(&self) {
        let mut state = self.sync.lock().unwrap();
        state.cooperative_mark_armed = false;
        if !state.suspension_requested {
            self.action_pending.store(false, Ordering::SeqCst);
            self.resume.notify_all();
        }
    }

    /// Park the calling mutator. `before_wait` is the suspension hook; it
    /// runs after the thread has been discounted from the running set (so
    /// the pause can be declared while the hook assists the GC) and before
    /// the thread actually sleeps.
    pub fn park<F: FnOnce()>(&self, before_wait: F) {
        self.discount_running();
        before_wait();
        let mut state = self.sync.lock().unwrap();
        while state.suspension_requested || state.cooperative_mark_armed {
            state = self.resume.wait(state).unwrap();
        }
        self.mutators_running.fetch_add(1, Ordering::SeqCst);
    }

    /// A mutator enters the running set: registration or return from native.
    pub fn attach_running(&self) {
        self.mutators_running.fetch_add(1, Ordering::SeqCst);
    }

    /// A mutator leaves the running set: deregistration or native call.
    pub fn detach_running(&self) {
        self.discount_running();
    }

    fn discount_running(&self) {
        let prev = self.mutators_running.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "running-mutator count underflow");
        // Take the lock so the wakeup cannot slip between the GC's check and
        // its wait.
        let _state = self.sync.lock().unwrap();
        self.threads_reached_safety.notify_all();
    }

    pub fn running_count(&self) -> usize {
        self.mutators_running.load(Ordering::SeqCst)
    }
}
