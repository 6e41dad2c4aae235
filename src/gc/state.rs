//! The epoch-driven GC state machine.
//!
//! Every collection is identified by a monotonically increasing epoch. A
//! single timeline of watermarks under one mutex encodes each epoch's
//! lifecycle (`Scheduled -> Started -> Finished -> Finalized`): epoch `e` is
//! in a state iff the corresponding watermark has reached `e`. Watermarks
//! only grow, which is what makes the transitions one-way and the epoch
//! sequence monotone.
//!
//! All waiting (the GC thread waiting for work, mutators waiting for a
//! collection or its finalizers) blocks on a single broadcast condvar.
//! `shutdown` moves the machine to its terminal state: every current and
//! future wait unblocks immediately.

use std::sync::{Condvar, Mutex};

use crate::Epoch;

#[derive(Debug, Default)]
struct EpochTimeline {
    scheduled: Epoch,
    started: Epoch,
    finished: Epoch,
    finalized: Epoch,
    shutdown: bool,
}

pub struct GCState {
    sync: Mutex<EpochTimeline>,
    changed: Condvar,
}

impl Default for GCState {
    fn default() -> Self {
        Self {
            sync: Mutex::new(EpochTimeline::default()),
            changed: Condvar::new(),
        }
    }
}

impl GCState {
    /// Request a collection. Consecutive requests collapse: while an epoch
    /// is scheduled but not yet started, the same epoch is returned. Wakes
    /// the GC thread. Never blocks.
    pub fn schedule(&self) -> Epoch {
        let mut timeline = self.sync.lock().unwrap();
        if timeline.scheduled <= timeline.started {
            timeline.scheduled = timeline.started + 1;
            trace!("scheduled epoch #{}", timeline.scheduled);
            self.changed.notify_all();
        }
        timeline.scheduled
    }

    /// Main-GC-thread wait: blocks until an epoch is scheduled or shutdown
    /// is requested. `None` means terminate.
    pub fn wait_scheduled(&self) -> Option<Epoch> {
        let mut timeline = self.sync.lock().unwrap();
        loop {
            if timeline.shutdown {
                return None;
            }
            if timeline.scheduled > timeline.started {
                return Some(timeline.scheduled);
            }
            timeline = self.changed.wait(timeline).unwrap();
        }
    }

    pub fn start(&self, epoch: Epoch) {
        let mut timeline = self.sync.lock().unwrap();
        assert_eq!(
            timeline.started + 1,
            epoch,
            "epoch #{} started out of order",
            epoch
        );
        debug_assert!(timeline.scheduled >= epoch);
        timeline.started = epoch;
        self.changed.notify_all();
    }

    pub fn finish(&self, epoch: Epoch) {
        let mut timeline = self.sync.lock().unwrap();
        assert_eq!(
            timeline.finished + 1,
            epoch,
            "epoch #{} finished out of order",
            epoch
        );
        debug_assert!(timeline.started >= epoch);
        timeline.finished = epoch;
        self.changed.notify_all();
    }

    pub fn finalized(&self, epoch: Epoch) {
        let mut timeline = self.sync.lock().unwrap();
        assert_eq!(
            timeline.finalized + 1,
            epoch,
            "epoch #{} finalized out of order",
            epoch
        );
        debug_assert!(timeline.finished >= epoch);
        timeline.finalized = epoch;
        self.changed.notify_all();
    }

    /// Blocks until epoch `epoch` is in `Finished` or later, or shutdown.
    pub fn wait_epoch_finished(&self, epoch: Epoch) {
        let mut timeline = self.sync.lock().unwrap();
        while !timeline.shutdown && timeline.finished < epoch {
            timeline = self.changed.wait(timeline).unwrap();
        }
    }

    /// Blocks until epoch `epoch` is `Finalized`, or shutdown.
    pub fn wait_epoch_finalized(&self, epoch: Epoch) {
        let mut timeline = self.sync.lock().unwrap();
        while !timeline.shutdown && timeline.finalized < epoch {
            timeline = self.changed.wait(timeline).unwrap();
        }
    }

    /// Move to the terminal state. All waiters unblock; `wait_scheduled`
    /// returns `None` from now on. Called once, on teardown.
    pub fn shutdown(&self) {
        let mut timeline = self.sync.lock().unwrap();
        assert!(!timeline.shutdown, "GC state machine shut down twice");
        timeline.shutdown = true;
        self.changed.notify_all();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.sync.lock().unwrap().shutdown
    }

    /// The epoch most recently handed to `start`.
    pub fn started_epoch(&self) -> Epoch {
        self.sync.lock().unwrap().started
    }

    /// True while an epoch is between `start` and `finish`. `reconfigure`
    /// uses this as a sanity check; its real exclusion is the GC mutex.
    pub(crate) fn collection_in_progress(&self) -> bool {
        let timeline = self.sync.lock().unwrap();
        timeline.started > timeline.finished
    }
}
