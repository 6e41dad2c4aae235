//! Per-epoch bookkeeping.
//!
//! A [`GCHandle`] names one collection and funnels its timings and counters
//! into the collector's [`GCStats`]. Handles are cheap to clone and can be
//! re-obtained by epoch, which is how the finalizer thread closes out an
//! epoch it did not open. Everything here is observability; none of it is
//! load-bearing for collection correctness.

use atomic_refcell::AtomicRefCell;
use enum_map::{Enum, EnumMap};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::Epoch;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Enum)]
pub enum GCPhase {
    SuspendThreads,
    Mark,
    ProcessWeaks,
    Sweep,
    Finalizers,
}

#[derive(Default)]
struct EpochStats {
    created: Option<Instant>,
    phase_start: EnumMap<GCPhase, Option<Instant>>,
    phase_duration: EnumMap<GCPhase, Option<Duration>>,
    root_sets_by_mutators: usize,
    root_sets_by_gc: usize,
    objects_traced: usize,
    objects_swept: usize,
    objects_kept: usize,
    finalizers_scheduled: usize,
}

/// One collector instance's statistics store.
#[derive(Default)]
pub struct GCStats {
    epochs: Mutex<HashMap<Epoch, EpochStats>>,
    /// When the last collection started. Only written by the main GC thread.
    last_gc_start: AtomicRefCell<Option<Instant>>,
}

impl GCStats {
    pub fn last_gc_start(&self) -> Option<Instant> {
        *self.last_gc_start.borrow()
    }
}

#[derive(Clone)]
pub struct GCHandle {
    stats: Arc<GCStats>,
    epoch: Epoch,
}

impl GCHandle {
    /// Open the record for `epoch`. Called once per epoch by the main GC
    /// thread.
    pub fn create(stats: &Arc<GCStats>, epoch: Epoch) -> GCHandle {
        let mut epochs = stats.epochs.lock().unwrap();
        let entry = epochs.entry(epoch).or_default();
        entry.created = Some(Instant::now());
        *stats.last_gc_start.borrow_mut() = entry.created;
        debug!("epoch #{}: collection started", epoch);
        GCHandle {
            stats: stats.clone(),
            epoch,
        }
    }

    /// Re-obtain the handle for an epoch opened earlier.
    pub fn get_by_epoch(stats: &Arc<GCStats>, epoch: Epoch) -> GCHandle {
        GCHandle {
            stats: stats.clone(),
            epoch,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn with_entry<R>(&self, f: impl FnOnce(&mut EpochStats) -> R) -> R {
        let mut epochs = self.stats.epochs.lock().unwrap();
        f(epochs.entry(self.epoch).or_default())
    }

    pub fn phase_started(&self, phase: GCPhase) {
        self.with_entry(|e| e.phase_start[phase] = Some(Instant::now()));
    }

    pub fn phase_done(&self, phase: GCPhase) {
        self.with_entry(|e| {
            if let Some(start) = e.phase_start[phase] {
                e.phase_duration[phase] = Some(start.elapsed());
            }
        });
        trace!("epoch #{}: phase {:?} done", self.epoch, phase);
    }

    pub fn suspension_requested(&self) {
        self.phase_started(GCPhase::SuspendThreads);
        debug!("epoch #{}: requested suspension of mutators", self.epoch);
    }

    pub fn threads_are_suspended(&self) {
        self.phase_done(GCPhase::SuspendThreads);
        debug!("epoch #{}: world stopped", self.epoch);
    }

    pub fn threads_are_resumed(&self) {
        debug!("epoch #{}: world resumed", self.epoch);
    }

    pub fn root_set_scanned(&self, by_mutator: bool) {
        self.with_entry(|e| {
            if by_mutator {
                e.root_sets_by_mutators += 1;
            } else {
                e.root_sets_by_gc += 1;
            }
        });
    }

    /// Flush one marker's trace count. Called once per marker per epoch.
    pub fn objects_traced(&self, count: usize) {
        self.with_entry(|e| e.objects_traced += count);
    }

    pub fn objects_swept(&self, swept: usize, kept: usize) {
        self.with_entry(|e| {
            e.objects_swept += swept;
            e.objects_kept += kept;
        });
    }

    pub fn finalizers_scheduled(&self, count: usize) {
        self.with_entry(|e| e.finalizers_scheduled = count);
        if count > 0 {
            self.phase_started(GCPhase::Finalizers);
            debug!("epoch #{}: {} finalizers scheduled", self.epoch, count);
        }
    }

    /// Called by the finalizer thread when the epoch's batch has drained.
    /// Drops the record: the epoch is fully over.
    pub fn finalizers_done(&self) {
        self.phase_done(GCPhase::Finalizers);
        self.stats.epochs.lock().unwrap().remove(&self.epoch);
        debug!("epoch #{}: finalizers done", self.epoch);
    }

    /// Log the epoch summary once sweep has completed.
    pub fn finished(&self) {
        self.with_entry(|e| {
            let total = e.created.map(|c| c.elapsed()).unwrap_or_default();
            let pause = e.phase_duration[GCPhase::SuspendThreads]
                .unwrap_or_default()
                .saturating_add(e.phase_duration[GCPhase::Mark].unwrap_or_default());
            info!(
                "epoch #{}: done in {:?} (pause {:?}): {} roots ({} by mutators), {} traced, {} swept, {} kept, {} finalizable",
                self.epoch,
                total,
                pause,
                e.root_sets_by_mutators + e.root_sets_by_gc,
                e.root_sets_by_mutators,
                e.objects_traced,
                e.objects_swept,
                e.objects_kept,
                e.finalizers_scheduled,
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_timing_is_recorded() {
        let stats = Arc::new(GCStats::default());
        let handle = GCHandle::create(&stats, 7);
        handle.phase_started(GCPhase::Mark);
        handle.phase_done(GCPhase::Mark);
        let epochs = stats.epochs.lock().unwrap();
        assert!(epochs[&7].phase_duration[GCPhase::Mark].is_some());
    }

    #[test]
    fn handle_can_be_reobtained_by_epoch() {
        let stats = Arc::new(GCStats::default());
        let handle = GCHandle::create(&stats, 3);
        handle.root_set_scanned(true);
        let again = GCHandle::get_by_epoch(&stats, 3);
        again.root_set_scanned(false);
        let epochs = stats.epochs.lock().unwrap();
        assert_eq!(epochs[&3].root_sets_by_mutators, 1);
        assert_eq!(epochs[&3].root_sets_by_gc, 1);
    }

    #[test]
    fn finalizers_done_drops_the_record() {
        let stats = Arc::new(GCStats::default());
        let handle = GCHandle::create(&stats, 9);
        handle.finalizers_scheduled(2);
        handle.finalizers_done();
        assert!(stats.epochs.lock().unwrap().is_empty());
    }
}
