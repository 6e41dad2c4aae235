//! The finalizer processor.
//!
//! Finalization is decoupled from collection: the orchestrator hands each
//! epoch's queue over (with no collector lock held, since starting the
//! thread may block on OS primitives) and moves on to the next epoch. The
//! background thread drains batches FIFO and reports each epoch finalized
//! through the `epoch_done` callback once every one of its tasks has been
//! processed.
//! A panicking finalizer is caught and logged; it never kills the loop.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

use crate::heap::FinalizerQueue;
use crate::Epoch;

pub type EpochDoneCallback = Box<dyn Fn(Epoch) + Send + Sync>;

struct ProcessorState {
    tasks: VecDeque<(FinalizerQueue, Epoch)>,
    thread: Option<JoinHandle<()>>,
    /// The thread has entered its loop.
    running: bool,
    shutdown_requested: bool,
    /// The epoch whose batch is being processed (or whose callback is still
    /// in flight). Guards the fast path below against out-of-order
    /// finalization reports.
    active_epoch: Option<Epoch>,
}

pub struct FinalizerProcessor {
    /// Handed to the background thread at spawn time.
    me: Weak<FinalizerProcessor>,
    sync: Mutex<ProcessorState>,
    work_available: Condvar,
    state_changed: Condvar,
    epoch_done: EpochDoneCallback,
}

impl FinalizerProcessor {
    pub fn new(epoch_done: EpochDoneCallback) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            sync: Mutex::new(ProcessorState {
                tasks: VecDeque::new(),
                thread: None,
                running: false,
                shutdown_requested: false,
                active_epoch: None,
            }),
            work_available: Condvar::new(),
            state_changed: Condvar::new(),
            epoch_done,
        })
    }

    /// Enqueue one epoch's batch. Returns immediately. An empty batch with
    /// nothing in flight is reported done on the spot, without a thread.
    ///
    /// The caller must hold no collector lock: this may start the finalizer
    /// thread.
    pub fn schedule_tasks(&self, queue: FinalizerQueue, epoch: Epoch) {
        let mut state = self.sync.lock().unwrap();
        if queue.is_empty() && state.tasks.is_empty() && state.active_epoch.is_none() {
            drop(state);
            trace!("epoch #{}: no finalizers to run", epoch);
            (self.epoch_done)(epoch);
            return;
        }
        state.tasks.push_back((queue, epoch));
        self.start_thread_locked(&mut state);
        self.work_available.notify_all();
    }

    fn start_thread_locked(&self, state: &mut ProcessorState) {
        if state.thread.is_some() {
            return;
        }
        state.shutdown_requested = false;
        let this = self.me.upgrade().expect("finalizer processor deallocated");
        state.thread = Some(
            std::thread::Builder::new()
                .name("GC finalizer processor".into())
                .spawn(move || this.run())
                .expect("failed to spawn the finalizer thread"),
        );
    }

    /// Start the background thread if it is not running and wait until it
    /// has entered its loop.
    pub fn start_finalizer_thread_if_none(&self) {
        let mut state = self.sync.lock().unwrap();
        self.start_thread_locked(&mut state);
        while !state.running {
            state = self.state_changed.wait(state).unwrap();
        }
    }

    /// Stop and join the background thread. Queued batches are drained
    /// before the thread exits.
    pub fn stop_finalizer_thread(&self) {
        let mut state = self.sync.lock().unwrap();
        let handle = match state.thread.take() {
            Some(handle) => handle,
            None => return,
        };
        state.shutdown_requested = true;
        self.work_available.notify_all();
        drop(state);
        handle.join().expect("finalizer thread panicked");
    }

    pub fn is_running(&self) -> bool {
        self.sync.lock().unwrap().running
    }

    fn run(&self) {
        debug!("finalizer thread starts execution");
        {
            let mut state = self.sync.lock().unwrap();
            state.running = true;
            self.state_changed.notify_all();
        }
        loop {
            let (queue, epoch) = {
                let mut state = self.sync.lock().unwrap();
                loop {
                    if let Some(task) = state.tasks.pop_front() {
                        state.active_epoch = Some(task.1);
                        break task;
                    }
                    if state.shutdown_requested {
                        state.running = false;
                        self.state_changed.notify_all();
                        debug!("finalizer thread finishes execution");
                        return;
                    }
                    state = self.work_available.wait(state).unwrap();
                }
            };
            trace!("epoch #{}: running {} finalizers", epoch, queue.len());
            queue.process_all();
            // Report before clearing active_epoch, so an empty epoch cannot
            // overtake this one on the fast path of schedule_tasks.
            (self.epoch_done)(epoch);
            self.sync.lock().unwrap().active_epoch = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{AllocatorLocal, ObjectFactory, TypeInfo};
    use crate::heap::{Allocator, FinalizerQueue};
    use crate::util::test_util::panic_after;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn finalizable_type(counter: Arc<AtomicUsize>) -> &'static TypeInfo {
        TypeInfo::object("Finalizable", 8, &[])
            .with_finalizer(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .leak()
    }

    fn queue_of(n: usize, ty: &'static TypeInfo) -> FinalizerQueue {
        let factory = ObjectFactory::default();
        let local = factory.new_local();
        let mut queue = FinalizerQueue::new(factory.accounting().clone());
        for _ in 0..n {
            queue.push(local.create_object(&factory, ty));
        }
        queue
    }

    #[test]
    fn empty_batch_is_done_immediately_without_a_thread() {
        let done = Arc::new(StdMutex::new(Vec::new()));
        let processor = FinalizerProcessor::new({
            let done = done.clone();
            Box::new(move |e| done.lock().unwrap().push(e))
        });
        processor.schedule_tasks(FinalizerQueue::default(), 1);
        assert_eq!(*done.lock().unwrap(), vec![1]);
        assert!(!processor.is_running());
    }

    #[test]
    fn finalizers_run_before_epoch_reported_done() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_at_done = Arc::new(AtomicUsize::new(usize::MAX));
        let done = Arc::new(StdMutex::new(Vec::new()));
        let processor = FinalizerProcessor::new({
            let done = done.clone();
            let ran = ran.clone();
            let ran_at_done = ran_at_done.clone();
            Box::new(move |e| {
                ran_at_done.store(ran.load(Ordering::SeqCst), Ordering::SeqCst);
                done.lock().unwrap().push(e);
            })
        });
        let ty = finalizable_type(ran.clone());
        processor.schedule_tasks(queue_of(5, ty), 1);
        processor.stop_finalizer_thread();
        assert_eq!(ran.load(Ordering::SeqCst), 5);
        assert_eq!(ran_at_done.load(Ordering::SeqCst), 5);
        assert_eq!(*done.lock().unwrap(), vec![1]);
    }

    #[test]
    fn epochs_are_reported_in_order() {
        let done = Arc::new(StdMutex::new(Vec::new()));
        let processor = FinalizerProcessor::new({
            let done = done.clone();
            Box::new(move |e| done.lock().unwrap().push(e))
        });
        let ran = Arc::new(AtomicUsize::new(0));
        let ty = finalizable_type(ran);
        processor.schedule_tasks(queue_of(3, ty), 1);
        // Empty epoch behind a non-empty one must not be reported first.
        processor.schedule_tasks(FinalizerQueue::default(), 2);
        processor.stop_finalizer_thread();
        assert_eq!(*done.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn panicking_finalizer_does_not_kill_the_loop() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ty_panics = TypeInfo::object("Bomb", 8, &[])
            .with_finalizer(Arc::new(|_| panic!("finalizer bomb")))
            .leak();
        let ty_counts = finalizable_type(ran.clone());
        let done = Arc::new(StdMutex::new(Vec::new()));
        let processor = FinalizerProcessor::new({
            let done = done.clone();
            Box::new(move |e| done.lock().unwrap().push(e))
        });

        let factory = ObjectFactory::default();
        let local = factory.new_local();
        let mut queue = FinalizerQueue::new(factory.accounting().clone());
        queue.push(local.create_object(&factory, ty_panics));
        queue.push(local.create_object(&factory, ty_counts));
        processor.schedule_tasks(queue, 1);
        processor.stop_finalizer_thread();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(*done.lock().unwrap(), vec![1]);
    }

    #[test]
    fn thread_lifecycle() {
        let processor = FinalizerProcessor::new(Box::new(|_| {}));
        assert!(!processor.is_running());
        processor.start_finalizer_thread_if_none();
        assert!(processor.is_running());
        // Idempotent.
        processor.start_finalizer_thread_if_none();
        processor.stop_finalizer_thread();
        assert!(!processor.is_running());
        // Stopping again is a no-op.
        processor.stop_finalizer_thread();
        // And it can be restarted.
        processor.start_finalizer_thread_if_none();
        panic_after(5000, {
            let processor = processor.clone();
            move || processor.stop_finalizer_thread()
        });
    }
}
