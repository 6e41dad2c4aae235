//! PMCS is a parallel-mark / concurrent-sweep garbage collector core for
//! managed-object runtimes.
//!
//! The collector runs full-heap collections as a monotonic sequence of
//! *epochs*. Each epoch goes through a short stop-the-world pause in which
//! mutator root sets are scanned and the live heap is marked in parallel,
//! followed by a sweep that runs concurrently with resumed mutators and a
//! finalization pass on a dedicated background thread.
//!
//! The crate is generic over an [`Allocator`](crate::heap::Allocator), which
//! supplies objects and the per-epoch sweep. A generic segmented-list
//! allocator ([`ObjectFactory`](crate::heap::ObjectFactory)) is provided;
//! runtimes with their own heap implement the trait instead and the sweep
//! path is selected at compile time by the type parameter.
//!
//! Interaction with the hosting runtime:
//! * Mutator threads register with [`PMCS::register_current_thread`] and call
//!   [`api::safe_point`] at their safepoints.
//! * The runtime's GC scheduler requests collections through
//!   [`api::schedule`] and observes them via a [`GCTrigger`](crate::gc::GCTrigger).
//! * Finalizers run on a background thread controlled through
//!   [`api::start_finalizer_thread_if_needed`] and friends.

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

pub mod api;
pub mod gc;
pub mod heap;
pub mod mark;
pub mod mm;
pub mod util;

mod pmcs;

pub use crate::pmcs::{GlobalData, MutatorHandle, PMCSBuilder, PMCS};

/// An epoch identifies one full collection cycle. Monotonically increasing,
/// starting from 1; 0 never names a real collection.
pub type Epoch = i64;
