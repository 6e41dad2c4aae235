//! Mutator-side machinery: the thread registry, per-thread GC state, the
//! stop-the-world primitives and root storage.

pub mod roots;
pub mod suspension;
pub mod thread_data;
pub mod thread_registry;

pub use roots::GlobalRoots;
pub use suspension::ThreadSuspension;
pub use thread_data::{MutatorThread, ThreadState};
pub use thread_registry::ThreadRegistry;

use std::cell::Cell;

thread_local! {
    static CURRENT_IS_REGISTERED: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling OS thread is registered as a mutator. GC threads must
/// never be: a registered GC thread would be subject to its own
/// stop-the-world request.
pub fn current_thread_is_registered() -> bool {
    CURRENT_IS_REGISTERED.with(|flag| flag.get())
}

pub(crate) fn set_current_thread_registered(registered: bool) {
    CURRENT_IS_REGISTERED.with(|flag| {
        debug_assert_ne!(flag.get(), registered, "mutator registration out of balance");
        flag.set(registered)
    });
}
