//! Ownership and teardown of driver resources.
//!
//! Every connection and channel is wrapped in a [`ResourceNode`](node::ResourceNode) that owns
//! a set of [`CloseHooks`]. Owners (brokers, publishers, consumers) attach to a node to hear
//! about its errors and closure; the node guarantees their cleanup runs exactly once, either
//! because the resource closed or because the owner detached first.
mod events;
mod hooks;
pub(crate) mod node;

pub use events::{BrokerEvent, EventBus, EventKind, EventSource};
pub use hooks::{CloseCause, CloseHooks, HookId};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Process-wide, monotonically increasing id used to tell resources apart in logs.
pub(crate) fn next_instance_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
