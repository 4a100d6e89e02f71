//! # Synchronization Primitives
//!
//! Counting semaphores, non-recursive locks with priority donation, and
//! Mesa-style condition variables. State lives in arenas inside the
//! [`Scheduler`](crate::scheduler::Scheduler); callers hold handles.
//!
//! The operations here are the scheduler-side halves. A blocking operation
//! either completes and returns [`Wait::Done`], or deschedules the caller
//! and returns [`Wait::Blocked`]; a blocked caller re-issues the operation
//! once it runs again. [`Kernel`](crate::kernel::Kernel) wraps that loop.

mod condvar;
mod lock;
mod semaphore;

pub use condvar::{CondTicket, Condition, ConditionId};
pub use lock::{Lock, LockId};
pub use semaphore::{Semaphore, SemaphoreId};

/// Outcome of one attempt at a blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Done,
    /// The caller was descheduled and must retry when it runs again.
    Blocked,
}
