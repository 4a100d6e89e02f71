//! Recoverable kernel errors.
//!
//! Violated invariants (blocking in an interrupt handler, releasing a lock
//! that is not held, a corrupted control block) are not errors: they panic.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Every thread slot is in use.
    ThreadLimit,
    /// The semaphore pool is exhausted.
    SemaphoreLimit,
    /// Every lock slot is in use.
    LockLimit,
    /// Every condition variable slot is in use.
    ConditionLimit,
    /// The primitive still has a holder or waiters and cannot be destroyed.
    Busy,
    /// The port could not provide an execution context (stack) for a thread.
    ContextUnavailable,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::ThreadLimit => "thread table full",
            KernelError::SemaphoreLimit => "semaphore pool exhausted",
            KernelError::LockLimit => "lock table full",
            KernelError::ConditionLimit => "condition table full",
            KernelError::Busy => "primitive is held or has waiters",
            KernelError::ContextUnavailable => "no execution context available",
        };
        f.write_str(msg)
    }
}

/// Result alias used across the kernel API.
pub type KernelResult<T> = Result<T, KernelError>;
