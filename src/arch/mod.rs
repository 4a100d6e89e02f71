//! # Architecture Abstraction Layer
//!
//! The scheduler decides *which* thread runs; a [`Port`] makes it happen.
//! Ports own everything register- and stack-shaped: critical sections,
//! building a new thread's initial context, the switch itself, and waiting
//! for the next interrupt.
//!
//! - [`cortex_m4`]: PendSV/SysTick port for ARM Cortex-M4 (feature
//!   `cortex-m4`).
//! - [`host`]: every kernel thread is a std thread and only the one the
//!   scheduler calls current may run (feature `host`, and in tests).

#[cfg(feature = "cortex-m4")]
pub mod cortex_m4;

#[cfg(any(test, feature = "host"))]
pub mod host;

use crate::error::KernelResult;
use crate::kernel::Entry;
use crate::scheduler::Switch;
use crate::thread::ThreadId;

pub trait Port: Sync + Sized + 'static {
    /// The code executing right now becomes `initial`.
    fn adopt(&self, initial: ThreadId);

    /// Run `f` with interrupt delivery disabled.
    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R;

    /// Build an execution context for `thread` that starts in `entry`.
    /// Called with interrupts disabled.
    fn prepare(&self, thread: ThreadId, name: &str, entry: Entry<Self>) -> KernelResult<()>;

    /// Carry out a switch the scheduler has already committed to. Returns
    /// once `switch.from` is resumed, or at once if it is exiting.
    fn switch(&self, switch: Switch);

    /// `thread` has been reclaimed; free its context.
    fn release(&self, _thread: ThreadId) {}

    /// Abandon the current context after an exit switch.
    fn exit_context(&self) -> !;

    /// Start the periodic tick source.
    fn start_timer(&self, _hz: u32) {}

    /// Idle until an interrupt arrives. Ports without a real timer drive
    /// `timer` themselves.
    fn wait_for_interrupt(&self, timer: &dyn Fn());

    /// Integrity check of the thread's stack.
    fn stack_ok(&self, _thread: ThreadId) -> bool {
        true
    }
}
