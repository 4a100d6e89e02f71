//! # Host Port
//!
//! Runs the kernel on a development machine. Each kernel thread is a std
//! thread; a baton records which one the scheduler considers current and
//! every other one sleeps on a condition variable until the baton comes
//! back to it. The idle thread stands in for the timer and delivers a tick
//! every time it is asked to wait for an interrupt.

use std::boxed::Box;
use std::panic::{self, AssertUnwindSafe};
use std::string::ToString;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread;

use crate::error::{KernelError, KernelResult};
use crate::kernel::Entry;
use crate::scheduler::Switch;
use crate::thread::ThreadId;

use super::Port;

/// Unwind payload used to end an exited thread's std thread.
struct ThreadExit;

struct Baton {
    running: Option<ThreadId>,
    /// A kernel thread panicked; everyone else gives up too.
    failed: bool,
}

pub struct HostPort {
    baton: Mutex<Baton>,
    turn: Condvar,
}

impl HostPort {
    pub fn new() -> Self {
        Self {
            baton: Mutex::new(Baton {
                running: None,
                failed: false,
            }),
            turn: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Baton> {
        self.baton.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait_turn(&self, me: ThreadId) {
        let mut baton = self.lock();
        while baton.running != Some(me) {
            if baton.failed {
                drop(baton);
                panic!("another kernel thread panicked");
            }
            baton = self
                .turn
                .wait(baton)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn hand_to(&self, next: ThreadId) {
        self.lock().running = Some(next);
        self.turn.notify_all();
    }

    fn fail(&self) {
        self.lock().failed = true;
        self.turn.notify_all();
    }
}

impl Default for HostPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for HostPort {
    fn adopt(&self, initial: ThreadId) {
        self.lock().running = Some(initial);
    }

    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R {
        f()
    }

    fn prepare(&self, thread: ThreadId, name: &str, entry: Entry<Self>) -> KernelResult<()> {
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let port = entry.kernel().port();
                port.wait_turn(thread);
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry.run()));
                if let Err(payload) = outcome {
                    if !payload.is::<ThreadExit>() {
                        port.fail();
                        panic::resume_unwind(payload);
                    }
                }
            })
            .map(|_| ())
            .map_err(|_| KernelError::ContextUnavailable)
    }

    fn switch(&self, switch: Switch) {
        self.hand_to(switch.to);
        if !switch.exiting {
            self.wait_turn(switch.from);
        }
    }

    fn exit_context(&self) -> ! {
        panic::resume_unwind(Box::new(ThreadExit))
    }

    fn wait_for_interrupt(&self, timer: &dyn Fn()) {
        timer();
        thread::yield_now();
    }
}
