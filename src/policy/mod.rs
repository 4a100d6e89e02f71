//! # Scheduling Policies
//!
//! The two mutually exclusive ways priorities evolve, chosen once at boot:
//!
//! | Hook              | `Priority` (donation)               | `Mlfqs`                          |
//! |-------------------|-------------------------------------|----------------------------------|
//! | `set_priority`    | new base, effective keeps donations | writes base and effective        |
//! | `set_nice`        | stored, no effect                   | recomputes the caller's priority |
//! | `lock_contended`  | donate along the holder chain       | nothing                          |
//! | `lock_acquired`   | adopt remaining waiters as donors   | nothing                          |
//! | `lock_released`   | revoke donations for that lock      | nothing                          |
//! | `on_tick`         | nothing                             | recent_cpu, load_avg, priorities |
//!
//! Everything that depends on the policy goes through [`Policy`]; the rest
//! of the scheduler never asks which one is active.

pub mod donation;
pub mod mlfqs;

pub use donation::Donation;
pub use mlfqs::Mlfqs;

use crate::arena::Arena;
use crate::config::{PolicyKind, MAX_LOCKS};
use crate::fixed_point::Fixed;
use crate::queue::WaitList;
use crate::sync::{Lock, LockId};
use crate::thread::{ThreadId, ThreadTable};

pub enum Policy {
    Priority(Donation),
    Mlfqs(Mlfqs),
}

impl Policy {
    pub fn new(kind: PolicyKind) -> Self {
        match kind {
            PolicyKind::Priority => Policy::Priority(Donation),
            PolicyKind::Mlfqs => Policy::Mlfqs(Mlfqs::new()),
        }
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            Policy::Priority(_) => PolicyKind::Priority,
            Policy::Mlfqs(_) => PolicyKind::Mlfqs,
        }
    }

    pub fn set_priority(&mut self, threads: &mut ThreadTable, id: ThreadId, priority: u8) {
        match self {
            Policy::Priority(d) => d.set_priority(threads, id, priority),
            Policy::Mlfqs(m) => m.set_priority(threads, id, priority),
        }
    }

    pub fn set_nice(&mut self, threads: &mut ThreadTable, id: ThreadId, nice: i32) {
        match self {
            Policy::Priority(_) => threads.thread_mut(id).nice = nice,
            Policy::Mlfqs(m) => m.set_nice(threads, id, nice),
        }
    }

    /// `requester` is about to block on a lock held by `holder`.
    pub fn lock_contended(
        &mut self,
        threads: &mut ThreadTable,
        locks: &Arena<Lock, MAX_LOCKS>,
        requester: ThreadId,
        holder: ThreadId,
    ) {
        if let Policy::Priority(d) = self {
            d.donate(threads, locks, requester, holder);
        }
    }

    /// `holder` just took a lock that `waiters` are still queued on.
    pub fn lock_acquired(
        &mut self,
        threads: &mut ThreadTable,
        waiters: &WaitList,
        holder: ThreadId,
    ) {
        if let Policy::Priority(d) = self {
            d.adopt(threads, waiters, holder);
        }
    }

    /// `holder` is releasing `lock`.
    pub fn lock_released(&mut self, threads: &mut ThreadTable, lock: LockId, holder: ThreadId) {
        if let Policy::Priority(d) = self {
            d.revoke(threads, lock, holder);
        }
    }

    pub fn on_tick(&mut self, threads: &mut ThreadTable, ticks: u64, timer_freq: u32) {
        if let Policy::Mlfqs(m) = self {
            m.on_tick(threads, ticks, timer_freq);
        }
    }

    pub fn load_avg(&self) -> Fixed {
        match self {
            Policy::Priority(_) => Fixed::ZERO,
            Policy::Mlfqs(m) => m.load_avg(),
        }
    }
}
