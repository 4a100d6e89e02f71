//! # Priority Donation
//!
//! Priority inheritance through locks. When a thread blocks on a lock, the
//! holder runs at least at the blocked thread's priority until it releases
//! that lock; if the holder is itself blocked on another lock the raise is
//! passed along.
//!
//! ```text
//!   H (30) ──waits──► lock B ──held by──► L2 (20→30) ──waits──► lock A ──held by──► L1 (10→30)
//! ```
//!
//! Invariant kept for every thread with donors:
//! `priority == max(base_priority, max(donor.priority))`.

use log::debug;

use crate::arena::Arena;
use crate::config::MAX_LOCKS;
use crate::queue::WaitList;
use crate::sync::{Lock, LockId};
use crate::thread::{ThreadId, ThreadTable};

#[derive(Debug, Clone, Copy, Default)]
pub struct Donation;

impl Donation {
    /// `requester` blocks on a lock `holder` owns.
    pub fn donate(
        &self,
        threads: &mut ThreadTable,
        locks: &Arena<Lock, MAX_LOCKS>,
        requester: ThreadId,
        holder: ThreadId,
    ) {
        // A holder that has exited is no longer there to donate to.
        if threads.get(holder).is_none() {
            return;
        }
        let donated = threads.priority(requester);
        if threads.priority(holder) < donated {
            threads.set_effective(holder, donated);
        }
        add_donor(threads, holder, requester);
        debug!("thread {} donates {} to thread {}", requester, donated, holder);

        // Walk the wait-for chain. Every hop raises a thread to `donated`
        // and the walk stops at the first thread already there, so it ends
        // within one lap even if the chain loops back on itself.
        let mut link = holder;
        while let Some(lock) = threads.get(link).and_then(|t| t.waiting_for_lock) {
            let Some(next) = locks.get(lock.key()).and_then(|l| l.holder) else {
                break;
            };
            if threads.get(next).is_none() || threads.priority(next) >= donated {
                break;
            }
            threads.set_effective(next, donated);
            link = next;
        }

        threads.recompute(holder);
    }

    /// Waiters still queued on a lock that `holder` just acquired now donate
    /// to it.
    pub fn adopt(&self, threads: &mut ThreadTable, waiters: &WaitList, holder: ThreadId) {
        if waiters.is_empty() {
            return;
        }
        for waiter in waiters.iter() {
            add_donor(threads, holder, waiter);
        }
        threads.recompute(holder);
    }

    /// Drop every donation `holder` received through `lock`.
    pub fn revoke(&self, threads: &mut ThreadTable, lock: LockId, holder: ThreadId) {
        let mut donors = core::mem::take(&mut threads.thread_mut(holder).donors);
        donors.retain(|d| {
            threads
                .get(*d)
                .is_some_and(|t| t.waiting_for_lock != Some(lock))
        });
        threads.thread_mut(holder).donors = donors;
        threads.recompute(holder);
    }

    /// A new base priority takes effect unless donations keep the
    /// effective priority higher.
    pub fn set_priority(&self, threads: &mut ThreadTable, id: ThreadId, priority: u8) {
        threads.thread_mut(id).base_priority = priority;
        threads.recompute(id);
    }
}

fn add_donor(threads: &mut ThreadTable, holder: ThreadId, donor: ThreadId) {
    let donors = &mut threads.thread_mut(holder).donors;
    if !donors.contains(&donor) && donors.push(donor).is_err() {
        panic!("donor set of thread {} overflowed", holder);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
