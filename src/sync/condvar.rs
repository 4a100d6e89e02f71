//! Mesa-style condition variable.
//!
//! Each waiter parks on a private semaphore that starts at zero. `signal`
//! picks the waiter whose thread has the highest priority right now and
//! raises its semaphore. Being woken says nothing about the predicate: the
//! waiter re-acquires the lock and must check again.

use heapless::Vec;

use crate::arena::Key;
use crate::config::MAX_THREADS;
use crate::error::{KernelError, KernelResult};
use crate::scheduler::Scheduler;
use crate::thread::ThreadId;

use super::{LockId, SemaphoreId, Wait};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConditionId(Key);

#[derive(Debug, Clone, Copy)]
struct CondWaiter {
    sema: SemaphoreId,
    thread: ThreadId,
}

#[derive(Default)]
pub struct Condition {
    waiters: Vec<CondWaiter, MAX_THREADS>,
}

impl Condition {
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }
}

/// A wait in progress: the private semaphore to finish on and the lock to
/// take back afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CondTicket {
    pub(crate) sema: SemaphoreId,
    pub lock: LockId,
}

impl Scheduler {
    pub fn cond_create(&mut self) -> KernelResult<ConditionId> {
        self.conditions
            .insert(Condition::default())
            .map(ConditionId)
            .ok_or(KernelError::ConditionLimit)
    }

    pub fn cond_destroy(&mut self, id: ConditionId) -> KernelResult<()> {
        if self.condition(id).waiting() > 0 {
            return Err(KernelError::Busy);
        }
        self.conditions.remove(id.0);
        Ok(())
    }

    fn condition(&self, id: ConditionId) -> &Condition {
        match self.conditions.get(id.0) {
            Some(cond) => cond,
            None => panic!("stale condition handle {:?}", id),
        }
    }

    fn condition_mut(&mut self, id: ConditionId) -> &mut Condition {
        match self.conditions.get_mut(id.0) {
            Some(cond) => cond,
            None => panic!("stale condition handle {:?}", id),
        }
    }

    /// Release `lock` and block until signalled. Always blocks; finish with
    /// [`cond_resume`](Self::cond_resume) and then re-acquire the lock.
    pub fn cond_wait(&mut self, id: ConditionId, lock: LockId) -> CondTicket {
        assert!(!self.in_interrupt(), "cond_wait in interrupt context");
        assert!(
            self.lock_held_by_current(lock),
            "cond_wait without holding lock {:?}",
            lock
        );
        let current = self.current();
        let sema = match self.sema_alloc(0) {
            Ok(sema) => sema,
            Err(_) => panic!("no semaphore left for a condition waiter"),
        };
        if self
            .condition_mut(id)
            .waiters
            .push(CondWaiter {
                sema,
                thread: current,
            })
            .is_err()
        {
            panic!("condition {:?} waiter list overflow", id);
        }

        // Nobody may run between releasing the lock and parking.
        self.suspend_preemption();
        self.lock_release(lock);
        self.release_preemption_hold();

        let parked = self.sema_down(sema);
        debug_assert_eq!(parked, Wait::Blocked);
        CondTicket { sema, lock }
    }

    /// Finish a wait once signalled. Does not re-acquire the lock.
    pub fn cond_resume(&mut self, ticket: CondTicket) -> Wait {
        let outcome = self.sema_down(ticket.sema);
        if outcome == Wait::Done {
            let _ = self.sema_free(ticket.sema);
        }
        outcome
    }

    /// Wake the highest-priority waiter, if any.
    pub fn cond_signal(&mut self, id: ConditionId, lock: LockId) {
        assert!(
            self.lock_held_by_current(lock),
            "cond_signal without holding lock {:?}",
            lock
        );
        let cond = match self.conditions.get_mut(id.0) {
            Some(cond) => cond,
            None => panic!("stale condition handle {:?}", id),
        };
        let threads = &self.threads;
        let mut best: Option<(usize, u8)> = None;
        for (i, waiter) in cond.waiters.iter().enumerate() {
            let p = threads.priority(waiter.thread);
            if best.map_or(true, |(_, bp)| p > bp) {
                best = Some((i, p));
            }
        }
        if let Some((i, _)) = best {
            let waiter = cond.waiters.remove(i);
            self.sema_up(waiter.sema);
        }
    }

    /// Wake every waiter.
    pub fn cond_broadcast(&mut self, id: ConditionId, lock: LockId) {
        self.suspend_preemption();
        while self.condition(id).waiting() > 0 {
            self.cond_signal(id, lock);
        }
        self.resume_preemption();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::config::BootConfig;
    use crate::scheduler::Scheduler;
    use crate::sync::{CondTicket, ConditionId, LockId, Wait};
    use crate::thread::ThreadId;

    fn started() -> Scheduler {
        let mut s = Scheduler::new(BootConfig::default());
        s.start().unwrap();
        s
    }

    /// Spawn a thread that preempts main, takes `lock` and waits on `cond`.
    fn park(
        s: &mut Scheduler,
        name: &str,
        priority: u8,
        cond: ConditionId,
        lock: LockId,
    ) -> (ThreadId, CondTicket) {
        let t = s.create(name, priority).unwrap();
        assert_eq!(s.current(), t);
        assert_eq!(s.lock_acquire(lock), Wait::Done);
        let ticket = s.cond_wait(cond, lock);
        assert_eq!(s.lock_holder(lock), None);
        (t, ticket)
    }

    #[test]
    fn test_signal_wakes_highest_priority_waiter() {
        let mut s = started();
        let main = s.current();
        let lock = s.lock_create().unwrap();
        let cond = s.cond_create().unwrap();

        let (_a, _) = park(&mut s, "a", 35, cond, lock);
        let (b, ticket_b) = park(&mut s, "b", 40, cond, lock);
        let (_c, _) = park(&mut s, "c", 38, cond, lock);
        assert_eq!(s.current(), main);

        assert_eq!(s.lock_acquire(lock), Wait::Done);
        s.cond_signal(cond, lock);
        assert_eq!(s.current(), b);

        // Mesa semantics: woken, but the lock is still main's
        assert_eq!(s.cond_resume(ticket_b), Wait::Done);
        assert_eq!(s.lock_acquire(lock), Wait::Blocked);
        assert_eq!(s.current(), main);
        assert_eq!(s.get_priority(), 40);

        s.lock_release(lock);
        assert_eq!(s.current(), b);
        assert_eq!(s.lock_acquire(lock), Wait::Done);
        assert_eq!(s.lock_holder(lock), Some(b));
    }

    #[test]
    fn test_signal_without_waiters_is_noop() {
        let mut s = started();
        let main = s.current();
        let lock = s.lock_create().unwrap();
        let cond = s.cond_create().unwrap();
        assert_eq!(s.lock_acquire(lock), Wait::Done);
        s.cond_signal(cond, lock);
        assert_eq!(s.current(), main);
        assert_eq!(s.cond_destroy(cond), Ok(()));
    }

    #[test]
    fn test_broadcast_wakes_all_then_best_runs() {
        let mut s = started();
        let main = s.current();
        let lock = s.lock_create().unwrap();
        let cond = s.cond_create().unwrap();

        let (a, _) = park(&mut s, "a", 35, cond, lock);
        let (b, _) = park(&mut s, "b", 40, cond, lock);

        assert_eq!(s.lock_acquire(lock), Wait::Done);
        s.cond_broadcast(cond, lock);
        assert_eq!(s.current(), b);
        assert_eq!(s.thread(a).unwrap().status(), crate::thread::ThreadStatus::Ready);
        assert_eq!(s.thread(main).unwrap().status(), crate::thread::ThreadStatus::Ready);
    }

    #[test]
    #[should_panic(expected = "without holding lock")]
    fn test_wait_without_lock_is_fatal() {
        let mut s = started();
        let lock = s.lock_create().unwrap();
        let cond = s.cond_create().unwrap();
        s.cond_wait(cond, lock);
    }
}
