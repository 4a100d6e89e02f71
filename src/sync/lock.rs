//! Non-recursive lock with an owner, built on a binary semaphore.
//!
//! Contention triggers priority donation and release revokes it, both
//! through the active [`Policy`](crate::policy::Policy).

use log::debug;

use crate::arena::Key;
use crate::error::{KernelError, KernelResult};
use crate::scheduler::Scheduler;
use crate::thread::ThreadId;

use super::{SemaphoreId, Wait};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId(Key);

impl LockId {
    pub(crate) const fn key(self) -> Key {
        self.0
    }
}

pub struct Lock {
    pub(crate) sema: SemaphoreId,
    /// Thread that last took the semaphore and has not released it.
    pub(crate) holder: Option<ThreadId>,
}

impl Scheduler {
    pub fn lock_create(&mut self) -> KernelResult<LockId> {
        if self.locks.is_full() {
            return Err(KernelError::LockLimit);
        }
        let sema = self.sema_alloc(1)?;
        match self.locks.insert(Lock { sema, holder: None }) {
            Some(key) => Ok(LockId(key)),
            None => {
                self.semaphores.remove(sema.key());
                Err(KernelError::LockLimit)
            }
        }
    }

    pub fn lock_destroy(&mut self, id: LockId) -> KernelResult<()> {
        let lock = self.lock(id);
        if lock.holder.is_some() {
            return Err(KernelError::Busy);
        }
        let sema = lock.sema;
        self.sema_free(sema)?;
        self.locks.remove(id.0);
        Ok(())
    }

    pub(crate) fn lock(&self, id: LockId) -> &Lock {
        match self.locks.get(id.0) {
            Some(lock) => lock,
            None => panic!("stale lock handle {:?}", id),
        }
    }

    /// Take the lock, or donate to its holder and block.
    pub fn lock_acquire(&mut self, id: LockId) -> Wait {
        assert!(!self.in_interrupt(), "lock_acquire in interrupt context");
        let current = self.current();
        let lock = self.lock(id);
        assert_ne!(
            lock.holder,
            Some(current),
            "thread {} acquiring lock {:?} it already holds",
            current,
            id
        );
        let (sema, holder) = (lock.sema, lock.holder);

        if self.sema_try_down(sema) {
            self.take_ownership(id, current);
            return Wait::Done;
        }

        self.threads.thread_mut(current).waiting_for_lock = Some(id);
        if let Some(holder) = holder {
            debug!("thread {} blocks on lock {:?} held by {}", current, id, holder);
            self.policy
                .lock_contended(&mut self.threads, &self.locks, current, holder);
        }
        self.sema_down(sema)
    }

    /// Take the lock only if it is free.
    pub fn lock_try_acquire(&mut self, id: LockId) -> bool {
        let current = self.current();
        let lock = self.lock(id);
        assert_ne!(
            lock.holder,
            Some(current),
            "thread {} acquiring lock {:?} it already holds",
            current,
            id
        );
        let sema = lock.sema;
        if !self.sema_try_down(sema) {
            return false;
        }
        self.take_ownership(id, current);
        true
    }

    fn take_ownership(&mut self, id: LockId, current: ThreadId) {
        let sema = self.lock(id).sema;
        self.threads.thread_mut(current).waiting_for_lock = None;
        if let Some(lock) = self.locks.get_mut(id.0) {
            lock.holder = Some(current);
        }
        let waiters = match self.semaphores.get(sema.key()) {
            Some(sema) => &sema.waiters,
            None => panic!("lock {:?} lost its semaphore", id),
        };
        self.policy.lock_acquired(&mut self.threads, waiters, current);
    }

    /// Release a lock the current thread holds. The semaphore is raised,
    /// donations through this lock are revoked and the holder cleared with
    /// preemption held off, so the woken waiter runs only afterwards.
    pub fn lock_release(&mut self, id: LockId) {
        let current = self.current();
        let lock = self.lock(id);
        assert_eq!(
            lock.holder,
            Some(current),
            "thread {} releasing lock {:?} it does not hold",
            current,
            id
        );
        let sema = lock.sema;

        self.suspend_preemption();
        self.sema_up(sema);
        self.policy.lock_released(&mut self.threads, id, current);
        if let Some(lock) = self.locks.get_mut(id.0) {
            lock.holder = None;
        }
        self.resume_preemption();
    }

    pub fn lock_held_by_current(&self, id: LockId) -> bool {
        self.lock(id).holder == Some(self.current())
    }

    pub fn lock_holder(&self, id: LockId) -> Option<ThreadId> {
        self.lock(id).holder
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::config::BootConfig;
    use crate::error::KernelError;
    use crate::scheduler::Scheduler;
    use crate::sync::Wait;

    fn started() -> Scheduler {
        let mut s = Scheduler::new(BootConfig::default());
        s.start().unwrap();
        s
    }

    #[test]
    fn test_acquire_release_uncontended() {
        let mut s = started();
        let main = s.current();
        let lock = s.lock_create().unwrap();

        assert_eq!(s.lock_acquire(lock), Wait::Done);
        assert_eq!(s.lock_holder(lock), Some(main));
        assert!(s.lock_held_by_current(lock));

        s.lock_release(lock);
        assert_eq!(s.lock_holder(lock), None);
        assert!(s.lock_try_acquire(lock));
        s.lock_release(lock);
    }

    #[test]
    fn test_try_acquire_on_contention() {
        let mut s = started();
        let main = s.current();
        let lock = s.lock_create().unwrap();
        assert_eq!(s.lock_acquire(lock), Wait::Done);

        let other = s.create("other", 40).unwrap();
        assert_eq!(s.current(), other);
        assert!(!s.lock_try_acquire(lock));
        assert_eq!(s.lock_holder(lock), Some(main));
        // try_acquire never donates
        assert_eq!(s.thread(main).unwrap().priority(), 31);
    }

    #[test]
    fn test_waiter_acquires_after_release() {
        let mut s = started();
        let main = s.current();
        let lock = s.lock_create().unwrap();
        assert_eq!(s.lock_acquire(lock), Wait::Done);

        let waiter = s.create("waiter", 40).unwrap();
        assert_eq!(s.lock_acquire(lock), Wait::Blocked);
        assert_eq!(s.current(), main);
        assert_eq!(s.thread(waiter).unwrap().waiting_for_lock(), Some(lock));

        s.lock_release(lock);
        assert_eq!(s.current(), waiter);
        assert_eq!(s.lock_acquire(lock), Wait::Done);
        assert_eq!(s.lock_holder(lock), Some(waiter));
        assert_eq!(s.thread(waiter).unwrap().waiting_for_lock(), None);
    }

    #[test]
    fn test_destroy_held_lock_is_busy() {
        let mut s = started();
        let lock = s.lock_create().unwrap();
        assert_eq!(s.lock_acquire(lock), Wait::Done);
        assert_eq!(s.lock_destroy(lock), Err(KernelError::Busy));
        s.lock_release(lock);
        assert_eq!(s.lock_destroy(lock), Ok(()));
    }

    #[test]
    #[should_panic(expected = "already holds")]
    fn test_reentrant_acquire_is_fatal() {
        let mut s = started();
        let lock = s.lock_create().unwrap();
        assert_eq!(s.lock_acquire(lock), Wait::Done);
        s.lock_acquire(lock);
    }

    #[test]
    #[should_panic(expected = "does not hold")]
    fn test_double_release_is_fatal() {
        let mut s = started();
        let lock = s.lock_create().unwrap();
        assert_eq!(s.lock_acquire(lock), Wait::Done);
        s.lock_release(lock);
        s.lock_release(lock);
    }

    #[test]
    #[should_panic(expected = "does not hold")]
    fn test_release_by_non_holder_is_fatal() {
        let mut s = started();
        let lock = s.lock_create().unwrap();
        assert_eq!(s.lock_acquire(lock), Wait::Done);
        s.create("intruder", 40).unwrap();
        s.lock_release(lock);
    }
}
