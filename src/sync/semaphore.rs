//! Counting semaphore.

use log::trace;

use crate::arena::Key;
use crate::config::MAX_SEMAPHORES;
use crate::error::{KernelError, KernelResult};
use crate::queue::WaitList;
use crate::scheduler::Scheduler;

use super::Wait;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreId(Key);

impl SemaphoreId {
    pub(crate) const fn key(self) -> Key {
        self.0
    }
}

/// A non-negative counter and the threads blocked waiting for it to
/// become positive.
pub struct Semaphore {
    pub(crate) value: u32,
    pub(crate) waiters: WaitList,
}

impl Semaphore {
    pub const fn new(value: u32) -> Self {
        Self {
            value,
            waiters: WaitList::new(),
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }
}

impl Scheduler {
    /// Create a semaphore for kernel code.
    pub fn sema_create(&mut self, value: u32) -> KernelResult<SemaphoreId> {
        if self.user_semaphores >= MAX_SEMAPHORES {
            return Err(KernelError::SemaphoreLimit);
        }
        let id = self.sema_alloc(value)?;
        self.user_semaphores += 1;
        Ok(id)
    }

    pub fn sema_destroy(&mut self, id: SemaphoreId) -> KernelResult<()> {
        self.sema_free(id)?;
        self.user_semaphores -= 1;
        Ok(())
    }

    /// Semaphore for internal use (locks, condition waiters); not counted
    /// against the user limit.
    pub(crate) fn sema_alloc(&mut self, value: u32) -> KernelResult<SemaphoreId> {
        self.semaphores
            .insert(Semaphore::new(value))
            .map(SemaphoreId)
            .ok_or(KernelError::SemaphoreLimit)
    }

    pub(crate) fn sema_free(&mut self, id: SemaphoreId) -> KernelResult<()> {
        if !self.semaphore(id).waiters.is_empty() {
            return Err(KernelError::Busy);
        }
        self.semaphores.remove(id.0);
        Ok(())
    }

    pub(crate) fn semaphore(&self, id: SemaphoreId) -> &Semaphore {
        match self.semaphores.get(id.0) {
            Some(sema) => sema,
            None => panic!("stale semaphore handle {:?}", id),
        }
    }

    pub(crate) fn semaphore_mut(&mut self, id: SemaphoreId) -> &mut Semaphore {
        match self.semaphores.get_mut(id.0) {
            Some(sema) => sema,
            None => panic!("stale semaphore handle {:?}", id),
        }
    }

    /// Decrement, or block until an `up` makes that possible.
    pub fn sema_down(&mut self, id: SemaphoreId) -> Wait {
        assert!(!self.in_interrupt(), "sema_down in interrupt context");
        let current = self.current();
        let sema = self.semaphore_mut(id);
        if sema.value > 0 {
            sema.value -= 1;
            return Wait::Done;
        }
        sema.waiters.push(current);
        self.block();
        Wait::Blocked
    }

    /// Decrement if positive. Safe in interrupt context.
    pub fn sema_try_down(&mut self, id: SemaphoreId) -> bool {
        let sema = self.semaphore_mut(id);
        if sema.value > 0 {
            sema.value -= 1;
            true
        } else {
            false
        }
    }

    /// Increment and wake the highest-priority waiter. Safe in interrupt
    /// context; never blocks.
    pub fn sema_up(&mut self, id: SemaphoreId) {
        let sema = match self.semaphores.get_mut(id.0) {
            Some(sema) => sema,
            None => panic!("stale semaphore handle {:?}", id),
        };
        let threads = &self.threads;
        let woken = sema.waiters.pop_max(|t| threads.priority(t));
        sema.value += 1;

        if let Some(thread) = woken {
            trace!("sema_up wakes thread {}", thread);
            self.unblock(thread);
        }
    }

    pub fn sema_value(&self, id: SemaphoreId) -> u32 {
        self.semaphore(id).value
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
    fn test_down_up_without_contention() {
        let mut s = started();
        let sema = s.sema_create(2).unwrap();
        assert_eq!(s.sema_down(sema), Wait::Done);
        assert_eq!(s.sema_down(sema), Wait::Done);
        assert_eq!(s.sema_value(sema), 0);
        assert!(!s.sema_try_down(sema));
        s.sema_up(sema);
        assert!(s.sema_try_down(sema));
    }

    #[test]
    fn test_up_wakes_highest_priority_waiter() {
        let mut s = started();
        let main = s.current();
        let sema = s.sema_create(0).unwrap();

        let low = s.create("low", 35).unwrap();
        assert_eq!(s.sema_down(sema), Wait::Blocked);
        let high = s.create("high", 45).unwrap();
        assert_eq!(s.sema_down(sema), Wait::Blocked);
        let mid = s.create("mid", 40).unwrap();
        assert_eq!(s.sema_down(sema), Wait::Blocked);
        assert_eq!(s.current(), main);

        s.sema_up(sema);
        assert_eq!(s.current(), high);
        assert_eq!(s.sema_down(sema), Wait::Done);
        s.exit(0);
        assert_eq!(s.current(), main);

        s.sema_up(sema);
        assert_eq!(s.current(), mid);
        assert_eq!(s.sema_down(sema), Wait::Done);
        s.exit(0);
        assert_eq!(s.current(), main);

        s.sema_up(sema);
        assert_eq!(s.current(), low);
    }

    #[test]
    fn test_up_in_interrupt_defers_switch() {
        let mut s = started();
        let main = s.current();
        let sema = s.sema_create(0).unwrap();
        let waiter = s.create("waiter", 50).unwrap();
        assert_eq!(s.sema_down(sema), Wait::Blocked);

        s.enter_interrupt();
        s.sema_up(sema);
        assert_eq!(s.current(), main);
        s.leave_interrupt();
        assert_eq!(s.current(), waiter);
        assert_eq!(s.sema_down(sema), Wait::Done);
    }

    #[test]
    fn test_destroy_with_waiters_is_busy() {
        let mut s = started();
        let sema = s.sema_create(0).unwrap();
        s.create("waiter", 50).unwrap();
        assert_eq!(s.sema_down(sema), Wait::Blocked);
        assert_eq!(s.sema_destroy(sema), Err(KernelError::Busy));

        s.sema_up(sema);
        assert_eq!(s.sema_down(sema), Wait::Done);
        assert_eq!(s.sema_destroy(sema), Ok(()));
    }

    #[test]
    #[should_panic(expected = "sema_down in interrupt context")]
    fn test_down_in_interrupt_is_fatal() {
        let mut s = started();
        let sema = s.sema_create(1).unwrap();
        s.enter_interrupt();
        s.sema_down(sema);
    }
}
