//! # Kernel
//!
//! Public API of DonOS. [`Kernel`] pairs the [`Scheduler`] state machine
//! with a [`Port`] and turns its transitions into real blocking calls:
//! every call runs one transition with interrupts disabled, hands any
//! resulting switch to the port, and repeats the transition if the caller
//! was blocked and has to retry.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset / host test
//!   └─► Kernel::new(port, config)   ← executing code becomes thread "main"
//!         └─► Kernel::start()       ← idle thread, timer
//!               └─► Kernel::create() (×N) ─► threads run by priority
//! ```

use core::cell::UnsafeCell;

use log::info;

use crate::arch::Port;
use crate::config::BootConfig;
use crate::error::KernelResult;
use crate::scheduler::{Scheduler, TickStats};
use crate::sync::{ConditionId, LockId, SemaphoreId, Wait};
use crate::thread::ThreadId;

// ---------------------------------------------------------------------------
// Thread entry
// ---------------------------------------------------------------------------

/// Where a new thread starts. Ports store it in the thread's initial
/// context and call [`Entry::run`] on the new stack.
pub struct Entry<P: Port> {
    kernel: &'static Kernel<P>,
    func: fn(&'static Kernel<P>, usize),
    arg: usize,
}

impl<P: Port> Clone for Entry<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Port> Copy for Entry<P> {}

impl<P: Port> Entry<P> {
    pub fn kernel(&self) -> &'static Kernel<P> {
        self.kernel
    }

    /// Run the thread body, then exit with status 0.
    pub fn run(self) -> ! {
        (self.func)(self.kernel, self.arg);
        self.kernel.exit(0)
    }
}

fn idle_loop<P: Port>(kernel: &'static Kernel<P>, _: usize) {
    loop {
        kernel.port.wait_for_interrupt(&|| kernel.timer_interrupt());
    }
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

pub struct Kernel<P: Port> {
    port: P,
    sched: UnsafeCell<Scheduler>,
}

// SAFETY: the scheduler is only touched inside `port.without_interrupts`,
// by the one thread the scheduler considers current or by an interrupt
// handler that preempted it.
unsafe impl<P: Port> Sync for Kernel<P> {}

impl<P: Port> Kernel<P> {
    pub fn new(port: P, config: BootConfig) -> Self {
        let sched = Scheduler::new(config);
        port.adopt(sched.initial_thread());
        Self {
            port,
            sched: UnsafeCell::new(sched),
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    /// One scheduler transition, followed by the switch it decided on.
    pub(crate) fn transition<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> R {
        self.port.without_interrupts(|| {
            let (out, switch, reclaimed) = {
                // SAFETY: interrupts are off; see `impl Sync`.
                let sched = unsafe { &mut *self.sched.get() };
                let out = f(sched);
                (out, sched.take_switch(), sched.take_reclaimed())
            };
            for thread in reclaimed {
                self.port.release(thread);
            }
            if let Some(switch) = switch {
                self.port.switch(switch);
            }
            out
        })
    }

    /// Repeat a blocking transition until it completes.
    fn wait(&self, mut op: impl FnMut(&mut Scheduler) -> Wait) {
        while self.transition(&mut op) == Wait::Blocked {}
    }

    /// Read-only view of the scheduler.
    pub fn inspect<R>(&self, f: impl FnOnce(&Scheduler) -> R) -> R {
        self.port.without_interrupts(|| {
            // SAFETY: interrupts are off; see `impl Sync`.
            f(unsafe { &*self.sched.get() })
        })
    }

    /// Create the idle thread and start the tick source.
    pub fn start(&'static self) -> KernelResult<()> {
        let idle = self.transition(|s| s.start())?;
        let entry = Entry {
            kernel: self,
            func: idle_loop::<P>,
            arg: 0,
        };
        self.port
            .without_interrupts(|| self.port.prepare(idle, "idle", entry))?;

        let config = self.inspect(|s| s.config());
        self.port.start_timer(config.timer_freq);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Threads
    // -----------------------------------------------------------------------

    /// Start `func(kernel, arg)` in a new thread. The new thread runs at
    /// once if it outranks the caller.
    pub fn create(
        &'static self,
        name: &str,
        priority: u8,
        func: fn(&'static Kernel<P>, usize),
        arg: usize,
    ) -> KernelResult<ThreadId> {
        let id = self.transition(|s| s.create_blocked(name, priority))?;
        let entry = Entry {
            kernel: self,
            func,
            arg,
        };
        let prepared = self
            .port
            .without_interrupts(|| self.port.prepare(id, name, entry));
        if let Err(err) = prepared {
            self.transition(|s| s.discard(id));
            return Err(err);
        }
        self.transition(|s| s.unblock(id));
        Ok(id)
    }

    /// Sleep until another thread or an interrupt handler calls
    /// [`unblock`](Self::unblock).
    pub fn block(&self) {
        self.transition(|s| s.block());
    }

    pub fn unblock(&self, thread: ThreadId) {
        self.transition(|s| s.unblock(thread));
    }

    pub fn yield_now(&self) {
        self.transition(|s| s.yield_current());
    }

    pub fn exit(&self, status: i32) -> ! {
        self.transition(|s| s.exit(status));
        self.port.exit_context()
    }

    pub fn current(&self) -> ThreadId {
        let id = self.inspect(|s| s.current());
        assert!(self.port.stack_ok(id), "stack overflow in thread {}", id);
        id
    }

    pub fn get_priority(&self) -> u8 {
        self.inspect(|s| s.get_priority())
    }

    pub fn set_priority(&self, priority: u8) {
        self.transition(|s| s.set_priority(priority));
    }

    pub fn get_nice(&self) -> i32 {
        self.inspect(|s| s.get_nice())
    }

    pub fn set_nice(&self, nice: i32) {
        self.transition(|s| s.set_nice(nice));
    }

    pub fn get_load_avg(&self) -> i32 {
        self.inspect(|s| s.get_load_avg())
    }

    pub fn get_recent_cpu(&self) -> i32 {
        self.inspect(|s| s.get_recent_cpu())
    }

    pub fn mark_user(&self, thread: ThreadId) {
        self.transition(|s| s.mark_user(thread));
    }

    pub fn set_payload(&self, thread: ThreadId, payload: usize) {
        self.transition(|s| s.set_payload(thread, payload));
    }

    // -----------------------------------------------------------------------
    // Time
    // -----------------------------------------------------------------------

    pub fn ticks(&self) -> u64 {
        self.inspect(|s| s.ticks())
    }

    pub fn sleep_until(&self, wakeup: u64) {
        self.wait(|s| s.sleep_until(wakeup));
    }

    /// Sleep for at least `ticks` timer ticks.
    pub fn sleep(&self, ticks: u64) {
        if ticks == 0 {
            return;
        }
        let wakeup = self.ticks() + ticks;
        self.sleep_until(wakeup);
    }

    /// Timer interrupt handler body.
    pub fn timer_interrupt(&self) {
        self.transition(|s| s.timer_interrupt());
    }

    /// Run a device interrupt handler. Wake-ups inside `f` that call for
    /// preemption take effect when it returns.
    pub fn interrupt<R>(&self, f: impl FnOnce() -> R) -> R {
        self.transition(|s| s.enter_interrupt());
        let out = f();
        self.transition(|s| s.leave_interrupt());
        out
    }

    pub fn stats(&self) -> TickStats {
        self.inspect(|s| s.stats())
    }

    pub fn print_stats(&self) {
        let stats = self.stats();
        info!(
            "Thread: {} idle ticks, {} kernel ticks, {} user ticks, {} switches",
            stats.idle_ticks, stats.kernel_ticks, stats.user_ticks, stats.switches
        );
    }

    // -----------------------------------------------------------------------
    // Semaphores
    // -----------------------------------------------------------------------

    pub fn sema_create(&self, value: u32) -> KernelResult<SemaphoreId> {
        self.transition(|s| s.sema_create(value))
    }

    pub fn sema_destroy(&self, sema: SemaphoreId) -> KernelResult<()> {
        self.transition(|s| s.sema_destroy(sema))
    }

    pub fn sema_down(&self, sema: SemaphoreId) {
        self.wait(|s| s.sema_down(sema));
    }

    pub fn sema_try_down(&self, sema: SemaphoreId) -> bool {
        self.transition(|s| s.sema_try_down(sema))
    }

    pub fn sema_up(&self, sema: SemaphoreId) {
        self.transition(|s| s.sema_up(sema));
    }

    // -----------------------------------------------------------------------
    // Locks
    // -----------------------------------------------------------------------

    pub fn lock_create(&self) -> KernelResult<LockId> {
        self.transition(|s| s.lock_create())
    }

    pub fn lock_destroy(&self, lock: LockId) -> KernelResult<()> {
        self.transition(|s| s.lock_destroy(lock))
    }

    pub fn lock_acquire(&self, lock: LockId) {
        self.wait(|s| s.lock_acquire(lock));
    }

    pub fn lock_try_acquire(&self, lock: LockId) -> bool {
        self.transition(|s| s.lock_try_acquire(lock))
    }

    pub fn lock_release(&self, lock: LockId) {
        self.transition(|s| s.lock_release(lock));
    }

    pub fn lock_held_by_current(&self, lock: LockId) -> bool {
        self.inspect(|s| s.lock_held_by_current(lock))
    }

    // -----------------------------------------------------------------------
    // Condition variables
    // -----------------------------------------------------------------------

    pub fn cond_create(&self) -> KernelResult<ConditionId> {
        self.transition(|s| s.cond_create())
    }

    pub fn cond_destroy(&self, cond: ConditionId) -> KernelResult<()> {
        self.transition(|s| s.cond_destroy(cond))
    }

    /// Release `lock`, wait for a signal, take `lock` back.
    pub fn cond_wait(&self, cond: ConditionId, lock: LockId) {
        let ticket = self.transition(|s| s.cond_wait(cond, lock));
        self.wait(|s| s.cond_resume(ticket));
        self.lock_acquire(lock);
    }

    pub fn cond_signal(&self, cond: ConditionId, lock: LockId) {
        self.transition(|s| s.cond_signal(cond, lock));
    }

    pub fn cond_broadcast(&self, cond: ConditionId, lock: LockId) {
        self.transition(|s| s.cond_broadcast(cond, lock));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use core::sync::atomic::{AtomicU32, Ordering};
    use std::boxed::Box;

    use spin::Once;

    use super::*;
    use crate::arch::host::HostPort;
    use crate::config::PolicyKind;
    use crate::scheduler::Switch;

    pub(crate) fn boot(policy: PolicyKind) -> &'static Kernel<HostPort> {
        let kernel: &'static Kernel<HostPort> =
            Box::leak(Box::new(Kernel::new(HostPort::new(), BootConfig::new(policy))));
        kernel.start().unwrap();
        kernel
    }

    #[test]
    fn test_semaphore_handoff() {
        static SEMA: Once<SemaphoreId> = Once::new();
        static STAGE: AtomicU32 = AtomicU32::new(0);

        fn waiter(k: &'static Kernel<HostPort>, _: usize) {
            STAGE.store(1, Ordering::SeqCst);
            k.sema_down(*SEMA.get().unwrap());
            STAGE.store(2, Ordering::SeqCst);
        }

        let k = boot(PolicyKind::Priority);
        SEMA.call_once(|| k.sema_create(0).unwrap());

        k.create("waiter", 40, waiter, 0).unwrap();
        assert_eq!(STAGE.load(Ordering::SeqCst), 1);

        k.sema_up(*SEMA.get().unwrap());
        assert_eq!(STAGE.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_priority_donation_through_lock() {
        static LOCK: Once<LockId> = Once::new();
        static SEEN: AtomicU32 = AtomicU32::new(0);

        fn high(k: &'static Kernel<HostPort>, _: usize) {
            let lock = *LOCK.get().unwrap();
            k.lock_acquire(lock);
            SEEN.store(u32::from(k.get_priority()), Ordering::SeqCst);
            k.lock_release(lock);
        }

        let k = boot(PolicyKind::Priority);
        let lock = *LOCK.call_once(|| k.lock_create().unwrap());
        k.set_priority(20);
        k.lock_acquire(lock);

        k.create("high", 40, high, 0).unwrap();
        assert_eq!(k.get_priority(), 40);

        k.lock_release(lock);
        assert_eq!(SEEN.load(Ordering::SeqCst), 40);
        assert_eq!(k.get_priority(), 20);
    }

    #[test]
    fn test_sleep_woken_by_idle_ticks() {
        let k = boot(PolicyKind::Priority);
        let start = k.ticks();
        k.sleep(5);
        assert!(k.ticks() >= start + 5);
        assert!(k.stats().idle_ticks >= 5);
    }

    #[test]
    fn test_condition_signal_hands_over_value() {
        static LOCK: Once<LockId> = Once::new();
        static COND: Once<ConditionId> = Once::new();
        static VALUE: AtomicU32 = AtomicU32::new(0);
        static GOT: AtomicU32 = AtomicU32::new(0);

        fn consumer(k: &'static Kernel<HostPort>, _: usize) {
            let (lock, cond) = (*LOCK.get().unwrap(), *COND.get().unwrap());
            k.lock_acquire(lock);
            while VALUE.load(Ordering::SeqCst) == 0 {
                k.cond_wait(cond, lock);
            }
            GOT.store(VALUE.load(Ordering::SeqCst), Ordering::SeqCst);
            k.lock_release(lock);
        }

        let k = boot(PolicyKind::Priority);
        let lock = *LOCK.call_once(|| k.lock_create().unwrap());
        let cond = *COND.call_once(|| k.cond_create().unwrap());

        k.create("consumer", 40, consumer, 0).unwrap();
        assert_eq!(GOT.load(Ordering::SeqCst), 0);

        k.lock_acquire(lock);
        VALUE.store(7, Ordering::SeqCst);
        k.cond_signal(cond, lock);
        k.lock_release(lock);
        assert_eq!(GOT.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_arguments_and_exit_reclaim() {
        static SUM: AtomicU32 = AtomicU32::new(0);

        fn add(_: &'static Kernel<HostPort>, arg: usize) {
            SUM.fetch_add(arg as u32, Ordering::SeqCst);
        }

        let k = boot(PolicyKind::Priority);
        for n in 1..=20 {
            k.create("adder", 40, add, n).unwrap();
        }
        // more threads than slots: exited ones were reclaimed along the way
        assert_eq!(SUM.load(Ordering::SeqCst), 210);
    }

    #[test]
    fn test_equal_priority_threads_take_turns() {
        static TURNS: AtomicU32 = AtomicU32::new(0);

        fn taker(k: &'static Kernel<HostPort>, _: usize) {
            for _ in 0..3 {
                TURNS.fetch_add(1, Ordering::SeqCst);
                k.yield_now();
            }
        }

        let k = boot(PolicyKind::Priority);
        k.create("a", 31, taker, 0).unwrap();
        k.create("b", 31, taker, 0).unwrap();
        assert_eq!(TURNS.load(Ordering::SeqCst), 0);

        while TURNS.load(Ordering::SeqCst) < 6 {
            k.yield_now();
        }
        assert_eq!(k.current(), k.inspect(|s| s.initial_thread()));
    }

    /// Runs nothing; counts contexts prepared while interrupts were on.
    struct Recorder {
        masked: AtomicU32,
        prepared: AtomicU32,
        unmasked: AtomicU32,
    }

    impl Port for Recorder {
        fn adopt(&self, _: ThreadId) {}

        fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R {
            self.masked.fetch_add(1, Ordering::SeqCst);
            let out = f();
            self.masked.fetch_sub(1, Ordering::SeqCst);
            out
        }

        fn prepare(&self, _: ThreadId, _: &str, _: Entry<Self>) -> KernelResult<()> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            if self.masked.load(Ordering::SeqCst) == 0 {
                self.unmasked.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        fn switch(&self, switch: Switch) {
            panic!("unexpected switch {:?}", switch);
        }

        fn exit_context(&self) -> ! {
            panic!("unexpected exit");
        }

        fn wait_for_interrupt(&self, _: &dyn Fn()) {}
    }

    #[test]
    fn test_contexts_prepared_with_interrupts_off() {
        fn body(_: &'static Kernel<Recorder>, _: usize) {}

        let port = Recorder {
            masked: AtomicU32::new(0),
            prepared: AtomicU32::new(0),
            unmasked: AtomicU32::new(0),
        };
        let k: &'static Kernel<Recorder> =
            Box::leak(Box::new(Kernel::new(port, BootConfig::default())));
        k.start().unwrap();
        k.create("low", 10, body, 0).unwrap();

        assert_eq!(k.port().prepared.load(Ordering::SeqCst), 2);
        assert_eq!(k.port().unmasked.load(Ordering::SeqCst), 0);
    }
}
