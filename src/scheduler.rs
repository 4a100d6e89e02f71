//! # Scheduler
//!
//! The scheduling state machine: thread lifecycle, dispatch, tick
//! accounting, timed sleep and preemption. One [`Scheduler`] is built at
//! kernel init and owns every piece of scheduling state; nothing here is a
//! global.
//!
//! Every method is one atomic transition and expects to run with
//! interrupts disabled ([`Kernel`](crate::kernel::Kernel) arranges that).
//! A transition that hands the CPU to another thread does so as its last
//! step and leaves a [`Switch`] behind for the port to carry out.
//!
//! ## Dispatch
//!
//! ```text
//!  running thread leaves Running (block / yield / exit)
//!        │
//!        ▼
//!  schedule() ─► reclaim threads that died at the previous dispatch
//!        │
//!        ├─► next = front of ready queue, or idle if it is empty
//!        ├─► next.status = Running, time slice restarts
//!        └─► Switch { from: prev, to: next }   (prev queued for
//!                                               reclamation if Dying)
//! ```
//!
//! ## Preemption
//!
//! After any wake-up or priority change the front of the ready queue is
//! compared with the running thread. If it is strictly higher the running
//! thread yields at once, unless the scheduler is in interrupt context
//! (the yield happens in `leave_interrupt`) or preemption is suspended
//! inside a compound operation (the check is repeated when it resumes).

use heapless::Vec;
use log::{debug, info, trace, warn};

use crate::arena::Arena;
use crate::config::{
    BootConfig, PolicyKind, MAX_CONDITIONS, MAX_LOCKS, MAX_THREADS, NICE_MAX, NICE_MIN,
    PRI_DEFAULT, PRI_MAX, PRI_MIN, SEMAPHORE_POOL,
};
use crate::error::{KernelError, KernelResult};
use crate::policy::Policy;
use crate::queue::SleepQueue;
use crate::sync::{Condition, Lock, Semaphore, Wait};
use crate::thread::{Thread, ThreadId, ThreadKind, ThreadStatus, ThreadTable, TidAllocator};

// ---------------------------------------------------------------------------
// Switch record
// ---------------------------------------------------------------------------

/// A context switch decided by the scheduler and not yet performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub from: ThreadId,
    pub to: ThreadId,
    /// `from` has exited and will never be resumed.
    pub exiting: bool,
}

/// Tick and switch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub idle_ticks: u64,
    pub kernel_ticks: u64,
    pub user_ticks: u64,
    pub switches: u64,
}

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

pub struct Scheduler {
    config: BootConfig,
    pub(crate) threads: ThreadTable,
    pub(crate) policy: Policy,
    sleepers: SleepQueue,
    /// Threads switched away from while `Dying`; freed at the next dispatch.
    doomed: Vec<ThreadId, MAX_THREADS>,
    /// Freed threads whose port context has not been released yet.
    reclaimed: Vec<ThreadId, MAX_THREADS>,
    pub(crate) semaphores: Arena<Semaphore, SEMAPHORE_POOL>,
    pub(crate) user_semaphores: usize,
    pub(crate) locks: Arena<Lock, MAX_LOCKS>,
    pub(crate) conditions: Arena<Condition, MAX_CONDITIONS>,
    tids: TidAllocator,
    ticks: u64,
    slice_ticks: u32,
    stats: TickStats,
    interrupt_depth: u32,
    yield_on_return: bool,
    preempt_off: u32,
    pending: Option<Switch>,
    initial: ThreadId,
}

impl Scheduler {
    /// Turn the code that is already executing into the initial thread,
    /// named "main" and running at `PRI_DEFAULT`.
    pub fn new(config: BootConfig) -> Self {
        let tids = TidAllocator::new();
        let tid = tids.allocate();
        let threads = ThreadTable::new(tid, Thread::new("main", PRI_DEFAULT, ThreadKind::Kernel));
        let initial = threads.current();

        Self {
            config,
            threads,
            policy: Policy::new(config.policy),
            sleepers: SleepQueue::new(),
            doomed: Vec::new(),
            reclaimed: Vec::new(),
            semaphores: Arena::new(),
            user_semaphores: 0,
            locks: Arena::new(),
            conditions: Arena::new(),
            tids,
            ticks: 0,
            slice_ticks: 0,
            stats: TickStats::default(),
            interrupt_depth: 0,
            yield_on_return: false,
            preempt_off: 0,
            pending: None,
            initial,
        }
    }

    /// Create the idle thread. It never enters the ready queue; dispatch
    /// falls back to it when nothing else is ready.
    pub fn start(&mut self) -> KernelResult<ThreadId> {
        if let Some(idle) = self.threads.idle() {
            return Ok(idle);
        }
        let tid = self.tids.allocate();
        let idle = self
            .threads
            .insert(tid, Thread::new("idle", PRI_MIN, ThreadKind::Idle))
            .ok_or(KernelError::ThreadLimit)?;
        self.threads.set_idle(idle);

        info!(
            "scheduler started: {:?} policy, {} tick slice, {} Hz",
            self.config.policy, self.config.time_slice, self.config.timer_freq
        );
        Ok(idle)
    }

    pub fn config(&self) -> BootConfig {
        self.config
    }

    pub fn policy_kind(&self) -> PolicyKind {
        self.policy.kind()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create a thread and make it ready. May preempt the caller.
    pub fn create(&mut self, name: &str, priority: u8) -> KernelResult<ThreadId> {
        let id = self.create_blocked(name, priority)?;
        self.unblock(id);
        Ok(id)
    }

    /// Create a registered thread in `Blocked` status.
    pub fn create_blocked(&mut self, name: &str, priority: u8) -> KernelResult<ThreadId> {
        assert!(priority <= PRI_MAX, "priority {} out of range", priority);
        if self.threads.is_full() {
            return Err(KernelError::ThreadLimit);
        }
        let tid = self.tids.allocate();
        let id = self
            .threads
            .insert(tid, Thread::new(name, priority, ThreadKind::Kernel))
            .ok_or(KernelError::ThreadLimit)?;
        self.threads.register(id);

        debug!("created thread {} ({}) at priority {}", id, name, priority);
        Ok(id)
    }

    /// Undo `create_blocked` for a thread that never ran.
    pub fn discard(&mut self, id: ThreadId) {
        assert_eq!(
            self.threads.thread(id).status,
            ThreadStatus::Blocked,
            "discarding thread {} that already ran",
            id
        );
        self.threads.deregister(id);
        self.threads.remove(id);
    }

    /// Put the current thread to sleep until someone calls `unblock`.
    pub fn block(&mut self) {
        assert!(!self.in_interrupt(), "block in interrupt context");
        let current = self.current();
        self.threads.thread_mut(current).status = ThreadStatus::Blocked;
        self.schedule();
    }

    /// Make a blocked thread ready. Safe in interrupt context.
    pub fn unblock(&mut self, id: ThreadId) {
        let status = self.threads.thread(id).status;
        assert_eq!(
            status,
            ThreadStatus::Blocked,
            "unblock of thread {} in status {:?}",
            id,
            status
        );
        self.threads.make_ready(id);
        self.check_preemption();
    }

    /// Give up the CPU; the caller goes behind every ready thread of equal
    /// priority.
    pub fn yield_current(&mut self) {
        assert!(!self.in_interrupt(), "yield in interrupt context");
        self.requeue_current();
    }

    fn requeue_current(&mut self) {
        let current = self.threads.current();
        if self.threads.is_idle(current) {
            self.threads.thread_mut(current).status = ThreadStatus::Blocked;
        } else {
            self.threads.make_ready(current);
        }
        self.schedule();
    }

    /// Terminate the current thread.
    pub fn exit(&mut self, status: i32) {
        assert!(!self.in_interrupt(), "exit in interrupt context");
        let current = self.current();
        assert!(!self.threads.is_idle(current), "idle thread cannot exit");

        self.threads.deregister(current);
        let thread = self.threads.thread_mut(current);
        thread.exit_status = status;
        thread.status = ThreadStatus::Dying;
        debug!("thread {} exiting with status {}", current, status);
        self.schedule();
    }

    /// The running thread. Panics if its control block has been
    /// overwritten.
    pub fn current(&self) -> ThreadId {
        let current = self.threads.current();
        assert!(
            self.threads.thread(current).is_intact(),
            "control block of thread {} corrupted (stack overflow?)",
            current
        );
        current
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(id)
    }

    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    pub fn initial_thread(&self) -> ThreadId {
        self.initial
    }

    /// Account future ticks of `id` as user time.
    pub fn mark_user(&mut self, id: ThreadId) {
        self.threads.thread_mut(id).kind = ThreadKind::User;
    }

    pub fn set_payload(&mut self, id: ThreadId, payload: usize) {
        self.threads.thread_mut(id).payload = payload;
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Pick the next thread. The current thread must already have left
    /// `Running`.
    fn schedule(&mut self) {
        let prev = self.threads.current();
        debug_assert_ne!(self.threads.thread(prev).status, ThreadStatus::Running);

        self.reap();

        let next = match self.threads.ready.pop().or(self.threads.idle()) {
            Some(next) => next,
            None => panic!("no runnable thread and no idle thread"),
        };
        self.threads.thread_mut(next).status = ThreadStatus::Running;
        self.threads.set_current(next);
        self.slice_ticks = 0;

        let exiting = self.threads.thread(prev).status == ThreadStatus::Dying;
        if exiting && self.doomed.push(prev).is_err() {
            panic!("deferred reclamation list overflow");
        }

        if next != prev {
            self.stats.switches += 1;
            trace!("switch {} -> {}", prev, next);
            self.record_switch(Switch {
                from: prev,
                to: next,
                exiting,
            });
        }
    }

    /// Free threads that died at an earlier dispatch. None of them can be
    /// executing any more.
    fn reap(&mut self) {
        while let Some(id) = self.doomed.pop() {
            if let Some(thread) = self.threads.remove(id) {
                debug!(
                    "reclaimed thread {} ({}), exit status {}",
                    id,
                    thread.name(),
                    thread.exit_status()
                );
            }
            // The initial thread runs on the boot stack, which the port
            // never handed out.
            if id != self.initial && self.reclaimed.push(id).is_err() {
                warn!("context of thread {} not released", id);
            }
        }
    }

    fn record_switch(&mut self, switch: Switch) {
        self.pending = match self.pending.take() {
            // A switch nobody performed yet: the CPU is still on its `from`.
            Some(earlier) if earlier.from == switch.to => None,
            Some(earlier) => Some(Switch {
                from: earlier.from,
                to: switch.to,
                exiting: earlier.exiting,
            }),
            None => Some(switch),
        };
    }

    /// The switch the port has to perform, if any.
    pub fn take_switch(&mut self) -> Option<Switch> {
        self.pending.take()
    }

    /// Threads whose port context can now be released.
    pub fn take_reclaimed(&mut self) -> Vec<ThreadId, MAX_THREADS> {
        core::mem::take(&mut self.reclaimed)
    }

    // -----------------------------------------------------------------------
    // Preemption
    // -----------------------------------------------------------------------

    /// Yield if the best ready thread outranks the running one.
    pub(crate) fn check_preemption(&mut self) {
        let Some(front) = self.threads.ready.front_priority() else {
            return;
        };
        let current = self.threads.current();
        let outranked = self.threads.is_idle(current) || front > self.threads.priority(current);
        if !outranked {
            return;
        }

        if self.interrupt_depth > 0 {
            self.yield_on_return = true;
        } else if self.preempt_off == 0 {
            self.requeue_current();
        }
    }

    /// Hold off preemption across a compound operation.
    pub(crate) fn suspend_preemption(&mut self) {
        self.preempt_off += 1;
    }

    /// Drop a hold without checking, for a caller that blocks next.
    pub(crate) fn release_preemption_hold(&mut self) {
        self.preempt_off -= 1;
    }

    pub(crate) fn resume_preemption(&mut self) {
        self.preempt_off -= 1;
        if self.preempt_off == 0 {
            self.check_preemption();
        }
    }

    // -----------------------------------------------------------------------
    // Interrupt context
    // -----------------------------------------------------------------------

    pub fn in_interrupt(&self) -> bool {
        self.interrupt_depth > 0
    }

    pub fn enter_interrupt(&mut self) {
        self.interrupt_depth += 1;
    }

    /// Leave interrupt context; the outermost exit performs a yield that
    /// was requested inside the handler.
    pub fn leave_interrupt(&mut self) {
        assert!(self.interrupt_depth > 0, "leave_interrupt without enter");
        self.interrupt_depth -= 1;
        if self.interrupt_depth == 0 && self.yield_on_return {
            self.yield_on_return = false;
            self.requeue_current();
        }
    }

    /// A full timer interrupt: enter, tick, leave.
    pub fn timer_interrupt(&mut self) {
        self.enter_interrupt();
        self.on_tick();
        self.leave_interrupt();
    }

    /// Per-tick work. Must run in interrupt context.
    pub fn on_tick(&mut self) {
        assert!(self.in_interrupt(), "on_tick outside interrupt context");
        self.ticks += 1;

        let current = self.threads.current();
        match self.threads.thread(current).kind {
            ThreadKind::Idle => self.stats.idle_ticks += 1,
            ThreadKind::Kernel => self.stats.kernel_ticks += 1,
            ThreadKind::User => self.stats.user_ticks += 1,
        }

        self.policy
            .on_tick(&mut self.threads, self.ticks, self.config.timer_freq);

        while let Some(id) = self.sleepers.pop_due(self.ticks) {
            trace!("tick {}: waking thread {}", self.ticks, id);
            self.unblock(id);
        }

        self.slice_ticks += 1;
        if self.slice_ticks >= self.config.time_slice {
            self.yield_on_return = true;
        }

        self.check_preemption();
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn stats(&self) -> TickStats {
        self.stats
    }

    // -----------------------------------------------------------------------
    // Timed sleep
    // -----------------------------------------------------------------------

    /// Block the current thread until tick `wakeup`. A tick that has
    /// already passed returns at once.
    pub fn sleep_until(&mut self, wakeup: u64) -> Wait {
        assert!(!self.in_interrupt(), "sleep in interrupt context");
        if wakeup <= self.ticks {
            return Wait::Done;
        }
        let current = self.current();
        self.threads.thread_mut(current).wakeup_tick = wakeup;
        self.sleepers.push(current, wakeup);
        self.block();
        Wait::Blocked
    }

    pub fn sleeping(&self) -> usize {
        self.sleepers.len()
    }

    // -----------------------------------------------------------------------
    // Priority and MLFQS accessors
    // -----------------------------------------------------------------------

    pub fn get_priority(&self) -> u8 {
        self.threads.priority(self.current())
    }

    pub fn set_priority(&mut self, priority: u8) {
        assert!(priority <= PRI_MAX, "priority {} out of range", priority);
        let current = self.current();
        self.policy.set_priority(&mut self.threads, current, priority);
        self.check_preemption();
    }

    pub fn get_nice(&self) -> i32 {
        self.threads.thread(self.current()).nice
    }

    pub fn set_nice(&mut self, nice: i32) {
        assert!(
            (NICE_MIN..=NICE_MAX).contains(&nice),
            "nice {} out of range",
            nice
        );
        let current = self.current();
        self.policy.set_nice(&mut self.threads, current, nice);
        self.check_preemption();
    }

    /// System load average times 100, rounded.
    pub fn get_load_avg(&self) -> i32 {
        self.policy.load_avg().mul_int(100).to_int_round()
    }

    /// Current thread's `recent_cpu` times 100, rounded.
    pub fn get_recent_cpu(&self) -> i32 {
        self.threads
            .thread(self.current())
            .recent_cpu
            .mul_int(100)
            .to_int_round()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
