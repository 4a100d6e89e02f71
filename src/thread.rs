//! # Thread Control Block
//!
//! Per-thread scheduling state and the table that owns it.
//!
//! ## Thread state machine
//!
//! ```text
//!               create()                 dispatch
//!   (new) ──► ┌─────────┐ ───unblock──► ┌─────────┐ ──────────► ┌─────────┐
//!             │ Blocked │               │  Ready  │             │ Running │
//!             └─────────┘ ◄─────────┐   └─────────┘ ◄────────── └─────────┘
//!                                   │          yield / preempt    │     │
//!                                   └──────────── block() ────────┘     │
//!                                                                exit() ▼
//!                                                                 ┌─────────┐
//!                                                                 │  Dying  │ ─► reclaimed
//!                                                                 └─────────┘   at next dispatch
//! ```
//!
//! Control blocks live in an [`Arena`] owned by [`ThreadTable`] and are
//! addressed by [`ThreadId`]. Donor sets and lock back-references hold
//! handles only, so a thread that has been reclaimed simply stops being
//! found.

use core::fmt;

use heapless::{String, Vec};
use spin::Mutex;

use crate::arena::{Arena, Key};
use crate::config::{MAX_THREADS, NICE_DEFAULT, PRI_MIN, THREAD_MAGIC, THREAD_NAME_LEN};
use crate::fixed_point::Fixed;
use crate::queue::ReadyQueue;
use crate::sync::LockId;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Handle to a thread. Displays as the thread id, which is unique for the
/// lifetime of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(Key);

impl ThreadId {
    pub(crate) const fn from_key(key: Key) -> Self {
        ThreadId(key)
    }

    /// Monotonically increasing thread id.
    pub const fn tid(self) -> u32 {
        self.0.serial()
    }

    /// Arena slot; ports index per-thread contexts by it.
    pub const fn slot(self) -> usize {
        self.0.slot()
    }

    pub(crate) const fn key(self) -> Key {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tid())
    }
}

/// Hands out thread ids under its own lock, independent of the critical
/// section that protects the rest of the scheduler.
pub struct TidAllocator {
    next: Mutex<u32>,
}

impl TidAllocator {
    pub const fn new() -> Self {
        Self { next: Mutex::new(1) }
    }

    pub fn allocate(&self) -> u32 {
        let mut next = self.next.lock();
        let tid = *next;
        *next += 1;
        tid
    }
}

// ---------------------------------------------------------------------------
// Control block
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    Ready,
    Blocked,
    /// Exited; storage is reclaimed at the next dispatch.
    Dying,
}

/// What a thread spends its ticks on, for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    Idle,
    Kernel,
    /// Runs a user process on behalf of the process collaborator.
    User,
}

pub struct Thread {
    magic: u32,
    pub(crate) name: String<THREAD_NAME_LEN>,
    pub(crate) status: ThreadStatus,
    pub(crate) kind: ThreadKind,
    /// Priority set by the creator or `set_priority`.
    pub(crate) base_priority: u8,
    /// Priority used for scheduling; raised above the base by donation.
    pub(crate) priority: u8,
    /// Threads blocked on locks this thread holds.
    pub(crate) donors: Vec<ThreadId, MAX_THREADS>,
    pub(crate) waiting_for_lock: Option<LockId>,
    pub(crate) nice: i32,
    pub(crate) recent_cpu: Fixed,
    pub(crate) wakeup_tick: u64,
    pub(crate) exit_status: i32,
    pub(crate) payload: usize,
}

impl Thread {
    pub(crate) fn new(name: &str, priority: u8, kind: ThreadKind) -> Self {
        Self {
            magic: THREAD_MAGIC,
            name: truncated_name(name),
            status: ThreadStatus::Blocked,
            kind,
            base_priority: priority,
            priority,
            donors: Vec::new(),
            waiting_for_lock: None,
            nice: NICE_DEFAULT,
            recent_cpu: Fixed::ZERO,
            wakeup_tick: 0,
            exit_status: 0,
            payload: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    pub fn base_priority(&self) -> u8 {
        self.base_priority
    }

    /// Effective priority.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn donors(&self) -> &[ThreadId] {
        &self.donors
    }

    pub fn waiting_for_lock(&self) -> Option<LockId> {
        self.waiting_for_lock
    }

    pub fn nice(&self) -> i32 {
        self.nice
    }

    pub fn recent_cpu(&self) -> Fixed {
        self.recent_cpu
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }

    pub fn payload(&self) -> usize {
        self.payload
    }

    /// False once something has overwritten the control block.
    pub fn is_intact(&self) -> bool {
        self.magic == THREAD_MAGIC
    }

    #[cfg(test)]
    pub(crate) fn corrupt(&mut self) {
        self.magic = !THREAD_MAGIC;
    }
}

fn truncated_name(name: &str) -> String<THREAD_NAME_LEN> {
    let mut out = String::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Thread table
// ---------------------------------------------------------------------------

/// Owns every control block plus the ready queue, the registry of live
/// threads and the identity of the running and idle threads.
///
/// The registry is what MLFQS iterates. It holds every thread between
/// creation and exit except the idle thread.
pub struct ThreadTable {
    slots: Arena<Thread, MAX_THREADS>,
    pub(crate) ready: ReadyQueue,
    registry: Vec<ThreadId, MAX_THREADS>,
    current: ThreadId,
    idle: Option<ThreadId>,
}

impl ThreadTable {
    /// Build the table around the thread that is already executing.
    pub(crate) fn new(tid: u32, mut initial: Thread) -> Self {
        let mut slots = Arena::new();
        initial.status = ThreadStatus::Running;
        let key = match slots.insert_with_serial(tid, initial) {
            Some(key) => key,
            None => unreachable!("empty arena has a free slot"),
        };
        let current = ThreadId(key);
        let mut registry = Vec::new();
        if registry.push(current).is_err() {
            unreachable!("empty registry has room");
        }

        Self {
            slots,
            ready: ReadyQueue::new(),
            registry,
            current,
            idle: None,
        }
    }

    pub(crate) fn insert(&mut self, tid: u32, thread: Thread) -> Option<ThreadId> {
        self.slots.insert_with_serial(tid, thread).map(ThreadId)
    }

    pub(crate) fn remove(&mut self, id: ThreadId) -> Option<Thread> {
        self.slots.remove(id.0)
    }

    pub fn is_full(&self) -> bool {
        self.slots.is_full()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, id: ThreadId) -> Option<&Thread> {
        self.slots.get(id.0)
    }

    pub(crate) fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.slots.get_mut(id.0)
    }

    /// Look up a thread that must exist.
    pub(crate) fn thread(&self, id: ThreadId) -> &Thread {
        match self.slots.get(id.0) {
            Some(thread) => thread,
            None => panic!("stale thread handle {}", id),
        }
    }

    pub(crate) fn thread_mut(&mut self, id: ThreadId) -> &mut Thread {
        match self.slots.get_mut(id.0) {
            Some(thread) => thread,
            None => panic!("stale thread handle {}", id),
        }
    }

    /// Effective priority, or `PRI_MIN` for a thread that no longer exists.
    pub fn priority(&self, id: ThreadId) -> u8 {
        self.get(id).map_or(PRI_MIN, |t| t.priority)
    }

    pub fn current(&self) -> ThreadId {
        self.current
    }

    pub(crate) fn set_current(&mut self, id: ThreadId) {
        self.current = id;
    }

    pub fn idle(&self) -> Option<ThreadId> {
        self.idle
    }

    pub(crate) fn set_idle(&mut self, id: ThreadId) {
        self.idle = Some(id);
    }

    pub fn is_idle(&self, id: ThreadId) -> bool {
        self.idle == Some(id)
    }

    pub fn registry(&self) -> &[ThreadId] {
        &self.registry
    }

    pub(crate) fn register(&mut self, id: ThreadId) {
        if self.registry.push(id).is_err() {
            panic!("thread registry overflow adding thread {}", id);
        }
    }

    pub(crate) fn deregister(&mut self, id: ThreadId) {
        self.registry.retain(|t| *t != id);
    }

    /// Mark `id` ready and queue it by its effective priority.
    pub(crate) fn make_ready(&mut self, id: ThreadId) {
        let thread = self.thread_mut(id);
        thread.status = ThreadStatus::Ready;
        let priority = thread.priority;
        self.ready.push(id, priority);
    }

    /// Change the effective priority, keeping the ready queue ordered.
    pub(crate) fn set_effective(&mut self, id: ThreadId, priority: u8) {
        let thread = self.thread_mut(id);
        thread.priority = priority;
        if thread.status == ThreadStatus::Ready {
            self.ready.reposition(id, priority);
        }
    }

    /// Re-sort the ready queue after priorities changed in bulk.
    pub(crate) fn resort_ready(&mut self) {
        let slots = &self.slots;
        self.ready
            .rekey(|id| slots.get(id.0).map_or(PRI_MIN, |t| t.priority));
    }

    /// Re-derive the effective priority as the maximum of the base
    /// priority and every live donor's effective priority.
    pub(crate) fn recompute(&mut self, id: ThreadId) {
        let thread = self.thread(id);
        let donated = thread
            .donors
            .iter()
            .filter_map(|d| self.get(*d))
            .map(|d| d.priority)
            .max()
            .unwrap_or(PRI_MIN);
        let effective = thread.base_priority.max(donated);
        self.set_effective(id, effective);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
