//! # Ready, Sleep and Wait Containers
//!
//! Explicit queues of [`ThreadId`] handles. A thread sits in at most one of
//! them at a time, which is what bounds every queue by `MAX_THREADS`.
//!
//! ```text
//!  ReadyQueue   front ─► [63][40][40][31][31][ 0]     descending priority,
//!                                  ▲ insert after      FIFO among equals
//!                                    equal keys
//!
//!  SleepQueue   front ─► [t=105][t=110][t=110][t=300]  ascending wake tick
//!
//!  WaitList     [a][b][c]   unordered, highest priority removed first
//! ```

use core::cmp::Reverse;

use heapless::Vec;

use crate::config::MAX_THREADS;
use crate::thread::ThreadId;

// ---------------------------------------------------------------------------
// Sorted queue
// ---------------------------------------------------------------------------

/// Thread handles kept in ascending key order. Equal keys keep insertion
/// order, so the queue is stable.
struct SortedQueue<K: Ord + Copy> {
    entries: Vec<(K, ThreadId), MAX_THREADS>,
}

impl<K: Ord + Copy> SortedQueue<K> {
    const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn insert(&mut self, key: K, id: ThreadId) {
        let pos = self
            .entries
            .iter()
            .position(|(k, _)| *k > key)
            .unwrap_or(self.entries.len());
        if self.entries.insert(pos, (key, id)).is_err() {
            panic!("thread queue overflow inserting thread {}", id);
        }
    }

    fn front(&self) -> Option<(K, ThreadId)> {
        self.entries.first().copied()
    }

    fn pop_front(&mut self) -> Option<(K, ThreadId)> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    fn remove(&mut self, id: ThreadId) -> bool {
        match self.entries.iter().position(|(_, t)| *t == id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    fn ids(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.entries.iter().map(|(_, id)| *id)
    }
}

// ---------------------------------------------------------------------------
// Ready queue
// ---------------------------------------------------------------------------

/// Threads in `Ready` status, highest effective priority at the front.
pub struct ReadyQueue {
    queue: SortedQueue<Reverse<u8>>,
}

impl ReadyQueue {
    pub const fn new() -> Self {
        Self {
            queue: SortedQueue::new(),
        }
    }

    /// Insert behind every thread of the same or higher priority.
    pub fn push(&mut self, id: ThreadId, priority: u8) {
        self.queue.insert(Reverse(priority), id);
    }

    pub fn pop(&mut self) -> Option<ThreadId> {
        self.queue.pop_front().map(|(_, id)| id)
    }

    pub fn front_priority(&self) -> Option<u8> {
        self.queue.front().map(|(Reverse(p), _)| p)
    }

    #[cfg(test)]
    pub fn remove(&mut self, id: ThreadId) -> bool {
        self.queue.remove(id)
    }

    /// Move `id` to match a changed priority.
    pub fn reposition(&mut self, id: ThreadId, priority: u8) {
        if self.queue.remove(id) {
            self.push(id, priority);
        }
    }

    /// Re-sort after many priorities changed at once. Threads keep their
    /// relative order among equals.
    pub fn rekey(&mut self, mut priority_of: impl FnMut(ThreadId) -> u8) {
        let old = core::mem::replace(&mut self.queue, SortedQueue::new());
        for id in old.ids() {
            self.push(id, priority_of(id));
        }
    }

    #[cfg(test)]
    pub fn contains(&self, id: ThreadId) -> bool {
        self.queue.ids().any(|t| t == id)
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.queue.ids()
    }

    pub fn len(&self) -> usize {
        self.queue.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Sleep queue
// ---------------------------------------------------------------------------

/// Threads blocked until an absolute tick, earliest first.
pub struct SleepQueue {
    queue: SortedQueue<u64>,
}

impl SleepQueue {
    pub const fn new() -> Self {
        Self {
            queue: SortedQueue::new(),
        }
    }

    pub fn push(&mut self, id: ThreadId, wakeup_tick: u64) {
        self.queue.insert(wakeup_tick, id);
    }

    /// Pop the earliest sleeper if its wake tick is at or before `now`.
    pub fn pop_due(&mut self, now: u64) -> Option<ThreadId> {
        match self.queue.front() {
            Some((tick, _)) if tick <= now => self.queue.pop_front().map(|(_, id)| id),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn next_wakeup(&self) -> Option<u64> {
        self.queue.front().map(|(tick, _)| tick)
    }

    pub fn len(&self) -> usize {
        self.queue.entries.len()
    }
}

// ---------------------------------------------------------------------------
// Wait list
// ---------------------------------------------------------------------------

/// Waiters of a semaphore. Priorities of waiting threads change under
/// donation, so the list is scanned at wake time instead of kept sorted.
pub struct WaitList {
    waiters: Vec<ThreadId, MAX_THREADS>,
}

impl WaitList {
    pub const fn new() -> Self {
        Self {
            waiters: Vec::new(),
        }
    }

    pub fn push(&mut self, id: ThreadId) {
        if self.waiters.push(id).is_err() {
            panic!("wait list overflow adding thread {}", id);
        }
    }

    /// Remove and return the waiter with the highest priority; the earliest
    /// arrival wins a tie.
    pub fn pop_max(&mut self, priority_of: impl Fn(ThreadId) -> u8) -> Option<ThreadId> {
        let mut best: Option<(usize, u8)> = None;
        for (i, id) in self.waiters.iter().enumerate() {
            let p = priority_of(*id);
            if best.map_or(true, |(_, bp)| p > bp) {
                best = Some((i, p));
            }
        }
        best.map(|(i, _)| self.waiters.remove(i))
    }

    pub fn remove(&mut self, id: ThreadId) -> bool {
        match self.waiters.iter().position(|t| *t == id) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.waiters.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
