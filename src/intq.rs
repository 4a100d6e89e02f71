//! # Interrupt Queue
//!
//! A bounded byte FIFO between device interrupt handlers and threads, such
//! as a UART receive buffer. Threads block when they cannot make progress;
//! interrupt handlers never block and must check [`IntQueue::is_full`] or
//! [`IntQueue::is_empty`] first.
//!
//! ```text
//!   ISR ──putc──► [ b0 b1 b2 ... ] ──getc──► thread   (sleeps while empty)
//!   thread ─putc─► [ ... ]          ──getc──► ISR     (sleeps while full)
//! ```
//!
//! At most one thread sleeps on each side; the queue's lock makes any
//! further reader or writer wait for it.

use heapless::Deque;
use spin::Mutex;

use crate::arch::Port;
use crate::error::KernelResult;
use crate::kernel::Kernel;
use crate::scheduler::Scheduler;
use crate::sync::LockId;
use crate::thread::ThreadId;

struct State<const N: usize> {
    buf: Deque<u8, N>,
    /// Thread waiting for room.
    not_full: Option<ThreadId>,
    /// Thread waiting for data.
    not_empty: Option<ThreadId>,
}

pub struct IntQueue<const N: usize> {
    lock: LockId,
    // Only locked with interrupts disabled, so never contended.
    state: Mutex<State<N>>,
}

impl<const N: usize> IntQueue<N> {
    pub fn new<P: Port>(kernel: &Kernel<P>) -> KernelResult<Self> {
        Ok(Self {
            lock: kernel.lock_create()?,
            state: Mutex::new(State {
                buf: Deque::new(),
                not_full: None,
                not_empty: None,
            }),
        })
    }

    pub fn is_empty<P: Port>(&self, kernel: &Kernel<P>) -> bool {
        kernel
            .port()
            .without_interrupts(|| self.state.lock().buf.is_empty())
    }

    pub fn is_full<P: Port>(&self, kernel: &Kernel<P>) -> bool {
        kernel
            .port()
            .without_interrupts(|| self.state.lock().buf.is_full())
    }

    /// Remove a byte, sleeping while the queue is empty.
    pub fn getc<P: Port>(&self, kernel: &Kernel<P>) -> u8 {
        loop {
            if let Some(byte) = kernel.transition(|s| self.pop(s)) {
                return byte;
            }
            kernel.lock_acquire(self.lock);
            kernel.transition(|s| self.park(s, Side::Reader));
            kernel.lock_release(self.lock);
        }
    }

    /// Append a byte, sleeping while the queue is full.
    pub fn putc<P: Port>(&self, kernel: &Kernel<P>, byte: u8) {
        loop {
            if kernel.transition(|s| self.push(s, byte)) {
                return;
            }
            kernel.lock_acquire(self.lock);
            kernel.transition(|s| self.park(s, Side::Writer));
            kernel.lock_release(self.lock);
        }
    }

    fn pop(&self, s: &mut Scheduler) -> Option<u8> {
        let mut state = self.state.lock();
        let byte = state.buf.pop_front()?;
        let writer = state.not_full.take();
        drop(state);
        if let Some(writer) = writer {
            s.unblock(writer);
        }
        Some(byte)
    }

    fn push(&self, s: &mut Scheduler, byte: u8) -> bool {
        let mut state = self.state.lock();
        if state.buf.push_back(byte).is_err() {
            return false;
        }
        let reader = state.not_empty.take();
        drop(state);
        if let Some(reader) = reader {
            s.unblock(reader);
        }
        true
    }

    /// Sleep until the other side makes progress, unless it already has.
    fn park(&self, s: &mut Scheduler, side: Side) {
        let mut state = self.state.lock();
        let must_wait = match side {
            Side::Reader => state.buf.is_empty(),
            Side::Writer => state.buf.is_full(),
        };
        if !must_wait {
            return;
        }
        let current = s.current();
        let slot = match side {
            Side::Reader => &mut state.not_empty,
            Side::Writer => &mut state.not_full,
        };
        assert!(slot.is_none(), "second waiter on interrupt queue");
        *slot = Some(current);
        drop(state);
        s.block();
    }
}

#[derive(Clone, Copy)]
enum Side {
    Reader,
    Writer,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicU32, Ordering};

    use spin::Once;

    use super::*;
    use crate::arch::host::HostPort;
    use crate::config::PolicyKind;
    use crate::kernel::tests::boot;

    #[test]
    fn test_reader_sleeps_until_interrupt_delivers() {
        static QUEUE: Once<IntQueue<4>> = Once::new();
        static SUM: AtomicU32 = AtomicU32::new(0);

        fn reader(k: &'static Kernel<HostPort>, _: usize) {
            let queue = QUEUE.get().unwrap();
            for _ in 0..3 {
                SUM.fetch_add(u32::from(queue.getc(k)), Ordering::SeqCst);
            }
        }

        let k = boot(PolicyKind::Priority);
        let queue = QUEUE.call_once(|| IntQueue::new(k).unwrap());
        k.create("reader", 40, reader, 0).unwrap();
        assert_eq!(SUM.load(Ordering::SeqCst), 0);

        for byte in [1u8, 2, 3] {
            k.interrupt(|| {
                assert!(!queue.is_full(k));
                queue.putc(k, byte);
            });
        }
        assert_eq!(SUM.load(Ordering::SeqCst), 6);
        assert!(queue.is_empty(k));
    }

    #[test]
    fn test_writer_sleeps_while_full() {
        static QUEUE: Once<IntQueue<2>> = Once::new();
        static WRITTEN: AtomicU32 = AtomicU32::new(0);

        fn writer(k: &'static Kernel<HostPort>, _: usize) {
            let queue = QUEUE.get().unwrap();
            for byte in 0..4u8 {
                queue.putc(k, byte);
                WRITTEN.fetch_add(1, Ordering::SeqCst);
            }
        }

        let k = boot(PolicyKind::Priority);
        let queue = QUEUE.call_once(|| IntQueue::new(k).unwrap());
        k.create("writer", 40, writer, 0).unwrap();
        assert_eq!(WRITTEN.load(Ordering::SeqCst), 2);
        assert!(queue.is_full(k));

        let first = k.interrupt(|| queue.getc(k));
        assert_eq!(first, 0);
        assert_eq!(WRITTEN.load(Ordering::SeqCst), 3);

        assert_eq!(queue.getc(k), 1);
        assert_eq!(WRITTEN.load(Ordering::SeqCst), 4);
        assert_eq!(queue.getc(k), 2);
        assert_eq!(queue.getc(k), 3);
    }
}
