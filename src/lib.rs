//! # DonOS: Donation-Aware Preemptive Thread Scheduler
//!
//! A preemptive, priority-based kernel thread scheduler for a single CPU,
//! with two boot-selectable policies: strict priority scheduling with
//! priority donation through locks, and a multi-level feedback queue
//! scheduler (MLFQS) driven by per-thread CPU usage and the system load.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                  Application Threads                    │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                  │
//! │   create() · yield_now() · sleep() · lock_acquire() ... │
//! ├──────────────┬────────────────────┬───────────────────┤
//! │  Scheduler   │   Policy           │  Sync Primitives  │
//! │  scheduler.rs│   policy/          │  sync/            │
//! │  ─ on_tick() │   ─ donation       │  ─ semaphore      │
//! │  ─ schedule()│   ─ mlfqs          │  ─ lock           │
//! │  ─ block()   │                    │  ─ condvar        │
//! ├──────────────┴────────────────────┴───────────────────┤
//! │   Threads (thread.rs) · Queues (queue.rs) · Arena       │
//! │   TCB · ready / sleep / wait queues · 17.14 fixed point │
//! ├────────────────────────────────────────────────────────┤
//! │      Arch Port (arch/cortex_m4.rs, arch/host.rs)        │
//! │    PendSV · SysTick · critical sections · stacks       │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Scheduling Model
//!
//! - The highest-priority ready thread always runs; equal priorities take
//!   turns in FIFO order, each for at most [`config::TIME_SLICE`] ticks.
//! - A thread that blocks on a lock lends its priority to the holder, and
//!   transitively along the chain of holders waiting on further locks.
//! - Under MLFQS, priorities are recomputed from `recent_cpu` and `nice`
//!   every [`config::PRIORITY_UPDATE_INTERVAL`] ticks and donation is off.
//!
//! ## Memory Model
//!
//! - **No heap**: threads, semaphores, locks and condition variables live
//!   in fixed-capacity arenas addressed by generational handles
//! - **Stale handles** are detected instead of aliasing a reused slot
//! - **Critical sections**: every scheduler transition runs with
//!   interrupts disabled through [`arch::Port::without_interrupts`]

#![no_std]

#[cfg(any(test, feature = "host"))]
extern crate std;

pub mod arch;
pub mod arena;
pub mod config;
pub mod error;
pub mod fixed_point;
pub mod intq;
pub mod kernel;
pub mod policy;
pub mod queue;
pub mod scheduler;
pub mod sync;
pub mod thread;

pub use config::{BootConfig, PolicyKind};
pub use error::{KernelError, KernelResult};
pub use kernel::Kernel;
pub use sync::{ConditionId, LockId, SemaphoreId};
pub use thread::ThreadId;
