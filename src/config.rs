//! # DonOS Configuration
//!
//! Compile-time constants governing the scheduler, plus the boot-time
//! policy selection. All capacities are fixed at compile time; nothing in
//! the kernel allocates.

use log::warn;

/// Lowest thread priority.
pub const PRI_MIN: u8 = 0;

/// Priority given to the initial thread and the usual choice for new ones.
pub const PRI_DEFAULT: u8 = 31;

/// Highest thread priority.
pub const PRI_MAX: u8 = 63;

/// Most favourable nice value (thread is least willing to yield).
pub const NICE_MIN: i32 = -20;

pub const NICE_DEFAULT: i32 = 0;

/// Least favourable nice value.
pub const NICE_MAX: i32 = 20;

/// Ticks a thread may run before it is asked to yield.
pub const TIME_SLICE: u32 = 4;

/// Timer interrupts per second. MLFQS recomputes the load average and
/// every `recent_cpu` once per `TIMER_FREQ` ticks.
pub const TIMER_FREQ: u32 = 100;

/// MLFQS recomputes priorities every this many ticks.
pub const PRIORITY_UPDATE_INTERVAL: u64 = 4;

/// Maximum number of live threads, idle and initial threads included.
/// Bounds the control block arena, every waiter list and every donor set.
pub const MAX_THREADS: usize = 16;

/// Maximum number of semaphores created through the kernel API.
pub const MAX_SEMAPHORES: usize = 32;

/// Maximum number of locks.
pub const MAX_LOCKS: usize = 16;

/// Maximum number of condition variables.
pub const MAX_CONDITIONS: usize = 16;

/// Semaphore pool size. Every lock owns one semaphore and every thread
/// waiting on a condition owns a private one, on top of the user pool.
pub const SEMAPHORE_POOL: usize = MAX_SEMAPHORES + MAX_LOCKS + MAX_THREADS;

/// Thread names are truncated to this many bytes.
pub const THREAD_NAME_LEN: usize = 16;

/// Written into every control block; a mismatch means the block was
/// overwritten, usually by a stack overflow.
pub const THREAD_MAGIC: u32 = 0xcd6a_bf4b;

/// Per-thread stack size in bytes on the Cortex-M4 port. Must cover the
/// deepest call chain plus the hardware exception frame (32 bytes) and the
/// software-saved context (32 bytes for R4-R11).
pub const STACK_SIZE: usize = 2048;

/// System clock frequency in Hz (STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

// ---------------------------------------------------------------------------
// Boot configuration
// ---------------------------------------------------------------------------

/// Scheduling policy, chosen once at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    /// Strict priority scheduling with priority donation through locks.
    Priority,
    /// Multi-level feedback queue scheduling driven by `recent_cpu`,
    /// `nice` and the load average.
    Mlfqs,
}

/// Runtime configuration handed to the scheduler at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootConfig {
    pub policy: PolicyKind,
    /// Time slice quota in ticks.
    pub time_slice: u32,
    /// Timer ticks per second.
    pub timer_freq: u32,
}

impl BootConfig {
    pub const fn new(policy: PolicyKind) -> Self {
        Self {
            policy,
            time_slice: TIME_SLICE,
            timer_freq: TIMER_FREQ,
        }
    }

    /// Parse a kernel command line such as `"-q -o mlfqs"`.
    ///
    /// Only `-o mlfqs` changes anything; other options belong to other
    /// subsystems and are reported and skipped.
    pub fn from_cmdline(cmdline: &str) -> Self {
        let mut config = Self::default();
        let mut words = cmdline.split_whitespace();

        while let Some(word) = words.next() {
            match word {
                "-o" => match words.next() {
                    Some("mlfqs") => config.policy = PolicyKind::Mlfqs,
                    Some(other) => warn!("unknown scheduler option `-o {}`", other),
                    None => warn!("`-o` given without a value"),
                },
                other => warn!("ignoring boot option `{}`", other),
            }
        }

        config
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        Self::new(PolicyKind::Priority)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
