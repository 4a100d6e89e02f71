//! # DonOS Example Firmware
//!
//! Demonstrates priority donation with three threads sharing one lock:
//!
//! | Thread | Priority | Behavior |
//! |--------|----------|----------|
//! | `main` | 31 | Holds the lock for long stretches, sleeps 20 ticks |
//! | `medium` | 32 | CPU work in bursts, sleeps 10 ticks, never locks |
//! | `high` | 33 | Takes the lock briefly, sleeps 5 ticks |
//!
//! ## Expected Dynamics
//!
//! 1. `main` takes the lock and starts `medium`, which preempts it at once.
//!
//! 2. While `medium` sleeps, `main` starts `high`. `high` blocks on the
//!    lock and donates priority 33 to `main`.
//!
//! 3. `main` now outranks `medium` and finishes its critical section
//!    without being starved. Releasing the lock drops it back to 31 and
//!    hands the CPU to `high` straight away.
//!
//! Without donation `medium` would keep `high` waiting behind `main`
//! indefinitely: the classic priority inversion.

#![no_std]
#![no_main]

use cortex_m_rt::entry;
use panic_halt as _;
use spin::Once;

use donos::arch::cortex_m4::{launch, CortexM4, KERNEL};
use donos::config::PRI_DEFAULT;
use donos::{BootConfig, Kernel, LockId};

type K = &'static Kernel<CortexM4>;

static SHARED: Once<LockId> = Once::new();

fn busy(iterations: u32) -> u32 {
    let mut work: u32 = 0;
    for _ in 0..iterations {
        work = core::hint::black_box(work.wrapping_add(1));
    }
    work
}

fn shared_lock() -> LockId {
    match SHARED.get() {
        Some(lock) => *lock,
        None => panic!("shared lock not created"),
    }
}

// ---------------------------------------------------------------------------
// Thread entry points
// ---------------------------------------------------------------------------

/// Never touches the lock; only competes for the CPU.
fn medium(kernel: K, _: usize) {
    loop {
        busy(20_000);
        kernel.sleep(10);
    }
}

fn high(kernel: K, _: usize) {
    let lock = shared_lock();
    loop {
        kernel.lock_acquire(lock);
        busy(1_000);
        kernel.lock_release(lock);
        kernel.sleep(5);
    }
}

/// Body of the initial thread, already on its process stack.
fn boot(kernel: K) {
    if kernel.start().is_err() {
        return;
    }
    let Ok(lock) = kernel.lock_create() else {
        return;
    };
    SHARED.call_once(|| lock);

    kernel.lock_acquire(lock);
    if kernel.create("medium", PRI_DEFAULT + 1, medium, 0).is_err() {
        return;
    }
    if kernel.create("high", PRI_DEFAULT + 2, high, 0).is_err() {
        return;
    }

    loop {
        busy(50_000);
        kernel.lock_release(lock);
        kernel.sleep(20);
        kernel.lock_acquire(lock);
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Firmware entry point. Builds the kernel around the core peripherals and
/// launches the initial thread. Does not return.
#[entry]
fn main() -> ! {
    let Some(cp) = cortex_m::Peripherals::take() else {
        panic!("core peripherals already taken");
    };

    let kernel = KERNEL.call_once(|| Kernel::new(CortexM4::new(cp.SYST), BootConfig::default()));
    launch(kernel, boot)
}
