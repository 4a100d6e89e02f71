//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor.
//! Implements context switching via PendSV, the SysTick tick source, and
//! interrupt masking for the scheduler's critical sections.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): used by interrupt handlers
//! - **PSP** (Process Stack Pointer): used by threads in Thread mode
//!
//! On exception entry, the hardware stacks R0-R3, R12, LR, PC and xPSR onto
//! the process stack. PendSV saves and restores R4-R11 by hand, which
//! completes the context. The scheduler has already picked the next thread
//! by the time PendSV runs; [`Port::switch`] only records the pair of stack
//! slots and pends the exception.
//!
//! ## Stacks
//!
//! Thread stacks are static, one per thread-table slot, so a thread's
//! [`ThreadId::slot`] is also its stack index. The lowest word of every
//! stack holds a canary that [`Port::stack_ok`] checks.
//!
//! ## Interrupt Priorities
//!
//! SysTick and PendSV both sit at the lowest priority (0xFF), so PendSV
//! only runs once no other handler is active.
//!
//! Build for `thumbv7em-none-eabi`: the switch does not save FPU state.

use core::arch::{asm, global_asm};
use core::ptr::{addr_of, addr_of_mut};

use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SYST;
use spin::{Mutex, Once};

use crate::config::{MAX_THREADS, STACK_SIZE, SYSTEM_CLOCK_HZ};
use crate::error::{KernelError, KernelResult};
use crate::kernel::{Entry, Kernel};
use crate::scheduler::Switch;
use crate::thread::ThreadId;

use super::Port;

/// The kernel instance the exception handlers drive.
pub static KERNEL: Once<Kernel<CortexM4>> = Once::new();

static BOOT: Once<fn(&'static Kernel<CortexM4>)> = Once::new();

// ---------------------------------------------------------------------------
// Thread stacks
// ---------------------------------------------------------------------------

const STACK_WORDS: usize = STACK_SIZE / 4;
const CANARY: u32 = 0xDEAD_BEEF;

#[repr(C, align(8))]
struct Stack([u32; STACK_WORDS]);

const EMPTY_STACK: Stack = Stack([0; STACK_WORDS]);

static mut STACKS: [Stack; MAX_THREADS] = [EMPTY_STACK; MAX_THREADS];

/// Plant the canary and return the 8-byte aligned top of `slot`'s stack.
///
/// # Safety
/// Nothing may be running on that stack.
unsafe fn reset_stack(slot: usize) -> usize {
    let stack = &mut (*addr_of_mut!(STACKS))[slot].0;
    stack[0] = CANARY;
    stack.as_mut_ptr().add(STACK_WORDS) as usize & !0x07
}

/// Build the initial frame of a new thread so that the first PendSV
/// "return" lands in `thread_trampoline(slot)`.
///
/// ```text
/// [Hardware stacked frame]   <- PSP after PendSV restores R4-R11
///   xPSR  (Thumb bit set)
///   PC    (thread_trampoline)
///   LR    (thread_return)
///   R12, R3, R2, R1 (0)
///   R0    (slot)
/// [Software saved context]
///   R11 .. R4 (0)            <- saved stack pointer
/// ```
///
/// # Safety
/// Nothing may be running on that stack.
unsafe fn init_thread_stack(slot: usize) -> usize {
    let top = reset_stack(slot);
    let frame = (top - 16 * 4) as *mut u32;

    for i in 0..8 {
        *frame.add(i) = 0; // R4-R11
    }
    *frame.add(8) = slot as u32; // R0
    for i in 9..13 {
        *frame.add(i) = 0; // R1-R3, R12
    }
    *frame.add(13) = thread_return as usize as u32;
    *frame.add(14) = (thread_trampoline as usize as u32) & !1;
    *frame.add(15) = 0x0100_0000;

    frame as usize
}

extern "C" fn thread_trampoline(slot: usize) -> ! {
    let entry = KERNEL
        .get()
        .and_then(|k| k.port().without_interrupts(|| k.port().entries.lock()[slot]));
    match entry {
        Some(entry) => entry.run(),
        None => panic!("thread slot {} started without an entry", slot),
    }
}

/// Landing pad should a trampoline ever return.
extern "C" fn thread_return() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

pub struct CortexM4 {
    syst: Mutex<Option<SYST>>,
    saved_sp: Mutex<[usize; MAX_THREADS]>,
    entries: Mutex<[Option<Entry<CortexM4>>; MAX_THREADS]>,
    /// Stack slots of the switch PendSV will perform.
    pending: Mutex<Option<(usize, usize)>>,
}

impl CortexM4 {
    pub fn new(syst: SYST) -> Self {
        Self {
            syst: Mutex::new(Some(syst)),
            saved_sp: Mutex::new([0; MAX_THREADS]),
            entries: Mutex::new([None; MAX_THREADS]),
            pending: Mutex::new(None),
        }
    }

    /// Called from PendSV with the outgoing thread's saved stack pointer;
    /// returns the one to restore.
    fn swap_stacks(&self, saved: usize) -> usize {
        let Some((from, to)) = self.pending.lock().take() else {
            return saved;
        };
        let mut sp = self.saved_sp.lock();
        sp[from] = saved;
        sp[to]
    }
}

impl Port for CortexM4 {
    fn adopt(&self, _initial: ThreadId) {
        // The initial thread moves onto its own stack in `launch`.
    }

    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R {
        cortex_m::interrupt::free(|_| f())
    }

    fn prepare(&self, thread: ThreadId, _name: &str, entry: Entry<Self>) -> KernelResult<()> {
        let slot = thread.slot();
        if slot >= MAX_THREADS {
            return Err(KernelError::ContextUnavailable);
        }
        // SAFETY: the slot belongs to a thread that has not started.
        let sp = unsafe { init_thread_stack(slot) };
        self.saved_sp.lock()[slot] = sp;
        self.entries.lock()[slot] = Some(entry);
        Ok(())
    }

    fn switch(&self, switch: Switch) {
        {
            let mut pending = self.pending.lock();
            // PendSV has not run yet: the CPU is still on the earlier `from`.
            let from = pending.map_or(switch.from.slot(), |(from, _)| from);
            let to = switch.to.slot();
            *pending = if from == to { None } else { Some((from, to)) };
        }
        trigger_pendsv();
    }

    fn release(&self, thread: ThreadId) {
        if let Some(entry) = self.entries.lock().get_mut(thread.slot()) {
            *entry = None;
        }
    }

    fn exit_context(&self) -> ! {
        // PendSV is pending and takes the CPU away for good.
        loop {
            cortex_m::asm::wfi();
        }
    }

    fn start_timer(&self, hz: u32) {
        if let Some(mut syst) = self.syst.lock().take() {
            configure_systick(&mut syst, hz);
        }
        set_interrupt_priorities();
    }

    fn wait_for_interrupt(&self, _timer: &dyn Fn()) {
        cortex_m::asm::wfi();
    }

    fn stack_ok(&self, thread: ThreadId) -> bool {
        let slot = thread.slot();
        // SAFETY: a volatile read of one word of a static.
        slot < MAX_THREADS
            && unsafe { core::ptr::read_volatile(addr_of!(STACKS[slot].0[0])) } == CANARY
    }
}

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure SysTick to fire `hz` times per second from the core clock.
pub fn configure_systick(syst: &mut SYST, hz: u32) {
    let reload = SYSTEM_CLOCK_HZ / hz - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

// ---------------------------------------------------------------------------
// PendSV trigger
// ---------------------------------------------------------------------------

/// Pend a PendSV exception by setting PENDSVSET in the Interrupt Control
/// and State Register.
#[inline]
pub fn trigger_pendsv() {
    // ICSR address: 0xE000_ED04, PENDSVSET = bit 28
    const ICSR: *mut u32 = 0xE000_ED04 as *mut u32;
    unsafe {
        core::ptr::write_volatile(ICSR, 1 << 28);
    }
}

// ---------------------------------------------------------------------------
// Interrupt priority configuration
// ---------------------------------------------------------------------------

/// Set PendSV and SysTick to the lowest interrupt priority.
pub fn set_interrupt_priorities() {
    unsafe {
        // System Handler Priority Register 3 (SHPR3): 0xE000_ED20
        // Bits [23:16] = PendSV priority
        // Bits [31:24] = SysTick priority
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = core::ptr::read_volatile(shpr3);
        let val = val | (0xFF << 16) | (0xFF << 24);
        core::ptr::write_volatile(shpr3, val);
    }
}

// ---------------------------------------------------------------------------
// Launch
// ---------------------------------------------------------------------------

/// Move the initial thread onto its process stack and run `body` there.
/// `body` typically calls [`Kernel::start`] and creates the first threads;
/// when it returns the initial thread exits.
pub fn launch(kernel: &'static Kernel<CortexM4>, body: fn(&'static Kernel<CortexM4>)) -> ! {
    BOOT.call_once(|| body);
    let slot = kernel.inspect(|s| s.initial_thread()).slot();

    unsafe {
        let top = reset_stack(slot);
        asm!(
            "msr psp, r0",
            // Thread mode uses PSP from here on (CONTROL.SPSEL = 1)
            "movs r2, #2",
            "msr control, r2",
            "isb",
            "bx r1",
            in("r0") top,
            in("r1") boot_trampoline as usize,
            options(noreturn)
        );
    }
}

extern "C" fn boot_trampoline() -> ! {
    let Some(kernel) = KERNEL.get() else {
        panic!("launch without an initialized kernel");
    };
    if let Some(body) = BOOT.get() {
        body(kernel);
    }
    kernel.exit(0)
}

// ---------------------------------------------------------------------------
// Exception handlers
// ---------------------------------------------------------------------------

// PendSV performs the switch the scheduler decided on:
// 1. Save R4-R11 onto the outgoing thread's stack (PSP)
// 2. Swap stack pointers through `donos_swap_stacks`
// 3. Restore R4-R11 from the incoming thread's stack
// 4. Return to Thread mode on PSP (EXC_RETURN = 0xFFFFFFFD)
global_asm!(
    ".section .text.PendSV,\"ax\",%progbits",
    ".global PendSV",
    ".type PendSV,%function",
    ".thumb_func",
    "PendSV:",
    "    mrs r0, psp",
    "    stmdb r0!, {{r4-r11}}",
    "    bl {swap}",
    "    ldmia r0!, {{r4-r11}}",
    "    msr psp, r0",
    "    ldr r0, =0xFFFFFFFD",
    "    bx r0",
    swap = sym donos_swap_stacks,
);

#[no_mangle]
extern "C" fn donos_swap_stacks(saved: usize) -> usize {
    match KERNEL.get() {
        Some(kernel) => kernel.port().swap_stacks(saved),
        None => saved,
    }
}

/// SysTick exception handler: one scheduler tick.
#[no_mangle]
pub extern "C" fn SysTick() {
    if let Some(kernel) = KERNEL.get() {
        kernel.timer_interrupt();
    }
}
