//! # MLFQS
//!
//! 4.4BSD-style multi-level feedback queue scheduling. Priorities are
//! derived, not assigned:
//!
//! ```text
//! every tick        running.recent_cpu += 1            (not the idle thread)
//! every second      load_avg   = 59/60 * load_avg + 1/60 * ready_threads
//!                   recent_cpu = (2*load_avg)/(2*load_avg + 1) * recent_cpu + nice
//! every 4th tick    priority   = PRI_MAX - round(recent_cpu / 4) - 2 * nice
//! ```
//!
//! `ready_threads` counts the ready queue plus the running thread unless it
//! is idle. All arithmetic is 17.14 fixed point.

use log::debug;

use crate::config::{PRIORITY_UPDATE_INTERVAL, PRI_MAX, PRI_MIN};
use crate::fixed_point::Fixed;
use crate::thread::{Thread, ThreadId, ThreadTable};

pub struct Mlfqs {
    load_avg: Fixed,
}

impl Mlfqs {
    pub const fn new() -> Self {
        Self {
            load_avg: Fixed::ZERO,
        }
    }

    pub fn load_avg(&self) -> Fixed {
        self.load_avg
    }

    pub fn on_tick(&mut self, threads: &mut ThreadTable, ticks: u64, timer_freq: u32) {
        let current = threads.current();
        if !threads.is_idle(current) {
            let thread = threads.thread_mut(current);
            thread.recent_cpu = thread.recent_cpu.add_int(1);
        }

        if ticks % u64::from(timer_freq) == 0 {
            self.update_load_avg(threads);
            self.decay_recent_cpu(threads);
        }

        if ticks % PRIORITY_UPDATE_INTERVAL == 0 {
            self.update_priorities(threads);
        }
    }

    fn update_load_avg(&mut self, threads: &ThreadTable) {
        let running = usize::from(!threads.is_idle(threads.current()));
        let ready = (threads.ready.len() + running) as i32;
        self.load_avg = Fixed::ratio(59, 60) * self.load_avg + Fixed::ratio(1, 60).mul_int(ready);
        debug!(
            "load average {} ({} ready)",
            self.load_avg.mul_int(100).to_int_round(),
            ready
        );
    }

    fn decay_recent_cpu(&self, threads: &mut ThreadTable) {
        let twice = self.load_avg.mul_int(2);
        let decay = twice / twice.add_int(1);
        for i in 0..threads.registry().len() {
            let id = threads.registry()[i];
            let thread = threads.thread_mut(id);
            thread.recent_cpu = (decay * thread.recent_cpu).add_int(thread.nice);
        }
    }

    fn update_priorities(&self, threads: &mut ThreadTable) {
        for i in 0..threads.registry().len() {
            let id = threads.registry()[i];
            let thread = threads.thread_mut(id);
            let priority = priority_of(thread);
            thread.base_priority = priority;
            thread.priority = priority;
        }
        threads.resort_ready();
    }

    /// Manual priorities are not inherited under MLFQS; the value is
    /// written straight through and replaced at the next recomputation.
    pub fn set_priority(&self, threads: &mut ThreadTable, id: ThreadId, priority: u8) {
        let thread = threads.thread_mut(id);
        thread.base_priority = priority;
        threads.set_effective(id, priority);
    }

    pub fn set_nice(&self, threads: &mut ThreadTable, id: ThreadId, nice: i32) {
        let thread = threads.thread_mut(id);
        thread.nice = nice;
        let priority = priority_of(thread);
        thread.base_priority = priority;
        threads.set_effective(id, priority);
    }
}

impl Default for Mlfqs {
    fn default() -> Self {
        Self::new()
    }
}

fn priority_of(thread: &Thread) -> u8 {
    let raw = i32::from(PRI_MAX) - thread.recent_cpu.div_int(4).to_int_round() - thread.nice * 2;
    raw.clamp(i32::from(PRI_MIN), i32::from(PRI_MAX)) as u8
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::config::{BootConfig, PolicyKind, PRI_DEFAULT, PRI_MAX};
    use crate::scheduler::Scheduler;

    fn mlfqs() -> Scheduler {
        let mut s = Scheduler::new(BootConfig::new(PolicyKind::Mlfqs));
        s.start().unwrap();
        s
    }

    #[test]
    fn test_cpu_hog_recent_cpu_rises_priority_falls() {
        let mut s = mlfqs();
        let mut last_cpu = s.get_recent_cpu();
        let mut last_priority = PRI_MAX;

        for tick in 1..100u64 {
            s.timer_interrupt();
            let cpu = s.get_recent_cpu();
            assert!(cpu > last_cpu, "recent_cpu did not grow at tick {}", tick);
            last_cpu = cpu;

            if tick % 4 == 0 {
                let priority = s.get_priority();
                assert!(priority <= last_priority, "priority rose at tick {}", tick);
                last_priority = priority;
            }
        }
        assert_eq!(s.get_recent_cpu(), 9_900);
        assert_eq!(s.get_priority(), PRI_MAX - 24);
    }

    #[test]
    fn test_load_avg_after_one_second() {
        let mut s = mlfqs();
        for _ in 0..100 {
            s.timer_interrupt();
        }
        // one running thread: 1/60 of a thread, times 100
        assert_eq!(s.get_load_avg(), 2);
        // 100 ticks decayed by 2*la/(2*la+1) = 546/16930 -> raw 528
        assert_eq!(s.get_recent_cpu(), 322);
        assert_eq!(s.get_priority(), PRI_MAX - 1);
    }

    #[test]
    fn test_decay_adds_nice_at_second_boundary() {
        let mut s = mlfqs();
        s.set_nice(5);
        for _ in 0..100 {
            s.timer_interrupt();
        }
        assert_eq!(s.get_load_avg(), 2);
        // 3.2226 from the decay plus nice 5
        assert_eq!(s.get_recent_cpu(), 822);
        assert_eq!(s.get_priority(), PRI_MAX - 2 - 10);
    }

    #[test]
    fn test_load_avg_counts_every_ready_thread() {
        let mut s = mlfqs();
        s.create("a", PRI_DEFAULT).unwrap();
        s.create("b", PRI_DEFAULT).unwrap();
        for _ in 0..100 {
            s.timer_interrupt();
        }
        // 3/60
        assert_eq!(s.get_load_avg(), 5);

        for _ in 0..100 {
            s.timer_interrupt();
        }
        // 59/60 * 0.0500 + 3/60, from raw 805 + 819
        assert_eq!(s.get_load_avg(), 10);
    }

    #[test]
    fn test_idle_does_not_accumulate() {
        let mut s = mlfqs();
        let main = s.current();
        s.block();
        for _ in 0..8 {
            s.timer_interrupt();
        }
        assert_eq!(s.thread(main).unwrap().recent_cpu(), crate::fixed_point::Fixed::ZERO);
        assert_eq!(s.stats().idle_ticks, 8);
    }

    #[test]
    fn test_nice_lowers_priority() {
        let mut s = mlfqs();
        s.set_nice(10);
        assert_eq!(s.get_nice(), 10);
        assert_eq!(s.get_priority(), PRI_MAX - 20);
        s.set_nice(-5);
        assert_eq!(s.get_priority(), PRI_MAX);
    }

    #[test]
    fn test_set_priority_writes_through() {
        let mut s = mlfqs();
        s.set_priority(12);
        let main = s.current();
        assert_eq!(s.get_priority(), 12);
        assert_eq!(s.thread(main).unwrap().base_priority(), 12);
    }

    #[test]
    fn test_no_donation_under_mlfqs() {
        let mut s = mlfqs();
        let main = s.current();
        s.set_priority(20);
        let x = s.lock_create().unwrap();
        assert_eq!(s.lock_acquire(x), crate::sync::Wait::Done);
        s.create("high", 40).unwrap();
        assert_eq!(s.lock_acquire(x), crate::sync::Wait::Blocked);
        assert_eq!(s.current(), main);
        assert_eq!(s.get_priority(), 20);
    }
}
