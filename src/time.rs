//! Millisecond time base
//!
//! Drivers never spin on a global flag. They take a [`Clock`], build a
//! [`Timeout`] deadline from it and poll against that, which keeps the wait
//! bounded on hardware and lets tests drive time by hand.

use core::sync::atomic::{AtomicU64, Ordering};

/// Monotonic millisecond clock with a blocking sleep
pub trait Clock {
    /// Milliseconds since an arbitrary fixed point
    fn now_ms(&self) -> u64;

    /// Block for at least `ms` milliseconds
    fn sleep_ms(&self, ms: u64);
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        (**self).sleep_ms(ms)
    }
}

/// Deadline helper for polling loops
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    deadline: u64,
}

impl Timeout {
    /// A deadline `ms` milliseconds from now
    pub fn from_ms(clock: &impl Clock, ms: u64) -> Self {
        Self {
            deadline: clock.now_ms().saturating_add(ms),
        }
    }

    pub fn is_expired(&self, clock: &impl Clock) -> bool {
        clock.now_ms() >= self.deadline
    }

    /// Milliseconds left before the deadline
    pub fn remaining_ms(&self, clock: &impl Clock) -> u64 {
        self.deadline.saturating_sub(clock.now_ms())
    }
}

/// Ticks counted by the timer interrupt, one per millisecond
static TICKS_MS: AtomicU64 = AtomicU64::new(0);

/// Called from the 1 kHz timer interrupt handler
pub fn on_timer_tick() {
    TICKS_MS.fetch_add(1, Ordering::Relaxed);
}

/// Clock driven by the kernel's timer interrupt
#[derive(Debug, Clone, Copy, Default)]
pub struct TickClock;

impl Clock for TickClock {
    fn now_ms(&self) -> u64 {
        TICKS_MS.load(Ordering::Relaxed)
    }

    fn sleep_ms(&self, ms: u64) {
        let timeout = Timeout::from_ms(self, ms);
        while !timeout.is_expired(self) {
            #[cfg(all(target_arch = "x86_64", target_os = "none"))]
            crate::arch::x86_64::halt();
            #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
            core::hint::spin_loop();
        }
    }
}
