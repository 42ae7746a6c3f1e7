//! x86_64 architecture support

pub mod io;

/// Halt the CPU until the next interrupt
#[inline]
pub fn halt() {
    ::x86_64::instructions::hlt();
}

/// Read the Time Stamp Counter (TSC)
///
/// Increments at a constant rate on every CPU this kernel supports, which is
/// good enough for relative log timestamps.
#[inline]
pub fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}
