//! Utilities specific to the x86_64 architecture.

mod cpuid;
pub use cpuid::*;

/// Read the time stamp counter.
#[inline]
pub fn get_ticks() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}
