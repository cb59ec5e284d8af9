//! Host architecture specific details: event table selection, CPU identification, tick source.

use crate::pmu::events::EventTable;

/// Architecture specific implementation details of performance counters:
#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::{get_cpu_string, get_ticks};

/// Size in bytes of the jump instruction the profiling stub patches on this host.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub const HOST_JUMP_SIZE: usize = 5;
/// Size in bytes of the jump instruction the profiling stub patches on this host.
#[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
pub const HOST_JUMP_SIZE: usize = 4;
/// Size in bytes of the jump instruction the profiling stub patches on this host.
#[cfg(target_arch = "powerpc64")]
pub const HOST_JUMP_SIZE: usize = 16;
/// Size in bytes of the jump instruction the profiling stub patches on this host.
#[cfg(not(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "arm",
    target_arch = "aarch64",
    target_arch = "powerpc64"
)))]
pub const HOST_JUMP_SIZE: usize = 4;

/// Select the event table of the host once at startup.
pub fn event_table() -> Box<dyn EventTable> {
    use crate::pmu::events::*;
    if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
        Box::new(X86Events)
    } else if cfg!(any(target_arch = "arm", target_arch = "aarch64")) {
        Box::new(ArmEvents)
    } else if cfg!(any(target_arch = "powerpc", target_arch = "powerpc64")) {
        Box::new(PpcEvents)
    } else {
        Box::new(GenericEvents)
    }
}

/// Get a CPU model string for hosts without `cpuid`.
#[cfg(not(target_arch = "x86_64"))]
pub fn get_cpu_string() -> String {
    std::env::consts::ARCH.to_string()
}

/// Monotonic nanosecond clock for hosts without a cheap cycle counter.
#[cfg(not(target_arch = "x86_64"))]
pub fn get_ticks() -> u64 {
    use nix::time::{clock_gettime, ClockId};
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmu::events::EventCode;

    #[test]
    fn test_host_table() {
        let table = event_table();
        assert!(table.lookup(EventCode::Instructions).is_some());
        #[cfg(target_arch = "x86_64")]
        assert_eq!(table.name(), "x86");
    }

    #[test]
    fn test_ticks_advance() {
        let t0 = get_ticks();
        let tmp: u64 = (0u64..10_000).sum();
        println!("Val: {}", tmp);
        assert!(get_ticks() >= t0);
    }
}
