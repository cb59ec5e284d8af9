//! Processor identification through the `cpuid` instruction.

use core::arch::x86_64::__cpuid;

/// Vendor and signature of an x86_64 processor.
///
/// More information at https://en.wikipedia.org/wiki/CPUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuId {
    /// Vendor identification string, e.g. `GenuineIntel`.
    pub vendor: String,
    /// Display family, extended family folded in.
    pub family: u32,
    /// Display model, extended model folded in.
    pub model: u32,
    /// Stepping.
    pub step: u32,
}

impl CpuId {
    /// Query the running processor.
    // `__cpuid` is a safe function on newer toolchains.
    #[allow(unused_unsafe)]
    pub fn read() -> Self {
        let mut vendor = [0u8; 12];
        let res = unsafe { __cpuid(0) };
        vendor[0..4].copy_from_slice(&res.ebx.to_ne_bytes());
        vendor[4..8].copy_from_slice(&res.edx.to_ne_bytes());
        vendor[8..12].copy_from_slice(&res.ecx.to_ne_bytes());

        let mut id = CpuId {
            vendor: String::from_utf8_lossy(&vendor).into_owned(),
            family: 0,
            model: 0,
            step: 0,
        };
        if res.eax >= 1 {
            let sig = unsafe { __cpuid(1) }.eax;
            id.step = sig & 0xf;
            id.model = (sig >> 4) & 0xf;
            id.family = (sig >> 8) & 0xf;
            if id.family == 0xf {
                id.family += (sig >> 20) & 0xff;
            }
            if id.family >= 0x6 {
                id.model += ((sig >> 16) & 0xf) << 4;
            }
        }
        id
    }
}

impl std::fmt::Display for CpuId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{:X}-{:X}-{:X}",
            self.vendor, self.family, self.model, self.step
        )
    }
}

/// Get CPU model string for x86_64 processors.
pub fn get_cpu_string() -> String {
    CpuId::read().to_string()
}
