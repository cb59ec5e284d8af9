use crate::perf::ffi;
use nix::errno::Errno;
use nix::libc;
use std::os::unix::io::FromRawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Revisions of the `perf_event_attr` ABI understood by this crate and by the kernel.
pub struct PerfVersion {
    /// Revision of the attribute structure compiled into this crate.
    tool: u32,
    /// Revision of the attribute structure accepted by the running kernel.
    os: u32,
}

/// Map an attribute size to its ABI revision.
fn revision_of(size: u32) -> Option<u32> {
    ffi::PERF_ATTR_SIZES
        .iter()
        .rev()
        .find(|(_, s)| size >= *s)
        .map(|(v, _)| *v)
}

impl PerfVersion {
    /// Create a new PerfVersion structure directly
    pub fn new(tool: u32, os: u32) -> Self {
        PerfVersion { tool, os }
    }

    /// Probe the kernel with a cycles counter carrying our attribute size.
    ///
    /// A kernel older than the bindings rejects the call with `E2BIG` and writes back the size
    /// it supports.
    pub fn detect() -> Self {
        let tool_size = std::mem::size_of::<ffi::perf_event_attr>() as u32;
        let tool = revision_of(tool_size).unwrap_or(0);
        let mut attr = ffi::perf_attr_init(
            ffi::PERF_TYPE_HARDWARE as u32,
            ffi::PERF_COUNT_HW_CPU_CYCLES as u64,
        );
        let os = match ffi::perf_event_open(&mut attr, 0, -1, -1, libc::c_ulong::from(0u8)) {
            Ok(fd) => {
                drop(unsafe { std::fs::File::from_raw_fd(fd) });
                tool
            }
            Err(crate::Error::HardwareEvent(Errno::E2BIG)) => revision_of(attr.size).unwrap_or(0),
            Err(_) => 0,
        };
        PerfVersion { tool, os }
    }

    /// Get the compiled ABI revision.
    #[inline]
    pub fn tool(&self) -> u32 {
        self.tool
    }

    /// Get the kernel ABI revision.
    #[inline]
    pub fn os(&self) -> u32 {
        self.os
    }
}
