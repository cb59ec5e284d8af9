//! Utilities for creating/opening perf events.

use crate::perf::ffi;
use crate::{Error, Result};
use nix::errno::Errno;
use nix::libc;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

/// Identity of a kernel event: perf major type plus type specific configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId {
    /// Perf major type: hardware/software/raw.
    pub type_: u32,
    /// Perf type specific configuration.
    pub config: u64,
}

impl EventId {
    /// A generic hardware event.
    pub const fn hardware(config: u64) -> Self {
        EventId {
            type_: ffi::PERF_TYPE_HARDWARE as u32,
            config,
        }
    }

    /// A raw PMU event encoded as `event | (umask << 8)`.
    pub const fn raw(event: u64, umask: u64) -> Self {
        EventId {
            type_: ffi::PERF_TYPE_RAW as u32,
            config: event | (umask << 8),
        }
    }
}

/// A group of opened perf events, the leader first.
///
/// Dropping the group closes every descriptor, which is what rolls back a partially opened group.
#[derive(Debug)]
pub struct EventGroup {
    files: Vec<std::fs::File>,
}

impl EventGroup {
    #[cfg(test)]
    pub(crate) fn empty() -> Self {
        EventGroup { files: Vec::new() }
    }

    /// File descriptor of the group leader.
    #[inline]
    pub fn leader_fd(&self) -> RawFd {
        self.files[0].as_raw_fd()
    }

    /// Number of events in the group.
    #[inline]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the group contains no events.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Enable counting for the group.
    pub fn enable(&self) -> Result<()> {
        unsafe { ffi::perf_event_ioc_enable(self.leader_fd()) }.map_err(Error::HardwareEvent)?;
        Ok(())
    }

    /// Disable counting for the group.
    pub fn disable(&self) -> Result<()> {
        unsafe { ffi::perf_event_ioc_disable(self.leader_fd()) }.map_err(Error::HardwareEvent)?;
        Ok(())
    }

    /// Reset the counter of the group leader.
    pub fn reset(&self) -> Result<()> {
        unsafe { ffi::perf_event_ioc_reset(self.leader_fd()) }.map_err(Error::HardwareEvent)?;
        Ok(())
    }

    /// Disable every member individually, ignoring failures.
    pub fn disable_all(&self) {
        for f in &self.files {
            let _ = unsafe { ffi::perf_event_ioc_disable(f.as_raw_fd()) };
        }
    }

    /// Read the current value of the group leader.
    pub fn read_value(&self) -> Result<u64> {
        let mut bytes = [0u8; 8];
        let n = nix::unistd::read(self.leader_fd(), &mut bytes).map_err(Error::HardwareEvent)?;
        if n != bytes.len() {
            return Err(Error::HardwareEvent(Errno::EIO));
        }
        Ok(u64::from_ne_bytes(bytes))
    }
}

/// Helper struct to open counting and sampling events.
#[derive(Debug, Clone)]
pub struct PerfEventBuilder {
    /// Target process ID.
    ///
    /// Defaults to current process.
    pid: libc::pid_t,
    /// Target CPU ID.
    ///
    /// Defaults to all CPUs.
    cpuid: libc::c_int,
    /// Sampling period of the group leader. `0` opens counting events.
    period: u64,
    /// Record the instruction pointer with each sample.
    sample_ip: bool,
    /// Record the counter values of the group with each sample.
    sample_read: bool,
}

impl Default for PerfEventBuilder {
    fn default() -> Self {
        PerfEventBuilder {
            pid: 0,
            cpuid: -1,
            period: 0,
            sample_ip: false,
            sample_read: false,
        }
    }
}

impl PerfEventBuilder {
    /// Build the attribute of the `index`-th member of a group of `count` events.
    fn attr(&self, id: EventId, index: usize, count: usize) -> ffi::perf_event_attr {
        let mut attr = ffi::perf_attr_init(id.type_, id.config);
        if index > 0 {
            // Followers run whenever the leader does.
            attr.set_disabled(0);
            return attr;
        }
        if self.period > 0 {
            attr.__bindgen_anon_1.sample_period = self.period;
            let mut sample_type = 0u64;
            if self.sample_ip {
                sample_type |= ffi::PERF_SAMPLE_IP as u64;
            }
            if self.sample_read {
                sample_type |= ffi::PERF_SAMPLE_READ as u64;
            }
            attr.sample_type = sample_type;
            if self.sample_read && count > 1 {
                attr.read_format = ffi::PERF_FORMAT_GROUP as u64;
            }
        }
        attr
    }

    /// Open a single event.
    pub fn open(&self, id: EventId) -> Result<EventGroup> {
        self.open_group(&[id])
    }

    /// Open a group of events, the first of `ids` being the leader.
    ///
    /// Descriptors opened before a failure are closed before the error is returned.
    pub fn open_group(&self, ids: &[EventId]) -> Result<EventGroup> {
        if ids.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let mut group = EventGroup {
            files: Vec::with_capacity(ids.len()),
        };
        for (i, id) in ids.iter().enumerate() {
            let mut attr = self.attr(*id, i, ids.len());
            let leader = if i == 0 { -1 } else { group.leader_fd() };
            let fd = ffi::perf_event_open(
                &mut attr,
                self.pid,
                self.cpuid,
                leader,
                ffi::PERF_FLAG_FD_CLOEXEC as _,
            )?;
            group.files.push(unsafe { std::fs::File::from_raw_fd(fd) });
        }
        Ok(group)
    }

    builder_pattern!(
        /// Set process to be monitored.
        ///
        /// Set `0` for current process.
        pid: libc::pid_t
    );

    builder_pattern!(
        /// Set CPU to be monitored.
        ///
        /// Set `-1` for any CPU.
        cpuid: libc::c_int
    );

    builder_pattern!(
        /// Set the sampling period of the group leader.
        set_period => period: u64
    );

    builder_pattern_bool!(
        /// Record instruction pointers.
        enable_sample_ip => sample_ip
    );

    builder_pattern_bool!(
        /// Record counter values.
        enable_sample_read => sample_read
    );
}
