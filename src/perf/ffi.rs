//! Kernel perf ABI: structure bindings, ioctls and the `perf_event_open` system call.

#![allow(
    clippy::all,
    missing_docs,
    missing_debug_implementations,
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case
)]

use crate::{Error, Result};
use nix::libc;
use nix::{ioctl_none, ioctl_write_int};

pub use perf_event_open_sys::bindings::*;

// The Ioctls are defined as macro functions and skipped by bindgen.
// Details at https://elixir.bootlin.com/linux/v5.3.10/source/include/uapi/linux/perf_event.h#L456
ioctl_none!(perf_event_ioc_enable, b'$', 0);
ioctl_none!(perf_event_ioc_disable, b'$', 1);
ioctl_none!(perf_event_ioc_reset, b'$', 3);
ioctl_write_int!(perf_event_ioc_period, b'$', 4);

/// Size of `perf_event_attr` for each published revision of the ABI.
pub const PERF_ATTR_SIZES: [(u32, u32); 6] = [
    (0, 64),
    (1, 72),
    (2, 80),
    (3, 96),
    (4, 104),
    (5, 112),
];

/// Rust wrapper for the `perf_event_open` system call.
pub fn perf_event_open(
    attr: &mut perf_event_attr,
    pid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: libc::c_int,
    flags: libc::c_ulong,
) -> Result<std::os::unix::io::RawFd> {
    unsafe {
        let fd = libc::syscall(
            libc::SYS_perf_event_open,
            attr as *mut perf_event_attr,
            pid,
            cpu,
            group_fd,
            flags,
        );
        match fd {
            -1 => Err(Error::from_errno()),
            rc => Ok(rc as _),
        }
    }
}

/// Zero an attribute and fill in the fields every event of this crate shares.
///
/// Events start disabled and count user space only.
pub fn perf_attr_init(type_: u32, config: u64) -> perf_event_attr {
    let mut attr = perf_event_attr::default();
    attr.type_ = type_;
    attr.config = config;
    attr.size = std::mem::size_of::<perf_event_attr>() as u32;
    attr.set_disabled(1);
    attr.set_exclude_kernel(1);
    attr.set_exclude_guest(1);
    attr.set_exclude_hv(1);
    attr
}

/// Look up the PMU name whose sysfs `type` matches `type_`.
fn pmu_name(type_: u32) -> Option<String> {
    let entries = glob::glob("/sys/bus/event_source/devices/*/type").ok()?;
    entries.filter_map(std::result::Result::ok).find_map(|path| {
        let val: u32 = std::fs::read_to_string(&path).ok()?.trim().parse().ok()?;
        if val != type_ {
            return None;
        }
        path.parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map(String::from)
    })
}

/// Generate an event string in the style of the `perf` command line tools.
///
/// Used for diagnostics only; falls back to the numeric type when sysfs is unavailable.
pub fn describe_attr(attr: &perf_event_attr) -> String {
    let pmu = pmu_name(attr.type_).unwrap_or_else(|| format!("type{}", attr.type_));
    let mut modifiers = String::new();
    if attr.exclude_user() == 0 {
        modifiers.push('u');
    }
    if attr.exclude_kernel() == 0 {
        modifiers.push('k');
    }
    if attr.exclude_hv() == 0 {
        modifiers.push('h');
    }
    format!("{}/config={:#X}/{}", pmu, attr.config, modifiers)
}
