//! C entry points called from generated code.
//!
//! Every function works on the process wide table returned by [`metrics`].

use crate::metrics::RegionProfiler;
use lazy_static::lazy_static;
use std::cell::Cell;
use std::ffi::CStr;
use std::os::raw::{c_char, c_ulonglong};

lazy_static! {
    static ref METRICS: RegionProfiler = RegionProfiler::new();
}

thread_local! {
    /// Region being timed on this thread and its start tick.
    static TIMESTAMP: Cell<(u64, u64)> = Cell::new((0, 0));
}

/// The process wide region table.
pub fn metrics() -> &'static RegionProfiler {
    &METRICS
}

/// Count one execution of the region at `address`.
#[no_mangle]
pub extern "C" fn increment_num_executions(address: u64) {
    METRICS.increment_executions(address, 1);
}

/// Count one compilation of the region at `address`.
#[no_mangle]
pub extern "C" fn increment_num_compilations(address: u64) {
    METRICS.increment_compilations(address, 1);
}

/// Add `val` ticks of execution time.
#[no_mangle]
pub extern "C" fn increment_exec_time(address: u64, val: u64) {
    METRICS.add_exec_time(address, val);
}

/// Add `val` ticks of compilation time.
#[no_mangle]
pub extern "C" fn increment_comp_time(address: u64, val: u64) {
    METRICS.add_comp_time(address, val);
}

/// Record the `len` pass identifiers at `passes` for the region at `address`.
///
/// # Safety
///
/// `passes` must be null or point to `len` readable `u32`s.
#[no_mangle]
pub unsafe extern "C" fn set_optimizations(address: u64, passes: *const u32, len: usize) {
    let ids = if passes.is_null() {
        Vec::new()
    } else {
        std::slice::from_raw_parts(passes, len).to_vec()
    };
    METRICS.set_passes(address, ids);
}

/// Record the fingerprint of the region at `address`.
///
/// # Safety
///
/// `fingerprint` must be null or a NUL terminated string.
#[no_mangle]
pub unsafe extern "C" fn set_fingerprint(address: u64, fingerprint: *const c_char) {
    if fingerprint.is_null() {
        return;
    }
    let fp = CStr::from_ptr(fingerprint).to_string_lossy().into_owned();
    METRICS.set_fingerprint(address, fp);
}

/// Print the region table.
#[no_mangle]
pub extern "C" fn metric_print() {
    METRICS.print();
}

/// Read the high resolution tick counter.
#[no_mangle]
pub extern "C" fn get_ticks() -> c_ulonglong {
    crate::arch::get_ticks() as c_ulonglong
}

/// Start timing the region `id` on the calling thread and count one execution.
#[no_mangle]
pub extern "C" fn timestamp_begin(id: u64) {
    TIMESTAMP.with(|t| t.set((id, crate::arch::get_ticks())));
    METRICS.increment_executions(id, 1);
}

/// Stop timing the region started by `timestamp_begin`.
#[no_mangle]
pub extern "C" fn timestamp_end() {
    let (id, start) = TIMESTAMP.with(|t| t.replace((0, 0)));
    if start != 0 {
        let elapsed = crate::arch::get_ticks().saturating_sub(start);
        METRICS.add_exec_time(id, elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;
    use std::ffi::CString;

    // Addresses are distinct per test, the table is shared by the whole test binary.

    #[test]
    fn test_global_increments() {
        (0..8).into_par_iter().for_each(|_| {
            for _ in 0..500 {
                increment_num_executions(0xdead_0000);
            }
        });
        increment_num_compilations(0xdead_0000);
        increment_comp_time(0xdead_0000, 12);
        let s = metrics().stats(0xdead_0000).unwrap();
        assert_eq!((s.executions, s.compilations, s.comp_time), (4000, 1, 12));
    }

    #[test]
    fn test_setters() {
        let passes = [7u32, 2, 9];
        let fp = CString::new("hot-loop").unwrap();
        unsafe {
            set_optimizations(0xbeef_0000, passes.as_ptr(), passes.len());
            set_fingerprint(0xbeef_0000, fp.as_ptr());
            set_fingerprint(0xbeef_0000, std::ptr::null());
        }
        let s = metrics().stats(0xbeef_0000).unwrap();
        assert_eq!(s.passes, Some(vec![7, 2, 9]));
        assert_eq!(s.fingerprint.as_deref(), Some("hot-loop"));
        assert!(metrics().report().contains("hot-loop;3203334144;0;0;0;0;[7,2,9]\n"));
    }

    #[test]
    fn test_timestamps() {
        timestamp_begin(0xcafe_0000);
        let mut x = 0u64;
        for i in 0..1000u64 {
            x = x.wrapping_add(i);
        }
        assert!(x > 0);
        timestamp_end();
        // A second end without a begin adds nothing.
        timestamp_end();
        let s = metrics().stats(0xcafe_0000).unwrap();
        assert_eq!(s.executions, 1);
        assert!(get_ticks() > 0);
    }
}
