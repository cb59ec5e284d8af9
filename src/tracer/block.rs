//! Translated blocks as seen by the tracer.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// Lifecycle of a block. Transitions only move forward.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockMode {
    /// Never recorded.
    None = 0,
    /// Recorded at least once.
    Active = 1,
    /// Selected as the start of trace formation.
    TraceHead = 2,
}

impl BlockMode {
    fn from_raw(v: u8) -> Self {
        match v {
            0 => BlockMode::None,
            1 => BlockMode::Active,
            _ => BlockMode::TraceHead,
        }
    }
}

/// How the previous block left the code cache before `record` is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitInfo {
    /// No known successor: indirect branch, system call or exception.
    NoSuccessor,
    /// Left a block chained to this one.
    Chained {
        /// Guest address of the predecessor.
        pred_pc: u64,
    },
    /// Left through an exit of an optimized trace.
    TraceExit,
}

/// One translated unit of guest code with a single entry.
///
/// Owned by the code cache; the tracer only touches the mode, the execution counter and the
/// guest image.
#[derive(Debug)]
pub struct Block {
    pc: u64,
    size: u32,
    icount: u32,
    mode: AtomicU8,
    exec_count: AtomicU32,
    tc_ptr: usize,
    patch_jmp: usize,
    patch_next: usize,
    image: Mutex<Option<Box<[u8]>>>,
}

impl Block {
    /// A block of `size` guest bytes holding `icount` instructions at `pc`.
    pub fn new(pc: u64, size: u32, icount: u32) -> Self {
        Block {
            pc,
            size,
            icount,
            mode: AtomicU8::new(BlockMode::None as u8),
            exec_count: AtomicU32::new(0),
            tc_ptr: 0,
            patch_jmp: 0,
            patch_next: 0,
            image: Mutex::new(None),
        }
    }

    /// Attach the host code: its start and the offsets of the profiling patch point and of the
    /// prediction stub.
    pub fn with_host_code(mut self, tc_ptr: usize, patch_jmp: usize, patch_next: usize) -> Self {
        self.tc_ptr = tc_ptr;
        self.patch_jmp = patch_jmp;
        self.patch_next = patch_next;
        self
    }

    /// Guest start address.
    #[inline]
    pub fn pc(&self) -> u64 {
        self.pc
    }

    /// Guest size in bytes.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Guest instruction count.
    #[inline]
    pub fn icount(&self) -> u32 {
        self.icount
    }

    /// Current mode.
    #[inline]
    pub fn mode(&self) -> BlockMode {
        BlockMode::from_raw(self.mode.load(Ordering::Acquire))
    }

    /// Move from `from` to `to` if the block is currently in `from`.
    ///
    /// At most one caller succeeds for a given transition.
    pub fn update_mode(&self, from: BlockMode, to: BlockMode) -> bool {
        if self.mode.load(Ordering::Relaxed) != from as u8 {
            return false;
        }
        self.mode
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Executions counted by the trace head profiler.
    #[inline]
    pub fn exec_count(&self) -> u32 {
        self.exec_count.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_exec_count(&self) -> u32 {
        self.exec_count.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Host address of the profiling patch point.
    #[inline]
    pub fn jmp_entry(&self) -> usize {
        self.tc_ptr + self.patch_jmp
    }

    /// Host address of the prediction stub.
    #[inline]
    pub fn jmp_next(&self) -> usize {
        self.tc_ptr + self.patch_next
    }

    /// Copy of the guest bytes captured on the first visit.
    pub fn image(&self) -> Option<Vec<u8>> {
        self.image.lock().as_ref().map(|b| b.to_vec())
    }

    pub(crate) fn set_image(&self, image: Vec<u8>) {
        *self.image.lock() = Some(image.into_boxed_slice());
    }

    /// Release the guest image once the block has been optimized.
    pub fn delete_image(&self) {
        *self.image.lock() = None;
    }
}
