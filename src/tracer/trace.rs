//! Formed traces, their translated code and the registry the report reads.

use crate::tracer::Block;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Runtime counters of a trace, one set per guest thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecSlot {
    /// Loop back edge taken.
    Loop = 0,
    /// Left through the indirect branch target cache.
    Ibtc = 1,
    /// Left through a trace exit.
    Exit = 2,
}

/// One optimization unit: an ordered chain of blocks.
#[derive(Debug)]
pub struct Trace {
    blocks: Vec<Arc<Block>>,
    loop_head: Option<usize>,
    num_loop: u32,
    num_exit: u32,
    num_indirect_br: u32,
    exec_count: Vec<[AtomicU64; 3]>,
    trans_time_us: AtomicU64,
}

impl Trace {
    /// A trace over `blocks` with counters for `num_threads` guest threads.
    pub fn new(blocks: Vec<Arc<Block>>, loop_head: Option<usize>, num_threads: usize) -> Self {
        let exec_count = (0..num_threads.max(1))
            .map(|_| [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)])
            .collect();
        Trace {
            blocks,
            loop_head,
            num_loop: 0,
            num_exit: 0,
            num_indirect_br: 0,
            exec_count,
            trans_time_us: AtomicU64::new(0),
        }
    }

    /// Record the shape found by the backend.
    pub fn with_shape(mut self, num_loop: u32, num_exit: u32, num_indirect_br: u32) -> Self {
        self.num_loop = num_loop;
        self.num_exit = num_exit;
        self.num_indirect_br = num_indirect_br;
        self
    }

    /// Blocks of the trace.
    #[inline]
    pub fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }

    /// Index of the loop header inside the trace.
    #[inline]
    pub fn loop_head(&self) -> Option<usize> {
        self.loop_head
    }

    /// Guest address of the first block.
    pub fn entry_pc(&self) -> u64 {
        self.blocks.first().map(|b| b.pc()).unwrap_or(0)
    }

    /// Number of loops.
    #[inline]
    pub fn num_loop(&self) -> u32 {
        self.num_loop
    }

    /// Number of exits.
    #[inline]
    pub fn num_exit(&self) -> u32 {
        self.num_exit
    }

    /// Number of indirect branches.
    #[inline]
    pub fn num_indirect_br(&self) -> u32 {
        self.num_indirect_br
    }

    /// Total guest bytes.
    pub fn guest_size(&self) -> u64 {
        self.blocks.iter().map(|b| u64::from(b.size())).sum()
    }

    /// Total guest instructions.
    pub fn guest_icount(&self) -> u64 {
        self.blocks.iter().map(|b| u64::from(b.icount())).sum()
    }

    /// Count one runtime event of `slot` on guest thread `cpu`. Unknown threads are ignored.
    #[inline]
    pub fn profile_exec(&self, cpu: usize, slot: ExecSlot) {
        if let Some(c) = self.exec_count.get(cpu) {
            c[slot as usize].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counters of guest thread `cpu` as `[loop, ibtc, exit]`.
    pub fn exec_counts(&self, cpu: usize) -> [u64; 3] {
        match self.exec_count.get(cpu) {
            Some(c) => [
                c[0].load(Ordering::Relaxed),
                c[1].load(Ordering::Relaxed),
                c[2].load(Ordering::Relaxed),
            ],
            None => [0; 3],
        }
    }

    /// Number of guest threads with counters.
    #[inline]
    pub fn num_threads(&self) -> usize {
        self.exec_count.len()
    }

    /// Add translation time, in microseconds.
    pub fn add_trans_time(&self, us: u64) {
        self.trans_time_us.fetch_add(us, Ordering::Relaxed);
    }

    /// Translation time, in microseconds.
    #[inline]
    pub fn trans_time_us(&self) -> u64 {
        self.trans_time_us.load(Ordering::Relaxed)
    }
}

/// A host code range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheRange {
    /// Start address.
    pub start: usize,
    /// Size in bytes.
    pub size: usize,
}

impl CacheRange {
    /// Whether `ip` falls inside the range.
    #[inline]
    pub fn contains(&self, ip: u64) -> bool {
        let start = self.start as u64;
        ip >= start && ip < start + self.size as u64
    }
}

/// Host code generated for a trace.
#[derive(Debug)]
pub struct TranslatedCode {
    trace: Arc<Trace>,
    code: usize,
    size: usize,
    sample_count: AtomicU64,
}

impl TranslatedCode {
    /// Host code of `size` bytes at `code` implementing `trace`.
    pub fn new(trace: Arc<Trace>, code: usize, size: usize) -> Self {
        TranslatedCode {
            trace,
            code,
            size,
            sample_count: AtomicU64::new(0),
        }
    }

    /// The trace.
    #[inline]
    pub fn trace(&self) -> &Arc<Trace> {
        &self.trace
    }

    /// Host start address.
    #[inline]
    pub fn code(&self) -> usize {
        self.code
    }

    /// Host size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the host code covers `ip`.
    #[inline]
    pub fn contains(&self, ip: u64) -> bool {
        ip >= self.code as u64 && ip < (self.code + self.size) as u64
    }

    /// Instruction pointer samples attributed to this code.
    #[inline]
    pub fn sample_count(&self) -> u64 {
        self.sample_count.load(Ordering::Relaxed)
    }

    pub(crate) fn add_samples(&self, n: u64) {
        self.sample_count.fetch_add(n, Ordering::Relaxed);
    }
}

/// Every trace translated since the last code cache flush.
#[derive(Debug, Default)]
pub struct TraceRegistry {
    codes: RwLock<Vec<Arc<TranslatedCode>>>,
    num_flush: AtomicU64,
    block_cache: RwLock<CacheRange>,
    trace_cache: RwLock<CacheRange>,
    block_code_used: AtomicUsize,
}

impl TraceRegistry {
    /// An empty registry over the given block and trace code caches.
    pub fn new(block_cache: CacheRange, trace_cache: CacheRange) -> Self {
        TraceRegistry {
            block_cache: RwLock::new(block_cache),
            trace_cache: RwLock::new(trace_cache),
            ..Default::default()
        }
    }

    /// Add translated code, returning its index.
    pub fn register(&self, code: TranslatedCode) -> usize {
        let mut codes = self.codes.write();
        codes.push(Arc::new(code));
        codes.len() - 1
    }

    /// Drop every trace after a code cache flush.
    pub fn flush(&self) {
        self.codes.write().clear();
        self.block_code_used.store(0, Ordering::Relaxed);
        self.num_flush.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the registered code, in registration order.
    pub fn codes(&self) -> Vec<Arc<TranslatedCode>> {
        self.codes.read().clone()
    }

    /// Number of registered traces.
    pub fn len(&self) -> usize {
        self.codes.read().len()
    }

    /// Whether no trace is registered.
    pub fn is_empty(&self) -> bool {
        self.codes.read().is_empty()
    }

    /// Code cache flushes so far.
    #[inline]
    pub fn num_flush(&self) -> u64 {
        self.num_flush.load(Ordering::Relaxed)
    }

    /// Block code cache.
    pub fn block_cache(&self) -> CacheRange {
        *self.block_cache.read()
    }

    /// Trace code cache.
    pub fn trace_cache(&self) -> CacheRange {
        *self.trace_cache.read()
    }

    /// Set both cache ranges.
    pub fn set_caches(&self, block_cache: CacheRange, trace_cache: CacheRange) {
        *self.block_cache.write() = block_cache;
        *self.trace_cache.write() = trace_cache;
    }

    /// Record how much of the block cache holds code.
    pub fn set_block_code_used(&self, bytes: usize) {
        self.block_code_used.store(bytes, Ordering::Relaxed);
    }

    /// Bytes of block code.
    pub fn block_code_used(&self) -> usize {
        self.block_code_used.load(Ordering::Relaxed)
    }

    /// Bytes of trace code.
    pub fn trace_code_used(&self) -> usize {
        self.codes.read().iter().map(|c| c.size()).sum()
    }
}
