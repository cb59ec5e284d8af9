//! Trace formation.
//!
//! The dispatch loop calls [`Tracer::record`] before entering the code cache with a block. The
//! generated code of a trace head calls back into [`NetTracer::profile`] while it is being
//! counted, and into [`NetTracer::predict`] for every block executed once prediction started.

use crate::config::{TracerConfig, TransMode};
use crate::perfmon::{HardwarePerfmon, SoftwarePerfmon};
use std::fmt;
use std::sync::Arc;

mod block;
pub use block::{Block, BlockMode, ExitInfo};

mod trace;
pub use trace::{CacheRange, ExecSlot, Trace, TraceRegistry, TranslatedCode};

mod net;
pub use net::NetTracer;

/// Optimization requests, served asynchronously by the compilation backend.
pub trait OptimizationBackend: Send + Sync {
    /// Optimize one block.
    fn optimize_block(&self, cpu: usize, block: &Arc<Block>);

    /// Optimize a chain of blocks. `loop_head` indexes the block the last one loops back to.
    fn optimize_trace(&self, cpu: usize, blocks: Vec<Arc<Block>>, loop_head: Option<usize>);

    /// Whether static analysis marked `pc` as a loop header.
    fn has_loop_annotation(&self, _pc: u64) -> bool {
        false
    }
}

/// Rewrites jumps in generated host code.
pub trait CodePatcher: Send + Sync {
    /// Point the jump at host address `at` to `target`.
    fn patch_jump(&self, at: usize, target: usize);
}

/// Guest code reader.
pub trait GuestMemory: Send + Sync {
    /// Read `len` bytes of guest code at `pc`.
    fn read_code(&self, pc: u64, len: usize) -> Option<Vec<u8>>;
}

/// Everything a tracer shares with the rest of the translator.
#[derive(Clone)]
pub struct TracerContext {
    config: Arc<TracerConfig>,
    backend: Arc<dyn OptimizationBackend>,
    patcher: Arc<dyn CodePatcher>,
    memory: Option<Arc<dyn GuestMemory>>,
    soft: Arc<SoftwarePerfmon>,
    hard: Option<Arc<HardwarePerfmon>>,
    registry: Arc<TraceRegistry>,
}

impl TracerContext {
    /// A context with a software perfmon built from the configured profile level, no hardware
    /// perfmon and an empty trace registry.
    pub fn new(
        config: TracerConfig,
        backend: Arc<dyn OptimizationBackend>,
        patcher: Arc<dyn CodePatcher>,
    ) -> Self {
        let soft = Arc::new(SoftwarePerfmon::new(
            config.profile_level(),
            config.cover_set(),
        ));
        TracerContext {
            config: Arc::new(config),
            backend,
            patcher,
            memory: None,
            soft,
            hard: None,
            registry: Arc::new(TraceRegistry::default()),
        }
    }

    /// Snapshot guest code of new blocks from `memory`.
    pub fn with_memory(mut self, memory: Arc<dyn GuestMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Use a shared software perfmon.
    pub fn with_soft(mut self, soft: Arc<SoftwarePerfmon>) -> Self {
        self.soft = soft;
        self
    }

    /// Register tracers with a hardware perfmon.
    pub fn with_hard(mut self, hard: Arc<HardwarePerfmon>) -> Self {
        self.hard = Some(hard);
        self
    }

    /// Use a shared trace registry.
    pub fn with_registry(mut self, registry: Arc<TraceRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Tracer configuration.
    #[inline]
    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    /// Optimization backend.
    #[inline]
    pub fn backend(&self) -> &dyn OptimizationBackend {
        &*self.backend
    }

    /// Software perfmon.
    #[inline]
    pub fn soft(&self) -> &Arc<SoftwarePerfmon> {
        &self.soft
    }

    /// Hardware perfmon, if any.
    #[inline]
    pub fn hard(&self) -> Option<&Arc<HardwarePerfmon>> {
        self.hard.as_ref()
    }

    /// Trace registry.
    #[inline]
    pub fn registry(&self) -> &Arc<TraceRegistry> {
        &self.registry
    }

    fn patch_jump(&self, at: usize, target: usize) {
        self.patcher.patch_jump(at, target);
    }

    fn read_code(&self, block: &Block) -> Option<Vec<u8>> {
        self.memory
            .as_ref()
            .and_then(|m| m.read_code(block.pc(), block.size() as usize))
    }
}

impl fmt::Debug for TracerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracerContext")
            .field("config", &self.config)
            .field("memory", &self.memory.is_some())
            .field("soft", &self.soft)
            .field("hard", &self.hard.is_some())
            .field("registry", &self.registry.len())
            .finish()
    }
}

/// Per thread trace formation policy.
pub trait Tracer: Send {
    /// Translation mode served by the tracer.
    fn mode(&self) -> TransMode;

    /// Drop any partially formed trace.
    fn reset(&mut self);

    /// Called before `block` is executed; `exit` tells how the previous block was left.
    fn record(&mut self, exit: ExitInfo, block: &Arc<Block>);

    /// The NET tracer, for the callbacks of generated code.
    fn as_net(&mut self) -> Option<&mut NetTracer> {
        None
    }
}

/// Never forms traces.
#[derive(Debug, Default)]
pub struct NullTracer;

impl Tracer for NullTracer {
    fn mode(&self) -> TransMode {
        TransMode::None
    }

    fn reset(&mut self) {}

    fn record(&mut self, _exit: ExitInfo, _block: &Arc<Block>) {}
}

/// Optimizes every block the first time it is seen.
#[derive(Debug)]
pub struct SingleBlockTracer {
    ctx: TracerContext,
    cpu: usize,
    last: Option<Arc<Block>>,
}

impl SingleBlockTracer {
    /// A block tracer for guest thread `cpu`.
    pub fn new(ctx: TracerContext, cpu: usize) -> Self {
        SingleBlockTracer {
            ctx,
            cpu,
            last: None,
        }
    }

    /// Last recorded block.
    pub fn last(&self) -> Option<&Arc<Block>> {
        self.last.as_ref()
    }
}

impl Tracer for SingleBlockTracer {
    fn mode(&self) -> TransMode {
        TransMode::Block
    }

    fn reset(&mut self) {
        self.last = None;
    }

    fn record(&mut self, _exit: ExitInfo, block: &Arc<Block>) {
        if block.update_mode(BlockMode::None, BlockMode::Active) {
            self.ctx.backend.optimize_block(self.cpu, block);
        }
        self.last = Some(Arc::clone(block));
    }
}

/// Build the tracer of guest thread `cpu` for the configured translation mode.
pub fn create_tracer(ctx: &TracerContext, cpu: usize) -> Box<dyn Tracer> {
    match ctx.config.mode() {
        TransMode::None => Box::new(NullTracer),
        TransMode::Block => Box::new(SingleBlockTracer::new(ctx.clone(), cpu)),
        mode @ TransMode::HybridS | mode @ TransMode::HybridM => {
            Box::new(NetTracer::new(ctx.clone(), cpu, mode))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Request as seen by the backend: block pcs and loop head.
    pub(crate) type Request = (Vec<u64>, Option<usize>);

    #[derive(Debug, Default)]
    pub(crate) struct RecordingBackend {
        pub blocks: Mutex<Vec<u64>>,
        pub traces: Mutex<Vec<Request>>,
        pub loop_heads: Vec<u64>,
    }

    impl OptimizationBackend for RecordingBackend {
        fn optimize_block(&self, _cpu: usize, block: &Arc<Block>) {
            self.blocks.lock().push(block.pc());
        }

        fn optimize_trace(&self, _cpu: usize, blocks: Vec<Arc<Block>>, loop_head: Option<usize>) {
            let pcs = blocks.iter().map(|b| b.pc()).collect();
            self.traces.lock().push((pcs, loop_head));
        }

        fn has_loop_annotation(&self, pc: u64) -> bool {
            self.loop_heads.contains(&pc)
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct RecordingPatcher {
        pub patches: Mutex<Vec<(usize, usize)>>,
    }

    impl CodePatcher for RecordingPatcher {
        fn patch_jump(&self, at: usize, target: usize) {
            self.patches.lock().push((at, target));
        }
    }

    pub(crate) fn context(
        config: TracerConfig,
        backend: Arc<RecordingBackend>,
        patcher: Arc<RecordingPatcher>,
    ) -> TracerContext {
        TracerContext::new(config, backend, patcher)
    }

    #[test]
    fn test_create_tracer() {
        let backend = Arc::new(RecordingBackend::default());
        let patcher = Arc::new(RecordingPatcher::default());
        for mode in &[
            TransMode::None,
            TransMode::Block,
            TransMode::HybridS,
            TransMode::HybridM,
        ] {
            let ctx = context(
                TracerConfig::default().set_mode(*mode),
                backend.clone(),
                patcher.clone(),
            );
            let mut tracer = create_tracer(&ctx, 0);
            assert_eq!(tracer.mode(), *mode);
            let is_net = *mode == TransMode::HybridS || *mode == TransMode::HybridM;
            assert_eq!(tracer.as_net().is_some(), is_net);
        }
    }

    #[test]
    fn test_null_tracer() {
        let mut tracer = NullTracer;
        let b = Arc::new(Block::new(0x100, 4, 1));
        tracer.record(ExitInfo::NoSuccessor, &b);
        assert_eq!(b.mode(), BlockMode::None);
    }

    #[test]
    fn test_single_block_tracer() {
        let backend = Arc::new(RecordingBackend::default());
        let patcher = Arc::new(RecordingPatcher::default());
        let ctx = context(
            TracerConfig::default().set_mode(TransMode::Block),
            backend.clone(),
            patcher,
        );
        let mut tracer = SingleBlockTracer::new(ctx, 0);
        let a = Arc::new(Block::new(0x100, 4, 1));
        let b = Arc::new(Block::new(0x200, 4, 1));
        tracer.record(ExitInfo::NoSuccessor, &a);
        tracer.record(ExitInfo::Chained { pred_pc: 0x100 }, &b);
        tracer.record(ExitInfo::Chained { pred_pc: 0x200 }, &a);
        assert_eq!(*backend.blocks.lock(), vec![0x100, 0x200]);
        assert_eq!(a.mode(), BlockMode::Active);
        assert_eq!(tracer.last().map(|b| b.pc()), Some(0x100));
        assert!(backend.traces.lock().is_empty());
    }
}
