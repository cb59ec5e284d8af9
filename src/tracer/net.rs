//! Next-executing-tail trace formation.

use crate::arch::HOST_JUMP_SIZE;
use crate::config::{HeadPolicy, TransMode};
use crate::perfmon::PerfmonData;
use crate::tracer::{Block, BlockMode, ExitInfo, Tracer, TracerContext};
use std::sync::Arc;

/// Why prediction stopped growing the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closure {
    /// The block is already in the sequence at this index.
    Cycle(usize),
    /// Backward branch, under the strict policy.
    Backward,
    /// The block is an annotated loop header in the middle of the sequence.
    Boundary,
}

/// Trace head selection by profiling, then trace tail prediction.
///
/// Heads are blocks entered from a trace exit, from a block without a known successor, or
/// revisited blocks. Once a head has run `profile_threshold` times, the blocks executed next are
/// collected until a cycle closes or `predict_threshold` blocks are predicted.
#[derive(Debug)]
pub struct NetTracer {
    ctx: TracerContext,
    cpu: usize,
    mode: TransMode,
    blocks: Vec<Arc<Block>>,
    predicting: bool,
    fallthrough: bool,
    num_trace_exits: u64,
    perf: Option<PerfmonData>,
}

impl NetTracer {
    /// A tracer for guest thread `cpu`, registered with the hardware perfmon if there is one.
    ///
    /// Must be created on the thread it traces, so that per-thread counters follow it.
    pub fn new(ctx: TracerContext, cpu: usize, mode: TransMode) -> Self {
        let perf = ctx.hard().map(|hp| hp.register_thread());
        NetTracer {
            ctx,
            cpu,
            mode,
            blocks: Vec::new(),
            predicting: false,
            fallthrough: false,
            num_trace_exits: 0,
            perf,
        }
    }

    /// Guest thread index.
    #[inline]
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Blocks predicted so far.
    #[inline]
    pub fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }

    /// Whether prediction is running.
    #[inline]
    pub fn is_predicting(&self) -> bool {
        self.predicting
    }

    /// Mark that the previous block fell through to its successor.
    #[inline]
    pub fn set_fallthrough(&mut self, fallthrough: bool) {
        self.fallthrough = fallthrough;
    }

    /// Count one exit from an optimized trace.
    #[inline]
    pub fn count_trace_exit(&mut self) {
        self.num_trace_exits += 1;
    }

    /// Trace exits counted by this tracer.
    #[inline]
    pub fn num_trace_exits(&self) -> u64 {
        self.num_trace_exits
    }

    fn is_trace_head(&self, exit: ExitInfo, block: &Block, new: bool) -> bool {
        match exit {
            ExitInfo::TraceExit => return true,
            ExitInfo::NoSuccessor if !self.fallthrough => return true,
            _ => {}
        }
        match self.ctx.config().policy() {
            HeadPolicy::Relaxed => !new,
            HeadPolicy::Strict => match exit {
                ExitInfo::Chained { pred_pc } => block.pc() <= pred_pc,
                _ => false,
            },
        }
    }

    /// Called by the counting stub of a trace head.
    ///
    /// When the head reaches the profile threshold its entry jump is pointed at the prediction
    /// stub and prediction starts.
    pub fn profile(&mut self, block: &Arc<Block>) {
        if block.inc_exec_count() != self.ctx.config().profile_threshold() {
            return;
        }
        self.ctx.patch_jump(block.jmp_entry(), block.jmp_next());
        self.predicting = true;
    }

    fn find_closure(&self, block: &Arc<Block>) -> Option<Closure> {
        let first = self.blocks.first()?;
        if !Arc::ptr_eq(first, block) && self.ctx.backend().has_loop_annotation(block.pc()) {
            return Some(Closure::Boundary);
        }
        match self.ctx.config().policy() {
            HeadPolicy::Relaxed => self
                .blocks
                .iter()
                .position(|b| Arc::ptr_eq(b, block))
                .map(Closure::Cycle),
            HeadPolicy::Strict => {
                if Arc::ptr_eq(first, block) {
                    Some(Closure::Cycle(0))
                } else {
                    match self.blocks.last() {
                        Some(last) if block.pc() <= last.pc() => Some(Closure::Backward),
                        _ => None,
                    }
                }
            }
        }
    }

    /// Called for every block executed while predicting.
    pub fn predict(&mut self, block: &Arc<Block>) {
        match self.find_closure(block) {
            Some(Closure::Cycle(idx)) => {
                // The closing block ends the trace; the loop runs from `idx` back to it.
                self.blocks.push(Arc::clone(block));
                self.build(Some(idx));
            }
            Some(Closure::Backward) | Some(Closure::Boundary) => self.build(None),
            None => {
                self.blocks.push(Arc::clone(block));
                if self.blocks.len() >= self.ctx.config().predict_threshold() {
                    self.build(None);
                }
            }
        }
    }

    fn build(&mut self, loop_head: Option<usize>) {
        let blocks = std::mem::take(&mut self.blocks);
        if let Some(idx) = loop_head.filter(|i| *i > 0) {
            let body = blocks[idx..].to_vec();
            body[0].update_mode(BlockMode::Active, BlockMode::TraceHead);
            self.ctx.backend().optimize_trace(self.cpu, body, Some(0));
        }
        self.ctx.backend().optimize_trace(self.cpu, blocks, loop_head);
        self.reset();
    }

    /// Execution enters the code cache.
    pub fn notify_cache_enter(&mut self) {
        if let (Some(hp), Some(perf)) = (self.ctx.hard(), self.perf.as_mut()) {
            hp.notify_cache_enter(perf);
        }
    }

    /// Execution leaves the code cache.
    pub fn notify_cache_leave(&mut self) {
        if let (Some(hp), Some(perf)) = (self.ctx.hard(), self.perf.as_mut()) {
            hp.notify_cache_leave(perf);
        }
    }
}

impl Tracer for NetTracer {
    fn mode(&self) -> TransMode {
        self.mode
    }

    fn reset(&mut self) {
        self.blocks.clear();
        self.predicting = false;
    }

    fn record(&mut self, exit: ExitInfo, block: &Arc<Block>) {
        let new = block.mode() == BlockMode::None;
        if block.update_mode(BlockMode::None, BlockMode::Active) {
            if let Some(image) = self.ctx.read_code(block) {
                block.set_image(image);
            }
        }
        if self.is_trace_head(exit, block, new)
            && block.update_mode(BlockMode::Active, BlockMode::TraceHead)
        {
            let at = block.jmp_entry();
            self.ctx.patch_jump(at, at + HOST_JUMP_SIZE);
        }
        self.fallthrough = false;
    }

    fn as_net(&mut self) -> Option<&mut NetTracer> {
        Some(self)
    }
}

impl Drop for NetTracer {
    fn drop(&mut self) {
        if let Some(perf) = self.perf.take() {
            if let Some(hp) = self.ctx.hard() {
                hp.unregister_thread(perf);
            }
        }
        self.ctx.soft().add_trace_exits(self.num_trace_exits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TracerConfig;
    use crate::tracer::tests::{context, RecordingBackend, RecordingPatcher};
    use crate::tracer::GuestMemory;
    use rayon::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn block(pc: u64) -> Arc<Block> {
        Arc::new(Block::new(pc, 8, 2).with_host_code(0x10_0000 + pc as usize, 0x8, 0x20))
    }

    fn tracer(config: TracerConfig) -> (NetTracer, Arc<RecordingBackend>, Arc<RecordingPatcher>) {
        tracer_with(config, RecordingBackend::default())
    }

    fn tracer_with(
        config: TracerConfig,
        backend: RecordingBackend,
    ) -> (NetTracer, Arc<RecordingBackend>, Arc<RecordingPatcher>) {
        let backend = Arc::new(backend);
        let patcher = Arc::new(RecordingPatcher::default());
        let ctx = context(config, backend.clone(), patcher.clone());
        (NetTracer::new(ctx, 0, TransMode::HybridM), backend, patcher)
    }

    fn start_prediction(t: &mut NetTracer, head: &Arc<Block>) {
        for _ in 0..t.ctx.config().profile_threshold() {
            t.profile(head);
        }
        assert!(t.is_predicting());
    }

    #[test]
    fn test_loop_in_middle() {
        let (mut t, backend, _) = tracer(TracerConfig::default());
        let (a, b, c) = (block(0x100), block(0x200), block(0x300));
        for x in &[&a, &b, &c] {
            t.record(ExitInfo::NoSuccessor, x);
        }
        start_prediction(&mut t, &a);
        for x in &[&a, &b, &c, &b] {
            t.predict(x);
        }
        let traces = backend.traces.lock();
        assert_eq!(
            *traces,
            vec![
                (vec![0x200, 0x300, 0x200], Some(0)),
                (vec![0x100, 0x200, 0x300, 0x200], Some(1)),
            ]
        );
        assert_eq!(b.mode(), BlockMode::TraceHead);
        assert!(!t.is_predicting());
        assert!(t.blocks().is_empty());
    }

    #[test]
    fn test_loop_at_head() {
        let (mut t, backend, _) = tracer(TracerConfig::default());
        let (a, b) = (block(0x100), block(0x200));
        start_prediction(&mut t, &a);
        for x in &[&a, &b, &a] {
            t.predict(x);
        }
        assert_eq!(
            *backend.traces.lock(),
            vec![(vec![0x100, 0x200, 0x100], Some(0))]
        );
    }

    #[test]
    fn test_max_length() {
        let (mut t, backend, _) = tracer(TracerConfig::default().set_predict_threshold(4));
        let blocks: Vec<_> = (1..=4).map(|i| block(i * 0x100)).collect();
        start_prediction(&mut t, &blocks[0]);
        for x in &blocks {
            t.predict(x);
        }
        assert_eq!(
            *backend.traces.lock(),
            vec![(vec![0x100, 0x200, 0x300, 0x400], None)]
        );
        assert!(!t.is_predicting());
    }

    #[test]
    fn test_annotated_loop_boundary() {
        let backend = RecordingBackend {
            loop_heads: vec![0x300],
            ..Default::default()
        };
        let (mut t, backend, _) = tracer_with(TracerConfig::default(), backend);
        let (a, b, c) = (block(0x100), block(0x200), block(0x300));
        start_prediction(&mut t, &a);
        for x in &[&a, &b, &c] {
            t.predict(x);
        }
        assert_eq!(*backend.traces.lock(), vec![(vec![0x100, 0x200], None)]);

        // An annotated header may start a sequence.
        let d = block(0x400);
        start_prediction(&mut t, &d);
        t.predict(&c);
        assert_eq!(t.blocks().len(), 1);
    }

    #[test]
    fn test_strict_policy() {
        let config = TracerConfig::default().set_policy(HeadPolicy::Strict);
        let (mut t, backend, patcher) = tracer(config);
        let (a, b, c) = (block(0x100), block(0x300), block(0x200));

        t.record(ExitInfo::Chained { pred_pc: 0x50 }, &a);
        t.record(ExitInfo::Chained { pred_pc: 0x50 }, &a);
        assert_eq!(a.mode(), BlockMode::Active);
        t.record(ExitInfo::Chained { pred_pc: 0x300 }, &c);
        assert_eq!(c.mode(), BlockMode::TraceHead);
        assert_eq!(patcher.patches.lock().len(), 1);

        start_prediction(&mut t, &a);
        for x in &[&a, &b, &c] {
            t.predict(x);
        }
        assert_eq!(*backend.traces.lock(), vec![(vec![0x100, 0x300], None)]);
    }

    #[test]
    fn test_strict_cycle_to_head() {
        let config = TracerConfig::default().set_policy(HeadPolicy::Strict);
        let (mut t, backend, _) = tracer(config);
        let (a, b, c) = (block(0x100), block(0x200), block(0x300));
        start_prediction(&mut t, &a);
        for x in &[&a, &b, &c, &a] {
            t.predict(x);
        }
        assert_eq!(
            *backend.traces.lock(),
            vec![(vec![0x100, 0x200, 0x300, 0x100], Some(0))]
        );
        assert!(!t.is_predicting());
    }

    #[test]
    fn test_strict_revisit_in_middle() {
        let config = TracerConfig::default().set_policy(HeadPolicy::Strict);
        let (mut t, backend, _) = tracer(config);
        let (a, b, c, d) = (block(0x100), block(0x200), block(0x300), block(0x400));
        start_prediction(&mut t, &a);
        for x in &[&a, &b, &c, &d] {
            t.predict(x);
        }
        // Forward branches keep growing the sequence.
        assert_eq!(t.blocks().len(), 4);
        assert!(backend.traces.lock().is_empty());

        // Jumping back into the sequence is a backward branch, not a loop to split out.
        t.predict(&b);
        assert_eq!(
            *backend.traces.lock(),
            vec![(vec![0x100, 0x200, 0x300, 0x400], None)]
        );
        assert_eq!(b.mode(), BlockMode::None);
        assert!(t.blocks().is_empty());
    }

    #[test]
    fn test_trace_head_rules() {
        let (mut t, _, patcher) = tracer(TracerConfig::default());
        let (a, b, c) = (block(0x100), block(0x200), block(0x300));

        t.record(ExitInfo::TraceExit, &a);
        assert_eq!(a.mode(), BlockMode::TraceHead);
        assert_eq!(
            patcher.patches.lock()[0],
            (a.jmp_entry(), a.jmp_entry() + HOST_JUMP_SIZE)
        );

        t.set_fallthrough(true);
        t.record(ExitInfo::NoSuccessor, &b);
        assert_eq!(b.mode(), BlockMode::Active);
        // Fall through is consumed by the record.
        t.record(ExitInfo::NoSuccessor, &c);
        assert_eq!(c.mode(), BlockMode::TraceHead);

        t.record(ExitInfo::Chained { pred_pc: 0x100 }, &b);
        assert_eq!(b.mode(), BlockMode::TraceHead);
        assert_eq!(patcher.patches.lock().len(), 3);
    }

    #[test]
    fn test_profile_threshold() {
        let (mut t, _, patcher) = tracer(TracerConfig::default().set_profile_threshold(3));
        let a = block(0x100);
        t.profile(&a);
        t.profile(&a);
        assert!(!t.is_predicting());
        assert!(patcher.patches.lock().is_empty());
        t.profile(&a);
        assert!(t.is_predicting());
        assert_eq!(*patcher.patches.lock(), vec![(a.jmp_entry(), a.jmp_next())]);
        t.profile(&a);
        assert_eq!(patcher.patches.lock().len(), 1);
    }

    #[derive(Default)]
    struct CountingMemory {
        reads: AtomicUsize,
    }

    impl GuestMemory for CountingMemory {
        fn read_code(&self, _pc: u64, len: usize) -> Option<Vec<u8>> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            Some(vec![0x90; len])
        }
    }

    #[test]
    fn test_promotion_side_effects_once() {
        for n in &[1usize, 4, 32] {
            let backend = Arc::new(RecordingBackend::default());
            let patcher = Arc::new(RecordingPatcher::default());
            let memory = Arc::new(CountingMemory::default());
            let ctx = context(TracerConfig::default(), backend, patcher.clone())
                .with_memory(memory.clone());
            let b = block(0x100);
            (0..*n).into_par_iter().for_each(|cpu| {
                let mut t = NetTracer::new(ctx.clone(), cpu, TransMode::HybridM);
                t.record(ExitInfo::TraceExit, &b);
            });
            assert_eq!(memory.reads.load(Ordering::Relaxed), 1);
            assert_eq!(patcher.patches.lock().len(), 1);
            assert_eq!(b.image().map(|i| i.len()), Some(8));
            assert_eq!(b.mode(), BlockMode::TraceHead);
        }
    }

    #[test]
    fn test_trace_exits_reach_soft_perfmon() {
        let (mut t, _, _) = tracer(TracerConfig::default());
        let soft = t.ctx.soft().clone();
        t.count_trace_exit();
        t.count_trace_exit();
        drop(t);
        assert_eq!(soft.counters().trace_exits, 2);
    }
}
