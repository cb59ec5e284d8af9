use log::info;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracekit::metrics::ffi as metrics;
use tracekit::perfmon::{HardwarePerfmon, ProfileReport, SoftwarePerfmon};
use tracekit::tracer::{
    create_tracer, Block, BlockMode, CacheRange, CodePatcher, ExecSlot, ExitInfo,
    OptimizationBackend, Trace, TraceRegistry, TracerContext, TranslatedCode,
};
use tracekit::TracerConfig;

const TRACE_CACHE: usize = 0x7f00_0000;

/// Pretends to compile every request into the trace cache.
struct FakeBackend {
    registry: Arc<TraceRegistry>,
    next_code: AtomicUsize,
    num_threads: usize,
}

impl OptimizationBackend for FakeBackend {
    fn optimize_block(&self, _cpu: usize, block: &Arc<Block>) {
        info!("Optimize block {:#x}", block.pc());
    }

    fn optimize_trace(&self, _cpu: usize, blocks: Vec<Arc<Block>>, loop_head: Option<usize>) {
        let pcs: Vec<String> = blocks.iter().map(|b| format!("{:#x}", b.pc())).collect();
        info!("Optimize trace [{}] loop head {:?}", pcs.join(","), loop_head);
        let size = 0x40 * blocks.len();
        let code = self.next_code.fetch_add(size, Ordering::Relaxed);
        let num_loop = loop_head.is_some() as u32;
        let num_exit = blocks.len() as u32;
        let trace =
            Trace::new(blocks, loop_head, self.num_threads).with_shape(num_loop, num_exit, 0);
        trace.add_trans_time(250);
        self.registry
            .register(TranslatedCode::new(Arc::new(trace), code, size));
    }
}

struct NopPatcher;

impl CodePatcher for NopPatcher {
    fn patch_jump(&self, at: usize, target: usize) {
        info!("Patch jump at {:#x} -> {:#x}", at, target);
    }
}

fn main() {
    env_logger::init();

    let config = TracerConfig::from_env()
        .set_profile_threshold(4)
        .set_profile_level("basic,exit,trace,cache,hpm".to_string());
    let registry = Arc::new(TraceRegistry::new(
        CacheRange {
            start: 0x7e00_0000,
            size: 1 << 20,
        },
        CacheRange {
            start: TRACE_CACHE,
            size: 1 << 20,
        },
    ));
    let backend = Arc::new(FakeBackend {
        registry: registry.clone(),
        next_code: AtomicUsize::new(TRACE_CACHE),
        num_threads: config.num_threads(),
    });
    let soft = Arc::new(SoftwarePerfmon::new(
        config.profile_level(),
        config.cover_set(),
    ));
    let hard = Arc::new(HardwarePerfmon::init(soft.clone()));
    let ctx = TracerContext::new(config.clone(), backend, Arc::new(NopPatcher))
        .with_soft(soft.clone())
        .with_hard(hard.clone())
        .with_registry(registry.clone());

    // A; loop { B; C }; D
    let blocks: Vec<Arc<Block>> = (0..4u64)
        .map(|i| {
            let pc = 0x1000 + 0x10 * i;
            let tc_ptr = 0x7e00_0000 + 0x100 * i as usize;
            Arc::new(Block::new(pc, 0x10, 4).with_host_code(tc_ptr, 8, 0x40))
        })
        .collect();
    let mut path = vec![0];
    for _ in 0..20 {
        path.extend(&[1, 2]);
    }
    path.push(3);

    let mut tracer = create_tracer(&ctx, 0);
    let mut prev: Option<u64> = None;
    for &i in &path {
        let block = &blocks[i];
        let exit = match prev {
            Some(pred_pc) => ExitInfo::Chained { pred_pc },
            None => ExitInfo::NoSuccessor,
        };
        metrics::timestamp_begin(block.pc());
        tracer.record(exit, block);
        if let Some(net) = tracer.as_net() {
            net.notify_cache_enter();
            if net.is_predicting() {
                net.predict(block);
            } else if block.mode() == BlockMode::TraceHead {
                net.profile(block);
            }
            net.notify_cache_leave();
        }
        metrics::timestamp_end();
        prev = Some(block.pc());
    }

    for tc in registry.codes() {
        tc.trace().profile_exec(0, ExecSlot::Loop);
    }
    // Folds per thread counters into the software perfmon.
    drop(tracer);

    ProfileReport::new(&soft, &registry, &config)
        .with_hard(&hard)
        .print();
    metrics::metric_print();
}
