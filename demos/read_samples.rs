use log::info;
use parking_lot::Mutex;
use std::sync::Arc;
use tracekit::pmu::{EventCode, Pmu, PmuConfig, SampleConfig};

fn fibonacci(n: u32) -> u32 {
    match n {
        0 => 1,
        1 => 1,
        _ => fibonacci(n - 1) + fibonacci(n - 2),
    }
}

fn main() -> tracekit::Result<()> {
    env_logger::init();

    let pmu = Pmu::init(PmuConfig {
        account_sample_time: true,
        ..Default::default()
    })?;

    // Setup a sampling group led by retired instructions
    let samples = Arc::new(Mutex::new(Vec::new()));
    let sink = samples.clone();
    let hndl = pmu.create_sample_event(SampleConfig {
        events: vec![EventCode::Instructions, EventCode::BranchInstructions],
        num_pages: 0,
        period: 100_000,
        watermark: 0,
        handler: Some(Box::new(move |_ctx, _hndl, list| {
            // Never block in the signal handler.
            if let Some(mut s) = sink.try_lock() {
                s.extend(list.into_inner());
            }
        })),
    })?;

    for run in 0..2 {
        pmu.reset(hndl)?;
        pmu.start(hndl)?;

        // Workload
        info!("Starting workload. Run {}.", run);
        fibonacci(30);

        pmu.stop(hndl)?;
        // Pick up what the timer has not drained yet.
        pmu.service();

        let values: Vec<String> = samples
            .lock()
            .drain(..)
            .take(12)
            .map(|x| format!("{:#X}", x))
            .collect();
        info!("Run {} -> {}", run, values.join(", "));
    }

    info!("Sample time: {} us", pmu.sample_time_us());
    pmu.cleanup(hndl)?;
    Ok(())
}
