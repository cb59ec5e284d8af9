//! Per thread hardware counters layered over the PMU.

use crate::perf::SampleList;
use crate::perfmon::{Counters, ProfileMode, SoftwarePerfmon};
use crate::pmu::{
    EventCode, Handle, OverflowContext, Pmu, PmuConfig, Sample1Config, TIMER_PERIOD_US,
};
use crate::util::PAGE_SIZE;
use log::debug;
use nix::unistd::gettid;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

const COVER_SET_PAGES: usize = 4;
const COVER_SET_PERIOD: u64 = 100_000;

/// Action applied to a thread's counter bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HpmControl {
    /// Open and start the counters.
    Init,
    /// Read, release and add the totals to the software perfmon.
    Finalize,
    /// Entering the code cache.
    Start,
    /// Leaving the code cache.
    Stop,
}

/// Counters of one monitored thread.
#[derive(Debug)]
pub struct PerfmonData {
    tid: i32,
    icount: Option<Handle>,
    branches: Option<Handle>,
    loads: Option<Handle>,
    stores: Option<Handle>,
    cover_set: Option<Handle>,
    last_branches: u64,
    last_loads: u64,
    last_stores: u64,
}

impl PerfmonData {
    fn new(tid: i32) -> Self {
        PerfmonData {
            tid,
            icount: None,
            branches: None,
            loads: None,
            stores: None,
            cover_set: None,
            last_branches: 0,
            last_loads: 0,
            last_stores: 0,
        }
    }

    /// Thread id.
    #[inline]
    pub fn tid(&self) -> i32 {
        self.tid
    }

    /// Whether instruction pointer sampling runs for the thread.
    #[inline]
    pub fn has_cover_set(&self) -> bool {
        self.cover_set.is_some()
    }
}

fn open_counter(pmu: &Pmu, code: EventCode, what: &str) -> Option<Handle> {
    let hndl = pmu.create_event(code).ok()?;
    debug!("Register event: # {}.", what);
    if let Err(e) = pmu.start(hndl) {
        debug!("Failed to start {} event ({})", what, e);
    }
    Some(hndl)
}

fn read(pmu: &Pmu, hndl: Option<Handle>) -> u64 {
    hndl.and_then(|h| pmu.read_event(h).ok()).unwrap_or(0)
}

fn read_and_release(pmu: &Pmu, hndl: &mut Option<Handle>) -> u64 {
    let value = read(pmu, *hndl);
    if let Some(h) = hndl.take() {
        let _ = pmu.cleanup(h);
    }
    value
}

/// Thread receiving the sampling timer signal.
#[derive(Debug)]
struct MonitorThread {
    tid: i32,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MonitorThread {
    fn spawn() -> Option<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("hpm-monitor".into())
            .spawn(move || {
                let _ = tx.send(gettid().as_raw());
                while !flag.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .ok()?;
        let tid = rx.recv().ok()?;
        Some(MonitorThread {
            tid,
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for MonitorThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Hardware performance monitor.
///
/// Threads register to get instruction, branch, load and store counters (category `hpm`) and
/// an instruction pointer sampler feeding the hotspot report (category `hotspot`). Failing to
/// open the PMU is not fatal: every thread then runs without counters.
#[derive(Debug)]
pub struct HardwarePerfmon {
    soft: Arc<SoftwarePerfmon>,
    lock: Mutex<()>,
    pmu: Option<Pmu>,
    monitor: Option<MonitorThread>,
    /// PMU sample time already added to the software counters.
    flushed_us: AtomicU64,
}

impl HardwarePerfmon {
    /// Initialize the PMU for the categories enabled in `soft`.
    ///
    /// With `hotspot` a monitor thread is spawned to receive the sampling signal, so that the
    /// buffers are never drained on a thread holding the locks the handler needs.
    pub fn init(soft: Arc<SoftwarePerfmon>) -> Self {
        let monitor = if soft.has(ProfileMode::HOTSPOT) {
            MonitorThread::spawn()
        } else {
            None
        };
        let config = PmuConfig {
            signal_receiver: monitor.as_ref().map(|m| m.tid),
            timeout_us: TIMER_PERIOD_US,
            account_sample_time: soft.has(ProfileMode::HPM),
        };
        let pmu = match Pmu::init(config) {
            Ok(pmu) => Some(pmu),
            Err(e) => {
                debug!("Failed to initialize PMU ({}).", e);
                None
            }
        };
        HardwarePerfmon {
            soft,
            lock: Mutex::new(()),
            pmu,
            monitor,
            flushed_us: AtomicU64::new(0),
        }
    }

    /// A monitor over an already initialized PMU.
    pub fn with_pmu(soft: Arc<SoftwarePerfmon>, pmu: Pmu) -> Self {
        HardwarePerfmon {
            soft,
            lock: Mutex::new(()),
            pmu: Some(pmu),
            monitor: None,
            flushed_us: AtomicU64::new(0),
        }
    }

    /// Whether the PMU is available.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.pmu.is_some()
    }

    /// The underlying PMU, when available.
    #[inline]
    pub fn pmu(&self) -> Option<&Pmu> {
        self.pmu.as_ref()
    }

    /// Add the sampling time accumulated since the last flush to the software counters and
    /// report sample drains that hit malformed records.
    pub fn flush(&self) {
        let pmu = match &self.pmu {
            Some(pmu) => pmu,
            None => return,
        };
        let _guard = self.lock.lock();
        let total = pmu.sample_time_us();
        let prev = self.flushed_us.swap(total, Ordering::Relaxed);
        self.soft.add_sample_time(total.saturating_sub(prev));
        let malformed = pmu.take_malformed();
        if malformed > 0 {
            debug!("Dropped the tail of {} sample batches (malformed record).", malformed);
        }
    }

    /// Software counters, including the sampling time spent so far.
    pub fn counters(&self) -> Counters {
        self.flush();
        self.soft.counters()
    }

    /// Thread id of the signal receiver thread, when one was spawned.
    pub fn monitor_tid(&self) -> Option<i32> {
        self.monitor.as_ref().map(|m| m.tid)
    }

    /// Stop sampling, e.g. around a fork.
    pub fn pause(&self) {
        if let Some(pmu) = &self.pmu {
            pmu.pause();
        }
    }

    /// Restart sampling.
    pub fn resume(&self) {
        if let Some(pmu) = &self.pmu {
            pmu.resume();
        }
    }

    /// Open the counters of the calling thread.
    pub fn register_thread(&self) -> PerfmonData {
        let _guard = self.lock.lock();
        let tid = gettid().as_raw();
        debug!("Register thread {}.", tid);
        let mut data = PerfmonData::new(tid);
        self.monitor_basic(&mut data, HpmControl::Init);
        self.monitor_cover_set(&mut data, HpmControl::Init);
        data
    }

    /// Release the counters of a thread and fold them into the software totals.
    pub fn unregister_thread(&self, mut data: PerfmonData) {
        {
            let _guard = self.lock.lock();
            debug!("Unregister thread {}.", data.tid);
            self.monitor_basic(&mut data, HpmControl::Finalize);
            self.monitor_cover_set(&mut data, HpmControl::Finalize);
        }
        self.flush();
    }

    /// Execution enters the code cache.
    pub fn notify_cache_enter(&self, data: &mut PerfmonData) {
        let _guard = self.lock.lock();
        self.monitor_basic(data, HpmControl::Start);
    }

    /// Execution leaves the code cache.
    pub fn notify_cache_leave(&self, data: &mut PerfmonData) {
        let _guard = self.lock.lock();
        self.monitor_basic(data, HpmControl::Stop);
    }

    fn monitor_basic(&self, data: &mut PerfmonData, ctl: HpmControl) {
        if !self.soft.has(ProfileMode::HPM) {
            return;
        }
        let pmu = match &self.pmu {
            Some(pmu) => pmu,
            None => return,
        };
        match ctl {
            HpmControl::Init => {
                data.icount = open_counter(pmu, EventCode::Instructions, "instructions");
                data.branches =
                    open_counter(pmu, EventCode::BranchInstructions, "branch instructions");
                data.loads = open_counter(pmu, EventCode::MemLoads, "load instructions");
                data.stores = open_counter(pmu, EventCode::MemStores, "store instructions");
            }
            HpmControl::Finalize => {
                let insns = read_and_release(pmu, &mut data.icount);
                let branches = read_and_release(pmu, &mut data.branches);
                let loads = read_and_release(pmu, &mut data.loads);
                let stores = read_and_release(pmu, &mut data.stores);
                self.soft.add_counts(insns, branches, loads, stores);
            }
            HpmControl::Start => {
                data.last_branches = read(pmu, data.branches);
                data.last_loads = read(pmu, data.loads);
                data.last_stores = read(pmu, data.stores);
            }
            HpmControl::Stop => {
                // Per visit deltas are not reported.
                let _ = read(pmu, data.branches).wrapping_sub(data.last_branches);
                let _ = read(pmu, data.loads).wrapping_sub(data.last_loads);
                let _ = read(pmu, data.stores).wrapping_sub(data.last_stores);
            }
        }
    }

    fn monitor_cover_set(&self, data: &mut PerfmonData, ctl: HpmControl) {
        if !self.soft.has(ProfileMode::HOTSPOT) {
            return;
        }
        let pmu = match &self.pmu {
            Some(pmu) => pmu,
            None => return,
        };
        match ctl {
            HpmControl::Init => {
                let soft = self.soft.clone();
                let config = Sample1Config {
                    event: EventCode::Instructions,
                    num_pages: COVER_SET_PAGES,
                    period: COVER_SET_PERIOD,
                    watermark: (COVER_SET_PAGES * *PAGE_SIZE / 2) as u64,
                    handler: Some(Box::new(
                        move |_: &mut OverflowContext<'_>, _: Handle, samples: SampleList| {
                            soft.push_samples(samples);
                        },
                    )),
                };
                if let Ok(hndl) = pmu.create_sample_ip(config) {
                    debug!("Register event: cover set sampling.");
                    if pmu.start(hndl).is_ok() {
                        data.cover_set = Some(hndl);
                    } else {
                        let _ = pmu.cleanup(hndl);
                    }
                }
            }
            HpmControl::Finalize => {
                if let Some(hndl) = data.cover_set.take() {
                    let _ = pmu.cleanup(hndl);
                }
            }
            HpmControl::Start | HpmControl::Stop => {}
        }
    }
}

impl Drop for HardwarePerfmon {
    fn drop(&mut self) {
        self.flush();
        // Releases every event still open and stops the timer.
        self.pmu.take();
        self.monitor.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_categories() {
        let soft = Arc::new(SoftwarePerfmon::new("basic", 90));
        let hp = HardwarePerfmon::init(soft.clone());
        assert!(hp.monitor_tid().is_none());
        let mut data = hp.register_thread();
        assert_eq!(data.tid(), gettid().as_raw());
        assert!(data.icount.is_none());
        assert!(!data.has_cover_set());
        hp.notify_cache_enter(&mut data);
        hp.notify_cache_leave(&mut data);
        hp.unregister_thread(data);
        assert_eq!(soft.counters().insns, 0);
    }

    #[test]
    fn test_counters_folded_on_unregister() {
        let _ = env_logger::builder().is_test(true).try_init();
        let soft = Arc::new(SoftwarePerfmon::new("hpm", 90));
        let pmu = Pmu::without_timer(crate::arch::event_table());
        let hp = HardwarePerfmon::with_pmu(soft.clone(), pmu);
        let mut data = hp.register_thread();
        let counted = data.icount.is_some();
        hp.notify_cache_enter(&mut data);
        let mut x = 0u64;
        for i in 0..10_000u64 {
            x = x.wrapping_add(i * i);
        }
        assert!(x > 0);
        hp.notify_cache_leave(&mut data);
        hp.unregister_thread(data);
        // Sandboxes may forbid counters entirely.
        if counted {
            assert!(soft.counters().insns > 0);
        }
    }

    #[test]
    fn test_sample_time_visible_while_alive() {
        let soft = Arc::new(SoftwarePerfmon::new("hpm,hotspot", 90));
        let pmu = Pmu::without_timer(crate::arch::event_table());
        pmu.set_time_accounting(true);
        let hp = HardwarePerfmon::with_pmu(soft.clone(), pmu);
        let data = hp.register_thread();
        let mut x = 0u64;
        for i in 0..100_000u64 {
            x = x.wrapping_add(i ^ (i >> 3));
        }
        assert!(x > 0);
        let pmu = hp.pmu().unwrap();
        assert!(pmu.service());
        let spent = pmu.sample_time_us();

        assert_eq!(hp.counters().sample_time_us, spent);
        // Flushing twice does not count the same time again.
        hp.flush();
        assert_eq!(soft.counters().sample_time_us, spent);

        hp.unregister_thread(data);
        drop(hp);
        assert!(soft.counters().sample_time_us >= spent);
    }

    #[test]
    fn test_monitor_thread() {
        let soft = Arc::new(SoftwarePerfmon::new("hotspot", 90));
        let hp = HardwarePerfmon::init(soft);
        let tid = hp.monitor_tid();
        assert!(tid.is_some());
        assert_ne!(tid, Some(gettid().as_raw()));
        let data = hp.register_thread();
        hp.unregister_thread(data);
        drop(hp);
    }
}
