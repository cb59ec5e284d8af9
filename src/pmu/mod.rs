//! Hardware performance counters: pre-defined events, sampling groups and their servicing.
//!
//! Sampling events are not signalled by the kernel. A one-shot timer wakes a receiver thread,
//! whose `SIGIO` handler drains every active ring buffer and hands the samples to the event's
//! handler.

use crate::perf::{PerfEventBuilder, PerfVersion, RingBuffer, SampleLayout};
use crate::{Error, Result};
use log::{debug, info, warn};
use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod events;
pub use events::{EventCode, EventId, EventTable};

mod manager;
pub use manager::{
    EventManager, EventMode, EventState, Handle, OverflowContext, SampleHandler, GROUP_EVENTS,
    MAX_EVENTS,
};

mod timer;
pub use timer::Timer;

/// Signal used by the sampling timer.
pub const PMU_SIGNAL: Signal = Signal::SIGIO;
/// Default number of data pages of a sampling buffer.
pub const SAMPLE_PAGES: usize = 4;
/// Default sampling period.
pub const SAMPLE_PERIOD: u64 = 1_000_000;
/// Periods below this are replaced by `SAMPLE_PERIOD`.
pub const MIN_SAMPLE_PERIOD: u64 = 1_000;
/// Default timer period in microseconds.
pub const TIMER_PERIOD_US: u32 = 400;

/// Manager serviced by the timer signal.
static SIGNAL_TARGET: AtomicPtr<EventManager> = AtomicPtr::new(std::ptr::null_mut());

extern "C" fn on_timer(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    let target = SIGNAL_TARGET.load(Ordering::Acquire);
    if !target.is_null() {
        unsafe { (*target).service() };
    }
}

/// Initial configuration of the PMU.
#[derive(Debug, Clone)]
pub struct PmuConfig {
    /// Thread receiving the timer signal. `None` selects the calling process.
    pub signal_receiver: Option<libc::pid_t>,
    /// Timer period in microseconds. `0` selects `TIMER_PERIOD_US`.
    pub timeout_us: u32,
    /// Accumulate the time spent draining buffers.
    pub account_sample_time: bool,
}

impl Default for PmuConfig {
    fn default() -> Self {
        PmuConfig {
            signal_receiver: None,
            timeout_us: TIMER_PERIOD_US,
            account_sample_time: false,
        }
    }
}

/// Config for sampling with one or multiple events.
pub struct SampleConfig {
    /// Event group. The first event is the leader and triggers the samples.
    pub events: Vec<EventCode>,
    /// Number of pages of the sample buffer, a power of two. `0` selects `SAMPLE_PAGES`.
    pub num_pages: usize,
    /// Sampling period of the group leader.
    pub period: u64,
    /// Bytes pending before the handler runs. `0` runs it on every timer period.
    pub watermark: u64,
    /// Routine receiving `{ip, v1..vN}` per sample.
    pub handler: Option<SampleHandler>,
}

/// Config for sampling instruction pointers with only one event.
pub struct Sample1Config {
    /// Event triggering the samples.
    pub event: EventCode,
    /// Number of pages of the sample buffer, a power of two. `0` selects `SAMPLE_PAGES`.
    pub num_pages: usize,
    /// Sampling period.
    pub period: u64,
    /// Bytes pending before the handler runs. `0` runs it on every timer period.
    pub watermark: u64,
    /// Routine receiving `{ip}` per sample.
    pub handler: Option<SampleHandler>,
}

impl std::fmt::Debug for SampleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleConfig")
            .field("events", &self.events)
            .field("num_pages", &self.num_pages)
            .field("period", &self.period)
            .field("watermark", &self.watermark)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl std::fmt::Debug for Sample1Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sample1Config")
            .field("event", &self.event)
            .field("num_pages", &self.num_pages)
            .field("period", &self.period)
            .field("watermark", &self.watermark)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

fn sample_pages(n: usize) -> usize {
    if n == 0 {
        SAMPLE_PAGES
    } else {
        n
    }
}

fn sample_period(p: u64) -> u64 {
    if p < MIN_SAMPLE_PERIOD {
        SAMPLE_PERIOD
    } else {
        p
    }
}

/// Handle to the performance monitoring unit.
///
/// Dropping it stops the timer and releases every open event.
#[derive(Debug)]
pub struct Pmu {
    manager: Arc<EventManager>,
    table: Box<dyn EventTable>,
    version: PerfVersion,
    owns_signal: bool,
}

impl Pmu {
    /// Initialize the PMU: probe the perf version, install the timer signal handler and create
    /// the sampling timer.
    ///
    /// Only one `Pmu` at a time receives the timer signal; later instances can count and
    /// sample, but their buffers are drained through `service` only.
    pub fn init(config: PmuConfig) -> Result<Self> {
        let version = PerfVersion::detect();
        info!(
            "Perf version: tool {}, kernel {}",
            version.tool(),
            version.os()
        );
        debug!("Host CPU: {}", crate::arch::get_cpu_string());

        let action = SigAction::new(
            SigHandler::SigAction(on_timer),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe { signal::sigaction(PMU_SIGNAL, &action) }?;

        let receiver = config
            .signal_receiver
            .filter(|tid| *tid > 0)
            .unwrap_or_else(|| nix::unistd::getpid().as_raw());
        let timeout_us = if config.timeout_us == 0 {
            TIMER_PERIOD_US
        } else {
            config.timeout_us
        };
        let timer = Timer::new(
            PMU_SIGNAL,
            receiver,
            Duration::from_micros(u64::from(timeout_us)),
        )?;

        let mut manager = Arc::new(EventManager::new(Some(timer)));
        let ptr = Arc::as_ptr(&manager) as *mut EventManager;
        let owns_signal = SIGNAL_TARGET
            .compare_exchange(
                std::ptr::null_mut(),
                ptr,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !owns_signal {
            warn!("Sampling signal already owned by another PMU; buffers need explicit servicing");
            manager = Arc::new(EventManager::new(None));
        }
        manager.set_time_accounting(config.account_sample_time);

        Ok(Pmu {
            manager,
            table: crate::arch::event_table(),
            version,
            owns_signal,
        })
    }

    /// A PMU without timer or signal handling, drained through `service` only.
    pub fn without_timer(table: Box<dyn EventTable>) -> Self {
        Pmu {
            manager: Arc::new(EventManager::new(None)),
            table,
            version: PerfVersion::detect(),
            owns_signal: false,
        }
    }

    /// Perf ABI versions detected at initialization.
    #[inline]
    pub fn version(&self) -> PerfVersion {
        self.version
    }

    /// Event table of the host.
    #[inline]
    pub fn event_table(&self) -> &dyn EventTable {
        self.table.as_ref()
    }

    /// Whether this instance receives the timer signal.
    #[inline]
    pub fn owns_signal(&self) -> bool {
        self.owns_signal
    }

    /// Stop invoking overflow handlers. Counting events keep working.
    pub fn pause(&self) {
        self.manager.pause()
    }

    /// Invoke overflow handlers again.
    pub fn resume(&self) {
        self.manager.resume()
    }

    /// Start a counting or sampling event.
    pub fn start(&self, hndl: Handle) -> Result<()> {
        self.manager.start(hndl)
    }

    /// Stop a counting or sampling event.
    pub fn stop(&self, hndl: Handle) -> Result<()> {
        self.manager.stop(hndl)
    }

    /// Reset the hardware counter.
    pub fn reset(&self, hndl: Handle) -> Result<()> {
        self.manager.reset(hndl)
    }

    /// Remove an event, stopping it first if needed.
    pub fn cleanup(&self, hndl: Handle) -> Result<()> {
        self.manager.cleanup(hndl)
    }

    /// Read value from the hardware counter.
    pub fn read_event(&self, hndl: Handle) -> Result<u64> {
        self.manager.read(hndl)
    }

    /// State of an event.
    pub fn event_state(&self, hndl: Handle) -> Result<EventState> {
        self.manager.state(hndl)
    }

    /// Unused event slots.
    pub fn free_slots(&self) -> usize {
        self.manager.free_slots()
    }

    /// Drain active sampling events now, as the timer signal would.
    pub fn service(&self) -> bool {
        self.manager.service()
    }

    /// Total time spent in sample processing, in microseconds.
    pub fn sample_time_us(&self) -> u64 {
        self.manager.sample_time_us()
    }

    /// Accumulate the time spent draining buffers.
    pub fn set_time_accounting(&self, on: bool) {
        self.manager.set_time_accounting(on)
    }

    /// Sample drains cut short by a malformed record since the last call.
    pub fn take_malformed(&self) -> u64 {
        self.manager.take_malformed()
    }

    fn lookup(&self, code: EventCode) -> Result<EventId> {
        self.table.lookup(code).ok_or(Error::NoSuchEvent)
    }

    /// Open a counting event using the pre-defined event code.
    pub fn create_event(&self, code: EventCode) -> Result<Handle> {
        let id = self.lookup(code)?;
        let group = PerfEventBuilder::default().open(id)?;
        let hndl = self.manager.add_event(group)?;
        debug!("Register event: {:?} as {}", code, hndl);
        Ok(hndl)
    }

    /// Open a counting event using the raw event number and umask value.
    ///
    /// The raw event code is computed as `event | (umask << 8)`.
    pub fn create_raw_event(&self, event: u64, umask: u64) -> Result<Handle> {
        let group = PerfEventBuilder::default().open(EventId::raw(event, umask))?;
        let hndl = self.manager.add_event(group)?;
        debug!("Register raw event: {:#x}/{:#x} as {}", event, umask, hndl);
        Ok(hndl)
    }

    /// Open a sampling group, with the first event as the interrupt event.
    ///
    /// Samples are delivered as `{pc, val1, ..., valN}` per record.
    pub fn create_sample_event(&self, config: SampleConfig) -> Result<Handle> {
        let num_pages = sample_pages(config.num_pages);
        let period = sample_period(config.period);
        if config.events.is_empty()
            || config.events.len() > GROUP_EVENTS
            || !num_pages.is_power_of_two()
        {
            return Err(Error::InvalidArgument);
        }
        let ids = config
            .events
            .iter()
            .map(|c| self.lookup(*c))
            .collect::<Result<Vec<_>>>()?;

        let group = PerfEventBuilder::default()
            .set_period(period)
            .enable_sample_ip()
            .enable_sample_read()
            .open_group(&ids)?;
        let data = RingBuffer::new(group.leader_fd(), num_pages)?;
        let layout = SampleLayout {
            ip: true,
            read: true,
            group: ids.len() > 1,
        };
        let hndl =
            self.manager
                .add_sample_event(group, data, layout, config.watermark, config.handler)?;
        debug!(
            "Register sample event: {:?} period {} as {}",
            config.events, period, hndl
        );
        Ok(hndl)
    }

    /// Generate an instruction pointer histogram using `event` as the interrupt event.
    ///
    /// Samples are delivered as `{pc1, pc2, ..., pcN}`.
    pub fn create_sample_ip(&self, config: Sample1Config) -> Result<Handle> {
        let num_pages = sample_pages(config.num_pages);
        let period = sample_period(config.period);
        if !num_pages.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }
        let id = self.lookup(config.event)?;

        let group = PerfEventBuilder::default()
            .set_period(period)
            .enable_sample_ip()
            .open(id)?;
        let data = RingBuffer::new(group.leader_fd(), num_pages)?;
        let layout = SampleLayout {
            ip: true,
            read: false,
            group: false,
        };
        let hndl =
            self.manager
                .add_sample_event(group, data, layout, config.watermark, config.handler)?;
        debug!(
            "Register IP sampler: {:?} period {} as {}",
            config.event, period, hndl
        );
        Ok(hndl)
    }
}

impl Drop for Pmu {
    fn drop(&mut self) {
        if self.owns_signal {
            let ptr = Arc::as_ptr(&self.manager) as *mut EventManager;
            let _ = SIGNAL_TARGET.compare_exchange(
                ptr,
                std::ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        self.manager.shutdown();
        self.manager.cleanup_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf::SampleList;
    use crate::pmu::events::GenericEvents;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn tolerated(e: &Error) -> bool {
        matches!(
            e,
            Error::PermissionDenied
                | Error::NoSuchEvent
                | Error::HardwareEvent(_)
                | Error::OutOfMemory
        )
    }

    fn detached() -> Pmu {
        Pmu::without_timer(crate::arch::event_table())
    }

    fn group_config(events: Vec<EventCode>) -> SampleConfig {
        SampleConfig {
            events,
            num_pages: 0,
            period: 0,
            watermark: 0,
            handler: None,
        }
    }

    #[test]
    fn test_sampling_defaults() {
        assert_eq!(sample_pages(0), SAMPLE_PAGES);
        assert_eq!(sample_pages(8), 8);
        assert_eq!(sample_period(999), SAMPLE_PERIOD);
        assert_eq!(sample_period(1000), 1000);
    }

    #[test]
    fn test_config_debug() {
        let mut config = group_config(vec![EventCode::Instructions]);
        config.handler = Some(Box::new(
            |_: &mut OverflowContext<'_>, _: Handle, _: SampleList| {},
        ));
        let s = format!("{:?}", config);
        assert!(s.starts_with("SampleConfig { events: [Instructions]"));
        assert!(s.ends_with("handler: true }"));
    }

    #[test]
    fn test_sample_event_group_size() {
        let pmu = detached();
        let before = pmu.free_slots();

        let err = pmu.create_sample_event(group_config(vec![]));
        assert!(matches!(err, Err(Error::InvalidArgument)));
        assert_eq!(pmu.free_slots(), before);

        let err = pmu.create_sample_event(group_config(vec![EventCode::Instructions; 9]));
        assert!(matches!(err, Err(Error::InvalidArgument)));
        assert_eq!(pmu.free_slots(), before);
    }

    #[test]
    fn test_sample_pages_power_of_two() {
        let pmu = detached();
        let mut config = group_config(vec![EventCode::CpuCycles]);
        config.num_pages = 3;
        assert!(matches!(
            pmu.create_sample_event(config),
            Err(Error::InvalidArgument)
        ));
        let err = pmu.create_sample_ip(Sample1Config {
            event: EventCode::CpuCycles,
            num_pages: 6,
            period: 0,
            watermark: 0,
            handler: None,
        });
        assert!(matches!(err, Err(Error::InvalidArgument)));
    }

    #[test]
    fn test_no_such_event() {
        let pmu = Pmu::without_timer(Box::new(GenericEvents));
        let before = pmu.free_slots();
        assert!(matches!(
            pmu.create_event(EventCode::IcacheHits),
            Err(Error::NoSuchEvent)
        ));
        assert!(matches!(
            pmu.create_sample_event(group_config(vec![
                EventCode::Instructions,
                EventCode::MemLoads
            ])),
            Err(Error::NoSuchEvent)
        ));
        assert_eq!(pmu.free_slots(), before);
    }

    #[test]
    fn test_counting_event() {
        let pmu = detached();
        let before = pmu.free_slots();
        match pmu.create_event(EventCode::Instructions) {
            Ok(h) => {
                assert_eq!(pmu.free_slots(), before - 1);
                assert!(pmu.reset(h).is_ok());
                assert!(pmu.start(h).is_ok());
                let tmp: u64 = (0u64..100_000).filter(|x| x % 7 == 0).sum();
                println!("Val: {}", tmp);
                assert!(pmu.stop(h).is_ok());
                assert!(pmu.read_event(h).is_ok());
                assert!(pmu.cleanup(h).is_ok());
                assert_eq!(pmu.free_slots(), before);
                assert!(matches!(pmu.read_event(h), Err(Error::InvalidArgument)));
            }
            Err(e) => assert!(tolerated(&e), "{}", e),
        }
    }

    #[test]
    fn test_sample_ip_service() {
        let pmu = detached();
        let batches = Arc::new(AtomicUsize::new(0));
        let seen = batches.clone();
        let res = pmu.create_sample_ip(Sample1Config {
            event: EventCode::Instructions,
            num_pages: 1,
            period: 10_000,
            watermark: 0,
            handler: Some(Box::new(move |_ctx, _h, _samples| {
                seen.fetch_add(1, Ordering::Relaxed);
            })),
        });
        match res {
            Ok(h) => {
                assert!(pmu.start(h).is_ok());
                assert_eq!(pmu.event_state(h).unwrap(), EventState::Started);
                let tmp: u64 = (0u64..1_000_000).filter(|x| x % 3 == 0).sum();
                println!("Val: {}", tmp);
                assert!(pmu.service());
                // A zero watermark delivers a batch on every pass.
                assert!(batches.load(Ordering::Relaxed) >= 1);
                assert!(pmu.cleanup(h).is_ok());
            }
            Err(e) => assert!(tolerated(&e), "{}", e),
        }
    }

    #[test]
    fn test_stop_unlocked_from_handler() {
        let pmu = detached();
        let res = pmu.create_sample_ip(Sample1Config {
            event: EventCode::CpuCycles,
            num_pages: 1,
            period: 10_000,
            watermark: 0,
            handler: Some(Box::new(|ctx, h, _samples| {
                let _ = ctx.stop_unlocked(h);
            })),
        });
        if let Ok(h) = res {
            assert!(pmu.start(h).is_ok());
            assert!(pmu.service());
            assert_eq!(pmu.event_state(h).unwrap(), EventState::Stopped);
            // The event left the active list, so the next pass has nothing to do.
            assert!(pmu.service());
            assert!(pmu.cleanup(h).is_ok());
        }
    }

    #[test]
    fn test_unlocked_peer_from_handler() {
        let pmu = detached();
        let peer = Arc::new(Mutex::new(None::<Handle>));
        let passes = Arc::new(AtomicUsize::new(0));
        let (target, count) = (peer.clone(), passes.clone());
        let leader = pmu.create_sample_ip(Sample1Config {
            event: EventCode::CpuCycles,
            num_pages: 1,
            period: 10_000,
            watermark: 0,
            handler: Some(Box::new(
                move |ctx: &mut OverflowContext<'_>, _: Handle, _: SampleList| {
                    if let Some(h) = *target.lock() {
                        // The first pass starts the peer, later ones stop it.
                        let _ = if count.fetch_add(1, Ordering::Relaxed) == 0 {
                            ctx.start_unlocked(h)
                        } else {
                            ctx.stop_unlocked(h)
                        };
                    }
                },
            )),
        });
        let leader = match leader {
            Ok(h) => h,
            Err(e) => {
                assert!(tolerated(&e), "{}", e);
                return;
            }
        };
        let follower = match pmu.create_sample_ip(Sample1Config {
            event: EventCode::CpuCycles,
            num_pages: 1,
            period: 10_000,
            watermark: 0,
            handler: Some(Box::new(
                |_: &mut OverflowContext<'_>, _: Handle, _: SampleList| {},
            )),
        }) {
            Ok(h) => h,
            Err(e) => {
                assert!(tolerated(&e), "{}", e);
                return;
            }
        };
        *peer.lock() = Some(follower);

        assert!(pmu.start(leader).is_ok());
        assert_eq!(pmu.event_state(follower).unwrap(), EventState::Stopped);
        assert!(pmu.service());
        assert_eq!(pmu.event_state(follower).unwrap(), EventState::Started);
        assert!(pmu.service());
        assert_eq!(pmu.event_state(follower).unwrap(), EventState::Stopped);
        assert_eq!(pmu.event_state(leader).unwrap(), EventState::Started);
        assert_eq!(passes.load(Ordering::Relaxed), 2);

        assert!(pmu.cleanup(follower).is_ok());
        assert!(pmu.cleanup(leader).is_ok());
    }

    #[test]
    fn test_init_and_finalize() {
        let _ = env_logger::builder().is_test(true).try_init();
        let pmu = match Pmu::init(PmuConfig::default()) {
            Ok(p) => p,
            Err(e) => {
                assert!(tolerated(&e) || matches!(e, Error::System(_)), "{}", e);
                return;
            }
        };
        assert!(pmu.version().os() <= pmu.version().tool());
        pmu.pause();
        pmu.resume();
        drop(pmu);
    }
}
