//! Event pool and the timer driven servicing of sampling events.
//!
//! A single mutex protects the pool, the list of actively sampled events and the list of events
//! whose state changed while that list was being iterated. The timer signal handler only ever
//! `try_lock`s; if the lock is busy the tick is skipped and the timer re-armed.

use crate::perf::{EventGroup, RingBuffer, SampleLayout, SampleList};
use crate::pmu::timer::Timer;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Capacity of the event pool.
pub const MAX_EVENTS: usize = 1024;

/// Maximum number of events in one sampling group.
pub const GROUP_EVENTS: usize = 8;

/// Stable reference to an event slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// Index of the slot in the pool.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Routine invoked with every batch of samples drained from an event's buffer.
///
/// Runs inside the timer signal handler with the manager lock held; use the context to start or
/// stop other sampling events.
pub type SampleHandler = Box<dyn FnMut(&mut OverflowContext<'_>, Handle, SampleList) + Send>;

/// How an event is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    /// Read synchronously through the descriptor.
    Counter,
    /// Drained from a ring buffer with the given record layout.
    Sample(SampleLayout),
}

/// Sampling state of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    /// Not counting.
    Stopped,
    /// Counting; sampling events sit in the active list.
    Started,
    /// Stopped from an overflow handler, still in the active list until the pass ends.
    PendingStop,
    /// Started from an overflow handler, joins the active list when the pass ends.
    PendingStart,
}

enum OverflowHandler {
    None,
    Sample(SampleHandler),
}

impl OverflowHandler {
    fn is_some(&self) -> bool {
        !matches!(self, OverflowHandler::None)
    }
}

impl std::fmt::Debug for OverflowHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverflowHandler::None => f.write_str("None"),
            OverflowHandler::Sample(_) => f.write_str("Sample(..)"),
        }
    }
}

/// One open counter or sampling stream.
#[derive(Debug)]
struct PmuEvent {
    mode: EventMode,
    state: EventState,
    group: EventGroup,
    data: Option<RingBuffer>,
    aux: Option<RingBuffer>,
    watermark: u64,
    handler: OverflowHandler,
}

#[derive(Debug)]
struct ManagerState {
    events: Vec<Option<PmuEvent>>,
    free: VecDeque<u32>,
    active: Vec<Handle>,
    changed: Vec<Handle>,
}

impl ManagerState {
    fn get_mut(&mut self, hndl: Handle) -> Result<&mut PmuEvent> {
        self.events
            .get_mut(hndl.index())
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidArgument)
    }

    fn insert(&mut self, event: PmuEvent) -> Result<Handle> {
        let slot = self.free.pop_front().ok_or(Error::OutOfMemory)?;
        self.events[slot as usize] = Some(event);
        Ok(Handle(slot))
    }

    /// Fold the changes requested during an overflow pass into the active list.
    fn apply_changes(&mut self) {
        let changed = std::mem::take(&mut self.changed);
        for hndl in changed {
            let event = match self.events.get_mut(hndl.index()).and_then(Option::as_mut) {
                Some(e) => e,
                None => continue,
            };
            match event.state {
                EventState::PendingStop => {
                    event.state = EventState::Stopped;
                    self.active.retain(|h| *h != hndl);
                }
                EventState::PendingStart => {
                    event.state = EventState::Started;
                    self.active.push(hndl);
                }
                _ => {}
            }
        }
    }
}

/// Access to the event pool from inside an overflow handler.
///
/// The manager lock is already held by the handler's caller, so list mutations are recorded as
/// pending and applied once the current pass over the active list completes.
#[derive(Debug)]
pub struct OverflowContext<'a> {
    events: &'a mut [Option<PmuEvent>],
    changed: &'a mut Vec<Handle>,
    current: Handle,
}

impl<'a> OverflowContext<'a> {
    fn sampling_event(&mut self, hndl: Handle) -> Result<(&mut PmuEvent, bool)> {
        let current = self.current == hndl;
        let event = self
            .events
            .get_mut(hndl.index())
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidArgument)?;
        if event.mode == EventMode::Counter {
            return Err(Error::InvalidArgument);
        }
        // The handler being run is lent out for the duration of the call.
        let serviced = current || event.handler.is_some();
        Ok((event, serviced))
    }

    /// Start a sampling event without taking the manager lock.
    pub fn start_unlocked(&mut self, hndl: Handle) -> Result<()> {
        let (event, serviced) = self.sampling_event(hndl)?;
        event.group.enable()?;
        if event.state == EventState::Stopped && serviced {
            event.state = EventState::PendingStart;
            self.changed.push(hndl);
        }
        Ok(())
    }

    /// Stop a sampling event without taking the manager lock.
    pub fn stop_unlocked(&mut self, hndl: Handle) -> Result<()> {
        let (event, serviced) = self.sampling_event(hndl)?;
        event.group.disable()?;
        if event.state == EventState::Started && serviced {
            event.state = EventState::PendingStop;
            self.changed.push(hndl);
        }
        Ok(())
    }
}

/// Owner of the event pool and the sampling timer.
#[derive(Debug)]
pub struct EventManager {
    state: Mutex<ManagerState>,
    timer: Option<Timer>,
    /// Mirrors whether the active list is non-empty, readable without the lock.
    sampling: AtomicBool,
    paused: AtomicBool,
    account_time: AtomicBool,
    sample_time_us: AtomicU64,
    malformed: AtomicU64,
}

impl EventManager {
    /// Create a manager with an empty pool. Without a timer, sampling events are only drained
    /// by explicit calls to `service`.
    pub fn new(timer: Option<Timer>) -> Self {
        let mut events = Vec::with_capacity(MAX_EVENTS);
        events.resize_with(MAX_EVENTS, || None);
        EventManager {
            state: Mutex::new(ManagerState {
                events,
                free: (0..MAX_EVENTS as u32).collect(),
                active: Vec::new(),
                changed: Vec::new(),
            }),
            timer,
            sampling: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            account_time: AtomicBool::new(false),
            sample_time_us: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    fn arm_timer(&self) {
        if let Some(t) = &self.timer {
            let _ = t.start();
        }
    }

    fn disarm_timer(&self) {
        if let Some(t) = &self.timer {
            let _ = t.stop();
        }
    }

    fn sync_sampling(&self, st: &ManagerState) {
        self.sampling.store(!st.active.is_empty(), Ordering::Release);
    }

    /// Number of unused slots.
    pub fn free_slots(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Register a counting event.
    pub fn add_event(&self, group: EventGroup) -> Result<Handle> {
        self.state.lock().insert(PmuEvent {
            mode: EventMode::Counter,
            state: EventState::Stopped,
            group,
            data: None,
            aux: None,
            watermark: 0,
            handler: OverflowHandler::None,
        })
    }

    /// Register a sampling event. The watermark is clamped to the mapping size.
    pub fn add_sample_event(
        &self,
        group: EventGroup,
        data: RingBuffer,
        layout: SampleLayout,
        watermark: u64,
        handler: Option<SampleHandler>,
    ) -> Result<Handle> {
        let watermark = std::cmp::min(watermark, data.mapped_size() as u64);
        self.state.lock().insert(PmuEvent {
            mode: EventMode::Sample(layout),
            state: EventState::Stopped,
            group,
            data: Some(data),
            aux: None,
            watermark,
            handler: match handler {
                Some(h) => OverflowHandler::Sample(h),
                None => OverflowHandler::None,
            },
        })
    }

    /// Start counting, adding sampling events with a handler to the active list.
    pub fn start(&self, hndl: Handle) -> Result<()> {
        let mut st = self.state.lock();
        let event = st.get_mut(hndl)?;
        event.group.enable()?;
        let join = event.state == EventState::Stopped && event.handler.is_some();
        event.state = EventState::Started;
        if join {
            st.active.push(hndl);
            self.sync_sampling(&st);
            if !self.paused.load(Ordering::Acquire) {
                self.arm_timer();
            }
        }
        Ok(())
    }

    /// Stop counting, removing sampling events from the active list.
    pub fn stop(&self, hndl: Handle) -> Result<()> {
        let mut st = self.state.lock();
        self.stop_locked(&mut st, hndl)
    }

    fn stop_locked(&self, st: &mut ManagerState, hndl: Handle) -> Result<()> {
        let event = st.get_mut(hndl)?;
        event.group.disable()?;
        let leave = event.state == EventState::Started && event.handler.is_some();
        event.state = EventState::Stopped;
        if leave {
            st.active.retain(|h| *h != hndl);
            self.sync_sampling(st);
            if st.active.is_empty() {
                self.disarm_timer();
            }
        }
        Ok(())
    }

    /// Reset the counter of an event.
    pub fn reset(&self, hndl: Handle) -> Result<()> {
        self.state.lock().get_mut(hndl)?.group.reset()
    }

    /// Read the counter of an event.
    pub fn read(&self, hndl: Handle) -> Result<u64> {
        self.state.lock().get_mut(hndl)?.group.read_value()
    }

    /// Current state of an event.
    pub fn state(&self, hndl: Handle) -> Result<EventState> {
        Ok(self.state.lock().get_mut(hndl)?.state)
    }

    /// Stop an event if needed, release its buffers and descriptors and free its slot.
    pub fn cleanup(&self, hndl: Handle) -> Result<()> {
        let mut st = self.state.lock();
        if st.get_mut(hndl)?.state != EventState::Stopped {
            self.stop_locked(&mut st, hndl)?;
        }
        st.changed.retain(|h| *h != hndl);
        if let Some(event) = st.events[hndl.index()].take() {
            let PmuEvent {
                group, data, aux, ..
            } = event;
            group.disable_all();
            // Unmap before closing the descriptors.
            drop(data);
            drop(aux);
            drop(group);
            st.free.push_back(hndl.0);
        }
        Ok(())
    }

    /// Release every open event.
    pub fn cleanup_all(&self) {
        let open: Vec<Handle> = {
            let st = self.state.lock();
            (0..MAX_EVENTS as u32)
                .filter(|i| st.events[*i as usize].is_some())
                .map(Handle)
                .collect()
        };
        for hndl in open {
            let _ = self.cleanup(hndl);
        }
    }

    /// Suspend timer servicing; counters keep counting.
    pub fn pause(&self) {
        let st = self.state.lock();
        self.paused.store(true, Ordering::Release);
        if !st.active.is_empty() {
            self.disarm_timer();
        }
    }

    /// Resume timer servicing.
    pub fn resume(&self) {
        let st = self.state.lock();
        self.paused.store(false, Ordering::Release);
        if !st.active.is_empty() {
            self.arm_timer();
        }
    }

    /// Stop the timer for good.
    pub fn shutdown(&self) {
        let _st = self.state.lock();
        self.paused.store(true, Ordering::Release);
        self.disarm_timer();
    }

    /// Accumulate the time spent in `service`.
    pub fn set_time_accounting(&self, on: bool) {
        self.account_time.store(on, Ordering::Relaxed);
    }

    /// Total time spent servicing sampling events, in microseconds.
    pub fn sample_time_us(&self) -> u64 {
        self.sample_time_us.load(Ordering::Relaxed)
    }

    /// Drains cut short by a malformed record since the last call, resetting the count.
    pub fn take_malformed(&self) -> u64 {
        self.malformed.swap(0, Ordering::Relaxed)
    }

    /// One pass over the active list: drain each buffer, run its handler, then apply the state
    /// changes the handlers requested.
    ///
    /// Returns `false` when the lock was busy and the pass was skipped.
    pub fn service(&self) -> bool {
        let mut guard = match self.state.try_lock() {
            Some(g) => g,
            None => {
                if self.sampling.load(Ordering::Acquire) && !self.paused.load(Ordering::Acquire) {
                    self.arm_timer();
                }
                return false;
            }
        };
        let st = &mut *guard;
        if st.active.is_empty() {
            return true;
        }
        let begin = if self.account_time.load(Ordering::Relaxed) {
            Some(Instant::now())
        } else {
            None
        };

        for i in 0..st.active.len() {
            let hndl = st.active[i];
            let (samples, handler) = match st.events[hndl.index()].as_mut() {
                Some(event) => {
                    let layout = match event.mode {
                        EventMode::Sample(l) => l,
                        EventMode::Counter => continue,
                    };
                    let watermark = event.watermark;
                    let samples = match event.data.as_mut() {
                        Some(rb) => {
                            let samples = rb.drain(watermark, layout);
                            self.malformed
                                .fetch_add(rb.take_malformed(), Ordering::Relaxed);
                            samples
                        }
                        None => None,
                    };
                    match samples {
                        Some(s) => {
                            let handler =
                                std::mem::replace(&mut event.handler, OverflowHandler::None);
                            (s, handler)
                        }
                        None => continue,
                    }
                }
                None => continue,
            };
            if let OverflowHandler::Sample(mut f) = handler {
                {
                    let mut ctx = OverflowContext {
                        events: &mut st.events,
                        changed: &mut st.changed,
                        current: hndl,
                    };
                    f(&mut ctx, hndl, samples);
                }
                if let Some(event) = st.events[hndl.index()].as_mut() {
                    event.handler = OverflowHandler::Sample(f);
                }
            }
        }
        st.apply_changes();
        self.sync_sampling(st);

        if let Some(begin) = begin {
            let us = begin.elapsed().as_micros() as u64;
            self.sample_time_us.fetch_add(us, Ordering::Relaxed);
        }
        if !st.active.is_empty() && !self.paused.load(Ordering::Acquire) {
            self.arm_timer();
        }
        true
    }
}
