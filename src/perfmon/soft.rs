//! Process wide software counters and the enabled profile categories.

use crate::perf::SampleList;
use derive_more::{BitAnd, BitOr, BitOrAssign};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Set of profile categories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, BitOr, BitAnd, BitOrAssign)]
pub struct ProfileMode(u64);

impl ProfileMode {
    /// Nothing is profiled.
    pub const NONE: ProfileMode = ProfileMode(0);
    /// Static trace statistics.
    pub const BASIC: ProfileMode = ProfileMode(1 << 0);
    /// Per thread trace execution counters.
    pub const TRACE: ProfileMode = ProfileMode(1 << 1);
    /// Code cache usage.
    pub const CACHE: ProfileMode = ProfileMode(1 << 2);
    /// Optimization pass reports.
    pub const PASS: ProfileMode = ProfileMode(1 << 3);
    /// Hardware counters.
    pub const HPM: ProfileMode = ProfileMode(1 << 4);
    /// Trace exit counts.
    pub const EXIT: ProfileMode = ProfileMode(1 << 5);
    /// Instruction pointer sampling of the code caches.
    pub const HOTSPOT: ProfileMode = ProfileMode(1 << 6);
    /// Every category.
    pub const ALL: ProfileMode = ProfileMode(0x7f);

    const TOKENS: [(&'static str, ProfileMode); 9] = [
        ("none", ProfileMode::NONE),
        ("basic", ProfileMode::BASIC),
        ("trace", ProfileMode::TRACE),
        ("cache", ProfileMode::CACHE),
        ("pass", ProfileMode::PASS),
        ("hpm", ProfileMode::HPM),
        ("exit", ProfileMode::EXIT),
        ("hotspot", ProfileMode::HOTSPOT),
        ("all", ProfileMode::ALL),
    ];

    /// Parse a comma separated list of category names. Unknown names are skipped.
    pub fn parse(level: &str) -> Self {
        level
            .split(',')
            .filter_map(|token| {
                ProfileMode::TOKENS
                    .iter()
                    .find(|(name, _)| *name == token)
                    .map(|(_, mode)| *mode)
            })
            .fold(ProfileMode::NONE, |acc, m| acc | m)
    }

    /// Raw bits.
    #[inline]
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Whether every category of `other` is enabled.
    #[inline]
    pub fn contains(self, other: ProfileMode) -> bool {
        self & other == other
    }

    /// Whether no category is enabled.
    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Report routine registered by an optimization pass.
pub type ExitFn = Box<dyn Fn(&mut dyn fmt::Write) -> fmt::Result + Send + Sync>;

/// Snapshot of the software counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Instructions retired.
    pub insns: u64,
    /// Branch instructions.
    pub branches: u64,
    /// Memory loads.
    pub loads: u64,
    /// Memory stores.
    pub stores: u64,
    /// Exits from optimized traces.
    pub trace_exits: u64,
    /// Time spent in the sampling handler, in microseconds.
    pub sample_time_us: u64,
}

/// Software performance monitor.
pub struct SoftwarePerfmon {
    mode: ProfileMode,
    cover_set: u32,
    verbose: bool,
    insns: AtomicU64,
    branches: AtomicU64,
    loads: AtomicU64,
    stores: AtomicU64,
    trace_exits: AtomicU64,
    sample_time_us: AtomicU64,
    samples: Mutex<Vec<SampleList>>,
    exit_fns: Mutex<Vec<ExitFn>>,
}

impl SoftwarePerfmon {
    /// A monitor for the categories named in `level`.
    pub fn new(level: &str, cover_set: u32) -> Self {
        SoftwarePerfmon::with_mode(ProfileMode::parse(level), cover_set)
    }

    /// A monitor for `mode`.
    pub fn with_mode(mode: ProfileMode, cover_set: u32) -> Self {
        SoftwarePerfmon {
            mode,
            cover_set,
            verbose: false,
            insns: AtomicU64::new(0),
            branches: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            trace_exits: AtomicU64::new(0),
            sample_time_us: AtomicU64::new(0),
            samples: Mutex::new(Vec::new()),
            exit_fns: Mutex::new(Vec::new()),
        }
    }

    builder_pattern!(
        /// List every trace of the cover set in the report.
        set_verbose => verbose: bool
    );

    /// Enabled categories.
    #[inline]
    pub fn mode(&self) -> ProfileMode {
        self.mode
    }

    /// Whether any category is enabled.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        !self.mode.is_none()
    }

    /// Whether `mode` is enabled.
    #[inline]
    pub fn has(&self, mode: ProfileMode) -> bool {
        self.mode.contains(mode)
    }

    /// Cover set percentage.
    #[inline]
    pub fn cover_set(&self) -> u32 {
        self.cover_set
    }

    /// Whether the report lists cover set traces.
    #[inline]
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Add hardware counter totals of one thread.
    pub fn add_counts(&self, insns: u64, branches: u64, loads: u64, stores: u64) {
        self.insns.fetch_add(insns, Ordering::Relaxed);
        self.branches.fetch_add(branches, Ordering::Relaxed);
        self.loads.fetch_add(loads, Ordering::Relaxed);
        self.stores.fetch_add(stores, Ordering::Relaxed);
    }

    /// Add trace exits of one thread.
    pub fn add_trace_exits(&self, n: u64) {
        self.trace_exits.fetch_add(n, Ordering::Relaxed);
    }

    /// Add sampling handler time, in microseconds.
    pub fn add_sample_time(&self, us: u64) {
        self.sample_time_us.fetch_add(us, Ordering::Relaxed);
    }

    /// Current counter values.
    pub fn counters(&self) -> Counters {
        Counters {
            insns: self.insns.load(Ordering::Relaxed),
            branches: self.branches.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            trace_exits: self.trace_exits.load(Ordering::Relaxed),
            sample_time_us: self.sample_time_us.load(Ordering::Relaxed),
        }
    }

    /// Queue a batch of sampled instruction pointers.
    ///
    /// Called from the sampling signal handler, so it never blocks: the batch is dropped if the
    /// list is being consumed. Returns whether it was kept.
    pub fn push_samples(&self, samples: SampleList) -> bool {
        match self.samples.try_lock() {
            Some(mut list) => {
                list.push(samples);
                true
            }
            None => false,
        }
    }

    /// Take every queued batch.
    pub fn take_samples(&self) -> Vec<SampleList> {
        std::mem::take(&mut *self.samples.lock())
    }

    /// Register a routine printed under the pass information of the report.
    pub fn register_exit_fn(&self, f: ExitFn) {
        self.exit_fns.lock().push(f);
    }

    /// Number of registered report routines.
    pub fn num_exit_fns(&self) -> usize {
        self.exit_fns.lock().len()
    }

    pub(crate) fn run_exit_fns(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        for f in self.exit_fns.lock().iter() {
            f(out)?;
        }
        Ok(())
    }
}

impl Default for SoftwarePerfmon {
    fn default() -> Self {
        SoftwarePerfmon::with_mode(ProfileMode::NONE, crate::config::COVER_SET)
    }
}

impl fmt::Debug for SoftwarePerfmon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwarePerfmon")
            .field("mode", &self.mode)
            .field("cover_set", &self.cover_set)
            .field("counters", &self.counters())
            .field("exit_fns", &self.num_exit_fns())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_profile_mode() {
        assert_eq!(ProfileMode::parse(""), ProfileMode::NONE);
        assert_eq!(
            ProfileMode::parse("basic,hotspot"),
            ProfileMode::BASIC | ProfileMode::HOTSPOT
        );
        assert_eq!(ProfileMode::parse("none,bogus,exit"), ProfileMode::EXIT);
        let all = ProfileMode::parse("all");
        assert_eq!(all, ProfileMode::ALL);
        for (_, m) in ProfileMode::TOKENS.iter() {
            assert!(all.contains(*m));
        }
        assert!(!ProfileMode::BASIC.contains(ProfileMode::HPM));
    }

    #[test]
    fn test_counters() {
        let sp = SoftwarePerfmon::new("hpm", 90);
        assert!(sp.is_enabled());
        assert!(sp.has(ProfileMode::HPM));
        sp.add_counts(10, 2, 3, 4);
        sp.add_counts(1, 1, 1, 1);
        sp.add_trace_exits(5);
        sp.add_sample_time(7);
        let c = sp.counters();
        assert_eq!((c.insns, c.branches, c.loads, c.stores), (11, 3, 4, 5));
        assert_eq!((c.trace_exits, c.sample_time_us), (5, 7));
        assert!(!SoftwarePerfmon::default().is_enabled());
    }

    #[test]
    fn test_samples_dropped_while_consumed() {
        let sp = SoftwarePerfmon::new("hotspot", 90);
        assert!(sp.push_samples(SampleList::from(vec![1, 2])));
        {
            let _held = sp.samples.lock();
            assert!(!sp.push_samples(SampleList::from(vec![3])));
        }
        let taken = sp.take_samples();
        assert_eq!(taken.len(), 1);
        assert_eq!(*taken[0], vec![1, 2]);
        assert!(sp.take_samples().is_empty());
    }

    #[test]
    fn test_exit_fns() {
        let sp = SoftwarePerfmon::new("pass", 90);
        sp.register_exit_fn(Box::new(|out: &mut dyn fmt::Write| writeln!(out, "licm: 3 hoisted")));
        let mut s = String::new();
        sp.run_exit_fns(&mut s).unwrap();
        assert_eq!(s, "licm: 3 hoisted\n");
    }
}
