//! Per region execution and compilation metrics.
//!
//! Generated code reports into one process wide table through the functions of [`ffi`]; the
//! table itself is an ordinary value that can be built and dropped in isolation.

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::fmt::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub mod ffi;

/// Counters of one code region.
#[derive(Debug)]
pub struct RegionMetadata {
    address: u64,
    executions: AtomicU64,
    compilations: AtomicU64,
    exec_time: AtomicU64,
    comp_time: AtomicU64,
    passes: Mutex<Option<Vec<u32>>>,
    fingerprint: Mutex<Option<String>>,
}

impl RegionMetadata {
    fn new(address: u64) -> Self {
        RegionMetadata {
            address,
            executions: AtomicU64::new(0),
            compilations: AtomicU64::new(0),
            exec_time: AtomicU64::new(0),
            comp_time: AtomicU64::new(0),
            passes: Mutex::new(None),
            fingerprint: Mutex::new(None),
        }
    }

    /// Region address.
    #[inline]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Copy of the current values.
    pub fn stats(&self) -> RegionStats {
        RegionStats {
            address: self.address,
            executions: self.executions.load(Ordering::Relaxed),
            compilations: self.compilations.load(Ordering::Relaxed),
            exec_time: self.exec_time.load(Ordering::Relaxed),
            comp_time: self.comp_time.load(Ordering::Relaxed),
            passes: self.passes.lock().clone(),
            fingerprint: self.fingerprint.lock().clone(),
        }
    }
}

/// Snapshot of a region's metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionStats {
    /// Region address.
    pub address: u64,
    /// Executions.
    pub executions: u64,
    /// Compilations.
    pub compilations: u64,
    /// Cumulative execution time, in ticks.
    pub exec_time: u64,
    /// Cumulative compilation time, in ticks.
    pub comp_time: u64,
    /// Optimization passes chosen for the region.
    pub passes: Option<Vec<u32>>,
    /// Fingerprint of the region.
    pub fingerprint: Option<String>,
}

impl fmt::Display for RegionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let passes: Vec<String> = self
            .passes
            .iter()
            .flatten()
            .map(|p| p.to_string())
            .collect();
        write!(
            f,
            "{};{};{};{};{};{};[{}]",
            self.fingerprint.as_deref().unwrap_or(""),
            self.address,
            self.exec_time,
            self.executions,
            self.comp_time,
            self.compilations,
            passes.join(",")
        )
    }
}

/// Address keyed table of region metrics. Entries are created on first use and live as long as
/// the table.
#[derive(Debug, Default)]
pub struct RegionProfiler {
    regions: RwLock<FxHashMap<u64, Arc<RegionMetadata>>>,
}

impl RegionProfiler {
    /// An empty table.
    pub fn new() -> Self {
        RegionProfiler::default()
    }

    fn region(&self, address: u64) -> Arc<RegionMetadata> {
        if let Some(r) = self.regions.read().get(&address) {
            return Arc::clone(r);
        }
        let mut regions = self.regions.write();
        Arc::clone(
            regions
                .entry(address)
                .or_insert_with(|| Arc::new(RegionMetadata::new(address))),
        )
    }

    /// Run `f` on the entry of `address`, creating it if needed.
    pub fn with_region<F, T>(&self, address: u64, f: F) -> T
    where
        F: FnOnce(&RegionMetadata) -> T,
    {
        f(&self.region(address))
    }

    /// Count `inc` executions.
    pub fn increment_executions(&self, address: u64, inc: u64) {
        self.with_region(address, |r| r.executions.fetch_add(inc, Ordering::Relaxed));
    }

    /// Count `inc` compilations.
    pub fn increment_compilations(&self, address: u64, inc: u64) {
        self.with_region(address, |r| r.compilations.fetch_add(inc, Ordering::Relaxed));
    }

    /// Add execution time.
    pub fn add_exec_time(&self, address: u64, val: u64) {
        self.with_region(address, |r| r.exec_time.fetch_add(val, Ordering::Relaxed));
    }

    /// Add compilation time.
    pub fn add_comp_time(&self, address: u64, val: u64) {
        self.with_region(address, |r| r.comp_time.fetch_add(val, Ordering::Relaxed));
    }

    /// Record the passes chosen for a region.
    pub fn set_passes(&self, address: u64, passes: Vec<u32>) {
        self.with_region(address, |r| *r.passes.lock() = Some(passes));
    }

    /// Record the fingerprint of a region.
    pub fn set_fingerprint(&self, address: u64, fingerprint: String) {
        self.with_region(address, |r| *r.fingerprint.lock() = Some(fingerprint));
    }

    /// Snapshot of one region, without creating it.
    pub fn stats(&self, address: u64) -> Option<RegionStats> {
        self.regions.read().get(&address).map(|r| r.stats())
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    /// Whether no region was touched.
    pub fn is_empty(&self) -> bool {
        self.regions.read().is_empty()
    }

    /// Snapshot of every region, by ascending address.
    pub fn all_stats(&self) -> Vec<RegionStats> {
        let mut stats: Vec<RegionStats> =
            self.regions.read().values().map(|r| r.stats()).collect();
        stats.sort_by_key(|s| s.address);
        stats
    }

    /// Write the semicolon separated table.
    pub fn render(&self, out: &mut dyn Write) -> fmt::Result {
        write!(out, "\nMetrics statistics: \n")?;
        writeln!(
            out,
            "Fingerprint;Region;ExecutionTime;#Executed;CompilationTime;#Compilated;Passes"
        )?;
        for s in self.all_stats() {
            writeln!(out, "{}", s)?;
        }
        Ok(())
    }

    /// The table as a string.
    pub fn report(&self) -> String {
        let mut s = String::new();
        let _ = self.render(&mut s);
        s
    }

    /// Print the table to standard error.
    pub fn print(&self) {
        eprint!("{}", self.report());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn test_lazy_regions() {
        let m = RegionProfiler::new();
        assert!(m.is_empty());
        assert!(m.stats(0x10).is_none());
        m.increment_executions(0x10, 1);
        m.increment_executions(0x10, 2);
        m.increment_compilations(0x10, 1);
        m.add_exec_time(0x10, 100);
        m.add_comp_time(0x10, 40);
        let s = m.stats(0x10).unwrap();
        assert_eq!(
            (s.executions, s.compilations, s.exec_time, s.comp_time),
            (3, 1, 100, 40)
        );
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_concurrent_increments() {
        let m = RegionProfiler::new();
        let (k, callers) = (1000u64, 16usize);
        (0..callers).into_par_iter().for_each(|i| {
            for _ in 0..k {
                m.increment_executions(0x1000, 1);
                m.increment_executions(0x2000 + (i % 4) as u64, 1);
            }
        });
        assert_eq!(m.stats(0x1000).unwrap().executions, k * callers as u64);
        let spread: u64 = (0..4).map(|i| m.stats(0x2000 + i).unwrap().executions).sum();
        assert_eq!(spread, k * callers as u64);
        assert_eq!(m.len(), 5);
    }

    #[test]
    fn test_report_format() {
        let m = RegionProfiler::new();
        m.increment_executions(200, 2);
        m.add_exec_time(200, 31);
        m.set_passes(200, vec![3, 1, 4]);
        m.set_fingerprint(200, "loop-a".to_string());
        m.increment_compilations(100, 1);
        m.add_comp_time(100, 9);
        assert_eq!(
            m.report(),
            "\nMetrics statistics: \n\
             Fingerprint;Region;ExecutionTime;#Executed;CompilationTime;#Compilated;Passes\n\
             ;100;0;0;9;1;[]\n\
             loop-a;200;31;2;0;0;[3,1,4]\n"
        );
    }
}
