//! Textual profile report.

use crate::config::{TracerConfig, TransMode};
use crate::perfmon::{HardwarePerfmon, ProfileMode, SoftwarePerfmon};
use crate::tracer::{TraceRegistry, TranslatedCode};
use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::sync::Arc;

/// Indices of the hottest entries of `counts` whose sum reaches `pct` percent of `total`,
/// hottest first. Entries without samples never join the set.
pub fn cover_set(counts: &[u64], total: u64, pct: u32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..counts.len()).collect();
    order.sort_by(|a, b| counts[*b].cmp(&counts[*a]));

    let target = total * u64::from(pct) / 100;
    let mut accu = 0;
    let mut n = 0;
    for &i in &order {
        if accu >= target || counts[i] == 0 {
            break;
        }
        n += 1;
        accu += counts[i];
    }
    order.truncate(n);
    order
}

fn seconds(us: u64) -> f64 {
    us as f64 * 1e-6
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// Renders the statistics kept by the software perfmon and the trace registry.
#[derive(Debug)]
pub struct ProfileReport<'a> {
    soft: &'a SoftwarePerfmon,
    registry: &'a TraceRegistry,
    config: &'a TracerConfig,
    hard: Option<&'a HardwarePerfmon>,
}

impl<'a> ProfileReport<'a> {
    /// A report over the given state.
    pub fn new(
        soft: &'a SoftwarePerfmon,
        registry: &'a TraceRegistry,
        config: &'a TracerConfig,
    ) -> Self {
        ProfileReport {
            soft,
            registry,
            config,
            hard: None,
        }
    }

    /// Flush the sampling time of `hard` into the counters before each render.
    pub fn with_hard(mut self, hard: &'a HardwarePerfmon) -> Self {
        self.hard = Some(hard);
        self
    }

    /// Write the report. Pending instruction pointer samples are consumed.
    pub fn render(&self, out: &mut dyn Write) -> fmt::Result {
        if !self.soft.is_enabled() {
            return Ok(());
        }
        if let Some(hard) = self.hard {
            hard.flush();
        }
        match self.config.mode() {
            TransMode::None => Ok(()),
            TransMode::Block => self.block_profile(out),
            TransMode::HybridS | TransMode::HybridM => self.trace_profile(out),
        }
    }

    /// Print the report to standard error.
    pub fn print(&self) {
        let mut s = String::new();
        if self.render(&mut s).is_ok() {
            eprint!("{}", s);
        }
    }

    fn block_profile(&self, out: &mut dyn Write) -> fmt::Result {
        let codes = self.registry.codes();
        let (mut guest_size, mut guest_icount, mut host_size) = (0, 0, 0);
        let (mut trans_time, mut max_time) = (0, 0);
        for tc in &codes {
            if let Some(block) = tc.trace().blocks().first() {
                guest_size += u64::from(block.size());
                guest_icount += u64::from(block.icount());
            }
            host_size += tc.size();
            let t = tc.trace().trans_time_us();
            trans_time += t;
            max_time = max_time.max(t);
        }

        write!(out, "\nBlock statistic:\n")?;
        writeln!(out, "Num of Blocks    : {}", codes.len())?;
        writeln!(out, "G/H Code Size    : {}/{}bytes", guest_size, host_size)?;
        writeln!(out, "Guest ICount     : {}", guest_icount)?;
        writeln!(
            out,
            "Translation Time : {:.6} seconds (max={} ms)",
            seconds(trans_time),
            max_time / 1000
        )
    }

    fn trace_profile(&self, out: &mut dyn Write) -> fmt::Result {
        let codes = self.registry.codes();
        writeln!(out)?;
        if codes.is_empty() {
            return write!(out, "Trace statistic:\nNum of Traces  : 0\n\n");
        }

        if self.soft.has(ProfileMode::BASIC) {
            self.basic(out, &codes)?;
        }
        if self.soft.has(ProfileMode::EXIT) {
            writeln!(
                out,
                "Num of TraceExit : {}",
                self.soft.counters().trace_exits
            )?;
        }
        if self.soft.has(ProfileMode::HPM) {
            self.hpm(out)?;
        }
        if self.soft.has(ProfileMode::HOTSPOT) {
            self.hotspot(out, &codes)?;
        }
        if self.soft.has(ProfileMode::CACHE) {
            self.cache(out)?;
        }
        if self.soft.has(ProfileMode::TRACE) {
            self.trace_exec(out, &codes)?;
        }
        if self.soft.has(ProfileMode::PASS) && self.soft.num_exit_fns() > 0 {
            write!(out, "\n-------------------------\nPass information:\n")?;
            self.soft.run_exit_fns(out)?;
        }
        Ok(())
    }

    fn basic(&self, out: &mut dyn Write, codes: &[Arc<TranslatedCode>]) -> fmt::Result {
        let (mut guest_size, mut host_size) = (0, 0);
        let (mut blocks, mut loops, mut exits, mut ibs) = (0u64, 0u64, 0u64, 0u64);
        let (mut max_block, mut max_loop, mut max_exit, mut max_ib) = (0usize, 0, 0, 0);
        let (mut trans_time, mut max_time) = (0, 0);
        let mut len_dist: BTreeMap<usize, usize> = BTreeMap::new();

        for tc in codes {
            let trace = tc.trace();
            let len = trace.blocks().len();
            guest_size += trace.guest_size();
            host_size += tc.size();
            blocks += len as u64;
            loops += u64::from(trace.num_loop());
            exits += u64::from(trace.num_exit());
            ibs += u64::from(trace.num_indirect_br());
            trans_time += trace.trans_time_us();

            max_block = max_block.max(len);
            max_loop = max_loop.max(trace.num_loop());
            max_exit = max_exit.max(trace.num_exit());
            max_ib = max_ib.max(trace.num_indirect_br());
            max_time = max_time.max(trace.trans_time_us());
            *len_dist.entry(len).or_insert(0) += 1;
        }

        let n = codes.len() as f64;
        writeln!(out, "Trace statistic:")?;
        writeln!(out, "Num of Traces    : {}", codes.len())?;
        writeln!(out, "Profile Thres.   : {}", self.config.profile_threshold())?;
        writeln!(out, "Predict Thres.   : {}", self.config.predict_threshold())?;
        writeln!(out, "G/H Code Size    : {}/{} bytes", guest_size, host_size)?;
        writeln!(
            out,
            "Translation Time : {:.6} seconds (max={} ms)",
            seconds(trans_time),
            max_time / 1000
        )?;
        writeln!(
            out,
            "Average # Blocks : {:.1} (max={})",
            blocks as f64 / n,
            max_block
        )?;
        writeln!(
            out,
            "Average # Loops  : {:.1} (max={})",
            loops as f64 / n,
            max_loop
        )?;
        writeln!(
            out,
            "Average # Exits  : {:.1} (max={})",
            exits as f64 / n,
            max_exit
        )?;
        writeln!(out, "Average # IBs    : {:.1} (max={})", ibs as f64 / n, max_ib)?;
        writeln!(out, "Flush Count      : {}", self.registry.num_flush())?;

        write!(out, "Trace length distribution: (1-{})\n    ", max_block)?;
        for len in 1..=max_block {
            write!(out, "{} ", len_dist.get(&len).cloned().unwrap_or(0))?;
        }
        writeln!(out)
    }

    fn hpm(&self, out: &mut dyn Write) -> fmt::Result {
        let c = self.soft.counters();
        writeln!(out, "Num of Insns     : {}", c.insns)?;
        writeln!(out, "Num of Loads     : {}", c.loads)?;
        writeln!(out, "Num of Stores    : {}", c.stores)?;
        writeln!(out, "Num of Branches  : {}", c.branches)?;
        writeln!(
            out,
            "Sample Time      : {:.6} seconds",
            seconds(c.sample_time_us)
        )
    }

    fn hotspot(&self, out: &mut dyn Write, codes: &[Arc<TranslatedCode>]) -> fmt::Result {
        let block_cache = self.registry.block_cache();
        let trace_cache = self.registry.trace_cache();
        let mut sorted: Vec<usize> = (0..codes.len()).collect();
        sorted.sort_by_key(|&i| codes[i].code());

        // Shares are taken over the samples of this report only.
        let mut counts = vec![0u64; codes.len()];
        let (mut in_block, mut in_trace, mut other) = (0u64, 0u64, 0u64);
        for list in self.soft.take_samples() {
            for &ip in list.iter() {
                if block_cache.contains(ip) {
                    in_block += 1;
                } else if trace_cache.contains(ip) {
                    in_trace += 1;
                } else {
                    other += 1;
                }
                let i = sorted.partition_point(|&j| codes[j].code() as u64 <= ip);
                if i > 0 && codes[sorted[i - 1]].contains(ip) {
                    counts[sorted[i - 1]] += 1;
                }
            }
        }
        for (tc, &n) in codes.iter().zip(&counts) {
            if n > 0 {
                tc.add_samples(n);
            }
        }

        let pct = self.soft.cover_set();
        let total = in_block + in_trace + other;
        if total == 0 {
            return writeln!(out, "{}% CoverSet     : 0", pct);
        }

        let block_ratio = in_block as f64 * 100.0 / total as f64;
        let trace_ratio = in_trace as f64 * 100.0 / total as f64;
        writeln!(
            out,
            "Breakdown        : block ({:.1}%) trace ({:.1}%) other ({:.1}%)",
            block_ratio,
            trace_ratio,
            100.0 - block_ratio - trace_ratio
        )?;

        let covered = cover_set(&counts, total, pct);
        writeln!(out, "{}% CoverSet     : {}", pct, covered.len())?;
        if covered.is_empty() {
            return Ok(());
        }

        let share = |i: usize| counts[i] as f64 * 100.0 / total as f64;
        if self.soft.verbose() {
            writeln!(out, "Traces of CoverSet:")?;
            for &i in &covered {
                let pcs: Vec<String> = codes[i]
                    .trace()
                    .blocks()
                    .iter()
                    .map(|b| format!("{:x}", b.pc()))
                    .collect();
                writeln!(out, "{:4} ({:.1}%): {}", i, share(i), pcs.join(","))?;
            }
        } else {
            let top: Vec<String> = covered
                .iter()
                .take(10)
                .map(|&i| format!("{:.1}%", share(i)))
                .collect();
            writeln!(out, "Percentage of CoverSet (top 10): {}", top.join(" "))?;
        }
        Ok(())
    }

    fn cache(&self, out: &mut dyn Write) -> fmt::Result {
        let block_cache = self.registry.block_cache();
        let trace_cache = self.registry.trace_cache();
        let block_used = self.registry.block_code_used();
        let trace_used = self.registry.trace_code_used();

        write!(out, "-------------------------\nBlock/Trace Cache information:\n")?;
        writeln!(
            out,
            "Block: start={:#x} size={} code={:8} (ratio={:.2}%)",
            block_cache.start,
            block_cache.size,
            block_used,
            ratio(block_used, block_cache.size)
        )?;
        write!(
            out,
            "Trace: start={:#x} size={} code={:8} (ratio={:.2}%)\n\n",
            trace_cache.start,
            trace_cache.size,
            trace_used,
            ratio(trace_used, trace_cache.size)
        )
    }

    fn trace_exec(&self, out: &mut dyn Write, codes: &[Arc<TranslatedCode>]) -> fmt::Result {
        write!(out, "----------------------------\nTrace execution information:\n")?;
        for cpu in 0..self.config.num_threads() {
            write!(out, ">\nThread {}:\n", cpu)?;
            writeln!(out, "                                   dynamic exec count")?;
            writeln!(out, "  id      pc      #loop:#exit      loop      ibtc      exit")?;
            let mut used = 0;
            for (j, tc) in codes.iter().enumerate() {
                let trace = tc.trace();
                let c = trace.exec_counts(cpu);
                if c.iter().sum::<u64>() == 0 {
                    continue;
                }
                used += 1;
                writeln!(
                    out,
                    "{:4}) 0x{:08x}    {:2}    {:2}   {:8}  {:8}  {:8}",
                    j,
                    trace.entry_pc(),
                    trace.num_loop(),
                    trace.num_exit(),
                    c[0],
                    c[1],
                    c[2]
                )?;
            }
            writeln!(out, "Trace used: {}/{}", used, codes.len())?;
        }
        Ok(())
    }
}

/// Render the profile report into a string.
pub fn profile_report(
    soft: &SoftwarePerfmon,
    registry: &TraceRegistry,
    config: &TracerConfig,
) -> String {
    let mut s = String::new();
    // Writing into a string cannot fail.
    let _ = ProfileReport::new(soft, registry, config).render(&mut s);
    s
}
