//! Tracer configuration and its environment overrides.

use log::warn;
use std::str::FromStr;

/// Executions of a trace head before prediction starts.
pub const PROFILE_THRESHOLD: u32 = 50;
/// Maximum number of blocks in a predicted trace.
pub const PREDICT_THRESHOLD: usize = 64;
/// Prediction cap used when emulating a whole system.
pub const SOFTMMU_PREDICT_THRESHOLD: usize = 16;
/// Default cover set percentage of the hotspot report.
pub const COVER_SET: u32 = 90;

/// Which code units get optimized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransMode {
    /// No optimization; blocks are never classified.
    None,
    /// Every block is optimized on its own.
    Block,
    /// Traces, single threaded optimization backend.
    HybridS,
    /// Traces, multi threaded optimization backend.
    HybridM,
}

impl FromStr for TransMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(TransMode::None),
            "block" => Ok(TransMode::Block),
            "hybrids" => Ok(TransMode::HybridS),
            "hybridm" => Ok(TransMode::HybridM),
            _ => Err(format!("unknown translation mode `{}`", s)),
        }
    }
}

/// Rule deciding which revisited blocks become trace heads, and when prediction closes a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadPolicy {
    /// Any revisited block is a head; a cycle closes on any block already predicted.
    Relaxed,
    /// Only backward branch targets are heads; a cycle closes on the first block only.
    Strict,
}

impl FromStr for HeadPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relaxed" => Ok(HeadPolicy::Relaxed),
            "strict" => Ok(HeadPolicy::Strict),
            _ => Err(format!("unknown trace head policy `{}`", s)),
        }
    }
}

/// Settings of trace formation and profiling.
#[derive(Debug, Clone)]
pub struct TracerConfig {
    mode: TransMode,
    policy: HeadPolicy,
    profile_threshold: u32,
    predict_threshold: usize,
    profile_level: String,
    cover_set: u32,
    num_threads: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        TracerConfig {
            mode: TransMode::HybridM,
            policy: HeadPolicy::Relaxed,
            profile_threshold: PROFILE_THRESHOLD,
            predict_threshold: PREDICT_THRESHOLD,
            profile_level: String::new(),
            cover_set: COVER_SET,
            num_threads: 1,
        }
    }
}

fn overlay<T: FromStr>(key: &str, raw: Option<String>, slot: &mut T) {
    if let Some(raw) = raw {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!("Ignoring malformed {}={:?}", key, raw),
        }
    }
}

impl TracerConfig {
    /// Defaults overlaid with the `TRACE_*` environment variables.
    pub fn from_env() -> Self {
        TracerConfig::default().overlay_env(|k| std::env::var(k).ok())
    }

    /// Overlay values found by `lookup`. Malformed values are ignored with a warning.
    pub fn overlay_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        overlay("TRACE_MODE", lookup("TRACE_MODE"), &mut self.mode);
        overlay("TRACE_POLICY", lookup("TRACE_POLICY"), &mut self.policy);
        overlay(
            "TRACE_PROFILE_THRESHOLD",
            lookup("TRACE_PROFILE_THRESHOLD"),
            &mut self.profile_threshold,
        );
        overlay(
            "TRACE_PREDICT_THRESHOLD",
            lookup("TRACE_PREDICT_THRESHOLD"),
            &mut self.predict_threshold,
        );
        overlay("TRACE_COVER_SET", lookup("TRACE_COVER_SET"), &mut self.cover_set);
        if let Some(level) = lookup("TRACE_PROFILE") {
            self.profile_level = level;
        }
        // Zero would disable the caps entirely.
        if self.predict_threshold == 0 {
            warn!("Predict threshold must be positive, using {}", PREDICT_THRESHOLD);
            self.predict_threshold = PREDICT_THRESHOLD;
        }
        if self.profile_threshold == 0 {
            warn!("Profile threshold must be positive, using {}", PROFILE_THRESHOLD);
            self.profile_threshold = PROFILE_THRESHOLD;
        }
        self
    }

    /// Translation mode.
    #[inline]
    pub fn mode(&self) -> TransMode {
        self.mode
    }

    /// Trace head policy.
    #[inline]
    pub fn policy(&self) -> HeadPolicy {
        self.policy
    }

    /// Executions of a trace head before prediction starts.
    #[inline]
    pub fn profile_threshold(&self) -> u32 {
        self.profile_threshold
    }

    /// Maximum predicted trace length.
    #[inline]
    pub fn predict_threshold(&self) -> usize {
        self.predict_threshold
    }

    /// Comma separated profile categories.
    #[inline]
    pub fn profile_level(&self) -> &str {
        &self.profile_level
    }

    /// Cover set percentage.
    #[inline]
    pub fn cover_set(&self) -> u32 {
        self.cover_set
    }

    /// Number of guest threads tracked by per-thread counters.
    #[inline]
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    builder_pattern!(
        /// Set the translation mode.
        set_mode => mode: TransMode
    );

    builder_pattern!(
        /// Set the trace head policy.
        set_policy => policy: HeadPolicy
    );

    builder_pattern!(
        /// Set the profile threshold.
        set_profile_threshold => profile_threshold: u32
    );

    builder_pattern!(
        /// Set the prediction length cap.
        set_predict_threshold => predict_threshold: usize
    );

    builder_pattern!(
        /// Set the profile categories, e.g. `basic,hotspot`.
        set_profile_level => profile_level: String
    );

    builder_pattern!(
        /// Set the cover set percentage.
        set_cover_set => cover_set: u32
    );

    builder_pattern!(
        /// Set the number of guest threads.
        set_num_threads => num_threads: usize
    );
}
