//! Trace formation and profiling core of a dynamic binary translator.
//!
//! Per thread tracers pick hot block sequences and hand them to an optimization backend, while
//! hardware counters sampled through linux perf and software counters feed a profile report.

#![deny(missing_docs, missing_debug_implementations)]

#[macro_use]
#[allow(dead_code)]
pub(crate) mod util;

mod errors;
pub use errors::{Error, Result};

pub mod perf;
pub use perf::ffi;

pub mod pmu;

pub mod arch;

pub mod config;
pub use config::{HeadPolicy, TracerConfig, TransMode};

pub mod tracer;

pub mod perfmon;

pub mod metrics;
