//! Software and hardware performance monitors and the profile report.

mod soft;
pub use soft::{Counters, ExitFn, ProfileMode, SoftwarePerfmon};

mod hard;
pub use hard::{HardwarePerfmon, HpmControl, PerfmonData};

mod report;
pub use report::{cover_set, profile_report, ProfileReport};
