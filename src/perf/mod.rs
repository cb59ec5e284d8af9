//! Interfaces that deal with the kernel perf utilities.

pub mod ffi;

mod version;
pub use version::PerfVersion;

mod event;
pub use event::{EventGroup, EventId, PerfEventBuilder};

mod mmap;
pub use mmap::{drain_samples, RingBuffer, SampleLayout, SampleList};
