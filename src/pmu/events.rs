//! Pre-defined logical events and their per-architecture encodings.

pub use crate::perf::EventId;
use crate::perf::ffi;

/// Pre-defined event code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCode {
    /// CPU cycles.
    CpuCycles,
    /// Reference cycles, not affected by frequency scaling.
    RefCpuCycles,
    /// Retired instructions.
    Instructions,
    /// Last level cache references.
    LlcReferences,
    /// Last level cache misses.
    LlcMisses,
    /// Retired branch instructions.
    BranchInstructions,
    /// Mispredicted branches.
    BranchMisses,
    /// Instruction cache hits.
    IcacheHits,
    /// Instruction cache misses.
    IcacheMisses,
    /// Retired load instructions.
    MemLoads,
    /// Retired store instructions.
    MemStores,
}

impl EventCode {
    /// Every pre-defined event, in declaration order.
    pub const ALL: [EventCode; 11] = [
        EventCode::CpuCycles,
        EventCode::RefCpuCycles,
        EventCode::Instructions,
        EventCode::LlcReferences,
        EventCode::LlcMisses,
        EventCode::BranchInstructions,
        EventCode::BranchMisses,
        EventCode::IcacheHits,
        EventCode::IcacheMisses,
        EventCode::MemLoads,
        EventCode::MemStores,
    ];

    /// The generic hardware event for the basic events every table shares.
    fn basic(self) -> Option<EventId> {
        let config = match self {
            EventCode::CpuCycles => ffi::PERF_COUNT_HW_CPU_CYCLES,
            EventCode::RefCpuCycles => ffi::PERF_COUNT_HW_REF_CPU_CYCLES,
            EventCode::Instructions => ffi::PERF_COUNT_HW_INSTRUCTIONS,
            EventCode::LlcReferences => ffi::PERF_COUNT_HW_CACHE_REFERENCES,
            EventCode::LlcMisses => ffi::PERF_COUNT_HW_CACHE_MISSES,
            EventCode::BranchInstructions => ffi::PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
            EventCode::BranchMisses => ffi::PERF_COUNT_HW_BRANCH_MISSES,
            _ => return None,
        };
        Some(EventId::hardware(config as u64))
    }
}

/// Maps logical events to the encodings of one platform.
pub trait EventTable: Send + Sync + std::fmt::Debug {
    /// Name of the platform.
    fn name(&self) -> &'static str;

    /// Platform specific encoding of the events outside the basic set.
    fn arch_event(&self, _code: EventCode) -> Option<EventId> {
        None
    }

    /// Resolve `code`, or `None` when the platform cannot count it.
    fn lookup(&self, code: EventCode) -> Option<EventId> {
        code.basic().or_else(|| self.arch_event(code))
    }
}

/// Hosts without a dedicated table only get the basic events.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericEvents;

impl EventTable for GenericEvents {
    fn name(&self) -> &'static str {
        "generic"
    }
}

/// Skylake encodings.
#[derive(Debug, Default, Clone, Copy)]
pub struct X86Events;

impl EventTable for X86Events {
    fn name(&self) -> &'static str {
        "x86"
    }

    fn arch_event(&self, code: EventCode) -> Option<EventId> {
        match code {
            EventCode::IcacheHits => Some(EventId::raw(0x83, 0x1)),
            EventCode::IcacheMisses => Some(EventId::raw(0x83, 0x2)),
            EventCode::MemLoads => Some(EventId::raw(0xd0, 0x81)),
            EventCode::MemStores => Some(EventId::raw(0xd0, 0x82)),
            _ => None,
        }
    }
}

/// ARMv8 common architectural events.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArmEvents;

impl EventTable for ArmEvents {
    fn name(&self) -> &'static str {
        "arm"
    }

    fn arch_event(&self, code: EventCode) -> Option<EventId> {
        match code {
            EventCode::IcacheMisses => Some(EventId::raw(0x01, 0)),
            EventCode::MemLoads => Some(EventId::raw(0x06, 0)),
            EventCode::MemStores => Some(EventId::raw(0x07, 0)),
            _ => None,
        }
    }
}

/// POWER encodings.
#[derive(Debug, Default, Clone, Copy)]
pub struct PpcEvents;

impl EventTable for PpcEvents {
    fn name(&self) -> &'static str {
        "ppc"
    }

    fn arch_event(&self, code: EventCode) -> Option<EventId> {
        match code {
            EventCode::IcacheMisses => Some(EventId::raw(0x200fd, 0)),
            EventCode::MemLoads => Some(EventId::raw(0x100fc, 0)),
            _ => None,
        }
    }
}
