//! Per-region migration policy.

use crate::processor::{ProcessorId, ProcessorMask};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadDuplication {
    /// Never configured. Left on the first enable/disable and never re-entered.
    #[default]
    Unset,
    Enabled,
    Disabled,
}

/// Attributes shared by every page of one managed range or HMM policy node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VaPolicy {
    pub preferred_location: Option<ProcessorId>,
    /// Only meaningful when `preferred_location` is the CPU.
    pub preferred_cpu_numa_node: Option<u32>,
    pub accessed_by: ProcessorMask,
    pub read_duplication: ReadDuplication,
}

impl VaPolicy {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            preferred_location: None,
            preferred_cpu_numa_node: None,
            accessed_by: ProcessorMask::EMPTY,
            read_duplication: ReadDuplication::Unset,
        }
    }

    /// Whether the preferred location (and NUMA preference) match exactly.
    #[must_use]
    pub fn preferred_location_equal(
        &self,
        location: Option<ProcessorId>,
        cpu_numa_node: Option<u32>,
    ) -> bool {
        if self.preferred_location != location {
            return false;
        }
        match location {
            Some(id) if id.is_cpu() => self.preferred_cpu_numa_node == cpu_numa_node,
            _ => true,
        }
    }

    #[must_use]
    pub fn read_duplication_enabled(&self) -> bool {
        self.read_duplication == ReadDuplication::Enabled
    }

    pub(crate) fn set_preferred_location(
        &mut self,
        location: Option<ProcessorId>,
        cpu_numa_node: Option<u32>,
    ) {
        self.preferred_location = location;
        self.preferred_cpu_numa_node = match location {
            Some(id) if id.is_cpu() => cpu_numa_node,
            _ => None,
        };
    }
}

/// Which policy field a mutation targets. Drives split predicates and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyChange {
    PreferredLocation {
        location: Option<ProcessorId>,
        cpu_numa_node: Option<u32>,
    },
    AccessedBy {
        processor: ProcessorId,
        set: bool,
    },
    ReadDuplication(ReadDuplication),
}

impl PolicyChange {
    /// True when a region with `policy` would be modified by this change.
    ///
    /// Split boundaries only need to be introduced where this holds.
    #[must_use]
    pub fn differs_from(&self, policy: &VaPolicy) -> bool {
        match *self {
            Self::PreferredLocation {
                location,
                cpu_numa_node,
            } => !policy.preferred_location_equal(location, cpu_numa_node),
            Self::AccessedBy { processor, set } => policy.accessed_by.test(processor) != set,
            Self::ReadDuplication(state) => policy.read_duplication != state,
        }
    }

    /// Applies the value change to `policy` without any block work.
    pub fn apply_to(&self, policy: &mut VaPolicy) {
        match *self {
            Self::PreferredLocation {
                location,
                cpu_numa_node,
            } => policy.set_preferred_location(location, cpu_numa_node),
            Self::AccessedBy {
                processor,
                set: true,
            } => policy.accessed_by.set(processor),
            Self::AccessedBy {
                processor,
                set: false,
            } => policy.accessed_by.clear(processor),
            Self::ReadDuplication(state) => policy.read_duplication = state,
        }
    }
}
