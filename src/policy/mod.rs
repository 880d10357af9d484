//! Policy entry-point plumbing: classifying a span and carving managed ranges
//! so a policy change lands exactly on it.

pub mod apply;

use crate::config::UvmConfig;
use crate::error::{UvmError, UvmResult};
use crate::mm::{Vma, is_valid_vma_range};
use crate::va::policy::PolicyChange;
use crate::va::range_tree::{RangeTree, RangeTreeEntry};
use crate::va::space::VaSpaceState;

/// What kind of memory a policy call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRangeType {
    /// Fully covered by live managed ranges.
    Managed,
    /// Pageable memory translated by ATS hardware.
    Ats,
    /// Pageable memory tracked through the CPU page tables.
    Hmm,
}

/// Decides how `[base, base + length)` is handled.
///
/// A span with no VA range at `base` must be free of ranges and covered by
/// VMAs; it is ATS or HMM memory depending on what the platform has. A span
/// that starts in a range must be covered end to end, without holes, by live
/// managed ranges.
///
/// # Errors
/// `InvalidAddress` for anything else.
pub fn range_type_check(
    state: &VaSpaceState,
    config: &UvmConfig,
    vmas: Option<&RangeTree<Vma>>,
    base: u64,
    length: u64,
) -> UvmResult<ApiRangeType> {
    let end = base + length - 1;
    if state.find(base).is_none() {
        if !state.ranges().range_empty(base, end) {
            return Err(UvmError::InvalidAddress);
        }
        if !vmas.is_some_and(|vmas| is_valid_vma_range(vmas, base, length)) {
            return Err(UvmError::InvalidAddress);
        }
        return if config.ats_enabled {
            Ok(ApiRangeType::Ats)
        } else if config.hmm_enabled {
            Ok(ApiRangeType::Hmm)
        } else {
            Err(UvmError::InvalidAddress)
        };
    }

    let mut covered_to = None;
    for range in state.ranges().iter_in_contig(base, end) {
        if !range.is_managed() || range.is_managed_zombie() {
            return Err(UvmError::InvalidAddress);
        }
        covered_to = Some(range.end());
    }
    match covered_to {
        Some(last) if last >= end => Ok(ApiRangeType::Managed),
        _ => Err(UvmError::InvalidAddress),
    }
}

/// Makes `addr` a range boundary if the range containing it would be changed
/// by `change`.
///
/// # Errors
/// Split failures.
pub fn split_as_needed(state: &mut VaSpaceState, addr: u64, change: &PolicyChange) -> UvmResult<()> {
    let Some(range) = state.find(addr) else {
        return Ok(());
    };
    if range.start() == addr || !change.differs_from(range.policy()) {
        return Ok(());
    }
    state.split(addr - 1)
}

/// Splits at both edges of `[start, end)`.
///
/// # Errors
/// Split failures. A failure at the upper edge leaves the lower split in place.
pub fn split_span_as_needed(
    state: &mut VaSpaceState,
    start: u64,
    end: u64,
    change: &PolicyChange,
) -> UvmResult<()> {
    split_as_needed(state, start, change)?;
    split_as_needed(state, end, change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ProcessorId;
    use crate::va::space::VaSpace;
    use std::sync::Arc;

    fn space() -> VaSpace {
        VaSpace::new(1, 1, Arc::new(UvmConfig::new()))
    }

    fn vmas(start: u64, end: u64) -> RangeTree<Vma> {
        let mut tree = RangeTree::new();
        tree.add(Vma::new(start, end)).unwrap();
        tree
    }

    #[test]
    fn test_range_type_managed_needs_full_coverage() {
        let space = space();
        let config = UvmConfig::new();
        let mut state = space.down_write();
        state.create_managed(0x10000, 0x2000).unwrap();
        state.create_managed(0x12000, 0x2000).unwrap();
        state.create_managed(0x20000, 0x1000).unwrap();

        assert_eq!(
            range_type_check(&state, &config, None, 0x10000, 0x4000),
            Ok(ApiRangeType::Managed)
        );
        assert_eq!(
            range_type_check(&state, &config, None, 0x11000, 0x10000),
            Err(UvmError::InvalidAddress)
        );

        state.zombify(0x12000).unwrap();
        assert_eq!(
            range_type_check(&state, &config, None, 0x10000, 0x4000),
            Err(UvmError::InvalidAddress)
        );
    }

    #[test]
    fn test_range_type_pageable_memory() {
        let space = space();
        let mut state = space.down_write();
        let vmas = vmas(0x100000, 0x1fffff);
        state.create_external(0x300000, 0x1000).unwrap();

        let plain = UvmConfig::new();
        let ats = UvmConfig::new().ats(true);
        let hmm = UvmConfig::new().hmm(true);

        assert_eq!(
            range_type_check(&state, &plain, Some(&vmas), 0x100000, 0x1000),
            Err(UvmError::InvalidAddress)
        );
        assert_eq!(
            range_type_check(&state, &ats, Some(&vmas), 0x100000, 0x1000),
            Ok(ApiRangeType::Ats)
        );
        assert_eq!(
            range_type_check(&state, &hmm, Some(&vmas), 0x100000, 0x1000),
            Ok(ApiRangeType::Hmm)
        );
        assert_eq!(
            range_type_check(&state, &hmm, None, 0x100000, 0x1000),
            Err(UvmError::InvalidAddress)
        );
        assert_eq!(
            range_type_check(&state, &hmm, Some(&vmas), 0x1ff000, 0x2000),
            Err(UvmError::InvalidAddress)
        );
        assert_eq!(
            range_type_check(&state, &hmm, Some(&vmas), 0x300000, 0x1000),
            Err(UvmError::InvalidAddress)
        );
    }

    #[test]
    fn test_split_only_where_policy_differs() {
        let space = space();
        let mut state = space.down_write();
        state.create_managed(0x0, 0x4000).unwrap();

        let noop = PolicyChange::AccessedBy {
            processor: ProcessorId::CPU,
            set: false,
        };
        split_span_as_needed(&mut state, 0x1000, 0x3000, &noop).unwrap();
        assert_eq!(state.ranges().len(), 1);

        let change = PolicyChange::AccessedBy {
            processor: ProcessorId::CPU,
            set: true,
        };
        split_span_as_needed(&mut state, 0x1000, 0x3000, &change).unwrap();
        let spans: Vec<_> = state.ranges().iter().map(|r| (r.start(), r.end())).collect();
        assert_eq!(spans, vec![(0x0, 0xfff), (0x1000, 0x2fff), (0x3000, 0x3fff)]);

        split_span_as_needed(&mut state, 0x1000, 0x3000, &change).unwrap();
        assert_eq!(state.ranges().len(), 3);
        split_as_needed(&mut state, 0x10000, &change).unwrap();
    }
}
