//! VA ranges: typed, non-overlapping regions of a VA space.

use crate::error::{UvmError, UvmResult};
use crate::mm::Vma;
use crate::processor::{ProcessorId, ProcessorMask};
use crate::tools::PerfEvents;
use crate::utils::{VA_BLOCK_SIZE, va_block_align_down, va_block_align_up};
use crate::va::block::{BlockContext, VaBlock};
use crate::va::external::ExternalRange;
use crate::va::policy::VaPolicy;
use crate::va::processors::Processors;
use crate::va::range_tree::{RangeNode, RangeTreeEntry};
use crate::va::semaphore::SemaphorePool;
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VaRangeType {
    Managed,
    External,
    Channel,
    SkedReflected,
    SemaphorePool,
}

// ===============================================================================================
// Variant payloads
// ===============================================================================================

/// Memory whose placement the driver controls, tracked in lazily created
/// blocks.
#[derive(Debug)]
pub struct ManagedRange {
    pub(crate) policy: VaPolicy,
    blocks: Vec<OnceLock<Box<VaBlock>>>,
    /// CPU mapping backing the range. `None` once the range is a zombie.
    vma: Option<Arc<Vma>>,
    /// GPUs that must keep a mapping to the preferred location.
    pub(crate) uvm_lite_gpus: ProcessorMask,
    inject_split_error: bool,
}

impl ManagedRange {
    fn new(node: &RangeNode, vma: Option<Arc<Vma>>) -> Self {
        Self {
            policy: VaPolicy::new(),
            blocks: (0..num_blocks(node)).map(|_| OnceLock::new()).collect(),
            vma,
            uvm_lite_gpus: ProcessorMask::EMPTY,
            inject_split_error: false,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &VaPolicy {
        &self.policy
    }

    #[must_use]
    pub const fn uvm_lite_gpus(&self) -> ProcessorMask {
        self.uvm_lite_gpus
    }

    #[must_use]
    pub fn vma(&self) -> Option<&Arc<Vma>> {
        self.vma.as_ref()
    }
}

/// A GPU channel's instance memory mapped into the VA space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRange {
    pub gpu: ProcessorId,
    pub ref_count: u32,
    /// Handed back to RM when the channel is unregistered.
    pub rm_descriptor: u64,
}

/// A dynamic-parallelism region whose PTEs reflect back to SKED.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkedReflectedRange {
    pub gpu: Option<ProcessorId>,
}

#[derive(Debug)]
pub enum VaRangeKind {
    Managed(ManagedRange),
    External(ExternalRange),
    Channel(ChannelRange),
    SkedReflected(SkedReflectedRange),
    SemaphorePool(SemaphorePool),
}

// ===============================================================================================
// VaRange
// ===============================================================================================

#[derive(Debug)]
pub struct VaRange {
    node: RangeNode,
    kind: VaRangeKind,
}

impl RangeTreeEntry for VaRange {
    fn node(&self) -> &RangeNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut RangeNode {
        &mut self.node
    }
}

impl VaRange {
    #[must_use]
    pub fn new_managed(start: u64, end: u64, vma: Option<Arc<Vma>>) -> Self {
        let node = RangeNode::new(start, end);
        Self {
            kind: VaRangeKind::Managed(ManagedRange::new(&node, vma)),
            node,
        }
    }

    #[must_use]
    pub const fn new(start: u64, end: u64, kind: VaRangeKind) -> Self {
        Self {
            node: RangeNode::new(start, end),
            kind,
        }
    }

    #[must_use]
    pub const fn range_type(&self) -> VaRangeType {
        match self.kind {
            VaRangeKind::Managed(_) => VaRangeType::Managed,
            VaRangeKind::External(_) => VaRangeType::External,
            VaRangeKind::Channel(_) => VaRangeType::Channel,
            VaRangeKind::SkedReflected(_) => VaRangeType::SkedReflected,
            VaRangeKind::SemaphorePool(_) => VaRangeType::SemaphorePool,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &VaRangeKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut VaRangeKind {
        &mut self.kind
    }

    pub(crate) fn into_kind(self) -> VaRangeKind {
        self.kind
    }

    #[must_use]
    pub const fn is_managed(&self) -> bool {
        matches!(self.kind, VaRangeKind::Managed(_))
    }

    #[must_use]
    pub const fn managed(&self) -> Option<&ManagedRange> {
        match &self.kind {
            VaRangeKind::Managed(managed) => Some(managed),
            _ => None,
        }
    }

    pub fn managed_mut(&mut self) -> Option<&mut ManagedRange> {
        match &mut self.kind {
            VaRangeKind::Managed(managed) => Some(managed),
            _ => None,
        }
    }

    /// Policy of a managed range.
    ///
    /// # Panics
    /// Panics if the range is not managed; only managed ranges carry policy.
    #[must_use]
    pub fn policy(&self) -> &VaPolicy {
        match &self.kind {
            VaRangeKind::Managed(managed) => &managed.policy,
            _ => panic!(
                "[0x{:x}, 0x{:x}] is not a managed range",
                self.node.start, self.node.end
            ),
        }
    }

    /// Everything block operations on this range need, or `None` for
    /// non-managed ranges.
    #[must_use]
    pub fn block_context<'a>(
        &'a self,
        processors: &'a Processors,
        events: &'a PerfEvents,
    ) -> Option<BlockContext<'a>> {
        let managed = self.managed()?;
        Some(BlockContext {
            processors,
            events,
            policy: &managed.policy,
            uvm_lite_gpus: managed.uvm_lite_gpus,
        })
    }

    /// A managed range whose CPU mapping has gone away.
    #[must_use]
    pub fn is_managed_zombie(&self) -> bool {
        self.managed().is_some_and(|managed| managed.vma.is_none())
    }

    /// Detaches the CPU mapping, keeping blocks and policy alive.
    ///
    /// # Errors
    /// `InvalidAddress` for non-managed ranges.
    pub fn zombify(&mut self) -> UvmResult<()> {
        let managed = self.managed_mut().ok_or(UvmError::InvalidAddress)?;
        managed.vma = None;
        Ok(())
    }

    // -------------------------------------------------------------------------------------------
    // Block geometry
    // -------------------------------------------------------------------------------------------

    #[must_use]
    pub fn num_blocks(&self) -> usize {
        num_blocks(&self.node)
    }

    /// Index of the block covering `addr`.
    #[must_use]
    pub fn block_index(&self, addr: u64) -> usize {
        debug_assert!(self.node.contains(addr));
        block_index(&self.node, addr)
    }

    #[must_use]
    pub fn block_calc_start(&self, index: usize) -> u64 {
        block_calc_start(&self.node, index)
    }

    #[must_use]
    pub fn block_calc_end(&self, index: usize) -> u64 {
        let start = self.block_calc_start(index);
        (va_block_align_up(start) - 1).min(self.node.end)
    }

    /// The materialized block at `index`, if any.
    #[must_use]
    pub fn block(&self, index: usize) -> Option<&VaBlock> {
        self.managed()?.blocks.get(index)?.get().map(AsRef::as_ref)
    }

    /// Returns the block at `index`, creating it on first touch.
    ///
    /// Safe under the VA-space read lock: concurrent creators agree on one
    /// block.
    ///
    /// # Errors
    /// `InvalidAddress` for non-managed ranges or an out-of-bounds index.
    pub fn block_create(&self, index: usize) -> UvmResult<&VaBlock> {
        let managed = self.managed().ok_or(UvmError::InvalidAddress)?;
        let slot = managed.blocks.get(index).ok_or(UvmError::InvalidAddress)?;
        let block = slot.get_or_init(|| {
            Box::new(VaBlock::new(
                self.block_calc_start(index),
                self.block_calc_end(index),
                self.node.start,
            ))
        });
        Ok(block)
    }

    /// Materialized blocks in address order, with their indices.
    pub fn blocks(&self) -> impl Iterator<Item = (usize, &VaBlock)> {
        self.managed()
            .into_iter()
            .flat_map(|managed| managed.blocks.iter().enumerate())
            .filter_map(|(index, slot)| slot.get().map(|block| (index, block.as_ref())))
    }

    /// First materialized block after `index`, or the first one for `None`.
    #[must_use]
    pub fn block_next(&self, index: Option<usize>) -> Option<(usize, &VaBlock)> {
        let from = index.map_or(0, |i| i + 1);
        self.blocks().find(|&(i, _)| i >= from)
    }

    pub(crate) fn blocks_mut(&mut self) -> impl Iterator<Item = &mut VaBlock> {
        self.managed_mut()
            .into_iter()
            .flat_map(|managed| managed.blocks.iter_mut())
            .filter_map(|slot| slot.get_mut().map(AsMut::as_mut))
    }

    // -------------------------------------------------------------------------------------------
    // Split
    // -------------------------------------------------------------------------------------------

    /// Makes the next split of this range fail with `OutOfMemory`.
    ///
    /// # Errors
    /// `InvalidAddress` for non-managed ranges.
    pub fn inject_split_error(&mut self) -> UvmResult<()> {
        self.managed_mut().ok_or(UvmError::InvalidAddress)?.inject_split_error = true;
        Ok(())
    }

    /// Builds the upper half `[upper.start, upper.end]` of a split.
    ///
    /// Policy and UVM-Lite state are copied. A materialized block straddling
    /// the split point is split, later blocks move to the new range and this
    /// range's block array shrinks. Bounds of `self` are left for the range
    /// tree to update.
    pub(crate) fn split_upper(&mut self, upper: RangeNode) -> UvmResult<Self> {
        let node = self.node;
        let VaRangeKind::Managed(managed) = &mut self.kind else {
            return Err(UvmError::InvalidAddress);
        };
        debug_assert!(node.start < upper.start && upper.end == node.end);

        if managed.inject_split_error {
            managed.inject_split_error = false;
            log::debug!(
                "Injected split error on [0x{:x}, 0x{:x}]",
                node.start,
                node.end
            );
            return Err(UvmError::OutOfMemory);
        }

        let mut new = ManagedRange::new(&upper, managed.vma.clone());
        new.policy = managed.policy;
        new.uvm_lite_gpus = managed.uvm_lite_gpus;

        let split_index = block_index(&node, upper.start);
        let mut new_index = 0;
        if block_calc_start(&node, split_index) != upper.start {
            if let Some(block) = managed.blocks[split_index].get_mut() {
                let mut upper_state = block.state_mut().split(upper.start - 1);
                upper_state.set_range_start(upper.start);
                new.blocks[0] = OnceLock::from(Box::new(VaBlock::from_state(upper_state)));
            }
            new_index = 1;
        }

        for index in new_index..new.blocks.len() {
            if let Some(mut block) = managed.blocks[split_index + index].take() {
                block.state_mut().set_range_start(upper.start);
                new.blocks[index] = OnceLock::from(block);
            }
        }

        let existing_blocks = split_index + new_index;
        managed.blocks.truncate(existing_blocks);
        managed.blocks.shrink_to_fit();

        Ok(Self {
            node: upper,
            kind: VaRangeKind::Managed(new),
        })
    }
}

fn num_blocks(node: &RangeNode) -> usize {
    let start = va_block_align_down(node.start);
    let end = va_block_align_up(node.end);
    usize::try_from((end - start) / VA_BLOCK_SIZE).unwrap_or(usize::MAX)
}

fn block_index(node: &RangeNode, addr: u64) -> usize {
    usize::try_from(addr / VA_BLOCK_SIZE - node.start / VA_BLOCK_SIZE).unwrap_or(usize::MAX)
}

fn block_calc_start(node: &RangeNode, index: usize) -> u64 {
    let block_start = va_block_align_down(node.start) + index as u64 * VA_BLOCK_SIZE;
    node.start.max(block_start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::PAGE_SIZE;

    const BS: u64 = VA_BLOCK_SIZE;

    #[test]
    fn test_block_geometry() {
        let range = VaRange::new_managed(BS - PAGE_SIZE, 3 * BS + PAGE_SIZE - 1, None);
        assert_eq!(range.num_blocks(), 4);
        assert_eq!(range.block_index(BS - PAGE_SIZE), 0);
        assert_eq!(range.block_index(BS), 1);
        assert_eq!(range.block_index(3 * BS), 3);
        assert_eq!(range.block_calc_start(0), BS - PAGE_SIZE);
        assert_eq!(range.block_calc_end(0), BS - 1);
        assert_eq!(range.block_calc_start(2), 2 * BS);
        assert_eq!(range.block_calc_end(3), 3 * BS + PAGE_SIZE - 1);
    }

    #[test]
    fn test_lazy_block_creation() {
        let range = VaRange::new_managed(0, 2 * BS - 1, None);
        assert!(range.block(1).is_none());
        let block = range.block_create(1).unwrap();
        assert_eq!(block.start(), BS);
        assert!(std::ptr::eq(block, range.block_create(1).unwrap()));
        assert_eq!(range.blocks().count(), 1);
        assert_eq!(range.block_next(None).map(|(i, _)| i), Some(1));
        assert!(range.block_next(Some(1)).is_none());
        assert!(range.block_create(2).is_err());
    }

    #[test]
    fn test_split_moves_blocks() {
        let mut range = VaRange::new_managed(0, 3 * BS - 1, None);
        range.block_create(0).unwrap();
        range.block_create(1).unwrap();
        range.block_create(2).unwrap();
        range.managed_mut().unwrap().policy.accessed_by.set(ProcessorId::gpu(0));

        let upper = range
            .split_upper(RangeNode::new(BS + PAGE_SIZE, 3 * BS - 1))
            .unwrap();
        assert_eq!(upper.num_blocks(), 2);
        assert_eq!(upper.policy(), range.policy());

        let (_, first) = upper.block_next(None).unwrap();
        assert_eq!(first.start(), BS + PAGE_SIZE);
        assert_eq!(first.end(), 2 * BS - 1);
        assert_eq!(first.lock().range_start(), BS + PAGE_SIZE);
        assert_eq!(upper.block(1).unwrap().start(), 2 * BS);

        assert_eq!(range.managed().unwrap().blocks.len(), 2);
        assert_eq!(range.block(1).unwrap().end(), BS + PAGE_SIZE - 1);
    }

    #[test]
    fn test_split_at_block_boundary_and_injection() {
        let mut range = VaRange::new_managed(0, 2 * BS - 1, None);
        range.block_create(1).unwrap();

        range.inject_split_error().unwrap();
        assert_eq!(
            range.split_upper(RangeNode::new(BS, 2 * BS - 1)).err(),
            Some(UvmError::OutOfMemory)
        );

        let upper = range.split_upper(RangeNode::new(BS, 2 * BS - 1)).unwrap();
        assert_eq!(upper.blocks().count(), 1);
        assert_eq!(range.managed().unwrap().blocks.len(), 1);
    }

    #[test]
    fn test_non_managed_ranges() {
        let mut range = VaRange::new(
            0,
            PAGE_SIZE - 1,
            VaRangeKind::SkedReflected(SkedReflectedRange { gpu: None }),
        );
        assert_eq!(range.range_type(), VaRangeType::SkedReflected);
        assert!(range.zombify().is_err());
        assert!(
            range
                .split_upper(RangeNode::new(PAGE_SIZE, PAGE_SIZE))
                .is_err()
        );
        assert!(!range.is_managed_zombie());
    }

    #[test]
    fn test_zombify() {
        let vma = Arc::new(Vma::new(0, PAGE_SIZE - 1));
        let mut range = VaRange::new_managed(0, PAGE_SIZE - 1, Some(vma));
        assert!(!range.is_managed_zombie());
        range.zombify().unwrap();
        assert!(range.is_managed_zombie());
    }
}
