//! External allocations: memory the driver did not allocate, mapped on
//! individual GPUs.
//!
//! Each GPU has its own tree of mappings guarded by its own mutex, so mappings
//! on different GPUs can change while the VA space is only held for read.

use crate::error::{UvmError, UvmResult};
use crate::gpu::Gpu;
use crate::lock::{LockMode, LockOrder, OrderToken, Ordered};
use crate::processor::{MAX_GPUS, ProcessorId, ProcessorMask};
use crate::tracker::Tracker;
use crate::va::block::Prot;
use crate::va::range_tree::{RangeNode, RangeTree, RangeTreeEntry};
use parking_lot::{Mutex, MutexGuard};

/// One GPU mapping of part of an external range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtGpuMap {
    node: RangeNode,
    pub gpu: ProcessorId,
    pub prot: Prot,
    /// Opaque handle of the backing allocation.
    pub mem_handle: u64,
    /// Offset of `node.start` into the backing allocation.
    pub offset: u64,
}

impl RangeTreeEntry for ExtGpuMap {
    fn node(&self) -> &RangeNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut RangeNode {
        &mut self.node
    }
}

type ExtTreeGuard<'a> = Ordered<MutexGuard<'a, RangeTree<ExtGpuMap>>>;

#[derive(Debug)]
pub struct ExternalRange {
    gpu_ranges: Vec<Mutex<RangeTree<ExtGpuMap>>>,
}

impl Default for ExternalRange {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalRange {
    #[must_use]
    pub fn new() -> Self {
        Self {
            gpu_ranges: (0..MAX_GPUS).map(|_| Mutex::new(RangeTree::new())).collect(),
        }
    }

    fn tree(&self, gpu: ProcessorId) -> UvmResult<ExtTreeGuard<'_>> {
        let index = gpu.gpu_index().ok_or(UvmError::InvalidDevice)?;
        let token = OrderToken::acquire(LockOrder::ExtRangeTree, LockMode::Exclusive);
        Ok(Ordered::new(self.gpu_ranges[index].lock(), token))
    }

    /// Maps `[start, start + length)` of this range on `gpu`.
    ///
    /// Existing mappings on the same GPU that overlap the span are replaced.
    ///
    /// # Errors
    /// `InvalidAddress` if the span leaves `range`, `OutOfRange` if the GPU
    /// cannot address it, or a channel error from the page-table push.
    pub fn map(
        &self,
        range: &RangeNode,
        gpu: &Gpu,
        start: u64,
        length: u64,
        prot: Prot,
        mem_handle: u64,
        out: &mut Tracker,
    ) -> UvmResult<()> {
        let end = span_end(range, start, length)?;
        if !gpu.can_address(start, length) {
            return Err(UvmError::OutOfRange);
        }

        let mut tree = self.tree(gpu.id)?;
        remove_span(&mut tree, start, end)?;
        out.add_entry(gpu.channel().push("map external")?);
        tree.add(ExtGpuMap {
            node: RangeNode::new(start, end),
            gpu: gpu.id,
            prot,
            mem_handle,
            offset: 0,
        })?;
        Ok(())
    }

    /// Removes `gpu`'s mappings inside `[start, start + length)`, trimming any
    /// that cross the span edges.
    ///
    /// # Errors
    /// `InvalidAddress` if the span leaves `range` or nothing was mapped there.
    pub fn unmap(
        &self,
        range: &RangeNode,
        gpu: &Gpu,
        start: u64,
        length: u64,
        out: &mut Tracker,
    ) -> UvmResult<()> {
        let end = span_end(range, start, length)?;
        let mut tree = self.tree(gpu.id)?;
        if tree.range_empty(start, end) {
            return Err(UvmError::InvalidAddress);
        }
        out.add_entry(gpu.channel().push("unmap external")?);
        remove_span(&mut tree, start, end)
    }

    /// Drops every mapping `gpu` has in this range.
    ///
    /// # Errors
    /// Fails only if the unmap cannot be pushed.
    pub fn unmap_gpu(&self, gpu: &Gpu, out: &mut Tracker) -> UvmResult<()> {
        let mut tree = self.tree(gpu.id)?;
        if tree.is_empty() {
            return Ok(());
        }
        out.add_entry(gpu.channel().push("unmap external")?);
        *tree = RangeTree::new();
        Ok(())
    }

    #[must_use]
    pub fn mapped_gpus(&self) -> ProcessorMask {
        (0..MAX_GPUS)
            .map(ProcessorId::gpu)
            .filter(|&id| self.tree(id).is_ok_and(|tree| !tree.is_empty()))
            .collect()
    }

    /// Snapshot of `gpu`'s mappings, in address order.
    #[must_use]
    pub fn mappings(&self, gpu: ProcessorId) -> Vec<ExtGpuMap> {
        self.tree(gpu)
            .map(|tree| tree.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn span_end(range: &RangeNode, start: u64, length: u64) -> UvmResult<u64> {
    let end = length
        .checked_sub(1)
        .and_then(|l| start.checked_add(l))
        .ok_or(UvmError::InvalidAddress)?;
    if start < range.start || end > range.end {
        return Err(UvmError::InvalidAddress);
    }
    Ok(end)
}

fn remove_span(tree: &mut RangeTree<ExtGpuMap>, start: u64, end: u64) -> UvmResult<()> {
    for key in tree.keys_in(start, end) {
        let Some(node) = tree.get(key).map(|m| *m.node()) else {
            continue;
        };
        let key = if node.start < start {
            tree.split(node.start, start - 1, |lower, upper| {
                let mut map = lower.clone();
                map.offset += upper.start - lower.start();
                Ok(map)
            })?;
            start
        } else {
            key
        };
        if node.end > end {
            tree.split(key, end, |lower, upper| {
                let mut map = lower.clone();
                map.offset += upper.start - lower.start();
                Ok(map)
            })?;
        }
        tree.remove(key);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ProcessorUuid;

    #[test]
    fn test_map_unmap_trims_edges() {
        let range = RangeNode::new(0x10000, 0x1ffff);
        let gpu = Gpu::new(0, ProcessorUuid::default());
        let ext = ExternalRange::new();
        let mut tracker = Tracker::new();

        ext.map(&range, &gpu, 0x10000, 0x8000, Prot::ReadWrite, 7, &mut tracker)
            .unwrap();
        assert_eq!(ext.mapped_gpus(), ProcessorMask::single(gpu.id));

        ext.unmap(&range, &gpu, 0x12000, 0x2000, &mut tracker).unwrap();
        let spans: Vec<_> = ext
            .mappings(gpu.id)
            .iter()
            .map(|m| (m.start(), m.end(), m.offset))
            .collect();
        assert_eq!(spans, vec![(0x10000, 0x11fff, 0), (0x14000, 0x17fff, 0x4000)]);

        assert_eq!(
            ext.unmap(&range, &gpu, 0x12000, 0x1000, &mut tracker),
            Err(UvmError::InvalidAddress)
        );
        ext.unmap_gpu(&gpu, &mut tracker).unwrap();
        assert!(ext.mapped_gpus().is_empty());
        assert!(!tracker.is_empty());
    }

    #[test]
    fn test_map_rejects_bad_spans() {
        let range = RangeNode::new(0x10000, 0x1ffff);
        let gpu = Gpu::new(1, ProcessorUuid::default()).with_max_va(0x17fff);
        let ext = ExternalRange::new();
        let mut tracker = Tracker::new();

        assert_eq!(
            ext.map(&range, &gpu, 0xf000, 0x2000, Prot::Read, 1, &mut tracker),
            Err(UvmError::InvalidAddress)
        );
        assert_eq!(
            ext.map(&range, &gpu, 0x16000, 0x4000, Prot::Read, 1, &mut tracker),
            Err(UvmError::OutOfRange)
        );

        ext.map(&range, &gpu, 0x10000, 0x2000, Prot::Read, 1, &mut tracker)
            .unwrap();
        ext.map(&range, &gpu, 0x11000, 0x2000, Prot::Read, 2, &mut tracker)
            .unwrap();
        let handles: Vec<_> = ext.mappings(gpu.id).iter().map(|m| m.mem_handle).collect();
        assert_eq!(handles, vec![1, 2]);
    }
}
