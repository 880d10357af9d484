//! The per-process VA space: the range tree, its processors and the lock that
//! guards both.
//!
//! Lock discipline: the VA-space lock is taken after the PM and mmap locks and
//! before any block lock. Range tree and policy changes need it for write.
//! Block work and waiting on trackers only need it for read.

use crate::config::UvmConfig;
use crate::error::{UvmError, UvmResult};
use crate::gpu::Gpu;
use crate::hmm::HmmPolicies;
use crate::lock::{LockMode, LockOrder, OrderToken, Ordered};
use crate::mm::{Caller, Mm, Vma};
use crate::policy::apply;
use crate::processor::{ProcessorId, ProcessorMask};
use crate::tools::{PerfEvent, PerfEvents};
use crate::tracker::Tracker;
use crate::utils::{api_range_invalid, page_aligned};
use crate::va::block::{AccessType, BlockContext, Prot};
use crate::va::external::ExternalRange;
use crate::va::fault;
use crate::va::processors::Processors;
use crate::va::range::{ChannelRange, SkedReflectedRange, VaRange, VaRangeKind};
use crate::va::range_tree::{RangeTree, RangeTreeEntry};
use crate::va::semaphore::{GpuMappingAttributes, SemaphorePool};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

pub type VaSpaceReadGuard<'a> = Ordered<RwLockReadGuard<'a, VaSpaceState>>;
pub type VaSpaceWriteGuard<'a> = Ordered<RwLockWriteGuard<'a, VaSpaceState>>;

// ===============================================================================================
// VaSpace
// ===============================================================================================

#[derive(Debug)]
pub struct VaSpace {
    id: u64,
    /// Process that created the VA space.
    owner_pid: i32,
    config: Arc<UvmConfig>,
    mm: Mutex<Option<Arc<Mm>>>,
    events: Arc<PerfEvents>,
    state: RwLock<VaSpaceState>,
}

impl VaSpace {
    #[must_use]
    pub fn new(id: u64, owner_pid: i32, config: Arc<UvmConfig>) -> Self {
        let events = Arc::new(PerfEvents::new());
        Self {
            id,
            owner_pid,
            config,
            mm: Mutex::new(None),
            state: RwLock::new(VaSpaceState::new(Arc::clone(&events))),
            events,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn owner_pid(&self) -> i32 {
        self.owner_pid
    }

    #[must_use]
    pub fn config(&self) -> &UvmConfig {
        &self.config
    }

    /// Listener registry for tools events raised by this VA space.
    #[must_use]
    pub fn events(&self) -> &Arc<PerfEvents> {
        &self.events
    }

    pub fn down_read(&self) -> VaSpaceReadGuard<'_> {
        let token = OrderToken::acquire(LockOrder::VaSpace, LockMode::Shared);
        Ordered::new(self.state.read(), token)
    }

    pub fn down_write(&self) -> VaSpaceWriteGuard<'_> {
        let token = OrderToken::acquire(LockOrder::VaSpace, LockMode::Exclusive);
        Ordered::new(self.state.write(), token)
    }

    /// Trades write access for read access without letting a writer in.
    pub fn downgrade_write(guard: VaSpaceWriteGuard<'_>) -> VaSpaceReadGuard<'_> {
        let (guard, token) = guard.into_parts();
        token.downgrade();
        Ordered::new(RwLockWriteGuard::downgrade(guard), token)
    }

    /// Ties the VA space to a memory map for its whole lifetime.
    ///
    /// # Errors
    /// `InUse` if a memory map is already registered.
    pub fn register_mm(&self, mm: Arc<Mm>) -> UvmResult<()> {
        let mut slot = self.mm.lock();
        if slot.is_some() {
            return Err(UvmError::InUse);
        }
        *slot = Some(mm);
        Ok(())
    }

    pub fn unregister_mm(&self) -> Option<Arc<Mm>> {
        self.mm.lock().take()
    }

    /// The registered memory map, else the caller's.
    ///
    /// Taken before the VA-space lock; the mmap lock orders first.
    #[must_use]
    pub fn mm_or_current_retain(&self, caller: &Caller) -> Option<Arc<Mm>> {
        self.mm.lock().clone().or_else(|| caller.mm.clone())
    }

    /// Services a fault from `processor` at `addr`, then waits for the
    /// resulting work with the lock held for read.
    ///
    /// # Errors
    /// See [`fault::service_fault_locked`]; channel errors surface from the
    /// wait.
    pub fn service_fault(
        &self,
        processor: ProcessorId,
        addr: u64,
        access: AccessType,
    ) -> UvmResult<()> {
        let mut tracker = Tracker::new();
        let state = self.down_read();
        let result = fault::service_fault_locked(&state, processor, addr, access, &mut tracker);
        let wait = tracker.wait();
        drop(state);
        result.and(wait)
    }

    /// Destroys every range and waits for the teardown work.
    ///
    /// Teardown keeps going past failures; the first one is returned.
    ///
    /// # Errors
    /// The first range teardown or wait failure.
    pub fn destroy(&self) -> UvmResult<()> {
        let mut tracker = Tracker::new();
        let mut state = self.down_write();
        let result = state.destroy_all(&mut tracker);
        let state = Self::downgrade_write(state);
        let wait = tracker.wait();
        drop(state);

        self.unregister_mm();
        log::debug!("Destroyed VA space {}", self.id);
        result.and(wait)
    }
}

// ===============================================================================================
// VaSpaceState
// ===============================================================================================

/// Everything guarded by the VA-space lock.
#[derive(Debug)]
pub struct VaSpaceState {
    ranges: RangeTree<VaRange>,
    hmm: HmmPolicies,
    processors: Processors,
    events: Arc<PerfEvents>,
}

impl VaSpaceState {
    fn new(events: Arc<PerfEvents>) -> Self {
        Self {
            ranges: RangeTree::new(),
            hmm: HmmPolicies::new(),
            processors: Processors::new(),
            events,
        }
    }

    #[must_use]
    pub fn ranges(&self) -> &RangeTree<VaRange> {
        &self.ranges
    }

    #[must_use]
    pub fn find(&self, addr: u64) -> Option<&VaRange> {
        self.ranges.find(addr)
    }

    pub fn find_mut(&mut self, addr: u64) -> Option<&mut VaRange> {
        self.ranges.find_mut(addr)
    }

    #[must_use]
    pub fn processors(&self) -> &Processors {
        &self.processors
    }

    #[must_use]
    pub fn hmm(&self) -> &HmmPolicies {
        &self.hmm
    }

    pub(crate) fn hmm_mut(&mut self) -> &mut HmmPolicies {
        &mut self.hmm
    }

    #[must_use]
    pub fn events(&self) -> &PerfEvents {
        &self.events
    }

    /// Split borrow for walks that mutate ranges while reading processors.
    pub(crate) fn parts_mut(&mut self) -> (&mut RangeTree<VaRange>, &Processors, &PerfEvents) {
        (&mut self.ranges, &self.processors, &self.events)
    }

    /// Block context for the managed range containing `addr`.
    #[must_use]
    pub fn block_context(&self, addr: u64) -> Option<BlockContext<'_>> {
        self.ranges
            .find(addr)?
            .block_context(&self.processors, &self.events)
    }

    // -------------------------------------------------------------------------------------------
    // Range creation
    // -------------------------------------------------------------------------------------------

    fn insert(&mut self, range: VaRange) -> UvmResult<&mut VaRange> {
        let (start, end) = (range.start(), range.end());
        if !page_aligned(start) || end.checked_add(1).is_none_or(|e| !page_aligned(e)) {
            return Err(UvmError::InvalidAddress);
        }
        if !self.ranges.range_empty(start, end) {
            return Err(UvmError::AddressInUse { start, end });
        }
        self.hmm.reclaim(start, end)?;
        self.ranges.add(range)
    }

    fn span(base: u64, length: u64) -> UvmResult<u64> {
        if api_range_invalid(base, length) {
            return Err(UvmError::InvalidAddress);
        }
        Ok(base + length - 1)
    }

    /// Creates a managed range with its own CPU mapping.
    ///
    /// # Errors
    /// `InvalidAddress` for a malformed span, `AddressInUse` on overlap.
    pub fn create_managed(&mut self, base: u64, length: u64) -> UvmResult<&mut VaRange> {
        let end = Self::span(base, length)?;
        self.create_mmap(Arc::new(Vma::new(base, end)))
    }

    /// Creates a managed range backed by `vma`.
    ///
    /// # Errors
    /// Same as [`VaSpaceState::create_managed`].
    pub fn create_mmap(&mut self, vma: Arc<Vma>) -> UvmResult<&mut VaRange> {
        let (start, end) = (vma.start(), vma.end());
        self.insert(VaRange::new_managed(start, end, Some(vma)))
    }

    /// # Errors
    /// `InvalidAddress` for a malformed span, `AddressInUse` on overlap.
    pub fn create_external(&mut self, base: u64, length: u64) -> UvmResult<&mut VaRange> {
        let end = Self::span(base, length)?;
        self.insert(VaRange::new(
            base,
            end,
            VaRangeKind::External(ExternalRange::new()),
        ))
    }

    /// # Errors
    /// `InvalidDevice` for an unregistered GPU, otherwise as
    /// [`VaSpaceState::create_external`].
    pub fn create_channel(
        &mut self,
        start: u64,
        end: u64,
        gpu: ProcessorId,
        rm_descriptor: u64,
    ) -> UvmResult<&mut VaRange> {
        if self.processors.gpu(gpu).is_none() {
            return Err(UvmError::InvalidDevice);
        }
        self.insert(VaRange::new(
            start,
            end,
            VaRangeKind::Channel(ChannelRange {
                gpu,
                ref_count: 0,
                rm_descriptor,
            }),
        ))
    }

    /// Maps a dynamic-parallelism region on `gpu`.
    ///
    /// The span must be exactly one naturally aligned power-of-two page.
    ///
    /// # Errors
    /// `InvalidDevice`, `OutOfRange` if the GPU cannot address the span,
    /// `InvalidAddress` for a malformed span.
    pub fn create_sked_reflected(
        &mut self,
        base: u64,
        length: u64,
        gpu: ProcessorId,
    ) -> UvmResult<&mut VaRange> {
        let end = Self::span(base, length)?;
        let target = self.processors.gpu(gpu).ok_or(UvmError::InvalidDevice)?;
        if !target.can_address(base, length) {
            return Err(UvmError::OutOfRange);
        }
        if !length.is_power_of_two() || base % length != 0 {
            return Err(UvmError::InvalidAddress);
        }
        self.insert(VaRange::new(
            base,
            end,
            VaRangeKind::SkedReflected(SkedReflectedRange { gpu: Some(gpu) }),
        ))
    }

    /// # Errors
    /// As [`SemaphorePool::new`], plus span and overlap errors.
    pub fn create_semaphore_pool(
        &mut self,
        base: u64,
        length: u64,
        per_gpu_attrs: &[GpuMappingAttributes],
    ) -> UvmResult<&mut VaRange> {
        let end = Self::span(base, length)?;
        if !self.ranges.range_empty(base, end) {
            return Err(UvmError::AddressInUse { start: base, end });
        }
        let pool = SemaphorePool::new(length, per_gpu_attrs, &self.processors)?;
        self.insert(VaRange::new(base, end, VaRangeKind::SemaphorePool(pool)))
    }

    // -------------------------------------------------------------------------------------------
    // Range lifecycle
    // -------------------------------------------------------------------------------------------

    /// Splits the managed range containing `new_end` so that it ends there.
    ///
    /// A no-op if a range already ends at `new_end`.
    ///
    /// # Errors
    /// `InvalidAddress` if `new_end + 1` is unaligned, nothing covers
    /// `new_end` or the range is not managed; `OutOfMemory` on an injected
    /// failure.
    pub fn split(&mut self, new_end: u64) -> UvmResult<()> {
        if new_end.checked_add(1).is_none_or(|e| !page_aligned(e)) {
            return Err(UvmError::InvalidAddress);
        }
        let range = self.ranges.find(new_end).ok_or(UvmError::InvalidAddress)?;
        let (start, end) = (range.start(), range.end());
        if end == new_end {
            return Ok(());
        }
        if !range.is_managed() {
            return Err(UvmError::InvalidAddress);
        }

        self.ranges
            .split(start, new_end, |range, upper| range.split_upper(upper))?;
        self.events.notify(&PerfEvent::RangeShrink {
            start,
            end,
            new_start: new_end + 1,
        });
        Ok(())
    }

    /// Removes the range starting at `start` and releases everything it
    /// holds. Teardown work is added to `out`.
    ///
    /// Mappings are released while the range is still in the tree; the
    /// range is removed even when unmapping fails.
    ///
    /// # Errors
    /// `InvalidAddress` if no range starts there; push failures while
    /// unmapping.
    pub fn destroy_range(&mut self, start: u64, out: &mut Tracker) -> UvmResult<()> {
        let range = self.ranges.get(start).ok_or(UvmError::InvalidAddress)?;
        let result = self.release_mappings(range, out);
        if let Some(range) = self.ranges.remove(start) {
            Self::free_payload(range);
        }
        result
    }

    fn release_mappings(&self, range: &VaRange, out: &mut Tracker) -> UvmResult<()> {
        if let Some(ctx) = range.block_context(&self.processors, &self.events) {
            let mut result = Ok(());
            for (_, block) in range.blocks() {
                let mut state = block.lock();
                let status = state.unmap_all(&ctx, out);
                out.add_tracker(state.tracker());
                result = result.and(status);
            }
            self.events.notify(&PerfEvent::RangeDestroy {
                start: range.start(),
                end: range.end(),
            });
            return result;
        }

        if let VaRangeKind::External(external) = range.kind() {
            for id in external.mapped_gpus().iter() {
                if let Some(gpu) = self.processors.gpu(id) {
                    external.unmap_gpu(gpu, out)?;
                }
            }
        }
        Ok(())
    }

    fn free_payload(range: VaRange) {
        match range.into_kind() {
            VaRangeKind::Channel(channel) => debug_assert_eq!(channel.ref_count, 0),
            VaRangeKind::SemaphorePool(pool) => pool.destroy(),
            VaRangeKind::External(_)
            | VaRangeKind::SkedReflected(_)
            | VaRangeKind::Managed(_) => {}
        }
    }

    pub(crate) fn destroy_all(&mut self, out: &mut Tracker) -> UvmResult<()> {
        let mut result = Ok(());
        let starts: Vec<u64> = self.ranges.iter().map(RangeTreeEntry::start).collect();
        for start in starts {
            let status = self.destroy_range(start, out);
            result = result.and(status);
        }
        self.hmm = HmmPolicies::new();
        result
    }

    /// Detaches the CPU mapping of the managed range starting at `start`.
    ///
    /// # Errors
    /// `InvalidAddress` if no managed range starts there.
    pub fn zombify(&mut self, start: u64) -> UvmResult<()> {
        self.ranges
            .get_mut(start)
            .ok_or(UvmError::InvalidAddress)?
            .zombify()
    }

    /// Destroys every zombie managed range.
    ///
    /// # Errors
    /// Push failures while unmapping.
    pub fn clean_up_zombie_resources(&mut self, out: &mut Tracker) -> UvmResult<()> {
        let zombies: Vec<u64> = self
            .ranges
            .iter()
            .filter(|range| range.is_managed_zombie())
            .map(RangeTreeEntry::start)
            .collect();
        for start in zombies {
            self.destroy_range(start, out)?;
        }
        Ok(())
    }

    /// Succeeds only if one range covers exactly `[base, base + length)`.
    ///
    /// # Errors
    /// `InvalidAddress` otherwise.
    pub fn validate_va_range(&self, base: u64, length: u64) -> UvmResult<()> {
        match self.ranges.find(base) {
            Some(range)
                if range.start() == base && range.end().checked_add(1) == base.checked_add(length) =>
            {
                Ok(())
            }
            _ => Err(UvmError::InvalidAddress),
        }
    }

    // -------------------------------------------------------------------------------------------
    // External mappings
    // -------------------------------------------------------------------------------------------

    fn external(&self, base: u64, gpu: ProcessorId) -> UvmResult<(&VaRange, &ExternalRange, &Arc<Gpu>)> {
        let range = self.ranges.find(base).ok_or(UvmError::InvalidAddress)?;
        let VaRangeKind::External(external) = range.kind() else {
            return Err(UvmError::InvalidAddress);
        };
        let gpu = self.processors.gpu(gpu).ok_or(UvmError::InvalidDevice)?;
        Ok((range, external, gpu))
    }

    /// Maps part of an external range on `gpu`. Needs only the read lock.
    ///
    /// # Errors
    /// `InvalidAddress` unless an external range covers the span,
    /// `InvalidDevice` for an unregistered GPU, `OutOfRange` if the GPU cannot
    /// address the span.
    pub fn map_external(
        &self,
        base: u64,
        length: u64,
        gpu: ProcessorId,
        prot: Prot,
        mem_handle: u64,
        out: &mut Tracker,
    ) -> UvmResult<()> {
        let (range, external, gpu) = self.external(base, gpu)?;
        external.map(range.node(), gpu, base, length, prot, mem_handle, out)
    }

    /// # Errors
    /// As [`VaSpaceState::map_external`], and `InvalidAddress` if nothing is
    /// mapped in the span.
    pub fn unmap_external(
        &self,
        base: u64,
        length: u64,
        gpu: ProcessorId,
        out: &mut Tracker,
    ) -> UvmResult<()> {
        let (range, external, gpu) = self.external(base, gpu)?;
        external.unmap(range.node(), gpu, base, length, out)
    }

    // -------------------------------------------------------------------------------------------
    // Processors
    // -------------------------------------------------------------------------------------------

    /// Registers `gpu` and establishes the mappings its policies ask for.
    ///
    /// # Errors
    /// `InUse` if the slot is taken; block work failures.
    pub fn register_gpu(&mut self, gpu: Arc<Gpu>, out: &mut Tracker) -> UvmResult<()> {
        let id = gpu.id;
        self.processors.register_gpu(Arc::clone(&gpu))?;
        log::debug!("Registered {id} ({}) in VA space", gpu.name);

        let read_dup_changes =
            self.processors.can_read_duplicate(None) != self.processors.can_read_duplicate(Some(&gpu));
        let (ranges, processors, events) = self.parts_mut();
        for range in ranges.iter_mut() {
            if range.is_managed() {
                apply::add_gpu(range, processors, events, id, read_dup_changes, out)?;
            } else if let VaRangeKind::SemaphorePool(pool) = range.kind_mut() {
                pool.map_gpu(id);
            }
        }
        Ok(())
    }

    /// Evicts `id` from every range and forgets it.
    ///
    /// Policies naming the GPU are reset, its pages move to the CPU and its
    /// mappings are dropped.
    ///
    /// # Errors
    /// `InvalidDevice` if `id` is not registered; eviction failures.
    pub fn unregister_gpu(&mut self, id: ProcessorId, out: &mut Tracker) -> UvmResult<Arc<Gpu>> {
        let gpu = Arc::clone(self.processors.gpu(id).ok_or(UvmError::InvalidDevice)?);
        let read_dup_changes =
            self.processors.can_read_duplicate(None) != self.processors.can_read_duplicate(Some(&gpu));

        let (ranges, processors, events) = self.parts_mut();
        for range in ranges.iter_mut() {
            if range.is_managed() {
                apply::remove_gpu(range, processors, events, id, out)?;
                continue;
            }
            match range.kind_mut() {
                VaRangeKind::Managed(_) => {}
                VaRangeKind::External(external) => external.unmap_gpu(&gpu, out)?,
                VaRangeKind::SemaphorePool(pool) => pool.unmap_gpu(id),
                VaRangeKind::SkedReflected(sked) => {
                    if sked.gpu == Some(id) {
                        sked.gpu = None;
                    }
                }
                VaRangeKind::Channel(channel) => debug_assert_ne!(channel.gpu, id),
            }
        }

        let gpu = self.processors.unregister_gpu(id)?;
        if read_dup_changes {
            let (ranges, processors, events) = self.parts_mut();
            for range in ranges.iter().filter(|r| r.is_managed()) {
                apply::restore_read_duplication(range, processors, events, out)?;
            }
        }
        Ok(gpu)
    }

    /// # Errors
    /// Mapping work for accessed-by policies that can now be honored is added
    /// to `out`.
    ///
    /// # Errors
    /// `InvalidDevice` unless both are distinct registered GPUs; map
    /// failures.
    pub fn enable_peer_access(
        &mut self,
        a: ProcessorId,
        b: ProcessorId,
        out: &mut Tracker,
    ) -> UvmResult<()> {
        self.processors.enable_peer_access(a, b)?;
        for range in self.ranges.iter() {
            apply::enable_peer(range, &self.processors, &self.events, a, b, out)?;
        }
        Ok(())
    }

    /// Tears down peer access and any mapping that depended on it.
    ///
    /// # Errors
    /// Push failures while unmapping.
    pub fn disable_peer_access(
        &mut self,
        a: ProcessorId,
        b: ProcessorId,
        out: &mut Tracker,
    ) -> UvmResult<()> {
        if !self.processors.peers_enabled(a, b) {
            return Ok(());
        }
        for range in self.ranges.iter() {
            apply::disable_peer(range, &self.processors, &self.events, a, b, out)?;
        }
        self.processors.disable_peer_access(a, b);
        Ok(())
    }

    /// Registered processors whose memory `id` can map.
    #[must_use]
    pub fn can_access(&self, id: ProcessorId) -> ProcessorMask {
        self.processors.can_access(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockTracker;
    use crate::processor::ProcessorUuid;
    use crate::tools::EventRecorder;
    use crate::utils::{PAGE_SIZE, VA_BLOCK_SIZE};

    fn space() -> VaSpace {
        VaSpace::new(1, 1, Arc::new(UvmConfig::new()))
    }

    fn gpu(index: usize) -> Arc<Gpu> {
        Arc::new(Gpu::new(index, ProcessorUuid([index as u8 + 1; 16])))
    }

    #[test]
    fn test_create_rejects_overlap_and_bad_spans() {
        let space = space();
        let mut state = space.down_write();
        state.create_managed(0x1000, 0x2000).unwrap();
        assert_eq!(
            state.create_external(0x2000, 0x1000).err(),
            Some(UvmError::AddressInUse {
                start: 0x2000,
                end: 0x2fff
            })
        );
        assert_eq!(
            state.create_managed(0x5001, 0x1000).err(),
            Some(UvmError::InvalidAddress)
        );
        state.create_external(0x3000, 0x1000).unwrap();
        assert_eq!(state.ranges().len(), 2);
    }

    #[test]
    fn test_split_is_idempotent_at_boundaries() {
        let space = space();
        let recorder = EventRecorder::new();
        space.events().register(recorder.clone());

        let mut state = space.down_write();
        state.create_managed(0x0, 0x3000).unwrap();
        state.split(0x0fff).unwrap();
        state.split(0x0fff).unwrap();
        state.split(0x2fff).unwrap();
        let spans: Vec<_> = state.ranges().iter().map(|r| (r.start(), r.end())).collect();
        assert_eq!(spans, vec![(0x0, 0xfff), (0x1000, 0x2fff)]);
        assert_eq!(
            recorder.take(),
            vec![PerfEvent::RangeShrink {
                start: 0x0,
                end: 0x2fff,
                new_start: 0x1000
            }]
        );

        assert_eq!(state.split(0x1800), Err(UvmError::InvalidAddress));
        assert_eq!(state.split(0x9fff), Err(UvmError::InvalidAddress));

        state.create_external(0x10000, 0x2000).unwrap();
        assert_eq!(state.split(0x10fff), Err(UvmError::InvalidAddress));
    }

    #[test]
    fn test_validate_va_range() {
        let space = space();
        let mut state = space.down_write();
        state.create_managed(0x10000, 0x4000).unwrap();
        assert!(state.validate_va_range(0x10000, 0x4000).is_ok());
        assert!(state.validate_va_range(0x10000, 0x3000).is_err());
        assert!(state.validate_va_range(0x11000, 0x3000).is_err());
        assert!(state.validate_va_range(0x20000, 0x1000).is_err());
    }

    #[test]
    fn test_zombies_are_cleaned_up() {
        let space = space();
        let recorder = EventRecorder::new();
        space.events().register(recorder.clone());
        let mut tracker = Tracker::new();

        let mut state = space.down_write();
        state.create_managed(0x0, 0x1000).unwrap();
        state.create_managed(0x1000, 0x1000).unwrap();
        state.zombify(0x1000).unwrap();
        assert!(state.find(0x1000).unwrap().is_managed_zombie());

        state.clean_up_zombie_resources(&mut tracker).unwrap();
        assert!(state.find(0x1000).is_none());
        assert!(state.find(0x0).is_some());
        assert_eq!(
            recorder.take(),
            vec![PerfEvent::RangeDestroy {
                start: 0x1000,
                end: 0x1fff
            }]
        );
    }

    #[test]
    fn test_destroy_unmaps_blocks() {
        let space = space();
        let mut tracker = Tracker::new();
        {
            let mut state = space.down_write();
            state.register_gpu(gpu(0), &mut tracker).unwrap();
            state.create_managed(0x0, VA_BLOCK_SIZE).unwrap();
        }
        space
            .service_fault(ProcessorId::gpu(0), 0x0, AccessType::Write)
            .unwrap();
        assert!(space.down_read().find(0x0).unwrap().block(0).is_some());

        let mut state = space.down_write();
        state.destroy_range(0x0, &mut tracker).unwrap();
        assert!(state.ranges().is_empty());
        assert_eq!(
            state.destroy_range(0x0, &mut tracker),
            Err(UvmError::InvalidAddress)
        );
    }

    #[test]
    fn test_destroy_removes_range_when_unmap_fails() {
        let space = space();
        let recorder = EventRecorder::new();
        space.events().register(recorder.clone());
        let mut tracker = Tracker::new();
        let gpu0 = gpu(0);
        {
            let mut state = space.down_write();
            state.register_gpu(gpu0.clone(), &mut tracker).unwrap();
            state.create_managed(0x0, VA_BLOCK_SIZE).unwrap();
        }
        space
            .service_fault(ProcessorId::gpu(0), 0x0, AccessType::Write)
            .unwrap();
        recorder.take();

        gpu0.channel().set_error("ecc");
        let mut state = space.down_write();
        assert!(matches!(
            state.destroy_range(0x0, &mut tracker),
            Err(UvmError::ChannelError { .. })
        ));
        assert!(state.find(0x0).is_none());
        assert_eq!(
            recorder.take(),
            vec![PerfEvent::RangeDestroy {
                start: 0x0,
                end: VA_BLOCK_SIZE - 1
            }]
        );
        gpu0.channel().clear_error();
    }

    #[test]
    fn test_semaphore_pool_tracks_gpu_registration() {
        let space = space();
        let mut tracker = Tracker::new();
        let mut state = space.down_write();
        state.create_semaphore_pool(0x0, PAGE_SIZE, &[]).unwrap();
        state.register_gpu(gpu(2), &mut tracker).unwrap();

        let VaRangeKind::SemaphorePool(pool) = state.find(0x0).unwrap().kind() else {
            panic!("expected a semaphore pool");
        };
        assert!(pool.mapped_gpus().test(ProcessorId::gpu(2)));

        state.unregister_gpu(ProcessorId::gpu(2), &mut tracker).unwrap();
        let VaRangeKind::SemaphorePool(pool) = state.find(0x0).unwrap().kind() else {
            panic!("expected a semaphore pool");
        };
        assert!(pool.mapped_gpus().is_empty());
    }

    #[test]
    fn test_sked_reflected_requires_aligned_power_of_two() {
        let space = space();
        let mut tracker = Tracker::new();
        let mut state = space.down_write();
        assert_eq!(
            state
                .create_sked_reflected(0x10000, 0x10000, ProcessorId::gpu(0))
                .err(),
            Some(UvmError::InvalidDevice)
        );
        state.register_gpu(gpu(0), &mut tracker).unwrap();
        assert_eq!(
            state
                .create_sked_reflected(0x11000, 0x10000, ProcessorId::gpu(0))
                .err(),
            Some(UvmError::InvalidAddress)
        );
        state
            .create_sked_reflected(0x10000, 0x10000, ProcessorId::gpu(0))
            .unwrap();
        assert!(state.split(0x10fff).is_err());
    }

    #[test]
    fn test_external_map_needs_registered_gpu() {
        let space = space();
        let mut tracker = Tracker::new();
        {
            let mut state = space.down_write();
            state.create_external(0x100000, 0x10000).unwrap();
            state.register_gpu(gpu(0), &mut tracker).unwrap();
        }

        let state = space.down_read();
        assert_eq!(
            state.map_external(0x100000, 0x1000, ProcessorId::gpu(3), Prot::Read, 1, &mut tracker),
            Err(UvmError::InvalidDevice)
        );
        state
            .map_external(0x100000, 0x2000, ProcessorId::gpu(0), Prot::ReadWrite, 1, &mut tracker)
            .unwrap();
        state
            .unmap_external(0x100000, 0x1000, ProcessorId::gpu(0), &mut tracker)
            .unwrap();
        assert_eq!(
            state.map_external(0x200000, 0x1000, ProcessorId::gpu(0), Prot::Read, 1, &mut tracker),
            Err(UvmError::InvalidAddress)
        );
    }

    #[test]
    fn test_downgrade_keeps_lock_order_record() {
        let space = space();
        let write = space.down_write();
        assert!(LockTracker::is_held_exclusive(LockOrder::VaSpace));
        let read = VaSpace::downgrade_write(write);
        assert!(LockTracker::is_held(LockOrder::VaSpace));
        #[cfg(debug_assertions)]
        assert!(!LockTracker::is_held_exclusive(LockOrder::VaSpace));
        drop(read);
        #[cfg(debug_assertions)]
        assert!(!LockTracker::is_held(LockOrder::VaSpace));
    }

    #[test]
    fn test_mm_registration() {
        let space = space();
        let mm = Mm::new(7);
        assert!(space.mm_or_current_retain(&Caller::with_pid(7, None)).is_none());
        space.register_mm(Arc::clone(&mm)).unwrap();
        assert_eq!(space.register_mm(Mm::new(8)), Err(UvmError::InUse));
        let retained = space
            .mm_or_current_retain(&Caller::with_pid(9, Some(Mm::new(9))))
            .unwrap();
        assert!(Arc::ptr_eq(&retained, &mm));
    }
}
