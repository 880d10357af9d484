//! Servicing a single replayable fault on a managed range.

use crate::error::{UvmError, UvmResult};
use crate::processor::{ProcessorId, ProcessorMask};
use crate::tools::{MakeResidentCause, MapRemoteCause};
use crate::tracker::Tracker;
use crate::va::block::{AccessType, PageMask};
use crate::va::space::VaSpaceState;

/// Resolves a fault by `processor` at `addr`, creating the block on first
/// touch.
///
/// Residency follows the range policy: the preferred location when the
/// faulting processor can map it, an existing copy when the processor is in
/// accessed-by, otherwise the faulting processor itself. Read faults on
/// read-duplicated ranges get a local copy instead.
///
/// # Errors
/// `InvalidDevice` for an unregistered processor, `InvalidAddress` when `addr`
/// is not in a live managed range; push failures otherwise.
pub fn service_fault_locked(
    state: &VaSpaceState,
    processor: ProcessorId,
    addr: u64,
    access: AccessType,
    out: &mut Tracker,
) -> UvmResult<()> {
    let processors = state.processors();
    if !processors.is_registered(processor) {
        return Err(UvmError::InvalidDevice);
    }
    let range = state.find(addr).ok_or(UvmError::InvalidAddress)?;
    if range.is_managed_zombie() {
        return Err(UvmError::InvalidAddress);
    }
    let ctx = range
        .block_context(processors, state.events())
        .ok_or(UvmError::InvalidAddress)?;

    let block = range.block_create(range.block_index(addr))?;
    let mut block = block.lock();
    let prot = access.required_prot();
    if block.mapping(processor, addr).is_some_and(|p| p >= prot) {
        return Ok(());
    }

    let mut page = PageMask::EMPTY;
    page.set(block.page_index(addr));
    let policy = ctx.policy;

    let read_duplicate = access == AccessType::Read
        && policy.read_duplication_enabled()
        && processors.can_read_duplicate(None)
        && !block.any_resident().and(&page).is_empty();

    if read_duplicate {
        block.make_resident_read_duplicate(&ctx, processor, &page, out)?;
        block.map(&ctx, processor, &page, prot, MapRemoteCause::Coherence, out)?;
    } else {
        let reachable = processors.can_access(processor);
        let holders = block.resident_processors(&page).and(reachable);
        let residency = match policy.preferred_location {
            Some(preferred) if reachable.test(preferred) => preferred,
            _ if policy.accessed_by.test(processor) => processors
                .find_closest_processor(holders, processor)
                .unwrap_or(processor),
            _ => processor,
        };
        log::trace!("Fault by {processor} at 0x{addr:x} resolved to {residency}");

        block.make_resident(&ctx, residency, &page, MakeResidentCause::Fault, out)?;
        block.map(&ctx, processor, &page, prot, MapRemoteCause::Coherence, out)?;
    }

    let others = policy
        .accessed_by
        .and(processors.registered())
        .andnot(ProcessorMask::single(processor));
    for id in others.iter() {
        block.set_accessed_by_locked(&ctx, id, &page, out)?;
    }
    out.add_tracker(block.tracker());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UvmConfig;
    use crate::gpu::Gpu;
    use crate::processor::ProcessorUuid;
    use crate::va::block::Prot;
    use crate::va::space::VaSpace;
    use std::sync::Arc;

    const GPU_A: ProcessorId = ProcessorId::gpu(0);
    const BASE: u64 = 0x20_0000;

    fn space_with_gpu() -> VaSpace {
        let space = VaSpace::new(1, 1, Arc::new(UvmConfig::new()));
        let mut tracker = Tracker::new();
        let mut state = space.down_write();
        state
            .register_gpu(Arc::new(Gpu::new(0, ProcessorUuid([1; 16]))), &mut tracker)
            .unwrap();
        state.create_managed(BASE, 0x10000).unwrap();
        drop(state);
        space
    }

    fn mapping(space: &VaSpace, id: ProcessorId, addr: u64) -> Option<Prot> {
        let state = space.down_read();
        let range = state.find(addr).unwrap();
        let block = range.block(range.block_index(addr))?;
        block.lock().mapping(id, addr)
    }

    #[test]
    fn test_first_touch_populates_locally() {
        let space = space_with_gpu();
        space.service_fault(GPU_A, BASE, AccessType::Write).unwrap();
        assert_eq!(mapping(&space, GPU_A, BASE), Some(Prot::ReadWrite));

        let state = space.down_read();
        let range = state.find(BASE).unwrap();
        let block = range.block(0).unwrap().lock();
        assert!(block.resident_on(GPU_A).test(0));
        assert!(block.resident_on(ProcessorId::CPU).is_empty());
    }

    #[test]
    fn test_cpu_fault_migrates_back() {
        let space = space_with_gpu();
        space.service_fault(GPU_A, BASE, AccessType::Write).unwrap();
        space
            .service_fault(ProcessorId::CPU, BASE, AccessType::Write)
            .unwrap();

        assert_eq!(mapping(&space, GPU_A, BASE), None);
        assert_eq!(mapping(&space, ProcessorId::CPU, BASE), Some(Prot::ReadWrite));
    }

    #[test]
    fn test_fault_rejects_unknown_processor_and_address() {
        let space = space_with_gpu();
        assert_eq!(
            space.service_fault(ProcessorId::gpu(5), BASE, AccessType::Read),
            Err(UvmError::InvalidDevice)
        );
        assert_eq!(
            space.service_fault(GPU_A, 0x1000, AccessType::Read),
            Err(UvmError::InvalidAddress)
        );

        space.down_write().zombify(BASE).unwrap();
        assert_eq!(
            space.service_fault(GPU_A, BASE, AccessType::Read),
            Err(UvmError::InvalidAddress)
        );
    }
}
