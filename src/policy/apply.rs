//! Policy changes on managed ranges and their blocks.
//!
//! Every function here runs with the VA space locked for write. Block work is
//! added to the caller's tracker; waiting happens after the lock is downgraded.

use crate::error::{UvmError, UvmResult};
use crate::processor::{ProcessorId, ProcessorMask};
use crate::tools::{MapRemoteCause, PerfEvent, PerfEvents};
use crate::tracker::Tracker;
use crate::va::block::{BlockContext, Prot};
use crate::va::policy::{PolicyChange, ReadDuplication};
use crate::va::processors::Processors;
use crate::va::range::{ManagedRange, VaRange};
use crate::va::space::VaSpaceState;

// ===============================================================================================
// Block walks
// ===============================================================================================

fn range_unmap_mask(
    range: &VaRange,
    processors: &Processors,
    events: &PerfEvents,
    mask: ProcessorMask,
    out: &mut Tracker,
) -> UvmResult<()> {
    if mask.is_empty() {
        return Ok(());
    }
    let Some(ctx) = range.block_context(processors, events) else {
        return Ok(());
    };
    for (_, block) in range.blocks() {
        let mut block = block.lock();
        let pages = block.all_pages();
        block.unmap_mask(&ctx, mask, &pages, out)?;
    }
    Ok(())
}

/// Maps every UVM-Lite GPU to the pages resident on the preferred location.
fn range_map_uvm_lite_gpus(
    range: &VaRange,
    processors: &Processors,
    events: &PerfEvents,
    out: &mut Tracker,
) -> UvmResult<()> {
    let Some(ctx) = range.block_context(processors, events) else {
        return Ok(());
    };
    let Some(preferred) = ctx.policy.preferred_location else {
        return Ok(());
    };
    if ctx.uvm_lite_gpus.is_empty() {
        return Ok(());
    }
    for (_, block) in range.blocks() {
        let mut block = block.lock();
        let pages = block.all_pages().and(&block.resident_on(preferred));
        for id in ctx.uvm_lite_gpus.iter() {
            block.map(
                &ctx,
                id,
                &pages,
                Prot::ReadWriteAtomic,
                MapRemoteCause::Coherence,
                out,
            )?;
        }
        out.add_tracker(block.tracker());
    }
    Ok(())
}

fn blocks_set_accessed_by(
    ctx: &BlockContext<'_>,
    range: &VaRange,
    ids: ProcessorMask,
    out: &mut Tracker,
) -> UvmResult<()> {
    for (_, block) in range.blocks() {
        let mut block = block.lock();
        let pages = block.all_pages();
        for id in ids.iter() {
            block.set_accessed_by_locked(ctx, id, &pages, out)?;
        }
        out.add_tracker(block.tracker());
    }
    Ok(())
}

pub(crate) fn blocks_set_read_duplication(
    ctx: &BlockContext<'_>,
    range: &VaRange,
    out: &mut Tracker,
) -> UvmResult<()> {
    for (_, block) in range.blocks() {
        let mut block = block.lock();
        let pages = block.all_pages();
        block.set_read_duplication(ctx, &pages, out)?;
        out.add_tracker(block.tracker());
    }
    Ok(())
}

pub(crate) fn blocks_unset_read_duplication(
    ctx: &BlockContext<'_>,
    range: &VaRange,
    out: &mut Tracker,
) -> UvmResult<()> {
    for (_, block) in range.blocks() {
        let mut block = block.lock();
        let pages = block.all_pages();
        block.unset_read_duplication(ctx, &pages, out)?;
        out.add_tracker(block.tracker());
    }
    Ok(())
}

fn managed_mut(range: &mut VaRange) -> UvmResult<&mut ManagedRange> {
    range.managed_mut().ok_or(UvmError::InvalidAddress)
}

// ===============================================================================================
// Range policy operations
// ===============================================================================================

/// Moves the preferred location of `range`.
///
/// UVM-Lite GPUs are remapped to the new location, GPUs that stop being
/// UVM-Lite (and the old preferred location, if accessed-by) fall back to
/// ordinary accessed-by mappings, and stale remote mappings are dropped.
///
/// # Errors
/// `InvalidAddress` for non-managed ranges; block failures.
pub fn set_preferred_location(
    range: &mut VaRange,
    processors: &Processors,
    events: &PerfEvents,
    location: Option<ProcessorId>,
    cpu_numa_node: Option<u32>,
    out: &mut Tracker,
) -> UvmResult<()> {
    let managed = managed_mut(range)?;
    if managed
        .policy
        .preferred_location_equal(location, cpu_numa_node)
    {
        return Ok(());
    }

    let old_location = managed.policy.preferred_location;
    let old_lite = managed.uvm_lite_gpus;
    let accessed_by = managed.policy.accessed_by;
    let new_lite = processors.uvm_lite_gpus(location, accessed_by);

    let mut set_accessed_by = old_lite.andnot(new_lite);
    if let Some(old) = old_location {
        set_accessed_by.set(old);
    }
    let set_accessed_by = set_accessed_by.and(accessed_by);

    range_unmap_mask(range, processors, events, old_lite.or(new_lite), out)?;

    let managed = managed_mut(range)?;
    managed.policy.set_preferred_location(location, cpu_numa_node);
    managed.uvm_lite_gpus = new_lite;

    if let Some(ctx) = range.block_context(processors, events) {
        for (_, block) in range.blocks() {
            let mut block = block.lock();
            let pages = block.all_pages();
            for id in set_accessed_by.iter() {
                block.set_accessed_by_locked(&ctx, id, &pages, out)?;
            }
            block.set_preferred_location_locked(&ctx, &pages, out)?;
            out.add_tracker(block.tracker());
        }
    }
    range_map_uvm_lite_gpus(range, processors, events, out)
}

/// Adds `id` to the accessed-by set of `range` and maps it to resident pages.
///
/// # Errors
/// `InvalidAddress` for non-managed ranges; block failures.
pub fn set_accessed_by(
    range: &mut VaRange,
    processors: &Processors,
    events: &PerfEvents,
    id: ProcessorId,
    out: &mut Tracker,
) -> UvmResult<()> {
    let managed = managed_mut(range)?;
    if managed.policy.accessed_by.test(id) {
        return Ok(());
    }
    managed.policy.accessed_by.set(id);
    if managed.uvm_lite_gpus.test(id) {
        return Ok(());
    }

    let new_lite = processors.uvm_lite_gpus(
        managed.policy.preferred_location,
        managed.policy.accessed_by,
    );
    if new_lite.test(id) {
        range_unmap_mask(range, processors, events, ProcessorMask::single(id), out)?;
    }
    managed_mut(range)?.uvm_lite_gpus = new_lite;

    match range.block_context(processors, events) {
        Some(ctx) => blocks_set_accessed_by(&ctx, range, ProcessorMask::single(id), out),
        None => Ok(()),
    }
}

/// Removes `id` from the accessed-by set of `range`.
///
/// Ordinary remote mappings are left to be reclaimed by later migrations; a
/// UVM-Lite mapping is removed unless `id` is the preferred location.
///
/// # Errors
/// `InvalidAddress` for non-managed ranges; unmap failures.
pub fn unset_accessed_by(
    range: &mut VaRange,
    processors: &Processors,
    events: &PerfEvents,
    id: ProcessorId,
    out: &mut Tracker,
) -> UvmResult<()> {
    let managed = managed_mut(range)?;
    if !managed.policy.accessed_by.test(id) {
        return Ok(());
    }
    managed.policy.accessed_by.clear(id);

    let preferred = managed.policy.preferred_location;
    let drop_lite = managed.uvm_lite_gpus.test(id) && preferred != Some(id);
    let new_lite = processors.uvm_lite_gpus(preferred, managed.policy.accessed_by);
    if drop_lite {
        range_unmap_mask(range, processors, events, ProcessorMask::single(id), out)?;
    }
    managed_mut(range)?.uvm_lite_gpus = new_lite;
    Ok(())
}

/// # Errors
/// `InvalidAddress` for non-managed ranges; block failures.
pub fn set_read_duplication(
    range: &mut VaRange,
    processors: &Processors,
    events: &PerfEvents,
    out: &mut Tracker,
) -> UvmResult<()> {
    let managed = managed_mut(range)?;
    if managed.policy.read_duplication == ReadDuplication::Enabled {
        return Ok(());
    }
    managed.policy.read_duplication = ReadDuplication::Enabled;

    if !processors.can_read_duplicate(None) {
        return Ok(());
    }
    match range.block_context(processors, events) {
        Some(ctx) => blocks_set_read_duplication(&ctx, range, out),
        None => Ok(()),
    }
}

/// # Errors
/// `InvalidAddress` for non-managed ranges; block failures.
pub fn unset_read_duplication(
    range: &mut VaRange,
    processors: &Processors,
    events: &PerfEvents,
    out: &mut Tracker,
) -> UvmResult<()> {
    let managed = managed_mut(range)?;
    if managed.policy.read_duplication == ReadDuplication::Disabled {
        return Ok(());
    }
    managed.policy.read_duplication = ReadDuplication::Disabled;

    if !processors.can_read_duplicate(None) {
        return Ok(());
    }
    match range.block_context(processors, events) {
        Some(ctx) => blocks_unset_read_duplication(&ctx, range, out),
        None => Ok(()),
    }
}

/// Dispatches one policy change to `range`.
///
/// # Errors
/// `InvalidArgument` for a request to return read duplication to unset,
/// otherwise as the individual operation.
pub fn apply_range(
    range: &mut VaRange,
    processors: &Processors,
    events: &PerfEvents,
    change: &PolicyChange,
    out: &mut Tracker,
) -> UvmResult<()> {
    match *change {
        PolicyChange::PreferredLocation {
            location,
            cpu_numa_node,
        } => set_preferred_location(range, processors, events, location, cpu_numa_node, out),
        PolicyChange::AccessedBy {
            processor,
            set: true,
        } => set_accessed_by(range, processors, events, processor, out),
        PolicyChange::AccessedBy {
            processor,
            set: false,
        } => unset_accessed_by(range, processors, events, processor, out),
        PolicyChange::ReadDuplication(ReadDuplication::Enabled) => {
            set_read_duplication(range, processors, events, out)
        }
        PolicyChange::ReadDuplication(ReadDuplication::Disabled) => {
            unset_read_duplication(range, processors, events, out)
        }
        PolicyChange::ReadDuplication(ReadDuplication::Unset) => Err(unset_request()),
    }
}

fn unset_request() -> UvmError {
    UvmError::InvalidArgument("read duplication cannot be returned to unset".into())
}

/// Applies `change` to every managed range in `[base, base + length)`,
/// splitting at the edges first.
///
/// Ranges already processed keep their new policy if a later one fails.
///
/// # Errors
/// Split and per-range failures.
pub fn apply_managed(
    state: &mut VaSpaceState,
    base: u64,
    length: u64,
    change: &PolicyChange,
    out: &mut Tracker,
) -> UvmResult<()> {
    let end = base + length - 1;
    super::split_span_as_needed(state, base, base + length, change)?;

    let (ranges, processors, events) = state.parts_mut();
    for key in ranges.keys_in(base, end) {
        if let Some(range) = ranges.get_mut(key) {
            apply_range(range, processors, events, change, out)?;
        }
    }
    events.notify(&PerfEvent::PolicyChange { start: base, end });
    Ok(())
}

/// Records `change` for pageable memory in `[base, base + length)`.
///
/// # Errors
/// `InvalidArgument` for a request to return read duplication to unset.
pub fn apply_hmm(
    state: &mut VaSpaceState,
    base: u64,
    length: u64,
    change: &PolicyChange,
) -> UvmResult<()> {
    if *change == PolicyChange::ReadDuplication(ReadDuplication::Unset) {
        return Err(unset_request());
    }
    let end = base + length - 1;
    state.hmm_mut().apply(base, end, change)?;
    state
        .events()
        .notify(&PerfEvent::PolicyChange { start: base, end });
    Ok(())
}

// ===============================================================================================
// Processor lifecycle
// ===============================================================================================

/// Brings a newly registered GPU into `range`.
///
/// `disable_read_duplication` is set when the GPU makes read duplication
/// impossible; duplicated pages are then collapsed.
///
/// # Errors
/// Block failures.
pub(crate) fn add_gpu(
    range: &mut VaRange,
    processors: &Processors,
    events: &PerfEvents,
    id: ProcessorId,
    disable_read_duplication: bool,
    out: &mut Tracker,
) -> UvmResult<()> {
    let managed = managed_mut(range)?;
    managed.uvm_lite_gpus = processors.uvm_lite_gpus(
        managed.policy.preferred_location,
        managed.policy.accessed_by,
    );
    let add_remote = managed.policy.accessed_by.test(id) || managed.uvm_lite_gpus.test(id);
    let collapse = disable_read_duplication && managed.policy.read_duplication_enabled();
    if !add_remote && !collapse {
        return Ok(());
    }

    let Some(ctx) = range.block_context(processors, events) else {
        return Ok(());
    };
    // Duplication stays enabled in the policy but cannot be honored.
    let mut effective = *ctx.policy;
    if collapse {
        effective.read_duplication = ReadDuplication::Disabled;
    }
    let ctx = BlockContext {
        policy: &effective,
        ..ctx
    };

    for (_, block) in range.blocks() {
        let mut block = block.lock();
        let pages = block.all_pages();
        if add_remote {
            block.set_accessed_by_locked(&ctx, id, &pages, out)?;
        }
        if collapse {
            block.unset_read_duplication(&ctx, &pages, out)?;
        }
        out.add_tracker(block.tracker());
    }
    Ok(())
}

/// Removes every trace of `id` from `range` ahead of unregistration.
///
/// A preferred location on `id` is cleared, `id` leaves accessed-by and pages
/// only it holds are evicted to the CPU.
///
/// # Errors
/// Eviction failures.
pub(crate) fn remove_gpu(
    range: &mut VaRange,
    processors: &Processors,
    events: &PerfEvents,
    id: ProcessorId,
    out: &mut Tracker,
) -> UvmResult<()> {
    let managed = managed_mut(range)?;
    if managed.policy.preferred_location == Some(id) {
        managed.policy.set_preferred_location(None, None);
    }
    unset_accessed_by(range, processors, events, id, out)?;

    let managed = managed_mut(range)?;
    let remaining = processors.registered().andnot(ProcessorMask::single(id));
    managed.uvm_lite_gpus = processors
        .uvm_lite_gpus(managed.policy.preferred_location, managed.policy.accessed_by)
        .and(remaining);

    let Some(ctx) = range.block_context(processors, events) else {
        return Ok(());
    };
    for (_, block) in range.blocks() {
        let mut block = block.lock();
        block.evict_processor(&ctx, id, out)?;
        out.add_tracker(block.tracker());
    }
    Ok(())
}

/// Re-duplicates pages once the last GPU blocking read duplication is gone.
///
/// # Errors
/// Block failures.
pub(crate) fn restore_read_duplication(
    range: &VaRange,
    processors: &Processors,
    events: &PerfEvents,
    out: &mut Tracker,
) -> UvmResult<()> {
    let Some(ctx) = range.block_context(processors, events) else {
        return Ok(());
    };
    if !ctx.policy.read_duplication_enabled() || !processors.can_read_duplicate(None) {
        return Ok(());
    }
    blocks_set_read_duplication(&ctx, range, out)
}

/// Establishes accessed-by mappings that peer access between `a` and `b` now
/// allows.
///
/// # Errors
/// Map failures.
pub(crate) fn enable_peer(
    range: &VaRange,
    processors: &Processors,
    events: &PerfEvents,
    a: ProcessorId,
    b: ProcessorId,
    out: &mut Tracker,
) -> UvmResult<()> {
    let Some(ctx) = range.block_context(processors, events) else {
        return Ok(());
    };
    let ids = [a, b]
        .into_iter()
        .filter(|&id| ctx.policy.accessed_by.test(id))
        .collect::<ProcessorMask>();
    if ids.is_empty() {
        return Ok(());
    }
    blocks_set_accessed_by(&ctx, range, ids, out)
}

/// Drops mappings `a` and `b` hold to each other's memory.
///
/// # Errors
/// Unmap failures.
pub(crate) fn disable_peer(
    range: &VaRange,
    processors: &Processors,
    events: &PerfEvents,
    a: ProcessorId,
    b: ProcessorId,
    out: &mut Tracker,
) -> UvmResult<()> {
    let Some(ctx) = range.block_context(processors, events) else {
        return Ok(());
    };
    for (_, block) in range.blocks() {
        let mut block = block.lock();
        for (accessor, memory) in [(a, b), (b, a)] {
            let remote = block
                .mapped_on(accessor)
                .and(&block.resident_on(memory))
                .andnot(&block.resident_on(accessor));
            block.unmap(&ctx, accessor, &remote, out)?;
        }
    }
    Ok(())
}
