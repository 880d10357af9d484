//! Entry points, one per user-visible call.
//!
//! Each call validates its arguments, takes the PM lock without blocking, the
//! memory map for read and the VA space for write, applies its change and then
//! downgrades to read while waiting for the GPU work it started.

use crate::context::Context;
use crate::error::{UvmError, UvmResult};
use crate::gpu::Gpu;
use crate::lock::PmReadGuard;
use crate::mm::Caller;
use crate::policy::{ApiRangeType, apply, range_type_check};
use crate::processor::{ProcessorId, ProcessorUuid};
use crate::tracker::Tracker;
use crate::utils::api_range_invalid;
use crate::va::block::AccessType;
use crate::va::policy::{PolicyChange, ReadDuplication};
use crate::va::space::{VaSpace, VaSpaceWriteGuard};
use std::sync::Arc;

/// `cpu_numa_node` value meaning "no NUMA preference".
pub const NUMA_NO_NODE: i32 = -1;

fn enter(ctx: &Context) -> UvmResult<PmReadGuard<'_>> {
    ctx.pm().try_read().ok_or(UvmError::Busy)
}

/// Downgrades, waits for the work in `tracker` and folds its status in.
fn finish(state: VaSpaceWriteGuard<'_>, mut tracker: Tracker, result: UvmResult<()>) -> UvmResult<()> {
    let state = VaSpace::downgrade_write(state);
    let wait = tracker.wait();
    drop(state);
    result.and(wait)
}

fn find_gpu(ctx: &Context, uuid: &ProcessorUuid) -> UvmResult<Arc<Gpu>> {
    ctx.find_gpu(uuid).ok_or(UvmError::InvalidDevice)
}

fn check_numa_node(
    ctx: &Context,
    location: ProcessorId,
    cpu_numa_node: i32,
) -> UvmResult<Option<u32>> {
    if cpu_numa_node == NUMA_NO_NODE {
        return Ok(None);
    }
    if location.is_gpu() {
        return Err(UvmError::InvalidArgument(
            "a NUMA node is only valid with a CPU preferred location".into(),
        ));
    }
    let id = u32::try_from(cpu_numa_node)
        .map_err(|_| UvmError::InvalidArgument(format!("invalid NUMA node {cpu_numa_node}")))?;
    match ctx.config().find_numa_node(id) {
        Some(node) if node.has_memory && !node.is_gpu_node => Ok(Some(id)),
        _ => Err(UvmError::InvalidArgument(format!(
            "NUMA node {id} is not a CPU memory node"
        ))),
    }
}

/// Shared body of every policy entry point.
fn apply_policy(
    ctx: &Context,
    va_space: &VaSpace,
    caller: &Caller,
    base: u64,
    length: u64,
    processor: Option<ProcessorId>,
    change: PolicyChange,
) -> UvmResult<()> {
    if api_range_invalid(base, length) {
        return Err(UvmError::InvalidAddress);
    }
    let _pm = enter(ctx)?;
    let mm = va_space.mm_or_current_retain(caller);
    let vmas = mm.as_ref().map(|mm| mm.lock_read());
    let mut state = va_space.down_write();
    let mut tracker = Tracker::new();

    if let Some(id) = processor {
        if !state.processors().is_registered(id) {
            return Err(UvmError::InvalidDevice);
        }
    }

    let result = match range_type_check(&state, ctx.config(), vmas.as_deref(), base, length) {
        Err(e) => Err(e),
        Ok(ApiRangeType::Ats | ApiRangeType::Hmm) if caller.pid != va_space.owner_pid() => {
            Err(UvmError::NotSupported)
        }
        Ok(ApiRangeType::Ats) => Err(UvmError::NothingToDo),
        Ok(ApiRangeType::Hmm) => apply::apply_hmm(&mut state, base, length, &change),
        Ok(ApiRangeType::Managed) => {
            let out_of_range = processor
                .and_then(|id| state.processors().gpu(id))
                .is_some_and(|gpu| !gpu.can_address(base, length));
            if out_of_range {
                Err(UvmError::OutOfRange)
            } else {
                apply::apply_managed(&mut state, base, length, &change, &mut tracker)
            }
        }
    };
    finish(state, tracker, result)
}

// ===============================================================================================
// Policy
// ===============================================================================================

/// Sets the preferred location of `[base, base + length)`.
///
/// `cpu_numa_node` is [`NUMA_NO_NODE`] or, for a CPU location, a node with
/// system memory.
///
/// # Errors
/// `InvalidAddress` for a malformed or unsupported span, `InvalidArgument` for
/// a bad NUMA node, `InvalidDevice` for an unregistered processor,
/// `OutOfRange` if the GPU cannot address the span, `Busy` while suspended,
/// `NothingToDo` for ATS memory and `NotSupported` for pageable memory of
/// another process.
pub fn set_preferred_location(
    ctx: &Context,
    va_space: &VaSpace,
    caller: &Caller,
    base: u64,
    length: u64,
    location: ProcessorId,
    cpu_numa_node: i32,
) -> UvmResult<()> {
    let cpu_numa_node = check_numa_node(ctx, location, cpu_numa_node)?;
    apply_policy(
        ctx,
        va_space,
        caller,
        base,
        length,
        Some(location),
        PolicyChange::PreferredLocation {
            location: Some(location),
            cpu_numa_node,
        },
    )
}

/// # Errors
/// As [`set_preferred_location`], minus the processor checks.
pub fn unset_preferred_location(
    ctx: &Context,
    va_space: &VaSpace,
    caller: &Caller,
    base: u64,
    length: u64,
) -> UvmResult<()> {
    apply_policy(
        ctx,
        va_space,
        caller,
        base,
        length,
        None,
        PolicyChange::PreferredLocation {
            location: None,
            cpu_numa_node: None,
        },
    )
}

/// # Errors
/// As [`set_preferred_location`].
pub fn set_accessed_by(
    ctx: &Context,
    va_space: &VaSpace,
    caller: &Caller,
    base: u64,
    length: u64,
    processor: ProcessorId,
) -> UvmResult<()> {
    apply_policy(
        ctx,
        va_space,
        caller,
        base,
        length,
        Some(processor),
        PolicyChange::AccessedBy {
            processor,
            set: true,
        },
    )
}

/// # Errors
/// As [`set_preferred_location`].
pub fn unset_accessed_by(
    ctx: &Context,
    va_space: &VaSpace,
    caller: &Caller,
    base: u64,
    length: u64,
    processor: ProcessorId,
) -> UvmResult<()> {
    apply_policy(
        ctx,
        va_space,
        caller,
        base,
        length,
        Some(processor),
        PolicyChange::AccessedBy {
            processor,
            set: false,
        },
    )
}

/// # Errors
/// As [`unset_preferred_location`].
pub fn enable_read_duplication(
    ctx: &Context,
    va_space: &VaSpace,
    caller: &Caller,
    base: u64,
    length: u64,
) -> UvmResult<()> {
    apply_policy(
        ctx,
        va_space,
        caller,
        base,
        length,
        None,
        PolicyChange::ReadDuplication(ReadDuplication::Enabled),
    )
}

/// # Errors
/// As [`unset_preferred_location`].
pub fn disable_read_duplication(
    ctx: &Context,
    va_space: &VaSpace,
    caller: &Caller,
    base: u64,
    length: u64,
) -> UvmResult<()> {
    apply_policy(
        ctx,
        va_space,
        caller,
        base,
        length,
        None,
        PolicyChange::ReadDuplication(ReadDuplication::Disabled),
    )
}

// ===============================================================================================
// Faults
// ===============================================================================================

/// # Errors
/// `Busy` while suspended, otherwise as [`VaSpace::service_fault`].
pub fn service_fault(
    ctx: &Context,
    va_space: &VaSpace,
    processor: ProcessorId,
    addr: u64,
    access: AccessType,
) -> UvmResult<()> {
    let _pm = enter(ctx)?;
    va_space.service_fault(processor, addr, access)
}

// ===============================================================================================
// Processors
// ===============================================================================================

/// Registers the GPU identified by `uuid` in `va_space`.
///
/// # Errors
/// `InvalidDevice` for an unknown GPU, `InUse` if already registered, `Busy`
/// while suspended.
pub fn register_gpu(ctx: &Context, va_space: &VaSpace, uuid: &ProcessorUuid) -> UvmResult<()> {
    let _pm = enter(ctx)?;
    let gpu = find_gpu(ctx, uuid)?;
    let mut state = va_space.down_write();
    let mut tracker = Tracker::new();
    let result = state.register_gpu(gpu, &mut tracker);
    finish(state, tracker, result)
}

/// # Errors
/// `InvalidDevice` for an unknown or unregistered GPU, `Busy` while suspended.
pub fn unregister_gpu(ctx: &Context, va_space: &VaSpace, uuid: &ProcessorUuid) -> UvmResult<()> {
    let _pm = enter(ctx)?;
    let gpu = find_gpu(ctx, uuid)?;
    let mut state = va_space.down_write();
    let mut tracker = Tracker::new();
    let result = state.unregister_gpu(gpu.id, &mut tracker).map(drop);
    finish(state, tracker, result)
}

/// # Errors
/// `InvalidDevice` unless both GPUs are registered and distinct, `Busy` while
/// suspended.
pub fn enable_peer_access(
    ctx: &Context,
    va_space: &VaSpace,
    a: &ProcessorUuid,
    b: &ProcessorUuid,
) -> UvmResult<()> {
    let _pm = enter(ctx)?;
    let (a, b) = (find_gpu(ctx, a)?.id, find_gpu(ctx, b)?.id);
    let mut state = va_space.down_write();
    let mut tracker = Tracker::new();
    let result = state.enable_peer_access(a, b, &mut tracker);
    finish(state, tracker, result)
}

/// # Errors
/// `InvalidDevice` for an unknown GPU, `Busy` while suspended.
pub fn disable_peer_access(
    ctx: &Context,
    va_space: &VaSpace,
    a: &ProcessorUuid,
    b: &ProcessorUuid,
) -> UvmResult<()> {
    let _pm = enter(ctx)?;
    let (a, b) = (find_gpu(ctx, a)?.id, find_gpu(ctx, b)?.id);
    let mut state = va_space.down_write();
    let mut tracker = Tracker::new();
    let result = state.disable_peer_access(a, b, &mut tracker);
    finish(state, tracker, result)
}

// ===============================================================================================
// Ranges
// ===============================================================================================

/// Destroys every managed range whose CPU mapping has gone away.
///
/// # Errors
/// `Busy` while suspended; teardown failures.
pub fn clean_up_zombie_resources(ctx: &Context, va_space: &VaSpace) -> UvmResult<()> {
    let _pm = enter(ctx)?;
    let mut state = va_space.down_write();
    let mut tracker = Tracker::new();
    let result = state.clean_up_zombie_resources(&mut tracker);
    finish(state, tracker, result)
}

/// Succeeds only if a single VA range covers exactly `[base, base + length)`.
///
/// # Errors
/// `InvalidAddress` otherwise.
pub fn validate_va_range(va_space: &VaSpace, base: u64, length: u64) -> UvmResult<()> {
    if api_range_invalid(base, length) {
        return Err(UvmError::InvalidAddress);
    }
    va_space.down_read().validate_va_range(base, length)
}
