use crate::config::UvmConfig;
use crate::deferred::DeferredWorker;
use crate::error::{UvmError, UvmResult};
use crate::gpu::{Gpu, GpuTable};
use crate::lock::{PmLock, PmWriteGuard};
use crate::mm::Caller;
use crate::processor::{ProcessorId, ProcessorUuid};
use crate::va::space::VaSpace;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

// ===============================================================================================
// Context Structures
// ===============================================================================================

/// Driver-wide state shared by every VA space.
///
/// Owns the GPUs known to the driver, the power-management lock every entry
/// point takes first, and the worker that runs deferred teardown.
#[derive(Debug)]
pub struct Context {
    config: Arc<UvmConfig>,
    pm: Arc<PmLock>,
    deferred: DeferredWorker,
    gpus: parking_lot::Mutex<GpuTable>,
    next_va_space_id: AtomicU64,
}

impl Context {
    /// Builds an isolated context, independent of the global one.
    ///
    /// # Errors
    /// `InvalidState` if the deferred worker cannot be started.
    pub fn new(config: UvmConfig) -> UvmResult<Arc<Self>> {
        Ok(Arc::new(Self {
            config: Arc::new(config),
            pm: Arc::new(PmLock::new()),
            deferred: DeferredWorker::new()?,
            gpus: parking_lot::Mutex::new(GpuTable::new()),
            next_va_space_id: AtomicU64::new(1),
        }))
    }

    #[must_use]
    pub fn config(&self) -> &UvmConfig {
        &self.config
    }

    #[must_use]
    pub fn pm(&self) -> &PmLock {
        &self.pm
    }

    /// Makes a GPU known to the driver. VA spaces register it separately.
    ///
    /// # Errors
    /// `InUse` if its slot is taken.
    pub fn add_gpu(&self, gpu: Gpu) -> UvmResult<Arc<Gpu>> {
        let gpu = Arc::new(gpu);
        self.gpus.lock().insert(Arc::clone(&gpu))?;
        log::debug!("Added {} ({}) as {}", gpu.name, gpu.uuid, gpu.id);
        Ok(gpu)
    }

    /// # Errors
    /// `InvalidDevice` if no GPU has that id.
    pub fn remove_gpu(&self, id: ProcessorId) -> UvmResult<Arc<Gpu>> {
        self.gpus.lock().remove(id).ok_or(UvmError::InvalidDevice)
    }

    #[must_use]
    pub fn gpu(&self, id: ProcessorId) -> Option<Arc<Gpu>> {
        self.gpus.lock().get(id).cloned()
    }

    #[must_use]
    pub fn find_gpu(&self, uuid: &ProcessorUuid) -> Option<Arc<Gpu>> {
        self.gpus.lock().find_by_uuid(uuid).cloned()
    }

    /// Creates a VA space owned by `caller`, tied to its memory map if it has
    /// one.
    ///
    /// # Errors
    /// Never fails today; the memory map slot of a fresh VA space is empty.
    pub fn create_va_space(&self, caller: &Caller) -> UvmResult<Arc<VaSpace>> {
        let id = self.next_va_space_id.fetch_add(1, Ordering::Relaxed);
        let va_space = Arc::new(VaSpace::new(id, caller.pid, Arc::clone(&self.config)));
        if let Some(mm) = &caller.mm {
            va_space.register_mm(Arc::clone(mm))?;
        }
        log::debug!("Created VA space {id} for pid {}", caller.pid);
        Ok(va_space)
    }

    /// Tears `va_space` down now, or hands it to the deferred worker while the
    /// driver is suspended.
    ///
    /// # Errors
    /// `Busy` when suspended and deferred teardown is disabled; otherwise
    /// teardown or scheduling failures.
    pub fn destroy_va_space(&self, va_space: Arc<VaSpace>) -> UvmResult<()> {
        if let Some(_pm) = self.pm.try_read() {
            return va_space.destroy();
        }
        if !self.config.deferred_teardown {
            return Err(UvmError::Busy);
        }

        log::debug!("Deferring teardown of VA space {}", va_space.id());
        let pm = Arc::clone(&self.pm);
        self.deferred.schedule(move || {
            let _pm = pm.read();
            if let Err(e) = va_space.destroy() {
                log::error!("Deferred teardown of VA space {} failed: {e}", va_space.id());
            }
        })
    }

    /// Blocks new entry points until the returned guard is dropped.
    pub fn suspend(&self) -> PmWriteGuard<'_> {
        log::debug!("Suspending");
        self.pm.suspend()
    }

    /// Waits for every deferred job scheduled so far.
    ///
    /// # Errors
    /// `InvalidState` if the worker has stopped.
    pub fn flush_deferred(&self) -> UvmResult<()> {
        self.deferred.flush()
    }
}

// ===============================================================================================
// Global Singleton Management
// ===============================================================================================

static GLOBAL_CONTEXT: Mutex<Option<Arc<Context>>> = Mutex::new(None);

/// Returns the process-wide context, creating it from the environment on
/// first use.
///
/// # Errors
/// `InvalidState` if the deferred worker cannot be started.
pub fn acquire() -> UvmResult<Arc<Context>> {
    let mut guard = GLOBAL_CONTEXT
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    if let Some(ctx) = guard.as_ref() {
        return Ok(Arc::clone(ctx));
    }

    let context = Context::new(UvmConfig::from_env())?;
    *guard = Some(Arc::clone(&context));
    drop(guard);

    Ok(context)
}

/// Drops the global reference. The context lives on until its last user
/// releases it; the next `acquire` builds a fresh one.
pub fn release() {
    let context = GLOBAL_CONTEXT
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    drop(context);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::Mm;

    #[test]
    fn test_gpu_table() {
        let ctx = Context::new(UvmConfig::new()).unwrap();
        let gpu = ctx.add_gpu(Gpu::new(0, ProcessorUuid([7; 16]))).unwrap();
        assert_eq!(
            ctx.add_gpu(Gpu::new(0, ProcessorUuid([8; 16]))).err(),
            Some(UvmError::InUse)
        );
        assert!(Arc::ptr_eq(&ctx.find_gpu(&ProcessorUuid([7; 16])).unwrap(), &gpu));
        assert!(ctx.gpu(ProcessorId::gpu(0)).is_some());
        ctx.remove_gpu(ProcessorId::gpu(0)).unwrap();
        assert_eq!(
            ctx.remove_gpu(ProcessorId::gpu(0)).err(),
            Some(UvmError::InvalidDevice)
        );
    }

    #[test]
    fn test_va_spaces_get_distinct_ids() {
        let ctx = Context::new(UvmConfig::new()).unwrap();
        let caller = Caller::with_pid(42, Some(Mm::new(42)));
        let a = ctx.create_va_space(&caller).unwrap();
        let b = ctx.create_va_space(&caller).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.owner_pid(), 42);
        ctx.destroy_va_space(a).unwrap();
        ctx.destroy_va_space(b).unwrap();
    }

    #[test]
    fn test_teardown_is_deferred_while_suspended() {
        let ctx = Context::new(UvmConfig::new()).unwrap();
        let va_space = ctx.create_va_space(&Caller::with_pid(1, None)).unwrap();
        va_space.down_write().create_managed(0x10000, 0x1000).unwrap();

        let suspended = ctx.suspend();
        ctx.destroy_va_space(Arc::clone(&va_space)).unwrap();
        assert_eq!(va_space.down_read().ranges().len(), 1);
        drop(suspended);

        ctx.flush_deferred().unwrap();
        assert!(va_space.down_read().ranges().is_empty());
    }

    #[test]
    fn test_teardown_busy_without_deferral() {
        let ctx = Context::new(UvmConfig::new().deferred_teardown(false)).unwrap();
        let va_space = ctx.create_va_space(&Caller::with_pid(1, None)).unwrap();
        let suspended = ctx.suspend();
        assert_eq!(
            ctx.destroy_va_space(Arc::clone(&va_space)),
            Err(UvmError::Busy)
        );
        drop(suspended);
        ctx.destroy_va_space(va_space).unwrap();
    }
}
