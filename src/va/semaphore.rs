//! Semaphore pools: zeroed system memory mapped into the user VA space and on
//! GPUs, used for user-level GPU semaphores.

use crate::error::{UvmError, UvmResult};
use crate::lock::{LockMode, LockOrder, OrderToken};
use crate::processor::{MAX_GPUS, ProcessorId, ProcessorMask, ProcessorUuid};
use crate::tracker::{Tracker, TrackerEntry};
use crate::va::block::Prot;
use crate::va::processors::Processors;
use parking_lot::Mutex;

/// Mapping attributes requested for one GPU, identified by UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuMappingAttributes {
    pub gpu_uuid: ProcessorUuid,
    pub prot: Prot,
    pub cacheable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreGpuAttrs {
    pub prot: Prot,
    pub cacheable: bool,
}

impl Default for SemaphoreGpuAttrs {
    fn default() -> Self {
        Self {
            prot: Prot::ReadWriteAtomic,
            cacheable: false,
        }
    }
}

#[derive(Debug)]
pub struct SemaphorePool {
    memory: Vec<u8>,
    gpu_attrs: [SemaphoreGpuAttrs; MAX_GPUS],
    /// The one GPU allowed to cache the pool, if any.
    owner: Option<ProcessorId>,
    mapped_gpus: ProcessorMask,
    tracker: Mutex<Tracker>,
}

impl SemaphorePool {
    /// # Errors
    /// `InvalidDevice` for an unknown GPU UUID and `InvalidArgument` when more
    /// than one GPU asks to cache the pool.
    pub fn new(
        length: u64,
        per_gpu_attrs: &[GpuMappingAttributes],
        processors: &Processors,
    ) -> UvmResult<Self> {
        let size = usize::try_from(length).map_err(|_| UvmError::OutOfMemory)?;
        let mut gpu_attrs = [SemaphoreGpuAttrs::default(); MAX_GPUS];
        let mut owner = None;

        for attrs in per_gpu_attrs {
            let gpu = processors
                .gpus()
                .find_by_uuid(&attrs.gpu_uuid)
                .ok_or(UvmError::InvalidDevice)?;
            if attrs.cacheable {
                if owner.is_some() {
                    log::debug!("Caching of semaphore pool requested on more than one GPU");
                    return Err(UvmError::InvalidArgument(
                        "semaphore pool cached on more than one GPU".into(),
                    ));
                }
                owner = Some(gpu.id);
            }
            if let Some(index) = gpu.id.gpu_index() {
                gpu_attrs[index] = SemaphoreGpuAttrs {
                    prot: attrs.prot,
                    cacheable: attrs.cacheable,
                };
            }
        }

        Ok(Self {
            memory: vec![0; size],
            gpu_attrs,
            owner,
            mapped_gpus: processors.registered().gpus(),
            tracker: Mutex::new(Tracker::new()),
        })
    }

    #[must_use]
    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    #[must_use]
    pub const fn owner(&self) -> Option<ProcessorId> {
        self.owner
    }

    #[must_use]
    pub fn gpu_attrs(&self, gpu: ProcessorId) -> Option<SemaphoreGpuAttrs> {
        gpu.gpu_index().map(|index| self.gpu_attrs[index])
    }

    #[must_use]
    pub const fn mapped_gpus(&self) -> ProcessorMask {
        self.mapped_gpus
    }

    pub(crate) fn map_gpu(&mut self, gpu: ProcessorId) {
        self.mapped_gpus.set(gpu);
    }

    pub(crate) fn unmap_gpu(&mut self, gpu: ProcessorId) {
        self.mapped_gpus.clear(gpu);
        if self.owner == Some(gpu) {
            self.owner = None;
        }
    }

    /// Records GPU work that touches the pool.
    pub fn add_work(&self, entry: TrackerEntry) {
        let _token = OrderToken::acquire(LockOrder::SemaphorePoolTracker, LockMode::Exclusive);
        self.tracker.lock().add_entry(entry);
    }

    /// Waits for outstanding work before the memory is released.
    pub(crate) fn destroy(self) {
        let tracker = self.tracker.into_inner();
        if let Err(e) = tracker.wait_deinit() {
            log::debug!("Semaphore pool tracker wait failed during destroy: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::Gpu;
    use std::sync::Arc;

    fn processors() -> Processors {
        let mut processors = Processors::new();
        processors
            .register_gpu(Arc::new(Gpu::new(0, ProcessorUuid([1; 16]))))
            .unwrap();
        processors
            .register_gpu(Arc::new(Gpu::new(1, ProcessorUuid([2; 16]))))
            .unwrap();
        processors
    }

    fn attrs(byte: u8, cacheable: bool) -> GpuMappingAttributes {
        GpuMappingAttributes {
            gpu_uuid: ProcessorUuid([byte; 16]),
            prot: Prot::ReadWrite,
            cacheable,
        }
    }

    #[test]
    fn test_pool_is_zeroed_and_tracks_owner() {
        let processors = processors();
        let pool = SemaphorePool::new(0x1000, &[attrs(2, true)], &processors).unwrap();

        assert!(pool.memory().iter().all(|&b| b == 0));
        assert_eq!(pool.memory().len(), 0x1000);
        assert_eq!(pool.owner(), Some(ProcessorId::gpu(1)));
        assert_eq!(
            pool.gpu_attrs(ProcessorId::gpu(0)),
            Some(SemaphoreGpuAttrs::default())
        );
        assert_eq!(pool.mapped_gpus().count(), 2);
        pool.destroy();
    }

    #[test]
    fn test_pool_rejects_two_caching_gpus_and_unknown_uuid() {
        let processors = processors();
        assert!(matches!(
            SemaphorePool::new(0x1000, &[attrs(1, true), attrs(2, true)], &processors),
            Err(UvmError::InvalidArgument(_))
        ));
        assert_eq!(
            SemaphorePool::new(0x1000, &[attrs(9, false)], &processors).err(),
            Some(UvmError::InvalidDevice)
        );
    }
}
