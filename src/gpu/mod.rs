pub mod channel;

use crate::error::{UvmError, UvmResult};
use crate::processor::{MAX_GPUS, ProcessorId, ProcessorMask, ProcessorUuid};
use channel::Channel;
use std::sync::Arc;

/// Default GPU virtual address width (49 bits).
pub const DEFAULT_GPU_MAX_VA: u64 = (1 << 49) - 1;

/// A GPU known to the driver.
///
/// This only carries what the address-space core needs from the RM layer:
/// identity, capabilities and the channel its work is pushed to.
#[derive(Debug)]
pub struct Gpu {
    pub id: ProcessorId,
    pub uuid: ProcessorUuid,
    pub name: String,
    /// Can take replayable faults. Non-faultable GPUs follow UVM-Lite rules.
    pub faultable: bool,
    /// Highest virtual address the GPU MMU translates (inclusive).
    pub max_va: u64,
    /// The CPU can access this GPU's memory directly over a coherent link.
    pub cpu_coherent: bool,
    channel: Arc<Channel>,
}

impl Gpu {
    /// Creates the GPU occupying slot `index`.
    ///
    /// # Panics
    /// Panics if `index >= MAX_GPUS`.
    #[must_use]
    pub fn new(index: usize, uuid: ProcessorUuid) -> Self {
        let id = ProcessorId::gpu(index);
        Self {
            id,
            uuid,
            name: format!("{id}"),
            faultable: true,
            max_va: DEFAULT_GPU_MAX_VA,
            cpu_coherent: false,
            channel: Channel::new(format!("{id} ce")),
        }
    }

    #[must_use]
    pub const fn non_faultable(mut self) -> Self {
        self.faultable = false;
        self
    }

    #[must_use]
    pub const fn with_max_va(mut self, max_va: u64) -> Self {
        self.max_va = max_va;
        self
    }

    #[must_use]
    pub const fn cpu_coherent(mut self) -> Self {
        self.cpu_coherent = true;
        self
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Whether `[base, base + length)` fits in this GPU's address space.
    #[must_use]
    pub fn can_address(&self, base: u64, length: u64) -> bool {
        length != 0
            && base
                .checked_add(length - 1)
                .is_some_and(|last| last <= self.max_va)
    }
}

/// Sparse table of GPUs indexed by slot.
#[derive(Debug, Clone)]
pub struct GpuTable {
    gpus: Vec<Option<Arc<Gpu>>>,
}

impl Default for GpuTable {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            gpus: vec![None; MAX_GPUS],
        }
    }

    /// # Errors
    /// Returns `InUse` if the slot is already occupied.
    pub fn insert(&mut self, gpu: Arc<Gpu>) -> UvmResult<()> {
        let index = gpu.id.gpu_index().ok_or(UvmError::InvalidDevice)?;
        if self.gpus[index].is_some() {
            return Err(UvmError::InUse);
        }
        self.gpus[index] = Some(gpu);
        Ok(())
    }

    pub fn remove(&mut self, id: ProcessorId) -> Option<Arc<Gpu>> {
        self.gpus[id.gpu_index()?].take()
    }

    #[must_use]
    pub fn get(&self, id: ProcessorId) -> Option<&Arc<Gpu>> {
        self.gpus[id.gpu_index()?].as_ref()
    }

    #[must_use]
    pub fn find_by_uuid(&self, uuid: &ProcessorUuid) -> Option<&Arc<Gpu>> {
        self.iter().find(|gpu| &gpu.uuid == uuid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Gpu>> {
        self.gpus.iter().flatten()
    }

    #[must_use]
    pub fn mask(&self) -> ProcessorMask {
        self.iter().map(|gpu| gpu.id).collect()
    }

    /// Checks every GPU in `mask` for channel/ECC errors.
    ///
    /// # Errors
    /// Returns the first `ChannelError` found.
    pub fn check_errors(&self, mask: ProcessorMask) -> UvmResult<()> {
        for id in mask.gpus().iter() {
            if let Some(gpu) = self.get(id) {
                gpu.channel.check_errors()?;
            }
        }
        Ok(())
    }
}
