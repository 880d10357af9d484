//! Processors registered in one VA space and who can access whose memory.

use crate::error::{UvmError, UvmResult};
use crate::gpu::channel::Channel;
use crate::gpu::{Gpu, GpuTable};
use crate::processor::{MAX_PROCESSORS, ProcessorId, ProcessorMask};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Processors {
    gpus: GpuTable,
    registered: ProcessorMask,
    faultable: ProcessorMask,
    /// `can_access[p]` is the set of processors whose memory `p` can map.
    can_access: [ProcessorMask; MAX_PROCESSORS],
    /// `accessible_from[p]` is the set of processors that can map `p`'s memory.
    accessible_from: [ProcessorMask; MAX_PROCESSORS],
    peers: Vec<(ProcessorId, ProcessorId)>,
}

impl Default for Processors {
    fn default() -> Self {
        Self::new()
    }
}

impl Processors {
    /// Starts with only the CPU registered.
    #[must_use]
    pub fn new() -> Self {
        let mut processors = Self {
            gpus: GpuTable::new(),
            registered: ProcessorMask::single(ProcessorId::CPU),
            faultable: ProcessorMask::single(ProcessorId::CPU),
            can_access: [ProcessorMask::EMPTY; MAX_PROCESSORS],
            accessible_from: [ProcessorMask::EMPTY; MAX_PROCESSORS],
            peers: Vec::new(),
        };
        processors.grant(ProcessorId::CPU, ProcessorId::CPU);
        processors
    }

    fn grant(&mut self, accessor: ProcessorId, memory: ProcessorId) {
        self.can_access[accessor.value()].set(memory);
        self.accessible_from[memory.value()].set(accessor);
    }

    fn revoke(&mut self, accessor: ProcessorId, memory: ProcessorId) {
        self.can_access[accessor.value()].clear(memory);
        self.accessible_from[memory.value()].clear(accessor);
    }

    /// # Errors
    /// `InUse` if the GPU's slot is already registered.
    pub fn register_gpu(&mut self, gpu: Arc<Gpu>) -> UvmResult<()> {
        let id = gpu.id;
        let faultable = gpu.faultable;
        let cpu_coherent = gpu.cpu_coherent;
        self.gpus.insert(gpu)?;

        self.registered.set(id);
        if faultable {
            self.faultable.set(id);
        }
        self.grant(id, id);
        self.grant(id, ProcessorId::CPU);
        if cpu_coherent {
            self.grant(ProcessorId::CPU, id);
        }
        Ok(())
    }

    /// Forgets `id` along with every peer link involving it.
    ///
    /// # Errors
    /// `InvalidDevice` if `id` is not a registered GPU.
    pub fn unregister_gpu(&mut self, id: ProcessorId) -> UvmResult<Arc<Gpu>> {
        let gpu = self.gpus.remove(id).ok_or(UvmError::InvalidDevice)?;
        let linked: Vec<_> = self
            .peers
            .iter()
            .filter(|(a, b)| *a == id || *b == id)
            .copied()
            .collect();
        for (a, b) in linked {
            self.disable_peer_access(a, b);
        }

        let can_access = self.can_access[id.value()];
        let accessible_from = self.accessible_from[id.value()];
        for other in can_access.iter() {
            self.revoke(id, other);
        }
        for other in accessible_from.iter() {
            self.revoke(other, id);
        }
        self.registered.clear(id);
        self.faultable.clear(id);
        Ok(gpu)
    }

    /// # Errors
    /// `InvalidDevice` unless both processors are distinct registered GPUs.
    pub fn enable_peer_access(&mut self, a: ProcessorId, b: ProcessorId) -> UvmResult<()> {
        if a == b || self.gpu(a).is_none() || self.gpu(b).is_none() {
            return Err(UvmError::InvalidDevice);
        }
        if self.peers_enabled(a, b) {
            return Ok(());
        }
        self.grant(a, b);
        self.grant(b, a);
        self.peers.push((a, b));
        Ok(())
    }

    /// Returns whether a link was actually torn down.
    pub fn disable_peer_access(&mut self, a: ProcessorId, b: ProcessorId) -> bool {
        let before = self.peers.len();
        self.peers
            .retain(|&(x, y)| !((x == a && y == b) || (x == b && y == a)));
        if self.peers.len() == before {
            return false;
        }
        self.revoke(a, b);
        self.revoke(b, a);
        true
    }

    #[must_use]
    pub fn peers_enabled(&self, a: ProcessorId, b: ProcessorId) -> bool {
        self.peers
            .iter()
            .any(|&(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    #[must_use]
    pub fn gpu(&self, id: ProcessorId) -> Option<&Arc<Gpu>> {
        self.gpus.get(id)
    }

    #[must_use]
    pub fn gpus(&self) -> &GpuTable {
        &self.gpus
    }

    #[must_use]
    pub const fn registered(&self) -> ProcessorMask {
        self.registered
    }

    #[must_use]
    pub const fn is_registered(&self, id: ProcessorId) -> bool {
        self.registered.test(id)
    }

    #[must_use]
    pub const fn faultable(&self) -> ProcessorMask {
        self.faultable
    }

    /// Registered GPUs that cannot take replayable faults.
    #[must_use]
    pub const fn non_faultable_gpus(&self) -> ProcessorMask {
        self.registered.gpus().andnot(self.faultable)
    }

    #[must_use]
    pub const fn can_access(&self, accessor: ProcessorId) -> ProcessorMask {
        self.can_access[accessor.value()]
    }

    #[must_use]
    pub const fn accessible_from(&self, memory: ProcessorId) -> ProcessorMask {
        self.accessible_from[memory.value()]
    }

    /// Read duplication needs every registered GPU to be able to fault.
    ///
    /// `changing` is treated as if its registration state were flipped.
    #[must_use]
    pub fn can_read_duplicate(&self, changing: Option<&Gpu>) -> bool {
        let mut non_faultable = self.non_faultable_gpus();
        if let Some(gpu) = changing {
            if !gpu.faultable {
                if self.registered.test(gpu.id) {
                    non_faultable.clear(gpu.id);
                } else {
                    non_faultable.set(gpu.id);
                }
            }
        }
        non_faultable.is_empty()
    }

    /// The processor in `candidates` closest to `src`.
    ///
    /// `src` itself wins, then GPUs whose memory `src` can map directly, then
    /// the CPU, then anything else.
    #[must_use]
    pub fn find_closest_processor(
        &self,
        candidates: ProcessorMask,
        src: ProcessorId,
    ) -> Option<ProcessorId> {
        if candidates.test(src) {
            return Some(src);
        }
        let reachable = candidates.and(self.can_access(src));
        reachable
            .first_gpu()
            .or_else(|| reachable.test(ProcessorId::CPU).then_some(ProcessorId::CPU))
            .or_else(|| candidates.first())
    }

    /// Non-faultable GPUs that must keep a mapping to the preferred location.
    ///
    /// Empty unless the preferred location is the CPU or a non-faultable GPU.
    #[must_use]
    pub fn uvm_lite_gpus(
        &self,
        preferred_location: Option<ProcessorId>,
        accessed_by: ProcessorMask,
    ) -> ProcessorMask {
        let Some(preferred) = preferred_location else {
            return ProcessorMask::EMPTY;
        };
        if self.faultable.test(preferred) && preferred.is_gpu() {
            return ProcessorMask::EMPTY;
        }

        let mut mask = accessed_by.and(self.non_faultable_gpus());
        if preferred.is_gpu() {
            mask.set(preferred);
        }
        mask
    }

    /// Channel that carries work moving data from `src` to `dst`.
    ///
    /// CPU to CPU copies need no GPU work.
    #[must_use]
    pub fn channel_for(&self, src: ProcessorId, dst: ProcessorId) -> Option<&Arc<Channel>> {
        let owner = if dst.is_gpu() { dst } else { src };
        self.gpu(owner).map(|gpu| gpu.channel())
    }
}
