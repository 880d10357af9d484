//! Driver-wide configuration.

use crate::utils::{PAGE_SIZE, VA_BLOCK_SIZE};

/// A CPU NUMA node as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumaNode {
    pub id: u32,
    pub has_memory: bool,
    /// Node onlined for a coherent GPU's memory rather than system memory.
    pub is_gpu_node: bool,
}

impl NumaNode {
    #[must_use]
    pub const fn memory(id: u32) -> Self {
        Self {
            id,
            has_memory: true,
            is_gpu_node: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UvmConfig {
    /// Hardware address translation services are present and enabled.
    pub ats_enabled: bool,
    /// Page-table-driven tracking of pageable memory.
    pub hmm_enabled: bool,
    pub numa_nodes: Vec<NumaNode>,
    /// VA-space teardown may be handed to the background worker.
    pub deferred_teardown: bool,
    pub page_size: u64,
    pub block_size: u64,
}

impl Default for UvmConfig {
    fn default() -> Self {
        Self {
            ats_enabled: false,
            hmm_enabled: false,
            numa_nodes: vec![NumaNode::memory(0)],
            deferred_teardown: true,
            page_size: PAGE_SIZE,
            block_size: VA_BLOCK_SIZE,
        }
    }
}

impl UvmConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn ats(mut self, enabled: bool) -> Self {
        self.ats_enabled = enabled;
        self
    }

    #[must_use]
    pub const fn hmm(mut self, enabled: bool) -> Self {
        self.hmm_enabled = enabled;
        self
    }

    #[must_use]
    pub const fn deferred_teardown(mut self, enabled: bool) -> Self {
        self.deferred_teardown = enabled;
        self
    }

    #[must_use]
    pub fn numa_node(mut self, node: NumaNode) -> Self {
        self.numa_nodes.retain(|n| n.id != node.id);
        self.numa_nodes.push(node);
        self
    }

    /// Overlays `UVM_ATS` and `UVM_HMM` (`0`/`1`) on the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_flag("UVM_ATS") {
            config.ats_enabled = value;
        }
        if let Some(value) = env_flag("UVM_HMM") {
            config.hmm_enabled = value;
        }
        config
    }

    #[must_use]
    pub fn find_numa_node(&self, id: u32) -> Option<&NumaNode> {
        self.numa_nodes.iter().find(|n| n.id == id)
    }
}

fn env_flag(name: &str) -> Option<bool> {
    match std::env::var(name).ok()?.trim() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        other => {
            log::debug!("Ignoring unrecognized value {other:?} for {name}");
            None
        }
    }
}
