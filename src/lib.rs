//! Unified virtual memory for CPU and GPU processors.
//!
//! A [`VaSpace`] tracks typed, non-overlapping VA ranges. Managed ranges carry
//! a migration policy (preferred location, accessed-by set, read duplication)
//! and are split into blocks that record where each page lives and who maps
//! it. The entry points in [`api`] apply policy changes and service faults
//! under the driver's lock ordering.

pub mod api;
pub mod config;
pub mod context;
pub mod deferred;
pub mod error;
pub mod gpu;
pub mod hmm;
pub mod lock;
pub mod mm;
pub mod policy;
pub mod processor;
pub mod tools;
pub mod tracker;
pub mod utils;
pub mod va;

pub use config::{NumaNode, UvmConfig};
pub use context::{Context, acquire, release};
pub use error::{UvmError, UvmResult};
pub use gpu::Gpu;
pub use mm::{Caller, Mm};
pub use processor::{ProcessorId, ProcessorMask, ProcessorUuid};
pub use tracker::Tracker;
pub use va::{AccessType, Prot, ReadDuplication, VaPolicy, VaSpace};
