//! VA spaces and everything that lives in them.

pub mod block;
pub mod external;
pub mod fault;
pub mod policy;
pub mod processors;
pub mod range;
pub mod range_tree;
pub mod semaphore;
pub mod space;

pub use block::{AccessType, PageMask, Prot, VaBlock};
pub use policy::{PolicyChange, ReadDuplication, VaPolicy};
pub use range::{VaRange, VaRangeKind, VaRangeType};
pub use range_tree::{RangeNode, RangeTree, RangeTreeEntry};
pub use space::{VaSpace, VaSpaceState};
