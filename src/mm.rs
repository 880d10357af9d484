//! The CPU memory map a VA space is tied to.
//!
//! Policy calls hold an [`MmGuard`] for the whole call. The core treats it as an
//! opaque capability: it only asks whether a span is covered by valid VMAs.

use crate::error::UvmResult;
use crate::lock::{LockMode, LockOrder, OrderToken, Ordered};
use crate::va::range_tree::{RangeNode, RangeTree, RangeTreeEntry};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

/// One CPU mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vma {
    node: RangeNode,
    pub writable: bool,
}

impl Vma {
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self {
            node: RangeNode::new(start, end),
            writable: true,
        }
    }
}

impl RangeTreeEntry for Vma {
    fn node(&self) -> &RangeNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut RangeNode {
        &mut self.node
    }
}

#[derive(Debug)]
pub struct Mm {
    owner_pid: i32,
    vmas: RwLock<RangeTree<Vma>>,
}

pub type MmGuard<'a> = Ordered<RwLockReadGuard<'a, RangeTree<Vma>>>;
pub type MmWriteGuard<'a> = Ordered<RwLockWriteGuard<'a, RangeTree<Vma>>>;

impl Mm {
    #[must_use]
    pub fn new(owner_pid: i32) -> Arc<Self> {
        Arc::new(Self {
            owner_pid,
            vmas: RwLock::new(RangeTree::new()),
        })
    }

    /// Memory map owned by the calling process.
    #[must_use]
    pub fn for_current_process() -> Arc<Self> {
        Self::new(current_pid())
    }

    #[must_use]
    pub const fn owner_pid(&self) -> i32 {
        self.owner_pid
    }

    /// Takes the mmap lock for read.
    pub fn lock_read(&self) -> MmGuard<'_> {
        let token = OrderToken::acquire(LockOrder::MmapLock, LockMode::Shared);
        Ordered::new(self.vmas.read(), token)
    }

    pub fn lock_write(&self) -> MmWriteGuard<'_> {
        let token = OrderToken::acquire(LockOrder::MmapLock, LockMode::Exclusive);
        Ordered::new(self.vmas.write(), token)
    }

    /// Adds a VMA covering `[start, start + length)` and returns it.
    ///
    /// # Errors
    /// `AddressInUse` if it overlaps an existing VMA.
    pub fn mmap(&self, start: u64, length: u64) -> UvmResult<Vma> {
        let vma = Vma::new(start, start + length - 1);
        self.lock_write().add(vma.clone())?;
        Ok(vma)
    }

    pub fn munmap(&self, start: u64) -> Option<Vma> {
        self.lock_write().remove(start)
    }
}

/// Whether `[base, base + length)` is covered by VMAs with no holes.
#[must_use]
pub fn is_valid_vma_range(vmas: &RangeTree<Vma>, base: u64, length: u64) -> bool {
    let Some(last) = length.checked_sub(1).and_then(|l| base.checked_add(l)) else {
        return false;
    };
    let mut covered_to = base;
    for vma in vmas.iter_in_contig(base, last) {
        if vma.end() >= last {
            return true;
        }
        covered_to = vma.end() + 1;
    }
    covered_to > last
}

#[must_use]
pub fn current_pid() -> i32 {
    // SAFETY: getpid has no preconditions and cannot fail.
    unsafe { libc::getpid() }
}

/// The process issuing an entry-point call.
#[derive(Debug, Clone)]
pub struct Caller {
    pub pid: i32,
    pub mm: Option<Arc<Mm>>,
}

impl Caller {
    /// The calling process, with its memory map if it has one.
    #[must_use]
    pub fn current(mm: Option<Arc<Mm>>) -> Self {
        Self {
            pid: current_pid(),
            mm,
        }
    }

    #[must_use]
    pub const fn with_pid(pid: i32, mm: Option<Arc<Mm>>) -> Self {
        Self { pid, mm }
    }
}
