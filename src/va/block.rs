//! VA blocks: the unit of residency and mapping tracking.
//!
//! A block covers at most one 2 MiB aligned region of a managed range. Page
//! masks are indexed from the aligned base, so splitting a block only
//! partitions its masks.

use crate::error::UvmResult;
use crate::lock::{LockMode, LockOrder, OrderToken, Ordered};
use crate::processor::{MAX_PROCESSORS, ProcessorId, ProcessorMask};
use crate::tools::{MakeResidentCause, MapRemoteCause, PerfEvent, PerfEvents};
use crate::tracker::Tracker;
use crate::utils::{PAGE_SHIFT, PAGES_PER_VA_BLOCK, page_index, va_block_align_down};
use crate::va::policy::VaPolicy;
use crate::va::processors::Processors;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;

// ===============================================================================================
// Page masks
// ===============================================================================================

const PAGE_MASK_WORDS: usize = PAGES_PER_VA_BLOCK / 64;

/// One bit per page of a 2 MiB block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PageMask([u64; PAGE_MASK_WORDS]);

impl PageMask {
    pub const EMPTY: Self = Self([0; PAGE_MASK_WORDS]);

    /// Pages `first..outer`.
    #[must_use]
    pub fn region(first: usize, outer: usize) -> Self {
        let mut mask = Self::EMPTY;
        for page in first..outer.min(PAGES_PER_VA_BLOCK) {
            mask.set(page);
        }
        mask
    }

    #[must_use]
    pub const fn test(&self, page: usize) -> bool {
        self.0[page / 64] & (1 << (page % 64)) != 0
    }

    pub fn set(&mut self, page: usize) {
        self.0[page / 64] |= 1 << (page % 64);
    }

    pub fn clear(&mut self, page: usize) {
        self.0[page / 64] &= !(1 << (page % 64));
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn or(&self, other: &Self) -> Self {
        let mut out = *self;
        out.0.iter_mut().zip(other.0).for_each(|(a, b)| *a |= b);
        out
    }

    #[must_use]
    pub fn and(&self, other: &Self) -> Self {
        let mut out = *self;
        out.0.iter_mut().zip(other.0).for_each(|(a, b)| *a &= b);
        out
    }

    #[must_use]
    pub fn andnot(&self, other: &Self) -> Self {
        let mut out = *self;
        out.0.iter_mut().zip(other.0).for_each(|(a, b)| *a &= !b);
        out
    }

    #[must_use]
    pub fn first(&self) -> Option<usize> {
        self.iter().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..PAGES_PER_VA_BLOCK).filter(|&page| self.test(page))
    }
}

impl fmt::Debug for PageMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageMask({} pages", self.count())?;
        if let Some(first) = self.first() {
            write!(f, ", first {first}")?;
        }
        write!(f, ")")
    }
}

/// Mapping permission, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Prot {
    Read,
    ReadWrite,
    ReadWriteAtomic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Read,
    Write,
    Atomic,
}

impl AccessType {
    #[must_use]
    pub const fn required_prot(self) -> Prot {
        match self {
            Self::Read => Prot::Read,
            Self::Write => Prot::ReadWrite,
            Self::Atomic => Prot::ReadWriteAtomic,
        }
    }
}

/// Everything a block operation reads from outside the block.
///
/// Built under the VA-space lock, so the policy cannot change while a block
/// operation runs.
#[derive(Clone, Copy)]
pub struct BlockContext<'a> {
    pub processors: &'a Processors,
    pub events: &'a PerfEvents,
    pub policy: &'a VaPolicy,
    pub uvm_lite_gpus: ProcessorMask,
}

// ===============================================================================================
// Block state
// ===============================================================================================

#[derive(Debug, Clone)]
pub struct VaBlockState {
    start: u64,
    end: u64,
    /// Start of the owning range. Plain key, looked up through the VA space.
    range_start: u64,
    resident: [PageMask; MAX_PROCESSORS],
    mapped: [PageMask; MAX_PROCESSORS],
    writable: [PageMask; MAX_PROCESSORS],
    atomic: [PageMask; MAX_PROCESSORS],
    read_duplicated: PageMask,
    tracker: Tracker,
}

impl VaBlockState {
    fn new(start: u64, end: u64, range_start: u64) -> Self {
        debug_assert_eq!(va_block_align_down(start), va_block_align_down(end));
        Self {
            start,
            end,
            range_start,
            resident: [PageMask::EMPTY; MAX_PROCESSORS],
            mapped: [PageMask::EMPTY; MAX_PROCESSORS],
            writable: [PageMask::EMPTY; MAX_PROCESSORS],
            atomic: [PageMask::EMPTY; MAX_PROCESSORS],
            read_duplicated: PageMask::EMPTY,
            tracker: Tracker::new(),
        }
    }

    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.end
    }

    #[must_use]
    pub const fn range_start(&self) -> u64 {
        self.range_start
    }

    pub(crate) fn set_range_start(&mut self, range_start: u64) {
        self.range_start = range_start;
    }

    const fn base(&self) -> u64 {
        va_block_align_down(self.start)
    }

    #[must_use]
    pub const fn page_index(&self, addr: u64) -> usize {
        page_index(self.base(), addr)
    }

    #[must_use]
    pub const fn page_address(&self, page: usize) -> u64 {
        self.base() + ((page as u64) << PAGE_SHIFT)
    }

    /// Pages of the block that fall inside `[start, end]`.
    #[must_use]
    pub fn pages_in(&self, start: u64, end: u64) -> PageMask {
        let start = start.max(self.start);
        let end = end.min(self.end);
        if start > end {
            return PageMask::EMPTY;
        }
        PageMask::region(self.page_index(start), self.page_index(end) + 1)
    }

    #[must_use]
    pub fn all_pages(&self) -> PageMask {
        self.pages_in(self.start, self.end)
    }

    #[must_use]
    pub const fn resident_on(&self, id: ProcessorId) -> PageMask {
        self.resident[id.value()]
    }

    #[must_use]
    pub const fn mapped_on(&self, id: ProcessorId) -> PageMask {
        self.mapped[id.value()]
    }

    #[must_use]
    pub const fn writable_on(&self, id: ProcessorId) -> PageMask {
        self.writable[id.value()]
    }

    #[must_use]
    pub const fn read_duplicated(&self) -> PageMask {
        self.read_duplicated
    }

    #[must_use]
    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Permission `id` currently holds on the page at `addr`.
    #[must_use]
    pub fn mapping(&self, id: ProcessorId, addr: u64) -> Option<Prot> {
        let page = self.page_index(addr);
        let i = id.value();
        if !self.mapped[i].test(page) {
            None
        } else if self.atomic[i].test(page) {
            Some(Prot::ReadWriteAtomic)
        } else if self.writable[i].test(page) {
            Some(Prot::ReadWrite)
        } else {
            Some(Prot::Read)
        }
    }

    #[must_use]
    pub fn any_resident(&self) -> PageMask {
        self.resident
            .iter()
            .fold(PageMask::EMPTY, |acc, mask| acc.or(mask))
    }

    /// Processors holding a copy of any page in `pages`.
    #[must_use]
    pub fn resident_processors(&self, pages: &PageMask) -> ProcessorMask {
        (0..MAX_PROCESSORS)
            .filter(|&i| !self.resident[i].and(pages).is_empty())
            .filter_map(ProcessorId::from_value)
            .collect()
    }

    fn mapped_processors(&self, pages: &PageMask) -> ProcessorMask {
        (0..MAX_PROCESSORS)
            .filter(|&i| !self.mapped[i].and(pages).is_empty())
            .filter_map(ProcessorId::from_value)
            .collect()
    }

    // -------------------------------------------------------------------------------------------
    // Primitives
    // -------------------------------------------------------------------------------------------

    fn push(
        &mut self,
        ctx: &BlockContext<'_>,
        src: ProcessorId,
        dst: ProcessorId,
        what: &str,
        out: &mut Tracker,
    ) -> UvmResult<()> {
        if let Some(channel) = ctx.processors.channel_for(src, dst) {
            let entry = channel.push(what)?;
            self.tracker.add_entry(entry.clone());
            out.add_entry(entry);
        }
        Ok(())
    }

    /// Drops `id`'s mappings to `pages`.
    ///
    /// # Errors
    /// Fails only if the TLB invalidate cannot be pushed.
    pub fn unmap(
        &mut self,
        ctx: &BlockContext<'_>,
        id: ProcessorId,
        pages: &PageMask,
        out: &mut Tracker,
    ) -> UvmResult<()> {
        let i = id.value();
        let pages = self.mapped[i].and(pages);
        let Some(first) = pages.first() else {
            return Ok(());
        };
        self.push(ctx, id, id, "unmap", out)?;

        self.mapped[i] = self.mapped[i].andnot(&pages);
        self.writable[i] = self.writable[i].andnot(&pages);
        self.atomic[i] = self.atomic[i].andnot(&pages);

        ctx.events.notify(&PerfEvent::Unmap {
            processor: id,
            address: self.page_address(first),
            pages: pages.count(),
        });
        Ok(())
    }

    /// # Errors
    /// Same as [`VaBlockState::unmap`].
    pub fn unmap_mask(
        &mut self,
        ctx: &BlockContext<'_>,
        processors: ProcessorMask,
        pages: &PageMask,
        out: &mut Tracker,
    ) -> UvmResult<()> {
        for id in processors.iter() {
            self.unmap(ctx, id, pages, out)?;
        }
        Ok(())
    }

    /// Maps `id` to the resident copy of each page in `pages` it can reach.
    ///
    /// A local copy wins over a remote one. Pages with no reachable copy are
    /// skipped. Read-duplicated pages never get write permission.
    ///
    /// # Errors
    /// Fails if the page-table update cannot be pushed.
    pub fn map(
        &mut self,
        ctx: &BlockContext<'_>,
        id: ProcessorId,
        pages: &PageMask,
        prot: Prot,
        cause: MapRemoteCause,
        out: &mut Tracker,
    ) -> UvmResult<()> {
        let pages = pages.and(&self.all_pages());
        let reachable = ctx.processors.can_access(id);
        let mut remaining = pages;
        let mut groups = Vec::new();

        let local = remaining.and(&self.resident[id.value()]);
        if !local.is_empty() {
            remaining = remaining.andnot(&local);
            groups.push((id, local));
        }
        while !remaining.is_empty() {
            let holders = self.resident_processors(&remaining).and(reachable);
            let Some(residency) = ctx.processors.find_closest_processor(holders, id) else {
                break;
            };
            let group = remaining.and(&self.resident[residency.value()]);
            remaining = remaining.andnot(&group);
            groups.push((residency, group));
        }
        if groups.is_empty() {
            return Ok(());
        }
        self.push(ctx, id, id, "map", out)?;

        let i = id.value();
        for &(residency, group) in &groups {
            let writable = if prot >= Prot::ReadWrite {
                group.andnot(&self.read_duplicated)
            } else {
                PageMask::EMPTY
            };
            let atomic = if prot == Prot::ReadWriteAtomic {
                writable
            } else {
                PageMask::EMPTY
            };
            self.mapped[i] = self.mapped[i].or(&group);
            self.writable[i] = self.writable[i].andnot(&group).or(&writable);
            self.atomic[i] = self.atomic[i].andnot(&group).or(&atomic);

            if residency != id {
                if let Some(first) = group.first() {
                    ctx.events.notify(&PerfEvent::MapRemote {
                        processor: id,
                        residency,
                        address: self.page_address(first),
                        pages: group.count(),
                        cause,
                    });
                }
            }
        }
        Ok(())
    }

    /// Copies `need` to `dst` from the closest holders; returns the pages that
    /// had no copy anywhere and were populated fresh.
    fn copy_to(
        &mut self,
        ctx: &BlockContext<'_>,
        dst: ProcessorId,
        need: &PageMask,
        duplicate: bool,
        cause: MakeResidentCause,
        out: &mut Tracker,
    ) -> UvmResult<PageMask> {
        let mut remaining = need.and(&self.any_resident());
        let populate = need.andnot(&remaining);
        let mut copies = Vec::new();

        while !remaining.is_empty() {
            let holders = self.resident_processors(&remaining);
            let Some(src) = ctx.processors.find_closest_processor(holders, dst) else {
                break;
            };
            let group = remaining.and(&self.resident[src.value()]);
            self.push(ctx, src, dst, "copy", out)?;
            remaining = remaining.andnot(&group);
            copies.push((src, group));
        }
        if !populate.is_empty() {
            self.push(ctx, dst, dst, "zero", out)?;
        }
        self.resident[dst.value()] = self.resident[dst.value()].or(need);

        for (src, group) in copies {
            let Some(first) = group.first() else { continue };
            let event = if duplicate {
                PerfEvent::ReadDuplicate {
                    dst,
                    address: self.page_address(first),
                    pages: group.count(),
                }
            } else {
                PerfEvent::Migration {
                    src: Some(src),
                    dst,
                    address: self.page_address(first),
                    pages: group.count(),
                    cause,
                }
            };
            ctx.events.notify(&event);
        }
        if let Some(first) = populate.first() {
            ctx.events.notify(&PerfEvent::Migration {
                src: None,
                dst,
                address: self.page_address(first),
                pages: populate.count(),
                cause,
            });
        }
        Ok(populate)
    }

    /// Makes `dst` the only holder of every page in `pages`.
    ///
    /// Other copies are dropped and mappings that pointed at moved or dropped
    /// data are removed. The caller re-establishes mappings it needs.
    ///
    /// # Errors
    /// Propagates push failures; state already changed stays changed.
    pub fn make_resident(
        &mut self,
        ctx: &BlockContext<'_>,
        dst: ProcessorId,
        pages: &PageMask,
        cause: MakeResidentCause,
        out: &mut Tracker,
    ) -> UvmResult<()> {
        let pages = pages.and(&self.all_pages());
        let need = pages.andnot(&self.resident[dst.value()]);
        self.copy_to(ctx, dst, &need, false, cause, out)?;

        let mut dropped = PageMask::EMPTY;
        for (i, resident) in self.resident.iter_mut().enumerate() {
            if i != dst.value() {
                dropped = dropped.or(&resident.and(&pages));
                *resident = resident.andnot(&pages);
            }
        }
        self.read_duplicated = self.read_duplicated.andnot(&pages);

        let changed = need.or(&dropped);
        for id in self.mapped_processors(&changed).iter() {
            let stale = if id == dst { need } else { changed };
            self.unmap(ctx, id, &stale, out)?;
        }
        Ok(())
    }

    /// Adds a copy of `pages` on `dst`, keeping every existing copy.
    ///
    /// Pages that end up with more than one copy lose write and atomic
    /// permission everywhere.
    ///
    /// # Errors
    /// Propagates push failures.
    pub fn make_resident_read_duplicate(
        &mut self,
        ctx: &BlockContext<'_>,
        dst: ProcessorId,
        pages: &PageMask,
        out: &mut Tracker,
    ) -> UvmResult<()> {
        let pages = pages.and(&self.all_pages());
        let need = pages.andnot(&self.resident[dst.value()]);
        let populated = self.copy_to(
            ctx,
            dst,
            &need,
            true,
            MakeResidentCause::ReadDuplicate,
            out,
        )?;

        let duplicated = need.andnot(&populated).or(&pages.and(&self.read_duplicated));
        if duplicated.is_empty() {
            return Ok(());
        }
        self.read_duplicated = self.read_duplicated.or(&duplicated);

        for i in 0..MAX_PROCESSORS {
            let revoke = self.writable[i].or(&self.atomic[i]).and(&duplicated);
            if revoke.is_empty() {
                continue;
            }
            if let Some(id) = ProcessorId::from_value(i) {
                self.push(ctx, id, id, "revoke write", out)?;
            }
            self.writable[i] = self.writable[i].andnot(&duplicated);
            self.atomic[i] = self.atomic[i].andnot(&duplicated);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------------------------
    // Policy operations
    // -------------------------------------------------------------------------------------------

    /// Applies a new preferred location to already-placed pages.
    ///
    /// Remote mappings held by the new preferred location, and by processors
    /// that are neither accessed-by nor UVM-Lite, are removed so the next
    /// access faults and migrates. Nothing is moved here.
    ///
    /// # Errors
    /// Propagates unmap failures.
    pub fn set_preferred_location_locked(
        &mut self,
        ctx: &BlockContext<'_>,
        pages: &PageMask,
        out: &mut Tracker,
    ) -> UvmResult<()> {
        let Some(preferred) = ctx.policy.preferred_location else {
            return Ok(());
        };

        for id in self.mapped_processors(pages).iter() {
            if ctx.uvm_lite_gpus.test(id) {
                continue;
            }
            let keeps_remote = id != preferred && ctx.policy.accessed_by.test(id);
            if keeps_remote {
                continue;
            }
            let remote = self.mapped[id.value()]
                .and(pages)
                .andnot(&self.resident[id.value()]);
            self.unmap(ctx, id, &remote, out)?;
        }
        Ok(())
    }

    /// Maps `id` to every resident page in `pages`, as location and policy allow.
    ///
    /// Skipped while read duplication is enabled: duplication gives each
    /// accessor its own copy instead.
    ///
    /// # Errors
    /// Propagates map failures.
    pub fn set_accessed_by_locked(
        &mut self,
        ctx: &BlockContext<'_>,
        id: ProcessorId,
        pages: &PageMask,
        out: &mut Tracker,
    ) -> UvmResult<()> {
        if ctx.uvm_lite_gpus.test(id) {
            let Some(preferred) = ctx.policy.preferred_location else {
                return Ok(());
            };
            let on_preferred = pages.and(&self.resident[preferred.value()]);
            return self.map(
                ctx,
                id,
                &on_preferred,
                Prot::ReadWriteAtomic,
                MapRemoteCause::PreferredLocation,
                out,
            );
        }
        if ctx.policy.read_duplication_enabled() {
            return Ok(());
        }
        let resident = pages.and(&self.any_resident());
        self.map(
            ctx,
            id,
            &resident,
            Prot::ReadWrite,
            MapRemoteCause::AccessedBy,
            out,
        )
    }

    /// Gives every accessed-by processor its own read-only copy.
    ///
    /// Remote accessed-by mappings are torn down first.
    ///
    /// # Errors
    /// Propagates copy and map failures.
    pub fn set_read_duplication(
        &mut self,
        ctx: &BlockContext<'_>,
        pages: &PageMask,
        out: &mut Tracker,
    ) -> UvmResult<()> {
        let resident = pages.and(&self.any_resident());
        if resident.is_empty() {
            return Ok(());
        }

        let duplicate_on = ctx
            .policy
            .accessed_by
            .and(ctx.processors.registered())
            .andnot(ctx.uvm_lite_gpus);
        for id in duplicate_on.iter() {
            let remote = self.mapped[id.value()]
                .and(&resident)
                .andnot(&self.resident[id.value()]);
            self.unmap(ctx, id, &remote, out)?;
            self.make_resident_read_duplicate(ctx, id, &resident, out)?;
            self.map(ctx, id, &resident, Prot::Read, MapRemoteCause::AccessedBy, out)?;
        }
        Ok(())
    }

    /// Collapses duplicated pages to a single owner and restores accessed-by
    /// mappings.
    ///
    /// The owner is the preferred location when it holds a copy, otherwise the
    /// holder closest to the CPU. Failing to restore an accessed-by mapping is
    /// logged and ignored.
    ///
    /// # Errors
    /// Propagates failures of the collapse itself.
    pub fn unset_read_duplication(
        &mut self,
        ctx: &BlockContext<'_>,
        pages: &PageMask,
        out: &mut Tracker,
    ) -> UvmResult<()> {
        let mut duplicated = PageMask::EMPTY;
        for page in pages.and(&self.all_pages()).iter() {
            let holders = (0..MAX_PROCESSORS)
                .filter(|&i| self.resident[i].test(page))
                .count();
            if holders > 1 {
                duplicated.set(page);
            }
        }

        if let Some(preferred) = ctx.policy.preferred_location {
            let owned = duplicated.and(&self.resident[preferred.value()]);
            if !owned.is_empty() {
                self.make_resident(ctx, preferred, &owned, MakeResidentCause::PolicyChange, out)?;
                duplicated = duplicated.andnot(&owned);
            }
        }

        // Remaining pages are grouped by the holder closest to the CPU, which
        // is decided per page.
        let mut owners: Vec<(ProcessorId, PageMask)> = Vec::new();
        for page in duplicated.iter() {
            let mut single = PageMask::EMPTY;
            single.set(page);
            let holders = self.resident_processors(&single);
            let Some(owner) = ctx
                .processors
                .find_closest_processor(holders, ProcessorId::CPU)
            else {
                continue;
            };
            match owners.iter_mut().find(|(id, _)| *id == owner) {
                Some((_, pages)) => pages.set(page),
                None => owners.push((owner, single)),
            }
        }
        for (owner, owned) in owners {
            self.make_resident(ctx, owner, &owned, MakeResidentCause::PolicyChange, out)?;
        }
        self.read_duplicated = self.read_duplicated.andnot(pages);

        for id in ctx.policy.accessed_by.iter() {
            if let Err(e) = self.set_accessed_by_locked(ctx, id, pages, out) {
                log::warn!(
                    "Failed to restore accessed-by mapping for {id} in [0x{:x}, 0x{:x}]: {e}",
                    self.start,
                    self.end
                );
            }
        }
        Ok(())
    }

    /// Moves pages only `id` holds to the CPU and removes all of `id`'s
    /// mappings and copies.
    ///
    /// # Errors
    /// Propagates copy and unmap failures.
    pub fn evict_processor(
        &mut self,
        ctx: &BlockContext<'_>,
        id: ProcessorId,
        out: &mut Tracker,
    ) -> UvmResult<()> {
        let on_id = self.resident[id.value()];
        let elsewhere = self
            .resident
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != id.value())
            .fold(PageMask::EMPTY, |acc, (_, mask)| acc.or(mask));
        let only_here = on_id.andnot(&elsewhere);

        if !only_here.is_empty() {
            self.make_resident(
                ctx,
                ProcessorId::CPU,
                &only_here,
                MakeResidentCause::Eviction,
                out,
            )?;
        }
        let all = self.all_pages();
        self.unmap(ctx, id, &all, out)?;
        self.resident[id.value()] = PageMask::EMPTY;
        Ok(())
    }

    /// Drops every mapping ahead of destruction.
    ///
    /// # Errors
    /// Propagates unmap failures.
    pub fn unmap_all(&mut self, ctx: &BlockContext<'_>, out: &mut Tracker) -> UvmResult<()> {
        let all = self.all_pages();
        let mapped = self.mapped_processors(&all);
        self.unmap_mask(ctx, mapped, &all, out)
    }

    /// Splits off `[new_end + 1, end]` into a new block state.
    pub(crate) fn split(&mut self, new_end: u64) -> Self {
        debug_assert!(self.start <= new_end && new_end < self.end);
        let upper_pages = self.pages_in(new_end + 1, self.end);
        let mut upper = Self::new(new_end + 1, self.end, self.range_start);

        fn partition(lower: &mut [PageMask], upper: &mut [PageMask], pages: &PageMask) {
            for (l, u) in lower.iter_mut().zip(upper.iter_mut()) {
                *u = l.and(pages);
                *l = l.andnot(pages);
            }
        }
        partition(&mut self.resident, &mut upper.resident, &upper_pages);
        partition(&mut self.mapped, &mut upper.mapped, &upper_pages);
        partition(&mut self.writable, &mut upper.writable, &upper_pages);
        partition(&mut self.atomic, &mut upper.atomic, &upper_pages);
        upper.read_duplicated = self.read_duplicated.and(&upper_pages);
        self.read_duplicated = self.read_duplicated.andnot(&upper_pages);
        upper.tracker = self.tracker.clone();

        self.end = new_end;
        upper
    }
}

// ===============================================================================================
// Locked block
// ===============================================================================================

pub type VaBlockGuard<'a> = Ordered<MutexGuard<'a, VaBlockState>>;

#[derive(Debug)]
pub struct VaBlock {
    state: Mutex<VaBlockState>,
}

impl VaBlock {
    #[must_use]
    pub fn new(start: u64, end: u64, range_start: u64) -> Self {
        Self::from_state(VaBlockState::new(start, end, range_start))
    }

    pub(crate) fn from_state(state: VaBlockState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Takes the block lock. The VA-space lock must already be held.
    pub fn lock(&self) -> VaBlockGuard<'_> {
        let token = OrderToken::acquire(LockOrder::VaBlock, LockMode::Exclusive);
        Ordered::new(self.state.lock(), token)
    }

    /// Exclusive access without locking, for callers holding the VA space
    /// for write.
    pub(crate) fn state_mut(&mut self) -> &mut VaBlockState {
        self.state.get_mut()
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.lock().start
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.lock().end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::Gpu;
    use crate::processor::ProcessorUuid;
    use crate::tools::EventRecorder;
    use crate::utils::{PAGE_SIZE, VA_BLOCK_SIZE};
    use std::sync::Arc;

    const GPU_A: ProcessorId = ProcessorId::gpu(0);
    const GPU_B: ProcessorId = ProcessorId::gpu(1);

    struct Fixture {
        processors: Processors,
        events: PerfEvents,
        policy: VaPolicy,
    }

    impl Fixture {
        fn new() -> Self {
            let mut processors = Processors::new();
            processors
                .register_gpu(Arc::new(Gpu::new(0, ProcessorUuid([1; 16]))))
                .unwrap();
            processors
                .register_gpu(Arc::new(Gpu::new(1, ProcessorUuid([2; 16]))))
                .unwrap();
            Self {
                processors,
                events: PerfEvents::new(),
                policy: VaPolicy::new(),
            }
        }

        fn ctx(&self) -> BlockContext<'_> {
            BlockContext {
                processors: &self.processors,
                events: &self.events,
                policy: &self.policy,
                uvm_lite_gpus: ProcessorMask::EMPTY,
            }
        }
    }

    fn block() -> VaBlockState {
        VaBlockState::new(VA_BLOCK_SIZE, VA_BLOCK_SIZE + 4 * PAGE_SIZE - 1, VA_BLOCK_SIZE)
    }

    #[test]
    fn test_page_mask() {
        let region = PageMask::region(2, 5);
        assert_eq!(region.count(), 3);
        assert!(region.test(2) && region.test(4) && !region.test(5));
        assert_eq!(region.andnot(&PageMask::region(0, 3)).first(), Some(3));
        assert!(PageMask::region(0, 64).and(&PageMask::region(64, 128)).is_empty());
        assert_eq!(PageMask::region(0, PAGES_PER_VA_BLOCK + 10).count(), PAGES_PER_VA_BLOCK);
    }

    #[test]
    fn test_make_resident_moves_and_unmaps() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut block = block();
        let mut tracker = Tracker::new();
        let all = block.all_pages();

        block
            .make_resident(&ctx, ProcessorId::CPU, &all, MakeResidentCause::Fault, &mut tracker)
            .unwrap();
        assert!(tracker.is_empty());
        block
            .map(&ctx, ProcessorId::CPU, &all, Prot::ReadWrite, MapRemoteCause::Coherence, &mut tracker)
            .unwrap();

        block
            .make_resident(&ctx, GPU_A, &all, MakeResidentCause::Fault, &mut tracker)
            .unwrap();
        assert_eq!(block.resident_on(GPU_A), all);
        assert!(block.resident_on(ProcessorId::CPU).is_empty());
        assert!(block.mapped_on(ProcessorId::CPU).is_empty());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_map_prefers_local_and_reports_remote() {
        let fx = Fixture::new();
        let recorder = EventRecorder::new();
        fx.events.register(recorder.clone());
        let ctx = fx.ctx();
        let mut block = block();
        let mut tracker = Tracker::new();
        let all = block.all_pages();

        block
            .make_resident(&ctx, ProcessorId::CPU, &all, MakeResidentCause::Fault, &mut tracker)
            .unwrap();
        recorder.take();

        block
            .map(&ctx, GPU_B, &all, Prot::ReadWrite, MapRemoteCause::AccessedBy, &mut tracker)
            .unwrap();
        assert_eq!(block.mapping(GPU_B, block.start()), Some(Prot::ReadWrite));
        assert!(matches!(
            recorder.take().as_slice(),
            [PerfEvent::MapRemote {
                processor,
                residency: ProcessorId::CPU,
                pages: 4,
                ..
            }] if *processor == GPU_B
        ));
    }

    #[test]
    fn test_unreachable_copy_is_not_mapped() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut block = block();
        let mut tracker = Tracker::new();
        let all = block.all_pages();

        block
            .make_resident(&ctx, GPU_A, &all, MakeResidentCause::Fault, &mut tracker)
            .unwrap();
        block
            .map(&ctx, GPU_B, &all, Prot::Read, MapRemoteCause::AccessedBy, &mut tracker)
            .unwrap();
        assert!(block.mapped_on(GPU_B).is_empty());
    }

    #[test]
    fn test_read_duplication_round_trip() {
        let mut fx = Fixture::new();
        fx.policy.accessed_by.set(GPU_B);
        let mut block = block();
        let mut tracker = Tracker::new();
        let all = block.all_pages();

        {
            let ctx = fx.ctx();
            block
                .make_resident(&ctx, ProcessorId::CPU, &all, MakeResidentCause::Fault, &mut tracker)
                .unwrap();
            block.set_accessed_by_locked(&ctx, GPU_B, &all, &mut tracker).unwrap();
        }
        assert_eq!(block.mapped_on(GPU_B), all);

        fx.policy.read_duplication = crate::va::policy::ReadDuplication::Enabled;
        block.set_read_duplication(&fx.ctx(), &all, &mut tracker).unwrap();
        assert_eq!(block.resident_on(GPU_B), all);
        assert_eq!(block.resident_on(ProcessorId::CPU), all);
        assert_eq!(block.read_duplicated(), all);
        assert_eq!(block.mapping(GPU_B, block.start()), Some(Prot::Read));

        fx.policy.read_duplication = crate::va::policy::ReadDuplication::Disabled;
        block.unset_read_duplication(&fx.ctx(), &all, &mut tracker).unwrap();
        assert_eq!(block.resident_on(ProcessorId::CPU), all);
        assert!(block.resident_on(GPU_B).is_empty());
        assert!(block.read_duplicated().is_empty());
        assert_eq!(block.mapping(GPU_B, block.start()), Some(Prot::ReadWrite));
    }

    #[test]
    fn test_set_preferred_location_unmaps_remote_only() {
        let mut fx = Fixture::new();
        let mut block = block();
        let mut tracker = Tracker::new();
        let all = block.all_pages();
        {
            let ctx = fx.ctx();
            block
                .make_resident(&ctx, ProcessorId::CPU, &all, MakeResidentCause::Fault, &mut tracker)
                .unwrap();
            block
                .map(&ctx, ProcessorId::CPU, &all, Prot::ReadWrite, MapRemoteCause::Coherence, &mut tracker)
                .unwrap();
            block
                .map(&ctx, GPU_A, &all, Prot::ReadWrite, MapRemoteCause::AccessedBy, &mut tracker)
                .unwrap();
        }

        fx.policy.set_preferred_location(Some(ProcessorId::CPU), Some(0));
        block
            .set_preferred_location_locked(&fx.ctx(), &all, &mut tracker)
            .unwrap();
        assert!(block.mapped_on(GPU_A).is_empty());
        assert_eq!(block.mapped_on(ProcessorId::CPU), all);
        assert_eq!(block.resident_on(ProcessorId::CPU), all);
    }

    #[test]
    fn test_split_partitions_state() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut block = block();
        let mut tracker = Tracker::new();
        let all = block.all_pages();
        block
            .make_resident(&ctx, GPU_A, &all, MakeResidentCause::Fault, &mut tracker)
            .unwrap();

        let upper = block.split(block.start() + 2 * PAGE_SIZE - 1);
        assert_eq!(block.resident_on(GPU_A).count(), 2);
        assert_eq!(upper.resident_on(GPU_A).count(), 2);
        assert_eq!(upper.start(), VA_BLOCK_SIZE + 2 * PAGE_SIZE);
        assert_eq!(upper.page_index(upper.start()), 2);
        assert!(block.resident_on(GPU_A).and(&upper.resident_on(GPU_A)).is_empty());
    }

    #[test]
    fn test_evict_processor() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut block = block();
        let mut tracker = Tracker::new();
        let all = block.all_pages();
        block
            .make_resident(&ctx, GPU_A, &all, MakeResidentCause::Fault, &mut tracker)
            .unwrap();
        block
            .map(&ctx, GPU_A, &all, Prot::ReadWrite, MapRemoteCause::Coherence, &mut tracker)
            .unwrap();

        block.evict_processor(&ctx, GPU_A, &mut tracker).unwrap();
        assert!(block.resident_on(GPU_A).is_empty());
        assert!(block.mapped_on(GPU_A).is_empty());
        assert_eq!(block.resident_on(ProcessorId::CPU), all);
    }

    #[test]
    fn test_block_lock_records_order() {
        let block = VaBlock::new(0, PAGE_SIZE - 1, 0);
        let guard = block.lock();
        assert!(crate::lock::LockTracker::is_held(LockOrder::VaBlock));
        drop(guard);
        assert_eq!(block.end(), PAGE_SIZE - 1);
    }
}
