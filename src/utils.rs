#![allow(clippy::cast_possible_truncation)]

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

pub const VA_BLOCK_SHIFT: u32 = 21;
pub const VA_BLOCK_SIZE: u64 = 1 << VA_BLOCK_SHIFT;

/// Pages covered by one fully populated VA block.
pub const PAGES_PER_VA_BLOCK: usize = (VA_BLOCK_SIZE / PAGE_SIZE) as usize;

#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[must_use]
pub const fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}

#[must_use]
pub const fn page_aligned(value: u64) -> bool {
    is_aligned(value, PAGE_SIZE)
}

#[must_use]
pub const fn va_block_align_down(addr: u64) -> u64 {
    align_down(addr, VA_BLOCK_SIZE)
}

/// Aligns an inclusive end address up to the next block boundary (exclusive).
#[must_use]
pub const fn va_block_align_up(inclusive_end: u64) -> u64 {
    align_up(inclusive_end + 1, VA_BLOCK_SIZE)
}

/// Rejects spans that are empty, unaligned or that wrap the address space.
#[must_use]
pub const fn api_range_invalid(base: u64, length: u64) -> bool {
    if length == 0 || !page_aligned(base) || !page_aligned(length) {
        return true;
    }
    base.checked_add(length).is_none()
}

/// Index of the page containing `addr` relative to `start` (both within a block).
#[must_use]
pub const fn page_index(start: u64, addr: u64) -> usize {
    ((addr - start) >> PAGE_SHIFT) as usize
}
