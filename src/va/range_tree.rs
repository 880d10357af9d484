//! Ordered, non-overlapping interval tree.
//!
//! Entries carry their own inclusive `[start, end]` bounds through
//! [`RangeTreeEntry`] and are keyed by `start`, which gives ordered neighbor
//! traversal for free. Bounds must only change through the tree's own
//! mutation methods (`split`, `shrink_node`, `merge_*`) so keys stay in sync.

use crate::error::{UvmError, UvmResult};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Inclusive bounds of one tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RangeNode {
    pub start: u64,
    pub end: u64,
}

impl RangeNode {
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr <= self.end
    }

    #[must_use]
    pub const fn intersects(&self, start: u64, end: u64) -> bool {
        self.start <= end && start <= self.end
    }
}

pub trait RangeTreeEntry {
    fn node(&self) -> &RangeNode;
    fn node_mut(&mut self) -> &mut RangeNode;

    fn start(&self) -> u64 {
        self.node().start
    }

    fn end(&self) -> u64 {
        self.node().end
    }
}

impl RangeTreeEntry for RangeNode {
    fn node(&self) -> &RangeNode {
        self
    }

    fn node_mut(&mut self) -> &mut RangeNode {
        self
    }
}

#[derive(Debug)]
pub struct RangeTree<T> {
    entries: BTreeMap<u64, T>,
}

impl<T> Default for RangeTree<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: RangeTreeEntry> RangeTree<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Inserts `entry`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for inverted bounds and `AddressInUse` if the
    /// span intersects an existing entry.
    pub fn add(&mut self, entry: T) -> UvmResult<&mut T> {
        let RangeNode { start, end } = *entry.node();
        if start > end {
            return Err(UvmError::InvalidArgument(format!(
                "inverted range [0x{start:x}, 0x{end:x}]"
            )));
        }
        if self.iter_first(start, end).is_some() {
            return Err(UvmError::AddressInUse { start, end });
        }
        Ok(self.entries.entry(start).or_insert(entry))
    }

    /// Removes the entry starting exactly at `start`.
    pub fn remove(&mut self, start: u64) -> Option<T> {
        self.entries.remove(&start)
    }

    #[must_use]
    pub fn get(&self, start: u64) -> Option<&T> {
        self.entries.get(&start)
    }

    pub fn get_mut(&mut self, start: u64) -> Option<&mut T> {
        self.entries.get_mut(&start)
    }

    /// Returns the entry containing `addr`.
    #[must_use]
    pub fn find(&self, addr: u64) -> Option<&T> {
        self.entries
            .range(..=addr)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| e.end() >= addr)
    }

    pub fn find_mut(&mut self, addr: u64) -> Option<&mut T> {
        self.entries
            .range_mut(..=addr)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| e.end() >= addr)
    }

    /// First entry intersecting `[start, end]`.
    #[must_use]
    pub fn iter_first(&self, start: u64, end: u64) -> Option<&T> {
        if let Some(entry) = self.find(start) {
            return Some(entry);
        }
        if start > end {
            return None;
        }
        self.entries.range(start..=end).next().map(|(_, e)| e)
    }

    /// Entry following `current` if it still starts at or before `end`.
    #[must_use]
    pub fn iter_next(&self, current: &T, end: u64) -> Option<&T> {
        self.next(current).filter(|e| e.start() <= end)
    }

    #[must_use]
    pub fn next(&self, current: &T) -> Option<&T> {
        self.entries
            .range((Bound::Excluded(current.start()), Bound::Unbounded))
            .next()
            .map(|(_, e)| e)
    }

    #[must_use]
    pub fn prev(&self, current: &T) -> Option<&T> {
        self.entries
            .range(..current.start())
            .next_back()
            .map(|(_, e)| e)
    }

    #[must_use]
    pub fn first(&self) -> Option<&T> {
        self.entries.values().next()
    }

    #[must_use]
    pub fn last(&self) -> Option<&T> {
        self.entries.values().next_back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.values_mut()
    }

    /// Ascending traversal of every entry intersecting `[start, end]`.
    pub fn iter_in(&self, start: u64, end: u64) -> RangeTreeIter<'_, T> {
        RangeTreeIter {
            tree: self,
            next: self.iter_first(start, end),
            end,
            contig: false,
        }
    }

    /// Like [`RangeTree::iter_in`], but starts only at an entry containing
    /// `start` and stops at the first hole.
    pub fn iter_in_contig(&self, start: u64, end: u64) -> RangeTreeIter<'_, T> {
        RangeTreeIter {
            tree: self,
            next: self.find(start),
            end,
            contig: true,
        }
    }

    pub fn iter_in_mut(&mut self, start: u64, end: u64) -> impl Iterator<Item = &mut T> {
        let first = self.iter_first(start, end).map_or(u64::MAX, T::start);
        self.entries
            .range_mut(first..)
            .map(|(_, e)| e)
            .take_while(move |e| e.start() <= end)
    }

    /// Start keys of every entry intersecting `[start, end]`.
    ///
    /// Snapshotting keys lets callers mutate or remove entries while walking.
    #[must_use]
    pub fn keys_in(&self, start: u64, end: u64) -> Vec<u64> {
        self.iter_in(start, end).map(T::start).collect()
    }

    /// Whether no entry intersects `[start, end]`.
    #[must_use]
    pub fn range_empty(&self, start: u64, end: u64) -> bool {
        self.iter_first(start, end).is_none()
    }

    /// Splits the entry at `start` so it ends at `new_end`.
    ///
    /// `make_upper` receives the existing entry, still with its old bounds, and
    /// the bounds of the new upper entry. If it fails, the tree is unchanged.
    ///
    /// # Errors
    /// `InvalidAddress` if no entry starts at `start` or `new_end` is not strictly
    /// inside it; otherwise whatever `make_upper` returns.
    pub fn split<F>(&mut self, start: u64, new_end: u64, make_upper: F) -> UvmResult<()>
    where
        F: FnOnce(&mut T, RangeNode) -> UvmResult<T>,
    {
        let existing = self.entries.get_mut(&start).ok_or(UvmError::InvalidAddress)?;
        let old_end = existing.end();
        if new_end < start || new_end >= old_end {
            return Err(UvmError::InvalidAddress);
        }

        let upper_node = RangeNode::new(new_end + 1, old_end);
        let mut upper = make_upper(existing, upper_node)?;
        existing.node_mut().end = new_end;
        *upper.node_mut() = upper_node;
        self.entries.insert(upper_node.start, upper);
        Ok(())
    }

    /// Shrinks the entry at `start` to `[new_start, new_end]`.
    ///
    /// # Errors
    /// `InvalidAddress` if no entry starts at `start` or the new bounds are not
    /// inside the old ones.
    pub fn shrink_node(&mut self, start: u64, new_start: u64, new_end: u64) -> UvmResult<()> {
        let node = *self.entries.get(&start).ok_or(UvmError::InvalidAddress)?.node();
        if new_start < node.start || new_end > node.end || new_start > new_end {
            return Err(UvmError::InvalidAddress);
        }
        let mut entry = self.entries.remove(&start).ok_or(UvmError::InvalidAddress)?;
        *entry.node_mut() = RangeNode::new(new_start, new_end);
        self.entries.insert(new_start, entry);
        Ok(())
    }

    /// Absorbs the directly adjacent previous entry into the entry at `start`.
    ///
    /// Returns the removed entry, or `None` if the previous entry is not
    /// adjacent. The merged entry is keyed by the previous entry's start.
    pub fn merge_prev(&mut self, start: u64) -> Option<T> {
        let current = self.entries.get(&start)?;
        let prev_start = self.prev(current)?.start();
        if self.entries.get(&prev_start)?.end().checked_add(1) != Some(start) {
            return None;
        }
        let prev = self.entries.remove(&prev_start)?;
        let mut entry = self.entries.remove(&start)?;
        entry.node_mut().start = prev_start;
        self.entries.insert(prev_start, entry);
        Some(prev)
    }

    /// Absorbs the directly adjacent next entry into the entry at `start`.
    pub fn merge_next(&mut self, start: u64) -> Option<T> {
        let current = self.entries.get(&start)?;
        let current_end = current.end();
        let next_start = self.next(current)?.start();
        if current_end.checked_add(1) != Some(next_start) {
            return None;
        }
        let next = self.entries.remove(&next_start)?;
        if let Some(entry) = self.entries.get_mut(&start) {
            entry.node_mut().end = next.end();
        }
        Some(next)
    }

    /// Returns the bounds of the unoccupied hole containing `addr`.
    ///
    /// # Errors
    /// `AddressInUse` if `addr` lies inside an entry.
    pub fn find_hole(&self, addr: u64) -> UvmResult<(u64, u64)> {
        if let Some(entry) = self.find(addr) {
            return Err(UvmError::AddressInUse {
                start: entry.start(),
                end: entry.end(),
            });
        }
        let hole_start = self
            .entries
            .range(..addr)
            .next_back()
            .map_or(0, |(_, e)| e.end() + 1);
        let hole_end = self
            .entries
            .range((Bound::Excluded(addr), Bound::Unbounded))
            .next()
            .map_or(u64::MAX, |(_, e)| e.start() - 1);
        Ok((hole_start, hole_end))
    }

    /// Like [`RangeTree::find_hole`] but clamped to `[start, end]`.
    ///
    /// # Errors
    /// `InvalidArgument` if `addr` is outside `[start, end]`, otherwise the same
    /// as `find_hole`.
    pub fn find_hole_in(&self, addr: u64, start: u64, end: u64) -> UvmResult<(u64, u64)> {
        if addr < start || addr > end {
            return Err(UvmError::InvalidArgument(format!(
                "0x{addr:x} outside [0x{start:x}, 0x{end:x}]"
            )));
        }
        let (hole_start, hole_end) = self.find_hole(addr)?;
        Ok((hole_start.max(start), hole_end.min(end)))
    }
}

pub struct RangeTreeIter<'a, T> {
    tree: &'a RangeTree<T>,
    next: Option<&'a T>,
    end: u64,
    contig: bool,
}

impl<'a, T: RangeTreeEntry> Iterator for RangeTreeIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let current = self.next.take()?;
        self.next = self.tree.iter_next(current, self.end);
        if self.contig {
            if let Some(next) = self.next {
                if current.end().checked_add(1) != Some(next.start()) {
                    self.next = None;
                }
            }
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn tree_of(spans: &[(u64, u64)]) -> RangeTree<RangeNode> {
        let mut tree = RangeTree::new();
        for &(start, end) in spans {
            tree.add(RangeNode::new(start, end)).unwrap();
        }
        tree
    }

    fn assert_no_overlap(tree: &RangeTree<RangeNode>) {
        let nodes: Vec<_> = tree.iter().copied().collect();
        for pair in nodes.windows(2) {
            assert!(pair[0].start <= pair[0].end);
            assert!(pair[0].end < pair[1].start, "{pair:?} overlap");
        }
    }

    #[test]
    fn test_add_rejects_overlap() {
        let mut tree = tree_of(&[(0x1000, 0x1fff), (0x4000, 0x4fff)]);
        assert_eq!(
            tree.add(RangeNode::new(0x1fff, 0x2fff)).unwrap_err(),
            UvmError::AddressInUse {
                start: 0x1fff,
                end: 0x2fff
            }
        );
        assert!(tree.add(RangeNode::new(0x0, 0x5fff)).is_err());
        assert!(tree.add(RangeNode::new(0x2000, 0x3fff)).is_ok());
        assert!(tree.add(RangeNode::new(0x9000, 0x8000)).is_err());
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_find() {
        let tree = tree_of(&[(0x1000, 0x1fff), (0x3000, 0x3fff)]);
        assert_eq!(tree.find(0x1000).unwrap().start, 0x1000);
        assert_eq!(tree.find(0x1fff).unwrap().start, 0x1000);
        assert!(tree.find(0x2000).is_none());
        assert!(tree.find(0x0).is_none());
        assert_eq!(tree.find(0x3abc).unwrap().end, 0x3fff);
        assert!(tree.find(u64::MAX).is_none());
    }

    #[test]
    fn test_iteration_stops_past_end() {
        let tree = tree_of(&[(0x0, 0xfff), (0x2000, 0x2fff), (0x4000, 0x4fff)]);
        let starts: Vec<_> = tree.iter_in(0x800, 0x2000).map(|n| n.start).collect();
        assert_eq!(starts, vec![0x0, 0x2000]);

        let first = tree.iter_first(0x1000, 0x1fff);
        assert!(first.is_none());

        let first = tree.iter_first(0x1000, 0x4000).unwrap();
        assert_eq!(first.start, 0x2000);
        let next = tree.iter_next(first, 0x4000).unwrap();
        assert_eq!(next.start, 0x4000);
        assert!(tree.iter_next(next, 0x4000).is_none());
    }

    #[test]
    fn test_contig_iteration_stops_at_hole() {
        let tree = tree_of(&[(0x0, 0xfff), (0x1000, 0x1fff), (0x3000, 0x3fff)]);
        let starts: Vec<_> = tree
            .iter_in_contig(0x0, 0x3fff)
            .map(|n| n.start)
            .collect();
        assert_eq!(starts, vec![0x0, 0x1000]);
        assert_eq!(tree.iter_in_contig(0x2000, 0x3fff).count(), 0);
    }

    #[test]
    fn test_split_and_merge() {
        let mut tree = tree_of(&[(0x0, 0x2fff)]);
        tree.split(0x0, 0xfff, |_, upper| Ok(upper)).unwrap();
        tree.split(0x1000, 0x1fff, |_, upper| Ok(upper)).unwrap();
        let nodes: Vec<_> = tree.iter().map(|n| (n.start, n.end)).collect();
        assert_eq!(nodes, vec![(0x0, 0xfff), (0x1000, 0x1fff), (0x2000, 0x2fff)]);

        assert!(tree.split(0x0, 0xfff, |_, upper| Ok(upper)).is_err());
        assert!(
            tree.split(0x1000, 0x1800, |_, _| Err(UvmError::OutOfMemory))
                .is_err()
        );
        assert_eq!(tree.len(), 3);

        assert_eq!(tree.merge_next(0x0).unwrap().start, 0x1000);
        assert_eq!(tree.get(0x0).unwrap().end, 0x1fff);
        assert_eq!(tree.merge_prev(0x2000).unwrap().start, 0x0);
        assert_eq!(tree.get(0x0).unwrap().end, 0x2fff);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_merge_requires_adjacency() {
        let mut tree = tree_of(&[(0x0, 0xfff), (0x2000, 0x2fff)]);
        assert!(tree.merge_next(0x0).is_none());
        assert!(tree.merge_prev(0x2000).is_none());
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_shrink_node() {
        let mut tree = tree_of(&[(0x1000, 0x4fff)]);
        tree.shrink_node(0x1000, 0x2000, 0x3fff).unwrap();
        assert!(tree.get(0x1000).is_none());
        assert_eq!(*tree.get(0x2000).unwrap(), RangeNode::new(0x2000, 0x3fff));
        assert!(tree.shrink_node(0x2000, 0x1000, 0x3fff).is_err());
    }

    #[test]
    fn test_find_hole() {
        let tree = tree_of(&[(0x1000, 0x1fff), (0x4000, 0x4fff)]);
        assert_eq!(tree.find_hole(0x2000).unwrap(), (0x2000, 0x3fff));
        assert_eq!(tree.find_hole(0x0).unwrap(), (0x0, 0xfff));
        assert_eq!(tree.find_hole(0x5000).unwrap(), (0x5000, u64::MAX));
        assert!(matches!(
            tree.find_hole(0x1000),
            Err(UvmError::AddressInUse { .. })
        ));
        assert_eq!(
            tree.find_hole_in(0x3000, 0x2800, 0x3800).unwrap(),
            (0x2800, 0x3800)
        );
        assert!(tree.find_hole_in(0x100, 0x2800, 0x3800).is_err());
    }

    #[test]
    fn test_random_sequences_never_overlap() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut tree = RangeTree::new();

        for _ in 0..2000 {
            let start = rng.gen_range(0..256u64) * 0x1000;
            let pages = rng.gen_range(1..16u64);
            let end = start + pages * 0x1000 - 1;

            match rng.gen_range(0..4) {
                0 | 1 => {
                    let free = tree.range_empty(start, end);
                    assert_eq!(tree.add(RangeNode::new(start, end)).is_ok(), free);
                }
                2 => {
                    if let Some(node) = tree.find(start).copied() {
                        if node.size() > 0x1000 {
                            let cut = node.start + rng.gen_range(1..node.size() / 0x1000) * 0x1000;
                            tree.split(node.start, cut - 1, |_, upper| Ok(upper)).unwrap();
                        }
                    }
                }
                _ => {
                    if let Some(node) = tree.find(start).copied() {
                        tree.remove(node.start);
                    }
                }
            }
            assert_no_overlap(&tree);
        }
    }
}
