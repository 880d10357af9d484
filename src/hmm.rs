//! Policy for pageable memory tracked through the CPU page tables.
//!
//! HMM spans have no VA range objects. Their policy lives in a side tree of
//! nodes, created on demand the first time a policy call touches a span and
//! split at call boundaries the same way managed ranges are.

use crate::error::UvmResult;
use crate::va::policy::{PolicyChange, VaPolicy};
use crate::va::range_tree::{RangeNode, RangeTree, RangeTreeEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HmmPolicyNode {
    node: RangeNode,
    pub policy: VaPolicy,
}

impl RangeTreeEntry for HmmPolicyNode {
    fn node(&self) -> &RangeNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut RangeNode {
        &mut self.node
    }
}

#[derive(Debug, Default)]
pub struct HmmPolicies {
    tree: RangeTree<HmmPolicyNode>,
}

impl HmmPolicies {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Effective policy at `addr`; the default when nothing was set.
    #[must_use]
    pub fn policy_at(&self, addr: u64) -> VaPolicy {
        self.tree
            .find(addr)
            .map_or_else(VaPolicy::new, |node| node.policy)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &HmmPolicyNode> {
        self.tree.iter()
    }

    /// Applies `change` to every byte of `[start, end]`.
    ///
    /// # Errors
    /// Only fails on inconsistent tree state.
    pub fn apply(&mut self, start: u64, end: u64, change: &PolicyChange) -> UvmResult<()> {
        self.fill_holes(start, end)?;

        // Edges are only split when the change would alter the node.
        if let Some((node, policy)) = self.tree.find(start).map(|n| (*n.node(), n.policy)) {
            if node.start < start && change.differs_from(&policy) {
                self.tree
                    .split(node.start, start - 1, |lower, _| Ok(lower.clone()))?;
            }
        }
        if let Some((node, policy)) = self.tree.find(end).map(|n| (*n.node(), n.policy)) {
            if node.end > end && change.differs_from(&policy) {
                self.tree.split(node.start, end, |lower, _| Ok(lower.clone()))?;
            }
        }

        for node in self.tree.iter_in_mut(start, end) {
            change.apply_to(&mut node.policy);
        }
        Ok(())
    }

    fn fill_holes(&mut self, start: u64, end: u64) -> UvmResult<()> {
        let mut addr = start;
        loop {
            let covered_to = match self.tree.find(addr) {
                Some(node) => node.end(),
                None => {
                    let (hole_start, hole_end) = self.tree.find_hole_in(addr, start, end)?;
                    self.tree.add(HmmPolicyNode {
                        node: RangeNode::new(hole_start, hole_end),
                        policy: VaPolicy::new(),
                    })?;
                    hole_end
                }
            };
            match covered_to.checked_add(1) {
                Some(next) if next <= end => addr = next,
                _ => return Ok(()),
            }
        }
    }

    /// Drops policy for `[start, end]` so a VA range can take the span over.
    ///
    /// # Errors
    /// Only fails on inconsistent tree state.
    pub fn reclaim(&mut self, start: u64, end: u64) -> UvmResult<()> {
        for key in self.tree.keys_in(start, end) {
            let Some(node) = self.tree.get(key).map(|n| *n.node()) else {
                continue;
            };
            let key = if node.start < start {
                self.tree
                    .split(node.start, start - 1, |lower, _| Ok(lower.clone()))?;
                start
            } else {
                key
            };
            if node.end > end {
                self.tree.split(key, end, |lower, _| Ok(lower.clone()))?;
            }
            self.tree.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ProcessorId;
    use crate::va::policy::ReadDuplication;

    fn spans(policies: &HmmPolicies) -> Vec<(u64, u64)> {
        policies.nodes().map(|n| (n.start(), n.end())).collect()
    }

    #[test]
    fn test_apply_creates_and_splits_nodes() {
        let mut policies = HmmPolicies::new();
        policies
            .apply(0x0, 0x2fff, &PolicyChange::ReadDuplication(ReadDuplication::Enabled))
            .unwrap();
        assert_eq!(spans(&policies), vec![(0x0, 0x2fff)]);

        let change = PolicyChange::AccessedBy {
            processor: ProcessorId::gpu(0),
            set: true,
        };
        policies.apply(0x1000, 0x3fff, &change).unwrap();
        assert_eq!(
            spans(&policies),
            vec![(0x0, 0xfff), (0x1000, 0x2fff), (0x3000, 0x3fff)]
        );

        let first = policies.policy_at(0x0);
        assert!(first.read_duplication_enabled());
        assert!(first.accessed_by.is_empty());

        let middle = policies.policy_at(0x1000);
        assert!(middle.read_duplication_enabled());
        assert!(middle.accessed_by.test(ProcessorId::gpu(0)));

        let last = policies.policy_at(0x3000);
        assert_eq!(last.read_duplication, ReadDuplication::Unset);
        assert!(last.accessed_by.test(ProcessorId::gpu(0)));

        assert_eq!(policies.policy_at(0x9000), VaPolicy::new());
    }

    #[test]
    fn test_apply_without_effect_keeps_nodes_whole() {
        let mut policies = HmmPolicies::new();
        let enable = PolicyChange::ReadDuplication(ReadDuplication::Enabled);
        policies.apply(0x0, 0x3fff, &enable).unwrap();

        policies.apply(0x1000, 0x1fff, &enable).unwrap();
        assert_eq!(spans(&policies), vec![(0x0, 0x3fff)]);

        let unset = PolicyChange::AccessedBy {
            processor: ProcessorId::gpu(1),
            set: false,
        };
        policies.apply(0x2000, 0x2fff, &unset).unwrap();
        assert_eq!(spans(&policies), vec![(0x0, 0x3fff)]);
        assert!(policies.policy_at(0x2000).read_duplication_enabled());
    }

    #[test]
    fn test_reclaim_trims_overlapping_nodes() {
        let mut policies = HmmPolicies::new();
        policies
            .apply(0x0, 0x3fff, &PolicyChange::ReadDuplication(ReadDuplication::Disabled))
            .unwrap();

        policies.reclaim(0x1000, 0x1fff).unwrap();
        assert_eq!(spans(&policies), vec![(0x0, 0xfff), (0x2000, 0x3fff)]);

        policies.reclaim(0x0, 0xffff).unwrap();
        assert!(policies.is_empty());
    }
}
