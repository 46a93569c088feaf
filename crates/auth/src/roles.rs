use std::collections::{BTreeMap, BTreeSet};

use strata_core::RecordId;

/// Group membership closure over "implied group" edges.
#[derive(Debug, Clone, Default)]
pub struct GroupGraph {
    implied: BTreeMap<RecordId, Vec<RecordId>>,
}

impl GroupGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that membership of `group` implies membership of `implied`.
    pub fn imply(&mut self, group: RecordId, implied: RecordId) {
        self.implied.entry(group).or_default().push(implied);
    }

    /// Every group reachable from `direct`, including `direct` itself.
    ///
    /// Cycles in the implication graph are tolerated.
    pub fn closure(&self, direct: impl IntoIterator<Item = RecordId>) -> BTreeSet<RecordId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<RecordId> = direct.into_iter().collect();
        while let Some(group) = stack.pop() {
            if !seen.insert(group) {
                continue;
            }
            if let Some(next) = self.implied.get(&group) {
                stack.extend(next.iter().copied().filter(|g| !seen.contains(g)));
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_follows_implications_transitively() {
        let mut graph = GroupGraph::new();
        graph.imply(3, 2);
        graph.imply(2, 1);
        graph.imply(1, 3);
        assert_eq!(graph.closure([3]), BTreeSet::from([1, 2, 3]));
        assert_eq!(graph.closure([4]), BTreeSet::from([4]));
    }
}
