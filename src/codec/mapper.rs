//! Old-to-new ordinal mapping applied while writing a graph.

use crate::graph::OnHeapGraph;
use crate::store::NO_ORDINAL;

/// Renumbering from in-memory node ids ("old") to persisted ordinals ("new").
pub trait OrdinalMapper: Send + Sync {
    /// Largest persisted ordinal, or `None` for an empty graph.
    fn max_ordinal(&self) -> Option<u32>;

    fn old_to_new(&self, old: u32) -> Option<u32>;

    /// `None` marks an omitted slot.
    fn new_to_old(&self, new: u32) -> Option<u32>;
}

/// Keeps node ids as they are. Slots whose node is absent are written as
/// omitted records.
#[derive(Debug, Clone, Copy)]
pub struct IdentityMapper {
    max_ordinal: Option<u32>,
}

impl IdentityMapper {
    pub fn new(max_ordinal: Option<u32>) -> Self {
        Self { max_ordinal }
    }

    /// Identity up to the largest node present in `graph`.
    pub fn for_graph(graph: &OnHeapGraph) -> Self {
        Self::new(graph.nodes_at_level(0).last().copied())
    }
}

impl OrdinalMapper for IdentityMapper {
    fn max_ordinal(&self) -> Option<u32> {
        self.max_ordinal
    }

    fn old_to_new(&self, old: u32) -> Option<u32> {
        self.max_ordinal.filter(|&max| old <= max).map(|_| old)
    }

    fn new_to_old(&self, new: u32) -> Option<u32> {
        self.old_to_new(new)
    }
}

/// Packs the present nodes of a graph into `[0, size)` in ascending id order.
#[derive(Debug, Clone)]
pub struct SequentialMapper {
    old_to_new: Vec<u32>,
    new_to_old: Vec<u32>,
}

impl SequentialMapper {
    pub fn for_graph(graph: &OnHeapGraph) -> Self {
        let mut old_to_new = vec![NO_ORDINAL; graph.capacity()];
        let new_to_old = graph.nodes_at_level(0);
        for (new, &old) in new_to_old.iter().enumerate() {
            old_to_new[old as usize] = new as u32;
        }
        Self {
            old_to_new,
            new_to_old,
        }
    }

    /// `new_to_old[new]` for every persisted ordinal.
    pub fn new_to_old_table(&self) -> &[u32] {
        &self.new_to_old
    }
}

impl OrdinalMapper for SequentialMapper {
    fn max_ordinal(&self) -> Option<u32> {
        (self.new_to_old.len() as u32).checked_sub(1)
    }

    fn old_to_new(&self, old: u32) -> Option<u32> {
        self.old_to_new
            .get(old as usize)
            .copied()
            .filter(|&n| n != NO_ORDINAL)
    }

    fn new_to_old(&self, new: u32) -> Option<u32> {
        self.new_to_old.get(new as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use crate::graph::DiversityPolicy;

    fn sparse_graph() -> OnHeapGraph {
        let g = OnHeapGraph::new(10, GraphConfig::default(), DiversityPolicy::default());
        for n in [1, 4, 7] {
            g.add_node(n, 0).unwrap();
        }
        g
    }

    #[test]
    fn identity_stops_at_last_present_node() {
        let m = IdentityMapper::for_graph(&sparse_graph());
        assert_eq!(m.max_ordinal(), Some(7));
        assert_eq!(m.old_to_new(4), Some(4));
        assert_eq!(m.old_to_new(8), None);
    }

    #[test]
    fn sequential_packs_present_nodes() {
        let m = SequentialMapper::for_graph(&sparse_graph());
        assert_eq!(m.max_ordinal(), Some(2));
        assert_eq!(m.old_to_new(7), Some(2));
        assert_eq!(m.old_to_new(3), None);
        assert_eq!(m.new_to_old(1), Some(4));
        assert_eq!(m.new_to_old(3), None);
    }

    #[test]
    fn empty_graph_has_no_ordinals() {
        let g = OnHeapGraph::new(3, GraphConfig::default(), DiversityPolicy::default());
        assert_eq!(SequentialMapper::for_graph(&g).max_ordinal(), None);
        assert_eq!(IdentityMapper::for_graph(&g).max_ordinal(), None);
    }
}
