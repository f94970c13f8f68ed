//! The three ordinal spaces of a merge.
//!
//! - **global**: every source's ordinals concatenated, `base[source] + local`.
//! - **graph-node**: the leading source's ordinals kept as they are, followed by
//!   one appended ordinal per live vector of every other source. Used when the
//!   leading graph is extended in place.
//! - **compact**: only live vectors, densely packed in global order. Used when
//!   the graph is rebuilt.
//!
//! Each space has its own newtype so ordinals from different spaces cannot be
//! mixed up; every conversion is checked.

use crate::error::{IndexError, Result};
use crate::store::NO_ORDINAL;
use roaring::RoaringBitmap;
use std::sync::Arc;

macro_rules! ordinal_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u32);

        impl $name {
            #[inline]
            pub fn new(ord: u32) -> Self {
                Self(ord)
            }

            #[inline]
            pub fn get(self) -> u32 {
                self.0
            }
        }
    };
}

ordinal_type!(
    /// Ordinal in the concatenation of all sources.
    GlobalOrd
);
ordinal_type!(
    /// Node id of the extended leading graph.
    GraphNodeOrd
);
ordinal_type!(
    /// Ordinal among live vectors only.
    CompactOrd
);

/// Global and compact spaces of one merged field.
#[derive(Debug, Clone)]
pub struct OrdinalSpaces {
    bases: Vec<u32>,
    slots: Vec<u32>,
    /// Live local ordinals per source.
    live: Vec<RoaringBitmap>,
    leading: usize,
    compact_to_global: Vec<u32>,
    global_to_compact: Vec<u32>,
}

impl OrdinalSpaces {
    /// `slots[i]` is the ordinal upper bound of source `i`, `live[i]` its live
    /// local ordinals. `limit` bounds the compact space.
    pub fn new(slots: &[u32], live: Vec<RoaringBitmap>, leading: usize, limit: u64) -> Result<Self> {
        if slots.len() != live.len() || leading >= slots.len().max(1) {
            return Err(IndexError::integrity(format!(
                "{} sources, {} live sets, leading source {leading}",
                slots.len(),
                live.len()
            )));
        }
        let mut bases = Vec::with_capacity(slots.len());
        let mut total: u64 = 0;
        for (i, (&n, set)) in slots.iter().zip(&live).enumerate() {
            if set.max().is_some_and(|m| m >= n) {
                return Err(IndexError::integrity(format!(
                    "source {i} marks ordinal {} live but has only {n} slots",
                    set.max().unwrap_or_default()
                )));
            }
            bases.push(total as u32);
            total += u64::from(n);
            if total >= u64::from(NO_ORDINAL) {
                return Err(IndexError::Capacity {
                    required: total,
                    limit: u64::from(NO_ORDINAL) - 1,
                });
            }
        }

        let live_total: u64 = live.iter().map(RoaringBitmap::len).sum();
        if live_total > limit {
            return Err(IndexError::Capacity {
                required: live_total,
                limit,
            });
        }
        let mut compact_to_global = Vec::with_capacity(live_total as usize);
        let mut global_to_compact = vec![NO_ORDINAL; total as usize];
        for (set, &base) in live.iter().zip(&bases) {
            for local in set {
                let global = base + local;
                global_to_compact[global as usize] = compact_to_global.len() as u32;
                compact_to_global.push(global);
            }
        }

        Ok(Self {
            bases,
            slots: slots.to_vec(),
            live,
            leading,
            compact_to_global,
            global_to_compact,
        })
    }

    pub fn num_sources(&self) -> usize {
        self.slots.len()
    }

    pub fn leading(&self) -> usize {
        self.leading
    }

    /// Size of the global space.
    pub fn global_len(&self) -> usize {
        self.global_to_compact.len()
    }

    /// Number of live vectors.
    pub fn compact_len(&self) -> usize {
        self.compact_to_global.len()
    }

    pub fn live_count(&self, source: usize) -> u64 {
        self.live.get(source).map_or(0, RoaringBitmap::len)
    }

    /// Global ordinal of `local` in `source`.
    pub fn global(&self, source: usize, local: u32) -> Result<GlobalOrd> {
        match (self.bases.get(source), self.slots.get(source)) {
            (Some(&base), Some(&n)) if local < n => Ok(GlobalOrd(base + local)),
            _ => Err(IndexError::integrity(format!(
                "ordinal {local} is outside source {source}"
            ))),
        }
    }

    /// Source and local ordinal of a global ordinal.
    pub fn locate(&self, global: GlobalOrd) -> Result<(usize, u32)> {
        if global.0 as usize >= self.global_len() {
            return Err(IndexError::integrity(format!(
                "global ordinal {} outside [0, {})",
                global.0,
                self.global_len()
            )));
        }
        let source = self.source_of(global.0);
        Ok((source, global.0 - self.bases[source]))
    }

    /// Owner of an in-range global ordinal. An empty source shares its base
    /// with the next source, so the last base not above `global` wins.
    fn source_of(&self, global: u32) -> usize {
        self.bases.partition_point(|&b| b <= global) - 1
    }

    pub fn is_live(&self, global: GlobalOrd) -> bool {
        self.to_compact(global).is_some()
    }

    pub fn to_compact(&self, global: GlobalOrd) -> Option<CompactOrd> {
        match self.global_to_compact.get(global.0 as usize) {
            Some(&c) if c != NO_ORDINAL => Some(CompactOrd(c)),
            _ => None,
        }
    }

    pub fn compact_to_global(&self, compact: CompactOrd) -> Result<GlobalOrd> {
        self.compact_to_global
            .get(compact.0 as usize)
            .map(|&g| GlobalOrd(g))
            .ok_or_else(|| {
                IndexError::integrity(format!(
                    "compact ordinal {} outside [0, {})",
                    compact.0,
                    self.compact_len()
                ))
            })
    }

    /// `table[compact] = global`, for re-addressing the merged vector view.
    pub fn compact_table(&self) -> Arc<[u32]> {
        self.compact_to_global.as_slice().into()
    }

    /// Global ordinals of the live vectors of every source except `excluded`.
    pub fn live_globals_except(&self, excluded: usize) -> Vec<u32> {
        self.compact_to_global
            .iter()
            .copied()
            .filter(|&g| self.source_of(g) != excluded)
            .collect()
    }

    /// Lay out the graph-node space over the leading source.
    ///
    /// Fails with [`IndexError::Capacity`] as soon as the appended ordinals
    /// would reach `limit`; nothing is truncated.
    pub fn graph_node_space(&self, limit: u64) -> Result<GraphNodeSpace> {
        let leading = self.leading;
        let Some(&leading_slots) = self.slots.get(leading) else {
            return Err(IndexError::integrity("merge has no sources"));
        };
        let appended_total: u64 = (0..self.num_sources())
            .filter(|&s| s != leading)
            .map(|s| self.live_count(s))
            .sum();
        let required = u64::from(leading_slots) + appended_total;

        if u64::from(leading_slots) > limit {
            return Err(IndexError::Capacity { required, limit });
        }

        let mut graph_to_global: Vec<u32> = Vec::with_capacity(required as usize);
        let base = self.bases[leading];
        graph_to_global.extend((0..leading_slots).map(|local| base + local));
        for source in (0..self.num_sources()).filter(|&s| s != leading) {
            for local in &self.live[source] {
                if graph_to_global.len() as u64 >= limit {
                    return Err(IndexError::Capacity { required, limit });
                }
                graph_to_global.push(self.bases[source] + local);
            }
        }
        let mut global_to_graph = vec![NO_ORDINAL; self.global_len()];
        for (node, &global) in graph_to_global.iter().enumerate() {
            global_to_graph[global as usize] = node as u32;
        }
        Ok(GraphNodeSpace {
            leading_slots,
            graph_to_global,
            global_to_graph,
        })
    }
}

/// Node ids of an extended leading graph.
#[derive(Debug, Clone)]
pub struct GraphNodeSpace {
    leading_slots: u32,
    graph_to_global: Vec<u32>,
    global_to_graph: Vec<u32>,
}

impl GraphNodeSpace {
    /// Node ids `[0, capacity)` are addressable.
    pub fn capacity(&self) -> usize {
        self.graph_to_global.len()
    }

    /// Node ids below this come from the leading source.
    pub fn leading_slots(&self) -> u32 {
        self.leading_slots
    }

    pub fn to_global(&self, node: GraphNodeOrd) -> Result<GlobalOrd> {
        self.graph_to_global
            .get(node.0 as usize)
            .map(|&g| GlobalOrd(g))
            .ok_or_else(|| {
                IndexError::integrity(format!(
                    "graph node {} outside [0, {})",
                    node.0,
                    self.capacity()
                ))
            })
    }

    pub fn from_global(&self, global: GlobalOrd) -> Option<GraphNodeOrd> {
        match self.global_to_graph.get(global.0 as usize) {
            Some(&n) if n != NO_ORDINAL => Some(GraphNodeOrd(n)),
            _ => None,
        }
    }

    /// Node ids given to the other sources' live vectors.
    pub fn appended(&self) -> impl Iterator<Item = GraphNodeOrd> {
        (self.leading_slots..self.graph_to_global.len() as u32).map(GraphNodeOrd)
    }

    /// `table[node] = global`, for re-addressing the merged vector view.
    pub fn global_table(&self) -> Arc<[u32]> {
        self.graph_to_global.as_slice().into()
    }
}
