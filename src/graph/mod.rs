//! Hierarchical navigable graph.
//!
//! Layer 0 holds every node; each higher layer holds a subset of the one below
//! it. A node's level is drawn once, deterministically from its ordinal and the
//! configured seed, so the same input always yields the same layer structure.
//!
//! [`OnHeapGraph`] is the mutable form used during a build or merge. Its
//! neighbor lists sit behind one lock per node so concurrent inserts touching
//! different nodes never contend. Persisted graphs are read through
//! [`crate::codec::OnDiskGraph`]; both implement [`GraphView`], which is all the
//! search needs.

pub mod builder;
pub mod prune;
pub mod score;
pub mod search;

pub use builder::GraphBuilder;
pub use prune::{select_diverse, DiversityPolicy, VamanaDiversity};
pub use score::{NodeScorer, ScoreProvider};
pub use search::{FilterPredicate, FnFilter, GraphSearcher, NoFilter, NodeScore, SearchResult};

use crate::config::GraphConfig;
use crate::error::{IndexError, Result};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use roaring::RoaringBitmap;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

/// Highest level a node can be assigned.
pub const MAX_LEVEL: usize = 15;

/// Neighbor ids as returned by [`GraphView::neighbors`].
pub type NeighborIds = SmallVec<[u32; 32]>;

/// Edge target with its pruning distance from the source node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub node: u32,
    pub distance: f32,
}

/// The node every search starts from, with its level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryNode {
    pub node: u32,
    pub level: usize,
}

/// Read-only access to a graph's structure.
pub trait GraphView: Send + Sync {
    fn entry_node(&self) -> Option<EntryNode>;

    /// One past the largest node id the graph can hold.
    fn id_upper_bound(&self) -> usize;

    /// Whether `node` is present in layer 0.
    fn contains(&self, node: u32) -> bool;

    /// Marked deleted but not yet cleaned up. Persisted graphs have none.
    fn is_deleted(&self, _node: u32) -> bool {
        false
    }

    /// Outgoing edges of `node` at `level` (empty if the node is not on that layer).
    fn neighbors(&self, level: usize, node: u32) -> Result<NeighborIds>;
}

struct NodeSlot {
    /// -1 while the slot is empty.
    level: AtomicI32,
    edges: Mutex<Vec<Vec<Neighbor>>>,
}

impl NodeSlot {
    fn empty() -> Self {
        Self {
            level: AtomicI32::new(-1),
            edges: Mutex::new(Vec::new()),
        }
    }
}

/// Mutable graph over the fixed id range `[0, capacity)`.
pub struct OnHeapGraph {
    nodes: Vec<NodeSlot>,
    size: AtomicUsize,
    entry: RwLock<Option<EntryNode>>,
    deleted: RwLock<RoaringBitmap>,
    config: GraphConfig,
    diversity: DiversityPolicy,
}

impl OnHeapGraph {
    pub fn new(capacity: usize, config: GraphConfig, diversity: DiversityPolicy) -> Self {
        Self {
            nodes: (0..capacity).map(|_| NodeSlot::empty()).collect(),
            size: AtomicUsize::new(0),
            entry: RwLock::new(None),
            deleted: RwLock::new(RoaringBitmap::new()),
            config,
            diversity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Number of nodes present (deleted nodes included until cleanup).
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn diversity(&self) -> &DiversityPolicy {
        &self.diversity
    }

    pub fn diversity_mut(&mut self) -> &mut DiversityPolicy {
        &mut self.diversity
    }

    fn slot(&self, node: u32) -> Result<&NodeSlot> {
        self.nodes.get(node as usize).ok_or_else(|| {
            IndexError::integrity(format!(
                "node {node} out of bounds (capacity {})",
                self.nodes.len()
            ))
        })
    }

    /// Level of `node`, or `None` if absent.
    pub fn level_of(&self, node: u32) -> Option<usize> {
        let level = self.nodes.get(node as usize)?.level.load(Ordering::Acquire);
        (level >= 0).then_some(level as usize)
    }

    /// Claim the slot of `node` with empty edge lists on layers `0..=level`.
    pub fn add_node(&self, node: u32, level: usize) -> Result<()> {
        let slot = self.slot(node)?;
        let mut edges = slot.edges.lock();
        if slot
            .level
            .compare_exchange(-1, level as i32, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(IndexError::illegal_state(format!(
                "node {node} was already inserted"
            )));
        }
        *edges = vec![Vec::new(); level + 1];
        self.size.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Edges of `node` at `level`, with distances.
    pub fn neighbors_with_distance(&self, level: usize, node: u32) -> Result<Vec<Neighbor>> {
        let slot = self.slot(node)?;
        let edges = slot.edges.lock();
        Ok(edges.get(level).cloned().unwrap_or_default())
    }

    /// Replace the edge list of `node` at `level`.
    pub fn set_neighbors(&self, level: usize, node: u32, neighbors: Vec<Neighbor>) -> Result<()> {
        let slot = self.slot(node)?;
        let mut edges = slot.edges.lock();
        let list = edges.get_mut(level).ok_or_else(|| {
            IndexError::integrity(format!("node {node} is not on layer {level}"))
        })?;
        *list = neighbors;
        Ok(())
    }

    /// Add (or refresh) one edge. A list that grows past the overflow degree is
    /// pruned back to the layer's degree bound.
    pub fn add_edge(&self, level: usize, node: u32, neighbor: Neighbor) -> Result<()> {
        self.add_edges(level, node, std::slice::from_ref(&neighbor))
    }

    /// Add (or refresh) several edges under one lock, keeping edges other
    /// inserts added concurrently. Pruned like [`add_edge`](Self::add_edge).
    pub fn add_edges(&self, level: usize, node: u32, neighbors: &[Neighbor]) -> Result<()> {
        let slot = self.slot(node)?;
        let mut edges = slot.edges.lock();
        let list = edges.get_mut(level).ok_or_else(|| {
            IndexError::integrity(format!("node {node} is not on layer {level}"))
        })?;
        for neighbor in neighbors {
            match list.iter_mut().find(|n| n.node == neighbor.node) {
                Some(existing) => existing.distance = neighbor.distance,
                None => list.push(*neighbor),
            }
        }
        if list.len() > self.config.overflow_degree() {
            *list = self
                .diversity
                .retain_diverse(list, self.config.max_degree_for_layer(level))?;
        }
        Ok(())
    }

    /// Promote `node` to entry if the graph has none or `level` is higher.
    pub fn update_entry(&self, node: u32, level: usize) {
        let mut entry = self.entry.write();
        match *entry {
            Some(current) if current.level >= level => {}
            _ => *entry = Some(EntryNode { node, level }),
        }
    }

    pub(crate) fn set_entry(&self, entry: Option<EntryNode>) {
        *self.entry.write() = entry;
    }

    /// Re-pick the entry node if the current one is gone: the highest-level
    /// live node, lowest id first.
    pub(crate) fn repair_entry(&self) {
        let current = *self.entry.read();
        if let Some(e) = current {
            if self.level_of(e.node).is_some() && !self.is_deleted(e.node) {
                return;
            }
        }
        let mut best: Option<EntryNode> = None;
        for node in 0..self.nodes.len() as u32 {
            if self.is_deleted(node) {
                continue;
            }
            if let Some(level) = self.level_of(node) {
                if best.map_or(true, |b| level > b.level) {
                    best = Some(EntryNode { node, level });
                }
            }
        }
        self.set_entry(best);
    }

    /// Mark a present node as deleted. It stays traversable until cleanup.
    pub fn mark_deleted(&self, node: u32) -> Result<()> {
        if self.level_of(node).is_none() {
            return Err(IndexError::integrity(format!(
                "cannot delete node {node}: not in graph"
            )));
        }
        self.deleted.write().insert(node);
        Ok(())
    }

    pub fn deleted_count(&self) -> u64 {
        self.deleted.read().len()
    }

    pub fn deleted_nodes(&self) -> RoaringBitmap {
        self.deleted.read().clone()
    }

    /// Drop a node and its edges entirely.
    pub(crate) fn remove_node(&self, node: u32) -> Result<()> {
        let slot = self.slot(node)?;
        let mut edges = slot.edges.lock();
        if slot.level.swap(-1, Ordering::AcqRel) >= 0 {
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
        edges.clear();
        self.deleted.write().remove(node);
        Ok(())
    }

    /// Present nodes on `level`, ascending.
    pub fn nodes_at_level(&self, level: usize) -> Vec<u32> {
        (0..self.nodes.len() as u32)
            .filter(|&n| self.level_of(n).is_some_and(|l| l >= level))
            .collect()
    }

    /// Number of layers (`max level + 1`), or 0 for an empty graph.
    pub fn num_layers(&self) -> usize {
        self.entry_node().map_or(0, |e| e.level + 1)
    }
}

impl GraphView for OnHeapGraph {
    fn entry_node(&self) -> Option<EntryNode> {
        *self.entry.read()
    }

    fn id_upper_bound(&self) -> usize {
        self.nodes.len()
    }

    fn contains(&self, node: u32) -> bool {
        self.level_of(node).is_some()
    }

    fn is_deleted(&self, node: u32) -> bool {
        self.deleted.read().contains(node)
    }

    fn neighbors(&self, level: usize, node: u32) -> Result<NeighborIds> {
        let slot = self.slot(node)?;
        let edges = slot.edges.lock();
        Ok(edges
            .get(level)
            .map(|list| list.iter().map(|n| n.node).collect())
            .unwrap_or_default())
    }
}

impl std::fmt::Debug for OnHeapGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnHeapGraph")
            .field("capacity", &self.capacity())
            .field("size", &self.size())
            .field("entry", &self.entry_node())
            .field("deleted", &self.deleted_count())
            .finish()
    }
}

/// Level of `node`: geometric with ratio `1 / max_degree`, capped at [`MAX_LEVEL`].
pub(crate) fn assign_level(config: &GraphConfig, node: u32) -> usize {
    if !config.hierarchy_enabled {
        return 0;
    }
    let mut rng = StdRng::seed_from_u64(config.seed ^ (node as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    let ml = 1.0 / (config.max_degree as f64).ln();
    let r: f64 = rng.random();
    let level = (-(1.0 - r).ln() * ml).floor();
    (level as usize).min(MAX_LEVEL)
}
