//! Concurrent graph construction.
//!
//! Each insert descends greedily from the entry node to the new node's level,
//! then on every layer it belongs to runs a beam of `beam_width`, prunes the
//! beam with the diversity policy and links both ways. A neighbor whose list
//! overflows is pruned again under its own lock, so inserts only contend on
//! the nodes they actually touch.
//!
//! Lists may grow up to `ceil(max_degree * neighbor_overflow)` while building.
//! [`GraphBuilder::cleanup`] must run before the graph is written: it unlinks
//! deleted nodes, reconnects their former neighbors, and prunes every list back
//! to `max_degree`.

use super::score::ScoreProvider;
use super::search::{beam_search_layer, NodeScore, SearchCounters};
use super::{assign_level, DiversityPolicy, GraphView, Neighbor, OnHeapGraph};
use crate::config::GraphConfig;
use crate::error::{IndexError, Result};
use crate::store::VectorValues;
use rayon::prelude::*;
use rayon::ThreadPool;
use roaring::RoaringBitmap;
use tracing::{debug, info};

/// Builds an [`OnHeapGraph`] from scored vectors.
pub struct GraphBuilder {
    graph: OnHeapGraph,
    scores: ScoreProvider,
}

impl GraphBuilder {
    /// Empty graph over node ids `[0, capacity)`.
    pub fn new(scores: ScoreProvider, capacity: usize, config: GraphConfig) -> Result<Self> {
        config.validate()?;
        let policy = DiversityPolicy::new(config.alpha, scores.clone());
        Ok(Self {
            graph: OnHeapGraph::new(capacity, config, policy),
            scores,
        })
    }

    /// Continue building an existing graph, typically one loaded from disk.
    ///
    /// Initializes the graph's diversity policy with `scores` and recomputes the
    /// distance of every stored edge, since persisted graphs keep only ids.
    pub fn from_graph(mut graph: OnHeapGraph, scores: ScoreProvider, pool: &ThreadPool) -> Result<Self> {
        graph.config().validate()?;
        let alpha = graph.config().alpha;
        graph.diversity_mut().initialize(alpha, scores.clone())?;

        let nodes = graph.nodes_at_level(0);
        let policy = graph.diversity();
        pool.install(|| {
            nodes.par_iter().try_for_each(|&node| {
                let level = graph.level_of(node).unwrap_or(0);
                for l in 0..=level {
                    let mut edges = graph.neighbors_with_distance(l, node)?;
                    for edge in &mut edges {
                        edge.distance = policy.distance(node, edge.node)?;
                    }
                    graph.set_neighbors(l, node, edges)?;
                }
                Ok::<_, IndexError>(())
            })
        })?;
        debug!(nodes = nodes.len(), "rescored loaded graph edges");

        Ok(Self { graph, scores })
    }

    pub fn graph(&self) -> &OnHeapGraph {
        &self.graph
    }

    pub fn into_graph(self) -> OnHeapGraph {
        self.graph
    }

    pub fn dimension(&self) -> usize {
        self.scores.dimension()
    }

    /// Insert `node` with its vector.
    ///
    /// The vector must have the graph's dimension; inserting the same node twice
    /// is an error.
    pub fn insert(&self, node: u32, vector: &[f32]) -> Result<()> {
        let scorer = self.scores.query_scorer(vector)?;
        let score = |n: u32| scorer.score(n);
        let similarity = self.scores.similarity();
        let config = self.graph.config();
        let level = assign_level(config, node);

        let entry = self.graph.entry_node();
        self.graph.add_node(node, level)?;
        let Some(entry) = entry else {
            self.graph.update_entry(node, level);
            return Ok(());
        };

        let mut counters = SearchCounters::default();
        let mut entry_points = vec![NodeScore {
            node: entry.node,
            score: score(entry.node)?,
        }];

        for l in (level + 1..=entry.level).rev() {
            let best = beam_search_layer(
                &self.graph,
                l,
                &entry_points,
                1,
                &score,
                &|_: u32| true,
                &mut counters,
            )
            .into_result()?;
            if !best.is_empty() {
                entry_points = best;
            }
        }

        let graph = &self.graph;
        let accept = |n: u32| n != node && !graph.is_deleted(n);
        for l in (0..=level.min(entry.level)).rev() {
            let found = beam_search_layer(
                graph,
                l,
                &entry_points,
                config.beam_width,
                &score,
                &accept,
                &mut counters,
            )
            .into_result()?;
            let candidates: Vec<Neighbor> = found
                .iter()
                .map(|c| Neighbor {
                    node: c.node,
                    distance: similarity.distance_from_score(c.score),
                })
                .collect();
            let selected = graph
                .diversity()
                .retain_diverse(&candidates, config.max_degree_for_layer(l))?;

            // Merge rather than replace: concurrent inserts may already link here.
            graph.add_edges(l, node, &selected)?;
            for n in &selected {
                graph.add_edge(
                    l,
                    n.node,
                    Neighbor {
                        node,
                        distance: n.distance,
                    },
                )?;
            }
            if !found.is_empty() {
                entry_points = found;
            }
        }

        self.graph.update_entry(node, level);
        Ok(())
    }

    /// Insert `nodes` in parallel on `pool`; `vectors` is addressed by node id.
    pub fn build(&self, pool: &ThreadPool, vectors: &dyn VectorValues, nodes: &[u32]) -> Result<()> {
        if vectors.dimension() != self.dimension() {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension(),
                actual: vectors.dimension(),
            });
        }
        let start = std::time::Instant::now();
        pool.install(|| {
            let rest = match (self.graph.entry_node(), nodes.split_first()) {
                // Seed the entry node before going parallel.
                (None, Some((&first, rest))) => {
                    self.insert(first, &vectors.vector(first)?)?;
                    rest
                }
                _ => nodes,
            };
            rest.par_iter()
                .try_for_each(|&node| self.insert(node, &vectors.vector(node)?))
        })?;
        info!(
            nodes = nodes.len(),
            millis = start.elapsed().as_millis() as u64,
            "built graph"
        );
        Ok(())
    }

    /// Mark `node` deleted. It keeps routing searches until [`cleanup`](Self::cleanup).
    pub fn mark_deleted(&self, node: u32) -> Result<()> {
        self.graph.mark_deleted(node)
    }

    /// Remove deleted nodes and bring every list within its degree bound.
    ///
    /// A live node that pointed at a deleted node inherits that node's live
    /// neighbors as candidates before being re-pruned.
    pub fn cleanup(&self, pool: &ThreadPool) -> Result<()> {
        let graph = &self.graph;
        let deleted: RoaringBitmap = graph.deleted_nodes();
        let live: Vec<u32> = graph
            .nodes_at_level(0)
            .into_iter()
            .filter(|n| !deleted.contains(*n))
            .collect();
        let policy = graph.diversity();

        pool.install(|| {
            live.par_iter().try_for_each(|&node| {
                let level = graph.level_of(node).unwrap_or(0);
                for l in 0..=level {
                    let max_degree = graph.config().max_degree_for_layer(l);
                    let current = graph.neighbors_with_distance(l, node)?;
                    let touches_deleted = current.iter().any(|n| deleted.contains(n.node));
                    if !touches_deleted && current.len() <= max_degree {
                        continue;
                    }

                    let mut candidates = Vec::with_capacity(current.len() * 2);
                    for edge in current {
                        if !deleted.contains(edge.node) {
                            candidates.push(edge);
                            continue;
                        }
                        for replacement in graph.neighbors_with_distance(l, edge.node)? {
                            if replacement.node != node && !deleted.contains(replacement.node) {
                                candidates.push(Neighbor {
                                    node: replacement.node,
                                    distance: policy.distance(node, replacement.node)?,
                                });
                            }
                        }
                    }
                    let pruned = policy.retain_diverse(&candidates, max_degree)?;
                    graph.set_neighbors(l, node, pruned)?;
                }
                Ok::<_, IndexError>(())
            })
        })?;

        for node in &deleted {
            graph.remove_node(node)?;
        }
        graph.repair_entry();
        debug!(
            removed = deleted.len(),
            live = live.len(),
            "graph cleanup complete"
        );
        Ok(())
    }
}
