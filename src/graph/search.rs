//! Beam search over a [`GraphView`].
//!
//! Works in score space (higher is better). The candidate queue is a max-heap
//! on score so the best unexplored node is expanded first; the result set is a
//! min-heap so its worst member is at the top and can be evicted in O(log ef).
//!
//! A query descends greedily (`ef = 1`) through the upper layers, then runs a
//! beam of `k * over_query_factor` on layer 0. With a reranker the approximate
//! candidates are rescored exactly before the similarity threshold is applied.
//!
//! A scoring or adjacency error mid-query does not fail the search: traversal
//! stops, and whatever was collected so far is returned with
//! [`SearchResult::incomplete`] set. Bad parameters still fail fast.

use super::{GraphView, NeighborIds};
use crate::config::SearchParams;
use crate::error::{IndexError, Result};
use roaring::RoaringBitmap;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use tracing::{debug, warn};

/// Predicate on node ordinals accepted into results.
pub trait FilterPredicate: Sync {
    fn matches(&self, node: u32) -> bool;
}

/// Closure-backed filter.
pub struct FnFilter<F: Fn(u32) -> bool + Sync>(pub F);

impl<F: Fn(u32) -> bool + Sync> FilterPredicate for FnFilter<F> {
    fn matches(&self, node: u32) -> bool {
        self.0(node)
    }
}

/// Accept everything.
pub struct NoFilter;

impl FilterPredicate for NoFilter {
    fn matches(&self, _node: u32) -> bool {
        true
    }
}

impl FilterPredicate for RoaringBitmap {
    fn matches(&self, node: u32) -> bool {
        self.contains(node)
    }
}

/// A node with its similarity to the query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NodeScore {
    pub node: u32,
    pub score: f32,
}

/// Search output plus traversal counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResult {
    /// Best first.
    pub nodes: Vec<NodeScore>,
    /// Nodes scored.
    pub visited: usize,
    /// Nodes whose neighbor lists were read, all layers.
    pub expanded: usize,
    /// Nodes whose neighbor lists were read on layer 0.
    pub expanded_base_layer: usize,
    /// Candidates rescored with exact similarity.
    pub reranked: usize,
    /// Traversal or reranking stopped on an error; `nodes` is best effort.
    pub incomplete: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SearchCounters {
    pub visited: usize,
    pub expanded: usize,
    pub expanded_base_layer: usize,
}

#[derive(PartialEq)]
struct MaxCandidate(NodeScore);

impl Eq for MaxCandidate {}

impl Ord for MaxCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher score = higher priority
        self.0
            .score
            .total_cmp(&other.0.score)
            .then_with(|| other.0.node.cmp(&self.0.node))
    }
}

impl PartialOrd for MaxCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(PartialEq)]
struct MinResult(NodeScore);

impl Eq for MinResult {}

impl Ord for MinResult {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: lower score = higher priority (evicted first)
        other
            .0
            .score
            .total_cmp(&self.0.score)
            .then_with(|| self.0.node.cmp(&other.0.node))
    }
}

impl PartialOrd for MinResult {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Best first, ties by ascending node.
pub(crate) fn sort_by_score(nodes: &mut [NodeScore]) {
    nodes.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.node.cmp(&b.node)));
}

/// Nodes found on one layer, plus the error that cut the beam short, if any.
pub(crate) struct LayerSearch {
    pub nodes: Vec<NodeScore>,
    pub error: Option<IndexError>,
}

impl LayerSearch {
    /// Fail on any error, for callers that cannot use partial results.
    pub fn into_result(self) -> Result<Vec<NodeScore>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.nodes),
        }
    }
}

/// Beam search on one layer starting from already-scored entry points.
///
/// Every reachable node may be traversed, but only nodes passing `accept`
/// enter the results. Returns at most `ef` nodes, best first. An error stops
/// the beam; the nodes accepted before it are still returned.
pub(crate) fn beam_search_layer<G, S, A>(
    graph: &G,
    level: usize,
    entry_points: &[NodeScore],
    ef: usize,
    score: &S,
    accept: &A,
    counters: &mut SearchCounters,
) -> LayerSearch
where
    G: GraphView + ?Sized,
    S: Fn(u32) -> Result<f32>,
    A: Fn(u32) -> bool,
{
    let mut candidates: BinaryHeap<MaxCandidate> = BinaryHeap::with_capacity(ef * 2);
    let mut results: BinaryHeap<MinResult> = BinaryHeap::with_capacity(ef + 1);
    let mut visited: HashSet<u32> = HashSet::with_capacity(ef * 4);
    let mut error = None;

    for &ep in entry_points {
        if !visited.insert(ep.node) {
            continue;
        }
        candidates.push(MaxCandidate(ep));
        if accept(ep.node) {
            results.push(MinResult(ep));
            if results.len() > ef {
                results.pop();
            }
        }
    }

    'beam: while let Some(MaxCandidate(current)) = candidates.pop() {
        let worst = results.peek().map_or(f32::NEG_INFINITY, |r| r.0.score);
        if results.len() >= ef && current.score < worst {
            break;
        }

        counters.expanded += 1;
        if level == 0 {
            counters.expanded_base_layer += 1;
        }

        let neighbors: NeighborIds = match graph.neighbors(level, current.node) {
            Ok(neighbors) => neighbors,
            Err(e) => {
                error = Some(e);
                break;
            }
        };
        for neighbor in neighbors {
            if !visited.insert(neighbor) || !graph.contains(neighbor) {
                continue;
            }
            let s = match score(neighbor) {
                Ok(s) => s,
                Err(e) => {
                    error = Some(e);
                    break 'beam;
                }
            };
            counters.visited += 1;

            let worst = results.peek().map_or(f32::NEG_INFINITY, |r| r.0.score);
            if results.len() < ef || s > worst {
                let found = NodeScore {
                    node: neighbor,
                    score: s,
                };
                candidates.push(MaxCandidate(found));
                if accept(neighbor) {
                    results.push(MinResult(found));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }
    }

    let mut nodes: Vec<NodeScore> = results.into_iter().map(|r| r.0).collect();
    sort_by_score(&mut nodes);
    LayerSearch { nodes, error }
}

/// Query-time search over a graph.
pub struct GraphSearcher<'a, G: GraphView + ?Sized> {
    graph: &'a G,
}

impl<'a, G: GraphView + ?Sized> GraphSearcher<'a, G> {
    pub fn new(graph: &'a G) -> Self {
        Self { graph }
    }

    /// Top-`k` nodes for a query.
    ///
    /// `approximate` scores every traversed node. When `rerank` is given,
    /// candidates whose approximate score reaches `params.rerank_floor` are
    /// rescored with it and the rest are dropped. Results below
    /// `params.threshold` are dropped, as are nodes rejected by `filter`.
    ///
    /// Only invalid parameters and configuration errors are returned as
    /// `Err`. Any other error ends the traversal early and yields the partial
    /// result, marked [`incomplete`](SearchResult::incomplete).
    pub fn search<S, F>(
        &self,
        approximate: S,
        rerank: Option<&dyn Fn(u32) -> Result<f32>>,
        params: &SearchParams,
        filter: &F,
    ) -> Result<SearchResult>
    where
        S: Fn(u32) -> Result<f32>,
        F: FilterPredicate + ?Sized,
    {
        params.validate()?;
        let mut counters = SearchCounters::default();
        let mut reranked = 0;
        let (mut nodes, error) = self.traverse(&approximate, rerank, params, filter, &mut counters, &mut reranked);

        let incomplete = match error {
            Some(e) if e.is_configuration() => return Err(e),
            Some(e) => {
                warn!(
                    error = %e,
                    collected = nodes.len(),
                    visited = counters.visited,
                    expanded = counters.expanded,
                    reranked,
                    "graph search stopped early"
                );
                true
            }
            None => false,
        };
        nodes.retain(|n| n.score >= params.threshold);
        sort_by_score(&mut nodes);
        nodes.truncate(params.k);

        debug!(
            k = params.k,
            returned = nodes.len(),
            visited = counters.visited,
            expanded = counters.expanded,
            expanded_base_layer = counters.expanded_base_layer,
            reranked,
            incomplete,
            "graph search"
        );

        Ok(SearchResult {
            nodes,
            visited: counters.visited,
            expanded: counters.expanded,
            expanded_base_layer: counters.expanded_base_layer,
            reranked,
            incomplete,
        })
    }

    /// Candidates in final score units, plus the error that stopped the query.
    fn traverse<S, F>(
        &self,
        approximate: &S,
        rerank: Option<&dyn Fn(u32) -> Result<f32>>,
        params: &SearchParams,
        filter: &F,
        counters: &mut SearchCounters,
        reranked: &mut usize,
    ) -> (Vec<NodeScore>, Option<IndexError>)
    where
        S: Fn(u32) -> Result<f32>,
        F: FilterPredicate + ?Sized,
    {
        let Some(entry) = self.graph.entry_node() else {
            return (Vec::new(), None);
        };
        let graph = self.graph;
        let accept = |node: u32| !graph.is_deleted(node) && filter.matches(node);

        let entry_score = match approximate(entry.node) {
            Ok(score) => score,
            Err(e) => return (Vec::new(), Some(e)),
        };
        counters.visited += 1;
        let mut entry_points = vec![NodeScore {
            node: entry.node,
            score: entry_score,
        }];

        let mut failure = None;
        for level in (1..=entry.level).rev() {
            let best = beam_search_layer(graph, level, &entry_points, 1, approximate, &|_: u32| true, counters);
            if !best.nodes.is_empty() {
                entry_points = best.nodes;
            }
            if best.error.is_some() {
                failure = best.error;
                break;
            }
        }

        let candidates = match failure {
            // Descent failed: the best nodes reached so far are all there is.
            Some(_) => entry_points.into_iter().filter(|n| accept(n.node)).collect(),
            None => {
                let found = beam_search_layer(graph, 0, &entry_points, params.rerank_k(), approximate, &accept, counters);
                failure = found.error;
                found.nodes
            }
        };

        let Some(exact) = rerank else {
            return (candidates, failure);
        };
        let mut rescored = Vec::with_capacity(candidates.len());
        for c in candidates.iter().filter(|c| c.score >= params.rerank_floor) {
            match exact(c.node) {
                Ok(score) => rescored.push(NodeScore { node: c.node, score }),
                Err(e) => {
                    failure.get_or_insert(e);
                    break;
                }
            }
            *reranked += 1;
        }
        (rescored, failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use crate::graph::{DiversityPolicy, Neighbor, OnHeapGraph};

    /// Path graph 0 - 1 - ... - (n-1) on layer 0, node 0 as entry.
    fn path(n: u32) -> OnHeapGraph {
        let g = OnHeapGraph::new(n as usize, GraphConfig::default(), DiversityPolicy::default());
        for i in 0..n {
            g.add_node(i, 0).unwrap();
        }
        for i in 0..n {
            let mut edges = Vec::new();
            if i > 0 {
                edges.push(Neighbor {
                    node: i - 1,
                    distance: 1.0,
                });
            }
            if i + 1 < n {
                edges.push(Neighbor {
                    node: i + 1,
                    distance: 1.0,
                });
            }
            g.set_neighbors(0, i, edges).unwrap();
        }
        g.update_entry(0, 0);
        g
    }

    /// Score rises toward node `target`.
    fn toward(target: u32) -> impl Fn(u32) -> Result<f32> {
        move |n| Ok(1.0 / (1.0 + (n as f32 - target as f32).abs()))
    }

    #[test]
    fn walks_to_best_nodes() {
        let g = path(20);
        let res = GraphSearcher::new(&g)
            .search(toward(15), None, &SearchParams::new(3), &NoFilter)
            .unwrap();
        let ids: Vec<u32> = res.nodes.iter().map(|n| n.node).collect();
        assert_eq!(ids[0], 15);
        assert!(ids.contains(&14) && ids.contains(&16));
        assert!(res.expanded_base_layer > 0);
        assert!(res.visited >= 16);
    }

    #[test]
    fn filter_excludes_but_traverses() {
        let g = path(10);
        let odd = FnFilter(|n: u32| n % 2 == 1);
        let res = GraphSearcher::new(&g)
            .search(toward(9), None, &SearchParams::new(2), &odd)
            .unwrap();
        let ids: Vec<u32> = res.nodes.iter().map(|n| n.node).collect();
        assert_eq!(ids, vec![9, 7]);
    }

    #[test]
    fn deleted_nodes_are_not_returned() {
        let g = path(6);
        g.mark_deleted(5).unwrap();
        let res = GraphSearcher::new(&g)
            .search(toward(5), None, &SearchParams::new(2), &NoFilter)
            .unwrap();
        let ids: Vec<u32> = res.nodes.iter().map(|n| n.node).collect();
        assert_eq!(ids, vec![4, 3]);
    }

    #[test]
    fn rerank_floor_and_threshold() {
        let g = path(8);
        let exact = |n: u32| -> Result<f32> { Ok(n as f32 / 10.0) };
        let params = SearchParams {
            k: 3,
            over_query_factor: 3,
            threshold: 0.55,
            rerank_floor: 0.2,
        };
        let res = GraphSearcher::new(&g)
            .search(toward(7), Some(&exact), &params, &NoFilter)
            .unwrap();
        // Approximate scores 1/(1+|n-7|) >= 0.2 keep nodes 3..=7; exact scores
        // n/10 >= 0.55 keep 6 and 7.
        let ids: Vec<u32> = res.nodes.iter().map(|n| n.node).collect();
        assert_eq!(ids, vec![7, 6]);
        assert_eq!(res.reranked, 5);
        assert!((res.nodes[0].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn scoring_error_returns_partial_result() {
        let g = path(20);
        let target = toward(15);
        let broken = |n: u32| {
            if n == 8 {
                Err(IndexError::integrity("ordinal 8 has no backing vector"))
            } else {
                target(n)
            }
        };
        let res = GraphSearcher::new(&g)
            .search(broken, None, &SearchParams::new(3), &NoFilter)
            .unwrap();
        assert!(res.incomplete);
        let ids: Vec<u32> = res.nodes.iter().map(|n| n.node).collect();
        assert_eq!(ids, vec![7, 6, 5]);
        assert_eq!(res.visited, 8);
        assert!(res.expanded_base_layer >= 8);
    }

    #[test]
    fn rerank_error_keeps_rescored_prefix() {
        let g = path(8);
        let exact = |n: u32| -> Result<f32> {
            if n == 6 {
                Err(IndexError::integrity("ordinal 6 has no backing vector"))
            } else {
                Ok(n as f32 / 10.0)
            }
        };
        let params = SearchParams {
            k: 3,
            over_query_factor: 3,
            ..SearchParams::default()
        };
        let res = GraphSearcher::new(&g)
            .search(toward(7), Some(&exact), &params, &NoFilter)
            .unwrap();
        assert!(res.incomplete);
        assert_eq!(res.reranked, 1);
        assert_eq!(res.nodes.len(), 1);
        assert_eq!(res.nodes[0].node, 7);
    }

    #[test]
    fn failing_entry_node_yields_empty_result() {
        let g = path(4);
        let res = GraphSearcher::new(&g)
            .search(
                |_| Err(IndexError::integrity("unreadable")),
                None,
                &SearchParams::new(2),
                &NoFilter,
            )
            .unwrap();
        assert!(res.incomplete);
        assert!(res.nodes.is_empty());
        assert_eq!(res.visited, 0);

        let err = GraphSearcher::new(&g)
            .search(
                |_| Err(IndexError::DimensionMismatch { expected: 2, actual: 3 }),
                None,
                &SearchParams::new(2),
                &NoFilter,
            )
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn empty_graph_returns_nothing() {
        let g = OnHeapGraph::new(4, GraphConfig::default(), DiversityPolicy::default());
        let res = GraphSearcher::new(&g)
            .search(toward(0), None, &SearchParams::new(5), &NoFilter)
            .unwrap();
        assert!(res.nodes.is_empty());
        assert!(GraphSearcher::new(&g)
            .search(toward(0), None, &SearchParams::new(0), &NoFilter)
            .is_err());
    }
}
