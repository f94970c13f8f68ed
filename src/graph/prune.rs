//! Diversity-aware neighbor selection.
//!
//! Candidates are scanned nearest first. A candidate `c` is kept only if, for
//! every neighbor `s` already kept, `dist(c, s) >= bar * dist(c, q)`. The first
//! pass uses `bar = alpha`; when it leaves the list short of `max_degree`, a
//! second pass over the rejected candidates relaxes the bar to `1.0` (the
//! relative-neighborhood rule).
//!
//! [`DiversityPolicy`] is the two-phase wrapper the graph carries: a graph
//! loaded from disk has no score provider until the caller supplies one.

use super::score::ScoreProvider;
use super::Neighbor;
use crate::error::{IndexError, Result};
use std::collections::HashSet;

/// Select at most `max_degree` diverse neighbors from `candidates`.
///
/// `distance(a, b)` is the pruning distance between two candidate nodes.
/// Duplicate nodes keep their smallest distance. The result is sorted by
/// increasing distance.
pub fn select_diverse<D>(
    candidates: &[Neighbor],
    max_degree: usize,
    alpha: f32,
    distance: D,
) -> Result<Vec<Neighbor>>
where
    D: Fn(u32, u32) -> Result<f32>,
{
    if max_degree == 0 || candidates.is_empty() {
        return Ok(Vec::new());
    }

    let mut sorted: Vec<Neighbor> = candidates.to_vec();
    sorted.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.node.cmp(&b.node)));
    let mut seen = HashSet::with_capacity(sorted.len());
    sorted.retain(|n| seen.insert(n.node));

    let bars: &[f32] = if alpha > 1.0 { &[alpha, 1.0] } else { &[1.0] };
    retain_pass(&sorted, max_degree, bars, &distance)
}

fn retain_pass<D>(
    sorted: &[Neighbor],
    max_degree: usize,
    bars: &[f32],
    distance: &D,
) -> Result<Vec<Neighbor>>
where
    D: Fn(u32, u32) -> Result<f32>,
{
    let mut selected: Vec<Neighbor> = Vec::with_capacity(max_degree.min(sorted.len()));
    let mut taken = vec![false; sorted.len()];

    for &bar in bars {
        for (i, candidate) in sorted.iter().enumerate() {
            if selected.len() >= max_degree {
                break;
            }
            if taken[i] {
                continue;
            }
            let mut diverse = true;
            for kept in &selected {
                if distance(candidate.node, kept.node)? < bar * candidate.distance {
                    diverse = false;
                    break;
                }
            }
            if diverse {
                taken[i] = true;
                selected.push(*candidate);
            }
        }
        if selected.len() >= max_degree {
            break;
        }
    }

    selected.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.node.cmp(&b.node)));
    Ok(selected)
}

/// Diversity pruning backed by a score provider.
#[derive(Debug, Clone)]
pub struct VamanaDiversity {
    alpha: f32,
    scores: ScoreProvider,
}

impl VamanaDiversity {
    pub fn new(alpha: f32, scores: ScoreProvider) -> Self {
        Self { alpha, scores }
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn scores(&self) -> &ScoreProvider {
        &self.scores
    }
}

/// Pruning policy of a graph, possibly not yet usable.
#[derive(Debug, Clone, Default)]
pub enum DiversityPolicy {
    /// Graph loaded without scoring context; every operation fails.
    #[default]
    Uninitialized,
    Initialized(VamanaDiversity),
}

impl DiversityPolicy {
    pub fn new(alpha: f32, scores: ScoreProvider) -> Self {
        Self::Initialized(VamanaDiversity::new(alpha, scores))
    }

    /// Supply the scoring context. Fails if already initialized.
    pub fn initialize(&mut self, alpha: f32, scores: ScoreProvider) -> Result<()> {
        match self {
            Self::Uninitialized => {
                *self = Self::new(alpha, scores);
                Ok(())
            }
            Self::Initialized(_) => Err(IndexError::illegal_state(
                "diversity policy is already initialized",
            )),
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self, Self::Initialized(_))
    }

    fn inner(&self) -> Result<&VamanaDiversity> {
        match self {
            Self::Initialized(inner) => Ok(inner),
            Self::Uninitialized => Err(IndexError::NotInitialized("DiversityPolicy")),
        }
    }

    /// Pruning distance between two nodes.
    pub fn distance(&self, a: u32, b: u32) -> Result<f32> {
        self.inner()?.scores.distance(a, b)
    }

    /// Keep at most `max_degree` diverse neighbors.
    pub fn retain_diverse(&self, candidates: &[Neighbor], max_degree: usize) -> Result<Vec<Neighbor>> {
        let inner = self.inner()?;
        select_diverse(candidates, max_degree, inner.alpha, |a, b| {
            inner.scores.distance(a, b)
        })
    }

    pub fn scores(&self) -> Result<&ScoreProvider> {
        Ok(&self.inner()?.scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::Similarity;
    use crate::store::{VectorStore, VectorValues};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn points(coords: &[[f32; 2]]) -> Arc<VectorStore> {
        let mut s = VectorStore::new(2);
        for c in coords {
            s.add(c).unwrap();
        }
        Arc::new(s)
    }

    fn neighbors_of(store: &VectorStore, q: [f32; 2], ids: &[u32]) -> Vec<Neighbor> {
        ids.iter()
            .map(|&id| Neighbor {
                node: id,
                distance: crate::simd::l2_distance_squared(&q, store.get(id).unwrap()).sqrt(),
            })
            .collect()
    }

    fn euclid(store: &VectorStore) -> impl Fn(u32, u32) -> Result<f32> + '_ {
        move |a, b| {
            Ok(crate::simd::l2_distance_squared(
                store.get(a).unwrap(),
                store.get(b).unwrap(),
            )
            .sqrt())
        }
    }

    #[test]
    fn drops_shadowed_candidates_in_first_pass() {
        // 0 and 1 sit in the same direction from the query; 2 points elsewhere.
        let store = points(&[[1.0, 0.0], [1.1, 0.0], [0.0, 1.0]]);
        let cands = neighbors_of(&store, [0.0, 0.0], &[0, 1, 2]);
        let kept = select_diverse(&cands, 2, 1.2, euclid(&store)).unwrap();
        let ids: Vec<u32> = kept.iter().map(|n| n.node).collect();
        assert_eq!(ids, vec![0, 2]);
    }

    #[test]
    fn relaxed_pass_fills_short_lists() {
        // With alpha 2.0 only the nearest survives the first pass; the relaxed
        // pass admits 1 because it is farther from 0 than from the query.
        let store = points(&[[1.0, 0.0], [0.0, 1.0], [1.05, 0.0]]);
        let cands = neighbors_of(&store, [0.0, 0.0], &[0, 1, 2]);
        let kept = select_diverse(&cands, 3, 2.0, euclid(&store)).unwrap();
        let ids: Vec<u32> = kept.iter().map(|n| n.node).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn duplicates_collapse() {
        let cands = vec![
            Neighbor {
                node: 4,
                distance: 2.0,
            },
            Neighbor {
                node: 4,
                distance: 1.0,
            },
        ];
        let kept = select_diverse(&cands, 4, 1.0, |_, _| Ok(10.0)).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].distance, 1.0);
    }

    #[test]
    fn uninitialized_policy_fails_clearly() {
        let policy = DiversityPolicy::default();
        let err = policy.retain_diverse(&[], 4).unwrap_err();
        assert!(matches!(err, IndexError::NotInitialized("DiversityPolicy")));
        assert!(policy.distance(0, 1).is_err());
    }

    #[test]
    fn initialize_once() {
        let store = points(&[[0.0, 0.0], [3.0, 4.0]]);
        let provider = ScoreProvider::exact(store, Similarity::Euclidean);
        let mut policy = DiversityPolicy::default();
        policy.initialize(1.2, provider.clone()).unwrap();
        assert!(policy.is_initialized());
        assert!((policy.distance(0, 1).unwrap() - 5.0).abs() < 1e-3);
        assert!(policy
            .initialize(1.2, provider)
            .unwrap_err()
            .is_integrity());
    }

    proptest! {
        #[test]
        fn prop_selection_is_bounded_subset(
            coords in proptest::collection::vec((-10.0f32..10.0, -10.0f32..10.0), 1..40),
            max_degree in 1usize..12,
            alpha in 1.0f32..2.0,
        ) {
            let mut store = VectorStore::new(2);
            for (x, y) in &coords {
                store.add(&[*x, *y]).unwrap();
            }
            let ids: Vec<u32> = (0..store.size() as u32).collect();
            let cands = neighbors_of(&store, [0.0, 0.0], &ids);
            let kept = select_diverse(&cands, max_degree, alpha, euclid(&store)).unwrap();

            prop_assert!(kept.len() <= max_degree);
            prop_assert!(!kept.is_empty());
            for n in &kept {
                prop_assert!(ids.contains(&n.node));
            }
            let mut seen: Vec<u32> = kept.iter().map(|n| n.node).collect();
            seen.sort_unstable();
            seen.dedup();
            prop_assert_eq!(seen.len(), kept.len());
        }
    }
}
