//! Scoring used while building a graph.
//!
//! A build scores either against full-precision vectors or against PQ codes.
//! Node ordinals here are graph ordinals; exact providers read vectors through
//! a view already addressed by graph ordinal (see `store::MappedVectorValues`).

use crate::error::{IndexError, Result};
use crate::pq::{PqScorer, PqVectors};
use crate::similarity::Similarity;
use crate::store::VectorValues;
use std::sync::Arc;

/// Source of build-time similarity scores.
#[derive(Clone)]
pub enum ScoreProvider {
    /// Full-precision vectors.
    Exact {
        vectors: Arc<dyn VectorValues>,
        similarity: Similarity,
    },
    /// PQ-compressed vectors.
    Pq {
        vectors: Arc<PqVectors>,
        similarity: Similarity,
    },
}

impl ScoreProvider {
    pub fn exact(vectors: Arc<dyn VectorValues>, similarity: Similarity) -> Self {
        Self::Exact {
            vectors,
            similarity,
        }
    }

    pub fn pq(vectors: Arc<PqVectors>, similarity: Similarity) -> Self {
        Self::Pq {
            vectors,
            similarity,
        }
    }

    pub fn similarity(&self) -> Similarity {
        match self {
            Self::Exact { similarity, .. } | Self::Pq { similarity, .. } => *similarity,
        }
    }

    pub fn dimension(&self) -> usize {
        match self {
            Self::Exact { vectors, .. } => vectors.dimension(),
            Self::Pq { vectors, .. } => vectors.quantizer().dimension(),
        }
    }

    /// Scorer for an arbitrary query vector.
    pub fn query_scorer(&self, query: &[f32]) -> Result<NodeScorer<'_>> {
        if query.len() != self.dimension() {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension(),
                actual: query.len(),
            });
        }
        match self {
            Self::Exact {
                vectors,
                similarity,
            } => Ok(NodeScorer::Exact {
                query: query.to_vec(),
                vectors: vectors.as_ref(),
                similarity: *similarity,
            }),
            Self::Pq {
                vectors,
                similarity,
            } => Ok(NodeScorer::Pq(vectors.scorer(query, *similarity)?)),
        }
    }

    /// Distance between two graph nodes, as used by the diversity pruner.
    pub fn distance(&self, a: u32, b: u32) -> Result<f32> {
        let similarity = self.similarity();
        let score = match self {
            Self::Exact { vectors, .. } => {
                similarity.score(&vectors.vector(a)?, &vectors.vector(b)?)
            }
            Self::Pq { vectors, .. } => {
                let pq = vectors.quantizer();
                similarity.score(&pq.decode(vectors.code(a)?), &pq.decode(vectors.code(b)?))
            }
        };
        Ok(similarity.distance_from_score(score))
    }
}

impl std::fmt::Debug for ScoreProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact { similarity, .. } => f
                .debug_struct("ScoreProvider::Exact")
                .field("similarity", similarity)
                .finish(),
            Self::Pq { similarity, .. } => f
                .debug_struct("ScoreProvider::Pq")
                .field("similarity", similarity)
                .finish(),
        }
    }
}

/// Scorer bound to one query.
pub enum NodeScorer<'a> {
    Exact {
        query: Vec<f32>,
        vectors: &'a dyn VectorValues,
        similarity: Similarity,
    },
    Pq(PqScorer<'a>),
}

impl std::fmt::Debug for NodeScorer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact { similarity, .. } => f
                .debug_struct("NodeScorer::Exact")
                .field("similarity", similarity)
                .finish(),
            Self::Pq(_) => f.debug_struct("NodeScorer::Pq").finish_non_exhaustive(),
        }
    }
}

impl NodeScorer<'_> {
    #[inline]
    pub fn score(&self, node: u32) -> Result<f32> {
        match self {
            Self::Exact {
                query,
                vectors,
                similarity,
            } => Ok(similarity.score(query, &vectors.vector(node)?)),
            Self::Pq(scorer) => scorer.score(node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuantizationConfig;
    use crate::pq::ProductQuantizer;
    use crate::store::VectorStore;

    fn line(n: usize) -> VectorStore {
        let mut s = VectorStore::new(2);
        for i in 0..n {
            s.add(&[i as f32, 0.0]).unwrap();
        }
        s
    }

    #[test]
    fn exact_distance_is_euclidean() {
        let provider = ScoreProvider::exact(Arc::new(line(5)), Similarity::Euclidean);
        assert!((provider.distance(1, 4).unwrap() - 3.0).abs() < 1e-4);
        let scorer = provider.query_scorer(&[0.0, 0.0]).unwrap();
        assert!((scorer.score(2).unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn query_dimension_checked() {
        let provider = ScoreProvider::exact(Arc::new(line(3)), Similarity::Euclidean);
        assert!(provider.query_scorer(&[0.0]).unwrap_err().is_configuration());
    }

    #[test]
    fn pq_provider_orders_like_exact() {
        let store = line(64);
        let pq = ProductQuantizer::train(&store, 1, 64, true, &QuantizationConfig::default())
            .unwrap();
        let ords: Vec<u32> = (0..64).collect();
        let pqv = Arc::new(PqVectors::encode_all(pq, &store, &ords).unwrap());
        let provider = ScoreProvider::pq(pqv, Similarity::Euclidean);
        let scorer = provider.query_scorer(&[0.0, 0.0]).unwrap();
        assert!(scorer.score(1).unwrap() > scorer.score(10).unwrap());
        assert!(provider.distance(0, 1).unwrap() < provider.distance(0, 30).unwrap());
    }
}
