//! Build, quantization, merge and search parameters.
//!
//! Configuration loading is the caller's concern; these structs only carry
//! defaults and validation.

use crate::error::{IndexError, Result};
use serde::{Deserialize, Serialize};

/// Default maximum out-degree per node.
pub const DEFAULT_MAX_DEGREE: usize = 32;
/// Default beam width used while inserting.
pub const DEFAULT_BEAM_WIDTH: usize = 100;
/// Default neighbor overflow factor.
pub const DEFAULT_NEIGHBOR_OVERFLOW: f32 = 1.2;
/// Default diversity factor for pruning.
pub const DEFAULT_ALPHA: f32 = 1.2;
/// Vector count at which product quantization kicks in.
pub const DEFAULT_MIN_BATCH_SIZE_FOR_QUANTIZATION: usize = 1024;
/// Default search over-query factor (candidates = k * factor).
pub const DEFAULT_OVER_QUERY_FACTOR: usize = 5;
/// Default similarity threshold.
pub const DEFAULT_QUERY_SIMILARITY_THRESHOLD: f32 = 0.0;
/// Default rerank floor.
pub const DEFAULT_QUERY_RERANK_FLOOR: f32 = 0.0;
/// Largest supported vector dimension.
pub const MAX_DIMENSIONS: usize = 8192;
/// Maximum number of centroids per PQ subspace (codes are one byte).
pub const MAX_PQ_CENTROIDS: usize = 256;

/// Where raw vectors are stored inside a graph region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VectorPlacement {
    /// Next to each node's base-layer edge list.
    #[default]
    Inline,
    /// In one contiguous region after the upper layers.
    Separated,
}

/// Graph construction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Maximum out-degree per node and layer.
    pub max_degree: usize,
    /// Beam width of the insertion search.
    pub beam_width: usize,
    /// Neighbor lists may grow to `ceil(max_degree * neighbor_overflow)` during a
    /// build before they are pruned again.
    pub neighbor_overflow: f32,
    /// Diversity factor, `>= 1`.
    pub alpha: f32,
    /// Build upper layers; when false every node lives only in layer 0.
    pub hierarchy_enabled: bool,
    /// Seed for level assignment.
    pub seed: u64,
    /// Storage of raw vectors in the persisted graph.
    pub vector_placement: VectorPlacement,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_degree: DEFAULT_MAX_DEGREE,
            beam_width: DEFAULT_BEAM_WIDTH,
            neighbor_overflow: DEFAULT_NEIGHBOR_OVERFLOW,
            alpha: DEFAULT_ALPHA,
            hierarchy_enabled: true,
            seed: 0x5eed_a11e,
            vector_placement: VectorPlacement::Inline,
        }
    }
}

impl GraphConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_degree < 2 {
            return Err(IndexError::config(format!(
                "max_degree must be >= 2, got {}",
                self.max_degree
            )));
        }
        if self.beam_width == 0 {
            return Err(IndexError::config("beam_width must be > 0"));
        }
        if !(self.neighbor_overflow >= 1.0) {
            return Err(IndexError::config(format!(
                "neighbor_overflow must be >= 1.0, got {}",
                self.neighbor_overflow
            )));
        }
        if !(self.alpha >= 1.0) {
            return Err(IndexError::config(format!(
                "alpha must be >= 1.0, got {}",
                self.alpha
            )));
        }
        Ok(())
    }

    /// Degree bound of a layer.
    #[inline]
    pub fn max_degree_for_layer(&self, _level: usize) -> usize {
        self.max_degree
    }

    /// Size a neighbor list may reach before it is pruned back.
    #[inline]
    pub fn overflow_degree(&self) -> usize {
        ((self.max_degree as f32) * self.neighbor_overflow).ceil() as usize
    }
}

/// Product quantization parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    /// Quantize only when at least this many vectors are available.
    pub min_batch_size: usize,
    /// Number of subspaces; `None` picks a default from the dimension.
    pub subspaces: Option<usize>,
    /// Upper bound on centroids per subspace.
    pub max_centroids: usize,
    /// Upper bound on Lloyd iterations when training.
    pub kmeans_iterations: usize,
    /// Lloyd iterations when refining an existing codebook.
    pub refine_rounds: usize,
    /// Seed for k-means++ initialization.
    pub seed: u64,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            min_batch_size: DEFAULT_MIN_BATCH_SIZE_FOR_QUANTIZATION,
            subspaces: None,
            max_centroids: MAX_PQ_CENTROIDS,
            kmeans_iterations: 25,
            refine_rounds: 1,
            seed: 42,
        }
    }
}

impl QuantizationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_batch_size == 0 {
            return Err(IndexError::config("min_batch_size must be > 0"));
        }
        if self.max_centroids == 0 || self.max_centroids > MAX_PQ_CENTROIDS {
            return Err(IndexError::config(format!(
                "max_centroids must be in 1..={MAX_PQ_CENTROIDS}, got {}",
                self.max_centroids
            )));
        }
        if self.subspaces == Some(0) {
            return Err(IndexError::config("subspaces must be > 0"));
        }
        if self.kmeans_iterations == 0 {
            return Err(IndexError::config("kmeans_iterations must be > 0"));
        }
        Ok(())
    }

    /// Number of subspaces for a dimension.
    ///
    /// Explicit values must divide the dimension. The default is the largest
    /// divisor of the dimension that is at most `dimension / 4` (at least 1).
    pub fn subspaces_for(&self, dimension: usize) -> Result<usize> {
        match self.subspaces {
            Some(m) if m > dimension || dimension % m != 0 => Err(IndexError::config(format!(
                "subspaces ({m}) must divide the dimension ({dimension})"
            ))),
            Some(m) => Ok(m),
            None => {
                let target = (dimension / 4).max(1);
                Ok((1..=target).rev().find(|m| dimension % m == 0).unwrap_or(1))
            }
        }
    }

    /// Centroids per subspace for a training set of `n` vectors.
    #[inline]
    pub fn centroids_for(&self, n: usize) -> usize {
        self.max_centroids.min(n).max(1)
    }
}

/// Merge parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Largest ordinal space the on-disk format accepts.
    pub max_graph_ordinals: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_graph_ordinals: i32::MAX as u64,
        }
    }
}

/// Everything a segment writer or merger needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub graph: GraphConfig,
    pub quantization: QuantizationConfig,
    pub merge: MergeConfig,
}

impl IndexConfig {
    pub fn validate(&self) -> Result<()> {
        self.graph.validate()?;
        self.quantization.validate()?;
        if self.merge.max_graph_ordinals == 0 || self.merge.max_graph_ordinals > i32::MAX as u64 {
            return Err(IndexError::config(format!(
                "max_graph_ordinals must be in 1..={}, got {}",
                i32::MAX,
                self.merge.max_graph_ordinals
            )));
        }
        Ok(())
    }
}

/// Query-time parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Number of results.
    pub k: usize,
    /// The beam keeps `k * over_query_factor` candidates for reranking.
    pub over_query_factor: usize,
    /// Results scoring below this are dropped.
    pub threshold: f32,
    /// Approximate candidates scoring below this are not reranked.
    pub rerank_floor: f32,
}

impl SearchParams {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(IndexError::config("k must be > 0"));
        }
        if self.over_query_factor == 0 {
            return Err(IndexError::config("over_query_factor must be > 0"));
        }
        Ok(())
    }

    /// Candidate budget of the beam.
    #[inline]
    pub fn rerank_k(&self) -> usize {
        self.k.saturating_mul(self.over_query_factor).max(self.k)
    }
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            k: 10,
            over_query_factor: DEFAULT_OVER_QUERY_FACTOR,
            threshold: DEFAULT_QUERY_SIMILARITY_THRESHOLD,
            rerank_floor: DEFAULT_QUERY_RERANK_FLOOR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        IndexConfig::default().validate().unwrap();
        SearchParams::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_graph_values() {
        let cfg = GraphConfig {
            alpha: 0.5,
            ..GraphConfig::default()
        };
        assert!(cfg.validate().unwrap_err().is_configuration());

        let cfg = GraphConfig {
            neighbor_overflow: f32::NAN,
            ..GraphConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overflow_degree_rounds_up() {
        let cfg = GraphConfig {
            max_degree: 10,
            neighbor_overflow: 1.25,
            ..GraphConfig::default()
        };
        assert_eq!(cfg.overflow_degree(), 13);
    }

    #[test]
    fn subspace_heuristic_divides_dimension() {
        let q = QuantizationConfig::default();
        assert_eq!(q.subspaces_for(128).unwrap(), 32);
        assert_eq!(q.subspaces_for(2).unwrap(), 1);
        assert_eq!(q.subspaces_for(30).unwrap(), 6);

        let explicit = QuantizationConfig {
            subspaces: Some(7),
            ..QuantizationConfig::default()
        };
        assert!(explicit.subspaces_for(16).is_err());
    }

    #[test]
    fn centroids_capped_by_sample_count() {
        let q = QuantizationConfig::default();
        assert_eq!(q.centroids_for(100), 100);
        assert_eq!(q.centroids_for(5000), 256);
    }

    #[test]
    fn rerank_budget() {
        let p = SearchParams::new(3);
        assert_eq!(p.rerank_k(), 15);
    }
}
