//! Product quantization (PQ).
//!
//! A vector is split into `M` equal-width subvectors; each subvector is replaced
//! by the index of its nearest centroid in that subspace's codebook of `K`
//! centroids, so a code is `M` bytes.
//!
//! # Centering
//!
//! For Euclidean fields the dataset mean is subtracted before training and
//! encoding, which tightens the codebooks. Dot-product and cosine fields are
//! never centered: shifting the origin would bias inner-product scores.
//!
//! # Scoring
//!
//! Approximate scores use asymmetric distance computation (ADC): per query,
//! a table of partial scores against every (uncentered) centroid is built once,
//! after which scoring a code costs `M` table lookups.

pub mod kmeans;
mod vectors;

pub use vectors::{PqScorer, PqVectors};

use crate::config::QuantizationConfig;
use crate::error::{IndexError, Result};
use crate::similarity::{score_from_dot, score_from_squared_l2, Similarity};
use crate::simd;
use crate::store::VectorValues;
use kmeans::{nearest_centroid, KMeans};
use rayon::prelude::*;
use tracing::{debug, info};

/// Training uses at most this many vectors (sampled evenly).
pub const MAX_TRAINING_SET_SIZE: usize = 128_000;

/// Trained product quantizer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductQuantizer {
    dimension: usize,
    subspaces: usize,
    centroids_per_subspace: usize,
    subvector_dim: usize,
    /// `[subspace][centroid][subvector_dim]`, flat
    codebooks: Vec<f32>,
    /// Dataset mean subtracted before encoding, if centered
    global_centroid: Option<Vec<f32>>,
}

impl ProductQuantizer {
    /// Train `m` codebooks of `k` centroids over `vectors`.
    ///
    /// Runs subspaces in parallel on the caller's installed rayon pool.
    pub fn train(
        vectors: &dyn VectorValues,
        m: usize,
        k: usize,
        center: bool,
        config: &QuantizationConfig,
    ) -> Result<Self> {
        let dimension = vectors.dimension();
        let n = vectors.size();
        if m == 0 || dimension % m != 0 {
            return Err(IndexError::config(format!(
                "subspaces ({m}) must divide the dimension ({dimension})"
            )));
        }
        if k == 0 || k > crate::config::MAX_PQ_CENTROIDS {
            return Err(IndexError::config(format!(
                "centroids per subspace must be in 1..=256, got {k}"
            )));
        }
        if n < k {
            return Err(IndexError::config(format!(
                "need at least {k} vectors to train, got {n}"
            )));
        }

        let sample = sample_ordinals(n, MAX_TRAINING_SET_SIZE);
        let mut training = Vec::with_capacity(sample.len() * dimension);
        for &ord in &sample {
            training.extend_from_slice(&vectors.vector(ord)?);
        }

        let global_centroid = if center {
            let mut mean = vec![0.0f32; dimension];
            for v in training.chunks_exact(dimension) {
                simd::add_assign(&mut mean, v);
            }
            simd::scale(&mut mean, 1.0 / sample.len() as f32);
            for v in training.chunks_exact_mut(dimension) {
                simd::sub_assign(v, &mean);
            }
            Some(mean)
        } else {
            None
        };

        let subvector_dim = dimension / m;
        let per_subspace: Vec<Vec<f32>> = (0..m)
            .into_par_iter()
            .map(|s| {
                let sub = extract_subspace(&training, dimension, s, subvector_dim);
                let mut km = KMeans::new(subvector_dim, k)?.with_seed(config.seed ^ s as u64);
                km.fit(&sub, config.kmeans_iterations)?;
                Ok(km.into_centroids())
            })
            .collect::<Result<_>>()?;

        debug!(
            subspaces = m,
            centroids = k,
            training_vectors = sample.len(),
            centered = center,
            "trained product quantizer"
        );

        Ok(Self {
            dimension,
            subspaces: m,
            centroids_per_subspace: k,
            subvector_dim,
            codebooks: per_subspace.concat(),
            global_centroid,
        })
    }

    /// Train a quantizer for a batch, or return `None` when the batch is below
    /// `config.min_batch_size`.
    pub fn train_for_batch(
        vectors: &dyn VectorValues,
        similarity: Similarity,
        config: &QuantizationConfig,
    ) -> Result<Option<Self>> {
        let n = vectors.size();
        if n < config.min_batch_size {
            info!(
                vector_count = n,
                min_batch_size = config.min_batch_size,
                "vector count below quantization threshold, using full precision vectors"
            );
            return Ok(None);
        }
        let m = config.subspaces_for(vectors.dimension())?;
        let k = config.centroids_for(n);
        info!(
            vector_count = n,
            subspaces = m,
            centroids = k,
            "calculating codebooks"
        );
        let start = std::time::Instant::now();
        let pq = Self::train(vectors, m, k, similarity.centers_for_quantization(), config)?;
        info!(
            millis = start.elapsed().as_millis() as u64,
            "computed codebooks"
        );
        Ok(Some(pq))
    }

    /// Refine the codebooks with more data without discarding prior structure.
    ///
    /// Runs `rounds` Lloyd iterations per subspace starting from the existing
    /// centroids; the centering mean and `K` stay as they are.
    pub fn refine(&mut self, vectors: &dyn VectorValues, rounds: usize) -> Result<()> {
        if vectors.dimension() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vectors.dimension(),
            });
        }
        if vectors.size() == 0 || rounds == 0 {
            return Ok(());
        }

        let sample = sample_ordinals(vectors.size(), MAX_TRAINING_SET_SIZE);
        let mut data = Vec::with_capacity(sample.len() * self.dimension);
        for &ord in &sample {
            let start = data.len();
            data.extend_from_slice(&vectors.vector(ord)?);
            if let Some(mean) = &self.global_centroid {
                simd::sub_assign(&mut data[start..], mean);
            }
        }

        let sub_dim = self.subvector_dim;
        let book_len = self.centroids_per_subspace * sub_dim;
        let dimension = self.dimension;
        let refined: Vec<Vec<f32>> = self
            .codebooks
            .par_chunks_exact(book_len)
            .enumerate()
            .map(|(s, book)| {
                let sub = extract_subspace(&data, dimension, s, sub_dim);
                let mut km = KMeans::from_centroids(sub_dim, book.to_vec())?;
                km.refine(&sub, rounds)?;
                Ok(km.into_centroids())
            })
            .collect::<Result<_>>()?;

        self.codebooks = refined.concat();
        debug!(
            vectors = sample.len(),
            rounds, "refined product quantizer"
        );
        Ok(())
    }

    /// Encode one vector into `out` (`M` bytes).
    pub fn encode_into(&self, vector: &[f32], out: &mut [u8]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let mut centered;
        let v = match &self.global_centroid {
            Some(mean) => {
                centered = vector.to_vec();
                simd::sub_assign(&mut centered, mean);
                &centered[..]
            }
            None => vector,
        };
        for (s, code) in out.iter_mut().enumerate().take(self.subspaces) {
            let sub = &v[s * self.subvector_dim..(s + 1) * self.subvector_dim];
            *code = nearest_centroid(self.codebook(s), self.subvector_dim, sub) as u8;
        }
        Ok(())
    }

    /// Encode one vector.
    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        let mut code = vec![0u8; self.subspaces];
        self.encode_into(vector, &mut code)?;
        Ok(code)
    }

    /// Reconstruct the (uncentered) approximation of a code.
    pub fn decode(&self, code: &[u8]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dimension);
        for (s, &c) in code.iter().enumerate().take(self.subspaces) {
            out.extend_from_slice(self.centroid(s, c as usize));
        }
        if let Some(mean) = &self.global_centroid {
            simd::add_assign(&mut out, mean);
        }
        out
    }

    /// Precompute the ADC table for `query`.
    pub fn score_table(&self, query: &[f32], similarity: Similarity) -> Result<AdcTable> {
        if query.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        let k = self.centroids_per_subspace;
        let sub_dim = self.subvector_dim;
        let mut partial = Vec::with_capacity(self.subspaces * k);
        let mut norms = match similarity {
            Similarity::Cosine => Vec::with_capacity(self.subspaces * k),
            _ => Vec::new(),
        };
        let mut centroid = vec![0.0f32; sub_dim];

        for s in 0..self.subspaces {
            let q = &query[s * sub_dim..(s + 1) * sub_dim];
            for c in 0..k {
                // Score against the uncentered reconstruction
                centroid.copy_from_slice(self.centroid(s, c));
                if let Some(mean) = &self.global_centroid {
                    simd::add_assign(&mut centroid, &mean[s * sub_dim..(s + 1) * sub_dim]);
                }
                match similarity {
                    Similarity::Euclidean => {
                        partial.push(simd::l2_distance_squared(q, &centroid))
                    }
                    Similarity::DotProduct => partial.push(simd::dot(q, &centroid)),
                    Similarity::Cosine => {
                        partial.push(simd::dot(q, &centroid));
                        norms.push(simd::dot(&centroid, &centroid));
                    }
                }
            }
        }

        Ok(AdcTable {
            similarity,
            centroids_per_subspace: k,
            partial,
            norms,
            query_norm: simd::norm(query),
        })
    }

    #[inline]
    fn codebook(&self, subspace: usize) -> &[f32] {
        let len = self.centroids_per_subspace * self.subvector_dim;
        &self.codebooks[subspace * len..(subspace + 1) * len]
    }

    #[inline]
    fn centroid(&self, subspace: usize, centroid: usize) -> &[f32] {
        let start = centroid * self.subvector_dim;
        &self.codebook(subspace)[start..start + self.subvector_dim]
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// `M`, also the code length in bytes.
    pub fn subspaces(&self) -> usize {
        self.subspaces
    }

    /// `K`.
    pub fn centroids_per_subspace(&self) -> usize {
        self.centroids_per_subspace
    }

    pub fn global_centroid(&self) -> Option<&[f32]> {
        self.global_centroid.as_deref()
    }

    pub(crate) fn codebooks(&self) -> &[f32] {
        &self.codebooks
    }

    pub(crate) fn from_parts(
        dimension: usize,
        subspaces: usize,
        centroids_per_subspace: usize,
        codebooks: Vec<f32>,
        global_centroid: Option<Vec<f32>>,
    ) -> Result<Self> {
        if subspaces == 0 || dimension % subspaces != 0 {
            return Err(IndexError::format(format!(
                "invalid PQ shape: dimension {dimension}, subspaces {subspaces}"
            )));
        }
        if centroids_per_subspace == 0 || centroids_per_subspace > crate::config::MAX_PQ_CENTROIDS
        {
            return Err(IndexError::format(format!(
                "invalid PQ centroid count {centroids_per_subspace}"
            )));
        }
        if codebooks.len() != dimension * centroids_per_subspace {
            return Err(IndexError::format(format!(
                "PQ codebook length {} does not match {dimension}x{centroids_per_subspace}",
                codebooks.len()
            )));
        }
        if global_centroid.as_ref().is_some_and(|c| c.len() != dimension) {
            return Err(IndexError::format("PQ global centroid has wrong dimension"));
        }
        Ok(Self {
            dimension,
            subspaces,
            centroids_per_subspace,
            subvector_dim: dimension / subspaces,
            codebooks,
            global_centroid,
        })
    }
}

/// Per-query lookup table for approximate scores.
#[derive(Debug, Clone)]
pub struct AdcTable {
    similarity: Similarity,
    centroids_per_subspace: usize,
    partial: Vec<f32>,
    norms: Vec<f32>,
    query_norm: f32,
}

impl AdcTable {
    /// Approximate score of a PQ code.
    #[inline]
    pub fn score(&self, code: &[u8]) -> f32 {
        let k = self.centroids_per_subspace;
        let mut sum = 0.0f32;
        for (s, &c) in code.iter().enumerate() {
            sum += self.partial[s * k + c as usize];
        }
        match self.similarity {
            Similarity::Euclidean => score_from_squared_l2(sum),
            Similarity::DotProduct => score_from_dot(sum),
            Similarity::Cosine => {
                let mut norm2 = 0.0f32;
                for (s, &c) in code.iter().enumerate() {
                    norm2 += self.norms[s * k + c as usize];
                }
                let denom = self.query_norm * norm2.sqrt();
                if denom <= 1e-9 {
                    score_from_dot(0.0)
                } else {
                    score_from_dot((sum / denom).clamp(-1.0, 1.0))
                }
            }
        }
    }
}

/// Copy one subspace of every vector into a contiguous buffer.
fn extract_subspace(data: &[f32], dimension: usize, subspace: usize, sub_dim: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(data.len() / dimension * sub_dim);
    for v in data.chunks_exact(dimension) {
        out.extend_from_slice(&v[subspace * sub_dim..(subspace + 1) * sub_dim]);
    }
    out
}

/// Up to `limit` ordinals spread evenly over `[0, n)`.
fn sample_ordinals(n: usize, limit: usize) -> Vec<u32> {
    if n <= limit {
        return (0..n as u32).collect();
    }
    (0..limit)
        .map(|i| ((i as u64 * n as u64) / limit as u64) as u32)
        .collect()
}
