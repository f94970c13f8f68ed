//! k-means clustering for PQ codebook training.
//!
//! Squared-L2 k-means with k-means++ seeding and Lloyd refinement. Assignment
//! runs data-parallel on whatever rayon pool the caller installed.

use crate::error::{IndexError, Result};
use crate::simd;
use rayon::prelude::*;

/// k-means over a flat `num_vectors x dimension` buffer.
pub struct KMeans {
    /// Centroids (k x dimension), flat
    centroids: Vec<f32>,
    dimension: usize,
    k: usize,
    seed: u64,
}

impl KMeans {
    /// Create new k-means with k clusters.
    pub fn new(dimension: usize, k: usize) -> Result<Self> {
        if dimension == 0 || k == 0 {
            return Err(IndexError::config("dimension and k must be greater than 0"));
        }

        Ok(Self {
            centroids: Vec::new(),
            dimension,
            k,
            seed: 0,
        })
    }

    /// Start from existing centroids (used when refining a codebook).
    pub fn from_centroids(dimension: usize, centroids: Vec<f32>) -> Result<Self> {
        if dimension == 0 || centroids.is_empty() || centroids.len() % dimension != 0 {
            return Err(IndexError::config(format!(
                "centroid buffer of length {} does not hold whole {dimension}-d centroids",
                centroids.len()
            )));
        }
        let k = centroids.len() / dimension;
        Ok(Self {
            centroids,
            dimension,
            k,
            seed: 0,
        })
    }

    /// Deterministic seed for k-means++ initialization.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Train on vectors: k-means++ initialization, then up to `max_iterations`
    /// Lloyd rounds (stops early once centroids stop moving).
    pub fn fit(&mut self, vectors: &[f32], max_iterations: usize) -> Result<()> {
        let num_vectors = self.count(vectors)?;
        if num_vectors < self.k {
            return Err(IndexError::config(format!(
                "need at least k={} vectors, got {num_vectors}",
                self.k
            )));
        }

        self.centroids = self.kmeans_plus_plus(vectors, num_vectors);
        self.lloyd(vectors, max_iterations);
        Ok(())
    }

    /// Run `rounds` Lloyd iterations over `vectors` starting from the current
    /// centroids. Centroids that attract no vector keep their position, so
    /// structure learned from earlier data is not discarded.
    pub fn refine(&mut self, vectors: &[f32], rounds: usize) -> Result<()> {
        self.count(vectors)?;
        if self.centroids.is_empty() {
            return Err(IndexError::illegal_state("refine called before fit"));
        }
        self.lloyd(vectors, rounds);
        Ok(())
    }

    fn lloyd(&mut self, vectors: &[f32], rounds: usize) {
        for _ in 0..rounds {
            let assignments = self.assign_clusters(vectors);
            let new_centroids = self.update_centroids(vectors, &assignments);

            let converged = self
                .centroids
                .chunks_exact(self.dimension)
                .zip(new_centroids.chunks_exact(self.dimension))
                .all(|(old, new)| simd::l2_distance_squared(old, new) <= 1e-12);

            self.centroids = new_centroids;
            if converged {
                break;
            }
        }
    }

    fn count(&self, vectors: &[f32]) -> Result<usize> {
        if vectors.is_empty() || vectors.len() % self.dimension != 0 {
            return Err(IndexError::config(format!(
                "training buffer of length {} does not hold whole {}-d vectors",
                vectors.len(),
                self.dimension
            )));
        }
        Ok(vectors.len() / self.dimension)
    }

    /// k-means++ initialization.
    fn kmeans_plus_plus(&self, vectors: &[f32], num_vectors: usize) -> Vec<f32> {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut centroids = Vec::with_capacity(self.k * self.dimension);

        let first = rng.random_range(0..num_vectors);
        centroids.extend_from_slice(self.get_vector(vectors, first));

        // Distance from each vector to its nearest chosen centroid
        let mut nearest: Vec<f32> = (0..num_vectors)
            .map(|i| simd::l2_distance_squared(self.get_vector(vectors, i), &centroids))
            .collect();

        for _ in 1..self.k {
            let total: f64 = nearest.iter().map(|&d| d as f64).sum();
            let chosen = if total <= 0.0 {
                // All remaining points coincide with a centroid
                rng.random_range(0..num_vectors)
            } else {
                let threshold = rng.random::<f64>() * total;
                let mut cumulative = 0.0;
                let mut pick = num_vectors - 1;
                for (i, &d) in nearest.iter().enumerate() {
                    cumulative += d as f64;
                    if cumulative >= threshold {
                        pick = i;
                        break;
                    }
                }
                pick
            };

            let start = centroids.len();
            centroids.extend_from_slice(self.get_vector(vectors, chosen));
            let newest = &centroids[start..];
            for (i, d) in nearest.iter_mut().enumerate() {
                let candidate = simd::l2_distance_squared(self.get_vector(vectors, i), newest);
                if candidate < *d {
                    *d = candidate;
                }
            }
        }

        centroids
    }

    /// Assign each vector to its nearest centroid.
    pub fn assign_clusters(&self, vectors: &[f32]) -> Vec<usize> {
        vectors
            .par_chunks_exact(self.dimension)
            .map(|v| self.nearest(v))
            .collect()
    }

    /// Index of the centroid nearest to `v`.
    #[inline]
    pub fn nearest(&self, v: &[f32]) -> usize {
        nearest_centroid(&self.centroids, self.dimension, v)
    }

    /// Update centroids based on assignments.
    fn update_centroids(&self, vectors: &[f32], assignments: &[usize]) -> Vec<f32> {
        let mut sums = vec![0.0f32; self.k * self.dimension];
        let mut counts = vec![0usize; self.k];

        for (v, &cluster) in vectors.chunks_exact(self.dimension).zip(assignments) {
            counts[cluster] += 1;
            let start = cluster * self.dimension;
            simd::add_assign(&mut sums[start..start + self.dimension], v);
        }

        for (cluster, &count) in counts.iter().enumerate() {
            let range = cluster * self.dimension..(cluster + 1) * self.dimension;
            if count > 0 {
                simd::scale(&mut sums[range], 1.0 / count as f32);
            } else {
                // Empty cluster: keep old centroid
                sums[range.clone()].copy_from_slice(&self.centroids[range]);
            }
        }

        sums
    }

    fn get_vector<'a>(&self, vectors: &'a [f32], idx: usize) -> &'a [f32] {
        let start = idx * self.dimension;
        &vectors[start..start + self.dimension]
    }

    /// Flat centroids.
    pub fn centroids(&self) -> &[f32] {
        &self.centroids
    }

    pub fn into_centroids(self) -> Vec<f32> {
        self.centroids
    }

    pub fn k(&self) -> usize {
        self.k
    }
}

/// Index of the centroid in a flat buffer nearest to `v` (squared L2).
#[inline]
pub(crate) fn nearest_centroid(centroids: &[f32], dimension: usize, v: &[f32]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (idx, c) in centroids.chunks_exact(dimension).enumerate() {
        let d = simd::l2_distance_squared(v, c);
        if d < best_dist {
            best_dist = d;
            best = idx;
        }
    }
    best
}
