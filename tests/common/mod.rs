//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use segann::codec::{FieldInfo, FieldMetadata};
use segann::config::{IndexConfig, SearchParams};
use segann::graph::NoFilter;
use segann::pool::BuildPools;
use segann::segment::{SegmentReader, SegmentWriter};
use segann::Similarity;

pub const FIELD: &str = "embedding";

pub fn pools() -> BuildPools {
    BuildPools::new(4, 1).unwrap()
}

/// Smaller graphs than the defaults so the suites stay fast.
pub fn small_config() -> IndexConfig {
    let mut config = IndexConfig::default();
    config.graph.max_degree = 16;
    config.graph.beam_width = 64;
    config
}

pub fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dim).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect())
        .collect()
}

/// `(external id, vector)` pairs with ids `first_id..`.
pub fn docs(vectors: Vec<Vec<f32>>, first_id: u32) -> Vec<(u32, Vec<f32>)> {
    vectors
        .into_iter()
        .enumerate()
        .map(|(i, v)| (first_id + i as u32, v))
        .collect()
}

pub fn write_segment(
    dir: &Path,
    name: &str,
    config: IndexConfig,
    similarity: Similarity,
    docs: &[(u32, Vec<f32>)],
) -> Vec<FieldMetadata> {
    let dim = docs.first().map_or(4, |(_, v)| v.len());
    let mut writer = SegmentWriter::new(dir, name, config, pools()).unwrap();
    let field = writer
        .add_field(FieldInfo::new(FIELD, 0, dim, similarity))
        .unwrap();
    for (id, v) in docs {
        field.add(*id, v).unwrap();
    }
    writer.finish().unwrap()
}

/// Exact top-k external ids.
pub fn ground_truth(query: &[f32], docs: &[(u32, Vec<f32>)], similarity: Similarity, k: usize) -> Vec<u32> {
    let mut scored: Vec<(u32, f32)> = docs
        .iter()
        .map(|(id, v)| (*id, similarity.score(query, v)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    scored.into_iter().take(k).map(|(id, _)| id).collect()
}

pub fn recall_at_k(ground_truth: &[u32], retrieved: &[u32], k: usize) -> f32 {
    let gt: HashSet<u32> = ground_truth.iter().take(k).copied().collect();
    let got: HashSet<u32> = retrieved.iter().take(k).copied().collect();
    gt.intersection(&got).count() as f32 / k as f32
}

/// Search the test field and map hits to external ids.
pub fn search_ids(reader: &SegmentReader, query: &[f32], params: &SearchParams) -> Vec<u32> {
    let field = reader.field(FIELD).unwrap();
    reader
        .search(FIELD, query, params, &NoFilter)
        .unwrap()
        .nodes
        .iter()
        .map(|n| field.external_id(n.node).unwrap())
        .collect()
}

/// Mean recall over `queries`.
pub fn mean_recall(
    reader: &SegmentReader,
    docs: &[(u32, Vec<f32>)],
    queries: &[Vec<f32>],
    params: &SearchParams,
) -> f32 {
    let similarity = reader.field(FIELD).unwrap().info().similarity;
    let total: f32 = queries
        .iter()
        .map(|q| {
            let truth = ground_truth(q, docs, similarity, params.k);
            recall_at_k(&truth, &search_ids(reader, q, params), params.k)
        })
        .sum();
    total / queries.len() as f32
}
