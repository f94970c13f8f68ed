//! Merging published segments.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::*;
use roaring::RoaringBitmap;
use segann::codec::FieldInfo;
use segann::config::{IndexConfig, QuantizationConfig, SearchParams};
use segann::graph::{GraphView, NoFilter};
use segann::merge::{DocMap, MergeSource, MergeStrategy, Merger, QuantizationDecision};
use segann::segment::{data_path, meta_path, SegmentReader, SegmentWriter};
use segann::{IndexError, Similarity};

fn wide_search(k: usize) -> SearchParams {
    SearchParams {
        k,
        over_query_factor: 10,
        ..SearchParams::default()
    }
}

fn pq_config(min_batch_size: usize) -> IndexConfig {
    let mut config = small_config();
    config.quantization = QuantizationConfig {
        min_batch_size,
        max_centroids: 16,
        kmeans_iterations: 8,
        ..QuantizationConfig::default()
    };
    config
}

/// Every live node's edges stay inside the graph and never point at holes.
fn assert_no_dangling(reader: &SegmentReader) {
    let field = reader.field(FIELD).unwrap();
    let graph = field.graph();
    for level in 0..graph.num_layers() {
        for node in graph.layer_nodes(level) {
            assert!(field.external_id(node).is_some(), "node {node} has no external id");
            for n in graph.neighbors(level, node).unwrap() {
                assert!(graph.contains(n), "{node} -> {n} dangles on layer {level}");
                assert!(field.external_id(n).is_some());
            }
        }
    }
}

#[test]
fn merged_segment_keeps_recall() {
    let dir = tempfile::tempdir().unwrap();
    let a = docs(random_vectors(100, 8, 1), 0);
    let b = docs(random_vectors(200, 8, 2), 100);
    write_segment(dir.path(), "a", IndexConfig::default(), Similarity::Euclidean, &a);
    write_segment(dir.path(), "b", IndexConfig::default(), Similarity::Euclidean, &b);

    let ra = SegmentReader::open(dir.path(), "a").unwrap();
    let rb = SegmentReader::open(dir.path(), "b").unwrap();
    let merger = Merger::new(IndexConfig::default(), pools()).unwrap();
    let out = merger
        .merge(&[MergeSource::new(&ra), MergeSource::new(&rb)], dir.path(), "ab")
        .unwrap();

    let stats = out.stats.field(FIELD).unwrap();
    assert_eq!(stats.strategy, MergeStrategy::Incremental);
    assert_eq!(stats.quantization, QuantizationDecision::None);
    assert_eq!(stats.leading_source, 1);
    assert_eq!(stats.live_vectors, 300);

    let merged = SegmentReader::open(dir.path(), "ab").unwrap();
    assert_eq!(merged.field(FIELD).unwrap().live_count(), 300);
    assert_no_dangling(&merged);

    let all: Vec<(u32, Vec<f32>)> = a.into_iter().chain(b).collect();
    let queries = random_vectors(10, 8, 77);
    let recall = mean_recall(&merged, &all, &queries, &wide_search(10));
    assert!(recall >= 0.99, "recall {recall}");

    // Sources stay readable.
    assert_eq!(ra.field(FIELD).unwrap().live_count(), 100);
}

#[test]
fn deleted_documents_never_come_back() {
    let dir = tempfile::tempdir().unwrap();
    let a = docs(random_vectors(200, 8, 3), 0);
    let b = docs(random_vectors(100, 8, 4), 200);
    write_segment(dir.path(), "a", small_config(), Similarity::Euclidean, &a);
    write_segment(dir.path(), "b", small_config(), Similarity::Euclidean, &b);
    let ra = SegmentReader::open(dir.path(), "a").unwrap();
    let rb = SegmentReader::open(dir.path(), "b").unwrap();

    let live: RoaringBitmap = (0..200u32).filter(|d| d % 7 != 0).collect();
    let merger = Merger::new(small_config(), pools()).unwrap();
    let out = merger
        .merge(
            &[MergeSource::new(&ra).with_live_docs(live), MergeSource::new(&rb)],
            dir.path(),
            "merged",
        )
        .unwrap();
    let stats = out.stats.field(FIELD).unwrap();
    assert_eq!(stats.strategy, MergeStrategy::Incremental);
    assert_eq!(stats.leading_source, 0);
    assert_eq!(stats.live_vectors, 271);

    let merged = SegmentReader::open(dir.path(), "merged").unwrap();
    let field = merged.field(FIELD).unwrap();
    assert_eq!(field.live_count(), 271);
    assert_eq!(field.doc_map().live_count(), 271);
    // Deleted ordinals of the leading graph remain as holes.
    assert!(field.doc_map().len() > 271);
    for ord in (0..200u32).filter(|o| o % 7 == 0) {
        assert!(!field.graph().contains(ord));
        assert_eq!(field.external_id(ord), None);
    }
    assert_no_dangling(&merged);

    for (id, vector) in a.iter().filter(|(id, _)| id % 7 == 0) {
        let hits = search_ids(&merged, vector, &SearchParams::new(20));
        assert!(!hits.contains(id), "deleted doc {id} returned");
    }
    let survivors: Vec<(u32, Vec<f32>)> = a
        .into_iter()
        .filter(|(id, _)| id % 7 != 0)
        .chain(b)
        .collect();
    let recall = mean_recall(&merged, &survivors, &random_vectors(10, 8, 8), &wide_search(10));
    assert!(recall >= 0.9, "recall {recall}");
}

#[test]
fn oversized_ordinal_space_falls_back_to_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let a = docs(random_vectors(200, 8, 5), 0);
    let b = docs(random_vectors(100, 8, 6), 1000);
    write_segment(dir.path(), "a", small_config(), Similarity::DotProduct, &a);
    write_segment(dir.path(), "b", small_config(), Similarity::DotProduct, &b);
    let ra = SegmentReader::open(dir.path(), "a").unwrap();
    let rb = SegmentReader::open(dir.path(), "b").unwrap();

    let mut config = small_config();
    config.merge.max_graph_ordinals = 250;
    let live: RoaringBitmap = (0..100u32).collect();
    let out = Merger::new(config, pools())
        .unwrap()
        .merge(
            &[MergeSource::new(&ra).with_live_docs(live), MergeSource::new(&rb)],
            dir.path(),
            "m",
        )
        .unwrap();
    let stats = out.stats.field(FIELD).unwrap();
    assert_eq!(stats.strategy, MergeStrategy::Rebuild);
    assert_eq!(stats.leading_source, 0);

    let merged = SegmentReader::open(dir.path(), "m").unwrap();
    let field = merged.field(FIELD).unwrap();
    // Rebuilt graphs are dense.
    assert_eq!(field.live_count(), 200);
    assert_eq!(field.doc_map().len(), 200);
    let ids: HashSet<u32> = (0..200).filter_map(|o| field.external_id(o)).collect();
    let expected: HashSet<u32> = (0..100).chain(1000..1100).collect();
    assert_eq!(ids, expected);
    assert_no_dangling(&merged);
}

#[test]
fn live_vectors_above_the_format_limit_fail() {
    let dir = tempfile::tempdir().unwrap();
    write_segment(dir.path(), "a", small_config(), Similarity::Euclidean, &docs(random_vectors(60, 4, 1), 0));
    write_segment(dir.path(), "b", small_config(), Similarity::Euclidean, &docs(random_vectors(60, 4, 2), 60));
    let ra = SegmentReader::open(dir.path(), "a").unwrap();
    let rb = SegmentReader::open(dir.path(), "b").unwrap();

    let mut config = small_config();
    config.merge.max_graph_ordinals = 100;
    let err = Merger::new(config, pools())
        .unwrap()
        .merge(&[MergeSource::new(&ra), MergeSource::new(&rb)], dir.path(), "m")
        .unwrap_err();
    assert!(err.is_capacity(), "{err}");
    assert!(!meta_path(dir.path(), "m").exists());
}

#[test]
fn existing_codebook_is_refined() {
    let dir = tempfile::tempdir().unwrap();
    let a = docs(random_vectors(128, 16, 9), 0);
    let b = docs(random_vectors(40, 16, 10), 500);
    let fa = write_segment(dir.path(), "a", pq_config(64), Similarity::Euclidean, &a);
    let fb = write_segment(dir.path(), "b", pq_config(64), Similarity::Euclidean, &b);
    assert!(fa[0].has_pq());
    assert!(!fb[0].has_pq());
    let ra = SegmentReader::open(dir.path(), "a").unwrap();
    let rb = SegmentReader::open(dir.path(), "b").unwrap();

    let out = Merger::new(pq_config(64), pools())
        .unwrap()
        .merge(&[MergeSource::new(&rb), MergeSource::new(&ra)], dir.path(), "m")
        .unwrap();
    let stats = out.stats.field(FIELD).unwrap();
    assert_eq!(stats.quantization, QuantizationDecision::Refined);
    assert_eq!(stats.strategy, MergeStrategy::Rebuild);
    assert_eq!(stats.leading_source, 1);
    assert!(out.fields[0].has_pq());

    let merged = SegmentReader::open(dir.path(), "m").unwrap();
    let field = merged.field(FIELD).unwrap();
    assert_eq!(field.pq().unwrap().len(), 168);
    assert_no_dangling(&merged);

    let hit = search_ids(&merged, &b[3].1, &wide_search(1));
    assert_eq!(hit, vec![503]);
}

#[test]
fn codebook_is_trained_once_the_batch_is_large_enough() {
    let dir = tempfile::tempdir().unwrap();
    let a = docs(random_vectors(60, 16, 11), 0);
    let b = docs(random_vectors(50, 16, 12), 60);
    write_segment(dir.path(), "a", pq_config(100), Similarity::Euclidean, &a);
    write_segment(dir.path(), "b", pq_config(100), Similarity::Euclidean, &b);
    let ra = SegmentReader::open(dir.path(), "a").unwrap();
    let rb = SegmentReader::open(dir.path(), "b").unwrap();
    assert!(ra.field(FIELD).unwrap().pq().is_none());

    let out = Merger::new(pq_config(100), pools())
        .unwrap()
        .merge(&[MergeSource::new(&ra), MergeSource::new(&rb)], dir.path(), "m")
        .unwrap();
    let stats = out.stats.field(FIELD).unwrap();
    assert_eq!(stats.quantization, QuantizationDecision::Trained);
    assert_eq!(stats.strategy, MergeStrategy::Rebuild);

    // Below the threshold nothing is trained and the graph is extended.
    let live: RoaringBitmap = (0..30u32).collect();
    let out = Merger::new(pq_config(100), pools())
        .unwrap()
        .merge(
            &[MergeSource::new(&ra).with_live_docs(live), MergeSource::new(&rb)],
            dir.path(),
            "small",
        )
        .unwrap();
    let stats = out.stats.field(FIELD).unwrap();
    assert_eq!(stats.quantization, QuantizationDecision::None);
    assert_eq!(stats.strategy, MergeStrategy::Incremental);
    assert_eq!(stats.leading_source, 1);
    assert!(!out.fields[0].has_pq());
}

#[test]
fn doc_map_renumbers_and_drops() {
    let dir = tempfile::tempdir().unwrap();
    let a = docs(random_vectors(50, 4, 13), 0);
    write_segment(dir.path(), "a", small_config(), Similarity::Cosine, &a);
    let ra = SegmentReader::open(dir.path(), "a").unwrap();

    let renumber: Arc<dyn DocMap> = Arc::new(|doc: u32| (doc % 2 == 0).then_some(doc + 10_000));
    let out = Merger::new(small_config(), pools())
        .unwrap()
        .merge(&[MergeSource::new(&ra).with_doc_map(renumber)], dir.path(), "m")
        .unwrap();
    assert_eq!(out.stats.field(FIELD).unwrap().live_vectors, 25);

    let merged = SegmentReader::open(dir.path(), "m").unwrap();
    let field = merged.field(FIELD).unwrap();
    assert_eq!(field.live_count(), 25);
    for doc in (0..50u32).step_by(2) {
        let ord = field.doc_map().ordinal(doc + 10_000).unwrap();
        assert_eq!(field.vector(ord).unwrap().to_vec(), a[doc as usize].1);
    }
    let hits = search_ids(&merged, &a[10].1, &SearchParams::new(1));
    assert_eq!(hits, vec![10_010]);
    assert_no_dangling(&merged);
}

#[test]
fn duplicate_external_ids_abort_without_output() {
    let dir = tempfile::tempdir().unwrap();
    write_segment(dir.path(), "a", small_config(), Similarity::Euclidean, &docs(random_vectors(50, 4, 1), 0));
    write_segment(dir.path(), "b", small_config(), Similarity::Euclidean, &docs(random_vectors(50, 4, 2), 25));
    let ra = SegmentReader::open(dir.path(), "a").unwrap();
    let rb = SegmentReader::open(dir.path(), "b").unwrap();

    let err = Merger::new(small_config(), pools())
        .unwrap()
        .merge(&[MergeSource::new(&ra), MergeSource::new(&rb)], dir.path(), "m")
        .unwrap_err();
    assert!(err.is_integrity(), "{err}");

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("m."))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
    assert!(!data_path(dir.path(), "m").exists());
}

#[test]
fn incompatible_fields_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_segment(dir.path(), "a", small_config(), Similarity::Euclidean, &docs(random_vectors(10, 4, 1), 0));
    write_segment(dir.path(), "b", small_config(), Similarity::Cosine, &docs(random_vectors(10, 4, 2), 10));
    let ra = SegmentReader::open(dir.path(), "a").unwrap();
    let rb = SegmentReader::open(dir.path(), "b").unwrap();

    let merger = Merger::new(small_config(), pools()).unwrap();
    let err = merger
        .merge(&[MergeSource::new(&ra), MergeSource::new(&rb)], dir.path(), "m")
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(merger.merge(&[], dir.path(), "m").unwrap_err().is_configuration());
}

#[test]
fn fields_missing_from_some_sources_are_merged() {
    let dir = tempfile::tempdir().unwrap();
    write_segment(dir.path(), "a", small_config(), Similarity::Euclidean, &docs(random_vectors(30, 4, 1), 0));

    let mut writer = SegmentWriter::new(dir.path(), "b", small_config(), pools()).unwrap();
    let field = writer
        .add_field(FieldInfo::new("title", 1, 3, Similarity::DotProduct))
        .unwrap();
    for (id, v) in docs(random_vectors(20, 3, 2), 100) {
        field.add(id, &v).unwrap();
    }
    writer.finish().unwrap();

    let ra = SegmentReader::open(dir.path(), "a").unwrap();
    let rb = SegmentReader::open(dir.path(), "b").unwrap();
    let out = Merger::new(small_config(), pools())
        .unwrap()
        .merge(&[MergeSource::new(&ra), MergeSource::new(&rb)], dir.path(), "m")
        .unwrap();
    assert_eq!(out.fields.len(), 2);

    let merged = SegmentReader::open(dir.path(), "m").unwrap();
    assert_eq!(merged.field(FIELD).unwrap().live_count(), 30);
    assert_eq!(merged.field("title").unwrap().live_count(), 20);
    let hits = merged
        .search("title", &[0.0, 1.0, 0.0], &SearchParams::new(3), &NoFilter)
        .unwrap();
    assert_eq!(hits.nodes.len(), 3);
}

#[test]
fn merge_stats_serialize() {
    let dir = tempfile::tempdir().unwrap();
    write_segment(dir.path(), "a", small_config(), Similarity::Euclidean, &docs(random_vectors(10, 4, 1), 0));
    let ra = SegmentReader::open(dir.path(), "a").unwrap();
    let out = Merger::new(small_config(), pools())
        .unwrap()
        .merge(&[MergeSource::new(&ra)], dir.path(), "m")
        .unwrap();
    let json = serde_json::to_string(&out.stats).unwrap();
    assert!(json.contains("\"strategy\":\"Incremental\""), "{json}");
}
