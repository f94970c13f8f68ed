//! segann: segment-oriented graph ANN index.
//!
//! Vectors are written per segment: a layered navigable graph over each field's
//! vectors, pruned for diversity, optionally guided by product quantization,
//! persisted in an immutable on-disk format. Segments are consolidated by
//! merges that either extend the largest segment's graph or rebuild.
//!
//! - [`segment::SegmentWriter`]: buffer `(external id, vector)` pairs, flush, publish.
//! - [`segment::SegmentReader`]: open a published segment and search it.
//! - [`merge::Merger`]: merge published segments, honoring deletions and doc maps.
//! - [`graph`]: the in-memory graph, builder, diversity pruner and beam search.
//! - [`pq`]: product quantization (training, refinement, ADC scoring).
//! - [`codec`]: the binary format.
//!
//! # Scores
//!
//! Every score is "higher is better". Euclidean fields score `1 / (1 + d²)`,
//! dot-product and cosine fields `(1 + x) / 2`. Search thresholds and rerank
//! floors are expressed in the same units.
//!
//! # Threading
//!
//! Builds and merges never touch a global pool. Callers pass a
//! [`pool::BuildPools`] with one pool for vector math and one for merge
//! orchestration. Searches run on the caller's thread.
//!
//! # Example
//!
//! ```no_run
//! use segann::codec::FieldInfo;
//! use segann::config::{IndexConfig, SearchParams};
//! use segann::graph::NoFilter;
//! use segann::pool::BuildPools;
//! use segann::segment::{SegmentReader, SegmentWriter};
//! use segann::similarity::Similarity;
//!
//! # fn main() -> segann::Result<()> {
//! let dir = std::env::temp_dir();
//! let pools = BuildPools::new(0, 1)?;
//! let mut writer = SegmentWriter::new(&dir, "seg0", IndexConfig::default(), pools)?;
//! let field = writer.add_field(FieldInfo::new("embedding", 0, 3, Similarity::Cosine))?;
//! field.add(17, &[0.1, 0.2, 0.3])?;
//! field.add(42, &[0.3, 0.2, 0.1])?;
//! writer.finish()?;
//!
//! let reader = SegmentReader::open(&dir, "seg0")?;
//! let hits = reader.search("embedding", &[0.1, 0.2, 0.3], &SearchParams::new(1), &NoFilter)?;
//! let field = reader.field("embedding").expect("field exists");
//! assert_eq!(field.external_id(hits.nodes[0].node), Some(17));
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod graph;
pub mod merge;
pub mod pool;
pub mod pq;
pub mod segment;
pub mod similarity;
pub mod simd;
pub mod store;

pub use error::{IndexError, Result};
pub use similarity::Similarity;
