//! On-disk segment format.
//!
//! A field's graph is written as one region: a header, one fixed-size record
//! per base-layer ordinal (optionally carrying the vector inline), then the
//! upper layers sorted by ordinal, then separated vectors if configured. An
//! optional PQ region follows. [`OrdinalMapper`] decides how in-memory node ids
//! become persisted ordinals; [`OnDiskGraph`] reads a region in place.

pub mod doc_map;
pub mod format;
pub mod mapper;
pub mod meta;
pub mod reader;
pub mod writer;

pub use doc_map::OrdToDocMap;
pub use mapper::{IdentityMapper, OrdinalMapper, SequentialMapper};
pub use meta::{read_meta, write_meta, FieldInfo, FieldMetadata, VectorEncoding};
pub use reader::{OnDiskGraph, SharedBytes};
pub use writer::GraphWriter;
