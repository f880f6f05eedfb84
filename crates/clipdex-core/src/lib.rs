//! clipdex core: vector codec, similarity kernels, segment files and ANN building blocks
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        HNSW graphs · IVF coarse quantizer · PQ + ADC        │
//! ├─────────────────────────────────────────────────────────────┤
//! │              k-means training (seeded, clamped)             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SegmentVectors (mmap .vec)  ·  raw .f32 codec (atomic IO)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing here knows about manifests or pipelines; the `clipdex` crate
//! composes these pieces into index backends.

pub mod codec;
pub mod format;
pub mod hnsw;
pub mod ivf;
pub mod metric;
pub mod pq;
pub mod segment;
pub mod training;

pub use codec::{read_vector, read_vector_dim, write_vector, CodecError};
pub use format::{SegmentHeader, SegmentWriter};
pub use hnsw::{HnswGraph, HnswParams};
pub use ivf::CoarseQuantizer;
pub use metric::{cosine_normalized, dot_product, l2_normalize, l2_normalized, Metric};
pub use pq::ProductQuantizer;
pub use segment::SegmentVectors;
