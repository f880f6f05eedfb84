//! clipdex: video-text retrieval over stored CLIP embeddings
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Pipeline (ingest / retrieve, workers)          │
//! │        pipeline manifest ─▶ encoder ─▶ store ─▶ BIND.txt    │
//! └─────────────────────────────────────────────────────────────┘
//!               │                                 │
//!               ▼                                 ▼
//! ┌───────────────────────────┐   ┌─────────────────────────────┐
//! │      EmbeddingStore       │   │        IndexBackend         │
//! │  {variant}/{id}.f32+json  │◀──│ FlatIndex │ SegmentedIndex  │
//! └───────────────────────────┘   │  MANIFEST.json + segments/  │
//!                                 └─────────────────────────────┘
//!                                                 │
//!                                                 ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      clipdex-core                           │
//! │   codec · metric · segment format · PQ · IVF · HNSW graph   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod cancel;
pub mod config;
pub mod embedding_store;
pub mod error;
pub mod index;
pub mod inspect;
pub mod pipeline;
pub mod results;

pub use cancel::CancelFlag;
pub use config::{load_manifest, IndexDesignConfig, PipelineManifest};
pub use embedding_store::{EmbeddingMetadata, EmbeddingStore, OwnerType};
pub use error::{ErrorKind, Result, RetrievalError};
pub use index::{
    open_backend, FlatIndex, IndexBackend, IndexManifest, IndexType, SearchHit, SegmentedIndex,
};
pub use inspect::{inspect_vector, VectorSummary};
pub use pipeline::{Encoder, IngestReport, Pipeline, PrecomputedEncoder, RetrieveReport};
pub use results::{ResultsFile, ResultsWriter};
