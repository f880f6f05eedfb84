//! Index backends.
//!
//! Every backend answers the same question: the `k` stored vectors most
//! similar to a query, best first. [`FlatIndex`] scans the embedding root
//! and is the exact reference; [`SegmentedIndex`] serves FLAT, IVF-PQ and
//! HNSW over sealed segments described by a manifest.

pub mod flat;
pub mod hnsw;
pub mod ivfpq;
pub mod manifest;
pub mod paths;
pub mod recovery;
pub mod segments;
pub mod topk;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::IndexDesignConfig;
use crate::error::Result;

pub use flat::FlatIndex;
pub use manifest::{IndexManifest, SegmentMeta};
pub use paths::IndexPaths;
pub use recovery::{recover, verify, RecoveryReport, VerifyReport};
pub use segments::{
    CompactionReport, IndexStats, ReindexReport, SegmentedIndex, Snapshot, TrainReport,
};
pub use topk::TopK;

/// One ranked result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
}

impl SearchHit {
    pub fn new(id: impl Into<String>, score: f32) -> Self {
        Self {
            id: id.into(),
            score,
        }
    }
}

pub(crate) fn hits_from_topk(top: TopK<String>) -> Vec<SearchHit> {
    top.into_sorted()
        .into_iter()
        .map(|(id, score)| SearchHit { id, score })
        .collect()
}

/// Search contract shared by all backends.
///
/// Returns at most `k` hits ordered by descending score; equal scores are
/// ordered by id.
pub trait IndexBackend: Send + Sync {
    fn search_top_k(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IndexType {
    #[default]
    #[serde(rename = "FLAT")]
    Flat,
    #[serde(rename = "IVF_PQ")]
    IvfPq,
    #[serde(rename = "HNSW")]
    Hnsw,
}

impl IndexType {
    /// Unrecognized names fall back to `Flat`.
    pub fn parse_lenient(value: &str) -> Self {
        let normalized = value.trim().to_ascii_uppercase().replace('-', "_");
        match normalized.as_str() {
            "FLAT" | "" => IndexType::Flat,
            "IVF_PQ" | "IVFPQ" | "FAISS_IVFPQ" | "FAISS_IVF_PQ" => IndexType::IvfPq,
            "HNSW" | "FAISS_HNSW" => IndexType::Hnsw,
            _ => {
                tracing::warn!("unknown_index_type value={:?} fallback=FLAT", value);
                IndexType::Flat
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexType::Flat => "FLAT",
            IndexType::IvfPq => "IVF_PQ",
            IndexType::Hnsw => "HNSW",
        }
    }

    pub fn requires_training(&self) -> bool {
        !matches!(self, IndexType::Flat)
    }
}

/// Backend for a retrieval run: `FLAT` scans `embedding_root` directly, the
/// approximate types open the segmented index at `index_dir`.
pub fn open_backend(
    design: &IndexDesignConfig,
    index_dir: &Path,
    embedding_root: &Path,
) -> Result<Box<dyn IndexBackend>> {
    match design.index_type {
        IndexType::Flat => Ok(Box::new(FlatIndex::new(embedding_root))),
        IndexType::IvfPq | IndexType::Hnsw => {
            let index = SegmentedIndex::open(index_dir, design.clone())?;
            Ok(Box::new(index))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_type_parse_is_lenient() {
        assert_eq!(IndexType::parse_lenient("flat"), IndexType::Flat);
        assert_eq!(IndexType::parse_lenient("FAISS_IVFPQ"), IndexType::IvfPq);
        assert_eq!(IndexType::parse_lenient("ivf-pq"), IndexType::IvfPq);
        assert_eq!(IndexType::parse_lenient(" hnsw "), IndexType::Hnsw);
        assert_eq!(IndexType::parse_lenient("ANNOY"), IndexType::Flat);
    }

    #[test]
    fn test_index_type_serde_names() {
        assert_eq!(serde_json::to_string(&IndexType::IvfPq).unwrap(), "\"IVF_PQ\"");
        let t: IndexType = serde_json::from_str("\"HNSW\"").unwrap();
        assert_eq!(t, IndexType::Hnsw);
    }
}
