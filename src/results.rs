//! Ranked hits as `{"ids": [...], "scores": [...]}`.

use std::path::Path;

use clipdex_core::codec::atomic_write;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::index::SearchHit;

/// Parallel `ids`/`scores` arrays, best hit first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultsFile {
    pub ids: Vec<String>,
    pub scores: Vec<f32>,
}

impl ResultsFile {
    pub fn from_hits(hits: &[SearchHit]) -> Self {
        Self {
            ids: hits.iter().map(|h| h.id.clone()).collect(),
            scores: hits.iter().map(|h| h.score).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

pub struct ResultsWriter;

impl ResultsWriter {
    /// Pretty-printed JSON, written through temp file + rename.
    pub fn write_json(path: &Path, hits: &[SearchHit]) -> Result<()> {
        let json = serde_json::to_vec_pretty(&ResultsFile::from_hits(hits))?;
        atomic_write(path, &json)?;
        tracing::info!("results_written path={:?} hits={}", path, hits.len());
        Ok(())
    }
}
