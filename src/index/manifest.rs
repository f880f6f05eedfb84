//! `MANIFEST.json`: the single source of truth for what a segmented index
//! can serve.
//!
//! ```json
//! {
//!   "schemaVersion": 1,
//!   "dim": 512,
//!   "metric": "ip",
//!   "indexType": "IVF_PQ",
//!   "variant": "clip_vit_b32",
//!   "params": { "nlist": 256, "pqM": 16, "nprobe": 16 },
//!   "segments": [
//!     { "file": "segments/seg-1700000000000-512.vec",
//!       "idsFile": "segments/seg-1700000000000-512.ids.json",
//!       "count": 512, "timestamp": 1700000000000, "sha256": "…" }
//!   ],
//!   "trained": true,
//!   "trainInfo": "ivf_pq nlist=256 m=16 ksub=256 sample=10000",
//!   "modelFile": "ivfpq-1700000000999.model"
//! }
//! ```
//!
//! Rewrites always go through temp-file + rename. Every file the manifest
//! names is written before the manifest that names it, and superseded files
//! are deleted only after the replacement manifest is published.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use clipdex_core::codec::atomic_write;
use clipdex_core::Metric;
use serde::{Deserialize, Serialize};

use super::IndexType;
use crate::error::{Result, RetrievalError};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMeta {
    pub file: String,
    pub ids_file: String,
    pub count: usize,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexManifest {
    pub schema_version: u32,
    pub dim: usize,
    pub metric: Metric,
    pub index_type: IndexType,
    pub variant: String,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
    #[serde(default)]
    pub segments: Vec<SegmentMeta>,
    #[serde(default)]
    pub trained: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_info: Option<String>,
    /// Trained IVF-PQ model paired with these params.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_file: Option<String>,
}

impl IndexManifest {
    pub fn new(dim: usize, metric: Metric, index_type: IndexType, variant: &str) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            dim,
            metric,
            index_type,
            variant: variant.to_string(),
            params: BTreeMap::new(),
            segments: Vec::new(),
            // FLAT never needs a training pass.
            trained: !index_type.requires_training(),
            train_info: None,
            model_file: None,
        }
    }

    /// `Ok(None)` if no manifest has been published yet.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        // Check the version before the full parse so a future layout is
        // reported as such rather than as a field error.
        let probe: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| RetrievalError::integrity(format!("unreadable manifest {:?}: {}", path, e)))?;
        let version = probe
            .get("schemaVersion")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| RetrievalError::integrity(format!("manifest {:?} has no schemaVersion", path)))?;
        if version == 0 || version > SCHEMA_VERSION as u64 {
            return Err(RetrievalError::UnsupportedSchema {
                found: version.min(u32::MAX as u64) as u32,
                supported: SCHEMA_VERSION,
            });
        }

        let manifest: Self = serde_json::from_value(probe)
            .map_err(|e| RetrievalError::integrity(format!("invalid manifest {:?}: {}", path, e)))?;
        manifest.validate()?;
        Ok(Some(manifest))
    }

    /// Atomically replace the manifest at `path`.
    pub fn publish(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let json = serde_json::to_vec_pretty(self)?;
        atomic_write(path, &json)?;
        tracing::debug!(
            "manifest_published path={:?} segments={} trained={}",
            path,
            self.segments.len(),
            self.trained
        );
        Ok(())
    }

    /// Structural checks that do not touch segment files.
    pub fn validate(&self) -> Result<()> {
        if !self.segments.is_empty() && self.dim == 0 {
            return Err(RetrievalError::integrity("manifest has segments but dim=0"));
        }
        let mut seen = HashSet::new();
        for seg in &self.segments {
            if !seen.insert(seg.file.as_str()) || !seen.insert(seg.ids_file.as_str()) {
                return Err(RetrievalError::integrity(format!(
                    "segment {} listed more than once",
                    seg.file
                )));
            }
            if seg.file.contains("..") || seg.ids_file.contains("..") {
                return Err(RetrievalError::integrity(format!(
                    "segment path escapes index root: {}",
                    seg.file
                )));
            }
        }
        if let Some(model) = &self.model_file {
            if model.is_empty() || model.contains("..") || model.contains(['/', '\\']) {
                return Err(RetrievalError::integrity(format!(
                    "model file must be a plain name in the index root: {:?}",
                    model
                )));
            }
        }
        Ok(())
    }

    pub fn total_vectors(&self) -> usize {
        self.segments.iter().map(|s| s.count).sum()
    }

    pub fn is_searchable(&self) -> bool {
        self.trained || !self.index_type.requires_training()
    }

    pub fn param(&self, key: &str) -> Option<usize> {
        self.params.get(key).map(|v| v.max(0.0) as usize)
    }

    /// Every file name (manifest-relative) the manifest references.
    pub fn referenced_files(&self) -> HashSet<String> {
        self.segments
            .iter()
            .flat_map(|s| [s.file.clone(), s.ids_file.clone()])
            .chain(self.model_file.clone())
            .collect()
    }
}
