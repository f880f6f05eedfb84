//! Pipeline manifest: the declarative input of one ingest/retrieve run.
//!
//! ```json
//! {
//!   "variant": "clip_vit_b32",
//!   "frame_count": 32,
//!   "batch_size": 8,
//!   "index":  { "dir": "index/clip_vit_b32", "type": "FLAT", "nlist": 4096, "pq_m": 16, "nprobe": 16 },
//!   "ingest": { "videos": ["a.mp4"], "output_dir": "out/embeddings/clip_vit_b32" },
//!   "query":  { "query_vec_path": "query/query.f32", "top_k": 50, "output_path": "out/results/q1.json" }
//! }
//! ```
//!
//! Every key is optional and unknown keys are ignored. Relative paths are
//! resolved against the directory holding the manifest file.

use std::path::{Path, PathBuf};

use clipdex_core::Metric;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RetrievalError};
use crate::index::IndexType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineManifest {
    pub variant: String,
    pub frame_count: usize,
    pub batch_size: usize,
    pub index: IndexCfg,
    pub ingest: IngestCfg,
    pub query: QueryCfg,
}

impl Default for PipelineManifest {
    fn default() -> Self {
        Self {
            variant: "clip_vit_b32".to_string(),
            frame_count: 32,
            batch_size: 8,
            index: IndexCfg::default(),
            ingest: IngestCfg::default(),
            query: QueryCfg::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexCfg {
    pub dir: PathBuf,
    /// `FLAT` | `IVF_PQ` | `HNSW`; anything else is treated as `FLAT`.
    #[serde(rename = "type")]
    pub index_type: String,
    pub nlist: usize,
    pub pq_m: usize,
    pub nprobe: usize,
    pub metric: String,
    pub pq_bits: u32,
    pub hnsw_m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub segment_target_n: usize,
    pub compaction_enabled: bool,
    pub compaction_min_segments: usize,
    pub auto_train: bool,
    pub train_sample_max: usize,
    pub refine_factor: usize,
}

impl Default for IndexCfg {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("index/clip_vit_b32"),
            index_type: "FLAT".to_string(),
            nlist: 4096,
            pq_m: 16,
            nprobe: 16,
            metric: "ip".to_string(),
            pq_bits: 8,
            hnsw_m: 32,
            ef_construction: 200,
            ef_search: 64,
            segment_target_n: 512,
            compaction_enabled: false,
            compaction_min_segments: 16,
            auto_train: true,
            train_sample_max: 10_000,
            refine_factor: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestCfg {
    pub videos: Vec<PathBuf>,
    pub output_dir: PathBuf,
}

impl Default for IngestCfg {
    fn default() -> Self {
        Self {
            videos: Vec::new(),
            output_dir: PathBuf::from("out/embeddings/clip_vit_b32"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryCfg {
    pub query_vec_path: PathBuf,
    pub top_k: usize,
    pub output_path: PathBuf,
}

impl Default for QueryCfg {
    fn default() -> Self {
        Self {
            query_vec_path: PathBuf::from("query/query.f32"),
            top_k: 50,
            output_path: PathBuf::from("out/results/q1.json"),
        }
    }
}

impl PipelineManifest {
    pub fn from_json(json: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(json)
            .map_err(|e| RetrievalError::Config(format!("parsing pipeline manifest: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.variant.trim().is_empty() {
            return Err(RetrievalError::Config("variant must not be empty".into()));
        }
        if self.frame_count == 0 || self.batch_size == 0 {
            return Err(RetrievalError::Config(
                "frame_count and batch_size must be positive".into(),
            ));
        }
        parse_metric(&self.index.metric)?;
        if self.index.pq_bits == 0 || self.index.pq_bits > 8 {
            return Err(RetrievalError::Config(format!(
                "pq_bits must be in 1..=8, got {}",
                self.index.pq_bits
            )));
        }
        Ok(())
    }

    /// Rewrites relative paths so they are anchored at `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let anchor = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        anchor(&mut self.index.dir);
        anchor(&mut self.ingest.output_dir);
        anchor(&mut self.query.query_vec_path);
        anchor(&mut self.query.output_path);
        for video in &mut self.ingest.videos {
            anchor(video);
        }
    }

    pub fn design(&self) -> Result<IndexDesignConfig> {
        IndexDesignConfig::from_manifest(self)
    }
}

/// Load and validate a pipeline manifest from disk.
pub fn load_manifest<P: AsRef<Path>>(path: P) -> Result<PipelineManifest> {
    let path = path.as_ref();
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(RetrievalError::ManifestNotFound(path.to_path_buf()));
        }
        Err(err) => return Err(err.into()),
    };
    let mut manifest = PipelineManifest::from_json(&text)?;
    if let Some(base) = path.parent() {
        manifest.resolve_paths(base);
    }
    Ok(manifest)
}

pub fn parse_metric(value: &str) -> Result<Metric> {
    match value.trim().to_ascii_lowercase().as_str() {
        "ip" | "cosine" => Ok(Metric::Ip),
        "l2" => Ok(Metric::L2),
        other => Err(RetrievalError::Config(format!("unknown metric '{}'", other))),
    }
}

/// Index design parameters, derived once per run and handed to the segmented
/// manager by value.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDesignConfig {
    pub index_type: IndexType,
    pub variant: String,
    pub metric: Metric,
    pub nlist: usize,
    pub pq_m: usize,
    pub pq_bits: u32,
    pub nprobe: usize,
    pub hnsw_m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub segment_target_n: usize,
    pub compaction_enabled: bool,
    pub compaction_min_segments: usize,
    pub auto_train: bool,
    pub train_sample_max: usize,
    pub refine_factor: usize,
    pub seed: u64,
}

impl Default for IndexDesignConfig {
    fn default() -> Self {
        let cfg = IndexCfg::default();
        Self::from_index_cfg(&cfg, IndexType::Flat, "base", Metric::Ip)
    }
}

impl IndexDesignConfig {
    pub fn from_manifest(manifest: &PipelineManifest) -> Result<Self> {
        let metric = parse_metric(&manifest.index.metric)?;
        let index_type = IndexType::parse_lenient(&manifest.index.index_type);
        Ok(Self::from_index_cfg(
            &manifest.index,
            index_type,
            &manifest.variant,
            metric,
        ))
    }

    fn from_index_cfg(cfg: &IndexCfg, index_type: IndexType, variant: &str, metric: Metric) -> Self {
        Self {
            index_type,
            variant: variant.to_string(),
            metric,
            nlist: cfg.nlist.max(1),
            pq_m: cfg.pq_m.max(1),
            pq_bits: cfg.pq_bits.clamp(1, 8),
            nprobe: cfg.nprobe.max(1),
            hnsw_m: cfg.hnsw_m.max(2),
            ef_construction: cfg.ef_construction.max(1),
            ef_search: cfg.ef_search.max(1),
            segment_target_n: cfg.segment_target_n.max(1),
            compaction_enabled: cfg.compaction_enabled,
            compaction_min_segments: cfg.compaction_min_segments.max(2),
            auto_train: cfg.auto_train,
            train_sample_max: cfg.train_sample_max.max(1),
            refine_factor: cfg.refine_factor.max(1),
            seed: 42,
        }
    }

    pub fn with_index_type(mut self, index_type: IndexType) -> Self {
        self.index_type = index_type;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_apply_to_empty_object() {
        let m = PipelineManifest::from_json("{}").unwrap();
        assert_eq!(m.frame_count, 32);
        assert_eq!(m.batch_size, 8);
        assert_eq!(m.query.top_k, 50);
        assert_eq!(m.index.index_type, "FLAT");
        assert_eq!(m.index.segment_target_n, 512);
    }

    #[test]
    fn test_unknown_keys_ignored_and_nested_partial() {
        let m = PipelineManifest::from_json(
            r#"{"variant":"v1","future_knob":true,"index":{"type":"HNSW","hnsw_m":8},"query":{"top_k":3}}"#,
        )
        .unwrap();
        assert_eq!(m.variant, "v1");
        assert_eq!(m.index.index_type, "HNSW");
        assert_eq!(m.index.hnsw_m, 8);
        assert_eq!(m.index.nprobe, 16);
        assert_eq!(m.query.top_k, 3);
        assert_eq!(m.design().unwrap().index_type, IndexType::Hnsw);
    }

    #[test]
    fn test_bad_values_are_config_errors() {
        assert!(matches!(
            PipelineManifest::from_json(r#"{"batch_size":0}"#),
            Err(RetrievalError::Config(_))
        ));
        assert!(matches!(
            PipelineManifest::from_json(r#"{"index":{"metric":"hamming"}}"#),
            Err(RetrievalError::Config(_))
        ));
        assert!(matches!(
            PipelineManifest::from_json("not json"),
            Err(RetrievalError::Config(_))
        ));
    }

    #[test]
    fn test_missing_manifest_is_not_found() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            load_manifest(dir.path().join("absent.json")),
            Err(RetrievalError::ManifestNotFound(_))
        ));
    }

    #[test]
    fn test_relative_paths_anchor_at_manifest_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(
            &path,
            r#"{"index":{"dir":"idx"},"ingest":{"videos":["a.mp4","/abs/b.mp4"],"output_dir":"emb"}}"#,
        )
        .unwrap();
        let m = load_manifest(&path).unwrap();
        assert_eq!(m.index.dir, dir.path().join("idx"));
        assert_eq!(m.ingest.output_dir, dir.path().join("emb"));
        assert_eq!(m.ingest.videos[0], dir.path().join("a.mp4"));
        assert_eq!(m.ingest.videos[1], PathBuf::from("/abs/b.mp4"));
    }
}
