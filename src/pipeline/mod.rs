//! Manifest-driven ingest and retrieve.
//!
//! ```text
//!   Idle ──ingest──▶ Ingesting ──▶ Bound ──retrieve──▶ Retrieving ──▶ Idle
//! ```
//!
//! Ingest embeds every configured video, stores it under `ingest.output_dir`
//! and writes `{index.dir}/BIND.txt` pointing at that directory. Approximate
//! index types are then rebuilt from the stored vectors. Retrieve resolves the
//! bound embedding root (falling back to `ingest.output_dir`), searches it
//! with the configured backend and writes the results file.

pub mod encoder;
pub mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clipdex_core::codec;
use parking_lot::Mutex;

use crate::cancel::CancelFlag;
use crate::config::{load_manifest, IndexDesignConfig, PipelineManifest};
use crate::embedding_store::{EmbeddingMetadata, EmbeddingStore, OwnerType};
use crate::error::{ErrorKind, Result, RetrievalError};
use crate::index::{open_backend, IndexPaths, IndexType, ReindexReport, SearchHit, SegmentedIndex};
use crate::results::ResultsWriter;

pub use encoder::{Encoder, PrecomputedEncoder};
pub use worker::{execute, Action, IngestWork, RetrieveWork, Work, WorkData, WorkOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Ingesting,
    Bound,
    Retrieving,
}

/// What to do when one item fails to ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestPolicy {
    /// Log, record the failure and move on to the next item.
    ContinueOnError,
    /// Stop at the first failure; without an encoder nothing is written.
    FailFast,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestFailure {
    pub input: PathBuf,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub processed: usize,
    pub failures: Vec<IngestFailure>,
    pub bound: bool,
    pub reindex: Option<ReindexReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrieveReport {
    pub embedding_root: PathBuf,
    pub backend: &'static str,
    pub hits: Vec<SearchHit>,
    pub output_path: PathBuf,
}

pub struct Pipeline {
    manifest: PipelineManifest,
    design: IndexDesignConfig,
    encoder: Option<Arc<dyn Encoder>>,
    state: Mutex<PipelineState>,
    cancel: CancelFlag,
}

impl Pipeline {
    pub fn new(manifest: PipelineManifest, encoder: Option<Arc<dyn Encoder>>) -> Result<Self> {
        manifest.validate()?;
        let design = manifest.design()?;
        Ok(Self {
            manifest,
            design,
            encoder,
            state: Mutex::new(PipelineState::Idle),
            cancel: CancelFlag::new(),
        })
    }

    pub fn from_manifest_path(path: &Path, encoder: Option<Arc<dyn Encoder>>) -> Result<Self> {
        Self::new(load_manifest(path)?, encoder)
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn manifest(&self) -> &PipelineManifest {
        &self.manifest
    }

    pub fn design(&self) -> &IndexDesignConfig {
        &self.design
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn set_state(&self, next: PipelineState) {
        let mut state = self.state.lock();
        tracing::debug!("pipeline_state from={:?} to={:?}", *state, next);
        *state = next;
    }

    fn store(&self) -> EmbeddingStore {
        EmbeddingStore::single_variant(&self.manifest.ingest.output_dir)
    }

    /// Continue-on-error ingestion.
    pub fn ingest(&self) -> Result<IngestReport> {
        self.ingest_with(IngestPolicy::ContinueOnError)
    }

    pub fn ingest_with(&self, policy: IngestPolicy) -> Result<IngestReport> {
        self.set_state(PipelineState::Ingesting);
        let result = self.run_ingest(policy);
        self.set_state(match &result {
            Ok(report) if report.bound => PipelineState::Bound,
            _ => PipelineState::Idle,
        });
        result
    }

    fn run_ingest(&self, policy: IngestPolicy) -> Result<IngestReport> {
        let videos = &self.manifest.ingest.videos;
        if policy == IngestPolicy::FailFast && self.encoder.is_none() && !videos.is_empty() {
            return Err(RetrievalError::EncoderUnavailable(format!(
                "no encoder configured for variant {}",
                self.manifest.variant
            )));
        }
        std::fs::create_dir_all(&self.manifest.ingest.output_dir)?;

        let store = self.store();
        let swept = store.collect_garbage()?;
        if swept > 0 {
            tracing::info!("ingest_swept_temp_files count={}", swept);
        }
        let mut processed = 0usize;
        let mut failures = Vec::new();
        for video in videos {
            self.cancel.check()?;
            match self.ingest_one(&store, video) {
                Ok(()) => processed += 1,
                Err(err) if policy == IngestPolicy::ContinueOnError && !is_fatal(&err) => {
                    tracing::warn!("ingest_item_failed input={:?} kind={} err={}", video, err.kind(), err);
                    failures.push(IngestFailure {
                        input: video.clone(),
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        let bound = processed > 0 || videos.is_empty();
        let mut reindex = None;
        if bound {
            self.bind()?;
            if self.design.index_type != IndexType::Flat {
                let index = SegmentedIndex::open(&self.manifest.index.dir, self.design.clone())?;
                reindex = Some(index.reindex(&self.manifest.ingest.output_dir, Some(&self.cancel))?);
            }
        }

        tracing::info!(
            "ingest_complete variant={} processed={} failed={} bound={}",
            self.manifest.variant,
            processed,
            failures.len(),
            bound
        );
        Ok(IngestReport {
            processed,
            failures,
            bound,
            reindex,
        })
    }

    fn ingest_one(&self, store: &EmbeddingStore, video: &Path) -> Result<()> {
        let encoder = self.encoder.as_ref().ok_or_else(|| {
            RetrievalError::EncoderUnavailable(format!(
                "no encoder configured for variant {}",
                self.manifest.variant
            ))
        })?;
        let id = video
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| RetrievalError::Config(format!("cannot derive an id from {:?}", video)))?;

        let vector = encoder.embed(video, self.manifest.frame_count, self.manifest.batch_size)?;
        let metadata = EmbeddingMetadata::new(video.display().to_string(), self.manifest.frame_count);
        store.store(OwnerType::Video, id, &self.manifest.variant, &vector, metadata)?;
        Ok(())
    }

    /// Write `BIND.txt` with the absolute embedding output directory.
    pub fn bind(&self) -> Result<PathBuf> {
        let output_dir = &self.manifest.ingest.output_dir;
        let absolute = std::fs::canonicalize(output_dir).unwrap_or_else(|_| output_dir.clone());
        let marker = IndexPaths::new(&self.manifest.index.dir).bind_marker();
        codec::atomic_write(&marker, absolute.to_string_lossy().as_bytes())?;
        tracing::info!("bound index_dir={:?} embeddings={:?}", self.manifest.index.dir, absolute);
        Ok(marker)
    }

    /// Embedding root recorded by ingest, or `ingest.output_dir` when the
    /// index directory has no usable marker.
    pub fn resolve_embedding_root(&self) -> Result<PathBuf> {
        let marker = IndexPaths::new(&self.manifest.index.dir).bind_marker();
        match std::fs::read_to_string(&marker) {
            Ok(text) if !text.trim().is_empty() => Ok(PathBuf::from(text.trim())),
            Ok(_) => Ok(self.manifest.ingest.output_dir.clone()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("bind_marker_missing path={:?} fallback=output_dir", marker);
                Ok(self.manifest.ingest.output_dir.clone())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn retrieve(&self) -> Result<RetrieveReport> {
        self.set_state(PipelineState::Retrieving);
        let result = self.run_retrieve();
        self.set_state(PipelineState::Idle);
        result
    }

    fn run_retrieve(&self) -> Result<RetrieveReport> {
        self.cancel.check()?;
        let embedding_root = self.resolve_embedding_root()?;
        let backend = open_backend(&self.design, &self.manifest.index.dir, &embedding_root)?;

        let query = codec::read_vector(&self.manifest.query.query_vec_path)?;
        let hits = backend.search_top_k(&query, self.manifest.query.top_k)?;
        self.cancel.check()?;

        let output_path = self.manifest.query.output_path.clone();
        ResultsWriter::write_json(&output_path, &hits)?;
        tracing::info!(
            "retrieve_complete backend={} root={:?} hits={}",
            backend.name(),
            embedding_root,
            hits.len()
        );
        Ok(RetrieveReport {
            embedding_root,
            backend: backend.name(),
            hits,
            output_path,
        })
    }
}

/// Errors that stop continue-on-error ingestion anyway.
fn is_fatal(err: &RetrievalError) -> bool {
    matches!(
        err,
        RetrievalError::Cancelled
            | RetrievalError::ManifestIntegrity(_)
            | RetrievalError::UnsupportedSchema { .. }
    )
}
