//! Segmented index manager.
//!
//! Vectors accumulate in an in-memory open segment. Once it holds
//! `segment_target_n` rows it is sealed:
//!
//! 1. rows and ids are written under `.staging/` and fsynced
//! 2. both files are renamed into `segments/`
//! 3. `MANIFEST.json` is rewritten (temp + rename) to list the new segment
//!
//! A crash between steps leaves either staging garbage or an unreferenced
//! segment file; [`recover`](super::recover) removes both. Compaction,
//! retraining and reindex all write their new files first, publish one
//! manifest naming them, and only then delete what the old manifest named.
//!
//! Writers (append, seal, train, compact, reindex) are serialized by one
//! mutex. Readers take no lock: they take an immutable [`Snapshot`] that is
//! cached until the manifest file changes. A reader that loses a race with a
//! publish-then-delete writer sees files vanish under a manifest that is no
//! longer current, so it reloads instead of reporting an integrity error.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwapOption;
use clipdex_core::codec::{self, sync_parent};
use clipdex_core::format::{FormatError, SegmentWriter};
use clipdex_core::metric::l2_normalize;
use clipdex_core::segment::{SegmentError, SegmentVectors};
use clipdex_core::{HnswGraph, Metric};
use parking_lot::Mutex;
use rayon::prelude::*;
use sha2::{Digest, Sha256};

use super::hnsw::{build_graphs, params_from};
use super::ivfpq::{self, IvfPqLists, IvfPqModel};
use super::manifest::{IndexManifest, SegmentMeta};
use super::paths::IndexPaths;
use super::{hits_from_topk, IndexBackend, IndexType, SearchHit, TopK};
use crate::cancel::CancelFlag;
use crate::config::IndexDesignConfig;
use crate::embedding_store::list_vector_files;
use crate::error::{Result, RetrievalError};

#[derive(Debug, Default)]
struct OpenSegment {
    dim: Option<usize>,
    ids: Vec<String>,
    rows: Vec<f32>,
}

impl OpenSegment {
    fn len(&self) -> usize {
        self.ids.len()
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.rows.clear();
        self.dim = None;
    }
}

/// Reloads allowed while the manifest keeps moving under a reader.
const SNAPSHOT_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ManifestKey {
    len: u64,
    modified: Option<SystemTime>,
}

struct CachedSnapshot {
    key: ManifestKey,
    snapshot: Arc<Snapshot>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompactionReport {
    pub merged_segments: usize,
    pub vectors: usize,
    pub new_segment: Option<SegmentMeta>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub index_type: IndexType,
    pub sample: usize,
    pub info: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReindexReport {
    pub vectors: usize,
    pub segments: usize,
    pub trained: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexStats {
    pub index_type: Option<IndexType>,
    pub dim: usize,
    pub segments: usize,
    pub vectors: usize,
    pub pending: usize,
    pub trained: bool,
}

pub struct SegmentedIndex {
    paths: IndexPaths,
    design: IndexDesignConfig,
    writer: Mutex<OpenSegment>,
    cache: ArcSwapOption<CachedSnapshot>,
}

impl SegmentedIndex {
    /// Open an index root. Nothing is read until the first search or write.
    pub fn open<P: Into<PathBuf>>(root: P, design: IndexDesignConfig) -> Result<Self> {
        Ok(Self {
            paths: IndexPaths::new(root),
            design,
            writer: Mutex::new(OpenSegment::default()),
            cache: ArcSwapOption::empty(),
        })
    }

    pub fn paths(&self) -> &IndexPaths {
        &self.paths
    }

    pub fn design(&self) -> &IndexDesignConfig {
        &self.design
    }

    pub fn manifest(&self) -> Result<Option<IndexManifest>> {
        IndexManifest::load(&self.paths.manifest())
    }

    // ── Read path ──────────────────────────────────────────────────────

    /// Current published state, reloaded only when `MANIFEST.json` changed.
    /// `Ok(None)` when nothing has been published yet.
    ///
    /// An integrity failure is reported only when the manifest it was loaded
    /// from is still the published one.
    pub fn snapshot(&self) -> Result<Option<Arc<Snapshot>>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(key) = self.manifest_key()? else {
                return Ok(None);
            };
            if let Some(cached) = self.cache.load_full() {
                if cached.key == key {
                    return Ok(Some(cached.snapshot.clone()));
                }
            }

            let Some(manifest) = self.manifest()? else {
                return Ok(None);
            };
            let err = match Snapshot::load(&self.paths, manifest.clone(), &self.design) {
                Ok(snapshot) => {
                    let snapshot = Arc::new(snapshot);
                    self.cache.store(Some(Arc::new(CachedSnapshot {
                        key,
                        snapshot: snapshot.clone(),
                    })));
                    tracing::debug!(
                        "snapshot_loaded root={:?} segments={} vectors={}",
                        self.paths.root(),
                        snapshot.manifest.segments.len(),
                        snapshot.manifest.total_vectors()
                    );
                    return Ok(Some(snapshot));
                }
                Err(err) => err,
            };

            let superseded = matches!(err, RetrievalError::ManifestIntegrity(_))
                && attempt < SNAPSHOT_ATTEMPTS
                && self.manifest()?.as_ref() != Some(&manifest);
            if !superseded {
                return Err(err);
            }
            tracing::debug!(
                "snapshot_reload root={:?} attempt={} cause={}",
                self.paths.root(),
                attempt,
                err
            );
        }
    }

    fn manifest_key(&self) -> Result<Option<ManifestKey>> {
        match std::fs::metadata(self.paths.manifest()) {
            Ok(meta) => Ok(Some(ManifestKey {
                len: meta.len(),
                modified: meta.modified().ok(),
            })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn invalidate(&self) {
        self.cache.store(None);
    }

    // ── Write path ─────────────────────────────────────────────────────

    /// Buffer one vector; seals the open segment once it is full.
    pub fn append(&self, id: &str, vector: &[f32]) -> Result<Option<SegmentMeta>> {
        let mut open = self.writer.lock();
        self.append_locked(&mut open, id, vector)
    }

    /// Seal whatever is buffered, even below the target size.
    pub fn flush(&self) -> Result<Option<SegmentMeta>> {
        let mut open = self.writer.lock();
        self.flush_locked(&mut open)
    }

    pub fn pending(&self) -> usize {
        self.writer.lock().len()
    }

    fn append_locked(
        &self,
        open: &mut OpenSegment,
        id: &str,
        vector: &[f32],
    ) -> Result<Option<SegmentMeta>> {
        if id.is_empty() {
            return Err(RetrievalError::Config("vector id must not be empty".into()));
        }
        let dim = match open.dim {
            Some(dim) => dim,
            None => self
                .manifest()?
                .map(|m| m.dim)
                .filter(|&d| d > 0)
                .unwrap_or(vector.len()),
        };
        if vector.len() != dim || dim == 0 {
            return Err(RetrievalError::dim(format!("append {}", id), dim, vector.len()));
        }
        open.dim = Some(dim);

        let start = open.rows.len();
        open.rows.extend_from_slice(vector);
        if self.design.metric == Metric::Ip {
            l2_normalize(&mut open.rows[start..]);
        }
        open.ids.push(id.to_string());

        if open.len() >= self.design.segment_target_n {
            return self.flush_locked(open);
        }
        Ok(None)
    }

    fn flush_locked(&self, open: &mut OpenSegment) -> Result<Option<SegmentMeta>> {
        if open.len() == 0 {
            return Ok(None);
        }
        let dim = open.dim.unwrap_or(0);
        let meta = self.commit_segment_locked(&open.ids, &open.rows, dim)?;
        open.clear();
        self.maybe_compact_locked()?;
        Ok(Some(meta))
    }

    /// Write a sealed segment and publish a manifest that includes it.
    fn commit_segment_locked(&self, ids: &[String], rows: &[f32], dim: usize) -> Result<SegmentMeta> {
        let mut manifest = match self.manifest()? {
            Some(m) => m,
            None => IndexManifest::new(
                dim,
                self.design.metric,
                self.design.index_type,
                &self.design.variant,
            ),
        };
        if manifest.dim == 0 {
            manifest.dim = dim;
        } else if manifest.dim != dim {
            return Err(RetrievalError::dim("segment seal", manifest.dim, dim));
        }

        let meta = write_sealed_segment(&self.paths, ids, rows, dim)?;
        manifest.segments.push(meta.clone());
        manifest.publish(&self.paths.manifest())?;
        self.invalidate();

        tracing::info!(
            "segment_sealed file={} count={} total_segments={}",
            meta.file,
            meta.count,
            manifest.segments.len()
        );
        Ok(meta)
    }

    // ── Training ───────────────────────────────────────────────────────

    /// Train on a sample of the sealed segments (at most `train_sample_max`
    /// rows, evenly strided).
    pub fn train(&self) -> Result<TrainReport> {
        let _open = self.writer.lock();
        let manifest = self
            .manifest()?
            .filter(|m| m.total_vectors() > 0)
            .ok_or_else(|| RetrievalError::Config("index has no sealed vectors to train on".into()))?;
        let sample = sample_rows(&self.paths, &manifest, self.design.train_sample_max)?;
        self.train_on_locked(Some(manifest), sample)
    }

    /// Train on an explicit sample.
    pub fn train_on(&self, sample: Vec<Vec<f32>>) -> Result<TrainReport> {
        let _open = self.writer.lock();
        let manifest = self.manifest()?;
        self.train_on_locked(manifest, sample)
    }

    /// Train, publish, then drop the model the previous manifest named.
    fn train_on_locked(
        &self,
        manifest: Option<IndexManifest>,
        sample: Vec<Vec<f32>>,
    ) -> Result<TrainReport> {
        let mut manifest = manifest.unwrap_or_else(|| self.empty_manifest());
        let previous_model = manifest.model_file.clone();
        let report = self.stage_training(&mut manifest, sample)?;
        self.publish_or_discard(&manifest, &manifest.model_file)?;

        if let Some(old) = previous_model.filter(|old| manifest.model_file.as_ref() != Some(old)) {
            self.remove_files([&old], "retrain_cleanup_failed");
        }
        tracing::info!(
            "index_trained root={:?} type={} sample={} info={:?}",
            self.paths.root(),
            report.index_type.as_str(),
            report.sample,
            report.info
        );
        Ok(report)
    }

    /// Learn the configured structure into `manifest` without publishing it.
    /// An IVF-PQ model is written under a fresh name that nothing references
    /// until the caller publishes.
    fn stage_training(&self, manifest: &mut IndexManifest, mut sample: Vec<Vec<f32>>) -> Result<TrainReport> {
        let dim = sample.first().map(|v| v.len()).unwrap_or(0);
        if dim == 0 {
            return Err(RetrievalError::Config("training sample is empty".into()));
        }
        if let Some(bad) = sample.iter().find(|v| v.len() != dim) {
            return Err(RetrievalError::dim("training sample", dim, bad.len()));
        }
        if manifest.dim != 0 && manifest.dim != dim {
            return Err(RetrievalError::dim("training sample", manifest.dim, dim));
        }
        manifest.dim = dim;
        if manifest.metric == Metric::Ip {
            sample.iter_mut().for_each(|v| l2_normalize(v));
        }

        let index_type = self.design.index_type;
        let mut params = std::collections::BTreeMap::new();
        let mut model_file = None;
        let info = match index_type {
            IndexType::Flat => "flat exact scan".to_string(),
            IndexType::IvfPq => {
                let model = IvfPqModel::train(&sample, dim, &self.design)?;
                model_file = Some(write_model_file(&self.paths, &model)?);
                params.insert("nlist".to_string(), model.coarse.nlist() as f64);
                params.insert("pqM".to_string(), model.pq.num_subspaces as f64);
                params.insert("pqBits".to_string(), self.design.pq_bits as f64);
                params.insert("nprobe".to_string(), self.design.nprobe as f64);
                params.insert("refineFactor".to_string(), self.design.refine_factor as f64);
                ivfpq::describe(&model, sample.len(), manifest.metric)
            }
            IndexType::Hnsw => {
                if manifest.metric != Metric::Ip {
                    return Err(RetrievalError::Config(
                        "HNSW segments require metric \"ip\"".into(),
                    ));
                }
                params.insert("hnswM".to_string(), self.design.hnsw_m as f64);
                params.insert("efConstruction".to_string(), self.design.ef_construction as f64);
                params.insert("efSearch".to_string(), self.design.ef_search as f64);
                let p = params_from(manifest, &self.design);
                super::hnsw::describe(&p, manifest.segments.len())
            }
        };

        manifest.index_type = index_type;
        manifest.params = params;
        manifest.trained = true;
        manifest.train_info = Some(info.clone());
        manifest.model_file = model_file;
        Ok(TrainReport {
            index_type,
            sample: sample.len(),
            info,
        })
    }

    fn empty_manifest(&self) -> IndexManifest {
        IndexManifest::new(0, self.design.metric, self.design.index_type, &self.design.variant)
    }

    /// Publish `manifest`; if that fails, delete the freshly written
    /// `unpublished` files so they do not linger as orphans.
    fn publish_or_discard<'a, I>(&self, manifest: &IndexManifest, unpublished: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a String>,
    {
        if let Err(err) = manifest.publish(&self.paths.manifest()) {
            self.remove_files(unpublished, "discard_failed");
            return Err(err);
        }
        self.invalidate();
        Ok(())
    }

    /// Best-effort removal of manifest-relative files.
    fn remove_files<'a, I>(&self, rels: I, event: &str)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for rel in rels {
            let path = self.paths.resolve(rel);
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("{} path={:?} err={}", event, path, err);
                }
            }
        }
    }

    // ── Compaction ─────────────────────────────────────────────────────

    fn maybe_compact_locked(&self) -> Result<()> {
        if !self.design.compaction_enabled {
            return Ok(());
        }
        let count = self.manifest()?.map(|m| m.segments.len()).unwrap_or(0);
        if count >= self.design.compaction_min_segments {
            self.compact_locked()?;
        }
        Ok(())
    }

    /// Merge all sealed segments into one. Without `force`, only runs when
    /// compaction is enabled and the segment count reached the threshold.
    pub fn compact(&self, force: bool) -> Result<CompactionReport> {
        let _open = self.writer.lock();
        let count = self.manifest()?.map(|m| m.segments.len()).unwrap_or(0);
        let eligible = count >= 2
            && (force
                || (self.design.compaction_enabled && count >= self.design.compaction_min_segments));
        if !eligible {
            return Ok(CompactionReport {
                merged_segments: 0,
                vectors: 0,
                new_segment: None,
            });
        }
        self.compact_locked()
    }

    fn compact_locked(&self) -> Result<CompactionReport> {
        let Some(mut manifest) = self.manifest()? else {
            return Ok(CompactionReport {
                merged_segments: 0,
                vectors: 0,
                new_segment: None,
            });
        };
        let old = std::mem::take(&mut manifest.segments);
        if old.len() < 2 {
            manifest.segments = old;
            return Ok(CompactionReport {
                merged_segments: 0,
                vectors: 0,
                new_segment: None,
            });
        }

        let mut ids = Vec::with_capacity(manifest.total_vectors());
        let mut rows = Vec::with_capacity(manifest.total_vectors() * manifest.dim);
        for meta in &old {
            let seg = LoadedSegment::open(&self.paths, meta, manifest.dim)?;
            rows.extend_from_slice(seg.flat());
            ids.extend(seg.ids);
        }

        let merged = write_sealed_segment(&self.paths, &ids, &rows, manifest.dim)?;
        manifest.segments = vec![merged.clone()];
        self.publish_or_discard(&manifest, [&merged.file, &merged.ids_file])?;

        // Published; the superseded files are now unreferenced.
        self.remove_files(
            old.iter().flat_map(|meta| [&meta.file, &meta.ids_file]),
            "compaction_cleanup_failed",
        );

        tracing::info!(
            "compaction_published merged={} vectors={} file={}",
            old.len(),
            ids.len(),
            merged.file
        );
        Ok(CompactionReport {
            merged_segments: old.len(),
            vectors: ids.len(),
            new_segment: Some(merged),
        })
    }

    // ── Rebuild paths ──────────────────────────────────────────────────

    /// Rebuild the index from every vector in `embedding_root` (sorted by id).
    ///
    /// New segments (and the model, when `auto_train` applies) are written
    /// beside the live ones and swapped in by a single manifest publish. Any
    /// failure before that publish leaves the previous index untouched and
    /// searchable. Unsealed rows buffered by `append` are discarded.
    pub fn reindex(&self, embedding_root: &Path, cancel: Option<&CancelFlag>) -> Result<ReindexReport> {
        let mut files = list_vector_files(embedding_root)?;
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut open = self.writer.lock();
        let old = self.manifest()?;
        let mut fresh = self.empty_manifest();

        let built = self.build_unpublished(&mut fresh, &files, cancel);
        if let Err(err) = built {
            self.remove_files(&fresh.referenced_files(), "reindex_discard_failed");
            tracing::warn!(
                "reindex_aborted root={:?} source={:?} err={}",
                self.paths.root(),
                embedding_root,
                err
            );
            return Err(err);
        }
        self.publish_or_discard(&fresh, &fresh.referenced_files())?;
        open.clear();

        // Published; drop whatever only the previous manifest named.
        if let Some(old) = old {
            let keep = fresh.referenced_files();
            self.remove_files(
                old.referenced_files().iter().filter(|rel| !keep.contains(*rel)),
                "reindex_cleanup_failed",
            );
        }
        self.maybe_compact_locked()?;

        let segments = self.manifest()?.map(|m| m.segments.len()).unwrap_or(0);
        let trained = fresh.is_searchable();
        tracing::info!(
            "reindex_complete root={:?} source={:?} vectors={} segments={} trained={}",
            self.paths.root(),
            embedding_root,
            files.len(),
            segments,
            trained
        );
        Ok(ReindexReport {
            vectors: files.len(),
            segments,
            trained,
        })
    }

    /// Seal `files` into new segments listed only in `fresh`, then train
    /// `fresh` when `auto_train` applies. Nothing here touches the live
    /// manifest; on error `fresh` names every file written so far.
    fn build_unpublished(
        &self,
        fresh: &mut IndexManifest,
        files: &[(String, PathBuf)],
        cancel: Option<&CancelFlag>,
    ) -> Result<()> {
        let mut batch = OpenSegment::default();
        for (id, path) in files {
            if let Some(flag) = cancel {
                flag.check()?;
            }
            let vector = codec::read_vector(path)?;
            let dim = *batch.dim.get_or_insert(vector.len());
            if dim == 0 || vector.len() != dim {
                return Err(RetrievalError::dim(format!("reindex {}", id), dim, vector.len()));
            }
            fresh.dim = dim;

            let start = batch.rows.len();
            batch.rows.extend_from_slice(&vector);
            if self.design.metric == Metric::Ip {
                l2_normalize(&mut batch.rows[start..]);
            }
            batch.ids.push(id.clone());

            if batch.len() >= self.design.segment_target_n {
                fresh.segments.push(write_sealed_segment(&self.paths, &batch.ids, &batch.rows, dim)?);
                batch.ids.clear();
                batch.rows.clear();
            }
        }
        if batch.len() > 0 {
            fresh.segments.push(write_sealed_segment(&self.paths, &batch.ids, &batch.rows, fresh.dim)?);
        }

        if self.design.auto_train && !fresh.is_searchable() && fresh.total_vectors() > 0 {
            let sample = sample_rows(&self.paths, fresh, self.design.train_sample_max)?;
            self.stage_training(fresh, sample)?;
        }
        Ok(())
    }

    /// Seal an `N x dim` batch file as one segment with ids `"{video_id}#{row}"`.
    /// Trains on the batch first when the index is untrained and `auto_train`.
    pub fn build_segment_from_batch(
        &self,
        batch_path: &Path,
        dim: usize,
        count: usize,
        video_id: &str,
    ) -> Result<SegmentMeta> {
        if count == 0 || dim == 0 {
            return Err(RetrievalError::Config("batch count and dim must be positive".into()));
        }
        let mut rows = codec::read_matrix(batch_path, dim)?;
        if rows.len() != count {
            return Err(RetrievalError::dim(
                format!("batch rows in {}", batch_path.display()),
                count,
                rows.len(),
            ));
        }
        if self.design.metric == Metric::Ip {
            rows.iter_mut().for_each(|r| l2_normalize(r));
        }

        let _open = self.writer.lock();
        let manifest = self.manifest()?;
        let searchable = manifest.as_ref().map(|m| m.is_searchable()).unwrap_or(false);
        if !searchable && self.design.auto_train && self.design.index_type.requires_training() {
            self.train_on_locked(manifest, rows.clone())?;
        }

        let ids: Vec<String> = (0..count).map(|i| format!("{}#{}", video_id, i)).collect();
        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        let meta = self.commit_segment_locked(&ids, &flat, dim)?;
        self.maybe_compact_locked()?;
        Ok(meta)
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let pending = self.pending();
        Ok(match self.manifest()? {
            Some(m) => IndexStats {
                index_type: Some(m.index_type),
                dim: m.dim,
                segments: m.segments.len(),
                vectors: m.total_vectors(),
                pending,
                trained: m.trained,
            },
            None => IndexStats {
                index_type: None,
                dim: 0,
                segments: 0,
                vectors: 0,
                pending,
                trained: false,
            },
        })
    }
}

impl IndexBackend for SegmentedIndex {
    fn search_top_k(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        match self.snapshot()? {
            Some(snapshot) => snapshot.search(query, k),
            None if self.design.index_type.requires_training() => {
                Err(RetrievalError::IndexNotTrained {
                    index_dir: self.paths.root().to_path_buf(),
                })
            }
            None => Ok(Vec::new()),
        }
    }

    fn name(&self) -> &'static str {
        "segmented"
    }
}

// ── Snapshot ───────────────────────────────────────────────────────────

pub(crate) struct LoadedSegment {
    vectors: SegmentVectors,
    ids: Vec<String>,
}

impl LoadedSegment {
    /// Open and cross-check one manifest entry against its files.
    pub(crate) fn open(paths: &IndexPaths, meta: &SegmentMeta, dim: usize) -> Result<Self> {
        let vec_path = paths.resolve(&meta.file);
        let ids_path = paths.resolve(&meta.ids_file);
        if !vec_path.is_file() {
            return Err(RetrievalError::integrity(format!(
                "manifest references missing segment {:?}",
                vec_path
            )));
        }
        let vectors = SegmentVectors::open(&vec_path).map_err(|e| segment_integrity(&vec_path, e))?;
        if vectors.count != meta.count || vectors.dim != dim {
            return Err(RetrievalError::integrity(format!(
                "segment {:?} holds {}x{}, manifest says {}x{}",
                vec_path, vectors.count, vectors.dim, meta.count, dim
            )));
        }
        vectors
            .as_flat()
            .map_err(|e| segment_integrity(&vec_path, e))?;

        let ids_bytes = std::fs::read(&ids_path).map_err(|e| {
            RetrievalError::integrity(format!("segment ids {:?} unreadable: {}", ids_path, e))
        })?;
        let ids: Vec<String> = serde_json::from_slice(&ids_bytes).map_err(|e| {
            RetrievalError::integrity(format!("segment ids {:?} invalid: {}", ids_path, e))
        })?;
        if ids.len() != meta.count {
            return Err(RetrievalError::integrity(format!(
                "segment ids {:?} has {} entries, expected {}",
                ids_path,
                ids.len(),
                meta.count
            )));
        }
        Ok(Self { vectors, ids })
    }

    /// Row-major rows; validated at open.
    fn flat(&self) -> &[f32] {
        self.vectors.as_flat().unwrap_or(&[])
    }

    fn row(&self, index: usize) -> &[f32] {
        let dim = self.vectors.dim;
        &self.flat()[index * dim..(index + 1) * dim]
    }
}

enum Ann {
    Untrained,
    Exact,
    IvfPq {
        lists: IvfPqLists,
        nprobe: usize,
        refine_factor: usize,
    },
    Hnsw {
        graphs: Vec<HnswGraph>,
        ef_search: usize,
    },
}

/// Immutable view of one published manifest and its segments.
pub struct Snapshot {
    pub manifest: IndexManifest,
    segments: Vec<LoadedSegment>,
    ann: Ann,
    root: PathBuf,
}

impl Snapshot {
    fn load(paths: &IndexPaths, manifest: IndexManifest, design: &IndexDesignConfig) -> Result<Self> {
        let segments = manifest
            .segments
            .iter()
            .map(|meta| LoadedSegment::open(paths, meta, manifest.dim))
            .collect::<Result<Vec<_>>>()?;

        let ann = if !manifest.is_searchable() {
            Ann::Untrained
        } else {
            match manifest.index_type {
                IndexType::Flat => Ann::Exact,
                IndexType::IvfPq => {
                    let model = load_model(paths, &manifest)?;
                    if model.dim() != manifest.dim && !segments.is_empty() {
                        return Err(RetrievalError::integrity(format!(
                            "model dim {} does not match manifest dim {}",
                            model.dim(),
                            manifest.dim
                        )));
                    }
                    let dim = manifest.dim.max(1);
                    let lists = IvfPqLists::build(
                        model,
                        segments.iter().map(|s| s.flat().chunks_exact(dim)),
                    );
                    Ann::IvfPq {
                        lists,
                        nprobe: manifest.param("nprobe").unwrap_or(design.nprobe).max(1),
                        refine_factor: manifest
                            .param("refineFactor")
                            .unwrap_or(design.refine_factor)
                            .max(1),
                    }
                }
                IndexType::Hnsw => {
                    let params = params_from(&manifest, design);
                    let flats: Vec<&[f32]> = segments.iter().map(|s| s.flat()).collect();
                    let graphs = build_graphs(&flats, manifest.dim, params);
                    Ann::Hnsw {
                        graphs,
                        ef_search: params.ef_search,
                    }
                }
            }
        };

        Ok(Self {
            manifest,
            segments,
            ann,
            root: paths.root().to_path_buf(),
        })
    }

    pub fn total_vectors(&self) -> usize {
        self.manifest.total_vectors()
    }

    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if matches!(self.ann, Ann::Untrained) {
            return Err(RetrievalError::IndexNotTrained {
                index_dir: self.root.clone(),
            });
        }
        if self.segments.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.manifest.dim {
            return Err(RetrievalError::dim("query", self.manifest.dim, query.len()));
        }

        let metric = self.manifest.metric;
        let mut q = query.to_vec();
        if metric == Metric::Ip {
            l2_normalize(&mut q);
        }

        let top = match &self.ann {
            Ann::Untrained => TopK::new(0),
            Ann::Exact => self
                .segments
                .par_iter()
                .map(|seg| {
                    let mut top = TopK::new(k);
                    for (i, row) in seg.flat().chunks_exact(self.manifest.dim).enumerate() {
                        top.push(seg.ids[i].clone(), metric.score(&q, row));
                    }
                    top
                })
                .reduce(|| TopK::new(k), TopK::merge),
            Ann::IvfPq {
                lists,
                nprobe,
                refine_factor,
            } => {
                let limit = k.saturating_mul(*refine_factor);
                let mut top = TopK::new(k);
                for (seg, row) in lists.candidates(&q, *nprobe, limit) {
                    let segment = &self.segments[seg as usize];
                    let row = row as usize;
                    top.push(segment.ids[row].clone(), metric.score(&q, segment.row(row)));
                }
                top
            }
            Ann::Hnsw { graphs, ef_search } => self
                .segments
                .par_iter()
                .zip(graphs.par_iter())
                .map(|(seg, graph)| {
                    let mut top = TopK::new(k);
                    for (row, _) in graph.search(&q, k, (*ef_search).max(k)) {
                        let row = row as usize;
                        top.push(seg.ids[row].clone(), metric.score(&q, seg.row(row)));
                    }
                    top
                })
                .reduce(|| TopK::new(k), TopK::merge),
        };

        Ok(hits_from_topk(top))
    }
}

// ── Segment files ──────────────────────────────────────────────────────

fn segment_integrity(path: &Path, err: SegmentError) -> RetrievalError {
    RetrievalError::integrity(format!("segment {:?}: {}", path, err))
}

fn format_error(err: FormatError) -> RetrievalError {
    match err {
        FormatError::Io(e) => RetrievalError::Io(e),
        FormatError::DimensionMismatch { expected, actual } => {
            RetrievalError::dim("segment row", expected, actual)
        }
        other => RetrievalError::integrity(other.to_string()),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Stage, fsync and rename a new segment into `segments/`.
fn write_sealed_segment(paths: &IndexPaths, ids: &[String], rows: &[f32], dim: usize) -> Result<SegmentMeta> {
    paths.create_dirs()?;
    let count = ids.len();
    if dim == 0 || rows.len() != count * dim {
        return Err(RetrievalError::dim("segment rows", count * dim, rows.len()));
    }

    let mut ts = now_millis();
    let (stem, file, ids_file) = loop {
        let stem = IndexPaths::segment_stem(ts, count);
        let (file, ids_file) = IndexPaths::segment_files(&stem);
        if !paths.resolve(&file).exists() && !paths.resolve(&ids_file).exists() {
            break (stem, file, ids_file);
        }
        ts += 1;
    };

    let staged_vec = paths.staging_dir().join(format!("{}.vec.tmp", stem));
    let staged_ids = paths.staging_dir().join(format!("{}.ids.json.tmp", stem));
    let final_vec = paths.resolve(&file);
    let final_ids = paths.resolve(&ids_file);

    let result = (|| -> Result<String> {
        let mut writer = SegmentWriter::create(&staged_vec, dim).map_err(format_error)?;
        for row in rows.chunks_exact(dim) {
            writer.write_row(row).map_err(format_error)?;
        }
        writer.finish().map_err(format_error)?;

        let mut ids_out = File::create(&staged_ids)?;
        ids_out.write_all(&serde_json::to_vec(ids)?)?;
        ids_out.sync_all()?;

        let digest = sha256_file(&staged_vec)?;
        std::fs::rename(&staged_ids, &final_ids)?;
        std::fs::rename(&staged_vec, &final_vec)?;
        sync_parent(&final_vec)?;
        Ok(digest)
    })();

    let digest = match result {
        Ok(digest) => digest,
        Err(err) => {
            let _ = std::fs::remove_file(&staged_vec);
            let _ = std::fs::remove_file(&staged_ids);
            return Err(err);
        }
    };

    Ok(SegmentMeta {
        file,
        ids_file,
        count,
        timestamp: ts,
        sha256: Some(digest),
    })
}

/// Save `model` under a name no existing file uses.
fn write_model_file(paths: &IndexPaths, model: &IvfPqModel) -> Result<String> {
    let mut ts = now_millis();
    let name = loop {
        let name = IndexPaths::model_file(ts);
        if !paths.resolve(&name).exists() {
            break name;
        }
        ts += 1;
    };
    model.save(&paths.resolve(&name))?;
    Ok(name)
}

/// The model a trained IVF-PQ manifest names.
pub(crate) fn load_model(paths: &IndexPaths, manifest: &IndexManifest) -> Result<IvfPqModel> {
    let rel = manifest
        .model_file
        .as_deref()
        .ok_or_else(|| RetrievalError::integrity("trained IVF_PQ manifest names no model file"))?;
    IvfPqModel::load(&paths.resolve(rel))
}

/// Evenly strided sample of at most `max` rows across all segments.
fn sample_rows(paths: &IndexPaths, manifest: &IndexManifest, max: usize) -> Result<Vec<Vec<f32>>> {
    let total = manifest.total_vectors();
    let stride = total.div_ceil(max.max(1)).max(1);
    let mut sample = Vec::with_capacity(total.min(max));
    let mut global = 0usize;
    for meta in &manifest.segments {
        let seg = LoadedSegment::open(paths, meta, manifest.dim)?;
        for row in seg.flat().chunks_exact(manifest.dim.max(1)) {
            if global % stride == 0 && sample.len() < max {
                sample.push(row.to_vec());
            }
            global += 1;
        }
    }
    Ok(sample)
}

pub(crate) fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}
