//! File-backed embedding store.
//!
//! # Layout
//!
//! ```text
//! {root}/{variant}/{id}.f32          video vectors (what a Flat scan sees)
//! {root}/{variant}/{id}.json         sidecar metadata
//! {root}/{variant}/shots/{id}.f32    shot vectors
//! {root}/{variant}/text/{id}.f32     text query vectors
//! ```
//!
//! A store opened with [`EmbeddingStore::single_variant`] treats its root as
//! the variant directory itself, which is how the pipeline's `output_dir` is
//! laid out.
//!
//! Vector and sidecar writes both go through temp-file + rename, so a crash
//! leaves either the old record or the new one under the final name. The
//! sidecar is written after the vector; readers key off the vector file.
//! Temp files of interrupted writes are invisible to listings and are
//! deleted by [`EmbeddingStore::collect_garbage`].

use std::path::{Path, PathBuf};

use clipdex_core::codec::{self, TMP_SUFFIX};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RetrievalError};

pub const VECTOR_EXT: &str = "f32";
pub const METADATA_EXT: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    #[default]
    Video,
    Shot,
    Text,
}

impl OwnerType {
    const ALL: [OwnerType; 3] = [OwnerType::Video, OwnerType::Shot, OwnerType::Text];

    fn subdir(&self) -> Option<&'static str> {
        match self {
            OwnerType::Video => None,
            OwnerType::Shot => Some("shots"),
            OwnerType::Text => Some("text"),
        }
    }
}

/// JSON sidecar stored next to every vector. Unknown keys are preserved in
/// `extra` and written back unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EmbeddingMetadata {
    pub id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub dim: usize,
    #[serde(default)]
    pub frame_count: usize,
    #[serde(default)]
    pub variant: String,
    #[serde(default)]
    pub owner_type: OwnerType,
    #[serde(default)]
    pub created_at: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EmbeddingMetadata {
    pub fn new(source: impl Into<String>, frame_count: usize) -> Self {
        Self {
            source: source.into(),
            frame_count,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    PerVariant,
    SingleVariant,
}

#[derive(Debug, Clone)]
pub struct EmbeddingStore {
    root: PathBuf,
    layout: Layout,
}

impl EmbeddingStore {
    /// Store with one subdirectory per variant under `root`.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            layout: Layout::PerVariant,
        }
    }

    /// Store whose root already is the directory for a single variant.
    pub fn single_variant<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            root: dir.into(),
            layout: Layout::SingleVariant,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding vectors of `owner_type` for `variant`.
    pub fn owner_dir(&self, owner_type: OwnerType, variant: &str) -> PathBuf {
        let base = match self.layout {
            Layout::PerVariant => self.root.join(variant),
            Layout::SingleVariant => self.root.clone(),
        };
        match owner_type.subdir() {
            Some(sub) => base.join(sub),
            None => base,
        }
    }

    pub fn vector_path(&self, owner_type: OwnerType, owner_id: &str, variant: &str) -> PathBuf {
        self.owner_dir(owner_type, variant)
            .join(format!("{}.{}", owner_id, VECTOR_EXT))
    }

    pub fn metadata_path(&self, owner_type: OwnerType, owner_id: &str, variant: &str) -> PathBuf {
        self.owner_dir(owner_type, variant)
            .join(format!("{}.{}", owner_id, METADATA_EXT))
    }

    /// Persist one record. Re-storing the same key overwrites it.
    pub fn store(
        &self,
        owner_type: OwnerType,
        owner_id: &str,
        variant: &str,
        vector: &[f32],
        metadata: EmbeddingMetadata,
    ) -> Result<PathBuf> {
        validate_component("owner id", owner_id)?;
        if self.layout == Layout::PerVariant {
            validate_component("variant", variant)?;
        }
        let vector_path = self.vector_path(owner_type, owner_id, variant);
        codec::write_vector(&vector_path, vector)?;

        let sidecar = EmbeddingMetadata {
            id: owner_id.to_string(),
            dim: vector.len(),
            variant: variant.to_string(),
            owner_type,
            created_at: if metadata.created_at > 0 {
                metadata.created_at
            } else {
                current_unix_ts()
            },
            ..metadata
        };
        let json = serde_json::to_vec_pretty(&sidecar)?;
        codec::atomic_write(&self.metadata_path(owner_type, owner_id, variant), &json)?;

        tracing::debug!(
            "embedding_stored id={} variant={} owner={:?} dim={}",
            owner_id,
            variant,
            owner_type,
            vector.len()
        );
        Ok(vector_path)
    }

    /// `Ok(None)` when the record does not exist; corrupt files are errors.
    pub fn load(
        &self,
        owner_type: OwnerType,
        owner_id: &str,
        variant: &str,
    ) -> Result<Option<Vec<f32>>> {
        match codec::read_vector(self.vector_path(owner_type, owner_id, variant)) {
            Ok(v) => Ok(Some(v)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn load_metadata(
        &self,
        owner_type: OwnerType,
        owner_id: &str,
        variant: &str,
    ) -> Result<Option<EmbeddingMetadata>> {
        let path = self.metadata_path(owner_type, owner_id, variant);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn has_embedding(&self, owner_type: OwnerType, owner_id: &str, variant: &str) -> bool {
        self.vector_path(owner_type, owner_id, variant).is_file()
    }

    /// Remove vector and sidecar. Returns whether a vector existed.
    pub fn remove(&self, owner_type: OwnerType, owner_id: &str, variant: &str) -> Result<bool> {
        let existed = remove_if_exists(&self.vector_path(owner_type, owner_id, variant))?;
        remove_if_exists(&self.metadata_path(owner_type, owner_id, variant))?;
        Ok(existed)
    }

    /// Delete temp files left behind by interrupted writes anywhere in the
    /// store. Returns how many were removed.
    pub fn collect_garbage(&self) -> Result<usize> {
        let variant_dirs = match self.layout {
            Layout::SingleVariant => vec![self.root.clone()],
            Layout::PerVariant => subdirectories(&self.root)?,
        };
        let mut removed = 0;
        for base in variant_dirs {
            for owner_type in OwnerType::ALL {
                let dir = match owner_type.subdir() {
                    Some(sub) => base.join(sub),
                    None => base.clone(),
                };
                for path in codec::sweep_temp_files(&dir)? {
                    tracing::info!("embedding_temp_removed path={:?}", path);
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Ids with a vector file, in unspecified order.
    pub fn list_ids(&self, owner_type: OwnerType, variant: &str) -> Result<Vec<String>> {
        list_vector_files(&self.owner_dir(owner_type, variant))
            .map(|files| files.into_iter().map(|(id, _)| id).collect())
    }
}

/// `(id, path)` for every committed `.f32` file directly inside `dir`.
/// Hidden and in-flight temp files are skipped. A missing directory is empty.
pub fn list_vector_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut out = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name.ends_with(TMP_SUFFIX) || !entry.file_type()?.is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(VECTOR_EXT) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            out.push((stem.to_string(), path.clone()));
        }
    }
    Ok(out)
}

/// Ids and variants become file and directory names under the root.
fn validate_component(what: &str, value: &str) -> Result<()> {
    if value.is_empty()
        || value.starts_with('.')
        || value.contains(['/', '\\'])
        || value.contains('\0')
    {
        return Err(RetrievalError::Config(format!("invalid {} '{}'", what, value)));
    }
    Ok(())
}

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn current_unix_ts() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
