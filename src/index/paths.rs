//! On-disk layout of a segmented index root.
//!
//! ```text
//! {root}/MANIFEST.json            authoritative index state
//! {root}/BIND.txt                 embedding root this index was built from
//! {root}/ivfpq-{ts}.model         trained IVF-PQ model named by the manifest
//! {root}/segments/seg-{ts}-{n}.vec
//! {root}/segments/seg-{ts}-{n}.ids.json
//! {root}/.staging/                in-flight segment writes
//! ```

use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "MANIFEST.json";
pub const BIND_FILE: &str = "BIND.txt";
pub const MODEL_PREFIX: &str = "ivfpq-";
pub const MODEL_EXT: &str = "model";
pub const SEGMENTS_DIR: &str = "segments";
pub const STAGING_DIR: &str = ".staging";
pub const SEGMENT_EXT: &str = "vec";
pub const IDS_SUFFIX: &str = ".ids.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPaths {
    root: PathBuf,
}

impl IndexPaths {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn bind_marker(&self) -> PathBuf {
        self.root.join(BIND_FILE)
    }

    /// Manifest-relative name for a model trained at `ts_millis`.
    pub fn model_file(ts_millis: u64) -> String {
        format!("{}{}.{}", MODEL_PREFIX, ts_millis, MODEL_EXT)
    }

    pub fn segments_dir(&self) -> PathBuf {
        self.root.join(SEGMENTS_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Base name for a segment sealed at `ts_millis` holding `count` rows.
    pub fn segment_stem(ts_millis: u64, count: usize) -> String {
        format!("seg-{}-{}", ts_millis, count)
    }

    /// Manifest-relative file names for a segment stem.
    pub fn segment_files(stem: &str) -> (String, String) {
        (
            format!("{}/{}.{}", SEGMENTS_DIR, stem, SEGMENT_EXT),
            format!("{}/{}{}", SEGMENTS_DIR, stem, IDS_SUFFIX),
        )
    }

    /// Resolve a manifest-relative path.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.segments_dir())?;
        std::fs::create_dir_all(self.staging_dir())
    }
}

/// True for files that belong to a sealed segment (vector or ids file).
pub fn is_segment_file(name: &str) -> bool {
    name.starts_with("seg-")
        && (name.ends_with(IDS_SUFFIX) || name.ends_with(&format!(".{}", SEGMENT_EXT)))
}

/// True for a versioned IVF-PQ model file in the index root.
pub fn is_model_file(name: &str) -> bool {
    name.starts_with(MODEL_PREFIX) && name.ends_with(&format!(".{}", MODEL_EXT))
}
