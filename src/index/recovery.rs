//! Startup reconciliation of an index root against its manifest.

use std::path::{Path, PathBuf};

use clipdex_core::codec::{sweep_temp_files, TMP_SUFFIX};

use super::manifest::IndexManifest;
use super::paths::{is_model_file, is_segment_file, IndexPaths};
use super::segments::{load_model, sha256_file, LoadedSegment};
use super::IndexType;
use crate::error::{Result, RetrievalError};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub orphans_removed: usize,
    pub staging_removed: usize,
    /// Interrupted atomic writes (manifest, model, bind marker) in the root.
    pub temp_removed: usize,
    pub active_segments: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifyReport {
    pub segments_checked: usize,
    pub vectors: usize,
    pub checksums_verified: usize,
    pub orphans: Vec<PathBuf>,
}

/// Remove staging leftovers, interrupted temp writes and unreferenced segment
/// or model files, then check that everything the manifest lists is present.
///
/// Segment and model files are only deleted when a manifest exists; without
/// one there is nothing to compare against and they are left alone.
pub fn recover(root: &Path) -> Result<RecoveryReport> {
    let paths = IndexPaths::new(root);
    let mut report = RecoveryReport::default();

    for entry in read_dir_if_exists(&paths.staging_dir())? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        std::fs::remove_file(&path)?;
        tracing::info!("staging_removed path={:?}", path);
        report.staging_removed += 1;
    }

    for path in sweep_temp_files(root)? {
        tracing::info!("temp_removed path={:?}", path);
        report.temp_removed += 1;
    }

    let Some(manifest) = IndexManifest::load(&paths.manifest())? else {
        return Ok(report);
    };

    for path in orphan_files(&paths, &manifest)? {
        std::fs::remove_file(&path)?;
        tracing::warn!("orphan_removed path={:?}", path);
        report.orphans_removed += 1;
    }

    for rel in manifest.referenced_files() {
        if !paths.resolve(&rel).is_file() {
            return Err(RetrievalError::integrity(format!(
                "manifest references missing file {}",
                rel
            )));
        }
    }
    report.active_segments = manifest.segments.len();

    tracing::info!(
        "recovered root={:?} active_segments={} orphans_removed={} staging_removed={} temp_removed={}",
        root,
        report.active_segments,
        report.orphans_removed,
        report.staging_removed,
        report.temp_removed
    );
    Ok(report)
}

/// Read-only check of every referenced segment: header, count, dim and ids.
/// With `deep`, recorded sha256 digests are recomputed too.
pub fn verify(root: &Path, deep: bool) -> Result<VerifyReport> {
    let paths = IndexPaths::new(root);
    let manifest = IndexManifest::load(&paths.manifest())?
        .ok_or_else(|| RetrievalError::ManifestNotFound(paths.manifest()))?;

    let mut report = VerifyReport::default();
    for meta in &manifest.segments {
        LoadedSegment::open(&paths, meta, manifest.dim)?;
        if deep {
            if let Some(expected) = &meta.sha256 {
                let actual = sha256_file(&paths.resolve(&meta.file))?;
                if &actual != expected {
                    return Err(RetrievalError::integrity(format!(
                        "checksum mismatch for {}: expected {}, got {}",
                        meta.file, expected, actual
                    )));
                }
                report.checksums_verified += 1;
            }
        }
        report.segments_checked += 1;
        report.vectors += meta.count;
    }

    if manifest.trained && manifest.index_type == IndexType::IvfPq {
        load_model(&paths, &manifest)?;
    }

    report.orphans = orphan_files(&paths, &manifest)?;
    Ok(report)
}

fn orphan_files(paths: &IndexPaths, manifest: &IndexManifest) -> Result<Vec<PathBuf>> {
    let referenced = manifest.referenced_files();
    let mut orphans = Vec::new();
    for entry in read_dir_if_exists(&paths.segments_dir())? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !path.is_file() {
            continue;
        }
        let stray_tmp = name.ends_with(TMP_SUFFIX);
        let rel = format!("{}/{}", super::paths::SEGMENTS_DIR, name);
        if stray_tmp || (is_segment_file(name) && !referenced.contains(&rel)) {
            orphans.push(path);
        }
    }
    for entry in read_dir_if_exists(paths.root())? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if path.is_file() && is_model_file(name) && !referenced.contains(name) {
            orphans.push(path);
        }
    }
    orphans.sort();
    Ok(orphans)
}

fn read_dir_if_exists(dir: &Path) -> Result<Vec<std::io::Result<std::fs::DirEntry>>> {
    match std::fs::read_dir(dir) {
        Ok(entries) => Ok(entries.collect()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexDesignConfig;
    use crate::index::{IndexBackend, SegmentedIndex};
    use tempfile::tempdir;

    fn seeded_index(root: &Path) -> SegmentedIndex {
        let design = IndexDesignConfig {
            segment_target_n: 2,
            ..IndexDesignConfig::default()
        };
        let index = SegmentedIndex::open(root, design).unwrap();
        for (i, v) in [[1.0f32, 0.0], [0.0, 1.0], [0.6, 0.8], [0.8, 0.6]].iter().enumerate() {
            index.append(&format!("v{}", i), v).unwrap();
        }
        index
    }

    #[test]
    fn test_removes_orphans_and_staging() {
        let dir = tempdir().unwrap();
        let index = seeded_index(dir.path());
        let paths = index.paths().clone();

        std::fs::write(paths.staging_dir().join("seg-9-1.vec.tmp"), b"partial").unwrap();
        std::fs::write(paths.segments_dir().join("seg-9-1.vec"), b"unpublished").unwrap();
        std::fs::write(paths.segments_dir().join("seg-9-1.ids.json"), b"[]").unwrap();

        let report = recover(dir.path()).unwrap();
        assert_eq!(report.staging_removed, 1);
        assert_eq!(report.orphans_removed, 2);
        assert_eq!(report.active_segments, 2);
        assert!(!paths.segments_dir().join("seg-9-1.vec").exists());

        assert_eq!(index.search_top_k(&[1.0, 0.0], 4).unwrap().len(), 4);
        assert_eq!(recover(dir.path()).unwrap().orphans_removed, 0);
    }

    #[test]
    fn test_sweeps_interrupted_root_writes() {
        let dir = tempdir().unwrap();
        let index = seeded_index(dir.path());
        let paths = index.paths().clone();
        let stale_manifest = clipdex_core::codec::temp_path_for(&paths.manifest());
        let stale_bind = clipdex_core::codec::temp_path_for(&paths.bind_marker());
        std::fs::write(&stale_manifest, b"{\"schemaVersion\"").unwrap();
        std::fs::write(&stale_bind, b"/half").unwrap();

        let report = recover(dir.path()).unwrap();
        assert_eq!(report.temp_removed, 2);
        assert!(!stale_manifest.exists());
        assert!(!stale_bind.exists());
        assert!(paths.manifest().exists());
        assert_eq!(index.search_top_k(&[1.0, 0.0], 4).unwrap().len(), 4);
    }

    #[test]
    fn test_unreferenced_models_are_orphans() {
        let dir = tempdir().unwrap();
        let design = IndexDesignConfig {
            index_type: IndexType::IvfPq,
            segment_target_n: 4,
            nlist: 2,
            pq_m: 2,
            ..IndexDesignConfig::default()
        };
        let index = SegmentedIndex::open(dir.path(), design).unwrap();
        for (i, v) in [[1.0f32, 0.0], [0.0, 1.0], [0.6, 0.8], [0.8, 0.6]].iter().enumerate() {
            index.append(&format!("v{}", i), v).unwrap();
        }
        index.train().unwrap();
        let live = index.manifest().unwrap().unwrap().model_file.unwrap();

        // A model written by a retrain that crashed before its publish.
        let stale = dir.path().join("ivfpq-1.model");
        std::fs::copy(dir.path().join(&live), &stale).unwrap();
        assert_eq!(verify(dir.path(), false).unwrap().orphans, vec![stale.clone()]);

        assert_eq!(recover(dir.path()).unwrap().orphans_removed, 1);
        assert!(!stale.exists());
        assert!(dir.path().join(&live).exists());
        assert_eq!(index.search_top_k(&[1.0, 0.0], 1).unwrap()[0].id, "v0");
    }

    #[test]
    fn test_missing_referenced_segment_fails() {
        let dir = tempdir().unwrap();
        let index = seeded_index(dir.path());
        let m = index.manifest().unwrap().unwrap();
        std::fs::remove_file(index.paths().resolve(&m.segments[0].ids_file)).unwrap();

        assert!(matches!(
            recover(dir.path()),
            Err(RetrievalError::ManifestIntegrity(_))
        ));
    }

    #[test]
    fn test_no_manifest_leaves_segments_alone() {
        let dir = tempdir().unwrap();
        let paths = IndexPaths::new(dir.path());
        paths.create_dirs().unwrap();
        std::fs::write(paths.segments_dir().join("seg-1-1.vec"), b"x").unwrap();

        let report = recover(dir.path()).unwrap();
        assert_eq!(report, RecoveryReport::default());
        assert!(paths.segments_dir().join("seg-1-1.vec").exists());
    }

    #[test]
    fn test_deep_verify_detects_tampering() {
        let dir = tempdir().unwrap();
        let index = seeded_index(dir.path());
        let report = verify(dir.path(), true).unwrap();
        assert_eq!(report.segments_checked, 2);
        assert_eq!(report.vectors, 4);
        assert_eq!(report.checksums_verified, 2);
        assert!(report.orphans.is_empty());

        // Same length, different payload: only the checksum notices.
        let m = index.manifest().unwrap().unwrap();
        let path = index.paths().resolve(&m.segments[1].file);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&path, bytes).unwrap();

        assert!(verify(dir.path(), false).is_ok());
        assert!(matches!(
            verify(dir.path(), true),
            Err(RetrievalError::ManifestIntegrity(_))
        ));
    }

    #[test]
    fn test_verify_without_manifest() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            verify(dir.path(), false),
            Err(RetrievalError::ManifestNotFound(_))
        ));
    }
}
