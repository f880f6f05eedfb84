use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use clipdex::config::IndexDesignConfig;
use clipdex::index::{recover, verify, IndexManifest, IndexPaths, IndexType, SegmentedIndex};
use clipdex::{CancelFlag, IndexBackend, RetrievalError};
use clipdex_core::format::write_segment;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

fn design(index_type: IndexType, target: usize) -> IndexDesignConfig {
    IndexDesignConfig {
        index_type,
        segment_target_n: target,
        nlist: 8,
        pq_m: 4,
        ..IndexDesignConfig::default()
    }
}

fn random_rows(rng: &mut StdRng, n: usize, dim: usize) -> Vec<Vec<f32>> {
    (0..n)
        .map(|_| (0..dim).map(|_| rng.gen::<f32>() - 0.5).collect())
        .collect()
}

fn fill(index: &SegmentedIndex, rows: &[Vec<f32>]) {
    for (i, row) in rows.iter().enumerate() {
        index.append(&format!("v{:04}", i), row).expect("append");
    }
    index.flush().expect("flush");
}

fn assert_manifest_consistent(root: &Path) {
    let paths = IndexPaths::new(root);
    let manifest = IndexManifest::load(&paths.manifest())
        .expect("load manifest")
        .expect("manifest exists");
    for rel in manifest.referenced_files() {
        assert!(paths.resolve(&rel).is_file(), "missing {}", rel);
    }
}

fn write_embeddings(dir: &Path, rows: &[Vec<f32>]) {
    for (i, row) in rows.iter().enumerate() {
        clipdex_core::codec::write_vector(dir.join(format!("vid{:02}.f32", i)), row).expect("write");
    }
}

#[test]
fn approximate_types_reject_search_until_trained() {
    for index_type in [IndexType::IvfPq, IndexType::Hnsw] {
        let dir = tempdir().expect("tempdir");
        let index = SegmentedIndex::open(dir.path(), design(index_type, 16)).expect("open");
        let mut rng = StdRng::seed_from_u64(1);
        fill(&index, &random_rows(&mut rng, 40, 16));

        let err = index.search_top_k(&[0.1; 16], 5).expect_err("untrained");
        assert!(matches!(err, RetrievalError::IndexNotTrained { .. }));
        assert_eq!(err.kind().exit_code(), 5);

        let report = index.train().expect("train");
        assert_eq!(report.index_type, index_type);
        let manifest = index.manifest().expect("load").expect("manifest");
        assert!(manifest.trained);
        assert!(!manifest.params.is_empty());
        assert_eq!(index.search_top_k(&[0.1; 16], 5).expect("search").len(), 5);
    }
}

#[test]
fn every_sealed_vector_stays_searchable_across_compaction() {
    let dir = tempdir().expect("tempdir");
    let index = SegmentedIndex::open(dir.path(), design(IndexType::Flat, 7)).expect("open");
    let mut rng = StdRng::seed_from_u64(2);
    let rows = random_rows(&mut rng, 50, 8);
    fill(&index, &rows);
    assert_eq!(index.manifest().expect("load").expect("manifest").segments.len(), 8);

    let before = index.search_top_k(&rows[13], 50).expect("search");
    assert_eq!(before.len(), 50);
    assert_eq!(before[0].id, "v0013");

    let report = index.compact(true).expect("compact");
    assert_eq!(report.merged_segments, 8);
    assert_eq!(report.vectors, 50);
    assert_manifest_consistent(dir.path());

    let after = index.search_top_k(&rows[13], 50).expect("search");
    assert_eq!(before, after);

    // Only the merged segment's two files remain.
    let remaining = std::fs::read_dir(IndexPaths::new(dir.path()).segments_dir())
        .expect("read segments")
        .count();
    assert_eq!(remaining, 2);
}

#[test]
fn crash_leftovers_are_ignored_then_cleaned() {
    let dir = tempdir().expect("tempdir");
    let index = SegmentedIndex::open(dir.path(), design(IndexType::Flat, 4)).expect("open");
    let mut rng = StdRng::seed_from_u64(3);
    let rows = random_rows(&mut rng, 8, 4);
    fill(&index, &rows);
    let paths = IndexPaths::new(dir.path());

    // Crash after staging and after rename, but before the manifest publish.
    std::fs::write(paths.staging_dir().join("seg-1-3.vec.tmp"), b"half").expect("staging");
    write_segment(
        &paths.segments_dir().join("seg-1-3.vec"),
        4,
        &vec![vec![1.0, 0.0, 0.0, 0.0]; 3],
    )
    .expect("orphan segment");
    std::fs::write(paths.segments_dir().join("seg-1-3.ids.json"), br#"["x","y","z"]"#)
        .expect("orphan ids");

    let hits = index.search_top_k(&rows[0], 20).expect("search");
    assert_eq!(hits.len(), 8, "orphans must not be served");
    assert_eq!(verify(dir.path(), false).expect("verify").orphans.len(), 2);

    let report = recover(dir.path()).expect("recover");
    assert_eq!(report.orphans_removed, 2);
    assert_eq!(report.staging_removed, 1);
    assert_eq!(report.active_segments, 2);
    assert_manifest_consistent(dir.path());
    assert!(verify(dir.path(), true).expect("verify").orphans.is_empty());
}

#[test]
fn missing_or_truncated_segment_is_an_integrity_error() {
    let dir = tempdir().expect("tempdir");
    let index = SegmentedIndex::open(dir.path(), design(IndexType::Flat, 3)).expect("open");
    let mut rng = StdRng::seed_from_u64(4);
    fill(&index, &random_rows(&mut rng, 6, 4));
    let manifest = index.manifest().expect("load").expect("manifest");
    let paths = IndexPaths::new(dir.path());

    let victim = paths.resolve(&manifest.segments[1].file);
    let bytes = std::fs::read(&victim).expect("read");
    std::fs::write(&victim, &bytes[..bytes.len() - 4]).expect("truncate");

    let fresh = SegmentedIndex::open(dir.path(), design(IndexType::Flat, 3)).expect("open");
    let err = fresh.search_top_k(&[1.0, 0.0, 0.0, 0.0], 3).expect_err("truncated");
    assert!(matches!(err, RetrievalError::ManifestIntegrity(_)));

    std::fs::remove_file(&victim).expect("remove");
    assert!(matches!(
        recover(dir.path()),
        Err(RetrievalError::ManifestIntegrity(_))
    ));
}

#[test]
fn future_schema_version_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let paths = IndexPaths::new(dir.path());
    std::fs::write(
        paths.manifest(),
        br#"{"schemaVersion": 99, "dim": 4, "metric": "ip", "indexType": "FLAT", "variant": "v"}"#,
    )
    .expect("write manifest");

    let index = SegmentedIndex::open(dir.path(), design(IndexType::Flat, 3)).expect("open");
    let err = index.search_top_k(&[1.0; 4], 1).expect_err("future schema");
    assert!(matches!(
        err,
        RetrievalError::UnsupportedSchema { found: 99, supported: 1 }
    ));
}

#[test]
fn hnsw_training_requires_inner_product() {
    let dir = tempdir().expect("tempdir");
    let mut d = design(IndexType::Hnsw, 4);
    d.metric = clipdex_core::Metric::L2;
    let index = SegmentedIndex::open(dir.path(), d).expect("open");
    let mut rng = StdRng::seed_from_u64(5);
    fill(&index, &random_rows(&mut rng, 8, 4));
    assert!(matches!(index.train(), Err(RetrievalError::Config(_))));
}

#[test]
fn reindex_rebuilds_from_embedding_root() {
    let dir = tempdir().expect("tempdir");
    let emb = dir.path().join("emb");
    let mut rng = StdRng::seed_from_u64(6);
    let rows = random_rows(&mut rng, 30, 8);
    for (i, row) in rows.iter().enumerate() {
        clipdex_core::codec::write_vector(emb.join(format!("vid{:02}.f32", i)), row).expect("write");
    }

    let index = SegmentedIndex::open(dir.path().join("idx"), design(IndexType::IvfPq, 10))
        .expect("open");
    let first = index.reindex(&emb, None).expect("reindex");
    assert_eq!(first.vectors, 30);
    assert_eq!(first.segments, 3);
    assert!(first.trained);

    let old_files: Vec<String> = index
        .manifest()
        .expect("load")
        .expect("manifest")
        .segments
        .iter()
        .map(|s| s.file.clone())
        .collect();
    let second = index.reindex(&emb, None).expect("reindex again");
    assert_eq!(second, first);
    for file in old_files {
        let still_listed = index
            .manifest()
            .expect("load")
            .expect("manifest")
            .segments
            .iter()
            .any(|s| s.file == file);
        assert_eq!(still_listed, IndexPaths::new(dir.path().join("idx")).resolve(&file).exists());
    }

    let hits = index.search_top_k(&rows[17], 1).expect("search");
    assert_eq!(hits[0].id, "vid17");
}

#[test]
fn failed_reindex_leaves_previous_index_serving() {
    for index_type in [IndexType::Flat, IndexType::IvfPq, IndexType::Hnsw] {
        let dir = tempdir().expect("tempdir");
        let emb = dir.path().join("emb");
        let mut rng = StdRng::seed_from_u64(7);
        let rows = random_rows(&mut rng, 12, 8);
        write_embeddings(&emb, &rows);

        let root = dir.path().join("idx");
        let index = SegmentedIndex::open(&root, design(index_type, 5)).expect("open");
        index.reindex(&emb, None).expect("first reindex");
        let published = index.manifest().expect("load").expect("manifest");
        let before = index.search_top_k(&rows[4], 3).expect("search");
        assert_eq!(before[0].id, "vid04");

        // A torn vector file sorts last, so every good row is sealed first.
        std::fs::write(emb.join("vid99.f32"), [0u8; 5]).expect("corrupt");
        let err = index.reindex(&emb, None).expect_err("corrupt input");
        assert!(matches!(err, RetrievalError::VectorCorrupt { .. }), "{:?}", err);
        assert_eq!(index.manifest().expect("load").expect("manifest"), published);
        assert_eq!(index.search_top_k(&rows[4], 3).expect("search"), before);

        // Wrong width and cancellation abort the same way.
        std::fs::remove_file(emb.join("vid99.f32")).expect("remove");
        clipdex_core::codec::write_vector(emb.join("vid98.f32"), &[1.0; 3]).expect("narrow");
        assert!(matches!(
            index.reindex(&emb, None),
            Err(RetrievalError::DimensionMismatch { .. })
        ));
        std::fs::remove_file(emb.join("vid98.f32")).expect("remove");
        let cancel = CancelFlag::new();
        cancel.cancel();
        assert!(matches!(index.reindex(&emb, Some(&cancel)), Err(RetrievalError::Cancelled)));
        assert_eq!(index.manifest().expect("load").expect("manifest"), published);
        assert_eq!(index.search_top_k(&rows[4], 3).expect("search"), before);

        // Aborted rebuilds leave nothing behind for recovery to find.
        assert_manifest_consistent(&root);
        assert!(verify(&root, true).expect("verify").orphans.is_empty());
    }
}

#[test]
fn successful_reindex_swaps_in_new_files_and_drops_old_ones() {
    let dir = tempdir().expect("tempdir");
    let emb = dir.path().join("emb");
    let mut rng = StdRng::seed_from_u64(8);
    let rows = random_rows(&mut rng, 10, 8);
    write_embeddings(&emb, &rows);

    let root = dir.path().join("idx");
    let index = SegmentedIndex::open(&root, design(IndexType::IvfPq, 4)).expect("open");
    index.reindex(&emb, None).expect("reindex");
    let old = index.manifest().expect("load").expect("manifest");
    assert!(old.model_file.is_some());

    write_embeddings(&emb, &random_rows(&mut rng, 14, 8));
    let report = index.reindex(&emb, None).expect("reindex again");
    assert_eq!(report.vectors, 14);
    assert!(report.trained);

    let new = index.manifest().expect("load").expect("manifest");
    let paths = IndexPaths::new(&root);
    for rel in old.referenced_files() {
        assert!(!new.referenced_files().contains(&rel));
        assert!(!paths.resolve(&rel).exists(), "superseded {} still on disk", rel);
    }
    assert_manifest_consistent(&root);
    assert!(verify(&root, true).expect("verify").orphans.is_empty());
}

#[test]
fn readers_never_see_integrity_errors_while_compacting() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path().to_path_buf();
    let mut rng = StdRng::seed_from_u64(9);
    let rows = random_rows(&mut rng, 120, 8);
    let query = rows[0].clone();

    let writer = SegmentedIndex::open(&root, design(IndexType::Flat, 1)).expect("open");
    writer.append("v0000", &rows[0]).expect("append");
    let done = AtomicBool::new(false);

    let searches: usize = std::thread::scope(|s| {
        let readers: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    let reader =
                        SegmentedIndex::open(&root, design(IndexType::Flat, 1)).expect("open reader");
                    let mut searches = 0usize;
                    while !done.load(Ordering::Acquire) {
                        let hits = reader
                            .search_top_k(&query, 5)
                            .expect("search during compaction");
                        assert_eq!(hits[0].id, "v0000");
                        searches += 1;
                    }
                    searches
                })
            })
            .collect();

        for (i, row) in rows.iter().enumerate().skip(1) {
            writer.append(&format!("v{:04}", i), row).expect("append");
            writer.compact(true).expect("compact");
        }
        done.store(true, Ordering::Release);
        readers
            .into_iter()
            .map(|r| r.join().expect("reader thread"))
            .sum()
    });

    assert!(searches > 0);
    assert_eq!(writer.search_top_k(&query, 200).expect("search").len(), 120);
    assert_manifest_consistent(&root);
}
