use std::path::{Path, PathBuf};
use std::sync::Arc;

use clipdex::pipeline::{IngestPolicy, PipelineState};
use clipdex::{
    EmbeddingMetadata, EmbeddingStore, OwnerType, Pipeline, PipelineManifest, PrecomputedEncoder,
    ResultsFile, RetrievalError,
};
use clipdex_core::codec;
use tempfile::tempdir;

fn write_manifest(root: &Path, json: serde_json::Value) -> PathBuf {
    let path = root.join("pipeline.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&json).expect("json")).expect("write manifest");
    path
}

#[test]
fn ingest_bind_and_retrieve_two_documents() {
    let dir = tempdir().expect("tempdir");
    codec::write_vector(dir.path().join("doc1.f32"), &[1.0, 0.0, 0.0]).expect("doc1");
    codec::write_vector(dir.path().join("doc2.f32"), &[0.0, 1.0, 0.0]).expect("doc2");
    codec::write_vector(dir.path().join("query.f32"), &[0.9, 0.1, 0.0]).expect("query");

    let manifest = write_manifest(
        dir.path(),
        serde_json::json!({
            "variant": "clip_vit_b32",
            "index": { "dir": "index", "type": "FLAT" },
            "ingest": { "videos": ["doc1.mp4", "doc2.mp4"], "output_dir": "emb" },
            "query": { "query_vec_path": "query.f32", "top_k": 5, "output_path": "out/q1.json" }
        }),
    );

    let pipeline = Pipeline::from_manifest_path(&manifest, Some(Arc::new(PrecomputedEncoder)))
        .expect("pipeline");
    let report = pipeline.ingest().expect("ingest");
    assert_eq!(report.processed, 2);
    assert!(report.failures.is_empty());
    assert_eq!(pipeline.state(), PipelineState::Bound);

    let bind = std::fs::read_to_string(dir.path().join("index/BIND.txt")).expect("bind marker");
    assert!(Path::new(bind.trim()).is_absolute());
    assert!(Path::new(bind.trim()).join("doc1.f32").is_file());

    let meta = EmbeddingStore::single_variant(bind.trim())
        .load_metadata(OwnerType::Video, "doc1", "clip_vit_b32")
        .expect("metadata")
        .expect("sidecar exists");
    assert_eq!(meta.dim, 3);
    assert_eq!(meta.frame_count, 32);
    assert_eq!(meta.variant, "clip_vit_b32");

    let out = pipeline.retrieve().expect("retrieve");
    assert_eq!(out.backend, "flat");
    let results = ResultsFile::read(&dir.path().join("out/q1.json")).expect("results");
    assert_eq!(results.ids, vec!["doc1", "doc2"]);
    assert!(results.scores[0] > results.scores[1]);
}

#[test]
fn unknown_index_type_falls_back_to_flat() {
    let dir = tempdir().expect("tempdir");
    let mut m = PipelineManifest::default();
    m.index.index_type = "ANNOY".into();
    m.index.dir = dir.path().join("index");
    m.ingest.output_dir = dir.path().join("emb");
    m.query.query_vec_path = dir.path().join("q.f32");
    m.query.output_path = dir.path().join("out.json");

    EmbeddingStore::single_variant(&m.ingest.output_dir)
        .store(OwnerType::Video, "x", "v", &[0.0, 1.0], EmbeddingMetadata::default())
        .expect("store");
    codec::write_vector(&m.query.query_vec_path, &[0.0, 1.0]).expect("query");

    let report = Pipeline::new(m, None).expect("pipeline").retrieve().expect("retrieve");
    assert_eq!(report.backend, "flat");
    assert_eq!(report.hits[0].id, "x");
}

#[test]
fn segmented_pipeline_reindexes_after_ingest() {
    let dir = tempdir().expect("tempdir");
    let mut videos = Vec::new();
    for i in 0..12 {
        let mut v = vec![0.05f32; 8];
        v[i % 8] = 1.0;
        codec::write_vector(dir.path().join(format!("clip{:02}.f32", i)), &v).expect("vector");
        videos.push(format!("clip{:02}.mp4", i));
    }
    let mut q = vec![0.05f32; 8];
    q[3] = 1.0;
    codec::write_vector(dir.path().join("query.f32"), &q).expect("query");

    let manifest = write_manifest(
        dir.path(),
        serde_json::json!({
            "index": { "dir": "index", "type": "HNSW", "segment_target_n": 5 },
            "ingest": { "videos": videos, "output_dir": "emb" },
            "query": { "query_vec_path": "query.f32", "top_k": 2, "output_path": "out.json" }
        }),
    );

    let pipeline = Pipeline::from_manifest_path(&manifest, Some(Arc::new(PrecomputedEncoder)))
        .expect("pipeline");
    let report = pipeline.ingest().expect("ingest");
    let reindex = report.reindex.expect("segmented types reindex");
    assert_eq!(reindex.vectors, 12);
    assert_eq!(reindex.segments, 3);
    assert!(reindex.trained);

    let out = pipeline.retrieve().expect("retrieve");
    assert_eq!(out.backend, "segmented");
    let ids: Vec<_> = out.hits.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids[0] == "clip03" || ids[0] == "clip11");
}

#[test]
fn missing_manifest_is_reported_before_work() {
    let dir = tempdir().expect("tempdir");
    let err = Pipeline::from_manifest_path(&dir.path().join("nope.json"), None)
        .err()
        .expect("missing manifest");
    assert!(matches!(err, RetrievalError::ManifestNotFound(_)));
}

#[test]
fn fail_fast_ingest_stops_at_first_bad_item() {
    let dir = tempdir().expect("tempdir");
    codec::write_vector(dir.path().join("good.f32"), &[1.0, 0.0]).expect("vector");
    let manifest = write_manifest(
        dir.path(),
        serde_json::json!({
            "index": { "dir": "index" },
            "ingest": { "videos": ["missing.mp4", "good.mp4"], "output_dir": "emb" }
        }),
    );
    let pipeline = Pipeline::from_manifest_path(&manifest, Some(Arc::new(PrecomputedEncoder)))
        .expect("pipeline");
    let err = pipeline
        .ingest_with(IngestPolicy::FailFast)
        .expect_err("first item fails");
    assert!(matches!(err, RetrievalError::EncoderUnavailable(_)));
    assert!(!dir.path().join("emb/good.f32").exists());
    assert!(!dir.path().join("index/BIND.txt").exists());
}
