use std::path::Path;
use std::process::{Command, Output};

use clipdex_core::codec;
use tempfile::tempdir;

fn clipdex(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_clipdex"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("spawn clipdex")
}

fn write_manifest(root: &Path, json: serde_json::Value) -> String {
    let path = root.join("pipeline.json");
    std::fs::write(&path, serde_json::to_vec(&json).expect("json")).expect("write manifest");
    path.display().to_string()
}

#[test]
fn missing_manifest_exits_2() {
    let dir = tempdir().expect("tempdir");
    let missing = dir.path().join("absent.json");
    let out = clipdex(&["retrieve", "--manifest", missing.to_str().expect("utf8")]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn ingest_and_retrieve_through_the_binary() {
    let dir = tempdir().expect("tempdir");
    codec::write_vector(dir.path().join("doc1.f32"), &[1.0, 0.0, 0.0]).expect("doc1");
    codec::write_vector(dir.path().join("doc2.f32"), &[0.0, 1.0, 0.0]).expect("doc2");
    codec::write_vector(dir.path().join("query.f32"), &[0.9, 0.1, 0.0]).expect("query");
    let manifest = write_manifest(
        dir.path(),
        serde_json::json!({
            "index": { "dir": "index" },
            "ingest": { "videos": ["doc1.mp4", "doc2.mp4"], "output_dir": "emb" },
            "query": { "query_vec_path": "query.f32", "output_path": "q1.json" }
        }),
    );

    let out = clipdex(&["ingest", "--manifest", &manifest]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let out = clipdex(&["retrieve", "--manifest", &manifest]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let results: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("q1.json")).expect("results"))
            .expect("parse results");
    assert_eq!(results["ids"], serde_json::json!(["doc1", "doc2"]));
}

#[test]
fn taxonomy_errors_map_to_distinct_codes() {
    let dir = tempdir().expect("tempdir");

    // Corrupt query vector.
    std::fs::write(dir.path().join("query.f32"), [0u8; 6]).expect("corrupt query");
    let manifest = write_manifest(
        dir.path(),
        serde_json::json!({
            "index": { "dir": "index" },
            "ingest": { "output_dir": "emb" },
            "query": { "query_vec_path": "query.f32", "output_path": "q1.json" }
        }),
    );
    assert_eq!(clipdex(&["retrieve", "--manifest", &manifest]).status.code(), Some(3));

    // Inspect with the wrong width.
    codec::write_vector(dir.path().join("v.f32"), &[1.0, 2.0]).expect("vector");
    let v = dir.path().join("v.f32");
    let out = clipdex(&["inspect", "--file", v.to_str().expect("utf8"), "--dim", "4"]);
    assert_eq!(out.status.code(), Some(4));

    // Untrained approximate index.
    let index_dir = dir.path().join("ivf");
    let batch = dir.path().join("batch.f32");
    codec::write_vector(&batch, &[1.0, 0.0, 0.0, 1.0]).expect("batch");
    let ivf_manifest = write_manifest(
        dir.path(),
        serde_json::json!({
            "index": { "dir": index_dir, "type": "IVF_PQ", "auto_train": false },
            "ingest": { "output_dir": "emb" },
            "query": { "query_vec_path": "v.f32", "output_path": "q2.json" }
        }),
    );
    let out = clipdex(&[
        "build-segment",
        "--manifest",
        &ivf_manifest,
        "--batch",
        batch.to_str().expect("utf8"),
        "--dim",
        "2",
        "--count",
        "2",
        "--video-id",
        "clip",
    ]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(clipdex(&["retrieve", "--manifest", &ivf_manifest]).status.code(), Some(5));

    // Referenced segment removed.
    for entry in std::fs::read_dir(index_dir.join("segments")).expect("segments") {
        let path = entry.expect("entry").path();
        if path.extension().and_then(|e| e.to_str()) == Some("vec") {
            std::fs::remove_file(path).expect("remove");
        }
    }
    let out = clipdex(&["recover", "--index-dir", index_dir.to_str().expect("utf8")]);
    assert_eq!(out.status.code(), Some(6));

    // No encoder output beside the video: ingest reports the failure.
    let enc_manifest = write_manifest(
        dir.path(),
        serde_json::json!({
            "index": { "dir": "index3" },
            "ingest": { "videos": ["ghost.mp4"], "output_dir": "emb3" }
        }),
    );
    assert_eq!(clipdex(&["ingest", "--manifest", &enc_manifest]).status.code(), Some(1));
}
