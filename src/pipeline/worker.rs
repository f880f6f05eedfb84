//! Background work units triggered by an [`Action`].
//!
//! A unit takes key-value [`WorkData`] (at least `manifest_path`) and always
//! finishes with a [`WorkOutcome`]; errors become `Failure` data carrying
//! `error_kind` and `error` instead of propagating. [`execute`] runs a unit on
//! tokio's blocking pool.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use super::{Encoder, IngestPolicy, Pipeline};
use crate::cancel::CancelFlag;
use crate::error::{Result, RetrievalError};

pub const KEY_MANIFEST_PATH: &str = "manifest_path";
pub const KEY_PROCESSED: &str = "processed";
pub const KEY_HITS: &str = "hits";
pub const KEY_OUTPUT_PATH: &str = "output_path";
pub const KEY_ERROR_KIND: &str = "error_kind";
pub const KEY_ERROR: &str = "error";

pub type WorkData = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    Success(WorkData),
    Failure(WorkData),
}

impl WorkOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WorkOutcome::Success(_))
    }

    pub fn data(&self) -> &WorkData {
        match self {
            WorkOutcome::Success(data) | WorkOutcome::Failure(data) => data,
        }
    }

    fn from_result(result: Result<WorkData>) -> Self {
        match result {
            Ok(data) => WorkOutcome::Success(data),
            Err(err) => {
                let mut data = WorkData::new();
                data.insert(KEY_ERROR_KIND.into(), err.kind().as_str().into());
                data.insert(KEY_ERROR.into(), err.to_string());
                WorkOutcome::Failure(data)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Ingest,
    Retrieve,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Ingest => "ingest",
            Action::Retrieve => "retrieve",
        }
    }
}

impl FromStr for Action {
    type Err = RetrievalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ingest" => Ok(Action::Ingest),
            "retrieve" => Ok(Action::Retrieve),
            other => Err(RetrievalError::Config(format!("unknown action '{}'", other))),
        }
    }
}

/// One schedulable unit of work.
pub trait Work: Send + Sync + 'static {
    fn action(&self) -> Action;

    fn run(&self, input: &WorkData) -> Result<WorkData>;

    fn run_to_outcome(&self, input: &WorkData) -> WorkOutcome {
        let outcome = WorkOutcome::from_result(self.run(input));
        if let WorkOutcome::Failure(data) = &outcome {
            tracing::warn!(
                "work_failed action={} kind={} err={}",
                self.action().as_str(),
                data.get(KEY_ERROR_KIND).map(String::as_str).unwrap_or("other"),
                data.get(KEY_ERROR).map(String::as_str).unwrap_or("")
            );
        }
        outcome
    }
}

fn manifest_path(input: &WorkData) -> Result<PathBuf> {
    input
        .get(KEY_MANIFEST_PATH)
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| RetrievalError::Config(format!("work input has no {}", KEY_MANIFEST_PATH)))
}

/// Fail-fast ingestion: no encoder, or any failing item, fails the unit.
pub struct IngestWork {
    encoder: Option<Arc<dyn Encoder>>,
    cancel: CancelFlag,
}

impl IngestWork {
    pub fn new(encoder: Option<Arc<dyn Encoder>>) -> Self {
        Self {
            encoder,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Work for IngestWork {
    fn action(&self) -> Action {
        Action::Ingest
    }

    fn run(&self, input: &WorkData) -> Result<WorkData> {
        let path = manifest_path(input)?;
        let pipeline =
            Pipeline::from_manifest_path(&path, self.encoder.clone())?.with_cancel(self.cancel.clone());
        let report = pipeline.ingest_with(IngestPolicy::FailFast)?;

        let mut out = WorkData::new();
        out.insert(KEY_PROCESSED.into(), report.processed.to_string());
        Ok(out)
    }
}

pub struct RetrieveWork {
    cancel: CancelFlag,
}

impl RetrieveWork {
    pub fn new() -> Self {
        Self {
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Default for RetrieveWork {
    fn default() -> Self {
        Self::new()
    }
}

impl Work for RetrieveWork {
    fn action(&self) -> Action {
        Action::Retrieve
    }

    fn run(&self, input: &WorkData) -> Result<WorkData> {
        let path = manifest_path(input)?;
        let pipeline = Pipeline::from_manifest_path(&path, None)?.with_cancel(self.cancel.clone());
        let report = pipeline.retrieve()?;

        let mut out = WorkData::new();
        out.insert(KEY_HITS.into(), report.hits.len().to_string());
        out.insert(
            KEY_OUTPUT_PATH.into(),
            report.output_path.display().to_string(),
        );
        Ok(out)
    }
}

/// Run `work` on the blocking pool and wait for its outcome.
pub async fn execute<W: Work>(work: Arc<W>, input: WorkData) -> WorkOutcome {
    let action = work.action();
    match tokio::task::spawn_blocking(move || work.run_to_outcome(&input)).await {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!("work_join_failed action={} err={}", action.as_str(), err);
            let mut data = WorkData::new();
            data.insert(KEY_ERROR_KIND.into(), "other".into());
            data.insert(KEY_ERROR.into(), format!("{} join error: {}", action.as_str(), err));
            WorkOutcome::Failure(data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineManifest;
    use crate::pipeline::PrecomputedEncoder;
    use clipdex_core::codec;
    use std::path::Path;
    use tempfile::tempdir;

    fn write_manifest(root: &Path, videos: &[&str]) -> PathBuf {
        let mut m = PipelineManifest::default();
        m.ingest.videos = videos.iter().map(PathBuf::from).collect();
        m.index.dir = "index".into();
        m.ingest.output_dir = "emb".into();
        m.query.query_vec_path = "query.f32".into();
        m.query.output_path = "out/q1.json".into();
        let path = root.join("manifest.json");
        std::fs::write(&path, serde_json::to_vec(&m).unwrap()).unwrap();
        path
    }

    fn input(path: &Path) -> WorkData {
        let mut data = WorkData::new();
        data.insert(KEY_MANIFEST_PATH.into(), path.display().to_string());
        data
    }

    #[test]
    fn test_action_names() {
        assert_eq!("INGEST".parse::<Action>().unwrap(), Action::Ingest);
        assert_eq!(Action::Retrieve.as_str(), "retrieve");
        assert!("delete".parse::<Action>().is_err());
    }

    #[test]
    fn test_missing_manifest_path_is_failure() {
        let outcome = IngestWork::new(None).run_to_outcome(&WorkData::new());
        assert_eq!(outcome.data()[KEY_ERROR_KIND], "config");
    }

    #[test]
    fn test_ingest_without_encoder_fails_fast() {
        let dir = tempdir().unwrap();
        let path = write_manifest(dir.path(), &["a.mp4"]);
        let outcome = IngestWork::new(None).run_to_outcome(&input(&path));
        assert!(!outcome.is_success());
        assert_eq!(outcome.data()[KEY_ERROR_KIND], "encoder_unavailable");
        assert!(!dir.path().join("index/BIND.txt").exists());
    }

    #[tokio::test]
    async fn test_ingest_then_retrieve_async() {
        let dir = tempdir().unwrap();
        codec::write_vector(dir.path().join("a.f32"), &[1.0, 0.0]).unwrap();
        codec::write_vector(dir.path().join("b.f32"), &[0.0, 1.0]).unwrap();
        codec::write_vector(dir.path().join("query.f32"), &[0.2, 0.9]).unwrap();
        let path = write_manifest(dir.path(), &["a.mp4", "b.mp4"]);

        let ingest = Arc::new(IngestWork::new(Some(Arc::new(PrecomputedEncoder))));
        let outcome = execute(ingest, input(&path)).await;
        assert!(outcome.is_success(), "{:?}", outcome);
        assert_eq!(outcome.data()[KEY_PROCESSED], "2");

        let outcome = execute(Arc::new(RetrieveWork::new()), input(&path)).await;
        assert!(outcome.is_success(), "{:?}", outcome);
        assert_eq!(outcome.data()[KEY_HITS], "2");

        let results = crate::results::ResultsFile::read(&dir.path().join("out/q1.json")).unwrap();
        assert_eq!(results.ids, vec!["b", "a"]);
    }

    #[test]
    fn test_ingest_item_failure_fails_unit() {
        let dir = tempdir().unwrap();
        codec::write_vector(dir.path().join("a.f32"), &[1.0, 0.0]).unwrap();
        let path = write_manifest(dir.path(), &["a.mp4", "missing.mp4"]);
        let outcome = IngestWork::new(Some(Arc::new(PrecomputedEncoder))).run_to_outcome(&input(&path));
        assert_eq!(outcome.data()[KEY_ERROR_KIND], "encoder_unavailable");
    }
}
