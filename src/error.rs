//! Error taxonomy shared by the store, the index backends and the pipeline.
//!
//! Each variant maps to a stable [`ErrorKind`] whose name is reported by the
//! worker entry points and whose exit code is used by the CLI.

use std::io;
use std::path::PathBuf;

use clipdex_core::codec::CodecError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RetrievalError>;

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("corrupt vector file {path:?}: {len} bytes is not a multiple of 4")]
    VectorCorrupt { path: PathBuf, len: usize },

    #[error("dimension mismatch ({context}): expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("index at {index_dir:?} is not trained; run `clipdex train` first")]
    IndexNotTrained { index_dir: PathBuf },

    #[error("manifest integrity violation: {0}")]
    ManifestIntegrity(String),

    #[error("encoder unavailable: {0}")]
    EncoderUnavailable(String),

    #[error("manifest not found: {0:?}")]
    ManifestNotFound(PathBuf),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unsupported index schema version {found} (this build reads up to {supported})")]
    UnsupportedSchema { found: u32, supported: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CodecError> for RetrievalError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Corrupt { path, len } => Self::VectorCorrupt { path, len },
            CodecError::DimensionMismatch {
                path,
                expected,
                actual,
            } => Self::DimensionMismatch {
                context: path.display().to_string(),
                expected,
                actual,
            },
            CodecError::Io { path, source } => Self::Io(io::Error::new(
                source.kind(),
                format!("{}: {}", path.display(), source),
            )),
        }
    }
}

impl RetrievalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::VectorCorrupt { .. } => ErrorKind::VectorCorrupt,
            Self::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            Self::IndexNotTrained { .. } => ErrorKind::IndexNotTrained,
            Self::ManifestIntegrity(_) => ErrorKind::ManifestIntegrity,
            Self::EncoderUnavailable(_) => ErrorKind::EncoderUnavailable,
            Self::ManifestNotFound(_) => ErrorKind::ManifestNotFound,
            Self::Config(_) => ErrorKind::Config,
            Self::UnsupportedSchema { .. } => ErrorKind::UnsupportedSchema,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Json,
        }
    }

    pub(crate) fn dim(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }

    pub(crate) fn integrity(msg: impl Into<String>) -> Self {
        Self::ManifestIntegrity(msg.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    ManifestNotFound,
    VectorCorrupt,
    DimensionMismatch,
    IndexNotTrained,
    ManifestIntegrity,
    EncoderUnavailable,
    UnsupportedSchema,
    Cancelled,
    Io,
    Json,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::ManifestNotFound => "manifest_not_found",
            Self::VectorCorrupt => "vector_corrupt",
            Self::DimensionMismatch => "dimension_mismatch",
            Self::IndexNotTrained => "index_not_trained",
            Self::ManifestIntegrity => "manifest_integrity",
            Self::EncoderUnavailable => "encoder_unavailable",
            Self::UnsupportedSchema => "unsupported_schema",
            Self::Cancelled => "cancelled",
            Self::Io => "io",
            Self::Json => "json",
            Self::Other => "other",
        }
    }

    /// Process exit status for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config | Self::ManifestNotFound => 2,
            Self::VectorCorrupt => 3,
            Self::DimensionMismatch => 4,
            Self::IndexNotTrained => 5,
            Self::ManifestIntegrity => 6,
            Self::EncoderUnavailable => 7,
            Self::UnsupportedSchema => 8,
            Self::Cancelled => 9,
            Self::Io | Self::Json | Self::Other => 1,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
