//! Embedding producers consumed by the ingestion pipeline.

use std::path::{Path, PathBuf};

use clipdex_core::codec;

use crate::error::{Result, RetrievalError};

/// Turns a video (or text file) into one embedding vector.
///
/// The orchestrator receives an encoder explicitly; no encoder means
/// ingestion reports `encoder_unavailable`.
pub trait Encoder: Send + Sync {
    fn embed(&self, input: &Path, frame_count: usize, batch_size: usize) -> Result<Vec<f32>>;

    fn name(&self) -> &'static str {
        "encoder"
    }
}

/// Reads an already-computed `.f32` sitting beside the input
/// (`clip.mp4` -> `clip.f32`).
#[derive(Debug, Clone, Copy, Default)]
pub struct PrecomputedEncoder;

impl PrecomputedEncoder {
    pub fn sibling_path(input: &Path) -> PathBuf {
        input.with_extension(crate::embedding_store::VECTOR_EXT)
    }
}

impl Encoder for PrecomputedEncoder {
    fn embed(&self, input: &Path, _frame_count: usize, _batch_size: usize) -> Result<Vec<f32>> {
        let path = Self::sibling_path(input);
        if !path.is_file() {
            return Err(RetrievalError::EncoderUnavailable(format!(
                "no precomputed embedding at {:?}",
                path
            )));
        }
        Ok(codec::read_vector(&path)?)
    }

    fn name(&self) -> &'static str {
        "precomputed"
    }
}
