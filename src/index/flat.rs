//! Brute-force search over a directory of `.f32` vectors.
//!
//! The query is normalized once; each stored vector is scored with
//! [`cosine_normalized`], so stored vectors need not be unit length. Files
//! are scored in parallel into per-thread [`TopK`] collectors that are merged
//! at the end. Any unreadable, corrupt or wrong-width file aborts the search.

use std::path::{Path, PathBuf};

use clipdex_core::codec;
use clipdex_core::metric::{cosine_normalized, l2_normalized};
use rayon::prelude::*;

use super::{hits_from_topk, IndexBackend, SearchHit, TopK};
use crate::embedding_store::list_vector_files;
use crate::error::{Result, RetrievalError};

#[derive(Debug, Clone)]
pub struct FlatIndex {
    dir: PathBuf,
    parallel: bool,
}

impl FlatIndex {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            parallel: true,
        }
    }

    /// Single-threaded scan; same results, used by benches for comparison.
    pub fn sequential<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            parallel: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn score_file(query_unit: &[f32], path: &Path) -> Result<f32> {
        let vector = codec::read_vector(path)?;
        if vector.len() != query_unit.len() {
            return Err(RetrievalError::dim(
                path.display().to_string(),
                query_unit.len(),
                vector.len(),
            ));
        }
        Ok(cosine_normalized(query_unit, &vector))
    }
}

impl IndexBackend for FlatIndex {
    fn search_top_k(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if query.is_empty() {
            return Err(RetrievalError::dim("empty query", 1, 0));
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_unit = l2_normalized(query);
        let files = list_vector_files(&self.dir)?;

        let top = if self.parallel {
            files
                .par_iter()
                .try_fold(
                    || TopK::new(k),
                    |mut acc, (id, path)| -> Result<TopK<String>> {
                        acc.push(id.clone(), Self::score_file(&query_unit, path)?);
                        Ok(acc)
                    },
                )
                .try_reduce(|| TopK::new(k), |a, b| Ok(a.merge(b)))?
        } else {
            let mut acc = TopK::new(k);
            for (id, path) in &files {
                acc.push(id.clone(), Self::score_file(&query_unit, path)?);
            }
            acc
        };

        tracing::debug!(
            "flat_search dir={:?} scanned={} k={} returned={}",
            self.dir,
            files.len(),
            k,
            top.len()
        );
        Ok(hits_from_topk(top))
    }

    fn name(&self) -> &'static str {
        "flat"
    }
}
