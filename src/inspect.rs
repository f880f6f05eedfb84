//! Summary statistics for a single vector file.

use std::path::Path;

use clipdex_core::codec;
use clipdex_core::metric::{is_normalized, l2_norm};
use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorSummary {
    pub dim: usize,
    pub l2_norm: f32,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub normalized: bool,
}

/// Read `path` (checking its width against `expected_dim` when given) and
/// summarize it. An empty file yields a zero summary.
pub fn inspect_vector(path: &Path, expected_dim: Option<usize>) -> Result<VectorSummary> {
    let vector = match expected_dim {
        Some(dim) => codec::read_vector_dim(path, dim)?,
        None => codec::read_vector(path)?,
    };
    Ok(summarize(&vector))
}

pub fn summarize(vector: &[f32]) -> VectorSummary {
    if vector.is_empty() {
        return VectorSummary {
            dim: 0,
            l2_norm: 0.0,
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            normalized: false,
        };
    }
    let (min, max) = vector
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)));
    let mean = (vector.iter().map(|&x| x as f64).sum::<f64>() / vector.len() as f64) as f32;
    VectorSummary {
        dim: vector.len(),
        l2_norm: l2_norm(vector),
        min,
        max,
        mean,
        normalized: is_normalized(vector, 1e-4),
    }
}
