//! Similarity kernels
//!
//! Plain iterator loops that LLVM auto-vectorizes with `-C target-cpu=native`.
//!
//! For L2-normalized vectors, dot product equals cosine similarity:
//! ```text
//! cos(θ) = A · B  when ||A|| = ||B|| = 1
//! ```
//! so every index stores unit vectors and scores with [`dot_product`].
//!
//! The zero vector is a valid embedding (degenerate or empty input). It
//! normalizes to itself and scores 0 against everything.

use serde::{Deserialize, Serialize};

/// Distance family recorded in an index manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Inner product over normalized vectors (cosine).
    #[default]
    Ip,
    /// Euclidean distance; scores are reported as `-||a - b||²`.
    L2,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Ip => "ip",
            Metric::L2 => "l2",
        }
    }

    /// Higher is better for both variants.
    #[inline]
    pub fn score(&self, query: &[f32], candidate: &[f32]) -> f32 {
        match self {
            Metric::Ip => dot_product(query, candidate),
            Metric::L2 => -l2_distance_squared(query, candidate),
        }
    }
}

/// Compute dot product of two vectors
#[inline(always)]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");

    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Compute squared L2 (Euclidean) distance between two vectors
#[inline(always)]
pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");

    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Euclidean norm, accumulated in f64 so tiny components do not underflow.
#[inline]
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt() as f32
}

/// L2 normalize a vector in place. Zero vectors are left as they are.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x = (*x as f64 / norm) as f32;
        }
    }
}

/// L2 normalize a vector, returning a new vector
pub fn l2_normalized(v: &[f32]) -> Vec<f32> {
    let mut out = v.to_vec();
    l2_normalize(&mut out);
    out
}

/// Cosine similarity where `query_unit` is already normalized and
/// `candidate` may have any scale.
///
/// Lengths must match; the caller validates dimensions.
#[inline]
pub fn cosine_normalized(query_unit: &[f32], candidate: &[f32]) -> f32 {
    let norm = l2_norm(candidate);
    if norm == 0.0 {
        return 0.0;
    }
    dot_product(query_unit, candidate) / norm
}

/// Check if a vector is L2 normalized (unit length)
#[inline]
pub fn is_normalized(v: &[f32], tolerance: f32) -> bool {
    (l2_norm(v) - 1.0).abs() < tolerance
}
