//! Product Quantization (PQ)
//!
//! Splits a `D`-dimensional vector into `m` sub-vectors and replaces each with
//! the index of its nearest centroid in a per-subspace codebook. With 8-bit
//! codes a 512-d embedding (2 KiB) compresses to `m` bytes.
//!
//! # Architecture
//!
//! ```text
//! Vector [f32; D] → split into m sub-vectors of D/m floats each
//!                    ↓
//! Each sub-vector → nearest centroid index (u8)
//!                    ↓
//! PQ Code [u8; m]
//! ```
//!
//! # Distance Computation (ADC)
//!
//! ```text
//! Query → distance table: [m subspaces × C centroids]
//!       → for any PQ code, distance = sum of m table lookups
//! ```
//!
//! `C` is `2^bits` clamped to the training sample size, so small corpora still
//! get a valid (if coarse) codebook.

use crate::metric::l2_distance_squared;

/// Upper bound on centroids per subspace (u8 codes)
pub const MAX_CENTROIDS: usize = 256;

/// Errors from PQ operations
#[derive(Debug, thiserror::Error)]
pub enum PqError {
    #[error("Codebook alignment error")]
    AlignmentError,

    #[error("Codebook size mismatch: expected {expected}, got {actual}")]
    CodebookSizeMismatch { expected: usize, actual: usize },

    #[error("Dimension {dimension} is not divisible by {num_subspaces} subspaces")]
    IndivisibleDimension {
        dimension: usize,
        num_subspaces: usize,
    },

    #[error("Invalid centroid count {0} (must be 1..=256)")]
    InvalidCentroidCount(usize),

    #[error("Not enough training data: {count} vectors (minimum: {minimum})")]
    InsufficientData { count: usize, minimum: usize },
}

/// Product Quantizer
///
/// After training, encodes vectors to PQ codes and scores codes against a
/// query through a precomputed table.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductQuantizer {
    pub num_subspaces: usize,
    pub dimension: usize,
    pub sub_dimension: usize,
    pub num_centroids: usize,

    /// Flattened as `codebook[(s * num_centroids + c) * sub_dimension + d]`
    pub codebook: Vec<f32>,
}

impl ProductQuantizer {
    pub fn new(
        dimension: usize,
        num_subspaces: usize,
        num_centroids: usize,
        codebook: Vec<f32>,
    ) -> Result<Self, PqError> {
        if num_subspaces == 0 || dimension % num_subspaces != 0 {
            return Err(PqError::IndivisibleDimension {
                dimension,
                num_subspaces,
            });
        }
        if num_centroids == 0 || num_centroids > MAX_CENTROIDS {
            return Err(PqError::InvalidCentroidCount(num_centroids));
        }
        let sub_dimension = dimension / num_subspaces;
        let expected = num_subspaces * num_centroids * sub_dimension;
        if codebook.len() != expected {
            return Err(PqError::CodebookSizeMismatch {
                expected,
                actual: codebook.len(),
            });
        }

        Ok(Self {
            num_subspaces,
            dimension,
            sub_dimension,
            num_centroids,
            codebook,
        })
    }

    #[inline]
    fn centroid(&self, subspace: usize, centroid_idx: usize) -> &[f32] {
        let offset = (subspace * self.num_centroids + centroid_idx) * self.sub_dimension;
        &self.codebook[offset..offset + self.sub_dimension]
    }

    /// Encode a single vector into PQ codes
    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        debug_assert_eq!(vector.len(), self.dimension);
        let mut codes = Vec::with_capacity(self.num_subspaces);

        for s in 0..self.num_subspaces {
            let sub_vec = &vector[s * self.sub_dimension..(s + 1) * self.sub_dimension];
            let mut best_idx = 0usize;
            let mut best_dist = f32::MAX;

            for c in 0..self.num_centroids {
                let dist = l2_distance_squared(sub_vec, self.centroid(s, c));
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = c;
                }
            }

            codes.push(best_idx as u8);
        }

        codes
    }

    /// Pre-compute the ADC table for a query: `table[s * C + c]` is the squared
    /// L2 distance between query sub-vector `s` and centroid `c`.
    pub fn compute_distance_table(&self, query: &[f32]) -> Vec<f32> {
        debug_assert_eq!(query.len(), self.dimension);
        let mut table = vec![0.0f32; self.num_subspaces * self.num_centroids];

        for s in 0..self.num_subspaces {
            let query_sub = &query[s * self.sub_dimension..(s + 1) * self.sub_dimension];
            let table_offset = s * self.num_centroids;
            for c in 0..self.num_centroids {
                table[table_offset + c] = l2_distance_squared(query_sub, self.centroid(s, c));
            }
        }

        table
    }

    /// Approximate squared distance between the query behind `table` and `codes`.
    #[inline(always)]
    pub fn adc_distance(&self, table: &[f32], codes: &[u8]) -> f32 {
        debug_assert_eq!(codes.len(), self.num_subspaces);
        codes
            .iter()
            .enumerate()
            .map(|(s, &c)| table[s * self.num_centroids + c as usize])
            .sum()
    }

    /// Reconstruct (approximate) the original vector from PQ codes
    pub fn decode(&self, codes: &[u8]) -> Vec<f32> {
        debug_assert_eq!(codes.len(), self.num_subspaces);
        let mut vector = Vec::with_capacity(self.dimension);
        for (s, &c) in codes.iter().enumerate() {
            vector.extend_from_slice(self.centroid(s, c as usize));
        }
        vector
    }

    pub fn codebook_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.codebook)
    }

    pub fn from_codebook_bytes(
        dimension: usize,
        num_subspaces: usize,
        num_centroids: usize,
        bytes: &[u8],
    ) -> Result<Self, PqError> {
        if bytes.len() % 4 != 0 {
            return Err(PqError::AlignmentError);
        }
        // Decode by value; the slice may come from an unaligned buffer.
        let codebook: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(dimension, num_subspaces, num_centroids, codebook)
    }
}
