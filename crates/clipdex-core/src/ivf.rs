//! Inverted-file coarse quantizer
//!
//! `nlist` k-means centroids partition the space; every vector lives in the
//! list of its nearest centroid and a query probes the `nprobe` closest lists.

use crate::metric::l2_distance_squared;
use crate::training::{kmeans, nearest_centroid};

#[derive(Debug, Clone, PartialEq)]
pub struct CoarseQuantizer {
    pub dim: usize,
    /// Flattened `[nlist][dim]`
    pub centroids: Vec<f32>,
}

impl CoarseQuantizer {
    /// Train on `sample`. The list count is clamped to the sample size.
    pub fn train(sample: &[Vec<f32>], dim: usize, nlist: usize, max_iters: usize, seed: u64) -> Self {
        let refs: Vec<&[f32]> = sample.iter().map(|v| v.as_slice()).collect();
        let centroids = kmeans(&refs, dim, nlist.max(1), max_iters, 1e-4, seed);
        Self { dim, centroids }
    }

    pub fn from_centroids(dim: usize, centroids: Vec<f32>) -> Self {
        Self { dim, centroids }
    }

    pub fn nlist(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.centroids.len() / self.dim
        }
    }

    pub fn centroid(&self, list: usize) -> &[f32] {
        &self.centroids[list * self.dim..(list + 1) * self.dim]
    }

    /// List that owns `vector`.
    pub fn assign(&self, vector: &[f32]) -> usize {
        nearest_centroid(&self.centroids, self.dim, vector)
    }

    /// The `nprobe` lists closest to `query`, nearest first.
    pub fn nearest_lists(&self, query: &[f32], nprobe: usize) -> Vec<usize> {
        let mut scored: Vec<(f32, usize)> = self
            .centroids
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(i, c)| (l2_distance_squared(query, c), i))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        scored
            .into_iter()
            .take(nprobe.max(1))
            .map(|(_, i)| i)
            .collect()
    }
}
