//! K-Means training for coarse quantizers and PQ codebooks
//!
//! Lloyd's algorithm with k-means++ seeding. All randomness flows from one
//! seeded `StdRng`, so a given sample and seed always yield the same model.
//!
//! `k` is clamped to the number of training points: asking for 4096 lists
//! over 300 vectors produces 300 centroids instead of failing.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::metric::l2_distance_squared;
use crate::pq::{PqError, ProductQuantizer, MAX_CENTROIDS};

/// Configuration for PQ training
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Number of subspaces `m` (default: 16)
    pub num_subspaces: usize,

    /// Code width in bits; centroids per subspace = `2^bits` (default: 8)
    pub bits: u32,

    /// Maximum Lloyd iterations (default: 25)
    pub max_iters: usize,

    /// Stop when max centroid movement < tolerance (default: 1e-4)
    pub tolerance: f32,

    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_subspaces: 16,
            bits: 8,
            max_iters: 25,
            tolerance: 1e-4,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    /// Centroids per subspace for a sample of `n` vectors.
    pub fn effective_centroids(&self, n: usize) -> usize {
        let requested = 1usize << self.bits.min(8);
        requested.min(MAX_CENTROIDS).min(n.max(1))
    }
}

/// Train a PQ codebook.
pub fn train_pq(
    vectors: &[Vec<f32>],
    dimension: usize,
    config: &TrainingConfig,
) -> Result<ProductQuantizer, PqError> {
    if vectors.is_empty() {
        return Err(PqError::InsufficientData {
            count: 0,
            minimum: 1,
        });
    }
    if config.num_subspaces == 0 || dimension % config.num_subspaces != 0 {
        return Err(PqError::IndivisibleDimension {
            dimension,
            num_subspaces: config.num_subspaces,
        });
    }

    let sub_dim = dimension / config.num_subspaces;
    let k = config.effective_centroids(vectors.len());
    let mut codebook = vec![0.0f32; config.num_subspaces * k * sub_dim];

    for s in 0..config.num_subspaces {
        let sub_vectors: Vec<&[f32]> = vectors
            .iter()
            .map(|v| &v[s * sub_dim..(s + 1) * sub_dim])
            .collect();

        let centroids = kmeans(
            &sub_vectors,
            sub_dim,
            k,
            config.max_iters,
            config.tolerance,
            config.seed.wrapping_add(s as u64),
        );

        let offset = s * k * sub_dim;
        codebook[offset..offset + k * sub_dim].copy_from_slice(&centroids);
    }

    ProductQuantizer::new(dimension, config.num_subspaces, k, codebook)
}

/// K-means++ seeding: each next centroid is drawn with probability
/// proportional to its squared distance from the nearest chosen one.
fn kmeans_plus_plus_init(data: &[&[f32]], dim: usize, k: usize, rng: &mut StdRng) -> Vec<f32> {
    let n = data.len();
    let mut centroids = vec![0.0f32; k * dim];

    let first_idx = rng.gen_range(0..n);
    centroids[0..dim].copy_from_slice(data[first_idx]);

    let mut min_dists = vec![f32::MAX; n];

    for c in 1..k {
        let last_centroid = &centroids[(c - 1) * dim..c * dim];
        for (i, point) in data.iter().enumerate() {
            let d = l2_distance_squared(point, last_centroid);
            if d < min_dists[i] {
                min_dists[i] = d;
            }
        }

        let total: f64 = min_dists.iter().map(|&d| d as f64).sum();
        let chosen = if total <= 0.0 {
            rng.gen_range(0..n)
        } else {
            let threshold = rng.gen::<f64>() * total;
            let mut cumulative = 0.0f64;
            let mut chosen = n - 1;
            for (i, &d) in min_dists.iter().enumerate() {
                cumulative += d as f64;
                if cumulative >= threshold {
                    chosen = i;
                    break;
                }
            }
            chosen
        };

        centroids[c * dim..(c + 1) * dim].copy_from_slice(data[chosen]);
    }

    centroids
}

/// Index of the centroid nearest to `point` (squared L2; first wins on ties).
#[inline]
pub fn nearest_centroid(centroids: &[f32], dim: usize, point: &[f32]) -> usize {
    let mut best_c = 0;
    let mut best_dist = f32::MAX;
    for (c, centroid) in centroids.chunks_exact(dim).enumerate() {
        let dist = l2_distance_squared(point, centroid);
        if dist < best_dist {
            best_dist = dist;
            best_c = c;
        }
    }
    best_c
}

/// Lloyd's k-means. Returns `min(k, data.len())` centroids, flattened.
pub fn kmeans(
    data: &[&[f32]],
    dim: usize,
    k: usize,
    max_iters: usize,
    tolerance: f32,
    seed: u64,
) -> Vec<f32> {
    let n = data.len();
    let k = k.min(n);
    if k == 0 {
        return Vec::new();
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = kmeans_plus_plus_init(data, dim, k, &mut rng);
    let mut assignments = vec![0usize; n];
    let mut new_centroids = vec![0.0f32; k * dim];
    let mut counts = vec![0usize; k];

    for iter in 0..max_iters {
        for (i, point) in data.iter().enumerate() {
            assignments[i] = nearest_centroid(&centroids, dim, point);
        }

        new_centroids.fill(0.0);
        counts.fill(0);
        for (i, point) in data.iter().enumerate() {
            let c = assignments[i];
            counts[c] += 1;
            let offset = c * dim;
            for d in 0..dim {
                new_centroids[offset + d] += point[d];
            }
        }

        for c in 0..k {
            let offset = c * dim;
            if counts[c] > 0 {
                let count_f = counts[c] as f32;
                for d in 0..dim {
                    new_centroids[offset + d] /= count_f;
                }
            } else {
                // Dead centroid: reseed from a random point
                let idx = rng.gen_range(0..n);
                new_centroids[offset..offset + dim].copy_from_slice(data[idx]);
            }
        }

        let max_movement = centroids
            .chunks_exact(dim)
            .zip(new_centroids.chunks_exact(dim))
            .map(|(old, new)| l2_distance_squared(old, new))
            .fold(0.0f32, f32::max);

        std::mem::swap(&mut centroids, &mut new_centroids);

        if max_movement < tolerance * tolerance {
            tracing::debug!("K-means converged after {} iterations", iter + 1);
            break;
        }
    }

    centroids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dim).map(|_| rng.gen::<f32>() - 0.5).collect())
            .collect()
    }

    #[test]
    fn test_kmeans_finds_separated_clusters() {
        let mut data = Vec::new();
        let mut rng = StdRng::seed_from_u64(42);
        for center in [(0.0f32, 0.0f32), (5.0, 5.0), (10.0, 0.0)] {
            for _ in 0..100 {
                data.push(vec![
                    center.0 + rng.gen::<f32>() * 0.1,
                    center.1 + rng.gen::<f32>() * 0.1,
                ]);
            }
        }

        let refs: Vec<&[f32]> = data.iter().map(|v| v.as_slice()).collect();
        let centroids = kmeans(&refs, 2, 3, 50, 1e-6, 42);

        let mut xs: Vec<f32> = centroids.chunks_exact(2).map(|c| c[0]).collect();
        xs.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!(xs[0].abs() < 0.5);
        assert!((xs[1] - 5.0).abs() < 0.5);
        assert!((xs[2] - 10.0).abs() < 0.5);
    }

    #[test]
    fn test_kmeans_clamps_k_to_sample() {
        let data = random_vectors(5, 4, 1);
        let refs: Vec<&[f32]> = data.iter().map(|v| v.as_slice()).collect();
        let centroids = kmeans(&refs, 4, 4096, 10, 1e-4, 7);
        assert_eq!(centroids.len(), 5 * 4);
    }

    #[test]
    fn test_kmeans_is_deterministic_for_seed() {
        let data = random_vectors(200, 8, 9);
        let refs: Vec<&[f32]> = data.iter().map(|v| v.as_slice()).collect();
        assert_eq!(kmeans(&refs, 8, 16, 10, 1e-4, 3), kmeans(&refs, 8, 16, 10, 1e-4, 3));
    }

    #[test]
    fn test_train_pq_reconstructs_reasonably() {
        let vectors = random_vectors(500, 32, 123);
        let config = TrainingConfig {
            num_subspaces: 4,
            max_iters: 15,
            ..TrainingConfig::default()
        };

        let pq = train_pq(&vectors, 32, &config).unwrap();
        assert_eq!(pq.num_centroids, 256);

        let reconstructed = pq.decode(&pq.encode(&vectors[0]));
        let error = l2_distance_squared(&vectors[0], &reconstructed);
        assert!(error < 5.0, "reconstruction error {}", error);
    }

    #[test]
    fn test_train_pq_small_sample_shrinks_codebook() {
        let vectors = random_vectors(10, 16, 4);
        let config = TrainingConfig {
            num_subspaces: 4,
            ..TrainingConfig::default()
        };
        let pq = train_pq(&vectors, 16, &config).unwrap();
        assert_eq!(pq.num_centroids, 10);
    }

    #[test]
    fn test_train_pq_rejects_empty_and_indivisible() {
        let config = TrainingConfig {
            num_subspaces: 4,
            ..TrainingConfig::default()
        };
        assert!(matches!(
            train_pq(&[], 16, &config),
            Err(PqError::InsufficientData { .. })
        ));
        assert!(matches!(
            train_pq(&random_vectors(20, 10, 1), 10, &config),
            Err(PqError::IndivisibleDimension { .. })
        ));
    }
}
