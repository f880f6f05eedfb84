//! IVF-PQ model and per-snapshot inverted lists.
//!
//! # Model file (`ivfpq-{ts}.model`, named by the manifest)
//!
//! ```text
//! Offset   Size           Type      Description
//! ─────────────────────────────────────────────────────
//! 0x00     8              [u8; 8]   Magic: "CLIPIVF1"
//! 0x08     4              u32 LE    dim
//! 0x0C     4              u32 LE    nlist
//! 0x10     4              u32 LE    m (PQ subspaces)
//! 0x14     4              u32 LE    ksub (centroids per subspace)
//! 0x18     nlist*dim*4    [f32]     coarse centroids
//! ...      m*ksub*dsub*4  [f32]     PQ codebook
//! ```
//!
//! Segments keep raw vectors, so the lists and PQ codes are rebuilt from the
//! model whenever a snapshot loads. Retraining therefore never rewrites
//! segment files.

use std::path::Path;

use clipdex_core::codec::{atomic_write, decode_le, encode_le};
use clipdex_core::pq::ProductQuantizer;
use clipdex_core::training::{train_pq, TrainingConfig};
use clipdex_core::{CoarseQuantizer, Metric};

use super::TopK;
use crate::config::IndexDesignConfig;
use crate::error::{Result, RetrievalError};

const MAGIC: [u8; 8] = *b"CLIPIVF1";
const HEADER_SIZE: usize = 24;
const KMEANS_ITERS: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct IvfPqModel {
    pub coarse: CoarseQuantizer,
    pub pq: ProductQuantizer,
}

/// Largest divisor of `dim` not above `requested`.
pub fn effective_pq_m(dim: usize, requested: usize) -> usize {
    (1..=requested.clamp(1, dim.max(1)))
        .rev()
        .find(|m| dim % m == 0)
        .unwrap_or(1)
}

impl IvfPqModel {
    pub fn train(sample: &[Vec<f32>], dim: usize, design: &IndexDesignConfig) -> Result<Self> {
        if sample.is_empty() {
            return Err(RetrievalError::Config("no vectors to train IVF-PQ on".into()));
        }
        let coarse = CoarseQuantizer::train(sample, dim, design.nlist, KMEANS_ITERS, design.seed);

        let m = effective_pq_m(dim, design.pq_m);
        if m != design.pq_m {
            tracing::warn!(
                "pq_m_adjusted requested={} effective={} dim={}",
                design.pq_m,
                m,
                dim
            );
        }
        let config = TrainingConfig {
            num_subspaces: m,
            bits: design.pq_bits,
            max_iters: KMEANS_ITERS,
            tolerance: 1e-4,
            seed: design.seed.wrapping_add(1),
        };
        let pq = train_pq(sample, dim, &config)
            .map_err(|e| RetrievalError::Config(format!("PQ training failed: {}", e)))?;

        Ok(Self { coarse, pq })
    }

    pub fn dim(&self) -> usize {
        self.coarse.dim
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            HEADER_SIZE + (self.coarse.centroids.len() + self.pq.codebook.len()) * 4,
        );
        out.extend_from_slice(&MAGIC);
        for v in [
            self.coarse.dim,
            self.coarse.nlist(),
            self.pq.num_subspaces,
            self.pq.num_centroids,
        ] {
            out.extend_from_slice(&(v as u32).to_le_bytes());
        }
        out.extend_from_slice(&encode_le(&self.coarse.centroids));
        out.extend_from_slice(&encode_le(&self.pq.codebook));
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE || bytes[0..8] != MAGIC {
            return Err(RetrievalError::integrity("ivf-pq model: bad magic or truncated header"));
        }
        let field = |i: usize| {
            let o = 8 + i * 4;
            u32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]) as usize
        };
        let (dim, nlist, m, ksub) = (field(0), field(1), field(2), field(3));
        if dim == 0 || m == 0 || dim % m != 0 {
            return Err(RetrievalError::integrity("ivf-pq model: invalid shape"));
        }

        let coarse_len = nlist * dim;
        let codebook_len = ksub * dim;
        let body = decode_le(&bytes[HEADER_SIZE..])
            .filter(|b| b.len() == coarse_len + codebook_len)
            .ok_or_else(|| RetrievalError::integrity("ivf-pq model: body size mismatch"))?;

        let coarse = CoarseQuantizer::from_centroids(dim, body[..coarse_len].to_vec());
        let pq = ProductQuantizer::new(dim, m, ksub, body[coarse_len..].to_vec())
            .map_err(|e| RetrievalError::integrity(format!("ivf-pq model: {}", e)))?;
        Ok(Self { coarse, pq })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write(path, &self.to_bytes())?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            RetrievalError::integrity(format!("trained index has no readable model {:?}: {}", path, e))
        })?;
        Self::from_bytes(&bytes)
    }
}

/// Row position inside a snapshot: (segment index, row index).
pub type RowRef = (u32, u32);

/// Inverted lists and PQ codes for every row of one snapshot.
pub struct IvfPqLists {
    pub model: IvfPqModel,
    lists: Vec<Vec<RowRef>>,
    /// Per segment, `rows * m` code bytes.
    codes: Vec<Vec<u8>>,
}

impl IvfPqLists {
    /// Assign and encode every row. `segments` yields each segment's rows.
    pub fn build<'a, S, R>(model: IvfPqModel, segments: S) -> Self
    where
        S: IntoIterator<Item = R>,
        R: IntoIterator<Item = &'a [f32]>,
    {
        let mut lists = vec![Vec::new(); model.coarse.nlist()];
        let mut codes = Vec::new();
        for (seg_idx, rows) in segments.into_iter().enumerate() {
            let mut seg_codes = Vec::new();
            for (row_idx, row) in rows.into_iter().enumerate() {
                lists[model.coarse.assign(row)].push((seg_idx as u32, row_idx as u32));
                seg_codes.extend(model.pq.encode(row));
            }
            codes.push(seg_codes);
        }
        Self {
            model,
            lists,
            codes,
        }
    }

    fn code(&self, at: RowRef) -> &[u8] {
        let m = self.model.pq.num_subspaces;
        let start = at.1 as usize * m;
        &self.codes[at.0 as usize][start..start + m]
    }

    /// ADC candidates from the `nprobe` nearest lists, best first.
    pub fn candidates(&self, query: &[f32], nprobe: usize, limit: usize) -> Vec<RowRef> {
        let table = self.model.pq.compute_distance_table(query);
        let mut top = TopK::new(limit);
        for list in self.model.coarse.nearest_lists(query, nprobe) {
            for &at in &self.lists[list] {
                top.push(at, -self.model.pq.adc_distance(&table, self.code(at)));
            }
        }
        top.into_sorted().into_iter().map(|(at, _)| at).collect()
    }

    pub fn list_sizes(&self) -> Vec<usize> {
        self.lists.iter().map(|l| l.len()).collect()
    }
}

/// Training info string recorded in the manifest.
pub fn describe(model: &IvfPqModel, sample: usize, metric: Metric) -> String {
    format!(
        "ivf_pq nlist={} m={} ksub={} sample={} metric={}",
        model.coarse.nlist(),
        model.pq.num_subspaces,
        model.pq.num_centroids,
        sample,
        metric.as_str()
    )
}
