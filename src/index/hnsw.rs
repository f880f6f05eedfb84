//! Per-segment HNSW graphs, rebuilt each time a snapshot loads.

use clipdex_core::{HnswGraph, HnswParams};
use rayon::prelude::*;

use crate::config::IndexDesignConfig;
use crate::index::manifest::IndexManifest;

pub fn params_from(manifest: &IndexManifest, design: &IndexDesignConfig) -> HnswParams {
    HnswParams {
        m: manifest.param("hnswM").unwrap_or(design.hnsw_m),
        ef_construction: manifest
            .param("efConstruction")
            .unwrap_or(design.ef_construction),
        ef_search: manifest.param("efSearch").unwrap_or(design.ef_search),
        seed: design.seed,
    }
}

/// Build one graph per segment in parallel. `segments[i]` holds the rows of
/// segment `i` flattened with width `dim`.
pub fn build_graphs(segments: &[&[f32]], dim: usize, params: HnswParams) -> Vec<HnswGraph> {
    segments
        .par_iter()
        .map(|flat| HnswGraph::build(dim, params, flat.chunks_exact(dim.max(1))))
        .collect()
}

pub fn describe(params: &HnswParams, segments: usize) -> String {
    format!(
        "hnsw m={} ef_construction={} ef_search={} graphs_per_snapshot={}",
        params.m, params.ef_construction, params.ef_search, segments
    )
}
