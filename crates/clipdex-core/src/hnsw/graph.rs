//! HNSW build and search
//!
//! **Insert**: draw a random top layer L, descend greedily from the entry
//! point to L, then wire connections on every layer from L down to 0 using
//! the diversity heuristic.
//!
//! **Search**: greedy descent to layer 1, then beam search on layer 0 with
//! `ef` candidates.
//!
//! Vectors are expected to be L2-normalized; distance is `1 - dot`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::node::Node;
use super::visited::VisitedSet;
use crate::metric::dot_product;

/// Build and search parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HnswParams {
    /// Max neighbors per upper layer (layer 0 allows `2 * m`)
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 32,
            ef_construction: 200,
            ef_search: 64,
            seed: 0x5EED,
        }
    }
}

/// Heap entry ordered by distance, then id, so equal distances resolve the
/// same way on every run.
#[derive(Clone, Copy, PartialEq)]
struct Scored {
    distance: f32,
    id: u32,
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct HnswGraph {
    dim: usize,
    vectors: Vec<f32>,
    nodes: Vec<Node>,
    entry_point: Option<u32>,
    max_layer: usize,
    m: usize,
    m0: usize,
    ml: f64,
    ef_construction: usize,
    rng: StdRng,
}

impl HnswGraph {
    pub fn new(dim: usize, params: HnswParams) -> Self {
        let m = params.m.max(2);
        Self {
            dim,
            vectors: Vec::new(),
            nodes: Vec::new(),
            entry_point: None,
            max_layer: 0,
            m,
            m0: m * 2,
            ml: 1.0 / (m as f64).ln(),
            ef_construction: params.ef_construction.max(1),
            rng: StdRng::seed_from_u64(params.seed),
        }
    }

    /// Build a graph over `rows` in order; node `i` is `rows[i]`.
    pub fn build<'a, I>(dim: usize, params: HnswParams, rows: I) -> Self
    where
        I: IntoIterator<Item = &'a [f32]>,
    {
        let mut graph = Self::new(dim, params);
        for row in rows {
            graph.insert(row);
        }
        graph
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn max_layer(&self) -> usize {
        self.max_layer
    }

    #[inline]
    fn vector(&self, id: u32) -> &[f32] {
        let start = id as usize * self.dim;
        &self.vectors[start..start + self.dim]
    }

    #[inline]
    fn distance(&self, query: &[f32], id: u32) -> f32 {
        1.0 - dot_product(query, self.vector(id))
    }

    fn random_layer(&mut self) -> usize {
        let r: f64 = self.rng.gen::<f64>().max(f64::MIN_POSITIVE);
        ((-r.ln() * self.ml).floor() as usize).min(16)
    }

    /// Append a vector and link it into the graph. Returns its node id.
    pub fn insert(&mut self, vector: &[f32]) -> u32 {
        debug_assert_eq!(vector.len(), self.dim);
        let id = self.nodes.len() as u32;
        self.vectors.extend_from_slice(vector);
        let node_layer = self.random_layer();
        self.nodes.push(Node::new(node_layer));

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(id);
            self.max_layer = node_layer;
            return id;
        };

        let query = self.vector(id).to_vec();
        let mut visited = VisitedSet::with_capacity(self.nodes.len());
        let mut current = entry;

        for layer in (node_layer + 1..=self.max_layer).rev() {
            if let Some(best) = self.search_layer(&query, current, 1, layer, &mut visited).first() {
                current = best.id;
            }
        }

        for layer in (0..=node_layer.min(self.max_layer)).rev() {
            let m_layer = if layer == 0 { self.m0 } else { self.m };
            let candidates =
                self.search_layer(&query, current, self.ef_construction, layer, &mut visited);
            let selected = self.select_neighbors(&candidates, m_layer);

            self.nodes[id as usize].set_neighbors(layer, selected.iter().map(|s| s.id).collect());
            for neighbor in &selected {
                self.link_back(neighbor.id, id, layer, m_layer);
            }

            if let Some(best) = candidates.first() {
                current = best.id;
            }
        }

        if node_layer > self.max_layer {
            self.max_layer = node_layer;
            self.entry_point = Some(id);
        }
        id
    }

    /// Add `new_id` to `target`'s list, re-running the heuristic on overflow.
    fn link_back(&mut self, target: u32, new_id: u32, layer: usize, m_layer: usize) {
        let added = self.nodes[target as usize].add_neighbor(layer, new_id);
        if !added || self.nodes[target as usize].neighbors(layer).len() <= m_layer {
            return;
        }
        let base = self.vector(target).to_vec();
        let mut candidates: Vec<Scored> = self.nodes[target as usize]
            .neighbors(layer)
            .iter()
            .map(|&n| Scored {
                distance: self.distance(&base, n),
                id: n,
            })
            .collect();
        candidates.sort();
        let pruned = self.select_neighbors(&candidates, m_layer);
        self.nodes[target as usize].set_neighbors(layer, pruned.iter().map(|s| s.id).collect());
    }

    /// Beam search on one layer. Result is sorted nearest first.
    fn search_layer(
        &self,
        query: &[f32],
        entry: u32,
        ef: usize,
        layer: usize,
        visited: &mut VisitedSet,
    ) -> Vec<Scored> {
        visited.clear();
        visited.visit(entry as usize);

        let start = Scored {
            distance: self.distance(query, entry),
            id: entry,
        };
        // Min-heap of frontier, max-heap of kept results
        let mut frontier = BinaryHeap::new();
        frontier.push(std::cmp::Reverse(start));
        let mut results = BinaryHeap::with_capacity(ef + 1);
        results.push(start);

        while let Some(std::cmp::Reverse(current)) = frontier.pop() {
            if let Some(worst) = results.peek() {
                if results.len() >= ef && current > *worst {
                    break;
                }
            }

            for &neighbor in self.nodes[current.id as usize].neighbors(layer) {
                if !visited.visit(neighbor as usize) {
                    continue;
                }
                let candidate = Scored {
                    distance: self.distance(query, neighbor),
                    id: neighbor,
                };
                let dominated = results.len() >= ef
                    && results.peek().map(|w| candidate > *w).unwrap_or(false);
                if !dominated {
                    frontier.push(std::cmp::Reverse(candidate));
                    results.push(candidate);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    /// Diversity heuristic: keep a candidate only if it is closer to the base
    /// than to every already-kept neighbor; top up with the nearest leftovers.
    /// `candidates` must be sorted nearest first.
    fn select_neighbors(&self, candidates: &[Scored], m: usize) -> Vec<Scored> {
        let mut result: Vec<Scored> = Vec::with_capacity(m);
        for candidate in candidates {
            if result.len() >= m {
                break;
            }
            let candidate_vec = self.vector(candidate.id);
            let diverse = result.iter().all(|kept| {
                1.0 - dot_product(candidate_vec, self.vector(kept.id)) >= candidate.distance
            });
            if diverse {
                result.push(*candidate);
            }
        }

        if result.len() < m {
            for candidate in candidates {
                if result.len() >= m {
                    break;
                }
                if !result.iter().any(|kept| kept.id == candidate.id) {
                    result.push(*candidate);
                }
            }
        }
        result
    }

    /// Approximate k nearest neighbors as `(node id, similarity)`, best first.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(u32, f32)> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }

        let mut visited = VisitedSet::with_capacity(self.nodes.len());
        let mut current = entry;
        for layer in (1..=self.max_layer).rev() {
            if let Some(best) = self.search_layer(query, current, 1, layer, &mut visited).first() {
                current = best.id;
            }
        }

        self.search_layer(query, current, ef.max(k), 0, &mut visited)
            .into_iter()
            .take(k)
            .map(|s| (s.id, 1.0 - s.distance))
            .collect()
    }
}
