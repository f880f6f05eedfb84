//! HNSW (Hierarchical Navigable Small World) graph
//!
//! One graph is built per sealed segment when a snapshot loads; graphs are
//! never persisted. Node ids are row positions inside the segment.
//!
//! ```text
//! Layer 2: ●───────────────● (few nodes, long-range)
//!          │               │
//! Layer 1: ●─────●─────●───● (more nodes)
//!          │     │     │   │
//! Layer 0: ●─●─●─●─●─●─●─●─● (all nodes)
//! ```

mod graph;
mod node;
mod visited;

pub use graph::{HnswGraph, HnswParams};
pub use node::Node;
pub use visited::VisitedSet;
