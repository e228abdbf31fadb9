//! Graph algorithms over index-based adjacency.
//!
//! All functions here operate on `&[FxHashMap<usize, f32>]`: one map per
//! node index, keyed by target index, valued by combined edge weight.
//! The engine keeps a stable `ToolId <-> usize` bimap and translates at
//! its boundary, so these run allocation-light on dense indices.

mod louvain;
mod pagerank;
mod paths;

pub use louvain::louvain_communities;
pub use pagerank::page_rank;
pub use paths::{adamic_adar_pair, adamic_adar_top_k, best_path_quality, dijkstra_path};

use rustc_hash::{FxHashMap, FxHashSet};

pub type WeightedAdj = [FxHashMap<usize, f32>];

/// Undirected neighbor sets: out-neighbors unioned with in-neighbors.
pub(crate) fn undirected_neighbors(adj_out: &WeightedAdj) -> Vec<FxHashSet<usize>> {
    let mut neighbors: Vec<FxHashSet<usize>> = vec![FxHashSet::default(); adj_out.len()];
    for (u, targets) in adj_out.iter().enumerate() {
        for &v in targets.keys() {
            neighbors[u].insert(v);
            neighbors[v].insert(u);
        }
    }
    neighbors
}
