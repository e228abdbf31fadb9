use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::{undirected_neighbors, WeightedAdj};

#[derive(PartialEq)]
struct HeapEntry {
    cost: f32,
    node: usize,
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on cost; tie on node index for determinism.
        other
            .cost
            .partial_cmp(&self.cost)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Dijkstra over edge cost `1 / combined_weight`: strong edges are
/// short. Returns the node sequence from `from` to `to` inclusive, or
/// `None` when unreachable.
pub fn dijkstra_path(adj_out: &WeightedAdj, from: usize, to: usize) -> Option<Vec<usize>> {
    let n = adj_out.len();
    if from >= n || to >= n {
        return None;
    }
    if from == to {
        return Some(vec![from]);
    }

    let mut dist = vec![f32::INFINITY; n];
    let mut prev = vec![usize::MAX; n];
    dist[from] = 0.0;

    let mut heap = BinaryHeap::new();
    heap.push(HeapEntry {
        cost: 0.0,
        node: from,
    });

    while let Some(HeapEntry { cost, node }) = heap.pop() {
        if node == to {
            break;
        }
        if cost > dist[node] {
            continue;
        }
        for (&next, &weight) in &adj_out[node] {
            if weight <= f32::EPSILON {
                continue;
            }
            let next_cost = cost + 1.0 / weight;
            if next_cost < dist[next] {
                dist[next] = next_cost;
                prev[next] = node;
                heap.push(HeapEntry {
                    cost: next_cost,
                    node: next,
                });
            }
        }
    }

    if dist[to].is_infinite() {
        return None;
    }

    let mut path = vec![to];
    let mut cursor = to;
    while cursor != from {
        cursor = prev[cursor];
        path.push(cursor);
    }
    path.reverse();
    Some(path)
}

/// Best average combined weight over any simple path `from -> to` of at
/// most `max_hops` edges. This is the DAG-construction quality probe.
pub fn best_path_quality(
    adj_out: &WeightedAdj,
    from: usize,
    to: usize,
    max_hops: usize,
) -> Option<f32> {
    if from >= adj_out.len() || to >= adj_out.len() || from == to || max_hops == 0 {
        return None;
    }
    let mut on_path = vec![false; adj_out.len()];
    on_path[from] = true;
    let mut best = None;
    probe(adj_out, from, to, max_hops, 0.0, 0, &mut on_path, &mut best);
    best
}

#[allow(clippy::too_many_arguments)]
fn probe(
    adj_out: &WeightedAdj,
    node: usize,
    to: usize,
    max_hops: usize,
    weight_sum: f32,
    hops: usize,
    on_path: &mut Vec<bool>,
    best: &mut Option<f32>,
) {
    for (&next, &weight) in &adj_out[node] {
        if on_path[next] {
            continue;
        }
        let sum = weight_sum + weight;
        if next == to {
            let avg = sum / (hops + 1) as f32;
            if best.map_or(true, |b| avg > b) {
                *best = Some(avg);
            }
            continue;
        }
        if hops + 1 < max_hops {
            on_path[next] = true;
            probe(adj_out, next, to, max_hops, sum, hops + 1, on_path, best);
            on_path[next] = false;
        }
    }
}

/// Adamic-Adar similarity of a single pair: sum of `1 / ln(deg(z))` over
/// common undirected neighbors `z`. Degree-1 hubs contribute nothing.
pub fn adamic_adar_pair(adj_out: &WeightedAdj, a: usize, b: usize) -> f32 {
    if a >= adj_out.len() || b >= adj_out.len() || a == b {
        return 0.0;
    }
    let neighbors = undirected_neighbors(adj_out);
    pair_score(&neighbors, a, b)
}

fn pair_score(neighbors: &[rustc_hash::FxHashSet<usize>], a: usize, b: usize) -> f32 {
    let (small, large) = if neighbors[a].len() <= neighbors[b].len() {
        (&neighbors[a], &neighbors[b])
    } else {
        (&neighbors[b], &neighbors[a])
    };
    small
        .iter()
        .filter(|z| large.contains(z))
        .map(|&z| {
            let degree = neighbors[z].len();
            if degree > 1 {
                1.0 / (degree as f32).ln()
            } else {
                0.0
            }
        })
        .sum()
}

/// Top-k Adamic-Adar neighbors of `node`, best first, ties broken by
/// index. Only pairs with at least one common neighbor appear.
pub fn adamic_adar_top_k(adj_out: &WeightedAdj, node: usize, k: usize) -> Vec<(usize, f32)> {
    if node >= adj_out.len() || k == 0 {
        return Vec::new();
    }
    let neighbors = undirected_neighbors(adj_out);

    // Candidates are exactly the 2-hop neighborhood.
    let mut candidates: Vec<usize> = Vec::new();
    let mut seen = vec![false; adj_out.len()];
    seen[node] = true;
    for &z in &neighbors[node] {
        for &c in &neighbors[z] {
            if !seen[c] {
                seen[c] = true;
                candidates.push(c);
            }
        }
    }

    let mut scored: Vec<(usize, f32)> = candidates
        .into_iter()
        .map(|c| (c, pair_score(&neighbors, node, c)))
        .filter(|(_, s)| *s > 0.0)
        .collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(k);
    scored
}
