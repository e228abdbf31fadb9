use rustc_hash::FxHashMap;

use super::WeightedAdj;

/// Louvain community detection on the symmetrized graph.
///
/// Directed weights are folded into undirected edges (both directions
/// summed), then the classic two-phase scheme runs: greedy local moves
/// maximizing modularity gain, followed by community aggregation,
/// repeated until no move improves modularity. Node order is fixed and
/// ties go to the smallest community id, so results are deterministic.
///
/// Returns one dense community label per node, numbered by first
/// appearance.
pub fn louvain_communities(adj_out: &WeightedAdj) -> Vec<usize> {
    let n = adj_out.len();
    if n == 0 {
        return Vec::new();
    }

    // Symmetrize: weight[u][v] = weight[v][u] = w(u->v) + w(v->u).
    let mut undirected: Vec<FxHashMap<usize, f32>> = vec![FxHashMap::default(); n];
    for (u, targets) in adj_out.iter().enumerate() {
        for (&v, &w) in targets {
            if u == v {
                continue;
            }
            *undirected[u].entry(v).or_insert(0.0) += w;
            *undirected[v].entry(u).or_insert(0.0) += w;
        }
    }

    // membership[level] maps the previous level's supernodes down.
    let mut membership: Vec<usize> = (0..n).collect();
    let mut graph = undirected;

    for _level in 0..16 {
        let (labels, moved) = one_level(&graph);
        if !moved {
            break;
        }

        // Relabel communities densely in order of first appearance.
        let mut dense: FxHashMap<usize, usize> = FxHashMap::default();
        let mut next = 0usize;
        let labels: Vec<usize> = labels
            .iter()
            .map(|&c| {
                *dense.entry(c).or_insert_with(|| {
                    let id = next;
                    next += 1;
                    id
                })
            })
            .collect();

        for m in membership.iter_mut() {
            *m = labels[*m];
        }

        if next == graph.len() {
            break;
        }

        // Aggregate into the supergraph for the next level.
        let mut agg: Vec<FxHashMap<usize, f32>> = vec![FxHashMap::default(); next];
        for (u, targets) in graph.iter().enumerate() {
            for (&v, &w) in targets {
                let (cu, cv) = (labels[u], labels[v]);
                if cu == cv {
                    continue;
                }
                *agg[cu].entry(cv).or_insert(0.0) += w;
            }
        }
        graph = agg;
    }

    membership
}

/// One pass of greedy local moves. Returns (labels, any_move_happened).
fn one_level(graph: &[FxHashMap<usize, f32>]) -> (Vec<usize>, bool) {
    let n = graph.len();
    let mut community: Vec<usize> = (0..n).collect();

    // Each undirected edge weight appears in both adjacency rows, so the
    // row sums already equal 2m.
    let degree: Vec<f32> = graph.iter().map(|t| t.values().sum::<f32>()).collect();
    let two_m: f32 = degree.iter().sum();
    if two_m <= f32::EPSILON {
        return (community, false);
    }
    let mut community_total: Vec<f32> = degree.clone();

    let mut moved_any = false;
    for _pass in 0..32 {
        let mut moved_this_pass = false;
        for u in 0..n {
            let current = community[u];
            community_total[current] -= degree[u];

            // Weight from u into each neighboring community.
            let mut links: FxHashMap<usize, f32> = FxHashMap::default();
            for (&v, &w) in &graph[u] {
                *links.entry(community[v]).or_insert(0.0) += w;
            }

            let mut best_community = current;
            let mut best_gain = links.get(&current).copied().unwrap_or(0.0)
                - community_total[current] * degree[u] / two_m;
            let mut candidates: Vec<usize> = links.keys().copied().collect();
            candidates.sort_unstable();
            for c in candidates {
                let gain = links[&c] - community_total[c] * degree[u] / two_m;
                if gain > best_gain + f32::EPSILON {
                    best_gain = gain;
                    best_community = c;
                }
            }

            community_total[best_community] += degree[u];
            if best_community != current {
                community[u] = best_community;
                moved_this_pass = true;
                moved_any = true;
            }
        }
        if !moved_this_pass {
            break;
        }
    }

    (community, moved_any)
}
