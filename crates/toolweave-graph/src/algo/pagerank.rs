use super::WeightedAdj;

/// Weighted PageRank by power iteration.
///
/// Out-edge probability mass is proportional to combined edge weight;
/// dangling nodes spread their rank uniformly. Returns raw ranks that
/// sum to 1; callers normalize by the maximum when a `[0, 1]` score per
/// node is needed.
pub fn page_rank(
    adj_out: &WeightedAdj,
    damping: f32,
    max_iterations: usize,
    tolerance: f32,
) -> Vec<f32> {
    let n = adj_out.len();
    if n == 0 {
        return Vec::new();
    }

    let out_weight: Vec<f32> = adj_out
        .iter()
        .map(|targets| targets.values().sum::<f32>())
        .collect();

    let uniform = 1.0 / n as f32;
    let mut rank = vec![uniform; n];
    let mut next = vec![0.0f32; n];

    for _ in 0..max_iterations {
        let mut dangling_mass = 0.0f32;
        for i in 0..n {
            if out_weight[i] <= f32::EPSILON {
                dangling_mass += rank[i];
            }
        }

        let base = (1.0 - damping) * uniform + damping * dangling_mass * uniform;
        next.iter_mut().for_each(|r| *r = base);

        for (i, targets) in adj_out.iter().enumerate() {
            if out_weight[i] <= f32::EPSILON {
                continue;
            }
            let share = damping * rank[i] / out_weight[i];
            for (&j, &w) in targets {
                next[j] += share * w;
            }
        }

        let diff: f32 = rank
            .iter()
            .zip(next.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        std::mem::swap(&mut rank, &mut next);
        if diff < tolerance {
            break;
        }
    }

    rank
}
