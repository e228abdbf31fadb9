//! Task-DAG validation, layering and cycle breaking.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use toolweave_core::{Result, TaskDag, ToolId, WeaveError};

/// A proposed dependency between two candidate indices, weighted by the
/// average combined weight of its supporting path.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CandidateEdge {
    pub from: usize,
    pub to: usize,
    pub weight: f32,
}

/// Kahn's algorithm. Errors if a `depends_on` references an unknown task
/// or if any task is unreachable from the sources (a cycle).
pub fn topological_layers(dag: &TaskDag) -> Result<Vec<Vec<String>>> {
    let index: FxHashMap<&str, usize> = dag
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();

    let n = dag.tasks.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, task) in dag.tasks.iter().enumerate() {
        for dep in &task.depends_on {
            let j = *index.get(dep.as_str()).ok_or_else(|| {
                WeaveError::Validation(format!(
                    "task {} depends on unknown task {}",
                    task.id, dep
                ))
            })?;
            in_degree[i] += 1;
            dependents[j].push(i);
        }
    }

    let mut ready: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut layers: Vec<Vec<String>> = Vec::new();
    let mut placed = 0usize;

    while !ready.is_empty() {
        let mut layer = Vec::with_capacity(ready.len());
        let mut next_ready = VecDeque::new();
        while let Some(i) = ready.pop_front() {
            layer.push(dag.tasks[i].id.clone());
            placed += 1;
            for &d in &dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    next_ready.push_back(d);
                }
            }
        }
        layer.sort();
        layers.push(layer);
        ready = next_ready;
    }

    if placed != n {
        let stuck: Vec<&str> = dag
            .tasks
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, t)| t.id.as_str())
            .collect();
        return Err(WeaveError::CycleDetected(format!(
            "tasks form a cycle: {}",
            stuck.join(", ")
        )));
    }

    Ok(layers)
}

pub fn validate_acyclic(dag: &TaskDag) -> Result<()> {
    topological_layers(dag).map(|_| ())
}

/// Remove the fewest, weakest edges needed to make the candidate edge
/// set acyclic.
///
/// Opposed pairs keep the strictly heavier direction; full cycles drop
/// their minimum-weight edge. All ties resolve by lexicographic
/// `(from, to)` tool-id order, keeping the lexicographically smaller
/// edge, so the result is deterministic.
pub(crate) fn break_cycles(n: usize, edges: &mut Vec<CandidateEdge>, ids: &[ToolId]) {
    let lex = |e: &CandidateEdge| (ids[e.from].clone(), ids[e.to].clone());

    // Opposed pairs first.
    let mut drop = vec![false; edges.len()];
    for a in 0..edges.len() {
        for b in (a + 1)..edges.len() {
            if edges[a].from == edges[b].to && edges[a].to == edges[b].from {
                let (keep_a, keep_b) = if edges[a].weight > edges[b].weight {
                    (true, false)
                } else if edges[b].weight > edges[a].weight {
                    (false, true)
                } else if lex(&edges[a]) < lex(&edges[b]) {
                    (true, false)
                } else {
                    (false, true)
                };
                drop[a] |= !keep_a;
                drop[b] |= !keep_b;
            }
        }
    }
    let mut kept: Vec<CandidateEdge> = edges
        .iter()
        .zip(drop.iter())
        .filter(|(_, &d)| !d)
        .map(|(e, _)| *e)
        .collect();

    // Longer cycles: peel acyclic nodes with Kahn; any leftover nodes
    // sit on a cycle, so drop the weakest remaining edge among them and
    // retry.
    loop {
        let mut in_degree = vec![0usize; n];
        for e in &kept {
            in_degree[e.to] += 1;
        }
        let mut ready: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut alive = vec![true; n];
        let mut remaining = n;
        while let Some(i) = ready.pop_front() {
            alive[i] = false;
            remaining -= 1;
            for e in &kept {
                if e.from == i {
                    in_degree[e.to] -= 1;
                    if in_degree[e.to] == 0 && alive[e.to] {
                        ready.push_back(e.to);
                    }
                }
            }
        }
        if remaining == 0 {
            break;
        }

        let victim = kept
            .iter()
            .enumerate()
            .filter(|(_, e)| alive[e.from] && alive[e.to])
            .min_by(|(_, a), (_, b)| {
                a.weight
                    .partial_cmp(&b.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // Heavier survives; among equals the lex-larger goes.
                    .then_with(|| lex(b).cmp(&lex(a)))
            })
            .map(|(i, _)| i);
        match victim {
            Some(i) => {
                kept.swap_remove(i);
            }
            None => break,
        }
    }

    *edges = kept;
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolweave_core::{TaskKind, TaskNode};

    fn dag(tasks: &[(&str, &[&str])]) -> TaskDag {
        TaskDag {
            tasks: tasks
                .iter()
                .map(|(id, deps)| TaskNode {
                    id: id.to_string(),
                    kind: TaskKind::McpTool {
                        tool: ToolId::new("srv", id),
                        args: serde_json::json!({}),
                        side_effects: false,
                    },
                    depends_on: deps.iter().map(|d| d.to_string()).collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn layers_respect_dependencies() {
        let dag = dag(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]);
        let layers = topological_layers(&dag).unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0], vec!["a"]);
        assert_eq!(layers[1], vec!["b", "c"]);
        assert_eq!(layers[2], vec!["d"]);
    }

    #[test]
    fn single_task_is_one_layer() {
        let dag = dag(&[("only", &[])]);
        let layers = topological_layers(&dag).unwrap();
        assert_eq!(layers, vec![vec!["only".to_string()]]);
    }

    #[test]
    fn cycle_is_rejected() {
        let dag = dag(&[("a", &["b"]), ("b", &["a"])]);
        assert!(matches!(
            topological_layers(&dag),
            Err(WeaveError::CycleDetected(_))
        ));
    }

    #[test]
    fn unknown_dependency_is_a_validation_error() {
        let dag = dag(&[("a", &["ghost"])]);
        assert!(matches!(
            topological_layers(&dag),
            Err(WeaveError::Validation(_))
        ));
    }

    #[test]
    fn opposed_pair_keeps_heavier_direction() {
        let ids = vec![ToolId::new("s", "x"), ToolId::new("s", "y")];
        let mut edges = vec![
            CandidateEdge {
                from: 0,
                to: 1,
                weight: 0.8,
            },
            CandidateEdge {
                from: 1,
                to: 0,
                weight: 0.3,
            },
        ];
        break_cycles(2, &mut edges, &ids);
        assert_eq!(edges.len(), 1);
        assert_eq!((edges[0].from, edges[0].to), (0, 1));
    }

    #[test]
    fn opposed_tie_keeps_lexicographically_smaller() {
        let ids = vec![ToolId::new("s", "a"), ToolId::new("s", "b")];
        let mut edges = vec![
            CandidateEdge {
                from: 1,
                to: 0,
                weight: 0.5,
            },
            CandidateEdge {
                from: 0,
                to: 1,
                weight: 0.5,
            },
        ];
        break_cycles(2, &mut edges, &ids);
        assert_eq!(edges.len(), 1);
        // s:a -> s:b sorts before s:b -> s:a
        assert_eq!((edges[0].from, edges[0].to), (0, 1));
    }

    #[test]
    fn three_cycle_drops_weakest_edge() {
        let ids = vec![
            ToolId::new("s", "a"),
            ToolId::new("s", "b"),
            ToolId::new("s", "c"),
        ];
        let mut edges = vec![
            CandidateEdge {
                from: 0,
                to: 1,
                weight: 0.9,
            },
            CandidateEdge {
                from: 1,
                to: 2,
                weight: 0.8,
            },
            CandidateEdge {
                from: 2,
                to: 0,
                weight: 0.2,
            },
        ];
        break_cycles(3, &mut edges, &ids);
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| !(e.from == 2 && e.to == 0)));
    }
}
