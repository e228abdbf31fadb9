//! Portable edge patterns: hints, export and import.

use serde::{Deserialize, Serialize};
use toolweave_core::{EdgeSource, EdgeType, Result, StorageAdapter, ToolId};
use tracing::info;

use crate::graph::ToolGraph;

/// One exported edge. Confidence and count travel with the pair so a
/// merge on the far side can weigh it properly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternEdge {
    pub from: ToolId,
    pub to: ToolId,
    pub edge_type: EdgeType,
    pub edge_source: EdgeSource,
    pub confidence: f32,
    pub observed_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStrategy {
    /// Drop all current edges, then adopt the imported set.
    Replace,
    /// Keep both: existing pairs average confidence and sum counts.
    Merge,
}

impl ToolGraph {
    /// Register a manual routing hint as a half-trusted dependency edge.
    pub async fn register_hint(&self, from: &ToolId, to: &ToolId, confidence: f32) -> Result<()> {
        let outcome = self.with_state(|state| {
            let outcome = state.upsert_edge(
                from,
                to,
                EdgeType::Dependency,
                EdgeSource::Template,
                Some(confidence),
            );
            if outcome.is_some() {
                state.note_updates(1, self.config());
            }
            outcome
        });
        if let Some(outcome) = outcome {
            self.publish_edge_event(&outcome);
            self.flush().await?;
        }
        Ok(())
    }

    /// Snapshot every edge, sorted by `(from, to)` for stable diffs.
    pub fn export_patterns(&self) -> Vec<PatternEdge> {
        self.edges()
            .into_iter()
            .map(|e| PatternEdge {
                from: e.from,
                to: e.to,
                edge_type: e.edge_type,
                edge_source: e.edge_source,
                confidence: e.confidence,
                observed_count: e.observed_count,
            })
            .collect()
    }

    /// Adopt an exported pattern set.
    ///
    /// `Replace` swaps the whole edge population; `Merge` keeps the
    /// union, averaging confidence and summing counts on pairs present
    /// on both sides (merging an export into itself leaves the pair set
    /// unchanged).
    pub async fn import_patterns(
        &self,
        patterns: &[PatternEdge],
        strategy: ImportStrategy,
    ) -> Result<()> {
        if strategy == ImportStrategy::Replace {
            self.with_state(|state| {
                for targets in state.adj_out.iter_mut() {
                    targets.clear();
                }
                for sources in state.adj_in.iter_mut() {
                    sources.clear();
                }
                state.edge_count = 0;
            });
            self.storage.clear_edges().await?;
        }

        self.with_state(|state| {
            for p in patterns {
                if p.from == p.to {
                    continue;
                }
                let u = state.ensure_node(&p.from);
                let v = state.ensure_node(&p.to);
                match state.adj_out[u].get_mut(&v) {
                    Some(existing) => {
                        existing.confidence =
                            ((existing.confidence + p.confidence) / 2.0).clamp(0.05, 1.0);
                        existing.observed_count =
                            existing.observed_count.saturating_add(p.observed_count);
                        let merged = existing.clone();
                        state.pending.insert((p.from.clone(), p.to.clone()), merged);
                    }
                    None => {
                        let edge = toolweave_core::ToolEdge {
                            from: p.from.clone(),
                            to: p.to.clone(),
                            edge_type: p.edge_type,
                            edge_source: p.edge_source,
                            confidence: p.confidence.clamp(0.05, 1.0),
                            observed_count: p.observed_count.max(1),
                            last_observed: chrono::Utc::now(),
                        };
                        state.adj_out[u].insert(v, edge.clone());
                        state.adj_in[v].insert(u);
                        state.edge_count += 1;
                        state.pending.insert((p.from.clone(), p.to.clone()), edge);
                    }
                }
            }
            state.note_updates(patterns.len() as u32, self.config());
        });

        info!(count = patterns.len(), ?strategy, "patterns imported");
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::sync::Arc;
    use toolweave_core::{EventBus, GraphConfig};

    fn graph() -> ToolGraph {
        ToolGraph::new(
            Arc::new(MemoryStorage::new(4)),
            EventBus::default(),
            GraphConfig::default(),
        )
    }

    fn tid(s: &str) -> ToolId {
        s.parse().unwrap()
    }

    async fn seed(g: &ToolGraph) {
        g.add_or_update_edge(
            &tid("a:x"),
            &tid("a:y"),
            EdgeType::Sequence,
            EdgeSource::Observed,
        )
        .await
        .unwrap();
        g.add_or_update_edge(
            &tid("a:y"),
            &tid("a:z"),
            EdgeType::Sequence,
            EdgeSource::Observed,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn export_import_replace_round_trips() {
        let g = graph();
        seed(&g).await;
        let exported = g.export_patterns();

        let g2 = graph();
        g2.import_patterns(&exported, ImportStrategy::Replace)
            .await
            .unwrap();
        let back = g2.export_patterns();
        assert_eq!(back.len(), exported.len());
        for (a, b) in exported.iter().zip(back.iter()) {
            assert_eq!(a.from, b.from);
            assert_eq!(a.to, b.to);
            assert!((a.confidence - b.confidence).abs() < 1e-6);
            assert_eq!(a.observed_count, b.observed_count);
        }
    }

    #[tokio::test]
    async fn merge_of_own_export_is_structurally_idempotent() {
        let g = graph();
        seed(&g).await;
        let exported = g.export_patterns();
        let pairs_before = g.edge_count();

        g.import_patterns(&exported, ImportStrategy::Merge)
            .await
            .unwrap();
        assert_eq!(g.edge_count(), pairs_before);
        // counts summed, confidence averaged (self-merge keeps value)
        let edge = g.edge(&tid("a:x"), &tid("a:y")).unwrap();
        assert_eq!(edge.observed_count, 2);
        assert!((edge.confidence - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn hint_lands_as_template_dependency() {
        let g = graph();
        g.register_hint(&tid("fs:read"), &tid("fs:write"), 0.6)
            .await
            .unwrap();
        let edge = g.edge(&tid("fs:read"), &tid("fs:write")).unwrap();
        assert_eq!(edge.edge_type, EdgeType::Dependency);
        assert_eq!(edge.edge_source, EdgeSource::Template);
        assert!((edge.confidence - 0.6).abs() < 1e-6);
    }
}
