//! Next-tool prediction for speculative pre-execution.

use std::collections::HashMap;

use chrono::Utc;
use toolweave_core::{ExecutionId, Prediction, PredictionSource, Result, StorageAdapter, ToolId};
use tracing::debug;
use uuid::Uuid;

use crate::suggester::DagSuggester;

/// Where the predictor starts from: the last tool that completed
/// successfully in the running workflow.
#[derive(Debug, Clone)]
pub struct PredictionState {
    pub workflow_id: Option<ExecutionId>,
    pub last_tool: ToolId,
}

/// How many Louvain co-members are considered per prediction round.
const COMMUNITY_CANDIDATES: usize = 5;

/// Hard ceiling on any single prediction's confidence.
const CONFIDENCE_CAP: f32 = 0.95;

impl DagSuggester {
    /// Score likely next tools from community structure and observed
    /// co-occurrence, drop anything matching the dangerous-verb
    /// blacklist, fold in episodic outcome history when attached, and
    /// persist the surviving predictions for later resolution.
    pub async fn predict_next_nodes(&self, state: &PredictionState) -> Result<Vec<Prediction>> {
        let graph = self.graph();
        let last = &state.last_tool;
        let mut scored: HashMap<ToolId, (PredictionSource, f32)> = HashMap::new();

        // Community rule: co-members of the last tool's community.
        for member in graph.community_members(last, COMMUNITY_CANDIDATES) {
            let pagerank = graph.page_rank(&member);
            let edge_weight = graph.direct_edge_weight(last, &member);
            let aa = graph.adamic_adar_between(last, &member);
            let confidence = (0.40
                + (pagerank * 2.0).min(0.20)
                + (edge_weight * 0.25).min(0.25)
                + (aa * 0.1).min(0.10))
            .min(CONFIDENCE_CAP);
            scored.insert(member, (PredictionSource::Community, confidence));
        }

        // Co-occurrence rule: direct out-neighbors, weighted by edge
        // strength, observation volume, and recency.
        for (neighbor, weight) in graph.out_neighbors(last, usize::MAX) {
            let Some(edge) = graph.edge(last, &neighbor) else {
                continue;
            };
            let volume = ((edge.observed_count as f32 + 1.0).log2() * 0.05).min(0.20);
            let age = Utc::now().signed_duration_since(edge.last_observed);
            let recency = if age.num_hours() < 1 {
                0.10
            } else if age.num_hours() < 24 {
                0.05
            } else {
                0.0
            };
            let confidence = (weight.min(0.60) + volume + recency).min(CONFIDENCE_CAP);

            match scored.get(&neighbor) {
                Some((_, existing)) if *existing >= confidence => {}
                _ => {
                    scored.insert(neighbor, (PredictionSource::CoOccurrence, confidence));
                }
            }
        }

        let blacklist: Vec<String> = self
            .config
            .prediction_blacklist
            .iter()
            .map(|s| s.to_lowercase())
            .collect();

        let mut predictions = Vec::new();
        for (tool_id, (source, mut confidence)) in scored {
            let lowered = tool_id.as_str().to_lowercase();
            if blacklist.iter().any(|verb| lowered.contains(verb)) {
                debug!(%tool_id, "prediction dropped by blacklist");
                continue;
            }

            if let Some(memory) = &self.episodic {
                if let Some(stats) = memory.tool_stats(&tool_id).await? {
                    if stats.failure_rate > 0.5 {
                        debug!(%tool_id, failure_rate = stats.failure_rate, "prediction dropped by episodic history");
                        continue;
                    }
                    let boost = (stats.success_rate * 0.20).min(0.15);
                    let penalty = (stats.failure_rate * 0.25).min(0.15);
                    confidence = (confidence + boost - penalty).clamp(0.0, CONFIDENCE_CAP);
                }
            }

            predictions.push(Prediction {
                prediction_id: Uuid::new_v4(),
                workflow_id: state.workflow_id,
                source,
                tool_id,
                confidence,
                was_correct: None,
            });
        }

        predictions.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.tool_id.cmp(&b.tool_id))
        });

        for prediction in &predictions {
            self.storage.record_prediction(prediction.clone()).await?;
        }
        Ok(predictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use toolweave_core::{
        EdgeSource, EdgeType, EpisodicMemory, EpisodicStats, EventBus, GraphConfig,
        RetrievalConfig, SuggesterConfig,
    };
    use toolweave_graph::{MemoryStorage, ToolGraph};
    use toolweave_vector::{HashingEmbedder, HybridRetriever, VectorIndex};

    const DIM: usize = 64;

    fn fixture() -> (Arc<MemoryStorage>, Arc<ToolGraph>, DagSuggester) {
        let storage = Arc::new(MemoryStorage::new(DIM));
        let graph = Arc::new(ToolGraph::new(
            storage.clone(),
            EventBus::default(),
            GraphConfig::default(),
        ));
        let index = Arc::new(VectorIndex::new(
            storage.clone(),
            Arc::new(HashingEmbedder::new(DIM)),
        ));
        let retriever = Arc::new(HybridRetriever::new(
            index,
            graph.clone(),
            RetrievalConfig::default(),
        ));
        let suggester = DagSuggester::new(
            retriever,
            storage.clone(),
            EventBus::default(),
            SuggesterConfig::default(),
            RetrievalConfig::default(),
        );
        (storage, graph, suggester)
    }

    fn tid(s: &str) -> ToolId {
        s.parse().unwrap()
    }

    async fn observe(graph: &ToolGraph, from: &str, to: &str, times: usize) {
        for _ in 0..times {
            graph
                .add_or_update_edge(&tid(from), &tid(to), EdgeType::Sequence, EdgeSource::Observed)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn out_neighbors_are_predicted() {
        let (_s, graph, suggester) = fixture();
        observe(&graph, "fs:read_file", "json:parse", 3).await;

        let predictions = suggester
            .predict_next_nodes(&PredictionState {
                workflow_id: None,
                last_tool: tid("fs:read_file"),
            })
            .await
            .unwrap();
        assert!(predictions.iter().any(|p| p.tool_id == tid("json:parse")));
        for p in &predictions {
            assert!(p.confidence <= 0.95);
        }
    }

    #[tokio::test]
    async fn blacklisted_tools_never_surface() {
        let (_s, graph, suggester) = fixture();
        // Strong edge toward a destructive tool.
        observe(&graph, "fs:read_file", "fs:delete_file", 5).await;
        observe(&graph, "fs:read_file", "json:parse", 1).await;

        let predictions = suggester
            .predict_next_nodes(&PredictionState {
                workflow_id: None,
                last_tool: tid("fs:read_file"),
            })
            .await
            .unwrap();
        assert!(predictions.iter().all(|p| p.tool_id != tid("fs:delete_file")));
        for p in &predictions {
            let lowered = p.tool_id.as_str().to_lowercase();
            for verb in &suggester.config.prediction_blacklist {
                assert!(!lowered.contains(&verb.to_lowercase()));
            }
        }
    }

    #[tokio::test]
    async fn predictions_sorted_by_confidence() {
        let (_s, graph, suggester) = fixture();
        observe(&graph, "a:start", "a:strong", 6).await;
        observe(&graph, "a:start", "a:weak", 1).await;

        let predictions = suggester
            .predict_next_nodes(&PredictionState {
                workflow_id: None,
                last_tool: tid("a:start"),
            })
            .await
            .unwrap();
        for pair in predictions.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
    }

    #[tokio::test]
    async fn predictions_are_persisted_for_resolution() {
        let (storage, graph, suggester) = fixture();
        observe(&graph, "a:start", "a:next", 2).await;

        let workflow_id = Uuid::new_v4();
        let predictions = suggester
            .predict_next_nodes(&PredictionState {
                workflow_id: Some(workflow_id),
                last_tool: tid("a:start"),
            })
            .await
            .unwrap();
        assert!(!predictions.is_empty());
        let stored = storage.predictions_for(workflow_id).await.unwrap();
        assert_eq!(stored.len(), predictions.len());
    }

    struct StubMemory;

    #[async_trait]
    impl EpisodicMemory for StubMemory {
        async fn tool_stats(&self, tool: &ToolId) -> toolweave_core::Result<Option<EpisodicStats>> {
            Ok(match tool.as_str() {
                "a:unreliable" => Some(EpisodicStats {
                    success_rate: 0.2,
                    failure_rate: 0.8,
                }),
                "a:proven" => Some(EpisodicStats {
                    success_rate: 0.9,
                    failure_rate: 0.1,
                }),
                _ => None,
            })
        }
    }

    #[tokio::test]
    async fn episodic_memory_excludes_and_boosts() {
        let (_s, graph, suggester) = fixture();
        let suggester = suggester.with_episodic_memory(Arc::new(StubMemory));
        observe(&graph, "a:start", "a:unreliable", 4).await;
        observe(&graph, "a:start", "a:proven", 4).await;
        observe(&graph, "a:start", "a:plain", 4).await;

        let predictions = suggester
            .predict_next_nodes(&PredictionState {
                workflow_id: None,
                last_tool: tid("a:start"),
            })
            .await
            .unwrap();

        assert!(predictions.iter().all(|p| p.tool_id != tid("a:unreliable")));
        let proven = predictions
            .iter()
            .find(|p| p.tool_id == tid("a:proven"))
            .unwrap();
        let plain = predictions
            .iter()
            .find(|p| p.tool_id == tid("a:plain"))
            .unwrap();
        assert!(proven.confidence > plain.confidence);
    }
}
