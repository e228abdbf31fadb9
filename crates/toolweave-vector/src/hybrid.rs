use std::sync::Arc;

use serde::{Deserialize, Serialize};
use toolweave_core::{Result, RetrievalConfig, ToolId};
use toolweave_graph::ToolGraph;
use tracing::debug;

use crate::index::VectorIndex;

/// A hybrid search result: semantic and structural scores plus the
/// blended ranking score, with optional neighbor annotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridHit {
    pub tool_id: ToolId,
    pub server_id: String,
    pub tool_name: String,
    pub schema: serde_json::Value,
    pub semantic_score: f32,
    pub graph_score: f32,
    pub final_score: f32,
    /// Tools frequently executed before this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub often_before: Vec<ToolId>,
    /// Tools frequently executed after this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub often_after: Vec<ToolId>,
}

/// Blends cosine similarity with graph relatedness.
///
/// The blend adapts to graph density: a young, sparse graph leans almost
/// entirely on semantics (and prefetches few extra candidates), while a
/// well-observed graph pulls in more candidates and lets structure
/// reorder them. With no edges at all this is exactly semantic search.
pub struct HybridRetriever {
    index: Arc<VectorIndex>,
    graph: Arc<ToolGraph>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(index: Arc<VectorIndex>, graph: Arc<ToolGraph>, config: RetrievalConfig) -> Self {
        Self {
            index,
            graph,
            config,
        }
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn graph(&self) -> &Arc<ToolGraph> {
        &self.graph
    }

    pub async fn search_hybrid(
        &self,
        query: &str,
        limit: usize,
        context_tools: &[ToolId],
        include_related: bool,
    ) -> Result<Vec<HybridHit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let density = self.graph.density();
        let expansion = self.config.expansion_factor(density);
        let prefetch = ((limit as f32) * expansion).ceil() as usize;

        let alpha = if self.graph.edge_count() == 0 {
            1.0
        } else {
            self.config.semantic_alpha(density)
        };
        debug!(density, alpha, prefetch, "hybrid search");

        let semantic = self.index.search_tools(query, prefetch, 0.0).await?;

        let mut hits: Vec<HybridHit> = semantic
            .into_iter()
            .map(|hit| {
                let graph_score = self.graph.graph_relatedness(&hit.tool_id, context_tools);
                let final_score = alpha * hit.score + (1.0 - alpha) * graph_score;
                HybridHit {
                    tool_id: hit.tool_id,
                    server_id: hit.server_id,
                    tool_name: hit.tool_name,
                    schema: hit.schema,
                    semantic_score: hit.score,
                    graph_score,
                    final_score,
                    often_before: Vec::new(),
                    often_after: Vec::new(),
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.tool_id.cmp(&b.tool_id))
        });
        hits.truncate(limit);

        if include_related {
            let k = self.config.related_neighbors;
            for hit in hits.iter_mut() {
                hit.often_before = self
                    .graph
                    .in_neighbors(&hit.tool_id, k)
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect();
                hit.often_after = self
                    .graph
                    .out_neighbors(&hit.tool_id, k)
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect();
            }
        }

        Ok(hits)
    }
}
