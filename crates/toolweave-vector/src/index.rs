use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use toolweave_core::{
    EmbeddingProvider, Result, StorageAdapter, Tool, ToolEmbedding, ToolId,
};
use tracing::debug;

/// One semantic search hit, hydrated from the persistent mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolHit {
    pub tool_id: ToolId,
    pub server_id: String,
    pub tool_name: String,
    pub score: f32,
    pub schema: serde_json::Value,
}

/// Cosine top-k search over tool embeddings, delegated to the storage
/// adapter. Query embeddings are cached; the same intent text is often
/// searched several times per workflow.
pub struct VectorIndex {
    storage: Arc<dyn StorageAdapter>,
    embedder: Arc<dyn EmbeddingProvider>,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl VectorIndex {
    pub fn new(storage: Arc<dyn StorageAdapter>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            storage,
            embedder,
            query_cache: Mutex::new(LruCache::new(NonZeroUsize::new(512).unwrap())),
        }
    }

    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(hit) = self.query_cache.lock().get(text) {
            return Ok(hit.clone());
        }
        let vector = self.embedder.embed(text).await?;
        self.query_cache.lock().put(text.to_string(), vector.clone());
        Ok(vector)
    }

    /// Top-k tools for a query text, descending score, ties broken by
    /// tool id. An empty index yields an empty list, never an error.
    pub async fn search_tools(
        &self,
        query: &str,
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ToolHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embed_query(query).await?;
        let scored = self.storage.top_k(&vector, k, min_score).await?;

        let mut hits = Vec::with_capacity(scored.len());
        for (tool_id, score) in scored {
            match self.storage.get_tool(&tool_id).await? {
                Some(tool) if tool.active => hits.push(ToolHit {
                    tool_id,
                    server_id: tool.server_id,
                    tool_name: tool.name,
                    score,
                    schema: tool.input_schema,
                }),
                _ => debug!(%tool_id, "embedding without active tool row"),
            }
        }
        Ok(hits)
    }

    /// (Re-)embed a tool description, skipping work when the text is
    /// unchanged since the stored embedding.
    pub async fn index_tool(&self, tool: &Tool) -> Result<bool> {
        let text_hash = tool.text_hash();
        if let Some(existing) = self.storage.get_embedding(&tool.id).await? {
            if existing.text_hash == text_hash {
                return Ok(false);
            }
        }
        let vector = self.embedder.embed(&tool.embedding_text()).await?;
        self.storage
            .upsert_embedding(ToolEmbedding {
                tool_id: tool.id.clone(),
                vector,
                text_hash,
            })
            .await?;
        Ok(true)
    }

    pub async fn index_tools(&self, tools: &[Tool]) -> Result<usize> {
        let mut indexed = 0;
        for tool in tools {
            if self.index_tool(tool).await? {
                indexed += 1;
            }
        }
        Ok(indexed)
    }
}
