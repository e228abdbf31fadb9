use crate::{
    Capability, CapabilityId, ExecutionId, MetricSample, Prediction, PredictionId, Result, Tool,
    ToolDefinition, ToolEdge, ToolEmbedding, ToolId, TraceEvent, WorkflowExecution,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Port to the persistent store. Each operation is atomic; batch upserts
/// are all-or-nothing. Vector queries use cosine similarity with scores
/// clamped to `[0, 1]`.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put_blob(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete_blob(&self, key: &str) -> Result<()>;

    async fn upsert_tool(&self, tool: Tool) -> Result<()>;
    async fn get_tool(&self, id: &ToolId) -> Result<Option<Tool>>;
    async fn list_tools(&self) -> Result<Vec<Tool>>;

    async fn upsert_embedding(&self, embedding: ToolEmbedding) -> Result<()>;
    async fn get_embedding(&self, id: &ToolId) -> Result<Option<ToolEmbedding>>;
    /// Cosine top-k over all stored tool embeddings, best first.
    async fn top_k(&self, vector: &[f32], k: usize, min_score: f32)
        -> Result<Vec<(ToolId, f32)>>;

    /// Transactional batch upsert keyed on `(from, to)`.
    async fn upsert_edges(&self, edges: Vec<ToolEdge>) -> Result<()>;
    async fn load_edges(&self) -> Result<Vec<ToolEdge>>;
    /// Drop the entire edge mirror; used by replace-style imports.
    async fn clear_edges(&self) -> Result<()>;

    async fn record_execution(&self, exec: WorkflowExecution) -> Result<()>;
    async fn get_execution(&self, id: ExecutionId) -> Result<Option<WorkflowExecution>>;

    async fn append_traces(&self, traces: Vec<TraceEvent>) -> Result<()>;
    async fn traces_for(&self, workflow_id: ExecutionId) -> Result<Vec<TraceEvent>>;

    async fn upsert_capability(&self, capability: Capability) -> Result<()>;
    async fn capability_by_hash(&self, pattern_hash: &str) -> Result<Option<Capability>>;
    async fn get_capability(&self, id: CapabilityId) -> Result<Option<Capability>>;
    async fn list_capabilities(&self) -> Result<Vec<Capability>>;

    async fn record_prediction(&self, prediction: Prediction) -> Result<()>;
    async fn predictions_for(&self, workflow_id: ExecutionId) -> Result<Vec<Prediction>>;
    async fn resolve_prediction(&self, id: PredictionId, was_correct: bool) -> Result<()>;

    async fn record_metric(&self, sample: MetricSample) -> Result<()>;
    async fn metrics_range(
        &self,
        metric_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>>;
}

/// Port to the embedding model: fixed-dimension dense vectors for
/// arbitrary text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Port to MCP transports. Implementations must be safe for concurrent
/// `call_tool` invocations; the executor shares one client across
/// parallel workflows.
#[async_trait]
pub trait McpClient: Send + Sync {
    async fn call_tool(
        &self,
        server: &str,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value>;

    async fn list_tools(&self, server: &str) -> Result<Vec<ToolDefinition>>;
}

#[async_trait]
impl<T: McpClient + ?Sized> McpClient for std::sync::Arc<T> {
    async fn call_tool(
        &self,
        server: &str,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.as_ref().call_tool(server, name, args).await
    }

    async fn list_tools(&self, server: &str) -> Result<Vec<ToolDefinition>> {
        self.as_ref().list_tools(server).await
    }
}

/// Per-tool outcome statistics from an episodic memory store, when one
/// is attached to the predictor.
#[derive(Debug, Clone, Copy, Default)]
pub struct EpisodicStats {
    pub success_rate: f32,
    pub failure_rate: f32,
}

#[async_trait]
pub trait EpisodicMemory: Send + Sync {
    async fn tool_stats(&self, tool: &ToolId) -> Result<Option<EpisodicStats>>;
}
