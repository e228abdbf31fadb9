//! In-process reference implementation of the storage port.
//!
//! Backs tests and single-node deployments, and pins down the semantics
//! persistent adapters must honor: atomic per-operation writes,
//! all-or-nothing edge batches, and clamped cosine scores.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use toolweave_core::{
    Capability, CapabilityId, ExecutionId, MetricSample, Prediction, PredictionId, Result,
    StorageAdapter, Tool, ToolEdge, ToolEmbedding, ToolId, TraceEvent, WeaveError,
    WorkflowExecution,
};

pub struct MemoryStorage {
    dimension: usize,
    blobs: DashMap<String, Vec<u8>>,
    tools: DashMap<ToolId, Tool>,
    embeddings: DashMap<ToolId, ToolEmbedding>,
    edges: DashMap<(ToolId, ToolId), ToolEdge>,
    executions: DashMap<ExecutionId, WorkflowExecution>,
    traces: DashMap<ExecutionId, Vec<TraceEvent>>,
    capabilities: DashMap<CapabilityId, Capability>,
    predictions: DashMap<PredictionId, Prediction>,
    metrics: RwLock<Vec<MetricSample>>,
    unavailable: AtomicBool,
}

impl MemoryStorage {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            blobs: DashMap::new(),
            tools: DashMap::new(),
            embeddings: DashMap::new(),
            edges: DashMap::new(),
            executions: DashMap::new(),
            traces: DashMap::new(),
            capabilities: DashMap::new(),
            predictions: DashMap::new(),
            metrics: RwLock::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate an outage; every subsequent call fails retryably until
    /// reset. Test hook.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(WeaveError::StorageUnavailable("memory store offline".into()))
        } else {
            Ok(())
        }
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self.blobs.get(key).map(|v| v.clone()))
    }

    async fn put_blob(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_available()?;
        self.blobs.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete_blob(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.blobs.remove(key);
        Ok(())
    }

    async fn upsert_tool(&self, tool: Tool) -> Result<()> {
        self.check_available()?;
        self.tools.insert(tool.id.clone(), tool);
        Ok(())
    }

    async fn get_tool(&self, id: &ToolId) -> Result<Option<Tool>> {
        self.check_available()?;
        Ok(self.tools.get(id).map(|t| t.clone()))
    }

    async fn list_tools(&self) -> Result<Vec<Tool>> {
        self.check_available()?;
        let mut tools: Vec<Tool> = self.tools.iter().map(|e| e.value().clone()).collect();
        tools.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tools)
    }

    async fn upsert_embedding(&self, embedding: ToolEmbedding) -> Result<()> {
        self.check_available()?;
        if embedding.vector.len() != self.dimension {
            return Err(WeaveError::ConstraintViolation(format!(
                "embedding for {} has dimension {}, expected {}",
                embedding.tool_id,
                embedding.vector.len(),
                self.dimension
            )));
        }
        self.embeddings.insert(embedding.tool_id.clone(), embedding);
        Ok(())
    }

    async fn get_embedding(&self, id: &ToolId) -> Result<Option<ToolEmbedding>> {
        self.check_available()?;
        Ok(self.embeddings.get(id).map(|e| e.clone()))
    }

    async fn top_k(
        &self,
        vector: &[f32],
        k: usize,
        min_score: f32,
    ) -> Result<Vec<(ToolId, f32)>> {
        self.check_available()?;
        let mut scored: Vec<(ToolId, f32)> = self
            .embeddings
            .iter()
            .map(|e| (e.key().clone(), cosine(vector, &e.value().vector)))
            .filter(|(_, score)| *score >= min_score)
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn upsert_edges(&self, edges: Vec<ToolEdge>) -> Result<()> {
        self.check_available()?;
        // Validate the whole batch before touching the table.
        for edge in &edges {
            if edge.from == edge.to {
                return Err(WeaveError::ConstraintViolation(format!(
                    "self edge {}",
                    edge.from
                )));
            }
            if !(0.0..=1.0).contains(&edge.confidence) || edge.observed_count == 0 {
                return Err(WeaveError::ConstraintViolation(format!(
                    "edge {} -> {} out of bounds",
                    edge.from, edge.to
                )));
            }
        }
        for edge in edges {
            self.edges
                .insert((edge.from.clone(), edge.to.clone()), edge);
        }
        Ok(())
    }

    async fn load_edges(&self) -> Result<Vec<ToolEdge>> {
        self.check_available()?;
        let mut edges: Vec<ToolEdge> = self.edges.iter().map(|e| e.value().clone()).collect();
        edges.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
        Ok(edges)
    }

    async fn clear_edges(&self) -> Result<()> {
        self.check_available()?;
        self.edges.clear();
        Ok(())
    }

    async fn record_execution(&self, exec: WorkflowExecution) -> Result<()> {
        self.check_available()?;
        self.executions.insert(exec.execution_id, exec);
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<WorkflowExecution>> {
        self.check_available()?;
        Ok(self.executions.get(&id).map(|e| e.clone()))
    }

    async fn append_traces(&self, traces: Vec<TraceEvent>) -> Result<()> {
        self.check_available()?;
        for trace in traces {
            self.traces
                .entry(trace.workflow_id)
                .or_default()
                .push(trace);
        }
        Ok(())
    }

    async fn traces_for(&self, workflow_id: ExecutionId) -> Result<Vec<TraceEvent>> {
        self.check_available()?;
        Ok(self
            .traces
            .get(&workflow_id)
            .map(|t| t.clone())
            .unwrap_or_default())
    }

    async fn upsert_capability(&self, capability: Capability) -> Result<()> {
        self.check_available()?;
        self.capabilities
            .insert(capability.capability_id, capability);
        Ok(())
    }

    async fn capability_by_hash(&self, pattern_hash: &str) -> Result<Option<Capability>> {
        self.check_available()?;
        Ok(self
            .capabilities
            .iter()
            .find(|c| c.pattern_hash == pattern_hash)
            .map(|c| c.clone()))
    }

    async fn get_capability(&self, id: CapabilityId) -> Result<Option<Capability>> {
        self.check_available()?;
        Ok(self.capabilities.get(&id).map(|c| c.clone()))
    }

    async fn list_capabilities(&self) -> Result<Vec<Capability>> {
        self.check_available()?;
        let mut caps: Vec<Capability> = self.capabilities.iter().map(|c| c.clone()).collect();
        caps.sort_by(|a, b| a.capability_id.cmp(&b.capability_id));
        Ok(caps)
    }

    async fn record_prediction(&self, prediction: Prediction) -> Result<()> {
        self.check_available()?;
        self.predictions.insert(prediction.prediction_id, prediction);
        Ok(())
    }

    async fn predictions_for(&self, workflow_id: ExecutionId) -> Result<Vec<Prediction>> {
        self.check_available()?;
        let mut out: Vec<Prediction> = self
            .predictions
            .iter()
            .filter(|p| p.workflow_id == Some(workflow_id))
            .map(|p| p.clone())
            .collect();
        out.sort_by(|a, b| a.prediction_id.cmp(&b.prediction_id));
        Ok(out)
    }

    async fn resolve_prediction(&self, id: PredictionId, was_correct: bool) -> Result<()> {
        self.check_available()?;
        match self.predictions.get_mut(&id) {
            Some(mut p) => {
                p.was_correct = Some(was_correct);
                Ok(())
            }
            None => Err(WeaveError::NotFound(format!("prediction {}", id))),
        }
    }

    async fn record_metric(&self, sample: MetricSample) -> Result<()> {
        self.check_available()?;
        self.metrics.write().push(sample);
        Ok(())
    }

    async fn metrics_range(
        &self,
        metric_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>> {
        self.check_available()?;
        Ok(self
            .metrics
            .read()
            .iter()
            .filter(|m| m.metric_name == metric_name && m.timestamp >= since)
            .cloned()
            .collect())
    }
}
