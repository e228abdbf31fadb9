//! The assembled gateway: one object wiring every component together
//! and exposing the public operation surface.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use toolweave_core::{
    EmbeddingProvider, EventBus, EventSubscription, GatewayEvent, Intent, McpClient, Result,
    Settings, StorageAdapter, TaskDag, TaskKind, TaskNode, ToolId,
};
use toolweave_graph::{EdgeTemplate, ImportStrategy, PatternEdge, ToolGraph};
use toolweave_vector::{HybridHit, HybridRetriever, VectorIndex};

use crate::capability::{CapabilityMatch, CapabilityStore};
use crate::controller::{RunOptions, RunOutcome, WorkflowController};
use crate::executor::{ExecutionReport, ParallelExecutor};
use crate::learning::LearningLoop;
use crate::predict::PredictionState;
use crate::registry::{RegistrationSummary, ToolRegistry};
use crate::sandbox::{SandboxBridge, SandboxWorker};
use crate::speculation::SpeculationCache;
use crate::suggester::{DagSuggester, DagSuggestion, ReplanRequest};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub density: f32,
    pub nodes: usize,
    pub edges: usize,
}

pub struct Gateway {
    bus: EventBus,
    storage: Arc<dyn StorageAdapter>,
    graph: Arc<ToolGraph>,
    suggester: Arc<DagSuggester>,
    executor: Arc<ParallelExecutor>,
    capabilities: Arc<CapabilityStore>,
    learning: Arc<LearningLoop>,
    registry: ToolRegistry,
    controller: WorkflowController,
}

impl Gateway {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        embedder: Arc<dyn EmbeddingProvider>,
        mcp: Arc<dyn McpClient>,
        worker: Arc<dyn SandboxWorker>,
        settings: Settings,
    ) -> Self {
        let bus = EventBus::default();
        let graph = Arc::new(ToolGraph::new(
            storage.clone(),
            bus.clone(),
            settings.graph.clone(),
        ));
        let index = Arc::new(VectorIndex::new(storage.clone(), embedder.clone()));
        let retriever = Arc::new(HybridRetriever::new(
            index.clone(),
            graph.clone(),
            settings.retrieval.clone(),
        ));
        let suggester = Arc::new(DagSuggester::new(
            retriever,
            storage.clone(),
            bus.clone(),
            settings.suggester.clone(),
            settings.retrieval.clone(),
        ));
        let sandbox = Arc::new(SandboxBridge::new(
            mcp.clone(),
            worker,
            bus.clone(),
            settings.sandbox.clone(),
        ));
        let speculation = Arc::new(SpeculationCache::default());
        let executor = Arc::new(ParallelExecutor::new(
            mcp.clone(),
            sandbox.clone(),
            storage.clone(),
            speculation.clone(),
            bus.clone(),
            settings.executor.clone(),
        ));
        let capabilities = Arc::new(CapabilityStore::new(
            storage.clone(),
            embedder,
            bus.clone(),
        ));
        let learning = Arc::new(LearningLoop::new(
            graph.clone(),
            capabilities.clone(),
            storage.clone(),
        ));
        let registry = ToolRegistry::new(mcp, storage.clone(), index);
        let controller = WorkflowController::new(
            suggester.clone(),
            executor.clone(),
            capabilities.clone(),
            sandbox,
            learning.clone(),
            storage.clone(),
            speculation,
            settings.suggester.clone(),
        );

        Self {
            bus,
            storage,
            graph,
            suggester,
            executor,
            capabilities,
            learning,
            registry,
            controller,
        }
    }

    /// Rebuild the in-memory graph from storage. Call once at startup.
    pub async fn init(&self) -> Result<()> {
        self.graph.sync_from_storage().await
    }

    pub fn events(&self) -> tokio::sync::broadcast::Receiver<GatewayEvent> {
        self.bus.subscribe()
    }

    pub fn events_matching(&self, pattern: &str) -> EventSubscription {
        self.bus.subscribe_pattern(pattern)
    }

    pub fn graph(&self) -> &Arc<ToolGraph> {
        &self.graph
    }

    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    // Public operations (the MCP-facing surface).

    pub async fn run(&self, intent: &Intent, options: RunOptions) -> Result<RunOutcome> {
        self.controller.run(intent, options).await
    }

    pub async fn run_with_cancel(
        &self,
        intent: &Intent,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        self.controller.run_with_cancel(intent, options, cancel).await
    }

    pub async fn search_tools(
        &self,
        query: &str,
        k: usize,
        context: &[ToolId],
    ) -> Result<Vec<HybridHit>> {
        self.suggester
            .retriever()
            .search_hybrid(query, k, context, true)
            .await
    }

    pub async fn get_tool_schema(&self, tool_id: &ToolId) -> Result<serde_json::Value> {
        self.registry.get_tool_schema(tool_id).await
    }

    pub async fn suggest_dag(&self, intent: &Intent) -> Result<DagSuggestion> {
        self.suggester.suggest_dag(intent).await
    }

    pub async fn replan_dag(&self, current: &TaskDag, request: &ReplanRequest) -> Result<TaskDag> {
        self.suggester.replan_dag(current, request).await
    }

    pub async fn predict_next_nodes(
        &self,
        state: &PredictionState,
    ) -> Result<Vec<toolweave_core::Prediction>> {
        self.suggester.predict_next_nodes(state).await
    }

    /// Execute a caller-supplied DAG. Events stream on the bus; the
    /// learning loop digests the run before the report is returned.
    pub async fn execute_dag(&self, dag: TaskDag) -> Result<ExecutionReport> {
        self.execute_dag_with_cancel(dag, CancellationToken::new())
            .await
    }

    pub async fn execute_dag_with_cancel(
        &self,
        dag: TaskDag,
        cancel: CancellationToken,
    ) -> Result<ExecutionReport> {
        let report = self.executor.execute("", dag, cancel).await?;
        self.learning
            .after_workflow(&report.execution, &report.traces, &report.code_traces, &report.results)
            .await;
        Ok(report)
    }

    /// Execute one piece of sandboxed code under an intent; successful
    /// runs are eagerly promoted into capabilities.
    pub async fn execute_code(
        &self,
        intent: &str,
        code: &str,
        context: Option<serde_json::Value>,
    ) -> Result<ExecutionReport> {
        let dag = TaskDag {
            tasks: vec![TaskNode {
                id: "task_0".into(),
                kind: TaskKind::CodeExecution {
                    code: code.to_string(),
                    context,
                },
                depends_on: vec![],
            }],
        };
        let report = self
            .executor
            .execute(intent, dag, CancellationToken::new())
            .await?;
        self.learning
            .after_workflow(&report.execution, &report.traces, &report.code_traces, &report.results)
            .await;
        Ok(report)
    }

    pub async fn find_capability(&self, intent: &str) -> Result<Option<CapabilityMatch>> {
        self.capabilities.find_match(intent, 0.85).await
    }

    pub async fn register_hint(
        &self,
        from: &ToolId,
        to: &ToolId,
        confidence: Option<f32>,
    ) -> Result<()> {
        self.suggester.register_hint(from, to, confidence).await
    }

    pub fn export_patterns(&self) -> Vec<PatternEdge> {
        self.suggester.export_patterns()
    }

    pub async fn import_patterns(
        &self,
        patterns: &[PatternEdge],
        strategy: ImportStrategy,
    ) -> Result<()> {
        self.suggester.import_patterns(patterns, strategy).await
    }

    pub async fn bootstrap_from_templates(&self, templates: &[EdgeTemplate]) -> Result<()> {
        self.graph.bootstrap_from_templates(templates).await
    }

    pub async fn register_server(&self, server_id: &str) -> Result<RegistrationSummary> {
        self.registry.register_server(server_id).await
    }

    /// Liveness probe: checks the storage path and reports on the bus.
    pub async fn health_check(&self) -> bool {
        let healthy = self.storage.list_tools().await.is_ok();
        self.bus.publish(GatewayEvent::HealthCheck { healthy });
        healthy
    }

    pub fn heartbeat(&self) {
        self.bus.publish(GatewayEvent::Heartbeat);
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let snapshot = MetricsSnapshot {
            density: self.graph.density(),
            nodes: self.graph.node_count(),
            edges: self.graph.edge_count(),
        };
        self.bus.publish(GatewayEvent::MetricsSnapshot {
            density: snapshot.density,
            nodes: snapshot.nodes,
            edges: snapshot.edges,
        });
        snapshot
    }
}
