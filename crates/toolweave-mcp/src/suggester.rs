//! Intent-to-DAG suggestion and runtime replanning.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use toolweave_core::{
    EpisodicMemory, EventBus, ExecutionId, GatewayEvent, Intent, Result, RetrievalConfig,
    StorageAdapter, SuggesterConfig, TaskDag, TaskKind, TaskNode, ToolId,
};
use toolweave_graph::validate_acyclic;
use toolweave_vector::{HybridHit, HybridRetriever};
use tracing::{debug, info};

/// An explainable dependency between two suggested tools: the graph
/// path that justifies it and a confidence keyed to path length.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyPath {
    pub from: ToolId,
    pub to: ToolId,
    pub via: Vec<ToolId>,
    pub hops: usize,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagSuggestion {
    pub dag: TaskDag,
    pub confidence: f32,
    pub rationale: String,
    pub alternatives: Vec<ToolId>,
    pub dependency_paths: Vec<DependencyPath>,
    /// Present when confidence is below the warning threshold; the
    /// suggestion is still returned rather than withheld.
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReplanRequest {
    pub workflow_id: Option<ExecutionId>,
    pub completed_tasks: Vec<String>,
    pub new_requirement: String,
    pub available_context: Option<serde_json::Value>,
}

pub struct DagSuggester {
    retriever: Arc<HybridRetriever>,
    pub(crate) storage: Arc<dyn StorageAdapter>,
    pub(crate) episodic: Option<Arc<dyn EpisodicMemory>>,
    bus: EventBus,
    pub(crate) config: SuggesterConfig,
    retrieval: RetrievalConfig,
}

impl DagSuggester {
    pub fn new(
        retriever: Arc<HybridRetriever>,
        storage: Arc<dyn StorageAdapter>,
        bus: EventBus,
        config: SuggesterConfig,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            retriever,
            storage,
            episodic: None,
            bus,
            config,
            retrieval,
        }
    }

    /// Attach an episodic memory store; the predictor will weigh
    /// per-tool outcome history into its confidence scores.
    pub fn with_episodic_memory(mut self, episodic: Arc<dyn EpisodicMemory>) -> Self {
        self.episodic = Some(episodic);
        self
    }

    pub(crate) fn graph(&self) -> &Arc<toolweave_graph::ToolGraph> {
        self.retriever.graph()
    }

    pub(crate) fn retriever(&self) -> &Arc<HybridRetriever> {
        &self.retriever
    }

    /// Turn an intent into a task DAG with confidence and rationale.
    pub async fn suggest_dag(&self, intent: &Intent) -> Result<DagSuggestion> {
        let hits = self
            .retriever
            .search_hybrid(
                &intent.text,
                self.config.candidate_limit,
                &intent.context_tools,
                false,
            )
            .await?;
        if hits.is_empty() {
            return Ok(DagSuggestion {
                dag: TaskDag::default(),
                confidence: 0.0,
                rationale: "no candidate tools matched the intent".into(),
                alternatives: Vec::new(),
                dependency_paths: Vec::new(),
                warning: Some("no candidates found".into()),
            });
        }

        let graph = self.graph();
        let mut ranked: Vec<(HybridHit, f32, f32)> = hits
            .into_iter()
            .map(|hit| {
                let pagerank = graph.page_rank(&hit.tool_id);
                let combined = self.config.rerank_hybrid_weight * hit.final_score
                    + self.config.rerank_pagerank_weight * pagerank;
                (hit, pagerank, combined)
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.tool_id.cmp(&b.0.tool_id))
        });

        let kept = ranked
            .iter()
            .take(self.config.keep_top)
            .collect::<Vec<_>>();
        let alternatives: Vec<ToolId> = ranked
            .iter()
            .skip(self.config.keep_top)
            .map(|(h, _, _)| h.tool_id.clone())
            .collect();
        let candidate_ids: Vec<ToolId> = kept.iter().map(|(h, _, _)| h.tool_id.clone()).collect();

        let dag = graph.build_dag(&candidate_ids);
        let dependency_paths = self.explain_dependencies(&dag);

        let density = graph.density();
        let weights = self.config.weights_for_density(density, &self.retrieval);
        let hybrid_avg = mean(kept.iter().map(|(h, _, _)| h.final_score));
        let pagerank_avg = mean(kept.iter().map(|(_, pr, _)| *pr));
        let path_avg = mean(dependency_paths.iter().map(|p| p.confidence));
        let confidence = (weights.hybrid * hybrid_avg
            + weights.pagerank * pagerank_avg
            + weights.path * path_avg)
            .clamp(0.0, 1.0);

        let warning = (confidence < self.config.warning_threshold).then(|| {
            format!(
                "confidence {:.2} below threshold {:.2}; verify before executing",
                confidence, self.config.warning_threshold
            )
        });
        let rationale = format!(
            "{} candidates at graph density {:.4}; kept {} after PageRank re-ranking; {} dependency path(s)",
            ranked.len(),
            density,
            candidate_ids.len(),
            dependency_paths.len()
        );
        debug!(confidence, density, "dag suggested");

        Ok(DagSuggestion {
            dag,
            confidence,
            rationale,
            alternatives,
            dependency_paths,
            warning,
        })
    }

    /// Extend an in-flight DAG with tasks for a new requirement. The
    /// extension anchors on the last completed task; a cyclic result
    /// discards the extension and returns the input unchanged.
    pub async fn replan_dag(&self, current: &TaskDag, request: &ReplanRequest) -> Result<TaskDag> {
        let hits = self
            .retriever
            .index()
            .search_tools(
                &request.new_requirement,
                self.config.candidate_limit,
                self.config.replan_min_score,
            )
            .await?;

        let graph = self.graph();
        let mut ranked: Vec<_> = hits
            .into_iter()
            .map(|hit| {
                let pagerank = graph.page_rank(&hit.tool_id);
                (hit, pagerank)
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.tool_id.cmp(&b.0.tool_id))
        });
        ranked.truncate(self.config.replan_top);

        if ranked.is_empty() {
            return Ok(current.clone());
        }

        let anchor = request
            .completed_tasks
            .iter()
            .rev()
            .find(|id| current.task(id).is_some())
            .cloned();

        let mut extended = current.clone();
        let mut next_index = extended.len();
        let mut added = 0usize;
        for (hit, _) in ranked {
            let mut id = format!("task_{}", next_index);
            while extended.task(&id).is_some() {
                next_index += 1;
                id = format!("task_{}", next_index);
            }
            next_index += 1;
            added += 1;
            extended.tasks.push(TaskNode {
                id,
                kind: TaskKind::McpTool {
                    tool: hit.tool_id,
                    args: request
                        .available_context
                        .clone()
                        .unwrap_or_else(|| serde_json::json!({})),
                    side_effects: false,
                },
                depends_on: anchor.iter().cloned().collect(),
            });
        }

        match validate_acyclic(&extended) {
            Ok(()) => {
                info!(added, "dag replanned");
                if let Some(workflow_id) = request.workflow_id {
                    self.bus.publish(GatewayEvent::DagReplanned {
                        workflow_id,
                        added_tasks: added,
                    });
                }
                Ok(extended)
            }
            Err(_) => Ok(current.clone()),
        }
    }

    /// Annotate every DAG dependency with the graph path behind it.
    fn explain_dependencies(&self, dag: &TaskDag) -> Vec<DependencyPath> {
        let graph = self.graph();
        let mut paths = Vec::new();
        for task in &dag.tasks {
            let Some(to) = task.tool_id() else { continue };
            for dep in &task.depends_on {
                let Some(from) = dag.task(dep).and_then(|t| t.tool_id()) else {
                    continue;
                };
                let Some(route) = graph.shortest_path(from, to) else {
                    continue;
                };
                let hops = route.len().saturating_sub(1);
                let confidence = match hops {
                    1 => 0.95,
                    2 => 0.80,
                    3 => 0.65,
                    _ => 0.50,
                };
                paths.push(DependencyPath {
                    from: from.clone(),
                    to: to.clone(),
                    via: route[1..route.len().saturating_sub(1)].to_vec(),
                    hops,
                    confidence,
                });
            }
        }
        paths
    }

    /// Register a manual routing hint.
    pub async fn register_hint(
        &self,
        from: &ToolId,
        to: &ToolId,
        confidence: Option<f32>,
    ) -> Result<()> {
        self.graph()
            .register_hint(from, to, confidence.unwrap_or(self.config.hint_confidence))
            .await
    }

    pub fn export_patterns(&self) -> Vec<toolweave_graph::PatternEdge> {
        self.graph().export_patterns()
    }

    pub async fn import_patterns(
        &self,
        patterns: &[toolweave_graph::PatternEdge],
        strategy: toolweave_graph::ImportStrategy,
    ) -> Result<()> {
        self.graph().import_patterns(patterns, strategy).await
    }
}

fn mean(values: impl Iterator<Item = f32>) -> f32 {
    let mut sum = 0.0f32;
    let mut count = 0usize;
    for v in values {
        sum += v;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use toolweave_core::{EdgeSource, EdgeType, EventBus, GraphConfig, Tool};
    use toolweave_graph::{MemoryStorage, ToolGraph};
    use toolweave_vector::{HashingEmbedder, VectorIndex};

    const DIM: usize = 128;

    struct Fixture {
        storage: Arc<MemoryStorage>,
        graph: Arc<ToolGraph>,
        suggester: DagSuggester,
    }

    fn fixture() -> Fixture {
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
        Fixture {
            storage,
            graph,
            suggester,
        }
    }

    async fn register(f: &Fixture, server: &str, name: &str, desc: &str) -> ToolId {
        let tool = Tool::new(server, name, desc);
        f.storage.upsert_tool(tool.clone()).await.unwrap();
        f.suggester
            .retriever()
            .index()
            .index_tool(&tool)
            .await
            .unwrap();
        tool.id
    }

    #[tokio::test]
    async fn empty_index_yields_warned_empty_suggestion() {
        let f = fixture();
        let s = f
            .suggester
            .suggest_dag(&Intent::new("do anything"))
            .await
            .unwrap();
        assert!(s.dag.is_empty());
        assert_eq!(s.confidence, 0.0);
        assert!(s.warning.is_some());
    }

    #[tokio::test]
    async fn suggestion_orders_chain_by_graph_structure() {
        let f = fixture();
        let clone = register(&f, "git", "clone", "clone the project repository").await;
        let install = register(&f, "npm", "install", "install project dependencies").await;
        let build = register(&f, "npm", "build", "build the project bundle").await;

        for _ in 0..3 {
            f.graph
                .add_or_update_edge(&clone, &install, EdgeType::Sequence, EdgeSource::Observed)
                .await
                .unwrap();
            f.graph
                .add_or_update_edge(&install, &build, EdgeType::Sequence, EdgeSource::Observed)
                .await
                .unwrap();
        }

        let s = f
            .suggester
            .suggest_dag(&Intent::new("clone install and build the project"))
            .await
            .unwrap();
        assert!(!s.dag.is_empty());
        toolweave_graph::validate_acyclic(&s.dag).unwrap();
        assert!(!s.dependency_paths.is_empty());
        for path in &s.dependency_paths {
            assert!(path.hops >= 1);
            assert!(path.confidence >= 0.50 && path.confidence <= 0.95);
        }
        assert!(s.rationale.contains("candidates"));
    }

    #[tokio::test]
    async fn low_confidence_carries_warning_not_error() {
        let f = fixture();
        register(&f, "misc", "one", "completely unrelated thing").await;
        let s = f
            .suggester
            .suggest_dag(&Intent::new("zzz qqq xxx"))
            .await
            .unwrap();
        assert!(s.confidence < 0.5);
        assert!(s.warning.is_some());
    }

    #[tokio::test]
    async fn replan_appends_tasks_depending_on_last_completed() {
        let f = fixture();
        register(&f, "report", "render", "render the quarterly report document").await;

        let current = TaskDag {
            tasks: vec![
                TaskNode {
                    id: "task_0".into(),
                    kind: TaskKind::McpTool {
                        tool: "data:fetch".parse().unwrap(),
                        args: serde_json::json!({}),
                        side_effects: false,
                    },
                    depends_on: vec![],
                },
                TaskNode {
                    id: "task_1".into(),
                    kind: TaskKind::McpTool {
                        tool: "data:aggregate".parse().unwrap(),
                        args: serde_json::json!({}),
                        side_effects: false,
                    },
                    depends_on: vec!["task_0".into()],
                },
            ],
        };
        let replanned = f
            .suggester
            .replan_dag(
                &current,
                &ReplanRequest {
                    workflow_id: None,
                    completed_tasks: vec!["task_0".into(), "task_1".into()],
                    new_requirement: "render the quarterly report document".into(),
                    available_context: None,
                },
            )
            .await
            .unwrap();

        assert!(replanned.len() > current.len());
        let added = &replanned.tasks[current.len()..];
        for task in added {
            assert_eq!(task.depends_on, vec!["task_1".to_string()]);
        }
        toolweave_graph::validate_acyclic(&replanned).unwrap();
    }

    #[tokio::test]
    async fn replan_of_invalid_dag_returns_it_unchanged() {
        let f = fixture();
        register(&f, "report", "render", "render the quarterly report document").await;

        // A DAG that is already cyclic stays untouched: the extension is
        // discarded when validation fails.
        let cyclic = TaskDag {
            tasks: vec![
                TaskNode {
                    id: "task_0".into(),
                    kind: TaskKind::McpTool {
                        tool: "a:b".parse().unwrap(),
                        args: serde_json::json!({}),
                        side_effects: false,
                    },
                    depends_on: vec!["task_1".into()],
                },
                TaskNode {
                    id: "task_1".into(),
                    kind: TaskKind::McpTool {
                        tool: "a:c".parse().unwrap(),
                        args: serde_json::json!({}),
                        side_effects: false,
                    },
                    depends_on: vec!["task_0".into()],
                },
            ],
        };
        let replanned = f
            .suggester
            .replan_dag(
                &cyclic,
                &ReplanRequest {
                    new_requirement: "render the quarterly report document".into(),
                    ..ReplanRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(replanned.len(), cyclic.len());
    }

    #[tokio::test]
    async fn replan_without_matches_returns_input() {
        let f = fixture();
        let current = TaskDag {
            tasks: vec![TaskNode {
                id: "task_0".into(),
                kind: TaskKind::McpTool {
                    tool: "a:b".parse().unwrap(),
                    args: serde_json::json!({}),
                    side_effects: false,
                },
                depends_on: vec![],
            }],
        };
        let replanned = f
            .suggester
            .replan_dag(
                &current,
                &ReplanRequest {
                    new_requirement: "nothing matches this".into(),
                    ..ReplanRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(replanned.len(), current.len());
    }
}
