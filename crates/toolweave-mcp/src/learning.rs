//! Post-workflow learning. Nothing in here is allowed to fail the
//! workflow that triggered it: every step logs and moves on.

use std::collections::HashSet;
use std::sync::Arc;

use toolweave_core::{
    StorageAdapter, TaskKind, TaskResult, TaskStatus, ToolId, TraceEvent, WorkflowExecution,
};
use toolweave_graph::ToolGraph;
use tracing::{debug, warn};

use crate::capability::{CapabilityStore, Promotion};

pub struct LearningLoop {
    graph: Arc<ToolGraph>,
    capabilities: Arc<CapabilityStore>,
    storage: Arc<dyn StorageAdapter>,
}

impl LearningLoop {
    pub fn new(
        graph: Arc<ToolGraph>,
        capabilities: Arc<CapabilityStore>,
        storage: Arc<dyn StorageAdapter>,
    ) -> Self {
        Self {
            graph,
            capabilities,
            storage,
        }
    }

    /// Digest one finished workflow: flush traces, grow the graph,
    /// promote successful code into capabilities, and settle any
    /// speculative predictions made for this run.
    ///
    /// `code_traces` is the subset recorded natively inside sandbox
    /// runs; only those feed hierarchical code-trace learning. DAG-level
    /// ordering is already covered by the execution record.
    pub async fn after_workflow(
        &self,
        exec: &WorkflowExecution,
        traces: &[TraceEvent],
        code_traces: &[TraceEvent],
        results: &[TaskResult],
    ) {
        if let Err(e) = self.storage.append_traces(traces.to_vec()).await {
            warn!(error = %e, "learning: trace flush failed");
        }

        if let Err(e) = self.graph.update_from_execution(exec).await {
            warn!(error = %e, "learning: execution update failed");
        }
        if let Err(e) = self.graph.update_from_code_traces(code_traces).await {
            warn!(error = %e, "learning: code trace update failed");
        }

        self.promote_code_tasks(exec, traces, results).await;
        self.resolve_predictions(exec, traces).await;
    }

    /// Eager learning: each successful code task under a real intent
    /// becomes (or reinforces) a capability.
    async fn promote_code_tasks(
        &self,
        exec: &WorkflowExecution,
        traces: &[TraceEvent],
        results: &[TaskResult],
    ) {
        if exec.intent_text.is_empty() {
            return;
        }
        let tools_used: Vec<ToolId> = executed_tools(exec, traces).into_iter().collect();

        for task in &exec.dag.tasks {
            let TaskKind::CodeExecution { code, .. } = &task.kind else {
                continue;
            };
            let succeeded = results
                .iter()
                .any(|r| r.task_id == task.id && r.status == TaskStatus::Completed);
            if !succeeded {
                continue;
            }
            let outcome = self
                .capabilities
                .promote(Promotion {
                    intent: exec.intent_text.clone(),
                    code: code.clone(),
                    tools_used: tools_used.clone(),
                    duration_ms: exec.execution_time_ms,
                    success: true,
                })
                .await;
            if let Err(e) = outcome {
                warn!(error = %e, task = %task.id, "learning: promotion failed");
            }
        }
    }

    async fn resolve_predictions(&self, exec: &WorkflowExecution, traces: &[TraceEvent]) {
        let predictions = match self.storage.predictions_for(exec.execution_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "learning: prediction lookup failed");
                return;
            }
        };
        if predictions.is_empty() {
            return;
        }
        let executed = executed_tools(exec, traces);
        for prediction in predictions {
            if prediction.was_correct.is_some() {
                continue;
            }
            let was_correct = executed.contains(&prediction.tool_id);
            debug!(tool = %prediction.tool_id, was_correct, "prediction resolved");
            if let Err(e) = self
                .storage
                .resolve_prediction(prediction.prediction_id, was_correct)
                .await
            {
                warn!(error = %e, "learning: prediction resolve failed");
            }
        }
    }
}

/// Every tool touched by the run: DAG tool tasks plus traced sandbox
/// calls.
fn executed_tools(exec: &WorkflowExecution, traces: &[TraceEvent]) -> HashSet<ToolId> {
    let mut tools: HashSet<ToolId> = exec.dag.tool_ids().into_iter().collect();
    for trace in traces {
        if let Ok(id) = trace.subject_id.parse::<ToolId>() {
            tools.insert(id);
        }
    }
    tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolweave_core::{
        EventBus, GraphConfig, Prediction, PredictionSource, TaskDag, TaskNode,
    };
    use toolweave_graph::MemoryStorage;
    use toolweave_vector::HashingEmbedder;
    use uuid::Uuid;

    const DIM: usize = 64;

    fn loop_with_storage() -> (Arc<MemoryStorage>, LearningLoop) {
        let storage = Arc::new(MemoryStorage::new(DIM));
        let graph = Arc::new(ToolGraph::new(
            storage.clone(),
            EventBus::default(),
            GraphConfig::default(),
        ));
        let capabilities = Arc::new(CapabilityStore::new(
            storage.clone(),
            Arc::new(HashingEmbedder::new(DIM)),
            EventBus::default(),
        ));
        (
            storage.clone(),
            LearningLoop::new(graph, capabilities, storage),
        )
    }

    fn code_exec(intent: &str, code: &str) -> (WorkflowExecution, Vec<TaskResult>) {
        let exec = WorkflowExecution {
            execution_id: Uuid::new_v4(),
            intent_text: intent.into(),
            dag: TaskDag {
                tasks: vec![TaskNode {
                    id: "task_0".into(),
                    kind: TaskKind::CodeExecution {
                        code: code.into(),
                        context: None,
                    },
                    depends_on: vec![],
                }],
            },
            success: true,
            execution_time_ms: 25,
            error_message: None,
            executed_at: chrono::Utc::now(),
        };
        let results = vec![TaskResult {
            task_id: "task_0".into(),
            tool: None,
            status: TaskStatus::Completed,
            success: true,
            result: Some(serde_json::json!("done")),
            error: None,
            execution_time_ms: 25,
        }];
        (exec, results)
    }

    #[tokio::test]
    async fn successful_code_task_is_promoted() {
        let (storage, learning) = loop_with_storage();
        let (exec, results) = code_exec("summarize the report", "call('a');");
        learning.after_workflow(&exec, &[], &[], &results).await;
        assert_eq!(storage.list_capabilities().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_code_task_is_not_promoted() {
        let (storage, learning) = loop_with_storage();
        let (exec, mut results) = code_exec("summarize the report", "call('a');");
        results[0].status = TaskStatus::Failed;
        results[0].success = false;
        learning.after_workflow(&exec, &[], &[], &results).await;
        assert!(storage.list_capabilities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn predictions_resolve_against_executed_tools() {
        let (storage, learning) = loop_with_storage();
        let (exec, results) = code_exec("do things", "x();");

        let hit = Prediction {
            prediction_id: Uuid::new_v4(),
            workflow_id: Some(exec.execution_id),
            source: PredictionSource::CoOccurrence,
            tool_id: "fs:read_file".parse().unwrap(),
            confidence: 0.8,
            was_correct: None,
        };
        let miss = Prediction {
            prediction_id: Uuid::new_v4(),
            workflow_id: Some(exec.execution_id),
            source: PredictionSource::Community,
            tool_id: "mail:send".parse().unwrap(),
            confidence: 0.6,
            was_correct: None,
        };
        storage.record_prediction(hit.clone()).await.unwrap();
        storage.record_prediction(miss.clone()).await.unwrap();

        // fs:read_file shows up in the trace log, mail:send does not.
        let trace_id = Uuid::new_v4();
        let traces = vec![
            toolweave_core::TraceEvent::start(
                exec.execution_id,
                toolweave_core::TraceEventType::ToolStart,
                trace_id,
                None,
                "fs:read_file",
            ),
            toolweave_core::TraceEvent::end(
                exec.execution_id,
                toolweave_core::TraceEventType::ToolEnd,
                trace_id,
                None,
                "fs:read_file",
                true,
                3,
                None,
            ),
        ];
        learning.after_workflow(&exec, &traces, &traces, &results).await;

        let resolved = storage.predictions_for(exec.execution_id).await.unwrap();
        let hit_row = resolved
            .iter()
            .find(|p| p.prediction_id == hit.prediction_id)
            .unwrap();
        let miss_row = resolved
            .iter()
            .find(|p| p.prediction_id == miss.prediction_id)
            .unwrap();
        assert_eq!(hit_row.was_correct, Some(true));
        assert_eq!(miss_row.was_correct, Some(false));
    }

    #[tokio::test]
    async fn storage_outage_never_propagates() {
        let (storage, learning) = loop_with_storage();
        let (exec, results) = code_exec("anything", "y();");
        storage.set_unavailable(true);
        // Must not panic or return an error; it has no Result to return.
        learning.after_workflow(&exec, &[], &[], &results).await;
    }
}
