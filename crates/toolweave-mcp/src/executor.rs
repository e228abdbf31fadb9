//! Layered parallel execution of task DAGs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use toolweave_core::{
    EventBus, ExecutionId, ExecutorConfig, GatewayEvent, McpClient, Result, StorageAdapter,
    TaskDag, TaskKind, TaskNode, TaskResult, TaskStatus, ToolId, TraceEvent, TraceEventType,
    WeaveError, WorkflowExecution,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::sandbox::{CodeRequest, SandboxBridge};
use crate::speculation::SpeculationCache;

/// Everything one run produced: the immutable execution record, the
/// per-task results, and the trace log. Traces recorded natively inside
/// sandbox runs are additionally broken out in `code_traces`; only
/// those carry the parent/child structure the code-trace learner reads.
#[derive(Debug)]
pub struct ExecutionReport {
    pub execution: WorkflowExecution,
    pub results: Vec<TaskResult>,
    pub traces: Vec<TraceEvent>,
    pub code_traces: Vec<TraceEvent>,
}

/// Executes a DAG layer by layer.
///
/// Tasks inside a layer run concurrently under the parallelism cap;
/// layers are a strict happens-before. A failed task never crashes the
/// workflow: its dependents are skipped as `failed_safe` and everything
/// else proceeds.
pub struct ParallelExecutor {
    mcp: Arc<dyn McpClient>,
    sandbox: Arc<SandboxBridge>,
    storage: Arc<dyn StorageAdapter>,
    speculation: Arc<SpeculationCache>,
    bus: EventBus,
    config: ExecutorConfig,
}

struct TaskOutput {
    result: TaskResult,
    traces: Vec<TraceEvent>,
    from_sandbox: bool,
}

impl ParallelExecutor {
    pub fn new(
        mcp: Arc<dyn McpClient>,
        sandbox: Arc<SandboxBridge>,
        storage: Arc<dyn StorageAdapter>,
        speculation: Arc<SpeculationCache>,
        bus: EventBus,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            mcp,
            sandbox,
            storage,
            speculation,
            bus,
            config,
        }
    }

    /// Run the DAG to completion (or cancellation). Rejects cyclic input
    /// up front; everything after that is captured per task.
    pub async fn execute(
        &self,
        intent_text: &str,
        dag: TaskDag,
        cancel: CancellationToken,
    ) -> Result<ExecutionReport> {
        let layers = toolweave_graph::topological_layers(&dag)?;
        let workflow_id = Uuid::new_v4();
        let started = Instant::now();

        self.bus.publish(GatewayEvent::DagStarted {
            workflow_id,
            tasks: dag.len(),
        });

        let mut results: HashMap<String, TaskResult> = HashMap::new();
        let mut traces: Vec<TraceEvent> = Vec::new();
        let mut code_traces: Vec<TraceEvent> = Vec::new();
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let deadline = started + Duration::from_millis(self.config.workflow_timeout_ms);
        let mut abort_reason: Option<&str> = None;

        for (layer_index, layer) in layers.iter().enumerate() {
            if cancel.is_cancelled() {
                abort_reason = Some("cancelled");
            } else if Instant::now() >= deadline {
                abort_reason = Some("workflow deadline exceeded");
            }
            if let Some(reason) = abort_reason {
                for task_id in layers[layer_index..].iter().flatten() {
                    results.insert(task_id.clone(), skipped(task_id, None, reason));
                }
                break;
            }

            let mut runnable: Vec<&TaskNode> = Vec::new();
            for task_id in layer {
                let task = dag.task(task_id).expect("layering returned known task");
                let blocked = task.depends_on.iter().any(|dep| {
                    results
                        .get(dep)
                        .map(|r| r.status != TaskStatus::Completed)
                        .unwrap_or(true)
                });
                if blocked {
                    results.insert(
                        task_id.clone(),
                        skipped(task_id, task.tool_id().cloned(), "upstream dependency failed"),
                    );
                } else {
                    runnable.push(task);
                }
            }

            let outputs = join_all(runnable.iter().map(|task| {
                let semaphore = semaphore.clone();
                async move {
                    let _permit = semaphore.acquire().await.expect("semaphore never closed");
                    self.run_task(workflow_id, task).await
                }
            }))
            .await;

            for output in outputs {
                if output.from_sandbox {
                    code_traces.extend(output.traces.iter().cloned());
                }
                traces.extend(output.traces);
                results.insert(output.result.task_id.clone(), output.result);
            }

            self.bus.publish(GatewayEvent::LayerCompleted {
                workflow_id,
                layer: layer_index,
                tasks: layer.len(),
            });
        }

        // Results come back in DAG task order.
        let ordered: Vec<TaskResult> = dag
            .tasks
            .iter()
            .filter_map(|t| results.remove(&t.id))
            .collect();

        let success =
            abort_reason.is_none() && ordered.iter().all(|r| r.status == TaskStatus::Completed);
        let error_message = match abort_reason {
            Some(reason) => Some(reason.to_string()),
            None => ordered
                .iter()
                .find(|r| r.status == TaskStatus::Failed)
                .and_then(|r| r.error.clone()),
        };

        let execution = WorkflowExecution {
            execution_id: workflow_id,
            intent_text: intent_text.to_string(),
            dag,
            success,
            execution_time_ms: started.elapsed().as_millis() as u64,
            error_message,
            executed_at: chrono::Utc::now(),
        };

        // The record is an observable side effect, not a gate on the
        // caller receiving results.
        if let Err(e) = self.storage.record_execution(execution.clone()).await {
            warn!(error = %e, "failed to persist execution record");
        }

        self.bus.publish(GatewayEvent::DagCompleted {
            workflow_id,
            success,
        });
        info!(
            %workflow_id,
            success,
            tasks = execution.dag.len(),
            elapsed_ms = execution.execution_time_ms,
            "dag execution finished"
        );

        Ok(ExecutionReport {
            execution,
            results: ordered,
            traces,
            code_traces,
        })
    }

    async fn run_task(&self, workflow_id: ExecutionId, task: &TaskNode) -> TaskOutput {
        self.bus.publish(GatewayEvent::TaskStarted {
            workflow_id,
            task_id: task.id.clone(),
        });
        let started = Instant::now();

        let output = match &task.kind {
            TaskKind::McpTool {
                tool,
                args,
                side_effects,
            } => {
                self.run_mcp_task(workflow_id, &task.id, tool, args, *side_effects)
                    .await
            }
            TaskKind::CodeExecution { code, context } => {
                self.run_code_task(workflow_id, &task.id, code, context.clone())
                    .await
            }
        };

        let elapsed = started.elapsed().as_millis() as u64;
        match &output.result.status {
            TaskStatus::Completed => self.bus.publish(GatewayEvent::TaskCompleted {
                workflow_id,
                task_id: task.id.clone(),
                execution_time_ms: elapsed,
            }),
            _ => self.bus.publish(GatewayEvent::TaskError {
                workflow_id,
                task_id: task.id.clone(),
                error: output
                    .result
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown".into()),
            }),
        }
        output
    }

    async fn run_mcp_task(
        &self,
        workflow_id: ExecutionId,
        task_id: &str,
        tool: &ToolId,
        args: &serde_json::Value,
        side_effects: bool,
    ) -> TaskOutput {
        let started = Instant::now();
        let mut traces = Vec::new();

        // A speculative pre-execution may already hold this exact call.
        if let Some(value) = self.speculation.take(tool, args) {
            debug!(%tool, "speculative result consumed");
            let trace_id = Uuid::new_v4();
            traces.push(TraceEvent::start(
                workflow_id,
                TraceEventType::ToolStart,
                trace_id,
                None,
                tool.as_str(),
            ));
            traces.push(TraceEvent::end(
                workflow_id,
                TraceEventType::ToolEnd,
                trace_id,
                None,
                tool.as_str(),
                true,
                0,
                None,
            ));
            return TaskOutput {
                result: completed(task_id, tool, value, started),
                traces,
                from_sandbox: false,
            };
        }

        // Non-idempotent calls get exactly one attempt.
        let attempts = if side_effects {
            1
        } else {
            self.config.retry_attempts.max(1)
        };

        let mut last_error = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff = self.config.retry_base_ms * (1u64 << (attempt - 1));
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }

            let trace_id = Uuid::new_v4();
            traces.push(TraceEvent::start(
                workflow_id,
                TraceEventType::ToolStart,
                trace_id,
                None,
                tool.as_str(),
            ));
            let attempt_started = Instant::now();
            let dispatched = tokio::time::timeout(
                Duration::from_millis(self.config.task_timeout_ms),
                self.mcp.call_tool(tool.server(), tool.name(), args.clone()),
            )
            .await;
            let outcome = match dispatched {
                Ok(result) => result,
                Err(_) => Err(WeaveError::Timeout(format!(
                    "task {} exceeded {} ms",
                    task_id, self.config.task_timeout_ms
                ))),
            };
            let attempt_ms = attempt_started.elapsed().as_millis() as u64;

            match outcome {
                Ok(value) => {
                    traces.push(TraceEvent::end(
                        workflow_id,
                        TraceEventType::ToolEnd,
                        trace_id,
                        None,
                        tool.as_str(),
                        true,
                        attempt_ms,
                        None,
                    ));
                    return TaskOutput {
                        result: completed(task_id, tool, value, started),
                        traces,
                        from_sandbox: false,
                    };
                }
                Err(e) => {
                    last_error = e.to_string();
                    traces.push(TraceEvent::end(
                        workflow_id,
                        TraceEventType::ToolEnd,
                        trace_id,
                        None,
                        tool.as_str(),
                        false,
                        attempt_ms,
                        Some(last_error.clone()),
                    ));
                    debug!(task_id, attempt, error = %e, "task attempt failed");
                }
            }
        }

        TaskOutput {
            result: TaskResult {
                task_id: task_id.to_string(),
                tool: Some(tool.clone()),
                status: TaskStatus::Failed,
                success: false,
                result: None,
                error: Some(last_error),
                execution_time_ms: started.elapsed().as_millis() as u64,
            },
            traces,
            from_sandbox: false,
        }
    }

    async fn run_code_task(
        &self,
        workflow_id: ExecutionId,
        task_id: &str,
        code: &str,
        context: Option<serde_json::Value>,
    ) -> TaskOutput {
        let tool_definitions = match self.allowlisted_definitions().await {
            Ok(defs) => defs,
            Err(e) => {
                return TaskOutput {
                    result: TaskResult {
                        task_id: task_id.to_string(),
                        tool: None,
                        status: TaskStatus::Failed,
                        success: false,
                        result: None,
                        error: Some(e.to_string()),
                        execution_time_ms: 0,
                    },
                    traces: Vec::new(),
                    from_sandbox: true,
                }
            }
        };

        let run = self
            .sandbox
            .execute(CodeRequest {
                workflow_id,
                code: code.to_string(),
                context,
                tool_definitions,
                capability: None,
            })
            .await;

        TaskOutput {
            result: TaskResult {
                task_id: task_id.to_string(),
                tool: None,
                status: if run.success {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                },
                success: run.success,
                result: run.result,
                error: run.error.map(|e| e.to_string()),
                execution_time_ms: run.duration_ms,
            },
            traces: run.traces,
            from_sandbox: true,
        }
    }

    /// One direct tool call on behalf of the speculation path: no
    /// traces, no retries, no events. The caller caches or discards the
    /// result.
    pub async fn speculative_call(
        &self,
        tool: &ToolId,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        tokio::time::timeout(
            Duration::from_millis(self.config.task_timeout_ms),
            self.mcp.call_tool(tool.server(), tool.name(), args),
        )
        .await
        .map_err(|_| WeaveError::Timeout(format!("speculative call to {} timed out", tool)))?
    }

    /// Code tasks may call any registered active tool.
    async fn allowlisted_definitions(&self) -> Result<Vec<toolweave_core::ToolDefinition>> {
        Ok(self
            .storage
            .list_tools()
            .await?
            .iter()
            .filter(|t| t.active)
            .map(toolweave_core::ToolDefinition::from)
            .collect())
    }
}

fn completed(
    task_id: &str,
    tool: &ToolId,
    value: serde_json::Value,
    started: Instant,
) -> TaskResult {
    TaskResult {
        task_id: task_id.to_string(),
        tool: Some(tool.clone()),
        status: TaskStatus::Completed,
        success: true,
        result: Some(value),
        error: None,
        execution_time_ms: started.elapsed().as_millis() as u64,
    }
}

fn skipped(task_id: &str, tool: Option<ToolId>, reason: &str) -> TaskResult {
    TaskResult {
        task_id: task_id.to_string(),
        tool,
        status: TaskStatus::FailedSafe,
        success: false,
        result: None,
        error: Some(reason.to_string()),
        execution_time_ms: 0,
    }
}
