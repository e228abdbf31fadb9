//! The workflow controller: the single entry point that decides between
//! capability reuse, DAG execution, and suggestion-only responses.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use toolweave_core::{
    CapabilityId, ErrorInfo, Intent, Result, StorageAdapter, SuggesterConfig, TaskDag, TaskKind,
    TaskNode, TaskResult, ToolDefinition, TraceEvent, WorkflowExecution,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capability::CapabilityStore;
use crate::executor::{ExecutionReport, ParallelExecutor};
use crate::learning::LearningLoop;
use crate::predict::PredictionState;
use crate::sandbox::{CapabilitySpan, CodeRequest, SandboxBridge};
use crate::speculation::SpeculationCache;
use crate::suggester::{DagSuggestion, DagSuggester};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    /// Try a stored capability before planning a DAG.
    pub prefer_capabilities: bool,
    /// Execute mid-confidence suggestions instead of returning them.
    pub auto_execute: bool,
    /// Pre-execute the top predicted next tool after a successful run.
    pub speculate: bool,
    /// Minimum match score for the capability short-circuit.
    pub capability_threshold: f32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            prefer_capabilities: true,
            auto_execute: false,
            speculate: false,
            capability_threshold: 0.85,
        }
    }
}

/// Terminal result of `run`. Each variant still carries the full trace
/// log where one exists; events stream separately over the bus.
#[derive(Debug)]
pub enum RunOutcome {
    /// A stored capability matched and was executed in the sandbox.
    CapabilityExecuted {
        capability_id: CapabilityId,
        name: String,
        success: bool,
        result: Option<serde_json::Value>,
        error: Option<ErrorInfo>,
        traces: Vec<TraceEvent>,
    },
    /// A DAG was planned and executed.
    Executed {
        execution: WorkflowExecution,
        results: Vec<TaskResult>,
        traces: Vec<TraceEvent>,
        suggestion: DagSuggestion,
    },
    /// Confidence was in the suggestion band and `auto_execute` was off.
    Suggested { suggestion: DagSuggestion },
    /// Confidence fell below the warning threshold.
    LowConfidence { suggestion: DagSuggestion },
}

pub struct WorkflowController {
    suggester: Arc<DagSuggester>,
    executor: Arc<ParallelExecutor>,
    capabilities: Arc<CapabilityStore>,
    sandbox: Arc<SandboxBridge>,
    learning: Arc<LearningLoop>,
    storage: Arc<dyn StorageAdapter>,
    speculation: Arc<SpeculationCache>,
    config: SuggesterConfig,
}

impl WorkflowController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        suggester: Arc<DagSuggester>,
        executor: Arc<ParallelExecutor>,
        capabilities: Arc<CapabilityStore>,
        sandbox: Arc<SandboxBridge>,
        learning: Arc<LearningLoop>,
        storage: Arc<dyn StorageAdapter>,
        speculation: Arc<SpeculationCache>,
        config: SuggesterConfig,
    ) -> Self {
        Self {
            suggester,
            executor,
            capabilities,
            sandbox,
            learning,
            storage,
            speculation,
            config,
        }
    }

    pub async fn run(&self, intent: &Intent, options: RunOptions) -> Result<RunOutcome> {
        self.run_with_cancel(intent, options, CancellationToken::new())
            .await
    }

    pub async fn run_with_cancel(
        &self,
        intent: &Intent,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        if options.prefer_capabilities {
            if let Some(outcome) = self.try_capability(intent, &options).await? {
                return Ok(outcome);
            }
        }

        let suggestion = self.suggester.suggest_dag(intent).await?;
        let execute = suggestion.confidence >= self.config.execute_threshold
            || (suggestion.confidence >= self.config.warning_threshold && options.auto_execute);

        if !execute {
            return Ok(if suggestion.confidence >= self.config.warning_threshold {
                debug!(confidence = suggestion.confidence, "returning suggestion without executing");
                RunOutcome::Suggested { suggestion }
            } else {
                debug!(confidence = suggestion.confidence, "low confidence stub");
                RunOutcome::LowConfidence { suggestion }
            });
        }

        let report = self
            .executor
            .execute(&intent.text, suggestion.dag.clone(), cancel)
            .await?;
        self.learning
            .after_workflow(&report.execution, &report.traces, &report.code_traces, &report.results)
            .await;

        if options.speculate {
            self.speculate_after(&report).await;
        }

        Ok(RunOutcome::Executed {
            execution: report.execution,
            results: report.results,
            traces: report.traces,
            suggestion,
        })
    }

    /// Capability short-circuit: run matched code straight in the
    /// sandbox, count the usage, and feed the learning loop (without
    /// re-promoting the same code).
    async fn try_capability(
        &self,
        intent: &Intent,
        options: &RunOptions,
    ) -> Result<Option<RunOutcome>> {
        let Some(matched) = self
            .capabilities
            .find_match(&intent.text, options.capability_threshold)
            .await?
        else {
            return Ok(None);
        };
        let capability = matched.capability;
        info!(name = %capability.name, score = matched.score, "capability short-circuit");

        let workflow_id = Uuid::new_v4();
        let run = self
            .sandbox
            .execute(CodeRequest {
                workflow_id,
                code: capability.code.clone(),
                context: None,
                tool_definitions: self.active_tool_definitions().await?,
                capability: Some(CapabilitySpan {
                    capability_id: capability.capability_id,
                    name: capability.name.clone(),
                }),
            })
            .await;

        if let Err(e) = self
            .capabilities
            .record_usage(capability.capability_id, run.success)
            .await
        {
            warn!(error = %e, "capability usage record failed");
        }

        let execution = WorkflowExecution {
            execution_id: workflow_id,
            intent_text: intent.text.clone(),
            dag: TaskDag {
                tasks: vec![TaskNode {
                    id: "task_0".into(),
                    kind: TaskKind::CodeExecution {
                        code: capability.code.clone(),
                        context: None,
                    },
                    depends_on: vec![],
                }],
            },
            success: run.success,
            execution_time_ms: run.duration_ms,
            error_message: run.error.as_ref().map(|e| e.to_string()),
            executed_at: chrono::Utc::now(),
        };
        if let Err(e) = self.storage.record_execution(execution.clone()).await {
            warn!(error = %e, "capability execution record failed");
        }
        // Empty task results: graph and prediction learning still run,
        // promotion does not (the capability already exists).
        self.learning
            .after_workflow(&execution, &run.traces, &run.traces, &[])
            .await;

        Ok(Some(RunOutcome::CapabilityExecuted {
            capability_id: capability.capability_id,
            name: capability.name,
            success: run.success,
            result: run.result,
            error: run.error.map(|e| e.info()),
            traces: run.traces,
        }))
    }

    /// Fire-and-forget speculation: predict from the last successful
    /// tool and warm the cache with the top candidate's result.
    async fn speculate_after(&self, report: &ExecutionReport) {
        let Some(last_tool) = report
            .results
            .iter()
            .rev()
            .filter(|r| r.success)
            .find_map(|r| r.tool.clone())
        else {
            return;
        };

        let predictions = match self
            .suggester
            .predict_next_nodes(&PredictionState {
                workflow_id: Some(report.execution.execution_id),
                last_tool,
            })
            .await
        {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "speculation prediction failed");
                return;
            }
        };

        if let Some(top) = predictions.first() {
            let args = serde_json::json!({});
            match self
                .executor
                .speculative_call(&top.tool_id, args.clone())
                .await
            {
                Ok(value) => {
                    debug!(tool = %top.tool_id, "speculative result cached");
                    self.speculation.put(&top.tool_id, &args, value);
                }
                Err(e) => debug!(tool = %top.tool_id, error = %e, "speculation discarded"),
            }
        }
    }

    async fn active_tool_definitions(&self) -> Result<Vec<ToolDefinition>> {
        Ok(self
            .storage
            .list_tools()
            .await?
            .iter()
            .filter(|t| t.active)
            .map(ToolDefinition::from)
            .collect())
    }
}
