use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use toolweave_core::{
    CapabilityId, EventBus, ExecutionId, GatewayEvent, McpClient, SandboxConfig, ToolDefinition,
    TraceEvent, TraceEventType, TraceId, WeaveError,
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::paths::{validate_tool_args, WorkspaceGuard};
use super::protocol::{BridgeMessage, WorkerMessage};
use super::worker::{classify_worker_error, SandboxWorker};

/// The active capability span, when the executed code came from a
/// stored capability; its trace id becomes the parent of every RPC
/// trace recorded during the run.
#[derive(Debug, Clone)]
pub struct CapabilitySpan {
    pub capability_id: CapabilityId,
    pub name: String,
}

/// One code-execution request.
#[derive(Clone)]
pub struct CodeRequest {
    pub workflow_id: ExecutionId,
    pub code: String,
    pub context: Option<serde_json::Value>,
    pub tool_definitions: Vec<ToolDefinition>,
    pub capability: Option<CapabilitySpan>,
}

/// Terminal result of a sandbox run, traces included. The bridge never
/// panics a workflow; failures land in `error`.
pub struct SandboxRun {
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<WeaveError>,
    pub traces: Vec<TraceEvent>,
    pub duration_ms: u64,
}

enum Outcome {
    Complete {
        success: bool,
        result: Option<serde_json::Value>,
        error: Option<String>,
    },
    TotalTimeout,
    Crashed,
}

/// Spawns isolated workers and brokers their tool RPCs.
///
/// The bridge owns both deadlines: the per-RPC timeout softly rejects a
/// single call, the total timeout hard-kills the worker. Outstanding
/// RPCs at kill time resolve as `Worker terminated` and their traces
/// are still collected.
pub struct SandboxBridge {
    mcp: Arc<dyn McpClient>,
    worker: Arc<dyn SandboxWorker>,
    bus: EventBus,
    config: SandboxConfig,
}

struct RpcContext {
    mcp: Arc<dyn McpClient>,
    guard: Arc<WorkspaceGuard>,
    allowlist: Arc<Vec<ToolDefinition>>,
    reply: tokio::sync::mpsc::Sender<BridgeMessage>,
    sink: Arc<Mutex<Vec<TraceEvent>>>,
    cancel: CancellationToken,
    rpc_timeout: Duration,
    workflow_id: ExecutionId,
    parent: Option<TraceId>,
}

impl SandboxBridge {
    pub fn new(
        mcp: Arc<dyn McpClient>,
        worker: Arc<dyn SandboxWorker>,
        bus: EventBus,
        config: SandboxConfig,
    ) -> Self {
        Self {
            mcp,
            worker,
            bus,
            config,
        }
    }

    pub async fn execute(&self, request: CodeRequest) -> SandboxRun {
        let started = Instant::now();
        let mut traces: Vec<TraceEvent> = Vec::new();

        let guard = match WorkspaceGuard::new(&self.config.workspace_root) {
            Ok(g) => Arc::new(g),
            Err(e) => return finished(false, None, Some(e), traces, started),
        };

        let capability_trace = request.capability.as_ref().map(|_| Uuid::new_v4());
        if let (Some(cap), Some(trace_id)) = (&request.capability, capability_trace) {
            traces.push(TraceEvent::start(
                request.workflow_id,
                TraceEventType::CapabilityStart,
                trace_id,
                None,
                format!("capability:{}", cap.name),
            ));
            self.bus.publish(GatewayEvent::CapabilityStarted {
                capability_id: cap.capability_id,
            });
        }

        let mut channels = match self
            .worker
            .spawn(
                request.code.clone(),
                request.tool_definitions.clone(),
                request.context.clone(),
            )
            .await
        {
            Ok(c) => c,
            Err(e) => {
                self.close_capability(&request, capability_trace, false, &mut traces, started);
                return finished(false, None, Some(e), traces, started);
            }
        };

        let sink: Arc<Mutex<Vec<TraceEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let inflight = Arc::new(Semaphore::new(self.config.max_inflight_rpc.max(1)));
        let allowlist = Arc::new(request.tool_definitions.clone());
        let mut rpc_tasks: JoinSet<()> = JoinSet::new();

        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.total_timeout_ms);

        let outcome = loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break Outcome::TotalTimeout,
                message = channels.from_worker.recv() => match message {
                    Some(WorkerMessage::ExecutionComplete { success, result, error }) => {
                        break Outcome::Complete { success, result, error };
                    }
                    Some(WorkerMessage::RpcCall { id, server, tool, args }) => {
                        let ctx = RpcContext {
                            mcp: self.mcp.clone(),
                            guard: guard.clone(),
                            allowlist: allowlist.clone(),
                            reply: channels.to_worker.clone(),
                            sink: sink.clone(),
                            cancel: cancel.child_token(),
                            rpc_timeout: Duration::from_millis(self.config.rpc_timeout_ms),
                            workflow_id: request.workflow_id,
                            parent: capability_trace,
                        };
                        let permits = inflight.clone();
                        rpc_tasks.spawn(async move {
                            let _permit = permits.acquire().await.expect("semaphore never closed");
                            handle_rpc(ctx, id, server, tool, args).await;
                        });
                    }
                    None => break Outcome::Crashed,
                }
            }
        };

        if matches!(outcome, Outcome::TotalTimeout) {
            // Hard kill: the worker is gone and every in-flight RPC is
            // rejected rather than left to finish.
            cancel.cancel();
        }
        channels.task.abort();
        while rpc_tasks.join_next().await.is_some() {}
        traces.append(&mut sink.lock());

        let (success, result, error) = match outcome {
            Outcome::Complete {
                success: true,
                result,
                ..
            } => (true, result, None),
            Outcome::Complete { error, .. } => {
                let e = classify_worker_error(
                    error.as_deref().unwrap_or("execution failed without detail"),
                );
                (false, None, Some(e))
            }
            Outcome::TotalTimeout => (
                false,
                None,
                Some(WeaveError::Timeout(format!(
                    "sandbox execution exceeded {} ms",
                    self.config.total_timeout_ms
                ))),
            ),
            Outcome::Crashed => (
                false,
                None,
                Some(WeaveError::Runtime(
                    "worker terminated before completion".into(),
                )),
            ),
        };

        self.close_capability(&request, capability_trace, success, &mut traces, started);
        finished(success, result, error, traces, started)
    }

    fn close_capability(
        &self,
        request: &CodeRequest,
        capability_trace: Option<TraceId>,
        success: bool,
        traces: &mut Vec<TraceEvent>,
        started: Instant,
    ) {
        if let (Some(cap), Some(trace_id)) = (&request.capability, capability_trace) {
            traces.push(TraceEvent::end(
                request.workflow_id,
                TraceEventType::CapabilityEnd,
                trace_id,
                None,
                format!("capability:{}", cap.name),
                success,
                started.elapsed().as_millis() as u64,
                None,
            ));
            self.bus.publish(GatewayEvent::CapabilityEnded {
                capability_id: cap.capability_id,
                success,
            });
        }
    }
}

fn finished(
    success: bool,
    result: Option<serde_json::Value>,
    error: Option<WeaveError>,
    traces: Vec<TraceEvent>,
    started: Instant,
) -> SandboxRun {
    if let Some(e) = &error {
        warn!(error = %e, "sandbox run failed");
    }
    SandboxRun {
        success,
        result,
        error,
        traces,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

async fn handle_rpc(
    ctx: RpcContext,
    id: TraceId,
    server: String,
    tool: String,
    args: serde_json::Value,
) {
    let subject = format!("{}:{}", server, tool);
    let started = Instant::now();
    ctx.sink.lock().push(TraceEvent::start(
        ctx.workflow_id,
        TraceEventType::ToolStart,
        id,
        ctx.parent,
        subject.clone(),
    ));

    let allowed = ctx
        .allowlist
        .iter()
        .any(|t| t.server == server && t.name == tool);

    let outcome: Result<serde_json::Value, WeaveError> = if !allowed {
        Err(WeaveError::Permission(format!(
            "{} is not in the allowlist for this execution",
            subject
        )))
    } else if let Err(e) = validate_tool_args(&ctx.guard, &args) {
        // Short-circuit before any I/O reaches the tool.
        Err(e)
    } else {
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(WeaveError::Timeout("Worker terminated".into())),
            dispatched = tokio::time::timeout(
                ctx.rpc_timeout,
                ctx.mcp.call_tool(&server, &tool, args),
            ) => match dispatched {
                Ok(result) => result,
                Err(_) => Err(WeaveError::Timeout(format!(
                    "rpc to {} exceeded {} ms",
                    subject,
                    ctx.rpc_timeout.as_millis()
                ))),
            },
        }
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    let (success, result, error) = match outcome {
        Ok(value) => (true, Some(value), None),
        Err(e) => {
            debug!(tool = %subject, error = %e, "sandbox rpc failed");
            (false, None, Some(e.to_string()))
        }
    };

    ctx.sink.lock().push(TraceEvent::end(
        ctx.workflow_id,
        TraceEventType::ToolEnd,
        id,
        ctx.parent,
        subject,
        success,
        duration_ms,
        error.clone(),
    ));

    let _ = ctx
        .reply
        .send(BridgeMessage::RpcResult {
            id,
            success,
            result,
            error,
        })
        .await;
}
