//! Worker backends for the sandbox bridge.
//!
//! The bridge is backend-agnostic: anything that can run code with zero
//! ambient authority and speak the RPC protocol over a pair of channels
//! qualifies (an OS process under seccomp, a WASM instance, or the
//! in-runtime worker below). Proxies never carry host references; the
//! channel pair is the only connection to the outside.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use toolweave_core::{Result, ToolDefinition, TraceId, WeaveError};
use uuid::Uuid;

use super::protocol::{BridgeMessage, WorkerMessage};

/// Channel pair handed back from `spawn`. Dropping `to_worker` or
/// aborting `task` is the hard-kill path.
pub struct WorkerChannels {
    pub to_worker: mpsc::Sender<BridgeMessage>,
    pub from_worker: mpsc::Receiver<WorkerMessage>,
    pub task: tokio::task::JoinHandle<()>,
}

/// Port to an isolated execution backend.
#[async_trait]
pub trait SandboxWorker: Send + Sync {
    /// Start one worker for one task. The init payload carries the code,
    /// the tool allowlist and the optional context map.
    async fn spawn(
        &self,
        code: String,
        tool_definitions: Vec<ToolDefinition>,
        context: Option<serde_json::Value>,
    ) -> Result<WorkerChannels>;
}

/// What a worker program reports when it finishes.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl WorkerOutcome {
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Handle a worker program uses to reach its injected tool proxies.
/// Every call becomes an `rpc_call` on the wire.
#[derive(Clone)]
pub struct ToolProxies {
    tools: Arc<Vec<ToolDefinition>>,
    tx: mpsc::Sender<WorkerMessage>,
    pending: Arc<Mutex<HashMap<TraceId, oneshot::Sender<RpcReply>>>>,
}

#[derive(Debug, Clone)]
struct RpcReply {
    success: bool,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

impl ToolProxies {
    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.tools
    }

    /// Call one allowlisted tool; resolves when the bridge replies or
    /// errors when the bridge goes away.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        args: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, String> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        self.tx
            .send(WorkerMessage::RpcCall {
                id,
                server: server.to_string(),
                tool: tool.to_string(),
                args,
            })
            .await
            .map_err(|_| "Worker terminated".to_string())?;
        match rx.await {
            Ok(reply) if reply.success => Ok(reply.result.unwrap_or(serde_json::Value::Null)),
            Ok(reply) => Err(reply.error.unwrap_or_else(|| "tool call failed".into())),
            Err(_) => Err("Worker terminated".to_string()),
        }
    }
}

/// The execution context handed to an in-process worker program.
pub struct WorkerContext {
    pub code: String,
    pub context: Option<serde_json::Value>,
    pub proxies: ToolProxies,
}

pub type WorkerProgram =
    Arc<dyn Fn(WorkerContext) -> BoxFuture<'static, WorkerOutcome> + Send + Sync>;

/// In-runtime worker on its own task, reachable only through the
/// message channels. It does not interpret source text itself; the
/// embedder supplies the program to run against the injected proxies,
/// which keeps this backend useful for local deployments and for
/// exercising the full bridge contract in tests.
pub struct InProcessWorker {
    program: WorkerProgram,
}

impl InProcessWorker {
    pub fn new(program: WorkerProgram) -> Self {
        Self { program }
    }

    /// A worker whose program immediately completes with the outcome.
    pub fn completing(outcome: WorkerOutcome) -> Self {
        Self::new(Arc::new(move |_| {
            let outcome = outcome.clone();
            Box::pin(async move { outcome })
        }))
    }
}

#[async_trait]
impl SandboxWorker for InProcessWorker {
    async fn spawn(
        &self,
        code: String,
        tool_definitions: Vec<ToolDefinition>,
        context: Option<serde_json::Value>,
    ) -> Result<WorkerChannels> {
        let (to_worker_tx, mut to_worker_rx) = mpsc::channel::<BridgeMessage>(64);
        let (from_worker_tx, from_worker_rx) = mpsc::channel::<WorkerMessage>(64);

        let pending: Arc<Mutex<HashMap<TraceId, oneshot::Sender<RpcReply>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Route rpc_result messages back to their awaiting call sites.
        let router_pending = pending.clone();
        let router = tokio::spawn(async move {
            while let Some(message) = to_worker_rx.recv().await {
                if let BridgeMessage::RpcResult {
                    id,
                    success,
                    result,
                    error,
                } = message
                {
                    if let Some(waiter) = router_pending.lock().remove(&id) {
                        let _ = waiter.send(RpcReply {
                            success,
                            result,
                            error,
                        });
                    }
                }
            }
            // Bridge hung up: fail anything still waiting.
            for (_, waiter) in router_pending.lock().drain() {
                drop(waiter);
            }
        });

        let proxies = ToolProxies {
            tools: Arc::new(tool_definitions),
            tx: from_worker_tx.clone(),
            pending,
        };
        let program = self.program.clone();
        let task = tokio::spawn(async move {
            let outcome = program(WorkerContext {
                code,
                context,
                proxies,
            })
            .await;
            let _ = from_worker_tx
                .send(WorkerMessage::ExecutionComplete {
                    success: outcome.success,
                    result: outcome.result,
                    error: outcome.error,
                })
                .await;
            router.abort();
        });

        Ok(WorkerChannels {
            to_worker: to_worker_tx,
            from_worker: from_worker_rx,
            task,
        })
    }
}

/// Classify a worker-reported error string into the sandbox taxonomy.
pub fn classify_worker_error(message: &str) -> WeaveError {
    let lowered = message.to_lowercase();
    if lowered.starts_with("syntaxerror") || lowered.contains("syntax error") {
        WeaveError::Syntax(message.to_string())
    } else if lowered.contains("timeout") {
        WeaveError::Timeout(message.to_string())
    } else if lowered.contains("memory") {
        WeaveError::Memory(message.to_string())
    } else if lowered.contains("permission") {
        WeaveError::Permission(message.to_string())
    } else if lowered.contains("security") {
        WeaveError::Security(message.to_string())
    } else if lowered.contains("resource limit") {
        WeaveError::ResourceLimit(message.to_string())
    } else if lowered.contains("not serializable") || lowered.contains("serialization") {
        WeaveError::Serialization(message.to_string())
    } else {
        WeaveError::Runtime(message.to_string())
    }
}
