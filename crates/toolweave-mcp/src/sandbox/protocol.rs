//! Sandbox RPC wire protocol.
//!
//! JSON-serializable messages over a channel; the transport is whatever
//! the worker backend provides. The correlation `id` of an `rpc_call`
//! doubles as the trace id of the recorded span.

use serde::{Deserialize, Serialize};
use toolweave_core::{ToolDefinition, TraceId};

/// Bridge-to-worker messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    Init {
        code: String,
        tool_definitions: Vec<ToolDefinition>,
        #[serde(default)]
        context: Option<serde_json::Value>,
    },
    RpcResult {
        id: TraceId,
        success: bool,
        #[serde(default)]
        result: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Worker-to-bridge messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    RpcCall {
        id: TraceId,
        server: String,
        tool: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    ExecutionComplete {
        success: bool,
        #[serde(default)]
        result: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<String>,
    },
}
