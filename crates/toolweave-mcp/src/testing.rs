//! Test doubles shared by unit and integration tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use toolweave_core::{McpClient, Result, ToolDefinition, WeaveError};

/// An MCP client scripted per tool id (`server:name`): canned
/// responses, canned failures, bounded failure runs, and a call log.
#[derive(Default)]
pub struct ScriptedMcpClient {
    responses: Mutex<HashMap<String, serde_json::Value>>,
    failures: Mutex<HashMap<String, String>>,
    failures_remaining: Mutex<HashMap<String, u32>>,
    delays_ms: Mutex<HashMap<String, u64>>,
    servers: Mutex<HashMap<String, Vec<ToolDefinition>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedMcpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, tool: &str, value: serde_json::Value) {
        self.responses.lock().insert(tool.to_string(), value);
    }

    /// Fail every call to `tool`.
    pub fn fail(&self, tool: &str, message: &str) {
        self.failures
            .lock()
            .insert(tool.to_string(), message.to_string());
    }

    /// Fail the next `times` calls, then fall through to any canned
    /// response.
    pub fn fail_times(&self, tool: &str, message: &str, times: u32) {
        self.failures
            .lock()
            .insert(tool.to_string(), message.to_string());
        self.failures_remaining
            .lock()
            .insert(tool.to_string(), times);
    }

    /// Delay every call to `tool` before responding.
    pub fn delay(&self, tool: &str, ms: u64) {
        self.delays_ms.lock().insert(tool.to_string(), ms);
    }

    pub fn serve_tools(&self, server: &str, tools: Vec<ToolDefinition>) {
        self.servers.lock().insert(server.to_string(), tools);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, tool: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == tool).count()
    }
}

#[async_trait]
impl McpClient for ScriptedMcpClient {
    async fn call_tool(
        &self,
        server: &str,
        name: &str,
        _args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let key = format!("{}:{}", server, name);
        self.calls.lock().push(key.clone());

        let delay = self.delays_ms.lock().get(&key).copied();
        if let Some(ms) = delay {
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        }

        let should_fail = {
            let mut remaining = self.failures_remaining.lock();
            match remaining.get_mut(&key) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                Some(_) => false,
                None => self.failures.lock().contains_key(&key),
            }
        };

        if should_fail {
            let message = self
                .failures
                .lock()
                .get(&key)
                .cloned()
                .unwrap_or_else(|| "scripted failure".into());
            return Err(WeaveError::ToolUnavailable(message));
        }

        self.responses
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| WeaveError::ToolUnavailable(format!("no script for {}", key)))
    }

    async fn list_tools(&self, server: &str) -> Result<Vec<ToolDefinition>> {
        Ok(self.servers.lock().get(server).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_responses_and_failures() {
        let mcp = ScriptedMcpClient::new();
        mcp.respond("s:ok", serde_json::json!(1));
        mcp.fail("s:bad", "nope");

        assert_eq!(
            mcp.call_tool("s", "ok", serde_json::json!({})).await.unwrap(),
            serde_json::json!(1)
        );
        assert!(mcp.call_tool("s", "bad", serde_json::json!({})).await.is_err());
        assert_eq!(mcp.call_count("s:ok"), 1);
    }

    #[tokio::test]
    async fn bounded_failures_then_success() {
        let mcp = ScriptedMcpClient::new();
        mcp.fail_times("s:flaky", "transient", 1);
        mcp.respond("s:flaky", serde_json::json!("up"));

        assert!(mcp.call_tool("s", "flaky", serde_json::json!({})).await.is_err());
        assert_eq!(
            mcp.call_tool("s", "flaky", serde_json::json!({})).await.unwrap(),
            serde_json::json!("up")
        );
    }
}
