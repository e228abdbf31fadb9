//! Tool registration from MCP servers.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use toolweave_core::{McpClient, Result, StorageAdapter, Tool, ToolId, WeaveError};
use toolweave_vector::VectorIndex;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationSummary {
    pub registered: usize,
    pub reembedded: usize,
    pub deactivated: usize,
}

/// Pulls tool listings from MCP servers into the persistent mirror.
/// Descriptions are re-embedded only when their text actually changed;
/// tools missing from a re-registration are marked inactive, their ids
/// are never reused.
pub struct ToolRegistry {
    mcp: Arc<dyn McpClient>,
    storage: Arc<dyn StorageAdapter>,
    index: Arc<VectorIndex>,
}

impl ToolRegistry {
    pub fn new(
        mcp: Arc<dyn McpClient>,
        storage: Arc<dyn StorageAdapter>,
        index: Arc<VectorIndex>,
    ) -> Self {
        Self {
            mcp,
            storage,
            index,
        }
    }

    pub async fn register_server(&self, server_id: &str) -> Result<RegistrationSummary> {
        let definitions = self.mcp.list_tools(server_id).await?;
        let mut summary = RegistrationSummary::default();
        let mut seen: HashSet<ToolId> = HashSet::new();

        for definition in definitions {
            let id = ToolId::new(server_id, &definition.name);
            seen.insert(id.clone());

            // Keep accumulated metadata from an earlier registration.
            let previous = self.storage.get_tool(&id).await?;
            let tool = Tool {
                id: id.clone(),
                server_id: server_id.to_string(),
                name: definition.name.clone(),
                description: definition.description.clone(),
                input_schema: definition.input_schema.clone(),
                metadata: previous.map(|p| p.metadata).unwrap_or_default(),
                active: true,
            };
            self.storage.upsert_tool(tool.clone()).await?;
            summary.registered += 1;
            if self.index.index_tool(&tool).await? {
                summary.reembedded += 1;
            }
        }

        for mut tool in self
            .storage
            .list_tools()
            .await?
            .into_iter()
            .filter(|t| t.server_id == server_id && t.active && !seen.contains(&t.id))
        {
            tool.active = false;
            self.storage.upsert_tool(tool).await?;
            summary.deactivated += 1;
        }

        info!(
            server = server_id,
            registered = summary.registered,
            reembedded = summary.reembedded,
            deactivated = summary.deactivated,
            "server registered"
        );
        Ok(summary)
    }

    pub async fn get_tool_schema(&self, tool_id: &ToolId) -> Result<serde_json::Value> {
        match self.storage.get_tool(tool_id).await? {
            Some(tool) => Ok(tool.input_schema),
            None => Err(WeaveError::NotFound(format!("tool {}", tool_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedMcpClient;
    use toolweave_core::ToolDefinition;
    use toolweave_graph::MemoryStorage;
    use toolweave_vector::HashingEmbedder;

    const DIM: usize = 64;

    fn registry(mcp: Arc<ScriptedMcpClient>) -> (Arc<MemoryStorage>, ToolRegistry) {
        let storage = Arc::new(MemoryStorage::new(DIM));
        let index = Arc::new(VectorIndex::new(
            storage.clone(),
            Arc::new(HashingEmbedder::new(DIM)),
        ));
        (storage.clone(), ToolRegistry::new(mcp, storage, index))
    }

    fn definition(name: &str, description: &str) -> ToolDefinition {
        ToolDefinition {
            server: "fs".into(),
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    #[tokio::test]
    async fn first_registration_embeds_everything() {
        let mcp = Arc::new(ScriptedMcpClient::new());
        mcp.serve_tools(
            "fs",
            vec![
                definition("read_file", "read a file from disk"),
                definition("write_file", "write a file to disk"),
            ],
        );
        let (storage, registry) = registry(mcp);

        let summary = registry.register_server("fs").await.unwrap();
        assert_eq!(summary.registered, 2);
        assert_eq!(summary.reembedded, 2);
        assert_eq!(summary.deactivated, 0);
        assert_eq!(storage.list_tools().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unchanged_descriptions_are_not_reembedded() {
        let mcp = Arc::new(ScriptedMcpClient::new());
        mcp.serve_tools("fs", vec![definition("read_file", "read a file")]);
        let (_storage, registry) = registry(mcp.clone());

        registry.register_server("fs").await.unwrap();
        let again = registry.register_server("fs").await.unwrap();
        assert_eq!(again.reembedded, 0);

        mcp.serve_tools("fs", vec![definition("read_file", "read any file, with offsets")]);
        let changed = registry.register_server("fs").await.unwrap();
        assert_eq!(changed.reembedded, 1);
    }

    #[tokio::test]
    async fn missing_tools_are_deactivated_not_deleted() {
        let mcp = Arc::new(ScriptedMcpClient::new());
        mcp.serve_tools(
            "fs",
            vec![
                definition("read_file", "read a file"),
                definition("stat", "stat a path"),
            ],
        );
        let (storage, registry) = registry(mcp.clone());
        registry.register_server("fs").await.unwrap();

        mcp.serve_tools("fs", vec![definition("read_file", "read a file")]);
        let summary = registry.register_server("fs").await.unwrap();
        assert_eq!(summary.deactivated, 1);

        let stat = storage
            .get_tool(&ToolId::new("fs", "stat"))
            .await
            .unwrap()
            .unwrap();
        assert!(!stat.active);
    }

    #[tokio::test]
    async fn schema_lookup_comes_from_the_mirror() {
        let mcp = Arc::new(ScriptedMcpClient::new());
        mcp.serve_tools("fs", vec![definition("read_file", "read a file")]);
        let (_storage, registry) = registry(mcp);
        registry.register_server("fs").await.unwrap();

        let schema = registry
            .get_tool_schema(&ToolId::new("fs", "read_file"))
            .await
            .unwrap();
        assert_eq!(schema["type"], "object");
        assert!(registry
            .get_tool_schema(&ToolId::new("fs", "missing"))
            .await
            .is_err());
    }
}
