//! End-to-end scenarios through the assembled gateway.

use std::sync::Arc;

use toolweave_core::{
    EdgeSource, EdgeType, Intent, McpClient, SandboxConfig, Settings, StorageAdapter, TaskDag,
    TaskKind, TaskNode, ToolId, TraceEventType,
};
use toolweave_graph::MemoryStorage;
use toolweave_mcp::testing::ScriptedMcpClient;
use toolweave_mcp::{Gateway, InProcessWorker, RunOptions, RunOutcome, WorkerOutcome};
use toolweave_vector::HashingEmbedder;

const DIM: usize = 128;

struct Harness {
    gateway: Gateway,
    storage: Arc<MemoryStorage>,
    mcp: Arc<ScriptedMcpClient>,
    _workspace: tempfile::TempDir,
}

fn harness() -> Harness {
    harness_with_worker(InProcessWorker::completing(WorkerOutcome::ok(
        serde_json::json!("done"),
    )))
}

fn harness_with_worker(worker: InProcessWorker) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let workspace = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.sandbox = SandboxConfig {
        workspace_root: workspace.path().to_path_buf(),
        ..SandboxConfig::default()
    };
    let storage = Arc::new(MemoryStorage::new(DIM));
    let mcp = Arc::new(ScriptedMcpClient::new());
    let gateway = Gateway::new(
        storage.clone(),
        Arc::new(HashingEmbedder::new(DIM)),
        mcp.clone(),
        Arc::new(worker),
        settings,
    );
    Harness {
        gateway,
        storage,
        mcp,
        _workspace: workspace,
    }
}

fn tid(s: &str) -> ToolId {
    s.parse().unwrap()
}

async fn register_tool(h: &Harness, server: &str, name: &str, description: &str) {
    use toolweave_core::ToolDefinition;
    let mut existing = h.mcp.list_tools(server).await.unwrap();
    existing.push(ToolDefinition {
        server: server.into(),
        name: name.into(),
        description: description.into(),
        input_schema: serde_json::json!({"type": "object"}),
    });
    h.mcp.serve_tools(server, existing);
    h.gateway.register_server(server).await.unwrap();
}

fn chain_dag(tools: &[&str]) -> TaskDag {
    TaskDag {
        tasks: tools
            .iter()
            .enumerate()
            .map(|(i, tool)| TaskNode {
                id: format!("task_{}", i),
                kind: TaskKind::McpTool {
                    tool: tid(tool),
                    args: serde_json::json!({}),
                    side_effects: false,
                },
                depends_on: if i == 0 {
                    vec![]
                } else {
                    vec![format!("task_{}", i - 1)]
                },
            })
            .collect(),
    }
}

#[tokio::test]
async fn empty_graph_bootstrap_learns_sequence_edges() {
    let h = harness();
    register_tool(&h, "etl", "extract", "extract data from the source system").await;
    register_tool(&h, "etl", "transform", "transform the extracted records").await;
    register_tool(&h, "etl", "load", "load records into the warehouse").await;

    // With zero edges, retrieval is purely semantic.
    let hits = h
        .gateway
        .search_tools("extract data from the source", 3, &[])
        .await
        .unwrap();
    assert_eq!(hits[0].tool_id, tid("etl:extract"));
    for hit in &hits {
        assert_eq!(hit.graph_score, 0.0);
        assert!((hit.final_score - hit.semantic_score).abs() < 1e-6);
    }

    // One successful run of extract -> transform -> load.
    for tool in ["etl:extract", "etl:transform", "etl:load"] {
        h.mcp.respond(tool, serde_json::json!({"ok": true}));
    }
    let report = h
        .gateway
        .execute_dag(chain_dag(&["etl:extract", "etl:transform", "etl:load"]))
        .await
        .unwrap();
    assert!(report.execution.success);

    for (from, to) in [("etl:extract", "etl:transform"), ("etl:transform", "etl:load")] {
        let edge = h.gateway.graph().edge(&tid(from), &tid(to)).expect(from);
        assert_eq!(edge.edge_type, EdgeType::Sequence);
        assert_eq!(edge.edge_source, EdgeSource::Inferred);
        assert_eq!(edge.observed_count, 1);
        assert!((edge.confidence - 0.5).abs() < 1e-6);
    }
}

#[tokio::test]
async fn repeated_runs_promote_edges_monotonically() {
    let h = harness();
    for tool in ["s:a", "s:b", "s:c"] {
        h.mcp.respond(tool, serde_json::json!(1));
    }

    h.gateway
        .execute_dag(chain_dag(&["s:a", "s:b", "s:c"]))
        .await
        .unwrap();
    let after_one = h
        .gateway
        .graph()
        .edge(&tid("s:a"), &tid("s:b"))
        .unwrap()
        .confidence;

    for _ in 0..2 {
        h.gateway
            .execute_dag(chain_dag(&["s:a", "s:b", "s:c"]))
            .await
            .unwrap();
    }

    let edge = h.gateway.graph().edge(&tid("s:a"), &tid("s:b")).unwrap();
    assert_eq!(edge.observed_count, 3);
    assert_eq!(edge.edge_source, EdgeSource::Observed);
    assert!(edge.confidence > after_one);
    assert!(edge.confidence <= 1.0);
}

#[tokio::test]
async fn cycle_between_candidates_is_broken_toward_heavier_path() {
    let h = harness();
    let graph = h.gateway.graph();
    // x -> y three times as a dependency (combined weight 1.0 once
    // observed); y -> x once as a sequence (0.35 while inferred).
    for _ in 0..3 {
        graph
            .add_or_update_edge(&tid("s:x"), &tid("s:y"), EdgeType::Dependency, EdgeSource::Observed)
            .await
            .unwrap();
    }
    graph
        .add_or_update_edge(&tid("s:y"), &tid("s:x"), EdgeType::Sequence, EdgeSource::Observed)
        .await
        .unwrap();

    let dag = graph.build_dag(&[tid("s:x"), tid("s:y")]);
    assert_eq!(dag.tasks.len(), 2);
    assert!(dag.tasks[0].depends_on.is_empty());
    assert_eq!(dag.tasks[1].depends_on, vec!["task_0".to_string()]);
    toolweave_graph::validate_acyclic(&dag).unwrap();
}

#[tokio::test]
async fn hybrid_retrieval_lifts_hidden_intermediate() {
    let h = harness();
    register_tool(&h, "git", "clone", "clone a git repository from a remote").await;
    register_tool(&h, "npm", "install", "install node package dependencies").await;
    register_tool(&h, "ship", "release", "deploy the application to production").await;
    register_tool(&h, "weather", "forecast", "tomorrow weather forecast outlook").await;

    let graph = h.gateway.graph();
    for _ in 0..3 {
        graph
            .add_or_update_edge(
                &tid("git:clone"),
                &tid("npm:install"),
                EdgeType::Dependency,
                EdgeSource::Observed,
            )
            .await
            .unwrap();
        graph
            .add_or_update_edge(
                &tid("npm:install"),
                &tid("ship:release"),
                EdgeType::Dependency,
                EdgeSource::Observed,
            )
            .await
            .unwrap();
    }

    let context = vec![tid("git:clone"), tid("ship:release")];
    let hits = h
        .gateway
        .search_tools("deploy the application after cloning the repository", 3, &context)
        .await
        .unwrap();

    let install = hits
        .iter()
        .find(|hit| hit.tool_id == tid("npm:install"))
        .expect("hidden intermediate surfaced in top results");
    assert!(install.graph_score >= 0.7);
    assert!(!hits.iter().any(|hit| hit.tool_id == tid("weather:forecast")));
}

#[tokio::test]
async fn sandbox_path_escape_blocks_before_any_mcp_dispatch() {
    let worker = InProcessWorker::new(Arc::new(|ctx: toolweave_mcp::WorkerContext| {
        Box::pin(async move {
            match ctx
                .proxies
                .call_tool("fs", "read_file", serde_json::json!({"path": "../etc/passwd"}))
                .await
            {
                Ok(v) => WorkerOutcome::ok(v),
                Err(e) => WorkerOutcome::err(e),
            }
        })
    }));
    let h = harness_with_worker(worker);
    register_tool(&h, "fs", "read_file", "read a file from the workspace").await;
    h.mcp.respond("fs:read_file", serde_json::json!("file contents"));

    let report = h
        .gateway
        .execute_code("read the password file", "read('../etc/passwd')", None)
        .await
        .unwrap();
    assert!(!report.execution.success);

    // No MCP dispatch happened, yet the trace pair was recorded.
    assert_eq!(h.mcp.call_count("fs:read_file"), 0);
    let start = report
        .traces
        .iter()
        .find(|t| t.event_type == TraceEventType::ToolStart && t.subject_id == "fs:read_file")
        .expect("tool_start recorded");
    let end = report
        .traces
        .iter()
        .find(|t| t.event_type == TraceEventType::ToolEnd && t.trace_id == start.trace_id)
        .expect("tool_end recorded");
    assert_eq!(end.success, Some(false));
    assert!(end.error.as_ref().unwrap().to_lowercase().contains("traversal"));
}

#[tokio::test]
async fn successful_code_execution_promotes_and_short_circuits() {
    let h = harness();
    let intent = "summarize the weekly sales report";
    let code = "let rows = query(); summarize(rows);";

    // Build up reliability: repeated successful executions of the same
    // normalized code hit the same pattern hash.
    for _ in 0..6 {
        let report = h.gateway.execute_code(intent, code, None).await.unwrap();
        assert!(report.execution.success);
    }

    let matched = h
        .gateway
        .find_capability(intent)
        .await
        .unwrap()
        .expect("capability learned and reliable");
    assert_eq!(matched.capability.usage_count, 6);
    assert!(matched.capability.reliability() > 0.7);

    // The controller now prefers the stored capability.
    let outcome = h
        .gateway
        .run(&Intent::new(intent), RunOptions::default())
        .await
        .unwrap();
    match outcome {
        RunOutcome::CapabilityExecuted { name, success, .. } => {
            assert!(success);
            assert_eq!(name, matched.capability.name);
        }
        other => panic!("expected capability short-circuit, got {:?}", outcome_name(&other)),
    }
}

#[tokio::test]
async fn workflow_events_stream_in_order() {
    let h = harness();
    h.mcp.respond("s:a", serde_json::json!(1));
    h.mcp.respond("s:b", serde_json::json!(2));

    let mut events = h.gateway.events();
    let report = h
        .gateway
        .execute_dag(chain_dag(&["s:a", "s:b"]))
        .await
        .unwrap();
    assert!(report.execution.success);

    let mut topics = Vec::new();
    while let Ok(event) = events.try_recv() {
        topics.push(event.topic().to_string());
    }
    let dag_started = topics.iter().position(|t| t == "dag.started").unwrap();
    let dag_completed = topics.iter().position(|t| t == "dag.completed").unwrap();
    assert!(dag_started < dag_completed);
    assert!(topics.iter().filter(|t| *t == "task.started").count() >= 2);
    assert!(topics.iter().any(|t| t == "dag.layer_completed"));
}

#[tokio::test]
async fn low_confidence_returns_stub_instead_of_executing() {
    let h = harness();
    register_tool(&h, "misc", "thing", "an entirely unrelated utility").await;

    let outcome = h
        .gateway
        .run(
            &Intent::new("qqq zzz unmatched gibberish"),
            RunOptions {
                prefer_capabilities: false,
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();
    match outcome {
        RunOutcome::LowConfidence { suggestion } => {
            assert!(suggestion.confidence < 0.5);
            assert!(suggestion.warning.is_some());
            assert!(!suggestion.rationale.is_empty());
        }
        other => panic!("expected low-confidence stub, got {:?}", outcome_name(&other)),
    }
    assert!(h.mcp.calls().is_empty());
}

#[tokio::test]
async fn export_import_round_trip_preserves_edges() {
    let h = harness();
    for tool in ["s:a", "s:b", "s:c"] {
        h.mcp.respond(tool, serde_json::json!(1));
    }
    h.gateway
        .execute_dag(chain_dag(&["s:a", "s:b", "s:c"]))
        .await
        .unwrap();

    let exported = h.gateway.export_patterns();
    assert_eq!(exported.len(), 2);

    let h2 = harness();
    h2.gateway
        .import_patterns(&exported, toolweave_graph::ImportStrategy::Replace)
        .await
        .unwrap();
    let back = h2.gateway.export_patterns();
    assert_eq!(back.len(), exported.len());
    for (a, b) in exported.iter().zip(back.iter()) {
        assert_eq!(a.from, b.from);
        assert_eq!(a.to, b.to);
        assert_eq!(a.observed_count, b.observed_count);
    }

    // Merging an export into itself keeps the pair set stable.
    h.gateway
        .import_patterns(&exported, toolweave_graph::ImportStrategy::Merge)
        .await
        .unwrap();
    assert_eq!(h.gateway.export_patterns().len(), exported.len());
}

#[tokio::test]
async fn metrics_snapshot_reflects_graph_shape() {
    let h = harness();
    for tool in ["s:a", "s:b"] {
        h.mcp.respond(tool, serde_json::json!(1));
    }
    h.gateway.execute_dag(chain_dag(&["s:a", "s:b"])).await.unwrap();

    let snapshot = h.gateway.metrics_snapshot();
    assert_eq!(snapshot.nodes, 2);
    assert_eq!(snapshot.edges, 1);
    assert!((snapshot.density - 0.5).abs() < 1e-6);

    // Learning also recorded density samples in the metrics table.
    let since = chrono::Utc::now() - chrono::Duration::hours(1);
    let samples = h
        .storage
        .metrics_range("graph.density", since)
        .await
        .unwrap();
    assert!(!samples.is_empty());
}

fn outcome_name(outcome: &RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::CapabilityExecuted { .. } => "CapabilityExecuted",
        RunOutcome::Executed { .. } => "Executed",
        RunOutcome::Suggested { .. } => "Suggested",
        RunOutcome::LowConfidence { .. } => "LowConfidence",
    }
}
