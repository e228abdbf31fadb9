use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type ExecutionId = Uuid;
pub type TraceId = Uuid;
pub type CapabilityId = Uuid;
pub type PredictionId = Uuid;

/// Globally unique tool identifier in `server:name` form.
///
/// Identifiers are never reused; a tool removed from a server is marked
/// inactive rather than deleted. `Ord` makes score ties deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolId(String);

impl ToolId {
    pub fn new(server: &str, name: &str) -> Self {
        Self(format!("{}:{}", server, name))
    }

    pub fn server(&self) -> &str {
        self.0.split_once(':').map(|(s, _)| s).unwrap_or(&self.0)
    }

    pub fn name(&self) -> &str {
        self.0.split_once(':').map(|(_, n)| n).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ToolId {
    type Err = crate::WeaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((server, name)) if !server.is_empty() && !name.is_empty() => {
                Ok(Self(s.to_string()))
            }
            _ => Err(crate::WeaveError::Validation(format!(
                "tool id must be server:name, got {:?}",
                s
            ))),
        }
    }
}

/// A tool registered from an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub id: ToolId,
    pub server_id: String,
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl Tool {
    pub fn new(server_id: &str, name: &str, description: &str) -> Self {
        Self {
            id: ToolId::new(server_id, name),
            server_id: server_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            input_schema: serde_json::json!({ "type": "object" }),
            metadata: HashMap::new(),
            active: true,
        }
    }

    /// Hash of the embeddable text; embeddings are regenerated only when
    /// this changes.
    pub fn text_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.description.as_bytes());
        hex_string(&hasher.finalize())
    }

    pub fn embedding_text(&self) -> String {
        format!("{}: {}", self.name, self.description)
    }
}

pub(crate) fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Serializable tool description injected into sandbox workers. Carries
/// no handles back into the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub server: String,
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

impl From<&Tool> for ToolDefinition {
    fn from(tool: &Tool) -> Self {
        Self {
            server: tool.server_id.clone(),
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEmbedding {
    pub tool_id: ToolId,
    pub vector: Vec<f32>,
    pub text_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Contains,
    Sequence,
    Dependency,
}

impl EdgeType {
    pub fn type_weight(&self) -> f32 {
        match self {
            EdgeType::Contains => 0.8,
            EdgeType::Sequence => 0.5,
            EdgeType::Dependency => 1.0,
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EdgeType::Contains => "contains",
            EdgeType::Sequence => "sequence",
            EdgeType::Dependency => "dependency",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for EdgeType {
    type Err = crate::WeaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "contains" => Ok(EdgeType::Contains),
            "sequence" => Ok(EdgeType::Sequence),
            "dependency" => Ok(EdgeType::Dependency),
            other => Err(crate::WeaveError::Validation(format!(
                "unknown edge type {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeSource {
    Observed,
    Inferred,
    Template,
}

impl EdgeSource {
    pub fn modifier(&self) -> f32 {
        match self {
            EdgeSource::Observed => 1.0,
            EdgeSource::Inferred => 0.7,
            EdgeSource::Template => 0.5,
        }
    }
}

impl fmt::Display for EdgeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EdgeSource::Observed => "observed",
            EdgeSource::Inferred => "inferred",
            EdgeSource::Template => "template",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for EdgeSource {
    type Err = crate::WeaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "observed" => Ok(EdgeSource::Observed),
            "inferred" => Ok(EdgeSource::Inferred),
            "template" => Ok(EdgeSource::Template),
            other => Err(crate::WeaveError::Validation(format!(
                "unknown edge source {:?}",
                other
            ))),
        }
    }
}

/// Confidence floor after any observation.
pub const MIN_EDGE_CONFIDENCE: f32 = 0.05;

/// Confidence assigned to an edge on its first observation.
pub const INITIAL_EDGE_CONFIDENCE: f32 = 0.5;

/// Fraction of the remaining headroom gained per repeat observation.
pub const CONFIDENCE_GROWTH: f32 = 0.3;

/// Observation count at which an inferred edge is promoted to observed.
pub const OBSERVED_PROMOTION_COUNT: u32 = 3;

/// A directed edge between two tools in the tool graph. `(from, to)` is
/// unique; repeated observations mutate the row in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEdge {
    pub from: ToolId,
    pub to: ToolId,
    pub edge_type: EdgeType,
    pub edge_source: EdgeSource,
    pub confidence: f32,
    pub observed_count: u32,
    pub last_observed: DateTime<Utc>,
}

impl ToolEdge {
    pub fn new(from: ToolId, to: ToolId, edge_type: EdgeType, edge_source: EdgeSource) -> Self {
        Self {
            from,
            to,
            edge_type,
            edge_source,
            confidence: INITIAL_EDGE_CONFIDENCE,
            observed_count: 1,
            last_observed: Utc::now(),
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(MIN_EDGE_CONFIDENCE, 1.0);
        self
    }

    /// Authoritative weight for path finding, Adamic-Adar and cycle
    /// breaking: `type_weight * source_modifier`.
    pub fn combined_weight(&self) -> f32 {
        self.edge_type.type_weight() * self.edge_source.modifier()
    }

    /// Record one more observation: bounded confidence growth toward 1,
    /// count increment, and `inferred -> observed` promotion at the
    /// threshold. Both mutations are monotone, so concurrent merges
    /// commute on the fixed point.
    pub fn observe(&mut self) {
        self.observed_count = self.observed_count.saturating_add(1);
        self.confidence = (self.confidence + (1.0 - self.confidence) * CONFIDENCE_GROWTH)
            .clamp(MIN_EDGE_CONFIDENCE, 1.0);
        if self.edge_source == EdgeSource::Inferred
            && self.observed_count >= OBSERVED_PROMOTION_COUNT
        {
            self.edge_source = EdgeSource::Observed;
        }
        self.last_observed = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventType {
    ToolStart,
    ToolEnd,
    CapabilityStart,
    CapabilityEnd,
}

impl TraceEventType {
    pub fn is_start(&self) -> bool {
        matches!(
            self,
            TraceEventType::ToolStart | TraceEventType::CapabilityStart
        )
    }
}

/// Append-only record of a tool or capability span. A `start`/`end` pair
/// shares one `trace_id`; `parent_trace_id` links form a forest within a
/// single workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub workflow_id: ExecutionId,
    pub event_type: TraceEventType,
    pub trace_id: TraceId,
    pub parent_trace_id: Option<TraceId>,
    pub subject_id: String,
    pub ts: DateTime<Utc>,
    pub success: Option<bool>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl TraceEvent {
    pub fn start(
        workflow_id: ExecutionId,
        event_type: TraceEventType,
        trace_id: TraceId,
        parent_trace_id: Option<TraceId>,
        subject_id: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id,
            event_type,
            trace_id,
            parent_trace_id,
            subject_id: subject_id.into(),
            ts: Utc::now(),
            success: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn end(
        workflow_id: ExecutionId,
        event_type: TraceEventType,
        trace_id: TraceId,
        parent_trace_id: Option<TraceId>,
        subject_id: impl Into<String>,
        success: bool,
        duration_ms: u64,
        error: Option<String>,
    ) -> Self {
        Self {
            workflow_id,
            event_type,
            trace_id,
            parent_trace_id,
            subject_id: subject_id.into(),
            ts: Utc::now(),
            success: Some(success),
            duration_ms: Some(duration_ms),
            error,
        }
    }
}

/// Immutable record of one top-level workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: ExecutionId,
    pub intent_text: String,
    pub dag: TaskDag,
    pub success: bool,
    pub execution_time_ms: u64,
    pub error_message: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// Closed sum of task payloads. The executor dispatches on the tag; there
/// is no open plugin surface here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    McpTool {
        tool: ToolId,
        #[serde(default)]
        args: serde_json::Value,
        /// Tasks flagged with side effects are never retried.
        #[serde(default)]
        side_effects: bool,
    },
    CodeExecution {
        code: String,
        #[serde(default)]
        context: Option<serde_json::Value>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    #[serde(flatten)]
    pub kind: TaskKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl TaskNode {
    pub fn tool_id(&self) -> Option<&ToolId> {
        match &self.kind {
            TaskKind::McpTool { tool, .. } => Some(tool),
            TaskKind::CodeExecution { .. } => None,
        }
    }
}

/// A dependency graph of tasks. Construction does not guarantee
/// acyclicity; callers validate with Kahn before execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDag {
    pub tasks: Vec<TaskNode>,
}

impl TaskDag {
    pub fn task(&self, id: &str) -> Option<&TaskNode> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn tool_ids(&self) -> Vec<ToolId> {
        self.tasks.iter().filter_map(|t| t.tool_id().cloned()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
    /// Skipped because an upstream dependency failed; not an error in
    /// itself and never crashes the workflow.
    FailedSafe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub tool: Option<ToolId>,
    pub status: TaskStatus,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

/// A reusable intent-to-code pattern, matched by semantic similarity
/// weighted by observed reliability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub capability_id: CapabilityId,
    pub name: String,
    pub intent_embedding: Vec<f32>,
    pub code: String,
    pub parameters_schema: serde_json::Value,
    pub usage_count: u32,
    pub success_count: u32,
    pub last_used: DateTime<Utc>,
    pub pattern_hash: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Capability {
    /// Success ratio with Laplace smoothing while the sample is small.
    pub fn reliability(&self) -> f32 {
        if self.usage_count == 0 {
            return 0.5;
        }
        if self.usage_count < 5 {
            (self.success_count as f32 + 1.0) / (self.usage_count as f32 + 2.0)
        } else {
            self.success_count as f32 / self.usage_count as f32
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionSource {
    Community,
    CoOccurrence,
    Hint,
    Learned,
}

/// A speculated next tool; `was_correct` is resolved by the learning
/// loop once the workflow that spawned it completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub prediction_id: PredictionId,
    pub workflow_id: Option<ExecutionId>,
    pub source: PredictionSource,
    pub tool_id: ToolId,
    pub confidence: f32,
    pub was_correct: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric_name: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl MetricSample {
    pub fn now(metric_name: &str, value: f64) -> Self {
        Self {
            metric_name: metric_name.to_string(),
            timestamp: Utc::now(),
            value,
            metadata: HashMap::new(),
        }
    }
}

/// A natural-language request plus the tools already in play.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Intent {
    pub text: String,
    #[serde(default)]
    pub context_tools: Vec<ToolId>,
}

impl Intent {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context_tools: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: Vec<ToolId>) -> Self {
        self.context_tools = context;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_id_splits_server_and_name() {
        let id: ToolId = "fs:read_file".parse().unwrap();
        assert_eq!(id.server(), "fs");
        assert_eq!(id.name(), "read_file");
        assert_eq!(id.to_string(), "fs:read_file");
    }

    #[test]
    fn tool_id_rejects_malformed() {
        assert!("read_file".parse::<ToolId>().is_err());
        assert!(":oops".parse::<ToolId>().is_err());
        assert!("fs:".parse::<ToolId>().is_err());
    }

    #[test]
    fn combined_weight_table() {
        let e = ToolEdge::new(
            ToolId::new("a", "x"),
            ToolId::new("b", "y"),
            EdgeType::Dependency,
            EdgeSource::Template,
        );
        assert!((e.combined_weight() - 0.5).abs() < 1e-6);

        let e = ToolEdge::new(
            ToolId::new("a", "x"),
            ToolId::new("b", "y"),
            EdgeType::Sequence,
            EdgeSource::Inferred,
        );
        assert!((e.combined_weight() - 0.35).abs() < 1e-6);
    }

    #[test]
    fn observation_grows_confidence_monotonically() {
        let mut e = ToolEdge::new(
            ToolId::new("a", "x"),
            ToolId::new("b", "y"),
            EdgeType::Sequence,
            EdgeSource::Inferred,
        );
        assert_eq!(e.observed_count, 1);
        let mut last = e.confidence;
        for _ in 0..50 {
            e.observe();
            assert!(e.confidence >= last);
            assert!(e.confidence <= 1.0);
            last = e.confidence;
        }
        assert_eq!(e.observed_count, 51);
    }

    #[test]
    fn inferred_promotes_to_observed_at_three() {
        let mut e = ToolEdge::new(
            ToolId::new("a", "x"),
            ToolId::new("b", "y"),
            EdgeType::Sequence,
            EdgeSource::Inferred,
        );
        e.observe();
        assert_eq!(e.edge_source, EdgeSource::Inferred);
        e.observe();
        assert_eq!(e.observed_count, 3);
        assert_eq!(e.edge_source, EdgeSource::Observed);
    }

    #[test]
    fn capability_reliability_smoothing() {
        let mut cap = Capability {
            capability_id: Uuid::new_v4(),
            name: "t".into(),
            intent_embedding: vec![],
            code: String::new(),
            parameters_schema: serde_json::json!({}),
            usage_count: 2,
            success_count: 2,
            last_used: Utc::now(),
            pattern_hash: "h".into(),
            active: true,
        };
        // Laplace keeps a small sample away from 1.0.
        assert!(cap.reliability() < 1.0);
        cap.usage_count = 10;
        cap.success_count = 10;
        assert!((cap.reliability() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn task_dag_serializes_with_flattened_kind() {
        let dag = TaskDag {
            tasks: vec![TaskNode {
                id: "task_0".into(),
                kind: TaskKind::McpTool {
                    tool: ToolId::new("git", "clone"),
                    args: serde_json::json!({}),
                    side_effects: false,
                },
                depends_on: vec![],
            }],
        };
        let json = serde_json::to_value(&dag).unwrap();
        assert_eq!(json["tasks"][0]["kind"], "mcp_tool");
        let back: TaskDag = serde_json::from_value(json).unwrap();
        assert_eq!(back.tasks[0].id, "task_0");
    }
}
