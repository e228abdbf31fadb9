//! Learning updates: executions and code traces become graph edges.

use std::str::FromStr;

use toolweave_core::{
    EdgeSource, EdgeType, Result, ToolId, TraceEvent, TraceEventType, WorkflowExecution,
};
use tracing::debug;

use crate::graph::{ToolGraph, UpsertOutcome};

/// A curated seed edge loaded at bootstrap.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EdgeTemplate {
    pub from: ToolId,
    pub to: ToolId,
    #[serde(default = "EdgeTemplate::default_edge_type")]
    pub edge_type: EdgeType,
}

impl EdgeTemplate {
    fn default_edge_type() -> EdgeType {
        EdgeType::Dependency
    }
}

/// One completed span reassembled from a start/end trace pair.
struct Span {
    subject: ToolId,
    parent: Option<toolweave_core::TraceId>,
    trace_id: toolweave_core::TraceId,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl ToolGraph {
    /// Fold one finished workflow into the graph: every dependency edge
    /// that was actually executed becomes a `sequence` observation.
    pub async fn update_from_execution(&self, exec: &WorkflowExecution) -> Result<()> {
        let outcomes = self.with_state(|state| {
            let mut outcomes: Vec<UpsertOutcome> = Vec::new();
            for task in &exec.dag.tasks {
                let Some(to_tool) = task.tool_id() else {
                    continue;
                };
                for dep in &task.depends_on {
                    let Some(from_tool) = exec.dag.task(dep).and_then(|t| t.tool_id()) else {
                        continue;
                    };
                    if let Some(outcome) = state.upsert_edge(
                        from_tool,
                        to_tool,
                        EdgeType::Sequence,
                        EdgeSource::Observed,
                        None,
                    ) {
                        outcomes.push(outcome);
                    }
                }
            }
            state.note_updates(outcomes.len() as u32, self.config());
            outcomes
        });

        for outcome in &outcomes {
            self.publish_edge_event(outcome);
        }
        self.flush().await?;
        self.record_graph_metrics().await;
        Ok(())
    }

    /// Learn structure from sandbox traces: `contains` edges from a
    /// capability span to the calls it made, `sequence` edges between
    /// temporal siblings under one parent, and (for traces recorded
    /// before parent linkage existed) between top-level siblings.
    pub async fn update_from_code_traces(&self, traces: &[TraceEvent]) -> Result<()> {
        let spans = assemble_spans(traces);

        let outcomes = self.with_state(|state| {
            let mut outcomes: Vec<UpsertOutcome> = Vec::new();
            let mut upsert = |from: &ToolId, to: &ToolId, edge_type: EdgeType| {
                if let Some(o) =
                    state.upsert_edge(from, to, edge_type, EdgeSource::Observed, None)
                {
                    outcomes.push(o);
                }
            };

            // Group children under their parent span.
            let mut by_parent: Vec<(Option<toolweave_core::TraceId>, Vec<&Span>)> = Vec::new();
            for span in &spans {
                match by_parent.iter_mut().find(|(p, _)| *p == span.parent) {
                    Some((_, group)) => group.push(span),
                    None => by_parent.push((span.parent, vec![span])),
                }
            }

            for (parent, mut group) in by_parent {
                group.sort_by_key(|s| s.started_at);
                if let Some(parent_id) = parent {
                    if let Some(parent_subject) = spans
                        .iter()
                        .find(|s| s.trace_id == parent_id)
                        .map(|s| s.subject.clone())
                    {
                        for child in &group {
                            upsert(&parent_subject, &child.subject, EdgeType::Contains);
                        }
                    }
                }
                for pair in group.windows(2) {
                    upsert(&pair[0].subject, &pair[1].subject, EdgeType::Sequence);
                }
            }

            state.note_updates(outcomes.len() as u32, self.config());
            outcomes
        });

        for outcome in &outcomes {
            self.publish_edge_event(outcome);
        }
        self.flush().await?;
        self.record_graph_metrics().await;
        Ok(())
    }

    /// Seed the graph with curated templates. Template provenance never
    /// overrides edges that have been observed in the wild.
    pub async fn bootstrap_from_templates(&self, templates: &[EdgeTemplate]) -> Result<()> {
        let outcomes = self.with_state(|state| {
            let mut outcomes = Vec::new();
            for t in templates {
                if let Some(o) = state.upsert_edge(
                    &t.from,
                    &t.to,
                    t.edge_type,
                    EdgeSource::Template,
                    Some(0.5),
                ) {
                    outcomes.push(o);
                }
            }
            state.note_updates(outcomes.len() as u32, self.config());
            outcomes
        });
        debug!(count = outcomes.len(), "templates bootstrapped");
        for outcome in &outcomes {
            self.publish_edge_event(outcome);
        }
        self.flush().await
    }
}

/// Pair start/end events by trace id, keeping only spans that completed
/// successfully; a failed call is not evidence of a useful ordering.
fn assemble_spans(traces: &[TraceEvent]) -> Vec<Span> {
    let mut spans = Vec::new();
    for start in traces.iter().filter(|t| t.event_type.is_start()) {
        let Ok(subject) = ToolId::from_str(&start.subject_id) else {
            debug!(subject = %start.subject_id, "trace subject is not a tool id");
            continue;
        };
        let end = traces.iter().find(|t| {
            t.trace_id == start.trace_id
                && matches!(
                    t.event_type,
                    TraceEventType::ToolEnd | TraceEventType::CapabilityEnd
                )
        });
        let Some(end) = end else { continue };
        if end.success != Some(true) {
            continue;
        }
        spans.push(Span {
            subject,
            parent: start.parent_trace_id,
            trace_id: start.trace_id,
            started_at: start.ts,
        });
    }
    spans
}
