use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use toolweave_core::{
    EdgeSource, EdgeType, EventBus, GatewayEvent, GraphConfig, MetricSample, Result,
    StorageAdapter, TaskDag, TaskKind, TaskNode, ToolEdge, ToolId,
};
use tracing::{debug, info, warn};

use crate::algo;
use crate::dag::{break_cycles, CandidateEdge};

/// The canonical in-process tool graph with a persistent mirror.
///
/// All structural writes go through this engine; the storage adapter is
/// only written after the in-memory batch succeeds. Reads are lock-free
/// snapshots under a read guard; writes serialize on the single write
/// lock, which is the per-edge critical section concurrent workflows
/// rely on.
pub struct ToolGraph {
    state: RwLock<GraphState>,
    pub(crate) storage: Arc<dyn StorageAdapter>,
    bus: EventBus,
    config: GraphConfig,
}

pub(crate) struct GraphState {
    pub(crate) index_of: FxHashMap<ToolId, usize>,
    pub(crate) ids: Vec<ToolId>,
    /// Out-adjacency with full edge attributes; `adj_in` only mirrors
    /// the reverse direction for neighbor walks.
    pub(crate) adj_out: Vec<FxHashMap<usize, ToolEdge>>,
    pub(crate) adj_in: Vec<FxHashSet<usize>>,
    pub(crate) edge_count: usize,
    pagerank: Vec<f32>,
    max_pagerank: f32,
    communities: Vec<usize>,
    updates_since_recompute: u32,
    /// Edges mutated since the last flush, keyed by pair to coalesce
    /// repeated updates within one batch.
    pub(crate) pending: FxHashMap<(ToolId, ToolId), ToolEdge>,
}

pub(crate) struct UpsertOutcome {
    pub created: bool,
    pub from: ToolId,
    pub to: ToolId,
    pub confidence: f32,
}

impl GraphState {
    fn new() -> Self {
        Self {
            index_of: FxHashMap::default(),
            ids: Vec::new(),
            adj_out: Vec::new(),
            adj_in: Vec::new(),
            edge_count: 0,
            pagerank: Vec::new(),
            max_pagerank: 0.0,
            communities: Vec::new(),
            updates_since_recompute: 0,
            pending: FxHashMap::default(),
        }
    }

    pub(crate) fn ensure_node(&mut self, id: &ToolId) -> usize {
        if let Some(&i) = self.index_of.get(id) {
            return i;
        }
        let i = self.ids.len();
        self.ids.push(id.clone());
        self.index_of.insert(id.clone(), i);
        self.adj_out.push(FxHashMap::default());
        self.adj_in.push(FxHashSet::default());
        i
    }

    pub(crate) fn index(&self, id: &ToolId) -> Option<usize> {
        self.index_of.get(id).copied()
    }

    pub(crate) fn density(&self) -> f32 {
        let n = self.ids.len();
        if n < 2 {
            return 0.0;
        }
        self.edge_count as f32 / (n as f32 * (n as f32 - 1.0))
    }

    pub(crate) fn weighted_adj(&self) -> Vec<FxHashMap<usize, f32>> {
        self.adj_out
            .iter()
            .map(|targets| {
                targets
                    .iter()
                    .map(|(&v, edge)| (v, edge.combined_weight()))
                    .collect()
            })
            .collect()
    }

    /// Upsert one edge following the confidence state machine. Returns
    /// `None` for self-edges and invalid requests, which are skipped
    /// rather than failing the batch.
    pub(crate) fn upsert_edge(
        &mut self,
        from: &ToolId,
        to: &ToolId,
        edge_type: EdgeType,
        source: EdgeSource,
        explicit_confidence: Option<f32>,
    ) -> Option<UpsertOutcome> {
        if from == to {
            debug!(%from, "skipping self edge");
            return None;
        }
        let u = self.ensure_node(from);
        let v = self.ensure_node(to);

        let outcome = match self.adj_out[u].get_mut(&v) {
            None => {
                // First sighting: observations enter as inferred,
                // template loads keep their provenance.
                let source = match source {
                    EdgeSource::Template => EdgeSource::Template,
                    _ => EdgeSource::Inferred,
                };
                let mut edge = ToolEdge::new(from.clone(), to.clone(), edge_type, source);
                if let Some(c) = explicit_confidence {
                    edge = edge.with_confidence(c);
                }
                self.adj_out[u].insert(v, edge.clone());
                self.adj_in[v].insert(u);
                self.edge_count += 1;
                self.pending.insert((from.clone(), to.clone()), edge.clone());
                UpsertOutcome {
                    created: true,
                    from: from.clone(),
                    to: to.clone(),
                    confidence: edge.confidence,
                }
            }
            Some(edge) => {
                match source {
                    EdgeSource::Template => {
                        // A template load never downgrades a stronger
                        // provenance.
                        if edge.edge_source == EdgeSource::Template {
                            if let Some(c) = explicit_confidence {
                                edge.confidence = edge.confidence.max(c).min(1.0);
                            }
                        }
                    }
                    _ => {
                        if edge.edge_source == EdgeSource::Template {
                            edge.edge_source = EdgeSource::Inferred;
                        }
                        edge.observe();
                    }
                }
                let edge = edge.clone();
                self.pending.insert((from.clone(), to.clone()), edge.clone());
                UpsertOutcome {
                    created: false,
                    from: from.clone(),
                    to: to.clone(),
                    confidence: edge.confidence,
                }
            }
        };
        Some(outcome)
    }

    fn recompute(&mut self, config: &GraphConfig) {
        let adj = self.weighted_adj();
        self.pagerank = algo::page_rank(
            &adj,
            config.pagerank_damping,
            config.pagerank_iterations,
            config.pagerank_tolerance,
        );
        self.max_pagerank = self.pagerank.iter().copied().fold(0.0, f32::max);
        self.communities = algo::louvain_communities(&adj);
        self.updates_since_recompute = 0;
    }

    /// Recompute PageRank/communities at most once per configured batch
    /// of edge updates, to bound per-trace overhead.
    pub(crate) fn note_updates(&mut self, count: u32, config: &GraphConfig) -> bool {
        self.updates_since_recompute += count;
        if self.pagerank.len() != self.ids.len()
            || self.updates_since_recompute >= config.recompute_interval
        {
            self.recompute(config);
            true
        } else {
            false
        }
    }
}

impl ToolGraph {
    pub fn new(storage: Arc<dyn StorageAdapter>, bus: EventBus, config: GraphConfig) -> Self {
        Self {
            state: RwLock::new(GraphState::new()),
            storage,
            bus,
            config,
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Rebuild the in-memory graph from the persistent mirror.
    pub async fn sync_from_storage(&self) -> Result<()> {
        let tools = self.storage.list_tools().await?;
        let edges = self.storage.load_edges().await?;

        let (nodes, edge_count) = {
            let mut state = self.state.write();
            *state = GraphState::new();
            for tool in &tools {
                state.ensure_node(&tool.id);
            }
            for edge in edges {
                let u = state.ensure_node(&edge.from);
                let v = state.ensure_node(&edge.to);
                if u != v && state.adj_out[u].insert(v, edge).is_none() {
                    state.adj_in[v].insert(u);
                    state.edge_count += 1;
                }
            }
            state.recompute(&self.config);
            (state.ids.len(), state.edge_count)
        };

        info!(nodes, edges = edge_count, "graph synced from storage");
        self.bus.publish(GatewayEvent::GraphSynced {
            nodes,
            edges: edge_count,
        });
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.state.read().ids.len()
    }

    pub fn edge_count(&self) -> usize {
        self.state.read().edge_count
    }

    /// `edges / (n * (n - 1))`; zero below two nodes.
    pub fn density(&self) -> f32 {
        self.state.read().density()
    }

    pub fn contains(&self, id: &ToolId) -> bool {
        self.state.read().index(id).is_some()
    }

    pub fn add_node(&self, id: &ToolId) {
        self.state.write().ensure_node(id);
    }

    /// Upsert a single edge and persist it immediately.
    pub async fn add_or_update_edge(
        &self,
        from: &ToolId,
        to: &ToolId,
        edge_type: EdgeType,
        source: EdgeSource,
    ) -> Result<()> {
        let outcome = {
            let mut state = self.state.write();
            let outcome = state.upsert_edge(from, to, edge_type, source, None);
            if outcome.is_some() {
                state.note_updates(1, &self.config);
            }
            outcome
        };
        if let Some(outcome) = outcome {
            self.publish_edge_event(&outcome);
            self.flush().await?;
        }
        Ok(())
    }

    pub(crate) fn publish_edge_event(&self, outcome: &UpsertOutcome) {
        if outcome.created {
            self.bus.publish(GatewayEvent::EdgeCreated {
                from: outcome.from.clone(),
                to: outcome.to.clone(),
            });
        } else {
            self.bus.publish(GatewayEvent::EdgeUpdated {
                from: outcome.from.clone(),
                to: outcome.to.clone(),
                confidence: outcome.confidence,
            });
        }
    }

    /// Flush pending edge writes to storage as one all-or-nothing batch.
    /// A failed batch goes back into the pending set so the next flush
    /// retries it; the mirror lags but never diverges.
    pub(crate) async fn flush(&self) -> Result<()> {
        let batch: Vec<ToolEdge> = {
            let mut state = self.state.write();
            if state.pending.is_empty() {
                return Ok(());
            }
            state.pending.drain().map(|(_, e)| e).collect()
        };
        if let Err(e) = self.storage.upsert_edges(batch.clone()).await {
            warn!(error = %e, "edge batch persist failed");
            let mut state = self.state.write();
            for edge in batch {
                state
                    .pending
                    .entry((edge.from.clone(), edge.to.clone()))
                    .or_insert(edge);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Publish metric samples after a learning batch. Failures here are
    /// advisory only.
    pub(crate) async fn record_graph_metrics(&self) {
        let (density, nodes, edges) = {
            let state = self.state.read();
            (state.density(), state.ids.len(), state.edge_count)
        };
        self.bus.publish(GatewayEvent::GraphMetricsComputed {
            density,
            nodes,
            edges,
        });
        for (name, value) in [
            ("graph.density", density as f64),
            ("graph.nodes", nodes as f64),
            ("graph.edges", edges as f64),
        ] {
            if let Err(e) = self.storage.record_metric(MetricSample::now(name, value)).await {
                debug!(error = %e, metric = name, "metric record failed");
            }
        }
    }

    /// Normalized PageRank in `[0, 1]` (1 for the top-ranked node).
    pub fn page_rank(&self, id: &ToolId) -> f32 {
        let state = self.state.read();
        match state.index(id) {
            Some(i) if i < state.pagerank.len() && state.max_pagerank > 0.0 => {
                (state.pagerank[i] / state.max_pagerank).clamp(0.0, 1.0)
            }
            _ => 0.0,
        }
    }

    pub fn community_of(&self, id: &ToolId) -> Option<usize> {
        let state = self.state.read();
        let i = state.index(id)?;
        state.communities.get(i).copied()
    }

    /// Co-members of `id`'s Louvain community, deterministic order.
    pub fn community_members(&self, id: &ToolId, limit: usize) -> Vec<ToolId> {
        let state = self.state.read();
        let Some(i) = state.index(id) else {
            return Vec::new();
        };
        let Some(&label) = state.communities.get(i) else {
            return Vec::new();
        };
        state
            .communities
            .iter()
            .enumerate()
            .filter(|&(j, &c)| j != i && c == label)
            .map(|(j, _)| state.ids[j].clone())
            .take(limit)
            .collect()
    }

    /// Weighted shortest path, edge cost `1 / combined_weight`.
    pub fn shortest_path(&self, from: &ToolId, to: &ToolId) -> Option<Vec<ToolId>> {
        let state = self.state.read();
        let (u, v) = (state.index(from)?, state.index(to)?);
        let adj = state.weighted_adj();
        algo::dijkstra_path(&adj, u, v)
            .map(|path| path.into_iter().map(|i| state.ids[i].clone()).collect())
    }

    pub fn adamic_adar(&self, id: &ToolId, k: usize) -> Vec<(ToolId, f32)> {
        let state = self.state.read();
        let Some(i) = state.index(id) else {
            return Vec::new();
        };
        let adj = state.weighted_adj();
        algo::adamic_adar_top_k(&adj, i, k)
            .into_iter()
            .map(|(j, score)| (state.ids[j].clone(), score))
            .collect()
    }

    pub fn adamic_adar_between(&self, a: &ToolId, b: &ToolId) -> f32 {
        let state = self.state.read();
        let (Some(u), Some(v)) = (state.index(a), state.index(b)) else {
            return 0.0;
        };
        let adj = state.weighted_adj();
        algo::adamic_adar_pair(&adj, u, v)
    }

    /// Strongest direct connection between two tools, either direction.
    pub fn direct_edge_weight(&self, a: &ToolId, b: &ToolId) -> f32 {
        let state = self.state.read();
        let (Some(u), Some(v)) = (state.index(a), state.index(b)) else {
            return 0.0;
        };
        let forward = state.adj_out[u]
            .get(&v)
            .map(|e| e.combined_weight())
            .unwrap_or(0.0);
        let backward = state.adj_out[v]
            .get(&u)
            .map(|e| e.combined_weight())
            .unwrap_or(0.0);
        forward.max(backward)
    }

    /// Structural affinity of `tool` to a set of context tools, in
    /// `[0, 1]`: the best of direct weight and capped Adamic-Adar over
    /// the context. Zero when the context is empty.
    pub fn graph_relatedness(&self, tool: &ToolId, context: &[ToolId]) -> f32 {
        if context.is_empty() {
            return 0.0;
        }
        context
            .iter()
            .map(|t| {
                let direct = self.direct_edge_weight(tool, t);
                let aa = (self.adamic_adar_between(tool, t) / 2.0).min(1.0);
                direct.max(aa)
            })
            .fold(0.0, f32::max)
            .clamp(0.0, 1.0)
    }

    /// Strongest out-neighbors of `id`, weight-descending, ties by id.
    pub fn out_neighbors(&self, id: &ToolId, k: usize) -> Vec<(ToolId, f32)> {
        let state = self.state.read();
        let Some(i) = state.index(id) else {
            return Vec::new();
        };
        let mut neighbors: Vec<(ToolId, f32)> = state.adj_out[i]
            .iter()
            .map(|(&j, e)| (state.ids[j].clone(), e.combined_weight()))
            .collect();
        sort_scored(&mut neighbors);
        neighbors.truncate(k);
        neighbors
    }

    pub fn in_neighbors(&self, id: &ToolId, k: usize) -> Vec<(ToolId, f32)> {
        let state = self.state.read();
        let Some(i) = state.index(id) else {
            return Vec::new();
        };
        let mut neighbors: Vec<(ToolId, f32)> = state.adj_in[i]
            .iter()
            .filter_map(|&j| {
                state.adj_out[j]
                    .get(&i)
                    .map(|e| (state.ids[j].clone(), e.combined_weight()))
            })
            .collect();
        sort_scored(&mut neighbors);
        neighbors.truncate(k);
        neighbors
    }

    pub fn edge(&self, from: &ToolId, to: &ToolId) -> Option<ToolEdge> {
        let state = self.state.read();
        let (u, v) = (state.index(from)?, state.index(to)?);
        state.adj_out[u].get(&v).cloned()
    }

    pub fn edges(&self) -> Vec<ToolEdge> {
        let state = self.state.read();
        let mut edges: Vec<ToolEdge> = state
            .adj_out
            .iter()
            .flat_map(|targets| targets.values().cloned())
            .collect();
        edges.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
        edges
    }

    /// Assemble a task DAG from ranked candidates.
    ///
    /// A dependency `j -> i` is proposed when the graph holds a path of
    /// at most `max_path_hops` whose average combined weight reaches
    /// `min_path_quality`; cycles among proposals are broken
    /// deterministically in favor of the heavier direction.
    pub fn build_dag(&self, candidates: &[ToolId]) -> TaskDag {
        let state = self.state.read();
        let adj = state.weighted_adj();

        let indices: Vec<Option<usize>> = candidates.iter().map(|c| state.index(c)).collect();
        let mut proposed: Vec<CandidateEdge> = Vec::new();
        for (ci, i_opt) in indices.iter().enumerate() {
            let Some(i) = *i_opt else { continue };
            for (cj, j_opt) in indices.iter().enumerate() {
                if ci == cj {
                    continue;
                }
                let Some(j) = *j_opt else { continue };
                if let Some(quality) =
                    algo::best_path_quality(&adj, j, i, self.config.max_path_hops)
                {
                    if quality >= self.config.min_path_quality {
                        proposed.push(CandidateEdge {
                            from: cj,
                            to: ci,
                            weight: quality,
                        });
                    }
                }
            }
        }
        drop(state);

        break_cycles(candidates.len(), &mut proposed, candidates);

        let tasks = candidates
            .iter()
            .enumerate()
            .map(|(i, tool)| {
                let mut depends_on: Vec<String> = proposed
                    .iter()
                    .filter(|e| e.to == i)
                    .map(|e| format!("task_{}", e.from))
                    .collect();
                depends_on.sort();
                TaskNode {
                    id: format!("task_{}", i),
                    kind: TaskKind::McpTool {
                        tool: tool.clone(),
                        args: serde_json::json!({}),
                        side_effects: false,
                    },
                    depends_on,
                }
            })
            .collect();
        TaskDag { tasks }
    }

    /// Run a closure over the locked state; used by the learning and
    /// pattern modules in this crate.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut GraphState) -> R) -> R {
        f(&mut self.state.write())
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }
}

fn sort_scored(items: &mut [(ToolId, f32)]) {
    items.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}
