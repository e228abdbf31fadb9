use crate::{Result, WeaveError};
use config as cfg;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Hybrid-retrieval tuning. The piecewise tables are knobs, not
/// algorithms; defaults match the documented reference behavior.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetrievalConfig {
    /// Semantic weight never drops below this, so the graph cannot
    /// dominate ranking.
    #[serde(default = "RetrievalConfig::default_alpha_floor")]
    pub alpha_floor: f32,
    /// Density below which the graph is considered sparse.
    #[serde(default = "RetrievalConfig::default_sparse_density")]
    pub sparse_density: f32,
    /// Density below which the graph is considered medium.
    #[serde(default = "RetrievalConfig::default_medium_density")]
    pub medium_density: f32,
    /// Candidate expansion factors per density tier.
    #[serde(default = "RetrievalConfig::default_sparse_expansion")]
    pub sparse_expansion: f32,
    #[serde(default = "RetrievalConfig::default_medium_expansion")]
    pub medium_expansion: f32,
    #[serde(default = "RetrievalConfig::default_dense_expansion")]
    pub dense_expansion: f32,
    /// Neighbors reported per direction when related tools are requested.
    #[serde(default = "RetrievalConfig::default_related_neighbors")]
    pub related_neighbors: usize,
}

impl RetrievalConfig {
    fn default_alpha_floor() -> f32 {
        0.5
    }
    fn default_sparse_density() -> f32 {
        0.01
    }
    fn default_medium_density() -> f32 {
        0.10
    }
    fn default_sparse_expansion() -> f32 {
        1.5
    }
    fn default_medium_expansion() -> f32 {
        2.0
    }
    fn default_dense_expansion() -> f32 {
        3.0
    }
    fn default_related_neighbors() -> usize {
        2
    }

    /// Expansion factor for the semantic prefetch at a given density.
    pub fn expansion_factor(&self, density: f32) -> f32 {
        if density < self.sparse_density {
            self.sparse_expansion
        } else if density < self.medium_density {
            self.medium_expansion
        } else {
            self.dense_expansion
        }
    }

    /// Adaptive semantic weight `alpha = max(floor, 1 - 2 * density)`.
    pub fn semantic_alpha(&self, density: f32) -> f32 {
        (1.0 - 2.0 * density).max(self.alpha_floor)
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            alpha_floor: Self::default_alpha_floor(),
            sparse_density: Self::default_sparse_density(),
            medium_density: Self::default_medium_density(),
            sparse_expansion: Self::default_sparse_expansion(),
            medium_expansion: Self::default_medium_expansion(),
            dense_expansion: Self::default_dense_expansion(),
            related_neighbors: Self::default_related_neighbors(),
        }
    }
}

/// One tier of the density-adaptive confidence blend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
pub struct ConfidenceWeights {
    pub hybrid: f32,
    pub pagerank: f32,
    pub path: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SuggesterConfig {
    /// Candidates requested from hybrid retrieval.
    #[serde(default = "SuggesterConfig::default_candidate_limit")]
    pub candidate_limit: usize,
    /// Candidates kept after PageRank re-ranking.
    #[serde(default = "SuggesterConfig::default_keep_top")]
    pub keep_top: usize,
    #[serde(default = "SuggesterConfig::default_rerank_hybrid_weight")]
    pub rerank_hybrid_weight: f32,
    #[serde(default = "SuggesterConfig::default_rerank_pagerank_weight")]
    pub rerank_pagerank_weight: f32,
    /// Confidence at or above which the controller executes directly.
    #[serde(default = "SuggesterConfig::default_execute_threshold")]
    pub execute_threshold: f32,
    /// Confidence below which a suggestion carries a warning.
    #[serde(default = "SuggesterConfig::default_warning_threshold")]
    pub warning_threshold: f32,
    #[serde(default = "SuggesterConfig::default_sparse_weights")]
    pub sparse_weights: ConfidenceWeights,
    #[serde(default = "SuggesterConfig::default_medium_weights")]
    pub medium_weights: ConfidenceWeights,
    #[serde(default = "SuggesterConfig::default_dense_weights")]
    pub dense_weights: ConfidenceWeights,
    /// Default confidence for manually registered hints.
    #[serde(default = "SuggesterConfig::default_hint_confidence")]
    pub hint_confidence: f32,
    /// Minimum vector score for replanning searches.
    #[serde(default = "SuggesterConfig::default_replan_min_score")]
    pub replan_min_score: f32,
    /// New tasks appended per replanning round.
    #[serde(default = "SuggesterConfig::default_replan_top")]
    pub replan_top: usize,
    /// Case-insensitive substrings that disqualify a predicted tool.
    #[serde(default = "SuggesterConfig::default_blacklist")]
    pub prediction_blacklist: Vec<String>,
}

impl SuggesterConfig {
    fn default_candidate_limit() -> usize {
        10
    }
    fn default_keep_top() -> usize {
        5
    }
    fn default_rerank_hybrid_weight() -> f32 {
        0.8
    }
    fn default_rerank_pagerank_weight() -> f32 {
        0.2
    }
    fn default_execute_threshold() -> f32 {
        0.80
    }
    fn default_warning_threshold() -> f32 {
        0.50
    }
    fn default_sparse_weights() -> ConfidenceWeights {
        ConfidenceWeights {
            hybrid: 0.85,
            pagerank: 0.05,
            path: 0.10,
        }
    }
    fn default_medium_weights() -> ConfidenceWeights {
        ConfidenceWeights {
            hybrid: 0.65,
            pagerank: 0.20,
            path: 0.15,
        }
    }
    fn default_dense_weights() -> ConfidenceWeights {
        ConfidenceWeights {
            hybrid: 0.55,
            pagerank: 0.30,
            path: 0.15,
        }
    }
    fn default_hint_confidence() -> f32 {
        0.6
    }
    fn default_replan_min_score() -> f32 {
        0.5
    }
    fn default_replan_top() -> usize {
        3
    }
    fn default_blacklist() -> Vec<String> {
        [
            "delete",
            "remove",
            "deploy",
            "payment",
            "send_email",
            "execute_shell",
            "drop",
            "truncate",
            "transfer",
            "admin",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    pub fn weights_for_density(&self, density: f32, retrieval: &RetrievalConfig) -> ConfidenceWeights {
        if density < retrieval.sparse_density {
            self.sparse_weights
        } else if density < retrieval.medium_density {
            self.medium_weights
        } else {
            self.dense_weights
        }
    }
}

impl Default for SuggesterConfig {
    fn default() -> Self {
        Self {
            candidate_limit: Self::default_candidate_limit(),
            keep_top: Self::default_keep_top(),
            rerank_hybrid_weight: Self::default_rerank_hybrid_weight(),
            rerank_pagerank_weight: Self::default_rerank_pagerank_weight(),
            execute_threshold: Self::default_execute_threshold(),
            warning_threshold: Self::default_warning_threshold(),
            sparse_weights: Self::default_sparse_weights(),
            medium_weights: Self::default_medium_weights(),
            dense_weights: Self::default_dense_weights(),
            hint_confidence: Self::default_hint_confidence(),
            replan_min_score: Self::default_replan_min_score(),
            replan_top: Self::default_replan_top(),
            prediction_blacklist: Self::default_blacklist(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecutorConfig {
    /// Concurrent tasks per layer; excess tasks queue on the semaphore.
    #[serde(default = "ExecutorConfig::default_max_parallel")]
    pub max_parallel: usize,
    /// Attempts for idempotent tasks, including the first.
    #[serde(default = "ExecutorConfig::default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base backoff; attempt `n` waits `base * 2^n`.
    #[serde(default = "ExecutorConfig::default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Per-task deadline.
    #[serde(default = "ExecutorConfig::default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Per-workflow deadline; no new layer starts past it.
    #[serde(default = "ExecutorConfig::default_workflow_timeout_ms")]
    pub workflow_timeout_ms: u64,
}

impl ExecutorConfig {
    fn default_max_parallel() -> usize {
        16
    }
    fn default_retry_attempts() -> u32 {
        3
    }
    fn default_retry_base_ms() -> u64 {
        100
    }
    fn default_task_timeout_ms() -> u64 {
        60_000
    }
    fn default_workflow_timeout_ms() -> u64 {
        300_000
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: Self::default_max_parallel(),
            retry_attempts: Self::default_retry_attempts(),
            retry_base_ms: Self::default_retry_base_ms(),
            task_timeout_ms: Self::default_task_timeout_ms(),
            workflow_timeout_ms: Self::default_workflow_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SandboxConfig {
    /// Deadline for a single tool RPC from sandboxed code.
    #[serde(default = "SandboxConfig::default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Hard deadline for the whole execution; firing it kills the worker.
    #[serde(default = "SandboxConfig::default_total_timeout_ms")]
    pub total_timeout_ms: u64,
    /// In-flight RPC cap on the bridge side.
    #[serde(default = "SandboxConfig::default_max_inflight_rpc")]
    pub max_inflight_rpc: usize,
    /// Root against which all paths from sandbox code are validated.
    #[serde(default = "SandboxConfig::default_workspace_root")]
    pub workspace_root: PathBuf,
}

impl SandboxConfig {
    fn default_rpc_timeout_ms() -> u64 {
        10_000
    }
    fn default_total_timeout_ms() -> u64 {
        30_000
    }
    fn default_max_inflight_rpc() -> usize {
        8
    }
    fn default_workspace_root() -> PathBuf {
        PathBuf::from("./workspace")
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: Self::default_rpc_timeout_ms(),
            total_timeout_ms: Self::default_total_timeout_ms(),
            max_inflight_rpc: Self::default_max_inflight_rpc(),
            workspace_root: Self::default_workspace_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GraphConfig {
    /// Minimum average combined edge weight for a candidate path to
    /// become a DAG dependency.
    #[serde(default = "GraphConfig::default_min_path_quality")]
    pub min_path_quality: f32,
    /// Maximum hops when probing candidate-to-candidate paths.
    #[serde(default = "GraphConfig::default_max_path_hops")]
    pub max_path_hops: usize,
    /// PageRank and communities recompute at most once per this many
    /// edge updates.
    #[serde(default = "GraphConfig::default_recompute_interval")]
    pub recompute_interval: u32,
    #[serde(default = "GraphConfig::default_pagerank_damping")]
    pub pagerank_damping: f32,
    #[serde(default = "GraphConfig::default_pagerank_iterations")]
    pub pagerank_iterations: usize,
    #[serde(default = "GraphConfig::default_pagerank_tolerance")]
    pub pagerank_tolerance: f32,
}

impl GraphConfig {
    fn default_min_path_quality() -> f32 {
        0.25
    }
    fn default_max_path_hops() -> usize {
        3
    }
    fn default_recompute_interval() -> u32 {
        16
    }
    fn default_pagerank_damping() -> f32 {
        0.85
    }
    fn default_pagerank_iterations() -> usize {
        50
    }
    fn default_pagerank_tolerance() -> f32 {
        1e-6
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            min_path_quality: Self::default_min_path_quality(),
            max_path_hops: Self::default_max_path_hops(),
            recompute_interval: Self::default_recompute_interval(),
            pagerank_damping: Self::default_pagerank_damping(),
            pagerank_iterations: Self::default_pagerank_iterations(),
            pagerank_tolerance: Self::default_pagerank_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Settings {
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub suggester: SuggesterConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub graph: GraphConfig,
}

impl Settings {
    /// Layered load: optional TOML file, then `TOOLWEAVE__`-prefixed
    /// environment overrides. A malformed file is a fatal schema error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = cfg::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(cfg::File::from(path).required(true));
        }
        builder = builder.add_source(
            cfg::Environment::with_prefix("TOOLWEAVE")
                .separator("__")
                .try_parsing(true),
        );
        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| WeaveError::Schema(e.to_string()))
    }
}
