//! Reusable intent-to-code capabilities.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use toolweave_core::{
    Capability, CapabilityId, EmbeddingProvider, EventBus, GatewayEvent, Result, StorageAdapter,
    ToolId, WeaveError,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Reliability below which a capability is never matched.
const MATCH_RELIABILITY_FLOOR: f32 = 0.7;

/// Failure ratio and sample size that retire a capability.
const RETIREMENT_RATIO: f32 = 0.5;
const RETIREMENT_MIN_USES: u32 = 10;

#[derive(Debug, Clone)]
pub struct CapabilityMatch {
    pub capability: Capability,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct Promotion {
    pub intent: String,
    pub code: String,
    pub tools_used: Vec<ToolId>,
    pub duration_ms: u64,
    pub success: bool,
}

/// Stores intent->code patterns and matches new intents against them by
/// semantic similarity weighted with observed reliability.
pub struct CapabilityStore {
    storage: Arc<dyn StorageAdapter>,
    embedder: Arc<dyn EmbeddingProvider>,
    bus: EventBus,
}

impl CapabilityStore {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        embedder: Arc<dyn EmbeddingProvider>,
        bus: EventBus,
    ) -> Self {
        Self {
            storage,
            embedder,
            bus,
        }
    }

    /// Best matching active capability at or above `min_threshold`,
    /// scored `cosine(intent, stored) * reliability`.
    pub async fn find_match(
        &self,
        intent_text: &str,
        min_threshold: f32,
    ) -> Result<Option<CapabilityMatch>> {
        let query = self.embedder.embed(intent_text).await?;
        let mut best: Option<CapabilityMatch> = None;
        for capability in self.storage.list_capabilities().await? {
            if !capability.active || capability.reliability() <= MATCH_RELIABILITY_FLOOR {
                continue;
            }
            let score = cosine(&query, &capability.intent_embedding) * capability.reliability();
            if score >= min_threshold && best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(CapabilityMatch { capability, score });
            }
        }
        if let Some(m) = &best {
            self.bus.publish(GatewayEvent::CapabilityMatched {
                capability_id: m.capability.capability_id,
                score: m.score,
            });
        }
        Ok(best)
    }

    /// Promote a successful code execution into a capability. The
    /// pattern hash over normalized code is the idempotency key: the
    /// same code promotes into the same row, counting another use.
    pub async fn promote(&self, promotion: Promotion) -> Result<Capability> {
        let pattern_hash = pattern_hash(&promotion.code);

        if let Some(mut existing) = self.storage.capability_by_hash(&pattern_hash).await? {
            existing.usage_count = existing.usage_count.saturating_add(1);
            if promotion.success {
                existing.success_count = existing.success_count.saturating_add(1);
            }
            existing.last_used = Utc::now();
            self.storage.upsert_capability(existing.clone()).await?;
            return Ok(existing);
        }

        let capability = Capability {
            capability_id: Uuid::new_v4(),
            name: capability_name(&promotion.intent),
            intent_embedding: self.embedder.embed(&promotion.intent).await?,
            code: promotion.code.clone(),
            parameters_schema: serde_json::json!({ "type": "object" }),
            usage_count: 1,
            success_count: promotion.success as u32,
            last_used: Utc::now(),
            pattern_hash,
            active: true,
        };
        self.storage.upsert_capability(capability.clone()).await?;
        info!(name = %capability.name, tools = promotion.tools_used.len(), "capability learned");
        self.bus.publish(GatewayEvent::CapabilityLearned {
            capability_id: capability.capability_id,
            name: capability.name.clone(),
        });
        Ok(capability)
    }

    /// Count one reuse. A capability that keeps failing is retired in
    /// place, never deleted.
    pub async fn record_usage(&self, id: CapabilityId, success: bool) -> Result<()> {
        let Some(mut capability) = self.storage.get_capability(id).await? else {
            return Err(WeaveError::NotFound(format!("capability {}", id)));
        };
        capability.usage_count = capability.usage_count.saturating_add(1);
        if success {
            capability.success_count = capability.success_count.saturating_add(1);
        }
        capability.last_used = Utc::now();

        let ratio = capability.success_count as f32 / capability.usage_count as f32;
        if capability.usage_count >= RETIREMENT_MIN_USES && ratio < RETIREMENT_RATIO {
            warn!(name = %capability.name, ratio, "capability retired");
            capability.active = false;
        }
        self.storage.upsert_capability(capability).await
    }
}

/// Whitespace-insensitive code identity: trimmed non-empty lines with
/// inner runs of whitespace collapsed.
fn normalize_code(code: &str) -> String {
    code.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n")
}

fn pattern_hash(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_code(code).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn capability_name(intent: &str) -> String {
    let slug: Vec<String> = intent
        .split_whitespace()
        .take(4)
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();
    if slug.is_empty() {
        "unnamed_capability".to_string()
    } else {
        slug.join("_")
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    (dot / (na * nb)).clamp(0.0, 1.0)
}
