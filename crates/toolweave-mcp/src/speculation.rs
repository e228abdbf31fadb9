//! Speculative pre-execution cache.
//!
//! Predicted next tools can be run ahead of time; their results are
//! parked here keyed by tool and argument hash. The executor consumes a
//! matching entry instead of re-dispatching the call; entries expire so
//! a stale speculation is discarded rather than served.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use toolweave_core::ToolId;

pub struct SpeculationCache {
    entries: DashMap<String, SpeculativeResult>,
    ttl: Duration,
}

struct SpeculativeResult {
    value: serde_json::Value,
    stored_at: Instant,
}

impl SpeculationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn key(tool: &ToolId, args: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tool.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(args.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn put(&self, tool: &ToolId, args: &serde_json::Value, value: serde_json::Value) {
        self.entries.insert(
            Self::key(tool, args),
            SpeculativeResult {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Consume a cached result; a hit is removed so it is used at most
    /// once.
    pub fn take(&self, tool: &ToolId, args: &serde_json::Value) -> Option<serde_json::Value> {
        let (_, entry) = self.entries.remove(&Self::key(tool, args))?;
        if entry.stored_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SpeculationCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(s: &str) -> ToolId {
        s.parse().unwrap()
    }

    #[test]
    fn hit_is_consumed_once() {
        let cache = SpeculationCache::default();
        let args = serde_json::json!({"q": 1});
        cache.put(&tid("a:x"), &args, serde_json::json!("r"));
        assert_eq!(cache.take(&tid("a:x"), &args), Some(serde_json::json!("r")));
        assert_eq!(cache.take(&tid("a:x"), &args), None);
    }

    #[test]
    fn different_args_miss() {
        let cache = SpeculationCache::default();
        cache.put(&tid("a:x"), &serde_json::json!({"q": 1}), serde_json::json!("r"));
        assert_eq!(cache.take(&tid("a:x"), &serde_json::json!({"q": 2})), None);
    }

    #[test]
    fn expired_entries_are_discarded() {
        let cache = SpeculationCache::new(Duration::from_millis(0));
        let args = serde_json::json!({});
        cache.put(&tid("a:x"), &args, serde_json::json!("r"));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.take(&tid("a:x"), &args), None);
    }
}
