//! Embedding providers.
//!
//! Real deployments plug a model-backed provider into the
//! `EmbeddingProvider` port. The hashing provider here is fully local
//! and deterministic: tokens are hashed into a fixed number of buckets
//! and the bucket histogram is L2-normalized. Shared vocabulary yields
//! cosine overlap, which is all the index and the tests need without a
//! model in the loop.

use async_trait::async_trait;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use toolweave_core::{EmbeddingProvider, Result, WeaveError};

pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.dimension == 0 {
            return Err(WeaveError::InvalidOperation(
                "embedding dimension must be positive".into(),
            ));
        }
        let mut vector = vec![0.0f32; self.dimension];
        for token in Self::tokenize(text) {
            let mut hasher = FxHasher::default();
            token.hash(&mut hasher);
            let bucket = (hasher.finish() % self.dimension as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}
