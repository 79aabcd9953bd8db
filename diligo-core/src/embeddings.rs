//! Local text embeddings for dedup and relevance scoring.
//!
//! Provides a trait-based abstraction over embedding models with a local
//! hashing-TF implementation that needs no external service. The evidence
//! deduplicator uses it for near-duplicate detection and the quality
//! evaluator for semantic relevance against pillar questions.

use std::collections::HashMap;

/// Trait for embedding providers.
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text.
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Generate embeddings for a batch of texts.
    fn embed_batch(&self, texts: &[&str]) -> Vec<Vec<f32>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Return the dimensionality of embeddings.
    fn dimensions(&self) -> usize;

    /// Return the provider name.
    fn provider_name(&self) -> &str;
}

/// Local hashing term-frequency embedder (always available, no external
/// dependencies). Tokens are lowercased, hashed into a fixed number of
/// buckets, and the resulting vector is L2-normalized so dot product equals
/// cosine similarity.
#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    dimensions: usize,
}

impl LocalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(16),
        }
    }

    fn bucket(&self, token: &str) -> usize {
        // FNV-1a, stable across runs (no DoS-hardened hasher here on purpose).
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in token.bytes() {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        (hash % self.dimensions as u64) as usize
    }
}

impl Default for LocalEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for LocalEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut counts: HashMap<usize, f32> = HashMap::new();
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 1)
        {
            *counts.entry(self.bucket(token)).or_insert(0.0) += 1.0;
        }

        let mut vector = vec![0.0f32; self.dimensions];
        for (idx, count) in counts {
            vector[idx] = count;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &str {
        "local"
    }
}

/// Cosine similarity between two vectors. Returns 0.0 for mismatched
/// dimensions or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// In-memory nearest-neighbor index over embeddings, keyed by id.
///
/// Linear scan; evidence sets per run are small enough that an ANN
/// structure would be overkill.
#[derive(Debug, Default)]
pub struct VectorIndex {
    entries: Vec<(uuid::Uuid, Vec<f32>)>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the embedding for an id.
    pub fn upsert(&mut self, id: uuid::Uuid, embedding: Vec<f32>) {
        if let Some(entry) = self.entries.iter_mut().find(|(eid, _)| *eid == id) {
            entry.1 = embedding;
        } else {
            self.entries.push((id, embedding));
        }
    }

    /// Return up to `k` entries most similar to `embedding`, best first.
    pub fn query_nearest(&self, embedding: &[f32], k: usize) -> Vec<(uuid::Uuid, f32)> {
        let mut scored: Vec<(uuid::Uuid, f32)> = self
            .entries
            .iter()
            .map(|(id, e)| (*id, cosine_similarity(embedding, e)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
