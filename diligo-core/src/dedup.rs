//! Evidence deduplication — exact content-hash and near-duplicate merging.
//!
//! Duplicates are merged, keeping the higher-credibility source and marking
//! the alternates superseded; nothing is deleted. The pass is idempotent
//! and order-independent: candidates are processed in a deterministic order
//! (credibility descending, then id) and already-superseded records are
//! skipped, so running it twice yields the same surviving set.

use crate::embeddings::{Embedder, VectorIndex};
use crate::evidence::{Evidence, EvidenceStatus};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Deduplicates evidence within a run.
pub struct Deduplicator<E: Embedder> {
    embedder: E,
    /// Cosine similarity above which two records are near-duplicates.
    similarity_threshold: f32,
}

impl<E: Embedder> Deduplicator<E> {
    pub fn new(embedder: E, similarity_threshold: f32) -> Self {
        Self {
            embedder,
            similarity_threshold,
        }
    }

    /// Run the dedup pass over all evidence. Returns the number of records
    /// newly superseded.
    pub fn dedup(&self, evidence: &mut [Evidence]) -> usize {
        let before = evidence.iter().filter(|e| e.is_live()).count();
        self.dedup_exact(evidence);
        self.dedup_near(evidence);
        let after = evidence.iter().filter(|e| e.is_live()).count();
        before - after
    }

    /// Exact duplicates: identical content hash within the same pillar.
    fn dedup_exact(&self, evidence: &mut [Evidence]) {
        let mut groups: HashMap<(Uuid, String), Vec<usize>> = HashMap::new();
        for (idx, e) in evidence.iter().enumerate() {
            if e.is_live() {
                groups
                    .entry((e.pillar_id, e.content_hash.clone()))
                    .or_default()
                    .push(idx);
            }
        }

        for indices in groups.into_values() {
            if indices.len() < 2 {
                continue;
            }
            let winner = Self::pick_winner(evidence, &indices);
            let winner_id = evidence[winner].id;
            for idx in indices {
                if idx != winner {
                    debug!(
                        superseded = %evidence[idx].id,
                        by = %winner_id,
                        "exact duplicate merged"
                    );
                    evidence[idx].status = EvidenceStatus::Superseded { by: winner_id };
                }
            }
        }
    }

    /// Near-duplicates: embedding similarity above the threshold within the
    /// same pillar. Greedy keep in deterministic credibility order, with a
    /// per-pillar index of survivor embeddings.
    fn dedup_near(&self, evidence: &mut [Evidence]) {
        let mut live: Vec<usize> = (0..evidence.len())
            .filter(|&i| evidence[i].is_live())
            .collect();
        live.sort_by(|&a, &b| {
            evidence[b]
                .source
                .credibility
                .partial_cmp(&evidence[a].source.credibility)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| evidence[a].id.cmp(&evidence[b].id))
        });

        let mut survivors: HashMap<Uuid, VectorIndex> = HashMap::new();
        for idx in live {
            let vec = self.embedder.embed(&evidence[idx].content);
            let index = survivors.entry(evidence[idx].pillar_id).or_default();
            let duplicate_of = index
                .query_nearest(&vec, 1)
                .first()
                .filter(|(_, similarity)| *similarity >= self.similarity_threshold)
                .map(|(id, _)| *id);
            match duplicate_of {
                Some(winner_id) => {
                    debug!(
                        superseded = %evidence[idx].id,
                        by = %winner_id,
                        "near duplicate merged"
                    );
                    evidence[idx].status = EvidenceStatus::Superseded { by: winner_id };
                }
                None => index.upsert(evidence[idx].id, vec),
            }
        }
    }

    /// Deterministic winner: highest credibility, then earliest creation,
    /// then smallest id.
    fn pick_winner(evidence: &[Evidence], indices: &[usize]) -> usize {
        *indices
            .iter()
            .min_by(|&&a, &&b| {
                evidence[b]
                    .source
                    .credibility
                    .partial_cmp(&evidence[a].source.credibility)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| evidence[a].created_at.cmp(&evidence[b].created_at))
                    .then_with(|| evidence[a].id.cmp(&evidence[b].id))
            })
            .unwrap_or(&indices[0])
    }
}
