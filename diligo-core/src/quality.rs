//! Quality scoring — five bounded components and a fixed weighted overall.
//!
//! Evidence quality is a heuristic estimate, not verification. Each
//! component lies in [0,1]; the overall is a fixed weighted combination
//! clipped to [0,1]. Evidence below the configured floor is excluded from
//! report synthesis but retained for audit.

use crate::embeddings::{Embedder, cosine_similarity};
use crate::evidence::Evidence;
use crate::thesis::Pillar;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed component weights for the overall score.
pub const RELEVANCE_WEIGHT: f64 = 0.30;
pub const CREDIBILITY_WEIGHT: f64 = 0.25;
pub const RECENCY_WEIGHT: f64 = 0.15;
pub const SPECIFICITY_WEIGHT: f64 = 0.20;
pub const BIAS_WEIGHT: f64 = 0.10;

/// The five-component bounded quality estimate for an evidence item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityScore {
    /// Semantic relevance to the pillar's questions.
    pub relevance: f64,
    /// Source credibility.
    pub credibility: f64,
    /// Recency of the publish date.
    pub recency: f64,
    /// Textual specificity (numbers, named entities, keyword density).
    pub specificity: f64,
    /// Estimated bias; higher is worse.
    pub bias: f64,
    /// Fixed weighted combination, clipped to [0,1].
    pub overall: f64,
}

impl QualityScore {
    /// Combine components into a score. Inputs are clamped to [0,1] and
    /// bias contributes inverted (`1 - bias`).
    pub fn new(
        relevance: f64,
        credibility: f64,
        recency: f64,
        specificity: f64,
        bias: f64,
    ) -> Self {
        let relevance = relevance.clamp(0.0, 1.0);
        let credibility = credibility.clamp(0.0, 1.0);
        let recency = recency.clamp(0.0, 1.0);
        let specificity = specificity.clamp(0.0, 1.0);
        let bias = bias.clamp(0.0, 1.0);

        let overall = (relevance * RELEVANCE_WEIGHT
            + credibility * CREDIBILITY_WEIGHT
            + recency * RECENCY_WEIGHT
            + specificity * SPECIFICITY_WEIGHT
            + (1.0 - bias) * BIAS_WEIGHT)
            .clamp(0.0, 1.0);

        Self {
            relevance,
            credibility,
            recency,
            specificity,
            bias,
            overall,
        }
    }
}

/// Scores evidence records against their pillar.
pub struct QualityEvaluator<E: Embedder> {
    embedder: E,
    /// Half-life in days for the recency decay.
    recency_half_life_days: f64,
}

impl<E: Embedder> QualityEvaluator<E> {
    pub fn new(embedder: E) -> Self {
        Self {
            embedder,
            recency_half_life_days: 365.0,
        }
    }

    pub fn with_half_life(mut self, days: f64) -> Self {
        self.recency_half_life_days = days.max(1.0);
        self
    }

    /// Score one evidence record against its pillar. Does not mutate the
    /// record; the orchestrator attaches the score and flips the status.
    pub fn score(&self, evidence: &Evidence, pillar: &Pillar, now: DateTime<Utc>) -> QualityScore {
        let relevance = self.relevance(evidence, pillar);
        let credibility = evidence.source.credibility;
        let recency = self.recency(evidence.published_at, now);
        let specificity = specificity(&evidence.content, pillar);
        let bias = evidence.source.source_type.bias_prior();
        QualityScore::new(relevance, credibility, recency, specificity, bias)
    }

    /// Semantic similarity between evidence content and the pillar's
    /// question set, mapped from cosine [-1,1] into [0,1].
    fn relevance(&self, evidence: &Evidence, pillar: &Pillar) -> f64 {
        let question_vec = self.embedder.embed(&pillar.question_text());
        let content_vec = self.embedder.embed(&evidence.content);
        let cos = cosine_similarity(&question_vec, &content_vec) as f64;
        ((cos + 1.0) / 2.0).clamp(0.0, 1.0)
    }

    /// Exponential decay by document age; unknown dates get a neutral 0.5.
    fn recency(&self, published_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
        match published_at {
            None => 0.5,
            Some(date) => {
                let age_days = (now - date).num_days().max(0) as f64;
                (0.5f64).powf(age_days / self.recency_half_life_days)
            }
        }
    }
}

/// Textual specificity: density of digits and pillar key terms.
///
/// Pluggable heuristic (see the gap analyzer for the coverage counterpart);
/// deliberately cheap so it can run over every collected document.
fn specificity(content: &str, pillar: &Pillar) -> f64 {
    let words: Vec<&str> = content.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }

    let numeric = words
        .iter()
        .filter(|w| w.chars().any(|c| c.is_ascii_digit()))
        .count();
    let numeric_density = (numeric as f64 / words.len() as f64 * 10.0).min(1.0);

    let lower = content.to_lowercase();
    let mut term_hits = 0usize;
    let mut term_total = 0usize;
    for term in pillar
        .key_terms
        .iter()
        .map(String::as_str)
        .chain(pillar.questions.iter().flat_map(|q| q.split_whitespace()))
        .filter(|t| t.len() > 3)
    {
        term_total += 1;
        if lower.contains(&term.to_lowercase()) {
            term_hits += 1;
        }
    }
    let term_density = if term_total == 0 {
        0.0
    } else {
        term_hits as f64 / term_total as f64
    };

    (0.5 * numeric_density + 0.5 * term_density).clamp(0.0, 1.0)
}
