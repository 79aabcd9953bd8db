//! Evidence records — normalized, scored units of collected information.
//!
//! Raw documents from providers are normalized here into `Evidence` tied to
//! a pillar, with a content hash as the exact-dedup key and a closed
//! `SourceType` set carrying credibility and bias priors. Evidence is never
//! deleted, only flagged superseded by the deduplicator.

use crate::quality::QualityScore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Closed set of evidence source types.
///
/// Anything that doesn't match a known shape at the ingestion boundary is
/// classified `Other` rather than propagated as an untyped blob.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Regulatory filing (10-K, S-1, annual report).
    RegulatoryFiling,
    /// Academic paper or peer-reviewed study.
    Academic,
    /// Industry analyst report.
    IndustryReport,
    /// News article from an established outlet.
    News,
    /// The target company's own site or documentation.
    CompanySite,
    /// Blog post or opinion piece.
    Blog,
    /// Forum, Q&A, or review site.
    Forum,
    /// Unknown or unclassifiable source.
    Other,
}

impl SourceType {
    /// Default credibility prior in [0,1].
    pub fn credibility_prior(&self) -> f64 {
        match self {
            SourceType::RegulatoryFiling => 0.95,
            SourceType::Academic => 0.90,
            SourceType::IndustryReport => 0.80,
            SourceType::News => 0.70,
            SourceType::CompanySite => 0.60,
            SourceType::Blog => 0.45,
            SourceType::Forum => 0.35,
            SourceType::Other => 0.40,
        }
    }

    /// Bias prior in [0,1]; higher means more likely slanted.
    pub fn bias_prior(&self) -> f64 {
        match self {
            SourceType::RegulatoryFiling => 0.10,
            SourceType::Academic => 0.15,
            SourceType::IndustryReport => 0.30,
            SourceType::News => 0.35,
            // First-party material is promotional by nature.
            SourceType::CompanySite => 0.65,
            SourceType::Blog => 0.55,
            SourceType::Forum => 0.50,
            SourceType::Other => 0.50,
        }
    }

    /// Classify a source type from its URL and title using keyword
    /// heuristics. Kept deliberately simple; it only feeds priors.
    pub fn classify(url: &str, title: &str, company_site: Option<&str>) -> Self {
        let haystack = format!("{} {}", url.to_lowercase(), title.to_lowercase());

        if let Some(site) = company_site {
            let site = site
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_start_matches("www.");
            if !site.is_empty() && url.to_lowercase().contains(site) {
                return SourceType::CompanySite;
            }
        }

        if haystack.contains("sec.gov")
            || haystack.contains("10-k")
            || haystack.contains("annual report")
            || haystack.contains("prospectus")
        {
            SourceType::RegulatoryFiling
        } else if haystack.contains("arxiv")
            || haystack.contains("doi.org")
            || haystack.contains("journal")
        {
            SourceType::Academic
        } else if haystack.contains("gartner")
            || haystack.contains("forrester")
            || haystack.contains("idc.com")
            || haystack.contains("market report")
        {
            SourceType::IndustryReport
        } else if haystack.contains("reuters")
            || haystack.contains("bloomberg")
            || haystack.contains("ft.com")
            || haystack.contains("wsj.com")
            || haystack.contains("/news/")
        {
            SourceType::News
        } else if haystack.contains("blog") || haystack.contains("medium.com") {
            SourceType::Blog
        } else if haystack.contains("reddit")
            || haystack.contains("stackoverflow")
            || haystack.contains("forum")
            || haystack.contains("g2.com")
            || haystack.contains("trustpilot")
        {
            SourceType::Forum
        } else {
            SourceType::Other
        }
    }
}

/// Describes where a piece of evidence came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceDescriptor {
    /// Provider that produced the document (e.g. "duckduckgo").
    pub provider: String,
    /// Source title.
    pub title: String,
    /// Source URL.
    pub url: String,
    /// Classified source type.
    pub source_type: SourceType,
    /// Credibility prior in [0,1], seeded from the source type.
    pub credibility: f64,
}

/// Lifecycle status of an evidence record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceStatus {
    /// Collected, awaiting quality scoring.
    Collected,
    /// Scored and live.
    Scored,
    /// Merged into a higher-credibility duplicate.
    Superseded { by: Uuid },
}

/// A raw document as returned by a search/fetch provider, before
/// normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDocument {
    pub title: String,
    pub url: String,
    pub content: String,
    /// Publish date if the provider knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

/// A normalized, scored unit of collected information tied to a pillar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    /// Unique identifier.
    pub id: Uuid,
    /// The pillar this evidence supports.
    pub pillar_id: Uuid,
    /// Where it came from.
    pub source: SourceDescriptor,
    /// Raw content as collected.
    pub content: String,
    /// Extracted summary (first lines until a model summarizer fills it in).
    pub summary: String,
    /// Sha-256 of normalized content; exact dedup key.
    pub content_hash: String,
    /// Quality score, present once the evaluator has run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityScore>,
    /// Lifecycle status.
    pub status: EvidenceStatus,
    /// Publish date if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    /// The iteration in which this evidence was collected.
    pub iteration: u32,
    /// When this record was created.
    pub created_at: DateTime<Utc>,
}

impl Evidence {
    /// Normalize a raw document into an evidence record for a pillar.
    pub fn from_raw(
        raw: RawDocument,
        pillar_id: Uuid,
        provider: &str,
        company_site: Option<&str>,
        iteration: u32,
    ) -> Self {
        let source_type = SourceType::classify(&raw.url, &raw.title, company_site);
        let content_hash = content_hash(&raw.content);
        let summary = extract_summary(&raw.content);

        Self {
            id: Uuid::new_v4(),
            pillar_id,
            source: SourceDescriptor {
                provider: provider.to_string(),
                title: raw.title,
                url: raw.url,
                source_type,
                credibility: source_type.credibility_prior(),
            },
            content: raw.content,
            summary,
            content_hash,
            quality: None,
            status: EvidenceStatus::Collected,
            published_at: raw.published_at,
            iteration,
            created_at: Utc::now(),
        }
    }

    /// Whether this record is live (not superseded by a duplicate).
    pub fn is_live(&self) -> bool {
        !matches!(self.status, EvidenceStatus::Superseded { .. })
    }

    /// Overall quality, 0.0 until scored.
    pub fn overall_quality(&self) -> f64 {
        self.quality.as_ref().map(|q| q.overall).unwrap_or(0.0)
    }
}

/// Sha-256 hex digest of whitespace-normalized, lowercased content.
pub fn content_hash(content: &str) -> String {
    let normalized: String = content.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.to_lowercase().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// First ~3 sentences of content; a degraded summary used until a model
/// summarizer replaces it.
fn extract_summary(content: &str) -> String {
    let mut out = String::new();
    for (i, sentence) in content.split_terminator(['.', '\n']).enumerate() {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        if i >= 3 || out.len() + sentence.len() > 400 {
            break;
        }
        out.push_str(sentence);
        out.push_str(". ");
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(title: &str, url: &str, content: &str) -> RawDocument {
        RawDocument {
            title: title.into(),
            url: url.into(),
            content: content.into(),
            published_at: None,
        }
    }

    #[test]
    fn test_classify_regulatory() {
        let t = SourceType::classify("https://sec.gov/Archives/acme-10-k", "Acme 10-K", None);
        assert_eq!(t, SourceType::RegulatoryFiling);
    }

    #[test]
    fn test_classify_company_site() {
        let t = SourceType::classify(
            "https://acme.example/pricing",
            "Pricing",
            Some("https://acme.example"),
        );
        assert_eq!(t, SourceType::CompanySite);
    }

    #[test]
    fn test_classify_forum() {
        let t = SourceType::classify("https://reddit.com/r/saas/123", "Acme review", None);
        assert_eq!(t, SourceType::Forum);
    }

    #[test]
    fn test_classify_unknown_falls_back_to_other() {
        let t = SourceType::classify("https://example.org/misc", "Misc", None);
        assert_eq!(t, SourceType::Other);
    }

    #[test]
    fn test_credibility_priors_bounded() {
        for t in [
            SourceType::RegulatoryFiling,
            SourceType::Academic,
            SourceType::IndustryReport,
            SourceType::News,
            SourceType::CompanySite,
            SourceType::Blog,
            SourceType::Forum,
            SourceType::Other,
        ] {
            assert!((0.0..=1.0).contains(&t.credibility_prior()));
            assert!((0.0..=1.0).contains(&t.bias_prior()));
        }
    }

    #[test]
    fn test_content_hash_ignores_whitespace_and_case() {
        let a = content_hash("Acme grew  ARR 40%\nyear over year");
        let b = content_hash("acme grew arr 40% year over year");
        assert_eq!(a, b);
        let c = content_hash("acme grew arr 41% year over year");
        assert_ne!(a, c);
    }

    #[test]
    fn test_from_raw_normalization() {
        let pillar = Uuid::new_v4();
        let evidence = Evidence::from_raw(
            raw(
                "Acme Q3 results",
                "https://reuters.com/news/acme-q3",
                "Acme reported 40% ARR growth. Margins expanded. Churn fell.",
            ),
            pillar,
            "duckduckgo",
            None,
            1,
        );
        assert_eq!(evidence.pillar_id, pillar);
        assert_eq!(evidence.source.source_type, SourceType::News);
        assert_eq!(evidence.status, EvidenceStatus::Collected);
        assert!(!evidence.content_hash.is_empty());
        assert!(evidence.summary.contains("ARR growth"));
        assert!(evidence.is_live());
    }

    #[test]
    fn test_superseded_is_not_live() {
        let mut evidence = Evidence::from_raw(
            raw("t", "https://example.org", "content"),
            Uuid::new_v4(),
            "mock",
            None,
            0,
        );
        evidence.status = EvidenceStatus::Superseded { by: Uuid::new_v4() };
        assert!(!evidence.is_live());
    }
}
