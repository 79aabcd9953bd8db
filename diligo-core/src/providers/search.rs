//! Search/crawl provider abstraction and implementations.
//!
//! Providers expose `search(query) -> [RawDocument]` and
//! `fetch(url) -> RawDocument`. All calls run under the caller's timeout;
//! rate limits and timeouts are retryable via the job queue, `NotFound` is
//! not.

use crate::error::ProviderError;
use crate::evidence::RawDocument;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// A pluggable source of raw documents.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Provider name, used in source descriptors and logs.
    fn name(&self) -> &str;

    /// Run a search query, returning candidate documents.
    async fn search(&self, query: &str) -> Result<Vec<RawDocument>, ProviderError>;

    /// Fetch one URL as a document.
    async fn fetch(&self, url: &str) -> Result<RawDocument, ProviderError>;

    /// Max concurrent in-flight calls this provider tolerates.
    fn concurrency_limit(&self) -> usize {
        4
    }
}

/// Web search via the DuckDuckGo instant answers API (no API key needed).
pub struct HttpSearchProvider {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpSearchProvider {
    pub fn new(timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("diligo/0.3")
            .build()
            .map_err(|e| ProviderError::RequestFailed {
                provider: "duckduckgo".into(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, timeout })
    }

    fn map_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout {
                provider: "duckduckgo".into(),
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            ProviderError::RequestFailed {
                provider: "duckduckgo".into(),
                message: err.to_string(),
            }
        }
    }

    fn map_status(&self, status: reqwest::StatusCode, url: &str) -> Option<ProviderError> {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Some(ProviderError::RateLimited {
                provider: "duckduckgo".into(),
                retry_after_secs: 30,
            })
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Some(ProviderError::NotFound { url: url.into() })
        } else if !status.is_success() {
            Some(ProviderError::RequestFailed {
                provider: "duckduckgo".into(),
                message: format!("HTTP {status}"),
            })
        } else {
            None
        }
    }
}

#[async_trait]
impl SearchProvider for HttpSearchProvider {
    fn name(&self) -> &str {
        "duckduckgo"
    }

    async fn search(&self, query: &str) -> Result<Vec<RawDocument>, ProviderError> {
        let url = format!(
            "https://api.duckduckgo.com/?q={}&format=json&no_html=1&skip_disambig=1",
            urlencoding::encode(query)
        );
        debug!(provider = "duckduckgo", query, "search request");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        if let Some(err) = self.map_status(response.status(), &url) {
            return Err(err);
        }

        let body: serde_json::Value = response.json().await.map_err(|e| self.map_error(e))?;
        let mut documents = Vec::new();

        if let Some(abstract_text) = body.get("AbstractText").and_then(|v| v.as_str()) {
            if !abstract_text.is_empty() {
                documents.push(RawDocument {
                    title: body
                        .get("Heading")
                        .and_then(|v| v.as_str())
                        .unwrap_or(query)
                        .to_string(),
                    url: body
                        .get("AbstractURL")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    content: abstract_text.to_string(),
                    published_at: None,
                });
            }
        }

        if let Some(topics) = body.get("RelatedTopics").and_then(|v| v.as_array()) {
            for topic in topics {
                let (Some(text), Some(url)) = (
                    topic.get("Text").and_then(|v| v.as_str()),
                    topic.get("FirstURL").and_then(|v| v.as_str()),
                ) else {
                    continue;
                };
                documents.push(RawDocument {
                    title: text.chars().take(80).collect(),
                    url: url.to_string(),
                    content: text.to_string(),
                    published_at: None,
                });
            }
        }

        Ok(documents)
    }

    async fn fetch(&self, url: &str) -> Result<RawDocument, ProviderError> {
        debug!(provider = "duckduckgo", url, "fetch request");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        if let Some(err) = self.map_status(response.status(), url) {
            return Err(err);
        }

        let text = response.text().await.map_err(|e| self.map_error(e))?;
        Ok(RawDocument {
            title: url.to_string(),
            url: url.to_string(),
            content: strip_tags(&text),
            published_at: None,
        })
    }
}

/// Crude tag stripper for fetched HTML; enough for scoring heuristics.
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
