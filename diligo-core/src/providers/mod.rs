//! External provider abstractions — language models and search/crawl.
//!
//! Model providers are named and poolable: the pool holds a priority-
//! ordered provider list per task kind and fails over on retryable errors.
//! Structured output is validated against a small closed schema; repeated
//! validation failures fall back to a degraded best-effort parse instead
//! of failing the run.

pub mod openai_compat;
pub mod search;

pub use openai_compat::OpenAiCompatProvider;
pub use search::{HttpSearchProvider, SearchProvider};

use crate::error::{ModelError, ProviderError};
use crate::evidence::RawDocument;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// The task a model completion serves; used to select a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Thesis interpretation and key-term extraction.
    InterpretThesis,
    /// Query phrasing refinement.
    PhraseQueries,
    /// Evidence summarization.
    Summarize,
    /// Report prose generation.
    ReportProse,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::InterpretThesis => "interpret_thesis",
            TaskKind::PhraseQueries => "phrase_queries",
            TaskKind::Summarize => "summarize",
            TaskKind::ReportProse => "report_prose",
        }
    }
}

/// A minimal closed output schema: required string fields the completion
/// must contain. Anything failing validation is retried, then degraded.
#[derive(Debug, Clone)]
pub struct OutputSchema {
    pub required_fields: Vec<&'static str>,
}

impl OutputSchema {
    pub fn new(required_fields: Vec<&'static str>) -> Self {
        Self { required_fields }
    }

    /// Validate a completion against the schema.
    pub fn validate(&self, value: &Value) -> Result<(), ModelError> {
        let Some(object) = value.as_object() else {
            return Err(ModelError::ValidationFailed {
                reason: "completion is not a JSON object".into(),
            });
        };
        for field in &self.required_fields {
            if !object.contains_key(*field) {
                return Err(ModelError::ValidationFailed {
                    reason: format!("missing required field '{field}'"),
                });
            }
        }
        Ok(())
    }
}

/// Trait for language-model providers returning structured JSON.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name for logs and pool selection.
    fn name(&self) -> &str;

    /// Complete a prompt, returning JSON intended to match `schema`.
    async fn complete(&self, prompt: &str, schema: &OutputSchema) -> Result<Value, ModelError>;
}

/// Priority-ordered pool of named model providers per task kind.
///
/// `complete` validates output against the schema, retries with a stricter
/// prompt up to `max_validation_retries`, fails over to the next provider
/// on retryable errors, and finally degrades to a best-effort parse rather
/// than failing the run.
pub struct ProviderPool {
    by_task: HashMap<TaskKind, Vec<Arc<dyn ModelProvider>>>,
    max_validation_retries: u32,
}

impl ProviderPool {
    pub fn new(max_validation_retries: u32) -> Self {
        Self {
            by_task: HashMap::new(),
            max_validation_retries: max_validation_retries.max(1),
        }
    }

    /// Register a provider for a task kind; earlier registrations are
    /// tried first.
    pub fn register(&mut self, task: TaskKind, provider: Arc<dyn ModelProvider>) {
        self.by_task.entry(task).or_default().push(provider);
    }

    /// Whether any provider serves this task.
    pub fn supports(&self, task: TaskKind) -> bool {
        self.by_task.get(&task).is_some_and(|v| !v.is_empty())
    }

    /// Run a structured completion for a task.
    pub async fn complete(
        &self,
        task: TaskKind,
        prompt: &str,
        schema: &OutputSchema,
    ) -> Result<Value, ModelError> {
        let providers = self
            .by_task
            .get(&task)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ModelError::NoProvider {
                task: task.as_str().into(),
            })?;

        let mut last_raw: Option<String> = None;

        for provider in providers {
            let mut prompt = prompt.to_string();
            for retry in 0..self.max_validation_retries {
                match provider.complete(&prompt, schema).await {
                    Ok(value) => match schema.validate(&value) {
                        Ok(()) => return Ok(value),
                        Err(err) => {
                            debug!(
                                provider = provider.name(),
                                task = task.as_str(),
                                retry,
                                error = %err,
                                "schema validation failed, narrowing prompt"
                            );
                            last_raw = Some(value.to_string());
                            prompt = format!(
                                "{prompt}\n\nRespond ONLY with a JSON object containing the fields: {}.",
                                schema.required_fields.join(", ")
                            );
                        }
                    },
                    Err(err) if err.is_retryable() => {
                        warn!(
                            provider = provider.name(),
                            task = task.as_str(),
                            error = %err,
                            "provider failed, trying next"
                        );
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        // Degraded extraction path: salvage what we can from the last raw
        // output instead of failing the run.
        if let Some(raw) = last_raw {
            warn!(task = task.as_str(), "falling back to degraded parse");
            return Ok(degraded_parse(&raw, schema));
        }

        Err(ModelError::AllProvidersFailed {
            task: task.as_str().into(),
        })
    }
}

/// Best-effort parse of malformed model output: take the first embedded
/// JSON object if one exists, then fill any missing required fields with
/// the raw text.
pub fn degraded_parse(raw: &str, schema: &OutputSchema) -> Value {
    let mut object = raw
        .find('{')
        .and_then(|start| raw.rfind('}').map(|end| (start, end)))
        .filter(|(start, end)| start < end)
        .and_then(|(start, end)| serde_json::from_str::<Value>(&raw[start..=end]).ok())
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();

    for field in &schema.required_fields {
        object
            .entry(field.to_string())
            .or_insert_with(|| Value::String(raw.trim().to_string()));
    }
    Value::Object(object)
}

// ---------------------------------------------------------------------------
// Mocks (exported for tests and offline runs)
// ---------------------------------------------------------------------------

/// A scripted model provider for tests.
pub struct MockModelProvider {
    name: String,
    responses: tokio::sync::Mutex<Vec<Result<Value, ModelError>>>,
}

impl MockModelProvider {
    /// Responses are returned in order; the last one repeats.
    pub fn new(name: impl Into<String>, responses: Vec<Result<Value, ModelError>>) -> Self {
        Self {
            name: name.into(),
            responses: tokio::sync::Mutex::new(responses),
        }
    }
}

#[async_trait]
impl ModelProvider for MockModelProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, _prompt: &str, _schema: &OutputSchema) -> Result<Value, ModelError> {
        let mut responses = self.responses.lock().await;
        if responses.len() > 1 {
            responses.remove(0)
        } else {
            responses
                .first()
                .cloned()
                .unwrap_or(Err(ModelError::ApiRequest {
                    provider: self.name.clone(),
                    message: "mock has no responses".into(),
                }))
        }
    }
}

/// A canned search provider for tests and offline runs: every query
/// returns the configured documents; fetch echoes the URL.
pub struct MockSearchProvider {
    name: String,
    documents: Vec<RawDocument>,
    /// Errors returned before any success, e.g. to simulate rate limits.
    failures: std::sync::Mutex<Vec<ProviderError>>,
}

impl MockSearchProvider {
    pub fn new(name: impl Into<String>, documents: Vec<RawDocument>) -> Self {
        Self {
            name: name.into(),
            documents,
            failures: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Queue errors to be returned before documents are served.
    pub fn with_failures(self, failures: Vec<ProviderError>) -> Self {
        if let Ok(mut slot) = self.failures.lock() {
            *slot = failures;
        }
        self
    }

    fn next_failure(&self) -> Option<ProviderError> {
        let mut failures = self.failures.lock().ok()?;
        if failures.is_empty() {
            None
        } else {
            Some(failures.remove(0))
        }
    }
}

#[async_trait]
impl SearchProvider for MockSearchProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, _query: &str) -> Result<Vec<RawDocument>, ProviderError> {
        if let Some(err) = self.next_failure() {
            return Err(err);
        }
        Ok(self.documents.clone())
    }

    async fn fetch(&self, url: &str) -> Result<RawDocument, ProviderError> {
        if let Some(err) = self.next_failure() {
            return Err(err);
        }
        Ok(RawDocument {
            title: url.to_string(),
            url: url.to_string(),
            content: format!("fetched content for {url}"),
            published_at: None,
        })
    }
}
