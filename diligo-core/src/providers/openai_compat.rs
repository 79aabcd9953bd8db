//! OpenAI-compatible model provider.
//!
//! Works against OpenAI, Azure OpenAI, Ollama, vLLM, and any endpoint
//! following the chat completions API. Completions are requested in JSON
//! mode and parsed into `serde_json::Value` for schema validation by the
//! provider pool.

use crate::config::ModelProviderConfig;
use crate::error::ModelError;
use crate::providers::{ModelProvider, OutputSchema};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

/// OpenAI-compatible structured-completion provider.
pub struct OpenAiCompatProvider {
    client: Client,
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    timeout_secs: u64,
}

impl OpenAiCompatProvider {
    /// Create a provider from configuration.
    ///
    /// Reads the API key from the environment variable named in
    /// `config.api_key_env`. Local endpoints (localhost / 127.0.0.1) do
    /// not require a key; a dummy bearer token is used.
    pub fn new(config: &ModelProviderConfig) -> Result<Self, ModelError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let is_local = base_url.contains("localhost") || base_url.contains("127.0.0.1");

        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| {
                if is_local {
                    debug!(provider = %config.name, "local endpoint, using dummy bearer token");
                    Some("local".to_string())
                } else {
                    None
                }
            })
            .ok_or_else(|| ModelError::ApiRequest {
                provider: config.name.clone(),
                message: format!("env var '{}' not set", config.api_key_env),
            })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ModelError::ApiRequest {
                provider: config.name.clone(),
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            name: config.name.clone(),
            base_url,
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout_secs: config.timeout_secs,
        })
    }

    fn build_body(&self, prompt: &str, schema: &OutputSchema) -> Value {
        let system = format!(
            "You are a research assistant. Respond with a single JSON object containing the fields: {}.",
            schema.required_fields.join(", ")
        );
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt },
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "response_format": { "type": "json_object" },
            "stream": false,
        })
    }

    /// Pull the assistant message text out of a chat completions body.
    fn extract_content(body: &Value) -> Result<&str, ModelError> {
        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| ModelError::ValidationFailed {
                reason: "no message content in completion response".into(),
            })
    }

    fn map_http_error(&self, status: reqwest::StatusCode, body: &str) -> ModelError {
        match status.as_u16() {
            429 => ModelError::RateLimited {
                provider: self.name.clone(),
            },
            code => ModelError::ApiRequest {
                provider: self.name.clone(),
                message: format!("HTTP {code}: {body}"),
            },
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, prompt: &str, schema: &OutputSchema) -> Result<Value, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(provider = %self.name, model = %self.model, "sending completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&self.build_body(prompt, schema))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout {
                        timeout_secs: self.timeout_secs,
                    }
                } else {
                    ModelError::ApiRequest {
                        provider: self.name.clone(),
                        message: format!("request failed: {e}"),
                    }
                }
            })?;

        let status = response.status();
        let body_text = response.text().await.map_err(|e| ModelError::ApiRequest {
            provider: self.name.clone(),
            message: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(self.map_http_error(status, &body_text));
        }

        let body: Value =
            serde_json::from_str(&body_text).map_err(|e| ModelError::ValidationFailed {
                reason: format!("response is not JSON: {e}"),
            })?;
        let content = Self::extract_content(&body)?;

        serde_json::from_str(content).map_err(|e| ModelError::ValidationFailed {
            reason: format!("completion content is not a JSON object: {e}"),
        })
    }
}
