//! Configuration for the research engine.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! environment. Configuration is loaded from `~/.config/diligo/config.toml`
//! and/or `.diligo/config.toml` in the working directory; environment
//! variables are prefixed `DILIGO_` with `__` as the section separator
//! (e.g. `DILIGO_ENGINE__MAX_ITERATIONS`).

use crate::coverage::ConvergenceConfig;
use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiligoConfig {
    pub engine: EngineConfig,
    pub search: SearchConfig,
    pub quality: QualityConfig,
    pub queues: QueuesConfig,
    pub storage: StorageConfig,
    /// Model providers in failover priority order. Empty means heuristic
    /// summaries and extraction only; the engine still runs.
    #[serde(default)]
    pub models: Vec<ModelProviderConfig>,
}

/// Core engine knobs: iteration cap, convergence, and dedup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard cap on refinement iterations per run.
    pub max_iterations: u32,
    pub convergence: ConvergenceConfig,
    /// Quality mass at which a pillar counts as fully covered (2.0 means
    /// two perfect-quality records saturate it).
    pub coverage_target_mass: f64,
    /// Cosine similarity above which two evidence records are duplicates.
    pub dedup_similarity: f64,
    /// Embedding dimensionality of the local hashing embedder.
    pub embedding_dimensions: usize,
    /// Queries per unit of pillar weight in the initial batch.
    pub queries_per_weight: usize,
    /// Query cap per pillar per batch.
    pub max_queries_per_pillar: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            convergence: ConvergenceConfig::default(),
            coverage_target_mass: 2.0,
            dedup_similarity: 0.92,
            embedding_dimensions: 256,
            queries_per_weight: 2,
            max_queries_per_pillar: 6,
        }
    }
}

/// Search provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// HTTP timeout per search/fetch request in seconds.
    pub request_timeout_secs: u64,
    /// Documents kept per query.
    pub max_docs_per_query: usize,
    /// Results whose content is shorter than this many characters are
    /// followed to their source page for the full text. 0 disables the
    /// follow-up fetch.
    pub fetch_full_below: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 15,
            max_docs_per_query: 5,
            fetch_full_below: 300,
        }
    }
}

/// Quality evaluation knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Half-life of the recency decay in days.
    pub recency_half_life_days: f64,
    /// Evidence below this overall quality is excluded from coverage and
    /// citation.
    pub quality_floor: f64,
    /// Top evidence records cited per pillar section.
    pub citations_per_pillar: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            recency_half_life_days: 365.0,
            quality_floor: 0.4,
            citations_per_pillar: 5,
        }
    }
}

/// One typed queue's pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub attempt_timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl QueueConfig {
    fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            attempt_timeout_secs: 20,
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// Pool settings for the four typed queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuesConfig {
    pub search: QueueConfig,
    pub analysis: QueueConfig,
    pub quality: QueueConfig,
    pub orchestration: QueueConfig,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            search: QueueConfig::with_concurrency(8),
            analysis: QueueConfig::with_concurrency(8),
            quality: QueueConfig::with_concurrency(4),
            orchestration: QueueConfig::with_concurrency(2),
        }
    }
}

/// Durable storage location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding run snapshots. Defaults to the platform data dir.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = directories::ProjectDirs::from("dev", "diligo", "diligo")
            .map(|dirs| dirs.data_dir().join("runs"))
            .unwrap_or_else(|| PathBuf::from(".diligo/runs"));
        Self { data_dir }
    }
}

/// An OpenAI-compatible model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProviderConfig {
    /// Name used in logs and failover ordering.
    pub name: String,
    pub model: String,
    /// Defaults to the OpenAI API when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    /// Task kinds this provider serves; empty means all.
    #[serde(default)]
    pub tasks: Vec<String>,
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed `DILIGO_`)
/// 2. Working-directory config (`.diligo/config.toml`)
/// 3. User config (`~/.config/diligo/config.toml`)
/// 4. Built-in defaults
pub fn load_config(workdir: Option<&Path>) -> Result<DiligoConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(DiligoConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "diligo", "diligo") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(workdir) = workdir {
        let local_config = workdir.join(".diligo").join("config.toml");
        if local_config.exists() {
            figment = figment.merge(Toml::file(&local_config));
        }
    }

    figment = figment.merge(Env::prefixed("DILIGO_").split("__"));

    let config: DiligoConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &DiligoConfig) -> Result<(), ConfigError> {
    if config.engine.max_iterations == 0 {
        return Err(ConfigError::Invalid {
            message: "engine.max_iterations must be at least 1".into(),
        });
    }
    if !(0.0..=1.0).contains(&config.engine.dedup_similarity) {
        return Err(ConfigError::Invalid {
            message: "engine.dedup_similarity must be in [0,1]".into(),
        });
    }
    let c = &config.engine.convergence;
    for (name, value) in [
        ("coverage_target", c.coverage_target),
        ("quality_bar", c.quality_bar),
        ("quality_floor", config.quality.quality_floor),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(ConfigError::Invalid {
                message: format!("{name} must be in [0,1]"),
            });
        }
    }
    Ok(())
}
