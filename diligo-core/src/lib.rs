//! # Diligo Core
//!
//! Core library for the Diligo research engine: an iterative, evidence-
//! driven engine that takes an investment thesis apart into weighted
//! pillars, gathers and scores evidence per pillar, refines its queries
//! until coverage converges, and synthesizes a cited report with a
//! confidence band.

pub mod collector;
pub mod config;
pub mod coverage;
pub mod dedup;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod persistence;
pub mod providers;
pub mod quality;
pub mod querygen;
pub mod queue;
pub mod report;
pub mod state;
pub mod store;
pub mod thesis;

// Re-export commonly used types at the crate root.
pub use config::{DiligoConfig, load_config};
pub use engine::ResearchEngine;
pub use error::{DiligoError, Result};
pub use providers::{
    HttpSearchProvider, MockModelProvider, MockSearchProvider, ModelProvider, OpenAiCompatProvider,
    ProviderPool, SearchProvider, TaskKind,
};
pub use report::{ConfidenceBand, Report, render_markdown};
pub use state::{ResearchState, ResearchStatus, RunStatus};
pub use store::{JsonFileStore, MemoryStore, StateStore};
pub use thesis::{Pillar, Thesis};
