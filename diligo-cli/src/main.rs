//! Diligo CLI — run and inspect thesis research from the terminal.

use anyhow::Context;
use clap::Parser;
use diligo_core::config::ModelProviderConfig;
use diligo_core::{
    DiligoConfig, HttpSearchProvider, JsonFileStore, OpenAiCompatProvider, ProviderPool,
    ResearchEngine, TaskKind, Thesis, render_markdown,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Diligo: iterative, evidence-driven investment research
#[derive(Parser, Debug)]
#[command(name = "diligo", version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a research run from a thesis file and drive it to completion
    Run {
        /// Path to the thesis TOML file
        thesis: PathBuf,

        /// Override the configured iteration cap
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Write the report markdown here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Resume an interrupted run
    Resume {
        /// Run id
        id: Uuid,
    },
    /// Show the status of a run
    Status {
        /// Run id
        id: Uuid,
    },
    /// Print the finished report of a run
    Report {
        /// Run id
        id: Uuid,

        /// Emit the report as JSON instead of markdown
        #[arg(long)]
        json: bool,
    },
    /// List known runs
    List,
}

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn task_kind(name: &str) -> Option<TaskKind> {
    match name {
        "interpret_thesis" => Some(TaskKind::InterpretThesis),
        "phrase_queries" => Some(TaskKind::PhraseQueries),
        "summarize" => Some(TaskKind::Summarize),
        "report_prose" => Some(TaskKind::ReportProse),
        _ => None,
    }
}

const ALL_TASKS: [TaskKind; 4] = [
    TaskKind::InterpretThesis,
    TaskKind::PhraseQueries,
    TaskKind::Summarize,
    TaskKind::ReportProse,
];

/// Build the model pool from configuration. Providers that fail to
/// construct (usually a missing API key) are skipped with a warning; the
/// engine degrades to heuristics without any.
fn build_model_pool(providers: &[ModelProviderConfig]) -> ProviderPool {
    let mut pool = ProviderPool::new(2);
    for config in providers {
        let provider = match OpenAiCompatProvider::new(config) {
            Ok(provider) => Arc::new(provider),
            Err(err) => {
                tracing::warn!(provider = %config.name, error = %err, "model provider skipped");
                continue;
            }
        };
        let tasks: Vec<TaskKind> = if config.tasks.is_empty() {
            ALL_TASKS.to_vec()
        } else {
            config
                .tasks
                .iter()
                .filter_map(|t| {
                    let kind = task_kind(t);
                    if kind.is_none() {
                        tracing::warn!(provider = %config.name, task = %t, "unknown task, ignored");
                    }
                    kind
                })
                .collect()
        };
        for task in tasks {
            pool.register(task, provider.clone());
        }
    }
    pool
}

fn build_engine(config: DiligoConfig) -> anyhow::Result<ResearchEngine> {
    let store = Arc::new(JsonFileStore::new(config.storage.data_dir.clone()));
    let search = Arc::new(HttpSearchProvider::new(std::time::Duration::from_secs(
        config.search.request_timeout_secs,
    ))?);
    let models = build_model_pool(&config.models);
    Ok(ResearchEngine::new(config, store, search, models))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let mut config =
        diligo_core::load_config(std::env::current_dir().ok().as_deref()).context("configuration")?;

    match cli.command {
        Commands::Run {
            thesis,
            max_iterations,
            output,
        } => {
            if let Some(max) = max_iterations {
                config.engine.max_iterations = max;
            }
            let quiet = cli.quiet;
            let engine = build_engine(config)?.with_progress(move |status| {
                if !quiet {
                    eprintln!(
                        "[{}] iteration {}/{}, {} evidence records",
                        status.status,
                        status.iteration_count,
                        status.max_iterations,
                        status.evidence_count
                    );
                }
            });
            let engine = Arc::new(engine);

            let input = std::fs::read_to_string(&thesis)
                .with_context(|| format!("reading {}", thesis.display()))?;
            let thesis = Thesis::from_toml(&input)?;

            let id = engine.start_run(thesis).await?;
            println!("run {id}");

            // Ctrl-C requests cooperative cancellation; the run settles at
            // its next checkpoint and remains resumable state on disk.
            let signal_engine = engine.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("cancelling...");
                    let _ = signal_engine.cancel(id).await;
                }
            });

            let status = engine.run_to_completion(id).await?;
            eprintln!("run {} finished: {}", id, status.status);

            if let Ok(report) = engine.get_report(id).await {
                let markdown = render_markdown(&report);
                match output {
                    Some(path) => std::fs::write(&path, markdown)
                        .with_context(|| format!("writing {}", path.display()))?,
                    None => println!("{markdown}"),
                }
            }
        }
        Commands::Resume { id } => {
            let engine = build_engine(config)?;
            let status = engine.run_to_completion(id).await?;
            println!("run {} settled: {}", id, status.status);
        }
        Commands::Status { id } => {
            let engine = build_engine(config)?;
            let status = engine.get_status(id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Report { id, json } => {
            let engine = build_engine(config)?;
            let report = engine.get_report(id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", render_markdown(&report));
            }
        }
        Commands::List => {
            let engine = build_engine(config)?;
            for run in engine.list_runs().await? {
                println!(
                    "{}  {}  iteration {}/{}  {} evidence  {} errors",
                    run.run_id,
                    run.status,
                    run.iteration_count,
                    run.max_iterations,
                    run.evidence_count,
                    run.error_count
                );
            }
        }
    }

    Ok(())
}
