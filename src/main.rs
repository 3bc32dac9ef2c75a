//! agentflow - declarative LLM agent workflows
//!
//! A CLI tool that runs a graph of LLM agents over the materialized text of
//! a repository, threading each agent's output into its dependents and
//! keeping every call within the model's context window.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (backend, config, I/O, etc.)
//!   2 - Invalid workflow description
//!   130 - Run cancelled (Ctrl-C or run timeout)

mod backend;
mod chunker;
mod cli;
mod config;
mod error;
mod executor;
mod graph;
mod models;
mod prompt;
mod report;

use anyhow::{Context, Result};
use backend::{BackendSettings, RetryPolicy};
use chrono::Utc;
use cli::Args;
use config::{Config, DEFAULT_CONFIG_FILE};
use error::{GraphError, RunError};
use executor::{ChunkingPolicy, DagExecutor, Strategy};
use graph::{GraphDescription, WorkflowGraph};
use report::{RunMetadata, RunReport};
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

const EXIT_CANCELLED: i32 = 130;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    let mut config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    // Initialize logging
    init_logging(&args, config.general.verbose);

    info!("agentflow v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run_workflow(args, config).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) if e.downcast_ref::<GraphError>().is_some() => {
            error!("Invalid workflow: {:#}", e);
            eprintln!("\n❌ Invalid workflow: {:#}", e);
            std::process::exit(2);
        }
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .agentflow.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to choose the backend, model, and chunking policy.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args, verbose_by_default: bool) {
    let level = if verbose_by_default && !args.quiet {
        tracing::Level::DEBUG
    } else {
        args.log_level()
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Run the complete workflow. Returns the process exit code.
async fn run_workflow(args: Args, config: Config) -> Result<i32> {
    let start_time = Instant::now();

    // Step 1: Load and validate the workflow
    println!("📋 Loading workflow: {}", args.workflow.display());
    let description = GraphDescription::load(&args.workflow)?;
    let graph = WorkflowGraph::from_description(&description)
        .with_context(|| format!("Invalid workflow: {}", args.workflow.display()))?;

    let order: Vec<&str> = graph.execution_order().map(|a| a.name.as_str()).collect();
    println!("   Agents: {}", graph.len());
    println!("   Order: {}", order.join(" → "));

    // Step 2: Read the root input
    let input = read_input(&args)?;
    let input_chars = input.chars().count();
    info!("Read {} chars of input", input_chars);

    let policy = ChunkingPolicy::from(&config.chunking);
    let settings = BackendSettings::from(&config.backend);

    // Handle --dry-run: estimate prompt sizes and exit
    if args.dry_run {
        return handle_dry_run(&graph, &input, policy, &settings);
    }

    // Step 3: Connect to the backend
    println!("\n🤖 Initializing backend...");
    println!("   Backend: {}", settings.kind);
    println!("   Model: {}", settings.model);
    println!("   Context window: {} tokens", settings.context_window);
    println!("   Timeout: {}s", settings.timeout.as_secs());

    if let Some(role) = &settings.assume_role {
        println!("   Role: {}", role);
    }

    let backend = backend::build_backend(&settings, RetryPolicy::from(&config.retry)).await?;
    let executor = DagExecutor::new(backend.clone(), policy)
        .with_concurrency(config.general.concurrency)
        .with_progress(!args.quiet);

    // Step 4: Run the agents
    let cancel = CancellationToken::new();
    let watchers = spawn_cancellation(&cancel, config.general.run_timeout_seconds);

    println!("\n🔬 Running {} agents...\n", graph.len());
    let outcome = executor.run(&graph, input, &cancel).await;
    for watcher in watchers {
        watcher.abort();
    }

    let ctx = match outcome {
        Ok(ctx) => ctx,
        Err(RunError::Cancelled { completed, total }) => {
            eprintln!(
                "\n⛔ Run cancelled after {} of {} agents. No report written.",
                completed, total
            );
            return Ok(EXIT_CANCELLED);
        }
        Err(e) => return Err(e.into()),
    };

    // Step 5: Write artifacts and the report
    println!("\n📝 Writing outputs...");
    let output_dir = &config.general.output_dir;
    let artifacts = report::write_artifacts(&graph, &ctx, output_dir)?;

    let metadata = RunMetadata {
        workflow: args.workflow.display().to_string(),
        backend: backend.name().to_string(),
        model: backend.model().to_string(),
        run_date: Utc::now(),
        duration_seconds: start_time.elapsed().as_secs_f64(),
        input_chars,
    };
    let run_report = RunReport::from_run(metadata, &graph, &ctx);
    let report_path = report::write_report(&run_report, output_dir, args.format)?;

    // Print summary
    let totals = &run_report.totals;
    println!("\n📊 Run Summary:");
    println!("   Agents: {}", totals.agents);
    println!("   Backend calls: {}", totals.calls);
    println!(
        "   Tokens: {} in / {} out",
        totals.usage.input_tokens, totals.usage.output_tokens
    );
    if totals.truncated_inputs > 0 {
        println!("   ⚠️  Truncated inputs: {}", totals.truncated_inputs);
    }
    println!("   Artifacts: {}", artifacts.len());
    println!("   Duration: {:.1}s", run_report.metadata.duration_seconds);
    println!(
        "\n✅ Workflow complete! Report saved to: {}",
        report_path.display()
    );

    Ok(0)
}

/// Cancel the run on Ctrl-C or once the run timeout elapses.
fn spawn_cancellation(
    cancel: &CancellationToken,
    run_timeout_seconds: Option<u64>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut watchers = Vec::new();

    let token = cancel.clone();
    watchers.push(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            token.cancel();
        }
    }));

    if let Some(secs) = run_timeout_seconds {
        let token = cancel.clone();
        watchers.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!("Run timeout of {}s reached, cancelling run", secs);
            token.cancel();
        }));
    }

    watchers
}

/// Handle --dry-run: estimate each agent's prompt without calling the model.
fn handle_dry_run(
    graph: &WorkflowGraph,
    input: &str,
    policy: ChunkingPolicy,
    settings: &BackendSettings,
) -> Result<i32> {
    println!("\n🔍 Dry run: estimating prompt sizes (no LLM call)...\n");

    let plans = executor::plan(
        graph,
        input,
        policy,
        settings.context_window,
        settings.default_params(),
    )?;

    for (i, plan) in plans.iter().enumerate() {
        let marker = match plan.strategy {
            Strategy::Single => "📄",
            Strategy::Chunked { .. } => "✂️ ",
            Strategy::Truncated => "⚠️ ",
            Strategy::TooLarge => "⛔",
        };
        println!(
            "   {} {}. {} ({} / {} tokens): {}",
            marker,
            i + 1,
            plan.agent,
            plan.units,
            plan.budget,
            plan.strategy
        );
    }

    let blocked = plans
        .iter()
        .filter(|p| p.strategy == Strategy::TooLarge)
        .count();
    if blocked > 0 {
        println!(
            "\n   {} agent(s) would fail: enable chunking or truncation, or raise the context window.",
            blocked
        );
    }

    println!("\n✅ Dry run complete. No LLM calls were made.");
    Ok(0)
}

/// Read the root input from the given file or stdin.
fn read_input(args: &Args) -> Result<String> {
    match args.input_file() {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read input file: {}", path.display())),
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read input from stdin")?;
            Ok(buffer)
        }
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => Ok(config),
        Ok(None) => Ok(Config::default()),
        Err(e) => {
            eprintln!("⚠️  Ignoring {}: {:#}", DEFAULT_CONFIG_FILE, e);
            Ok(Config::default())
        }
    }
}
