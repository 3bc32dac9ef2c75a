//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation. Options left unset fall back to the
//! configuration file, then to built-in defaults.

use crate::backend::BackendKind;
use clap::Parser;
use std::path::{Path, PathBuf};

/// agentflow - run declarative LLM agent workflows over a repository
///
/// Reads a workflow of agents from a TOML file, feeds the materialized
/// repository text to them in dependency order, and writes each agent's
/// output plus a run report.
///
/// Examples:
///   agentflow --input codebase.md
///   agentflow --workflow security.toml --input - --backend managed
///   agentflow --input codebase.md --no-chunk --truncate
///   agentflow --input codebase.md --dry-run
///   agentflow --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Workflow description file
    #[arg(short, long, default_value = "agents.toml", value_name = "FILE")]
    pub workflow: PathBuf,

    /// Repository text fed to the workflow as `{input}`; `-` reads stdin
    #[arg(
        short,
        long,
        value_name = "FILE",
        required_unless_present = "init_config"
    )]
    pub input: Option<PathBuf>,

    /// Directory for agent artifacts and the run report
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .agentflow.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Model backend to call
    #[arg(long, value_name = "KIND")]
    pub backend: Option<BackendKind>,

    /// Model identifier
    ///
    /// Can also be set via AGENTFLOW_MODEL env var or .agentflow.toml config.
    #[arg(short, long, env = "AGENTFLOW_MODEL")]
    pub model: Option<String>,

    /// Base URL of the backend API
    #[arg(long, value_name = "URL")]
    pub endpoint: Option<String>,

    /// Cloud region of the managed backend
    #[arg(long, value_name = "REGION")]
    pub region: Option<String>,

    /// Role the managed backend assumes for model calls
    #[arg(long, value_name = "ARN")]
    pub assume_role: Option<String>,

    /// Model context window, in tokens
    #[arg(long, value_name = "TOKENS")]
    pub context_window: Option<usize>,

    /// Default response limit, in tokens
    #[arg(long, value_name = "TOKENS")]
    pub max_output_tokens: Option<u32>,

    /// Temperature for LLM responses (0.0 - 1.0)
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Request timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Cancel the whole run after this many seconds
    #[arg(long, value_name = "SECS")]
    pub run_timeout: Option<u64>,

    /// Maximum backend calls in flight
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Split oversized inputs across several calls
    #[arg(long, conflicts_with = "no_chunk")]
    pub chunk: bool,

    /// Never split inputs
    #[arg(long, conflicts_with = "chunk")]
    pub no_chunk: bool,

    /// Cut oversized prompts to the budget when chunking is off
    #[arg(long)]
    pub truncate: bool,

    /// Tokens repeated between consecutive chunks
    #[arg(long, value_name = "TOKENS")]
    pub overlap: Option<usize>,

    /// Characters per estimated token
    #[arg(long, value_name = "RATIO")]
    pub chars_per_unit: Option<f64>,

    /// Split inputs by size only, ignoring `# File:` headers
    #[arg(long)]
    pub no_file_sections: bool,

    /// Retries for rate-limited or unavailable backends
    #[arg(long, value_name = "NUM")]
    pub max_retries: Option<u32>,

    /// Report format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Dry run: validate the workflow and estimate prompt sizes without calling the model
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default .agentflow.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl OutputFormat {
    /// File name of the run report in this format.
    pub fn report_file(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "report.md",
            OutputFormat::Json => "report.json",
        }
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Input file, or `None` when the input comes from stdin.
    pub fn input_file(&self) -> Option<&Path> {
        self.input.as_deref().filter(|p| *p != Path::new("-"))
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if let Some(ref endpoint) = self.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err("Endpoint URL must start with 'http://' or 'https://'".to_string());
            }
        }

        if let Some(temperature) = self.temperature {
            if !(0.0..=1.0).contains(&temperature) {
                return Err("Temperature must be between 0.0 and 1.0".to_string());
            }
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        if self.context_window == Some(0) {
            return Err("Context window must be at least 1 token".to_string());
        }

        if let Some(ratio) = self.chars_per_unit {
            if !ratio.is_finite() || ratio <= 0.0 {
                return Err("Characters per unit must be a positive number".to_string());
            }
        }

        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if self.timeout == Some(0) {
            return Err("Timeout must be at least 1 second".to_string());
        }
        if self.run_timeout == Some(0) {
            return Err("Run timeout must be at least 1 second".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
