//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.agentflow.toml` files.

use crate::backend::BackendKind;
use crate::chunker::DEFAULT_CHARS_PER_UNIT;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = ".agentflow.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Model backend settings.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Oversized prompt handling.
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Retry policy for transient backend failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Directory that receives agent artifacts and the run report.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Maximum backend calls in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Abort the run after this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_seconds: Option<u64>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            verbose: false,
            concurrency: default_concurrency(),
            run_timeout_seconds: None,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("agentflow_output")
}

fn default_concurrency() -> usize {
    4
}

/// Model backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Which hosted API to call.
    #[serde(default)]
    pub kind: BackendKind,

    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL of the API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Cloud region of the managed API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Total context window of the model, in units.
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    /// Default response limit, in tokens.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Default sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Gateway session token JSON; `CDP_TOKEN` is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Role ARN the managed backend assumes before calling the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assume_role: Option<String>,

    /// Security token service URL; the regional endpoint when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sts_endpoint: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            model: default_model(),
            endpoint: None,
            region: None,
            context_window: default_context_window(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
            timeout_seconds: default_timeout(),
            token: None,
            assume_role: None,
            sts_endpoint: None,
        }
    }
}

fn default_model() -> String {
    "anthropic.claude-3-5-sonnet-20240620-v1:0".to_string()
}

fn default_context_window() -> usize {
    200_000
}

fn default_max_output_tokens() -> u32 {
    64_000
}

fn default_temperature() -> f32 {
    0.1
}

fn default_timeout() -> u64 {
    1800 // 30 min; long reviews of a whole repository take a while
}

/// Oversized prompt handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Split oversized inputs across several calls.
    #[serde(default = "default_true", alias = "chunking")]
    pub enabled: bool,

    /// Cut oversized prompts to the budget when chunking is off.
    #[serde(default)]
    pub truncate: bool,

    /// Units repeated between consecutive chunks.
    #[serde(default)]
    pub overlap: usize,

    /// Characters per estimated backend token.
    #[serde(default = "default_chars_per_unit")]
    pub chars_per_unit: f64,

    /// Split at `# File:` headers and repeat the header in split files.
    #[serde(default = "default_true")]
    pub file_sections: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            truncate: false,
            overlap: 0,
            chars_per_unit: default_chars_per_unit(),
            file_sections: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_chars_per_unit() -> f64 {
    DEFAULT_CHARS_PER_UNIT
}

/// Retry policy for transient backend failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    30_000
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// Only values given explicitly on the command line override the file.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref dir) = args.output_dir {
            self.general.output_dir = dir.clone();
        }
        if let Some(concurrency) = args.concurrency {
            self.general.concurrency = concurrency;
        }
        if args.run_timeout.is_some() {
            self.general.run_timeout_seconds = args.run_timeout;
        }
        if args.verbose {
            self.general.verbose = true;
        }

        if let Some(kind) = args.backend {
            self.backend.kind = kind;
        }
        if let Some(ref model) = args.model {
            self.backend.model = model.clone();
        }
        if args.endpoint.is_some() {
            self.backend.endpoint = args.endpoint.clone();
        }
        if args.assume_role.is_some() {
            self.backend.assume_role = args.assume_role.clone();
        }
        if args.region.is_some() {
            self.backend.region = args.region.clone();
        }
        if let Some(window) = args.context_window {
            self.backend.context_window = window;
        }
        if let Some(max_output) = args.max_output_tokens {
            self.backend.max_output_tokens = max_output;
        }
        if let Some(temperature) = args.temperature {
            self.backend.temperature = temperature;
        }
        if let Some(timeout) = args.timeout {
            self.backend.timeout_seconds = timeout;
        }

        // Chunking flags - only override if explicitly provided via CLI
        if args.chunk {
            self.chunking.enabled = true;
        } else if args.no_chunk {
            self.chunking.enabled = false;
        }
        if args.truncate {
            self.chunking.truncate = true;
        }
        if args.no_file_sections {
            self.chunking.file_sections = false;
        }
        if let Some(overlap) = args.overlap {
            self.chunking.overlap = overlap;
        }
        if let Some(ratio) = args.chars_per_unit {
            self.chunking.chars_per_unit = ratio;
        }

        if let Some(retries) = args.max_retries {
            self.retry.max_retries = retries;
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
