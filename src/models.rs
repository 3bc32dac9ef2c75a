//! Data models for the workflow engine.
//!
//! This module contains the core data structures shared by the graph
//! constructor, the chunker, the backends and the executor.

use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::path::PathBuf;
use std::time::Duration;

/// Reserved context key holding the materialized repository text.
pub const ROOT_INPUT_KEY: &str = "input";

/// Per-agent generation parameters.
///
/// Unset fields fall back to the backend configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Upper bound on the response length, in tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl GenerationParams {
    /// Fill unset fields from `defaults`.
    pub fn or(self, defaults: GenerationParams) -> Self {
        Self {
            temperature: self.temperature.or(defaults.temperature),
            max_output_tokens: self.max_output_tokens.or(defaults.max_output_tokens),
        }
    }
}

/// A validated workflow step.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSpec {
    /// Unique agent name.
    pub name: String,
    /// Prompt template with `{key}` placeholders.
    pub template: String,
    /// Names of the agents this one depends on, in declaration order.
    pub depends_on: Vec<String>,
    /// Context key the output is stored under.
    pub output_key: String,
    /// Generation overrides for this agent.
    pub params: GenerationParams,
    /// Artifact path (relative to the output directory) for this agent's output.
    pub output: Option<PathBuf>,
}

/// A contiguous slice of a larger text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk text, including any overlap prefix.
    pub text: String,
    /// Zero-based position of this chunk.
    pub ordinal: usize,
    /// Total number of chunks the text was split into.
    pub total: usize,
    /// Byte length of the carried prefix: a repeated file header line plus
    /// the overlap taken from the text before this chunk.
    pub overlap_len: usize,
}

impl Chunk {
    /// The part of the chunk that is not carried from earlier text.
    #[cfg(test)]
    pub fn fresh_text(&self) -> &str {
        &self.text[self.overlap_len..]
    }

    /// One-based label such as `2/5`.
    pub fn label(&self) -> String {
        format!("{}/{}", self.ordinal + 1, self.total)
    }
}

/// One prompt sent to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendRequest {
    pub prompt: String,
    pub params: GenerationParams,
}

impl BackendRequest {
    pub fn new(prompt: impl Into<String>, params: GenerationParams) -> Self {
        Self {
            prompt: prompt.into(),
            params,
        }
    }
}

/// Token accounting reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// Text returned by a backend plus metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendResponse {
    pub text: String,
    /// The backend stopped because it reached the output limit.
    pub truncated: bool,
    pub usage: Option<Usage>,
}

impl BackendResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            truncated: false,
            usage: None,
        }
    }
}

/// The recorded result of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOutput {
    /// Agent that produced the output.
    pub agent: String,
    /// Context key the output is stored under.
    pub key: String,
    /// Output text.
    pub text: String,
    /// Number of backend calls issued (1 unless chunked).
    pub calls: usize,
    /// The prompt was cut down to fit the context budget.
    pub input_truncated: bool,
    /// At least one response hit the backend's output limit.
    pub output_truncated: bool,
    /// Token usage summed over all calls.
    pub usage: Usage,
    /// Wall time spent on the agent.
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_fallback() {
        let own = GenerationParams {
            temperature: Some(0.7),
            max_output_tokens: None,
        };
        let defaults = GenerationParams {
            temperature: Some(0.1),
            max_output_tokens: Some(512),
        };
        let merged = own.or(defaults);
        assert_eq!(merged.temperature, Some(0.7));
        assert_eq!(merged.max_output_tokens, Some(512));
    }

    #[test]
    fn test_chunk_fresh_text() {
        let chunk = Chunk {
            text: "lo world".to_string(),
            ordinal: 1,
            total: 3,
            overlap_len: 3,
        };
        assert_eq!(chunk.fresh_text(), "world");
        assert_eq!(chunk.label(), "2/3");
    }

    #[test]
    fn test_usage_accumulates() {
        let mut total = Usage::default();
        total += Usage {
            input_tokens: 10,
            output_tokens: 2,
        };
        total += Usage {
            input_tokens: 5,
            output_tokens: 1,
        };
        assert_eq!(total.input_tokens, 15);
        assert_eq!(total.output_tokens, 3);
    }

    #[test]
    fn test_node_output_serializes_elapsed_as_seconds() {
        let output = NodeOutput {
            agent: "a".into(),
            key: "a".into(),
            text: "x".into(),
            calls: 1,
            input_truncated: false,
            output_truncated: false,
            usage: Usage::default(),
            elapsed: Duration::from_millis(1500),
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["elapsed"], 1.5);
    }
}
