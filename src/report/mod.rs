//! Run reports and output artifacts.

mod generator;
mod sink;

pub use generator::{generate_json_report, generate_markdown_report};
pub use sink::{write_artifacts, write_report};

use crate::executor::ExecutionContext;
use crate::graph::WorkflowGraph;
use crate::models::Usage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Everything recorded about one successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub metadata: RunMetadata,
    /// One entry per agent, in completion order.
    pub agents: Vec<AgentReport>,
    pub totals: RunTotals,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub workflow: String,
    pub backend: String,
    pub model: String,
    pub run_date: DateTime<Utc>,
    pub duration_seconds: f64,
    /// Size of the root input in characters.
    pub input_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    pub name: String,
    pub output_key: String,
    pub calls: usize,
    pub input_truncated: bool,
    pub output_truncated: bool,
    pub usage: Usage,
    pub elapsed_seconds: f64,
    /// Artifact written for this agent, relative to the output directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    /// Output text, kept when no artifact holds it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunTotals {
    pub agents: usize,
    pub calls: usize,
    pub truncated_inputs: usize,
    pub usage: Usage,
}

impl RunReport {
    /// Build a report from a finished run.
    pub fn from_run(
        metadata: RunMetadata,
        graph: &WorkflowGraph,
        ctx: &ExecutionContext,
    ) -> Self {
        let mut totals = RunTotals::default();
        let agents: Vec<AgentReport> = ctx
            .outputs()
            .iter()
            .map(|output| {
                let artifact = graph.get(&output.agent).and_then(|a| a.output.clone());
                totals.agents += 1;
                totals.calls += output.calls;
                totals.usage += output.usage;
                if output.input_truncated {
                    totals.truncated_inputs += 1;
                }

                AgentReport {
                    name: output.agent.clone(),
                    output_key: output.key.clone(),
                    calls: output.calls,
                    input_truncated: output.input_truncated,
                    output_truncated: output.output_truncated,
                    usage: output.usage,
                    elapsed_seconds: output.elapsed.as_secs_f64(),
                    output: artifact.is_none().then(|| output.text.clone()),
                    artifact,
                }
            })
            .collect();

        Self {
            metadata,
            agents,
            totals,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_totals() {
        let report = fixtures::report();
        assert_eq!(report.totals.agents, 2);
        assert_eq!(report.totals.calls, 4);
        assert_eq!(report.totals.truncated_inputs, 1);
        assert_eq!(report.totals.usage.input_tokens, 1000);
    }

    #[test]
    fn test_output_kept_only_without_artifact() {
        let report = fixtures::report();
        assert_eq!(
            report.agents[0].artifact,
            Some(PathBuf::from("scan/findings.json"))
        );
        assert!(report.agents[0].output.is_none());
        assert_eq!(report.agents[1].output.as_deref(), Some("No issues found."));
    }
}
