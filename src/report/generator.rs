//! Markdown and JSON rendering of run reports.

use super::{AgentReport, RunMetadata, RunReport, RunTotals};
use anyhow::Result;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &RunReport) -> String {
    let mut output = String::new();

    output.push_str("# agentflow Run Report\n\n");
    output.push_str(&generate_metadata_section(&report.metadata));
    output.push_str(&generate_summary_section(&report.totals));
    output.push_str(&generate_agents_section(&report.agents));
    output.push_str(&generate_notes_section(&report.agents));
    output.push_str(&generate_outputs_section(&report.agents));
    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(metadata: &RunMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Workflow:** `{}`\n", metadata.workflow));
    section.push_str(&format!(
        "- **Run Date:** {}\n",
        metadata.run_date.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Backend:** {}\n", metadata.backend));
    section.push_str(&format!("- **Model Used:** `{}`\n", metadata.model));
    section.push_str(&format!("- **Input Size:** {} chars\n", metadata.input_chars));
    section.push_str(&format!(
        "- **Run Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    section.push('\n');

    section
}

fn generate_summary_section(totals: &RunTotals) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");
    section.push_str("| Agents | Backend Calls | Input Tokens | Output Tokens | Truncated Inputs |\n");
    section.push_str("|:---:|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} | {} | {} |\n\n",
        totals.agents,
        totals.calls,
        totals.usage.input_tokens,
        totals.usage.output_tokens,
        totals.truncated_inputs
    ));

    section
}

/// Per-agent table in completion order.
fn generate_agents_section(agents: &[AgentReport]) -> String {
    let mut section = String::new();

    section.push_str("## Agents\n\n");
    section.push_str("| # | Agent | Output Key | Calls | Tokens (in/out) | Time | Artifact |\n");
    section.push_str("|---|-------|------------|-------|-----------------|------|----------|\n");

    for (i, agent) in agents.iter().enumerate() {
        let artifact = agent
            .artifact
            .as_ref()
            .map(|p| format!("`{}`", p.display()))
            .unwrap_or_else(|| "-".to_string());
        section.push_str(&format!(
            "| {} | {} | `{}` | {} | {}/{} | {:.1}s | {} |\n",
            i + 1,
            agent.name,
            agent.output_key,
            agent.calls,
            agent.usage.input_tokens,
            agent.usage.output_tokens,
            agent.elapsed_seconds,
            artifact
        ));
    }
    section.push('\n');

    section
}

fn generate_notes_section(agents: &[AgentReport]) -> String {
    let mut notes = Vec::new();
    for agent in agents {
        if agent.calls > 1 {
            notes.push(format!(
                "- **{}**: input split into {} chunks",
                agent.name, agent.calls
            ));
        }
        if agent.input_truncated {
            notes.push(format!(
                "- ⚠️ **{}**: prompt truncated to fit the context window",
                agent.name
            ));
        }
        if agent.output_truncated {
            notes.push(format!(
                "- ⚠️ **{}**: response stopped at the output token limit",
                agent.name
            ));
        }
    }

    if notes.is_empty() {
        return String::new();
    }

    format!("## Notes\n\n{}\n\n", notes.join("\n"))
}

/// Outputs of agents that did not write an artifact.
fn generate_outputs_section(agents: &[AgentReport]) -> String {
    let inline: Vec<_> = agents
        .iter()
        .filter_map(|a| a.output.as_deref().map(|text| (a, text)))
        .collect();
    if inline.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Agent Outputs\n\n");
    for (agent, text) in inline {
        section.push_str(&format!("### {}\n\n", agent.name));
        section.push_str(text.trim_end());
        section.push_str("\n\n");
    }

    section
}

/// Generate the report footer.
fn generate_footer() -> String {
    let mut footer = String::new();

    footer.push_str("---\n\n");
    footer.push_str(&format!(
        "*Report generated by agentflow v{}*\n",
        env!("CARGO_PKG_VERSION")
    ));

    footer
}

/// Generate a JSON report.
pub fn generate_json_report(report: &RunReport) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}
