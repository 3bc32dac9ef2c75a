//! Writing agent artifacts and reports to disk.

use crate::cli::OutputFormat;
use crate::executor::ExecutionContext;
use crate::graph::{confined_artifact_path, WorkflowGraph};
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{generate_json_report, generate_markdown_report, RunReport};

/// Write every agent output that declares an artifact path.
///
/// Paths are resolved under `dir`. Graph construction already rejects paths
/// that leave it; they are checked again here before touching the disk.
pub fn write_artifacts(
    graph: &WorkflowGraph,
    ctx: &ExecutionContext,
    dir: &Path,
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();

    for agent in graph.execution_order() {
        let Some(relative) = agent.output.as_deref() else {
            continue;
        };
        let Some(relative) = confined_artifact_path(relative) else {
            bail!(
                "Artifact path for agent '{}' must stay inside the output directory: {}",
                agent.name,
                relative.display()
            );
        };

        let Some(text) = ctx.get(&agent.output_key) else {
            debug!(agent = %agent.name, "No output recorded, skipping artifact");
            continue;
        };

        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(&path, text).with_context(|| {
            format!(
                "Failed to write output file for agent '{}': {}",
                agent.name,
                path.display()
            )
        })?;

        info!(agent = %agent.name, path = %path.display(), "Wrote artifact");
        written.push(path);
    }

    Ok(written)
}

/// Render the report in `format` and write it into `dir`.
pub fn write_report(report: &RunReport, dir: &Path, format: OutputFormat) -> Result<PathBuf> {
    let content = match format {
        OutputFormat::Json => generate_json_report(report)?,
        OutputFormat::Markdown => generate_markdown_report(report),
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    let path = dir.join(format.report_file());
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write report to {}", path.display()))?;

    Ok(path)
}
