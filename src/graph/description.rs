//! Declarative workflow description files.
//!
//! A description is a TOML document with an optional `[settings]` table and
//! one `[agents.<name>]` table per agent. Agents are read in document order,
//! which is the tie-break order for execution.

use crate::error::GraphError;
use crate::executor::ChunkingPolicy;
use crate::models::{AgentSpec, GenerationParams, ROOT_INPUT_KEY};
use crate::prompt::{persona_template, Persona};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Workflow-wide overrides of the application's chunking settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunking: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chars_per_unit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_sections: Option<bool>,
}

impl GraphSettings {
    /// Apply these overrides on top of `base`.
    pub fn apply(&self, base: ChunkingPolicy) -> ChunkingPolicy {
        ChunkingPolicy {
            chunking: self.chunking.unwrap_or(base.chunking),
            truncate: self.truncate.unwrap_or(base.truncate),
            overlap: self.overlap.unwrap_or(base.overlap),
            chars_per_unit: self.chars_per_unit.unwrap_or(base.chars_per_unit),
            file_sections: self.file_sections.unwrap_or(base.file_sections),
        }
    }
}

/// One agent as written in the description file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentDef {
    /// Raw prompt template.
    #[serde(default)]
    pub prompt: Option<String>,

    /// Objective of a persona agent; used when no raw prompt is given.
    #[serde(default)]
    pub objective: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default, alias = "core_responsibilities")]
    pub responsibilities: Vec<String>,

    #[serde(default, alias = "key_traits")]
    pub traits: Vec<String>,

    #[serde(default)]
    pub input_sample: Option<String>,

    #[serde(default)]
    pub output_sample: Option<String>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub output_key: Option<String>,

    /// Artifact path for the agent's output, relative to the output directory.
    #[serde(default)]
    pub output: Option<PathBuf>,

    #[serde(default)]
    pub parameters: GenerationParams,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDescription {
    #[serde(default)]
    settings: GraphSettings,
    #[serde(default)]
    agents: toml::Table,
}

/// A parsed, not yet validated, workflow description.
#[derive(Debug, Clone, Default)]
pub struct GraphDescription {
    pub settings: GraphSettings,
    /// Agents in document order.
    pub agents: Vec<(String, AgentDef)>,
}

impl GraphDescription {
    /// Parse description text.
    pub fn parse(source: &str) -> Result<Self, GraphError> {
        let raw: RawDescription =
            toml::from_str(source).map_err(|e| GraphError::Parse(e.to_string()))?;

        let mut agents = Vec::with_capacity(raw.agents.len());
        for (name, value) in raw.agents {
            let def: AgentDef = value
                .try_into()
                .map_err(|e| GraphError::Parse(format!("agent '{}': {}", name, e)))?;
            agents.push((name, def));
        }

        Ok(Self {
            settings: raw.settings,
            agents,
        })
    }

    /// Read and parse a description file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse workflow file: {}", path.display()))
    }

    /// Turn agent definitions into specs with concrete templates.
    pub fn to_specs(&self) -> Result<Vec<AgentSpec>, GraphError> {
        let output_keys: HashMap<&str, &str> = self
            .agents
            .iter()
            .map(|(name, def)| {
                (
                    name.as_str(),
                    def.output_key.as_deref().unwrap_or(name.as_str()),
                )
            })
            .collect();

        let mut specs = Vec::with_capacity(self.agents.len());
        for (name, def) in &self.agents {
            let mut depends_on: Vec<String> = Vec::new();
            for dep in &def.depends_on {
                if !depends_on.contains(dep) {
                    depends_on.push(dep.clone());
                }
            }

            let template = match (&def.prompt, &def.objective) {
                (Some(prompt), _) => prompt.clone(),
                (None, Some(objective)) => {
                    let inputs = persona_inputs(name, &depends_on, &output_keys)?;
                    persona_template(
                        &Persona {
                            name,
                            description: def.description.as_deref(),
                            objective,
                            responsibilities: &def.responsibilities,
                            traits: &def.traits,
                            input_sample: def.input_sample.as_deref(),
                            output_sample: def.output_sample.as_deref(),
                        },
                        &inputs,
                        def.output.as_deref(),
                    )
                }
                (None, None) => return Err(GraphError::MissingPrompt(name.clone())),
            };

            specs.push(AgentSpec {
                name: name.clone(),
                template,
                depends_on,
                output_key: def.output_key.clone().unwrap_or_else(|| name.clone()),
                params: def.parameters,
                output: def.output.clone(),
            });
        }

        Ok(specs)
    }
}

/// Keys a persona agent reads: its dependencies' outputs, or the root input.
fn persona_inputs(
    name: &str,
    depends_on: &[String],
    output_keys: &HashMap<&str, &str>,
) -> Result<Vec<String>, GraphError> {
    if depends_on.is_empty() {
        return Ok(vec![ROOT_INPUT_KEY.to_string()]);
    }

    depends_on
        .iter()
        .map(|dep| {
            output_keys
                .get(dep.as_str())
                .map(|key| key.to_string())
                .ok_or_else(|| GraphError::UnknownDependency {
                    node: name.to_string(),
                    dependency: dep.clone(),
                })
        })
        .collect()
}
