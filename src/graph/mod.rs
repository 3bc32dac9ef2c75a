//! Workflow graph construction.
//!
//! A [`WorkflowGraph`] is built once per run from a [`GraphDescription`] and
//! is immutable afterwards. Construction validates names, dependencies,
//! output keys and template placeholders, then fixes the execution order.

pub mod description;

pub use description::{AgentDef, GraphDescription, GraphSettings};

use crate::error::GraphError;
use crate::models::{AgentSpec, ROOT_INPUT_KEY};
use crate::prompt::Template;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// A validated agent graph with its execution order.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    agents: Vec<AgentSpec>,
    order: Vec<usize>,
    settings: GraphSettings,
}

impl WorkflowGraph {
    /// Validate a parsed description and build the graph.
    pub fn from_description(description: &GraphDescription) -> Result<Self, GraphError> {
        Self::new(description.to_specs()?, description.settings)
    }

    /// Validate agent specs, given in declaration order.
    pub fn new(agents: Vec<AgentSpec>, settings: GraphSettings) -> Result<Self, GraphError> {
        if agents.is_empty() {
            return Err(GraphError::EmptyGraph);
        }

        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, agent) in agents.iter().enumerate() {
            if index.insert(agent.name.as_str(), i).is_some() {
                return Err(GraphError::DuplicateNodeName(agent.name.clone()));
            }
        }

        let mut producers: HashMap<&str, &str> = HashMap::new();
        for agent in &agents {
            if agent.output_key == ROOT_INPUT_KEY {
                return Err(GraphError::ReservedOutputKey(agent.name.clone()));
            }
            if let Some(first) = producers.insert(agent.output_key.as_str(), agent.name.as_str()) {
                return Err(GraphError::DuplicateOutputKey {
                    key: agent.output_key.clone(),
                    first: first.to_string(),
                    second: agent.name.clone(),
                });
            }
        }

        check_artifacts(&agents)?;

        // deps[i] = indices agent i depends on
        let mut deps: Vec<Vec<usize>> = Vec::with_capacity(agents.len());
        for agent in &agents {
            let mut resolved = Vec::with_capacity(agent.depends_on.len());
            for dep in &agent.depends_on {
                let &j = index
                    .get(dep.as_str())
                    .ok_or_else(|| GraphError::UnknownDependency {
                        node: agent.name.clone(),
                        dependency: dep.clone(),
                    })?;
                if !resolved.contains(&j) {
                    resolved.push(j);
                }
            }
            deps.push(resolved);
        }

        for (agent, agent_deps) in agents.iter().zip(&deps) {
            check_placeholders(agent, agent_deps, &agents)?;
        }

        let order = topological_order(&agents, &deps)?;
        debug!(
            order = ?order.iter().map(|&i| agents[i].name.as_str()).collect::<Vec<_>>(),
            "Resolved execution order"
        );

        Ok(Self {
            agents,
            order,
            settings,
        })
    }

    /// Agents in declaration order.
    #[cfg(test)]
    pub fn agents(&self) -> &[AgentSpec] {
        &self.agents
    }

    /// Agents in execution order.
    pub fn execution_order(&self) -> impl Iterator<Item = &AgentSpec> + '_ {
        self.order.iter().map(move |&i| &self.agents[i])
    }

    pub fn get(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// Output key of the named agent.
    #[cfg(test)]
    pub fn output_key_of(&self, name: &str) -> Option<&str> {
        self.get(name).map(|a| a.output_key.as_str())
    }

    pub fn settings(&self) -> &GraphSettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }
}

/// Normalized form of an artifact path, or `None` if it could leave the
/// output directory.
pub fn confined_artifact_path(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if normalized.as_os_str().is_empty() {
        return None;
    }
    Some(normalized)
}

/// Artifact paths stay inside the output directory and are never shared.
fn check_artifacts(agents: &[AgentSpec]) -> Result<(), GraphError> {
    let mut owners: HashMap<PathBuf, &str> = HashMap::new();
    for agent in agents {
        let Some(path) = agent.output.as_deref() else {
            continue;
        };
        let normalized =
            confined_artifact_path(path).ok_or_else(|| GraphError::ArtifactOutsideOutputDir {
                node: agent.name.clone(),
                path: path.display().to_string(),
            })?;
        if let Some(first) = owners.insert(normalized, agent.name.as_str()) {
            return Err(GraphError::DuplicateArtifact {
                path: path.display().to_string(),
                first: first.to_string(),
                second: agent.name.clone(),
            });
        }
    }
    Ok(())
}

/// Every placeholder must name the root input or a declared dependency's output.
fn check_placeholders(
    agent: &AgentSpec,
    deps: &[usize],
    agents: &[AgentSpec],
) -> Result<(), GraphError> {
    let template = Template::parse(&agent.template);
    for name in template.placeholders() {
        let known = name == ROOT_INPUT_KEY || deps.iter().any(|&j| agents[j].output_key == name);
        if !known {
            return Err(GraphError::UndeclaredPlaceholder {
                node: agent.name.clone(),
                placeholder: name.to_string(),
            });
        }
    }
    Ok(())
}

/// Kahn's algorithm; among ready agents the earliest declared runs first.
fn topological_order(agents: &[AgentSpec], deps: &[Vec<usize>]) -> Result<Vec<usize>, GraphError> {
    let n = agents.len();
    let mut pending: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, agent_deps) in deps.iter().enumerate() {
        for &j in agent_deps {
            dependents[j].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| pending[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(n);

    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &d in &dependents[i] {
            pending[d] -= 1;
            if pending[d] == 0 {
                ready.push(Reverse(d));
            }
        }
    }

    if order.len() == n {
        return Ok(order);
    }

    Err(GraphError::CycleDetected(find_cycle(agents, deps, &pending)))
}

/// Walk unresolved dependencies from the first stuck agent until a node repeats.
fn find_cycle(agents: &[AgentSpec], deps: &[Vec<usize>], pending: &[usize]) -> Vec<String> {
    let stuck = |i: usize| pending[i] > 0;
    let Some(start) = (0..agents.len()).find(|&i| stuck(i)) else {
        return Vec::new();
    };

    let mut path: Vec<usize> = Vec::new();
    let mut current = start;
    loop {
        if let Some(pos) = path.iter().position(|&p| p == current) {
            let mut cycle: Vec<String> = path[pos..]
                .iter()
                .map(|&i| agents[i].name.clone())
                .collect();
            cycle.push(agents[current].name.clone());
            return cycle;
        }
        path.push(current);

        // A stuck agent always has at least one stuck dependency.
        match deps[current].iter().copied().find(|&j| stuck(j)) {
            Some(next) => current = next,
            None => {
                return path.iter().map(|&i| agents[i].name.clone()).collect();
            }
        }
    }
}
