use crate::error::NodeFailure;
use crate::models::{NodeOutput, ROOT_INPUT_KEY};
use std::collections::HashMap;

/// Values produced during one run, keyed by output key.
///
/// Seeded with the root input under [`ROOT_INPUT_KEY`]. Every key is written
/// exactly once; outputs are kept in completion order.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    values: HashMap<String, String>,
    outputs: Vec<NodeOutput>,
}

impl ExecutionContext {
    pub fn new(root_input: impl Into<String>) -> Self {
        let mut values = HashMap::new();
        values.insert(ROOT_INPUT_KEY.to_string(), root_input.into());
        Self {
            values,
            outputs: Vec::new(),
        }
    }

    /// Value stored under `key`, including the root input.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    #[cfg(test)]
    pub fn root_input(&self) -> &str {
        self.get(ROOT_INPUT_KEY).unwrap_or_default()
    }

    /// Store a node's output. Fails if its key already holds a value.
    pub fn record(&mut self, output: NodeOutput) -> Result<(), NodeFailure> {
        if self.values.contains_key(&output.key) {
            return Err(NodeFailure::OutputAlreadyRecorded(output.key));
        }
        self.values.insert(output.key.clone(), output.text.clone());
        self.outputs.push(output);
        Ok(())
    }

    /// Node outputs in completion order.
    pub fn outputs(&self) -> &[NodeOutput] {
        &self.outputs
    }

    #[cfg(test)]
    pub fn output_of(&self, agent: &str) -> Option<&NodeOutput> {
        self.outputs.iter().find(|o| o.agent == agent)
    }

    /// Names of the agents that completed, in order.
    #[cfg(test)]
    pub fn completion_order(&self) -> Vec<&str> {
        self.outputs.iter().map(|o| o.agent.as_str()).collect()
    }

    pub fn completed(&self) -> usize {
        self.outputs.len()
    }
}
