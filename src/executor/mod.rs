//! Dependency-ordered execution of a workflow graph.
//!
//! The executor walks the graph in its fixed topological order. For every
//! agent it renders the prompt from the values already in the
//! [`ExecutionContext`], keeps the call within the backend's input budget by
//! chunking or truncating, and records the response under the agent's output
//! key before the next agent starts.

mod context;

pub use context::ExecutionContext;

use crate::backend::ModelBackend;
use crate::chunker::{Chunker, UnitEstimator, DEFAULT_CHARS_PER_UNIT};
use crate::error::{BackendError, ChunkingError, NodeExecutionError, NodeFailure, RunError};
use crate::graph::WorkflowGraph;
use crate::models::{
    AgentSpec, BackendRequest, BackendResponse, GenerationParams, NodeOutput, Usage,
    ROOT_INPUT_KEY,
};
use crate::prompt::Template;
use futures::future::try_join_all;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Backend calls allowed in flight when not configured.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// How oversized prompts are handled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkingPolicy {
    /// Split the largest substituted value across several calls.
    pub chunking: bool,
    /// Cut the prompt to the budget when chunking is off.
    pub truncate: bool,
    /// Units repeated at the start of each chunk from the text before it.
    pub overlap: usize,
    pub chars_per_unit: f64,
    /// Cut at `# File:` headers of materialized repository text.
    pub file_sections: bool,
}

impl Default for ChunkingPolicy {
    fn default() -> Self {
        Self {
            chunking: true,
            truncate: false,
            overlap: 0,
            chars_per_unit: DEFAULT_CHARS_PER_UNIT,
            file_sections: true,
        }
    }
}

impl From<&crate::config::ChunkingConfig> for ChunkingPolicy {
    fn from(config: &crate::config::ChunkingConfig) -> Self {
        Self {
            chunking: config.enabled,
            truncate: config.truncate,
            overlap: config.overlap,
            chars_per_unit: config.chars_per_unit,
            file_sections: config.file_sections,
        }
    }
}

impl ChunkingPolicy {
    fn chunker(&self) -> Chunker {
        Chunker::new(UnitEstimator::new(self.chars_per_unit))
            .with_file_sections(self.file_sections)
    }
}

/// How an agent's prompt will be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Fits the budget as is.
    Single,
    /// Split into an estimated number of chunks.
    Chunked { chunks: usize },
    /// Cut to the budget.
    Truncated,
    /// Cannot be made to fit with the current policy.
    TooLarge,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Single => write!(f, "single call"),
            Strategy::Chunked { chunks } => write!(f, "~{} chunks", chunks),
            Strategy::Truncated => write!(f, "truncated"),
            Strategy::TooLarge => write!(f, "too large"),
        }
    }
}

/// Dry-run estimate for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePlan {
    pub agent: String,
    /// Estimated prompt size in units.
    pub units: usize,
    /// Input budget in units.
    pub budget: usize,
    pub strategy: Strategy,
}

/// Runs workflow graphs against one backend.
pub struct DagExecutor {
    backend: Arc<dyn ModelBackend>,
    policy: ChunkingPolicy,
    limiter: Semaphore,
    show_progress: bool,
}

impl DagExecutor {
    pub fn new(backend: Arc<dyn ModelBackend>, policy: ChunkingPolicy) -> Self {
        Self {
            backend,
            policy,
            limiter: Semaphore::new(DEFAULT_CONCURRENCY),
            show_progress: false,
        }
    }

    /// Bound the number of backend calls in flight.
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.limiter = Semaphore::new(limit.max(1));
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Execute every agent of `graph` in order.
    ///
    /// The first failing agent aborts the run. Once `cancel` fires no new
    /// backend call is issued and in-flight calls are dropped.
    pub async fn run(
        &self,
        graph: &WorkflowGraph,
        root_input: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionContext, RunError> {
        let policy = graph.settings().apply(self.policy);
        check_budgets(
            graph,
            &policy,
            self.backend.context_window(),
            self.backend.default_params(),
        )?;

        let mut ctx = ExecutionContext::new(root_input);
        let total = graph.len();
        let progress = self.progress_bar(total);

        info!(
            agents = total,
            backend = self.backend.name(),
            model = self.backend.model(),
            "Starting workflow run"
        );

        for agent in graph.execution_order() {
            if cancel.is_cancelled() {
                progress.abandon_with_message("cancelled");
                return Err(RunError::Cancelled {
                    completed: ctx.completed(),
                    total,
                });
            }

            progress.set_message(agent.name.clone());
            let span = info_span!("agent", name = %agent.name);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.run_node(agent, &ctx, &policy).instrument(span) => Some(result),
            };

            let Some(result) = outcome else {
                warn!(agent = %agent.name, "Run cancelled while agent was in flight");
                progress.abandon_with_message("cancelled");
                return Err(RunError::Cancelled {
                    completed: ctx.completed(),
                    total,
                });
            };

            if let Err(cause) = result.and_then(|output| ctx.record(output)) {
                progress.abandon_with_message(format!("{} failed", agent.name));
                return Err(NodeExecutionError {
                    node: agent.name.clone(),
                    cause,
                }
                .into());
            }
            progress.inc(1);
        }

        progress.finish_with_message("done");
        info!(agents = total, "Workflow run complete");
        Ok(ctx)
    }

    async fn run_node(
        &self,
        agent: &AgentSpec,
        ctx: &ExecutionContext,
        policy: &ChunkingPolicy,
    ) -> Result<NodeOutput, NodeFailure> {
        let started = Instant::now();
        let params = agent.params.or(self.backend.default_params());
        let budget = self.input_budget(&params);

        let template = Template::parse(&agent.template);
        let prompt = template
            .render(|key| ctx.get(key))
            .map_err(NodeFailure::UnresolvedDependency)?;

        let chunker = policy.chunker();
        let units = chunker.estimator().units(&prompt);
        debug!(units, budget, "Rendered prompt");

        let mut input_truncated = false;
        let chunked = units > budget && policy.chunking;

        let responses = if units <= budget {
            vec![self.call(prompt, params).await?]
        } else if policy.chunking {
            self.call_chunked(&template, ctx, &chunker, policy.overlap, budget, params)
                .await?
        } else if policy.truncate {
            let cut = chunker.truncate(&prompt, budget)?;
            warn!(units, budget, "Prompt exceeds the input budget, truncating");
            input_truncated = cut.lossy;
            vec![self.call(cut.text.to_string(), params).await?]
        } else {
            return Err(NodeFailure::InputTooLarge { units, budget });
        };

        let calls = responses.len();
        let output_truncated = responses.iter().any(|r| r.truncated);
        if output_truncated {
            warn!("Backend stopped at the output limit");
        }

        let mut usage = Usage::default();
        for response in &responses {
            if let Some(u) = response.usage {
                usage += u;
            }
        }

        let text = if chunked {
            reduce_chunks(&responses)
        } else {
            responses
                .into_iter()
                .next()
                .map(|r| r.text)
                .unwrap_or_default()
        };

        let elapsed = started.elapsed();
        info!(calls, elapsed_ms = elapsed.as_millis() as u64, "Agent complete");

        Ok(NodeOutput {
            agent: agent.name.clone(),
            key: agent.output_key.clone(),
            text,
            calls,
            input_truncated,
            output_truncated,
            usage,
            elapsed,
        })
    }

    /// One call per chunk of the largest substituted value.
    async fn call_chunked(
        &self,
        template: &Template,
        ctx: &ExecutionContext,
        chunker: &Chunker,
        overlap: usize,
        budget: usize,
        params: GenerationParams,
    ) -> Result<Vec<BackendResponse>, NodeFailure> {
        let estimator = chunker.estimator();

        // First of the largest values wins ties.
        let variable = template
            .placeholders()
            .into_iter()
            .rev()
            .max_by_key(|key| ctx.get(key).map_or(0, str::len));

        let Some(variable) = variable else {
            let scaffold = estimator.units(&template.render(|_| None).unwrap_or_default());
            return Err(ChunkingError::ScaffoldExceedsBudget { scaffold, budget }.into());
        };

        let value = ctx.get(variable).unwrap_or_default();
        let scaffold = template
            .render(|key| if key == variable { Some("") } else { ctx.get(key) })
            .map_err(NodeFailure::UnresolvedDependency)?;
        let scaffold_units = estimator.units(&scaffold);
        if scaffold_units >= budget {
            return Err(ChunkingError::ScaffoldExceedsBudget {
                scaffold: scaffold_units,
                budget,
            }
            .into());
        }

        let per_chunk = (budget - scaffold_units) / template.occurrences(variable).max(1);
        let chunks = chunker.chunk(value, per_chunk, overlap)?;
        info!(
            variable,
            chunks = chunks.len(),
            per_chunk,
            "Prompt exceeds the input budget, chunking"
        );

        let calls = chunks.iter().map(|chunk| {
            let prompt = template.render(|key| {
                if key == variable {
                    Some(chunk.text.as_str())
                } else {
                    ctx.get(key)
                }
            });
            async move {
                let prompt = prompt.map_err(NodeFailure::UnresolvedDependency)?;
                debug!(chunk = %chunk.label(), "Invoking backend for chunk");
                self.call(prompt, params).await
            }
        });

        try_join_all(calls).await
    }

    async fn call(
        &self,
        prompt: String,
        params: GenerationParams,
    ) -> Result<BackendResponse, NodeFailure> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| BackendError::Unavailable("call limiter closed".to_string()))?;
        let request = BackendRequest::new(prompt, params);
        Ok(self.backend.invoke(&request).await?)
    }

    fn input_budget(&self, params: &GenerationParams) -> usize {
        input_budget(self.backend.context_window(), params)
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    }
}

/// Estimate how each agent of `graph` would be sent, without a backend.
///
/// Upstream outputs are sized at their `max_output_tokens` limit, so the
/// estimate is an upper bound. Fails like [`DagExecutor::run`] when an
/// agent's output reservation leaves no room for its prompt.
pub fn plan(
    graph: &WorkflowGraph,
    root_input: &str,
    policy: ChunkingPolicy,
    context_window: usize,
    defaults: GenerationParams,
) -> Result<Vec<NodePlan>, NodeExecutionError> {
    let policy = graph.settings().apply(policy);
    check_budgets(graph, &policy, context_window, defaults)?;
    let estimator = UnitEstimator::new(policy.chars_per_unit);

    let mut sizes: HashMap<&str, usize> = HashMap::new();
    sizes.insert(ROOT_INPUT_KEY, root_input.chars().count());

    let mut plans = Vec::with_capacity(graph.len());
    for agent in graph.execution_order() {
        let params = agent.params.or(defaults);
        let budget = input_budget(context_window, &params);
        let template = Template::parse(&agent.template);

        let literal = template
            .render(|_| Some(""))
            .map_or(0, |s| s.chars().count());
        let slots: Vec<(usize, usize)> = template
            .placeholders()
            .into_iter()
            .map(|key| {
                (
                    template.occurrences(key),
                    sizes.get(key).copied().unwrap_or(0),
                )
            })
            .collect();
        let total_chars = literal + slots.iter().map(|(n, c)| n * c).sum::<usize>();
        let units = estimator.units_for_chars(total_chars);

        let strategy = if units <= budget {
            Strategy::Single
        } else if policy.chunking {
            estimate_chunks(&estimator, &slots, total_chars, budget, policy.overlap)
        } else if policy.truncate {
            Strategy::Truncated
        } else {
            Strategy::TooLarge
        };

        let output_units = params.max_output_tokens.unwrap_or(0) as usize;
        sizes.insert(agent.output_key.as_str(), estimator.chars_for_units(output_units));

        plans.push(NodePlan {
            agent: agent.name.clone(),
            units,
            budget,
            strategy,
        });
    }
    Ok(plans)
}

/// Reject the first agent, in execution order, whose input budget holds no text.
fn check_budgets(
    graph: &WorkflowGraph,
    policy: &ChunkingPolicy,
    context_window: usize,
    defaults: GenerationParams,
) -> Result<(), NodeExecutionError> {
    let chunker = policy.chunker();
    for agent in graph.execution_order() {
        let budget = input_budget(context_window, &agent.params.or(defaults));
        chunker
            .char_budget(budget)
            .map_err(|e| NodeExecutionError {
                node: agent.name.clone(),
                cause: e.into(),
            })?;
    }
    Ok(())
}

/// Units left for the prompt once the response is reserved.
fn input_budget(context_window: usize, params: &GenerationParams) -> usize {
    context_window.saturating_sub(params.max_output_tokens.unwrap_or(0) as usize)
}

/// Join chunk responses in order with `[chunk i/n]` markers.
///
/// A lone response is returned as is.
fn reduce_chunks(responses: &[BackendResponse]) -> String {
    if let [only] = responses {
        return only.text.clone();
    }
    let total = responses.len();
    responses
        .iter()
        .enumerate()
        .map(|(i, r)| format!("[chunk {}/{}]\n{}", i + 1, total, r.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Chunk count for the largest slot, given `(occurrences, chars)` per slot.
fn estimate_chunks(
    estimator: &UnitEstimator,
    slots: &[(usize, usize)],
    total_chars: usize,
    budget: usize,
    overlap: usize,
) -> Strategy {
    let Some(&(occurrences, chars)) = slots.iter().rev().max_by_key(|(_, c)| *c) else {
        return Strategy::TooLarge;
    };

    let scaffold_units = estimator.units_for_chars(total_chars - occurrences * chars);
    if scaffold_units >= budget {
        return Strategy::TooLarge;
    }
    let per_chunk = (budget - scaffold_units) / occurrences.max(1);
    if per_chunk == 0 || overlap >= per_chunk {
        return Strategy::TooLarge;
    }

    let units = estimator.units_for_chars(chars);
    let chunks = if units <= per_chunk {
        1
    } else {
        1 + (units - per_chunk).div_ceil(per_chunk - overlap)
    };
    Strategy::Chunked { chunks }
}
