//! One-shot runs with recovery from transient agent-process failures.
//!
//! Each attempt opens a fresh connection. When the process dies with the
//! retryable exit pattern before producing output, the next rung of the
//! ladder retries with a more conservative configuration.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use super::aggregate::{RunAccumulator, RunResult};
use super::error::{EngineError, deepest_detail, error_chain};
use super::registry::{ActiveRun, ActiveRunRegistry};
use super::{RunRequest, notify_observer};
use crate::config::EngineConfig;
use crate::connection::{
    AgentEvent, ConnectOptions, Connection, ConnectionError, ConnectionFactory, PromptMessage,
    PromptQueue,
};

/// One configuration variant tried by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rung {
    pub label: &'static str,
    pub options: ConnectOptions,
}

/// Ordered, deduplicated retry configurations derived from `base`.
///
/// A rung identical in effect to one already listed is skipped, which also
/// drops rungs whose feature was never in use.
pub fn ladder(base: &ConnectOptions, safe_mode_disabled_tools: &[String]) -> Vec<Rung> {
    let without_servers = ConnectOptions {
        mcp_servers: Default::default(),
        ..base.clone()
    };
    let without_resume = ConnectOptions {
        resume: None,
        ..base.clone()
    };
    let without_both = ConnectOptions {
        mcp_servers: Default::default(),
        resume: None,
        ..base.clone()
    };
    let safe_mode = ConnectOptions {
        setting_sources: Vec::new(),
        ..without_both.clone()
    };
    let mut restricted = safe_mode.clone();
    for tool in safe_mode_disabled_tools {
        if !restricted.disallowed_tools.contains(tool) {
            restricted.disallowed_tools.push(tool.clone());
        }
    }
    restricted
        .allowed_tools
        .retain(|tool| !safe_mode_disabled_tools.contains(tool));

    let candidates = [
        ("full configuration", base.clone()),
        ("without MCP servers", without_servers),
        ("without resume", without_resume),
        ("without MCP servers or resume", without_both),
        ("safe mode", safe_mode),
        ("safe mode with tools disabled", restricted),
    ];

    let mut rungs: Vec<Rung> = Vec::with_capacity(candidates.len());
    for (label, options) in candidates {
        if rungs.iter().any(|rung| rung.options == options) {
            continue;
        }
        rungs.push(Rung { label, options });
    }
    rungs
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Substring of the error chain that marks a retryable process exit.
    pub retryable_pattern: String,
    pub detail_max_chars: usize,
    pub detail_max_depth: usize,
    pub safe_mode_disabled_tools: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            retryable_pattern: config.retryable_error_pattern.clone(),
            detail_max_chars: config.error_detail_max_chars,
            detail_max_depth: config.error_detail_max_depth,
            safe_mode_disabled_tools: config.safe_mode_disabled_tools.clone(),
        }
    }

    /// Matches the pattern against the error's own message, ignoring causes
    /// such as captured stderr. A digit right after the match rejects it, so
    /// "code 1" does not cover "code 127". Still a substring heuristic.
    pub fn is_retryable(&self, error: &ConnectionError) -> bool {
        let pattern = self.retryable_pattern.as_str();
        if pattern.is_empty() {
            return false;
        }
        let message = error.to_string();
        message.match_indices(pattern).any(|(start, _)| {
            !message[start + pattern.len()..]
                .starts_with(|c: char| c.is_ascii_digit())
        })
    }
}

enum AttemptError {
    Connection {
        error: ConnectionError,
        streamed: bool,
    },
    StreamEnded,
}

pub struct InvocationExecutor {
    factory: Arc<dyn ConnectionFactory>,
    registry: Arc<ActiveRunRegistry>,
    policy: RetryPolicy,
}

impl InvocationExecutor {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        registry: Arc<ActiveRunRegistry>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            factory,
            registry,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn run(
        &self,
        request: RunRequest,
        options: ConnectOptions,
    ) -> Result<RunResult, EngineError> {
        let token = request.run_token();
        let rungs = ladder(&options, &self.policy.safe_mode_disabled_tools);
        let mut attempted: Vec<String> = Vec::new();
        let mut last_error: Option<ConnectionError> = None;

        for rung in &rungs {
            if token.is_cancelled() {
                return Ok(RunAccumulator::new().interrupted(options.resume.clone()));
            }
            attempted.push(rung.label.to_string());
            let attempt = attempted.len();

            match self.attempt(&request, rung, &token).await {
                Ok(mut result) => {
                    if attempt > 1 {
                        tracing::info!(
                            channel = %request.channel_id,
                            rung = rung.label,
                            attempt,
                            "Agent recovered (ladder fallback)"
                        );
                    }
                    result.rung = Some(rung.label.to_string());
                    return Ok(result);
                }
                Err(AttemptError::StreamEnded) => return Err(EngineError::StreamEnded),
                Err(AttemptError::Connection { error, streamed }) => {
                    let message = error_chain(&error);
                    if !self.policy.is_retryable(&error) {
                        tracing::warn!(
                            channel = %request.channel_id,
                            rung = rung.label,
                            "Non-retryable agent error: {message}"
                        );
                        return Err(EngineError::Permanent(message));
                    }
                    if streamed {
                        return Err(EngineError::TransientProcessFailure(message));
                    }
                    tracing::warn!(
                        channel = %request.channel_id,
                        rung = rung.label,
                        attempt,
                        "Agent attempt failed, trying next rung: {message}"
                    );
                    last_error = Some(error);
                }
            }
        }

        let detail = last_error
            .as_ref()
            .map(|error| {
                deepest_detail(
                    error,
                    self.policy.detail_max_depth,
                    self.policy.detail_max_chars,
                )
            })
            .unwrap_or_default();
        tracing::warn!(
            channel = %request.channel_id,
            attempts = attempted.len(),
            "Agent ladder exhausted"
        );
        Err(EngineError::LadderExhausted {
            attempts: attempted,
            detail,
        })
    }

    async fn attempt(
        &self,
        request: &RunRequest,
        rung: &Rung,
        token: &CancellationToken,
    ) -> Result<RunResult, AttemptError> {
        let prompts = Arc::new(PromptQueue::new());
        prompts.enqueue(PromptMessage::new(request.prompt.clone()));
        prompts.end();

        let Connection {
            control,
            mut events,
        } = self
            .factory
            .open(prompts, rung.options.clone())
            .await
            .map_err(|error| AttemptError::Connection {
                error,
                streamed: false,
            })?;

        let active = self.registry.register(
            &request.channel_id,
            ActiveRun::new(Arc::clone(&control), token.clone()),
        );
        if let Some(observer) = &request.observer {
            observer.on_query_start();
        }

        let mut accumulator = RunAccumulator::new();
        let outcome = loop {
            tokio::select! {
                () = token.cancelled() => {
                    break Ok(accumulator.interrupted(rung.options.resume.clone()));
                }
                item = events.next() => match item {
                    Some(Ok(event)) => {
                        accumulator.observe(&event);
                        notify_observer(request.observer.as_ref(), &event);
                        if let AgentEvent::Result(terminal) = &event {
                            break Ok(accumulator.finish(terminal, active.is_interrupted()));
                        }
                    }
                    Some(Err(error)) => {
                        break Err(AttemptError::Connection {
                            error,
                            streamed: accumulator.has_output(),
                        });
                    }
                    None => break Err(AttemptError::StreamEnded),
                }
            }
        };

        control.close();
        self.registry.clear(&request.channel_id, Some(&active));
        outcome
    }
}
