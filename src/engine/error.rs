use std::error::Error;

use crate::util::clip_detail;

/// Result text of a run cancelled before it produced any output.
pub const INTERRUPTED_TEXT: &str = "Interrupted.";

/// Failures surfaced to callers of a run.
///
/// `Clone` because one closure error rejects every run still queued on a
/// session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Retryable process exit that could not be routed around, e.g. because
    /// output had already been streamed to the caller.
    #[error("Agent process failed: {0}")]
    TransientProcessFailure(String),

    #[error("Agent failed after trying {}: {detail}", .attempts.join(", "))]
    LadderExhausted {
        attempts: Vec<String>,
        detail: String,
    },

    #[error("{0}")]
    Permanent(String),

    #[error("Agent stream ended unexpectedly")]
    StreamEnded,

    #[error("Agent stream ended unexpectedly: {0}")]
    StreamFailed(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::SessionClosed(reason.into())
    }
}

/// Every message in the error's source chain, joined with `": "`.
pub fn error_chain(error: &(dyn Error + 'static)) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if parts.last() != Some(&text) {
            parts.push(text);
        }
        source = cause.source();
    }
    parts.join(": ")
}

/// Message of the deepest cause reachable within `max_depth` hops, clipped.
pub fn deepest_detail(error: &(dyn Error + 'static), max_depth: usize, max_chars: usize) -> String {
    let mut deepest = error;
    for _ in 0..max_depth {
        match deepest.source() {
            Some(cause) => deepest = cause,
            None => break,
        }
    }
    let text = deepest.to_string();
    let text = if text.trim().is_empty() {
        error.to_string()
    } else {
        text
    };
    clip_detail(&text, max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionError, ProcessOutput};

    fn exit_with_stderr(stderr: &str) -> ConnectionError {
        ConnectionError::ProcessExited {
            code: 1,
            stderr: Some(ProcessOutput(stderr.to_string())),
        }
    }

    #[test]
    fn chain_includes_process_exit_and_stderr() {
        let err = exit_with_stderr("MCP server docs failed to start");
        assert_eq!(
            error_chain(&err),
            "Claude Code process exited with code 1: MCP server docs failed to start"
        );
    }

    #[test]
    fn deepest_detail_prefers_innermost_cause() {
        let err = exit_with_stderr("  invalid   session\n id  ");
        assert_eq!(deepest_detail(&err, 5, 300), "invalid session id");
        assert_eq!(
            deepest_detail(&err, 0, 300),
            "Claude Code process exited with code 1"
        );
    }

    #[test]
    fn deepest_detail_falls_back_when_cause_is_blank() {
        let err = exit_with_stderr("   ");
        assert_eq!(
            deepest_detail(&err, 5, 300),
            "Claude Code process exited with code 1"
        );
    }

    #[test]
    fn ladder_exhausted_lists_attempts() {
        let err = EngineError::LadderExhausted {
            attempts: vec!["full".into(), "safe mode".into()],
            detail: "boom".into(),
        };
        assert_eq!(err.to_string(), "Agent failed after trying full, safe mode: boom");
    }
}
