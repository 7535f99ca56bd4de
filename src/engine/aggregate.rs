//! Folding one run's events into its [`RunResult`].
//!
//! Shared by the channel session's consumer loop and the one-shot executor.

use serde_json::Value;

use super::error::INTERRUPTED_TEXT;
use crate::connection::{AgentEvent, ResultEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Stopped by an interrupt or abort.
    Interrupted,
    /// The agent finished with a non-success terminal subtype.
    Failed { subtype: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub text: String,
    pub thinking: String,
    /// Resume id issued by the agent runtime, for the caller to persist.
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub turn_count: Option<u32>,
    /// Raw full assistant messages, in arrival order.
    pub messages: Vec<Value>,
    pub outcome: RunOutcome,
    /// Executor rung that produced this result; `None` for session runs.
    pub rung: Option<String>,
}

impl RunResult {
    pub fn is_interrupted(&self) -> bool {
        self.outcome == RunOutcome::Interrupted
    }
}

#[derive(Debug, Default)]
pub struct RunAccumulator {
    text: String,
    thinking: String,
    saw_text: bool,
    saw_thinking: bool,
    message_text: String,
    messages: Vec<Value>,
    session_id: Option<String>,
}

impl RunAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &AgentEvent) {
        if let Some(id) = event.session_id() {
            self.session_id = Some(id.to_string());
        }
        match event {
            AgentEvent::TextDelta { text, .. } => {
                self.saw_text = true;
                self.text.push_str(text);
            }
            AgentEvent::ThinkingDelta { thinking, .. } => {
                self.saw_thinking = true;
                self.thinking.push_str(thinking);
            }
            AgentEvent::Message { text, raw, .. } => {
                self.message_text.push_str(text);
                self.messages.push(raw.clone());
            }
            AgentEvent::SessionInit { .. }
            | AgentEvent::Result(_)
            | AgentEvent::ControlResponse { .. }
            | AgentEvent::Other { .. } => {}
        }
    }

    pub fn has_output(&self) -> bool {
        self.saw_text || self.saw_thinking || !self.message_text.is_empty()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Streamed deltas win; otherwise the terminal text, then full messages.
    fn resolved_text(&mut self, terminal: Option<&ResultEvent>) -> String {
        if self.saw_text {
            return std::mem::take(&mut self.text);
        }
        terminal
            .and_then(|result| result.text.clone())
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| std::mem::take(&mut self.message_text))
    }

    /// Finalize on the terminal event. `interrupted` reflects a soft stop
    /// requested while the run streamed.
    pub fn finish(mut self, terminal: &ResultEvent, interrupted: bool) -> RunResult {
        let mut text = self.resolved_text(Some(terminal));
        let outcome = if interrupted {
            if text.is_empty() {
                text = INTERRUPTED_TEXT.to_string();
            }
            RunOutcome::Interrupted
        } else if terminal.is_success() {
            RunOutcome::Completed
        } else {
            RunOutcome::Failed {
                subtype: terminal.subtype.clone(),
            }
        };

        RunResult {
            text,
            thinking: self.thinking,
            session_id: terminal.session_id.clone().or(self.session_id),
            cost_usd: terminal.cost_usd,
            duration_ms: terminal.duration_ms,
            turn_count: terminal.turn_count,
            messages: self.messages,
            outcome,
            rung: None,
        }
    }

    /// Finalize a run cancelled before its terminal event: partial text, or
    /// the interrupted placeholder when nothing was produced.
    pub fn interrupted(mut self, fallback_session_id: Option<String>) -> RunResult {
        let text = self.resolved_text(None);
        RunResult {
            text: if text.is_empty() {
                INTERRUPTED_TEXT.to_string()
            } else {
                text
            },
            thinking: self.thinking,
            session_id: self.session_id.or(fallback_session_id),
            cost_usd: None,
            duration_ms: None,
            turn_count: None,
            messages: self.messages,
            outcome: RunOutcome::Interrupted,
            rung: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fold(events: &[AgentEvent]) -> RunAccumulator {
        let mut acc = RunAccumulator::new();
        for event in events {
            acc.observe(event);
        }
        acc
    }

    #[test]
    fn deltas_and_terminal_text_aggregate_identically() {
        let terminal = ResultEvent::success("Hello");
        let streamed = fold(&[AgentEvent::text_delta("Hel"), AgentEvent::text_delta("lo")])
            .finish(&terminal, false);
        let unstreamed = fold(&[]).finish(&terminal, false);
        assert_eq!(streamed.text, "Hello");
        assert_eq!(streamed.text, unstreamed.text);
        assert_eq!(streamed.outcome, RunOutcome::Completed);
    }

    #[test]
    fn deltas_win_over_terminal_text() {
        let terminal = ResultEvent::success("final answer differs");
        let result = fold(&[AgentEvent::text_delta("streamed")]).finish(&terminal, false);
        assert_eq!(result.text, "streamed");
    }

    #[test]
    fn full_message_is_last_resort() {
        let terminal = ResultEvent {
            subtype: "success".into(),
            ..ResultEvent::default()
        };
        let message = AgentEvent::Message {
            text: "from message".into(),
            raw: json!({"content": "from message"}),
            session_id: None,
        };
        let result = fold(&[message]).finish(&terminal, false);
        assert_eq!(result.text, "from message");
        assert_eq!(result.messages.len(), 1);
    }

    #[test]
    fn captures_metadata_and_resume_id() {
        let terminal = ResultEvent {
            cost_usd: Some(0.5),
            duration_ms: Some(900),
            turn_count: Some(2),
            ..ResultEvent::success("ok")
        };
        let init = AgentEvent::SessionInit {
            session_id: "sess-9".into(),
        };
        let result = fold(&[init, AgentEvent::thinking_delta("plan")]).finish(&terminal, false);
        assert_eq!(result.session_id.as_deref(), Some("sess-9"));
        assert_eq!(result.thinking, "plan");
        assert_eq!(result.cost_usd, Some(0.5));
        assert_eq!(result.duration_ms, Some(900));
        assert_eq!(result.turn_count, Some(2));
    }

    #[test]
    fn error_subtype_maps_to_failed_outcome() {
        let terminal = ResultEvent {
            subtype: "error_max_turns".into(),
            is_error: true,
            ..ResultEvent::default()
        };
        let result = fold(&[]).finish(&terminal, false);
        assert_eq!(
            result.outcome,
            RunOutcome::Failed {
                subtype: "error_max_turns".into()
            }
        );
    }

    #[test]
    fn cancellation_distinguishes_partial_from_empty() {
        let empty = fold(&[]).interrupted(Some("prev".into()));
        assert_eq!(empty.text, INTERRUPTED_TEXT);
        assert_eq!(empty.session_id.as_deref(), Some("prev"));
        assert!(empty.is_interrupted());

        let partial = fold(&[AgentEvent::text_delta("half an ans")]).interrupted(None);
        assert_eq!(partial.text, "half an ans");
        assert!(partial.is_interrupted());
    }

    #[test]
    fn soft_interrupt_without_output_uses_placeholder() {
        let terminal = ResultEvent {
            subtype: "error_during_execution".into(),
            is_error: true,
            ..ResultEvent::default()
        };
        let result = fold(&[]).finish(&terminal, true);
        assert_eq!(result.text, INTERRUPTED_TEXT);
        assert_eq!(result.outcome, RunOutcome::Interrupted);
    }
}
