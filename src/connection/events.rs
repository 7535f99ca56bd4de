//! Closed event union for the agent's outbound stream.
//!
//! The agent runtime emits loosely-typed JSON lines. Everything past this
//! module works with [`AgentEvent`]; unknown `type` tags become
//! [`AgentEvent::Other`] and are ignored by consumers.

use serde_json::Value;

/// Terminal event closing one invocation (one prompt's worth of turns).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultEvent {
    /// `success`, `error_max_turns`, `error_during_execution`, ...
    pub subtype: String,
    pub is_error: bool,
    /// Full final text, used when no deltas were streamed.
    pub text: Option<String>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub turn_count: Option<u32>,
    pub session_id: Option<String>,
}

impl ResultEvent {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            subtype: "success".to_string(),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        !self.is_error && self.subtype == "success"
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    SessionInit {
        session_id: String,
    },
    TextDelta {
        text: String,
        session_id: Option<String>,
    },
    ThinkingDelta {
        thinking: String,
        session_id: Option<String>,
    },
    /// A complete assistant message. Only its text is used, and only as a
    /// fallback when nothing was streamed.
    Message {
        text: String,
        raw: Value,
        session_id: Option<String>,
    },
    Result(ResultEvent),
    ControlResponse {
        request_id: String,
        error: Option<String>,
    },
    Other {
        kind: String,
        session_id: Option<String>,
    },
}

impl AgentEvent {
    pub fn text_delta(text: impl Into<String>) -> Self {
        Self::TextDelta {
            text: text.into(),
            session_id: None,
        }
    }

    pub fn thinking_delta(thinking: impl Into<String>) -> Self {
        Self::ThinkingDelta {
            thinking: thinking.into(),
            session_id: None,
        }
    }

    /// Resume id carried by this event, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionInit { session_id } => Some(session_id),
            Self::TextDelta { session_id, .. }
            | Self::ThinkingDelta { session_id, .. }
            | Self::Message { session_id, .. }
            | Self::Other { session_id, .. } => session_id.as_deref(),
            Self::Result(result) => result.session_id.as_deref(),
            Self::ControlResponse { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_))
    }

    /// Parse one stream-json line from the agent CLI.
    ///
    /// Returns `None` for lines that are not JSON objects with a `type`.
    pub fn from_json(value: &Value) -> Option<Self> {
        let kind = value.get("type").and_then(Value::as_str)?;
        let session_id = value
            .get("session_id")
            .and_then(Value::as_str)
            .map(ToString::to_string);

        let event = match kind {
            "system" if value.get("subtype").and_then(Value::as_str) == Some("init") => {
                match session_id {
                    Some(session_id) => Self::SessionInit { session_id },
                    None => Self::Other {
                        kind: kind.to_string(),
                        session_id: None,
                    },
                }
            }
            "stream_event" => Self::from_stream_event(value.get("event")?, session_id),
            "assistant" => {
                let message = value.get("message").unwrap_or(&Value::Null);
                Self::Message {
                    text: message_text(message),
                    raw: message.clone(),
                    session_id,
                }
            }
            "result" => Self::Result(ResultEvent {
                subtype: value
                    .get("subtype")
                    .and_then(Value::as_str)
                    .unwrap_or("success")
                    .to_string(),
                is_error: value
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                text: value
                    .get("result")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                cost_usd: value.get("total_cost_usd").and_then(Value::as_f64),
                duration_ms: value.get("duration_ms").and_then(Value::as_u64),
                turn_count: value
                    .get("num_turns")
                    .and_then(Value::as_u64)
                    .and_then(|n| u32::try_from(n).ok()),
                session_id,
            }),
            "control_response" => {
                let response = value.get("response").unwrap_or(&Value::Null);
                let request_id = response
                    .get("request_id")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let error = if response.get("subtype").and_then(Value::as_str) == Some("error") {
                    Some(
                        response
                            .get("error")
                            .and_then(Value::as_str)
                            .unwrap_or("control request failed")
                            .to_string(),
                    )
                } else {
                    None
                };
                Self::ControlResponse { request_id, error }
            }
            other => Self::Other {
                kind: other.to_string(),
                session_id,
            },
        };
        Some(event)
    }

    fn from_stream_event(event: &Value, session_id: Option<String>) -> Self {
        let delta = event.get("delta").unwrap_or(&Value::Null);
        match (
            event.get("type").and_then(Value::as_str),
            delta.get("type").and_then(Value::as_str),
        ) {
            (Some("content_block_delta"), Some("text_delta")) => Self::TextDelta {
                text: delta
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                session_id,
            },
            (Some("content_block_delta"), Some("thinking_delta")) => Self::ThinkingDelta {
                thinking: delta
                    .get("thinking")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                session_id,
            },
            (inner, _) => Self::Other {
                kind: format!("stream_event:{}", inner.unwrap_or("unknown")),
                session_id,
            },
        }
    }
}

/// Concatenate the text blocks of an assistant message.
fn message_text(message: &Value) -> String {
    let Some(content) = message.get("content") else {
        return String::new();
    };
    if let Some(text) = content.as_str() {
        return text.to_string();
    }
    content
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_text_and_thinking_deltas() {
        let text = json!({
            "type": "stream_event",
            "session_id": "s-1",
            "event": {"type": "content_block_delta", "delta": {"type": "text_delta", "text": "Hel"}}
        });
        assert_eq!(
            AgentEvent::from_json(&text),
            Some(AgentEvent::TextDelta {
                text: "Hel".into(),
                session_id: Some("s-1".into())
            })
        );

        let thinking = json!({
            "type": "stream_event",
            "event": {"type": "content_block_delta", "delta": {"type": "thinking_delta", "thinking": "hmm"}}
        });
        assert_eq!(
            AgentEvent::from_json(&thinking),
            Some(AgentEvent::thinking_delta("hmm"))
        );
    }

    #[test]
    fn parses_result_metadata() {
        let line = json!({
            "type": "result",
            "subtype": "success",
            "is_error": false,
            "result": "Hello",
            "total_cost_usd": 0.25,
            "duration_ms": 1200,
            "num_turns": 3,
            "session_id": "abc"
        });
        let Some(AgentEvent::Result(result)) = AgentEvent::from_json(&line) else {
            panic!("expected result event");
        };
        assert!(result.is_success());
        assert_eq!(result.text.as_deref(), Some("Hello"));
        assert_eq!(result.cost_usd, Some(0.25));
        assert_eq!(result.duration_ms, Some(1200));
        assert_eq!(result.turn_count, Some(3));
        assert_eq!(result.session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn assistant_message_text_skips_non_text_blocks() {
        let line = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "thinking", "thinking": "..."},
                {"type": "text", "text": "Hel"},
                {"type": "tool_use", "id": "t1", "name": "Read", "input": {}},
                {"type": "text", "text": "lo"}
            ]}
        });
        match AgentEvent::from_json(&line) {
            Some(AgentEvent::Message { text, .. }) => assert_eq!(text, "Hello"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_tags_pass_through_as_other() {
        let line = json!({"type": "rate_limit_event", "session_id": "s"});
        let event = AgentEvent::from_json(&line).unwrap();
        assert!(matches!(event, AgentEvent::Other { ref kind, .. } if kind == "rate_limit_event"));
        assert_eq!(event.session_id(), Some("s"));
        assert!(!event.is_terminal());
        assert_eq!(AgentEvent::from_json(&json!({"no": "type"})), None);
    }

    #[test]
    fn control_response_error_is_captured() {
        let line = json!({
            "type": "control_response",
            "response": {"subtype": "error", "request_id": "req_1", "error": "no such model"}
        });
        assert_eq!(
            AgentEvent::from_json(&line),
            Some(AgentEvent::ControlResponse {
                request_id: "req_1".into(),
                error: Some("no such model".into())
            })
        );
    }
}
