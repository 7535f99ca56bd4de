use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;

use super::events::AgentEvent;
use crate::engine::EngineError;
use crate::engine::queue::PendingQueue;

/// One user message fed into a live connection's input channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub text: String,
}

impl PromptMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Input channel of a connection: prompts for queued runs plus steering text.
pub type PromptQueue = PendingQueue<PromptMessage, EngineError>;

pub type EventStream = BoxStream<'static, Result<AgentEvent, ConnectionError>>;

/// Stderr captured from the agent process, kept as the cause of an exit error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ProcessOutput(pub String);

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to start agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Claude Code process exited with code {code}")]
    ProcessExited {
        code: i32,
        #[source]
        stderr: Option<ProcessOutput>,
    },

    #[error("Agent process terminated by signal")]
    Killed,

    #[error("Agent stream I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Agent rejected the request: {0}")]
    Rejected(String),

    #[error("Control request '{request}' failed: {reason}")]
    Control { request: String, reason: String },

    #[error("Control request '{0}' timed out")]
    ControlTimeout(String),

    #[error("Connection is closed")]
    Closed,
}

/// Settings for opening one connection. Everything except `resume` feeds the
/// session signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    pub working_dir: PathBuf,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub system_prompt: Option<String>,
    /// Externally issued session id to resume.
    pub resume: Option<String>,
    /// Extra-context (MCP) servers, by name.
    pub mcp_servers: BTreeMap<String, Value>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    /// Settings scopes the agent may load. Empty means minimal trust.
    pub setting_sources: Vec<String>,
}

/// Out-of-band control surface of a live connection.
///
/// Shared between the owning session (which alone calls [`close`]) and the
/// active run registry (which only issues control calls).
///
/// [`close`]: ConnectionControl::close
#[async_trait]
pub trait ConnectionControl: Send + Sync {
    /// Ask the agent to stop the current turn; it still emits a terminal event.
    async fn interrupt(&self) -> Result<(), ConnectionError>;

    async fn set_model(&self, model: &str) -> Result<(), ConnectionError>;

    async fn stop_task(&self, task_id: &str) -> Result<(), ConnectionError>;

    /// Tear the connection down. Idempotent; the event stream ends afterwards.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A freshly opened connection: control handle plus its inbound events.
pub struct Connection {
    pub control: Arc<dyn ConnectionControl>,
    pub events: EventStream,
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Open a connection that reads user messages from `prompts` until the
    /// queue ends.
    async fn open(
        &self,
        prompts: Arc<PromptQueue>,
        options: ConnectOptions,
    ) -> Result<Connection, ConnectionError>;
}
