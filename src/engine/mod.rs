pub mod aggregate;
pub mod error;
pub mod executor;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod runner;
pub mod session;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::connection::AgentEvent;

pub use aggregate::{RunAccumulator, RunOutcome, RunResult};
pub use error::{EngineError, INTERRUPTED_TEXT};
pub use executor::{InvocationExecutor, RetryPolicy, Rung, ladder};
pub use queue::PendingQueue;
pub use reaper::spawn_reaper;
pub use registry::{ActiveRun, ActiveRunRegistry};
pub use runner::AgentRunner;
pub use session::{ChannelSession, RunReply, SessionSignature};

/// Callbacks for one run. Invoked from the consuming task, never under a lock.
pub trait RunObserver: Send + Sync {
    /// The run reached the head of its queue and is now streaming.
    fn on_query_start(&self) {}

    fn on_message(&self, _event: &AgentEvent) {}

    fn on_text_delta(&self, _text: &str) {}

    fn on_thinking_delta(&self, _thinking: &str) {}
}

pub(crate) fn notify_observer(observer: Option<&Arc<dyn RunObserver>>, event: &AgentEvent) {
    let Some(observer) = observer else {
        return;
    };
    match event {
        AgentEvent::TextDelta { text, .. } => observer.on_text_delta(text),
        AgentEvent::ThinkingDelta { thinking, .. } => observer.on_thinking_delta(thinking),
        _ => {}
    }
    observer.on_message(event);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Queue onto the channel's persistent session.
    Session,
    /// Fresh connection through the retry ladder.
    OneShot,
}

#[derive(Clone)]
pub struct RunRequest {
    pub channel_id: String,
    pub prompt: String,
    pub working_dir: PathBuf,
    /// Resume id to continue an earlier agent session.
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub system_prompt: Option<String>,
    pub mcp_servers: BTreeMap<String, Value>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub cancellation: Option<CancellationToken>,
    pub observer: Option<Arc<dyn RunObserver>>,
    /// `None` picks the runner's default.
    pub mode: Option<RunMode>,
}

impl RunRequest {
    pub fn new(
        channel_id: impl Into<String>,
        prompt: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            prompt: prompt.into(),
            working_dir: working_dir.into(),
            session_id: None,
            model: None,
            permission_mode: None,
            system_prompt: None,
            mcp_servers: BTreeMap::new(),
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            cancellation: None,
            observer: None,
            mode: None,
        }
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn with_permission_mode(mut self, mode: impl Into<String>) -> Self {
        self.permission_mode = Some(mode.into());
        self
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn with_mcp_server(mut self, name: impl Into<String>, definition: Value) -> Self {
        self.mcp_servers.insert(name.into(), definition);
        self
    }

    #[must_use]
    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = tools;
        self
    }

    #[must_use]
    pub fn with_disallowed_tools(mut self, tools: Vec<String>) -> Self {
        self.disallowed_tools = tools;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Token for this run: a child of the caller's token, or a fresh one.
    pub(crate) fn run_token(&self) -> CancellationToken {
        self.cancellation
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token)
    }
}

impl std::fmt::Debug for RunRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRequest")
            .field("channel_id", &self.channel_id)
            .field("prompt", &self.prompt)
            .field("working_dir", &self.working_dir)
            .field("session_id", &self.session_id)
            .field("model", &self.model)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
