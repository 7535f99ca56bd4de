pub mod claude_cli;
pub mod events;
pub mod scripted;
pub mod traits;

pub use claude_cli::ClaudeCliFactory;
pub use events::{AgentEvent, ResultEvent};
pub use scripted::{Script, ScriptedConnection, ScriptedFactory};
pub use traits::{
    ConnectOptions, Connection, ConnectionControl, ConnectionError, ConnectionFactory,
    EventStream, ProcessOutput, PromptMessage, PromptQueue,
};
