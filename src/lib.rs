#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

//! Drives long-running AI agent connections on behalf of chat channels.
//!
//! Each channel gets at most one streaming invocation at a time. Prompts
//! submitted while one is streaming queue up behind it on the same live
//! connection, can be cancelled individually, or can be steered into the
//! streaming run. One-shot invocations go through a retry ladder that routes
//! around transient agent-process failures.

pub mod config;
pub mod connection;
pub mod engine;
pub mod util;

pub use config::Config;
pub use engine::{
    ActiveRunRegistry, AgentRunner, EngineError, RunMode, RunObserver, RunOutcome, RunRequest,
    RunResult,
};
