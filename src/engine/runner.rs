//! Entry point for callers: routes runs to channel sessions or the one-shot
//! executor and fans control requests out through the registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::{EngineError, error_chain};
use super::executor::{InvocationExecutor, RetryPolicy};
use super::registry::ActiveRunRegistry;
use super::session::{ChannelSession, RunReply, SessionSignature};
use super::{RunMode, RunRequest, RunResult};
use crate::config::Config;
use crate::connection::{ConnectOptions, ConnectionFactory};

pub struct AgentRunner {
    factory: Arc<dyn ConnectionFactory>,
    registry: Arc<ActiveRunRegistry>,
    executor: InvocationExecutor,
    sessions: Mutex<HashMap<String, ChannelSession>>,
    config: Config,
}

impl AgentRunner {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        registry: Arc<ActiveRunRegistry>,
        config: Config,
    ) -> Self {
        let executor = InvocationExecutor::new(
            Arc::clone(&factory),
            Arc::clone(&registry),
            RetryPolicy::from_config(&config.engine),
        );
        Self {
            factory,
            registry,
            executor,
            sessions: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ActiveRunRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn mode_for(&self, request: &RunRequest) -> RunMode {
        request.mode.unwrap_or(if self.config.engine.persistent_sessions {
            RunMode::Session
        } else {
            RunMode::OneShot
        })
    }

    /// Request settings layered over configured defaults.
    pub fn connect_options(&self, request: &RunRequest) -> ConnectOptions {
        let agent = &self.config.agent;
        let mut mcp_servers = self.config.mcp_servers.clone();
        mcp_servers.extend(
            request
                .mcp_servers
                .iter()
                .map(|(name, def)| (name.clone(), def.clone())),
        );
        ConnectOptions {
            working_dir: request.working_dir.clone(),
            model: request.model.clone().or_else(|| agent.default_model.clone()),
            permission_mode: request
                .permission_mode
                .clone()
                .or_else(|| Some(agent.permission_mode.clone())),
            system_prompt: request.system_prompt.clone(),
            resume: request.session_id.clone(),
            mcp_servers,
            allowed_tools: request.allowed_tools.clone(),
            disallowed_tools: request.disallowed_tools.clone(),
            setting_sources: agent.setting_sources.clone(),
        }
    }

    pub async fn run(&self, request: RunRequest) -> Result<RunResult, EngineError> {
        match self.mode_for(&request) {
            RunMode::OneShot => {
                let options = self.connect_options(&request);
                self.executor.run(request, options).await
            }
            RunMode::Session => self.submit(request).await?.await,
        }
    }

    /// Queue a run on the channel's session and return once it is enqueued.
    pub async fn submit(&self, request: RunRequest) -> Result<RunReply, EngineError> {
        let options = self.connect_options(&request);
        let session = self.session_for(&request.channel_id, options).await?;
        session.submit(request)
    }

    /// Reuse the channel's session when its signature matches; otherwise
    /// replace it, carrying the last known resume id forward.
    async fn session_for(
        &self,
        channel_id: &str,
        mut options: ConnectOptions,
    ) -> Result<ChannelSession, EngineError> {
        let signature = SessionSignature::from_options(&options);

        let stale = {
            let mut sessions = self.sessions.lock();
            let reusable = sessions
                .get(channel_id)
                .filter(|session| !session.is_closed() && session.matches(&signature))
                .cloned();
            if let Some(session) = reusable {
                return Ok(session);
            }
            sessions.remove(channel_id)
        };

        if let Some(stale) = stale {
            if options.resume.is_none() {
                options.resume = stale.last_known_resume_id();
            }
            if !stale.is_closed() {
                tracing::info!(
                    channel = channel_id,
                    "Replacing agent session: configuration changed"
                );
                stale.close(EngineError::closed("configuration changed"));
            }
        }

        let session = ChannelSession::open(
            channel_id,
            options,
            self.factory.as_ref(),
            Arc::clone(&self.registry),
            self.config.engine.error_detail_max_chars,
        )
        .await
        .map_err(|e| EngineError::Permanent(error_chain(&e)))?;

        let displaced = {
            let mut sessions = self.sessions.lock();
            let raced = sessions
                .get(channel_id)
                .filter(|existing| !existing.is_closed() && existing.matches(&signature))
                .cloned();
            match raced {
                // A concurrent open for the same channel won.
                Some(existing) => {
                    drop(sessions);
                    session.close(EngineError::closed("superseded"));
                    return Ok(existing);
                }
                None => sessions.insert(channel_id.to_string(), session.clone()),
            }
        };
        if let Some(displaced) = displaced {
            displaced.close(EngineError::closed("configuration changed"));
        }
        Ok(session)
    }

    pub fn session(&self, channel_id: &str) -> Option<ChannelSession> {
        self.sessions.lock().get(channel_id).cloned()
    }

    pub fn steer(&self, channel_id: &str, text: &str) -> bool {
        self.session(channel_id)
            .is_some_and(|session| session.steer(text))
    }

    pub async fn interrupt(&self, channel_id: &str) -> bool {
        self.registry.interrupt(channel_id).await
    }

    pub fn abort(&self, channel_id: &str) -> bool {
        self.registry.abort(channel_id)
    }

    pub fn abort_all(&self) -> Vec<String> {
        self.registry.abort_all()
    }

    pub async fn set_model(&self, channel_id: &str, model: &str) -> bool {
        self.registry.set_model(channel_id, model).await
    }

    pub async fn stop_task(&self, channel_id: &str, task_id: &str) -> bool {
        self.registry.stop_task(channel_id, task_id).await
    }

    pub fn is_active(&self, channel_id: &str) -> bool {
        self.registry.is_active(channel_id)
    }

    /// Close every session, then abort whatever one-shot runs remain.
    pub fn shutdown(&self) {
        let sessions: Vec<ChannelSession> =
            self.sessions.lock().drain().map(|(_, session)| session).collect();
        for session in &sessions {
            session.close(EngineError::closed("shutting down"));
        }
        let aborted = self.registry.abort_all();
        tracing::info!(
            aborted = aborted.len(),
            sessions = sessions.len(),
            "Agent runner shut down"
        );
    }
}
