//! One live agent connection per channel and configuration.
//!
//! Runs submitted to a session queue FIFO behind the one currently
//! streaming. A run's prompt is written to the connection only when it
//! reaches the head, so each terminal event always belongs to the oldest
//! unresolved run.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::aggregate::{RunAccumulator, RunResult};
use super::error::{EngineError, error_chain};
use super::registry::{ActiveRun, ActiveRunRegistry};
use super::{RunObserver, RunRequest, notify_observer};
use crate::connection::{
    AgentEvent, ConnectOptions, Connection, ConnectionControl, ConnectionError,
    ConnectionFactory, EventStream, PromptMessage, PromptQueue,
};
use crate::util::clip_detail;

/// Configuration a session was opened with, minus the resume id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSignature {
    pub working_dir: PathBuf,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub system_prompt: Option<String>,
    pub mcp_servers: BTreeMap<String, Value>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub setting_sources: Vec<String>,
}

impl SessionSignature {
    pub fn from_options(options: &ConnectOptions) -> Self {
        Self {
            working_dir: options.working_dir.clone(),
            model: options.model.clone(),
            permission_mode: options.permission_mode.clone(),
            system_prompt: options.system_prompt.clone(),
            mcp_servers: options.mcp_servers.clone(),
            allowed_tools: options.allowed_tools.clone(),
            disallowed_tools: options.disallowed_tools.clone(),
            setting_sources: options.setting_sources.clone(),
        }
    }
}

type Reply = Result<RunResult, EngineError>;

/// Resolves when the submitted run settles.
#[must_use = "a run reply does nothing unless awaited"]
pub struct RunReply {
    rx: oneshot::Receiver<Reply>,
}

impl Future for RunReply {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or_else(|_| Err(EngineError::closed("session dropped"))))
    }
}

struct PendingRun {
    id: u64,
    prompt: Option<String>,
    observer: Option<Arc<dyn RunObserver>>,
    reply: oneshot::Sender<Reply>,
    cancellation: CancellationToken,
    started: bool,
    aborted: bool,
    accumulator: RunAccumulator,
    active: Option<Arc<ActiveRun>>,
    /// Stops the cancellation watcher once the run settles.
    _watch: DropGuard,
}

impl PendingRun {
    fn settle(mut self, registry: &ActiveRunRegistry, channel_id: &str, reply: Reply) {
        if let Some(active) = self.active.take() {
            registry.clear(channel_id, Some(&active));
        }
        let _ = self.reply.send(reply);
    }
}

struct SessionState {
    runs: VecDeque<PendingRun>,
    closed: bool,
    close_error: Option<EngineError>,
    last_known_resume_id: Option<String>,
    next_run_id: u64,
}

struct Teardown {
    runs: Vec<PendingRun>,
    reason: EngineError,
    resume_id: Option<String>,
}

struct SessionInner {
    channel_id: String,
    signature: SessionSignature,
    state: Mutex<SessionState>,
    prompts: Arc<PromptQueue>,
    control: Arc<dyn ConnectionControl>,
    registry: Arc<ActiveRunRegistry>,
    detail_max_chars: usize,
}

#[derive(Clone)]
pub struct ChannelSession {
    inner: Arc<SessionInner>,
}

impl ChannelSession {
    /// Open the connection and start consuming its events. A stream error
    /// that closes the session is clipped to `detail_max_chars`.
    pub async fn open(
        channel_id: impl Into<String>,
        options: ConnectOptions,
        factory: &dyn ConnectionFactory,
        registry: Arc<ActiveRunRegistry>,
        detail_max_chars: usize,
    ) -> Result<Self, ConnectionError> {
        let channel_id = channel_id.into();
        let prompts = Arc::new(PromptQueue::new());
        let Connection { control, events } =
            factory.open(Arc::clone(&prompts), options.clone()).await?;

        tracing::info!(
            channel = %channel_id,
            factory = factory.name(),
            resume = options.resume.as_deref().unwrap_or(""),
            "Opened agent session"
        );

        let inner = Arc::new(SessionInner {
            channel_id,
            signature: SessionSignature::from_options(&options),
            state: Mutex::new(SessionState {
                runs: VecDeque::new(),
                closed: false,
                close_error: None,
                last_known_resume_id: options.resume,
                next_run_id: 1,
            }),
            prompts,
            control,
            registry,
            detail_max_chars,
        });
        tokio::spawn(consume(Arc::clone(&inner), events));
        Ok(Self { inner })
    }

    pub fn channel_id(&self) -> &str {
        &self.inner.channel_id
    }

    pub fn signature(&self) -> &SessionSignature {
        &self.inner.signature
    }

    pub fn matches(&self, signature: &SessionSignature) -> bool {
        self.inner.signature == *signature
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn close_error(&self) -> Option<EngineError> {
        self.inner.state.lock().close_error.clone()
    }

    pub fn last_known_resume_id(&self) -> Option<String> {
        self.inner.state.lock().last_known_resume_id.clone()
    }

    /// Runs not yet settled, the streaming one included.
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().runs.len()
    }

    pub fn streaming_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .runs
            .iter()
            .filter(|run| run.started)
            .count()
    }

    /// Queue a run and return a future for its result.
    ///
    /// Enqueueing happens before this returns, so the order of `submit`
    /// calls is the order runs stream and resolve in. Must be called within
    /// a tokio runtime.
    pub fn submit(&self, request: RunRequest) -> Result<RunReply, EngineError> {
        let inner = &self.inner;
        let cancellation = request.run_token();
        let watch = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        let (run_id, started_observer) = {
            let mut state = inner.state.lock();
            if state.closed {
                return Err(state
                    .close_error
                    .clone()
                    .unwrap_or_else(|| EngineError::closed("session closed")));
            }
            let run_id = state.next_run_id;
            state.next_run_id += 1;

            let mut run = PendingRun {
                id: run_id,
                prompt: Some(request.prompt),
                observer: request.observer,
                reply: tx,
                cancellation: cancellation.clone(),
                started: false,
                aborted: false,
                accumulator: RunAccumulator::new(),
                active: None,
                _watch: watch.clone().drop_guard(),
            };
            let started_observer = if state.runs.is_empty() {
                inner.start(&mut run);
                Some(run.observer.clone())
            } else {
                None
            };
            state.runs.push_back(run);
            (run_id, started_observer)
        };

        tracing::debug!(channel = %inner.channel_id, run_id, "Queued run");
        watch_cancellation(Arc::downgrade(inner), run_id, cancellation, watch);
        if let Some(Some(observer)) = started_observer {
            observer.on_query_start();
        }
        Ok(RunReply { rx })
    }

    pub async fn run(&self, request: RunRequest) -> Result<RunResult, EngineError> {
        self.submit(request)?.await
    }

    /// Feed extra input to the streaming run. Does not create a new run.
    pub fn steer(&self, text: impl Into<String>) -> bool {
        let state = self.inner.state.lock();
        if state.closed || state.runs.is_empty() {
            return false;
        }
        self.inner.prompts.enqueue(PromptMessage::new(text))
    }

    /// Close the connection and reject every pending run with `reason`.
    /// Idempotent.
    pub fn close(&self, reason: EngineError) {
        let teardown = {
            let mut state = self.inner.state.lock();
            self.inner.close_locked(&mut state, reason)
        };
        if let Some(teardown) = &teardown {
            tracing::info!(
                channel = %self.inner.channel_id,
                pending = teardown.runs.len(),
                "Closing agent session: {}",
                teardown.reason
            );
        }
        self.inner.finish_close(teardown);
    }
}

impl SessionInner {
    /// Mark `run` streaming, hand its prompt to the connection and publish
    /// its handle. Called under the state lock.
    fn start(&self, run: &mut PendingRun) {
        run.started = true;
        if let Some(prompt) = run.prompt.take() {
            self.prompts.enqueue(PromptMessage::new(prompt));
        }
        run.active = Some(self.registry.register(
            &self.channel_id,
            ActiveRun::new(Arc::clone(&self.control), run.cancellation.clone()),
        ));
    }

    fn close_locked(&self, state: &mut SessionState, reason: EngineError) -> Option<Teardown> {
        if state.closed {
            return None;
        }
        state.closed = true;
        state.close_error = Some(reason.clone());
        Some(Teardown {
            runs: state.runs.drain(..).collect(),
            reason,
            resume_id: state.last_known_resume_id.clone(),
        })
    }

    fn finish_close(&self, teardown: Option<Teardown>) {
        let Some(Teardown {
            runs,
            reason,
            resume_id,
        }) = teardown
        else {
            return;
        };
        self.prompts.end();
        self.control.close();
        for mut run in runs {
            let reply = if run.aborted {
                let accumulator = std::mem::take(&mut run.accumulator);
                Ok(accumulator.interrupted(resume_id.clone()))
            } else {
                Err(reason.clone())
            };
            run.settle(&self.registry, &self.channel_id, reply);
        }
    }

    fn cancel_run(&self, run_id: u64) {
        let mut state = self.state.lock();
        let Some(position) = state.runs.iter().position(|run| run.id == run_id) else {
            return;
        };

        if position > 0 {
            let Some(run) = state.runs.remove(position) else {
                return;
            };
            drop(state);
            tracing::debug!(channel = %self.channel_id, run_id, "Cancelled queued run");
            run.settle(&self.registry, &self.channel_id, Err(EngineError::Cancelled));
            return;
        }

        // The wire has no narrower target than the whole connection.
        if let Some(head) = state.runs.front_mut() {
            head.aborted = true;
        }
        let teardown = self.close_locked(&mut state, EngineError::closed("run aborted"));
        drop(state);
        tracing::info!(
            channel = %self.channel_id,
            run_id,
            "Aborted streaming run; closing session"
        );
        self.finish_close(teardown);
    }

    fn handle_event(&self, event: AgentEvent) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if let Some(id) = event.session_id() {
            state.last_known_resume_id = Some(id.to_string());
        }

        let AgentEvent::Result(terminal) = &event else {
            let Some(head) = state.runs.front_mut() else {
                tracing::trace!(channel = %self.channel_id, "Event with no pending run");
                return;
            };
            head.accumulator.observe(&event);
            let observer = head.observer.clone();
            drop(state);
            notify_observer(observer.as_ref(), &event);
            return;
        };

        let Some(mut head) = state.runs.pop_front() else {
            tracing::debug!(channel = %self.channel_id, "Terminal event with no pending run");
            return;
        };
        head.accumulator.observe(&event);
        let interrupted = head.active.as_ref().is_some_and(|run| run.is_interrupted());
        let mut result = std::mem::take(&mut head.accumulator).finish(terminal, interrupted);
        if result.session_id.is_none() {
            result.session_id.clone_from(&state.last_known_resume_id);
        }

        let next_observer = state.runs.front_mut().map(|next| {
            self.start(next);
            next.observer.clone()
        });
        drop(state);

        notify_observer(head.observer.as_ref(), &event);
        tracing::debug!(channel = %self.channel_id, run_id = head.id, "Run completed");
        head.settle(&self.registry, &self.channel_id, Ok(result));
        if let Some(Some(observer)) = next_observer {
            observer.on_query_start();
        }
    }
}

fn watch_cancellation(
    session: Weak<SessionInner>,
    run_id: u64,
    cancellation: CancellationToken,
    settled: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            () = settled.cancelled() => {}
            () = cancellation.cancelled() => {
                if let Some(session) = session.upgrade() {
                    session.cancel_run(run_id);
                }
            }
        }
    });
}

async fn consume(session: Arc<SessionInner>, mut events: EventStream) {
    let failure = loop {
        match events.next().await {
            Some(Ok(event)) => session.handle_event(event),
            Some(Err(e)) => {
                let detail = clip_detail(&error_chain(&e), session.detail_max_chars);
                break EngineError::StreamFailed(detail);
            }
            None => break EngineError::StreamEnded,
        }
    };

    let teardown = {
        let mut state = session.state.lock();
        session.close_locked(&mut state, failure)
    };
    if let Some(teardown) = &teardown {
        if teardown.runs.is_empty() {
            tracing::debug!(channel = %session.channel_id, "Agent stream ended while idle");
        } else {
            tracing::warn!(
                channel = %session.channel_id,
                pending = teardown.runs.len(),
                "{}",
                teardown.reason
            );
        }
    }
    session.finish_close(teardown);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ResultEvent, Script, ScriptedConnection, ScriptedFactory};
    use crate::engine::INTERRUPTED_TEXT;
    use crate::engine::aggregate::RunOutcome;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn open(
        factory: &ScriptedFactory,
        registry: &Arc<ActiveRunRegistry>,
    ) -> (ChannelSession, Arc<ScriptedConnection>) {
        let session = ChannelSession::open(
            "chan",
            ConnectOptions::default(),
            factory,
            Arc::clone(registry),
            300,
        )
        .await
        .unwrap();
        let connection = factory.wait_for_connection(factory.open_count() - 1).await;
        (session, connection)
    }

    fn request(prompt: &str) -> RunRequest {
        RunRequest::new("chan", prompt, "/work")
    }

    #[derive(Default)]
    struct Recorder {
        started: AtomicUsize,
        deltas: parking_lot::Mutex<String>,
    }

    impl RunObserver for Recorder {
        fn on_query_start(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_text_delta(&self, text: &str) {
            self.deltas.lock().push_str(text);
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn runs_resolve_in_submission_order() {
        let factory = ScriptedFactory::new()
            .with_script(Script::live().answer("one").answer("two").answer("three"));
        let registry = Arc::new(ActiveRunRegistry::new());
        let (session, connection) = open(&factory, &registry).await;

        let replies: Vec<RunReply> = ["a", "b", "c"]
            .into_iter()
            .map(|prompt| session.submit(request(prompt)).unwrap())
            .collect();
        assert_eq!(session.streaming_count(), 1);
        assert_eq!(session.pending_len(), 3);

        let mut texts = Vec::new();
        for reply in replies {
            texts.push(reply.await.unwrap().text);
            assert!(session.streaming_count() <= 1);
        }
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert_eq!(connection.prompts(), vec!["a", "b", "c"]);
        assert!(!session.is_closed());
        assert!(!registry.is_active("chan"));
    }

    #[tokio::test]
    async fn only_head_prompt_is_written_to_connection() {
        let factory = ScriptedFactory::new();
        let registry = Arc::new(ActiveRunRegistry::new());
        let (session, connection) = open(&factory, &registry).await;

        let first = session.submit(request("first")).unwrap();
        let _second = session.submit(request("second")).unwrap();
        assert_eq!(connection.wait_for_prompts(1).await, vec!["first"]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connection.prompts(), vec!["first"]);

        connection.push(AgentEvent::Result(ResultEvent::success("done")));
        assert_eq!(first.await.unwrap().text, "done");
        assert_eq!(connection.wait_for_prompts(2).await, vec!["first", "second"]);
        assert_eq!(session.streaming_count(), 1);
        assert!(registry.is_active("chan"));
    }

    #[tokio::test]
    async fn cancelling_queued_run_leaves_session_open() {
        let factory = ScriptedFactory::new();
        let registry = Arc::new(ActiveRunRegistry::new());
        let (session, connection) = open(&factory, &registry).await;

        let token = CancellationToken::new();
        let r1 = session.submit(request("r1")).unwrap();
        let r2 = session
            .submit(request("r2").with_cancellation(token.clone()))
            .unwrap();
        let r3 = session.submit(request("r3")).unwrap();

        token.cancel();
        assert_eq!(r2.await, Err(EngineError::Cancelled));
        assert!(!session.is_closed());
        assert_eq!(session.pending_len(), 2);

        connection.push(AgentEvent::Result(ResultEvent::success("1")));
        assert_eq!(r1.await.unwrap().text, "1");
        assert_eq!(connection.wait_for_prompts(2).await, vec!["r1", "r3"]);
        connection.push(AgentEvent::Result(ResultEvent::success("3")));
        assert_eq!(r3.await.unwrap().text, "3");
        assert_eq!(connection.close_count(), 0);
    }

    #[tokio::test]
    async fn cancelling_head_closes_session() {
        let factory = ScriptedFactory::new();
        let registry = Arc::new(ActiveRunRegistry::new());
        let (session, connection) = open(&factory, &registry).await;

        let token = CancellationToken::new();
        let head = session
            .submit(request("r1").with_cancellation(token.clone()))
            .unwrap();
        let queued = session.submit(request("r2")).unwrap();

        token.cancel();
        let result = head.await.unwrap();
        assert_eq!(result.text, INTERRUPTED_TEXT);
        assert_eq!(result.outcome, RunOutcome::Interrupted);
        assert_eq!(queued.await, Err(EngineError::closed("run aborted")));
        assert!(session.is_closed());
        assert_eq!(connection.close_count(), 1);
        assert!(!registry.is_active("chan"));
        assert!(!session.steer("too late"));
    }

    #[tokio::test]
    async fn aborted_head_keeps_partial_text() {
        let factory = ScriptedFactory::new();
        let registry = Arc::new(ActiveRunRegistry::new());
        let (session, connection) = open(&factory, &registry).await;
        let recorder = Arc::new(Recorder::default());

        let head = session
            .submit(request("r1").with_observer(recorder.clone()))
            .unwrap();
        assert_eq!(recorder.started.load(Ordering::SeqCst), 1);
        connection.push(AgentEvent::text_delta("partial"));
        wait_until(|| recorder.deltas.lock().as_str() == "partial").await;

        assert!(registry.abort("chan"));
        let result = head.await.unwrap();
        assert_eq!(result.text, "partial");
        assert!(result.is_interrupted());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn stream_failure_rejects_every_pending_run() {
        let factory = ScriptedFactory::new();
        let registry = Arc::new(ActiveRunRegistry::new());
        let (session, connection) = open(&factory, &registry).await;

        let r1 = session.submit(request("r1")).unwrap();
        let r2 = session.submit(request("r2")).unwrap();
        connection.push(AgentEvent::text_delta("half"));
        connection.fail(ConnectionError::ProcessExited {
            code: 2,
            stderr: None,
        });

        let expected = EngineError::StreamFailed("Claude Code process exited with code 2".into());
        assert_eq!(r1.await, Err(expected.clone()));
        assert_eq!(r2.await, Err(expected.clone()));
        assert!(session.is_closed());
        assert_eq!(session.close_error(), Some(expected.clone()));
        assert_eq!(session.submit(request("r3")).err(), Some(expected));
    }

    #[tokio::test]
    async fn stream_failure_detail_uses_configured_limit() {
        let factory = ScriptedFactory::new();
        let registry = Arc::new(ActiveRunRegistry::new());
        let session = ChannelSession::open(
            "chan",
            ConnectOptions::default(),
            &factory,
            Arc::clone(&registry),
            16,
        )
        .await
        .unwrap();
        let connection = factory.wait_for_connection(0).await;

        let r1 = session.submit(request("r1")).unwrap();
        connection.fail(ConnectionError::Rejected("x".repeat(500)));
        assert_eq!(
            r1.await,
            Err(EngineError::StreamFailed("Agent rejected t...".into()))
        );
    }

    #[tokio::test]
    async fn stream_end_without_terminal_is_an_error() {
        let factory = ScriptedFactory::new();
        let registry = Arc::new(ActiveRunRegistry::new());
        let (session, connection) = open(&factory, &registry).await;

        let r1 = session.submit(request("r1")).unwrap();
        connection.finish();
        assert_eq!(r1.await, Err(EngineError::StreamEnded));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn steer_feeds_connection_without_new_run() {
        let factory = ScriptedFactory::new();
        let registry = Arc::new(ActiveRunRegistry::new());
        let (session, connection) = open(&factory, &registry).await;

        assert!(!session.steer("nobody listening"));
        let r1 = session.submit(request("r1")).unwrap();
        assert!(session.steer("also check tests"));
        assert_eq!(
            connection.wait_for_prompts(2).await,
            vec!["r1", "also check tests"]
        );
        assert_eq!(session.pending_len(), 1);

        connection.push(AgentEvent::text_delta("ok"));
        connection.push(AgentEvent::Result(ResultEvent::success("ok")));
        assert_eq!(r1.await.unwrap().text, "ok");
    }

    #[tokio::test]
    async fn tracks_resume_id_and_close_is_idempotent() {
        let factory = ScriptedFactory::new();
        let registry = Arc::new(ActiveRunRegistry::new());
        let (session, connection) = open(&factory, &registry).await;

        let r1 = session.submit(request("r1")).unwrap();
        connection.push(AgentEvent::SessionInit {
            session_id: "sess-42".into(),
        });
        connection.push(AgentEvent::Result(ResultEvent::success("hi")));
        assert_eq!(r1.await.unwrap().session_id.as_deref(), Some("sess-42"));
        assert_eq!(session.last_known_resume_id().as_deref(), Some("sess-42"));

        session.close(EngineError::closed("first"));
        session.close(EngineError::closed("second"));
        assert_eq!(session.close_error(), Some(EngineError::closed("first")));
        assert_eq!(connection.close_count(), 1);
    }
}
