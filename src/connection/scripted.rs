//! In-memory connection factory driven by scripts.
//!
//! Each `open` consumes the next queued [`Script`] (or opens a live
//! connection when none is queued). Scripted replies are emitted one batch
//! per prompt received, so events never arrive before the run they answer
//! was written to the connection. Live connections are fed by the caller via
//! [`ScriptedConnection::push`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::events::AgentEvent;
use super::traits::{
    ConnectOptions, Connection, ConnectionControl, ConnectionError, ConnectionFactory, PromptQueue,
};

type EventSender = mpsc::UnboundedSender<Result<AgentEvent, ConnectionError>>;

enum Reply {
    Events(Vec<AgentEvent>),
    /// Emit the events, then fail the stream and end it.
    Exit(Vec<AgentEvent>, ConnectionError),
}

/// What one opened connection does.
#[derive(Default)]
pub struct Script {
    open_error: Option<ConnectionError>,
    replies: VecDeque<Reply>,
}

impl Script {
    /// A connection with no canned replies; drive it with `push`.
    pub fn live() -> Self {
        Self::default()
    }

    /// `open` itself fails with `error`.
    pub fn fail(error: ConnectionError) -> Self {
        Self {
            open_error: Some(error),
            replies: VecDeque::new(),
        }
    }

    /// Emit `events` when the next prompt arrives.
    #[must_use]
    pub fn reply(mut self, events: Vec<AgentEvent>) -> Self {
        self.replies.push_back(Reply::Events(events));
        self
    }

    /// Emit `events` when the next prompt arrives, then fail with `error`.
    #[must_use]
    pub fn reply_then_exit(mut self, events: Vec<AgentEvent>, error: ConnectionError) -> Self {
        self.replies.push_back(Reply::Exit(events, error));
        self
    }

    /// Shorthand: one streamed answer per prompt, `text` split into two deltas.
    #[must_use]
    pub fn answer(self, text: &str) -> Self {
        let split = text.char_indices().nth(text.chars().count() / 2).map_or(0, |(i, _)| i);
        let (head, tail) = text.split_at(split);
        self.reply(vec![
            AgentEvent::text_delta(head),
            AgentEvent::text_delta(tail),
            AgentEvent::Result(super::events::ResultEvent::success(text)),
        ])
    }
}

#[derive(Default)]
pub struct ScriptedFactory {
    scripts: Mutex<VecDeque<Script>>,
    attempts: Mutex<Vec<ConnectOptions>>,
    connections: Mutex<Vec<Arc<ScriptedConnection>>>,
    opened: Notify,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_script(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    #[must_use]
    pub fn with_script(self, script: Script) -> Self {
        self.push_script(script);
        self
    }

    /// Options of every `open` call, failed ones included.
    pub fn attempts(&self) -> Vec<ConnectOptions> {
        self.attempts.lock().clone()
    }

    pub fn open_count(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn connection(&self, index: usize) -> Option<Arc<ScriptedConnection>> {
        self.connections.lock().get(index).cloned()
    }

    /// Wait until the `index`-th successfully opened connection exists.
    pub async fn wait_for_connection(&self, index: usize) -> Arc<ScriptedConnection> {
        loop {
            let notified = self.opened.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(connection) = self.connection(index) {
                return connection;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ConnectionFactory for ScriptedFactory {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open(
        &self,
        prompts: Arc<PromptQueue>,
        options: ConnectOptions,
    ) -> Result<Connection, ConnectionError> {
        self.attempts.lock().push(options.clone());
        let script = self.scripts.lock().pop_front().unwrap_or_default();
        if let Some(error) = script.open_error {
            self.opened.notify_waiters();
            return Err(error);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(ScriptedConnection {
            options,
            sender: Mutex::new(Some(tx)),
            replies: Mutex::new(script.replies),
            prompts: Mutex::new(Vec::new()),
            prompt_received: Notify::new(),
            interrupts: AtomicUsize::new(0),
            models: Mutex::new(Vec::new()),
            stopped_tasks: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            reject_controls: AtomicBool::new(false),
        });

        tokio::spawn(read_prompts(Arc::clone(&connection), prompts));
        self.connections.lock().push(Arc::clone(&connection));
        self.opened.notify_waiters();

        Ok(Connection {
            control: connection,
            events: UnboundedReceiverStream::new(rx).boxed(),
        })
    }
}

async fn read_prompts(connection: Arc<ScriptedConnection>, prompts: Arc<PromptQueue>) {
    let prompts = prompts.into_stream();
    tokio::pin!(prompts);
    while let Some(Ok(prompt)) = prompts.next().await {
        if connection.is_closed() {
            return;
        }
        connection.prompts.lock().push(prompt.text);
        connection.prompt_received.notify_waiters();
        let reply = connection.replies.lock().pop_front();
        match reply {
            Some(Reply::Events(events)) => {
                for event in events {
                    connection.push(event);
                }
            }
            Some(Reply::Exit(events, error)) => {
                for event in events {
                    connection.push(event);
                }
                connection.fail(error);
            }
            None => {}
        }
    }
}

/// One scripted connection; also its own control handle.
pub struct ScriptedConnection {
    options: ConnectOptions,
    sender: Mutex<Option<EventSender>>,
    replies: Mutex<VecDeque<Reply>>,
    prompts: Mutex<Vec<String>>,
    prompt_received: Notify,
    interrupts: AtomicUsize,
    models: Mutex<Vec<String>>,
    stopped_tasks: Mutex<Vec<String>>,
    close_calls: AtomicUsize,
    closed: AtomicBool,
    reject_controls: AtomicBool,
}

impl ScriptedConnection {
    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Deliver an event. Returns `false` once the stream has ended.
    pub fn push(&self, event: AgentEvent) -> bool {
        self.sender
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(event)).is_ok())
    }

    /// Fail the stream with `error` and end it.
    pub fn fail(&self, error: ConnectionError) {
        if let Some(tx) = self.sender.lock().take() {
            let _ = tx.send(Err(error));
        }
    }

    /// End the stream without a terminal event.
    pub fn finish(&self) {
        self.sender.lock().take();
    }

    /// Make every control call fail with [`ConnectionError::Rejected`].
    pub fn reject_controls(&self, reject: bool) {
        self.reject_controls.store(reject, Ordering::SeqCst);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub async fn wait_for_prompts(&self, count: usize) -> Vec<String> {
        loop {
            let notified = self.prompt_received.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let prompts = self.prompts();
            if prompts.len() >= count {
                return prompts;
            }
            notified.await;
        }
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn models(&self) -> Vec<String> {
        self.models.lock().clone()
    }

    pub fn stopped_tasks(&self) -> Vec<String> {
        self.stopped_tasks.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn check_control(&self, request: &str) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        if self.reject_controls.load(Ordering::SeqCst) {
            return Err(ConnectionError::Rejected(format!("{request} refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionControl for ScriptedConnection {
    async fn interrupt(&self) -> Result<(), ConnectionError> {
        self.check_control("interrupt")?;
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_model(&self, model: &str) -> Result<(), ConnectionError> {
        self.check_control("set_model")?;
        self.models.lock().push(model.to_string());
        Ok(())
    }

    async fn stop_task(&self, task_id: &str) -> Result<(), ConnectionError> {
        self.check_control("stop_task")?;
        self.stopped_tasks.lock().push(task_id.to_string());
        Ok(())
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.sender.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
