//! Connection factory backed by the Claude Code CLI in streaming-input mode.
//!
//! One child process per connection. Prompts are written to stdin as
//! stream-json user lines; stdout lines are parsed into [`AgentEvent`]s.
//! Control calls travel as `control_request` lines and wait for the matching
//! `control_response`.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use super::events::AgentEvent;
use super::traits::{
    ConnectOptions, Connection, ConnectionControl, ConnectionError, ConnectionFactory,
    ProcessOutput, PromptQueue,
};
use crate::util::{clip_detail, truncate_with_ellipsis};

const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
const STDERR_DETAIL_MAX_CHARS: usize = 2_000;

type PendingControls = Arc<Mutex<HashMap<String, oneshot::Sender<Result<(), String>>>>>;

/// Most recent stderr lines of a child, bounded in total size.
#[derive(Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    chars: usize,
}

impl StderrTail {
    const MAX_CHARS: usize = STDERR_DETAIL_MAX_CHARS * 2;

    fn push(&mut self, line: &str) {
        let line = truncate_with_ellipsis(line, Self::MAX_CHARS);
        self.chars += line.chars().count() + 1;
        self.lines.push_back(line);
        while self.chars > Self::MAX_CHARS && self.lines.len() > 1 {
            if let Some(dropped) = self.lines.pop_front() {
                self.chars -= dropped.chars().count() + 1;
            }
        }
    }

    fn text(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

enum StdinMessage {
    Line(String),
    /// Close stdin so the CLI finishes its last turn and exits.
    EndInput,
}

pub struct ClaudeCliFactory {
    cli_path: String,
    control_timeout: Duration,
}

impl ClaudeCliFactory {
    pub fn new(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
        }
    }

    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    /// Strip provider routing prefixes (`anthropic/claude-opus-4`) the CLI does not accept.
    fn normalize_model(model: &str) -> Option<String> {
        let raw = model.trim();
        if raw.is_empty() {
            return None;
        }
        let id = raw.rsplit_once('/').map_or(raw, |(_, tail)| tail);
        Some(id.to_string())
    }

    fn command_args(options: &ConnectOptions) -> Vec<String> {
        let mut args: Vec<String> = [
            "-p",
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
            "--include-partial-messages",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        if let Some(model) = options.model.as_deref().and_then(Self::normalize_model) {
            args.push("--model".into());
            args.push(model);
        }
        if let Some(mode) = options.permission_mode.as_deref().filter(|m| !m.is_empty()) {
            args.push("--permission-mode".into());
            args.push(mode.to_string());
        }
        if let Some(system) = options
            .system_prompt
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            args.push("--append-system-prompt".into());
            args.push(system.to_string());
        }
        if let Some(resume) = options.resume.as_deref().filter(|r| !r.is_empty()) {
            args.push("--resume".into());
            args.push(resume.to_string());
        }
        if !options.mcp_servers.is_empty() {
            args.push("--mcp-config".into());
            args.push(json!({ "mcpServers": options.mcp_servers }).to_string());
        }
        args.push("--setting-sources".into());
        args.push(options.setting_sources.join(","));
        if !options.allowed_tools.is_empty() {
            args.push("--allowedTools".into());
            args.push(options.allowed_tools.join(","));
        }
        if !options.disallowed_tools.is_empty() {
            args.push("--disallowedTools".into());
            args.push(options.disallowed_tools.join(","));
        }
        args
    }

    fn user_line(text: &str) -> String {
        json!({
            "type": "user",
            "message": { "role": "user", "content": text },
        })
        .to_string()
    }
}

#[async_trait]
impl ConnectionFactory for ClaudeCliFactory {
    fn name(&self) -> &str {
        "claude-cli"
    }

    async fn open(
        &self,
        prompts: Arc<PromptQueue>,
        options: ConnectOptions,
    ) -> Result<Connection, ConnectionError> {
        let mut cmd = Command::new(&self.cli_path);
        cmd.args(Self::command_args(&options))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if options.working_dir != Path::new("") {
            cmd.current_dir(&options.working_dir);
        }

        let mut child = cmd.spawn().map_err(ConnectionError::Spawn)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("Claude CLI missing stdin pipe"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("Claude CLI missing stdout pipe"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("Claude CLI missing stderr pipe"))?;

        tracing::debug!(
            cli = %self.cli_path,
            cwd = %options.working_dir.display(),
            resume = options.resume.as_deref().unwrap_or(""),
            "Spawned agent CLI"
        );

        let shutdown = CancellationToken::new();
        let pending: PendingControls = Arc::new(Mutex::new(HashMap::new()));
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_stdin(stdin, stdin_rx, shutdown.clone()));
        tokio::spawn(pump_prompts(prompts, stdin_tx.clone(), shutdown.clone()));

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail = StderrTail::default();
            while let Ok(Some(line)) = lines.next_line().await {
                tail.push(&line);
            }
            tail.text()
        });

        tokio::spawn(read_stdout(
            child,
            stdout,
            stderr_task,
            event_tx,
            Arc::clone(&pending),
            shutdown.clone(),
        ));

        let control = Arc::new(CliControl {
            stdin: stdin_tx,
            pending,
            shutdown,
            timeout: self.control_timeout,
        });

        Ok(Connection {
            control,
            events: UnboundedReceiverStream::new(event_rx).boxed(),
        })
    }
}

async fn write_stdin(
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<StdinMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => break,
            message = rx.recv() => message,
        };
        match message {
            Some(StdinMessage::Line(line)) => {
                let write = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                };
                if let Err(e) = write.await {
                    tracing::warn!("Failed writing to agent stdin: {e}");
                    break;
                }
            }
            Some(StdinMessage::EndInput) | None => break,
        }
    }
    let _ = stdin.shutdown().await;
}

async fn pump_prompts(
    prompts: Arc<PromptQueue>,
    stdin: mpsc::UnboundedSender<StdinMessage>,
    shutdown: CancellationToken,
) {
    let prompts = prompts.into_stream();
    tokio::pin!(prompts);
    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => return,
            next = prompts.next() => next,
        };
        match next {
            Some(Ok(prompt)) => {
                let line = ClaudeCliFactory::user_line(&prompt.text);
                if stdin.send(StdinMessage::Line(line)).is_err() {
                    return;
                }
            }
            Some(Err(_)) | None => {
                let _ = stdin.send(StdinMessage::EndInput);
                return;
            }
        }
    }
}

async fn read_stdout(
    mut child: Child,
    stdout: ChildStdout,
    stderr_task: tokio::task::JoinHandle<String>,
    events: mpsc::UnboundedSender<Result<AgentEvent, ConnectionError>>,
    pending: PendingControls,
    shutdown: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => {
                let _ = child.kill().await;
                pending.lock().clear();
                return;
            }
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                let _ = events.send(Err(ConnectionError::Io(e)));
                let _ = child.kill().await;
                pending.lock().clear();
                return;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            tracing::trace!("Skipping non-JSON agent output line");
            continue;
        };
        let Some(event) = AgentEvent::from_json(&value) else {
            continue;
        };
        if let AgentEvent::ControlResponse { request_id, error } = &event {
            if let Some(tx) = pending.lock().remove(request_id) {
                let _ = tx.send(error.clone().map_or(Ok(()), Err));
            }
            continue;
        }
        if events.send(Ok(event)).is_err() {
            // Nobody is listening anymore.
            let _ = child.kill().await;
            pending.lock().clear();
            return;
        }
    }

    pending.lock().clear();
    let status = child.wait().await;
    let stderr_text = stderr_task
        .await
        .unwrap_or_else(|_| "failed to collect stderr".to_string());

    match status {
        Ok(status) if status.success() => {}
        Ok(status) => {
            let stderr = (!stderr_text.trim().is_empty())
                .then(|| ProcessOutput(clip_detail(&stderr_text, STDERR_DETAIL_MAX_CHARS)));
            let error = match status.code() {
                Some(code) => ConnectionError::ProcessExited { code, stderr },
                None => ConnectionError::Killed,
            };
            let _ = events.send(Err(error));
        }
        Err(e) => {
            let _ = events.send(Err(ConnectionError::Io(e)));
        }
    }
}

struct CliControl {
    stdin: mpsc::UnboundedSender<StdinMessage>,
    pending: PendingControls,
    shutdown: CancellationToken,
    timeout: Duration,
}

impl CliControl {
    async fn request(&self, subtype: &str, extra: Value) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());
        let mut request = json!({ "subtype": subtype });
        if let (Some(request), Value::Object(extra)) = (request.as_object_mut(), extra) {
            request.extend(extra);
        }
        let line = json!({
            "type": "control_request",
            "request_id": request_id,
            "request": request,
        })
        .to_string();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);
        if self.stdin.send(StdinMessage::Line(line)).is_err() {
            self.pending.lock().remove(&request_id);
            return Err(ConnectionError::Closed);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(ConnectionError::Control {
                request: subtype.to_string(),
                reason,
            }),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(ConnectionError::ControlTimeout(subtype.to_string()))
            }
        }
    }
}

#[async_trait]
impl ConnectionControl for CliControl {
    async fn interrupt(&self) -> Result<(), ConnectionError> {
        self.request("interrupt", Value::Null).await
    }

    async fn set_model(&self, model: &str) -> Result<(), ConnectionError> {
        let model = ClaudeCliFactory::normalize_model(model)
            .ok_or_else(|| ConnectionError::Rejected("model name is empty".to_string()))?;
        self.request("set_model", json!({ "model": model })).await
    }

    async fn stop_task(&self, task_id: &str) -> Result<(), ConnectionError> {
        self.request("stop_task", json!({ "task_id": task_id })).await
    }

    fn close(&self) {
        self.shutdown.cancel();
    }

    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
