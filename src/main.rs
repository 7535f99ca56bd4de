#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use agentlane::connection::{ClaudeCliFactory, ConnectionFactory};
use agentlane::engine::spawn_reaper;
use agentlane::{
    ActiveRunRegistry, AgentRunner, Config, EngineError, RunMode, RunObserver, RunRequest,
    RunResult,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt};

/// Drive a Claude Code agent per chat channel.
#[derive(Parser, Debug)]
#[command(name = "agentlane")]
#[command(version)]
#[command(about = "Queue, steer and cancel agent runs per channel.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a single prompt and stream the answer to stdout
    Run {
        /// Channel the run belongs to
        #[arg(long, default_value = "cli")]
        channel: String,

        /// Working directory for the agent (default: config or current dir)
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Model to use
        #[arg(long)]
        model: Option<String>,

        /// Resume an earlier agent session
        #[arg(long)]
        resume: Option<String>,

        /// Use a fresh process with the retry ladder instead of a session
        #[arg(long)]
        one_shot: bool,

        /// Prompt text
        prompt: String,
    },

    /// Interactive session: each line is a run; /steer, /interrupt, /abort, /model, /quit
    Chat {
        /// Channel the runs belong to
        #[arg(long, default_value = "cli")]
        channel: String,

        /// Working directory for the agent (default: config or current dir)
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Model to use
        #[arg(long)]
        model: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Default)]
struct StdoutObserver {
    streamed: AtomicBool,
}

impl RunObserver for StdoutObserver {
    fn on_text_delta(&self, text: &str) {
        self.streamed.store(true, Ordering::Relaxed);
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}

fn report(result: &RunResult, observer: &StdoutObserver) {
    if observer.streamed.load(Ordering::Relaxed) {
        println!();
    } else {
        println!("{}", result.text);
    }
    let mut parts = vec![format!("outcome: {:?}", result.outcome)];
    if let Some(cost) = result.cost_usd {
        parts.push(format!("cost: ${cost:.4}"));
    }
    if let Some(turns) = result.turn_count {
        parts.push(format!("turns: {turns}"));
    }
    if let Some(ms) = result.duration_ms {
        parts.push(format!("duration: {ms}ms"));
    }
    if let Some(session) = &result.session_id {
        parts.push(format!("session: {session}"));
    }
    if let Some(rung) = &result.rung {
        parts.push(format!("rung: {rung}"));
    }
    eprintln!("[{}]", parts.join(", "));
}

fn build_runner(config: Config) -> Arc<AgentRunner> {
    let factory: Arc<dyn ConnectionFactory> = Arc::new(
        ClaudeCliFactory::new(config.agent.cli_path.clone())
            .with_control_timeout(config.engine.control_timeout()),
    );
    let registry = Arc::new(ActiveRunRegistry::new());
    Arc::new(AgentRunner::new(factory, registry, config))
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let cli = Cli::parse();
    let config = Config::load_or_init()?;

    match cli.command {
        Commands::Config => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to serialize config")?;
            println!("# {}", config.config_path.display());
            print!("{rendered}");
            Ok(())
        }
        Commands::Run {
            channel,
            cwd,
            model,
            resume,
            one_shot,
            prompt,
        } => {
            let cwd = cwd.unwrap_or_else(|| config.default_working_dir());
            let engine = config.engine.clone();
            let runner = build_runner(config);
            let reaper = spawn_reaper(
                Arc::clone(runner.registry()),
                engine.reaper_interval(),
                engine.max_run_age(),
            );

            let observer = Arc::new(StdoutObserver::default());
            let mut request = RunRequest::new(&channel, prompt, cwd)
                .with_observer(Arc::clone(&observer) as Arc<dyn RunObserver>)
                .with_mode(if one_shot {
                    RunMode::OneShot
                } else {
                    RunMode::Session
                });
            if let Some(model) = model {
                request = request.with_model(model);
            }
            if let Some(resume) = resume {
                request = request.with_session_id(resume);
            }

            let outcome = tokio::select! {
                outcome = runner.run(request) => outcome,
                _ = tokio::signal::ctrl_c() => {
                    runner.abort(&channel);
                    Err(EngineError::Cancelled)
                }
            };
            runner.shutdown();
            reaper.abort();

            let result = outcome?;
            report(&result, &observer);
            Ok(())
        }
        Commands::Chat {
            channel,
            cwd,
            model,
        } => {
            let cwd = cwd.unwrap_or_else(|| config.default_working_dir());
            let engine = config.engine.clone();
            let runner = build_runner(config);
            let reaper = spawn_reaper(
                Arc::clone(runner.registry()),
                engine.reaper_interval(),
                engine.max_run_age(),
            );
            chat(&runner, &channel, cwd, model).await?;
            runner.shutdown();
            reaper.abort();
            Ok(())
        }
    }
}

async fn chat(
    runner: &Arc<AgentRunner>,
    channel: &str,
    cwd: PathBuf,
    model: Option<String>,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprintln!("agentlane chat on channel '{channel}' (/quit to exit)");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                let aborted = runner.abort_all();
                tracing::info!(count = aborted.len(), "Ctrl-C: aborted runs");
                return Ok(());
            }
        };
        let Some(line) = line else {
            return Ok(());
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "/quit" | "/exit" => return Ok(()),
            "/steer" => {
                if !runner.steer(channel, rest.trim()) {
                    eprintln!("[nothing streaming to steer]");
                }
            }
            "/interrupt" => {
                if !runner.interrupt(channel).await {
                    eprintln!("[no run interrupted]");
                }
            }
            "/abort" => {
                if !runner.abort(channel) {
                    eprintln!("[no active run]");
                }
            }
            "/model" => {
                let name = rest.trim();
                if name.is_empty() {
                    eprintln!("usage: /model NAME");
                } else if runner.set_model(channel, name).await {
                    eprintln!("[model switched to {name}]");
                } else {
                    eprintln!("[model switch failed]");
                }
            }
            _ => {
                let observer = Arc::new(StdoutObserver::default());
                let mut request = RunRequest::new(channel, line, cwd.clone())
                    .with_observer(Arc::clone(&observer) as Arc<dyn RunObserver>)
                    .with_mode(RunMode::Session);
                if let Some(model) = &model {
                    request = request.with_model(model.clone());
                }
                match runner.submit(request).await {
                    Ok(reply) => {
                        tokio::spawn(async move {
                            match reply.await {
                                Ok(result) => report(&result, &observer),
                                Err(e) => eprintln!("\n[error: {e}]"),
                            }
                        });
                    }
                    Err(e) => eprintln!("[error: {e}]"),
                }
            }
        }
    }
}
