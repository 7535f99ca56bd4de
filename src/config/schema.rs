use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Extra-context (MCP) server definitions, forwarded verbatim to the agent.
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, serde_json::Value>,
}

// ── Agent process ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent CLI executable, looked up on `PATH` when not absolute.
    #[serde(default = "default_cli_path")]
    pub cli_path: String,
    pub default_model: Option<String>,
    #[serde(default = "default_permission_mode")]
    pub permission_mode: String,
    /// Settings scopes the agent may load (`user`, `project`, `local`).
    #[serde(default = "default_setting_sources")]
    pub setting_sources: Vec<String>,
    /// Working directory for runs that do not name one.
    pub working_dir: Option<PathBuf>,
}

fn default_cli_path() -> String {
    "claude".into()
}

fn default_permission_mode() -> String {
    "default".into()
}

fn default_setting_sources() -> Vec<String> {
    vec!["user".into(), "project".into(), "local".into()]
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cli_path: default_cli_path(),
            default_model: None,
            permission_mode: default_permission_mode(),
            setting_sources: default_setting_sources(),
            working_dir: None,
        }
    }
}

// ── Engine / recovery ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Queue runs onto one live connection per channel instead of a fresh
    /// process per run.
    #[serde(default = "default_true")]
    pub persistent_sessions: bool,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    /// Runs streaming longer than this without a terminal event are aborted.
    #[serde(default = "default_max_run_age_secs")]
    pub max_run_age_secs: u64,
    /// Substring of a process error that makes the retry ladder move on.
    #[serde(default = "default_retryable_error_pattern")]
    pub retryable_error_pattern: String,
    #[serde(default = "default_error_detail_max_chars")]
    pub error_detail_max_chars: usize,
    #[serde(default = "default_error_detail_max_depth")]
    pub error_detail_max_depth: usize,
    #[serde(default = "default_control_timeout_secs")]
    pub control_timeout_secs: u64,
    /// Tools disallowed on the last ladder rung.
    #[serde(default = "default_safe_mode_disabled_tools")]
    pub safe_mode_disabled_tools: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_reaper_interval_secs() -> u64 {
    30
}

fn default_max_run_age_secs() -> u64 {
    1800
}

fn default_retryable_error_pattern() -> String {
    "process exited with code 1".into()
}

fn default_error_detail_max_chars() -> usize {
    300
}

fn default_error_detail_max_depth() -> usize {
    5
}

fn default_control_timeout_secs() -> u64 {
    10
}

fn default_safe_mode_disabled_tools() -> Vec<String> {
    ["Bash", "Write", "Edit", "WebFetch"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            persistent_sessions: true,
            reaper_interval_secs: default_reaper_interval_secs(),
            max_run_age_secs: default_max_run_age_secs(),
            retryable_error_pattern: default_retryable_error_pattern(),
            error_detail_max_chars: default_error_detail_max_chars(),
            error_detail_max_depth: default_error_detail_max_depth(),
            control_timeout_secs: default_control_timeout_secs(),
            safe_mode_disabled_tools: default_safe_mode_disabled_tools(),
        }
    }
}

impl EngineConfig {
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    pub fn max_run_age(&self) -> Duration {
        Duration::from_secs(self.max_run_age_secs)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs.max(1))
    }
}

// ── Config impl ──────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());

        Self {
            config_path: home.join(".agentlane").join("config.toml"),
            agent: AgentConfig::default(),
            engine: EngineConfig::default(),
            mcp_servers: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        let mut config = Self::load_or_init_in(&home.join(".agentlane"))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load `config.toml` from `dir`, writing defaults there first if absent.
    pub fn load_or_init_in(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.toml");

        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path;
            Ok(config)
        } else {
            let config = Config {
                config_path,
                ..Config::default()
            };
            config.save()?;
            Ok(config)
        }
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(path) = var("AGENTLANE_CLI_PATH") {
            self.agent.cli_path = path;
        }
        if let Some(model) = var("AGENTLANE_MODEL") {
            self.agent.default_model = Some(model);
        }
        if let Some(mode) = var("AGENTLANE_PERMISSION_MODE") {
            self.agent.permission_mode = mode;
        }
        if let Some(workspace) = var("AGENTLANE_WORKSPACE") {
            self.agent.working_dir = Some(PathBuf::from(workspace));
        }
        if let Some(age) = var("AGENTLANE_MAX_RUN_AGE_SECS") {
            match age.trim().parse::<u64>() {
                Ok(secs) => self.engine.max_run_age_secs = secs,
                Err(_) => tracing::warn!(value = %age, "Ignoring invalid AGENTLANE_MAX_RUN_AGE_SECS"),
            }
        }
    }

    /// Directory runs execute in when the request does not name one.
    pub fn default_working_dir(&self) -> PathBuf {
        self.agent
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path) {
            let _ = fs::remove_file(&temp_path);
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir)
    }
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> Result<()> {
    let dir = File::open(path)
        .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
    dir.sync_all()
        .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> Result<()> {
    Ok(())
}
