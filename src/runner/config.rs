//! Configuration for an evaluation sweep.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::agents::{AgentClient, AgentError, CommandAgent, HttpAgent};
use crate::workspace::ports::{DEFAULT_BASE_PORT, DEFAULT_PORT_PAIRS};
use crate::workspace::WorkspaceConfig;

/// How trials are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// One trial at a time.
    #[default]
    Serial,
    /// Up to `concurrency` trials at once.
    Parallel,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Serial => write!(f, "serial"),
            RunMode::Parallel => write!(f, "parallel"),
        }
    }
}

/// Which agent client to build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentSpec {
    Command { command: String },
    Http {
        url: String,
        #[serde(default)]
        token: Option<String>,
    },
}

impl AgentSpec {
    pub fn build(&self) -> Result<Arc<dyn AgentClient>, AgentError> {
        match self {
            AgentSpec::Command { command } => Ok(Arc::new(CommandAgent::new(command.clone()))),
            AgentSpec::Http { url, token } => {
                let mut agent = HttpAgent::new(url.clone())?;
                if let Some(token) = token {
                    agent = agent.with_bearer_token(token.clone());
                }
                Ok(Arc::new(agent))
            }
        }
    }
}

/// Errors in the sweep configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Sweep settings. Every field has a default, so a YAML file only needs the
/// fields it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub mode: RunMode,
    /// Parallel mode only.
    pub concurrency: usize,
    pub trials_per_task: u32,
    /// Where report.json, report.md and transcripts/ go.
    pub output_dir: PathBuf,
    pub workspace_root: PathBuf,
    /// Leave project directories on disk after each trial.
    pub keep_workspaces: bool,
    pub base_port: u16,
    pub port_pairs: u16,
    /// Skip port pairs something else already listens on.
    pub check_ports: bool,
    pub install_timeout_secs: u64,
    pub setup_timeout_secs: u64,
    pub kill_grace_secs: u64,
    /// Bound on each grader run.
    pub grader_timeout_secs: u64,
    pub agent: Option<AgentSpec>,
    /// Passed to the agent and recorded in the report.
    pub model: Option<String>,
    /// Model for the rubric judge.
    pub judge_model: Option<String>,
    /// Seconds between progress log lines.
    pub progress_interval_secs: u64,
    /// Print a line per state change and per finished trial.
    pub show_progress: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Serial,
            concurrency: 4,
            trials_per_task: 1,
            output_dir: PathBuf::from("./trialforge-results"),
            workspace_root: std::env::temp_dir().join("trialforge-workspaces"),
            keep_workspaces: false,
            base_port: DEFAULT_BASE_PORT,
            port_pairs: DEFAULT_PORT_PAIRS,
            check_ports: true,
            install_timeout_secs: 300,
            setup_timeout_secs: 120,
            kill_grace_secs: 5,
            grader_timeout_secs: 120,
            agent: None,
            model: None,
            judge_model: None,
            progress_interval_secs: 30,
            show_progress: true,
        }
    }
}

impl HarnessConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a YAML file; absent fields keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_trials_per_task(mut self, trials: u32) -> Self {
        self.trials_per_task = trials;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_workspace_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_root = dir.into();
        self
    }

    pub fn with_keep_workspaces(mut self, keep: bool) -> Self {
        self.keep_workspaces = keep;
        self
    }

    pub fn with_ports(mut self, base_port: u16, port_pairs: u16) -> Self {
        self.base_port = base_port;
        self.port_pairs = port_pairs;
        self
    }

    pub fn with_check_ports(mut self, check: bool) -> Self {
        self.check_ports = check;
        self
    }

    pub fn with_grader_timeout(mut self, timeout: Duration) -> Self {
        self.grader_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace_secs = grace.as_secs();
        self
    }

    pub fn with_agent(mut self, agent: AgentSpec) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn grader_timeout(&self) -> Duration {
        Duration::from_secs(self.grader_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs.max(1))
    }

    /// Workspace manager settings derived from this configuration.
    pub fn workspace_config(&self) -> WorkspaceConfig {
        WorkspaceConfig::new(&self.workspace_root)
            .with_install_timeout(Duration::from_secs(self.install_timeout_secs))
            .with_setup_timeout(Duration::from_secs(self.setup_timeout_secs))
            .with_kill_grace(Duration::from_secs(self.kill_grace_secs))
    }

    /// Checks values serde accepts but a sweep cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.trials_per_task == 0 {
            return Err(ConfigError::Invalid("trials_per_task must be at least 1".into()));
        }
        if self.port_pairs == 0 {
            return Err(ConfigError::Invalid("port_pairs must be at least 1".into()));
        }
        if self.grader_timeout_secs == 0 {
            return Err(ConfigError::Invalid("grader_timeout_secs must be at least 1".into()));
        }
        if self.mode == RunMode::Parallel && self.concurrency > self.port_pairs as usize {
            return Err(ConfigError::Invalid(format!(
                "concurrency {} exceeds the {} available port pairs",
                self.concurrency, self.port_pairs
            )));
        }
        Ok(())
    }
}
