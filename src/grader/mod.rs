//! Grader dispatch.
//!
//! A task lists grader configurations; each is a [`GraderConfig`] variant
//! selected by its `type` tag. The [`GraderRegistry`] routes a configuration
//! to the strategy registered for its [`GraderKind`] and turns every outcome,
//! including errors, panics and timeouts, into a normalized [`GraderResult`].
//!
//! # Strategies
//!
//! | tag | strategy |
//! |---|---|
//! | `dependency` | declared packages present in the manifest |
//! | `server` (`service`) | HTTP endpoint answers as expected |
//! | `ingestion` | posted events are accepted and persisted |
//! | `file_storage` | a file exists with the expected content |
//! | `context` | assistant replies mention (or avoid) patterns |
//! | `anomaly` | events produce a behavior-detection document |
//! | `error_injection` | malformed requests are rejected without crashing |
//! | `static_check` | source files match (or avoid) patterns |
//! | `rubric` | an LLM judge scores the work against a rubric |
//! | `runtime` (`browser`) | the dev server loads without errors |
//! | `behavior_signal` / `alert_signal` | the agent acted on a detection document |

pub mod anomaly;
pub mod context;
pub mod dependency;
pub mod error_injection;
pub mod file_storage;
pub mod http;
pub mod ingestion;
pub mod registry;
pub mod rubric;
pub mod runtime;
pub mod server;
pub mod signal;
pub mod static_check;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ProcessError;
use crate::transcript::{EntryKind, TranscriptEntry};
use crate::workspace::Workspace;

pub use anomaly::AnomalyConfig;
pub use context::ContextConfig;
pub use dependency::DependencyConfig;
pub use error_injection::{ErrorInjectionConfig, InjectionCase};
pub use file_storage::FileStorageConfig;
pub use http::{PortTarget, ServiceTarget};
pub use ingestion::IngestionConfig;
pub use registry::GraderRegistry;
pub use rubric::{ChatJudge, RubricConfig, RubricJudge};
pub use runtime::RuntimeConfig;
pub use server::ServerConfig;
pub use signal::SignalConfig;
pub use static_check::{StaticCheckConfig, StaticRule};

/// One grader entry of a task, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraderConfig {
    Dependency(DependencyConfig),
    #[serde(alias = "service")]
    Server(ServerConfig),
    Ingestion(IngestionConfig),
    FileStorage(FileStorageConfig),
    Context(ContextConfig),
    Anomaly(AnomalyConfig),
    ErrorInjection(ErrorInjectionConfig),
    StaticCheck(StaticCheckConfig),
    Rubric(RubricConfig),
    #[serde(alias = "browser")]
    Runtime(RuntimeConfig),
    BehaviorSignal(SignalConfig),
    AlertSignal(SignalConfig),
}

impl GraderConfig {
    pub fn kind(&self) -> GraderKind {
        match self {
            GraderConfig::Dependency(_) => GraderKind::Dependency,
            GraderConfig::Server(_) => GraderKind::Server,
            GraderConfig::Ingestion(_) => GraderKind::Ingestion,
            GraderConfig::FileStorage(_) => GraderKind::FileStorage,
            GraderConfig::Context(_) => GraderKind::Context,
            GraderConfig::Anomaly(_) => GraderKind::Anomaly,
            GraderConfig::ErrorInjection(_) => GraderKind::ErrorInjection,
            GraderConfig::StaticCheck(_) => GraderKind::StaticCheck,
            GraderConfig::Rubric(_) => GraderKind::Rubric,
            GraderConfig::Runtime(_) => GraderKind::Runtime,
            GraderConfig::BehaviorSignal(_) => GraderKind::BehaviorSignal,
            GraderConfig::AlertSignal(_) => GraderKind::AlertSignal,
        }
    }

    /// Checks fields serde cannot: empty lists, bad regexes, out-of-range numbers.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            GraderConfig::Dependency(c) => c.validate(),
            GraderConfig::Server(c) => c.validate(),
            GraderConfig::Ingestion(c) => c.validate(),
            GraderConfig::FileStorage(c) => c.validate(),
            GraderConfig::Context(c) => c.validate(),
            GraderConfig::Anomaly(_) => Ok(()),
            GraderConfig::ErrorInjection(c) => c.validate(),
            GraderConfig::StaticCheck(c) => c.validate(),
            GraderConfig::Rubric(c) => c.validate(),
            GraderConfig::Runtime(c) => c.validate(),
            GraderConfig::BehaviorSignal(c) | GraderConfig::AlertSignal(c) => c.validate(),
        }
    }
}

/// Strategy selector, one per `type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraderKind {
    Dependency,
    Server,
    Ingestion,
    FileStorage,
    Context,
    Anomaly,
    ErrorInjection,
    StaticCheck,
    Rubric,
    Runtime,
    BehaviorSignal,
    AlertSignal,
}

impl GraderKind {
    pub const ALL: [GraderKind; 12] = [
        GraderKind::Dependency,
        GraderKind::Server,
        GraderKind::Ingestion,
        GraderKind::FileStorage,
        GraderKind::Context,
        GraderKind::Anomaly,
        GraderKind::ErrorInjection,
        GraderKind::StaticCheck,
        GraderKind::Rubric,
        GraderKind::Runtime,
        GraderKind::BehaviorSignal,
        GraderKind::AlertSignal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GraderKind::Dependency => "dependency",
            GraderKind::Server => "server",
            GraderKind::Ingestion => "ingestion",
            GraderKind::FileStorage => "file_storage",
            GraderKind::Context => "context",
            GraderKind::Anomaly => "anomaly",
            GraderKind::ErrorInjection => "error_injection",
            GraderKind::StaticCheck => "static_check",
            GraderKind::Rubric => "rubric",
            GraderKind::Runtime => "runtime",
            GraderKind::BehaviorSignal => "behavior_signal",
            GraderKind::AlertSignal => "alert_signal",
        }
    }
}

impl std::fmt::Display for GraderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Verdict of one grader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraderResult {
    #[serde(rename = "type")]
    pub grader_type: String,
    pub passed: bool,
    /// In `[0, 1]` once normalized.
    pub score: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GraderResult {
    /// Passed with score 1.
    pub fn pass(kind: GraderKind) -> Self {
        Self::scored(kind, 1.0, true)
    }

    /// Failed with score 0 and an error message.
    pub fn fail(kind: GraderKind, error: impl Into<String>) -> Self {
        Self::scored(kind, 0.0, false).with_error(error)
    }

    /// Explicit score and verdict.
    pub fn scored(kind: GraderKind, score: f64, passed: bool) -> Self {
        Self {
            grader_type: kind.to_string(),
            passed,
            score,
            details: BTreeMap::new(),
            error: None,
        }
    }

    /// Score from a satisfied/total ratio; passes only when all are satisfied.
    pub fn ratio(kind: GraderKind, satisfied: usize, total: usize) -> Self {
        let score = if total == 0 {
            0.0
        } else {
            satisfied as f64 / total as f64
        };
        Self::scored(kind, score, total > 0 && satisfied == total)
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.details.insert(key.into(), value);
        self
    }

    /// Clamps the score into `[0, 1]`; NaN becomes 0.
    pub fn normalize(mut self) -> Self {
        self.score = if self.score.is_nan() {
            0.0
        } else {
            self.score.clamp(0.0, 1.0)
        };
        self
    }
}

/// Everything a strategy may look at.
pub struct GradingContext<'a> {
    pub workspace: &'a Workspace,
    /// Transcript as of the start of this grader.
    pub transcript: &'a [TranscriptEntry],
    pub http: &'a reqwest::Client,
    /// Upper bound for the whole grader run.
    pub timeout: Duration,
}

impl<'a> GradingContext<'a> {
    pub fn new(
        workspace: &'a Workspace,
        transcript: &'a [TranscriptEntry],
        http: &'a reqwest::Client,
        timeout: Duration,
    ) -> Self {
        Self {
            workspace,
            transcript,
            http,
            timeout,
        }
    }

    /// Assistant message contents in order.
    pub fn assistant_messages(&self) -> Vec<&'a str> {
        self.messages(EntryKind::AssistantMessage)
    }

    /// User message contents in order.
    pub fn user_messages(&self) -> Vec<&'a str> {
        self.messages(EntryKind::UserMessage)
    }

    fn messages(&self, kind: EntryKind) -> Vec<&'a str> {
        self.transcript
            .iter()
            .filter(|e| e.kind == kind)
            .filter_map(|e| e.content())
            .collect()
    }

    /// Tool call and tool result entries.
    pub fn tool_entries(&self) -> impl Iterator<Item = &'a TranscriptEntry> {
        self.transcript
            .iter()
            .filter(|e| matches!(e.kind, EntryKind::ToolCall | EntryKind::ToolResult))
    }
}

/// A grading strategy.
#[async_trait]
pub trait Grader: Send + Sync {
    /// The tag this strategy handles.
    fn kind(&self) -> GraderKind;

    /// Grades the workspace. `config` is always of this strategy's kind when
    /// called through the registry.
    async fn grade(
        &self,
        config: &GraderConfig,
        ctx: &GradingContext<'_>,
    ) -> Result<GraderResult, GraderError>;
}

/// Faults a strategy can report instead of a verdict.
#[derive(Debug, Error)]
pub enum GraderError {
    #[error("Grader '{expected}' received a '{actual}' configuration")]
    ConfigMismatch {
        expected: GraderKind,
        actual: GraderKind,
    },

    #[error("Invalid grader configuration: {0}")]
    InvalidConfig(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Judge error: {0}")]
    Judge(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Compiles a list of case-insensitive patterns.
pub(crate) fn compile_patterns(patterns: &[String]) -> Result<Vec<regex::Regex>, String> {
    patterns
        .iter()
        .map(|p| {
            regex::RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|e| format!("invalid pattern '{}': {}", p, e))
        })
        .collect()
}

fn mismatch(expected: GraderKind, config: &GraderConfig) -> GraderError {
    GraderError::ConfigMismatch {
        expected,
        actual: config.kind(),
    }
}
