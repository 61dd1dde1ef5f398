//! Error types for trialforge operations.
//!
//! Defines error types for the subsystems shared across the crate:
//! - Task loading and validation
//! - Port allocation
//! - Workspace lifecycle and supervised processes
//! - Report persistence
//! - Batch scheduling
//!
//! Agent, grader and trial errors live next to the code that raises them.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while loading or validating task definitions.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Failed to read task file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse task file '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Task '{0}' declares no graders")]
    NoGraders(String),

    #[error("Task '{0}' declares no conversation turns")]
    NoTurns(String),

    #[error("Duplicate task id '{0}'")]
    DuplicateId(String),

    #[error("Invalid task id '{0}': must be non-empty and contain only alphanumeric characters, '.', '-' and '_'")]
    InvalidId(String),

    #[error("Task '{task}' has an invalid timeout: {reason}")]
    InvalidTimeout { task: String, reason: String },

    #[error("Task '{task}' has an invalid grader at position {index}: {reason}")]
    InvalidGrader {
        task: String,
        index: usize,
        reason: String,
    },

    #[error("Tasks path does not exist: {0}")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the port allocator.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("Port range exhausted: all {pairs} pairs starting at {base} are in use; raise --port-pairs or lower concurrency")]
    Exhausted { base: u16, pairs: u16 },

    #[error("Invalid port range: base {base} with {pairs} pairs overflows the u16 port space")]
    InvalidRange { base: u16, pairs: u16 },
}

/// Errors raised while starting or stopping supervised processes.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process '{name}' exited before becoming ready (code {code:?}): {output}")]
    ExitedEarly {
        name: String,
        code: Option<i32>,
        output: String,
    },

    #[error("Process '{name}' did not become ready within {timeout:?}")]
    ReadyTimeout { name: String, timeout: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from workspace creation and disposal.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Port allocation failed: {0}")]
    Ports(#[from] PortError),

    #[error("Failed to create workspace directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove workspace directory '{path}': {source}")]
    RemoveDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Template rendering failed for '{file}': {reason}")]
    Template { file: String, reason: String },

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkspaceError {
    /// True for misconfiguration that every later workspace would hit too,
    /// such as an exhausted port range.
    pub fn is_config_error(&self) -> bool {
        matches!(self, WorkspaceError::Ports(PortError::Exhausted { .. }))
    }
}

/// Errors raised when persisting the incremental report.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that make an entire batch meaningless.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("No tasks to run")]
    NoTasks,

    #[error("Concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("Concurrency limiter was closed")]
    LimiterClosed,

    #[error("Configuration error: {0}")]
    Config(#[from] crate::runner::config::ConfigError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("Invalid task: {0}")]
    Task(#[from] TaskError),
}
