//! trialforge: evaluation harness for coding agents.
//!
//! Each task is a short scripted conversation plus a list of graders. A
//! trial renders a fresh workspace from a template, drives the agent through
//! the conversation, grades what the agent left behind and records the whole
//! exchange. Sweeps run trials serially or in parallel and keep a crash-safe
//! report up to date as trials finish.

pub mod cli;
pub mod error;
pub mod grader;
pub mod report;
pub mod runner;
pub mod task;
pub mod transcript;
pub mod utils;
pub mod workspace;

// Re-export commonly used error types
pub use error::{PortError, ProcessError, ReportError, SchedulerError, TaskError, WorkspaceError};
